//! Message Bus (C6): correlation, publish/buffer/match, expiry sweep.

pub mod bus;

pub use bus::{MessageBus, PublishOutcome, PublishRequest, SubscribeOutcome};
