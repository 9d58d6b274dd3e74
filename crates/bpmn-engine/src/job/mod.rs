//! Job Manager (C7): lifecycle, activation, completion, failure, retries.

pub mod backoff;
pub mod backpressure;
pub mod manager;

pub use backoff::RetryPolicy;
pub use backpressure::BackpressureGate;
pub use manager::{CompleteOutcome, FailOutcome, JobActivation, JobManager, ThrowErrorOutcome};
