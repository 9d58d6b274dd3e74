//! Execution Engine (C9): the token-stepping core that ties the graph
//! repository, token store, job manager, message bus, timing wheel, and
//! incident manager together.

mod dispatch;
mod executor;

pub use executor::Engine;
