//! BPMN 2.0 token-based workflow execution core.
//!
//! Crate layout mirrors the component map: [`kv`] (C1), [`graph`] (C2),
//! [`store`] (C3), [`expression`] (C4), [`timing`] (C5), [`messaging`] (C6),
//! [`job`] (C7), [`incident`] (C8), [`engine`] (C9), [`auth`] (C10).
//! [`config`] and [`model`] are ambient/shared concerns the rest depend on.

pub mod auth;
pub mod config;
pub mod engine;
pub mod error;
pub mod expression;
pub mod graph;
pub mod incident;
pub mod job;
pub mod kv;
pub mod messaging;
pub mod model;
pub mod store;
pub mod timing;

pub use config::{Config, ConfigError, StorageBackend};
pub use engine::Engine;
pub use error::{AuthError, EngineError, ErrorCode, JobError, StoreError, TimerError};

use std::sync::Arc;

use kv::{KvStore, MemoryKv};
use store::{MemoryStore, TokenStore};

/// Every long-lived component the service needs, wired together and ready
/// to serve traffic. Building this is the only two-phase construction left
/// to the caller: `Engine` and `TimingWheel` reference each other (the
/// wheel calls back into the engine on fire; the engine schedules through
/// the wheel), so `bootstrap` resolves that cycle via [`Engine::attach_wheel`]
/// before handing back a fully-wired runtime.
pub struct Runtime {
    pub store: Arc<dyn TokenStore>,
    pub graph: Arc<graph::ProcessGraphRepository>,
    pub jobs: Arc<job::JobManager>,
    pub messages: Arc<messaging::MessageBus>,
    pub incidents: Arc<incident::IncidentManager>,
    pub engine: Arc<Engine>,
    pub wheel: Arc<timing::TimingWheel>,
}

/// Assemble a [`Runtime`] from `config`. Does not spawn any background
/// tasks (tick loop, sweep loops) — the caller decides its own process
/// model for those (see `bpmn-api`'s `main.rs`).
pub async fn bootstrap(config: &Config) -> Result<Runtime, StoreError> {
    let (store, definitions_kv): (Arc<dyn TokenStore>, Arc<dyn KvStore>) = match &config.storage {
        StorageBackend::Memory => (Arc::new(MemoryStore::new()), Arc::new(MemoryKv::new())),
        #[cfg(feature = "sled-store")]
        StorageBackend::Sled { data_dir } => {
            let mut tokens_path = std::path::PathBuf::from(data_dir);
            tokens_path.push("tokens");
            let mut defs_path = std::path::PathBuf::from(data_dir);
            defs_path.push("definitions");
            (
                Arc::new(store::SledBackedStore::open(tokens_path)?),
                Arc::new(kv::SledKv::open(defs_path)?),
            )
        }
    };

    let graph = Arc::new(graph::ProcessGraphRepository::new(definitions_kv));
    let jobs = Arc::new(job::JobManager::new(store.clone()));
    let messages = Arc::new(messaging::MessageBus::new(store.clone()));
    let incidents = Arc::new(incident::IncidentManager::new(store.clone()));

    let engine = Engine::new(store.clone(), graph.clone(), jobs.clone(), messages.clone(), incidents.clone(), config.dispatch_capacity);

    let wheel = Arc::new(timing::TimingWheel::with_sweeper(
        store.clone(),
        engine.clone() as Arc<dyn timing::TimerSink>,
        Some(engine.clone() as Arc<dyn timing::MessageSweeper>),
        30,
    ));
    engine.attach_wheel(wheel.clone());
    wheel.recover().await.map_err(|e| StoreError::Backend(e.to_string()))?;

    Ok(Runtime { store, graph, jobs, messages, incidents, engine, wheel })
}
