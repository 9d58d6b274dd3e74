//! Process Graph Repository (C2): stores parsed process definitions addressed
//! by `(process_key, version)`. Definitions are immutable once deployed.

use std::sync::Arc;

use crate::error::StoreError;
use crate::kv::{KvOp, KvStore};
use crate::model::ProcessDefinition;

fn def_key(process_key: &str, version: u32) -> Vec<u8> {
    format!("def/{process_key}/{version:010}").into_bytes()
}

fn latest_key(process_key: &str) -> Vec<u8> {
    format!("def_latest/{process_key}").into_bytes()
}

/// Typed repository over a [`KvStore`] for deployed process definitions.
pub struct ProcessGraphRepository {
    kv: Arc<dyn KvStore>,
}

impl ProcessGraphRepository {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Deploy a new version of a process definition. Versions are never
    /// overwritten; deploying the same `(process_key, version)` twice is
    /// rejected by the caller before this layer is reached.
    pub fn deploy(&self, def: &ProcessDefinition) -> Result<(), StoreError> {
        let payload = serde_json::to_vec(def).map_err(|e| StoreError::Serialization(e.to_string()))?;
        self.kv.commit(vec![
            KvOp::Put(def_key(&def.process_key, def.version), payload),
            KvOp::Put(latest_key(&def.process_key), def.version.to_be_bytes().to_vec()),
        ])
    }

    pub fn get(&self, process_key: &str, version: u32) -> Result<Option<ProcessDefinition>, StoreError> {
        match self.kv.get(&def_key(process_key, version))? {
            Some(bytes) => {
                let def = serde_json::from_slice(&bytes).map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(Some(def))
            }
            None => Ok(None),
        }
    }

    /// Resolve the latest deployed version of a process key.
    pub fn latest_version(&self, process_key: &str) -> Result<Option<u32>, StoreError> {
        match self.kv.get(&latest_key(process_key))? {
            Some(bytes) if bytes.len() == 4 => {
                let mut buf = [0u8; 4];
                buf.copy_from_slice(&bytes);
                Ok(Some(u32::from_be_bytes(buf)))
            }
            Some(_) => Err(StoreError::Serialization("corrupt latest-version marker".into())),
            None => Ok(None),
        }
    }

    /// Fetch the definition for `version`, or the latest deployed version if `version` is `None`.
    pub fn resolve(&self, process_key: &str, version: Option<u32>) -> Result<Option<ProcessDefinition>, StoreError> {
        let version = match version {
            Some(v) => v,
            None => match self.latest_version(process_key)? {
                Some(v) => v,
                None => return Ok(None),
            },
        };
        self.get(process_key, version)
    }

    pub fn list_versions(&self, process_key: &str) -> Result<Vec<u32>, StoreError> {
        let prefix = format!("def/{process_key}/").into_bytes();
        let rows = self.kv.scan_prefix(&prefix)?;
        rows.into_iter()
            .map(|(_, v)| {
                serde_json::from_slice::<ProcessDefinition>(&v)
                    .map(|d| d.version)
                    .map_err(|e| StoreError::Serialization(e.to_string()))
            })
            .collect()
    }
}
