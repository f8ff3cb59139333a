use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use lcs_disk::{DiskConfig, DiskStore};
use lcs_protocol::ProtocolConfig;
use lcs_store::{CellStore, MemoryStore};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{SyncError, SyncResult};

/// Where a node keeps its cells.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Data file for a durable store. Without one the node keeps cells in
    /// memory only.
    pub path: Option<PathBuf>,
    /// Durable store settings; `cache` also sizes the in-memory store.
    #[serde(flatten)]
    pub disk: DiskConfig,
}

/// Acquisition settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Default deadline for fetching a cell graph from a peer.
    pub acquire_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: 30_000,
        }
    }
}

/// Complete node configuration, usually read from a TOML file.
///
/// ```toml
/// [store]
/// path = "data/cells.lcs"
/// sync_mode = "every_write"
///
/// [store.cache]
/// capacity = 65536
///
/// [protocol]
/// max_data_request_hashes = 32
///
/// [sync]
/// acquire_timeout_ms = 30000
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub store: StoreConfig,
    pub protocol: ProtocolConfig,
    pub sync: SyncConfig,
}

impl NodeConfig {
    pub fn from_toml_str(text: &str) -> SyncResult<Self> {
        toml::from_str(text).map_err(|e| SyncError::Config(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> SyncResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> SyncResult<String> {
        toml::to_string(self).map_err(|e| SyncError::Config(e.to_string()))
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.sync.acquire_timeout_ms)
    }

    /// Open the store this configuration describes.
    pub fn open_store(&self) -> SyncResult<Arc<dyn CellStore>> {
        match &self.store.path {
            Some(path) => {
                let store = DiskStore::open(path, self.store.disk.clone())?;
                Ok(Arc::new(store))
            }
            None => {
                info!("using in-memory cell store");
                Ok(Arc::new(MemoryStore::with_cache_config(&self.store.disk.cache)))
            }
        }
    }
}
