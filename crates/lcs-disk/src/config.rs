use lcs_store::CacheConfig;
use serde::{Deserialize, Serialize};

/// Flush/sync strategy for cell records.
///
/// Root updates are always synced, after the records they may point at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// `fsync` after every record write (safest, highest latency).
    EveryWrite,
    /// Rely on OS page-cache buffering until the next flush or root update.
    OsDefault,
}

impl Default for SyncMode {
    fn default() -> Self {
        Self::OsDefault
    }
}

/// Configuration for a [`DiskStore`](crate::DiskStore).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskConfig {
    /// Sync strategy for cell records.
    pub sync_mode: SyncMode,
    /// Decode cache sizing.
    pub cache: CacheConfig,
}
