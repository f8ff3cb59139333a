use serde::{Deserialize, Serialize};

/// Largest frame accepted or produced by default (64 MiB).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Default cap on hashes in one DATA_REQUEST.
pub const DEFAULT_MAX_DATA_REQUEST_HASHES: usize = 32;

/// Limits applied to inbound and outbound messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// A DATA_REQUEST naming more hashes than this is rejected outright.
    pub max_data_request_hashes: usize,
    /// Frame size limit in bytes.
    pub max_message_size: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_data_request_hashes: DEFAULT_MAX_DATA_REQUEST_HASHES,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ProtocolConfig::default();
        assert_eq!(config.max_data_request_hashes, 32);
        assert_eq!(config.max_message_size, 64 * 1024 * 1024);
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config: ProtocolConfig = toml::from_str("max_data_request_hashes = 8").unwrap();
        assert_eq!(config.max_data_request_hashes, 8);
        assert_eq!(config.max_message_size, MAX_MESSAGE_SIZE);
    }
}
