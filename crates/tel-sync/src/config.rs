//! Engine configuration

use serde::{Deserialize, Serialize};
use tel_protocol::LineId;

/// Routing configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Numbers treated as potential emergency numbers
    pub emergency_numbers: Vec<String>,
    /// The user's default voice subscription
    pub default_voice_line: Option<LineId>,
    /// Line the platform reports as primary
    pub primary_line: Option<LineId>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            emergency_numbers: vec!["911".to_string(), "112".to_string()],
            default_voice_line: None,
            primary_line: None,
        }
    }
}

/// Synchronization engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Routing configuration
    pub router: RouterConfig,
    /// Add-participant requests a conference may hold back at once
    pub max_pending_participants: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            router: RouterConfig::default(),
            max_pending_participants: 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_emergency_numbers() {
        let config = SyncConfig::default();
        assert_eq!(config.router.emergency_numbers, vec!["911", "112"]);
        assert_eq!(config.router.default_voice_line, None);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: SyncConfig =
            serde_json::from_str(r#"{"router": {"default_voice_line": 1}}"#).unwrap();
        assert_eq!(config.router.default_voice_line, Some(LineId(1)));
        assert_eq!(config.router.emergency_numbers.len(), 2);
        assert_eq!(config.max_pending_participants, 16);
    }
}
