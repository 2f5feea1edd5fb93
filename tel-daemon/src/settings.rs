//! Daemon settings

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tel_protocol::LineId;
use tel_sim::VirtualLineConfig;
use tel_sync::SyncConfig;
use tracing::{info, warn};

/// Daemon settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    /// Engine configuration
    #[serde(default)]
    pub engine: SyncConfig,
    /// Simulated lines to attach on startup
    #[serde(default = "default_lines")]
    pub lines: Vec<VirtualLineConfig>,
    /// Run the scripted call scenario after startup
    #[serde(default = "default_true")]
    pub run_scenario: bool,
}

fn default_true() -> bool {
    true
}

fn default_lines() -> Vec<VirtualLineConfig> {
    (0..2)
        .map(|i| VirtualLineConfig {
            id: LineId(i),
            index: i,
            ..Default::default()
        })
        .collect()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            engine: SyncConfig::default(),
            lines: default_lines(),
            run_scenario: true,
        }
    }
}

impl Settings {
    /// Get the XDG config directory for telsync
    /// Uses $XDG_CONFIG_HOME/telsync, falls back to ~/.config/telsync
    fn config_dir() -> Option<PathBuf> {
        if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
            let path = PathBuf::from(xdg_config);
            if path.is_absolute() {
                return Some(path.join("telsync"));
            }
        }

        dirs::home_dir().map(|h| h.join(".config").join("telsync"))
    }

    /// Get the settings file path
    pub fn settings_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("settings.json"))
    }

    /// Load settings, writing the defaults back if no file exists yet
    pub fn load() -> Self {
        let Some(path) = Self::settings_path() else {
            warn!("could not determine settings path, using defaults");
            return Self::default();
        };
        if !path.exists() {
            let settings = Self::default();
            match settings.save_to(&path) {
                Ok(()) => info!("wrote default settings to {}", path.display()),
                Err(e) => warn!("{:#}", e),
            }
            return settings;
        }
        Self::load_from(&path).unwrap_or_else(|e| {
            warn!("{:#}; using defaults", e);
            Self::default()
        })
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&json).with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("failed to create settings directory")?;
        }
        let json = serde_json::to_string_pretty(self).context("failed to serialize settings")?;
        std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tel_protocol::ServiceState;

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("telsync-test-{}-{}", std::process::id(), name))
            .join("settings.json")
    }

    #[test]
    fn test_default_has_two_lines() {
        let settings = Settings::default();
        assert_eq!(settings.lines.len(), 2);
        assert_eq!(settings.lines[1].id, LineId(1));
        assert_eq!(settings.lines[1].index, 1);
        assert!(settings.run_scenario);
    }

    #[test]
    fn test_save_and_load() {
        let path = scratch_path("roundtrip");
        let mut settings = Settings::default();
        settings.lines[0].service = ServiceState::PowerOff;
        settings.engine.router.default_voice_line = Some(LineId(1));

        settings.save_to(&path).unwrap();
        let loaded = Settings::load_from(&path).unwrap();
        assert_eq!(loaded, settings);

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let settings: Settings = serde_json::from_str(r#"{"run_scenario": false}"#).unwrap();
        assert!(!settings.run_scenario);
        assert_eq!(settings.lines.len(), 2);
        assert_eq!(settings.engine, SyncConfig::default());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let path = scratch_path("malformed");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{ not json").unwrap();

        let err = Settings::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("failed to parse"));

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
