//! Host settings
//!
//! One TOML file per state directory. Every section is optional; missing
//! sections and fields fall back to defaults.

use anyhow::{bail, Context};
use reverie_continuity::ContinuityConfig;
use reverie_engine::EngineConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const SETTINGS_FILE: &str = "reverie.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub engine: EngineConfig,
    pub continuity: ContinuityConfig,
}

impl Settings {
    /// Load settings from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(settings) => {
                    tracing::info!("Loaded settings from {}", path.display());
                    settings
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {}, using defaults", path.display(), e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::info!("No settings at {}, using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn load_from_dir(dir: &Path) -> Self {
        Self::load(&dir.join(SETTINGS_FILE))
    }

    /// Reject settings the engine or the snapshot task cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.engine.validate().context("[engine]")?;
        if self.continuity.cadence_secs == 0 {
            bail!("[continuity] cadence_secs must be > 0");
        }
        if self.continuity.snapshot_timeout_ms == 0 {
            bail!("[continuity] snapshot_timeout_ms must be > 0");
        }
        if self.continuity.file_name.trim().is_empty() {
            bail!("[continuity] file_name must not be empty");
        }
        Ok(())
    }

    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sections_are_optional() {
        let settings: Settings = toml::from_str("[continuity]\ncadence_secs = 5\n").unwrap();
        assert_eq!(settings.continuity.cadence_secs, 5);
        assert_eq!(settings.engine, EngineConfig::default());
    }

    #[test]
    fn dump_round_trips() {
        let text = Settings::default().to_toml();
        assert!(text.contains("[engine.window]"));
        assert!(text.contains("[continuity]"));
        let back: Settings = toml::from_str(&text).unwrap();
        assert_eq!(back, Settings::default());
    }

    #[test]
    fn load_from_dir_reads_the_settings_file() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(SETTINGS_FILE), "[engine.ledger]\ninitial_balance = 7.5\n").unwrap();
        let settings = Settings::load_from_dir(tmp.path());
        assert_eq!(settings.engine.ledger.initial_balance, 7.5);

        std::fs::write(tmp.path().join(SETTINGS_FILE), "not = [valid").unwrap();
        assert_eq!(Settings::load_from_dir(tmp.path()), Settings::default());
    }

    #[test]
    fn validate_catches_unusable_values() {
        assert!(Settings::default().validate().is_ok());

        let settings: Settings = toml::from_str("[engine.window]\ncapacity = 0\n").unwrap();
        let err = settings.validate().unwrap_err();
        assert!(format!("{:#}", err).contains("capacity"));

        let settings: Settings = toml::from_str("[engine.detector]\nlocality_secs = 9999999999999\n").unwrap();
        assert!(settings.validate().is_err());

        let settings: Settings = toml::from_str("[continuity]\ncadence_secs = 0\n").unwrap();
        assert!(settings.validate().is_err());
    }
}
