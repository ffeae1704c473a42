//! Rig configuration.
//!
//! Everything has a default, so an empty JSON object is a valid config:
//!
//! ```json
//! {
//!   "switching": { "descriptor": "Arduino Uno" },
//!   "tilter": { "descriptor": "USB Serial Port", "forceRetries": 3 },
//!   "lockin": { "deviceIds": ["dev10", "dev275"], "baseFolder": "./streams" },
//!   "tables": { "chip": "cfg/ChipConfig.json", "switches": "cfg/SwitchConfig.json" },
//!   "measurement": { "useTilter": true, "syncWithTilter": true, "switchDelayMs": 2000 }
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::info;
use serde::Deserialize;

use crate::channel::SerialSettings;
use crate::errors::{DriverError, Result};
use crate::lockin::LockinSettings;
use crate::orchestrator::MeasurementFlags;
use crate::switchboard::{ChamberMap, SwitchMap, SwitchTables};
use crate::tilter::TilterSettings;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SwitchingConfig {
    /// Substring of the port description that identifies the board.
    pub descriptor: String,
    pub serial: SerialSettings,
}

impl Default for SwitchingConfig {
    fn default() -> Self {
        Self {
            descriptor: "Arduino Uno".to_string(),
            serial: SerialSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TilterConfig {
    pub descriptor: String,
    pub serial: SerialSettings,
    #[serde(flatten)]
    pub settings: TilterSettings,
}

impl Default for TilterConfig {
    fn default() -> Self {
        Self {
            descriptor: "USB Serial Port".to_string(),
            serial: SerialSettings::default(),
            settings: TilterSettings::default(),
        }
    }
}

/// Where the lookup tables live.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TablePaths {
    pub chip: Option<PathBuf>,
    pub switches: Option<PathBuf>,
}

impl TablePaths {
    /// Load whichever tables are configured; missing ones stay unset.
    pub fn load(&self) -> Result<SwitchTables> {
        let chambers = self.chip.as_ref().map(ChamberMap::from_json_file).transpose()?;
        let switches = self
            .switches
            .as_ref()
            .map(SwitchMap::from_json_file)
            .transpose()?;
        if let Some(switches) = &switches {
            info!("loaded switch table with {} switches", switches.len());
        }
        Ok(SwitchTables { chambers, switches })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RigConfig {
    pub switching: SwitchingConfig,
    pub tilter: TilterConfig,
    pub lockin: LockinSettings,
    pub tables: TablePaths,
    pub measurement: MeasurementFlags,
    /// Bound on waiting for exclusive access to a channel.
    pub lock_timeout_ms: u64,
    pub log_level: Option<String>,
}

impl Default for RigConfig {
    fn default() -> Self {
        Self {
            switching: SwitchingConfig::default(),
            tilter: TilterConfig::default(),
            lockin: LockinSettings::default(),
            tables: TablePaths::default(),
            measurement: MeasurementFlags::default(),
            lock_timeout_ms: 5_000,
            log_level: None,
        }
    }
}

impl RigConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| DriverError::Config(format!("invalid rig config: {e}")))
    }

    /// Read a config file; relative table paths resolve against its directory.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| DriverError::Config(format!("cannot read '{}': {e}", path.display())))?;
        let mut config = Self::from_json_str(&text)?;
        if let Some(dir) = path.parent() {
            for table in [&mut config.tables.chip, &mut config.tables.switches]
                .into_iter()
                .flatten()
            {
                if table.is_relative() {
                    *table = dir.join(&*table);
                }
            }
        }
        Ok(config)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_object_gives_defaults() {
        let config = RigConfig::from_json_str("{}").unwrap();
        assert_eq!(config, RigConfig::default());
        assert_eq!(config.switching.descriptor, "Arduino Uno");
        assert_eq!(config.tilter.settings.force_retries, 3);
        assert_eq!(config.lockin.rotation_interval_ms, 30_000);
        assert_eq!(config.switching.serial.baud_rate, 9600);
        assert!(!config.switching.serial.dtr);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = RigConfig::from_json_str(
            r#"{
                "tilter": {"descriptor": "FT232R", "forceRetries": 5},
                "measurement": {"syncWithTilter": true, "switchDelayMs": 1500,
                                "selection": {"perChamber": true}}
            }"#,
        )
        .unwrap();
        assert_eq!(config.tilter.descriptor, "FT232R");
        assert_eq!(config.tilter.settings.force_retries, 5);
        assert_eq!(config.tilter.settings.frame_delay_ms, 50);
        assert!(config.measurement.sync_with_tilter);
        assert_eq!(config.measurement.switch_delay(), Duration::from_millis(1500));
        assert!(config.measurement.selection.per_chamber);
        assert!(config.measurement.selection.counting);
    }

    #[test]
    fn unreadable_config_is_a_config_error() {
        assert!(matches!(
            RigConfig::from_json_str("{\"lockTimeoutMs\": \"soon\"}"),
            Err(DriverError::Config(_))
        ));
        assert!(matches!(
            RigConfig::from_json_file("/nonexistent/rig.json"),
            Err(DriverError::Config(_))
        ));
    }

    #[test]
    fn tables_load_relative_to_config_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("chip.json"),
            r#"[{"ePairId": 1, "stimPadId": 3, "recPadId": 4}]"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("switches.json"),
            r#"[{"padId": 3, "padType": "stim"}, {"padId": 4, "padType": "rec"}]"#,
        )
        .unwrap();
        let mut file = fs::File::create(dir.path().join("rig.json")).unwrap();
        write!(file, r#"{{"tables": {{"chip": "chip.json", "switches": "switches.json"}}}}"#).unwrap();

        let config = RigConfig::from_json_file(dir.path().join("rig.json")).unwrap();
        let tables = config.tables.load().unwrap();
        assert_eq!(
            tables.resolve_switches(&crate::switchboard::PairId::Numeric(1)).unwrap(),
            vec![0, 1]
        );
    }

    #[test]
    fn missing_table_paths_leave_tables_unset() {
        let tables = TablePaths::default().load().unwrap();
        assert!(tables.chambers.is_none());
        assert!(tables.switches.is_none());
    }
}
