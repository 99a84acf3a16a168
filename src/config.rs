//! Session configuration and the participant run counter
//!
//! Configuration is a TOML file; every key is optional and falls back to the
//! lab defaults below.
//!
//! ```toml
//! battery_size = 10
//!
//! [device]
//! endpoint = "192.168.1.24:8080"
//! settle_delay_ms = 2000
//! companion_command = ["ssh", "pi@192.168.1.24", "cd haptic_rods_C; make update_and_run"]
//! transfer_command = ["scp", "-r", "pi@192.168.1.24:/home/pi/haptic_rods_C/user{participant}", "{dest}"]
//!
//! [sensor]
//! command = ["python", "gaze/main.py"]
//! log_dir = "logs"
//! timestamp_column = "Timestamp (ms)"
//!
//! [storage]
//! problem_dir = "problem_set"
//! data_root = "user_data"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use toml_edit::{DocumentMut, Item, Value};
use tracing::{debug, info};

use crate::align::DEFAULT_TIMESTAMP_COLUMN;
use crate::command::ExternalCommand;
use crate::device::DEFAULT_SETTLE_DELAY;
use crate::error::SessionError;

/// Number of problems in a battery
pub const DEFAULT_BATTERY_SIZE: usize = 10;

const DEFAULT_DEVICE_HOST: &str = "192.168.1.24";

/// Remote device settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// `host:port` of the device socket
    pub endpoint: String,
    /// Wait after launching the companion before the single retry
    pub settle_delay_ms: u64,
    /// Starts the device application; empty disables the launch
    pub companion_command: ExternalCommand,
    /// Copies interaction artifacts back after the session
    pub transfer_command: ExternalCommand,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            endpoint: format!("{}:8080", DEFAULT_DEVICE_HOST),
            settle_delay_ms: DEFAULT_SETTLE_DELAY.as_millis() as u64,
            companion_command: ExternalCommand::new([
                "ssh".to_string(),
                format!("pi@{}", DEFAULT_DEVICE_HOST),
                "cd haptic_rods_C; make update_and_run".to_string(),
            ]),
            transfer_command: ExternalCommand::new([
                "scp".to_string(),
                "-r".to_string(),
                format!(
                    "pi@{}:/home/pi/haptic_rods_C/user{{participant}}",
                    DEFAULT_DEVICE_HOST
                ),
                "{dest}".to_string(),
            ]),
        }
    }
}

impl DeviceConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// Sensor process settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub command: ExternalCommand,
    /// Directory the sensor writes its logs into
    pub log_dir: PathBuf,
    /// Millisecond timestamp column of the sensor log
    pub timestamp_column: String,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            command: ExternalCommand::new(["python", "gaze/main.py"]),
            log_dir: PathBuf::from("logs"),
            timestamp_column: DEFAULT_TIMESTAMP_COLUMN.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub problem_dir: PathBuf,
    pub data_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            problem_dir: PathBuf::from("problem_set"),
            data_root: PathBuf::from("user_data"),
        }
    }
}

/// Complete session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub battery_size: usize,
    pub device: DeviceConfig,
    pub sensor: SensorConfig,
    pub storage: StorageConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            battery_size: DEFAULT_BATTERY_SIZE,
            device: DeviceConfig::default(),
            sensor: SensorConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn from_toml(text: &str) -> Result<Self, SessionError> {
        let config: SessionConfig =
            toml::from_str(text).map_err(|e| SessionError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self, SessionError> {
        if !path.exists() {
            info!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        debug!(path = %path.display(), "loading config");
        let text = fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if self.battery_size == 0 {
            return Err(SessionError::Config("battery_size must be at least 1".to_string()));
        }
        if self.sensor.command.is_empty() {
            return Err(SessionError::Config("sensor.command must not be empty".to_string()));
        }
        if self.device.endpoint.trim().is_empty() {
            return Err(SessionError::Config("device.endpoint must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Persistent counter handing out participant ids.
///
/// Lives in a small TOML metadata file under `latest_user_id`. The file is
/// edited in place: other keys, comments and ordering survive an increment.
#[derive(Debug, Clone)]
pub struct RunCounter {
    path: PathBuf,
}

impl RunCounter {
    const KEY: &'static str = "latest_user_id";

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Current value without incrementing (0 when the file is absent)
    pub fn current(&self) -> Result<u64, SessionError> {
        Ok(self.read_document()?.1)
    }

    /// Increment, persist and return the new participant id
    pub fn next(&self) -> Result<u64, SessionError> {
        let (mut doc, latest) = self.read_document()?;
        let next = latest + 1;
        let stored = i64::try_from(next)
            .map_err(|_| SessionError::Config(format!("{} overflowed", Self::KEY)))?;

        match doc.get_mut(Self::KEY).and_then(Item::as_value_mut) {
            Some(current) => {
                let decor = current.decor().clone();
                *current = Value::from(stored);
                *current.decor_mut() = decor;
            }
            None => doc[Self::KEY] = toml_edit::value(stored),
        }

        fs::write(&self.path, doc.to_string())?;
        info!(participant = next, "assigned participant id");
        Ok(next)
    }

    fn read_document(&self) -> Result<(DocumentMut, u64), SessionError> {
        if !self.path.exists() {
            return Ok((DocumentMut::new(), 0));
        }
        let text = fs::read_to_string(&self.path)?;
        let doc: DocumentMut = text
            .parse()
            .map_err(|e: toml_edit::TomlError| SessionError::Config(e.to_string()))?;
        let latest = match doc.get(Self::KEY) {
            None => 0,
            Some(item) => {
                let value = item.as_integer().ok_or_else(|| {
                    SessionError::Config(format!(
                        "{} must be an integer, got {}",
                        Self::KEY,
                        item.to_string().trim()
                    ))
                })?;
                u64::try_from(value).map_err(|_| {
                    SessionError::Config(format!("{} must not be negative", Self::KEY))
                })?
            }
        };
        Ok((doc, latest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.battery_size, 10);
        assert_eq!(config.device.settle_delay(), DEFAULT_SETTLE_DELAY);
        assert_eq!(config.device.settle_delay_ms, 2000);
        assert_eq!(config.sensor.timestamp_column, "Timestamp (ms)");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = SessionConfig::from_toml(
            r#"
            battery_size = 4

            [device]
            endpoint = "127.0.0.1:9000"
            companion_command = []
            "#,
        )
        .unwrap();

        assert_eq!(config.battery_size, 4);
        assert_eq!(config.device.endpoint, "127.0.0.1:9000");
        assert!(config.device.companion_command.is_empty());
        assert_eq!(config.device.settle_delay_ms, 2000);
        assert_eq!(config.storage, StorageConfig::default());
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            SessionConfig::from_toml("battery_size = 0"),
            Err(SessionError::Config(_))
        ));
        assert!(matches!(
            SessionConfig::from_toml("[sensor]\ncommand = []"),
            Err(SessionError::Config(_))
        ));
        assert!(matches!(
            SessionConfig::from_toml("battery_size = \"ten\""),
            Err(SessionError::Config(_))
        ));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig::load(&dir.path().join("rods.toml")).unwrap();
        assert_eq!(config, SessionConfig::default());
    }

    #[test]
    fn test_run_counter_increments_and_preserves_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.toml");
        fs::write(&path, "latest_user_id = 6\nlab = \"B12\"\n").unwrap();

        let counter = RunCounter::new(&path);
        assert_eq!(counter.current().unwrap(), 6);
        assert_eq!(counter.next().unwrap(), 7);
        assert_eq!(counter.next().unwrap(), 8);

        let table: toml::Table = fs::read_to_string(&path).unwrap().parse().unwrap();
        assert_eq!(table["latest_user_id"].as_integer(), Some(8));
        assert_eq!(table["lab"].as_str(), Some("B12"));
    }

    #[test]
    fn test_run_counter_keeps_comments_and_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.toml");
        fs::write(
            &path,
            "# lab bookkeeping\nlab = \"B12\"\nlatest_user_id = 6 # bumped by rods\nroom = 3\n",
        )
        .unwrap();

        assert_eq!(RunCounter::new(&path).next().unwrap(), 7);

        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "# lab bookkeeping\nlab = \"B12\"\nlatest_user_id = 7 # bumped by rods\nroom = 3\n"
        );
    }

    #[test]
    fn test_run_counter_starts_at_one() {
        let dir = tempfile::tempdir().unwrap();
        let counter = RunCounter::new(dir.path().join("meta.toml"));
        assert_eq!(counter.next().unwrap(), 1);
    }

    #[test]
    fn test_run_counter_rejects_bad_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.toml");
        fs::write(&path, "latest_user_id = \"x\"\n").unwrap();
        assert!(matches!(RunCounter::new(&path).next(), Err(SessionError::Config(_))));
    }
}
