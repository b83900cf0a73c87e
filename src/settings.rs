//! Shared settings for the Graduator library and CLI.
//! Persisted in the platform-specific config directory via `directories::ProjectDirs`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::archive::ResultArchive;
use crate::catalog::PreloadTable;
use crate::controller::{ControllerConfig, StrokeMode};
use crate::engine::EngineConfig;
use crate::sensor::{parse_hex, PollingConfig, SensorProtocol};
use crate::telemetry::TelemetryConfig;

/// Environment variable overriding the sensor port.
pub const ENV_SENSOR_PORT: &str = "GRADUATOR_SENSOR_PORT";
/// Environment variable overriding the catalog directory.
pub const ENV_CATALOG_DIR: &str = "GRADUATOR_CATALOG_DIR";
/// Environment variable selecting the stub sensor ("1", "true", "yes").
pub const ENV_STUB_SENSOR: &str = "GRADUATOR_STUB_SENSOR";

/// Stand settings that can be saved and loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraduatorSettings {
    /// Serial port of the pressure transducer
    pub sensor_port: String,
    /// Use the simulated transducer instead of the serial one
    pub stub_sensor: bool,
    /// Request frame as hex, e.g. "01"
    pub request_hex: String,
    /// Response frame length in bytes
    pub response_length: usize,
    /// Offsets of the pressure float bytes in the response
    pub pressure_byte_indices: [usize; 4],
    /// Offset of the unit code in the response
    pub unit_byte_index: usize,
    /// Polling interval in milliseconds
    pub poll_interval_ms: u64,
    /// Serial read timeout in milliseconds
    pub read_timeout_ms: u64,
    /// Consecutive bad frames before asking to check the wiring
    pub decode_failure_limit: u32,
    /// Directory holding the gauge model files
    pub catalog_dir: String,
    /// Default session unit key, e.g. "kgf/cm2"; empty means the model unit
    pub unit: String,
    /// Default stroke mode
    pub stroke_mode: StrokeMode,
    /// Vent to the first scale point before graduating
    pub sight_alignment: bool,
    /// Allowed needle overshoot in degrees before asking the operator
    pub angle_margin: f64,
    /// Hold band as a fraction of the gauge upper limit
    pub tolerance: f64,
    /// Settling window in milliseconds
    pub settle_window_ms: u64,
    /// Readings older than this many milliseconds are ignored
    pub staleness_ms: u64,
    /// Per-ramp timeout in seconds
    pub ramp_timeout_s: u64,
    /// Time allowed to obtain a pressure/angle pair at a held point, in seconds
    pub capture_timeout_s: u64,
    /// Preload coefficients
    pub preload: PreloadTable,
    /// Root of the result archive; empty means the data directory
    pub archive_dir: String,
    /// Stand number used in archive paths
    pub stand_number: u32,
    /// Record pressure/angle telemetry of every session
    pub telemetry: bool,
    /// Root of the telemetry files; empty means the data directory
    pub telemetry_dir: String,
}

impl Default for GraduatorSettings {
    fn default() -> Self {
        let protocol = SensorProtocol::default();
        let polling = PollingConfig::default();
        let controller = ControllerConfig::default();
        let engine = EngineConfig::default();
        Self {
            sensor_port: "COM1".to_string(),
            stub_sensor: false,
            request_hex: "01".to_string(),
            response_length: protocol.response_length,
            pressure_byte_indices: protocol.pressure_byte_indices,
            unit_byte_index: protocol.unit_byte_index,
            poll_interval_ms: polling.interval.as_millis() as u64,
            read_timeout_ms: polling.read_timeout.as_millis() as u64,
            decode_failure_limit: polling.decode_failure_limit,
            catalog_dir: "models".to_string(),
            unit: String::new(),
            stroke_mode: StrokeMode::ForwardOnly,
            sight_alignment: engine.sight_alignment,
            angle_margin: engine.angle_margin,
            tolerance: controller.tolerance,
            settle_window_ms: controller.settle_window.as_millis() as u64,
            staleness_ms: controller.staleness.as_millis() as u64,
            ramp_timeout_s: controller.ramp_timeout.as_secs(),
            capture_timeout_s: engine.capture_timeout.as_secs(),
            preload: PreloadTable::default(),
            archive_dir: String::new(),
            stand_number: 1,
            telemetry: true,
            telemetry_dir: String::new(),
        }
    }
}

impl GraduatorSettings {
    fn project_dirs() -> Option<directories::ProjectDirs> {
        directories::ProjectDirs::from("com", "graduator", "graduator")
    }

    /// Get the config directory path.
    pub fn config_dir() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the settings file path.
    pub fn settings_path() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join("settings.json"))
    }

    /// Get logs directory path.
    pub fn logs_dir() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.data_dir().join("logs"))
    }

    fn data_subdir(configured: &str, name: &str) -> Option<PathBuf> {
        if !configured.trim().is_empty() {
            return Some(PathBuf::from(configured.trim()));
        }
        Self::project_dirs().map(|dirs| dirs.data_dir().join(name))
    }

    /// Result archive of this stand.
    pub fn result_archive(&self) -> Option<ResultArchive> {
        Self::data_subdir(&self.archive_dir, "archive")
            .map(|root| ResultArchive::new(root, self.stand_number))
    }

    /// Telemetry recording, unless switched off.
    pub fn telemetry_config(&self) -> Option<TelemetryConfig> {
        if !self.telemetry {
            return None;
        }
        Self::data_subdir(&self.telemetry_dir, "telemetry").map(TelemetryConfig::new)
    }

    /// Load settings from the config file.
    pub fn load() -> Self {
        Self::settings_path()
            .map(|path| Self::load_from(&path))
            .unwrap_or_default()
    }

    /// Load settings from `path`, falling back to defaults.
    pub fn load_from(path: &Path) -> Self {
        let loaded: Self = fs::read_to_string(path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();
        loaded.backfilled()
    }

    /// Replace zero or empty values left by older files with defaults.
    fn backfilled(mut self) -> Self {
        let defaults = Self::default();
        if self.request_hex.trim().is_empty() {
            self.request_hex = defaults.request_hex;
        }
        if self.response_length == 0 {
            self.response_length = defaults.response_length;
        }
        if self.poll_interval_ms == 0 {
            self.poll_interval_ms = defaults.poll_interval_ms;
        }
        if self.read_timeout_ms == 0 {
            self.read_timeout_ms = defaults.read_timeout_ms;
        }
        if self.decode_failure_limit == 0 {
            self.decode_failure_limit = defaults.decode_failure_limit;
        }
        if self.catalog_dir.is_empty() {
            self.catalog_dir = defaults.catalog_dir;
        }
        if self.preload.entries().is_empty() {
            self.preload = defaults.preload;
        }
        if !(self.tolerance > 0.0) {
            self.tolerance = defaults.tolerance;
        }
        if self.ramp_timeout_s == 0 {
            self.ramp_timeout_s = defaults.ramp_timeout_s;
        }
        if self.capture_timeout_s == 0 {
            self.capture_timeout_s = defaults.capture_timeout_s;
        }
        if self.settle_window_ms == 0 {
            self.settle_window_ms = defaults.settle_window_ms;
        }
        if self.staleness_ms == 0 {
            self.staleness_ms = defaults.staleness_ms;
        }
        if self.stand_number == 0 {
            self.stand_number = defaults.stand_number;
        }
        self
    }

    /// Save settings to the config file.
    pub fn save(&self) -> Result<(), String> {
        let path = Self::settings_path().ok_or("Cannot determine config directory")?;
        self.save_to(&path)
    }

    /// Save settings to `path`.
    pub fn save_to(&self, path: &Path) -> Result<(), String> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .map_err(|e| format!("Failed to create config directory: {}", e))?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize settings: {}", e))?;
        fs::write(path, content).map_err(|e| format!("Failed to write settings file: {}", e))?;
        Ok(())
    }

    /// Apply `GRADUATOR_*` environment overrides.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(port) = lookup(ENV_SENSOR_PORT).filter(|v| !v.trim().is_empty()) {
            self.sensor_port = port.trim().to_string();
        }
        if let Some(dir) = lookup(ENV_CATALOG_DIR).filter(|v| !v.trim().is_empty()) {
            self.catalog_dir = dir.trim().to_string();
        }
        if let Some(flag) = lookup(ENV_STUB_SENSOR) {
            self.stub_sensor = matches!(
                flag.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            );
        }
    }

    /// Sensor framing described by these settings.
    pub fn protocol(&self) -> Result<SensorProtocol, String> {
        let request = parse_hex(&self.request_hex)
            .ok_or_else(|| format!("Invalid request hex: '{}'", self.request_hex))?;
        Ok(SensorProtocol::default()
            .with_request(request)
            .with_response_length(self.response_length)
            .with_pressure_byte_indices(self.pressure_byte_indices)
            .with_unit_byte_index(self.unit_byte_index))
    }

    pub fn polling_config(&self) -> PollingConfig {
        PollingConfig::default()
            .with_interval(Duration::from_millis(self.poll_interval_ms))
            .with_read_timeout(Duration::from_millis(self.read_timeout_ms))
            .with_decode_failure_limit(self.decode_failure_limit)
    }

    pub fn engine_config(&self) -> EngineConfig {
        let controller = ControllerConfig::default()
            .with_tolerance(self.tolerance)
            .with_settle_window(Duration::from_millis(self.settle_window_ms))
            .with_staleness(Duration::from_millis(self.staleness_ms))
            .with_ramp_timeout(Duration::from_secs(self.ramp_timeout_s));
        EngineConfig::default()
            .with_angle_margin(self.angle_margin)
            .with_capture_timeout(Duration::from_secs(self.capture_timeout_s))
            .with_staleness(Duration::from_millis(self.staleness_ms))
            .with_sight_alignment(self.sight_alignment)
            .with_controller(controller)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("conf").join("settings.json");
        let mut settings = GraduatorSettings::default();
        settings.sensor_port = "COM7".to_string();
        settings.stroke_mode = StrokeMode::ForwardAndBackward;
        settings.save_to(&path).unwrap();

        assert_eq!(GraduatorSettings::load_from(&path), settings);
    }

    #[test]
    fn test_load_backfills_missing_fields() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"sensor_port": "COM4", "poll_interval_ms": 0}"#).unwrap();

        let settings = GraduatorSettings::load_from(&path);
        assert_eq!(settings.sensor_port, "COM4");
        assert_eq!(settings.poll_interval_ms, 80);
        assert_eq!(settings.request_hex, "01");
        assert!(!settings.preload.entries().is_empty());
    }

    #[test]
    fn test_zero_timings_are_backfilled() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{"staleness_ms": 0, "settle_window_ms": 0, "stand_number": 0, "capture_timeout_s": 3}"#,
        )
        .unwrap();

        let settings = GraduatorSettings::load_from(&path);
        let defaults = GraduatorSettings::default();
        assert_eq!(settings.staleness_ms, defaults.staleness_ms);
        assert_eq!(settings.settle_window_ms, defaults.settle_window_ms);
        assert_eq!(settings.stand_number, 1);
        assert_eq!(settings.capture_timeout_s, 3);

        let engine = settings.engine_config();
        assert_eq!(engine.staleness, Duration::from_millis(500));
        assert_eq!(engine.controller.staleness, Duration::from_millis(500));
        assert_eq!(engine.controller.settle_window, Duration::from_millis(1500));
    }

    #[test]
    fn test_archive_and_telemetry_dirs() {
        let mut settings = GraduatorSettings::default();
        settings.archive_dir = "/srv/results".to_string();
        settings.telemetry_dir = "/srv/telemetry".to_string();
        settings.stand_number = 5;

        let archive = settings.result_archive().unwrap();
        let day = chrono::NaiveDate::from_ymd_opt(2025, 3, 7).unwrap();
        assert_eq!(
            archive.day_dir(day),
            PathBuf::from("/srv/results/stand5/07.03.2025")
        );
        assert_eq!(
            settings.telemetry_config().unwrap().root,
            PathBuf::from("/srv/telemetry")
        );

        settings.telemetry = false;
        assert!(settings.telemetry_config().is_none());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let settings = GraduatorSettings::load_from(&dir.path().join("nope.json"));
        assert_eq!(settings, GraduatorSettings::default());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_SENSOR_PORT, "/dev/ttyUSB0"),
            (ENV_STUB_SENSOR, "true"),
        ]
        .into_iter()
        .collect();
        let mut settings = GraduatorSettings::default();
        settings.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(settings.sensor_port, "/dev/ttyUSB0");
        assert!(settings.stub_sensor);
        assert_eq!(settings.catalog_dir, "models");
    }

    #[test]
    fn test_protocol_from_settings() {
        let mut settings = GraduatorSettings::default();
        assert_eq!(settings.protocol().unwrap(), SensorProtocol::default());
        settings.request_hex = "xyz".to_string();
        assert!(settings.protocol().is_err());
    }
}
