//! Rig configuration using Figment
//!
//! Settings are loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `MF_RIG_`, nested keys separated
//!    by a double underscore (`MF_RIG_SEQUENCER__TICK_MS=250`)
//!
//! Every field has a default, so an empty file yields a simulated rig that can
//! run end to end.
//!
//! # Example
//! ```no_run
//! use mf_rig::config::Settings;
//!
//! let settings = Settings::load_from("config/rig.toml")?;
//! settings.validate()?;
//! println!("Variant: {}", settings.sequencer.variant);
//! # Ok::<(), mf_rig::error::RigError>(())
//! ```

use crate::error::{AppResult, RigError};
use crate::hardware::{enabled_devices, DeviceKind};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A gantry coordinate in controller units.
pub type Point = [f64; 2];

/// Top-level rig configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// JSON sample recipe; when absent every bottle gets an even mix of all pumps
    pub samples_path: Option<PathBuf>,
    /// Application settings
    pub application: ApplicationSettings,
    /// Sequencer behavior
    pub sequencer: SequencerSettings,
    /// Device connections
    pub hardware: HardwareSettings,
    /// Gantry coordinates
    pub layout: LayoutSettings,
    /// Measurement parameters
    pub measurement: MeasurementSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationSettings {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            name: "MF Rig".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// What to do when some devices fail to initialize.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitFailurePolicy {
    /// Log the failed devices and run anyway
    #[default]
    Continue,
    /// Refuse to start the run
    Abort,
}

/// Sequencer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerSettings {
    /// Variant choice ("Full", "Dispense Only", "Measure Only")
    pub variant: String,
    /// Bottle capacity; the variant default when absent
    pub bottles: Option<usize>,
    /// Delay between stage actions in milliseconds
    pub tick_ms: u64,
    /// Walk the stages without touching any device
    pub dry_run: bool,
    /// Behavior when hardware initialization partially fails
    pub on_init_failure: InitFailurePolicy,
    /// YAML stage table replacing the built-in one
    pub table_path: Option<PathBuf>,
    /// Directory for run records
    pub output_dir: PathBuf,
    /// Aspirate the recipe volumes before the run starts
    pub prime_pumps: bool,
}

impl Default for SequencerSettings {
    fn default() -> Self {
        Self {
            variant: "Full".to_string(),
            bottles: None,
            tick_ms: default_tick_ms(),
            dry_run: false,
            on_init_failure: InitFailurePolicy::Continue,
            table_path: None,
            output_dir: PathBuf::from("runs"),
            prime_pumps: true,
        }
    }
}

impl SequencerSettings {
    /// Tick interval as a duration.
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

/// Serial line settings for the Arduino
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Port name (e.g. "COM3", "/dev/ttyACM0")
    pub port: String,
    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Reply timeout in milliseconds
    #[serde(default = "default_device_timeout_ms")]
    pub timeout_ms: u64,
}

/// DLS analyzer serial connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlsSettings {
    /// Port name
    pub port: String,
    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Reply timeout for short commands in milliseconds
    #[serde(default = "default_device_timeout_ms")]
    pub timeout_ms: u64,
    /// Reply timeout for one measurement run in milliseconds
    #[serde(default = "default_dls_run_timeout_ms")]
    pub run_timeout_ms: u64,
}

/// Gantry controller connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GantrySettings {
    /// Controller host name or IP
    pub host: String,
    /// Telnet port
    #[serde(default = "default_gantry_port")]
    pub port: u16,
    /// Reply timeout in milliseconds
    #[serde(default = "default_device_timeout_ms")]
    pub timeout_ms: u64,
}

/// Spectrometer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectrometerSettings {
    /// Integration time in milliseconds
    #[serde(default = "default_integration_time_ms")]
    pub integration_time_ms: u64,
}

/// Shared CAN bus settings for the pump group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpBusSettings {
    /// Vendor device configuration directory
    pub device_config: PathBuf,
}

impl Default for PumpBusSettings {
    fn default() -> Self {
        Self {
            device_config: PathBuf::from("pump_lib/PumpConfig"),
        }
    }
}

/// One syringe pump on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PumpSettings {
    /// Device name on the bus
    pub name: String,
    /// Pressure limit in bar
    #[serde(default = "default_pressure_limit")]
    pub pressure_limit: f64,
    /// Syringe inner diameter
    #[serde(default = "default_inner_diameter")]
    pub inner_diameter_mm: f64,
    /// Maximum piston stroke
    #[serde(default = "default_piston_stroke")]
    pub max_piston_stroke_mm: f64,
    /// Flow used for aspirate/refill
    #[serde(default = "default_pump_flow")]
    pub flow: f64,
}

impl PumpSettings {
    /// Syringe volume derived from bore and stroke, in millilitres.
    pub fn syringe_volume_ml(&self) -> f64 {
        let radius_mm = self.inner_diameter_mm / 2.0;
        std::f64::consts::PI * radius_mm * radius_mm * self.max_piston_stroke_mm / 1000.0
    }
}

/// Device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareSettings {
    /// Use simulated adapters for every device
    pub simulate: bool,
    /// Devices to bring up by config name ("Pumps", "Arduino", "DLS",
    /// "Gantry", "UV_Vis"); empty means all of them
    pub devices: Vec<String>,
    /// Arduino serial connection
    pub arduino: Option<SerialSettings>,
    /// DLS analyzer serial connection
    pub dls: Option<DlsSettings>,
    /// Gantry controller
    pub gantry: Option<GantrySettings>,
    /// UV-Vis spectrometer
    pub uv_vis: Option<SpectrometerSettings>,
    /// Pump bus
    pub pump_bus: PumpBusSettings,
    /// Pumps keyed by id ("pump1", ...)
    pub pumps: BTreeMap<String, PumpSettings>,
}

impl Default for HardwareSettings {
    fn default() -> Self {
        let pumps = (1..=3)
            .map(|i| {
                (
                    format!("pump{i}"),
                    PumpSettings {
                        name: format!("Nemesys_S_1_Pump{i}"),
                        pressure_limit: default_pressure_limit(),
                        inner_diameter_mm: default_inner_diameter(),
                        max_piston_stroke_mm: default_piston_stroke(),
                        flow: default_pump_flow(),
                    },
                )
            })
            .collect();

        Self {
            simulate: true,
            devices: Vec::new(),
            arduino: None,
            dls: None,
            gantry: None,
            uv_vis: None,
            pump_bus: PumpBusSettings::default(),
            pumps,
        }
    }
}

/// Gantry coordinates of the tray and stations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutSettings {
    /// Tray slots, consumed in order
    pub tray: Vec<Point>,
    /// Bottle position on the pump turntable
    pub pump_station: Point,
    /// Bottle position on the measurement turntable
    pub measure_station: Point,
}

impl Default for LayoutSettings {
    fn default() -> Self {
        Self {
            tray: (0..8).map(|i| [20.0 + 30.0 * f64::from(i), 20.0]).collect(),
            pump_station: [300.0, 120.0],
            measure_station: [420.0, 120.0],
        }
    }
}

/// Measurement parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasurementSettings {
    /// DLS measurement setup index
    pub dls_setup_id: u8,
    /// DLS runs per measurement
    pub dls_runs: u32,
    /// DLS export directory on the analyzer host
    pub dls_save_dir: String,
    /// Settle time after switching the spectrometer shutter
    pub shutter_settle_ms: u64,
}

impl Default for MeasurementSettings {
    fn default() -> Self {
        Self {
            dls_setup_id: 1,
            dls_runs: 3,
            dls_save_dir: "C:/DLS/exports".to_string(),
            shutter_settle_ms: 100,
        }
    }
}

fn default_tick_ms() -> u64 {
    1000
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_device_timeout_ms() -> u64 {
    30_000
}

fn default_dls_run_timeout_ms() -> u64 {
    500_000
}

fn default_gantry_port() -> u16 {
    23
}

fn default_integration_time_ms() -> u64 {
    100
}

fn default_pressure_limit() -> f64 {
    5.0
}

fn default_inner_diameter() -> f64 {
    14.57
}

fn default_piston_stroke() -> f64 {
    60.0
}

fn default_pump_flow() -> f64 {
    0.05
}

impl Settings {
    /// Load from a TOML file and `MF_RIG_` environment variables.
    ///
    /// A missing file is not an error; defaults and the environment apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Self::figment(path.as_ref()).extract().map_err(RigError::from)
    }

    /// The provider chain used by [`Settings::load_from`].
    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("MF_RIG_").split("__"))
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self).map_err(|e| RigError::Configuration(e.to_string()))
    }

    /// Validate configuration after loading.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(RigError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.sequencer.bottles == Some(0) {
            return Err(RigError::InvalidCapacity(0));
        }

        if self.sequencer.tick_ms == 0 {
            return Err(RigError::Configuration(
                "tick_ms must be greater than zero".to_string(),
            ));
        }

        for (id, pump) in &self.hardware.pumps {
            if pump.flow <= 0.0 {
                return Err(RigError::Configuration(format!(
                    "Pump '{}' must have a positive flow, got {}",
                    id, pump.flow
                )));
            }
        }

        let live = !self.hardware.simulate && !self.sequencer.dry_run;
        if live {
            let enabled = enabled_devices(&self.hardware);
            let missing: Vec<&str> = [
                (DeviceKind::Arduino, "arduino", self.hardware.arduino.is_none()),
                (DeviceKind::Dls, "dls", self.hardware.dls.is_none()),
                (DeviceKind::Gantry, "gantry", self.hardware.gantry.is_none()),
            ]
            .into_iter()
            .filter_map(|(kind, name, absent)| (absent && enabled.contains(&kind)).then_some(name))
            .collect();
            if !missing.is_empty() {
                return Err(RigError::Configuration(format!(
                    "Live hardware requires [hardware.{}] sections",
                    missing.join("], [hardware.")
                )));
            }
        }

        Ok(())
    }

    /// Check that the tray has a slot for every bottle.
    pub fn validate_layout(&self, capacity: usize) -> AppResult<()> {
        if !self.sequencer.dry_run && self.layout.tray.len() < capacity {
            return Err(RigError::Configuration(format!(
                "Tray has {} slots but the run needs {}",
                self.layout.tray.len(),
                capacity
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_settings_validate() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert!(settings.hardware.simulate);
        assert_eq!(settings.sequencer.tick(), Duration::from_secs(1));
        assert_eq!(settings.hardware.pumps.len(), 3);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
log_level = "debug"

[sequencer]
variant = "Measure Only"
bottles = 6
tick_ms = 10
on_init_failure = "abort"

[hardware]
simulate = false

[hardware.arduino]
port = "/dev/ttyACM0"

[hardware.dls]
port = "/dev/ttyUSB0"
baud_rate = 19200
run_timeout_ms = 120000

[hardware.gantry]
host = "192.168.0.10"

[hardware.pumps.pump1]
name = "Pump1"
flow = 0.1
"#
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.application.log_level, "debug");
        assert_eq!(settings.sequencer.variant, "Measure Only");
        assert_eq!(settings.sequencer.bottles, Some(6));
        assert_eq!(settings.sequencer.on_init_failure, InitFailurePolicy::Abort);
        assert_eq!(settings.hardware.arduino.as_ref().unwrap().baud_rate, 9600);
        let dls = settings.hardware.dls.as_ref().unwrap();
        assert_eq!(dls.baud_rate, 19200);
        assert_eq!(dls.timeout_ms, 30_000);
        assert_eq!(dls.run_timeout_ms, 120_000);
        assert_eq!(settings.hardware.gantry.as_ref().unwrap().port, 23);
        assert_eq!(settings.hardware.pumps["pump1"].pressure_limit, 5.0);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_effective_config_reloads() {
        let mut settings = Settings::default();
        settings.sequencer.bottles = Some(3);
        settings.samples_path = Some(PathBuf::from("config/samples.json"));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", settings.to_toml().unwrap()).unwrap();

        let reloaded = Settings::load_from(file.path()).unwrap();
        assert_eq!(reloaded.sequencer.bottles, Some(3));
        assert_eq!(reloaded.samples_path, settings.samples_path);
        assert_eq!(reloaded.layout.tray, settings.layout.tray);
        assert_eq!(reloaded.hardware.pumps.len(), 3);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings.sequencer.variant, "Full");
        assert_eq!(settings.sequencer.output_dir, PathBuf::from("runs"));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut settings = Settings::default();
        settings.application.log_level = "loud".to_string();
        assert!(matches!(
            settings.validate(),
            Err(RigError::Configuration(_))
        ));
    }

    #[test]
    fn test_zero_bottles_rejected() {
        let mut settings = Settings::default();
        settings.sequencer.bottles = Some(0);
        assert!(matches!(
            settings.validate(),
            Err(RigError::InvalidCapacity(0))
        ));
    }

    #[test]
    fn test_live_requires_device_sections() {
        let mut settings = Settings::default();
        settings.hardware.simulate = false;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("hardware.arduino"));
    }

    #[test]
    fn test_layout_needs_slot_per_bottle() {
        let mut settings = Settings::default();
        settings.layout.tray.truncate(2);
        assert!(settings.validate_layout(2).is_ok());
        assert!(settings.validate_layout(3).is_err());

        settings.sequencer.dry_run = true;
        assert!(settings.validate_layout(3).is_ok());
    }
}
