//! Device contract shared by every rig adapter.
//!
//! The sequencer never talks to a serial port or a vendor SDK directly. It
//! sends [`DeviceCommand`]s through the
//! [`HardwareManager`](crate::hardware::HardwareManager), which forwards them
//! to a [`DeviceAdapter`]. An adapter exposes three operations:
//!
//! - `initialize()` - open the connection and home the device
//! - `execute(command)` - run one action synchronously and return its result
//! - `shutdown()` - best-effort teardown, called once per run
//!
//! Results come back as a [`DeviceResponse`]. Motion controllers answer with
//! text feedback, measurement requests with a success flag, and the
//! spectrometer with a spectrum.

use crate::error::{AppResult, RigError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// The device groups the rig knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Syringe pump group on the CAN bus (addressed by pump id)
    Pumps,
    /// Arduino driving the turntables and probe cylinders
    Arduino,
    /// Dynamic light scattering analyzer
    Dls,
    /// Gantry moving bottles between tray and stations
    Gantry,
    /// UV-Vis spectrometer
    UvVis,
}

impl DeviceKind {
    /// All device kinds in initialization order.
    pub const ALL: [DeviceKind; 5] = [
        DeviceKind::Pumps,
        DeviceKind::Arduino,
        DeviceKind::Dls,
        DeviceKind::Gantry,
        DeviceKind::UvVis,
    ];

    /// Name used in configuration files and log messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Pumps => "Pumps",
            DeviceKind::Arduino => "Arduino",
            DeviceKind::Dls => "DLS",
            DeviceKind::Gantry => "Gantry",
            DeviceKind::UvVis => "UV_Vis",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceKind {
    type Err = RigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "pumps" | "pump" => Ok(DeviceKind::Pumps),
            "arduino" => Ok(DeviceKind::Arduino),
            "dls" => Ok(DeviceKind::Dls),
            "gantry" => Ok(DeviceKind::Gantry),
            "uv_vis" | "uvvis" | "uv" => Ok(DeviceKind::UvVis),
            _ => Err(RigError::DeviceNotFound(s.to_string())),
        }
    }
}

/// A request sent to one device.
///
/// Commands are built fresh for every call and are not retained by the
/// sequencer.
///
/// ```rust,ignore
/// let cmd = DeviceCommand::new("dispense")
///     .with("volume", 0.25)
///     .with("flow", 0.01);
/// manager.execute_command(DeviceKind::Pumps, &cmd, Some("pump1")).await?;
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCommand {
    /// Action name understood by the target adapter
    pub action: String,
    /// Action parameters
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl DeviceCommand {
    /// Create a command with no parameters.
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            params: Map::new(),
        }
    }

    /// Attach a parameter.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    /// Read a numeric parameter.
    pub fn f64_param(&self, key: &str) -> AppResult<f64> {
        self.params
            .get(key)
            .and_then(Value::as_f64)
            .ok_or_else(|| self.missing(key, "a number"))
    }

    /// Read a non-negative integer parameter.
    pub fn u64_param(&self, key: &str) -> AppResult<u64> {
        self.params
            .get(key)
            .and_then(Value::as_u64)
            .ok_or_else(|| self.missing(key, "an unsigned integer"))
    }

    /// Read a boolean parameter.
    pub fn bool_param(&self, key: &str) -> AppResult<bool> {
        self.params
            .get(key)
            .and_then(Value::as_bool)
            .ok_or_else(|| self.missing(key, "a boolean"))
    }

    /// Read a string parameter.
    pub fn str_param(&self, key: &str) -> AppResult<&str> {
        self.params
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| self.missing(key, "a string"))
    }

    /// Read an `[x, y]` coordinate parameter.
    pub fn point_param(&self, key: &str) -> AppResult<[f64; 2]> {
        let pair = self
            .params
            .get(key)
            .and_then(Value::as_array)
            .filter(|items| items.len() == 2)
            .ok_or_else(|| self.missing(key, "an [x, y] pair"))?;
        match (pair[0].as_f64(), pair[1].as_f64()) {
            (Some(x), Some(y)) => Ok([x, y]),
            _ => Err(self.missing(key, "an [x, y] pair")),
        }
    }

    fn missing(&self, key: &str, expected: &str) -> RigError {
        RigError::InvalidParameter(format!(
            "'{}' requires '{}' to be {}",
            self.action, key, expected
        ))
    }
}

/// Result of a device command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeviceResponse {
    /// Command completed with nothing to report
    Ack,
    /// Text feedback (motion completion strings)
    Text(String),
    /// Success flag (measurement requests, dosing completion)
    Flag(bool),
    /// Intensity values from the spectrometer
    Spectrum(Vec<f64>),
}

impl DeviceResponse {
    /// Text feedback, if any.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            DeviceResponse::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Interpret the response as a success flag. `Ack` and text count as success.
    pub fn succeeded(&self) -> bool {
        match self {
            DeviceResponse::Flag(flag) => *flag,
            DeviceResponse::Ack | DeviceResponse::Text(_) | DeviceResponse::Spectrum(_) => true,
        }
    }

    /// Spectrum values, if any.
    pub fn into_spectrum(self) -> Option<Vec<f64>> {
        match self {
            DeviceResponse::Spectrum(values) => Some(values),
            _ => None,
        }
    }
}

/// Contract every device adapter implements.
///
/// # Thread Safety
/// - Methods take `&self`; adapters keep connection state behind a mutex so
///   independent actions can be dispatched concurrently
/// - An adapter that serves several concurrent callers (the Arduino drives
///   both probe cylinders) serializes its own bus access
#[async_trait]
pub trait DeviceAdapter: Send + Sync {
    /// Human-readable adapter name.
    fn name(&self) -> &str;

    /// Open the connection and bring the device to a known state.
    ///
    /// Returns `Ok(false)` when the device is reachable but not usable.
    async fn initialize(&self) -> AppResult<bool>;

    /// Execute one command and wait for its result.
    async fn execute(&self, command: &DeviceCommand) -> AppResult<DeviceResponse>;

    /// Close the connection. Best effort.
    async fn shutdown(&self) -> AppResult<()>;
}
