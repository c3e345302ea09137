//! Simulated hardware for running the rig without devices attached.
//!
//! All simulated devices use async-safe waits (`tokio::time::sleep`).
//!
//! # Available Simulations
//!
//! - `SimulatedArduino` - turntables and probe cylinders with firmware reply strings
//! - `SimulatedPump` - syringe pump on the shared bus, tracks its fill level
//! - `SimulatedDls` - DLS analyzer accepting setup selection and data requests
//! - `SimulatedSpectrometer` - UV-Vis spectrometer with a shutter
//! - `SimulatedGantry` - bottle transport, records every move
//! - `ScriptedAdapter` - per-action replies and injected faults for tests

use crate::config::{PumpSettings, SpectrometerSettings};
use crate::error::{AppResult, RigError};
use crate::hardware::adapter::{DeviceAdapter, DeviceCommand, DeviceResponse};
use crate::hardware::bus::{BusLease, PumpBus};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};
use tracing::{debug, info};

fn unsupported(device: &str, action: &str) -> RigError {
    RigError::UnsupportedCommand {
        device: device.to_string(),
        action: action.to_string(),
    }
}

async fn pause(duration: Duration) {
    if !duration.is_zero() {
        sleep(duration).await;
    }
}

// =============================================================================
// SimulatedArduino - Turntables and Probe Cylinders
// =============================================================================

/// Simulated Arduino answering with the firmware's completion strings.
///
/// ```rust,ignore
/// let arduino = SimulatedArduino::new();
/// let reply = arduino.execute(&DeviceCommand::new("cylinder2 retract")).await?;
/// assert_eq!(reply.as_text(), Some("Cylinder2 Retraction Finished"));
/// ```
pub struct SimulatedArduino {
    motion_time: Duration,
    actions: Arc<RwLock<Vec<String>>>,
}

impl SimulatedArduino {
    /// Simulated Arduino with 50 ms motions.
    pub fn new() -> Self {
        Self::with_motion_time(Duration::from_millis(50))
    }

    /// Simulated Arduino with a custom motion time.
    pub fn with_motion_time(motion_time: Duration) -> Self {
        Self {
            motion_time,
            actions: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Actions executed so far, homing included.
    pub async fn actions(&self) -> Vec<String> {
        self.actions.read().await.clone()
    }

    /// Completion string the firmware sends for `action`.
    pub fn reply_for(action: &str) -> Option<String> {
        let mut parts = action.split_whitespace();
        let (axis, verb) = (parts.next()?, parts.next()?);
        if parts.next().is_some() {
            return None;
        }

        let axis = match axis {
            "motor1" => "Motor1",
            "motor2" => "Motor2",
            "cylinder1" => "Cylinder1",
            "cylinder2" => "Cylinder2",
            _ => return None,
        };
        let noun = match verb {
            "home" => "Home",
            "rotate" => "Rotation",
            "retract" => "Retraction",
            "extend" => "Extension",
            _ => return None,
        };
        Some(format!("{axis} {noun} Finished"))
    }
}

impl Default for SimulatedArduino {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceAdapter for SimulatedArduino {
    fn name(&self) -> &str {
        "Simulated Arduino"
    }

    async fn initialize(&self) -> AppResult<bool> {
        for action in crate::hardware::arduino::HOMING_ACTIONS {
            self.execute(&DeviceCommand::new(action)).await?;
        }
        Ok(true)
    }

    async fn execute(&self, command: &DeviceCommand) -> AppResult<DeviceResponse> {
        let reply = Self::reply_for(&command.action)
            .ok_or_else(|| unsupported("Arduino", &command.action))?;
        pause(self.motion_time).await;
        self.actions.write().await.push(command.action.clone());
        debug!(action = %command.action, %reply, "Simulated Arduino");
        Ok(DeviceResponse::Text(reply))
    }

    async fn shutdown(&self) -> AppResult<()> {
        Ok(())
    }
}

// =============================================================================
// SimulatedPump - Syringe Pump
// =============================================================================

/// Simulated syringe pump.
///
/// Holds a bus lease between `initialize` and `shutdown`, like the real pump
/// group. Aspirating past the syringe volume or dispensing more than the
/// current fill level fails with `RequestFailed`.
pub struct SimulatedPump {
    id: String,
    settings: PumpSettings,
    bus: Arc<PumpBus>,
    lease: Mutex<Option<BusLease>>,
    fill_ml: RwLock<f64>,
    dose_time: Duration,
}

impl SimulatedPump {
    /// Empty pump `id` on `bus`.
    pub fn new(id: impl Into<String>, settings: PumpSettings, bus: Arc<PumpBus>) -> Self {
        Self {
            id: id.into(),
            settings,
            bus,
            lease: Mutex::new(None),
            fill_ml: RwLock::new(0.0),
            dose_time: Duration::from_millis(20),
        }
    }

    /// Start with `fill_ml` already in the syringe.
    pub fn with_fill(mut self, fill_ml: f64) -> Self {
        self.fill_ml = RwLock::new(fill_ml);
        self
    }

    /// Time each dosing command takes.
    pub fn with_dose_time(mut self, dose_time: Duration) -> Self {
        self.dose_time = dose_time;
        self
    }

    /// Current fill level in millilitres.
    pub async fn fill_level(&self) -> f64 {
        *self.fill_ml.read().await
    }

    fn has_lease(&self) -> bool {
        self.lease
            .lock()
            .map(|lease| lease.is_some())
            .unwrap_or(false)
    }

    fn flow(&self, command: &DeviceCommand) -> AppResult<f64> {
        let flow = command.f64_param("flow")?;
        if flow <= 0.0 {
            return Err(RigError::InvalidParameter(format!(
                "{}: flow must be positive, got {}",
                self.id, flow
            )));
        }
        Ok(flow)
    }
}

#[async_trait]
impl DeviceAdapter for SimulatedPump {
    fn name(&self) -> &str {
        &self.id
    }

    async fn initialize(&self) -> AppResult<bool> {
        let mut lease = self.lease.lock().unwrap_or_else(|e| e.into_inner());
        if lease.is_none() {
            *lease = Some(self.bus.acquire());
        }
        debug!(pump = %self.id, name = %self.settings.name, "Simulated pump enabled");
        Ok(true)
    }

    async fn execute(&self, command: &DeviceCommand) -> AppResult<DeviceResponse> {
        if !self.has_lease() {
            return Err(RigError::request_failed(&self.id, "pump bus is not open"));
        }

        const EPSILON: f64 = 1e-9;
        let capacity = self.settings.syringe_volume_ml();

        match command.action.as_str() {
            "aspirate" => {
                let volume = command.f64_param("volume")?;
                self.flow(command)?;
                let mut fill = self.fill_ml.write().await;
                if *fill + volume > capacity + EPSILON {
                    return Err(RigError::request_failed(
                        &self.id,
                        format!("aspirating {volume:.3} ml would overfill the syringe"),
                    ));
                }
                pause(self.dose_time).await;
                *fill += volume;
            }
            "dispense" => {
                let volume = command.f64_param("volume")?;
                self.flow(command)?;
                let mut fill = self.fill_ml.write().await;
                if volume > *fill + EPSILON {
                    return Err(RigError::request_failed(
                        &self.id,
                        format!("only {:.3} ml left, cannot dispense {volume:.3} ml", *fill),
                    ));
                }
                pause(self.dose_time).await;
                *fill = (*fill - volume).max(0.0);
            }
            "refill" => {
                self.flow(command)?;
                pause(self.dose_time).await;
                *self.fill_ml.write().await = capacity;
            }
            "empty" => {
                self.flow(command)?;
                pause(self.dose_time).await;
                *self.fill_ml.write().await = 0.0;
            }
            "stop_pump" => {}
            other => return Err(unsupported(&self.id, other)),
        }
        Ok(DeviceResponse::Flag(true))
    }

    async fn shutdown(&self) -> AppResult<()> {
        self.lease.lock().unwrap_or_else(|e| e.into_inner()).take();
        Ok(())
    }
}

// =============================================================================
// SimulatedDls - DLS Analyzer
// =============================================================================

/// Simulated DLS analyzer.
pub struct SimulatedDls {
    setup: RwLock<Option<u64>>,
    run_time: Duration,
    requests: AtomicUsize,
}

impl SimulatedDls {
    /// Analyzer taking 20 ms per measurement run.
    pub fn new() -> Self {
        Self {
            setup: RwLock::new(None),
            run_time: Duration::from_millis(20),
            requests: AtomicUsize::new(0),
        }
    }

    /// Number of completed `request_data` calls.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Default for SimulatedDls {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceAdapter for SimulatedDls {
    fn name(&self) -> &str {
        "Simulated DLS"
    }

    async fn initialize(&self) -> AppResult<bool> {
        Ok(true)
    }

    async fn execute(&self, command: &DeviceCommand) -> AppResult<DeviceResponse> {
        match command.action.as_str() {
            "select_measurement_setup" => {
                *self.setup.write().await = Some(command.u64_param("id")?);
                Ok(DeviceResponse::Ack)
            }
            "set_zero" => Ok(DeviceResponse::Ack),
            "request_data" => {
                let runs = command.u64_param("num_of_runs")?;
                let save_path = command.str_param("save_path")?;
                if self.setup.read().await.is_none() {
                    return Err(RigError::request_failed(
                        "DLS",
                        "no measurement setup selected",
                    ));
                }
                for _ in 0..runs {
                    pause(self.run_time).await;
                }
                self.requests.fetch_add(1, Ordering::SeqCst);
                info!(runs, save_path, "Simulated DLS measurement finished");
                Ok(DeviceResponse::Flag(true))
            }
            other => Err(unsupported("DLS", other)),
        }
    }

    async fn shutdown(&self) -> AppResult<()> {
        Ok(())
    }
}

// =============================================================================
// SimulatedSpectrometer - UV-Vis
// =============================================================================

/// Simulated UV-Vis spectrometer.
///
/// With the shutter closed a measurement returns the flat dark level; with it
/// open it returns a lamp profile peaking in the middle of the detector.
pub struct SimulatedSpectrometer {
    pixels: usize,
    integration: Duration,
    shutter_closed: RwLock<bool>,
}

impl SimulatedSpectrometer {
    /// Spectrometer with 128 pixels.
    pub fn new(settings: &SpectrometerSettings) -> Self {
        Self {
            pixels: 128,
            integration: Duration::from_millis(settings.integration_time_ms),
            shutter_closed: RwLock::new(false),
        }
    }

    fn spectrum(&self, closed: bool) -> Vec<f64> {
        const DARK: f64 = 100.0;
        if closed {
            return vec![DARK; self.pixels];
        }
        let center = self.pixels as f64 / 2.0;
        let width = self.pixels as f64 / 6.0;
        (0..self.pixels)
            .map(|i| {
                let x = (i as f64 - center) / width;
                DARK + 4000.0 * (-x * x).exp()
            })
            .collect()
    }
}

#[async_trait]
impl DeviceAdapter for SimulatedSpectrometer {
    fn name(&self) -> &str {
        "Simulated UV-Vis"
    }

    async fn initialize(&self) -> AppResult<bool> {
        Ok(true)
    }

    async fn execute(&self, command: &DeviceCommand) -> AppResult<DeviceResponse> {
        match command.action.as_str() {
            "switch_shutter" => {
                *self.shutter_closed.write().await = command.bool_param("switch")?;
                Ok(DeviceResponse::Ack)
            }
            "measure" => {
                pause(self.integration).await;
                let closed = *self.shutter_closed.read().await;
                Ok(DeviceResponse::Spectrum(self.spectrum(closed)))
            }
            other => Err(unsupported("UV_Vis", other)),
        }
    }

    async fn shutdown(&self) -> AppResult<()> {
        Ok(())
    }
}

// =============================================================================
// SimulatedGantry - Bottle Transport
// =============================================================================

/// Simulated gantry recording every move.
pub struct SimulatedGantry {
    move_time: Duration,
    moves: Arc<RwLock<Vec<([f64; 2], [f64; 2])>>>,
}

impl SimulatedGantry {
    /// Gantry taking 50 ms per move.
    pub fn new() -> Self {
        Self::with_move_time(Duration::from_millis(50))
    }

    /// Gantry with a custom move time.
    pub fn with_move_time(move_time: Duration) -> Self {
        Self {
            move_time,
            moves: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// `(from, to)` of every move so far.
    pub async fn moves(&self) -> Vec<([f64; 2], [f64; 2])> {
        self.moves.read().await.clone()
    }
}

impl Default for SimulatedGantry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceAdapter for SimulatedGantry {
    fn name(&self) -> &str {
        "Simulated Gantry"
    }

    async fn initialize(&self) -> AppResult<bool> {
        Ok(true)
    }

    async fn execute(&self, command: &DeviceCommand) -> AppResult<DeviceResponse> {
        match command.action.as_str() {
            "move" => {
                let from = command.point_param("from")?;
                let to = command.point_param("to")?;
                pause(self.move_time).await;
                self.moves.write().await.push((from, to));
                Ok(DeviceResponse::Ack)
            }
            other => Err(unsupported("Gantry", other)),
        }
    }

    async fn shutdown(&self) -> AppResult<()> {
        Ok(())
    }
}

// =============================================================================
// ScriptedAdapter - Test Double
// =============================================================================

#[derive(Debug, Clone)]
enum Fault {
    Always(String),
    OnCall(usize, String),
}

/// Adapter with canned replies and injected faults.
///
/// Unscripted actions answer `Ack`. Every command is recorded.
///
/// ```rust,ignore
/// let dls = ScriptedAdapter::new("DLS")
///     .reply("request_data", DeviceResponse::Flag(true))
///     .fail_on_call("select_measurement_setup", 2, "Measurement Setup Selection Failed");
/// ```
pub struct ScriptedAdapter {
    name: String,
    replies: HashMap<String, DeviceResponse>,
    faults: HashMap<String, Fault>,
    delay: Duration,
    init_result: Option<bool>,
    shutdown_fails: bool,
    calls: Mutex<Vec<DeviceCommand>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    shutdowns: AtomicUsize,
}

impl ScriptedAdapter {
    /// Adapter that acknowledges everything.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            replies: HashMap::new(),
            faults: HashMap::new(),
            delay: Duration::ZERO,
            init_result: Some(true),
            shutdown_fails: false,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
        }
    }

    /// Answer `action` with `response`.
    pub fn reply(mut self, action: &str, response: DeviceResponse) -> Self {
        self.replies.insert(action.to_string(), response);
        self
    }

    /// Fail every `action` with `RequestFailed`.
    pub fn fail(mut self, action: &str, message: &str) -> Self {
        self.faults
            .insert(action.to_string(), Fault::Always(message.to_string()));
        self
    }

    /// Fail the `n`th call (from 1) of `action` with `RequestFailed`.
    pub fn fail_on_call(mut self, action: &str, n: usize, message: &str) -> Self {
        self.faults
            .insert(action.to_string(), Fault::OnCall(n, message.to_string()));
        self
    }

    /// Take `delay` for every command.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// `initialize` returns an error.
    pub fn fail_initialize(mut self) -> Self {
        self.init_result = None;
        self
    }

    /// `initialize` returns `Ok(false)`.
    pub fn refuse_initialize(mut self) -> Self {
        self.init_result = Some(false);
        self
    }

    /// `shutdown` returns an error.
    pub fn fail_shutdown(mut self) -> Self {
        self.shutdown_fails = true;
        self
    }

    /// All commands received, in order.
    pub fn calls(&self) -> Vec<DeviceCommand> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Actions received, in order.
    pub fn actions(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.action).collect()
    }

    /// How many times `action` was received.
    pub fn call_count(&self, action: &str) -> usize {
        self.calls().iter().filter(|c| c.action == action).count()
    }

    /// Highest number of commands executing at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// How many times `shutdown` was called.
    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self) -> AppResult<bool> {
        self.init_result
            .ok_or_else(|| RigError::request_failed(&self.name, "scripted initialization failure"))
    }

    async fn execute(&self, command: &DeviceCommand) -> AppResult<DeviceResponse> {
        let call_number = {
            let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
            calls.push(command.clone());
            calls.iter().filter(|c| c.action == command.action).count()
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        pause(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match self.faults.get(&command.action) {
            Some(Fault::Always(message)) => {
                return Err(RigError::request_failed(&self.name, message.as_str()))
            }
            Some(Fault::OnCall(n, message)) if *n == call_number => {
                return Err(RigError::request_failed(&self.name, message.as_str()))
            }
            _ => {}
        }

        Ok(self
            .replies
            .get(&command.action)
            .cloned()
            .unwrap_or(DeviceResponse::Ack))
    }

    async fn shutdown(&self) -> AppResult<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        if self.shutdown_fails {
            Err(RigError::request_failed(&self.name, "scripted shutdown failure"))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pump_settings() -> PumpSettings {
        PumpSettings {
            name: "Pump1".into(),
            pressure_limit: 5.0,
            inner_diameter_mm: 14.57,
            max_piston_stroke_mm: 60.0,
            flow: 0.05,
        }
    }

    #[test]
    fn test_arduino_reply_strings() {
        assert_eq!(
            SimulatedArduino::reply_for("cylinder2 retract").as_deref(),
            Some("Cylinder2 Retraction Finished")
        );
        assert_eq!(
            SimulatedArduino::reply_for("motor1 rotate").as_deref(),
            Some("Motor1 Rotation Finished")
        );
        assert!(SimulatedArduino::reply_for("motor3 rotate").is_none());
        assert!(SimulatedArduino::reply_for("motor1").is_none());
    }

    #[tokio::test]
    async fn test_arduino_homes_on_initialize() {
        let arduino = SimulatedArduino::with_motion_time(Duration::ZERO);
        assert!(arduino.initialize().await.unwrap());
        assert_eq!(arduino.actions().await.len(), 4);
    }

    #[tokio::test]
    async fn test_pumps_share_one_bus() {
        let bus = PumpBus::new("test");
        let pump1 = SimulatedPump::new("pump1", pump_settings(), bus.clone());
        let pump2 = SimulatedPump::new("pump2", pump_settings(), bus.clone());

        pump1.initialize().await.unwrap();
        pump2.initialize().await.unwrap();
        assert_eq!(bus.times_opened(), 1);
        assert_eq!(bus.lease_count(), 2);

        pump1.shutdown().await.unwrap();
        assert!(bus.is_open());
        pump2.shutdown().await.unwrap();
        assert!(!bus.is_open());
    }

    #[tokio::test]
    async fn test_pump_tracks_fill_level() {
        let pump = SimulatedPump::new("pump1", pump_settings(), PumpBus::new("test"))
            .with_dose_time(Duration::ZERO);
        let dispense = DeviceCommand::new("dispense")
            .with("volume", 0.5)
            .with("flow", 0.01);

        // Not initialized: no bus lease
        assert!(pump.execute(&dispense).await.is_err());

        pump.initialize().await.unwrap();
        let err = pump.execute(&dispense).await.unwrap_err();
        assert!(matches!(err, RigError::RequestFailed { .. }));

        pump.execute(
            &DeviceCommand::new("aspirate")
                .with("volume", 2.0)
                .with("flow", 0.05),
        )
        .await
        .unwrap();
        assert_eq!(
            pump.execute(&dispense).await.unwrap(),
            DeviceResponse::Flag(true)
        );
        assert!((pump.fill_level().await - 1.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_spectrometer_shutter() {
        let uv = SimulatedSpectrometer::new(&SpectrometerSettings {
            integration_time_ms: 0,
        });
        uv.execute(&DeviceCommand::new("switch_shutter").with("switch", true))
            .await
            .unwrap();
        let dark = uv
            .execute(&DeviceCommand::new("measure"))
            .await
            .unwrap()
            .into_spectrum()
            .unwrap();
        assert!(dark.iter().all(|v| *v == 100.0));

        uv.execute(&DeviceCommand::new("switch_shutter").with("switch", false))
            .await
            .unwrap();
        let reference = uv
            .execute(&DeviceCommand::new("measure"))
            .await
            .unwrap()
            .into_spectrum()
            .unwrap();
        assert!(reference[64] > 4000.0);
    }

    #[tokio::test]
    async fn test_dls_requires_setup() {
        let dls = SimulatedDls::new();
        let request = DeviceCommand::new("request_data")
            .with("num_of_runs", 1)
            .with("save_path", "out.csv");
        assert!(dls.execute(&request).await.is_err());

        dls.execute(&DeviceCommand::new("select_measurement_setup").with("id", 1))
            .await
            .unwrap();
        assert_eq!(dls.execute(&request).await.unwrap(), DeviceResponse::Flag(true));
        assert_eq!(dls.requests(), 1);
    }

    #[tokio::test]
    async fn test_scripted_fault_on_nth_call() {
        let adapter = ScriptedAdapter::new("Gantry").fail_on_call("move", 2, "blocked");
        let cmd = DeviceCommand::new("move");

        assert!(adapter.execute(&cmd).await.is_ok());
        assert!(adapter.execute(&cmd).await.is_err());
        assert!(adapter.execute(&cmd).await.is_ok());
        assert_eq!(adapter.call_count("move"), 3);
    }
}
