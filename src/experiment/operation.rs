//! Physical operations of the rig and the [`Rig`] that performs them.
//!
//! ```text
//!        tray ──TrayToPump──> pump station ──PumpToMeasure──> measure station
//!         ▲ ▲                   │ FillBottle                    │ MeasureUv, MeasureDls
//!         │ └────PumpToTray─────┘                               │
//!         ├──────────────────────────MeasureToTray──────────────┘
//!         └──────────────────────────TrayToMeasure──────────────>
//! ```
//!
//! Stations sit on turntables (`RotatePumpTable`, `RotateMeasureTable`).
//! Rotations return the Arduino's completion string as feedback.

use crate::config::{InitFailurePolicy, LayoutSettings, MeasurementSettings, Point, Settings};
use crate::error::{AppResult, RigError};
use crate::experiment::dispatcher::dispatch_all;
use crate::experiment::record::{MeasurementKind, MeasurementRecord, UvSpectra};
use crate::experiment::samples::SampleConfig;
use crate::hardware::{DeviceCommand, DeviceKind, DeviceResponse, HardwareManager, InitReport};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info};

/// Feedback text returned by rotations in dry-run mode.
pub const DRY_RUN_FEEDBACK: &str = "dry-run";

/// One physical step a stage can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// Next bottle from the tray to the pump station
    TrayToPump,
    /// Bottle from the pump station to the measure station
    PumpToMeasure,
    /// Bottle from the measure station back to its tray slot
    MeasureToTray,
    /// Bottle from the pump station back to its tray slot
    PumpToTray,
    /// Next bottle from the tray to the measure station
    TrayToMeasure,
    /// Turn the pump-station table one position
    RotatePumpTable,
    /// Turn the measure-station table one position
    RotateMeasureTable,
    /// Dose the next sample recipe
    FillBottle,
    /// UV-Vis dark, reference and sample spectra
    MeasureUv,
    /// DLS measurement
    MeasureDls,
}

impl Operation {
    /// Whether this is a turntable rotation.
    pub fn is_rotation(&self) -> bool {
        matches!(self, Operation::RotatePumpTable | Operation::RotateMeasureTable)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::TrayToPump => "tray_to_pump",
            Operation::PumpToMeasure => "pump_to_measure",
            Operation::MeasureToTray => "measure_to_tray",
            Operation::PumpToTray => "pump_to_tray",
            Operation::TrayToMeasure => "tray_to_measure",
            Operation::RotatePumpTable => "rotate_pump_table",
            Operation::RotateMeasureTable => "rotate_measure_table",
            Operation::FillBottle => "fill_bottle",
            Operation::MeasureUv => "measure_uv",
            Operation::MeasureDls => "measure_dls",
        };
        f.write_str(name)
    }
}

/// Tray slots: free ones waiting to be picked, and the slots of bottles in
/// flight, oldest first.
#[derive(Debug, Default)]
struct TrayLedger {
    waiting: VecDeque<Point>,
    in_flight: VecDeque<Point>,
}

/// Performs [`Operation`]s against the hardware.
///
/// Shared between the sequencer and the members of a parallel group, so all
/// mutable state sits behind atomics or short-lived locks.
pub struct Rig {
    hardware: Arc<HardwareManager>,
    layout: LayoutSettings,
    measurement: MeasurementSettings,
    samples: SampleConfig,
    pump_flows: BTreeMap<String, f64>,
    dry_run: bool,
    prime_pumps: bool,
    on_init_failure: InitFailurePolicy,
    tray: Mutex<TrayLedger>,
    filled: AtomicUsize,
    uv_measured: AtomicUsize,
    dls_measured: AtomicUsize,
    measurements: Mutex<Vec<MeasurementRecord>>,
}

impl Rig {
    /// Rig over `hardware` using the layout, measurement and sequencer
    /// settings from `settings`.
    pub fn new(hardware: Arc<HardwareManager>, settings: &Settings, samples: SampleConfig) -> Self {
        Self {
            hardware,
            layout: settings.layout.clone(),
            measurement: settings.measurement.clone(),
            samples,
            pump_flows: settings
                .hardware
                .pumps
                .iter()
                .map(|(id, pump)| (id.clone(), pump.flow))
                .collect(),
            dry_run: settings.sequencer.dry_run,
            prime_pumps: settings.sequencer.prime_pumps,
            on_init_failure: settings.sequencer.on_init_failure,
            tray: Mutex::new(TrayLedger {
                waiting: settings.layout.tray.iter().copied().collect(),
                in_flight: VecDeque::new(),
            }),
            filled: AtomicUsize::new(0),
            uv_measured: AtomicUsize::new(0),
            dls_measured: AtomicUsize::new(0),
            measurements: Mutex::new(Vec::new()),
        }
    }

    /// Override whether pumps are primed during initialization.
    pub fn with_priming(mut self, prime_pumps: bool) -> Self {
        self.prime_pumps = prime_pumps;
        self
    }

    /// The hardware manager.
    pub fn hardware(&self) -> &Arc<HardwareManager> {
        &self.hardware
    }

    /// Whether devices are bypassed.
    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// The sample recipe.
    pub fn samples(&self) -> &SampleConfig {
        &self.samples
    }

    /// Bottles filled so far.
    pub fn bottles_filled(&self) -> usize {
        self.filled.load(Ordering::SeqCst)
    }

    /// Measurements taken so far.
    pub fn measurements(&self) -> Vec<MeasurementRecord> {
        self.measurements
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    /// Initialize every device, apply the failure policy and prime the pumps
    /// if configured.
    pub async fn initialize(&self) -> AppResult<InitReport> {
        if self.dry_run {
            info!("Dry run: skipping hardware initialization");
            return Ok(InitReport::default());
        }

        let report = self.hardware.initialize_all().await;
        if !report.all_ok() && self.on_init_failure == InitFailurePolicy::Abort {
            return Err(RigError::InitializationFailed(report.failed()));
        }
        if self.prime_pumps {
            self.prepare_pumps().await?;
        }
        Ok(report)
    }

    /// Shut every device down. Nothing to do in dry-run mode.
    pub async fn shutdown(&self) -> AppResult<()> {
        if self.dry_run {
            return Ok(());
        }
        self.hardware.shutdown_all().await
    }

    /// Perform one operation. Rotations return their feedback text.
    pub async fn perform(&self, operation: Operation) -> AppResult<Option<String>> {
        if self.dry_run {
            debug!(%operation, "Dry run");
            return Ok(operation
                .is_rotation()
                .then(|| DRY_RUN_FEEDBACK.to_string()));
        }

        let result = match operation {
            Operation::TrayToPump => self.from_tray(self.layout.pump_station).await,
            Operation::TrayToMeasure => self.from_tray(self.layout.measure_station).await,
            Operation::PumpToMeasure => {
                self.move_bottle(self.layout.pump_station, self.layout.measure_station)
                    .await
            }
            Operation::MeasureToTray => self.to_tray(self.layout.measure_station).await,
            Operation::PumpToTray => self.to_tray(self.layout.pump_station).await,
            Operation::RotatePumpTable => return self.rotate("motor1 rotate", operation).await,
            Operation::RotateMeasureTable => return self.rotate("motor2 rotate", operation).await,
            Operation::FillBottle => self.fill_bottle().await,
            Operation::MeasureUv => self.measure_uv().await,
            Operation::MeasureDls => self.measure_dls().await,
        };
        result.map(|_| None).map_err(|e| {
            error!(%operation, error = %e, "Operation failed");
            e
        })
    }

    async fn rotate(&self, action: &str, operation: Operation) -> AppResult<Option<String>> {
        let reply = self
            .hardware
            .execute_command(DeviceKind::Arduino, &DeviceCommand::new(action), None)
            .await
            .map_err(|e| {
                error!(%operation, error = %e, "Operation failed");
                e
            })?;
        let feedback = reply.as_text().map(str::trim).unwrap_or_default();
        debug!(%operation, feedback, "Rotation finished");
        Ok((!feedback.is_empty()).then(|| feedback.to_string()))
    }

    // =========================================================================
    // Transport
    // =========================================================================

    async fn move_bottle(&self, from: Point, to: Point) -> AppResult<()> {
        let command = DeviceCommand::new("move")
            .with("from", from.to_vec())
            .with("to", to.to_vec());
        self.hardware
            .execute_command(DeviceKind::Gantry, &command, None)
            .await?;
        Ok(())
    }

    async fn from_tray(&self, station: Point) -> AppResult<()> {
        let slot = {
            let mut tray = self.lock_tray()?;
            let slot = tray.waiting.pop_front().ok_or_else(|| {
                RigError::Configuration("no bottle left on the tray layout".to_string())
            })?;
            tray.in_flight.push_back(slot);
            slot
        };
        self.move_bottle(slot, station).await
    }

    async fn to_tray(&self, station: Point) -> AppResult<()> {
        let slot = self.lock_tray()?.in_flight.pop_front().ok_or_else(|| {
            RigError::Configuration("no bottle in flight to return".to_string())
        })?;
        self.move_bottle(station, slot).await
    }

    fn lock_tray(&self) -> AppResult<std::sync::MutexGuard<'_, TrayLedger>> {
        self.tray
            .lock()
            .map_err(|_| RigError::Dispatch("tray ledger lock poisoned".to_string()))
    }

    // =========================================================================
    // Dosing
    // =========================================================================

    /// Dose the next sample. Each pump's share is dispensed in parallel.
    pub async fn fill_bottle(&self) -> AppResult<()> {
        let index = self.filled.fetch_add(1, Ordering::SeqCst) + 1;
        let doses = self.samples.doses(index)?;
        info!(sample = index, pumps = doses.len(), "Filling bottle");

        let dispenses: Vec<_> = doses
            .into_iter()
            .map(|dose| {
                let hardware = Arc::clone(&self.hardware);
                async move {
                    let command = DeviceCommand::new("dispense")
                        .with("volume", dose.volume)
                        .with("flow", dose.flow);
                    hardware
                        .execute_command(DeviceKind::Pumps, &command, Some(dose.pump.as_str()))
                        .await
                }
            })
            .collect();
        dispatch_all(dispenses).await?;
        Ok(())
    }

    /// Aspirate every pump's total recipe volume, in parallel.
    pub async fn prepare_pumps(&self) -> AppResult<BTreeMap<String, f64>> {
        let volumes = self.samples.pump_volumes()?;
        let mut aspirations = Vec::new();
        for (pump, volume) in &volumes {
            if *volume <= 0.0 {
                continue;
            }
            let flow = *self
                .pump_flows
                .get(pump)
                .ok_or_else(|| RigError::DeviceNotFound(format!("{}/{pump}", DeviceKind::Pumps)))?;
            let command = DeviceCommand::new("aspirate")
                .with("volume", *volume)
                .with("flow", flow);
            let hardware = Arc::clone(&self.hardware);
            let pump = pump.clone();
            aspirations.push(async move {
                hardware
                    .execute_command(DeviceKind::Pumps, &command, Some(pump.as_str()))
                    .await
            });
        }
        info!(pumps = aspirations.len(), "Priming pumps");
        dispatch_all(aspirations).await?;
        Ok(volumes)
    }

    // =========================================================================
    // Measurement
    // =========================================================================

    async fn arduino(&self, action: &str) -> AppResult<DeviceResponse> {
        self.hardware
            .execute_command(DeviceKind::Arduino, &DeviceCommand::new(action), None)
            .await
    }

    async fn arduino_expect(&self, action: &str, expected: &str) -> AppResult<()> {
        let reply = self.arduino(action).await?;
        match reply.as_text().map(str::trim) {
            Some(text) if text == expected => Ok(()),
            other => Err(RigError::request_failed(
                DeviceKind::Arduino.as_str(),
                format!("'{action}' answered {:?}, expected '{expected}'", other.unwrap_or("")),
            )),
        }
    }

    async fn spectrum(&self) -> AppResult<Vec<f64>> {
        let reply = self
            .hardware
            .execute_command(DeviceKind::UvVis, &DeviceCommand::new("measure"), None)
            .await?;
        reply
            .into_spectrum()
            .ok_or_else(|| RigError::unexpected(DeviceKind::UvVis.as_str(), "no spectrum"))
    }

    async fn shutter(&self, closed: bool) -> AppResult<()> {
        let command = DeviceCommand::new("switch_shutter").with("switch", closed);
        self.hardware
            .execute_command(DeviceKind::UvVis, &command, None)
            .await?;
        tokio::time::sleep(Duration::from_millis(self.measurement.shutter_settle_ms)).await;
        Ok(())
    }

    /// Dark, reference and sample spectrum of the bottle at the measure
    /// station.
    pub async fn measure_uv(&self) -> AppResult<()> {
        let sample = self.uv_measured.fetch_add(1, Ordering::SeqCst) + 1;

        self.shutter(true).await?;
        let dark = self.spectrum().await?;
        self.shutter(false).await?;
        let reference = self.spectrum().await?;

        self.arduino_expect("cylinder1 retract", "Cylinder1 Retraction Finished")
            .await?;
        let spectrum = self.spectrum().await?;
        self.arduino("cylinder1 extend").await?;

        info!(sample, "UV-Vis measurement finished");
        self.record(MeasurementRecord {
            kind: MeasurementKind::Uv,
            sample,
            taken_at: Utc::now(),
            succeeded: true,
            spectra: Some(UvSpectra {
                dark,
                reference,
                sample: spectrum,
            }),
            save_path: None,
        });
        Ok(())
    }

    /// DLS measurement of the bottle at the measure station.
    ///
    /// The probe is only extended again after a successful measurement.
    pub async fn measure_dls(&self) -> AppResult<()> {
        let sample = self.dls_measured.fetch_add(1, Ordering::SeqCst) + 1;
        let save_path = PathBuf::from(&self.measurement.dls_save_dir)
            .join(format!("sample_{sample}.csv"))
            .to_string_lossy()
            .into_owned();

        self.arduino_expect("cylinder2 retract", "Cylinder2 Retraction Finished")
            .await?;

        let select = DeviceCommand::new("select_measurement_setup")
            .with("id", self.measurement.dls_setup_id);
        self.hardware
            .execute_command(DeviceKind::Dls, &select, None)
            .await?;

        let request = DeviceCommand::new("request_data")
            .with("num_of_runs", self.measurement.dls_runs)
            .with("save_path", save_path.as_str());
        let succeeded = self
            .hardware
            .execute_command(DeviceKind::Dls, &request, None)
            .await?
            .succeeded();

        if succeeded {
            self.arduino("cylinder2 extend").await?;
        }

        info!(sample, succeeded, path = %save_path, "DLS measurement finished");
        self.record(MeasurementRecord {
            kind: MeasurementKind::Dls,
            sample,
            taken_at: Utc::now(),
            succeeded,
            spectra: None,
            save_path: Some(save_path),
        });
        Ok(())
    }

    fn record(&self, measurement: MeasurementRecord) {
        if let Ok(mut measurements) = self.measurements.lock() {
            measurements.push(measurement);
        }
    }
}

impl fmt::Debug for Rig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rig")
            .field("hardware", &self.hardware)
            .field("dry_run", &self.dry_run)
            .field("filled", &self.bottles_filled())
            .finish()
    }
}
