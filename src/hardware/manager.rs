//! Hardware manager: the one place the sequencer sends device commands to.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                     HardwareManager                       │
//! │  Pumps ─┬─ pump1   Arduino   DLS   Gantry   UV_Vis        │
//! │         ├─ pump2                                          │
//! │         └─ pump3   (pump group shares one PumpBus)        │
//! ├───────────────────────────────────────────────────────────┤
//! │                   DeviceAdapter trait                     │
//! ├───────────────────────────────────────────────────────────┤
//! │  live: ArduinoAdapter | DlsAdapter | GantryAdapter        │
//! │  simulated: Simulated* | ScriptedAdapter                  │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! Every adapter is stored behind an `Arc` so several commands from one
//! parallel action group can be in flight at once.
//!
//! A device whose `initialize()` reports failure or errors is marked
//! unavailable until the next `initialize_all`; commands to it fail with
//! [`RigError::DeviceUnavailable`] instead of reaching the adapter.

use crate::error::{AppResult, RigError};
use crate::hardware::adapter::{DeviceAdapter, DeviceCommand, DeviceKind, DeviceResponse};
use crate::hardware::bus::PumpBus;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

// =============================================================================
// Device Slots
// =============================================================================

/// What is registered under one device kind.
#[derive(Clone)]
pub enum DeviceSlot {
    /// One adapter
    Single(Arc<dyn DeviceAdapter>),
    /// Adapters addressed by sub-id (the pump group)
    Group(BTreeMap<String, Arc<dyn DeviceAdapter>>),
}

impl fmt::Debug for DeviceSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSlot::Single(adapter) => f.debug_tuple("Single").field(&adapter.name()).finish(),
            DeviceSlot::Group(members) => f
                .debug_tuple("Group")
                .field(&members.keys().collect::<Vec<_>>())
                .finish(),
        }
    }
}

// =============================================================================
// Initialization Report
// =============================================================================

/// Outcome of [`HardwareManager::initialize_all`].
///
/// Keys are the device name, or `Pumps/<id>` for group members.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitReport {
    /// Success per device
    pub results: BTreeMap<String, bool>,
}

impl InitReport {
    /// Devices that failed to initialize.
    pub fn failed(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|(_, ok)| !**ok)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Whether every device initialized.
    pub fn all_ok(&self) -> bool {
        self.results.values().all(|ok| *ok)
    }
}

impl fmt::Display for InitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, ok) in &self.results {
            writeln!(f, "{:<16} {}", name, if *ok { "ok" } else { "FAILED" })?;
        }
        Ok(())
    }
}

// =============================================================================
// HardwareManager
// =============================================================================

/// Owns every adapter of the rig and routes commands to them.
pub struct HardwareManager {
    devices: BTreeMap<DeviceKind, DeviceSlot>,
    pump_bus: Arc<PumpBus>,
    /// Report names (`DLS`, `Pumps/pump2`) of devices that failed to initialize
    unavailable: RwLock<BTreeSet<String>>,
}

impl HardwareManager {
    /// Empty manager owning `pump_bus`.
    pub fn new(pump_bus: Arc<PumpBus>) -> Self {
        Self {
            devices: BTreeMap::new(),
            pump_bus,
            unavailable: RwLock::new(BTreeSet::new()),
        }
    }

    /// The shared pump bus, for constructing pump adapters.
    pub fn pump_bus(&self) -> Arc<PumpBus> {
        Arc::clone(&self.pump_bus)
    }

    /// Register a single adapter, replacing any previous one.
    pub fn register(&mut self, kind: DeviceKind, adapter: Arc<dyn DeviceAdapter>) {
        debug!(device = %kind, adapter = adapter.name(), "Registering device");
        self.devices.insert(kind, DeviceSlot::Single(adapter));
    }

    /// Register one pump of the pump group.
    pub fn register_pump(&mut self, id: impl Into<String>, adapter: Arc<dyn DeviceAdapter>) {
        let id = id.into();
        debug!(pump = %id, adapter = adapter.name(), "Registering pump");
        match self.devices.get_mut(&DeviceKind::Pumps) {
            Some(DeviceSlot::Group(members)) => {
                members.insert(id, adapter);
            }
            _ => {
                let mut members = BTreeMap::new();
                members.insert(id, adapter);
                self.devices.insert(DeviceKind::Pumps, DeviceSlot::Group(members));
            }
        }
    }

    /// Whether a device kind is registered.
    pub fn contains(&self, kind: DeviceKind) -> bool {
        self.devices.contains_key(&kind)
    }

    /// Registered pump ids.
    pub fn pump_ids(&self) -> Vec<String> {
        match self.devices.get(&DeviceKind::Pumps) {
            Some(DeviceSlot::Group(members)) => members.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Whether `name` (as reported by [`InitReport`]) failed to initialize.
    pub fn is_unavailable(&self, name: &str) -> bool {
        self.unavailable
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(name)
    }

    /// Initialize every device in turn.
    ///
    /// A failure or error marks that device `false` and unavailable, then
    /// moves on; it never aborts the remaining initializations.
    pub async fn initialize_all(&self) -> InitReport {
        let mut report = InitReport::default();
        for (kind, slot) in &self.devices {
            match slot {
                DeviceSlot::Single(adapter) => {
                    let ok = Self::initialize_one(kind.as_str(), adapter.as_ref()).await;
                    report.results.insert(kind.to_string(), ok);
                }
                DeviceSlot::Group(members) => {
                    for (id, adapter) in members {
                        let name = format!("{kind}/{id}");
                        let ok = Self::initialize_one(&name, adapter.as_ref()).await;
                        report.results.insert(name, ok);
                    }
                }
            }
        }

        let failed = report.failed();
        *self.unavailable.write().unwrap_or_else(|e| e.into_inner()) =
            failed.iter().cloned().collect();

        if report.all_ok() {
            info!(devices = report.results.len(), "All hardware initialized");
        } else {
            warn!(?failed, "Hardware initialized with failures");
        }
        report
    }

    async fn initialize_one(name: &str, adapter: &dyn DeviceAdapter) -> bool {
        match adapter.initialize().await {
            Ok(true) => {
                info!(device = name, "Initialized");
                true
            }
            Ok(false) => {
                warn!(device = name, "Initialization reported failure");
                false
            }
            Err(e) => {
                warn!(device = name, error = %e, "Initialization failed");
                false
            }
        }
    }

    /// Resolve the adapter for `kind` (and `sub_id` for the pump group).
    pub fn adapter(&self, kind: DeviceKind, sub_id: Option<&str>) -> AppResult<Arc<dyn DeviceAdapter>> {
        match (self.devices.get(&kind), sub_id) {
            (None, _) => Err(RigError::DeviceNotFound(kind.to_string())),
            (Some(DeviceSlot::Single(adapter)), _) => Ok(Arc::clone(adapter)),
            (Some(DeviceSlot::Group(members)), Some(id)) => members
                .get(id)
                .cloned()
                .ok_or_else(|| RigError::DeviceNotFound(format!("{kind}/{id}"))),
            (Some(DeviceSlot::Group(_)), None) => Err(RigError::InvalidParameter(format!(
                "{kind} commands need a member id"
            ))),
        }
    }

    /// Send one command and wait for its result.
    pub async fn execute_command(
        &self,
        kind: DeviceKind,
        command: &DeviceCommand,
        sub_id: Option<&str>,
    ) -> AppResult<DeviceResponse> {
        let adapter = self.adapter(kind, sub_id)?;
        let name = match sub_id {
            Some(id) if kind == DeviceKind::Pumps => format!("{kind}/{id}"),
            _ => kind.to_string(),
        };
        if self.is_unavailable(&name) {
            warn!(device = %name, action = %command.action, "Refusing command to unavailable device");
            return Err(RigError::DeviceUnavailable(name));
        }
        debug!(device = %kind, sub_id, action = %command.action, "Executing command");
        adapter.execute(command).await
    }

    /// Shut every device down, continuing past failures.
    pub async fn shutdown_all(&self) -> AppResult<()> {
        let mut errors = Vec::new();
        for (kind, slot) in &self.devices {
            let adapters: Vec<(String, &Arc<dyn DeviceAdapter>)> = match slot {
                DeviceSlot::Single(adapter) => vec![(kind.to_string(), adapter)],
                DeviceSlot::Group(members) => members
                    .iter()
                    .map(|(id, adapter)| (format!("{kind}/{id}"), adapter))
                    .collect(),
            };
            for (name, adapter) in adapters {
                if let Err(e) = adapter.shutdown().await {
                    warn!(device = %name, error = %e, "Shutdown failed");
                    errors.push(e);
                }
            }
        }

        if errors.is_empty() {
            info!("All hardware shut down");
            Ok(())
        } else {
            Err(RigError::ShutdownFailed(errors))
        }
    }
}

impl fmt::Debug for HardwareManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HardwareManager")
            .field("devices", &self.devices)
            .field("unavailable", &self.unavailable)
            .finish()
    }
}
