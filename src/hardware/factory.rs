//! Builds the [`HardwareManager`] from configuration.

use crate::config::{HardwareSettings, SpectrometerSettings};
use crate::error::{AppResult, RigError};
use crate::hardware::adapter::DeviceKind;
use crate::hardware::arduino::ArduinoAdapter;
use crate::hardware::bus::PumpBus;
use crate::hardware::dls::DlsAdapter;
use crate::hardware::gantry::GantryAdapter;
use crate::hardware::manager::HardwareManager;
use crate::hardware::mock::{
    SimulatedArduino, SimulatedDls, SimulatedGantry, SimulatedPump, SimulatedSpectrometer,
};
use crate::hardware::transport::Endpoint;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Device kinds named in `settings.devices`, or every kind when the list is
/// empty. Unknown names are skipped with a warning.
pub fn enabled_devices(settings: &HardwareSettings) -> BTreeSet<DeviceKind> {
    if settings.devices.is_empty() {
        return DeviceKind::ALL.into_iter().collect();
    }
    settings
        .devices
        .iter()
        .filter_map(|name| match name.parse::<DeviceKind>() {
            Ok(kind) => Some(kind),
            Err(_) => {
                warn!(device = %name, "Unknown device name; skipping");
                None
            }
        })
        .collect()
}

/// Create a manager with one adapter per enabled device.
///
/// With `simulate` set every device is simulated. Otherwise the Arduino, DLS
/// analyzer and gantry get live adapters; the pumps and the spectrometer are
/// always simulated.
pub fn build_manager(settings: &HardwareSettings) -> AppResult<HardwareManager> {
    let enabled = enabled_devices(settings);
    let bus = PumpBus::new(settings.pump_bus.device_config.clone());
    let mut manager = HardwareManager::new(Arc::clone(&bus));

    if enabled.contains(&DeviceKind::Pumps) {
        for (id, pump) in &settings.pumps {
            manager.register_pump(
                id.clone(),
                Arc::new(SimulatedPump::new(id.clone(), pump.clone(), Arc::clone(&bus))),
            );
        }
    }

    if enabled.contains(&DeviceKind::UvVis) {
        let spectrometer = settings
            .uv_vis
            .clone()
            .unwrap_or(SpectrometerSettings {
                integration_time_ms: 100,
            });
        manager.register(
            DeviceKind::UvVis,
            Arc::new(SimulatedSpectrometer::new(&spectrometer)),
        );
    }

    if settings.simulate {
        if enabled.contains(&DeviceKind::Arduino) {
            manager.register(DeviceKind::Arduino, Arc::new(SimulatedArduino::new()));
        }
        if enabled.contains(&DeviceKind::Dls) {
            manager.register(DeviceKind::Dls, Arc::new(SimulatedDls::new()));
        }
        if enabled.contains(&DeviceKind::Gantry) {
            manager.register(DeviceKind::Gantry, Arc::new(SimulatedGantry::new()));
        }
        info!(devices = enabled.len(), pumps = settings.pumps.len(), "Using simulated hardware");
        return Ok(manager);
    }

    warn!("Pumps and UV-Vis have no live driver; they stay simulated");

    if enabled.contains(&DeviceKind::Arduino) {
        let arduino = settings
            .arduino
            .as_ref()
            .ok_or_else(|| missing("arduino"))?;
        manager.register(
            DeviceKind::Arduino,
            Arc::new(
                ArduinoAdapter::new(Endpoint::Serial {
                    port: arduino.port.clone(),
                    baud_rate: arduino.baud_rate,
                })
                .with_timeout(Duration::from_millis(arduino.timeout_ms)),
            ),
        );
    }

    if enabled.contains(&DeviceKind::Dls) {
        let dls = settings.dls.as_ref().ok_or_else(|| missing("dls"))?;
        manager.register(
            DeviceKind::Dls,
            Arc::new(
                DlsAdapter::new(Endpoint::Serial {
                    port: dls.port.clone(),
                    baud_rate: dls.baud_rate,
                })
                .with_timeout(Duration::from_millis(dls.timeout_ms))
                .with_run_timeout(Duration::from_millis(dls.run_timeout_ms)),
            ),
        );
    }

    if enabled.contains(&DeviceKind::Gantry) {
        let gantry = settings.gantry.as_ref().ok_or_else(|| missing("gantry"))?;
        manager.register(
            DeviceKind::Gantry,
            Arc::new(
                GantryAdapter::new(gantry.host.clone(), gantry.port)
                    .with_timeout(Duration::from_millis(gantry.timeout_ms)),
            ),
        );
    }

    Ok(manager)
}

fn missing(section: &str) -> RigError {
    RigError::Configuration(format!("[hardware.{section}] is required for live hardware"))
}
