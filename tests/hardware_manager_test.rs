//! Hardware manager built from configuration.

use mf_rig::config::HardwareSettings;
use mf_rig::hardware::mock::ScriptedAdapter;
use mf_rig::hardware::{build_manager, DeviceCommand, DeviceKind, DeviceResponse};
use mf_rig::RigError;
use std::sync::Arc;

#[tokio::test]
async fn simulated_manager_initializes_every_device() {
    let hw = build_manager(&HardwareSettings::default()).unwrap();
    let report = hw.initialize_all().await;

    assert!(report.all_ok());
    for name in ["Arduino", "DLS", "Gantry", "UV_Vis", "Pumps/pump1", "Pumps/pump3"] {
        assert!(report.results.contains_key(name), "{name} missing from report");
    }
    assert!(report.to_string().contains("Pumps/pump2"));

    hw.shutdown_all().await.unwrap();
}

#[tokio::test]
async fn pump_bus_is_shared_and_released() {
    let hw = build_manager(&HardwareSettings::default()).unwrap();
    let bus = hw.pump_bus();
    assert!(!bus.is_open());

    hw.initialize_all().await;
    assert_eq!(bus.lease_count(), 3);
    assert_eq!(bus.times_opened(), 1);

    let aspirate = DeviceCommand::new("aspirate")
        .with("volume", 0.5)
        .with("flow", 0.1);
    let reply = hw
        .execute_command(DeviceKind::Pumps, &aspirate, Some("pump2"))
        .await
        .unwrap();
    assert_eq!(reply, DeviceResponse::Flag(true));

    hw.shutdown_all().await.unwrap();
    assert!(!bus.is_open());

    hw.initialize_all().await;
    assert_eq!(bus.times_opened(), 2);
    hw.shutdown_all().await.unwrap();
}

#[tokio::test]
async fn pump_commands_fail_before_initialize() {
    let hw = build_manager(&HardwareSettings::default()).unwrap();
    let dispense = DeviceCommand::new("dispense")
        .with("volume", 0.1)
        .with("flow", 0.1);

    let err = hw
        .execute_command(DeviceKind::Pumps, &dispense, Some("pump1"))
        .await
        .unwrap_err();
    assert!(matches!(err, RigError::RequestFailed { ref device, .. } if device == "pump1"));
}

#[test]
fn live_hardware_requires_connection_settings() {
    let settings = HardwareSettings {
        simulate: false,
        ..HardwareSettings::default()
    };
    let err = build_manager(&settings).unwrap_err();
    assert!(matches!(err, RigError::Configuration(ref m) if m.contains("arduino")));
}

#[tokio::test]
async fn registered_adapter_replaces_simulated_one() {
    let mut hw = build_manager(&HardwareSettings::default()).unwrap();
    let dls = Arc::new(ScriptedAdapter::new("DLS"));
    hw.register(DeviceKind::Dls, dls.clone());

    hw.execute_command(DeviceKind::Dls, &DeviceCommand::new("request_data"), None)
        .await
        .unwrap();
    assert_eq!(dls.actions(), vec!["request_data".to_string()]);
}

#[test]
fn device_kind_names_round_trip() {
    for kind in DeviceKind::ALL {
        assert_eq!(kind.as_str().parse::<DeviceKind>().unwrap(), kind);
    }
    assert_eq!("uv-vis".parse::<DeviceKind>().unwrap(), DeviceKind::UvVis);
    assert!(matches!(
        "spectrograph".parse::<DeviceKind>(),
        Err(RigError::DeviceNotFound(_))
    ));
}
