//! Device layer of the rig.
//!
//! - `adapter` - the [`DeviceAdapter`] contract and command/response types
//! - `manager` - [`HardwareManager`] routing commands to adapters
//! - `bus` - the shared pump bus
//! - `transport` - serial/TCP line transports for live adapters
//! - `arduino`, `dls`, `gantry` - live adapters
//! - `mock` - simulated adapters and the scripted test double
//! - `factory` - builds a manager from configuration

pub mod adapter;
pub mod arduino;
pub mod bus;
pub mod dls;
pub mod factory;
pub mod gantry;
pub mod manager;
pub mod mock;
pub mod transport;

pub use adapter::{DeviceAdapter, DeviceCommand, DeviceKind, DeviceResponse};
pub use bus::{BusLease, PumpBus};
pub use factory::{build_manager, enabled_devices};
pub use manager::{DeviceSlot, HardwareManager, InitReport};
