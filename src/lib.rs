//! # MF Rig Core Library
//!
//! This crate is the core library for the `mf-rig` application, which drives a
//! microfluidic sample-preparation and measurement rig: syringe pumps dose
//! liquids into bottles, a gantry and two turntables move the bottles between
//! stations, and UV-Vis and DLS instruments measure the result. Keeping the
//! logic in a library lets the CLI (`main.rs`) and the integration tests share
//! it.
//!
//! ## Crate Structure
//!
//! - **`config`**: Settings loaded from TOML and `MF_RIG_` environment
//!   variables with `figment`, plus semantic validation. See `config::Settings`.
//! - **`error`**: The `RigError` enum and `AppResult` alias used everywhere.
//! - **`experiment`**: The cycle sequencer. Stage tables for the three
//!   variants, the per-stage boundary conditions, the parallel action
//!   dispatcher, the `Rig` performing operations, and the `Experiment` wrapper
//!   that selects a variant and writes run records.
//! - **`hardware`**: The `DeviceAdapter` contract, the `HardwareManager`, the
//!   shared pump bus, live adapters for the Arduino, DLS analyzer and gantry,
//!   and simulated adapters for every device.
//! - **`logging`**: `tracing-subscriber` setup with pretty, compact and JSON
//!   output.

pub mod config;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod logging;

pub use error::{AppResult, RigError};
