//! Experiment sequencing.
//!
//! - `stage` - stage names, triggers, guards and transition tables
//! - `variant` - full, dispense-only and measure-only pipelines
//! - `boundary` - per-stage plans keyed on bottle capacity
//! - `operation` - the [`Rig`] performing transports, dosing and measurements
//! - `dispatcher` - parallel action groups with join semantics
//! - `sequencer` - the state machine and its run loop
//! - `samples` - sample recipes
//! - `record` - run records
//! - `controller` - [`Experiment`], the variant selector and run wrapper

pub mod boundary;
pub mod controller;
pub mod dispatcher;
pub mod operation;
pub mod record;
pub mod samples;
pub mod sequencer;
pub mod stage;
pub mod variant;

pub use boundary::{StageFn, StagePlan};
pub use controller::Experiment;
pub use dispatcher::dispatch_all;
pub use operation::{Operation, Rig};
pub use record::{MeasurementKind, MeasurementRecord, RunOutcome, RunRecord};
pub use samples::SampleConfig;
pub use sequencer::{Sequencer, SequencerState, SequencerStatus, StopHandle};
pub use stage::{Guard, Phase, StageId, StageTable, Transition, Trigger};
pub use variant::Variant;
