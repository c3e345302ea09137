//! Run records: what a run did, written as JSON when it ends.
//!
//! Records go to `<output_dir>/run_<run_id>.json` and can be loaded back for
//! inspection.

use crate::error::AppResult;
use crate::experiment::stage::StageId;
use crate::experiment::variant::Variant;
use crate::hardware::InitReport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Instrument a measurement was taken with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeasurementKind {
    /// UV-Vis spectrometer
    #[serde(rename = "UV")]
    Uv,
    /// DLS analyzer
    #[serde(rename = "DLS")]
    Dls,
}

/// Dark, reference and sample spectra of one UV-Vis measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UvSpectra {
    /// Shutter closed
    pub dark: Vec<f64>,
    /// Shutter open, no sample
    pub reference: Vec<f64>,
    /// Shutter open, sample in the beam
    pub sample: Vec<f64>,
}

impl UvSpectra {
    /// Absorbance per pixel, `-log10((S - D) / (R - D))`.
    ///
    /// Pixels where either difference is not positive yield `NaN`.
    pub fn absorbance(&self) -> Vec<f64> {
        self.sample
            .iter()
            .zip(&self.reference)
            .zip(&self.dark)
            .map(|((s, r), d)| {
                let (signal, reference) = (s - d, r - d);
                if signal > 0.0 && reference > 0.0 {
                    -(signal / reference).log10()
                } else {
                    f64::NAN
                }
            })
            .collect()
    }
}

/// One measurement taken during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    /// Instrument used
    pub kind: MeasurementKind,
    /// 1-based bottle number, counted per instrument
    pub sample: usize,
    /// When the measurement finished
    pub taken_at: DateTime<Utc>,
    /// Whether the instrument reported success
    pub succeeded: bool,
    /// Spectra, for UV measurements
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spectra: Option<UvSpectra>,
    /// Data file written by the analyzer, for DLS measurements
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_path: Option<String>,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    /// A terminal stage was reached
    Completed,
    /// Stopped from outside before a terminal stage
    Stopped {
        /// Stage the run was in
        stage: StageId,
    },
    /// A stage action failed
    Failed {
        /// Stage whose action failed
        stage: StageId,
        /// Error message
        error: String,
    },
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Completed => write!(f, "completed"),
            RunOutcome::Stopped { stage } => write!(f, "stopped in {stage}"),
            RunOutcome::Failed { stage, error } => write!(f, "failed in {stage}: {error}"),
        }
    }
}

/// Everything worth keeping about one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Unique run identifier
    pub run_id: String,
    /// Variant that ran
    pub variant: Variant,
    /// Configured number of bottles
    pub bottle_capacity: usize,
    /// Bottles still on the tray when the run ended
    pub bottles_remaining: usize,
    /// Whether devices were bypassed
    pub dry_run: bool,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// When the run ended
    pub finished_at: DateTime<Utc>,
    /// Stages in the order they were entered
    pub visited_stages: Vec<StageId>,
    /// Hardware initialization results
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_report: Option<InitReport>,
    /// Measurements in the order they were taken
    pub measurements: Vec<MeasurementRecord>,
    /// How the run ended
    pub outcome: RunOutcome,
}

impl RunRecord {
    /// `run_<run_id>.json`
    pub fn default_filename(&self) -> String {
        format!("run_{}.json", self.run_id)
    }

    /// Write to `dir`, creating it if needed. Returns the file path.
    pub fn save(&self, dir: &Path) -> AppResult<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(self.default_filename());
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }

    /// Load a record written by [`RunRecord::save`].
    pub fn load(path: &Path) -> AppResult<Self> {
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }
}
