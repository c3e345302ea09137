//! Experiment: a configured variant ready to run.
//!
//! [`Experiment::from_settings`] is the variant selector. It maps the
//! configured choice string to a [`Variant`], picks the stage table and the
//! bottle capacity, loads the sample recipe and wires a [`Sequencer`] to a
//! [`Rig`] over the hardware.

use crate::config::Settings;
use crate::error::AppResult;
use crate::experiment::operation::Rig;
use crate::experiment::record::{RunOutcome, RunRecord};
use crate::experiment::samples::SampleConfig;
use crate::experiment::sequencer::{Sequencer, SequencerStatus, StopHandle};
use crate::experiment::stage::StageTable;
use crate::experiment::variant::Variant;
use crate::hardware::{build_manager, HardwareManager};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

/// Volume per bottle of the built-in recipe, in millilitres.
pub const DEFAULT_BOTTLE_VOLUME_ML: f64 = 1.0;

/// Combined flow of the built-in recipe, in millilitres per second.
pub const DEFAULT_OUT_FLOW: f64 = 0.05;

/// A run, from variant selection to its record.
pub struct Experiment {
    run_id: String,
    settings: Settings,
    rig: Arc<Rig>,
    sequencer: Sequencer,
}

impl Experiment {
    /// Build the experiment with hardware created from the settings.
    pub fn from_settings(settings: Settings) -> AppResult<Self> {
        let hardware = build_manager(&settings.hardware)?;
        Self::with_hardware(settings, hardware)
    }

    /// Build the experiment over an existing hardware manager.
    pub fn with_hardware(settings: Settings, hardware: HardwareManager) -> AppResult<Self> {
        settings.validate()?;

        let variant = Variant::from_choice(&settings.sequencer.variant);
        let capacity = settings
            .sequencer
            .bottles
            .unwrap_or_else(|| variant.default_capacity());
        settings.validate_layout(capacity)?;

        let table = match &settings.sequencer.table_path {
            Some(path) => {
                info!(path = %path.display(), "Loading stage table");
                StageTable::load(path)?
            }
            None => variant.table(),
        };

        let samples = match &settings.samples_path {
            Some(path) => SampleConfig::load(path)?,
            None => SampleConfig::even_split(
                capacity,
                &hardware.pump_ids(),
                DEFAULT_BOTTLE_VOLUME_ML,
                DEFAULT_OUT_FLOW,
            ),
        };
        if variant.dispenses() && samples.num_samples < capacity {
            warn!(
                samples = samples.num_samples,
                bottles = capacity,
                "Recipe has fewer samples than bottles; the run will stop at the first missing sample"
            );
        }

        let rig = Arc::new(
            Rig::new(Arc::new(hardware), &settings, samples)
                .with_priming(settings.sequencer.prime_pumps && variant.dispenses()),
        );
        let sequencer = Sequencer::new(variant, Arc::new(table), capacity, Arc::clone(&rig))?
            .with_tick(settings.sequencer.tick());

        let run_id = Uuid::new_v4().to_string();
        info!(
            run_id = %run_id,
            variant = %variant,
            bottles = capacity,
            dry_run = settings.sequencer.dry_run,
            "Experiment ready"
        );

        Ok(Self {
            run_id,
            settings,
            rig,
            sequencer,
        })
    }

    /// Unique id of this run.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Selected variant.
    pub fn variant(&self) -> Variant {
        self.sequencer.variant()
    }

    /// The sequencer.
    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    /// The rig.
    pub fn rig(&self) -> &Arc<Rig> {
        &self.rig
    }

    /// Handle for stopping the run from another task.
    pub fn stop_handle(&self) -> StopHandle {
        self.sequencer.stop_handle()
    }

    /// Status updates of the running sequencer.
    pub fn subscribe(&self) -> watch::Receiver<SequencerStatus> {
        self.sequencer.subscribe()
    }

    /// Run to completion, stop or failure.
    ///
    /// Hardware is always shut down and the run record is always written to
    /// the output directory. A failed stage action is returned as the error
    /// after that, even when the record could not be written.
    pub async fn run(&mut self) -> AppResult<RunRecord> {
        let started_at = Utc::now();
        let result = self.sequencer.auto_run().await;

        if let Err(e) = self.rig.shutdown().await {
            warn!(error = %e, "Hardware shutdown reported errors");
        }

        let stage = self.sequencer.current_stage();
        let outcome = match &result {
            Err(e) => RunOutcome::Failed {
                stage,
                error: e.to_string(),
            },
            Ok(()) if self.sequencer.is_finished() => RunOutcome::Completed,
            Ok(()) => RunOutcome::Stopped { stage },
        };

        let record = RunRecord {
            run_id: self.run_id.clone(),
            variant: self.sequencer.variant(),
            bottle_capacity: self.sequencer.state().bottle_capacity,
            bottles_remaining: self.sequencer.bottles_remaining(),
            dry_run: self.rig.is_dry_run(),
            started_at,
            finished_at: Utc::now(),
            visited_stages: self.sequencer.history().to_vec(),
            init_report: self.sequencer.init_report().cloned(),
            measurements: self.rig.measurements(),
            outcome,
        };
        let saved = record.save(&self.settings.sequencer.output_dir);
        if let Ok(path) = &saved {
            info!(path = %path.display(), outcome = %record.outcome, "Run record written");
        }

        match (result, saved) {
            (Ok(()), Ok(_)) => Ok(record),
            (Ok(()), Err(e)) => Err(e),
            (Err(e), Ok(_)) => Err(e),
            (Err(e), Err(save_error)) => {
                warn!(error = %save_error, "Could not write run record for failed run");
                Err(e)
            }
        }
    }

    /// Initialize the hardware, aspirate the recipe volumes and shut down.
    pub async fn prime(&self) -> AppResult<BTreeMap<String, f64>> {
        let report = self.rig.hardware().initialize_all().await;
        if !report.all_ok() {
            warn!(failed = ?report.failed(), "Priming with failed devices");
        }
        let primed = self.rig.prepare_pumps().await;
        self.rig.hardware().shutdown_all().await?;
        primed
    }
}

impl std::fmt::Debug for Experiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Experiment")
            .field("run_id", &self.run_id)
            .field("sequencer", &self.sequencer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::stage::StageId;
    use crate::hardware::PumpBus;
    use tempfile::tempdir;

    fn settings(dir: &std::path::Path) -> Settings {
        let mut settings = Settings::default();
        settings.sequencer.dry_run = true;
        settings.sequencer.tick_ms = 1;
        settings.sequencer.output_dir = dir.to_path_buf();
        settings
    }

    #[test]
    fn test_variant_selection() {
        let dir = tempdir().unwrap();
        for (choice, variant, capacity) in [
            ("Full", Variant::Full, 5),
            ("Dispense Only", Variant::DispenseOnly, 5),
            ("Measure Only", Variant::MeasureOnly, 4),
            ("something else", Variant::Full, 5),
        ] {
            let mut settings = settings(dir.path());
            settings.sequencer.variant = choice.to_string();
            let experiment = Experiment::from_settings(settings).unwrap();
            assert_eq!(experiment.variant(), variant);
            assert_eq!(experiment.sequencer().state().bottle_capacity, capacity);
        }
    }

    #[test]
    fn test_table_override() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("table.yaml");
        std::fs::write(&path, Variant::MeasureOnly.table().to_yaml().unwrap()).unwrap();

        let mut settings = settings(dir.path());
        settings.sequencer.variant = "Measure Only".to_string();
        settings.sequencer.table_path = Some(path.clone());
        assert!(Experiment::from_settings(settings).is_ok());

        let mut settings = self::settings(dir.path());
        settings.sequencer.table_path = Some(path);
        settings.sequencer.variant = "Dispense Only".to_string();
        assert!(Experiment::from_settings(settings).is_err());
    }

    #[tokio::test]
    async fn test_dry_run_writes_record() {
        let dir = tempdir().unwrap();
        let mut settings = settings(dir.path());
        settings.sequencer.variant = "Dispense Only".to_string();
        settings.sequencer.bottles = Some(3);

        let hardware = HardwareManager::new(PumpBus::new("test"));
        let mut experiment = Experiment::with_hardware(settings, hardware).unwrap();
        let record = experiment.run().await.unwrap();

        assert_eq!(record.outcome, RunOutcome::Completed);
        assert!(record.dry_run);
        assert_eq!(record.visited_stages.last(), Some(&StageId::after(2)));
        let saved = RunRecord::load(&dir.path().join(record.default_filename())).unwrap();
        assert_eq!(saved.run_id, experiment.run_id());
    }

    #[tokio::test]
    async fn test_unwritable_output_fails_successful_run() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();

        let mut settings = settings(dir.path());
        settings.sequencer.variant = "Dispense Only".to_string();
        settings.sequencer.bottles = Some(1);
        settings.sequencer.output_dir = blocker.join("runs");

        let hardware = HardwareManager::new(PumpBus::new("test"));
        let mut experiment = Experiment::with_hardware(settings, hardware).unwrap();
        let err = experiment.run().await.unwrap_err();
        assert!(matches!(err, crate::error::RigError::Io(_)));
        assert!(experiment.sequencer().is_finished());
    }
}
