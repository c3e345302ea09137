//! Cycle sequencer: the state machine driving a run.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Sequencer                            │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐   │
//! │  │ StageTable   │  │ StageFn map  │  │ SequencerState   │   │
//! │  │ (transitions)│  │ (boundary)   │  │ stage, bottles   │   │
//! │  └──────────────┘  └──────────────┘  └──────────────────┘   │
//! └───────────────────────────┬─────────────────────────────────┘
//!                             │ StagePlan ops (1 direct, ≥2 dispatch_all)
//!                             ▼
//!                    ┌─────────────────┐
//!                    │      Rig        │──> HardwareManager
//!                    └─────────────────┘
//! ```
//!
//! `auto_run` is a polling loop: once per tick it runs the action bound to
//! the current stage. The action's plan decides which operations run, then the
//! sequencer decrements the bottle count, checks rotation feedback, and either
//! stops (terminal stage) or fires `command_finished`.
//!
//! # Example
//!
//! ```rust,ignore
//! let rig = Arc::new(Rig::new(hardware, &settings, samples));
//! let mut sequencer = Sequencer::new(Variant::Full, Arc::new(Variant::Full.table()), 5, rig)?;
//! let stop = sequencer.stop_handle();
//! sequencer.auto_run().await?;
//! ```

use crate::error::{AppResult, RigError};
use crate::experiment::boundary::{StageFn, StagePlan};
use crate::experiment::dispatcher::dispatch_all;
use crate::experiment::operation::Rig;
use crate::experiment::stage::{StageId, StageTable, Trigger};
use crate::experiment::variant::Variant;
use crate::hardware::InitReport;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Live state of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencerState {
    /// Stage the sequencer is in
    pub current_stage: StageId,
    /// Bottles configured for the run
    pub bottle_capacity: usize,
    /// Bottles still waiting on the tray
    pub bottles_remaining: usize,
    /// Feedback from the last rotation, until the stage consumes it
    pub last_feedback: Option<String>,
}

impl SequencerState {
    /// Fresh state at `initialize` with every bottle on the tray.
    pub fn new(bottle_capacity: usize) -> AppResult<Self> {
        if bottle_capacity == 0 {
            return Err(RigError::InvalidCapacity(bottle_capacity));
        }
        Ok(Self {
            current_stage: StageId::INITIALIZE,
            bottle_capacity,
            bottles_remaining: bottle_capacity,
            last_feedback: None,
        })
    }

    /// Whether a bottle is still waiting on the tray.
    pub fn bottle_on_tray(&self) -> bool {
        self.bottles_remaining > 0
    }

    /// A bottle left the tray. Never goes below zero.
    pub fn take_bottle(&mut self) {
        self.bottles_remaining = self.bottles_remaining.saturating_sub(1);
    }
}

/// Snapshot published after every change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SequencerStatus {
    /// Variant being run
    pub variant: Variant,
    /// Current stage
    pub current_stage: StageId,
    /// Bottles configured for the run
    pub bottle_capacity: usize,
    /// Bottles still on the tray
    pub bottles_remaining: usize,
    /// Whether the run loop is active
    pub running: bool,
    /// Whether a terminal stage was reached
    pub finished: bool,
    /// Stage actions executed so far
    pub steps: u64,
}

/// Stops a sequencer from another task.
///
/// The sequencer finishes the action in progress, then `auto_run` returns.
#[derive(Debug, Clone)]
pub struct StopHandle {
    running: Arc<AtomicBool>,
}

impl StopHandle {
    /// Request a stop.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Whether the run loop is still active.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Finite-state machine walking a stage table.
pub struct Sequencer {
    variant: Variant,
    table: Arc<StageTable>,
    actions: HashMap<StageId, StageFn>,
    state: SequencerState,
    rig: Arc<Rig>,
    tick: Duration,
    running: Arc<AtomicBool>,
    finished: bool,
    steps: u64,
    history: Vec<StageId>,
    init_report: Option<InitReport>,
    status_tx: watch::Sender<SequencerStatus>,
}

impl Sequencer {
    /// Build a sequencer for `variant` over `table` with `capacity` bottles.
    ///
    /// The table is validated and every stage in it must have an action in
    /// the variant. The sequencer starts in `initialize`, running.
    pub fn new(
        variant: Variant,
        table: Arc<StageTable>,
        capacity: usize,
        rig: Arc<Rig>,
    ) -> AppResult<Self> {
        let state = SequencerState::new(capacity)?;
        table.validate()?;
        let actions = variant.dispatch_table(&table)?;
        let running = Arc::new(AtomicBool::new(true));

        let (status_tx, _) = watch::channel(SequencerStatus {
            variant,
            current_stage: state.current_stage,
            bottle_capacity: capacity,
            bottles_remaining: state.bottles_remaining,
            running: true,
            finished: false,
            steps: 0,
        });

        Ok(Self {
            variant,
            table,
            actions,
            history: vec![state.current_stage],
            state,
            rig,
            tick: Duration::from_millis(1000),
            running,
            finished: false,
            steps: 0,
            init_report: None,
            status_tx,
        })
    }

    /// Set the delay between stage actions.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Variant being run.
    pub fn variant(&self) -> Variant {
        self.variant
    }

    /// The stage table.
    pub fn table(&self) -> &StageTable {
        &self.table
    }

    /// The rig operations are performed on.
    pub fn rig(&self) -> &Arc<Rig> {
        &self.rig
    }

    /// Live state.
    pub fn state(&self) -> &SequencerState {
        &self.state
    }

    /// Current stage.
    pub fn current_stage(&self) -> StageId {
        self.state.current_stage
    }

    /// Bottles still on the tray.
    pub fn bottles_remaining(&self) -> usize {
        self.state.bottles_remaining
    }

    /// Whether the run loop is active.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Whether a terminal stage was reached.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Stages in the order they were entered.
    pub fn history(&self) -> &[StageId] {
        &self.history
    }

    /// Result of hardware initialization, once it ran.
    pub fn init_report(&self) -> Option<&InitReport> {
        self.init_report.as_ref()
    }

    /// Handle for stopping the run from another task.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            running: Arc::clone(&self.running),
        }
    }

    /// Receive a status snapshot after every change.
    pub fn subscribe(&self) -> watch::Receiver<SequencerStatus> {
        self.status_tx.subscribe()
    }

    /// Current status snapshot.
    pub fn status(&self) -> SequencerStatus {
        SequencerStatus {
            variant: self.variant,
            current_stage: self.state.current_stage,
            bottle_capacity: self.state.bottle_capacity,
            bottles_remaining: self.state.bottles_remaining,
            running: self.is_running(),
            finished: self.finished,
            steps: self.steps,
        }
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.status());
    }

    /// End the run loop after the action in progress.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.publish();
    }

    /// Initialize the hardware, then fire `initialize_finished`.
    ///
    /// Failed devices are logged and the run proceeds, unless the rig's
    /// policy is to abort.
    pub async fn initialize(&mut self) -> AppResult<()> {
        info!(variant = %self.variant, bottles = self.state.bottle_capacity, "Initializing hardware");
        let report = self.rig.initialize().await?;
        if !report.all_ok() {
            warn!(failed = ?report.failed(), "Continuing with failed devices");
        }
        self.init_report = Some(report);
        self.trigger(Trigger::InitializeFinished);
        Ok(())
    }

    /// Fire `trigger` from the current stage.
    ///
    /// Returns whether a transition was taken. With no matching transition
    /// the stage is left unchanged.
    pub fn trigger(&mut self, trigger: Trigger) -> bool {
        let source = self.state.current_stage;
        match self
            .table
            .next(trigger, source, self.state.bottles_remaining)
        {
            Some(dest) => {
                debug!(%trigger, from = %source, to = %dest, "Transition");
                self.state.current_stage = dest;
                self.history.push(dest);
                self.publish();
                true
            }
            None => {
                debug!(%trigger, stage = %source, "No transition; trigger ignored");
                false
            }
        }
    }

    /// Fire a trigger by name. Unknown names are ignored.
    pub fn trigger_named(&mut self, name: &str) -> bool {
        match Trigger::from_name(name) {
            Some(trigger) => self.trigger(trigger),
            None => {
                debug!(trigger = name, "Unknown trigger ignored");
                false
            }
        }
    }

    /// Run the action bound to the current stage once.
    pub async fn step(&mut self) -> AppResult<()> {
        let stage = self.state.current_stage;
        self.steps += 1;

        if stage == StageId::INITIALIZE {
            return self.initialize().await;
        }

        let Some(action) = self.actions.get(&stage).copied() else {
            debug!(%stage, "No action bound; idle tick");
            return Ok(());
        };

        let plan = action(&self.state);
        info!(
            %stage,
            bottles_remaining = self.state.bottles_remaining,
            ops = ?plan.ops,
            "Running stage"
        );

        let feedback = self.execute(&plan).await?;

        if plan.takes_bottle {
            self.state.take_bottle();
        }

        if plan.rotates() {
            self.state.last_feedback = feedback.into_iter().flatten().find(|f| !f.is_empty());
            match self.state.last_feedback.take() {
                Some(reply) => debug!(%stage, %reply, "Rotation confirmed"),
                None => {
                    warn!(%stage, "Rotation returned no feedback; repeating stage");
                    self.publish();
                    return Ok(());
                }
            }
        }

        if plan.terminal {
            info!(%stage, "Terminal stage reached");
            self.finished = true;
            self.stop();
            return Ok(());
        }

        self.trigger(Trigger::CommandFinished);
        Ok(())
    }

    async fn execute(&self, plan: &StagePlan) -> AppResult<Vec<Option<String>>> {
        match plan.ops.as_slice() {
            [] => Ok(Vec::new()),
            [operation] => Ok(vec![self.rig.perform(*operation).await?]),
            operations => {
                let group: Vec<_> = operations
                    .iter()
                    .map(|operation| {
                        let rig = Arc::clone(&self.rig);
                        let operation = *operation;
                        async move { rig.perform(operation).await }
                    })
                    .collect();
                dispatch_all(group).await
            }
        }
    }

    /// Run stage actions, one per tick, until stopped.
    ///
    /// A failing action ends the loop with its error and leaves `running`
    /// set, so an aborted run can be told apart from a finished one.
    pub async fn auto_run(&mut self) -> AppResult<()> {
        info!(
            variant = %self.variant,
            bottles = self.state.bottle_capacity,
            tick_ms = self.tick.as_millis() as u64,
            "Starting run"
        );

        while self.is_running() {
            let stage = self.state.current_stage;
            if let Err(e) = self.step().await {
                error!(%stage, error = %e, "Stage action failed; run aborted");
                return Err(e);
            }
            if !self.is_running() {
                break;
            }
            tokio::time::sleep(self.tick).await;
        }

        info!(
            stage = %self.state.current_stage,
            finished = self.finished,
            stages = self.history.len(),
            "Run loop ended"
        );
        Ok(())
    }
}

impl std::fmt::Debug for Sequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequencer")
            .field("variant", &self.variant)
            .field("state", &self.state)
            .field("running", &self.is_running())
            .field("finished", &self.finished)
            .finish()
    }
}
