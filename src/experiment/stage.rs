//! Stages, triggers, guards and the transition table.
//!
//! A run walks through four phases:
//!
//! ```text
//! initialize ─initialize_finished─> before_cycle_stage_1 ─> ... ─> before_cycle_stage_N
//!                                                                        │
//!        ┌───────────────────────────────────────────────────────────────┘
//!        ▼
//!   cycle_stage_1 ─> ... ─> cycle_stage_B ─[bottle_on_tray]─> ... ─> cycle_stage_K ─┐
//!        ▲                        │                                                 │
//!        └────────────────────────┼─────────────────────────────────────────────────┘
//!                                 └─[tray_empty]─> after_cycle_stage_1 ─> ... ─> after_cycle_stage_M
//! ```
//!
//! Every edge except the first fires on `command_finished`. Guards are
//! evaluated against the live bottle count, never against a stored flag.

use crate::error::{AppResult, RigError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Pipeline phase a stage belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Hardware initialization
    Initialize,
    /// Ramp-up until the pipeline is full
    BeforeCycle,
    /// Repeating steady-state loop
    Cycle,
    /// Ramp-down until the last bottle is back on the tray
    AfterCycle,
}

impl Phase {
    fn prefix(&self) -> &'static str {
        match self {
            Phase::Initialize => "initialize",
            Phase::BeforeCycle => "before_cycle_stage_",
            Phase::Cycle => "cycle_stage_",
            Phase::AfterCycle => "after_cycle_stage_",
        }
    }
}

/// A named step of the pipeline.
///
/// Serialized as its stage name: `initialize`, `before_cycle_stage_3`,
/// `cycle_stage_1`, `after_cycle_stage_9`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StageId {
    /// Phase of the stage
    pub phase: Phase,
    /// Position within the phase, from 1 (0 for `initialize`)
    pub ordinal: u8,
}

impl StageId {
    /// The initialization stage every table starts with.
    pub const INITIALIZE: StageId = StageId {
        phase: Phase::Initialize,
        ordinal: 0,
    };

    /// `before_cycle_stage_<n>`
    pub const fn before(n: u8) -> Self {
        Self {
            phase: Phase::BeforeCycle,
            ordinal: n,
        }
    }

    /// `cycle_stage_<n>`
    pub const fn cycle(n: u8) -> Self {
        Self {
            phase: Phase::Cycle,
            ordinal: n,
        }
    }

    /// `after_cycle_stage_<n>`
    pub const fn after(n: u8) -> Self {
        Self {
            phase: Phase::AfterCycle,
            ordinal: n,
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.phase {
            Phase::Initialize => f.write_str(self.phase.prefix()),
            _ => write!(f, "{}{}", self.phase.prefix(), self.ordinal),
        }
    }
}

impl FromStr for StageId {
    type Err = RigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "initialize" {
            return Ok(StageId::INITIALIZE);
        }
        for phase in [Phase::BeforeCycle, Phase::AfterCycle, Phase::Cycle] {
            if let Some(n) = s.strip_prefix(phase.prefix()) {
                return match n.parse::<u8>() {
                    Ok(ordinal) if ordinal > 0 => Ok(StageId { phase, ordinal }),
                    _ => Err(RigError::StageTable(format!("invalid stage name '{s}'"))),
                };
            }
        }
        Err(RigError::StageTable(format!("invalid stage name '{s}'")))
    }
}

impl TryFrom<String> for StageId {
    type Error = RigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<StageId> for String {
    fn from(value: StageId) -> Self {
        value.to_string()
    }
}

/// Event that advances the sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Fired once hardware initialization is done
    InitializeFinished,
    /// Fired when a stage's actions have completed
    CommandFinished,
}

impl Trigger {
    /// Event name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::InitializeFinished => "initialize_finished",
            Trigger::CommandFinished => "command_finished",
        }
    }

    /// Parse an event name; unknown names yield `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "initialize_finished" => Some(Trigger::InitializeFinished),
            "command_finished" => Some(Trigger::CommandFinished),
            _ => None,
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Condition attached to a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Guard {
    /// At least one bottle is still waiting on the tray
    BottleOnTray,
    /// The tray has no bottles left to process
    TrayEmpty,
}

impl Guard {
    /// Evaluate against the current bottle count.
    pub fn holds(&self, bottles_remaining: usize) -> bool {
        match self {
            Guard::BottleOnTray => bottles_remaining > 0,
            Guard::TrayEmpty => bottles_remaining == 0,
        }
    }
}

/// One edge of the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    /// Event the edge fires on
    pub trigger: Trigger,
    /// Stage the edge leaves
    pub source: StageId,
    /// Stage the edge enters
    pub dest: StageId,
    /// Optional condition
    #[serde(
        rename = "condition",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub guard: Option<Guard>,
}

impl Transition {
    /// Unconditional `command_finished` edge.
    pub fn on_finish(source: StageId, dest: StageId) -> Self {
        Self {
            trigger: Trigger::CommandFinished,
            source,
            dest,
            guard: None,
        }
    }

    /// Guarded `command_finished` edge.
    pub fn on_finish_if(source: StageId, dest: StageId, guard: Guard) -> Self {
        Self {
            guard: Some(guard),
            ..Self::on_finish(source, dest)
        }
    }
}

/// Ordered stages plus their transitions.
///
/// Tables are immutable once built and shared between the sequencer and
/// anything that wants to display them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTable {
    /// Stages in pipeline order
    pub stages: Vec<StageId>,
    /// Transitions, evaluated in order
    pub transitions: Vec<Transition>,
}

impl StageTable {
    /// Build the standard pipeline shape.
    ///
    /// `before` ramp-up stages, `cycle` loop stages that branch after
    /// `branch_at` (continue while a bottle is on the tray, else leave for the
    /// ramp-down), and `after` ramp-down stages.
    pub fn pipeline(before: u8, cycle: u8, branch_at: u8, after: u8) -> Self {
        let mut stages = vec![StageId::INITIALIZE];
        stages.extend((1..=before).map(StageId::before));
        stages.extend((1..=cycle).map(StageId::cycle));
        stages.extend((1..=after).map(StageId::after));

        let mut transitions = vec![Transition {
            trigger: Trigger::InitializeFinished,
            source: StageId::INITIALIZE,
            dest: StageId::before(1),
            guard: None,
        }];
        for n in 1..before {
            transitions.push(Transition::on_finish(StageId::before(n), StageId::before(n + 1)));
        }
        transitions.push(Transition::on_finish(StageId::before(before), StageId::cycle(1)));

        for n in 1..cycle {
            if n == branch_at {
                transitions.push(Transition::on_finish_if(
                    StageId::cycle(n),
                    StageId::cycle(n + 1),
                    Guard::BottleOnTray,
                ));
                transitions.push(Transition::on_finish_if(
                    StageId::cycle(n),
                    StageId::after(1),
                    Guard::TrayEmpty,
                ));
            } else {
                transitions.push(Transition::on_finish(StageId::cycle(n), StageId::cycle(n + 1)));
            }
        }
        transitions.push(Transition::on_finish(StageId::cycle(cycle), StageId::cycle(1)));

        for n in 1..after {
            transitions.push(Transition::on_finish(StageId::after(n), StageId::after(n + 1)));
        }

        Self {
            stages,
            transitions,
        }
    }

    /// Destination of `trigger` fired in `source`, if any edge matches.
    ///
    /// Candidate edges are tried in table order; the first whose guard holds
    /// (or that has none) wins.
    pub fn next(&self, trigger: Trigger, source: StageId, bottles_remaining: usize) -> Option<StageId> {
        self.transitions
            .iter()
            .filter(|t| t.trigger == trigger && t.source == source)
            .find(|t| t.guard.map_or(true, |g| g.holds(bottles_remaining)))
            .map(|t| t.dest)
    }

    /// Whether `stage` is part of the table.
    pub fn contains(&self, stage: StageId) -> bool {
        self.stages.contains(&stage)
    }

    /// Check structural consistency.
    pub fn validate(&self) -> AppResult<()> {
        if self.stages.first() != Some(&StageId::INITIALIZE) {
            return Err(RigError::StageTable(
                "the first stage must be 'initialize'".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(*stage) {
                return Err(RigError::StageTable(format!("duplicate stage '{stage}'")));
            }
        }

        let mut edges = HashSet::new();
        for t in &self.transitions {
            for end in [t.source, t.dest] {
                if !seen.contains(&end) {
                    return Err(RigError::StageTable(format!(
                        "transition {} -> {} names unknown stage '{end}'",
                        t.source, t.dest
                    )));
                }
            }
            if !edges.insert((t.trigger, t.source, t.guard)) {
                return Err(RigError::StageTable(format!(
                    "duplicate '{}' transition from '{}'",
                    t.trigger, t.source
                )));
            }
        }

        if !self
            .transitions
            .iter()
            .any(|t| t.trigger == Trigger::InitializeFinished && t.source == StageId::INITIALIZE)
        {
            return Err(RigError::StageTable(
                "'initialize' has no initialize_finished transition".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse and validate a YAML table.
    pub fn from_yaml(text: &str) -> AppResult<Self> {
        let table: StageTable = serde_yaml::from_str(text)?;
        table.validate()?;
        Ok(table)
    }

    /// Load and validate a YAML table file.
    pub fn load(path: &Path) -> AppResult<Self> {
        Self::from_yaml(&std::fs::read_to_string(path)?)
    }

    /// Render as YAML.
    pub fn to_yaml(&self) -> AppResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_names() {
        assert_eq!(StageId::INITIALIZE.to_string(), "initialize");
        assert_eq!(StageId::before(17).to_string(), "before_cycle_stage_17");
        assert_eq!(StageId::cycle(4).to_string(), "cycle_stage_4");
        assert_eq!(StageId::after(1).to_string(), "after_cycle_stage_1");

        for name in ["before_cycle_stage_3", "cycle_stage_7", "after_cycle_stage_9"] {
            assert_eq!(name.parse::<StageId>().unwrap().to_string(), name);
        }
        assert!("cycle_stage_0".parse::<StageId>().is_err());
        assert!("after_cycle_stage".parse::<StageId>().is_err());
        assert!("rinse".parse::<StageId>().is_err());
    }

    #[test]
    fn test_guards_follow_bottle_count() {
        assert!(Guard::BottleOnTray.holds(1));
        assert!(!Guard::BottleOnTray.holds(0));
        assert!(Guard::TrayEmpty.holds(0));
    }

    #[test]
    fn test_unknown_trigger_name() {
        assert_eq!(
            Trigger::from_name("command_finished"),
            Some(Trigger::CommandFinished)
        );
        assert_eq!(Trigger::from_name("bottle_dropped"), None);
    }

    #[test]
    fn test_pipeline_branching() {
        let table = StageTable::pipeline(3, 3, 2, 2);
        table.validate().unwrap();

        assert_eq!(
            table.next(Trigger::InitializeFinished, StageId::INITIALIZE, 5),
            Some(StageId::before(1))
        );
        assert_eq!(
            table.next(Trigger::CommandFinished, StageId::before(3), 5),
            Some(StageId::cycle(1))
        );
        assert_eq!(
            table.next(Trigger::CommandFinished, StageId::cycle(2), 1),
            Some(StageId::cycle(3))
        );
        assert_eq!(
            table.next(Trigger::CommandFinished, StageId::cycle(2), 0),
            Some(StageId::after(1))
        );
        assert_eq!(
            table.next(Trigger::CommandFinished, StageId::cycle(3), 0),
            Some(StageId::cycle(1))
        );
        assert_eq!(table.next(Trigger::CommandFinished, StageId::after(2), 0), None);
        assert_eq!(
            table.next(Trigger::InitializeFinished, StageId::cycle(1), 3),
            None
        );
    }

    #[test]
    fn test_yaml_round_trip_keeps_condition_names() {
        let table = StageTable::pipeline(2, 3, 2, 2);
        let yaml = table.to_yaml().unwrap();
        assert!(yaml.contains("condition: bottle_on_tray"));
        assert!(yaml.contains("source: cycle_stage_2"));
        assert_eq!(StageTable::from_yaml(&yaml).unwrap(), table);
    }

    #[test]
    fn test_validate_rejects_unknown_stage() {
        let mut table = StageTable::pipeline(2, 3, 2, 2);
        table
            .transitions
            .push(Transition::on_finish(StageId::after(2), StageId::after(3)));
        assert!(matches!(table.validate(), Err(RigError::StageTable(_))));
    }

    #[test]
    fn test_validate_rejects_missing_initialize() {
        let mut table = StageTable::pipeline(2, 3, 2, 2);
        table.stages.remove(0);
        assert!(table.validate().is_err());
    }
}
