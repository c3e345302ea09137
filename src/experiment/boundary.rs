//! Boundary-condition tables.
//!
//! Each stage of each variant maps to one function deciding, from the
//! bottle capacity, which operations the stage runs, whether a bottle leaves
//! the tray, and whether the run ends there. Operations listed together run
//! in parallel.
//!
//! Pipeline depth is 5 for [`full`], 2 for [`dispense_only`] and 3 for
//! [`measure_only`]. Runs with fewer bottles than the depth never fill the
//! pipeline, so the ramp stages skip work and the run ends early:
//!
//! | capacity | full ends at           | dispense only ends at | measure only ends at |
//! |----------|------------------------|-----------------------|----------------------|
//! | 1        | `cycle_stage_1`        | `cycle_stage_2`       | `cycle_stage_2`      |
//! | 2        | `after_cycle_stage_2`  | `after_cycle_stage_2` | `after_cycle_stage_2`|
//! | 3        | `after_cycle_stage_5`  | `after_cycle_stage_2` | `after_cycle_stage_4`|
//! | 4        | `after_cycle_stage_7`  | `after_cycle_stage_2` | `after_cycle_stage_4`|
//! | 5+       | `after_cycle_stage_9`  | `after_cycle_stage_2` | `after_cycle_stage_4`|

use crate::experiment::operation::Operation::{self, *};
use crate::experiment::sequencer::SequencerState;
use crate::experiment::stage::{Phase, StageId};

/// Action bound to a stage.
pub type StageFn = fn(&SequencerState) -> StagePlan;

/// What a stage does on one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagePlan {
    /// Operations, run in parallel when more than one
    pub ops: Vec<Operation>,
    /// A bottle leaves the tray
    pub takes_bottle: bool,
    /// The run ends after this stage
    pub terminal: bool,
}

impl StagePlan {
    /// Nothing to do; the stage just advances.
    pub fn idle() -> Self {
        Self::default()
    }

    /// Run `ops`.
    pub fn run(ops: &[Operation]) -> Self {
        Self {
            ops: ops.to_vec(),
            ..Self::default()
        }
    }

    /// Mark that a bottle leaves the tray.
    pub fn take(mut self) -> Self {
        self.takes_bottle = true;
        self
    }

    /// Mark the stage terminal.
    pub fn stop(mut self) -> Self {
        self.terminal = true;
        self
    }

    /// Mark the stage terminal when `condition` holds.
    pub fn stop_if(mut self, condition: bool) -> Self {
        self.terminal = condition;
        self
    }

    /// Whether the plan rotates a turntable.
    pub fn rotates(&self) -> bool {
        self.ops.iter().any(Operation::is_rotation)
    }
}

// =============================================================================
// Full (dispense + measure)
// =============================================================================

/// Stage actions of the full variant.
pub fn full(stage: StageId) -> Option<StageFn> {
    let action: StageFn = match (stage.phase, stage.ordinal) {
        (Phase::BeforeCycle, 1) => |_| StagePlan::run(&[TrayToPump]).take(),
        (Phase::BeforeCycle, 2) => rotate_pump,
        (Phase::BeforeCycle, 3) => |s| match s.bottle_capacity {
            1 => StagePlan::run(&[FillBottle]),
            _ => StagePlan::run(&[FillBottle, TrayToPump]).take(),
        },
        (Phase::BeforeCycle, 4) => rotate_pump,
        (Phase::BeforeCycle, 5) => |s| match s.bottle_capacity {
            1 => StagePlan::run(&[PumpToMeasure]),
            _ => StagePlan::run(&[FillBottle, PumpToMeasure]),
        },
        (Phase::BeforeCycle, 6) => rotate_measure,
        (Phase::BeforeCycle, 7) => |s| match s.bottle_capacity {
            1 | 2 => StagePlan::run(&[MeasureUv]),
            _ => StagePlan::run(&[TrayToPump, MeasureUv]).take(),
        },
        (Phase::BeforeCycle, 8) => rotate_pump,
        (Phase::BeforeCycle, 9) => |s| match s.bottle_capacity {
            1 => StagePlan::idle(),
            2 => StagePlan::run(&[PumpToMeasure]),
            _ => StagePlan::run(&[FillBottle, PumpToMeasure]),
        },
        (Phase::BeforeCycle, 10) => rotate_measure,
        (Phase::BeforeCycle, 11) => |s| match s.bottle_capacity {
            1..=3 => StagePlan::idle(),
            _ => StagePlan::run(&[TrayToPump]).take(),
        },
        (Phase::BeforeCycle, 12) => rotate_pump,
        (Phase::BeforeCycle, 13) => |s| match s.bottle_capacity {
            1 => StagePlan::run(&[MeasureDls]),
            2 => StagePlan::run(&[MeasureDls, MeasureUv]),
            3 => StagePlan::run(&[PumpToMeasure, MeasureDls, MeasureUv]),
            _ => StagePlan::run(&[FillBottle, PumpToMeasure, MeasureDls, MeasureUv]),
        },
        (Phase::BeforeCycle, 14) => rotate_measure,
        (Phase::BeforeCycle, 15) => |s| match s.bottle_capacity {
            1..=4 => StagePlan::idle(),
            _ => StagePlan::run(&[TrayToPump]).take(),
        },
        (Phase::BeforeCycle, 16) => rotate_pump,
        (Phase::BeforeCycle, 17) => |s| match s.bottle_capacity {
            1 => StagePlan::idle(),
            2 => StagePlan::run(&[MeasureDls]),
            3 | 4 => StagePlan::run(&[MeasureDls, MeasureUv]),
            _ => StagePlan::run(&[FillBottle, MeasureDls, MeasureUv]),
        },

        (Phase::Cycle, 1) => |s| StagePlan::run(&[MeasureToTray]).stop_if(s.bottle_capacity == 1),
        (Phase::Cycle, 2) => |s| match s.bottle_capacity {
            1..=3 => StagePlan::idle(),
            _ => StagePlan::run(&[PumpToMeasure]),
        },
        (Phase::Cycle, 3) => rotate_measure,
        (Phase::Cycle, 4) => |s| match s.bottle_capacity {
            1 | 2 => StagePlan::idle(),
            3 => StagePlan::run(&[MeasureDls]),
            _ => StagePlan::run(&[MeasureDls, MeasureUv]),
        },
        (Phase::Cycle, 5) => |_| StagePlan::run(&[TrayToPump]).take(),
        (Phase::Cycle, 6) => rotate_pump,
        (Phase::Cycle, 7) => |_| StagePlan::run(&[FillBottle]),

        (Phase::AfterCycle, 1) => rotate_pump,
        (Phase::AfterCycle, 2) => |s| StagePlan::run(&[MeasureToTray]).stop_if(s.bottle_capacity == 2),
        (Phase::AfterCycle, 3) => |s| match s.bottle_capacity {
            1..=4 => StagePlan::idle(),
            _ => StagePlan::run(&[PumpToMeasure]),
        },
        (Phase::AfterCycle, 4) => rotate_measure,
        (Phase::AfterCycle, 5) => |s| match s.bottle_capacity {
            1 | 2 => StagePlan::idle(),
            3 => StagePlan::run(&[MeasureToTray]).stop(),
            4 => StagePlan::run(&[MeasureDls, MeasureToTray]),
            _ => StagePlan::run(&[MeasureDls, MeasureUv, MeasureToTray]),
        },
        (Phase::AfterCycle, 6) => rotate_measure,
        (Phase::AfterCycle, 7) => |s| match s.bottle_capacity {
            1..=3 => StagePlan::idle(),
            4 => StagePlan::run(&[MeasureToTray]).stop(),
            _ => StagePlan::run(&[MeasureDls, MeasureToTray]),
        },
        (Phase::AfterCycle, 8) => rotate_measure,
        (Phase::AfterCycle, 9) => |_| StagePlan::run(&[MeasureToTray]).stop(),
        _ => return None,
    };
    Some(action)
}

// =============================================================================
// Dispense only
// =============================================================================

/// Stage actions of the dispense-only variant.
pub fn dispense_only(stage: StageId) -> Option<StageFn> {
    let action: StageFn = match (stage.phase, stage.ordinal) {
        (Phase::BeforeCycle, 1) => |_| StagePlan::run(&[TrayToPump]).take(),
        (Phase::BeforeCycle, 2) => rotate_pump,
        (Phase::BeforeCycle, 3) => |s| match s.bottle_capacity {
            1 => StagePlan::run(&[FillBottle]),
            _ => StagePlan::run(&[FillBottle, TrayToPump]).take(),
        },

        (Phase::Cycle, 1) => rotate_pump,
        (Phase::Cycle, 2) => |s| match s.bottle_capacity {
            1 => StagePlan::run(&[PumpToTray]).stop(),
            _ => StagePlan::run(&[FillBottle, PumpToTray]),
        },
        (Phase::Cycle, 3) => |_| StagePlan::run(&[TrayToPump]).take(),

        (Phase::AfterCycle, 1) => rotate_pump,
        (Phase::AfterCycle, 2) => |_| StagePlan::run(&[PumpToTray]).stop(),
        _ => return None,
    };
    Some(action)
}

// =============================================================================
// Measure only
// =============================================================================

/// Stage actions of the measure-only variant.
pub fn measure_only(stage: StageId) -> Option<StageFn> {
    let action: StageFn = match (stage.phase, stage.ordinal) {
        (Phase::BeforeCycle, 1) => |_| StagePlan::run(&[TrayToMeasure]).take(),
        (Phase::BeforeCycle, 2) => rotate_measure,
        (Phase::BeforeCycle, 3) => |s| match s.bottle_capacity {
            1 => StagePlan::run(&[MeasureUv]),
            _ => StagePlan::run(&[MeasureUv, TrayToMeasure]).take(),
        },
        (Phase::BeforeCycle, 4) => rotate_measure,
        (Phase::BeforeCycle, 5) => |s| match s.bottle_capacity {
            1 => StagePlan::run(&[MeasureDls]),
            2 => StagePlan::run(&[MeasureUv, MeasureDls]),
            _ => StagePlan::run(&[MeasureUv, MeasureDls, TrayToMeasure]).take(),
        },

        (Phase::Cycle, 1) => rotate_measure,
        (Phase::Cycle, 2) => |s| match s.bottle_capacity {
            1 => StagePlan::run(&[MeasureToTray]).stop(),
            2 => StagePlan::run(&[MeasureDls, MeasureToTray]),
            _ => StagePlan::run(&[MeasureUv, MeasureDls, MeasureToTray]),
        },
        (Phase::Cycle, 3) => |_| StagePlan::run(&[TrayToMeasure]).take(),

        (Phase::AfterCycle, 1) => rotate_measure,
        (Phase::AfterCycle, 2) => |s| match s.bottle_capacity {
            1 => StagePlan::idle(),
            2 => StagePlan::run(&[MeasureToTray]).stop(),
            _ => StagePlan::run(&[MeasureDls, MeasureToTray]),
        },
        (Phase::AfterCycle, 3) => rotate_measure,
        (Phase::AfterCycle, 4) => |_| StagePlan::run(&[MeasureToTray]).stop(),
        _ => return None,
    };
    Some(action)
}

fn rotate_pump(_: &SequencerState) -> StagePlan {
    StagePlan::run(&[RotatePumpTable])
}

fn rotate_measure(_: &SequencerState) -> StagePlan {
    StagePlan::run(&[RotateMeasureTable])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::variant::Variant;

    fn state(capacity: usize, remaining: usize) -> SequencerState {
        let mut state = SequencerState::new(capacity).unwrap();
        state.bottles_remaining = remaining;
        state
    }

    #[test]
    fn test_every_stage_has_one_plan_per_count() {
        for variant in Variant::ALL {
            for stage in variant.table().stages.into_iter().skip(1) {
                let action = variant.stage_fn(stage).unwrap();
                for capacity in 1..=8 {
                    for remaining in 0..=capacity {
                        let plan = action(&state(capacity, remaining));
                        assert!(
                            !(plan.rotates() && plan.ops.len() > 1),
                            "{variant} {stage}: rotation must run alone"
                        );
                        assert!(
                            !(plan.terminal && plan.takes_bottle),
                            "{variant} {stage}: terminal stage takes a bottle"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_full_ramp_up_dispatch() {
        let bc13 = full(StageId::before(13)).unwrap();
        assert_eq!(bc13(&state(1, 0)).ops, vec![MeasureDls]);
        assert_eq!(bc13(&state(2, 0)).ops, vec![MeasureDls, MeasureUv]);
        assert_eq!(
            bc13(&state(3, 0)).ops,
            vec![PumpToMeasure, MeasureDls, MeasureUv]
        );
        assert_eq!(
            bc13(&state(9, 4)).ops,
            vec![FillBottle, PumpToMeasure, MeasureDls, MeasureUv]
        );

        let bc15 = full(StageId::before(15)).unwrap();
        assert_eq!(bc15(&state(4, 0)), StagePlan::idle());
        assert!(bc15(&state(5, 1)).takes_bottle);
    }

    #[test]
    fn test_terminal_stage_depends_on_capacity() {
        let c1 = full(StageId::cycle(1)).unwrap();
        assert!(c1(&state(1, 0)).terminal);
        assert!(!c1(&state(2, 0)).terminal);

        let ac5 = full(StageId::after(5)).unwrap();
        assert!(ac5(&state(3, 0)).terminal);
        assert!(!ac5(&state(5, 0)).terminal);

        let ac2 = dispense_only(StageId::after(2)).unwrap();
        assert!(ac2(&state(4, 0)).terminal);
    }

    #[test]
    fn test_unknown_stage_has_no_action() {
        assert!(full(StageId::after(10)).is_none());
        assert!(dispense_only(StageId::before(4)).is_none());
        assert!(measure_only(StageId::INITIALIZE).is_none());
    }
}
