//! The three experiment variants and their stage tables.

use crate::error::{AppResult, RigError};
use crate::experiment::boundary::{self, StageFn};
use crate::experiment::stage::{StageId, StageTable};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Which stations a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Variant {
    /// Dispense into every bottle, then measure it with UV-Vis and DLS
    Full,
    /// Dispense only; bottles go from the pump station back to the tray
    DispenseOnly,
    /// Measure pre-filled bottles only
    MeasureOnly,
}

impl Variant {
    /// Every variant.
    pub const ALL: [Variant; 3] = [Variant::Full, Variant::DispenseOnly, Variant::MeasureOnly];

    /// Map an operator choice to a variant.
    ///
    /// Unrecognized choices select [`Variant::Full`].
    pub fn from_choice(choice: &str) -> Self {
        match choice.trim().to_lowercase().as_str() {
            "dispense only" | "dispensing only" | "dispense" | "dispense_only" => Variant::DispenseOnly,
            "measure only" | "measuring only" | "measure" | "measure_only" => Variant::MeasureOnly,
            _ => Variant::Full,
        }
    }

    /// Display name, also accepted by [`Variant::from_choice`].
    pub fn name(&self) -> &'static str {
        match self {
            Variant::Full => "Full",
            Variant::DispenseOnly => "Dispense Only",
            Variant::MeasureOnly => "Measure Only",
        }
    }

    /// Bottles in flight before the first one returns to the tray.
    pub fn pipeline_depth(&self) -> usize {
        match self {
            Variant::Full => 5,
            Variant::DispenseOnly => 2,
            Variant::MeasureOnly => 3,
        }
    }

    /// Capacity used when none is configured.
    pub fn default_capacity(&self) -> usize {
        match self {
            Variant::Full => 5,
            Variant::DispenseOnly => 5,
            Variant::MeasureOnly => 4,
        }
    }

    /// Number of times the last cycle stage loops back for `capacity` bottles.
    pub fn cycle_loops(&self, capacity: usize) -> usize {
        capacity.saturating_sub(self.pipeline_depth())
    }

    /// Whether the variant fills bottles.
    pub fn dispenses(&self) -> bool {
        matches!(self, Variant::Full | Variant::DispenseOnly)
    }

    /// Whether the variant measures bottles.
    pub fn measures(&self) -> bool {
        matches!(self, Variant::Full | Variant::MeasureOnly)
    }

    /// Built-in stage table.
    pub fn table(&self) -> StageTable {
        match self {
            Variant::Full => StageTable::pipeline(17, 7, 4, 9),
            Variant::DispenseOnly => StageTable::pipeline(3, 3, 2, 2),
            Variant::MeasureOnly => StageTable::pipeline(5, 3, 2, 4),
        }
    }

    /// Action bound to `stage`, if the variant has one.
    pub fn stage_fn(&self, stage: StageId) -> Option<StageFn> {
        match self {
            Variant::Full => boundary::full(stage),
            Variant::DispenseOnly => boundary::dispense_only(stage),
            Variant::MeasureOnly => boundary::measure_only(stage),
        }
    }

    /// Stage-to-action map for `table`.
    ///
    /// Fails if the table names a stage this variant has no action for.
    /// `initialize` is handled by the sequencer itself and is left out.
    pub fn dispatch_table(&self, table: &StageTable) -> AppResult<HashMap<StageId, StageFn>> {
        let mut actions = HashMap::new();
        for stage in table.stages.iter().filter(|s| **s != StageId::INITIALIZE) {
            let action = self.stage_fn(*stage).ok_or_else(|| {
                RigError::StageTable(format!("{self} has no action for stage '{stage}'"))
            })?;
            actions.insert(*stage, action);
        }
        Ok(actions)
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_choice_strings() {
        assert_eq!(Variant::from_choice("Dispense Only"), Variant::DispenseOnly);
        assert_eq!(Variant::from_choice("dispensing only"), Variant::DispenseOnly);
        assert_eq!(Variant::from_choice("Measure Only"), Variant::MeasureOnly);
        assert_eq!(Variant::from_choice("measuring only"), Variant::MeasureOnly);
        assert_eq!(Variant::from_choice("Full"), Variant::Full);
        assert_eq!(Variant::from_choice("anything else"), Variant::Full);
        for variant in Variant::ALL {
            assert_eq!(Variant::from_choice(variant.name()), variant);
        }
    }

    #[test]
    fn test_built_in_tables_are_complete() {
        for variant in Variant::ALL {
            let table = variant.table();
            table.validate().unwrap();
            let actions = variant.dispatch_table(&table).unwrap();
            assert_eq!(actions.len(), table.stages.len() - 1, "{variant}");
        }
    }

    #[test]
    fn test_table_sizes() {
        assert_eq!(Variant::Full.table().stages.len(), 1 + 17 + 7 + 9);
        assert_eq!(Variant::DispenseOnly.table().stages.len(), 1 + 3 + 3 + 2);
        assert_eq!(Variant::MeasureOnly.table().stages.len(), 1 + 5 + 3 + 4);
    }

    #[test]
    fn test_foreign_table_rejected() {
        let err = Variant::DispenseOnly
            .dispatch_table(&Variant::Full.table())
            .unwrap_err();
        assert!(matches!(err, RigError::StageTable(_)));
    }

    #[test]
    fn test_cycle_loops() {
        assert_eq!(Variant::Full.cycle_loops(5), 0);
        assert_eq!(Variant::Full.cycle_loops(7), 2);
        assert_eq!(Variant::Full.cycle_loops(1), 0);
        assert_eq!(Variant::MeasureOnly.cycle_loops(4), 1);
    }
}
