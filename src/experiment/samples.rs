//! Sample recipes: how much of which solution goes into each bottle.
//!
//! Recipe files are JSON:
//!
//! ```json
//! {
//!   "num_samples": 2,
//!   "out_flow": 0.05,
//!   "samples": {
//!     "1": { "volume": 1.0, "proportion": [1, 3], "solution": ["water", "dye"], "pumps": ["pump1", "pump2"] },
//!     "2": { "volume": 1.0, "proportion": [1, 1], "solution": ["water", "dye"], "pumps": ["pump1", "pump2"] }
//!   }
//! }
//! ```
//!
//! Sample keys are 1-based indices. Each pump delivers `volume * p / sum(p)`
//! at `out_flow * p / sum(p)`, so all pumps of a bottle finish together.

use crate::error::{AppResult, RigError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// One bottle's recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Total volume in millilitres
    pub volume: f64,
    /// Relative share per pump
    pub proportion: Vec<f64>,
    /// Solution names, parallel to `pumps`
    #[serde(default)]
    pub solution: Vec<String>,
    /// Pump ids
    pub pumps: Vec<String>,
}

/// One pump's part of a bottle.
#[derive(Debug, Clone, PartialEq)]
pub struct Dose {
    /// Pump id
    pub pump: String,
    /// Volume in millilitres
    pub volume: f64,
    /// Flow in millilitres per second
    pub flow: f64,
}

/// Recipe for a whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleConfig {
    /// Number of samples in the recipe
    pub num_samples: usize,
    /// Combined output flow of all pumps of a bottle
    pub out_flow: f64,
    /// Recipes keyed by 1-based index
    pub samples: BTreeMap<String, Sample>,
}

impl SampleConfig {
    /// Load and validate a JSON recipe.
    pub fn load(path: &Path) -> AppResult<Self> {
        let config: SampleConfig = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }

    /// Recipe giving every bottle equal parts from every pump.
    pub fn even_split(count: usize, pumps: &[String], volume: f64, out_flow: f64) -> Self {
        let sample = Sample {
            volume,
            proportion: vec![1.0; pumps.len()],
            solution: pumps.to_vec(),
            pumps: pumps.to_vec(),
        };
        Self {
            num_samples: count,
            out_flow,
            samples: (1..=count)
                .map(|i| (i.to_string(), sample.clone()))
                .collect(),
        }
    }

    /// Check indices, lengths and quantities.
    pub fn validate(&self) -> AppResult<()> {
        if self.out_flow <= 0.0 {
            return Err(RigError::Configuration(format!(
                "out_flow must be positive, got {}",
                self.out_flow
            )));
        }
        for index in 1..=self.num_samples {
            let sample = self.samples.get(&index.to_string()).ok_or_else(|| {
                RigError::Configuration(format!("sample {index} is missing from the recipe"))
            })?;
            if sample.volume <= 0.0 {
                return Err(RigError::Configuration(format!(
                    "sample {index}: volume must be positive"
                )));
            }
            if sample.pumps.is_empty() || sample.proportion.len() != sample.pumps.len() {
                return Err(RigError::Configuration(format!(
                    "sample {index}: {} proportions for {} pumps",
                    sample.proportion.len(),
                    sample.pumps.len()
                )));
            }
            if !sample.solution.is_empty() && sample.solution.len() != sample.pumps.len() {
                return Err(RigError::Configuration(format!(
                    "sample {index}: {} solutions for {} pumps",
                    sample.solution.len(),
                    sample.pumps.len()
                )));
            }
            if sample.proportion.iter().any(|p| *p < 0.0) || sample.proportion.iter().sum::<f64>() <= 0.0 {
                return Err(RigError::Configuration(format!(
                    "sample {index}: proportions must be non-negative with a positive sum"
                )));
            }
        }
        Ok(())
    }

    /// Recipe for 1-based `index`.
    pub fn sample(&self, index: usize) -> AppResult<&Sample> {
        if index == 0 || index > self.num_samples {
            return Err(RigError::SampleOutOfRange {
                requested: index,
                available: self.num_samples,
            });
        }
        self.samples
            .get(&index.to_string())
            .ok_or(RigError::SampleOutOfRange {
                requested: index,
                available: self.num_samples,
            })
    }

    /// Per-pump doses for bottle `index`. Pumps with a zero share are left out.
    pub fn doses(&self, index: usize) -> AppResult<Vec<Dose>> {
        let sample = self.sample(index)?;
        let total: f64 = sample.proportion.iter().sum();
        Ok(sample
            .pumps
            .iter()
            .zip(&sample.proportion)
            .filter(|(_, share)| **share > 0.0)
            .map(|(pump, share)| {
                let ratio = share / total;
                Dose {
                    pump: pump.clone(),
                    volume: sample.volume * ratio,
                    flow: self.out_flow * ratio,
                }
            })
            .collect())
    }

    /// Total volume each pump delivers over the whole recipe.
    pub fn pump_volumes(&self) -> AppResult<BTreeMap<String, f64>> {
        let mut totals = BTreeMap::new();
        for index in 1..=self.num_samples {
            for dose in self.doses(index)? {
                *totals.entry(dose.pump).or_insert(0.0) += dose.volume;
            }
        }
        Ok(totals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const RECIPE: &str = r#"{
        "num_samples": 2,
        "out_flow": 0.08,
        "samples": {
            "1": {"volume": 2.0, "proportion": [1, 3], "solution": ["water", "dye"], "pumps": ["pump1", "pump2"]},
            "2": {"volume": 1.0, "proportion": [1, 0], "solution": ["water", "dye"], "pumps": ["pump1", "pump2"]}
        }
    }"#;

    fn recipe() -> SampleConfig {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(RECIPE.as_bytes()).unwrap();
        SampleConfig::load(file.path()).unwrap()
    }

    #[test]
    fn test_doses_split_by_proportion() {
        let doses = recipe().doses(1).unwrap();
        assert_eq!(doses.len(), 2);
        assert_eq!(doses[0].pump, "pump1");
        assert!((doses[0].volume - 0.5).abs() < 1e-9);
        assert!((doses[0].flow - 0.02).abs() < 1e-9);
        assert!((doses[1].volume - 1.5).abs() < 1e-9);
        assert!((doses[1].flow - 0.06).abs() < 1e-9);
    }

    #[test]
    fn test_zero_share_pump_skipped() {
        let doses = recipe().doses(2).unwrap();
        assert_eq!(doses.len(), 1);
        assert_eq!(doses[0].pump, "pump1");
    }

    #[test]
    fn test_out_of_range() {
        let err = recipe().doses(3).unwrap_err();
        assert!(matches!(
            err,
            RigError::SampleOutOfRange {
                requested: 3,
                available: 2
            }
        ));
    }

    #[test]
    fn test_pump_volumes() {
        let totals = recipe().pump_volumes().unwrap();
        assert!((totals["pump1"] - 1.5).abs() < 1e-9);
        assert!((totals["pump2"] - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_even_split() {
        let pumps = vec!["pump1".to_string(), "pump2".to_string()];
        let config = SampleConfig::even_split(3, &pumps, 1.0, 0.05);
        config.validate().unwrap();
        let doses = config.doses(3).unwrap();
        assert!(doses.iter().all(|d| (d.volume - 0.5).abs() < 1e-9));
    }

    #[test]
    fn test_missing_sample_rejected() {
        let mut config = recipe();
        config.num_samples = 3;
        assert!(matches!(config.validate(), Err(RigError::Configuration(_))));
    }
}
