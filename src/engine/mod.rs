//! Change-Point Engine (C3): three interchangeable algorithms behind one
//! contract, each producing a uniform list of change points with
//! comparative statistics (§4.3, §9 "polymorphism by duck typing over
//! algorithms" -> an interface capability set with a tag-to-constructor
//! factory).

mod cmr;
mod edivisive;
mod isolation_forest;

use std::collections::BTreeMap;

use thiserror::Error;

use crate::model::{AssembledTable, ChangePoint, MetricSpec};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("cannot analyze an empty table")]
    EmptyInput,
    #[error("no algorithm selected")]
    NoAlgorithmSelected,
}

/// One of the three supported algorithms.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlgorithmTag {
    EDivisive,
    IsolationForestMovingAverage,
    ComparativeMean,
}

#[derive(Clone, Copy, Debug)]
pub struct AlgorithmOptions {
    pub anomaly_window: usize,
    pub min_anomaly_percent: f64,
}

impl Default for AlgorithmOptions {
    fn default() -> Self {
        Self {
            anomaly_window: 5,
            min_anomaly_percent: 10.0,
        }
    }
}

/// Uniform result of a full analysis pass: per-metric change points, plus
/// whether any metric has a surviving candidate (computed by the
/// post-filter pipeline, not here — the engine's own flag reflects only
/// "produced at least one candidate before filtering").
#[derive(Clone, Debug, Default)]
pub struct AnalysisResult {
    pub change_points: BTreeMap<String, Vec<ChangePoint>>,
}

/// The contract every algorithm variant implements: `analyze(table,
/// metricsConfig) -> mapping metric-column -> list of change points`.
pub trait ChangePointAlgorithm {
    fn analyze(&self, table: &AssembledTable, metrics: &[MetricSpec]) -> Result<AnalysisResult, EngineError>;
}

/// Tag-to-constructor mapping.
pub fn build(tag: AlgorithmTag, options: AlgorithmOptions) -> Box<dyn ChangePointAlgorithm + Send + Sync> {
    match tag {
        AlgorithmTag::EDivisive => Box::new(edivisive::EDivisive::default()),
        AlgorithmTag::IsolationForestMovingAverage => {
            Box::new(isolation_forest::IsolationForestMovingAverage::new(options))
        }
        AlgorithmTag::ComparativeMean => Box::new(cmr::ComparativeMean::default()),
    }
}

/// Shared helper: arithmetic mean of a slice of `Option<f64>`, ignoring
/// `None` cells. Returns `0.0` for an all-null slice (callers guard the
/// cases where that would be misleading).
fn mean_of(values: &[Option<f64>]) -> f64 {
    let present: Vec<f64> = values.iter().filter_map(|v| *v).collect();
    if present.is_empty() {
        return 0.0;
    }
    present.iter().sum::<f64>() / present.len() as f64
}

fn stddev_of(values: &[Option<f64>]) -> f64 {
    let present: Vec<f64> = values.iter().filter_map(|v| *v).collect();
    if present.len() < 2 {
        return 0.0;
    }
    let mean = present.iter().sum::<f64>() / present.len() as f64;
    let variance =
        present.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (present.len() - 1) as f64;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_of_ignores_nulls() {
        assert_eq!(mean_of(&[Some(1.0), None, Some(3.0)]), 2.0);
    }

    #[test]
    fn mean_of_empty_is_zero() {
        assert_eq!(mean_of(&[None, None]), 0.0);
    }

    #[test]
    fn stddev_of_single_value_is_zero() {
        assert_eq!(stddev_of(&[Some(5.0)]), 0.0);
    }
}
