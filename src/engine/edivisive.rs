//! E-Divisive: the "series analyzer" contract from spec.md §4.3, treated
//! upstream as a pluggable external library (`hunter` in the system this
//! was distilled from, see `examples/original_source/pkg/algorithms/edivisive`).
//! No Rust crate in the corpus exposes an equivalent energy-statistics
//! change-point routine, so this module self-contains a standard
//! E-Divisive implementation (James & Matteson 2013) the same way
//! `isolation_forest.rs` self-contains its model: a real, from-scratch
//! algorithm rather than a stub, grounded in the published method the
//! external library itself implements.
//!
//! The engine hands its result to the Post-Filter Pipeline unchanged —
//! direction filtering happens there (§4.4 step 1), not here.

use crate::model::{AssembledTable, ChangePoint, ComparativeStats, MetricSpec};

use super::{AnalysisResult, ChangePointAlgorithm, EngineError};

/// Above this, a candidate split is accepted as a change point.
const SIGNIFICANCE: f64 = 0.05;
/// Caps recursion so a pathological series can't blow up analysis time.
const MAX_CHANGE_POINTS: usize = 5;
/// Neither side of a candidate split may be shorter than this.
const MIN_SEGMENT: usize = 2;
/// Permutation resamples used to estimate each candidate's significance.
const PERMUTATIONS: usize = 100;

#[derive(Default)]
pub struct EDivisive;

impl ChangePointAlgorithm for EDivisive {
    fn analyze(&self, table: &AssembledTable, metrics: &[MetricSpec]) -> Result<AnalysisResult, EngineError> {
        if table.is_empty() {
            return Err(EngineError::EmptyInput);
        }

        let mut result = AnalysisResult::default();

        for metric in metrics {
            let column = metric.column_name();
            let series = table.column_values(&column);

            let mut row_map = Vec::with_capacity(series.len());
            let mut values = Vec::with_capacity(series.len());
            for (idx, v) in series.iter().enumerate() {
                if let Some(v) = v {
                    row_map.push(idx);
                    values.push(*v);
                }
            }

            if values.len() < MIN_SEGMENT * 2 {
                continue;
            }

            let mut splits = Vec::new();
            let mut rng = SplitMix64::new(0xC0FF_EE00_u64.wrapping_add(column.len() as u64));
            find_change_points(&values, &row_map, &mut rng, &mut splits);
            if splits.is_empty() {
                continue;
            }

            splits.sort_by_key(|s| s.row_index);

            let points = splits
                .into_iter()
                .map(|s| ChangePoint {
                    metric: column.clone(),
                    index: s.row_index,
                    time: table.rows[s.row_index].timestamp,
                    stats: ComparativeStats {
                        mean_before: s.mean_before,
                        mean_after: s.mean_after,
                        std_before: s.std_before,
                        std_after: s.std_after,
                        p_value: s.p_value,
                    },
                })
                .collect();

            result.change_points.insert(column, points);
        }

        Ok(result)
    }
}

struct Split {
    row_index: usize,
    mean_before: f64,
    mean_after: f64,
    std_before: f64,
    std_after: f64,
    p_value: f64,
}

fn find_change_points(values: &[f64], row_map: &[usize], rng: &mut SplitMix64, out: &mut Vec<Split>) {
    if out.len() >= MAX_CHANGE_POINTS || values.len() < MIN_SEGMENT * 2 {
        return;
    }

    let Some((tau, observed, p_value)) = best_split(values, rng) else {
        return;
    };
    if p_value > SIGNIFICANCE {
        return;
    }
    let _ = observed;

    let left = &values[..tau];
    let right = &values[tau..];
    out.push(Split {
        row_index: row_map[tau],
        mean_before: mean(left),
        mean_after: mean(right),
        std_before: stddev(left),
        std_after: stddev(right),
        p_value,
    });

    find_change_points(left, &row_map[..tau], rng, out);
    find_change_points(right, &row_map[tau..], rng, out);
}

/// Finds the split position maximizing the E-Divisive energy-divergence
/// statistic, and its permutation p-value. Returns `None` when no
/// candidate split position exists (series too short).
fn best_split(values: &[f64], rng: &mut SplitMix64) -> Option<(usize, f64, f64)> {
    let n = values.len();
    if n < MIN_SEGMENT * 2 {
        return None;
    }

    let mut best_tau = None;
    let mut best_stat = f64::NEG_INFINITY;
    for tau in MIN_SEGMENT..=(n - MIN_SEGMENT) {
        let stat = divergence_statistic(&values[..tau], &values[tau..]);
        if stat > best_stat {
            best_stat = stat;
            best_tau = Some(tau);
        }
    }
    let tau = best_tau?;

    let mut exceed = 0usize;
    let mut shuffled = values.to_vec();
    for _ in 0..PERMUTATIONS {
        rng.shuffle(&mut shuffled);
        let permuted_stat = divergence_statistic(&shuffled[..tau], &shuffled[tau..]);
        if permuted_stat >= best_stat {
            exceed += 1;
        }
    }
    let p_value = (exceed as f64 + 1.0) / (PERMUTATIONS as f64 + 1.0);

    Some((tau, best_stat, p_value))
}

/// The E-Divisive test statistic for a candidate split: twice the
/// between-segment mean absolute difference minus each segment's own
/// within-segment mean absolute difference, scaled by the harmonic-mean
/// segment-size term so segment-size imbalance doesn't dominate.
fn divergence_statistic(left: &[f64], right: &[f64]) -> f64 {
    let m = left.len() as f64;
    let n = right.len() as f64;
    let between = mean_abs_diff(left, right);
    let within_left = mean_abs_diff(left, left);
    let within_right = mean_abs_diff(right, right);
    let q = 2.0 * between - within_left - within_right;
    (m * n / (m + n)) * q
}

fn mean_abs_diff(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let mut total = 0.0;
    for x in a {
        for y in b {
            total += (x - y).abs();
        }
    }
    total / (a.len() * b.len()) as f64
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn stddev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}

/// A tiny deterministic PRNG (SplitMix64), matching the one
/// `isolation_forest.rs` carries — reproducible permutation tests without
/// pulling in a `rand` dependency the teacher doesn't have.
struct SplitMix64 {
    state: u64,
}

impl SplitMix64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9E3779B97F4A7C15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
        z ^ (z >> 31)
    }

    /// Fisher-Yates shuffle in place.
    fn shuffle(&mut self, values: &mut [f64]) {
        for i in (1..values.len()).rev() {
            let j = (self.next_u64() as usize) % (i + 1);
            values.swap(i, j);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AssembledRow, Direction};
    use std::collections::BTreeMap;

    fn metric(name: &str, direction: Direction) -> MetricSpec {
        MetricSpec {
            name: name.to_string(),
            metric_of_interest: "value".to_string(),
            agg: None,
            direction,
            threshold: 5.0,
            labels: vec![],
            correlation: String::new(),
            context: 5,
            timestamp_field: None,
            selector: vec![],
        }
    }

    fn table_with(values: &[f64]) -> AssembledTable {
        let metric = metric("cpu", 1);
        let column = metric.column_name();
        let rows = values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let mut metrics = BTreeMap::new();
                metrics.insert(column.clone(), Some(*v));
                AssembledRow {
                    run_id: format!("run-{i}"),
                    timestamp: i as i64 * 30,
                    version: "4.16".to_string(),
                    build_url: "http://example.com".to_string(),
                    metrics,
                    display: BTreeMap::new(),
                }
            })
            .collect();
        AssembledTable {
            rows,
            metric_columns: vec![column],
            display_columns: vec![],
        }
    }

    #[test]
    fn constant_series_yields_no_change_points() {
        let table = table_with(&[100.0; 20]);
        let metrics = vec![metric("cpu", 1)];
        let result = EDivisive.analyze(&table, &metrics).unwrap();
        assert!(result.change_points.get("cpu_value").is_none());
    }

    #[test]
    fn step_change_is_detected_near_the_true_boundary() {
        let mut values = vec![100.0; 25];
        values.extend(vec![120.0; 25]);
        let table = table_with(&values);
        let metrics = vec![metric("cpu", 1)];
        let result = EDivisive.analyze(&table, &metrics).unwrap();
        let points = result.change_points.get("cpu_value").expect("expected a change point");
        assert!(!points.is_empty());
        let first = &points[0];
        assert!(first.index > 0 && first.index < table.row_count());
        assert!((first.index as i64 - 25).abs() <= 5);
        assert!(first.stats.mean_after > first.stats.mean_before);
    }

    #[test]
    fn empty_table_is_an_error() {
        let table = AssembledTable::default();
        let metrics = vec![metric("cpu", 1)];
        assert!(matches!(EDivisive.analyze(&table, &metrics), Err(EngineError::EmptyInput)));
    }
}
