//! Post-Filter Pipeline (C4): direction, acknowledgement, relative-magnitude
//! threshold, correlation gate, and boundary-window validation with
//! adaptive look-back expansion (§4.4). Never fails — it can only discard
//! candidates (§7 propagation policy).

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::engine::AnalysisResult;
use crate::model::{AckEntry, AssembledTable, ChangePoint, MetricSpec};

/// Early change point threshold (index < EARLY triggers expansion).
/// `0` disables the expansion path entirely (§4.4 step 5).
pub const DEFAULT_EARLY: usize = 5;
/// Minimum rows that must follow a surviving change point's index.
pub const DEFAULT_MIN_FUTURE: usize = 5;
/// Look-back increment applied on an expansion attempt.
pub const EXPANSION_LOOKBACK_INCREMENT_SECONDS: i64 = 10 * 86_400;
/// `maxRows` increment applied on an expansion attempt.
pub const EXPANSION_ROW_INCREMENT: usize = 5;

#[derive(Clone, Copy, Debug)]
pub struct BoundaryConfig {
    pub early: usize,
    pub min_future: usize,
}

impl Default for BoundaryConfig {
    fn default() -> Self {
        Self {
            early: DEFAULT_EARLY,
            min_future: DEFAULT_MIN_FUTURE,
        }
    }
}

/// The result of one post-filter pass: `change_points` are confirmed
/// survivors; `regression` is true iff any metric has a survivor.
#[derive(Clone, Debug, Default)]
pub struct FilterOutcome {
    pub change_points: BTreeMap<String, Vec<ChangePoint>>,
}

impl FilterOutcome {
    pub fn is_regression(&self) -> bool {
        self.change_points.values().any(|points| !points.is_empty())
    }
}

/// Re-runs an analysis with an expanded look-back window. Implemented by
/// the Pull/Periodic Coordinator (C5), which owns the index client and
/// knows how to rebuild the assembled table (§4.4 step 5, §9 "the
/// expanded analysis replaces the original result only if it still
/// yields a change point AND returned strictly more rows").
#[async_trait]
pub trait Expander: Send + Sync {
    async fn expand(
        &self,
        extra_lookback_seconds: i64,
        extra_rows: usize,
    ) -> Option<(AssembledTable, AnalysisResult)>;
}

/// No-op expander: the early-boundary candidate is simply discarded once
/// an expansion attempt is tried but no richer data comes back (step 5 as
/// written: "it will be revisited in a future cycle").
pub struct NoExpansion;

#[async_trait]
impl Expander for NoExpansion {
    async fn expand(&self, _extra_lookback_seconds: i64, _extra_rows: usize) -> Option<(AssembledTable, AnalysisResult)> {
        None
    }
}

/// Step 1: direction filter. Drops a candidate whose observed movement
/// contradicts `metric.direction`.
fn direction_filter(metric: &MetricSpec, points: Vec<ChangePoint>) -> Vec<ChangePoint> {
    points
        .into_iter()
        .filter(|cp| {
            let mean_before = cp.stats.mean_before;
            let mean_after = cp.stats.mean_after;
            !((metric.direction == 1 && mean_before > mean_after)
                || (metric.direction == -1 && mean_before < mean_after))
        })
        .collect()
}

/// Step 2: acknowledgement filter. The ack set is `{(index-of-runID,
/// metric) | ack entry matches a RunID present in the series}`.
fn ack_filter(table: &AssembledTable, acks: &[AckEntry], metric_column: &str, points: Vec<ChangePoint>) -> Vec<ChangePoint> {
    let acked_indices: Vec<usize> = acks
        .iter()
        .filter(|a| a.metric == metric_column)
        .filter_map(|a| table.index_of_run(&a.run_id))
        .collect();
    points
        .into_iter()
        .filter(|cp| !acked_indices.contains(&cp.index))
        .collect()
}

/// Step 3: relative-magnitude threshold filter.
fn threshold_filter(metric: &MetricSpec, points: Vec<ChangePoint>) -> Vec<ChangePoint> {
    points
        .into_iter()
        .filter(|cp| {
            if cp.stats.mean_before == 0.0 {
                // Undefined relative change; let the candidate through
                // rather than silently discarding a genuine 0 -> N jump.
                return true;
            }
            let relative = (cp.stats.mean_before - cp.stats.mean_after).abs() / cp.stats.mean_before.abs() * 100.0;
            relative >= metric.threshold
        })
        .collect()
}

/// Steps 1-3 applied per metric, in order.
pub fn apply_core_filters(
    table: &AssembledTable,
    metrics: &[MetricSpec],
    acks: &[AckEntry],
    raw: AnalysisResult,
) -> BTreeMap<String, Vec<ChangePoint>> {
    let mut survivors = BTreeMap::new();
    for metric in metrics {
        let column = metric.column_name();
        let Some(points) = raw.change_points.get(&column).cloned() else {
            continue;
        };
        let points = direction_filter(metric, points);
        let points = ack_filter(table, acks, &column, points);
        let points = threshold_filter(metric, points);
        if !points.is_empty() {
            survivors.insert(column, points);
        }
    }
    survivors
}

/// Step 4: correlation gate. A candidate at index `i` for a metric whose
/// `correlation` names another metric is kept only if that metric has a
/// surviving change point at some index within `context` of `i`.
pub fn apply_correlation_gate(
    metrics: &[MetricSpec],
    survivors: BTreeMap<String, Vec<ChangePoint>>,
) -> BTreeMap<String, Vec<ChangePoint>> {
    let mut result = BTreeMap::new();
    for metric in metrics {
        let column = metric.column_name();
        let Some(points) = survivors.get(&column) else {
            continue;
        };

        if metric.correlation.is_empty() {
            result.insert(column, points.clone());
            continue;
        }

        let correlated_column = metrics
            .iter()
            .find(|m| m.name == metric.correlation)
            .map(|m| m.column_name())
            .unwrap_or_else(|| metric.correlation.clone());
        let Some(correlated_points) = survivors.get(&correlated_column) else {
            continue;
        };

        let kept: Vec<ChangePoint> = points
            .iter()
            .filter(|cp| {
                correlated_points.iter().any(|other| {
                    let lo = cp.index.saturating_sub(metric.context);
                    let hi = cp.index + metric.context;
                    other.index >= lo && other.index <= hi
                })
            })
            .cloned()
            .collect();
        if !kept.is_empty() {
            result.insert(column, kept);
        }
    }
    result
}

#[derive(Clone, Debug, Default)]
struct BoundarySplit {
    kept: Vec<ChangePoint>,
    early: Vec<ChangePoint>,
}

/// Steps 5-6: classify each candidate as immediately kept, early (pending
/// expansion), or discarded (insufficient future data, not early).
fn split_boundary(points: Vec<ChangePoint>, row_count: usize, config: BoundaryConfig) -> BoundarySplit {
    let mut split = BoundarySplit::default();
    for cp in points {
        let is_early = config.early > 0 && cp.index < config.early;
        if is_early {
            split.early.push(cp);
            continue;
        }
        let future_rows = row_count.saturating_sub(cp.index + 1);
        if future_rows < config.min_future {
            continue;
        }
        split.kept.push(cp);
    }
    split
}

fn collect_kept(splits: BTreeMap<String, BoundarySplit>) -> FilterOutcome {
    let mut kept = BTreeMap::new();
    for (column, split) in splits {
        if !split.kept.is_empty() {
            kept.insert(column, split.kept);
        }
    }
    FilterOutcome { change_points: kept }
}

/// Runs the full pipeline: steps 1-4, then the boundary/expansion dance
/// of steps 5-6. `expander` is invoked at most once, only if at least one
/// surviving candidate sits in the early region.
///
/// Per §4.4 step 5 the expanded analysis "replaces the original result",
/// not just the early candidate's index: when expansion confirms, every
/// change point returned is re-derived from the expanded table, and that
/// table is returned alongside so the caller never mixes change-point
/// indices from two differently-shaped tables. `None` means the original
/// table and candidates (if any) stand unchanged.
pub async fn run(
    table: &AssembledTable,
    metrics: &[MetricSpec],
    acks: &[AckEntry],
    raw: AnalysisResult,
    config: BoundaryConfig,
    expander: &dyn Expander,
) -> (Option<AssembledTable>, FilterOutcome) {
    let survivors = apply_core_filters(table, metrics, acks, raw);
    let survivors = apply_correlation_gate(metrics, survivors);

    let mut any_early = false;
    let mut splits: BTreeMap<String, BoundarySplit> = BTreeMap::new();
    for (column, points) in survivors {
        let split = split_boundary(points, table.row_count(), config);
        if !split.early.is_empty() {
            any_early = true;
        }
        splits.insert(column, split);
    }

    if !any_early {
        return (None, collect_kept(splits));
    }

    let expanded = expander
        .expand(EXPANSION_LOOKBACK_INCREMENT_SECONDS, EXPANSION_ROW_INCREMENT)
        .await
        .filter(|(expanded_table, _)| expanded_table.row_count() > table.row_count());

    let Some((expanded_table, expanded_raw)) = expanded else {
        // No richer expansion: the early candidates are discarded (to be
        // revisited once more history naturally accumulates); any
        // already-qualified non-early candidates still stand.
        return (None, collect_kept(splits));
    };

    let expanded_survivors = apply_core_filters(&expanded_table, metrics, acks, expanded_raw);
    let expanded_survivors = apply_correlation_gate(metrics, expanded_survivors);

    let mut expanded_splits = BTreeMap::new();
    for (column, points) in expanded_survivors {
        expanded_splits.insert(column, split_boundary(points, expanded_table.row_count(), config));
    }

    (Some(expanded_table), collect_kept(expanded_splits))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AssembledRow, ComparativeStats, Direction};

    fn metric(name: &str, direction: Direction, threshold: f64) -> MetricSpec {
        MetricSpec {
            name: name.to_string(),
            metric_of_interest: "value".to_string(),
            agg: None,
            direction,
            threshold,
            labels: vec![],
            correlation: String::new(),
            context: 2,
            timestamp_field: None,
            selector: vec![],
        }
    }

    fn table_with_run_ids(run_ids: &[&str]) -> AssembledTable {
        let rows = run_ids
            .iter()
            .enumerate()
            .map(|(i, id)| AssembledRow {
                run_id: id.to_string(),
                timestamp: i as i64 * 30,
                version: "4.16".into(),
                build_url: "http://example.com".into(),
                metrics: BTreeMap::new(),
                display: BTreeMap::new(),
            })
            .collect();
        AssembledTable {
            rows,
            metric_columns: vec!["cpu_value".to_string()],
            display_columns: vec![],
        }
    }

    fn cp(index: usize, mean_before: f64, mean_after: f64) -> ChangePoint {
        ChangePoint {
            metric: "cpu_value".to_string(),
            index,
            time: index as i64 * 30,
            stats: ComparativeStats {
                mean_before,
                mean_after,
                std_before: 0.0,
                std_after: 0.0,
                p_value: 0.01,
            },
        }
    }

    #[test]
    fn direction_filter_drops_contradicting_movement() {
        let up = metric("cpu", 1, 0.0);
        let points = vec![cp(10, 100.0, 80.0)]; // went down, direction wants up
        assert!(direction_filter(&up, points).is_empty());
    }

    #[test]
    fn direction_zero_passes_everything() {
        let any = metric("cpu", 0, 0.0);
        let points = vec![cp(10, 100.0, 80.0), cp(11, 100.0, 130.0)];
        assert_eq!(direction_filter(&any, points).len(), 2);
    }

    #[test]
    fn ack_filter_drops_matching_run_and_metric() {
        let table = table_with_run_ids(&["a", "b", "c"]);
        let acks = vec![AckEntry { run_id: "b".into(), metric: "cpu_value".into() }];
        let points = vec![cp(1, 100.0, 130.0), cp(2, 100.0, 130.0)];
        let kept = ack_filter(&table, &acks, "cpu_value", points);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].index, 2);
    }

    #[test]
    fn threshold_filter_requires_relative_magnitude() {
        let m = metric("cpu", 0, 10.0);
        let points = vec![cp(1, 100.0, 105.0), cp(2, 100.0, 120.0)];
        let kept = threshold_filter(&m, points);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].index, 2);
    }

    #[test]
    fn correlation_gate_requires_nearby_survivor_in_correlated_metric() {
        let mut a = metric("A", 0, 0.0);
        a.correlation = "B".to_string();
        a.context = 2;
        let b = metric("B", 0, 0.0);

        let mut survivors = BTreeMap::new();
        survivors.insert("A_value".to_string(), vec![cp(25, 100.0, 130.0)]);
        survivors.insert("B_value".to_string(), vec![cp(27, 100.0, 130.0)]);

        let gated = apply_correlation_gate(&[a.clone(), b.clone()], survivors);
        assert!(gated.get("A_value").is_some());

        let mut survivors_far = BTreeMap::new();
        survivors_far.insert("A_value".to_string(), vec![cp(25, 100.0, 130.0)]);
        survivors_far.insert("B_value".to_string(), vec![cp(40, 100.0, 130.0)]);
        let gated_far = apply_correlation_gate(&[a, b], survivors_far);
        assert!(gated_far.get("A_value").is_none());
    }

    #[tokio::test]
    async fn early_candidate_discarded_when_expansion_not_richer() {
        let ids: Vec<String> = (0..10).map(|i| format!("run-{i}")).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let table = table_with_run_ids(&id_refs);
        let mut raw = AnalysisResult::default();
        raw.change_points.insert("cpu_value".to_string(), vec![cp(2, 100.0, 130.0)]);
        let metrics = vec![metric("cpu", 0, 0.0)];
        let (replacement, outcome) = run(&table, &metrics, &[], raw, BoundaryConfig::default(), &NoExpansion).await;
        assert!(replacement.is_none());
        assert!(outcome.change_points.is_empty());
    }

    struct ConfirmingExpander {
        table: AssembledTable,
        points: Vec<ChangePoint>,
    }

    #[async_trait]
    impl Expander for ConfirmingExpander {
        async fn expand(&self, _extra_lookback_seconds: i64, _extra_rows: usize) -> Option<(AssembledTable, AnalysisResult)> {
            let mut raw = AnalysisResult::default();
            raw.change_points.insert("cpu_value".to_string(), self.points.clone());
            Some((self.table.clone(), raw))
        }
    }

    #[tokio::test]
    async fn early_candidate_confirmed_by_expansion_replaces_table() {
        let ids: Vec<String> = (0..10).map(|i| format!("run-{i}")).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let table = table_with_run_ids(&id_refs);
        let mut raw = AnalysisResult::default();
        raw.change_points.insert("cpu_value".to_string(), vec![cp(2, 100.0, 130.0)]);
        let metrics = vec![metric("cpu", 0, 0.0)];

        let expanded_ids: Vec<String> = (0..16).map(|i| format!("run-{i}")).collect();
        let expanded_id_refs: Vec<&str> = expanded_ids.iter().map(String::as_str).collect();
        let expanded_table = table_with_run_ids(&expanded_id_refs);
        let expander = ConfirmingExpander {
            table: expanded_table.clone(),
            points: vec![cp(8, 100.0, 130.0)],
        };

        let (replacement, outcome) = run(&table, &metrics, &[], raw, BoundaryConfig::default(), &expander).await;
        let replacement = replacement.expect("expansion should replace the table");
        assert_eq!(replacement.row_count(), expanded_table.row_count());
        let points = outcome.change_points.get("cpu_value").expect("confirmed change point");
        assert_eq!(points[0].index, 8);
    }

    #[test]
    fn split_boundary_keeps_non_early_with_enough_future_rows() {
        let points = vec![cp(10, 100.0, 130.0)];
        let split = split_boundary(points, 20, BoundaryConfig::default());
        assert_eq!(split.kept.len(), 1);
        assert!(split.early.is_empty());
    }

    #[test]
    fn split_boundary_flags_early_index() {
        let points = vec![cp(2, 100.0, 130.0)];
        let split = split_boundary(points, 20, BoundaryConfig::default());
        assert!(split.kept.is_empty());
        assert_eq!(split.early.len(), 1);
    }

    #[test]
    fn split_boundary_discards_insufficient_future_data() {
        let points = vec![cp(18, 100.0, 130.0)];
        let split = split_boundary(points, 20, BoundaryConfig::default());
        assert!(split.kept.is_empty());
        assert!(split.early.is_empty());
    }
}
