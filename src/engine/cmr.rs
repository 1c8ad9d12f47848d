//! Comparative-Mean (CMR): collapses all rows but the last into a single
//! averaged baseline row, then emits exactly one change point per metric
//! at `index = 1` comparing baseline against the latest observation.

use crate::model::{AssembledTable, ChangePoint, ComparativeStats, MetricSpec};

use super::{mean_of, stddev_of, AnalysisResult, ChangePointAlgorithm, EngineError};

#[derive(Default)]
pub struct ComparativeMean;

impl ChangePointAlgorithm for ComparativeMean {
    fn analyze(&self, table: &AssembledTable, metrics: &[MetricSpec]) -> Result<AnalysisResult, EngineError> {
        if table.is_empty() {
            return Err(EngineError::EmptyInput);
        }
        if table.row_count() < 2 {
            // Nothing to compare a single row against; no candidates.
            return Ok(AnalysisResult::default());
        }

        let mut result = AnalysisResult::default();
        let last_index = table.row_count() - 1;

        for metric in metrics {
            let column = metric.column_name();
            let values = table.column_values(&column);
            let prior = &values[..last_index];
            let latest = values[last_index];

            let mean_before = mean_of(prior);
            let std_before = stddev_of(prior);
            let Some(mean_after) = latest else {
                continue;
            };

            let stats = ComparativeStats {
                mean_before,
                mean_after,
                std_before,
                std_after: 0.0,
                p_value: 0.0,
            };

            result.change_points.insert(
                column.clone(),
                vec![ChangePoint {
                    metric: column,
                    index: 1,
                    time: table.rows[last_index].timestamp,
                    stats,
                }],
            );
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AssembledRow, Direction};
    use std::collections::BTreeMap;

    fn metric(name: &str) -> MetricSpec {
        MetricSpec {
            name: name.to_string(),
            metric_of_interest: "value".to_string(),
            agg: None,
            direction: 1 as Direction,
            threshold: 10.0,
            labels: vec![],
            correlation: String::new(),
            context: 5,
            timestamp_field: None,
            selector: vec![],
        }
    }

    fn table_with(values: &[f64]) -> AssembledTable {
        let metric = metric("cpu");
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
    fn emits_one_change_point_at_index_one() {
        let mut values = vec![100.0; 9];
        values.push(130.0);
        let table = table_with(&values);
        let metrics = vec![metric("cpu")];

        let result = ComparativeMean.analyze(&table, &metrics).unwrap();
        let points = result.change_points.get("cpu_value").unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].index, 1);
        assert_eq!(points[0].stats.mean_before, 100.0);
        assert_eq!(points[0].stats.mean_after, 130.0);
        assert_eq!(points[0].stats.percentage_change(), 30.0);
    }

    #[test]
    fn single_row_yields_no_candidates() {
        let table = table_with(&[100.0]);
        let metrics = vec![metric("cpu")];
        let result = ComparativeMean.analyze(&table, &metrics).unwrap();
        assert!(result.change_points.is_empty());
    }
}
