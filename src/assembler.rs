//! Metric Assembler (C2): joins disjoint per-metric result sets from the
//! index client into one table keyed by RunID and sorted by time.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::index_client::{IndexClient, IndexError};
use crate::model::{AssembledRow, AssembledTable, MetricSpec, RunDescriptor};

#[derive(Error, Debug)]
pub enum AssemblerError {
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Builds the joined table for one test cycle. `descriptors` is the run-id
/// resolution from [`crate::index_client::IndexClient::lookup`] (or the
/// explicit baseline/uuid override); `convert_tinyurl` gates the optional
/// shortener pass over build URLs.
pub async fn assemble(
    client: &IndexClient,
    descriptors: &[RunDescriptor],
    metrics: &[MetricSpec],
    timestamp_field: &str,
    shortener: Option<&dyn crate::enrich::shortener::Shortener>,
    convert_tinyurl: bool,
    display_fields: &[String],
) -> Result<Option<AssembledTable>, AssemblerError> {
    if descriptors.is_empty() {
        return Ok(None);
    }

    let run_ids: Vec<String> = descriptors.iter().map(|d| d.run_id.clone()).collect();
    let version_by_run: BTreeMap<&str, &str> = descriptors
        .iter()
        .map(|d| (d.run_id.as_str(), d.version.as_str()))
        .collect();
    let build_url_by_run: BTreeMap<&str, &str> = descriptors
        .iter()
        .map(|d| (d.run_id.as_str(), d.build_url.as_str()))
        .collect();
    let display_by_run: BTreeMap<&str, &BTreeMap<String, String>> = descriptors
        .iter()
        .map(|d| (d.run_id.as_str(), &d.display))
        .collect();

    // (run-id -> (timestamp, value)) per metric column, preserving the
    // join's outer semantics: a metric that has no value for a run still
    // leaves that run's row in place.
    let mut per_metric: Vec<(String, BTreeMap<String, (Option<i64>, Option<f64>)>)> =
        Vec::with_capacity(metrics.len());

    for metric in metrics {
        let column = metric.column_name();
        let rows = if metric.agg.is_some() {
            client
                .aggregated_metric_values(&run_ids, metric, timestamp_field)
                .await?
        } else {
            client.metric_values(&run_ids, metric, timestamp_field).await?
        };
        let mut map = BTreeMap::new();
        for (run_id, ts, value) in rows {
            map.insert(run_id, (ts, value));
        }
        per_metric.push((column, map));
    }

    // Outer-join: union of every run-id touched by the lookup plus any
    // seen in a per-metric result (lookup is already the superset under
    // normal operation, but a later-added metric must not retroactively
    // shrink history for runs lookup already resolved).
    let mut all_run_ids: Vec<String> = run_ids.clone();
    for (_, map) in &per_metric {
        for run_id in map.keys() {
            if !all_run_ids.contains(run_id) {
                all_run_ids.push(run_id.clone());
            }
        }
    }

    let mut rows = Vec::with_capacity(all_run_ids.len());
    for run_id in &all_run_ids {
        let mut timestamp = None;
        let mut metric_values = BTreeMap::new();
        for (column, map) in &per_metric {
            let (ts, value) = map.get(run_id).cloned().unwrap_or((None, None));
            if timestamp.is_none() {
                timestamp = ts;
            }
            metric_values.insert(column.clone(), value);
        }
        let Some(timestamp) = timestamp else {
            // No metric produced a timestamp for this run; drop it, it
            // cannot be placed in a time-ordered table.
            continue;
        };

        let version = version_by_run.get(run_id.as_str()).map(|s| s.to_string()).unwrap_or_default();
        let mut build_url = build_url_by_run
            .get(run_id.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| crate::model::BOGUS_BUILD_URL.to_string());
        if convert_tinyurl {
            if let Some(shortener) = shortener {
                build_url = shortener.shorten(&build_url).await;
            }
        }
        let display = display_by_run
            .get(run_id.as_str())
            .map(|d| (*d).clone())
            .unwrap_or_default();

        rows.push(AssembledRow {
            run_id: run_id.clone(),
            timestamp,
            version,
            build_url,
            metrics: metric_values,
            display,
        });
    }

    if rows.is_empty() {
        return Ok(None);
    }

    rows.sort_by_key(|r| r.timestamp);

    let metric_columns = per_metric.into_iter().map(|(c, _)| c).collect();
    let display_columns = display_fields.to_vec();

    Ok(Some(AssembledTable {
        rows,
        metric_columns,
        display_columns,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RunDescriptor;

    fn descriptor(run_id: &str, version: &str) -> RunDescriptor {
        RunDescriptor {
            run_id: run_id.to_string(),
            version: version.to_string(),
            build_url: "http://example.com".to_string(),
            display: BTreeMap::new(),
        }
    }

    #[test]
    fn table_rows_sort_ascending_by_timestamp_after_manual_assembly() {
        // Exercises the same invariant assemble() enforces, without
        // standing up a real index client.
        let mut rows = vec![
            AssembledRow {
                run_id: "b".into(),
                timestamp: 200,
                version: "4.16".into(),
                build_url: "http://example.com".into(),
                metrics: BTreeMap::new(),
                display: BTreeMap::new(),
            },
            AssembledRow {
                run_id: "a".into(),
                timestamp: 100,
                version: "4.16".into(),
                build_url: "http://example.com".into(),
                metrics: BTreeMap::new(),
                display: BTreeMap::new(),
            },
        ];
        rows.sort_by_key(|r| r.timestamp);
        assert_eq!(rows[0].run_id, "a");
        assert_eq!(rows[1].run_id, "b");
    }

    #[test]
    fn descriptor_helper_builds_expected_shape() {
        let d = descriptor("run-1", "4.16.3");
        assert_eq!(d.run_id, "run-1");
        assert_eq!(d.version, "4.16.3");
    }
}
