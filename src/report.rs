//! Report Formatter (C6): records (structured), text (tabular), and
//! JUnit XML output, all built from the same per-row record shape
//! (§4.6). XML construction mirrors `orion/utils.py::json_to_junit` and
//! `generate_tabular_output` by hand, using `std::fmt::Write` the way
//! spec.md §9 directs ("the pack has no shared XML-writer crate, so the
//! original's structure is reproduced directly").

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::Serialize;
use tabled::builder::Builder;
use tabled::settings::Style;

use crate::enrich::github::ChangeContext;
use crate::model::{AssembledTable, ChangePoint, MetricSpec};

#[derive(Clone, Debug, Serialize)]
pub struct MetricCell {
    pub value: Option<f64>,
    pub percentage_change: f64,
    pub labels: Vec<String>,
}

/// One object per row: `{RunID, timestamp, buildUrl, version, metrics,
/// is_changepoint, optional github_context, optional display fields}`.
#[derive(Clone, Debug, Serialize)]
pub struct Record {
    pub run_id: String,
    pub timestamp: i64,
    pub timestamp_iso: String,
    pub build_url: String,
    pub version: String,
    pub metrics: BTreeMap<String, MetricCell>,
    pub is_changepoint: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub github_context: Option<ChangeContext>,
    #[serde(flatten)]
    pub display: BTreeMap<String, String>,
}

/// Builds the uniform per-row record set from an assembled table plus the
/// post-filter survivors. A row is `is_changepoint` for a given metric iff
/// it is that metric's change-point index; `percentage_change` is 0 for
/// every other row (§9 "CMR inserts percentage_change=0 ... downstream
/// filters still interpret them" — the regression flag must never be
/// derived from these decorated rows, only from `change_points` itself).
pub fn build_records(table: &AssembledTable, change_points: &BTreeMap<String, Vec<ChangePoint>>) -> Vec<Record> {
    let mut changepoint_index: BTreeMap<&str, &ChangePoint> = BTreeMap::new();
    for (column, points) in change_points {
        for cp in points {
            changepoint_index.insert(column.as_str(), cp);
        }
    }

    table
        .rows
        .iter()
        .enumerate()
        .map(|(idx, row)| {
            let mut metrics = BTreeMap::new();
            let mut is_changepoint = false;
            for column in &table.metric_columns {
                let value = row.metrics.get(column).copied().flatten();
                let (percentage_change, hit) = change_points
                    .get(column)
                    .and_then(|points| points.iter().find(|cp| cp.index == idx))
                    .map(|cp| (cp.stats.percentage_change(), true))
                    .unwrap_or((0.0, false));
                is_changepoint |= hit;
                metrics.insert(
                    column.clone(),
                    MetricCell {
                        value,
                        percentage_change,
                        labels: Vec::new(),
                    },
                );
            }

            Record {
                run_id: row.run_id.clone(),
                timestamp: row.timestamp,
                timestamp_iso: format_iso8601(row.timestamp),
                build_url: row.build_url.clone(),
                version: row.version.clone(),
                metrics,
                is_changepoint,
                github_context: None,
                display: row.display.clone(),
            }
        })
        .collect()
}

/// Attaches metric labels from the test's metric specs onto each record's
/// metric cells, so the label list travels with the rendered output.
pub fn attach_labels(records: &mut [Record], metrics: &[MetricSpec]) {
    for record in records {
        for metric in metrics {
            let column = metric.column_name();
            if let Some(cell) = record.metrics.get_mut(&column) {
                cell.labels = metric.labels.clone();
            }
        }
    }
}

fn format_iso8601(seconds: i64) -> String {
    chrono::DateTime::from_timestamp(seconds, 0)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_default()
}

/// When `collapse` is set, only change-point rows and their immediate
/// neighbors (±1) survive, matching `generate_tabular_output`'s collapse
/// branch.
fn collapse_rows(records: &[Record]) -> Vec<usize> {
    let mut keep = Vec::new();
    for (i, record) in records.iter().enumerate() {
        if record.is_changepoint {
            if i > 0 && !keep.contains(&(i - 1)) {
                keep.push(i - 1);
            }
            keep.push(i);
            if i + 1 < records.len() {
                keep.push(i + 1);
            }
        }
    }
    keep.sort_unstable();
    keep.dedup();
    keep
}

/// Text table: change-point rows marked inline, any configured display
/// columns appended after the metric columns.
pub fn render_text(test_name: &str, records: &[Record], table: &AssembledTable, collapse: bool) -> String {
    let indices: Vec<usize> = if collapse {
        collapse_rows(records)
    } else {
        (0..records.len()).collect()
    };

    let mut header = vec!["uuid".to_string(), "timestamp".to_string(), "buildUrl".to_string(), "version".to_string()];
    header.extend(table.metric_columns.iter().cloned());
    header.extend(table.display_columns.iter().cloned());

    let mut builder = Builder::default();
    builder.push_record(header);

    for &i in &indices {
        let record = &records[i];
        let mut row = vec![
            record.run_id.clone(),
            record.timestamp_iso.clone(),
            record.build_url.clone(),
            record.version.clone(),
        ];
        for column in &table.metric_columns {
            let value = record
                .metrics
                .get(column)
                .and_then(|c| c.value)
                .map(|v| v.to_string())
                .unwrap_or_else(|| "null".to_string());
            row.push(value);
        }
        for column in &table.display_columns {
            row.push(record.display.get(column).cloned().unwrap_or_default());
        }
        builder.push_record(row);
    }

    let mut rendered = builder.build();
    rendered.with(Style::psql());
    let mut out = format!("Test: {test_name}\n");
    let rendered_str = rendered.to_string();
    for (line_no, line) in rendered_str.lines().enumerate() {
        // Header + separator occupy the first two lines; data starts at 2.
        if line_no >= 2 && indices.get(line_no - 2).map(|&i| records[i].is_changepoint).unwrap_or(false) {
            let _ = writeln!(out, "{line} -- changepoint");
        } else {
            let _ = writeln!(out, "{line}");
        }
    }
    out
}

/// Records-form (structured) output, honoring `collapse`.
pub fn render_records(records: &[Record], collapse: bool) -> Vec<Record> {
    if !collapse {
        return records.to_vec();
    }
    collapse_rows(records).into_iter().map(|i| records[i].clone()).collect()
}

/// JUnit XML: one test-suite per test, one test-case per metric; a
/// test-case is a failure iff any row has non-zero percentage change for
/// that metric, with the tabular rendering embedded in the failure text.
pub fn render_junit(test_name: &str, records: &[Record], table: &AssembledTable, metrics: &[MetricSpec], collapse: bool) -> String {
    let mut failures = 0usize;
    let mut testcases = String::new();

    for metric in metrics {
        let column = metric.column_name();
        let label_string = metric.labels.join(" ");
        let name = format!("{label_string} {column} regression detection").trim().to_string();

        let has_failure = records
            .iter()
            .any(|r| r.metrics.get(&column).map(|c| c.percentage_change != 0.0).unwrap_or(false));

        if has_failure {
            failures += 1;
            let body = render_metric_table(records, table, &column, collapse);
            let _ = write!(
                testcases,
                "    <testcase name=\"{}\" timestamp=\"0\">\n      <failure>\n{}\n      </failure>\n    </testcase>\n",
                xml_escape(&name),
                xml_escape(&body),
            );
        } else {
            let _ = write!(
                testcases,
                "    <testcase name=\"{}\" timestamp=\"0\"/>\n",
                xml_escape(&name),
            );
        }
    }

    format!(
        "<?xml version=\"1.0\" ?>\n<testsuites>\n  <testsuite name=\"{} nightly compare\" tests=\"{}\" failures=\"{}\">\n{}  </testsuite>\n</testsuites>\n",
        xml_escape(test_name),
        metrics.len(),
        failures,
        testcases,
    )
}

fn render_metric_table(records: &[Record], table: &AssembledTable, column: &str, collapse: bool) -> String {
    let indices: Vec<usize> = if collapse {
        collapse_rows(records)
    } else {
        (0..records.len()).collect()
    };

    let mut builder = Builder::default();
    builder.push_record(vec!["uuid", "timestamp", "buildUrl", column, "is_changepoint", "percentage_change"]);
    for &i in &indices {
        let record = &records[i];
        let cell = record.metrics.get(column);
        builder.push_record(vec![
            record.run_id.clone(),
            record.timestamp_iso.clone(),
            record.build_url.clone(),
            cell.and_then(|c| c.value).map(|v| v.to_string()).unwrap_or_else(|| "null".to_string()),
            cell.map(|c| c.percentage_change != 0.0).unwrap_or(false).to_string(),
            cell.map(|c| c.percentage_change).unwrap_or(0.0).to_string(),
        ]);
    }
    let _ = table; // kept for signature symmetry with render_text
    let mut rendered = builder.build();
    rendered.with(Style::psql());
    rendered.to_string()
}

fn xml_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AssembledRow, ComparativeStats};

    fn table() -> AssembledTable {
        let mut rows = Vec::new();
        for i in 0..5 {
            let mut metrics = BTreeMap::new();
            metrics.insert("cpu_value".to_string(), Some(100.0 + i as f64));
            rows.push(AssembledRow {
                run_id: format!("run-{i}"),
                timestamp: i as i64 * 30,
                version: "4.16".to_string(),
                build_url: "http://example.com".to_string(),
                metrics,
                display: BTreeMap::new(),
            });
        }
        AssembledTable {
            rows,
            metric_columns: vec!["cpu_value".to_string()],
            display_columns: vec![],
        }
    }

    fn change_points() -> BTreeMap<String, Vec<ChangePoint>> {
        let mut m = BTreeMap::new();
        m.insert(
            "cpu_value".to_string(),
            vec![ChangePoint {
                metric: "cpu_value".to_string(),
                index: 3,
                time: 90,
                stats: ComparativeStats { mean_before: 100.0, mean_after: 130.0, std_before: 0.0, std_after: 0.0, p_value: 0.01 },
            }],
        );
        m
    }

    #[test]
    fn build_records_marks_the_changepoint_row() {
        let table = table();
        let cps = change_points();
        let records = build_records(&table, &cps);
        assert_eq!(records.len(), 5);
        assert!(records[3].is_changepoint);
        assert!(!records[2].is_changepoint);
        assert_eq!(records[3].metrics["cpu_value"].percentage_change, 30.0);
    }

    #[test]
    fn collapse_keeps_only_changepoint_neighborhood() {
        let table = table();
        let cps = change_points();
        let records = build_records(&table, &cps);
        let kept = collapse_rows(&records);
        assert_eq!(kept, vec![2, 3, 4]);
    }

    #[test]
    fn render_text_marks_changepoint_row_inline() {
        let table = table();
        let cps = change_points();
        let records = build_records(&table, &cps);
        let text = render_text("my-test", &records, &table, false);
        assert!(text.contains("-- changepoint"));
    }

    #[test]
    fn render_junit_counts_one_failure() {
        let table = table();
        let cps = change_points();
        let records = build_records(&table, &cps);
        let metrics = vec![MetricSpec {
            name: "cpu".into(),
            metric_of_interest: "value".into(),
            agg: None,
            direction: 1,
            threshold: 5.0,
            labels: vec![],
            correlation: String::new(),
            context: 5,
            timestamp_field: None,
            selector: vec![],
        }];
        let xml = render_junit("my-test", &records, &table, &metrics, false);
        assert!(xml.contains("failures=\"1\""));
        assert!(xml.contains("<failure>"));
    }
}
