//! Shared data model for the regression-detection pipeline.
//!
//! Mirrors the fingerprint / run descriptor / metric spec / assembled table
//! / change point shapes from the specification's data model section. Kept
//! dependency-free of any single component so the index client, assembler,
//! engine and filters can all speak the same vocabulary.

use std::collections::BTreeMap;

/// A RunID is an opaque string unique per benchmark execution. Benchmarks
/// in the wild use UUIDs, but also plain job identifiers, so this is kept
/// as a bare string rather than a `uuid::Uuid` newtype.
pub type RunId = String;

/// `-1`, `0`, or `+1`. `0` means "any direction is a candidate".
pub type Direction = i8;

pub const DIRECTION_DOWN: Direction = -1;
pub const DIRECTION_ANY: Direction = 0;
pub const DIRECTION_UP: Direction = 1;

/// The placeholder used when a source document carries neither `buildUrl`
/// nor `build_url`.
pub const BOGUS_BUILD_URL: &str = "http://bogus-url";

/// A single field match inside a [`Fingerprint`]: either an exact-match
/// clause or, for the reserved `ocpMajorVersion` field, a wildcard-match.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldMatch {
    Exact(String),
    Wildcard(String),
}

/// Metadata fingerprint: an ordered mapping from field name to match value,
/// with the two reserved forms from spec.md §3 modeled as their own
/// sub-fields rather than as magic keys mixed into the ordered list.
#[derive(Clone, Debug, Default)]
pub struct Fingerprint {
    /// Ordered `must` clauses, in the order the operator declared them.
    /// Dotted paths (e.g. `tags.sw_version`) are stored verbatim; the index
    /// client resolves them.
    pub fields: Vec<(String, FieldMatch)>,
    /// The `not` reserved key: a nested mapping whose entries must NOT
    /// match (`must_not` clauses).
    pub not_fields: Vec<(String, String)>,
    /// The `ocpMajorVersion` reserved key, when present.
    pub ocp_major_version: Option<String>,
}

impl Fingerprint {
    /// Builds a fingerprint from an ordered list of raw metadata entries,
    /// peeling off the two reserved keys (`not`, `ocpMajorVersion`) and the
    /// version field itself (handled separately by the caller, since its
    /// wildcard value depends on whether `ocpMajorVersion` was supplied).
    pub fn from_metadata(entries: Vec<(String, serde_json::Value)>, version_field: &str) -> Self {
        let mut fields = Vec::new();
        let mut not_fields = Vec::new();
        let mut ocp_major_version = None;

        for (key, value) in entries {
            if key == version_field {
                continue;
            }
            match key.as_str() {
                "not" => {
                    if let serde_json::Value::Object(map) = value {
                        for (nk, nv) in map {
                            not_fields.push((nk, value_to_match_string(&nv)));
                        }
                    }
                }
                "ocpMajorVersion" => {
                    ocp_major_version = Some(value_to_match_string(&value));
                }
                _ => {
                    fields.push((key, FieldMatch::Exact(value_to_match_string(&value))));
                }
            }
        }

        Self {
            fields,
            not_fields,
            ocp_major_version,
        }
    }

    /// Synthesizes a fingerprint from a single run's metadata document,
    /// restricted to a fixed field allow-list (SPEC_FULL §B.1, the
    /// `--uuid` entry path). Blank values (null, empty string, or zero) are
    /// dropped rather than turned into an always-matching clause.
    pub fn from_allow_list(source: &serde_json::Value, allow_list: &[&str]) -> Self {
        let mut fields = Vec::new();
        for &key in allow_list {
            let Some(value) = source.get(key) else { continue };
            if is_blank(value) {
                continue;
            }
            fields.push((key.to_string(), FieldMatch::Exact(value_to_match_string(value))));
        }
        Self {
            fields,
            not_fields: Vec::new(),
            ocp_major_version: None,
        }
    }

    /// The wildcard value used to filter on the version field: either the
    /// explicit `ocpMajorVersion` override, or the first four characters of
    /// the version-field value carried alongside the fingerprint.
    pub fn version_wildcard(&self, version_value: &str) -> String {
        match &self.ocp_major_version {
            Some(v) => v.clone(),
            None => version_value.chars().take(4).collect(),
        }
    }
}

fn value_to_match_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_blank(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.is_empty(),
        serde_json::Value::Number(n) => n.as_f64() == Some(0.0),
        _ => false,
    }
}

/// `{RunID, version-string, build-url-or-placeholder, optional display fields}`
#[derive(Clone, Debug, PartialEq)]
pub struct RunDescriptor {
    pub run_id: RunId,
    pub version: String,
    pub build_url: String,
    pub display: BTreeMap<String, String>,
}

/// `{value, agg_type}` for aggregated metrics.
#[derive(Clone, Debug, PartialEq)]
pub struct AggSpec {
    pub value: String,
    pub agg_type: String,
}

/// A single metric of interest, as declared in a test's `metrics` list.
#[derive(Clone, Debug)]
pub struct MetricSpec {
    pub name: String,
    pub metric_of_interest: String,
    pub agg: Option<AggSpec>,
    pub direction: Direction,
    pub threshold: f64,
    pub labels: Vec<String>,
    pub correlation: String,
    pub context: usize,
    pub timestamp_field: Option<String>,
    /// Extra selector clauses narrowing which documents this metric's
    /// values are drawn from (any metric key other than the ones above).
    pub selector: Vec<(String, serde_json::Value)>,
}

impl MetricSpec {
    /// `<metric.name>_<agg_type>` for aggregated metrics,
    /// `<metric.name>_<metric_of_interest>` otherwise.
    pub fn column_name(&self) -> String {
        match &self.agg {
            Some(agg) => format!("{}_{}", self.name, agg.agg_type),
            None => format!("{}_{}", self.name, self.metric_of_interest),
        }
    }
}

/// One row of the assembled table: RunID, timestamp, version, build URL,
/// metric columns (absent cells are `None`), and any configured display
/// columns.
#[derive(Clone, Debug, PartialEq)]
pub struct AssembledRow {
    pub run_id: RunId,
    pub timestamp: i64,
    pub version: String,
    pub build_url: String,
    pub metrics: BTreeMap<String, Option<f64>>,
    pub display: BTreeMap<String, String>,
}

/// The joined per-run row set fed to the change-point engine. Immutable
/// once built; the adaptive-expansion path in the post-filter pipeline
/// rebuilds a new table rather than mutating this one.
#[derive(Clone, Debug, Default)]
pub struct AssembledTable {
    pub rows: Vec<AssembledRow>,
    pub metric_columns: Vec<String>,
    pub display_columns: Vec<String>,
}

impl AssembledTable {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn timestamps(&self) -> Vec<i64> {
        self.rows.iter().map(|r| r.timestamp).collect()
    }

    pub fn column_values(&self, column: &str) -> Vec<Option<f64>> {
        self.rows
            .iter()
            .map(|r| r.metrics.get(column).copied().flatten())
            .collect()
    }

    pub fn index_of_run(&self, run_id: &str) -> Option<usize> {
        self.rows.iter().position(|r| r.run_id == run_id)
    }
}

/// Comparative statistics for a candidate change point.
#[derive(Clone, Debug, PartialEq)]
pub struct ComparativeStats {
    pub mean_before: f64,
    pub mean_after: f64,
    pub std_before: f64,
    pub std_after: f64,
    pub p_value: f64,
}

impl ComparativeStats {
    /// `(mean_after - mean_before) / |mean_before| * 100`. Returns `0.0`
    /// when `mean_before` is zero to avoid propagating NaN/inf into
    /// downstream threshold comparisons.
    pub fn percentage_change(&self) -> f64 {
        if self.mean_before == 0.0 {
            return 0.0;
        }
        (self.mean_after - self.mean_before) / self.mean_before.abs() * 100.0
    }
}

/// `{metric-column, index, time, stats}`
#[derive(Clone, Debug, PartialEq)]
pub struct ChangePoint {
    pub metric: String,
    pub index: usize,
    pub time: i64,
    pub stats: ComparativeStats,
}

/// `{run-id, metric-column}`
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AckEntry {
    pub run_id: RunId,
    pub metric: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_splits_reserved_keys() {
        let entries = vec![
            ("platform".to_string(), serde_json::json!("aws")),
            (
                "not".to_string(),
                serde_json::json!({"jobType": "pull"}),
            ),
            ("ocpMajorVersion".to_string(), serde_json::json!("4.16")),
            ("ocpVersion".to_string(), serde_json::json!("4.16.3")),
        ];
        let fp = Fingerprint::from_metadata(entries, "ocpVersion");
        assert_eq!(fp.fields, vec![("platform".to_string(), FieldMatch::Exact("aws".to_string()))]);
        assert_eq!(fp.not_fields, vec![("jobType".to_string(), "pull".to_string())]);
        assert_eq!(fp.ocp_major_version.as_deref(), Some("4.16"));
    }

    #[test]
    fn from_allow_list_drops_blank_fields() {
        let source = serde_json::json!({
            "platform": "aws",
            "clusterType": "",
            "masterNodesCount": 3,
            "workerNodesCount": 0,
            "ipsec": serde_json::Value::Null,
        });
        let fp = Fingerprint::from_allow_list(
            &source,
            &["platform", "clusterType", "masterNodesCount", "workerNodesCount", "ipsec"],
        );
        assert_eq!(
            fp.fields,
            vec![
                ("platform".to_string(), FieldMatch::Exact("aws".to_string())),
                ("masterNodesCount".to_string(), FieldMatch::Exact("3".to_string())),
            ]
        );
    }

    #[test]
    fn version_wildcard_falls_back_to_truncated_version() {
        let fp = Fingerprint::default();
        assert_eq!(fp.version_wildcard("4.16.3"), "4.16");
    }

    #[test]
    fn metric_column_name_uses_agg_type_when_present() {
        let m = MetricSpec {
            name: "cpu".into(),
            metric_of_interest: "value".into(),
            agg: Some(AggSpec { value: "value".into(), agg_type: "avg".into() }),
            direction: DIRECTION_UP,
            threshold: 5.0,
            labels: vec![],
            correlation: String::new(),
            context: 5,
            timestamp_field: None,
            selector: vec![],
        };
        assert_eq!(m.column_name(), "cpu_avg");
    }

    #[test]
    fn percentage_change_handles_zero_baseline() {
        let stats = ComparativeStats { mean_before: 0.0, mean_after: 10.0, std_before: 0.0, std_after: 0.0, p_value: 1.0 };
        assert_eq!(stats.percentage_change(), 0.0);
    }
}
