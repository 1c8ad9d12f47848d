//! Configuration loading: YAML documents expanded through a Jinja-style
//! template pass, then resolved through the `parentConfig` / `metricsFile`
//! inheritance rules, plus acknowledgement-file loading.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use minijinja::{Environment, UndefinedBehavior};
use serde::Deserialize;
use thiserror::Error;

use crate::model::{AckEntry, AggSpec, Direction, MetricSpec};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("template error in {path}: {source}")]
    Template {
        path: PathBuf,
        #[source]
        source: minijinja::Error,
    },
    #[error("malformed YAML in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("malformed ack file {path}: {source}")]
    AckYaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("test {0:?} declares no metrics")]
    NoMetrics(String),
}

fn default_version_field() -> String {
    "ocpVersion".to_string()
}

fn default_uuid_field() -> String {
    "uuid".to_string()
}

fn default_timestamp_field() -> String {
    "timestamp".to_string()
}

fn default_context() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
struct RawConfig {
    #[serde(default)]
    tests: Vec<RawTest>,
}

#[derive(Debug, Deserialize, Clone)]
struct RawTest {
    name: String,
    #[serde(default)]
    metadata: serde_yaml::Mapping,
    metadata_index: Option<String>,
    benchmark_index: Option<String>,
    #[serde(default = "default_version_field")]
    version_field: String,
    #[serde(default = "default_uuid_field")]
    uuid_field: String,
    #[serde(default = "default_timestamp_field", rename = "timestamp")]
    timestamp_field: String,
    threshold: Option<f64>,
    #[serde(default)]
    metrics: Vec<RawMetric>,
    #[serde(rename = "parentConfig")]
    parent_config: Option<String>,
    #[serde(rename = "metricsFile")]
    metrics_file: Option<String>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
struct RawMetric {
    name: String,
    metric_of_interest: String,
    agg: Option<RawAgg>,
    #[serde(default)]
    direction: Direction,
    #[serde(default)]
    threshold: f64,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    correlation: String,
    #[serde(default = "default_context")]
    context: usize,
    timestamp: Option<String>,
    #[serde(flatten)]
    selector: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
struct RawAgg {
    value: String,
    agg_type: String,
}

#[derive(Debug, Deserialize, Clone)]
struct RawMetricsFile {
    #[serde(default)]
    metrics: Vec<RawMetric>,
}

#[derive(Debug, Deserialize, Clone)]
struct RawAckDocument {
    #[serde(default)]
    ack: Vec<RawAckEntry>,
}

#[derive(Debug, Deserialize, Clone)]
struct RawAckEntry {
    uuid: String,
    metric: String,
}

/// A fully resolved test, after inheritance and template expansion.
#[derive(Debug, Clone)]
pub struct TestConfig {
    pub name: String,
    /// Ordered metadata entries, reserved keys (`not`, `ocpMajorVersion`)
    /// included verbatim for [`crate::model::Fingerprint::from_metadata`].
    pub metadata: Vec<(String, serde_json::Value)>,
    pub metadata_index: Option<String>,
    pub benchmark_index: Option<String>,
    pub version_field: String,
    pub uuid_field: String,
    pub timestamp_field: String,
    pub threshold: Option<f64>,
    pub metrics: Vec<MetricSpec>,
}

impl TestConfig {
    pub fn pull_request_number(&self) -> Option<u64> {
        self.metadata.iter().find_map(|(k, v)| {
            if k == "pullNumber" {
                v.as_u64().filter(|n| *n != 0)
            } else {
                None
            }
        })
    }

    pub fn metadata_str(&self, key: &str) -> Option<String> {
        self.metadata.iter().find_map(|(k, v)| {
            if k == key {
                Some(match v {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
            } else {
                None
            }
        })
    }

    /// Resolves the version-field's own value out of the raw metadata
    /// list (it is excluded from the fingerprint itself, but still names
    /// the wildcard-match target per §4.1).
    pub fn version_field_value(&self) -> String {
        self.metadata_str(&self.version_field).unwrap_or_default()
    }

    /// Inserts or overwrites a metadata entry, preserving declaration
    /// order for pre-existing keys.
    pub fn set_metadata(&mut self, key: &str, value: serde_json::Value) {
        if let Some(entry) = self.metadata.iter_mut().find(|(k, _)| k == key) {
            entry.1 = value;
        } else {
            self.metadata.push((key.to_string(), value));
        }
    }

    pub fn remove_metadata(&mut self, key: &str) {
        self.metadata.retain(|(k, _)| k != key);
    }

    pub fn fingerprint(&self) -> crate::model::Fingerprint {
        crate::model::Fingerprint::from_metadata(self.metadata.clone(), &self.version_field)
    }
}

/// Renders `source` as a minijinja template, using `vars` merged over a
/// lower-cased snapshot of the process environment. Undefined variables
/// are a hard error, matching `jinja2.StrictUndefined` in the system this
/// was distilled from.
pub fn render_template(
    path: &Path,
    source: &str,
    vars: &BTreeMap<String, String>,
) -> Result<String, ConfigError> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);

    let mut context = BTreeMap::new();
    for (key, value) in std::env::vars() {
        context.insert(key.to_lowercase(), value);
    }
    for (key, value) in vars {
        context.insert(key.clone(), value.clone());
    }

    env.add_template("config", source)
        .map_err(|source| ConfigError::Template {
            path: path.to_path_buf(),
            source,
        })?;
    let tmpl = env.get_template("config").expect("just inserted");
    tmpl.render(&context).map_err(|source| ConfigError::Template {
        path: path.to_path_buf(),
        source,
    })
}

fn read_and_render(path: &Path, vars: &BTreeMap<String, String>) -> Result<String, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    render_template(path, &raw, vars)
}

fn resolve_metadata(mapping: &serde_yaml::Mapping) -> Vec<(String, serde_json::Value)> {
    mapping
        .iter()
        .filter_map(|(k, v)| {
            let key = k.as_str()?.to_string();
            let value = serde_yaml::from_value::<serde_json::Value>(v.clone()).ok()?;
            Some((key, value))
        })
        .collect()
}

fn to_metric_spec(raw: RawMetric) -> MetricSpec {
    MetricSpec {
        name: raw.name,
        metric_of_interest: raw.metric_of_interest,
        agg: raw.agg.map(|a| AggSpec {
            value: a.value,
            agg_type: a.agg_type,
        }),
        direction: raw.direction,
        threshold: raw.threshold,
        labels: raw.labels,
        correlation: raw.correlation,
        context: raw.context,
        timestamp_field: raw.timestamp,
        selector: raw.selector.into_iter().collect(),
    }
}

/// Merges a child test's metrics over metrics inherited from a parent or a
/// metrics file: the child's own metrics keep their order and take
/// precedence; inherited metrics not already present (by name) are
/// appended.
fn merge_metrics(child: Vec<RawMetric>, inherited: Vec<RawMetric>) -> Vec<RawMetric> {
    let mut merged = child;
    for metric in inherited {
        if !merged.iter().any(|m| m.name == metric.name) {
            merged.push(metric);
        }
    }
    merged
}

/// Shallow-merges a child test's metadata over a parent's: child keys win,
/// parent-only keys are carried forward.
fn merge_metadata(child: &serde_yaml::Mapping, parent: &serde_yaml::Mapping) -> serde_yaml::Mapping {
    let mut merged = parent.clone();
    for (k, v) in child {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

fn resolve_raw_test(
    mut test: RawTest,
    config_dir: &Path,
    vars: &BTreeMap<String, String>,
) -> Result<RawTest, ConfigError> {
    if let Some(parent_path) = test.parent_config.take() {
        let full_path = config_dir.join(&parent_path);
        let rendered = read_and_render(&full_path, vars)?;
        let parent_cfg: RawConfig =
            serde_yaml::from_str(&rendered).map_err(|source| ConfigError::Yaml {
                path: full_path.clone(),
                source,
            })?;
        if let Some(parent_test) = parent_cfg.tests.into_iter().next() {
            let parent_test = resolve_raw_test(parent_test, config_dir, vars)?;
            test.metadata = merge_metadata(&test.metadata, &parent_test.metadata);
            test.metrics = merge_metrics(test.metrics, parent_test.metrics);
            test.metadata_index = test.metadata_index.or(parent_test.metadata_index);
            test.benchmark_index = test.benchmark_index.or(parent_test.benchmark_index);
            test.threshold = test.threshold.or(parent_test.threshold);
        }
    }

    if let Some(metrics_file) = test.metrics_file.take() {
        let full_path = config_dir.join(&metrics_file);
        let rendered = read_and_render(&full_path, vars)?;
        let metrics_cfg: RawMetricsFile =
            serde_yaml::from_str(&rendered).map_err(|source| ConfigError::Yaml {
                path: full_path,
                source,
            })?;
        test.metrics = merge_metrics(test.metrics, metrics_cfg.metrics);
    }

    Ok(test)
}

/// Loads and fully resolves the `tests` sequence from a configuration
/// document: template expansion, then `parentConfig`/`metricsFile`
/// inheritance, then conversion into the pipeline's own types.
pub fn load_config(path: &Path, vars: &BTreeMap<String, String>) -> Result<Vec<TestConfig>, ConfigError> {
    let rendered = read_and_render(path, vars)?;
    let raw: RawConfig = serde_yaml::from_str(&rendered).map_err(|source| ConfigError::Yaml {
        path: path.to_path_buf(),
        source,
    })?;

    let config_dir = path.parent().unwrap_or_else(|| Path::new("."));

    let mut tests = Vec::with_capacity(raw.tests.len());
    for raw_test in raw.tests {
        let raw_test = resolve_raw_test(raw_test, config_dir, vars)?;
        if raw_test.metrics.is_empty() {
            return Err(ConfigError::NoMetrics(raw_test.name));
        }
        tests.push(TestConfig {
            name: raw_test.name,
            metadata: resolve_metadata(&raw_test.metadata),
            metadata_index: raw_test.metadata_index,
            benchmark_index: raw_test.benchmark_index,
            version_field: raw_test.version_field,
            uuid_field: raw_test.uuid_field,
            timestamp_field: raw_test.timestamp_field,
            threshold: raw_test.threshold,
            metrics: raw_test.metrics.into_iter().map(to_metric_spec).collect(),
        });
    }

    Ok(tests)
}

/// Loads one or more ack files and merges their `ack` lists by union.
pub fn load_acks(paths: &[PathBuf]) -> Result<Vec<AckEntry>, ConfigError> {
    let mut merged = Vec::new();
    for path in paths {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let doc: RawAckDocument =
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::AckYaml {
                path: path.clone(),
                source,
            })?;
        for entry in doc.ack {
            let ack = AckEntry {
                run_id: entry.uuid,
                metric: entry.metric,
            };
            if !merged.contains(&ack) {
                merged.push(ack);
            }
        }
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    #[test]
    fn renders_simple_template() {
        let out = render_template(Path::new("t.yaml"), "value: {{ branch }}", &{
            let mut v = BTreeMap::new();
            v.insert("branch".to_string(), "main".to_string());
            v
        })
        .unwrap();
        assert_eq!(out.trim(), "value: main");
    }

    #[test]
    fn strict_undefined_is_an_error() {
        let err = render_template(Path::new("t.yaml"), "value: {{ missing }}", &vars());
        assert!(err.is_err());
    }

    #[test]
    fn merge_metrics_prefers_child_order_and_fills_gaps() {
        let child = vec![RawMetric {
            name: "cpu".into(),
            metric_of_interest: "value".into(),
            agg: None,
            direction: 1,
            threshold: 5.0,
            labels: vec![],
            correlation: String::new(),
            context: 5,
            timestamp: None,
            selector: BTreeMap::new(),
        }];
        let inherited = vec![
            child[0].clone(),
            RawMetric {
                name: "mem".into(),
                metric_of_interest: "value".into(),
                agg: None,
                direction: 1,
                threshold: 5.0,
                labels: vec![],
                correlation: String::new(),
                context: 5,
                timestamp: None,
                selector: BTreeMap::new(),
            },
        ];
        let merged = merge_metrics(child, inherited);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].name, "cpu");
        assert_eq!(merged[1].name, "mem");
    }

    #[test]
    fn load_acks_unions_across_files() {
        let dir = std::env::temp_dir();
        let p1 = dir.join("hindsight_test_ack1.yaml");
        let p2 = dir.join("hindsight_test_ack2.yaml");
        std::fs::write(&p1, "ack:\n  - uuid: run-1\n    metric: cpu_avg\n").unwrap();
        std::fs::write(&p2, "ack:\n  - uuid: run-1\n    metric: cpu_avg\n  - uuid: run-2\n    metric: mem_avg\n").unwrap();
        let acks = load_acks(&[p1.clone(), p2.clone()]).unwrap();
        assert_eq!(acks.len(), 2);
        std::fs::remove_file(p1).ok();
        std::fs::remove_file(p2).ok();
    }
}
