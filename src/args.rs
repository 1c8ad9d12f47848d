use clap::{Args, Parser, ValueEnum};
use thiserror::Error;

use crate::engine::AlgorithmTag;

#[derive(Error, Debug)]
pub enum ArgsError {
    #[error("malformed --lookback value {0:?}, expected a form like \"15d\" or \"3d12h\"")]
    MalformedLookback(String),
    #[error("malformed --since value {0:?}, expected YYYY-MM-DD")]
    MalformedSince(String),
    #[error("malformed --input-vars JSON: {0}")]
    MalformedInputVars(String),
}

/// hindsight: detects performance regressions in time-ordered benchmark
/// runs stored in an OpenSearch-compatible index.
#[derive(Debug, Parser)]
#[clap(name = "hindsight", version)]
pub struct App {
    /// Path to the test configuration document (YAML, template-expanded).
    #[clap(long = "config", short = 'c')]
    pub config: String,

    /// The ES_SERVER env variable takes precedence.
    #[clap(long = "es-server", env = "ES_SERVER")]
    pub es_server: String,

    #[clap(long = "metadata-index")]
    pub metadata_index: String,

    #[clap(flatten)]
    pub algorithm: AlgorithmSelection,

    #[clap(flatten)]
    pub lookback: LookbackOpts,

    #[clap(long = "output-format", value_enum, default_value_t = OutputFormat::Text)]
    pub output_format: OutputFormat,

    #[clap(long = "save-output-path")]
    pub save_output_path: Option<String>,

    /// Moving-average window for the anomaly-detection algorithm.
    #[clap(long = "anomaly-window", default_value_t = 5)]
    pub anomaly_window: usize,

    /// Minimum |percent change| against the trailing moving average to
    /// flag a row as a change point.
    #[clap(long = "min-anomaly-percent", default_value_t = 10.0)]
    pub min_anomaly_percent: f64,

    /// Metadata columns to carry through the pipeline into the report.
    #[clap(long = "display", value_delimiter = ',')]
    pub display: Option<Vec<String>>,

    #[clap(long = "ack", value_delimiter = ',')]
    pub ack: Option<Vec<String>>,

    #[clap(long = "no-ack", action)]
    pub no_ack: bool,

    #[clap(long = "convert-tinyurl", action)]
    pub convert_tinyurl: bool,

    #[clap(long = "collapse", action)]
    pub collapse: bool,

    #[clap(long = "sippy-pr-search", action)]
    pub sippy_pr_search: bool,

    #[clap(long = "pr-analysis", action)]
    pub pr_analysis: bool,

    #[clap(long = "node-count", action)]
    pub node_count: bool,

    #[clap(long = "github-repos", value_delimiter = ',')]
    pub github_repos: Option<Vec<String>>,

    /// JSON object merged over the environment as the template context.
    #[clap(long = "input-vars")]
    pub input_vars: Option<String>,

    /// Compare a single RunID against the metadata-resolved fingerprint.
    #[clap(long = "uuid")]
    pub uuid: Option<String>,

    /// Explicit comma/space-separated RunID list overriding fingerprint
    /// resolution.
    #[clap(long = "baseline")]
    pub baseline: Option<String>,
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
pub struct AlgorithmSelection {
    /// E-Divisive change-point detection.
    #[clap(long = "hunter-analyze", action)]
    pub hunter_analyze: bool,
    /// Isolation-forest anomaly detection with moving-average gating.
    #[clap(long = "anomaly-detection", action)]
    pub anomaly_detection: bool,
    /// Two-row comparative-mean gating.
    #[clap(long = "cmr", action)]
    pub cmr: bool,
}

impl AlgorithmSelection {
    pub fn tag(&self) -> AlgorithmTag {
        if self.anomaly_detection {
            AlgorithmTag::IsolationForestMovingAverage
        } else if self.cmr {
            AlgorithmTag::ComparativeMean
        } else {
            AlgorithmTag::EDivisive
        }
    }
}

#[derive(Debug, Args)]
pub struct LookbackOpts {
    /// `XdYh` style duration, e.g. "15d" or "3d12h".
    #[clap(long = "lookback")]
    pub lookback: Option<String>,
    /// `YYYY-MM-DD` absolute lower bound.
    #[clap(long = "since")]
    pub since: Option<String>,
    #[clap(long = "lookback-size", default_value_t = 10_000)]
    pub lookback_size: usize,
}

#[derive(Debug, ValueEnum, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Text,
    Junit,
}

/// Parses an `XdYh` style duration into seconds. Both components are
/// optional but at least one must be present.
pub fn parse_lookback_seconds(raw: &str) -> Result<i64, ArgsError> {
    let mut days: i64 = 0;
    let mut hours: i64 = 0;
    let mut seen = false;
    let mut number = String::new();

    for ch in raw.chars() {
        match ch {
            '0'..='9' => number.push(ch),
            'd' | 'D' => {
                days = number
                    .parse()
                    .map_err(|_| ArgsError::MalformedLookback(raw.to_string()))?;
                number.clear();
                seen = true;
            }
            'h' | 'H' => {
                hours = number
                    .parse()
                    .map_err(|_| ArgsError::MalformedLookback(raw.to_string()))?;
                number.clear();
                seen = true;
            }
            _ => return Err(ArgsError::MalformedLookback(raw.to_string())),
        }
    }

    if !seen || !number.is_empty() {
        return Err(ArgsError::MalformedLookback(raw.to_string()));
    }

    Ok(days * 86_400 + hours * 3_600)
}

/// Parses a `YYYY-MM-DD` date into a UTC midnight epoch-seconds value.
pub fn parse_since_seconds(raw: &str) -> Result<i64, ArgsError> {
    use chrono::NaiveDate;

    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| ArgsError::MalformedSince(raw.to_string()))?;
    Ok(date
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always valid")
        .and_utc()
        .timestamp())
}

/// Parses `--input-vars` into a flat string map.
pub fn parse_input_vars(raw: &str) -> Result<std::collections::BTreeMap<String, String>, ArgsError> {
    let value: serde_json::Value =
        serde_json::from_str(raw).map_err(|e| ArgsError::MalformedInputVars(e.to_string()))?;
    let obj = value
        .as_object()
        .ok_or_else(|| ArgsError::MalformedInputVars("expected a JSON object".to_string()))?;
    let mut out = std::collections::BTreeMap::new();
    for (k, v) in obj {
        let s = match v {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        out.insert(k.clone(), s);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookback_parses_days_and_hours() {
        assert_eq!(parse_lookback_seconds("15d").unwrap(), 15 * 86_400);
        assert_eq!(
            parse_lookback_seconds("3d12h").unwrap(),
            3 * 86_400 + 12 * 3_600
        );
    }

    #[test]
    fn lookback_rejects_garbage() {
        assert!(parse_lookback_seconds("abc").is_err());
        assert!(parse_lookback_seconds("").is_err());
    }

    #[test]
    fn input_vars_rejects_non_object() {
        assert!(parse_input_vars("[1,2,3]").is_err());
    }

    #[test]
    fn input_vars_flattens_scalars() {
        let vars = parse_input_vars(r#"{"branch": "main", "retries": 3}"#).unwrap();
        assert_eq!(vars.get("branch").unwrap(), "main");
        assert_eq!(vars.get("retries").unwrap(), "3");
    }
}
