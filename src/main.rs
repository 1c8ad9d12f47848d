//! Pipeline driver: parses arguments, resolves configuration and
//! acknowledgements, runs the coordinator per configured test, and renders
//! results in the requested output format (§6 Invocation surface, §7
//! Propagation policy).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use thiserror::Error;

mod args;
mod assembler;
mod config;
mod coordinator;
mod engine;
mod enrich;
mod filter;
mod index_client;
mod logging;
mod model;
mod report;

use args::{App, OutputFormat};
use coordinator::{CycleParams, SharedOptions, TestResult};
use enrich::github::GithubClient;
use enrich::shortener::{NoopShortener, Shortener, TinyUrlShortener};
use enrich::sippy::SippyClient;
use logging::Logger;
use model::{AckEntry, MetricSpec};

const EXIT_SUCCESS: u8 = 0;
const EXIT_REGRESSION: u8 = 2;
const EXIT_NO_DATA: u8 = 3;

#[derive(Error, Debug)]
enum DriverError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Args(#[from] args::ArgsError),
    #[error(transparent)]
    Coordinator(#[from] coordinator::CoordinatorError),
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run() -> Result<u8> {
    let app = App::parse();
    logging::init(false);
    let logger = Logger::new("hindsight");

    let vars = match &app.input_vars {
        Some(raw) => args::parse_input_vars(raw).map_err(DriverError::Args)?,
        None => BTreeMap::new(),
    };

    let config_path = PathBuf::from(&app.config);
    let tests = config::load_config(&config_path, &vars).map_err(DriverError::Config)?;
    let acks = resolve_acks(&app)?;

    let algorithm = app.algorithm.tag();
    let algorithm_options = engine::AlgorithmOptions {
        anomaly_window: app.anomaly_window,
        min_anomaly_percent: app.min_anomaly_percent,
    };

    let shortener: Box<dyn Shortener> = if app.convert_tinyurl {
        Box::new(TinyUrlShortener::new(Logger::new("shortener")))
    } else {
        Box::new(NoopShortener)
    };

    let github = app
        .github_repos
        .as_ref()
        .map(|_| GithubClient::new(Logger::new("github")));
    let sippy = (app.sippy_pr_search || app.pr_analysis)
        .then(|| SippyClient::new("https://sippy.dptools.openshift.org", Logger::new("sippy")));

    let lookback_start = resolve_lookback(&app)?;
    let baseline = app.baseline.as_deref().map(parse_id_list);

    let mut any_regression = false;
    let mut no_data_seen = false;

    for test in &tests {
        let mut test = test.clone();
        if let Some(default_threshold) = test.threshold {
            for metric in &mut test.metrics {
                if metric.threshold == 0.0 {
                    metric.threshold = default_threshold;
                }
            }
        }

        let shared = SharedOptions {
            es_server: app.es_server.clone(),
            metadata_index: app.metadata_index.clone(),
            algorithm,
            algorithm_options,
            boundary: filter::BoundaryConfig::default(),
            acks: acks.clone(),
            display_fields: app.display.clone().unwrap_or_default(),
            convert_tinyurl: app.convert_tinyurl,
            baseline: baseline.clone(),
            uuid: app.uuid.clone(),
            node_count: app.node_count,
        };
        let params = CycleParams {
            lookback_start,
            lookback_end: None,
            max_rows: app.lookback.lookback_size,
        };

        logger.info(format!("analyzing test {:?}", test.name));
        let results = coordinator::analyze_test(
            &shared,
            &test,
            params,
            logger,
            github.as_ref(),
            Some(shortener.as_ref()),
        )
        .await
        .map_err(DriverError::Coordinator)?;

        if results.periodic.outcome.table.is_none() {
            no_data_seen = true;
            logger.warn(format!("test {:?}: no data matched the fingerprint", test.name));
            continue;
        }

        let periodic_regression = emit_variant(
            &app,
            &results.periodic,
            "",
            &test.metrics,
            github.as_ref(),
            &app.github_repos,
            sippy.as_ref(),
            app.sippy_pr_search,
        )
        .await?;
        any_regression |= periodic_regression;

        if let Some(pull) = &results.pull {
            if pull.outcome.table.is_some() {
                let pull_regression = emit_variant(
                    &app,
                    pull,
                    "_pull",
                    &test.metrics,
                    github.as_ref(),
                    &app.github_repos,
                    sippy.as_ref(),
                    app.sippy_pr_search,
                )
                .await?;
                any_regression |= pull_regression;
            }
        }
    }

    if any_regression {
        Ok(EXIT_REGRESSION)
    } else if no_data_seen {
        Ok(EXIT_NO_DATA)
    } else {
        Ok(EXIT_SUCCESS)
    }
}

/// Renders and emits one test variant's result, returning whether it is a
/// confirmed regression.
async fn emit_variant(
    app: &App,
    result: &TestResult,
    suffix: &str,
    metrics: &[MetricSpec],
    github: Option<&GithubClient>,
    github_repos: &Option<Vec<String>>,
    sippy: Option<&SippyClient>,
    sippy_pr_search: bool,
) -> Result<bool> {
    let table = result.outcome.table.as_ref().expect("caller checked Some");
    let mut records = report::build_records(table, &result.outcome.filter_outcome.change_points);
    report::attach_labels(&mut records, metrics);

    if let (Some(github), Some(repos)) = (github, github_repos) {
        enrich_github_context(github, repos, table, &mut records, &result.outcome.filter_outcome).await;
    }

    let is_regression = result.outcome.regression();

    if is_regression {
        let summary = build_regression_summary(&records, sippy, sippy_pr_search).await;
        for entry in &summary {
            println!(
                "regression in {:?}: {} -> {}{}",
                result.name,
                entry.prev_version,
                entry.bad_version,
                if entry.prs.is_empty() {
                    String::new()
                } else {
                    format!(" (PRs: {})", entry.prs.join(", "))
                }
            );
        }
        if let Some(pr) = result.pull_number {
            println!("  pull request: #{pr}");
        }
    }

    let rendered = match app.output_format {
        OutputFormat::Text => report::render_text(&result.name, &records, table, app.collapse),
        OutputFormat::Json => serde_json::to_string_pretty(&report::render_records(&records, app.collapse))
            .context("failed to serialize records output")?,
        OutputFormat::Junit => report::render_junit(&result.name, &records, table, metrics, app.collapse),
    };

    write_output(app, &result.name, suffix, &rendered)?;

    if prow_side_artifact_requested() && app.output_format != OutputFormat::Json {
        let side = serde_json::to_string_pretty(&report::render_records(&records, app.collapse))
            .context("failed to serialize PROW_JOB_ID side artifact")?;
        write_output_with_extension(app, &result.name, suffix, "_records", "json", &side)?;
    }

    Ok(is_regression)
}

fn prow_side_artifact_requested() -> bool {
    std::env::var("PROW_JOB_ID").map(|v| !v.is_empty()).unwrap_or(false)
}

fn write_output(app: &App, test_name: &str, suffix: &str, rendered: &str) -> Result<()> {
    let Some(save_path) = &app.save_output_path else {
        println!("{rendered}");
        return Ok(());
    };
    let path = Path::new(save_path);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("output");
    let ext = output_extension(app.output_format);
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let output_path = dir.join(format!("{stem}_{test_name}{suffix}.{ext}"));
    std::fs::write(&output_path, rendered)
        .with_context(|| format!("failed to write {}", output_path.display()))?;
    Ok(())
}

fn write_output_with_extension(
    app: &App,
    test_name: &str,
    suffix: &str,
    tag: &str,
    ext: &str,
    rendered: &str,
) -> Result<()> {
    let Some(save_path) = &app.save_output_path else {
        return Ok(());
    };
    let path = Path::new(save_path);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("output");
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let output_path = dir.join(format!("{stem}_{test_name}{suffix}{tag}.{ext}"));
    std::fs::write(&output_path, rendered)
        .with_context(|| format!("failed to write {}", output_path.display()))?;
    Ok(())
}

fn output_extension(format: OutputFormat) -> &'static str {
    match format {
        OutputFormat::Text => "txt",
        OutputFormat::Json => "json",
        OutputFormat::Junit => "xml",
    }
}

fn resolve_acks(app: &App) -> Result<Vec<AckEntry>, DriverError> {
    if app.no_ack {
        return Ok(Vec::new());
    }
    let Some(paths) = &app.ack else {
        return Ok(Vec::new());
    };
    let paths: Vec<PathBuf> = paths.iter().map(PathBuf::from).collect();
    config::load_acks(&paths).map_err(DriverError::Config)
}

fn resolve_lookback(app: &App) -> Result<Option<i64>, DriverError> {
    if let Some(since) = &app.lookback.since {
        return Ok(Some(args::parse_since_seconds(since).map_err(DriverError::Args)?));
    }
    if let Some(lookback) = &app.lookback.lookback {
        let seconds = args::parse_lookback_seconds(lookback).map_err(DriverError::Args)?;
        return Ok(Some(chrono::Utc::now().timestamp() - seconds));
    }
    Ok(None)
}

fn parse_id_list(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

async fn enrich_github_context(
    github: &GithubClient,
    repos: &[String],
    table: &model::AssembledTable,
    records: &mut [report::Record],
    filter_outcome: &filter::FilterOutcome,
) {
    for points in filter_outcome.change_points.values() {
        for cp in points {
            if cp.index == 0 || cp.index >= records.len() {
                continue;
            }
            let prev_ts = table.rows[cp.index - 1].timestamp;
            let cur_ts = cp.time;
            let mut merged = enrich::github::ChangeContext::default();
            for repo in repos {
                if let Some(ctx) = github.get_change_context(repo, prev_ts, cur_ts).await {
                    merged.releases.extend(ctx.releases);
                    merged.commits.extend(ctx.commits);
                }
            }
            records[cp.index].github_context = Some(merged);
        }
    }
}

struct RegressionSummary {
    prev_version: String,
    bad_version: String,
    prs: Vec<String>,
}

/// Builds the `{previous_version, bad_version, prs}` triples the
/// user-visible summary names (§7), attaching sippy PR-diff results for
/// confirmed regressions (SPEC_FULL §B.4).
async fn build_regression_summary(
    records: &[report::Record],
    sippy: Option<&SippyClient>,
    sippy_pr_search: bool,
) -> Vec<RegressionSummary> {
    let mut summaries = Vec::new();
    let mut prev_version: Option<String> = None;
    let mut bad_version: Option<String> = None;

    for record in records {
        if record.is_changepoint {
            bad_version = Some(record.version.clone());
        } else {
            prev_version = Some(record.version.clone());
        }

        if let (Some(prev), Some(bad)) = (&prev_version, &bad_version) {
            let prs = match sippy {
                Some(sippy) if sippy_pr_search => sippy.search_by_release_tag(bad).await,
                Some(sippy) => sippy.diff(prev, bad).await,
                None => Vec::new(),
            };
            summaries.push(RegressionSummary {
                prev_version: prev.clone(),
                bad_version: bad.clone(),
                prs,
            });
            prev_version = None;
            bad_version = None;
        }
    }

    summaries
}
