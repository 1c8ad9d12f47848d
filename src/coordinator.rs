//! Pull/Periodic Coordinator (C5): splits a test into a pull-request
//! variant and a periodic variant, runs both in parallel, and merges
//! results (§4.5). Also owns the single-variant analysis cycle (lookup ->
//! assemble -> analyze -> post-filter, with adaptive expansion) that both
//! variants, and the plain non-pull case, share.

use async_trait::async_trait;
use thiserror::Error;

use crate::assembler::{self, AssemblerError};
use crate::config::TestConfig;
use crate::engine::{self, AlgorithmOptions, AlgorithmTag, AnalysisResult, EngineError};
use crate::enrich::github::GithubClient;
use crate::enrich::shortener::Shortener;
use crate::filter::{self, BoundaryConfig, Expander, FilterOutcome};
use crate::index_client::{dotted_get, IndexClient, IndexError, UUID_METADATA_ALLOWLIST};
use crate::logging::Logger;
use crate::model::{AckEntry, AssembledTable, Fingerprint, RunDescriptor};

const KUBE_BURNER_EXCLUDED_BENCHMARKS: [&str; 2] = ["ingress-perf", "k8s-netperf"];

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Assembler(#[from] AssemblerError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Options shared by every analysis cycle, independent of which test or
/// variant is being run — the per-process configuration a CLI invocation
/// resolves once (§6 Invocation surface).
#[derive(Clone)]
pub struct SharedOptions {
    pub es_server: String,
    pub metadata_index: String,
    pub algorithm: AlgorithmTag,
    pub algorithm_options: AlgorithmOptions,
    pub boundary: BoundaryConfig,
    pub acks: Vec<AckEntry>,
    pub display_fields: Vec<String>,
    pub convert_tinyurl: bool,
    pub baseline: Option<Vec<String>>,
    pub uuid: Option<String>,
    pub node_count: bool,
}

/// Mutable per-cycle parameters the expansion path rewrites (§4.4 step 5).
#[derive(Clone, Copy, Debug)]
pub struct CycleParams {
    pub lookback_start: Option<i64>,
    pub lookback_end: Option<i64>,
    pub max_rows: usize,
}

/// The outcome of one analysis cycle for one test variant.
pub struct CycleOutcome {
    pub table: Option<AssembledTable>,
    pub filter_outcome: FilterOutcome,
}

impl CycleOutcome {
    pub fn regression(&self) -> bool {
        self.filter_outcome.is_regression()
    }
}

/// Runs lookup -> (optional job-iteration gating) -> assemble -> analyze
/// -> post-filter (with adaptive expansion) for one test, once.
pub async fn run_cycle(
    shared: &SharedOptions,
    test: &TestConfig,
    params: CycleParams,
    logger: Logger,
    shortener: Option<&dyn Shortener>,
) -> Result<CycleOutcome, CoordinatorError> {
    let index_name = test
        .metadata_index
        .clone()
        .unwrap_or_else(|| shared.metadata_index.clone());
    let benchmark_index_name = test.benchmark_index.clone().unwrap_or_else(|| index_name.clone());
    let client = IndexClient::new(
        &shared.es_server,
        index_name,
        benchmark_index_name,
        test.uuid_field.clone(),
        logger,
    )?;

    let descriptors = resolve_run_descriptors(&client, shared, test, params).await?;
    let descriptors = apply_job_filter_gating(&client, shared, test, descriptors).await?;

    let table = assembler::assemble(
        &client,
        &descriptors,
        &test.metrics,
        &test.timestamp_field,
        shortener,
        shared.convert_tinyurl,
        &shared.display_fields,
    )
    .await?;

    let Some(table) = table else {
        return Ok(CycleOutcome {
            table: None,
            filter_outcome: FilterOutcome::default(),
        });
    };

    let raw = engine::build(shared.algorithm, shared.algorithm_options).analyze(&table, &test.metrics)?;

    let expander = LookbackExpander {
        shared,
        test,
        params,
    };
    let (replacement_table, filter_outcome) =
        filter::run(&table, &test.metrics, &shared.acks, raw, shared.boundary, &expander).await;
    let table = replacement_table.unwrap_or(table);

    Ok(CycleOutcome {
        table: Some(table),
        filter_outcome,
    })
}

async fn resolve_run_descriptors(
    client: &IndexClient,
    shared: &SharedOptions,
    test: &TestConfig,
    params: CycleParams,
) -> Result<Vec<RunDescriptor>, IndexError> {
    if let Some(uuid) = &shared.uuid {
        let Some(source) = client.metadata_by_uuid(uuid).await? else {
            return Ok(Vec::new());
        };
        let fingerprint = Fingerprint::from_allow_list(&source, UUID_METADATA_ALLOWLIST);
        let version_value = dotted_get(&source, &test.version_field)
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_default();
        return client
            .lookup(
                &fingerprint,
                &test.version_field,
                &version_value,
                params.lookback_start,
                params.lookback_end,
                params.max_rows,
                &test.timestamp_field,
                &shared.display_fields,
            )
            .await;
    }
    if let Some(baseline) = &shared.baseline {
        return client
            .describe_runs(baseline, &test.version_field, &test.timestamp_field, &shared.display_fields)
            .await;
    }

    let fingerprint = test.fingerprint();
    let version_value = test.version_field_value();
    client
        .lookup(
            &fingerprint,
            &test.version_field,
            &version_value,
            params.lookback_start,
            params.lookback_end,
            params.max_rows,
            &test.timestamp_field,
            &shared.display_fields,
        )
        .await
}

/// kube-burner job-iteration gating (SPEC_FULL §B.3): only runs when the
/// metadata names a benchmark outside the excluded set, no explicit
/// baseline/uuid was supplied, and `--node-count` is off.
async fn apply_job_filter_gating(
    client: &IndexClient,
    shared: &SharedOptions,
    test: &TestConfig,
    descriptors: Vec<RunDescriptor>,
) -> Result<Vec<RunDescriptor>, IndexError> {
    if shared.baseline.is_some() || shared.uuid.is_some() || shared.node_count {
        return Ok(descriptors);
    }
    let Some(benchmark) = test.metadata_str("benchmark") else {
        return Ok(descriptors);
    };
    if KUBE_BURNER_EXCLUDED_BENCHMARKS.contains(&benchmark.as_str()) {
        return Ok(descriptors);
    }

    let run_ids: Vec<String> = descriptors.iter().map(|d| d.run_id.clone()).collect();
    let kept = client.job_filter(&run_ids).await?;
    Ok(descriptors.into_iter().filter(|d| kept.contains(&d.run_id)).collect())
}

/// Re-runs `run_cycle` with look-back extended and `maxRows` raised, for
/// the early-boundary expansion path (§4.4 step 5). Each expansion
/// attempt constructs its own index client, per §9 "no cross-test reuse
/// is required".
struct LookbackExpander<'a> {
    shared: &'a SharedOptions,
    test: &'a TestConfig,
    params: CycleParams,
}

#[async_trait]
impl<'a> Expander for LookbackExpander<'a> {
    async fn expand(&self, extra_lookback_seconds: i64, extra_rows: usize) -> Option<(AssembledTable, AnalysisResult)> {
        let expanded_params = CycleParams {
            lookback_start: Some(
                self.params
                    .lookback_start
                    .map(|s| s - extra_lookback_seconds)
                    .unwrap_or(-extra_lookback_seconds),
            ),
            lookback_end: self.params.lookback_end,
            max_rows: self.params.max_rows + extra_rows,
        };

        let logger = Logger::new("coordinator-expansion");
        let index_name = self
            .test
            .metadata_index
            .clone()
            .unwrap_or_else(|| self.shared.metadata_index.clone());
        let benchmark_index_name = self.test.benchmark_index.clone().unwrap_or_else(|| index_name.clone());
        let client = IndexClient::new(
            &self.shared.es_server,
            index_name,
            benchmark_index_name,
            self.test.uuid_field.clone(),
            logger,
        )
        .ok()?;

        let descriptors = resolve_run_descriptors(&client, self.shared, self.test, expanded_params).await.ok()?;
        let descriptors = apply_job_filter_gating(&client, self.shared, self.test, descriptors).await.ok()?;

        let table: AssembledTable = assembler::assemble(
            &client,
            &descriptors,
            &self.test.metrics,
            &self.test.timestamp_field,
            None,
            false,
            &self.shared.display_fields,
        )
        .await
        .ok()??;

        let raw = engine::build(self.shared.algorithm, self.shared.algorithm_options)
            .analyze(&table, &self.test.metrics)
            .ok()?;

        Some((table, raw))
    }
}

/// One test's result, per variant (plain, or pull/periodic pair).
pub struct TestResult {
    pub name: String,
    pub outcome: CycleOutcome,
    pub pull_number: Option<u64>,
}

/// Result of §4.5: the pull slot is populated only for pull-request tests.
pub struct VariantResults {
    pub pull: Option<TestResult>,
    pub periodic: TestResult,
}

/// Splits `test` into pull/periodic variants when its metadata declares a
/// non-zero `pullNumber`, runs both concurrently, and returns the pair.
/// Otherwise runs a single analysis and leaves the pull slot empty.
pub async fn analyze_test(
    shared: &SharedOptions,
    test: &TestConfig,
    params: CycleParams,
    logger: Logger,
    github: Option<&GithubClient>,
    shortener: Option<&dyn Shortener>,
) -> Result<VariantResults, CoordinatorError> {
    let Some(pull_number) = test.pull_request_number() else {
        let outcome = run_cycle(shared, test, params, logger, shortener).await?;
        return Ok(VariantResults {
            pull: None,
            periodic: TestResult {
                name: test.name.clone(),
                outcome,
                pull_number: None,
            },
        });
    };

    let mut pull_test = test.clone();
    pull_test.set_metadata("jobType", serde_json::json!("pull"));

    let mut periodic_test = test.clone();
    periodic_test.set_metadata("jobType", serde_json::json!("periodic"));
    periodic_test.set_metadata("pullNumber", serde_json::json!(0));
    periodic_test.remove_metadata("organization");
    periodic_test.remove_metadata("repository");

    let mut pull_params = params;
    if let (Some(github), Some(org), Some(repo)) = (
        github,
        test.metadata_str("organization"),
        test.metadata_str("repository"),
    ) {
        if let Some(created_at) = github.get_pull_request_creation_date(&org, &repo, pull_number).await {
            pull_params.lookback_start = Some(created_at);
        }
    }

    let pull_logger = logger;
    let periodic_logger = logger;

    let (pull_outcome, periodic_outcome) = tokio::try_join!(
        run_cycle(shared, &pull_test, pull_params, pull_logger, shortener),
        run_cycle(shared, &periodic_test, params, periodic_logger, shortener),
    )?;

    Ok(VariantResults {
        pull: Some(TestResult {
            name: test.name.clone(),
            outcome: pull_outcome,
            pull_number: Some(pull_number),
        }),
        periodic: TestResult {
            name: test.name.clone(),
            outcome: periodic_outcome,
            pull_number: None,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kube_burner_excluded_benchmarks_are_recognized() {
        assert!(KUBE_BURNER_EXCLUDED_BENCHMARKS.contains(&"ingress-perf"));
        assert!(!KUBE_BURNER_EXCLUDED_BENCHMARKS.contains(&"node-density"));
    }
}
