//! Index Client (C1): metadata-to-identifier lookup, per-metric value
//! retrieval, aggregation-bucket retrieval, and kube-burner-style job
//! filtering, against an OpenSearch-compatible cluster. Metadata/
//! fingerprint lookups and the benchmark-data lookups (metric values,
//! job-summary documents) may target two distinct indices.

use std::collections::BTreeMap;
use std::time::Duration;

use opensearch::http::transport::{SingleNodeConnectionPool, TransportBuilder};
use opensearch::http::Url;
use opensearch::{OpenSearch, SearchParts};
use serde_json::{json, Value};
use thiserror::Error;

use crate::logging::Logger;
use crate::model::{Fingerprint, MetricSpec, RunDescriptor, RunId, BOGUS_BUILD_URL};

const PAGE_SIZE: usize = 1_000;
const RETRY_ATTEMPTS: usize = 3;
/// Timestamps above this are assumed to be millisecond-precision.
const MILLISECOND_BOUNDARY: i64 = 1_000_000_000_000;

/// Fixed field allow-list for synthesizing a fingerprint from a single
/// run's metadata document (SPEC_FULL §B.1). Mirrors the cluster-shape
/// fields `get_metadata_with_uuid` pulls out: platform, cluster type,
/// node counts/types, network/ipsec/fips/encryption/publish flags, and
/// compute/control-plane architecture.
pub const UUID_METADATA_ALLOWLIST: &[&str] = &[
    "platform",
    "clusterType",
    "masterNodesCount",
    "workerNodesCount",
    "infraNodesCount",
    "masterNodesType",
    "workerNodesType",
    "infraNodesType",
    "totalNodesCount",
    "networkType",
    "ipsec",
    "fips",
    "encrypted",
    "publish",
    "computeArch",
    "controlPlaneArch",
];

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("invalid ES server URL {0:?}: {1}")]
    InvalidUrl(String, String),
    #[error("failed to build the OpenSearch transport: {0}")]
    Transport(String),
    #[error("query against index {index:?} failed: {source}")]
    Request {
        index: String,
        #[source]
        source: opensearch::Error,
    },
    #[error("malformed response from index {index:?}: {reason}")]
    MalformedResponse { index: String, reason: String },
}

/// Owns the HTTP transport to the search cluster. Mirrors §5: pooled,
/// bounded-timeout, bounded-retry, never shared across concurrent
/// analyses.
pub struct IndexClient {
    client: OpenSearch,
    index: String,
    benchmark_index: String,
    uuid_field: String,
    logger: Logger,
}

impl IndexClient {
    /// `index` is the metadata/fingerprint index (`lookup`, `describe_runs`,
    /// `metadata_by_uuid`). `benchmark_index` is where per-run metric
    /// documents and kube-burner job-summary documents live; it defaults
    /// to `index` when the test configures no separate benchmark index
    /// (ground-truth orion's `perfscale.py` queries these as two distinct
    /// indices — see `get_metric_data`/`filter_uuids_on_index`).
    pub fn new(
        es_server: &str,
        index: String,
        benchmark_index: String,
        uuid_field: String,
        logger: Logger,
    ) -> Result<Self, IndexError> {
        let url = Url::parse(es_server)
            .map_err(|e| IndexError::InvalidUrl(es_server.to_string(), e.to_string()))?;
        let pool = SingleNodeConnectionPool::new(url);
        let transport = TransportBuilder::new(pool)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| IndexError::Transport(e.to_string()))?;
        Ok(Self {
            client: OpenSearch::new(transport),
            index,
            benchmark_index,
            uuid_field,
            logger,
        })
    }

    async fn send(&self, index: &str, body: Value) -> Result<Option<Value>, IndexError> {
        let mut last_err = None;
        for attempt in 0..RETRY_ATTEMPTS {
            let response = self
                .client
                .search(SearchParts::Index(&[index]))
                .body(body.clone())
                .send()
                .await;
            match response {
                Ok(resp) => {
                    if resp.status_code().as_u16() == 404 {
                        return Ok(None);
                    }
                    if !resp.status_code().is_success() {
                        self.logger.warn(format!(
                            "non-success status {} from index {} (attempt {})",
                            resp.status_code(),
                            index,
                            attempt + 1
                        ));
                        last_err = Some(IndexError::MalformedResponse {
                            index: index.to_string(),
                            reason: format!("status {}", resp.status_code()),
                        });
                        continue;
                    }
                    let value = resp.json::<Value>().await.map_err(|source| IndexError::Request {
                        index: index.to_string(),
                        source,
                    })?;
                    return Ok(Some(value));
                }
                Err(source) => {
                    self.logger.warn(format!(
                        "transient error querying {}: {source} (attempt {})",
                        index,
                        attempt + 1
                    ));
                    last_err = Some(IndexError::Request {
                        index: index.to_string(),
                        source,
                    });
                }
            }
        }
        Err(last_err.unwrap_or(IndexError::MalformedResponse {
            index: index.to_string(),
            reason: "exhausted retries".to_string(),
        }))
    }

    /// `lookup`: resolve a fingerprint plus optional time bounds into an
    /// ordered, paginated sequence of run descriptors, newest first.
    pub async fn lookup(
        &self,
        fingerprint: &Fingerprint,
        version_field: &str,
        version_value: &str,
        lookback_start: Option<i64>,
        lookback_end: Option<i64>,
        max_rows: usize,
        timestamp_field: &str,
        display_fields: &[String],
    ) -> Result<Vec<RunDescriptor>, IndexError> {
        let must: Vec<Value> = fingerprint
            .fields
            .iter()
            .map(|(k, m)| term_clause(k, m))
            .collect();
        let must_not: Vec<Value> = fingerprint
            .not_fields
            .iter()
            .map(|(k, v)| json!({"term": {format!("{k}.keyword"): v}}))
            .collect();

        let wildcard = fingerprint.version_wildcard(version_value);
        let mut filter = vec![json!({
            "wildcard": { format!("{version_field}.keyword"): format!("{wildcard}*") }
        })];
        if let Some(range) = range_clause(timestamp_field, lookback_start, lookback_end) {
            filter.push(range);
        }

        let mut descriptors = Vec::new();
        let mut search_after: Option<Value> = None;

        loop {
            let remaining = max_rows.saturating_sub(descriptors.len());
            if remaining == 0 {
                break;
            }
            let size = remaining.min(PAGE_SIZE);
            let mut body = json!({
                "size": size,
                "query": {"bool": {"must": must, "must_not": must_not, "filter": filter}},
                "sort": [{timestamp_field: {"order": "desc"}}, {"_id": {"order": "desc"}}],
            });
            if let Some(sa) = &search_after {
                body["search_after"] = sa.clone();
            }

            let Some(response) = self.send(&self.index, body).await? else {
                break;
            };
            let hits = extract_hits(&response, &self.index)?;
            if hits.is_empty() {
                break;
            }

            for hit in &hits {
                descriptors.push(hit_to_descriptor(hit, &self.uuid_field, version_field, timestamp_field, display_fields)?);
            }

            let got = hits.len();
            search_after = hits.last().and_then(|h| h.get("sort").cloned());
            if got < size || search_after.is_none() {
                break;
            }
        }

        Ok(descriptors)
    }

    /// `metricValues`: standard (non-aggregated) per-run values for one
    /// metric spec. Deduplicates on RunID, first-wins.
    pub async fn metric_values(
        &self,
        run_ids: &[RunId],
        metric: &MetricSpec,
        timestamp_field: &str,
    ) -> Result<Vec<(RunId, Option<i64>, Option<f64>)>, IndexError> {
        if run_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut filter: Vec<Value> = vec![json!({"terms": {format!("{}.keyword", self.uuid_field): run_ids}})];
        for (k, v) in &metric.selector {
            filter.push(json!({"term": {format!("{k}.keyword"): v}}));
        }
        let ts_field = metric.timestamp_field.as_deref().unwrap_or(timestamp_field);

        let mut seen = BTreeMap::new();
        let mut search_after: Option<Value> = None;
        loop {
            let mut body = json!({
                "size": PAGE_SIZE,
                "query": {"bool": {"filter": filter}},
                "sort": [{ts_field: {"order": "asc"}}, {"_id": {"order": "asc"}}],
            });
            if let Some(sa) = &search_after {
                body["search_after"] = sa.clone();
            }
            let Some(response) = self.send(&self.benchmark_index, body).await? else {
                break;
            };
            let hits = extract_hits(&response, &self.benchmark_index)?;
            if hits.is_empty() {
                break;
            }
            for hit in &hits {
                let source = hit.get("_source").cloned().unwrap_or(Value::Null);
                let run_id = dotted_get(&source, &self.uuid_field)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if run_id.is_empty() || seen.contains_key(&run_id) {
                    continue;
                }
                let ts = dotted_get(&source, ts_field).and_then(normalize_timestamp);
                let value = dotted_get(&source, &metric.metric_of_interest).and_then(Value::as_f64);
                seen.insert(run_id.clone(), (run_id, ts, value));
            }
            let got = hits.len();
            search_after = hits.last().and_then(|h| h.get("sort").cloned());
            if got < PAGE_SIZE || search_after.is_none() {
                break;
            }
        }

        Ok(seen.into_values().collect())
    }

    /// `aggregatedMetricValues`: bucket by RunID, aggregate `metric_of_interest`
    /// with the configured `agg_type`, and compute an average-of-timestamp
    /// per bucket. Buckets with no hits yield a `None` value.
    pub async fn aggregated_metric_values(
        &self,
        run_ids: &[RunId],
        metric: &MetricSpec,
        timestamp_field: &str,
    ) -> Result<Vec<(RunId, Option<i64>, Option<f64>)>, IndexError> {
        let Some(agg) = &metric.agg else {
            return self.metric_values(run_ids, metric, timestamp_field).await;
        };
        if run_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut filter: Vec<Value> = vec![json!({"terms": {format!("{}.keyword", self.uuid_field): run_ids}})];
        for (k, v) in &metric.selector {
            filter.push(json!({"term": {format!("{k}.keyword"): v}}));
        }
        let ts_field = metric.timestamp_field.as_deref().unwrap_or(timestamp_field);

        let body = json!({
            "size": 0,
            "query": {"bool": {"filter": filter}},
            "aggs": {
                "by_run": {
                    "terms": {"field": format!("{}.keyword", self.uuid_field), "size": run_ids.len().max(1)},
                    "aggs": {
                        "metric": {agg.agg_type.clone(): {"field": agg.value}},
                        "ts": {"avg": {"field": ts_field}},
                    }
                }
            }
        });

        let Some(response) = self.send(&self.benchmark_index, body).await? else {
            return Ok(Vec::new());
        };
        let buckets = response
            .get("aggregations")
            .and_then(|a| a.get("by_run"))
            .and_then(|b| b.get("buckets"))
            .and_then(Value::as_array)
            .ok_or_else(|| IndexError::MalformedResponse {
                index: self.benchmark_index.clone(),
                reason: "aggregations.by_run.buckets".to_string(),
            })?;

        let mut out = Vec::with_capacity(buckets.len());
        for bucket in buckets {
            let run_id = bucket.get("key").and_then(Value::as_str).unwrap_or_default().to_string();
            if run_id.is_empty() {
                continue;
            }
            let value = bucket.get("metric").and_then(|m| m.get("value")).and_then(Value::as_f64);
            let ts = bucket
                .get("ts")
                .and_then(|t| t.get("value"))
                .and_then(Value::as_f64)
                .map(|v| v as i64)
                .and_then(|v| normalize_timestamp(&json!(v)));
            out.push((run_id, ts, value));
        }
        Ok(out)
    }

    /// Resolves version/build-url/display fields directly for an explicit
    /// list of RunIDs, bypassing fingerprint resolution. Backs the
    /// `--uuid` and `--baseline` entry paths (SPEC_FULL §B.1-2).
    pub async fn describe_runs(
        &self,
        run_ids: &[RunId],
        version_field: &str,
        timestamp_field: &str,
        display_fields: &[String],
    ) -> Result<Vec<RunDescriptor>, IndexError> {
        if run_ids.is_empty() {
            return Ok(Vec::new());
        }
        let body = json!({
            "size": run_ids.len(),
            "query": {"bool": {"filter": [{"terms": {format!("{}.keyword", self.uuid_field): run_ids}}]}},
        });
        let Some(response) = self.send(&self.index, body).await? else {
            return Ok(Vec::new());
        };
        let hits = extract_hits(&response, &self.index)?;
        hits.iter()
            .map(|hit| hit_to_descriptor(hit, &self.uuid_field, version_field, timestamp_field, display_fields))
            .collect()
    }

    /// Retrieves the full `_source` metadata document for one run,
    /// backing the `--uuid` entry path's fingerprint synthesis
    /// (SPEC_FULL §B.1).
    pub async fn metadata_by_uuid(&self, run_id: &str) -> Result<Option<Value>, IndexError> {
        let body = json!({
            "size": 1,
            "query": {"bool": {"filter": [{"term": {format!("{}.keyword", self.uuid_field): run_id}}]}},
        });
        let Some(response) = self.send(&self.index, body).await? else {
            return Ok(None);
        };
        let hits = extract_hits(&response, &self.index)?;
        Ok(hits.into_iter().next().and_then(|h| h.get("_source").cloned()))
    }

    /// `jobFilter`: keep only RunIDs whose `jobConfig.jobIterations` equals
    /// that of the first document returned. Job-summary documents live in
    /// the benchmark index alongside per-run metric values.
    pub async fn job_filter(&self, run_ids: &[RunId]) -> Result<Vec<RunId>, IndexError> {
        if run_ids.is_empty() {
            return Ok(Vec::new());
        }
        let body = json!({
            "size": run_ids.len(),
            "query": {"bool": {"filter": [{"terms": {format!("{}.keyword", self.uuid_field): run_ids}}]}},
        });
        let Some(response) = self.send(&self.benchmark_index, body).await? else {
            return Ok(run_ids.to_vec());
        };
        let hits = extract_hits(&response, &self.benchmark_index)?;
        if hits.is_empty() {
            return Ok(run_ids.to_vec());
        }

        let mut iterations: Vec<(String, i64)> = Vec::new();
        for hit in &hits {
            let source = hit.get("_source").cloned().unwrap_or(Value::Null);
            let run_id = dotted_get(&source, &self.uuid_field)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let iterations_count = dotted_get(&source, "jobConfig.jobIterations").and_then(Value::as_i64);
            if let (false, Some(count)) = (run_id.is_empty(), iterations_count) {
                iterations.push((run_id, count));
            }
        }

        let Some((_, baseline)) = iterations.first().cloned() else {
            return Ok(run_ids.to_vec());
        };
        Ok(iterations
            .into_iter()
            .filter(|(_, count)| *count == baseline)
            .map(|(run_id, _)| run_id)
            .collect())
    }
}

fn term_clause(key: &str, m: &crate::model::FieldMatch) -> Value {
    match m {
        crate::model::FieldMatch::Exact(v) => json!({"term": {format!("{key}.keyword"): v}}),
        crate::model::FieldMatch::Wildcard(v) => json!({"wildcard": {format!("{key}.keyword"): format!("{v}*")}}),
    }
}

fn range_clause(timestamp_field: &str, start: Option<i64>, end: Option<i64>) -> Option<Value> {
    if start.is_none() && end.is_none() {
        return None;
    }
    let mut range = serde_json::Map::new();
    if let Some(s) = start {
        range.insert("gte".to_string(), json!(s));
    }
    if let Some(e) = end {
        range.insert("lte".to_string(), json!(e));
    }
    Some(json!({"range": {timestamp_field: range}}))
}

fn extract_hits<'a>(response: &'a Value, index: &str) -> Result<Vec<Value>, IndexError> {
    response
        .get("hits")
        .and_then(|h| h.get("hits"))
        .and_then(Value::as_array)
        .cloned()
        .ok_or_else(|| IndexError::MalformedResponse {
            index: index.to_string(),
            reason: "hits.hits".to_string(),
        })
}

/// Resolves a dotted path (e.g. `tags.sw_version`) against a JSON value.
pub fn dotted_get<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Normalizes a timestamp value (int seconds, int millis, or ISO-8601
/// string) to an integer-seconds value.
pub fn normalize_timestamp(value: &Value) -> Option<i64> {
    if let Some(n) = value.as_i64() {
        return Some(if n > MILLISECOND_BOUNDARY { n / 1_000 } else { n });
    }
    if let Some(f) = value.as_f64() {
        let n = f as i64;
        return Some(if n > MILLISECOND_BOUNDARY { n / 1_000 } else { n });
    }
    if let Some(s) = value.as_str() {
        if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
            return Some(dt.timestamp());
        }
        if let Ok(n) = s.parse::<i64>() {
            return Some(if n > MILLISECOND_BOUNDARY { n / 1_000 } else { n });
        }
    }
    None
}

fn hit_to_descriptor(
    hit: &Value,
    uuid_field: &str,
    version_field: &str,
    timestamp_field: &str,
    display_fields: &[String],
) -> Result<RunDescriptor, IndexError> {
    let source = hit.get("_source").cloned().unwrap_or(Value::Null);
    let run_id = dotted_get(&source, uuid_field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let version = dotted_get(&source, version_field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let build_url = dotted_get(&source, "buildUrl")
        .or_else(|| dotted_get(&source, "build_url"))
        .and_then(Value::as_str)
        .unwrap_or(BOGUS_BUILD_URL)
        .to_string();
    let _ = timestamp_field;

    let mut display = BTreeMap::new();
    for field in display_fields {
        if let Some(v) = dotted_get(&source, field) {
            let s = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            display.insert(field.clone(), s);
        }
    }

    Ok(RunDescriptor {
        run_id,
        version,
        build_url,
        display,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_seconds_and_millis() {
        assert_eq!(normalize_timestamp(&json!(1_700_000_000)), Some(1_700_000_000));
        assert_eq!(normalize_timestamp(&json!(1_700_000_000_123i64)), Some(1_700_000_000));
    }

    #[test]
    fn normalizes_iso8601() {
        assert_eq!(
            normalize_timestamp(&json!("2023-11-14T22:13:20Z")),
            Some(1_700_000_000)
        );
    }

    #[test]
    fn dotted_get_resolves_nested_paths() {
        let doc = json!({"tags": {"sw_version": "4.16.3"}});
        assert_eq!(dotted_get(&doc, "tags.sw_version").and_then(Value::as_str), Some("4.16.3"));
        assert_eq!(dotted_get(&doc, "tags.missing"), None);
    }
}
