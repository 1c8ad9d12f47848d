//! GitHub context lookup: release/commit enrichment for reported change
//! points, and PR creation-date lookup for the pull/periodic coordinator.
//! Caches per (repo, from-ts, to-ts) for the process lifetime (§4.6/§5/§9).

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::logging::Logger;

/// Releases and commits whose timestamps fall within a change-point's
/// surrounding window.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ChangeContext {
    pub releases: Vec<String>,
    pub commits: Vec<String>,
}

#[derive(Deserialize)]
struct GithubRelease {
    tag_name: String,
    published_at: String,
}

#[derive(Deserialize)]
struct GithubCommit {
    sha: String,
    commit: GithubCommitDetail,
}

#[derive(Deserialize)]
struct GithubCommitDetail {
    author: GithubCommitAuthor,
}

#[derive(Deserialize)]
struct GithubCommitAuthor {
    date: String,
}

#[derive(Deserialize)]
struct GithubPullRequest {
    created_at: String,
}

type CacheKey = (String, i64, i64);

pub struct GithubClient {
    client: reqwest::Client,
    token: Option<String>,
    logger: Logger,
    context_cache: Mutex<HashMap<CacheKey, ChangeContext>>,
}

impl GithubClient {
    pub fn new(logger: Logger) -> Self {
        let token = std::env::var("GITHUB_TOKEN")
            .or_else(|_| std::env::var("GH_TOKEN"))
            .ok();
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(15))
                .user_agent("hindsight")
                .build()
                .unwrap_or_default(),
            token,
            logger,
            context_cache: Mutex::new(HashMap::new()),
        }
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// `getChangeContext(prev-ts, cur-ts, prev-ver, cur-ver) -> optional context`.
    /// Degrades to `None` on any failure or rate limit, per §4.7.
    pub async fn get_change_context(
        &self,
        repo: &str,
        prev_ts: i64,
        cur_ts: i64,
    ) -> Option<ChangeContext> {
        let key = (repo.to_string(), prev_ts, cur_ts);
        if let Some(cached) = self.context_cache.lock().unwrap().get(&key).cloned() {
            return Some(cached);
        }

        let releases = self.fetch_releases(repo).await.unwrap_or_default();
        let commits = self.fetch_commits(repo).await.unwrap_or_default();

        let releases: Vec<String> = releases
            .into_iter()
            .filter(|r| {
                chrono::DateTime::parse_from_rfc3339(&r.published_at)
                    .map(|dt| {
                        let ts = dt.timestamp();
                        ts > prev_ts && ts < cur_ts
                    })
                    .unwrap_or(false)
            })
            .map(|r| r.tag_name)
            .collect();

        let commits: Vec<String> = commits
            .into_iter()
            .filter(|c| {
                chrono::DateTime::parse_from_rfc3339(&c.commit.author.date)
                    .map(|dt| {
                        let ts = dt.timestamp();
                        ts > prev_ts && ts < cur_ts
                    })
                    .unwrap_or(false)
            })
            .map(|c| c.sha)
            .collect();

        if releases.is_empty() && commits.is_empty() {
            self.logger.debug(format!("no github context for {repo} in window"));
        }

        let context = ChangeContext { releases, commits };
        self.context_cache.lock().unwrap().insert(key, context.clone());
        Some(context)
    }

    async fn fetch_releases(&self, repo: &str) -> Option<Vec<GithubRelease>> {
        let url = format!("https://api.github.com/repos/{repo}/releases");
        let resp = self.authed(self.client.get(&url)).send().await.ok()?;
        if !resp.status().is_success() {
            self.logger.warn(format!("github releases request for {repo} degraded: {}", resp.status()));
            return None;
        }
        resp.json().await.ok()
    }

    async fn fetch_commits(&self, repo: &str) -> Option<Vec<GithubCommit>> {
        let url = format!("https://api.github.com/repos/{repo}/commits");
        let resp = self.authed(self.client.get(&url)).send().await.ok()?;
        if !resp.status().is_success() {
            self.logger.warn(format!("github commits request for {repo} degraded: {}", resp.status()));
            return None;
        }
        resp.json().await.ok()
    }

    /// `getPullRequestCreationDate(org, repo, number) -> optional timestamp`.
    pub async fn get_pull_request_creation_date(
        &self,
        org: &str,
        repo: &str,
        number: u64,
    ) -> Option<i64> {
        let url = format!("https://api.github.com/repos/{org}/{repo}/pulls/{number}");
        let resp = self.authed(self.client.get(&url)).send().await.ok()?;
        if !resp.status().is_success() {
            self.logger.warn(format!("github PR lookup for {org}/{repo}#{number} degraded: {}", resp.status()));
            return None;
        }
        let pr: GithubPullRequest = resp.json().await.ok()?;
        chrono::DateTime::parse_from_rfc3339(&pr.created_at)
            .ok()
            .map(|dt| dt.timestamp())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_context_default_is_empty() {
        let ctx = ChangeContext::default();
        assert!(ctx.releases.is_empty());
        assert!(ctx.commits.is_empty());
    }
}
