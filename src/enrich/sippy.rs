//! Sippy PR-diff lookup. An empty PR list is a valid outcome; failures
//! degrade the same way (§4.7).

use serde::Deserialize;

use crate::logging::Logger;

#[derive(Deserialize)]
struct SippyDiffResponse {
    #[serde(default)]
    prs: Vec<String>,
}

#[derive(Deserialize)]
struct SippyReleaseSearchResponse {
    #[serde(default)]
    prs: Vec<String>,
}

pub struct SippyClient {
    client: reqwest::Client,
    base_url: String,
    logger: Logger,
}

impl SippyClient {
    pub fn new(base_url: impl Into<String>, logger: Logger) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
            base_url: base_url.into(),
            logger,
        }
    }

    /// `diff(prev-ver, cur-ver) -> list of PR urls`.
    pub async fn diff(&self, prev_version: &str, cur_version: &str) -> Vec<String> {
        let url = format!(
            "{}/api/component_readiness/diff?from={prev_version}&to={cur_version}",
            self.base_url
        );
        match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => resp
                .json::<SippyDiffResponse>()
                .await
                .map(|body| body.prs)
                .unwrap_or_default(),
            _ => {
                self.logger.warn(format!("sippy diff lookup {prev_version}..{cur_version} degraded"));
                Vec::new()
            }
        }
    }

    /// Release-tag based PR search, used when `--sippy-pr-search` is set.
    pub async fn search_by_release_tag(&self, tag: &str) -> Vec<String> {
        let url = format!("{}/api/releases/{tag}/prs", self.base_url);
        match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => resp
                .json::<SippyReleaseSearchResponse>()
                .await
                .map(|body| body.prs)
                .unwrap_or_default(),
            _ => {
                self.logger.warn(format!("sippy release search for {tag} degraded"));
                Vec::new()
            }
        }
    }
}
