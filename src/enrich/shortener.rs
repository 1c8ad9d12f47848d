//! URL shortener contract. Failure to shorten must not fail the pipeline;
//! callers always get back a usable URL.

use async_trait::async_trait;

use crate::logging::Logger;

#[async_trait]
pub trait Shortener: Send + Sync {
    async fn shorten(&self, url: &str) -> String;
}

/// Calls the tinyurl.com create-link endpoint. On any failure (network,
/// non-2xx, malformed body) the original URL is returned unchanged.
pub struct TinyUrlShortener {
    client: reqwest::Client,
    logger: Logger,
}

impl TinyUrlShortener {
    pub fn new(logger: Logger) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            logger,
        }
    }
}

#[async_trait]
impl Shortener for TinyUrlShortener {
    async fn shorten(&self, url: &str) -> String {
        let endpoint = format!("https://tinyurl.com/api-create.php?url={url}");
        match self.client.get(&endpoint).send().await {
            Ok(resp) if resp.status().is_success() => match resp.text().await {
                Ok(body) if body.starts_with("http") => body,
                _ => {
                    self.logger.warn("tinyurl returned an unexpected body, using original URL");
                    url.to_string()
                }
            },
            _ => {
                self.logger.warn("tinyurl request failed, using original URL");
                url.to_string()
            }
        }
    }
}

/// A no-op shortener, used when `--convert-tinyurl` is not set.
pub struct NoopShortener;

#[async_trait]
impl Shortener for NoopShortener {
    async fn shorten(&self, url: &str) -> String {
        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_shortener_passes_through() {
        let s = NoopShortener;
        assert_eq!(s.shorten("http://example.com/a").await, "http://example.com/a");
    }
}
