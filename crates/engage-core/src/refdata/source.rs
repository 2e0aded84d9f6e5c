//! Transport abstraction over the remote tabular source.

use async_trait::async_trait;
use tracing::debug;

/// Fetches the raw header-row-delimited payload for a dataset.
///
/// Implementations report failures as plain reason strings; the cache layer
/// owns retry and converts exhausted retries into
/// [`EngineError::DataUnavailable`](crate::EngineError::DataUnavailable).
#[async_trait]
pub trait TableSource: Send + Sync {
    async fn fetch_table(&self, dataset: &str) -> Result<String, String>;
}

/// HTTP GET transport: `{base_url}/{dataset}.csv`.
///
/// Non-2xx responses and empty bodies are load failures subject to retry.
pub struct HttpTableSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTableSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    /// Use a preconfigured client (timeouts, proxies).
    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    fn url_for(&self, dataset: &str) -> String {
        format!("{}/{}.csv", self.base_url.trim_end_matches('/'), dataset)
    }
}

#[async_trait]
impl TableSource for HttpTableSource {
    async fn fetch_table(&self, dataset: &str) -> Result<String, String> {
        let url = self.url_for(dataset);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("GET {url}: {e}"))?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("GET {url}: status {status}"));
        }

        let body = response
            .text()
            .await
            .map_err(|e| format!("GET {url}: body read failed: {e}"))?;
        if body.trim().is_empty() {
            return Err(format!("GET {url}: empty body"));
        }

        debug!(dataset, bytes = body.len(), "reference table fetched");
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_construction_strips_trailing_slash() {
        let source = HttpTableSource::new("https://data.example.edu/secure/");
        assert_eq!(
            source.url_for("students"),
            "https://data.example.edu/secure/students.csv"
        );
    }
}
