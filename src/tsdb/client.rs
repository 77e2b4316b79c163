use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use tracing::{debug, warn};

use super::types::{ApiResponse, QueryData, RuntimeInfoData};

/// Thin HTTP client over the four TSDB endpoints named in spec §6. Holds no
/// query-construction logic of its own — templated query text is the
/// updater's responsibility (spec §4.2).
#[derive(Clone)]
pub struct TsdbClient {
    client: Client,
    base_url: String,
    headers: HashMap<String, String>,
}

impl TsdbClient {
    pub fn new(base_url: impl Into<String>, headers: HashMap<String, String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            headers,
        }
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.request(method, url);
        for (k, v) in &self.headers {
            req = req.header(k, v);
        }
        req
    }

    /// `GET /api/v1/query?query=...&time=...` — instant vector at `time`.
    pub async fn query(&self, query: &str, time_unix_seconds: i64) -> Result<QueryData> {
        let url = format!("{}/api/v1/query", self.base_url);
        let resp = self
            .request(reqwest::Method::GET, &url)
            .query(&[("query", query), ("time", &time_unix_seconds.to_string())])
            .send()
            .await
            .with_context(|| format!("TSDB unreachable for query: {query}"))?;

        if !resp.status().is_success() {
            return Err(anyhow!(
                "TSDB returned non-200 status {} for query: {query}",
                resp.status()
            ));
        }

        let body: ApiResponse<QueryData> = resp
            .json()
            .await
            .context("TSDB query response was not valid JSON")?;
        body.into_result()
    }

    /// `POST /api/v1/admin/tsdb/delete_series?match[]=...&start=...&end=...`
    pub async fn delete_series(
        &self,
        matchers: &[String],
        start_unix_seconds: i64,
        end_unix_seconds: i64,
    ) -> Result<()> {
        if matchers.is_empty() {
            debug!("delete_series called with no matchers, skipping request");
            return Ok(());
        }

        let url = format!("{}/api/v1/admin/tsdb/delete_series", self.base_url);
        let mut pairs: Vec<(&str, String)> = matchers.iter().map(|m| ("match[]", m.clone())).collect();
        pairs.push(("start", start_unix_seconds.to_string()));
        pairs.push(("end", end_unix_seconds.to_string()));

        let resp = self
            .request(reqwest::Method::POST, &url)
            .query(&pairs)
            .send()
            .await
            .context("TSDB unreachable for delete_series")?;

        if !resp.status().is_success() {
            warn!(status = %resp.status(), "TSDB delete_series returned non-200");
            return Err(anyhow!("TSDB delete_series failed with status {}", resp.status()));
        }
        Ok(())
    }

    /// `GET /api/v1/status/runtimeinfo` — used once at startup to read
    /// `query_max_samples` (spec §4.2 batching discipline).
    pub async fn query_max_samples(&self) -> Result<u64> {
        let url = format!("{}/api/v1/status/runtimeinfo", self.base_url);
        let resp = self
            .request(reqwest::Method::GET, &url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .context("TSDB unreachable for runtimeinfo")?;

        let body: ApiResponse<RuntimeInfoData> = resp.json().await.context("invalid runtimeinfo JSON")?;
        let data = body.into_result()?;
        data.max_samples
            .ok_or_else(|| anyhow!("TSDB runtimeinfo response missing maxSamples"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_builds_with_headers() {
        let mut headers = HashMap::new();
        headers.insert("X-Scope-OrgID".to_string(), "tenant-a".to_string());
        let c = TsdbClient::new("http://localhost:9090", headers);
        assert_eq!(c.base_url, "http://localhost:9090");
    }
}
