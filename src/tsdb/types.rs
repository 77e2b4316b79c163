use serde::Deserialize;
use std::collections::HashMap;

/// Shared envelope for every TSDB HTTP response (spec §6).
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub status: String,
    #[serde(default)]
    pub data: Option<T>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl<T> ApiResponse<T> {
    pub fn into_result(self) -> anyhow::Result<T> {
        if self.status == "success" {
            self.data
                .ok_or_else(|| anyhow::anyhow!("TSDB response missing data despite success status"))
        } else {
            Err(anyhow::anyhow!(
                "TSDB query failed: {}",
                self.error.unwrap_or_else(|| "unknown error".into())
            ))
        }
    }
}

/// `GET /api/v1/query` instant-vector response payload.
#[derive(Debug, Deserialize)]
pub struct QueryData {
    #[serde(rename = "resultType")]
    pub result_type: String,
    pub result: Vec<InstantVectorSample>,
}

#[derive(Debug, Deserialize)]
pub struct InstantVectorSample {
    pub metric: HashMap<String, String>,
    /// `[unix_timestamp_seconds, "value_as_string"]`
    pub value: (f64, String),
}

impl InstantVectorSample {
    pub fn uuid(&self) -> Option<&str> {
        self.metric.get("uuid").map(String::as_str)
    }

    pub fn value_f64(&self) -> f64 {
        self.value.1.parse::<f64>().unwrap_or(f64::NAN)
    }
}

/// `GET /api/v1/status/runtimeinfo` subset needed for batching (spec
/// §4.2): `query_max_samples`.
#[derive(Debug, Deserialize)]
pub struct RuntimeInfoData {
    #[serde(rename = "maxSamples", default)]
    pub max_samples: Option<u64>,
    #[serde(rename = "storageRetention", default)]
    pub storage_retention: Option<String>,
}
