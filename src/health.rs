use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

/// Internal liveness + last-tick snapshot surface (spec §1 [AMBIENT]: "a
/// `/health` liveness endpoint and a `/metrics`-adjacent internal status
/// snapshot used by the scheduler's own logging"). Carries no unit/usage
/// query routes — this is not the read-side API named in Non-goals.
#[derive(Clone, Default)]
pub struct HealthState(Arc<RwLock<HealthSnapshot>>);

#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthSnapshot {
    pub last_successful_tick_at: Option<DateTime<Utc>>,
    pub last_tick_error: Option<String>,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_success(&self, at: DateTime<Utc>) {
        let mut guard = self.0.write().await;
        guard.last_successful_tick_at = Some(at);
        guard.last_tick_error = None;
    }

    pub async fn record_error(&self, err: impl Into<String>) {
        let mut guard = self.0.write().await;
        guard.last_tick_error = Some(err.into());
    }

    async fn snapshot(&self) -> HealthSnapshot {
        self.0.read().await.clone()
    }
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status))
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

async fn status(State(state): State<HealthState>) -> Json<HealthSnapshot> {
    Json(state.snapshot().await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_success_clears_prior_error() {
        let state = HealthState::new();
        state.record_error("tsdb unreachable").await;
        let now = Utc::now();
        state.record_success(now).await;

        let snapshot = state.snapshot().await;
        assert_eq!(snapshot.last_successful_tick_at, Some(now));
        assert!(snapshot.last_tick_error.is_none());
    }
}
