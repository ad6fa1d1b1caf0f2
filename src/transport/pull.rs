use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use super::auth::AuthApi;
use super::error_from_response;
use crate::error::DashboardError;
use crate::metrics::{MetricCategory, MetricsData, Normalizer};

/// One-shot snapshot requests against the monitoring endpoints.
#[derive(Debug, Clone)]
pub struct MetricsApi {
    auth: AuthApi,
    normalizer: Arc<Normalizer>,
}

impl MetricsApi {
    pub fn new(auth: AuthApi) -> Self {
        Self::with_normalizer(auth, Arc::new(Normalizer::new()))
    }

    /// Share a normalizer with the push path so receipt timestamps stay ordered
    /// across both sources.
    pub fn with_normalizer(auth: AuthApi, normalizer: Arc<Normalizer>) -> Self {
        Self { auth, normalizer }
    }

    pub fn auth(&self) -> &AuthApi {
        &self.auth
    }

    pub fn normalizer(&self) -> &Arc<Normalizer> {
        &self.normalizer
    }

    /// Fetch one category. The result carries only that category.
    pub async fn fetch_snapshot(&self, category: MetricCategory) -> Result<MetricsData, DashboardError> {
        let raw = self.get_json(&format!("/monitoring/metrics/{}", category.path())).await?;
        Ok(self.normalizer.category(category, &raw).into_value())
    }

    /// Fetch the aggregate frame (every category plus system info).
    pub async fn fetch_all(&self) -> Result<MetricsData, DashboardError> {
        let raw = self.get_json("/monitoring/metrics/all").await?;
        Ok(self.normalizer.frame(&raw).into_value())
    }

    async fn get_json(&self, path: &str) -> Result<Value, DashboardError> {
        let resp = self.auth.get_authorized(path).await?;
        if !resp.status().is_success() {
            let err = error_from_response(resp).await;
            warn!(path, error = %err, "snapshot request failed");
            return Err(err);
        }
        let body = resp.text().await?;
        Ok(serde_json::from_str(&body).unwrap_or_else(|e| {
            debug!(path, error = %e, "snapshot body is not JSON");
            Value::Null
        }))
    }
}
