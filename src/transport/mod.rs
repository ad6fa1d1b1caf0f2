//! Network side of the dashboard: REST auth and snapshots, and the live push feed.

pub mod auth;
pub mod pull;
pub mod push;
pub mod stomp;

pub use auth::{AuthApi, RegisterRequest};
pub use pull::MetricsApi;
pub use push::{ChannelEvent, ChannelState, Delivery, PushChannel, PushConfig, Subscription, SubscriptionId};

use crate::error::DashboardError;
use serde_json::Value;

/// Turn a non-2xx response into an error, using the server's own wording
/// (`message` or `error` field) when it sent any.
pub(crate) async fn error_from_response(resp: reqwest::Response) -> DashboardError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    DashboardError::http(status, server_message(&body))
}

fn server_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    ["message", "error"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_message() {
        assert_eq!(server_message(r#"{"message":"Invalid credentials"}"#).as_deref(), Some("Invalid credentials"));
        assert_eq!(server_message(r#"{"error":"Forbidden","status":403}"#).as_deref(), Some("Forbidden"));
        assert_eq!(server_message(r#"{"message":42}"#), None);
        assert_eq!(server_message("<html>"), None);
    }
}
