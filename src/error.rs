use thiserror::Error;

/// Failures surfaced by the transport and controller layers.
///
/// Cloneable so it can ride inside UI messages. Malformed metric payloads
/// never show up here; they degrade to zeroed fields in `metrics`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DashboardError {
    /// Push channel failed to connect or dropped.
    #[error("connection error: {0}")]
    Transport(String),
    /// A subscription was requested while the push channel was not connected.
    #[error("push channel is not connected")]
    NotConnected,
    /// The server rejected the access token and the retry was rejected as well.
    #[error("authentication required")]
    AuthExpired,
    /// Refresh token missing or rejected. The session has been cleared.
    #[error("session expired, please sign in again")]
    SessionExpired,
    /// The server could not be reached.
    #[error("cannot reach server: {0}")]
    Network(String),
    /// Non-2xx response other than an auth failure.
    #[error("{message}")]
    Http { status: u16, message: String },
    /// A snapshot fetch is already in flight for this controller.
    #[error("a metrics request is already in progress")]
    Busy,
    /// Local session storage failed.
    #[error("session storage: {0}")]
    Store(String),
}

impl DashboardError {
    /// Build an HTTP error, preferring the server-provided message.
    pub fn http(status: u16, server_message: Option<String>) -> Self {
        let message = server_message
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| default_status_message(status));
        DashboardError::Http { status, message }
    }

    /// Errors that require the operator to sign in again.
    pub fn requires_login(&self) -> bool {
        matches!(self, DashboardError::SessionExpired | DashboardError::AuthExpired)
    }
}

impl From<reqwest::Error> for DashboardError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return DashboardError::http(status.as_u16(), None);
        }
        if e.is_timeout() {
            return DashboardError::Network("request timed out".into());
        }
        if e.is_connect() {
            return DashboardError::Network("cannot reach server".into());
        }
        DashboardError::Network(e.to_string())
    }
}

impl From<crate::session::StoreError> for DashboardError {
    fn from(e: crate::session::StoreError) -> Self {
        DashboardError::Store(e.to_string())
    }
}

fn default_status_message(status: u16) -> String {
    match status {
        400 => "bad request".into(),
        401 => "authentication required".into(),
        403 => "access denied".into(),
        404 => "requested resource not found".into(),
        500 => "server error".into(),
        other => format!("request failed (status {other})"),
    }
}
