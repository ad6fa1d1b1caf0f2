use reqwest::{Client, Response, StatusCode};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::error_from_response;
use crate::config::Settings;
use crate::error::DashboardError;
use crate::session::{Session, SessionStore};

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// REST client for the auth endpoints, and the bearer-token plumbing every
/// other REST call goes through.
///
/// Cloning is cheap; clones share the HTTP pool, the session store and the
/// refresh gate, so concurrent 401s anywhere in the app coalesce into one
/// refresh.
#[derive(Clone)]
pub struct AuthApi {
    http: Client,
    base_url: String,
    store: SessionStore,
    refresh_gate: Arc<Mutex<()>>,
}

impl AuthApi {
    pub fn new(base_url: impl Into<String>, store: SessionStore, timeout: Duration) -> Result<Self, DashboardError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DashboardError::Network(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            store,
            refresh_gate: Arc::new(Mutex::new(())),
        })
    }

    pub fn from_settings(settings: &Settings, store: SessionStore) -> Result<Self, DashboardError> {
        Self::new(settings.api_base_url.clone(), store, settings.request_timeout())
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Sign in and persist the returned session.
    pub async fn login(&self, username: &str, password: &str) -> Result<Session, DashboardError> {
        let resp = self
            .http
            .post(self.url("/auth/login"))
            .json(&LoginRequest { username, password })
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        let session: Session = resp.json().await?;
        if !session.is_authenticated() {
            return Err(DashboardError::http(502, Some("login response carried no access token".into())));
        }
        self.store.save(&session)?;
        info!(user = %session.username, role = %session.role, "signed in");
        Ok(session)
    }

    /// Create an account. Some servers answer with a session, some with an
    /// empty body; a returned session is persisted.
    pub async fn register(&self, request: &RegisterRequest) -> Result<Option<Session>, DashboardError> {
        let resp = self.http.post(self.url("/auth/register")).json(request).send().await?;
        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }
        let body = resp.text().await?;
        if body.trim().is_empty() {
            return Ok(None);
        }
        match serde_json::from_str::<Session>(&body) {
            Ok(session) if session.is_authenticated() => {
                self.store.save(&session)?;
                info!(user = %session.username, "registered and signed in");
                Ok(Some(session))
            }
            Ok(_) => Ok(None),
            Err(e) => {
                debug!(error = %e, "register response is not a session");
                Ok(None)
            }
        }
    }

    /// Tell the server, then forget the session whatever it answered.
    pub async fn logout(&self) -> Result<(), DashboardError> {
        if let Some(token) = self.store.access_token() {
            let result = self.http.post(self.url("/auth/logout")).bearer_auth(&token).send().await;
            match result {
                Ok(resp) if !resp.status().is_success() => {
                    warn!(status = resp.status().as_u16(), "logout rejected by server");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "logout request failed"),
            }
        }
        self.store.clear()?;
        info!("signed out");
        Ok(())
    }

    /// Exchange the refresh token for a new access token.
    ///
    /// `rejected` is the token the server just refused. If another caller has
    /// already replaced it by the time the gate opens, that newer token is
    /// returned without another round trip. On any failure the session is
    /// cleared and `SessionExpired` returned.
    pub async fn refresh(&self, rejected: Option<&str>) -> Result<String, DashboardError> {
        let _gate = self.refresh_gate.lock().await;

        let session = self.store.load();
        if let (Some(current), Some(rejected)) = (session.as_ref(), rejected) {
            if current.is_authenticated() && current.access_token != rejected {
                debug!("token already refreshed by a concurrent request");
                return Ok(current.access_token.clone());
            }
        }

        let Some(refresh_token) = session.and_then(|s| s.refresh_token).filter(|t| !t.is_empty()) else {
            warn!("no refresh token, session expired");
            return Err(self.expire());
        };

        // Plain request: the refresh call never goes back through the 401 path
        let result = self
            .http
            .post(self.url("/auth/refresh"))
            .json(&RefreshRequest { refresh_token: &refresh_token })
            .send()
            .await;
        let resp = match result {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                warn!(status = resp.status().as_u16(), "token refresh rejected");
                return Err(self.expire());
            }
            Err(e) => {
                warn!(error = %e, "token refresh failed");
                return Err(self.expire());
            }
        };

        let renewed: Session = match resp.json().await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "unreadable refresh response");
                return Err(self.expire());
            }
        };
        if !renewed.is_authenticated() {
            warn!("refresh response carried no access token");
            return Err(self.expire());
        }

        match self.store.update_tokens(&renewed.access_token, renewed.refresh_token.as_deref()) {
            Ok(Some(_)) => {
                info!("access token refreshed");
                Ok(renewed.access_token)
            }
            Ok(None) => Err(DashboardError::SessionExpired),
            Err(e) => {
                warn!(error = %e, "could not store refreshed tokens");
                Err(self.expire())
            }
        }
    }

    fn expire(&self) -> DashboardError {
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "failed to clear expired session");
        }
        DashboardError::SessionExpired
    }

    /// GET with the current bearer token. A 401 triggers exactly one
    /// refresh-and-retry; a second 401 is `AuthExpired`.
    pub async fn get_authorized(&self, path: &str) -> Result<Response, DashboardError> {
        let url = self.url(path);
        let token = self.store.access_token();

        let resp = self.bearer_get(&url, token.as_deref()).await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        info!(path, "access token rejected, refreshing");
        let fresh = self.refresh(token.as_deref()).await?;
        let retry = self.bearer_get(&url, Some(&fresh)).await?;
        if retry.status() == StatusCode::UNAUTHORIZED {
            warn!(path, "request rejected again after refresh");
            return Err(DashboardError::AuthExpired);
        }
        Ok(retry)
    }

    async fn bearer_get(&self, url: &str, token: Option<&str>) -> Result<Response, DashboardError> {
        let mut req = self.http.get(url);
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        Ok(req.send().await?)
    }
}

impl std::fmt::Debug for AuthApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthApi").field("base_url", &self.base_url).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api() -> AuthApi {
        AuthApi::new("http://127.0.0.1:1/api/", SessionStore::in_memory().unwrap(), Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn test_base_url_trailing_slash() {
        assert_eq!(api().url("/auth/login"), "http://127.0.0.1:1/api/auth/login");
    }

    #[test]
    fn test_register_request_omits_missing_role() {
        let req = RegisterRequest {
            username: "u".into(),
            email: "u@example.com".into(),
            password: "p".into(),
            role: None,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("role").is_none());
        assert_eq!(json["email"], "u@example.com");
    }

    #[tokio::test]
    async fn test_refresh_without_session_expires() {
        let api = api();
        assert_eq!(api.refresh(Some("t")).await.unwrap_err(), DashboardError::SessionExpired);
    }

    #[tokio::test]
    async fn test_refresh_returns_newer_token_without_request() {
        let api = api();
        api.store()
            .save(&Session { access_token: "newer".into(), ..Default::default() })
            .unwrap();
        // The server is unreachable, so any request would fail
        assert_eq!(api.refresh(Some("older")).await.unwrap(), "newer");
    }

    #[tokio::test]
    async fn test_logout_clears_even_when_server_unreachable() {
        let api = api();
        api.store()
            .save(&Session { access_token: "x".into(), ..Default::default() })
            .unwrap();
        api.logout().await.unwrap();
        assert!(!api.store().is_authenticated());
        // idempotent
        api.logout().await.unwrap();
    }
}
