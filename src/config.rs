use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::history::BufferLifetime;
use crate::theme::{AccentColor, ThemeVariant};
use crate::transport::push::PushConfig;

pub const ENV_API_URL: &str = "VIGIL_API_URL";
pub const ENV_WS_URL: &str = "VIGIL_WS_URL";
pub const ENV_CONFIG: &str = "VIGIL_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// User settings, stored as JSON. Fields missing from an older file take
/// their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// REST base, e.g. `http://localhost:8080/api`.
    pub api_base_url: String,
    /// WebSocket endpoint of the message broker.
    pub ws_url: String,
    pub metrics_topic: String,
    pub request_timeout_secs: u64,
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    /// Heartbeat interval in both directions; 0 disables it.
    pub heartbeat_ms: u64,
    /// Samples kept per category on the combined dashboard.
    pub dashboard_buffer_size: usize,
    /// Samples kept per category in a detail view.
    pub detail_buffer_size: usize,
    pub buffer_lifetime: BufferLifetime,
    pub theme: ThemeVariant,
    pub accent: AccentColor,
    /// CPU usage threshold (%) for alert highlighting.
    pub cpu_alert_threshold: f64,
    /// Memory usage threshold (%) for alert highlighting.
    pub mem_alert_threshold: f64,
    /// Desktop notifications on session expiry and lost feed.
    pub notifications: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080/api".into(),
            ws_url: "ws://localhost:8080/ws-monitoring".into(),
            metrics_topic: "/topic/metrics".into(),
            request_timeout_secs: 10,
            reconnect_attempts: 5,
            reconnect_delay_ms: 3000,
            heartbeat_ms: 4000,
            dashboard_buffer_size: 50,
            detail_buffer_size: 60,
            buffer_lifetime: BufferLifetime::Persistent,
            theme: ThemeVariant::Midnight,
            accent: AccentColor::Teal,
            cpu_alert_threshold: 90.0,
            mem_alert_threshold: 90.0,
            notifications: true,
        }
    }
}

impl Settings {
    /// Linux → ~/.config/Vigil/settings.json, unless `VIGIL_CONFIG` points elsewhere.
    pub fn default_path() -> PathBuf {
        if let Some(custom) = std::env::var_os(ENV_CONFIG) {
            return PathBuf::from(custom);
        }
        dirs::config_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Vigil")
            .join("settings.json")
    }

    /// Load from the default location and apply environment overrides.
    pub fn load() -> Self {
        let mut settings = Self::load_from(&Self::default_path());
        settings.apply_overrides(|key| std::env::var(key).ok());
        settings
    }

    /// Never fails: an unreadable file yields defaults.
    pub fn load_from(path: &Path) -> Self {
        let mut settings = match fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "invalid settings file, using defaults");
                Self::default()
            }),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "no settings file, using defaults");
                Self::default()
            }
        };
        settings.sanitize();
        settings
    }

    /// Apply `VIGIL_API_URL` / `VIGIL_WS_URL` from the given lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_API_URL).filter(|u| !u.trim().is_empty()) {
            self.api_base_url = url.trim().to_string();
        }
        if let Some(url) = lookup(ENV_WS_URL).filter(|u| !u.trim().is_empty()) {
            self.ws_url = url.trim().to_string();
        }
    }

    /// Clamp all numeric fields to valid ranges.
    pub fn sanitize(&mut self) {
        self.api_base_url = self.api_base_url.trim_end_matches('/').to_string();
        self.request_timeout_secs = self.request_timeout_secs.clamp(1, 300);
        self.reconnect_attempts = self.reconnect_attempts.min(100);
        self.reconnect_delay_ms = self.reconnect_delay_ms.clamp(100, 60_000);
        if self.heartbeat_ms != 0 {
            self.heartbeat_ms = self.heartbeat_ms.clamp(1000, 60_000);
        }
        self.dashboard_buffer_size = self.dashboard_buffer_size.clamp(1, 1000);
        self.detail_buffer_size = self.detail_buffer_size.clamp(1, 1000);
        self.cpu_alert_threshold = clamp_threshold(self.cpu_alert_threshold);
        self.mem_alert_threshold = clamp_threshold(self.mem_alert_threshold);
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::default_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = fs::set_permissions(dir, fs::Permissions::from_mode(0o700));
            }
        }

        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn push_config(&self) -> PushConfig {
        PushConfig::new(self.ws_url.clone())
            .with_reconnect(self.reconnect_attempts, Duration::from_millis(self.reconnect_delay_ms))
            .with_heartbeat(Duration::from_millis(self.heartbeat_ms))
    }
}

fn clamp_threshold(v: f64) -> f64 {
    if v.is_finite() {
        v.clamp(10.0, 100.0)
    } else {
        90.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let s = Settings::default();
        assert_eq!(s.api_base_url, "http://localhost:8080/api");
        assert_eq!(s.reconnect_attempts, 5);
        assert_eq!(s.reconnect_delay_ms, 3000);
        assert_eq!(s.heartbeat_ms, 4000);
        assert_eq!(s.dashboard_buffer_size, 50);
        assert_eq!(s.detail_buffer_size, 60);
        assert_eq!(s.buffer_lifetime, BufferLifetime::Persistent);
    }

    #[test]
    fn test_backwards_compat_missing_fields() {
        let old_json = r#"{"api_base_url":"http://metrics.local/api","reconnect_attempts":2}"#;
        let s: Settings = serde_json::from_str(old_json).unwrap();
        assert_eq!(s.api_base_url, "http://metrics.local/api");
        assert_eq!(s.reconnect_attempts, 2);
        assert_eq!(s.metrics_topic, "/topic/metrics");
        assert!(s.notifications);
    }

    #[test]
    fn test_sanitize_clamps() {
        let mut s = Settings {
            api_base_url: "http://x/api/".into(),
            reconnect_delay_ms: 1,
            heartbeat_ms: 10,
            dashboard_buffer_size: 0,
            detail_buffer_size: 50_000,
            cpu_alert_threshold: f64::NAN,
            mem_alert_threshold: 2.0,
            ..Settings::default()
        };
        s.sanitize();
        assert_eq!(s.api_base_url, "http://x/api");
        assert_eq!(s.reconnect_delay_ms, 100);
        assert_eq!(s.heartbeat_ms, 1000);
        assert_eq!(s.dashboard_buffer_size, 1);
        assert_eq!(s.detail_buffer_size, 1000);
        assert_eq!(s.cpu_alert_threshold, 90.0);
        assert_eq!(s.mem_alert_threshold, 10.0);
    }

    #[test]
    fn test_zero_heartbeat_stays_disabled() {
        let mut s = Settings { heartbeat_ms: 0, ..Settings::default() };
        s.sanitize();
        assert_eq!(s.heartbeat_ms, 0);
    }

    #[test]
    fn test_env_overrides() {
        let mut s = Settings::default();
        s.apply_overrides(|key| match key {
            ENV_API_URL => Some(" https://prod.example/api ".into()),
            ENV_WS_URL => Some(String::new()),
            _ => None,
        });
        assert_eq!(s.api_base_url, "https://prod.example/api");
        assert_eq!(s.ws_url, "ws://localhost:8080/ws-monitoring");
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let s = Settings { detail_buffer_size: 42, buffer_lifetime: BufferLifetime::PerView, ..Settings::default() };
        s.save_to(&path).unwrap();
        assert_eq!(Settings::load_from(&path), s);
    }

    #[test]
    fn test_corrupt_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ nope").unwrap();
        assert_eq!(Settings::load_from(&path), Settings::default());
    }
}
