use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Fixed storage key the session is serialized under.
const SESSION_KEY: &str = "vigil.session";

/// Authenticated identity and token pair.
///
/// Doubles as the body of the backend's auth responses, hence the camelCase
/// wire names and the lenient defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub expires_in: i64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub role: String,
}

fn default_token_type() -> String {
    "Bearer".into()
}

impl Session {
    /// A session without an access token is unauthenticated regardless of the rest.
    pub fn is_authenticated(&self) -> bool {
        !self.access_token.is_empty()
    }

    pub fn is_admin(&self) -> bool {
        self.role == "ADMIN"
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable, process-wide session storage.
///
/// Backed by a small SQLite key/value table so a saved session survives
/// restarts. Cloning shares the same connection.
#[derive(Clone)]
pub struct SessionStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore").finish_non_exhaustive()
    }
}

impl SessionStore {
    /// Open the store at its per-user location.
    pub fn open() -> Result<Self, StoreError> {
        Self::open_at(&Self::db_path())
    }

    pub fn open_at(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
            // Tokens live here; keep the directory private (Unix only)
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700));
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        init_schema(&conn)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
        }

        debug!(path = %path.display(), "session store opened");
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Volatile store, used by tests and as a fallback when the disk store fails.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    fn db_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("vigil")
            .join("session.db")
    }

    /// Persist the whole session in one statement.
    pub fn save(&self, session: &Session) -> Result<(), StoreError> {
        let json = serde_json::to_string(session)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![SESSION_KEY, json],
        )?;
        Ok(())
    }

    /// Returns `None` if nothing was saved, the session was cleared, or the
    /// stored value is unreadable.
    pub fn load(&self) -> Option<Session> {
        let conn = self.conn.lock();
        let raw = match read_raw(&conn) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(error = %e, "failed to read stored session");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!(error = %e, "stored session is corrupt, ignoring it");
                None
            }
        }
    }

    /// Remove the session. Clearing an empty store is fine.
    pub fn clear(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM kv WHERE key = ?1", params![SESSION_KEY])?;
        Ok(())
    }

    pub fn is_authenticated(&self) -> bool {
        self.load().is_some_and(|s| s.is_authenticated())
    }

    /// Current bearer token, if authenticated.
    pub fn access_token(&self) -> Option<String> {
        self.load()
            .map(|s| s.access_token)
            .filter(|t| !t.is_empty())
    }

    /// Swap in refreshed tokens, leaving identity fields untouched.
    ///
    /// The refresh token is replaced only when the server rotated it. Returns
    /// the updated session, or `None` if there was no session to update.
    pub fn update_tokens(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> Result<Option<Session>, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let Some(raw) = read_raw(&tx)? else {
            return Ok(None);
        };
        let mut session: Session = serde_json::from_str(&raw)?;
        session.access_token = access_token.to_string();
        if let Some(rotated) = refresh_token.filter(|r| !r.is_empty()) {
            session.refresh_token = Some(rotated.to_string());
        }
        tx.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![SESSION_KEY, serde_json::to_string(&session)?],
        )?;
        tx.commit()?;
        Ok(Some(session))
    }
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS kv (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );",
    )
}

fn read_raw(conn: &Connection) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM kv WHERE key = ?1",
        params![SESSION_KEY],
        |row| row.get(0),
    )
    .optional()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(token: &str) -> Session {
        Session {
            access_token: token.into(),
            refresh_token: Some("r1".into()),
            token_type: "Bearer".into(),
            expires_in: 3600,
            username: "ops".into(),
            role: "ADMIN".into(),
        }
    }

    #[test]
    fn test_load_empty() {
        let store = SessionStore::in_memory().unwrap();
        assert!(store.load().is_none());
        assert!(!store.is_authenticated());
    }

    #[test]
    fn test_save_then_clear() {
        let store = SessionStore::in_memory().unwrap();
        store.save(&sample("x")).unwrap();
        assert!(store.is_authenticated());
        assert_eq!(store.load().unwrap().username, "ops");

        store.clear().unwrap();
        assert!(!store.is_authenticated());
        // idempotent
        store.clear().unwrap();
        assert!(store.load().is_none());
    }

    #[test]
    fn test_empty_access_token_is_unauthenticated() {
        let store = SessionStore::in_memory().unwrap();
        store.save(&sample("")).unwrap();
        assert!(store.load().is_some());
        assert!(!store.is_authenticated());
        assert!(store.access_token().is_none());
    }

    #[test]
    fn test_update_tokens_keeps_refresh_when_not_rotated() {
        let store = SessionStore::in_memory().unwrap();
        store.save(&sample("old")).unwrap();

        let updated = store.update_tokens("new", None).unwrap().unwrap();
        assert_eq!(updated.access_token, "new");
        assert_eq!(updated.refresh_token.as_deref(), Some("r1"));
        assert_eq!(updated.role, "ADMIN");

        let rotated = store.update_tokens("newer", Some("r2")).unwrap().unwrap();
        assert_eq!(rotated.refresh_token.as_deref(), Some("r2"));
        assert_eq!(store.load().unwrap(), rotated);
    }

    #[test]
    fn test_update_tokens_without_session() {
        let store = SessionStore::in_memory().unwrap();
        assert!(store.update_tokens("a", Some("b")).unwrap().is_none());
        assert!(store.load().is_none());
    }

    #[test]
    fn test_corrupt_value_reads_as_absent() {
        let store = SessionStore::in_memory().unwrap();
        store
            .conn
            .lock()
            .execute(
                "INSERT INTO kv (key, value) VALUES (?1, ?2)",
                params![SESSION_KEY, "{not json"],
            )
            .unwrap();
        assert!(store.load().is_none());
    }

    #[test]
    fn test_auth_response_decodes_as_session() {
        let json = r#"{"accessToken":"a","refreshToken":null,"tokenType":"Bearer","expiresIn":900,"username":"u","role":"USER"}"#;
        let s: Session = serde_json::from_str(json).unwrap();
        assert!(s.is_authenticated());
        assert!(s.refresh_token.is_none());
        assert!(!s.is_admin());
    }
}
