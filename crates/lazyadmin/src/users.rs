//! SQLite-backed user and credential store.
//!
//! Shares the audit database file. Users registered here resolve to the same
//! [`crate::identity::Principal`] as config users; config users win on
//! conflict.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};

use crate::catalog::{Credential, User};

const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS users (
  id TEXT PRIMARY KEY,
  ssh_users TEXT NOT NULL,
  roles TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS credentials (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id TEXT NOT NULL,
  rp_id TEXT NOT NULL,
  credential_id TEXT NOT NULL,
  public_key TEXT NOT NULL,
  created_at TEXT NOT NULL,
  FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
  UNIQUE(user_id, rp_id, credential_id)
);

CREATE INDEX IF NOT EXISTS idx_credentials_user_id ON credentials(user_id);
"#;

/// Error type for user store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("user not found")]
    UserNotFound,
    #[error("user already exists")]
    UserExists,
    #[error("credential already registered")]
    CredentialExists,
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A user row.
#[derive(Clone, Debug)]
pub struct StoredUser {
    pub id: String,
    pub ssh_users: Vec<String>,
    pub roles: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A credential row.
#[derive(Clone, Debug)]
pub struct StoredCredential {
    pub id: i64,
    pub user_id: String,
    pub rp_id: String,
    pub credential_id: String,
    pub public_key: String,
    pub created_at: DateTime<Utc>,
}

pub struct UserStore {
    conn: Mutex<Connection>,
}

impl UserStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )?;
        conn.execute_batch(CREATE_TABLES)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock_conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|err| err.into_inner())
    }

    pub fn create_user(&self, id: &str, ssh_users: &[String], roles: &[String]) -> Result<StoredUser> {
        let now = Utc::now();
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO users (id, ssh_users, roles, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id,
                serde_json::to_string(ssh_users)?,
                serde_json::to_string(roles)?,
                rfc3339(&now),
                rfc3339(&now),
            ],
        )
        .map_err(|err| {
            if is_unique_violation(&err) {
                StoreError::UserExists
            } else {
                err.into()
            }
        })?;

        Ok(StoredUser {
            id: id.to_string(),
            ssh_users: ssh_users.to_vec(),
            roles: roles.to_vec(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_user(&self, id: &str) -> Result<StoredUser> {
        let conn = self.lock_conn();
        conn.query_row(
            "SELECT id, ssh_users, roles, created_at, updated_at FROM users WHERE id = ?1",
            params![id],
            user_from_row,
        )
        .map_err(|err| match err {
            rusqlite::Error::QueryReturnedNoRows => StoreError::UserNotFound,
            other => other.into(),
        })
    }

    pub fn list_users(&self) -> Result<Vec<StoredUser>> {
        let conn = self.lock_conn();
        let mut stmt =
            conn.prepare("SELECT id, ssh_users, roles, created_at, updated_at FROM users ORDER BY id")?;
        let rows = stmt.query_map([], user_from_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn delete_user(&self, id: &str) -> Result<()> {
        let conn = self.lock_conn();
        let n = conn.execute("DELETE FROM users WHERE id = ?1", params![id])?;
        if n == 0 {
            return Err(StoreError::UserNotFound);
        }
        Ok(())
    }

    /// First user whose `ssh_users` array contains `ssh_user` exactly.
    pub fn find_by_ssh_user(&self, ssh_user: &str) -> Result<Option<StoredUser>> {
        for user in self.list_users()? {
            if user.ssh_users.iter().any(|s| s == ssh_user) {
                return Ok(Some(user));
            }
        }
        Ok(None)
    }

    pub fn add_credential(
        &self,
        user_id: &str,
        rp_id: &str,
        credential_id: &str,
        public_key: &str,
    ) -> Result<StoredCredential> {
        let now = Utc::now();
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO credentials (user_id, rp_id, credential_id, public_key, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![user_id, rp_id, credential_id, public_key, rfc3339(&now)],
        )
        .map_err(|err| {
            if is_unique_violation(&err) {
                StoreError::CredentialExists
            } else {
                err.into()
            }
        })?;

        Ok(StoredCredential {
            id: conn.last_insert_rowid(),
            user_id: user_id.to_string(),
            rp_id: rp_id.to_string(),
            credential_id: credential_id.to_string(),
            public_key: public_key.to_string(),
            created_at: now,
        })
    }

    pub fn credentials_for(&self, user_id: &str) -> Result<Vec<StoredCredential>> {
        let conn = self.lock_conn();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, rp_id, credential_id, public_key, created_at
             FROM credentials WHERE user_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok(StoredCredential {
                id: row.get(0)?,
                user_id: row.get(1)?,
                rp_id: row.get(2)?,
                credential_id: row.get(3)?,
                public_key: row.get(4)?,
                created_at: parse_ts(row.get::<_, String>(5)?),
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Materialize a stored user (with credentials) as a catalog user so it
    /// can back a [`crate::identity::Principal`].
    pub fn resolve_catalog_user(&self, stored: &StoredUser) -> Result<User> {
        let credentials = self
            .credentials_for(&stored.id)?
            .into_iter()
            .map(|c| Credential {
                rp_id: c.rp_id,
                credential_id: c.credential_id,
                public_key: c.public_key,
            })
            .collect();

        Ok(User {
            id: stored.id.clone(),
            ssh_users: stored.ssh_users.clone(),
            roles: stored.roles.iter().map(|r| r.as_str().into()).collect(),
            credentials,
        })
    }
}

fn rfc3339(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(text: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}

fn user_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredUser> {
    let ssh_users: String = row.get(1)?;
    let roles: String = row.get(2)?;
    Ok(StoredUser {
        id: row.get(0)?,
        ssh_users: serde_json::from_str(&ssh_users).unwrap_or_default(),
        roles: serde_json::from_str(&roles).unwrap_or_default(),
        created_at: parse_ts(row.get::<_, String>(3)?),
        updated_at: parse_ts(row.get::<_, String>(4)?),
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_find_user() {
        let store = UserStore::in_memory().unwrap();
        store
            .create_user("dave", &["dave".into(), "dave-ops".into()], &["viewer".into()])
            .unwrap();

        let found = store.find_by_ssh_user("dave-ops").unwrap().unwrap();
        assert_eq!(found.id, "dave");
        assert_eq!(found.roles, ["viewer"]);
        assert!(store.find_by_ssh_user("nobody").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_user_is_typed_error() {
        let store = UserStore::in_memory().unwrap();
        store.create_user("dave", &["dave".into()], &["viewer".into()]).unwrap();
        let err = store
            .create_user("dave", &["other".into()], &["admin".into()])
            .unwrap_err();
        assert!(matches!(err, StoreError::UserExists));
    }

    #[test]
    fn test_duplicate_credential_is_typed_error() {
        let store = UserStore::in_memory().unwrap();
        store.create_user("dave", &["dave".into()], &["viewer".into()]).unwrap();
        store
            .add_credential("dave", "example.com", "credA", "pkA")
            .unwrap();
        let err = store
            .add_credential("dave", "example.com", "credA", "pkA")
            .unwrap_err();
        assert!(matches!(err, StoreError::CredentialExists));

        // Same credential id under a different rp is fine.
        store
            .add_credential("dave", "other.example", "credA", "pkA")
            .unwrap();
        assert_eq!(store.credentials_for("dave").unwrap().len(), 2);
    }

    #[test]
    fn test_json_arrays_survive_quotes_and_backslashes() {
        let store = UserStore::in_memory().unwrap();
        let ssh = vec![r#"we"ird"#.to_string(), r"back\slash".to_string()];
        store.create_user("odd", &ssh, &["viewer".into()]).unwrap();

        let back = store.get_user("odd").unwrap();
        assert_eq!(back.ssh_users, ssh);
    }

    #[test]
    fn test_delete_cascades_credentials() {
        let store = UserStore::in_memory().unwrap();
        store.create_user("dave", &["dave".into()], &["viewer".into()]).unwrap();
        store
            .add_credential("dave", "example.com", "credA", "pkA")
            .unwrap();

        store.delete_user("dave").unwrap();
        assert!(matches!(store.get_user("dave"), Err(StoreError::UserNotFound)));
        assert!(store.credentials_for("dave").unwrap().is_empty());
        assert!(matches!(store.delete_user("dave"), Err(StoreError::UserNotFound)));
    }

    #[test]
    fn test_resolve_catalog_user_carries_credentials() {
        let store = UserStore::in_memory().unwrap();
        let stored = store
            .create_user("dave", &["dave".into()], &["viewer".into()])
            .unwrap();
        store
            .add_credential("dave", "example.com", "credA", "pkA")
            .unwrap();

        let user = store.resolve_catalog_user(&stored).unwrap();
        assert_eq!(user.credentials.len(), 1);
        assert_eq!(user.credentials[0].rp_id, "example.com");
        assert!(user.roles.contains(&"viewer".into()));
    }
}
