//! Audit database schema.
//!
//! One table, insert and select only. Retention is an operator concern; the
//! data layer exposes no update or delete path.

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS audit_log (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  occurred_at TEXT NOT NULL,
  user_id TEXT NOT NULL,
  ssh_user TEXT NOT NULL,
  operation_id TEXT NOT NULL,
  success INTEGER NOT NULL,
  error TEXT
);
"#;

pub const INSERT_RECORD: &str = r#"
INSERT INTO audit_log (occurred_at, user_id, ssh_user, operation_id, success, error)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
"#;

pub const SELECT_RECENT: &str = r#"
SELECT id, occurred_at, user_id, ssh_user, operation_id, success, error
FROM audit_log
ORDER BY id DESC
LIMIT ?1
"#;
