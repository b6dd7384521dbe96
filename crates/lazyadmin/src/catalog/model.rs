//! Configuration data model.
//!
//! The on-disk document maps one-to-one onto these types; the validated
//! [`super::Catalog`] is built from a parsed [`Config`] plus any projected
//! operations. Operations and steps are tagged variants so serialization
//! stays symmetric with the data model.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Opaque role identifier. Equality by value.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(String);

impl Role {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Role {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

/// Top-level configuration document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub env: String,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub operations: Vec<Operation>,
    #[serde(default)]
    pub openapi: OpenApiConfig,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Audit database path. Absent means the null audit log.
    #[serde(default)]
    pub sqlite_path: Option<PathBuf>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// Require a hardware second factor at session entry.
    #[serde(default)]
    pub require_yubikey: bool,
    /// Accepted for compatibility; recorded on the catalog verbatim.
    #[serde(default)]
    pub yubikey_mode: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub ssh_users: Vec<String>,
    #[serde(default)]
    pub roles: BTreeSet<Role>,
    #[serde(default, rename = "yubikey_credentials")]
    pub credentials: Vec<Credential>,
}

/// Hardware-token credential. Both byte fields are base64url text.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Credential {
    pub rp_id: String,
    /// base64url-encoded credential id
    pub credential_id: String,
    /// base64url-encoded SPKI P-256 public key
    pub public_key: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Resources {
    #[serde(default)]
    pub http: BTreeMap<String, HttpResource>,
    #[serde(default)]
    pub postgres: BTreeMap<String, PostgresResource>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpResource {
    pub base_url: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PostgresResource {
    /// Environment variable carrying the DSN.
    pub dsn_env: String,
}

/// Resource kind discriminator for lookups.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    Http,
    Sql,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http => f.write_str("http"),
            Self::Sql => f.write_str("sql"),
        }
    }
}

/// A single atomic action.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Operation {
    #[serde(rename = "http")]
    Http(HttpOp),
    #[serde(rename = "postgres")]
    Sql(SqlOp),
}

impl Operation {
    pub fn id(&self) -> &str {
        match self {
            Self::Http(op) => &op.id,
            Self::Sql(op) => &op.id,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Http(op) => &op.label,
            Self::Sql(op) => &op.label,
        }
    }

    pub fn target(&self) -> &str {
        match self {
            Self::Http(op) => &op.target,
            Self::Sql(op) => &op.target,
        }
    }

    pub fn allowed_roles(&self) -> &BTreeSet<Role> {
        match self {
            Self::Http(op) => &op.allowed_roles,
            Self::Sql(op) => &op.allowed_roles,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpOp {
    pub id: String,
    #[serde(default)]
    pub label: String,
    pub target: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub allowed_roles: BTreeSet<Role>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SqlOp {
    pub id: String,
    #[serde(default)]
    pub label: String,
    pub target: String,
    pub query: String,
    #[serde(default)]
    pub allowed_roles: BTreeSet<Role>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => f.write_str("low"),
            Self::Medium => f.write_str("medium"),
            Self::High => f.write_str("high"),
        }
    }
}

/// Task-level error policy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOnError {
    #[default]
    FailFast,
    BestEffort,
}

/// Declared step-level error policy; `Inherit` resolves against the task.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOnError {
    #[default]
    Inherit,
    Fail,
    Warn,
    Continue,
}

/// An ordered, policy-governed sequence of steps.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub allowed_roles: BTreeSet<Role>,
    #[serde(default)]
    pub risk_level: RiskLevel,
    #[serde(default, rename = "require_yubikey")]
    pub require_second_factor: bool,
    #[serde(default)]
    pub on_error: TaskOnError,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_template: Option<String>,
}

/// One action within a task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    #[serde(default)]
    pub on_error: StepOnError,
    #[serde(flatten)]
    pub action: StepAction,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StepAction {
    #[serde(rename = "http")]
    Http {
        resource: String,
        method: String,
        path: String,
    },
    #[serde(rename = "postgres")]
    Sql { resource: String, query: String },
    #[serde(rename = "sleep")]
    Delay { seconds: u64 },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpenApiConfig {
    #[serde(default)]
    pub backends: BTreeMap<String, OpenApiBackend>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpenApiBackend {
    pub doc_url: String,
    #[serde(default)]
    pub tag_filter: Vec<String>,
    #[serde(default)]
    pub include_untagged: bool,
    #[serde(default)]
    pub op_id_prefix: String,
}
