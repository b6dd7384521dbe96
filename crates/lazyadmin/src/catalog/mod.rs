//! Validated catalog of users, roles, resources, operations and tasks.
//!
//! The catalog is loaded once at startup and never mutated afterwards.
//! Validation is total: every invariant violation in the document is
//! collected and reported, not just the first one.

mod model;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::env::Environment;
use crate::identity::Principal;

pub use model::{
    AuthConfig, Config, Credential, HttpOp, HttpResource, LoggingConfig, OpenApiBackend,
    OpenApiConfig, Operation, PostgresResource, Resources, ResourceKind, RiskLevel, Role, SqlOp,
    Step, StepAction, StepOnError, Task, TaskOnError, User,
};

/// A single invariant violation with a stable field path.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvariantViolation {
    pub path: String,
    pub message: String,
}

impl InvariantViolation {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Every invariant violation found in one document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvariantViolations {
    pub violations: Vec<InvariantViolation>,
}

impl fmt::Display for InvariantViolations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "catalog validation failed with {} violation(s):",
            self.violations.len()
        )?;
        for v in &self.violations {
            writeln!(f, "- {}: {}", v.path, v.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for InvariantViolations {}

/// Errors raised while loading the catalog.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error(transparent)]
    Invalid(#[from] InvariantViolations),
}

/// Parse a configuration document.
pub fn parse(text: &str) -> Result<Config, ConfigError> {
    Ok(serde_yaml::from_str(text)?)
}

/// Read and parse the configuration file resolved from the environment.
pub fn load_file(env: &Environment) -> Result<Config, ConfigError> {
    let path = env.config_path();
    let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    parse(&text)
}

/// A SQL resource with its DSN resolved from the environment at load time.
/// `dsn == None` marks the resource unavailable; targeting it still loads
/// but fails at execution.
#[derive(Clone, Debug)]
pub struct SqlResource {
    pub dsn_env: String,
    pub dsn: Option<String>,
}

impl SqlResource {
    pub fn available(&self) -> bool {
        self.dsn.is_some()
    }
}

/// A resolved resource of either kind.
#[derive(Clone, Copy, Debug)]
pub enum ResourceEntry<'a> {
    Http(&'a HttpResource),
    Sql(&'a SqlResource),
}

/// The fully validated in-memory declaration of what exists and who may do
/// what. Read-only after construction.
#[derive(Debug)]
pub struct Catalog {
    project: String,
    env_name: String,
    logging: LoggingConfig,
    auth: AuthConfig,
    users: Vec<User>,
    http: BTreeMap<String, HttpResource>,
    sql: BTreeMap<String, SqlResource>,
    operations: Vec<Operation>,
    tasks: Vec<Task>,
}

impl Catalog {
    /// Build a validated catalog from a parsed document plus projected
    /// operations. Projected operations are appended after static ones and
    /// validated under the same invariants.
    pub fn build(
        config: Config,
        projected: Vec<Operation>,
        env: &Environment,
    ) -> Result<Self, ConfigError> {
        let mut operations = config.operations;
        operations.extend(projected);

        let mut violations = Vec::new();
        validate_users(&config.users, &mut violations);
        let known_roles: BTreeSet<&Role> =
            config.users.iter().flat_map(|u| u.roles.iter()).collect();
        validate_operations(&operations, &config.resources, &known_roles, &mut violations);
        validate_tasks(&config.tasks, &config.resources, &known_roles, &mut violations);

        if !violations.is_empty() {
            return Err(InvariantViolations { violations }.into());
        }

        let sql = config
            .resources
            .postgres
            .iter()
            .map(|(name, res)| {
                let dsn = env.var(&res.dsn_env).map(str::to_string);
                if dsn.is_none() {
                    tracing::warn!(
                        resource = %name,
                        dsn_env = %res.dsn_env,
                        "DSN env var not set, sql resource unavailable"
                    );
                }
                (
                    name.clone(),
                    SqlResource {
                        dsn_env: res.dsn_env.clone(),
                        dsn,
                    },
                )
            })
            .collect();

        Ok(Self {
            project: config.project,
            env_name: config.env,
            logging: config.logging,
            auth: config.auth,
            users: config.users,
            http: config.resources.http,
            sql,
            operations,
            tasks: config.tasks,
        })
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn env_name(&self) -> &str {
        &self.env_name
    }

    pub fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    pub fn auth(&self) -> &AuthConfig {
        &self.auth
    }

    pub fn users(&self) -> &[User] {
        &self.users
    }

    /// First user (declaration order) with an exact `ssh_users` match.
    pub fn find_user_by_ssh(&self, ssh_user: &str) -> Option<&User> {
        self.users
            .iter()
            .find(|u| u.ssh_users.iter().any(|s| s == ssh_user))
    }

    /// Operations the principal may run, in declaration order (projected
    /// operations after static ones).
    pub fn operations_visible_to(&self, principal: &Principal) -> Vec<&Operation> {
        self.operations
            .iter()
            .filter(|op| principal.has_any_role(op.allowed_roles()))
            .collect()
    }

    /// Tasks the principal may run, in declaration order.
    pub fn tasks_visible_to(&self, principal: &Principal) -> Vec<&Task> {
        self.tasks
            .iter()
            .filter(|t| principal.has_any_role(&t.allowed_roles))
            .collect()
    }

    pub fn resolve_operation(&self, id: &str) -> Option<&Operation> {
        self.operations.iter().find(|op| op.id() == id)
    }

    pub fn resolve_task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Resolve a declared resource by kind and name.
    pub fn resolve_resource(&self, kind: ResourceKind, name: &str) -> Option<ResourceEntry<'_>> {
        match kind {
            ResourceKind::Http => self.http.get(name).map(ResourceEntry::Http),
            ResourceKind::Sql => self.sql.get(name).map(ResourceEntry::Sql),
        }
    }

    pub fn http_resource(&self, name: &str) -> Option<&HttpResource> {
        self.http.get(name)
    }

    pub fn sql_resource(&self, name: &str) -> Option<&SqlResource> {
        self.sql.get(name)
    }

    pub fn http_resources(&self) -> &BTreeMap<String, HttpResource> {
        &self.http
    }

    pub fn sql_resources(&self) -> &BTreeMap<String, SqlResource> {
        &self.sql
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }
}

fn validate_users(users: &[User], violations: &mut Vec<InvariantViolation>) {
    let mut seen = HashSet::new();
    for (i, user) in users.iter().enumerate() {
        let path = format!("users[{i}]");
        if user.id.is_empty() {
            violations.push(InvariantViolation::new(format!("{path}.id"), "empty id"));
        } else if !seen.insert(user.id.as_str()) {
            violations.push(InvariantViolation::new(
                format!("{path}.id"),
                format!("duplicate user id {:?}", user.id),
            ));
        }
        if user.ssh_users.is_empty() {
            violations.push(InvariantViolation::new(
                format!("{path}.ssh_users"),
                "user must have at least one ssh user",
            ));
        }
        if user.roles.is_empty() {
            violations.push(InvariantViolation::new(
                format!("{path}.roles"),
                "user must have at least one role",
            ));
        }
    }
}

fn check_roles(
    allowed: &BTreeSet<Role>,
    known: &BTreeSet<&Role>,
    path: &str,
    violations: &mut Vec<InvariantViolation>,
) {
    for role in allowed {
        if !known.contains(role) {
            violations.push(InvariantViolation::new(
                path.to_string(),
                format!("role {:?} is not held by any user", role.as_str()),
            ));
        }
    }
}

fn validate_operations(
    operations: &[Operation],
    resources: &Resources,
    known_roles: &BTreeSet<&Role>,
    violations: &mut Vec<InvariantViolation>,
) {
    let mut seen = HashSet::new();
    for (i, op) in operations.iter().enumerate() {
        let path = format!("operations[{i}]");
        if op.id().is_empty() {
            violations.push(InvariantViolation::new(format!("{path}.id"), "empty id"));
        } else if !seen.insert(op.id()) {
            violations.push(InvariantViolation::new(
                format!("{path}.id"),
                format!("duplicate operation id {:?}", op.id()),
            ));
        }
        match op {
            Operation::Http(http) => {
                if !resources.http.contains_key(&http.target) {
                    violations.push(InvariantViolation::new(
                        format!("{path}.target"),
                        format!("unknown http resource {:?}", http.target),
                    ));
                }
            }
            Operation::Sql(sql) => {
                if !resources.postgres.contains_key(&sql.target) {
                    violations.push(InvariantViolation::new(
                        format!("{path}.target"),
                        format!("unknown sql resource {:?}", sql.target),
                    ));
                }
            }
        }
        check_roles(
            op.allowed_roles(),
            known_roles,
            &format!("{path}.allowed_roles"),
            violations,
        );
    }
}

fn validate_tasks(
    tasks: &[Task],
    resources: &Resources,
    known_roles: &BTreeSet<&Role>,
    violations: &mut Vec<InvariantViolation>,
) {
    let mut seen = HashSet::new();
    for (i, task) in tasks.iter().enumerate() {
        let path = format!("tasks[{i}]");
        if task.id.is_empty() {
            violations.push(InvariantViolation::new(format!("{path}.id"), "empty id"));
        } else if !seen.insert(task.id.as_str()) {
            violations.push(InvariantViolation::new(
                format!("{path}.id"),
                format!("duplicate task id {:?}", task.id),
            ));
        }
        if task.steps.is_empty() {
            violations.push(InvariantViolation::new(
                format!("{path}.steps"),
                "task must have at least one step",
            ));
        }
        check_roles(
            &task.allowed_roles,
            known_roles,
            &format!("{path}.allowed_roles"),
            violations,
        );

        let mut step_ids = HashSet::new();
        for (j, step) in task.steps.iter().enumerate() {
            let step_path = format!("{path}.steps[{j}]");
            if step.id.is_empty() {
                violations.push(InvariantViolation::new(
                    format!("{step_path}.id"),
                    "empty id",
                ));
            } else if !step_ids.insert(step.id.as_str()) {
                violations.push(InvariantViolation::new(
                    format!("{step_path}.id"),
                    format!("duplicate step id {:?}", step.id),
                ));
            }
            match &step.action {
                StepAction::Http { resource, .. } => {
                    if !resources.http.contains_key(resource) {
                        violations.push(InvariantViolation::new(
                            format!("{step_path}.resource"),
                            format!("unknown http resource {:?}", resource),
                        ));
                    }
                }
                StepAction::Sql { resource, .. } => {
                    if !resources.postgres.contains_key(resource) {
                        violations.push(InvariantViolation::new(
                            format!("{step_path}.resource"),
                            format!("unknown sql resource {:?}", resource),
                        ));
                    }
                }
                StepAction::Delay { .. } => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = r#"
project: demo
env: staging
users:
  - id: alice
    ssh_users: [alice, alice-dev]
    roles: [admin]
  - id: bob
    ssh_users: [bob]
    roles: [viewer]
resources:
  http:
    backend:
      base_url: http://127.0.0.1:8080
  postgres:
    maindb:
      dsn_env: MAINDB_DSN
operations:
  - type: http
    id: backend_health
    label: Backend health
    target: backend
    method: GET
    path: /health
    allowed_roles: [admin]
  - type: postgres
    id: count_users
    label: Count users
    target: maindb
    query: SELECT count(*) FROM users
    allowed_roles: [admin, viewer]
tasks:
  - id: restart
    label: Restart backend
    allowed_roles: [admin]
    on_error: fail_fast
    steps:
      - id: stop
        type: http
        resource: backend
        method: POST
        path: /stop
      - id: wait
        type: sleep
        seconds: 1
"#;

    fn principal(user_id: &str) -> Principal {
        let env = Environment::default();
        let config = parse(GOOD).unwrap();
        let catalog = Catalog::build(config, Vec::new(), &env).unwrap();
        let user = catalog
            .users()
            .iter()
            .find(|u| u.id == user_id)
            .unwrap()
            .clone();
        let ssh = user.ssh_users[0].clone();
        Principal::new(user, ssh)
    }

    #[test]
    fn test_build_valid_catalog() {
        let env = Environment::from_vars([("MAINDB_DSN", "postgres://localhost/main")]);
        let catalog = Catalog::build(parse(GOOD).unwrap(), Vec::new(), &env).unwrap();

        assert_eq!(catalog.project(), "demo");
        assert_eq!(catalog.operations().len(), 2);
        assert!(catalog.sql_resource("maindb").unwrap().available());
        assert!(catalog.resolve_operation("backend_health").is_some());
        assert!(catalog.resolve_operation("nope").is_none());

        assert!(matches!(
            catalog.resolve_resource(ResourceKind::Http, "backend"),
            Some(ResourceEntry::Http(_))
        ));
        assert!(matches!(
            catalog.resolve_resource(ResourceKind::Sql, "maindb"),
            Some(ResourceEntry::Sql(_))
        ));
        assert!(catalog.resolve_resource(ResourceKind::Http, "maindb").is_none());
    }

    #[test]
    fn test_sql_resource_without_dsn_is_unavailable_but_loads() {
        let env = Environment::default();
        let catalog = Catalog::build(parse(GOOD).unwrap(), Vec::new(), &env).unwrap();
        let res = catalog.sql_resource("maindb").unwrap();
        assert!(!res.available());
        assert_eq!(res.dsn_env, "MAINDB_DSN");
        // The operation targeting it is still present.
        assert!(catalog.resolve_operation("count_users").is_some());
    }

    #[test]
    fn test_visibility_is_role_intersection() {
        let admin = principal("alice");
        let viewer = principal("bob");

        let env = Environment::default();
        let catalog = Catalog::build(parse(GOOD).unwrap(), Vec::new(), &env).unwrap();

        let admin_ops: Vec<_> = catalog
            .operations_visible_to(&admin)
            .iter()
            .map(|op| op.id().to_string())
            .collect();
        assert_eq!(admin_ops, ["backend_health", "count_users"]);

        let viewer_ops: Vec<_> = catalog
            .operations_visible_to(&viewer)
            .iter()
            .map(|op| op.id().to_string())
            .collect();
        assert_eq!(viewer_ops, ["count_users"]);

        assert_eq!(catalog.tasks_visible_to(&admin).len(), 1);
        assert!(catalog.tasks_visible_to(&viewer).is_empty());
    }

    #[test]
    fn test_validation_collects_every_violation() {
        let bad = r#"
users:
  - id: alice
    ssh_users: []
    roles: []
  - id: alice
    ssh_users: [alice]
    roles: [admin]
operations:
  - type: http
    id: op1
    target: missing
    method: GET
    path: /
    allowed_roles: [ghost]
  - type: http
    id: op1
    target: missing
    method: GET
    path: /
tasks:
  - id: t1
    allowed_roles: [admin]
    steps: []
  - id: t2
    allowed_roles: [admin]
    steps:
      - id: s1
        type: postgres
        resource: nodb
        query: SELECT 1
      - id: s1
        type: sleep
        seconds: 0
"#;
        let env = Environment::default();
        let err = Catalog::build(parse(bad).unwrap(), Vec::new(), &env).unwrap_err();
        let ConfigError::Invalid(violations) = err else {
            panic!("expected invariant violations");
        };

        let paths: Vec<_> = violations
            .violations
            .iter()
            .map(|v| v.path.as_str())
            .collect();
        // Every class of violation is present at once.
        assert!(paths.contains(&"users[0].ssh_users"));
        assert!(paths.contains(&"users[0].roles"));
        assert!(paths.contains(&"users[1].id"));
        assert!(paths.contains(&"operations[0].target"));
        assert!(paths.contains(&"operations[0].allowed_roles"));
        assert!(paths.contains(&"operations[1].id"));
        assert!(paths.contains(&"tasks[0].steps"));
        assert!(paths.contains(&"tasks[1].steps[0].resource"));
        assert!(paths.contains(&"tasks[1].steps[1].id"));
    }

    #[test]
    fn test_projected_operations_validated_and_appended() {
        let env = Environment::default();
        let projected = vec![Operation::Http(HttpOp {
            id: "get_backend_status".into(),
            label: "GET /status".into(),
            target: "backend".into(),
            method: "GET".into(),
            path: "/status".into(),
            allowed_roles: [Role::from("admin")].into(),
        })];
        let catalog = Catalog::build(parse(GOOD).unwrap(), projected, &env).unwrap();
        let ids: Vec<_> = catalog.operations().iter().map(|o| o.id()).collect();
        assert_eq!(ids, ["backend_health", "count_users", "get_backend_status"]);

        // A projected operation with an unknown target is a violation too.
        let projected = vec![Operation::Http(HttpOp {
            id: "get_ghost".into(),
            label: String::new(),
            target: "ghost".into(),
            method: "GET".into(),
            path: "/".into(),
            allowed_roles: [Role::from("admin")].into(),
        })];
        let err = Catalog::build(parse(GOOD).unwrap(), projected, &env).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
