//! Single-operation executor.
//!
//! Side effects are exactly one remote call and one audit append. Audit
//! append failures are logged but never mask the operation's own outcome.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::audit::{AuditEntry, AuditLog};
use crate::catalog::{Catalog, Operation};
use crate::clients::Clients;
use crate::error::{Error, Result};
use crate::identity::Principal;

pub struct Executor {
    catalog: Arc<Catalog>,
    audit: Arc<AuditLog>,
    clients: Arc<Clients>,
}

impl Executor {
    pub fn new(catalog: Arc<Catalog>, audit: Arc<AuditLog>, clients: Arc<Clients>) -> Self {
        Self {
            catalog,
            audit,
            clients,
        }
    }

    /// Run one operation for `principal` and append one audit record.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        principal: &Principal,
        operation_id: &str,
    ) -> Result<String> {
        let operation = self
            .catalog
            .resolve_operation(operation_id)
            .ok_or_else(|| Error::NotFound(format!("operation {operation_id:?}")))?;

        // The front-end already filters; check again before touching anything.
        if !principal.has_any_role(operation.allowed_roles()) {
            return Err(Error::Unauthorized(format!(
                "user {:?} may not run operation {:?}",
                principal.user.id, operation_id
            )));
        }

        let result = self.dispatch(cancel, operation).await;

        let entry = AuditEntry::now(
            &principal.user.id,
            &principal.ssh_user,
            operation.id(),
            result.is_ok(),
            result.as_ref().err().map(ToString::to_string),
        );
        if let Err(err) = self.audit.append(&entry) {
            tracing::warn!(operation = %operation.id(), error = %err, "audit append failed");
        }

        result
    }

    async fn dispatch(&self, cancel: &CancellationToken, operation: &Operation) -> Result<String> {
        match operation {
            Operation::Http(op) => {
                let client = self
                    .clients
                    .http(&op.target)
                    .ok_or_else(|| Error::ResourceUnavailable(op.target.clone()))?;
                client.request(cancel, &op.method, &op.path).await
            }
            Operation::Sql(op) => {
                let client = self
                    .clients
                    .sql(&op.target)
                    .ok_or_else(|| Error::ResourceUnavailable(op.target.clone()))?;
                client.run_scalar(cancel, &op.query).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog;
    use crate::env::Environment;

    const CONFIG: &str = r#"
users:
  - id: alice
    ssh_users: [alice]
    roles: [admin]
  - id: bob
    ssh_users: [bob]
    roles: [viewer]
resources:
  postgres:
    maindb:
      dsn_env: MAINDB_DSN
operations:
  - type: postgres
    id: count_users
    label: Count users
    target: maindb
    query: SELECT count(*) FROM users
    allowed_roles: [admin]
"#;

    fn setup() -> (Executor, Principal, Principal, Arc<AuditLog>) {
        let env = Environment::default();
        let catalog =
            Arc::new(Catalog::build(catalog::parse(CONFIG).unwrap(), Vec::new(), &env).unwrap());
        let audit = Arc::new(AuditLog::in_memory().unwrap());
        let clients = Arc::new(Clients::default());
        let alice = Principal::new(catalog.users()[0].clone(), "alice");
        let bob = Principal::new(catalog.users()[1].clone(), "bob");
        (
            Executor::new(catalog, audit.clone(), clients),
            alice,
            bob,
            audit,
        )
    }

    #[tokio::test]
    async fn test_unknown_operation_is_not_found_and_unaudited() {
        let (executor, alice, _, audit) = setup();
        let cancel = CancellationToken::new();
        let err = executor
            .execute(&cancel, &alice, "missing")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(audit.recent(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unauthorized_principal_rejected() {
        let (executor, _, bob, _) = setup();
        let cancel = CancellationToken::new();
        let err = executor
            .execute(&cancel, &bob, "count_users")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_unavailable_resource_fails_and_audits() {
        let (executor, alice, _, audit) = setup();
        let cancel = CancellationToken::new();
        let err = executor
            .execute(&cancel, &alice, "count_users")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ResourceUnavailable(ref name) if name == "maindb"));

        let records = audit.recent(10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].operation_id, "count_users");
        assert!(!records[0].success);
        assert!(records[0]
            .error
            .as_deref()
            .unwrap()
            .contains("resource unavailable"));
    }
}
