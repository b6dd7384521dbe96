//! Identity resolution from the ambient OS session.

use std::collections::BTreeSet;

use thiserror::Error;

use crate::catalog::{Catalog, Role, User};
use crate::env::Environment;
use crate::users::UserStore;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("no matching user for ssh user {0:?}")]
    NoMatch(String),
}

/// The runtime identity for a session. Created once at session start.
#[derive(Clone, Debug)]
pub struct Principal {
    pub user: User,
    pub ssh_user: String,
}

impl Principal {
    pub fn new(user: User, ssh_user: impl Into<String>) -> Self {
        Self {
            user,
            ssh_user: ssh_user.into(),
        }
    }

    pub fn has_role(&self, role: &Role) -> bool {
        self.user.roles.contains(role)
    }

    pub fn has_any_role(&self, roles: &BTreeSet<Role>) -> bool {
        roles.iter().any(|r| self.user.roles.contains(r))
    }

    pub fn is_admin(&self) -> bool {
        self.has_role(&Role::from("admin")) || self.has_role(&Role::from("owner"))
    }
}

/// The ambient session identity: `SSH_USER`, then `USER`, then the OS login
/// name, then the literal `"unknown"`.
pub fn current_ssh_user(env: &Environment) -> String {
    for var in ["SSH_USER", "USER", "LOGNAME"] {
        if let Some(v) = env.var(var) {
            return v.to_string();
        }
    }
    "unknown".to_string()
}

/// Resolve the session principal. Catalog users are checked first in
/// declaration order, then the user store if one is attached.
pub fn resolve_principal(
    catalog: &Catalog,
    store: Option<&UserStore>,
    env: &Environment,
) -> Result<Principal, IdentityError> {
    let ssh_user = current_ssh_user(env);

    if let Some(user) = catalog.find_user_by_ssh(&ssh_user) {
        return Ok(Principal::new(user.clone(), ssh_user));
    }

    if let Some(store) = store {
        match store.find_by_ssh_user(&ssh_user) {
            Ok(Some(stored)) => match store.resolve_catalog_user(&stored) {
                Ok(user) => return Ok(Principal::new(user, ssh_user)),
                Err(err) => {
                    tracing::warn!(error = %err, user_id = %stored.id, "loading store user failed");
                }
            },
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(error = %err, ssh_user = %ssh_user, "user store lookup failed");
            }
        }
    }

    Err(IdentityError::NoMatch(ssh_user))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog;

    const CONFIG: &str = r#"
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
      base_url: http://127.0.0.1:9
operations:
  - type: http
    id: backend_health
    label: Backend health
    target: backend
    method: GET
    path: /health
    allowed_roles: [admin]
"#;

    fn load() -> Catalog {
        let env = Environment::default();
        Catalog::build(catalog::parse(CONFIG).unwrap(), Vec::new(), &env).unwrap()
    }

    #[test]
    fn test_lookup_order() {
        let env = Environment::from_vars([("SSH_USER", "alice"), ("USER", "bob")]);
        assert_eq!(current_ssh_user(&env), "alice");

        let env = Environment::from_vars([("USER", "bob"), ("LOGNAME", "carol")]);
        assert_eq!(current_ssh_user(&env), "bob");

        let env = Environment::from_vars([("LOGNAME", "carol")]);
        assert_eq!(current_ssh_user(&env), "carol");

        let env = Environment::default();
        assert_eq!(current_ssh_user(&env), "unknown");
    }

    #[test]
    fn test_resolves_first_matching_catalog_user() {
        let catalog = load();
        let env = Environment::from_vars([("SSH_USER", "alice-dev")]);
        let principal = resolve_principal(&catalog, None, &env).unwrap();
        assert_eq!(principal.user.id, "alice");
        assert_eq!(principal.ssh_user, "alice-dev");
        assert!(principal.has_role(&Role::from("admin")));

        let visible = catalog.operations_visible_to(&principal);
        assert_eq!(visible.len(), 1);
    }

    #[test]
    fn test_no_match_is_an_error() {
        let catalog = load();
        let env = Environment::from_vars([("SSH_USER", "mallory")]);
        let err = resolve_principal(&catalog, None, &env).unwrap_err();
        assert!(matches!(err, IdentityError::NoMatch(u) if u == "mallory"));
    }

    #[test]
    fn test_store_users_resolve_after_catalog() {
        let catalog = load();
        let store = UserStore::in_memory().unwrap();
        store
            .create_user("dave", &["dave-ssh".into()], &["viewer".into()])
            .unwrap();

        let env = Environment::from_vars([("SSH_USER", "dave-ssh")]);
        let principal = resolve_principal(&catalog, Some(&store), &env).unwrap();
        assert_eq!(principal.user.id, "dave");
        assert!(principal.has_role(&Role::from("viewer")));

        // Catalog users win over store users.
        let env = Environment::from_vars([("SSH_USER", "alice")]);
        let principal = resolve_principal(&catalog, Some(&store), &env).unwrap();
        assert_eq!(principal.user.id, "alice");
    }
}
