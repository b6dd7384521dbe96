//! Request/response wrappers for the declared resources.
//!
//! One client per declared resource, built once at startup and shared.
//! SQL resources whose DSN is missing (or whose connection fails) simply have
//! no client; executing against them yields a structured
//! "resource unavailable" error.

mod http;
mod sql;

use std::collections::HashMap;

use crate::catalog::Catalog;

pub use http::HttpClient;
pub use sql::SqlClient;

/// Shared, read-only set of resource clients.
#[derive(Clone, Default)]
pub struct Clients {
    http: HashMap<String, HttpClient>,
    sql: HashMap<String, SqlClient>,
}

impl Clients {
    /// Build clients for every declared resource. HTTP clients always
    /// construct; SQL clients are skipped (with a warning) when the resource
    /// is unavailable or the connection cannot be established.
    pub async fn connect(catalog: &Catalog) -> Self {
        let http = catalog
            .http_resources()
            .iter()
            .map(|(name, res)| (name.clone(), HttpClient::new(&res.base_url)))
            .collect();

        let mut sql = HashMap::new();
        for (name, res) in catalog.sql_resources() {
            let Some(dsn) = res.dsn.as_deref() else {
                continue;
            };
            match SqlClient::connect(dsn).await {
                Ok(client) => {
                    sql.insert(name.clone(), client);
                }
                Err(err) => {
                    tracing::warn!(resource = %name, error = %err, "cannot connect sql resource");
                }
            }
        }

        Self { http, sql }
    }

    pub fn http(&self, name: &str) -> Option<&HttpClient> {
        self.http.get(name)
    }

    pub fn sql(&self, name: &str) -> Option<&SqlClient> {
        self.sql.get(name)
    }
}
