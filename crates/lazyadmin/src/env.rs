//! Ambient environment captured as an explicit dependency.
//!
//! The catalog loader and the identity resolver never read process state
//! directly; they consume an [`Environment`] snapshot taken once in the
//! composition root. Tests construct one from literal pairs.

use std::collections::HashMap;
use std::path::PathBuf;

/// Name of the configuration path override variable.
pub const CONFIG_PATH_VAR: &str = "LAZYADMIN_CONFIG_PATH";

/// Default configuration file path relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/lazyadmin.yaml";

/// Immutable snapshot of the process environment.
#[derive(Clone, Debug, Default)]
pub struct Environment {
    vars: HashMap<String, String>,
}

impl Environment {
    /// Capture the current process environment.
    pub fn from_process() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    /// Build an environment from literal pairs.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: vars
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Look up a variable; empty values count as unset.
    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// Resolve the configuration file path (`LAZYADMIN_CONFIG_PATH` override,
    /// else the default relative path).
    pub fn config_path(&self) -> PathBuf {
        self.var(CONFIG_PATH_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }
}
