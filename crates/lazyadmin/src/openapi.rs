//! OpenAPI catalog autogenerator.
//!
//! Projects a remote API description into HTTP operations: one per
//! path/method combination that has no required request body and passes the
//! backend's tag filter. Projection failures are reported but never abort
//! catalog load.

use std::collections::BTreeMap;

use serde::Deserialize;
use thiserror::Error;

use crate::catalog::{HttpOp, OpenApiBackend, Operation, Role};

/// Roles granted to projected operations unless the catalog overrides them.
const DEFAULT_PROJECTED_ROLES: [&str; 2] = ["owner", "admin"];

#[derive(Debug, Error)]
pub enum ProjectorError {
    #[error("fetch {url}: {message}")]
    Fetch { url: String, message: String },
    #[error("fetch {url}: HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("parse document from {url}: {message}")]
    Parse { url: String, message: String },
}

/// Minimal view of an OpenAPI document: paths, methods, tags, summaries and
/// request-body requirements. Everything else is ignored.
#[derive(Debug, Default, Deserialize)]
pub struct ApiDocument {
    #[serde(default)]
    pub paths: BTreeMap<String, PathItem>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PathItem {
    #[serde(default)]
    pub get: Option<ApiOperation>,
    #[serde(default)]
    pub put: Option<ApiOperation>,
    #[serde(default)]
    pub post: Option<ApiOperation>,
    #[serde(default)]
    pub delete: Option<ApiOperation>,
    #[serde(default)]
    pub patch: Option<ApiOperation>,
    #[serde(default)]
    pub head: Option<ApiOperation>,
    #[serde(default)]
    pub options: Option<ApiOperation>,
}

impl PathItem {
    /// Declared operations in a fixed method order.
    fn operations(&self) -> impl Iterator<Item = (&'static str, &ApiOperation)> {
        [
            ("get", &self.get),
            ("put", &self.put),
            ("post", &self.post),
            ("delete", &self.delete),
            ("patch", &self.patch),
            ("head", &self.head),
            ("options", &self.options),
        ]
        .into_iter()
        .filter_map(|(method, op)| op.as_ref().map(|op| (method, op)))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ApiOperation {
    #[serde(default, rename = "operationId")]
    pub operation_id: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, rename = "requestBody")]
    pub request_body: Option<RequestBody>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RequestBody {
    #[serde(default)]
    pub required: bool,
}

/// Fetches API descriptions and projects them into catalog operations.
pub struct Projector {
    client: reqwest::Client,
}

impl Default for Projector {
    fn default() -> Self {
        Self::new()
    }
}

impl Projector {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// Project every configured backend. Per-backend failures are logged and
    /// that backend's operations are simply absent.
    pub async fn project(&self, backends: &BTreeMap<String, OpenApiBackend>) -> Vec<Operation> {
        let mut operations = Vec::new();
        for (name, backend) in backends {
            match self.fetch_document(&backend.doc_url).await {
                Ok(doc) => {
                    let ops = project_document(name, backend, &doc);
                    tracing::info!(backend = %name, count = ops.len(), "projected operations");
                    operations.extend(ops);
                }
                Err(err) => {
                    tracing::warn!(backend = %name, error = %err, "openapi projection failed");
                }
            }
        }
        operations
    }

    async fn fetch_document(&self, url: &str) -> Result<ApiDocument, ProjectorError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ProjectorError::Fetch {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProjectorError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.text().await.map_err(|e| ProjectorError::Fetch {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        parse_document(&body).map_err(|message| ProjectorError::Parse {
            url: url.to_string(),
            message,
        })
    }
}

/// Parse a document served as JSON, falling back to YAML.
pub fn parse_document(text: &str) -> Result<ApiDocument, String> {
    match serde_json::from_str(text) {
        Ok(doc) => Ok(doc),
        Err(json_err) => {
            serde_yaml::from_str(text).map_err(|yaml_err| format!("{json_err}; {yaml_err}"))
        }
    }
}

/// Project one parsed document for one backend. Pure; path/method iteration
/// is sorted so projected order is deterministic.
pub fn project_document(
    backend_name: &str,
    backend: &OpenApiBackend,
    doc: &ApiDocument,
) -> Vec<Operation> {
    let mut operations = Vec::new();

    for (path, item) in &doc.paths {
        for (method, op) in item.operations() {
            if !eligible(op, backend) {
                continue;
            }
            if op
                .request_body
                .as_ref()
                .map(|b| b.required)
                .unwrap_or(false)
            {
                continue;
            }

            let mut id = op.operation_id.clone().unwrap_or_else(|| {
                format!("{method}_{backend_name}_{}", sanitize_path(path))
            });
            if !backend.op_id_prefix.is_empty() {
                id = format!("{}{id}", backend.op_id_prefix);
            }

            let label = op
                .summary
                .clone()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| format!("{} {path}", method.to_ascii_uppercase()));

            operations.push(Operation::Http(HttpOp {
                id,
                label,
                target: backend_name.to_string(),
                method: method.to_ascii_uppercase(),
                path: path.clone(),
                allowed_roles: DEFAULT_PROJECTED_ROLES.iter().map(|r| Role::from(*r)).collect(),
            }));
        }
    }

    operations
}

fn eligible(op: &ApiOperation, backend: &OpenApiBackend) -> bool {
    if backend.tag_filter.is_empty() {
        return backend.include_untagged || !op.tags.is_empty();
    }
    op.tags.iter().any(|t| backend.tag_filter.contains(t))
}

/// Trim slashes, `/` to `_`, drop braces; an empty path becomes `root`.
fn sanitize_path(path: &str) -> String {
    let sanitized: String = path
        .trim_matches('/')
        .replace('/', "_")
        .chars()
        .filter(|c| *c != '{' && *c != '}')
        .collect();
    if sanitized.is_empty() {
        "root".to_string()
    } else {
        sanitized
    }
}
