//! HTTP resource client.

use reqwest::Method;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Thin request wrapper around one declared HTTP resource. The result string
/// encodes status code and reason phrase; the body is not surfaced.
#[derive(Clone)]
pub struct HttpClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub async fn request(
        &self,
        cancel: &CancellationToken,
        method: &str,
        path: &str,
    ) -> Result<String> {
        let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|_| Error::Transport(format!("invalid http method {method:?}")))?;
        let url = format!("{}{}", self.base_url, path);

        let send = self.client.request(method, &url).send();
        let response = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(Error::Cancelled(format!("http request to {url} cancelled")));
            }
            res = send => res.map_err(|e| Error::Transport(e.to_string()))?,
        };

        let status = response.status();
        Ok(match status.canonical_reason() {
            Some(reason) => format!("HTTP {} {}", status.as_u16(), reason),
            None => format!("HTTP {}", status.as_u16()),
        })
    }
}
