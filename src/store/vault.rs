//! HashiCorp Vault over its HTTP API.
//!
//! Reads map to `GET /v1/<path>`, writes to `PUT /v1/<path>` with a JSON
//! body, deletes to `DELETE /v1/<path>`. A 404 on read means "nothing
//! stored". The `data` object of a read response is returned as the
//! payload, so KV v2 secrets come back still wrapped in their inner `data`
//! key.

use super::{Store, StoreResult};
use crate::config::VaultConfig;
use crate::error::{MigrationError, Result, StoreError};
use crate::value::{Payload, Value};
use async_trait::async_trait;
use reqwest::{Method as HttpMethod, RequestBuilder, Response, StatusCode};
use std::future::Future;
use tokio_util::sync::CancellationToken;

const TOKEN_HEADER: &str = "X-Vault-Token";
const NAMESPACE_HEADER: &str = "X-Vault-Namespace";

#[derive(Debug, Clone)]
pub struct VaultStore {
    client: reqwest::Client,
    address: String,
    token: String,
    namespace: Option<String>,
}

impl VaultStore {
    /// Build a client from validated configuration.
    pub fn from_config(config: &VaultConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| MigrationError::config(format!("failed to create Vault client: {}", e)))?;

        Ok(Self {
            client,
            address: config.address.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            namespace: Some(config.namespace.clone()).filter(|ns| !ns.is_empty()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.address, path.trim_start_matches('/'))
    }

    fn request(&self, method: HttpMethod, path: &str) -> RequestBuilder {
        let mut req = self
            .client
            .request(method, self.url(path))
            .header(TOKEN_HEADER, &self.token);
        if let Some(ns) = &self.namespace {
            req = req.header(NAMESPACE_HEADER, ns);
        }
        req
    }

    async fn send(&self, req: RequestBuilder, cancel: &CancellationToken) -> StoreResult<Response> {
        cancellable(cancel, async {
            req.send()
                .await
                .map_err(|e| StoreError::Transport(e.to_string()))
        })
        .await
    }
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = StoreResult<T>>,
) -> StoreResult<T> {
    tokio::select! {
        _ = cancel.cancelled() => Err(StoreError::Transport("request cancelled".to_string())),
        result = fut => result,
    }
}

/// Turn a non-success response into a status error carrying Vault's messages.
async fn status_error(response: Response) -> StoreError {
    let status = response.status().as_u16();
    let message = match response.json::<serde_json::Value>().await {
        Ok(body) => body
            .get("errors")
            .and_then(|errors| errors.as_array())
            .map(|errors| {
                errors
                    .iter()
                    .filter_map(|e| e.as_str())
                    .collect::<Vec<_>>()
                    .join("; ")
            })
            .unwrap_or_default(),
        Err(_) => String::new(),
    };
    StoreError::Status { status, message }
}

fn payload_from_body(body: serde_json::Value) -> StoreResult<Option<Payload>> {
    match body.get("data").cloned().map(Value::from) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Mapping(map)) => Ok(Some(map)),
        Some(other) => Err(StoreError::Decode(format!(
            "expected an object under 'data', got {}",
            other
        ))),
    }
}

#[async_trait]
impl Store for VaultStore {
    async fn read(&self, path: &str, cancel: &CancellationToken) -> StoreResult<Option<Payload>> {
        let response = self.send(self.request(HttpMethod::GET, path), cancel).await?;
        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::NO_CONTENT => Ok(None),
            status if status.is_success() => {
                let body = cancellable(cancel, async {
                    response
                        .json::<serde_json::Value>()
                        .await
                        .map_err(|e| StoreError::Decode(e.to_string()))
                })
                .await?;
                payload_from_body(body)
            }
            _ => Err(status_error(response).await),
        }
    }

    async fn write(
        &self,
        path: &str,
        payload: &Payload,
        cancel: &CancellationToken,
    ) -> StoreResult<()> {
        let body = Value::Mapping(payload.clone()).to_json();
        let response = self
            .send(self.request(HttpMethod::PUT, path).json(&body), cancel)
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(status_error(response).await)
        }
    }

    async fn delete(&self, path: &str, cancel: &CancellationToken) -> StoreResult<()> {
        let response = self.send(self.request(HttpMethod::DELETE, path), cancel).await?;
        // Deleting something that is already gone is not a failure
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(status_error(response).await)
        }
    }
}
