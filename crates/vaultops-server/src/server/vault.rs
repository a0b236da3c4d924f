//! REST client for vaults.
//!
//! Each capability maps to one request against the target's `endpoint`:
//!
//! | capability           | request                                          |
//! |----------------------|--------------------------------------------------|
//! | `provision_resource` | `POST   {endpoint}/resources`                    |
//! | `grant_access`       | `POST   {endpoint}/resources/{name}/members`     |
//! | `sync_subject`       | `PUT    {endpoint}/subjects/{subject}`           |
//! | `delete_resource`    | `DELETE {endpoint}/resources/{name}`             |
//!
//! The per-attempt session token is sent as a bearer token and the session
//! identifier in `X-Vault-Session`. A configured service token goes in
//! `X-Vault-Api-Token`.
//!
//! Responses are classified with [`classify_status`]; transport errors are
//! always transient.

use async_trait::async_trait;
use core::time::Duration;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Serialize;
use vaultops_core::{
    Credential, DeleteResource, ExecutionError, GrantAccess, ProvisionResource, SyncSubject,
    TargetConnection, VaultApi,
};

const SESSION_HEADER: &str = "X-Vault-Session";
const API_TOKEN_HEADER: &str = "X-Vault-Api-Token";
const MAX_ERROR_BODY: usize = 512;

/// How a vault response is treated by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    Permanent,
    Transient,
}

/// 2xx is success. Timeouts, throttling, lock conflicts and server errors are
/// worth retrying; any other client error is not.
pub fn classify_status(status: StatusCode) -> StatusClass {
    if status.is_success() {
        return StatusClass::Success;
    }
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::LOCKED | StatusCode::TOO_MANY_REQUESTS => {
            StatusClass::Transient
        }
        s if s.is_server_error() => StatusClass::Transient,
        _ => StatusClass::Permanent,
    }
}

/// A [`VaultApi`] speaking JSON over HTTP.
#[derive(Debug, Clone)]
pub struct HttpVaultApi {
    client: Client,
    api_token: Option<String>,
}

impl HttpVaultApi {
    /// # Errors
    ///
    /// Fails when the TLS backend cannot be initialised.
    pub fn new(api_token: Option<String>, request_timeout: Duration) -> reqwest::Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("vaultops/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client, api_token })
    }

    fn request(
        &self,
        method: Method,
        target: &TargetConnection,
        path: &str,
        credential: &Credential,
    ) -> RequestBuilder {
        let url = format!("{}/{}", target.endpoint.trim_end_matches('/'), path);
        let builder = self
            .client
            .request(method, url)
            .bearer_auth(credential.token().as_str())
            .header(SESSION_HEADER, credential.session_id.to_string());
        match &self.api_token {
            Some(token) => builder.header(API_TOKEN_HEADER, token),
            None => builder,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<(), ExecutionError> {
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        match classify_status(status) {
            StatusClass::Success => Ok(()),
            class => {
                let mut body = response.text().await.unwrap_or_default();
                if body.len() > MAX_ERROR_BODY {
                    let mut cut = MAX_ERROR_BODY;
                    while !body.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    body.truncate(cut);
                }
                let message = if body.trim().is_empty() {
                    format!("vault responded {status}")
                } else {
                    format!("vault responded {status}: {}", body.trim())
                };
                Err(match class {
                    StatusClass::Transient => ExecutionError::Transient(message),
                    _ => ExecutionError::Permanent(message),
                })
            }
        }
    }

    async fn send_json<B: Serialize + Sync>(
        &self,
        method: Method,
        target: &TargetConnection,
        path: &str,
        body: &B,
        credential: &Credential,
    ) -> Result<(), ExecutionError> {
        self.send(self.request(method, target, path, credential).json(body))
            .await
    }
}

fn transport_error(err: reqwest::Error) -> ExecutionError {
    if err.is_builder() {
        ExecutionError::permanent(format!("invalid request: {err}"))
    } else if err.is_timeout() {
        ExecutionError::transient(format!("request timed out: {err}"))
    } else {
        ExecutionError::transient(format!("transport error: {err}"))
    }
}

/// Percent-encodes a single path segment.
fn segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[async_trait]
impl VaultApi for HttpVaultApi {
    async fn provision_resource(
        &self,
        target: &TargetConnection,
        request: &ProvisionResource,
        credential: &Credential,
    ) -> Result<(), ExecutionError> {
        self.send_json(Method::POST, target, "resources", request, credential)
            .await
    }

    async fn grant_access(
        &self,
        target: &TargetConnection,
        request: &GrantAccess,
        credential: &Credential,
    ) -> Result<(), ExecutionError> {
        let path = format!("resources/{}/members", segment(&request.resource_name));
        self.send_json(Method::POST, target, &path, request, credential)
            .await
    }

    async fn sync_subject(
        &self,
        target: &TargetConnection,
        request: &SyncSubject,
        credential: &Credential,
    ) -> Result<(), ExecutionError> {
        let path = format!("subjects/{}", segment(&request.subject));
        self.send_json(Method::PUT, target, &path, &request.attributes, credential)
            .await
    }

    async fn delete_resource(
        &self,
        target: &TargetConnection,
        request: &DeleteResource,
        credential: &Credential,
    ) -> Result<(), ExecutionError> {
        let path = format!("resources/{}", segment(&request.resource_name));
        self.send(self.request(Method::DELETE, target, &path, credential))
            .await
    }
}
