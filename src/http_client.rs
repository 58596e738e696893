use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, SessionError};
use crate::session::refresh::{exchange_refresh_token, RefreshCoordinator, REFRESH_PATH};
use crate::session::types::{error_message, ApiEnvelope, AuthData, TokenGrant};
use crate::session::CredentialStore;

/// Request body; kept as data so a request can be rebuilt for its retry
#[derive(Debug, Clone)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Multipart(Vec<UploadPart>),
}

/// One field of a multipart upload
#[derive(Debug, Clone)]
pub struct UploadPart {
    pub name: String,
    pub content: PartContent,
}

#[derive(Debug, Clone)]
pub enum PartContent {
    Text(String),
    File {
        file_name: String,
        bytes: Bytes,
        mime: Option<String>,
    },
}

impl UploadPart {
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: PartContent::Text(value.into()),
        }
    }

    pub fn file(
        name: impl Into<String>,
        file_name: impl Into<String>,
        bytes: impl Into<Bytes>,
        mime: Option<&str>,
    ) -> Self {
        Self {
            name: name.into(),
            content: PartContent::File {
                file_name: file_name.into(),
                bytes: bytes.into(),
                mime: mime.map(str::to_string),
            },
        }
    }

    /// Read a file from disk into a part named `name`
    pub async fn from_path(name: impl Into<String>, path: &Path, mime: Option<&str>) -> Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload".to_string());
        Ok(Self::file(name, file_name, bytes, mime))
    }

    fn to_part(&self) -> Result<Part> {
        match &self.content {
            PartContent::Text(value) => Ok(Part::text(value.clone())),
            PartContent::File {
                file_name,
                bytes,
                mime,
            } => {
                let part = Part::bytes(bytes.to_vec()).file_name(file_name.clone());
                match mime {
                    Some(mime) => part.mime_str(mime).map_err(|e| {
                        SessionError::InvalidRequest(format!("invalid MIME type '{}': {}", mime, e))
                    }),
                    None => Ok(part),
                }
            }
        }
    }
}

/// Outbound API call
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the base URL, or an absolute URL
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: RequestBody,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self> {
        let value = serde_json::to_value(body)
            .map_err(|e| SessionError::InvalidRequest(format!("unserializable body: {}", e)))?;
        self.body = RequestBody::Json(value);
        Ok(self)
    }

    pub fn multipart(mut self, parts: Vec<UploadPart>) -> Self {
        self.body = RequestBody::Multipart(parts);
        self
    }
}

/// Resolve `path` against `base`; absolute http(s) URLs pass through and
/// absolute URLs with any other scheme are rejected
///
/// `base` keeps its own path prefix: `http://host/api` + `/medications`
/// resolves to `http://host/api/medications`.
pub fn resolve_url(base: &Url, path: &str) -> Result<Url> {
    if let Ok(url) = Url::parse(path) {
        if matches!(url.scheme(), "http" | "https") {
            return Ok(url);
        }
        return Err(SessionError::InvalidUrl {
            url: path.to_string(),
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }

    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }

    base.join(path.trim_start_matches('/'))
        .map_err(|e| SessionError::InvalidUrl {
            url: path.to_string(),
            reason: e.to_string(),
        })
}

/// HTTP client that attaches the session's bearer token
///
/// A 401 triggers one refresh (shared with every other request that hit a
/// 401 at the same time) and exactly one retry. Network failures and
/// non-401 statuses go back to the caller untouched.
pub struct ApiClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    base_url: Url,

    refresh_url: Url,

    store: Arc<CredentialStore>,

    coordinator: RefreshCoordinator,
}

impl ApiClient {
    pub fn new(
        store: Arc<CredentialStore>,
        coordinator: RefreshCoordinator,
        base_url: &str,
        connect_timeout: u64,
        request_timeout: u64,
    ) -> Result<Self> {
        let base_url = Url::parse(base_url).map_err(|e| SessionError::InvalidUrl {
            url: base_url.to_string(),
            reason: e.to_string(),
        })?;
        let refresh_url = resolve_url(&base_url, REFRESH_PATH)?;

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .build()?;

        Ok(Self {
            client,
            base_url,
            refresh_url,
            store,
            coordinator,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Send `request` with the current access token, recovering once from 401
    pub async fn dispatch(&self, request: &ApiRequest) -> Result<Response> {
        let url = resolve_url(&self.base_url, &request.path)?;
        let token = self.store.access_token();

        tracing::debug!(
            method = %request.method,
            url = %url,
            authenticated = token.is_some(),
            "Sending HTTP request"
        );

        let response = self.send(request, &url, token.as_deref()).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            tracing::debug!(status = %response.status(), "Received HTTP response");
            return Ok(response);
        }

        tracing::warn!(url = %url, "Received 401, refreshing token and retrying...");

        let client = &self.client;
        let refresh_url = &self.refresh_url;
        let new_token = self
            .coordinator
            .refresh(token.as_deref(), move |refresh_token| async move {
                exchange_refresh_token(client, refresh_url, &refresh_token).await
            })
            .await
            .map_err(SessionError::SessionExpired)?;

        // Single retry; a second 401 goes back to the caller as-is
        let retried = self.send(request, &url, Some(&new_token)).await?;
        if retried.status() == StatusCode::UNAUTHORIZED {
            tracing::warn!(url = %url, "Still 401 after refresh, not retrying again");
        }
        Ok(retried)
    }

    pub async fn get(&self, path: &str) -> Result<Response> {
        self.dispatch(&ApiRequest::get(path)).await
    }

    pub async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<Response> {
        self.dispatch(&ApiRequest::post(path).json(body)?).await
    }

    pub async fn patch<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<Response> {
        self.dispatch(&ApiRequest::patch(path).json(body)?).await
    }

    pub async fn delete(&self, path: &str) -> Result<Response> {
        self.dispatch(&ApiRequest::delete(path)).await
    }

    /// Multipart POST; the transport sets the boundary content type
    pub async fn upload(&self, path: &str, parts: Vec<UploadPart>) -> Result<Response> {
        self.dispatch(&ApiRequest::post(path).multipart(parts)).await
    }

    /// POST credentials to an auth endpoint (login, signup)
    ///
    /// Sent without a bearer token and outside the refresh path: a 401 here
    /// means bad credentials, not an expired session.
    pub async fn authenticate<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<TokenGrant> {
        let url = resolve_url(&self.base_url, path)?;
        let request = ApiRequest::post(path).json(body)?;

        let response = self.send(&request, &url, None).await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            tracing::warn!(status = status.as_u16(), url = %url, "Authentication rejected");
            return Err(SessionError::AuthFailed(error_message(&text)));
        }

        let envelope: ApiEnvelope<AuthData> = serde_json::from_str(&text)
            .map_err(|e| SessionError::InvalidResponse(e.to_string()))?;
        if !envelope.is_success() {
            return Err(SessionError::AuthFailed(
                envelope.message.unwrap_or(envelope.status),
            ));
        }

        envelope
            .data
            .ok_or_else(|| SessionError::InvalidResponse("response has no data".to_string()))?
            .into_grant()
            .map_err(SessionError::InvalidResponse)
    }

    async fn send(&self, request: &ApiRequest, url: &Url, token: Option<&str>) -> Result<Response> {
        let mut builder = self.client.request(request.method.clone(), url.clone());

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }

        builder = match &request.body {
            RequestBody::Empty => builder.header("Content-Type", "application/json"),
            RequestBody::Json(value) => builder.json(value),
            // No explicit content type: reqwest supplies it with the boundary
            RequestBody::Multipart(parts) => {
                let mut form = Form::new();
                for part in parts {
                    form = form.part(part.name.clone(), part.to_part()?);
                }
                builder.multipart(form)
            }
        };

        match builder.send().await {
            Ok(response) => Ok(response),
            Err(e) => {
                let error_kind = if e.is_timeout() {
                    "timeout"
                } else if e.is_connect() {
                    "connection_failed"
                } else if e.is_request() {
                    "request_error"
                } else {
                    "unknown"
                };
                tracing::warn!(
                    error_kind = error_kind,
                    error = %e,
                    url = %url,
                    "HTTP request error"
                );
                Err(SessionError::Network(e))
            }
        }
    }
}

/// Decode the `data` of a standard envelope, mapping failures to errors
pub async fn into_data<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    let text = response.text().await?;

    if !status.is_success() {
        return Err(SessionError::Api {
            status: status.as_u16(),
            message: error_message(&text),
        });
    }

    let envelope: ApiEnvelope<T> =
        serde_json::from_str(&text).map_err(|e| SessionError::InvalidResponse(e.to_string()))?;
    if !envelope.is_success() {
        return Err(SessionError::Api {
            status: status.as_u16(),
            message: envelope.message.unwrap_or(envelope.status),
        });
    }

    envelope
        .data
        .ok_or_else(|| SessionError::InvalidResponse("response has no data".to_string()))
}
