//! HTTP convenience call for command handlers.
//!
//! Plain I/O, not part of the coordination protocol: a thin wrapper over a
//! shared `reqwest` client that injects the unit's ambient credentials and
//! defaults the content type for JSON bodies.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Header carrying the ambient access token.
pub const ACCESS_TOKEN_HEADER: &str = "X-Access-Token";

/// Per-unit ambient HTTP configuration, updated by configuration pushes from
/// the controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpSettings {
    /// Full `Authorization` header value (e.g. a Basic credential).
    pub authorization: Option<String>,
    /// Value for the access-token header.
    pub access_token: Option<String>,
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Invalid HTTP method: {0}")]
    InvalidMethod(String),
    #[error("Invalid header name: {0}")]
    InvalidHeader(String),
    #[error("HTTP client error: {0}")]
    Client(#[from] reqwest::Error),
    #[error("HTTP request failed with status {status}: {body}")]
    Status { status: u16, body: String },
}

static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

fn shared_client() -> Result<reqwest::Client, HttpError> {
    if let Some(client) = CLIENT.get() {
        return Ok(client.clone());
    }
    let built = reqwest::Client::builder().build()?;
    Ok(CLIENT.get_or_init(|| built).clone())
}

/// Issue a request with ambient auth-header injection.
///
/// Explicit `headers` win over injected ones. `Content-Type` defaults to
/// `application/json` when a body is present. Non-success statuses are
/// returned as [`HttpError::Status`] with the response body attached.
pub async fn http_request(
    settings: &HttpSettings,
    method: &str,
    url: &str,
    body: Option<Value>,
    headers: &[(String, String)],
) -> Result<Value, HttpError> {
    let method = reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|_| HttpError::InvalidMethod(method.to_string()))?;

    let client = shared_client()?;
    let mut request = client.request(method, url);

    let explicit = |name: &str| {
        headers
            .iter()
            .any(|(header, _)| header.eq_ignore_ascii_case(name))
    };
    if let Some(auth) = &settings.authorization
        && !explicit("authorization")
    {
        request = request.header(reqwest::header::AUTHORIZATION, auth);
    }
    if let Some(token) = &settings.access_token
        && !explicit(ACCESS_TOKEN_HEADER)
    {
        request = request.header(ACCESS_TOKEN_HEADER, token);
    }
    if body.is_some() && !explicit("content-type") {
        request = request.header(reqwest::header::CONTENT_TYPE, "application/json");
    }
    for (name, value) in headers {
        if reqwest::header::HeaderName::from_bytes(name.as_bytes()).is_err() {
            return Err(HttpError::InvalidHeader(name.clone()));
        }
        request = request.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &body {
        request = request.json(body);
    }

    let response = request.send().await?;
    let status = response.status();
    let text = response.text().await?;
    if !status.is_success() {
        return Err(HttpError::Status {
            status: status.as_u16(),
            body: text,
        });
    }
    Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
}
