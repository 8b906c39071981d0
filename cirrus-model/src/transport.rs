//! HTTP transport to the compute API.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};

/// HTTP method of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

/// Sends JSON requests to the API and returns the decoded JSON body.
///
/// Empty bodies (`204`, `304`) decode to `Value::Null`.
#[async_trait(?Send)]
pub trait Transport {
    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value>;
}

/// `reqwest`-backed transport.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait(?Send)]
impl Transport for HttpTransport {
    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        debug!("{} {}", method.as_str(), url);

        let mut builder = match method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
            Method::Put => self.client.put(&url),
            Method::Delete => self.client.delete(&url),
        };
        if let Some(token) = &self.token {
            builder = builder.header("X-Auth-Token", token);
        }
        if let Some(body) = body {
            builder = builder.json(&body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        decode_response(status, &text)
    }
}

/// Map a status and raw body to the transport result.
pub(crate) fn decode_response(status: StatusCode, text: &str) -> Result<Value> {
    if status == StatusCode::UNAUTHORIZED {
        return Err(Error::Unauthorized);
    }
    if status == StatusCode::NOT_MODIFIED || status == StatusCode::NO_CONTENT {
        return Ok(Value::Null);
    }
    if !status.is_success() {
        return Err(Error::Http {
            status: status.as_u16(),
            message: error_message(text),
        });
    }
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(text)?)
}

/// Pull a readable message out of an API error body.
///
/// Fault bodies look like `{"badRequest": {"message": "...", "code": 400}}`
/// or `{"error": "..."}`; anything else is returned verbatim.
fn error_message(text: &str) -> String {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return text.trim().to_string();
    };
    if let Some(message) = value.get("error").and_then(Value::as_str) {
        return message.to_string();
    }
    if let Some(obj) = value.as_object()
        && let Some(message) = obj
            .values()
            .find_map(|fault| fault.get("message").and_then(Value::as_str))
    {
        return message.to_string();
    }
    text.trim().to_string()
}
