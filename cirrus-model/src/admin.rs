//! Bulk admin operations.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Body posted to the admin endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkRequest {
    /// Operation, e.g. `suspend` or `contact`.
    pub op: String,
    /// Resource type the ids belong to, e.g. `vm` or `user`.
    pub target: String,
    pub ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl BulkRequest {
    pub fn new(op: impl Into<String>, target: impl Into<String>, ids: Vec<String>) -> Self {
        Self {
            op: op.into(),
            target: target.into(),
            ids,
            subject: None,
            text: None,
        }
    }

    /// Attach a message, used by `contact`.
    pub fn with_message(mut self, subject: impl Into<String>, text: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self.text = Some(text.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkOutcome {
    #[serde(default)]
    pub result: String,
    /// Ids the operation failed for.
    #[serde(default)]
    pub error_ids: Vec<String>,
}

impl BulkOutcome {
    pub fn is_success(&self) -> bool {
        self.error_ids.is_empty()
    }
}

pub struct AdminClient {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl AdminClient {
    pub fn new(url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            token,
        }
    }

    pub async fn submit(&self, request: &BulkRequest) -> Result<BulkOutcome> {
        info!(
            "admin {} on {} {} ids",
            request.op,
            request.ids.len(),
            request.target
        );
        let mut builder = self.client.post(&self.url).json(request);
        if let Some(token) = &self.token {
            builder = builder.header("X-Auth-Token", token);
        }
        // no response at all is reported like a status 0
        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                debug!("admin request failed: {}", e);
                return interpret(0, "");
            }
        };
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| {
            Error::Transport(format!("admin reply {} unreadable: {}", status, e))
        })?;
        interpret(status, &body)
    }
}

/// Interpret an admin endpoint reply.
///
/// `500` and `0` (no response) are transport-level failures and `401` ends
/// the session. Every other status carries `{result, error_ids}`; a body
/// that does not parse is an API error with that status.
pub fn interpret(status: u16, body: &str) -> Result<BulkOutcome> {
    match status {
        0 => Err(Error::Transport("no response from admin endpoint".to_string())),
        401 => Err(Error::Unauthorized),
        500 => Err(Error::Transport(format!(
            "admin endpoint failed: {}",
            body.trim()
        ))),
        _ => match serde_json::from_str::<BulkOutcome>(body) {
            Ok(outcome) => Ok(outcome),
            Err(_) if (200..300).contains(&status) => {
                Err(Error::Parse(format!("unexpected admin reply: {}", body.trim())))
            }
            Err(_) => Err(Error::Http {
                status,
                message: body.trim().to_string(),
            }),
        },
    }
}
