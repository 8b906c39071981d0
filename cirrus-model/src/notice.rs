//! Error notices published to the host.

use serde::Serialize;

use crate::error::Error;

/// Category of a notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeKind {
    /// No response from the API.
    Transport,
    /// The API answered with an error status or malformed body.
    Api,
    /// Credentials rejected; the session is over.
    Unauthorized,
    /// A VM action failed.
    Action,
}

/// A user-facing error notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    /// Where the error happened, e.g. `servers` or `servers/42/reboot`.
    pub namespace: String,
    pub code: Option<u16>,
    pub message: String,
    pub kind: NoticeKind,
    pub details: Option<String>,
}

impl Notice {
    pub fn from_error(namespace: impl Into<String>, err: &Error) -> Self {
        let kind = match err {
            Error::Unauthorized => NoticeKind::Unauthorized,
            Error::Transport(_) => NoticeKind::Transport,
            _ => NoticeKind::Api,
        };
        Self {
            namespace: namespace.into(),
            code: err.status(),
            message: err.to_string(),
            kind,
            details: None,
        }
    }

    pub fn action(namespace: impl Into<String>, err: &Error) -> Self {
        let mut notice = Self::from_error(namespace, err);
        if notice.kind != NoticeKind::Unauthorized {
            notice.kind = NoticeKind::Action;
        }
        notice
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn is_unauthorized(&self) -> bool {
        self.kind == NoticeKind::Unauthorized
    }
}
