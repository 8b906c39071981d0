//! VM lifecycle state machine and user actions.
//!
//! `status` is what the API reports. `state` is the client view: it also
//! covers transient phases started by the user (`REBOOT`, `DESTROY`, ...)
//! that the API only confirms later. A state with an entry in the transition
//! table only moves to one of the listed statuses, so a poll that still
//! reports the pre-action status cannot clobber a transient state. A state
//! without an entry accepts whatever the API reports.

use std::fmt;
use std::str::FromStr;

use serde_json::{Value, json};

use crate::entity::{Commit, EntityEvent};
use crate::error::{Error, Result};
use crate::schema::Attributes;
use crate::transport::Method;

pub const BUILD: &str = "BUILD";
pub const ACTIVE: &str = "ACTIVE";
pub const STOPPED: &str = "STOPPED";
pub const ERROR: &str = "ERROR";
pub const DELETED: &str = "DELETED";
pub const UNKNOWN: &str = "UNKNOWN";

pub const START: &str = "START";
pub const SHUTDOWN: &str = "SHUTDOWN";
pub const REBOOT: &str = "REBOOT";
pub const DESTROY: &str = "DESTROY";
pub const CONNECT: &str = "CONNECT";
pub const DISCONNECT: &str = "DISCONNECT";
pub const RESIZE: &str = "RESIZE";
pub const FIREWALL: &str = "FIREWALL";

/// Client-only states entered by a user action.
pub const TRANSIENT_STATES: [&str; 8] = [
    START, SHUTDOWN, REBOOT, DESTROY, CONNECT, DISCONNECT, RESIZE, FIREWALL,
];

pub fn is_transient(state: &str) -> bool {
    TRANSIENT_STATES.contains(&state)
}

/// Statuses a state may move to. `None` means the API is authoritative.
pub fn allowed_transitions(state: &str) -> Option<&'static [&'static str]> {
    let allowed: &'static [&'static str] = match state {
        BUILD => &[ACTIVE, STOPPED, ERROR, DESTROY, DELETED],
        ACTIVE => &[STOPPED, ERROR, REBOOT, SHUTDOWN, DESTROY, RESIZE, DELETED],
        STOPPED => &[ACTIVE, ERROR, DESTROY, RESIZE, DELETED],
        START => &[ACTIVE, ERROR, DESTROY, DELETED],
        SHUTDOWN => &[STOPPED, ERROR, DESTROY, DELETED],
        REBOOT => &[ACTIVE, STOPPED, ERROR, DESTROY, DELETED],
        DESTROY => &[DELETED, ERROR],
        RESIZE => &[ACTIVE, STOPPED, ERROR, DESTROY, DELETED],
        CONNECT | DISCONNECT | FIREWALL => &[ACTIVE, STOPPED, ERROR, DESTROY, DELETED],
        _ => return None,
    };
    Some(allowed)
}

/// New client state after the API reported `incoming`.
pub fn next_state(current: Option<&str>, incoming: &str) -> String {
    let Some(current) = current else {
        return incoming.to_string();
    };
    match allowed_transitions(current) {
        Some(allowed) if allowed.contains(&incoming) => incoming.to_string(),
        Some(_) => current.to_string(),
        None => incoming.to_string(),
    }
}

/// Actions offered to the user in `state`.
pub fn available_actions(state: &str) -> &'static [&'static str] {
    match state {
        ACTIVE => &["shutdown", "destroy", "reboot", "console"],
        STOPPED => &["start", "destroy", "resize"],
        BUILD | ERROR | UNKNOWN => &["destroy"],
        START | SHUTDOWN | REBOOT | RESIZE | CONNECT | DISCONNECT | FIREWALL => &["destroy"],
        DESTROY | DELETED => &[],
        _ => &["destroy"],
    }
}

/// Derivation of `state` from `status` (and the previous `state`).
pub(crate) fn derive_state(attrs: &Attributes) -> Value {
    let status = attrs
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or(ERROR);
    let current = attrs.get("state").and_then(Value::as_str);
    Value::String(next_state(current, status))
}

pub(crate) fn derive_actions(attrs: &Attributes) -> Value {
    let state = attrs.get("state").and_then(Value::as_str).unwrap_or(ERROR);
    Value::Array(
        available_actions(state)
            .iter()
            .map(|a| Value::String(a.to_string()))
            .collect(),
    )
}

pub(crate) fn derive_busy(attrs: &Attributes) -> Value {
    let state = attrs.get("state").and_then(Value::as_str).unwrap_or(ERROR);
    let status = attrs.get("status").and_then(Value::as_str).unwrap_or(ERROR);
    Value::Bool(is_transient(state) || status == BUILD)
}

/// Emits `Transition` when `state` leaves a transient state for a steady one.
pub(crate) fn transition_hook(commit: &Commit) -> Option<EntityEvent> {
    let (from, to) = commit.change("state")?;
    let (from, to) = (from.as_str()?, to.as_str()?);
    if is_transient(from) && !is_transient(to) {
        Some(EntityEvent::Transition {
            from: from.to_string(),
            to: to.to_string(),
        })
    } else {
        None
    }
}

/// A user action on a VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Start,
    Shutdown,
    Reboot,
    Destroy,
    Console,
    Resize { flavor_ref: String },
    AddFloatingIp { address: String },
    RemoveFloatingIp { address: String },
    Firewall { nic: String, profile: String },
    Rename { name: String },
    SetMetadata { key: String, value: String },
    DeleteMetadata { key: String },
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Start => "start",
            Action::Shutdown => "shutdown",
            Action::Reboot => "reboot",
            Action::Destroy => "destroy",
            Action::Console => "console",
            Action::Resize { .. } => "resize",
            Action::AddFloatingIp { .. } => "connect",
            Action::RemoveFloatingIp { .. } => "disconnect",
            Action::Firewall { .. } => "firewall",
            Action::Rename { .. } => "rename",
            Action::SetMetadata { .. } => "set-metadata",
            Action::DeleteMetadata { .. } => "delete-metadata",
        }
    }

    /// Whether the action is checked against [`available_actions`].
    pub fn gated(&self) -> bool {
        matches!(
            self,
            Action::Start
                | Action::Shutdown
                | Action::Reboot
                | Action::Destroy
                | Action::Console
                | Action::Resize { .. }
        )
    }

    /// State the VM enters as soon as the action is issued.
    pub fn optimistic_state(&self) -> Option<&'static str> {
        match self {
            Action::Start => Some(START),
            Action::Shutdown => Some(SHUTDOWN),
            Action::Reboot => Some(REBOOT),
            Action::Destroy => Some(DESTROY),
            Action::Resize { .. } => Some(RESIZE),
            Action::AddFloatingIp { .. } => Some(CONNECT),
            Action::RemoveFloatingIp { .. } => Some(DISCONNECT),
            Action::Firewall { .. } => Some(FIREWALL),
            Action::Console
            | Action::Rename { .. }
            | Action::SetMetadata { .. }
            | Action::DeleteMetadata { .. } => None,
        }
    }

    /// Attributes applied locally before the request is sent.
    ///
    /// `metadata` is the VM's current metadata object, used by the
    /// metadata actions.
    pub fn optimistic_attrs(&self, metadata: Option<&Value>) -> Attributes {
        let mut attrs = Attributes::new();
        if let Some(state) = self.optimistic_state() {
            attrs.insert("state".to_string(), Value::String(state.to_string()));
        }
        match self {
            Action::Rename { name } => {
                attrs.insert("name".to_string(), Value::String(name.clone()));
            }
            Action::SetMetadata { key, value } => {
                let mut meta = metadata.cloned().unwrap_or_else(|| json!({}));
                if let Some(obj) = meta.as_object_mut() {
                    obj.insert(key.clone(), Value::String(value.clone()));
                }
                attrs.insert("metadata".to_string(), meta);
            }
            Action::DeleteMetadata { key } => {
                let mut meta = metadata.cloned().unwrap_or_else(|| json!({}));
                if let Some(obj) = meta.as_object_mut() {
                    obj.remove(key);
                }
                attrs.insert("metadata".to_string(), meta);
            }
            _ => {}
        }
        attrs
    }

    /// Method, path and body of the API request for VM `id`.
    pub fn request(&self, id: &str) -> (Method, String, Option<Value>) {
        let action_path = format!("/servers/{}/action", id);
        match self {
            Action::Start => (Method::Post, action_path, Some(json!({"start": {}}))),
            Action::Shutdown => (Method::Post, action_path, Some(json!({"shutdown": {}}))),
            Action::Reboot => (Method::Post, action_path, Some(json!({"reboot": {}}))),
            Action::Console => (
                Method::Post,
                action_path,
                Some(json!({"console": {"type": "vnc"}})),
            ),
            Action::Resize { flavor_ref } => (
                Method::Post,
                action_path,
                Some(json!({"resize": {"flavorRef": flavor_ref}})),
            ),
            Action::AddFloatingIp { address } => (
                Method::Post,
                action_path,
                Some(json!({"addFloatingIp": {"address": address}})),
            ),
            Action::RemoveFloatingIp { address } => (
                Method::Post,
                action_path,
                Some(json!({"removeFloatingIp": {"address": address}})),
            ),
            Action::Firewall { nic, profile } => (
                Method::Post,
                action_path,
                Some(json!({"firewallProfile": {"nic": nic, "profile": profile}})),
            ),
            Action::Destroy => (Method::Delete, format!("/servers/{}", id), None),
            Action::Rename { name } => (
                Method::Put,
                format!("/servers/{}", id),
                Some(json!({"server": {"name": name}})),
            ),
            Action::SetMetadata { key, value } => (
                Method::Put,
                format!("/servers/{}/metadata/{}", id, key),
                Some(json!({"meta": {key.as_str(): value}})),
            ),
            Action::DeleteMetadata { key } => (
                Method::Delete,
                format!("/servers/{}/metadata/{}", id, key),
                None,
            ),
        }
    }

    /// Build an action from its name and positional arguments.
    pub fn parse(name: &str, args: &[String]) -> Result<Self> {
        let arg = |i: usize| -> Result<String> {
            args.get(i)
                .cloned()
                .ok_or_else(|| Error::Parse(format!("{}: missing argument {}", name, i + 1)))
        };
        match name {
            "start" => Ok(Action::Start),
            "shutdown" => Ok(Action::Shutdown),
            "reboot" => Ok(Action::Reboot),
            "destroy" => Ok(Action::Destroy),
            "console" => Ok(Action::Console),
            "resize" => Ok(Action::Resize { flavor_ref: arg(0)? }),
            "connect" => Ok(Action::AddFloatingIp { address: arg(0)? }),
            "disconnect" => Ok(Action::RemoveFloatingIp { address: arg(0)? }),
            "firewall" => Ok(Action::Firewall {
                nic: arg(0)?,
                profile: arg(1)?,
            }),
            "rename" => Ok(Action::Rename { name: arg(0)? }),
            "set-metadata" => Ok(Action::SetMetadata {
                key: arg(0)?,
                value: arg(1)?,
            }),
            "delete-metadata" => Ok(Action::DeleteMetadata { key: arg(0)? }),
            other => Err(Error::UnknownAction(other.to_string())),
        }
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Action::parse(s, &[])
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
