//! In-memory transport for unit tests.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::transport::{Method, Transport};

struct Scripted {
    response: Result<Value>,
    gate: Option<Rc<Notify>>,
}

/// Replies with queued responses per `METHOD path` (query string ignored).
/// Unscripted requests fail with a 404.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    script: RefCell<HashMap<String, VecDeque<Scripted>>>,
    requests: RefCell<Vec<(Method, String, Option<Value>)>>,
}

fn key(method: Method, path: &str) -> String {
    let path = path.split('?').next().unwrap_or(path);
    format!("{} {}", method.as_str(), path)
}

impl ScriptedTransport {
    pub(crate) fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub(crate) fn push(&self, method: Method, path: &str, response: Result<Value>) {
        self.script
            .borrow_mut()
            .entry(key(method, path))
            .or_default()
            .push_back(Scripted {
                response,
                gate: None,
            });
    }

    /// Queue a response that is only delivered once the returned gate is notified.
    pub(crate) fn push_gated(&self, method: Method, path: &str, response: Result<Value>) -> Rc<Notify> {
        let gate = Rc::new(Notify::new());
        self.script
            .borrow_mut()
            .entry(key(method, path))
            .or_default()
            .push_back(Scripted {
                response,
                gate: Some(gate.clone()),
            });
        gate
    }

    pub(crate) fn requests(&self) -> Vec<(Method, String, Option<Value>)> {
        self.requests.borrow().clone()
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requests.borrow().len()
    }
}

#[async_trait(?Send)]
impl Transport for ScriptedTransport {
    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        self.requests
            .borrow_mut()
            .push((method, path.to_string(), body));
        let next = self
            .script
            .borrow_mut()
            .get_mut(&key(method, path))
            .and_then(VecDeque::pop_front);
        let Some(scripted) = next else {
            return Err(Error::Http {
                status: 404,
                message: format!("no scripted response for {}", key(method, path)),
            });
        };
        if let Some(gate) = scripted.gate {
            gate.notified().await;
        }
        scripted.response
    }
}
