//! Observable entities.
//!
//! An entity is a record of JSON attributes with synchronous change
//! notification. Every [`Entity::set`] call is one commit: transforms are
//! applied, values assigned, derived attributes recomputed, and only then are
//! listeners told about the changed keys. No borrow is held while listeners
//! run, so a listener may call `set` again; that call is a separate commit.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::rc::{Rc, Weak};

use serde_json::Value;
use tracing::trace;

use crate::error::{Error, Result};
use crate::schema::{Attributes, Kind, Schema, id_string};

/// Shared handle to an entity.
pub type EntityRef = Rc<Entity>;

/// Handle returned by listener registration.
pub type ListenerId = u64;

type Listener = Rc<dyn Fn(&EntityRef, &EntityEvent)>;

/// Notifications emitted by an entity.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityEvent {
    /// One attribute changed (`change:<key>`).
    Changed { key: String, value: Value },
    /// A commit finished; `keys` lists every changed attribute.
    Change { keys: Vec<String> },
    /// The VM left a transient state for a steady one.
    Transition { from: String, to: String },
    /// A user action failed.
    ActionFail { action: String, reason: String },
}

/// Outcome of one `set` call, handed to schema hooks.
#[derive(Debug, Clone, Default)]
pub struct Commit {
    /// Changed keys in sorted order.
    pub keys: Vec<String>,
    /// Values of the changed keys before the commit (`Null` when absent).
    pub previous: Attributes,
    /// Values of the changed keys after the commit.
    pub current: Attributes,
}

impl Commit {
    /// `(old, new)` for `key` if it changed in this commit.
    pub fn change(&self, key: &str) -> Option<(&Value, &Value)> {
        Some((self.previous.get(key)?, self.current.get(key)?))
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Binding of a reference attribute to a resolved entity.
pub(crate) struct Binding {
    pub(crate) target: Weak<Entity>,
    pub(crate) listener: ListenerId,
}

pub struct Entity {
    id: String,
    schema: Rc<Schema>,
    attrs: RefCell<Attributes>,
    last_changed: RefCell<Vec<String>>,
    listeners: RefCell<Vec<(ListenerId, Listener)>>,
    next_listener: Cell<ListenerId>,
    related: RefCell<HashMap<String, Binding>>,
    this: Weak<Entity>,
}

impl Entity {
    /// Build an entity from a raw JSON object.
    ///
    /// Keys present in `record` count as explicitly set: derived attributes
    /// with the same name keep the given value.
    pub fn new(schema: Rc<Schema>, record: Value) -> Result<EntityRef> {
        let id = schema.extract_id(&record)?;
        let raw = into_attributes(record)?;

        let mut attrs = Attributes::new();
        for (key, value) in raw {
            let value = if key == schema.id_attr() {
                Value::String(id.clone())
            } else {
                schema.transform(&key, value)
            };
            attrs.insert(key, value);
        }
        let explicit: BTreeSet<String> = attrs.keys().cloned().collect();
        for node in schema.derived() {
            if !explicit.contains(&node.name) {
                let value = node.compute(&attrs);
                attrs.insert(node.name.clone(), value);
            }
        }

        Ok(Rc::new_cyclic(|this| Entity {
            id,
            schema,
            attrs: RefCell::new(attrs),
            last_changed: RefCell::new(Vec::new()),
            listeners: RefCell::new(Vec::new()),
            next_listener: Cell::new(1),
            related: RefCell::new(HashMap::new()),
            this: this.clone(),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> Kind {
        self.schema.kind()
    }

    pub fn schema(&self) -> &Rc<Schema> {
        &self.schema
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.attrs.borrow().get(key).cloned()
    }

    /// String attribute, `None` for missing or non-string values.
    pub fn get_str(&self, key: &str) -> Option<String> {
        self.attrs
            .borrow()
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.attrs.borrow().get(key).and_then(Value::as_f64)
    }

    pub fn attributes(&self) -> Attributes {
        self.attrs.borrow().clone()
    }

    /// Keys changed by the most recent commit.
    pub fn changed_keys(&self) -> Vec<String> {
        self.last_changed.borrow().clone()
    }

    /// Assign `values` as one commit and notify listeners.
    ///
    /// Returns the changed keys. Changing the id attribute is rejected.
    pub fn set(&self, values: Attributes) -> Result<Vec<String>> {
        let commit = self.apply(values)?;
        *self.last_changed.borrow_mut() = commit.keys.clone();
        if commit.is_empty() {
            return Ok(Vec::new());
        }
        trace!("{} {} changed: {:?}", self.kind(), self.id, commit.keys);

        for key in &commit.keys {
            let value = commit.current.get(key).cloned().unwrap_or(Value::Null);
            self.emit(EntityEvent::Changed {
                key: key.clone(),
                value,
            });
        }
        self.emit(EntityEvent::Change {
            keys: commit.keys.clone(),
        });
        for hook in self.schema.hooks() {
            if let Some(event) = hook(&commit) {
                self.emit(event);
            }
        }
        Ok(commit.keys)
    }

    /// Convenience for a single-key commit.
    pub fn set_one(&self, key: &str, value: Value) -> Result<Vec<String>> {
        let mut values = Attributes::new();
        values.insert(key.to_string(), value);
        self.set(values)
    }

    /// Assign a raw JSON object as one commit.
    pub fn set_record(&self, record: Value) -> Result<Vec<String>> {
        self.set(into_attributes(record)?)
    }

    fn apply(&self, values: Attributes) -> Result<Commit> {
        let id_attr = self.schema.id_attr();
        if let Some(value) = values.get(id_attr)
            && id_string(value).as_deref() != Some(self.id.as_str())
        {
            return Err(Error::IdChange {
                kind: self.kind().to_string(),
                id: self.id.clone(),
            });
        }

        let mut attrs = self.attrs.borrow_mut();
        let mut previous: BTreeMap<String, Value> = BTreeMap::new();
        let mut changed: BTreeSet<String> = BTreeSet::new();
        let mut explicit: BTreeSet<String> = BTreeSet::new();

        for (key, value) in values {
            if key == id_attr {
                continue;
            }
            let value = self.schema.transform(&key, value);
            explicit.insert(key.clone());
            let old = attrs.get(&key).cloned();
            if old.as_ref() != Some(&value) {
                previous
                    .entry(key.clone())
                    .or_insert_with(|| old.unwrap_or(Value::Null));
                changed.insert(key.clone());
            }
            attrs.insert(key, value);
        }

        for node in self.schema.derived() {
            if explicit.contains(&node.name) {
                continue;
            }
            if !changed
                .iter()
                .chain(explicit.iter())
                .any(|k| node.depends_on(k))
            {
                continue;
            }
            let value = node.compute(&attrs);
            let old = attrs.get(&node.name).cloned();
            if old.as_ref() != Some(&value) {
                previous
                    .entry(node.name.clone())
                    .or_insert_with(|| old.unwrap_or(Value::Null));
                changed.insert(node.name.clone());
                attrs.insert(node.name.clone(), value);
            }
        }

        let keys: Vec<String> = changed.into_iter().collect();
        let current = keys
            .iter()
            .map(|k| (k.clone(), attrs.get(k).cloned().unwrap_or(Value::Null)))
            .collect();
        Ok(Commit {
            keys,
            previous,
            current,
        })
    }

    /// Register a listener for every event of this entity.
    pub fn on<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&EntityRef, &EntityEvent) + 'static,
    {
        let id = self.next_listener.get();
        self.next_listener.set(id + 1);
        self.listeners.borrow_mut().push((id, Rc::new(f)));
        id
    }

    /// Register a listener for `change:<key>`.
    pub fn on_change<F>(&self, key: &str, f: F) -> ListenerId
    where
        F: Fn(&EntityRef, &Value) + 'static,
    {
        let key = key.to_string();
        self.on(move |entity, event| {
            if let EntityEvent::Changed { key: changed, value } = event
                && *changed == key
            {
                f(entity, value);
            }
        })
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.borrow_mut();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.borrow().len()
    }

    /// Deliver `event` to a snapshot of the current listeners.
    pub(crate) fn emit(&self, event: EntityEvent) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let listeners: Vec<Listener> = self
            .listeners
            .borrow()
            .iter()
            .map(|(_, l)| Rc::clone(l))
            .collect();
        for listener in listeners {
            listener(&this, &event);
        }
    }

    /// Re-fire a change of `attr` without touching attribute storage.
    ///
    /// Used when the entity referenced by `attr` changed or got resolved.
    pub(crate) fn emit_related_change(&self, attr: &str) {
        let value = self.get(attr).unwrap_or(Value::Null);
        self.emit(EntityEvent::Changed {
            key: attr.to_string(),
            value,
        });
        self.emit(EntityEvent::Change {
            keys: vec![attr.to_string()],
        });
    }

    /// Entity resolved for a reference attribute.
    pub fn related(&self, attr: &str) -> Option<EntityRef> {
        self.related
            .borrow()
            .get(attr)
            .and_then(|b| b.target.upgrade())
    }

    pub(crate) fn bind_related(&self, attr: &str, binding: Binding) -> Option<Binding> {
        self.related.borrow_mut().insert(attr.to_string(), binding)
    }

    pub(crate) fn unbind_related(&self, attr: &str) -> Option<Binding> {
        self.related.borrow_mut().remove(attr)
    }

    pub(crate) fn take_bindings(&self) -> Vec<(String, Binding)> {
        self.related.borrow_mut().drain().collect()
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("kind", &self.kind())
            .field("id", &self.id)
            .field("attrs", &self.attrs.borrow())
            .finish()
    }
}

/// Convert a JSON object to attribute storage.
pub fn into_attributes(record: Value) -> Result<Attributes> {
    match record {
        Value::Object(map) => Ok(map.into_iter().collect()),
        other => Err(Error::Parse(format!("expected an object, got {}", other))),
    }
}

/// Build attributes from `(key, value)` pairs.
pub fn attrs<I, K>(pairs: I) -> Attributes
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}
