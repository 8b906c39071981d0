//! Pending-action ledger.
//!
//! Actions chosen by the user but not yet confirmed, at most one per VM.
//! The VM's `pending_action` attribute mirrors its entry. An entry whose
//! action is no longer offered, or whose VM left its collection, is dropped
//! without being invoked.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::{Rc, Weak};

use serde_json::Value;
use tracing::{debug, warn};

use crate::collection::{Collection, CollectionEvent};
use crate::entity::{EntityRef, ListenerId};
use crate::error::{Error, Result};
use crate::vm::Action;

#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub entity: EntityRef,
    pub action: Action,
    /// Views that displayed the control which set the entry.
    pub views: BTreeSet<String>,
}

pub struct Ledger {
    entries: RefCell<BTreeMap<String, PendingEntry>>,
    watchers: RefCell<HashMap<String, (EntityRef, ListenerId)>>,
    subscriptions: RefCell<Vec<(Weak<Collection>, ListenerId)>>,
    this: Weak<Ledger>,
}

/// Whether `entity` currently offers `action`.
///
/// Ungated actions are allowed in any state that offers something; a VM
/// being destroyed or already deleted accepts nothing.
pub fn offers(entity: &EntityRef, action: &Action) -> bool {
    let Some(Value::Array(actions)) = entity.get("actions") else {
        return false;
    };
    if action.gated() {
        actions.iter().any(|a| a.as_str() == Some(action.name()))
    } else {
        !actions.is_empty()
    }
}

impl Ledger {
    pub fn new() -> Rc<Self> {
        Rc::new_cyclic(|this| Ledger {
            entries: RefCell::new(BTreeMap::new()),
            watchers: RefCell::new(HashMap::new()),
            subscriptions: RefCell::new(Vec::new()),
            this: this.clone(),
        })
    }

    /// Drop entries of entities removed from `collection`, one by one or
    /// through a reset.
    pub fn watch(&self, collection: &Rc<Collection>) {
        let weak = self.this.clone();
        let listener = collection.on(move |event| {
            let Some(ledger) = weak.upgrade() else {
                return;
            };
            match event {
                CollectionEvent::Remove(entity) => ledger.drop_entity(entity),
                CollectionEvent::Reset { dropped } => {
                    for entity in dropped {
                        ledger.drop_entity(entity);
                    }
                }
                _ => {}
            }
        });
        self.subscriptions
            .borrow_mut()
            .push((Rc::downgrade(collection), listener));
    }

    /// Record `action` as pending for `entity`, replacing any other pending
    /// action. Setting the same action again from another view adds the view.
    pub fn set_pending(&self, entity: &EntityRef, action: Action, view: &str) -> Result<()> {
        if !offers(entity, &action) {
            return Err(Error::ActionNotAllowed {
                action: action.name().to_string(),
                state: entity.get_str("state").unwrap_or_default(),
            });
        }

        let id = entity.id().to_string();
        let name = action.name();
        {
            let mut entries = self.entries.borrow_mut();
            match entries.get_mut(&id) {
                Some(entry) if entry.action == action => {
                    entry.views.insert(view.to_string());
                }
                _ => {
                    entries.insert(
                        id.clone(),
                        PendingEntry {
                            entity: entity.clone(),
                            action,
                            views: BTreeSet::from([view.to_string()]),
                        },
                    );
                }
            }
        }
        self.watch_entity(entity);
        entity.set_one("pending_action", Value::String(name.to_string()))?;
        Ok(())
    }

    /// Remove the entry of entity `id`.
    pub fn clear_pending(&self, id: &str) -> Option<PendingEntry> {
        let entry = self.entries.borrow_mut().remove(id)?;
        if let Some((entity, listener)) = self.watchers.borrow_mut().remove(id) {
            entity.off(listener);
        }
        if let Err(e) = entry.entity.set_one("pending_action", Value::Null) {
            warn!("{} {}: {}", entry.entity.kind(), id, e);
        }
        Some(entry)
    }

    pub fn pending(&self, id: &str) -> Option<Action> {
        self.entries.borrow().get(id).map(|e| e.action.clone())
    }

    pub fn views(&self, id: &str) -> BTreeSet<String> {
        self.entries
            .borrow()
            .get(id)
            .map(|e| e.views.clone())
            .unwrap_or_default()
    }

    /// Snapshot of every entry, ordered by entity id.
    pub fn entries(&self) -> Vec<PendingEntry> {
        self.entries.borrow().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Remove and return every entry.
    pub fn take_all(&self) -> Vec<PendingEntry> {
        let ids: Vec<String> = self.entries.borrow().keys().cloned().collect();
        ids.iter().filter_map(|id| self.clear_pending(id)).collect()
    }

    pub fn detach(&self) {
        for (collection, listener) in self.subscriptions.borrow_mut().drain(..) {
            if let Some(collection) = collection.upgrade() {
                collection.off(listener);
            }
        }
        for (_, (entity, listener)) in self.watchers.borrow_mut().drain() {
            entity.off(listener);
        }
        self.entries.borrow_mut().clear();
    }

    fn drop_entity(&self, entity: &EntityRef) {
        let tracked = self
            .entries
            .borrow()
            .get(entity.id())
            .is_some_and(|e| Rc::ptr_eq(&e.entity, entity));
        if tracked && self.clear_pending(entity.id()).is_some() {
            debug!("{} {} removed, dropped pending action", entity.kind(), entity.id());
        }
    }

    fn watch_entity(&self, entity: &EntityRef) {
        if self.watchers.borrow().contains_key(entity.id()) {
            return;
        }
        let weak = self.this.clone();
        let listener = entity.on_change("actions", move |entity, _| {
            if let Some(ledger) = weak.upgrade() {
                ledger.revalidate(entity);
            }
        });
        self.watchers
            .borrow_mut()
            .insert(entity.id().to_string(), (entity.clone(), listener));
    }

    fn revalidate(&self, entity: &EntityRef) {
        let stale = self
            .entries
            .borrow()
            .get(entity.id())
            .is_some_and(|e| !offers(entity, &e.action));
        if stale {
            debug!(
                "{} {}: pending action no longer available",
                entity.kind(),
                entity.id()
            );
            self.clear_pending(entity.id());
        }
    }
}
