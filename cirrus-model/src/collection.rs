//! Id-indexed entity collections refreshed by fetch-and-merge.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::{Rc, Weak};

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;
use tracing::{debug, trace};

use crate::entity::{Entity, EntityEvent, EntityRef, ListenerId};
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::models;
use crate::schema::{Kind, Schema};
use crate::transport::{Method, Transport};

/// Sort order of a collection.
pub type Comparator = Rc<dyn Fn(&Entity, &Entity) -> Ordering>;

/// Turns a response body into raw records.
pub type ParseHook = Rc<dyn Fn(&Value) -> Result<Vec<Value>>>;

type Listener = Rc<dyn Fn(&CollectionEvent)>;

#[derive(Debug, Clone)]
pub enum CollectionEvent {
    Add(EntityRef),
    Remove(EntityRef),
    /// A member committed changes.
    Change { entity: EntityRef, keys: Vec<String> },
    /// A member emitted `Transition` or `ActionFail`.
    Entity { entity: EntityRef, event: EntityEvent },
    /// Every member was replaced; `dropped` holds the previous members.
    Reset { dropped: Vec<EntityRef> },
    Sort,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions {
    /// Remove members absent from a full response.
    pub remove_missing: bool,
    /// Failures are surfaced to the user instead of only logged.
    pub critical: bool,
    /// Ask only for records changed since the last applied fetch.
    pub incremental: bool,
}

impl FetchOptions {
    pub fn full() -> Self {
        Self {
            remove_missing: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchSummary {
    pub added: usize,
    pub changed: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Applied(FetchSummary),
    /// A newer response was applied first; this one was dropped.
    Stale { generation: u64 },
}

/// Clears the in-flight flag when the fetch future completes or is dropped.
struct InFlight<'a>(&'a Cell<usize>);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a Cell<usize>) -> Self {
        counter.set(counter.get() + 1);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.set(self.0.get().saturating_sub(1));
    }
}

pub struct Collection {
    schema: Rc<Schema>,
    path: String,
    parse: ParseHook,
    comparator: Option<Comparator>,
    models: RefCell<Vec<EntityRef>>,
    index: RefCell<HashMap<String, EntityRef>>,
    members: RefCell<HashMap<String, ListenerId>>,
    listeners: RefCell<Vec<(ListenerId, Listener)>>,
    next_listener: Cell<ListenerId>,
    issued: Cell<u64>,
    applied: Cell<u64>,
    in_flight: Cell<usize>,
    last_fetched: Cell<Option<DateTime<Utc>>>,
    this: Weak<Collection>,
}

impl Collection {
    pub fn new(
        schema: Rc<Schema>,
        path: impl Into<String>,
        parse: ParseHook,
        comparator: Option<Comparator>,
    ) -> Rc<Self> {
        Rc::new_cyclic(|this| Collection {
            schema,
            path: path.into(),
            parse,
            comparator,
            models: RefCell::new(Vec::new()),
            index: RefCell::new(HashMap::new()),
            members: RefCell::new(HashMap::new()),
            listeners: RefCell::new(Vec::new()),
            next_listener: Cell::new(1),
            issued: Cell::new(0),
            applied: Cell::new(0),
            in_flight: Cell::new(0),
            last_fetched: Cell::new(None),
            this: this.clone(),
        })
    }

    /// Collection of `kind` with its standard path, order and parse hook.
    pub fn for_kind(kind: Kind, envelope: Envelope) -> Result<Rc<Self>> {
        let key = models::envelope_key(kind);
        let parse: ParseHook = Rc::new(move |body: &Value| {
            Ok(envelope
                .parse(body, key)?
                .into_iter()
                .map(|record| models::unwrap_record(kind, record))
                .collect())
        });
        Ok(Self::new(
            models::schema_for(kind)?,
            models::resource_path(kind),
            parse,
            models::comparator_for(kind),
        ))
    }

    pub fn kind(&self) -> Kind {
        self.schema.kind()
    }

    pub fn schema(&self) -> &Rc<Schema> {
        &self.schema
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn get(&self, id: &str) -> Option<EntityRef> {
        self.index.borrow().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.borrow().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.models.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.borrow().is_empty()
    }

    /// Member ids in collection order.
    pub fn ids(&self) -> Vec<String> {
        self.models
            .borrow()
            .iter()
            .map(|e| e.id().to_string())
            .collect()
    }

    /// Members in collection order.
    pub fn entities(&self) -> Vec<EntityRef> {
        self.models.borrow().clone()
    }

    pub fn filter<F>(&self, pred: F) -> Vec<EntityRef>
    where
        F: Fn(&Entity) -> bool,
    {
        self.models
            .borrow()
            .iter()
            .filter(|e| pred(&***e))
            .cloned()
            .collect()
    }

    pub fn is_fetching(&self) -> bool {
        self.in_flight.get() > 0
    }

    pub fn last_fetched(&self) -> Option<DateTime<Utc>> {
        self.last_fetched.get()
    }

    /// Add a raw record. An id that is already present returns the existing
    /// member unchanged and emits nothing.
    pub fn add(&self, record: Value) -> Result<EntityRef> {
        let id = self.schema.extract_id(&record)?;
        if let Some(existing) = self.get(&id) {
            return Ok(existing);
        }
        let entity = Entity::new(self.schema.clone(), record)?;
        self.insert(entity.clone());
        Ok(entity)
    }

    fn insert(&self, entity: EntityRef) {
        let weak = self.this.clone();
        let listener = entity.on(move |entity, event| {
            if let Some(collection) = weak.upgrade() {
                collection.on_member_event(entity, event);
            }
        });

        {
            let mut models = self.models.borrow_mut();
            let pos = match &self.comparator {
                Some(cmp) => models.partition_point(|m| cmp(&**m, &*entity) != Ordering::Greater),
                None => models.len(),
            };
            models.insert(pos, entity.clone());
        }
        self.index
            .borrow_mut()
            .insert(entity.id().to_string(), entity.clone());
        self.members
            .borrow_mut()
            .insert(entity.id().to_string(), listener);

        trace!("{} {} added", self.kind(), entity.id());
        self.emit(&CollectionEvent::Add(entity));
    }

    /// Remove a member by id.
    pub fn remove(&self, id: &str) -> Option<EntityRef> {
        let entity = self.index.borrow_mut().remove(id)?;
        self.models.borrow_mut().retain(|m| m.id() != id);
        if let Some(listener) = self.members.borrow_mut().remove(id) {
            entity.off(listener);
        }
        trace!("{} {} removed", self.kind(), id);
        self.emit(&CollectionEvent::Remove(entity.clone()));
        Some(entity)
    }

    /// Replace every member with `records` and emit a single `Reset`.
    pub fn reset(&self, records: Vec<Value>) -> Result<()> {
        let records = self.validate(records)?;
        let dropped: Vec<EntityRef> = self.models.borrow_mut().drain(..).collect();
        for entity in &dropped {
            if let Some(listener) = self.members.borrow_mut().remove(entity.id()) {
                entity.off(listener);
            }
        }
        self.index.borrow_mut().clear();

        let listeners = std::mem::take(&mut *self.listeners.borrow_mut());
        let result = records.into_iter().try_for_each(|(id, record)| -> Result<()> {
            if !self.contains(&id) {
                self.insert(Entity::new(self.schema.clone(), record)?);
            }
            Ok(())
        });
        {
            let mut current = self.listeners.borrow_mut();
            let added = std::mem::replace(&mut *current, listeners);
            current.extend(added);
        }
        result?;
        self.emit(&CollectionEvent::Reset { dropped });
        Ok(())
    }

    /// Re-sort by the comparator. Without one this is a no-op.
    pub fn sort(&self) {
        let Some(cmp) = &self.comparator else {
            return;
        };
        self.models.borrow_mut().sort_by(|a, b| cmp(&**a, &**b));
        self.emit(&CollectionEvent::Sort);
    }

    /// Fetch the collection path and merge the response.
    ///
    /// Transport and parse errors leave the collection untouched. When a
    /// newer fetch has already been applied, the response is discarded.
    pub async fn fetch(
        &self,
        transport: &dyn Transport,
        options: FetchOptions,
    ) -> Result<FetchOutcome> {
        let generation = self.issued.get() + 1;
        self.issued.set(generation);
        let _in_flight = InFlight::enter(&self.in_flight);

        let since = if options.incremental {
            self.last_fetched.get()
        } else {
            None
        };
        let path = match since {
            Some(since) => format!(
                "{}?changes-since={}",
                self.path,
                since.to_rfc3339_opts(SecondsFormat::Secs, true)
            ),
            None => self.path.clone(),
        };

        let started = Utc::now();
        let body = transport.request(Method::Get, &path, None).await?;

        if generation < self.applied.get() {
            debug!(
                "{}: dropping response {} (applied {})",
                self.kind(),
                generation,
                self.applied.get()
            );
            return Ok(FetchOutcome::Stale { generation });
        }

        // 204/304 carry no body: nothing changed.
        let unchanged = body.is_null();
        let records = if unchanged {
            Vec::new()
        } else {
            (self.parse)(&body)?
        };
        // A delta response does not list unchanged members.
        let remove_missing = options.remove_missing && since.is_none() && !unchanged;
        let summary = self.merge(records, remove_missing)?;
        self.applied.set(generation);
        self.last_fetched.set(Some(started));

        debug!(
            "{}: fetched (+{} ~{} -{})",
            self.kind(),
            summary.added,
            summary.changed,
            summary.removed
        );
        Ok(FetchOutcome::Applied(summary))
    }

    /// Merge raw records: known ids are updated, unknown ids added and, with
    /// `remove_missing`, members not in `records` removed.
    pub fn merge(&self, records: Vec<Value>, remove_missing: bool) -> Result<FetchSummary> {
        let records = self.validate(records)?;
        let mut summary = FetchSummary::default();
        let mut seen = HashSet::with_capacity(records.len());

        for (id, record) in records {
            seen.insert(id.clone());
            match self.get(&id) {
                Some(entity) => {
                    if !entity.set_record(record)?.is_empty() {
                        summary.changed += 1;
                    }
                }
                None => {
                    if self.schema.is_terminal(&record) {
                        continue;
                    }
                    self.insert(Entity::new(self.schema.clone(), record)?);
                    summary.added += 1;
                }
            }
        }

        if remove_missing {
            for id in self.ids() {
                if !seen.contains(&id) && self.remove(&id).is_some() {
                    summary.removed += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Check every record before anything is mutated.
    fn validate(&self, records: Vec<Value>) -> Result<Vec<(String, Value)>> {
        records
            .into_iter()
            .map(|record| {
                if !record.is_object() {
                    return Err(Error::Parse(format!(
                        "{}: expected an object, got {}",
                        self.kind(),
                        record
                    )));
                }
                Ok((self.schema.extract_id(&record)?, record))
            })
            .collect()
    }

    fn on_member_event(&self, entity: &EntityRef, event: &EntityEvent) {
        match event {
            EntityEvent::Changed { .. } => {}
            EntityEvent::Change { keys } => {
                self.emit(&CollectionEvent::Change {
                    entity: entity.clone(),
                    keys: keys.clone(),
                });
                if keys.iter().any(|k| k == "status") && self.reached_terminal(entity) {
                    self.remove(entity.id());
                }
            }
            EntityEvent::Transition { .. } | EntityEvent::ActionFail { .. } => {
                self.emit(&CollectionEvent::Entity {
                    entity: entity.clone(),
                    event: event.clone(),
                });
            }
        }
    }

    fn reached_terminal(&self, entity: &Entity) -> bool {
        match (self.schema.terminal_status(), entity.get_str("status")) {
            (Some(terminal), Some(status)) => status.eq_ignore_ascii_case(terminal),
            _ => false,
        }
    }

    pub fn on<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&CollectionEvent) + 'static,
    {
        let id = self.next_listener.get();
        self.next_listener.set(id + 1);
        self.listeners.borrow_mut().push((id, Rc::new(f)));
        id
    }

    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.borrow_mut();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    fn emit(&self, event: &CollectionEvent) {
        let listeners: Vec<Listener> = self
            .listeners
            .borrow()
            .iter()
            .map(|(_, l)| Rc::clone(l))
            .collect();
        for listener in listeners {
            listener(event);
        }
    }

    /// Drop every listener, including the ones on members.
    pub fn detach(&self) {
        self.listeners.borrow_mut().clear();
        let members: Vec<(String, ListenerId)> = self.members.borrow_mut().drain().collect();
        for (id, listener) in members {
            if let Some(entity) = self.get(&id) {
                entity.off(listener);
            }
        }
    }
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("kind", &self.kind())
            .field("path", &self.path)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedTransport;
    use serde_json::json;

    fn vms() -> Rc<Collection> {
        Collection::for_kind(Kind::VirtualMachine, Envelope::Current).unwrap()
    }

    fn record_events(collection: &Collection) -> Rc<RefCell<Vec<String>>> {
        let events = Rc::new(RefCell::new(Vec::new()));
        let sink = events.clone();
        collection.on(move |event| {
            let line = match event {
                CollectionEvent::Add(e) => format!("add {}", e.id()),
                CollectionEvent::Remove(e) => format!("remove {}", e.id()),
                CollectionEvent::Change { entity, keys } => {
                    format!("change {} {}", entity.id(), keys.join(","))
                }
                CollectionEvent::Entity { entity, event } => format!("entity {} {:?}", entity.id(), event),
                CollectionEvent::Reset { dropped } => format!("reset -{}", dropped.len()),
                CollectionEvent::Sort => "sort".to_string(),
            };
            sink.borrow_mut().push(line);
        });
        events
    }

    fn servers(records: Value) -> Result<Value> {
        Ok(json!({ "servers": records }))
    }

    #[test]
    fn test_add_keeps_comparator_order() {
        let c = vms();
        c.add(json!({"id": 1, "name": "web"})).unwrap();
        c.add(json!({"id": 2, "name": "db"})).unwrap();
        c.add(json!({"id": 3, "name": "cache"})).unwrap();
        assert_eq!(c.ids(), vec!["3", "2", "1"]);
    }

    #[test]
    fn test_add_duplicate_returns_existing() {
        let c = vms();
        let first = c.add(json!({"id": 1, "name": "web"})).unwrap();
        let events = record_events(&c);
        let second = c.add(json!({"id": "1", "name": "other"})).unwrap();
        assert!(Rc::ptr_eq(&first, &second));
        assert_eq!(second.get_str("name").unwrap(), "web");
        assert!(events.borrow().is_empty());
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn test_remove_emits_and_detaches() {
        let c = vms();
        let vm = c.add(json!({"id": 1, "status": "ACTIVE"})).unwrap();
        let events = record_events(&c);
        assert!(c.remove("1").is_some());
        assert!(c.remove("1").is_none());
        assert_eq!(vm.listener_count(), 0);
        assert_eq!(*events.borrow(), vec!["remove 1".to_string()]);
    }

    #[test]
    fn test_terminal_status_removes_member() {
        let c = vms();
        let vm = c.add(json!({"id": 1, "status": "ACTIVE"})).unwrap();
        vm.set_one("status", json!("deleted")).unwrap();
        assert!(c.is_empty());
    }

    #[test]
    fn test_standalone_entity_not_removed() {
        let vm = Entity::new(
            models::schema_for(Kind::VirtualMachine).unwrap(),
            json!({"id": 1, "status": "ACTIVE"}),
        )
        .unwrap();
        vm.set_one("status", json!("DELETED")).unwrap();
        assert_eq!(vm.get_str("status").unwrap(), "DELETED");
    }

    #[test]
    fn test_merge_is_idempotent() {
        let c = vms();
        let records = vec![
            json!({"id": 1, "name": "web", "status": "ACTIVE", "metadata": {"os": "debian"}}),
            json!({"id": 2, "name": "db", "status": "STOPPED"}),
        ];
        c.merge(records.clone(), true).unwrap();
        let before: Vec<EntityRef> = c.entities();
        let events = record_events(&c);

        let summary = c.merge(records, true).unwrap();
        assert_eq!(summary, FetchSummary::default());
        assert!(events.borrow().is_empty());
        for (a, b) in before.iter().zip(c.entities().iter()) {
            assert!(Rc::ptr_eq(a, b));
        }
    }

    #[test]
    fn test_merge_removes_missing() {
        let c = vms();
        c.merge(
            vec![json!({"id": "a"}), json!({"id": "b"}), json!({"id": "c"})],
            true,
        )
        .unwrap();
        let events = record_events(&c);

        let summary = c
            .merge(vec![json!({"id": "a"}), json!({"id": "c"})], true)
            .unwrap();
        assert_eq!(summary.removed, 1);
        assert_eq!(c.len(), 2);
        assert!(c.get("b").is_none());
        assert_eq!(*events.borrow(), vec!["remove b".to_string()]);
    }

    #[test]
    fn test_merge_without_remove_missing_keeps_members() {
        let c = vms();
        c.merge(vec![json!({"id": "a"}), json!({"id": "b"})], true)
            .unwrap();
        c.merge(vec![json!({"id": "a"})], false).unwrap();
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn test_merge_skips_deleted_newcomers() {
        let c = vms();
        let summary = c
            .merge(vec![json!({"id": 9, "status": "DELETED"})], true)
            .unwrap();
        assert_eq!(summary.added, 0);
        assert!(c.is_empty());
    }

    #[test]
    fn test_invalid_record_leaves_collection_untouched() {
        let c = vms();
        c.add(json!({"id": 1, "name": "web"})).unwrap();
        let result = c.merge(
            vec![json!({"id": 1, "name": "renamed"}), json!({"name": "no id"})],
            true,
        );
        assert!(result.is_err());
        assert_eq!(c.get("1").unwrap().get_str("name").unwrap(), "web");
    }

    #[test]
    fn test_member_changes_forwarded() {
        let c = vms();
        let vm = c.add(json!({"id": 1, "name": "web"})).unwrap();
        let events = record_events(&c);
        vm.set_one("name", json!("www")).unwrap();
        assert_eq!(*events.borrow(), vec!["change 1 name".to_string()]);
    }

    #[test]
    fn test_reset_replaces_members() {
        let c = vms();
        let old = c.add(json!({"id": 1})).unwrap();
        let events = record_events(&c);
        c.reset(vec![json!({"id": 2}), json!({"id": 3})]).unwrap();
        assert_eq!(c.len(), 2);
        assert_eq!(old.listener_count(), 0);
        assert_eq!(*events.borrow(), vec!["reset -1".to_string()]);
    }

    #[test]
    fn test_filter() {
        let c = vms();
        c.add(json!({"id": 1, "status": "ACTIVE"})).unwrap();
        c.add(json!({"id": 2, "status": "STOPPED"})).unwrap();
        let active = c.filter(|e| e.get_str("state").as_deref() == Some("ACTIVE"));
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id(), "1");
    }

    #[tokio::test]
    async fn test_fetch_merges_response() {
        let c = vms();
        let transport = ScriptedTransport::new();
        transport.push(
            Method::Get,
            "/servers/detail",
            servers(json!([{"id": 1, "status": "BUILD"}])),
        );
        transport.push(
            Method::Get,
            "/servers/detail",
            servers(json!([{"id": 1, "status": "ACTIVE"}, {"id": 2, "status": "BUILD"}])),
        );

        let first = c.fetch(transport.as_ref(), FetchOptions::full()).await.unwrap();
        assert_eq!(
            first,
            FetchOutcome::Applied(FetchSummary {
                added: 1,
                changed: 0,
                removed: 0
            })
        );
        let second = c.fetch(transport.as_ref(), FetchOptions::full()).await.unwrap();
        assert_eq!(
            second,
            FetchOutcome::Applied(FetchSummary {
                added: 1,
                changed: 1,
                removed: 0
            })
        );
        assert_eq!(c.get("1").unwrap().get_str("state").unwrap(), "ACTIVE");
        assert!(c.last_fetched().is_some());
        assert!(!c.is_fetching());
    }

    #[tokio::test]
    async fn test_fetch_error_leaves_collection_untouched() {
        let c = vms();
        c.add(json!({"id": 1})).unwrap();
        let transport = ScriptedTransport::new();
        transport.push(
            Method::Get,
            "/servers/detail",
            Err(Error::Transport("connection refused".into())),
        );
        let result = c.fetch(transport.as_ref(), FetchOptions::full()).await;
        assert!(matches!(result, Err(Error::Transport(_))));
        assert_eq!(c.len(), 1);
        assert!(c.last_fetched().is_none());
    }

    #[tokio::test]
    async fn test_stale_response_discarded() {
        let c = vms();
        let transport = ScriptedTransport::new();
        let gate = transport.push_gated(
            Method::Get,
            "/servers/detail",
            servers(json!([{"id": 1, "status": "BUILD"}])),
        );
        transport.push(
            Method::Get,
            "/servers/detail",
            servers(json!([{"id": 1, "status": "ACTIVE"}])),
        );

        let (older, newer, _) = tokio::join!(
            c.fetch(transport.as_ref(), FetchOptions::full()),
            c.fetch(transport.as_ref(), FetchOptions::full()),
            async { gate.notify_one() },
        );
        assert_eq!(older.unwrap(), FetchOutcome::Stale { generation: 1 });
        assert!(matches!(newer.unwrap(), FetchOutcome::Applied(_)));
        assert_eq!(c.get("1").unwrap().get_str("status").unwrap(), "ACTIVE");
    }

    #[tokio::test]
    async fn test_incremental_fetch_asks_for_changes() {
        let c = vms();
        let transport = ScriptedTransport::new();
        transport.push(
            Method::Get,
            "/servers/detail",
            servers(json!([{"id": 1}, {"id": 2}])),
        );
        transport.push(
            Method::Get,
            "/servers/detail",
            servers(json!([{"id": 2, "status": "DELETED"}])),
        );
        let options = FetchOptions {
            remove_missing: true,
            incremental: true,
            ..FetchOptions::default()
        };
        c.fetch(transport.as_ref(), options).await.unwrap();
        c.fetch(transport.as_ref(), options).await.unwrap();

        let requests = transport.requests();
        assert_eq!(requests[0].1, "/servers/detail");
        assert!(requests[1].1.starts_with("/servers/detail?changes-since="));
        // the delta does not list 1, yet it stays; 2 is gone through its status
        assert_eq!(c.ids(), vec!["1"]);
    }

    #[tokio::test]
    async fn test_fetch_null_body_is_empty() {
        let c = vms();
        c.add(json!({"id": 1})).unwrap();
        let transport = ScriptedTransport::new();
        transport.push(Method::Get, "/servers/detail", Ok(Value::Null));
        let outcome = c.fetch(transport.as_ref(), FetchOptions::full()).await.unwrap();
        assert_eq!(outcome, FetchOutcome::Applied(FetchSummary::default()));
        assert_eq!(c.len(), 1);
        assert!(c.last_fetched().is_some());
    }

    #[tokio::test]
    async fn test_unchanged_delta_advances_last_fetched() {
        let c = vms();
        let transport = ScriptedTransport::new();
        transport.push(
            Method::Get,
            "/servers/detail",
            servers(json!([{"id": 1}, {"id": 2}])),
        );
        transport.push(Method::Get, "/servers/detail", Ok(Value::Null));
        transport.push(Method::Get, "/servers/detail", Ok(Value::Null));
        let options = FetchOptions {
            remove_missing: true,
            incremental: true,
            ..FetchOptions::default()
        };
        c.fetch(transport.as_ref(), options).await.unwrap();
        let first = c.last_fetched().unwrap();
        for _ in 0..2 {
            let outcome = c.fetch(transport.as_ref(), options).await.unwrap();
            assert_eq!(outcome, FetchOutcome::Applied(FetchSummary::default()));
        }
        assert!(c.last_fetched().unwrap() >= first);
        assert_eq!(c.len(), 2);
    }
}
