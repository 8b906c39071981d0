//! Cross-entity reference resolution.
//!
//! A reference attribute (a VM's `flavor`, a volume's `server_id`) holds the
//! id of an entity in another collection. The resolver binds it to that
//! entity when it is present and otherwise records a pending resolution
//! keyed by `(kind, id)`, satisfied synchronously when the target collection
//! adds the id. While bound, every commit on the target is re-emitted on the
//! referrer as a change of the reference attribute.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use tracing::trace;

use crate::collection::{Collection, CollectionEvent};
use crate::entity::{Binding, Entity, EntityEvent, EntityRef, ListenerId};
use crate::schema::{Kind, Reference, id_string};

type Referrers = Vec<(Weak<Entity>, &'static str)>;

pub struct Resolver {
    collections: RefCell<HashMap<Kind, Weak<Collection>>>,
    /// Referrers waiting for `(kind, id)` to appear.
    pending: RefCell<HashMap<(Kind, String), Referrers>>,
    /// Referrers currently bound to `(kind, id)`.
    bound: RefCell<HashMap<(Kind, String), Referrers>>,
    subscriptions: RefCell<Vec<(Weak<Collection>, ListenerId)>>,
    this: Weak<Resolver>,
}

impl Resolver {
    pub fn new() -> Rc<Self> {
        Rc::new_cyclic(|this| Resolver {
            collections: RefCell::new(HashMap::new()),
            pending: RefCell::new(HashMap::new()),
            bound: RefCell::new(HashMap::new()),
            subscriptions: RefCell::new(Vec::new()),
            this: this.clone(),
        })
    }

    /// Track `collection` both as a source of targets and of referrers.
    pub fn register(&self, collection: &Rc<Collection>) {
        let kind = collection.kind();
        self.collections
            .borrow_mut()
            .insert(kind, Rc::downgrade(collection));

        let weak = self.this.clone();
        let listener = collection.on(move |event| {
            if let Some(resolver) = weak.upgrade() {
                resolver.on_collection_event(kind, event);
            }
        });
        self.subscriptions
            .borrow_mut()
            .push((Rc::downgrade(collection), listener));

        for entity in collection.entities() {
            self.satisfy(kind, &entity);
            self.resolve(&entity);
        }
    }

    /// Resolve every reference attribute of `entity`.
    pub fn resolve(&self, entity: &EntityRef) {
        for reference in entity.schema().references() {
            self.resolve_attr(entity, *reference);
        }
    }

    /// Number of unresolved references.
    pub fn pending_count(&self) -> usize {
        self.pending.borrow().values().map(Vec::len).sum()
    }

    /// Whether some referrer is waiting for `(kind, id)`.
    pub fn is_pending(&self, kind: Kind, id: &str) -> bool {
        self.pending
            .borrow()
            .get(&(kind, id.to_string()))
            .is_some_and(|r| !r.is_empty())
    }

    /// Remove every listener the resolver registered.
    pub fn detach(&self) {
        for (collection, listener) in self.subscriptions.borrow_mut().drain(..) {
            if let Some(collection) = collection.upgrade() {
                collection.off(listener);
            }
        }
        let bound: Vec<Referrers> = self.bound.borrow_mut().drain().map(|(_, r)| r).collect();
        for (referrer, attr) in bound.into_iter().flatten() {
            if let Some(referrer) = referrer.upgrade()
                && let Some(binding) = referrer.unbind_related(attr)
                && let Some(target) = binding.target.upgrade()
            {
                target.off(binding.listener);
            }
        }
        self.pending.borrow_mut().clear();
    }

    fn on_collection_event(&self, kind: Kind, event: &CollectionEvent) {
        match event {
            CollectionEvent::Add(entity) => {
                self.satisfy(kind, entity);
                self.resolve(entity);
            }
            CollectionEvent::Change { entity, keys } => {
                for reference in entity.schema().references() {
                    if keys.iter().any(|k| k == reference.attr) {
                        self.resolve_attr(entity, *reference);
                    }
                }
            }
            CollectionEvent::Remove(entity) => {
                self.forget_referrer(entity);
                self.release_target(entity);
            }
            CollectionEvent::Reset { dropped } => {
                for entity in dropped {
                    self.forget_referrer(entity);
                    self.release_target(entity);
                }
                if let Some(collection) = self.collection(kind) {
                    for entity in collection.entities() {
                        self.satisfy(kind, &entity);
                        self.resolve(&entity);
                    }
                }
            }
            CollectionEvent::Entity { .. } | CollectionEvent::Sort => {}
        }
    }

    fn collection(&self, kind: Kind) -> Option<Rc<Collection>> {
        self.collections.borrow().get(&kind).and_then(Weak::upgrade)
    }

    fn lookup(&self, kind: Kind, id: &str) -> Option<EntityRef> {
        self.collection(kind)?.get(id)
    }

    fn resolve_attr(&self, entity: &EntityRef, reference: Reference) {
        let attr = reference.attr;
        let id = entity.get(attr).as_ref().and_then(id_string);
        let current = entity.related(attr);
        if let (Some(id), Some(current)) = (&id, &current)
            && current.id() == id
        {
            return;
        }

        self.unbind(entity, attr);
        let Some(id) = id else {
            if current.is_some() {
                entity.emit_related_change(attr);
            }
            return;
        };
        match self.lookup(reference.target, &id) {
            Some(target) => self.bind(entity, attr, &target),
            None => {
                trace!(
                    "{} {}: {} {} pending",
                    entity.kind(),
                    entity.id(),
                    reference.target,
                    id
                );
                self.pending
                    .borrow_mut()
                    .entry((reference.target, id))
                    .or_default()
                    .push((Rc::downgrade(entity), attr));
            }
        }
    }

    fn bind(&self, referrer: &EntityRef, attr: &'static str, target: &EntityRef) {
        let weak_referrer = Rc::downgrade(referrer);
        let listener = target.on(move |_, event| {
            if let EntityEvent::Change { .. } = event
                && let Some(referrer) = weak_referrer.upgrade()
            {
                referrer.emit_related_change(attr);
            }
        });
        referrer.bind_related(
            attr,
            Binding {
                target: Rc::downgrade(target),
                listener,
            },
        );
        self.bound
            .borrow_mut()
            .entry((target.kind(), target.id().to_string()))
            .or_default()
            .push((Rc::downgrade(referrer), attr));
        trace!(
            "{} {}: {} bound to {} {}",
            referrer.kind(),
            referrer.id(),
            attr,
            target.kind(),
            target.id()
        );
        referrer.emit_related_change(attr);
    }

    /// Drop the binding and any pending entry of `(referrer, attr)`.
    fn unbind(&self, referrer: &EntityRef, attr: &'static str) {
        if let Some(binding) = referrer.unbind_related(attr)
            && let Some(target) = binding.target.upgrade()
        {
            target.off(binding.listener);
            self.drop_referrer(&self.bound, target.kind(), target.id(), referrer, Some(attr));
        }
        let mut pending = self.pending.borrow_mut();
        for referrers in pending.values_mut() {
            referrers.retain(|(r, a)| !(*a == attr && is_same(r, referrer)));
        }
        pending.retain(|_, r| !r.is_empty());
    }

    fn satisfy(&self, kind: Kind, target: &EntityRef) {
        let waiting = self
            .pending
            .borrow_mut()
            .remove(&(kind, target.id().to_string()));
        for (referrer, attr) in waiting.into_iter().flatten() {
            if let Some(referrer) = referrer.upgrade() {
                self.bind(&referrer, attr, target);
            }
        }
    }

    /// A removed entity no longer waits for or listens to anything.
    fn forget_referrer(&self, entity: &EntityRef) {
        for (_, binding) in entity.take_bindings() {
            if let Some(target) = binding.target.upgrade() {
                target.off(binding.listener);
                self.drop_referrer(&self.bound, target.kind(), target.id(), entity, None);
            }
        }
        let mut pending = self.pending.borrow_mut();
        for referrers in pending.values_mut() {
            referrers.retain(|(r, _)| !is_same(r, entity));
        }
        pending.retain(|_, r| !r.is_empty());
    }

    /// Referrers bound to a removed entity go back to pending.
    fn release_target(&self, target: &EntityRef) {
        let referrers = self
            .bound
            .borrow_mut()
            .remove(&(target.kind(), target.id().to_string()));
        for (referrer, attr) in referrers.into_iter().flatten() {
            let Some(referrer) = referrer.upgrade() else {
                continue;
            };
            if let Some(binding) = referrer.unbind_related(attr) {
                target.off(binding.listener);
            }
            self.pending
                .borrow_mut()
                .entry((target.kind(), target.id().to_string()))
                .or_default()
                .push((Rc::downgrade(&referrer), attr));
            referrer.emit_related_change(attr);
        }
    }

    fn drop_referrer(
        &self,
        map: &RefCell<HashMap<(Kind, String), Referrers>>,
        kind: Kind,
        id: &str,
        referrer: &EntityRef,
        attr: Option<&'static str>,
    ) {
        let mut map = map.borrow_mut();
        let key = (kind, id.to_string());
        if let Some(referrers) = map.get_mut(&key) {
            referrers.retain(|(r, a)| !(is_same(r, referrer) && attr.is_none_or(|x| x == *a)));
            if referrers.is_empty() {
                map.remove(&key);
            }
        }
    }
}

fn is_same(weak: &Weak<Entity>, entity: &EntityRef) -> bool {
    std::ptr::eq(weak.as_ptr(), Rc::as_ptr(entity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;
    use serde_json::json;
    use std::cell::Cell;

    fn setup() -> (Rc<Resolver>, Rc<Collection>, Rc<Collection>) {
        let resolver = Resolver::new();
        let flavors = Collection::for_kind(Kind::Flavor, Envelope::Current).unwrap();
        let vms = Collection::for_kind(Kind::VirtualMachine, Envelope::Current).unwrap();
        resolver.register(&flavors);
        resolver.register(&vms);
        (resolver, flavors, vms)
    }

    fn count_changes(entity: &EntityRef, key: &'static str) -> Rc<Cell<usize>> {
        let hits = Rc::new(Cell::new(0));
        let counter = hits.clone();
        entity.on_change(key, move |_, _| counter.set(counter.get() + 1));
        hits
    }

    #[test]
    fn test_reference_bound_when_target_present() {
        let (_resolver, flavors, vms) = setup();
        flavors.add(json!({"id": 3, "ram": 2048})).unwrap();
        let vm = vms.add(json!({"id": 1, "flavor": {"id": 3}})).unwrap();
        assert_eq!(vm.related("flavor").unwrap().id(), "3");
    }

    #[test]
    fn test_pending_resolution_bound_on_add() {
        let (resolver, flavors, vms) = setup();
        let vm = vms.add(json!({"id": 1, "flavor": 3})).unwrap();
        assert!(vm.related("flavor").is_none());
        assert!(resolver.is_pending(Kind::Flavor, "3"));

        let hits = count_changes(&vm, "flavor");
        flavors.add(json!({"id": 3, "ram": 2048})).unwrap();
        assert_eq!(vm.related("flavor").unwrap().id(), "3");
        assert_eq!(hits.get(), 1);
        assert_eq!(resolver.pending_count(), 0);
    }

    #[test]
    fn test_target_change_reemitted_on_referrer() {
        let (_resolver, flavors, vms) = setup();
        let flavor = flavors.add(json!({"id": 3, "ram": 2048})).unwrap();
        let vm = vms.add(json!({"id": 1, "flavor": 3})).unwrap();
        let hits = count_changes(&vm, "flavor");
        flavor.set_one("ram", json!(4096)).unwrap();
        assert_eq!(hits.get(), 1);
        assert_eq!(vm.related("flavor").unwrap().get_f64("ram"), Some(4096.0));
    }

    #[test]
    fn test_reference_rebinds_on_change() {
        let (_resolver, flavors, vms) = setup();
        let small = flavors.add(json!({"id": 1})).unwrap();
        flavors.add(json!({"id": 2})).unwrap();
        let vm = vms.add(json!({"id": 9, "flavor": 1})).unwrap();
        vm.set_one("flavor", json!(2)).unwrap();
        assert_eq!(vm.related("flavor").unwrap().id(), "2");
        assert_eq!(small.listener_count(), 1);
    }

    #[test]
    fn test_target_removal_returns_to_pending() {
        let (resolver, flavors, vms) = setup();
        flavors.add(json!({"id": 3})).unwrap();
        let vm = vms.add(json!({"id": 1, "flavor": 3})).unwrap();
        flavors.remove("3");
        assert!(vm.related("flavor").is_none());
        assert!(resolver.is_pending(Kind::Flavor, "3"));
        assert_eq!(resolver.pending_count(), 1);

        flavors.add(json!({"id": 3})).unwrap();
        assert_eq!(vm.related("flavor").unwrap().id(), "3");
    }

    #[test]
    fn test_removed_referrer_stops_waiting() {
        let (resolver, _flavors, vms) = setup();
        vms.add(json!({"id": 1, "flavor": 3})).unwrap();
        assert_eq!(resolver.pending_count(), 1);
        vms.remove("1");
        assert_eq!(resolver.pending_count(), 0);
    }

    #[test]
    fn test_reset_target_rebinds_referrers() {
        let (resolver, flavors, vms) = setup();
        let old = flavors.add(json!({"id": 3, "ram": 2048})).unwrap();
        let vm = vms.add(json!({"id": 1, "flavor": 3})).unwrap();

        flavors.reset(vec![json!({"id": 3, "ram": 4096})]).unwrap();
        let related = vm.related("flavor").unwrap();
        assert!(!Rc::ptr_eq(&related, &old));
        assert_eq!(related.get_f64("ram"), Some(4096.0));
        assert_eq!(old.listener_count(), 0);
        assert_eq!(resolver.pending_count(), 0);

        flavors.reset(vec![json!({"id": 4})]).unwrap();
        assert!(vm.related("flavor").is_none());
        assert!(resolver.is_pending(Kind::Flavor, "3"));
    }

    #[test]
    fn test_reset_referrers_forgotten() {
        let (resolver, flavors, vms) = setup();
        let flavor = flavors.add(json!({"id": 3})).unwrap();
        let before = flavor.listener_count();
        vms.add(json!({"id": 1, "flavor": 3})).unwrap();
        vms.add(json!({"id": 2, "flavor": 8})).unwrap();

        vms.reset(Vec::new()).unwrap();
        assert_eq!(flavor.listener_count(), before);
        assert_eq!(resolver.pending_count(), 0);
    }

    #[test]
    fn test_detach_releases_targets() {
        let (resolver, flavors, vms) = setup();
        let flavor = flavors.add(json!({"id": 3})).unwrap();
        let before = flavor.listener_count();
        vms.add(json!({"id": 1, "flavor": 3})).unwrap();
        assert_eq!(flavor.listener_count(), before + 1);
        resolver.detach();
        assert_eq!(flavor.listener_count(), before);
    }
}
