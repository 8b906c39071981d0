//! Application context.
//!
//! Owns every collection, the resolver, the ledger, the pollers, the
//! transport and the notice channel. Build one per session and hand it to
//! whatever drives the console.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};

use futures::future::join_all;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::collection::{Collection, FetchOptions, FetchOutcome};
use crate::config::ModelConfig;
use crate::entity::{EntityEvent, EntityRef};
use crate::error::{Error, Result};
use crate::ledger::{self, Ledger};
use crate::notice::Notice;
use crate::poller::{FetchFn, Poller};
use crate::resolve::Resolver;
use crate::schema::Kind;
use crate::transport::{HttpTransport, Method, Transport};
use crate::vm::Action;

const NOTICE_CAPACITY: usize = 64;

pub struct Context {
    config: ModelConfig,
    transport: Rc<dyn Transport>,
    /// One collection per kind, in `Kind::ALL` order.
    collections: Vec<Rc<Collection>>,
    resolver: Rc<Resolver>,
    ledger: Rc<Ledger>,
    pollers: RefCell<BTreeMap<Kind, Rc<Poller>>>,
    notices: broadcast::Sender<Notice>,
    session_ended: Cell<bool>,
    this: Weak<Context>,
}

impl Context {
    pub fn new(config: ModelConfig, transport: Rc<dyn Transport>) -> Result<Rc<Self>> {
        let collections = Kind::ALL
            .iter()
            .map(|&kind| Collection::for_kind(kind, config.envelope))
            .collect::<Result<Vec<_>>>()?;

        let resolver = Resolver::new();
        for collection in &collections {
            resolver.register(collection);
        }
        let ledger = Ledger::new();
        ledger.watch(&collections[Kind::VirtualMachine as usize]);

        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Ok(Rc::new_cyclic(|this| Context {
            config,
            transport,
            collections,
            resolver,
            ledger,
            pollers: RefCell::new(BTreeMap::new()),
            notices,
            session_ended: Cell::new(false),
            this: this.clone(),
        }))
    }

    /// Context talking HTTP to `config.api_url`.
    pub fn with_http(config: ModelConfig) -> Result<Rc<Self>> {
        let transport = Rc::new(HttpTransport::new(
            config.api_url.clone(),
            config.token.clone(),
        ));
        Self::new(config, transport)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn transport(&self) -> &Rc<dyn Transport> {
        &self.transport
    }

    pub fn collection(&self, kind: Kind) -> &Rc<Collection> {
        &self.collections[kind as usize]
    }

    pub fn vms(&self) -> &Rc<Collection> {
        self.collection(Kind::VirtualMachine)
    }

    pub fn resolver(&self) -> &Rc<Resolver> {
        &self.resolver
    }

    pub fn ledger(&self) -> &Rc<Ledger> {
        &self.ledger
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    /// Whether the API rejected our credentials.
    pub fn is_session_ended(&self) -> bool {
        self.session_ended.get()
    }

    fn publish(&self, notice: Notice) {
        if notice.is_unauthorized() {
            self.session_ended.set(true);
        }
        // no subscriber is fine
        let _ = self.notices.send(notice);
    }

    /// VM by id, or by name when no id matches.
    pub fn find_vm(&self, key: &str) -> Result<EntityRef> {
        let vms = self.vms();
        if let Some(vm) = vms.get(key) {
            return Ok(vm);
        }
        vms.filter(|vm| vm.get_str("name").as_deref() == Some(key))
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("server {}", key)))
    }

    /// Options used by the poller of `kind`.
    pub fn poll_options(&self, kind: Kind) -> FetchOptions {
        FetchOptions {
            remove_missing: true,
            critical: false,
            incremental: kind == Kind::VirtualMachine && self.config.incremental,
        }
    }

    /// Fetch one collection. Critical and unauthorized failures are published
    /// as notices.
    pub async fn fetch(&self, kind: Kind, options: FetchOptions) -> Result<FetchOutcome> {
        let collection = self.collection(kind).clone();
        let result = collection.fetch(self.transport.as_ref(), options).await;
        if let Err(e) = &result
            && (options.critical || matches!(e, Error::Unauthorized))
        {
            self.publish(Notice::from_error(kind.as_str(), e));
        }
        result
    }

    /// Fetch every collection concurrently.
    pub async fn fetch_all(&self) -> Vec<(Kind, Result<FetchOutcome>)> {
        let fetches = Kind::ALL.iter().map(|&kind| async move {
            let options = FetchOptions {
                critical: true,
                ..FetchOptions::full()
            };
            (kind, self.fetch(kind, options).await)
        });
        join_all(fetches).await
    }

    /// Start a poller for each of `kinds`. Must run inside a `LocalSet`.
    pub fn start_polling(&self, kinds: &[Kind]) {
        for &kind in kinds {
            if let Some(poller) = self.pollers.borrow().get(&kind) {
                poller.start();
                continue;
            }
            let weak = self.this.clone();
            let fetch: FetchFn = Rc::new(move || {
                let weak = weak.clone();
                Box::pin(async move {
                    let Some(context) = weak.upgrade() else {
                        return Ok(());
                    };
                    let options = context.poll_options(kind);
                    context.fetch(kind, options).await.map(|_| ())
                })
            });
            let poller = Poller::new(kind.as_str(), self.config.poll.clone(), fetch);
            poller.set_error_sink(Rc::new(move |e| {
                warn!("polling {} failed: {}", kind, e);
            }));
            poller.start();
            self.pollers.borrow_mut().insert(kind, poller);
        }
    }

    pub fn stop_polling(&self) {
        let pollers = std::mem::take(&mut *self.pollers.borrow_mut());
        for poller in pollers.values() {
            poller.stop();
        }
    }

    pub fn poller(&self, kind: Kind) -> Option<Rc<Poller>> {
        self.pollers.borrow().get(&kind).cloned()
    }

    pub fn blur(&self) {
        for poller in self.pollers.borrow().values() {
            poller.blur();
        }
    }

    pub fn focus(&self) {
        for poller in self.pollers.borrow().values() {
            poller.focus();
        }
    }

    /// Record `action` as pending for `vm` on behalf of `view`.
    pub fn set_pending(&self, vm: &EntityRef, action: Action, view: &str) -> Result<()> {
        self.ledger.set_pending(vm, action, view)
    }

    /// Invoke `action` on `vm`.
    ///
    /// The optimistic state is applied before the request is sent and is
    /// kept if the request fails; the failure is recorded in `action_error`.
    pub async fn call(&self, vm: &EntityRef, action: Action) -> Result<()> {
        if vm.kind() != Kind::VirtualMachine {
            return Err(Error::InvalidTarget(format!("{} {}", vm.kind(), vm.id())));
        }
        if !ledger::offers(vm, &action) {
            return Err(Error::ActionNotAllowed {
                action: action.name().to_string(),
                state: vm.get_str("state").unwrap_or_default(),
            });
        }

        let optimistic = action.optimistic_attrs(vm.get("metadata").as_ref());
        if !optimistic.is_empty() {
            vm.set(optimistic)?;
        }
        if let Some(poller) = self.poller(Kind::VirtualMachine) {
            poller.faster();
        }

        info!("server {}: {}", vm.id(), action);
        let (method, path, body) = action.request(vm.id());
        match self.transport.request(method, &path, body).await {
            Ok(response) => {
                vm.set_one("action_error", Value::Null)?;
                self.ledger.clear_pending(vm.id());
                match &action {
                    Action::Destroy => self.release_quota(vm),
                    Action::Console => {
                        if let Some(console) = response.get("console") {
                            vm.set_one("console", console.clone())?;
                        }
                    }
                    _ => {}
                }
                Ok(())
            }
            Err(e) => {
                let reason = e.to_string();
                warn!("server {}: {} failed: {}", vm.id(), action, reason);
                vm.set_one("action_error", json!({"action": action.name(), "reason": reason}))?;
                vm.emit(EntityEvent::ActionFail {
                    action: action.name().to_string(),
                    reason,
                });
                self.publish(
                    Notice::action(format!("servers/{}/{}", vm.id(), action.name()), &e)
                        .with_details(format!("{} {}", method.as_str(), path)),
                );
                Err(e)
            }
        }
    }

    /// Invoke every pending action concurrently and empty the ledger.
    ///
    /// Returns the outcome per VM id; one failure does not stop the others.
    pub async fn confirm_all(&self) -> Vec<(String, Result<()>)> {
        let entries = self.ledger.entries();
        let calls = entries.into_iter().map(|entry| async move {
            let id = entry.entity.id().to_string();
            let result = self.call(&entry.entity, entry.action).await;
            (id, result)
        });
        let results = join_all(calls).await;
        self.ledger.take_all();
        results
    }

    /// Create a VM and add it to the collection right away.
    pub async fn create_vm(&self, name: &str, image: &str, flavor: &str) -> Result<EntityRef> {
        let body = json!({"server": {"name": name, "imageRef": image, "flavorRef": flavor}});
        let response = match self
            .transport
            .request(Method::Post, "/servers", Some(body))
            .await
        {
            Ok(response) => response,
            Err(e) => {
                self.publish(Notice::from_error("servers", &e));
                return Err(e);
            }
        };
        let record = response
            .get("server")
            .cloned()
            .ok_or_else(|| Error::Parse("create response without 'server'".to_string()))?;
        let vm = self.vms().add(record)?;
        self.claim_quota(&vm);
        info!("server {}: created", vm.id());
        Ok(vm)
    }

    /// Refresh the `stats` attribute of `vm`. On failure the previous
    /// snapshot stays in place.
    pub async fn refresh_stats(&self, vm: &EntityRef) -> Result<()> {
        let path = format!("/servers/{}/stats", vm.id());
        match self.transport.request(Method::Get, &path, None).await {
            Ok(response) => {
                let stats = response.get("stats").cloned().unwrap_or(response);
                vm.set_one("stats", stats)?;
                Ok(())
            }
            Err(e) => {
                debug!("server {}: stats unavailable: {}", vm.id(), e);
                if matches!(e, Error::Unauthorized) {
                    self.publish(Notice::from_error(path, &e));
                }
                Err(e)
            }
        }
    }

    /// Add `delta` to the usage of quota `resource`, never below zero.
    pub fn adjust_quota(&self, resource: &str, delta: f64) {
        let Some(quota) = self.collection(Kind::Quota).get(resource) else {
            return;
        };
        let usage = (quota.get_f64("usage").unwrap_or(0.0) + delta).max(0.0);
        if let Err(e) = quota.set_one("usage", Value::from(usage)) {
            warn!("quota {}: {}", resource, e);
        }
    }

    fn flavor_size(vm: &EntityRef) -> (f64, f64) {
        vm.related("flavor")
            .map(|f| {
                (
                    f.get_f64("vcpus").unwrap_or(0.0),
                    f.get_f64("ram").unwrap_or(0.0),
                )
            })
            .unwrap_or((0.0, 0.0))
    }

    fn release_quota(&self, vm: &EntityRef) {
        let (cpu, ram) = Self::flavor_size(vm);
        self.adjust_quota("vm", -1.0);
        self.adjust_quota("cpu", -cpu);
        self.adjust_quota("ram", -ram);
    }

    fn claim_quota(&self, vm: &EntityRef) {
        let (cpu, ram) = Self::flavor_size(vm);
        self.adjust_quota("vm", 1.0);
        self.adjust_quota("cpu", cpu);
        self.adjust_quota("ram", ram);
    }

    /// Stop the pollers and remove every listener the context registered.
    pub fn shutdown(&self) {
        self.stop_polling();
        self.ledger.detach();
        self.resolver.detach();
        for collection in &self.collections {
            collection.detach();
        }
        debug!("context shut down");
    }
}
