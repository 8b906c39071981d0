//! Adaptive polling.
//!
//! [`PollerState`] holds the interval arithmetic and the overlap guard and
//! never touches a clock; [`Poller`] drives it with a local timer task.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

use futures::future::LocalBoxFuture;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::config::PollConfig;
use crate::error::{Error, Result};

/// What a timer tick turned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// A fetch was started.
    Fetch,
    /// The previous fetch is still running.
    Skip,
    /// The poller is stopped.
    Idle,
}

#[derive(Debug, Clone)]
pub struct PollerState {
    config: PollConfig,
    interval: Duration,
    fast_triggers: u32,
    idle_ticks: u32,
    in_flight: bool,
    running: bool,
    focused: bool,
}

impl PollerState {
    pub fn new(config: PollConfig) -> Self {
        Self {
            interval: config.base(),
            config,
            fast_triggers: 0,
            idle_ticks: 0,
            in_flight: false,
            running: false,
            focused: true,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn is_focused(&self) -> bool {
        self.focused
    }

    pub fn start(&mut self) {
        self.running = true;
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn on_tick(&mut self) -> Tick {
        if !self.running {
            return Tick::Idle;
        }
        if self.in_flight {
            return Tick::Skip;
        }
        self.in_flight = true;
        Tick::Fetch
    }

    /// The fetch started by the last `Tick::Fetch` finished.
    ///
    /// An accelerated interval relaxes back to the base interval by one step
    /// every `decay_after` quiet completions.
    pub fn on_complete(&mut self) {
        self.in_flight = false;
        if !self.focused || self.interval >= self.config.base() {
            return;
        }
        self.idle_ticks += 1;
        if self.idle_ticks >= self.config.decay_after.max(1) {
            self.idle_ticks = 0;
            self.set_interval((self.interval + self.config.step()).min(self.config.base()));
            if self.interval == self.config.base() {
                self.fast_triggers = 0;
            }
        }
    }

    /// Activity signal. Returns whether the interval changed.
    pub fn faster(&mut self) -> bool {
        self.idle_ticks = 0;
        self.fast_triggers += 1;
        if !self.focused || self.fast_triggers < self.config.accelerate_after {
            return false;
        }
        let before = self.interval;
        self.set_interval(self.interval / 2);
        self.interval != before
    }

    /// The console lost focus: poll as rarely as allowed.
    pub fn blur(&mut self) {
        self.focused = false;
        self.set_interval(self.config.max());
    }

    /// The console regained focus: back to the base interval.
    pub fn focus(&mut self) {
        self.focused = true;
        self.fast_triggers = 0;
        self.idle_ticks = 0;
        self.set_interval(self.config.base());
    }

    fn set_interval(&mut self, interval: Duration) {
        self.interval = interval.clamp(self.config.fast(), self.config.max());
    }
}

pub type FetchFn = Rc<dyn Fn() -> LocalBoxFuture<'static, Result<()>>>;
pub type ErrorSink = Rc<dyn Fn(Error)>;

/// Timer driver around [`PollerState`]. Must run inside a `LocalSet`.
pub struct Poller {
    name: String,
    state: RefCell<PollerState>,
    fetch: FetchFn,
    on_error: RefCell<Option<ErrorSink>>,
    wake: Notify,
    immediate: Cell<bool>,
    task: RefCell<Option<JoinHandle<()>>>,
    fetches: Cell<u64>,
    this: Weak<Poller>,
}

impl Poller {
    pub fn new(name: impl Into<String>, config: PollConfig, fetch: FetchFn) -> Rc<Self> {
        Rc::new_cyclic(|this| Poller {
            name: name.into(),
            state: RefCell::new(PollerState::new(config)),
            fetch,
            on_error: RefCell::new(None),
            wake: Notify::new(),
            immediate: Cell::new(false),
            task: RefCell::new(None),
            fetches: Cell::new(0),
            this: this.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Receives the error of every failed fetch.
    pub fn set_error_sink(&self, sink: ErrorSink) {
        *self.on_error.borrow_mut() = Some(sink);
    }

    pub fn interval(&self) -> Duration {
        self.state.borrow().interval()
    }

    pub fn is_running(&self) -> bool {
        self.state.borrow().is_running()
    }

    pub fn in_flight(&self) -> bool {
        self.state.borrow().in_flight()
    }

    /// Number of fetches started so far.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.get()
    }

    pub fn start(&self) {
        self.state.borrow_mut().start();
        if self.task.borrow().is_some() {
            return;
        }
        debug!("poller {}: started at {:?}", self.name, self.interval());
        let weak = self.this.clone();
        let handle = tokio::task::spawn_local(async move {
            loop {
                let Some(poller) = weak.upgrade() else {
                    break;
                };
                let interval = poller.interval();
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = poller.wake.notified() => {
                        if !poller.immediate.replace(false) {
                            // interval changed, sleep again with the new one
                            continue;
                        }
                    }
                }
                if poller.tick() == Tick::Idle {
                    break;
                }
            }
        });
        *self.task.borrow_mut() = Some(handle);
    }

    pub fn stop(&self) {
        self.state.borrow_mut().stop();
        if let Some(handle) = self.task.borrow_mut().take() {
            handle.abort();
            debug!("poller {}: stopped", self.name);
        }
    }

    /// Run one tick now, subject to the overlap guard.
    pub fn tick(&self) -> Tick {
        let tick = self.state.borrow_mut().on_tick();
        match tick {
            Tick::Fetch => {
                self.fetches.set(self.fetches.get() + 1);
                let Some(poller) = self.this.upgrade() else {
                    return Tick::Idle;
                };
                tokio::task::spawn_local(async move {
                    let result = (poller.fetch)().await;
                    poller.state.borrow_mut().on_complete();
                    if let Err(e) = result {
                        let sink = poller.on_error.borrow().clone();
                        match sink {
                            Some(sink) => sink(e),
                            None => debug!("poller {}: {}", poller.name, e),
                        }
                    }
                });
            }
            Tick::Skip => trace!("poller {}: previous fetch still running", self.name),
            Tick::Idle => {}
        }
        tick
    }

    pub fn faster(&self) {
        if self.state.borrow_mut().faster() {
            trace!("poller {}: interval {:?}", self.name, self.interval());
            self.wake.notify_one();
        }
    }

    pub fn blur(&self) {
        self.state.borrow_mut().blur();
        self.wake.notify_one();
    }

    /// Restore the base interval and tick immediately.
    pub fn focus(&self) {
        self.state.borrow_mut().focus();
        self.immediate.set(true);
        self.wake.notify_one();
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}
