//! Polling coordinators.
//!
//! A [`Coordinator`] owns one cached JSON payload and the [`Fetch`]
//! implementation that produces it. Entities subscribe to the coordinator
//! and re-read the payload through dotted paths whenever it notifies.
//!
//! Polling only starts once the first subscriber attaches. A failed poll
//! keeps the cached payload and backs off before trying again; a `304`
//! keeps the payload and counts as a success.

pub mod account;
pub mod action;
pub mod battery_charts;
pub mod battery_control;
pub mod charge_point;
pub mod debounce;
pub mod resource;
pub mod summary;
pub mod timer;

use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::sync::watch;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;
use zonneplan_api::ApiError;
use zonneplan_api::path;

pub use action::ActionError;
pub use action::ActionStatus;
pub use action::ProcessingRetry;
pub use action::RetryOptions;
use debounce::Debouncer;
use timer::ScheduledTask;

/// First retry delay after a failed poll; doubles per consecutive failure.
pub const BACKOFF_START: Duration = Duration::from_secs(60);

pub const DEFAULT_DEBOUNCE_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub name: String,
    pub update_interval: Duration,
    pub debounce_cooldown: Duration,
    /// Notify listeners at every top of the UTC hour without fetching.
    pub hourly_listener_refresh: bool,
}

impl CoordinatorOptions {
    pub fn new(name: impl Into<String>, update_interval: Duration) -> Self {
        Self {
            name: name.into(),
            update_interval,
            debounce_cooldown: DEFAULT_DEBOUNCE_COOLDOWN,
            hourly_listener_refresh: false,
        }
    }

    pub fn with_debounce_cooldown(mut self, cooldown: Duration) -> Self {
        self.debounce_cooldown = cooldown;
        self
    }

    pub fn with_hourly_listener_refresh(mut self) -> Self {
        self.hourly_listener_refresh = true;
        self
    }
}

/// What subscribers see.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorState {
    pub data: Option<Value>,
    pub last_update_success: bool,
    pub last_error: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Produces the payload of one coordinator.
#[async_trait]
pub trait Fetch: Send {
    /// Fetch a fresh payload. `Ok(None)` means nothing new (a `304` or an
    /// empty body) and keeps `previous` in place.
    async fn fetch(&mut self, previous: Option<Value>) -> Result<Option<Value>, ApiError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Updated,
    Retained,
    /// Nothing came back and nothing was cached before.
    Empty,
}

/// Raised by coordinators when the API rejected the credentials.
#[derive(Clone)]
pub struct AuthSignal {
    tx: Arc<watch::Sender<u64>>,
}

impl AuthSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    pub fn raise(&self) {
        self.tx.send_modify(|count| *count += 1);
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }
}

impl Default for AuthSignal {
    fn default() -> Self {
        Self::new()
    }
}

struct Inner {
    options: CoordinatorOptions,
    fetcher: Mutex<Box<dyn Fetch>>,
    state: watch::Sender<CoordinatorState>,
    auth: AuthSignal,
    debouncer: Debouncer,
    poller: ScheduledTask,
    hourly: ScheduledTask,
    activated: AtomicBool,
}

/// Handle to a polling coordinator. Clones share the same cache.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(options: CoordinatorOptions, fetcher: impl Fetch + 'static, auth: AuthSignal) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let weak = weak.clone();
            let debouncer = Debouncer::new(options.debounce_cooldown, false, move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        // Errors are recorded in the state by refresh itself.
                        let _ = Coordinator { inner }.refresh().await;
                    }
                }
            });

            let (state, _) = watch::channel(CoordinatorState::default());
            Inner {
                options,
                fetcher: Mutex::new(Box::new(fetcher)),
                state,
                auth,
                debouncer,
                poller: ScheduledTask::new(),
                hourly: ScheduledTask::new(),
                activated: AtomicBool::new(false),
            }
        });

        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.options.name
    }

    pub fn options(&self) -> &CoordinatorOptions {
        &self.inner.options
    }

    /// Attach a listener. The first subscriber starts interval polling. The
    /// first poll runs immediately unless the last refresh succeeded, in
    /// which case it waits one interval.
    pub fn subscribe(&self) -> watch::Receiver<CoordinatorState> {
        let rx = self.inner.state.subscribe();
        if !self.inner.activated.swap(true, Ordering::SeqCst) {
            let interval = self.inner.options.update_interval;
            let fresh = {
                let state = self.inner.state.borrow();
                state.data.is_some() && state.last_update_success
            };
            let first_poll = if fresh { interval } else { Duration::ZERO };
            info!(
                "Starting {} polling every {:?}, first poll in {:?}",
                self.inner.options.name, interval, first_poll
            );
            self.inner
                .poller
                .schedule(first_poll, poll_loop(Arc::downgrade(&self.inner)));
        }
        rx
    }

    pub fn is_active(&self) -> bool {
        self.inner.activated.load(Ordering::SeqCst)
    }

    /// Fetch now. Concurrent calls run one after the other.
    pub async fn refresh(&self) -> Result<RefreshOutcome, ApiError> {
        let mut fetcher = self.inner.fetcher.lock().await;
        let previous = self.inner.state.borrow().data.clone();
        let had_data = previous.is_some();

        let outcome = match fetcher.fetch(previous).await {
            Ok(Some(data)) => {
                debug!("{} updated", self.inner.options.name);
                self.inner.state.send_modify(|state| {
                    state.data = Some(data);
                    Self::mark_success(state);
                });
                RefreshOutcome::Updated
            }
            Ok(None) if had_data => {
                debug!("{} unchanged, keeping cached data", self.inner.options.name);
                self.inner.state.send_modify(Self::mark_success);
                RefreshOutcome::Retained
            }
            Ok(None) => {
                warn!("{} returned no data", self.inner.options.name);
                self.mark_failed("empty response".to_string());
                return Ok(RefreshOutcome::Empty);
            }
            Err(e) => {
                if e.is_auth_failure() {
                    error!("{} rejected credentials: {}", self.inner.options.name, e);
                    self.inner.auth.raise();
                } else {
                    warn!("{} update failed: {}", self.inner.options.name, e);
                }
                self.mark_failed(e.to_string());
                return Err(e);
            }
        };
        drop(fetcher);

        if self.inner.options.hourly_listener_refresh {
            schedule_listener_wake(&self.inner);
        }
        Ok(outcome)
    }

    fn mark_success(state: &mut CoordinatorState) {
        state.last_update_success = true;
        state.last_error = None;
        state.last_updated = Some(Utc::now());
    }

    fn mark_failed(&self, reason: String) {
        self.inner.state.send_modify(|state| {
            state.last_update_success = false;
            state.last_error = Some(reason);
        });
    }

    /// Debounced refresh: a burst of requests inside one cooldown window
    /// results in a single fetch at the end of the window.
    pub fn request_refresh(&self) {
        self.inner.debouncer.call();
    }

    pub fn state(&self) -> CoordinatorState {
        self.inner.state.borrow().clone()
    }

    pub fn data(&self) -> Option<Value> {
        self.inner.state.borrow().data.clone()
    }

    pub fn last_update_success(&self) -> bool {
        self.inner.state.borrow().last_update_success
    }

    /// Read a value from the cached payload.
    pub fn get_value(&self, value_path: &str) -> Option<Value> {
        let state = self.inner.state.borrow();
        state
            .data
            .as_ref()
            .and_then(|data| path::get(data, value_path))
            .cloned()
    }

    /// Write a value into the cached payload without notifying listeners.
    pub fn set_value(&self, value_path: &str, value: Value) -> bool {
        let mut changed = false;
        self.inner.state.send_if_modified(|state| {
            if let Some(data) = state.data.as_mut() {
                changed = path::set(data, value_path, value);
            }
            false
        });
        changed
    }

    /// Mutate the cached payload and notify listeners. Returns false when
    /// there is no payload yet.
    pub fn update(&self, f: impl FnOnce(&mut Value)) -> bool {
        self.inner.state.send_if_modified(|state| match state.data.as_mut() {
            Some(data) => {
                f(data);
                true
            }
            None => false,
        })
    }

    /// Notify listeners without touching the payload.
    pub fn update_listeners(&self) {
        self.inner.state.send_modify(|_| {});
    }

    /// Stop polling and cancel every pending timer.
    pub fn shutdown(&self) {
        debug!("Shutting down {}", self.inner.options.name);
        self.inner.poller.cancel();
        self.inner.hourly.cancel();
        self.inner.debouncer.cancel();
    }
}

async fn poll_loop(inner: Weak<Inner>) {
    let mut failures: u32 = 0;
    loop {
        let Some(strong) = inner.upgrade() else {
            return;
        };
        let coordinator = Coordinator { inner: strong };
        let interval = coordinator.inner.options.update_interval;

        let delay = match coordinator.refresh().await {
            Ok(RefreshOutcome::Updated | RefreshOutcome::Retained) => {
                failures = 0;
                interval
            }
            Err(e) if e.is_auth_failure() => interval,
            Ok(RefreshOutcome::Empty) | Err(_) => {
                failures += 1;
                let delay = backoff(failures, interval);
                debug!(
                    "{} failed {} time(s), retrying in {:?}",
                    coordinator.name(),
                    failures,
                    delay
                );
                delay
            }
        };
        drop(coordinator);

        tokio::time::sleep(delay).await;
    }
}

fn backoff(failures: u32, interval: Duration) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    BACKOFF_START.saturating_mul(1 << exponent).min(interval)
}

fn schedule_listener_wake(inner: &Arc<Inner>) {
    let delay = until_next_hour(Utc::now());
    let weak = Arc::downgrade(inner);
    inner.hourly.schedule(delay, async move {
        if let Some(inner) = weak.upgrade() {
            debug!("Hourly listener refresh for {}", inner.options.name);
            inner.state.send_modify(|_| {});
            schedule_listener_wake(&inner);
        }
    });
}

fn until_next_hour(now: DateTime<Utc>) -> Duration {
    let into_hour = u64::try_from(now.timestamp().rem_euclid(3600)).unwrap_or(0);
    let elapsed =
        Duration::from_secs(into_hour) + Duration::from_nanos(u64::from(now.timestamp_subsec_nanos()));
    Duration::from_secs(3600).saturating_sub(elapsed)
}
