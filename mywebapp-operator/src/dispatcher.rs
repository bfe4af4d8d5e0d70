use crate::{
    errors::ControllerError,
    retry::RetryPolicy,
    utils::{metric_name, NamespacedName},
    watch::{EventKind, WatchEvent},
};
use dashmap::{mapref::entry::Entry, DashMap};
use futures::{future::BoxFuture, FutureExt};
use opentelemetry::{
    global,
    metrics::{Counter, Meter},
    KeyValue,
};
use std::{
    any::Any,
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::{sync::Semaphore, time::sleep};

const DISPATCHER: &'static str = "dispatcher";

pub(crate) type HandlerFuture = BoxFuture<'static, Result<(), ControllerError>>;

/// Handles one logical event for one identity.
pub(crate) type Handler = Arc<dyn Fn(WatchEvent) -> HandlerFuture + Send + Sync>;

/// Explicit mapping from event kind to handler, built once at startup.
#[derive(Clone, Default)]
pub(crate) struct HandlerTable {
    handlers: HashMap<EventKind, Handler>,
}

impl HandlerTable {
    pub fn register(mut self, kind: EventKind, handler: Handler) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    fn get(&self, kind: EventKind) -> Option<Handler> {
        self.handlers.get(&kind).cloned()
    }
}

/// Per-identity bookkeeping. An entry exists only while the identity has work
/// in flight, queued or scheduled for retry.
#[derive(Default)]
struct Slot {
    in_flight: bool,
    /// The latest event that arrived while a handler was running; it
    /// supersedes any earlier queued event.
    pending: Option<(WatchEvent, u64)>,
    /// Sequence number of the newest accepted event. Retries of older input
    /// are dropped.
    latest_seq: u64,
    latest_kind: Option<EventKind>,
    attempts: u32,
    retries_scheduled: u32,
}

impl Slot {
    fn is_idle(&self) -> bool {
        !self.in_flight && self.pending.is_none() && self.retries_scheduled == 0
    }
}

struct Inner {
    handlers: HandlerTable,
    slots: DashMap<NamespacedName, Slot>,
    sequence: AtomicU64,
    workers: Semaphore,
    retry: RetryPolicy,
    dispatched: Counter<u64>,
    coalesced: Counter<u64>,
    retries: Counter<u64>,
    panics: Counter<u64>,
}

/// Routes events to handlers: at most one handler runs per identity at any
/// time, distinct identities run concurrently up to the worker limit.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(handlers: HandlerTable, workers: usize, retry: RetryPolicy) -> Self {
        let meter: Meter = global::meter(DISPATCHER);
        let dispatched = meter
            .u64_counter(metric_name("events_dispatched"))
            .with_description("Count of events accepted by the dispatcher")
            .build();
        let coalesced = meter
            .u64_counter(metric_name("events_coalesced"))
            .with_description("Count of queued events superseded by a newer event for the same object")
            .build();
        let retries = meter
            .u64_counter(metric_name("retries_scheduled"))
            .with_description("Count of reconcile retries scheduled after transient failures")
            .build();
        let panics = meter
            .u64_counter(metric_name("handler_panics"))
            .with_description("Count of event handler invocations that panicked")
            .build();
        Self {
            inner: Arc::new(Inner {
                handlers,
                slots: Default::default(),
                sequence: AtomicU64::new(0),
                workers: Semaphore::new(workers.max(1)),
                retry,
                dispatched,
                coalesced,
                retries,
                panics,
            }),
        }
    }

    /// Hand an event to its identity's worker, starting one if none is running.
    pub fn dispatch(&self, event: WatchEvent) {
        if !event.key.is_valid() {
            error!(
                "dropping {} event without namespace or name: {:?}",
                event.kind, event.key
            );
            return;
        }
        let seq = self.inner.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let start = {
            let mut slot = self.inner.slots.entry(event.key.clone()).or_default();
            if event.kind == EventKind::Sync
                && (slot.pending.is_some() || slot.latest_kind == Some(EventKind::Delete))
            {
                // A resync snapshot never supersedes a real watch event.
                debug!("ignoring {} of {}, newer event queued", event.kind, event.key);
                return;
            }
            slot.latest_seq = seq;
            slot.latest_kind = Some(event.kind);
            slot.attempts = 0;
            if slot.in_flight {
                if let Some((superseded, _)) = slot.pending.replace((event.clone(), seq)) {
                    debug!(
                        "coalesced {} of {}@{} into {}@{}",
                        superseded.kind,
                        superseded.key,
                        superseded.revision,
                        event.kind,
                        event.revision
                    );
                    self.inner.coalesced.add(1, &[]);
                }
                false
            } else {
                slot.in_flight = true;
                true
            }
        };
        self.inner
            .dispatched
            .add(1, &[KeyValue::new("kind", event.kind.to_string())]);
        if start {
            self.spawn_worker(event, seq);
        }
    }

    /// Whether no identity has work in flight, queued or scheduled for retry.
    pub fn is_idle(&self) -> bool {
        self.inner.slots.is_empty()
    }

    fn spawn_worker(&self, event: WatchEvent, seq: u64) {
        let this = self.clone();
        tokio::spawn(async move { this.work(event, seq).await });
    }

    async fn work(self, mut event: WatchEvent, mut seq: u64) {
        loop {
            match self.invoke(&event).await {
                Ok(()) => (),
                Err(e) => self.failed(&event, seq, e),
            }
            match self.next(&event.key) {
                Some((next, next_seq)) => {
                    event = next;
                    seq = next_seq;
                }
                None => break,
            }
        }
    }

    async fn invoke(&self, event: &WatchEvent) -> Result<(), ControllerError> {
        let handler = self.inner.handlers.get(event.kind).ok_or_else(|| {
            ControllerError::Contract(format!("no handler registered for {} events", event.kind))
        })?;
        let _permit = self
            .inner
            .workers
            .acquire()
            .await
            .map_err(|e| ControllerError::Any(e.into()))?;
        let invocation = AssertUnwindSafe(async { handler(event.clone()).await });
        match invocation.catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                self.inner.panics.add(1, &[]);
                Err(ControllerError::Contract(format!(
                    "handler for {} of {} panicked: {}",
                    event.kind,
                    event.key,
                    panic_message(panic.as_ref())
                )))
            }
        }
    }

    fn failed(&self, event: &WatchEvent, seq: u64, error: ControllerError) {
        if !error.is_temporary() {
            error!(
                "{} of {}@{} failed and will not be retried until the object changes: {}",
                event.kind, event.key, event.revision, error
            );
            return;
        }
        let attempt = match self.inner.slots.get_mut(&event.key) {
            Some(mut slot) if slot.latest_seq == seq && slot.pending.is_none() => {
                slot.attempts += 1;
                slot.retries_scheduled += 1;
                Some(slot.attempts)
            }
            _ => None,
        };
        let Some(attempt) = attempt else {
            debug!(
                "{} of {} failed but a newer event is queued: {}",
                event.kind, event.key, error
            );
            return;
        };
        let delay = self.inner.retry.delay_for_attempt(attempt);
        warn!(
            "{} of {}@{} failed (attempt {}), retrying in {:?}: {}",
            event.kind, event.key, event.revision, attempt, delay, error
        );
        self.inner.retries.add(1, &[]);
        let this = self.clone();
        let event = event.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            this.retry(event, seq);
        });
    }

    /// Re-dispatch the same input after a backoff unless newer input arrived.
    fn retry(&self, event: WatchEvent, seq: u64) {
        let start = match self.inner.slots.entry(event.key.clone()) {
            Entry::Occupied(mut o) => {
                let (start, remove) = {
                    let slot = o.get_mut();
                    slot.retries_scheduled = slot.retries_scheduled.saturating_sub(1);
                    if slot.latest_seq != seq {
                        (false, slot.is_idle())
                    } else if slot.in_flight {
                        if slot.pending.is_none() {
                            slot.pending = Some((event.clone(), seq));
                        }
                        (false, false)
                    } else {
                        slot.in_flight = true;
                        (true, false)
                    }
                };
                if remove {
                    o.remove();
                }
                start
            }
            Entry::Vacant(_) => false,
        };
        if start {
            debug!("retrying {} of {}@{}", event.kind, event.key, event.revision);
            self.spawn_worker(event, seq);
        }
    }

    /// Take the queued event for `key` or release the identity.
    fn next(&self, key: &NamespacedName) -> Option<(WatchEvent, u64)> {
        match self.inner.slots.entry(key.clone()) {
            Entry::Occupied(mut o) => {
                let slot = o.get_mut();
                if let Some(next) = slot.pending.take() {
                    return Some(next);
                }
                slot.in_flight = false;
                if slot.is_idle() {
                    o.remove();
                }
                None
            }
            Entry::Vacant(_) => None,
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
