//! Typed pub/sub consumed by every other component. Handlers observe events in
//! FIFO order within a type; the last value per type is retained for
//! `immediately` replay; exceptions inside a handler are isolated.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use grimoire_core::hash::QueryHash;
use grimoire_core::models::RecordId;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum EventKind {
    MutationFailed,
    MutationSettled,
    RegistrationFailed,
    RecordStale,
    QueueDrainAborted,
    IncantationDestroyed,
}

/// Tagged-union event payload. Replaces the dynamic `payload: any` shape of the
/// original with a closed sum type per event kind.
#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    MutationFailed { mutation_id: Uuid, reason: String },
    MutationSettled { mutation_id: Uuid },
    RegistrationFailed { query_hash: QueryHash, reason: String },
    RecordStale { record_id: RecordId, anticipated: u64, returned: u64 },
    QueueDrainAborted { queue: &'static str, reason: String },
    IncantationDestroyed { query_hash: QueryHash },
}

impl RuntimeEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            RuntimeEvent::MutationFailed { .. } => EventKind::MutationFailed,
            RuntimeEvent::MutationSettled { .. } => EventKind::MutationSettled,
            RuntimeEvent::RegistrationFailed { .. } => EventKind::RegistrationFailed,
            RuntimeEvent::RecordStale { .. } => EventKind::RecordStale,
            RuntimeEvent::QueueDrainAborted { .. } => EventKind::QueueDrainAborted,
            RuntimeEvent::IncantationDestroyed { .. } => EventKind::IncantationDestroyed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&RuntimeEvent) + Send + Sync>;

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    once: bool,
    handler: Handler,
}

struct Shared {
    subscribers: Mutex<HashMap<EventKind, Vec<Subscription>>>,
    last_value: Mutex<HashMap<EventKind, RuntimeEvent>>,
    debounced: Mutex<HashMap<(EventKind, String), tokio::task::JoinHandle<()>>>,
    next_id: AtomicU64,
    tx: mpsc::UnboundedSender<RuntimeEvent>,
}

/// Single-threaded-cooperative dispatch: one background task drains a channel
/// and invokes handlers to completion before processing the next event, so
/// handlers for a given type are always observed in emit order.
pub struct EventDispatcher {
    shared: Arc<Shared>,
    dispatch_task: tokio::task::JoinHandle<()>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<RuntimeEvent>();
        let shared = Arc::new(Shared {
            subscribers: Mutex::new(HashMap::new()),
            last_value: Mutex::new(HashMap::new()),
            debounced: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            tx,
        });

        let dispatch_shared = shared.clone();
        let dispatch_task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                dispatch_shared.dispatch(event);
            }
        });

        Self {
            shared,
            dispatch_task,
        }
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&RuntimeEvent) + Send + Sync + 'static,
    {
        self.subscribe_opts(kind, handler, false, false)
    }

    pub fn subscribe_opts<F>(
        &self,
        kind: EventKind,
        handler: F,
        once: bool,
        immediately: bool,
    ) -> SubscriptionId
    where
        F: Fn(&RuntimeEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let handler: Handler = Arc::new(handler);

        if immediately {
            if let Some(last) = self.shared.last_value.lock().unwrap().get(&kind) {
                handler(last);
            }
        }

        self.shared
            .subscribers
            .lock()
            .unwrap()
            .entry(kind)
            .or_default()
            .push(Subscription { id, once, handler });

        id
    }

    pub fn subscribe_many<F>(&self, kinds: &[EventKind], handler: F) -> Vec<SubscriptionId>
    where
        F: Fn(&RuntimeEvent) + Send + Sync + Clone + 'static,
    {
        kinds
            .iter()
            .map(|kind| self.subscribe(*kind, handler.clone()))
            .collect()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut subscribers = self.shared.subscribers.lock().unwrap();
        for list in subscribers.values_mut() {
            list.retain(|s| s.id != id);
        }
    }

    pub fn emit(&self, event: RuntimeEvent) {
        let _ = self.shared.tx.send(event);
    }

    /// Coalesces emissions sharing `key` within `delay`: only the last payload
    /// fires. A new call for the same key cancels the previous pending timer.
    pub fn emit_debounced(&self, event: RuntimeEvent, key: impl Into<String>, delay: Duration) {
        let kind = event.kind();
        let key = key.into();
        let shared = self.shared.clone();
        let map_key = (kind, key.clone());

        let mut debounced = self.shared.debounced.lock().unwrap();
        if let Some(existing) = debounced.remove(&map_key) {
            existing.abort();
        }

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = shared.tx.send(event);
            shared.debounced.lock().unwrap().remove(&(kind, key));
        });
        debounced.insert(map_key, task);
    }

    pub async fn close(&self) {
        self.dispatch_task.abort();
        let pending: Vec<_> = self
            .shared
            .debounced
            .lock()
            .unwrap()
            .drain()
            .map(|(_, task)| task)
            .collect();
        for task in pending {
            task.abort();
        }
    }
}

impl PartialEq for SubscriptionId {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for SubscriptionId {}

impl Shared {
    fn dispatch(&self, event: RuntimeEvent) {
        let kind = event.kind();
        self.last_value.lock().unwrap().insert(kind, event.clone());

        // Snapshot the subscriber list and drop the lock before invoking
        // handlers, so a handler that calls subscribe/unsubscribe from within
        // its own body cannot deadlock on this mutex.
        let snapshot: Vec<Subscription> = self
            .subscribers
            .lock()
            .unwrap()
            .get(&kind)
            .cloned()
            .unwrap_or_default();

        for sub in &snapshot {
            let handler = sub.handler.clone();
            let result =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(&event)));
            if result.is_err() {
                tracing::error!(?kind, "event handler panicked; isolated");
            }
        }

        let once_ids: Vec<SubscriptionId> = snapshot
            .iter()
            .filter(|s| s.once)
            .map(|s| s.id)
            .collect();
        if !once_ids.is_empty() {
            if let Some(list) = self.subscribers.lock().unwrap().get_mut(&kind) {
                list.retain(|s| !once_ids.contains(&s.id));
            }
        }
    }
}
