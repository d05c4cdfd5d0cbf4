//! Client-side runtime: wires the Incantation Registry, Stream Processor,
//! Cache Module, Mutation Pipeline, Sync Engine, Sync Scheduler and Event
//! System into one handle applications construct once and hold for the
//! lifetime of the connection.

pub mod cache;
pub mod events;
pub mod local_store;
pub mod mutation;
pub mod processor;
pub mod queries;
pub mod registry;
pub mod remote_store;
pub mod scheduler;
pub mod sync_engine;

use std::sync::Arc;
use std::time::Duration;

use grimoire_core::config::Config;
use grimoire_core::errors::{RemoteAuthError, RuntimeError, RuntimeResult};
use grimoire_core::hash::QueryHash;
use grimoire_core::models::RecordVersionArray;
use serde_json::Value;
use uuid::Uuid;

use cache::CacheModule;
use events::{EventDispatcher, RuntimeEvent};
use local_store::LocalStore;
use mutation::{MutationOptions, MutationOutcome, MutationPipeline};
use processor::StreamProcessor;
use registry::{Registry, SubscriptionId};
use remote_store::RemoteStore;
use scheduler::{DownItem, SyncScheduler, UpItem};

const APP_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6b, 0xa7, 0xb8, 0x14, 0x9d, 0xad, 0x11, 0xd1, 0x80, 0xb4, 0x00, 0xc0, 0x4f, 0xd4, 0x30, 0xc8,
]);

/// Deterministically derives a client id from a stable per-install
/// identifier, so the same install always registers the same queries under
/// the same content hash across restarts.
pub fn deterministic_client_id(app_id: &str, install_key: &str) -> Uuid {
    let app_namespace = Uuid::new_v5(&APP_NAMESPACE, app_id.as_bytes());
    Uuid::new_v5(&app_namespace, install_key.as_bytes())
}

pub struct GrimoireClient {
    client_id: Uuid,
    registry: Arc<Registry>,
    scheduler: Arc<SyncScheduler>,
    cache: Arc<CacheModule>,
    remote: Arc<RemoteStore>,
    events: Arc<EventDispatcher>,
    driver_task: tokio::task::JoinHandle<()>,
    live_task: tokio::task::JoinHandle<()>,
    reconnect_task: tokio::task::JoinHandle<()>,
}

impl GrimoireClient {
    pub async fn connect(config: &Config, client_id: Uuid, auth_token: &str) -> RuntimeResult<Self> {
        if auth_token.is_empty() {
            return Err(RuntimeError::RemoteAuth(RemoteAuthError(
                "no auth token supplied".into(),
            )));
        }

        let local = LocalStore::connect(&config.local_connect_url())
            .await
            .map_err(RuntimeError::LocalDb)?;
        local
            .provision(&schema_hash(config), config.provision.force)
            .await
            .map_err(RuntimeError::LocalDb)?;

        let mut processor = StreamProcessor::new();
        if let Some(bytes) = local.load_processor_state().await.map_err(RuntimeError::LocalDb)? {
            processor
                .load_state(&bytes)
                .map_err(RuntimeError::Plan)?;
        }

        let cache = Arc::new(CacheModule::new(local, processor));
        let remote = Arc::new(
            RemoteStore::connect(
                &config.remote_url,
                &client_id.to_string(),
                auth_token,
                config.remote_call_timeout(),
            )
            .await
            .map_err(RuntimeError::RemoteDb)?,
        );
        let scheduler = Arc::new(SyncScheduler::new());
        let events = Arc::new(EventDispatcher::new());

        let registry = Arc::new(Registry::new(
            client_id,
            scheduler.clone(),
            cache.clone(),
            remote.clone(),
            events.clone(),
        ));

        // A crash between committing a mutation's local transaction and the
        // Scheduler draining it must not lose the mutation: every durable
        // pending-mutations row still on disk at startup is re-queued here,
        // in `created_at` order, so the Up-queue resumes exactly where it
        // left off (§3 invariant iv, §4.6).
        for mutation in cache
            .local_store()
            .list_pending_mutations()
            .await
            .map_err(RuntimeError::LocalDb)?
        {
            scheduler
                .push_up(UpItem {
                    kind: mutation.kind,
                    mutation_id: mutation.id,
                    record_id: mutation.record_id,
                    data: mutation.data.clone(),
                    record: mutation.data,
                })
                .await;
        }

        let driver_task = spawn_driver(scheduler.clone(), remote.clone(), registry.clone(), cache.clone(), events.clone());
        let live_task = tokio::spawn(registry.clone().run_live_loop());
        let reconnect_task = spawn_reconnection_loop(remote.clone(), registry.clone());

        Ok(Self {
            client_id,
            registry,
            scheduler,
            cache,
            remote,
            events,
            driver_task,
            live_task,
            reconnect_task,
        })
    }

    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    pub fn events(&self) -> &Arc<EventDispatcher> {
        &self.events
    }

    pub async fn query(
        &self,
        table: &str,
        surql: &str,
        params: Value,
        ttl: Duration,
        involved_tables: Vec<String>,
    ) -> RuntimeResult<QueryHash> {
        self.registry
            .query(table, surql, params, ttl, involved_tables)
            .await
            .map_err(RuntimeError::SchemaProvision)
    }

    pub async fn subscribe<F>(&self, query_hash: QueryHash, callback: F, immediate: bool) -> SubscriptionId
    where
        F: Fn(&RecordVersionArray) + Send + Sync + 'static,
    {
        self.registry.subscribe(query_hash, callback, immediate).await
    }

    pub async fn unsubscribe(&self, query_hash: QueryHash, id: SubscriptionId) {
        self.registry.unsubscribe(query_hash, id).await;
    }

    pub async fn get_active_queries(&self) -> Vec<QueryHash> {
        self.registry.get_active_queries().await
    }

    pub fn mutations(&self) -> MutationPipeline<'_> {
        MutationPipeline::new(&self.cache, &self.scheduler)
    }

    pub async fn create(&self, table: &str, data: Value, local_only: bool) -> RuntimeResult<MutationOutcome> {
        let outcome = self
            .mutations()
            .create(table, data, MutationOptions { local_only })
            .await
            .map_err(RuntimeError::MutationFailed)?;
        self.notify_subscribers(&outcome).await;
        Ok(outcome)
    }

    pub async fn update(
        &self,
        table: &str,
        id: &str,
        partial: Value,
        local_only: bool,
    ) -> RuntimeResult<MutationOutcome> {
        let outcome = self
            .mutations()
            .update(table, id, partial, MutationOptions { local_only })
            .await
            .map_err(RuntimeError::MutationFailed)?;
        self.notify_subscribers(&outcome).await;
        Ok(outcome)
    }

    pub async fn delete(&self, table: &str, id: &str, local_only: bool) -> RuntimeResult<MutationOutcome> {
        let outcome = self
            .mutations()
            .delete(table, id, MutationOptions { local_only })
            .await
            .map_err(RuntimeError::MutationFailed)?;
        self.notify_subscribers(&outcome).await;
        Ok(outcome)
    }

    /// A local mutation ingests straight into the Stream Processor, so every
    /// query the mutated record touches must fan out to its subscribers
    /// synchronously, before the Up-queue ever reaches the remote — this is
    /// what lets a subscriber observe its own optimistic write immediately.
    async fn notify_subscribers(&self, outcome: &MutationOutcome) {
        for update in &outcome.updates {
            self.registry
                .on_processor_update(update.query_id, update.result.clone())
                .await;
        }
    }

    /// Flushes the processor's current state to the local DB and tears down
    /// both background loops and the remote connection. Every acquired
    /// handle has a matched release here, including on the error paths
    /// above, which never leave a connection half-open.
    pub async fn close(self) {
        self.driver_task.abort();
        self.live_task.abort();
        self.reconnect_task.abort();
        let _ = self.cache.save_processor_snapshot().await;
        self.cache.local_store().close().await;
        Arc::try_unwrap(self.remote)
            .map(|remote| async move { remote.close().await })
            .ok();
    }
}

fn schema_hash(config: &Config) -> String {
    let digest = blake3::hash(format!("{}:{}", config.namespace, config.database).as_bytes());
    digest.to_hex().to_string()
}

/// Background loop realizing the Scheduler's drain contract: drains the
/// UpQueue to empty (pushing confirmed mutations to the remote), then drains
/// the DownQueue unless the UpQueue refilled in the meantime. Runs on a fixed
/// tick rather than pure event-driven wakeup, which keeps this translation
/// simple; a push to either queue could instead notify this loop directly.
fn spawn_driver(
    scheduler: Arc<SyncScheduler>,
    remote: Arc<RemoteStore>,
    registry: Arc<Registry>,
    cache: Arc<CacheModule>,
    events: Arc<EventDispatcher>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let up_result = scheduler
                .drain_up(|item: UpItem| {
                    let remote = remote.clone();
                    let cache = cache.clone();
                    async move { apply_up_item(&remote, &cache, item).await }
                })
                .await;

            if let Err(e) = up_result {
                events.emit(RuntimeEvent::QueueDrainAborted {
                    queue: "up",
                    reason: e.to_string(),
                });
            }

            let down_result = scheduler
                .drain_down(|item: DownItem| {
                    let registry = registry.clone();
                    async move { registry.process_down(item).await }
                })
                .await;

            if let Err(e) = down_result {
                events.emit(RuntimeEvent::QueueDrainAborted {
                    queue: "down",
                    reason: e.to_string(),
                });
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
}

/// Applies one Up-queue item to the remote; on confirmation, deletes the
/// durable pending-mutations row. A failure to delete that row is logged but
/// does not fail the drain or re-enqueue the item — the remote has already
/// accepted the mutation, so re-sending it would be redundant, not corrective
/// (§4.6).
async fn apply_up_item(
    remote: &RemoteStore,
    cache: &CacheModule,
    item: UpItem,
) -> Result<(), grimoire_core::errors::RemoteDbError> {
    let kind = item.kind.to_string();
    let mutation_id = item.mutation_id;
    remote.apply_mutation(&kind, &item.record_id, item.data).await?;

    if let Err(e) = cache.local_store().delete_pending_mutation(mutation_id).await {
        tracing::warn!(%mutation_id, error = %e, "failed to delete confirmed pending-mutation row");
    }
    Ok(())
}

/// How often this loop checks connection health between active recoveries.
/// Grounded in the teacher's `start_reconnection_loop`, which polls on the
/// same fixed cadence rather than waiting on a disconnect notification.
const RECONNECT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// Supervises remote connection health for the lifetime of the client:
/// whenever [`RemoteStore::is_connected`] goes false, blocks on
/// [`RemoteStore::reconnect_until_healthy`] and then resyncs every
/// registered Incantation, since the old socket may have missed live
/// changes (or dropped a register/heartbeat/cleanup in flight) while down.
fn spawn_reconnection_loop(remote: Arc<RemoteStore>, registry: Arc<Registry>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if !remote.is_connected() {
                tracing::warn!("remote connection lost; reconnecting");
                remote.reconnect_until_healthy().await;
                registry.resync_all().await;
                tracing::info!("remote connection restored; resynced active incantations");
            }
            tokio::time::sleep(RECONNECT_POLL_INTERVAL).await;
        }
    })
}
