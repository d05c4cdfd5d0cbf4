//! Two FIFO queues, each drained by a caller-supplied async handler —
//! mirroring the teacher's `OfflineQueue::process_queue<F, Fut>` generic
//! retry-by-callback shape, just split into an Up queue (mutations) and a
//! Down queue (per-query lifecycle work) with Up given strict priority.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use grimoire_core::hash::QueryHash;
use grimoire_core::models::{MutationKind, RecordId};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct UpItem {
    pub kind: MutationKind,
    pub mutation_id: Uuid,
    pub record_id: RecordId,
    pub data: Option<Value>,
    pub record: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownKind {
    Register,
    Sync,
    Heartbeat,
    Cleanup,
}

#[derive(Debug, Clone)]
pub struct DownItem {
    pub kind: DownKind,
    pub query_hash: QueryHash,
}

pub struct SyncScheduler {
    up: Mutex<VecDeque<UpItem>>,
    down: Mutex<VecDeque<DownItem>>,
    syncing_up: AtomicBool,
    syncing_down: AtomicBool,
}

impl SyncScheduler {
    pub fn new() -> Self {
        Self {
            up: Mutex::new(VecDeque::new()),
            down: Mutex::new(VecDeque::new()),
            syncing_up: AtomicBool::new(false),
            syncing_down: AtomicBool::new(false),
        }
    }

    pub async fn push_up(&self, item: UpItem) {
        self.up.lock().await.push_back(item);
    }

    pub async fn push_down(&self, item: DownItem) {
        self.down.lock().await.push_back(item);
    }

    pub async fn up_len(&self) -> usize {
        self.up.lock().await.len()
    }

    /// Drains the UpQueue to empty, invoking `handler` once per item. On
    /// success the item is dropped; on failure it is re-prepended and the
    /// drain stops immediately (item-level errors abort the whole drain, per
    /// the failure-handling contract).
    pub async fn drain_up<F, Fut, E>(&self, mut handler: F) -> Result<(), E>
    where
        F: FnMut(UpItem) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        if self
            .syncing_up
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        let result = self.drain_up_inner(&mut handler).await;
        self.syncing_up.store(false, Ordering::SeqCst);
        result
    }

    async fn drain_up_inner<F, Fut, E>(&self, handler: &mut F) -> Result<(), E>
    where
        F: FnMut(UpItem) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        loop {
            let item = {
                let mut queue = self.up.lock().await;
                match queue.pop_front() {
                    Some(item) => item,
                    None => return Ok(()),
                }
            };

            match handler(item.clone()).await {
                Ok(()) => continue,
                Err(e) => {
                    self.up.lock().await.push_front(item);
                    return Err(e);
                }
            }
        }
    }

    /// Drains the DownQueue to empty unless the UpQueue is non-empty, in
    /// which case it pauses immediately (Up has strict priority).
    pub async fn drain_down<F, Fut, E>(&self, mut handler: F) -> Result<(), E>
    where
        F: FnMut(DownItem) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        if !self.up.lock().await.is_empty() {
            return Ok(());
        }

        if self
            .syncing_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        let result = self.drain_down_inner(&mut handler).await;
        self.syncing_down.store(false, Ordering::SeqCst);
        result
    }

    async fn drain_down_inner<F, Fut, E>(&self, handler: &mut F) -> Result<(), E>
    where
        F: FnMut(DownItem) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        loop {
            if !self.up.lock().await.is_empty() {
                return Ok(());
            }

            let item = {
                let mut queue = self.down.lock().await;
                match queue.pop_front() {
                    Some(item) => item,
                    None => return Ok(()),
                }
            };

            match handler(item.clone()).await {
                Ok(()) => continue,
                Err(e) => {
                    self.down.lock().await.push_front(item);
                    return Err(e);
                }
            }
        }
    }
}

impl Default for SyncScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn up_item(n: u8) -> UpItem {
        UpItem {
            kind: MutationKind::Create,
            mutation_id: Uuid::new_v4(),
            record_id: format!("thread:{n}"),
            data: None,
            record: None,
        }
    }

    #[tokio::test]
    async fn drain_up_processes_in_fifo_order() {
        let scheduler = SyncScheduler::new();
        for i in 0..3 {
            scheduler.push_up(up_item(i)).await;
        }
        let order = Arc::new(Mutex::new(Vec::new()));
        let order2 = order.clone();
        scheduler
            .drain_up(|item: UpItem| {
                let order = order2.clone();
                async move {
                    order.lock().await.push(item.record_id);
                    Ok::<(), ()>(())
                }
            })
            .await
            .unwrap();
        assert_eq!(
            order.lock().await.clone(),
            vec!["thread:0".to_string(), "thread:1".to_string(), "thread:2".to_string()]
        );
    }

    #[tokio::test]
    async fn failed_item_stays_at_head_and_aborts_drain() {
        let scheduler = SyncScheduler::new();
        scheduler.push_up(up_item(0)).await;
        scheduler.push_up(up_item(1)).await;

        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts2 = attempts.clone();
        let result = scheduler
            .drain_up(move |_item: UpItem| {
                let attempts = attempts2.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), ()>(())
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.up_len().await, 2);
    }

    #[tokio::test]
    async fn drain_down_pauses_when_up_queue_nonempty() {
        let scheduler = SyncScheduler::new();
        scheduler.push_up(up_item(0)).await;
        scheduler
            .push_down(DownItem {
                kind: DownKind::Sync,
                query_hash: QueryHash([0u8; 32]),
            })
            .await;

        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        scheduler
            .drain_down(move |_item: DownItem| {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), ()>(())
                }
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
