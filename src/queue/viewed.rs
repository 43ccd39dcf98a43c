//! Durable queue of viewed-item ids with periodic batched delivery.
//!
//! Ids are persisted as they arrive (deduplicated) and drained through
//! one batched `POST /items/viewed` call, either on the fixed interval
//! or on an explicit `process_queue`. A successful flush clears the
//! persisted queue and feeds the in-memory viewed set; a failed flush
//! drops exactly the attempted ids so a permanently-rejected id cannot
//! cause a retry storm.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::api::{ApiClient, RequestOptions};
use crate::storage::KeyValueStore;

/// Storage key for the persisted pending-id list
const QUEUE_KEY: &str = "queue/viewed_items";

/// Batched mark-viewed endpoint, relative to the base URL
const VIEWED_ENDPOINT: &str = "/items/viewed";

/// Seconds between automatic flushes.
/// Favors batching efficiency over latency for a low-priority signal.
const FLUSH_INTERVAL_SECS: u64 = 5;

/// A viewed-item identifier. The backend uses numeric ids for items and
/// string ids for externally-imported entries, so both shapes round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ItemId {
    Number(i64),
    Text(String),
}

impl From<i64> for ItemId {
    fn from(id: i64) -> Self {
        ItemId::Number(id)
    }
}

impl From<&str> for ItemId {
    fn from(id: &str) -> Self {
        ItemId::Text(id.to_string())
    }
}

impl From<String> for ItemId {
    fn from(id: String) -> Self {
        ItemId::Text(id)
    }
}

/// Fire-and-forget notifications emitted after a successful flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueSignal {
    /// The in-memory viewed set changed
    ViewedItemsUpdated,
    /// List data may be stale and worth re-fetching
    ListsChanged,
}

/// Notify hook consumed by the UI layer's listener registry
pub trait QueueEvents: Send + Sync {
    fn notify(&self, signal: QueueSignal);
}

/// Default hook that drops all signals
pub struct NoopEvents;

impl QueueEvents for NoopEvents {
    fn notify(&self, _signal: QueueSignal) {}
}

/// Snapshot of queue state for diagnostics
#[derive(Debug, Clone)]
pub struct QueueStatus {
    pub pending: usize,
    pub running: bool,
    pub last_flush: Option<DateTime<Utc>>,
}

/// Resets the in-flight flag when the flush settles or is dropped.
/// `stop()` can abort the processor mid-flush; without the drop guard
/// the flag would stay set and every later flush would no-op.
struct FlushGuard<'a>(&'a AtomicBool);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Durable viewed-items queue with a single periodic processor.
pub struct ViewedItemQueue {
    client: ApiClient,
    store: Arc<dyn KeyValueStore>,
    events: Arc<dyn QueueEvents>,
    viewed: RwLock<HashSet<ItemId>>,
    processor: Mutex<Option<JoinHandle<()>>>,
    flushing: AtomicBool,
    last_flush: RwLock<Option<DateTime<Utc>>>,
}

impl ViewedItemQueue {
    pub fn new(client: ApiClient, store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_events(client, store, Arc::new(NoopEvents))
    }

    pub fn with_events(
        client: ApiClient,
        store: Arc<dyn KeyValueStore>,
        events: Arc<dyn QueueEvents>,
    ) -> Self {
        Self {
            client,
            store,
            events,
            viewed: RwLock::new(HashSet::new()),
            processor: Mutex::new(None),
            flushing: AtomicBool::new(false),
            last_flush: RwLock::new(None),
        }
    }

    /// Queue an item id for the next flush, deduplicating on id.
    pub fn add_item(&self, id: impl Into<ItemId>) -> Result<()> {
        let id = id.into();
        let mut pending = self.pending()?;
        if pending.contains(&id) {
            debug!(?id, "Item already queued");
            return Ok(());
        }
        pending.push(id);
        self.persist(&pending)
    }

    /// Ids currently awaiting delivery
    pub fn pending(&self) -> Result<Vec<ItemId>> {
        let raw = self
            .store
            .get(QUEUE_KEY)
            .context("Failed to read persisted viewed-items queue")?;
        let Some(raw) = raw else {
            return Ok(Vec::new());
        };
        match serde_json::from_str(&raw) {
            Ok(items) => Ok(items),
            Err(e) => {
                // Corrupt state is read as empty rather than wedging the
                // queue; the next persist overwrites it
                warn!(error = %e, "Persisted queue was unreadable, treating it as empty");
                Ok(Vec::new())
            }
        }
    }

    /// Ids confirmed as viewed by a successful flush this session
    pub fn viewed_items(&self) -> HashSet<ItemId> {
        self.viewed
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Flush all pending ids in one batched request.
    ///
    /// An empty queue succeeds trivially with no network call. Overlapping
    /// invocations (timer tick racing an explicit call) are no-ops: an
    /// atomic in-flight guard keeps two flushes from racing to clear the
    /// same persisted state.
    pub async fn process_queue(&self) -> bool {
        if self.flushing.swap(true, Ordering::SeqCst) {
            debug!("Flush already in progress, skipping");
            return true;
        }
        let _guard = FlushGuard(&self.flushing);
        self.flush_pending().await
    }

    async fn flush_pending(&self) -> bool {
        let pending = match self.pending() {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "Failed to read pending viewed items");
                return false;
            }
        };
        if pending.is_empty() {
            return true;
        }

        debug!(count = pending.len(), "Flushing viewed items");
        let body = json!({ "itemIds": pending });
        let result = self
            .client
            .fetch(VIEWED_ENDPOINT, RequestOptions::post(body), true)
            .await;

        if result.envelope_success() {
            {
                let mut viewed = self
                    .viewed
                    .write()
                    .unwrap_or_else(PoisonError::into_inner);
                viewed.extend(pending.iter().cloned());
            }
            if let Err(e) = self.persist(&[]) {
                warn!(error = %e, "Failed to clear persisted queue after flush");
            }
            *self
                .last_flush
                .write()
                .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
            self.events.notify(QueueSignal::ViewedItemsUpdated);
            self.events.notify(QueueSignal::ListsChanged);
            true
        } else {
            // Fail-open: drop the attempted ids instead of retrying
            // forever. Ids queued while the flush was in flight survive.
            warn!(dropped = pending.len(), "Viewed-items flush failed, dropping batch");
            if let Err(e) = self.remove_attempted(&pending) {
                warn!(error = %e, "Failed to drop attempted ids from queue");
            }
            false
        }
    }

    /// Arm the periodic processor. Idempotent: returns `false` and leaves
    /// the existing timer untouched if one is already running. The first
    /// flush happens immediately so newly queued items are not held
    /// hostage by the interval boundary.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut processor = self
            .processor
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if processor.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            warn!("Queue processor already running");
            return false;
        }

        let queue = Arc::downgrade(self);
        *processor = Some(tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(FLUSH_INTERVAL_SECS));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(queue) = queue.upgrade() else {
                    break;
                };
                queue.process_queue().await;
            }
        }));
        debug!("Queue processor started");
        true
    }

    /// Disarm the periodic processor. No-op if none is running.
    pub fn stop(&self) {
        let mut processor = self
            .processor
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = processor.take() {
            handle.abort();
            debug!("Queue processor stopped");
        }
    }

    pub fn status(&self) -> QueueStatus {
        let pending = self.pending().map(|items| items.len()).unwrap_or(0);
        let running = self
            .processor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false);
        let last_flush = *self
            .last_flush
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        QueueStatus {
            pending,
            running,
            last_flush,
        }
    }

    fn persist(&self, items: &[ItemId]) -> Result<()> {
        let raw = serde_json::to_string(items)
            .context("Failed to serialize viewed-items queue")?;
        self.store
            .set(QUEUE_KEY, &raw)
            .context("Failed to persist viewed-items queue")
    }

    fn remove_attempted(&self, attempted: &[ItemId]) -> Result<()> {
        let current = self.pending()?;
        let remaining: Vec<ItemId> = current
            .into_iter()
            .filter(|id| !attempted.contains(id))
            .collect();
        self.persist(&remaining)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use futures::FutureExt;
    use serde_json::Value;

    use super::*;
    use crate::api::transport::mock::{json_response, MockTransport};
    use crate::api::ApiError;
    use crate::auth::TokenStore;
    use crate::storage::MemoryStore;

    struct RecordingEvents {
        signals: Mutex<Vec<QueueSignal>>,
    }

    impl RecordingEvents {
        fn new() -> Self {
            Self {
                signals: Mutex::new(Vec::new()),
            }
        }

        fn recorded(&self) -> Vec<QueueSignal> {
            self.signals
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }
    }

    impl QueueEvents for RecordingEvents {
        fn notify(&self, signal: QueueSignal) {
            self.signals
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(signal);
        }
    }

    fn queue_over(transport: Arc<MockTransport>) -> (Arc<ViewedItemQueue>, Arc<RecordingEvents>) {
        let tokens = TokenStore::new(Arc::new(MemoryStore::new()));
        tokens.store_pair("tok", "ref").expect("store should not fail");
        let client = ApiClient::with_transport(transport, "https://api.test", tokens);
        let events = Arc::new(RecordingEvents::new());
        let queue = Arc::new(ViewedItemQueue::with_events(
            client,
            Arc::new(MemoryStore::new()),
            Arc::clone(&events) as Arc<dyn QueueEvents>,
        ));
        (queue, events)
    }

    fn succeeding_transport() -> Arc<MockTransport> {
        Arc::new(MockTransport::new(|_| {
            async { Ok(json_response(200, json!({"success": true}))) }.boxed()
        }))
    }

    #[tokio::test]
    async fn test_add_item_deduplicates() {
        let (queue, _) = queue_over(succeeding_transport());

        queue.add_item(5).expect("add should not fail");
        queue.add_item(5).expect("add should not fail");
        queue.add_item("ext-9").expect("add should not fail");

        let pending = queue.pending().expect("pending should not fail");
        assert_eq!(pending, vec![ItemId::Number(5), ItemId::Text("ext-9".into())]);
    }

    #[tokio::test]
    async fn test_empty_queue_flush_skips_network() {
        let transport = succeeding_transport();
        let (queue, events) = queue_over(Arc::clone(&transport));

        assert!(queue.process_queue().await);
        assert_eq!(transport.calls_to(VIEWED_ENDPOINT), 0);
        assert!(events.recorded().is_empty());
    }

    #[tokio::test]
    async fn test_flush_clears_queue_on_success() {
        let transport = succeeding_transport();
        let (queue, events) = queue_over(Arc::clone(&transport));

        for id in [1, 2, 3] {
            queue.add_item(id).expect("add should not fail");
        }

        assert!(queue.process_queue().await);

        assert!(queue.pending().expect("pending should not fail").is_empty());
        let viewed = queue.viewed_items();
        assert!(viewed.contains(&ItemId::Number(1)));
        assert!(viewed.contains(&ItemId::Number(2)));
        assert!(viewed.contains(&ItemId::Number(3)));
        assert_eq!(
            events.recorded(),
            vec![QueueSignal::ViewedItemsUpdated, QueueSignal::ListsChanged]
        );
        assert!(queue.status().last_flush.is_some());

        // The batch went out as one request with all three ids
        assert_eq!(transport.calls_to(VIEWED_ENDPOINT), 1);
        let body = transport.calls()[0].body.clone().expect("body should be set");
        assert_eq!(body["itemIds"], json!([1, 2, 3]));
    }

    #[tokio::test]
    async fn test_flush_drops_batch_on_failure() {
        let transport = Arc::new(MockTransport::new(|_| {
            async { Err(ApiError::Transport("offline".to_string())) }.boxed()
        }));
        let (queue, events) = queue_over(transport);

        queue.add_item(1).expect("add should not fail");
        queue.add_item(2).expect("add should not fail");

        assert!(!queue.process_queue().await);

        // Ids were discarded, not retried, and never marked viewed
        assert!(queue.pending().expect("pending should not fail").is_empty());
        assert!(queue.viewed_items().is_empty());
        assert!(events.recorded().is_empty());
        assert!(queue.status().last_flush.is_none());
    }

    #[tokio::test]
    async fn test_non_envelope_success_counts_as_failure() {
        // A 2xx that is not a {success: true} envelope still drops the batch
        let transport = Arc::new(MockTransport::new(|_| {
            async { Ok(json_response(200, json!({"ok": 1}))) }.boxed()
        }));
        let (queue, _) = queue_over(transport);

        queue.add_item(7).expect("add should not fail");
        assert!(!queue.process_queue().await);
        assert!(queue.pending().expect("pending should not fail").is_empty());
    }

    #[tokio::test]
    async fn test_ids_added_during_failed_flush_survive() {
        let transport = Arc::new(MockTransport::new(|_| {
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Err(ApiError::Transport("offline".to_string()))
            }
            .boxed()
        }));
        let (queue, _) = queue_over(transport);

        queue.add_item(1).expect("add should not fail");
        queue.add_item(2).expect("add should not fail");

        let flusher = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.process_queue().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.add_item(3).expect("add should not fail");

        assert!(!flusher.await.expect("flush task should not panic"));

        // Only the attempted ids were dropped
        assert_eq!(
            queue.pending().expect("pending should not fail"),
            vec![ItemId::Number(3)]
        );
    }

    #[tokio::test]
    async fn test_overlapping_flush_is_a_noop() {
        let counter = Arc::new(AtomicUsize::new(0));
        let handler_counter = Arc::clone(&counter);
        let transport = Arc::new(MockTransport::new(move |_| {
            handler_counter.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(json_response(200, json!({"success": true})))
            }
            .boxed()
        }));
        let (queue, _) = queue_over(transport);

        queue.add_item(1).expect("add should not fail");

        let first = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.process_queue().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        // Second invocation while the first is in flight
        assert!(queue.process_queue().await);

        assert!(first.await.expect("flush task should not panic"));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_mid_flush_does_not_wedge_later_flushes() {
        let transport = Arc::new(MockTransport::new(|_| {
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(json_response(200, json!({"success": true})))
            }
            .boxed()
        }));
        let (queue, _) = queue_over(Arc::clone(&transport));

        queue.add_item(1).expect("add should not fail");
        assert!(queue.start());
        // Let the immediate first flush reach the transport, then abort it
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.stop();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.calls_to(VIEWED_ENDPOINT), 1);

        // The in-flight flag was released by the aborted flush, so an
        // explicit flush still reaches the network and drains the queue
        assert!(queue.process_queue().await);
        assert_eq!(transport.calls_to(VIEWED_ENDPOINT), 2);
        assert!(queue.pending().expect("pending should not fail").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_processor_flushes_immediately_and_on_interval() {
        let transport = succeeding_transport();
        let (queue, _) = queue_over(Arc::clone(&transport));

        queue.add_item(1).expect("add should not fail");
        assert!(queue.start());
        assert!(queue.status().running);

        // First tick fires immediately
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.calls_to(VIEWED_ENDPOINT), 1);
        assert!(queue.pending().expect("pending should not fail").is_empty());

        // Next batch goes out on the interval tick
        queue.add_item(2).expect("add should not fail");
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(transport.calls_to(VIEWED_ENDPOINT), 2);

        queue.stop();
        assert!(!queue.status().running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let transport = succeeding_transport();
        let (queue, _) = queue_over(Arc::clone(&transport));

        assert!(queue.start());
        assert!(!queue.start());

        // One timer only: a queued item is flushed exactly once per tick
        queue.add_item(1).expect("add should not fail");
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(transport.calls_to(VIEWED_ENDPOINT), 1);

        queue.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_processor_does_not_flush() {
        let transport = succeeding_transport();
        let (queue, _) = queue_over(Arc::clone(&transport));

        assert!(queue.start());
        queue.stop();

        queue.add_item(1).expect("add should not fail");
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(transport.calls_to(VIEWED_ENDPOINT), 0);
        assert_eq!(queue.status().pending, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_then_restart() {
        let transport = succeeding_transport();
        let (queue, _) = queue_over(Arc::clone(&transport));

        assert!(queue.start());
        queue.stop();
        assert!(queue.start());

        queue.add_item(1).expect("add should not fail");
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(transport.calls_to(VIEWED_ENDPOINT), 1);

        queue.stop();
    }

    #[test]
    fn test_item_id_serialization_shapes() {
        let ids = vec![ItemId::Number(5), ItemId::Text("ext-9".into())];
        let raw = serde_json::to_string(&ids).expect("serialize should not fail");
        assert_eq!(raw, r#"[5,"ext-9"]"#);

        let parsed: Vec<ItemId> = serde_json::from_str(&raw).expect("parse should not fail");
        assert_eq!(parsed, ids);

        let as_value = serde_json::to_value(&ids).expect("to_value should not fail");
        assert_eq!(as_value, Value::Array(vec![json!(5), json!("ext-9")]));
    }

    #[test]
    fn test_corrupt_persisted_queue_reads_as_empty() {
        let store = Arc::new(MemoryStore::new());
        store.set(QUEUE_KEY, "not json").expect("set should not fail");

        let tokens = TokenStore::new(Arc::new(MemoryStore::new()));
        let client = ApiClient::with_transport(
            Arc::new(MockTransport::new(|_| {
                async { Ok(json_response(200, json!({"success": true}))) }.boxed()
            })),
            "https://api.test",
            tokens,
        );
        let queue = ViewedItemQueue::new(client, store);

        assert!(queue.pending().expect("pending should not fail").is_empty());
    }
}
