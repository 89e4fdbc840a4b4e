//! Background consumer of the write-behind log.
//!
//! Delivery is at-least-once: an entry is removed only after the store accepted it, and the
//! store reports re-applied events as duplicates. Entries that fail to insert stay pending for
//! this consumer and are retried when the worker starts again.

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{sync::Notify, task::JoinHandle, time::sleep};
use tracing::{debug, info, warn};

use crate::{
    config::QueueConfig,
    dao::{
        cache::{ReadStart, StreamEntry, StreamRead},
        game_store::GameStore,
        models::InsertOutcome,
    },
    services::resilient_client::{BackendError, ResilientClient},
    state::game::ClickEvent,
};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Counts of what one batch did with its entries.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    /// Entries read from the log.
    pub read: usize,
    /// Entries inserted as new rows.
    pub processed: usize,
    /// Entries the store already had.
    pub duplicates: usize,
    /// Entries whose insert failed; they stay pending.
    pub skipped: usize,
    /// Malformed entries removed without an insert.
    pub discarded: usize,
}

impl BatchReport {
    fn merge(&mut self, other: BatchReport) {
        self.read += other.read;
        self.processed += other.processed;
        self.duplicates += other.duplicates;
        self.skipped += other.skipped;
        self.discarded += other.discarded;
    }
}

struct WorkerInner {
    client: Arc<ResilientClient>,
    store: Arc<dyn GameStore>,
    config: QueueConfig,
    running: AtomicBool,
    group_ready: AtomicBool,
    shutdown: Notify,
}

/// Drains the write-behind log into the persistent store.
pub struct SyncWorker {
    inner: Arc<WorkerInner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncWorker {
    /// Worker reading through `client` and writing to `store`. Both should be dedicated to it.
    pub fn new(client: Arc<ResilientClient>, store: Arc<dyn GameStore>, config: &QueueConfig) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                client,
                store,
                config: config.clone(),
                running: AtomicBool::new(false),
                group_ready: AtomicBool::new(false),
                shutdown: Notify::new(),
            }),
            task: Mutex::new(None),
        }
    }

    /// Spawn the consumer loop. Returns `false` when it was already running.
    pub fn start(&self) -> bool {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return false;
        }
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { inner.run().await });
        let mut guard = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        *guard = Some(handle);
        info!(
            stream = %self.inner.config.stream_key,
            consumer = %self.inner.config.consumer,
            "sync worker started"
        );
        true
    }

    /// Ask the loop to exit after its in-flight batch and wait for it. Safe to call repeatedly.
    pub async fn stop(&self) {
        let was_running = self.inner.running.swap(false, Ordering::SeqCst);
        self.inner.shutdown.notify_one();
        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "sync worker task ended abnormally");
            }
        }
        if was_running {
            info!("sync worker stopped");
        }
    }

    /// Whether the loop is running.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Read and apply one batch of entries never delivered before.
    pub async fn process_batch(&self) -> Result<BatchReport, BackendError> {
        self.inner.ensure_group().await?;
        let entries = self.inner.read(ReadStart::New).await?;
        Ok(self.inner.apply(entries).await)
    }

    /// Re-apply every entry delivered to this consumer but never removed.
    pub async fn drain_pending(&self) -> Result<BatchReport, BackendError> {
        self.inner.ensure_group().await?;
        let mut total = BatchReport::default();
        let mut cursor = "0".to_owned();
        loop {
            let entries = self.inner.read(ReadStart::Pending(cursor.clone())).await?;
            let Some(last) = entries.last() else {
                return Ok(total);
            };
            cursor = last.id.clone();
            total.merge(self.inner.apply(entries).await);
        }
    }
}

impl WorkerInner {
    async fn ensure_group(&self) -> Result<(), BackendError> {
        if self.group_ready.load(Ordering::SeqCst) {
            return Ok(());
        }
        let key = self.config.stream_key.clone();
        let group = self.config.group.clone();
        self.client
            .call(move |backend| backend.stream_create_group(key, group))
            .await?;
        self.group_ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn read(&self, start: ReadStart) -> Result<Vec<StreamEntry>, BackendError> {
        let read = StreamRead {
            key: self.config.stream_key.clone(),
            group: self.config.group.clone(),
            consumer: self.config.consumer.clone(),
            start,
            count: self.config.batch_size.max(1),
            block: self.config.block(),
        };
        self.client
            .call(move |backend| backend.stream_read_group(read))
            .await
    }

    async fn apply(&self, entries: Vec<StreamEntry>) -> BatchReport {
        let mut report = BatchReport {
            read: entries.len(),
            ..BatchReport::default()
        };

        for entry in entries {
            let event = match ClickEvent::from_fields(&entry.fields) {
                Ok(event) => event,
                Err(err) => {
                    // Also covers entries deleted after delivery, which come back empty.
                    warn!(entry_id = %entry.id, error = %err, "discarding malformed queue entry");
                    self.remove(&entry.id).await;
                    report.discarded += 1;
                    continue;
                }
            };

            match self.store.insert_click(event).await {
                Ok(InsertOutcome::Inserted) => {
                    self.remove(&entry.id).await;
                    report.processed += 1;
                }
                Ok(InsertOutcome::Duplicate) => {
                    debug!(entry_id = %entry.id, "click already persisted");
                    self.remove(&entry.id).await;
                    report.duplicates += 1;
                }
                Err(err) => {
                    warn!(entry_id = %entry.id, error = %err, "failed to persist queued click; skipping");
                    report.skipped += 1;
                }
            }
        }

        if report.read > 0 {
            debug!(
                read = report.read,
                processed = report.processed,
                duplicates = report.duplicates,
                skipped = report.skipped,
                discarded = report.discarded,
                "sync batch applied"
            );
        }
        report
    }

    async fn remove(&self, id: &str) {
        let key = self.config.stream_key.clone();
        let group = self.config.group.clone();
        let entry_id = id.to_owned();
        if let Err(err) = self
            .client
            .call(move |backend| backend.stream_remove(key, group, entry_id))
            .await
        {
            warn!(entry_id = %id, error = %err, "failed to remove queue entry; it will be redelivered");
        }
    }

    async fn pause(&self, delay: Duration) {
        tokio::select! {
            _ = sleep(delay) => {}
            _ = self.shutdown.notified() => {}
        }
    }

    async fn run(&self) {
        let mut backoff = INITIAL_BACKOFF;
        let mut pending_cursor = Some("0".to_owned());

        while self.running.load(Ordering::SeqCst) {
            if let Err(err) = self.ensure_group().await {
                warn!(error = %err, "sync worker cannot reach the queue");
                self.pause(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }

            let start = match &pending_cursor {
                Some(after) => ReadStart::Pending(after.clone()),
                None => ReadStart::New,
            };
            let entries = tokio::select! {
                entries = self.read(start) => entries,
                _ = self.shutdown.notified() => continue,
            };

            match entries {
                Ok(entries) => {
                    backoff = INITIAL_BACKOFF;
                    if pending_cursor.is_some() {
                        match entries.last() {
                            Some(last) => pending_cursor = Some(last.id.clone()),
                            None => {
                                debug!("pending backlog drained");
                                pending_cursor = None;
                            }
                        }
                    }
                    self.apply(entries).await;
                }
                Err(err) => {
                    warn!(error = %err, "sync worker read failed");
                    self.group_ready.store(false, Ordering::SeqCst);
                    self.pause(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }
}
