//! Bounded, throttled queue of camera snapshots awaiting analysis.
//!
//! Frames arrive far faster than a remote analysis service can score them.
//! The queue keeps only the most recent `max_size` frames, drops frames that
//! arrive closer together than `min_spacing_ms`, and forwards what it holds in
//! sequential batches when drained. Pausing the queue stops draining but not
//! buffering.

pub mod driver;

use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    AnalysisBackend, AnalysisBatch, AnalysisResponse, CaptureConfig, Clock, Result, SyncError,
};

/// Free-form annotations stored alongside a frame.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// One buffered frame.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureItem {
    /// Capture time in milliseconds.
    pub timestamp: u64,
    pub payload: Bytes,
    pub metadata: Metadata,
}

impl CaptureItem {
    pub fn new(timestamp: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            timestamp,
            payload: payload.into(),
            metadata: Metadata::new(),
        }
    }
}

/// Sizing and pacing of a [`CaptureQueue`]. Fixed for the queue's lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    pub max_size: usize,
    pub min_spacing_ms: u64,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub batch_gap: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::from(&CaptureConfig::default())
    }
}

impl From<&CaptureConfig> for QueueConfig {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            max_size: config.max_size,
            min_spacing_ms: config.min_spacing_ms,
            batch_size: config.batch_size,
            batch_timeout: config.batch_timeout(),
            batch_gap: config.batch_gap(),
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_size < 1 {
            return Err(SyncError::config("max_size must be at least 1"));
        }
        if self.batch_size < 1 {
            return Err(SyncError::config("batch_size must be at least 1"));
        }
        if self.batch_timeout.is_zero() {
            return Err(SyncError::config("batch timeout must be positive"));
        }
        Ok(())
    }
}

/// Point-in-time view of the queue, safe to poll or to watch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub size: usize,
    pub is_processing: bool,
    pub is_paused: bool,
    /// Frames rejected by the spacing throttle.
    pub dropped: u64,
    /// Frames pushed out by newer ones when the queue was full.
    pub evicted: u64,
    pub total_accepted: u64,
}

/// Why [`CaptureQueue::drain`] did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyProcessing,
    Paused,
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DrainOutcome {
    Skipped(SkipReason),
    Completed {
        batches: usize,
        items: usize,
        responses: Vec<AnalysisResponse>,
    },
}

#[derive(Debug)]
struct Entry {
    seq: u64,
    item: CaptureItem,
}

#[derive(Debug, Default)]
struct QueueInner {
    items: VecDeque<Entry>,
    next_seq: u64,
    last_accepted_ms: Option<u64>,
    is_processing: bool,
    is_paused: bool,
    dropped: u64,
    evicted: u64,
    total_accepted: u64,
}

impl QueueInner {
    fn status(&self) -> QueueStatus {
        QueueStatus {
            size: self.items.len(),
            is_processing: self.is_processing,
            is_paused: self.is_paused,
            dropped: self.dropped,
            evicted: self.evicted,
            total_accepted: self.total_accepted,
        }
    }

    /// Removes every entry up to and including `last_seq`. Entries are kept in
    /// sequence order, so the sent ones are always at the front unless they
    /// were already evicted or cleared.
    fn remove_through(&mut self, last_seq: u64) -> usize {
        let mut removed = 0;
        while self.items.front().is_some_and(|entry| entry.seq <= last_seq) {
            self.items.pop_front();
            removed += 1;
        }
        removed
    }
}

/// Bounded snapshot queue feeding an [`AnalysisBackend`].
///
/// All methods take `&self`; share the queue behind an [`Arc`] to enqueue
/// from a capture task while another task drains. The internal lock is never
/// held across an await.
pub struct CaptureQueue {
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    backend: Arc<dyn AnalysisBackend>,
    inner: Mutex<QueueInner>,
    status: watch::Sender<QueueStatus>,
}

impl CaptureQueue {
    pub fn new(
        config: QueueConfig,
        clock: Arc<dyn Clock>,
        backend: Arc<dyn AnalysisBackend>,
    ) -> Result<Self> {
        config.validate()?;
        let (status, _) = watch::channel(QueueStatus::default());
        Ok(Self {
            config,
            clock,
            backend,
            inner: Mutex::new(QueueInner::default()),
            status,
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Receives a fresh [`QueueStatus`] after every change.
    pub fn subscribe(&self) -> watch::Receiver<QueueStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> QueueStatus {
        *self.status.borrow()
    }

    /// Buffers a frame stamped with the current time. Returns `false` when the
    /// frame was throttled. Never blocks on a running drain.
    pub fn enqueue(&self, payload: impl Into<Bytes>, metadata: Metadata) -> Result<bool> {
        let now = self.clock.now_ms();
        let mut inner = self.lock()?;

        if let Some(last) = inner.last_accepted_ms {
            if now.saturating_sub(last) < self.config.min_spacing_ms {
                inner.dropped += 1;
                debug!(now, last, "throttled snapshot");
                self.publish(&inner);
                return Ok(false);
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.last_accepted_ms = Some(now);
        inner.total_accepted += 1;
        inner.items.push_back(Entry {
            seq,
            item: CaptureItem {
                timestamp: now,
                payload: payload.into(),
                metadata,
            },
        });

        while inner.items.len() > self.config.max_size {
            inner.items.pop_front();
            inner.evicted += 1;
        }

        debug!(size = inner.items.len(), "snapshot queued");
        self.publish(&inner);
        Ok(true)
    }

    /// Copies of the buffered frames, oldest first.
    pub fn items(&self) -> Result<Vec<CaptureItem>> {
        let inner = self.lock()?;
        Ok(inner.items.iter().map(|entry| entry.item.clone()).collect())
    }

    pub fn pause(&self) -> Result<()> {
        self.set_paused(true)
    }

    pub fn resume(&self) -> Result<()> {
        self.set_paused(false)
    }

    /// Drops every buffered frame, even while a drain is running.
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.lock()?;
        let cleared = inner.items.len();
        inner.items.clear();
        info!(cleared, "snapshot queue cleared");
        self.publish(&inner);
        Ok(())
    }

    /// Sends the buffered frames to the analysis backend in batches of
    /// `batch_size`, one batch at a time.
    ///
    /// Successful batches are removed as they complete. The first failing or
    /// timed-out batch stops the drain and its error is returned; that batch
    /// and every later one stay queued for the next call.
    pub async fn drain(&self) -> Result<DrainOutcome> {
        let batches = {
            let mut inner = self.lock()?;
            let skip = if inner.is_processing {
                Some(SkipReason::AlreadyProcessing)
            } else if inner.is_paused {
                Some(SkipReason::Paused)
            } else if inner.items.is_empty() {
                Some(SkipReason::Empty)
            } else {
                None
            };
            if let Some(reason) = skip {
                debug!(?reason, "drain skipped");
                return Ok(DrainOutcome::Skipped(reason));
            }

            inner.is_processing = true;
            self.publish(&inner);
            self.plan_batches(&inner)
        };

        let _processing = ProcessingGuard { queue: self };
        let total = batches.len();
        let mut items = 0;
        let mut responses = Vec::with_capacity(total);

        for (index, (last_seq, batch)) in batches.into_iter().enumerate() {
            if index > 0 && !self.config.batch_gap.is_zero() {
                tokio::time::sleep(self.config.batch_gap).await;
            }

            let response = match tokio::time::timeout(
                self.config.batch_timeout,
                self.backend.analyze_batch(&batch),
            )
            .await
            {
                Ok(Ok(response)) => response,
                Ok(Err(err)) => {
                    warn!(batch = index + 1, total, error = %err, "snapshot batch failed");
                    return Err(err);
                }
                Err(_) => {
                    let timeout_ms = self.config.batch_timeout.as_millis() as u64;
                    warn!(batch = index + 1, total, timeout_ms, "snapshot batch timed out");
                    return Err(SyncError::Timeout(timeout_ms));
                }
            };

            {
                let mut inner = self.lock()?;
                inner.remove_through(last_seq);
                self.publish(&inner);
            }

            items += batch.len();
            responses.push(response);
        }

        info!(batches = total, items, "snapshot queue drained");
        Ok(DrainOutcome::Completed {
            batches: total,
            items,
            responses,
        })
    }

    fn plan_batches(&self, inner: &QueueInner) -> Vec<(u64, AnalysisBatch)> {
        let entries: Vec<&Entry> = inner.items.iter().collect();
        entries
            .chunks(self.config.batch_size)
            .filter_map(|chunk| {
                let last_seq = chunk.last()?.seq;
                let batch = AnalysisBatch::from_items(chunk.iter().map(|entry| &entry.item));
                Some((last_seq, batch))
            })
            .collect()
    }

    fn set_paused(&self, paused: bool) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.is_paused != paused {
            inner.is_paused = paused;
            info!(paused, "snapshot processing toggled");
            self.publish(&inner);
        }
        Ok(())
    }

    fn publish(&self, inner: &QueueInner) {
        self.status.send_replace(inner.status());
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueInner>> {
        self.inner
            .lock()
            .map_err(|_| SyncError::msg("capture queue has been poisoned"))
    }
}

impl fmt::Debug for CaptureQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureQueue")
            .field("config", &self.config)
            .field("status", &self.status())
            .finish()
    }
}

/// Clears `is_processing` when a drain finishes, fails or is cancelled.
struct ProcessingGuard<'a> {
    queue: &'a CaptureQueue,
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.queue.inner.lock() {
            inner.is_processing = false;
            self.queue.publish(&inner);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::{ManualClock, SnapshotPayload};

    /// Records batches and fails the configured call (1-based).
    #[derive(Default)]
    struct RecordingBackend {
        batches: Mutex<Vec<Vec<u64>>>,
        calls: AtomicUsize,
        fail_on: Option<usize>,
        stall: bool,
    }

    impl RecordingBackend {
        fn failing_on(call: usize) -> Self {
            Self {
                fail_on: Some(call),
                ..Default::default()
            }
        }

        fn batches(&self) -> Vec<Vec<u64>> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AnalysisBackend for RecordingBackend {
        async fn analyze_batch(&self, batch: &AnalysisBatch) -> Result<AnalysisResponse> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.stall {
                std::future::pending::<()>().await;
            }
            if self.fail_on == Some(call) {
                return Err(SyncError::Transport("503 Service Unavailable".into()));
            }
            let stamps = batch.snapshots.iter().map(|s| s.timestamp).collect();
            self.batches.lock().unwrap().push(stamps);
            Ok(serde_json::json!({ "batch": call }))
        }

        async fn analyze_one(&self, snapshot: &SnapshotPayload) -> Result<AnalysisResponse> {
            Ok(serde_json::json!({ "timestamp": snapshot.timestamp }))
        }
    }

    fn queue_with(
        config: QueueConfig,
        backend: Arc<RecordingBackend>,
    ) -> (CaptureQueue, ManualClock) {
        let clock = ManualClock::new(1_000);
        let queue = CaptureQueue::new(config, Arc::new(clock.clone()), backend).unwrap();
        (queue, clock)
    }

    fn config(max_size: usize, batch_size: usize) -> QueueConfig {
        QueueConfig {
            max_size,
            min_spacing_ms: 100,
            batch_size,
            batch_timeout: Duration::from_secs(1),
            batch_gap: Duration::ZERO,
        }
    }

    fn fill(queue: &CaptureQueue, clock: &ManualClock, count: usize) {
        for frame in 0..count {
            assert!(queue
                .enqueue(format!("frame-{frame}").into_bytes(), Metadata::new())
                .unwrap());
            clock.advance(200);
        }
    }

    #[test]
    fn rejects_invalid_configuration() {
        let backend = Arc::new(RecordingBackend::default());
        let clock = Arc::new(ManualClock::new(0));
        assert!(CaptureQueue::new(config(0, 5), clock.clone(), backend.clone()).is_err());
        assert!(CaptureQueue::new(config(10, 0), clock, backend).is_err());
    }

    #[test]
    fn keeps_only_the_newest_frames() {
        let (queue, clock) = queue_with(config(10, 5), Arc::new(RecordingBackend::default()));
        fill(&queue, &clock, 15);

        let items = queue.items().unwrap();
        assert_eq!(items.len(), 10);
        assert_eq!(items[0].payload, Bytes::from("frame-5"));
        assert_eq!(items[9].payload, Bytes::from("frame-14"));

        let status = queue.status();
        assert_eq!(status.size, 10);
        assert_eq!(status.evicted, 5);
        assert_eq!(status.total_accepted, 15);
    }

    #[test]
    fn throttles_closely_spaced_frames() {
        let (queue, clock) = queue_with(config(10, 5), Arc::new(RecordingBackend::default()));
        assert!(queue.enqueue(Bytes::from_static(b"a"), Metadata::new()).unwrap());
        clock.advance(50);
        assert!(!queue.enqueue(Bytes::from_static(b"b"), Metadata::new()).unwrap());
        assert_eq!(queue.status().size, 1);
        assert_eq!(queue.status().dropped, 1);

        clock.advance(50);
        assert!(queue.enqueue(Bytes::from_static(b"c"), Metadata::new()).unwrap());
        assert_eq!(queue.status().size, 2);
    }

    #[test]
    fn stamps_items_with_clock_and_metadata() {
        let (queue, _clock) = queue_with(config(4, 2), Arc::new(RecordingBackend::default()));
        let mut metadata = Metadata::new();
        metadata.insert("beat".into(), serde_json::json!(12));
        queue.enqueue(Bytes::from_static(b"x"), metadata.clone()).unwrap();

        let items = queue.items().unwrap();
        assert_eq!(items[0].timestamp, 1_000);
        assert_eq!(items[0].metadata, metadata);
    }

    #[tokio::test]
    async fn drains_in_sequential_batches() {
        let backend = Arc::new(RecordingBackend::default());
        let (queue, clock) = queue_with(config(20, 5), backend.clone());
        fill(&queue, &clock, 12);

        let outcome = queue.drain().await.unwrap();
        match outcome {
            DrainOutcome::Completed {
                batches,
                items,
                responses,
            } => {
                assert_eq!(batches, 3);
                assert_eq!(items, 12);
                assert_eq!(responses.len(), 3);
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        let sizes: Vec<usize> = backend.batches().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![5, 5, 2]);
        assert_eq!(backend.batches()[0][0], 1_000);
        assert_eq!(queue.status().size, 0);
        assert!(!queue.status().is_processing);
    }

    #[tokio::test]
    async fn paused_drain_touches_nothing() {
        let backend = Arc::new(RecordingBackend::default());
        let (queue, clock) = queue_with(config(10, 5), backend.clone());
        fill(&queue, &clock, 3);
        queue.pause().unwrap();

        let outcome = queue.drain().await.unwrap();
        assert_eq!(outcome, DrainOutcome::Skipped(SkipReason::Paused));
        assert_eq!(queue.status().size, 3);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);

        // Buffering continues while paused.
        assert!(queue.enqueue(Bytes::from_static(b"late"), Metadata::new()).unwrap());
        assert_eq!(queue.status().size, 4);

        queue.resume().unwrap();
        queue.drain().await.unwrap();
        assert_eq!(queue.status().size, 0);
    }

    #[tokio::test]
    async fn empty_drain_is_skipped() {
        let backend = Arc::new(RecordingBackend::default());
        let (queue, _) = queue_with(config(10, 5), backend);
        assert_eq!(
            queue.drain().await.unwrap(),
            DrainOutcome::Skipped(SkipReason::Empty)
        );
    }

    #[tokio::test]
    async fn failed_batch_keeps_the_remainder() {
        let backend = Arc::new(RecordingBackend::failing_on(2));
        let (queue, clock) = queue_with(config(20, 5), backend.clone());
        fill(&queue, &clock, 15);
        let stamps: Vec<u64> = queue.items().unwrap().iter().map(|i| i.timestamp).collect();

        let err = queue.drain().await.unwrap_err();
        assert!(err.is_transport());

        let remaining: Vec<u64> = queue.items().unwrap().iter().map(|i| i.timestamp).collect();
        assert_eq!(remaining, stamps[5..]);
        assert!(!queue.status().is_processing);

        // The next drain retries what is left.
        queue.drain().await.unwrap();
        assert_eq!(queue.status().size, 0);
        let sent: Vec<u64> = backend.batches().into_iter().flatten().collect();
        assert_eq!(sent, stamps);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_batch_times_out() {
        let backend = Arc::new(RecordingBackend {
            stall: true,
            ..Default::default()
        });
        let (queue, clock) = queue_with(config(10, 5), backend);
        fill(&queue, &clock, 2);

        let err = queue.drain().await.unwrap_err();
        assert!(matches!(err, SyncError::Timeout(1_000)));
        assert_eq!(queue.status().size, 2);
        assert!(!queue.status().is_processing);
    }

    #[tokio::test]
    async fn clear_empties_regardless_of_pause() {
        let backend = Arc::new(RecordingBackend::default());
        let (queue, clock) = queue_with(config(10, 5), backend);
        fill(&queue, &clock, 4);
        queue.pause().unwrap();
        queue.clear().unwrap();
        assert_eq!(queue.status().size, 0);
        assert!(queue.status().is_paused);
    }

    #[tokio::test]
    async fn watchers_see_status_changes() {
        let backend = Arc::new(RecordingBackend::default());
        let (queue, clock) = queue_with(config(10, 5), backend);
        let mut status = queue.subscribe();

        fill(&queue, &clock, 2);
        assert!(status.has_changed().unwrap());
        assert_eq!(status.borrow_and_update().size, 2);

        queue.pause().unwrap();
        assert!(status.borrow_and_update().is_paused);
    }

    #[tokio::test]
    async fn concurrent_drain_is_skipped() {
        let backend = Arc::new(RecordingBackend {
            stall: true,
            ..Default::default()
        });
        let (queue, clock) = queue_with(config(10, 5), backend.clone());
        fill(&queue, &clock, 3);
        let queue = Arc::new(queue);

        let running = tokio::spawn({
            let queue = queue.clone();
            async move { queue.drain().await }
        });
        while !queue.status().is_processing {
            tokio::task::yield_now().await;
        }

        assert_eq!(
            queue.drain().await.unwrap(),
            DrainOutcome::Skipped(SkipReason::AlreadyProcessing)
        );
        // Enqueue keeps working during a drain.
        assert!(queue.enqueue(Bytes::from_static(b"more"), Metadata::new()).unwrap());

        running.abort();
        let _ = running.await;
        assert!(!queue.status().is_processing);
        assert_eq!(queue.status().size, 4);
    }
}
