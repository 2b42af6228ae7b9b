use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{CaptureQueue, Metadata};
use crate::{Result, SyncError};

/// A frame grabbed from the camera.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedFrame {
    pub payload: Bytes,
    pub metadata: Metadata,
}

impl CapturedFrame {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            metadata: Metadata::new(),
        }
    }
}

/// Camera wrapper the driver pulls frames from. `Ok(None)` means no frame is
/// available yet (stream still warming up, element not mounted).
#[async_trait]
pub trait FrameSource: Send + Sync {
    async fn capture(&self) -> Result<Option<CapturedFrame>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverStatus {
    pub is_running: bool,
    pub is_paused: bool,
    pub captured: u64,
    pub accepted: u64,
    pub failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    paused: AtomicBool,
    captured: AtomicU64,
    accepted: AtomicU64,
    failures: AtomicU64,
}

/// Periodically captures a frame and pushes it into a [`CaptureQueue`].
///
/// Only one capture is ever in flight: a tick that arrives while the previous
/// capture is still running is skipped rather than queued.
pub struct AutoCapture {
    queue: Arc<CaptureQueue>,
    source: Arc<dyn FrameSource>,
    interval: Duration,
    counters: Arc<Counters>,
    task: Option<JoinHandle<()>>,
}

impl AutoCapture {
    pub fn new(
        queue: Arc<CaptureQueue>,
        source: Arc<dyn FrameSource>,
        interval: Duration,
    ) -> Result<Self> {
        if interval.is_zero() {
            return Err(SyncError::config("capture interval must be positive"));
        }
        Ok(Self {
            queue,
            source,
            interval,
            counters: Arc::new(Counters::default()),
            task: None,
        })
    }

    /// Spawns the capture loop on the current Tokio runtime. Calling it while
    /// already running does nothing.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }

        info!(interval_ms = self.interval.as_millis() as u64, "starting auto capture");
        self.counters.paused.store(false, Ordering::SeqCst);
        let queue = self.queue.clone();
        let source = self.source.clone();
        let counters = self.counters.clone();
        let interval = self.interval;

        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                if counters.paused.load(Ordering::SeqCst) {
                    continue;
                }
                capture_once(&queue, source.as_ref(), &counters).await;
            }
        }));
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            info!("auto capture stopped");
        }
    }

    /// Keeps the loop alive but skips captures until [`Self::resume`].
    pub fn pause(&self) {
        self.counters.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.counters.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn status(&self) -> DriverStatus {
        DriverStatus {
            is_running: self.is_running(),
            is_paused: self.counters.paused.load(Ordering::SeqCst),
            captured: self.counters.captured.load(Ordering::SeqCst),
            accepted: self.counters.accepted.load(Ordering::SeqCst),
            failures: self.counters.failures.load(Ordering::SeqCst),
        }
    }
}

async fn capture_once(queue: &CaptureQueue, source: &dyn FrameSource, counters: &Counters) {
    let frame = match source.capture().await {
        Ok(Some(frame)) => frame,
        Ok(None) => {
            debug!("no frame available");
            return;
        }
        Err(err) => {
            counters.failures.fetch_add(1, Ordering::SeqCst);
            warn!(error = %err, "frame capture failed");
            return;
        }
    };

    counters.captured.fetch_add(1, Ordering::SeqCst);
    match queue.enqueue(frame.payload, frame.metadata) {
        Ok(true) => {
            counters.accepted.fetch_add(1, Ordering::SeqCst);
        }
        Ok(false) => {}
        Err(err) => {
            counters.failures.fetch_add(1, Ordering::SeqCst);
            warn!(error = %err, "failed to queue frame");
        }
    }
}

impl Drop for AutoCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for AutoCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoCapture")
            .field("interval", &self.interval)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::{
        AnalysisBackend, AnalysisBatch, AnalysisResponse, ManualClock, QueueConfig,
        SnapshotPayload,
    };

    struct NullBackend;

    #[async_trait]
    impl AnalysisBackend for NullBackend {
        async fn analyze_batch(&self, _batch: &AnalysisBatch) -> Result<AnalysisResponse> {
            Ok(serde_json::Value::Null)
        }

        async fn analyze_one(&self, _snapshot: &SnapshotPayload) -> Result<AnalysisResponse> {
            Ok(serde_json::Value::Null)
        }
    }

    #[derive(Default)]
    struct SlowCamera {
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    #[async_trait]
    impl FrameSource for SlowCamera {
        async fn capture(&self) -> Result<Option<CapturedFrame>> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(Some(CapturedFrame::new(Bytes::from_static(b"jpeg"))))
        }
    }

    fn queue() -> Arc<CaptureQueue> {
        let config = QueueConfig {
            min_spacing_ms: 0,
            ..Default::default()
        };
        Arc::new(
            CaptureQueue::new(config, Arc::new(ManualClock::new(0)), Arc::new(NullBackend))
                .unwrap(),
        )
    }

    #[test]
    fn rejects_zero_interval() {
        let camera = Arc::new(SlowCamera::default());
        assert!(AutoCapture::new(queue(), camera, Duration::ZERO).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn captures_on_every_tick() {
        let queue = queue();
        let camera = Arc::new(SlowCamera::default());
        let mut driver =
            AutoCapture::new(queue.clone(), camera, Duration::from_millis(500)).unwrap();

        driver.start();
        tokio::time::sleep(Duration::from_millis(1_250)).await;

        let status = driver.status();
        assert!(status.is_running);
        assert_eq!(status.captured, 3);
        assert_eq!(status.accepted, 3);
        assert_eq!(queue.status().size, 3);

        driver.stop();
        tokio::time::sleep(Duration::from_millis(2_000)).await;
        assert!(!driver.is_running());
        assert_eq!(queue.status().size, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn paused_driver_skips_ticks() {
        let queue = queue();
        let camera = Arc::new(SlowCamera::default());
        let mut driver =
            AutoCapture::new(queue.clone(), camera, Duration::from_millis(500)).unwrap();

        driver.start();
        tokio::time::sleep(Duration::from_millis(250)).await;
        driver.pause();
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(driver.status().captured, 1);
        assert!(driver.status().is_paused);

        driver.resume();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(driver.status().captured, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_camera_never_overlaps() {
        let queue = queue();
        let camera = Arc::new(SlowCamera {
            delay: Duration::from_millis(1_200),
            ..Default::default()
        });
        let mut driver =
            AutoCapture::new(queue, camera.clone(), Duration::from_millis(500)).unwrap();

        driver.start();
        tokio::time::sleep(Duration::from_millis(5_000)).await;
        driver.stop();

        assert_eq!(camera.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(driver.status().captured >= 3);
    }
}
