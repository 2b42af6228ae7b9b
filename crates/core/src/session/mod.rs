//! Ties the beat clock, the playback synchronizer and the capture queue into
//! one practice session.
//!
//! Playback state is the back-pressure lever: while the reference video is
//! not playing there is nothing to compare against, so the capture queue is
//! paused and keeps buffering without spending analysis requests.

use std::{collections::VecDeque, sync::Arc};

use bytes::Bytes;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, info, warn};

use crate::{
    AnalysisBackend, AnalysisResponse, AppConfig, BeatClock, BeatState, BeatTracker, CaptureItem,
    CaptureQueue, Clock, DrainOutcome, MediaDevice, Metadata, PlaybackEvent, PlaybackState,
    PlaybackSynchronizer, QueueConfig, Result, SnapshotPayload,
};

/// Metadata key carrying the reference video time a frame was captured at.
pub const VIDEO_TIMESTAMP_KEY: &str = "video_timestamp";
/// Metadata key carrying the configured analysis session id.
pub const SESSION_ID_KEY: &str = "session_id";

/// What changed while processing pending playback events.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Beat(BeatState),
    BeatChanged(usize),
    SegmentChanged(usize),
    StateChanged(PlaybackState),
    Ended,
    Failed(String),
}

pub struct PracticeSession {
    synchronizer: PlaybackSynchronizer,
    queue: Arc<CaptureQueue>,
    backend: Arc<dyn AnalysisBackend>,
    clock: Arc<dyn Clock>,
    session_id: Option<String>,
    tracker: BeatTracker,
    events: broadcast::Receiver<PlaybackEvent>,
    beat: BeatState,
    ended_reported: bool,
    feedback: VecDeque<AnalysisResponse>,
    history_limit: usize,
    last_error: Option<String>,
}

impl PracticeSession {
    pub fn new(
        config: &AppConfig,
        device: Box<dyn MediaDevice>,
        backend: Arc<dyn AnalysisBackend>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let beat_clock = BeatClock::new(&config.beat)?;
        let synchronizer =
            PlaybackSynchronizer::new(device, clock.clone(), config.playback.clone())?;
        let queue = CaptureQueue::new(
            QueueConfig::from(&config.capture),
            clock.clone(),
            backend.clone(),
        )?;
        // Nothing to analyse until the reference starts playing.
        queue.pause()?;

        let events = synchronizer.subscribe();
        Ok(Self {
            synchronizer,
            queue: Arc::new(queue),
            backend,
            clock,
            session_id: config.analysis.session_id.clone(),
            beat: beat_clock.state_at(0.0),
            ended_reported: false,
            tracker: BeatTracker::new(beat_clock),
            events,
            feedback: VecDeque::new(),
            history_limit: config.capture.feedback_history,
            last_error: None,
        })
    }

    pub fn synchronizer(&self) -> &PlaybackSynchronizer {
        &self.synchronizer
    }

    /// Mutable access for issuing play, pause and seek requests and for
    /// forwarding device callbacks. Call [`Self::pump`] afterwards.
    pub fn synchronizer_mut(&mut self) -> &mut PlaybackSynchronizer {
        &mut self.synchronizer
    }

    /// Shared handle for capture drivers.
    pub fn queue(&self) -> Arc<CaptureQueue> {
        self.queue.clone()
    }

    pub fn beat_state(&self) -> BeatState {
        self.beat
    }

    pub fn beat_clock(&self) -> &BeatClock {
        self.tracker.clock()
    }

    /// Applies every playback event published since the last call: derives the
    /// beat state from time updates and pauses or resumes the capture queue
    /// to follow the reference video.
    ///
    /// If the event channel overflowed, the session is resynchronised from the
    /// synchronizer's current state once the backlog is consumed.
    pub fn pump(&mut self) -> Result<Vec<SessionEvent>> {
        let mut out = Vec::new();
        let mut lagged = false;
        loop {
            let event = match self.events.try_recv() {
                Ok(event) => event,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "playback events lagged; resyncing from session");
                    lagged = true;
                    continue;
                }
            };

            match event {
                PlaybackEvent::TimeUpdate(time) => self.apply_time(time, &mut out),
                PlaybackEvent::StateChanged(state) => self.apply_state(state, &mut out)?,
                PlaybackEvent::Ended => self.report_ended(&mut out),
                PlaybackEvent::Failed(message) => self.report_failure(message, &mut out),
            }
        }

        if lagged {
            self.resync(&mut out)?;
        }
        Ok(out)
    }

    /// Queues a frame tagged with the reference video time and session id.
    /// Keys already present in `metadata` are left alone.
    pub fn capture(&self, payload: impl Into<Bytes>, metadata: Metadata) -> Result<bool> {
        self.queue.enqueue(payload, self.tag(metadata))
    }

    /// Sends one tagged frame straight to the analysis service, bypassing the
    /// queue, and records the response as feedback.
    pub async fn analyze_now(
        &mut self,
        payload: impl Into<Bytes>,
        metadata: Metadata,
    ) -> Result<AnalysisResponse> {
        let mut item = CaptureItem::new(self.clock.now_ms(), payload);
        item.metadata = self.tag(metadata);
        match self
            .backend
            .analyze_one(&SnapshotPayload::from_item(&item))
            .await
        {
            Ok(response) => {
                self.push_feedback(response.clone());
                self.last_error = None;
                Ok(response)
            }
            Err(err) => {
                self.last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    /// Drains the capture queue and records the responses as feedback.
    pub async fn drain_feedback(&mut self) -> Result<DrainOutcome> {
        match self.queue.drain().await {
            Ok(outcome) => {
                if let DrainOutcome::Completed { responses, .. } = &outcome {
                    for response in responses {
                        self.push_feedback(response.clone());
                    }
                    self.last_error = None;
                }
                Ok(outcome)
            }
            Err(err) => {
                self.last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    /// Most recent responses, oldest first.
    pub fn feedback_history(&self) -> impl Iterator<Item = &AnalysisResponse> {
        self.feedback.iter()
    }

    pub fn latest_feedback(&self) -> Option<&AnalysisResponse> {
        self.feedback.back()
    }

    pub fn clear_feedback(&mut self) {
        self.feedback.clear();
    }

    /// Last device or transport error, cleared by a successful drain.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn tag(&self, mut metadata: Metadata) -> Metadata {
        metadata
            .entry(VIDEO_TIMESTAMP_KEY.to_string())
            .or_insert_with(|| serde_json::json!(self.synchronizer.current_time()));
        if let Some(session_id) = &self.session_id {
            metadata
                .entry(SESSION_ID_KEY.to_string())
                .or_insert_with(|| serde_json::json!(session_id));
        }
        metadata
    }

    fn apply_state(&mut self, state: PlaybackState, out: &mut Vec<SessionEvent>) -> Result<()> {
        match state {
            PlaybackState::Playing => self.queue.resume()?,
            _ => self.queue.pause()?,
        }
        if matches!(state, PlaybackState::Ready | PlaybackState::Loading) {
            self.tracker.reset();
            self.ended_reported = false;
        }
        out.push(SessionEvent::StateChanged(state));
        Ok(())
    }

    fn report_ended(&mut self, out: &mut Vec<SessionEvent>) {
        if self.ended_reported {
            return;
        }
        self.ended_reported = true;
        info!("practice run finished");
        out.push(SessionEvent::Ended);
    }

    fn report_failure(&mut self, message: String, out: &mut Vec<SessionEvent>) {
        self.last_error = Some(message.clone());
        out.push(SessionEvent::Failed(message));
    }

    /// Rebuilds derived state from the synchronizer after dropped events.
    fn resync(&mut self, out: &mut Vec<SessionEvent>) -> Result<()> {
        let state = self.synchronizer.state();
        let time = self.synchronizer.current_time();
        self.apply_state(state, out)?;
        self.apply_time(time, out);
        match state {
            PlaybackState::Ended => self.report_ended(out),
            PlaybackState::Failed => {
                let message = self.synchronizer.error().unwrap_or("media device failed");
                if self.last_error.as_deref() != Some(message) {
                    let message = message.to_string();
                    self.report_failure(message, out);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn apply_time(&mut self, time: f64, out: &mut Vec<SessionEvent>) {
        let update = self.tracker.update(time);
        self.beat = update.state;
        if let Some(beat) = update.beat_changed {
            debug!(beat, "beat changed");
            out.push(SessionEvent::BeatChanged(beat));
        }
        if let Some(segment) = update.segment_changed {
            debug!(segment, "segment changed");
            out.push(SessionEvent::SegmentChanged(segment));
        }
        out.push(SessionEvent::Beat(update.state));
    }

    fn push_feedback(&mut self, response: AnalysisResponse) {
        if self.history_limit == 0 {
            return;
        }
        while self.feedback.len() >= self.history_limit {
            self.feedback.pop_front();
        }
        self.feedback.push_back(response);
    }
}

impl std::fmt::Debug for PracticeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PracticeSession")
            .field("synchronizer", &self.synchronizer)
            .field("queue", &self.queue)
            .field("beat", &self.beat)
            .field("session_id", &self.session_id)
            .field("feedback", &self.feedback.len())
            .field("last_error", &self.last_error)
            .finish()
    }
}
