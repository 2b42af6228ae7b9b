//! Reconciles caller intent (play, pause, seek) with what the media device
//! actually reports.
//!
//! Devices advance their own time and broadcast it asynchronously. Blindly
//! mirroring requested time into the device and device time back out creates
//! a loop, so programmatic seeks open a short grace window during which stale
//! device time updates are ignored.

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{Clock, PlaybackConfig, Result, SyncError};

const EVENT_CAPACITY: usize = 256;
/// Float slack when comparing a reported time against a seek target.
const TARGET_SLACK_SECS: f64 = 1e-6;

/// Lifecycle of the reference media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    /// No media attached.
    Idle,
    /// Media attached, duration not yet known.
    Loading,
    Ready,
    Playing,
    Paused,
    /// Playback reached the end; cleared only by [`PlaybackSynchronizer::reset`].
    Ended,
    /// The device reported an error. Requires a fresh attach.
    Failed,
}

impl PlaybackState {
    /// Whether the duration is known and the media accepts seeks.
    pub fn is_seekable(self) -> bool {
        matches!(self, Self::Ready | Self::Playing | Self::Paused)
    }
}

/// Observable view of the synchronizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackSession {
    pub source: Option<String>,
    pub state: PlaybackState,
    pub current_time: f64,
    pub duration: f64,
    pub is_playing: bool,
    pub playback_rate: f64,
    pub is_seeking: bool,
}

impl Default for PlaybackSession {
    fn default() -> Self {
        Self {
            source: None,
            state: PlaybackState::Idle,
            current_time: 0.0,
            duration: 0.0,
            is_playing: false,
            playback_rate: 1.0,
            is_seeking: false,
        }
    }
}

/// Notifications published to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    StateChanged(PlaybackState),
    TimeUpdate(f64),
    /// Fired exactly once per pass through the media.
    Ended,
    Failed(String),
}

/// Commands the synchronizer issues to the playback device. Results of the
/// commands come back asynchronously through the `on_device_*` callbacks of
/// [`PlaybackSynchronizer`]; a returned error means the command could not be
/// issued at all.
pub trait MediaDevice: Send {
    fn load(&mut self, source: &str) -> Result<()>;
    fn play(&mut self) -> Result<()>;
    fn pause(&mut self) -> Result<()>;
    fn seek(&mut self, time: f64) -> Result<()>;
    fn set_playback_rate(&mut self, rate: f64) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Intent {
    Play,
    Pause,
}

#[derive(Debug, Clone, Copy)]
struct PendingSeek {
    target: f64,
    issued_at_ms: u64,
}

/// Owns the authoritative playback time for one media device.
pub struct PlaybackSynchronizer {
    device: Box<dyn MediaDevice>,
    clock: Arc<dyn Clock>,
    config: PlaybackConfig,
    session: PlaybackSession,
    intent: Option<Intent>,
    seek: Option<PendingSeek>,
    last_device_time: Option<f64>,
    error: Option<String>,
    events: broadcast::Sender<PlaybackEvent>,
}

impl PlaybackSynchronizer {
    pub fn new(
        device: Box<dyn MediaDevice>,
        clock: Arc<dyn Clock>,
        config: PlaybackConfig,
    ) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            device,
            clock,
            config,
            session: PlaybackSession::default(),
            intent: None,
            seek: None,
            last_device_time: None,
            error: None,
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.events.subscribe()
    }

    pub fn session(&self) -> &PlaybackSession {
        &self.session
    }

    pub fn state(&self) -> PlaybackState {
        self.session.state
    }

    pub fn current_time(&self) -> f64 {
        self.session.current_time
    }

    pub fn is_seeking(&self) -> bool {
        self.session.is_seeking
    }

    /// Error reported by the device when the state is [`PlaybackState::Failed`].
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Attaches a new media source, discarding any previous session.
    pub fn attach(&mut self, source: impl Into<String>) -> Result<()> {
        let source = source.into();
        info!(%source, "attaching media source");

        let rate = self.session.playback_rate;
        self.session = PlaybackSession {
            source: Some(source.clone()),
            playback_rate: rate,
            ..Default::default()
        };
        self.intent = None;
        self.seek = None;
        self.last_device_time = None;
        self.error = None;
        self.set_state(PlaybackState::Loading);

        self.device_call(|device| device.load(&source))
    }

    /// Records the media duration once the device has parsed it.
    pub fn on_metadata_ready(&mut self, duration: f64) -> Result<()> {
        if self.session.state != PlaybackState::Loading {
            debug!(duration, state = ?self.session.state, "ignoring metadata outside loading");
            return Ok(());
        }
        if !(duration.is_finite() && duration >= 0.0) {
            let message = format!("device reported invalid duration {duration}");
            self.fail(message.clone());
            return Err(SyncError::Device(message));
        }

        self.session.duration = duration;
        self.set_state(PlaybackState::Ready);
        Ok(())
    }

    /// Asks the device to start playing. The session only reports
    /// [`PlaybackState::Playing`] after [`Self::on_device_playing`].
    pub fn request_play(&mut self) -> Result<()> {
        match self.session.state {
            PlaybackState::Idle | PlaybackState::Loading => {
                return Err(SyncError::state("media is not ready to play"));
            }
            PlaybackState::Ended => {
                return Err(SyncError::state("playback has ended; reset before playing"));
            }
            PlaybackState::Failed => {
                return Err(SyncError::state("playback has failed"));
            }
            _ => {}
        }

        let already_playing = self.session.is_playing && self.intent != Some(Intent::Pause);
        if already_playing || self.intent == Some(Intent::Play) {
            return Ok(());
        }

        self.intent = Some(Intent::Play);
        self.device_call(|device| device.play())
    }

    /// Asks the device to pause. A no-op when nothing is playing.
    pub fn request_pause(&mut self) -> Result<()> {
        if !self.session.state.is_seekable() {
            return Ok(());
        }

        let already_paused = !self.session.is_playing && self.intent != Some(Intent::Play);
        if already_paused || self.intent == Some(Intent::Pause) {
            return Ok(());
        }

        self.intent = Some(Intent::Pause);
        self.device_call(|device| device.pause())
    }

    /// Seeks to `time`, clamped to the media duration. Returns `false` when
    /// the seek was rejected because no seekable media is attached.
    pub fn request_seek(&mut self, time: f64) -> Result<bool> {
        if !self.session.state.is_seekable() {
            debug!(time, state = ?self.session.state, "rejecting seek");
            return Ok(false);
        }
        if time.is_nan() {
            return Ok(false);
        }

        let target = time.clamp(0.0, self.session.duration);
        debug!(target, "seeking");
        self.seek = Some(PendingSeek {
            target,
            issued_at_ms: self.clock.now_ms(),
        });
        self.session.is_seeking = true;
        self.session.current_time = target;
        self.emit(PlaybackEvent::TimeUpdate(target));

        self.device_call(|device| device.seek(target))?;
        Ok(true)
    }

    /// Mirrors an externally desired time into the device, but only when it
    /// has drifted from what the device last reported by more than the seek
    /// tolerance. Returns whether a seek was issued.
    pub fn sync_to(&mut self, time: f64) -> Result<bool> {
        if self.session.is_seeking || !self.session.state.is_seekable() {
            return Ok(false);
        }
        let reference = self.last_device_time.unwrap_or(self.session.current_time);
        if (reference - time).abs() <= self.config.seek_tolerance_secs {
            return Ok(false);
        }
        self.request_seek(time)
    }

    /// Handles a time report from the device. Returns whether the report was
    /// accepted as the new current time.
    pub fn on_device_time_update(&mut self, time: f64) -> bool {
        if !self.session.state.is_seekable() || !time.is_finite() {
            return false;
        }

        if let Some(seek) = self.seek {
            let confirmed = time >= seek.target - TARGET_SLACK_SECS
                && time - seek.target <= self.config.seek_tolerance_secs;
            if !confirmed && !self.grace_expired(&seek) {
                debug!(time, target = seek.target, "ignoring stale time update during seek");
                return false;
            }
            self.finish_seek();
        }

        self.last_device_time = Some(time);
        self.session.current_time = time;
        self.emit(PlaybackEvent::TimeUpdate(time));

        let end_at = self.session.duration - self.config.end_tolerance_secs;
        if time >= end_at {
            self.end();
        }
        true
    }

    pub fn on_device_playing(&mut self) {
        if !self.session.state.is_seekable() {
            return;
        }
        if self.intent == Some(Intent::Play) {
            self.intent = None;
        }
        self.session.is_playing = true;
        self.set_state(PlaybackState::Playing);
    }

    pub fn on_device_paused(&mut self) {
        if !self.session.state.is_seekable() {
            return;
        }
        if self.intent == Some(Intent::Pause) {
            self.intent = None;
        }
        self.session.is_playing = false;
        if self.session.state == PlaybackState::Playing {
            self.set_state(PlaybackState::Paused);
        }
    }

    /// Moves to the terminal [`PlaybackState::Failed`] state. The device is
    /// not asked to reload.
    pub fn on_device_error(&mut self, message: impl Into<String>) {
        self.fail(message.into());
    }

    /// Closes an expired seek grace window even when the device has gone
    /// quiet. Returns whether a window was closed.
    pub fn poll(&mut self) -> bool {
        match self.seek {
            Some(seek) if self.grace_expired(&seek) => {
                self.finish_seek();
                true
            }
            _ => false,
        }
    }

    pub fn set_playback_rate(&mut self, rate: f64) -> Result<()> {
        if !(rate.is_finite() && rate > 0.0) {
            return Err(SyncError::config(format!(
                "playback rate must be positive, got {rate}"
            )));
        }
        self.session.playback_rate = rate;
        match self.session.state {
            PlaybackState::Idle | PlaybackState::Failed => Ok(()),
            _ => self.device_call(|device| device.set_playback_rate(rate)),
        }
    }

    /// Returns to [`PlaybackState::Ready`] at time zero and re-arms the end
    /// event. The device is paused if it was playing.
    pub fn reset(&mut self) -> Result<()> {
        match self.session.state {
            PlaybackState::Idle | PlaybackState::Loading => {
                return Err(SyncError::state("no loaded media to reset"));
            }
            PlaybackState::Failed => {
                return Err(SyncError::state("playback has failed; attach a source again"));
            }
            _ => {}
        }

        let was_playing = self.session.is_playing;
        self.intent = None;
        self.seek = None;
        self.last_device_time = None;
        self.session.is_seeking = false;
        self.session.is_playing = false;
        self.session.current_time = 0.0;
        self.set_state(PlaybackState::Ready);
        self.emit(PlaybackEvent::TimeUpdate(0.0));

        if was_playing {
            self.intent = Some(Intent::Pause);
            self.device_call(|device| device.pause())?;
        }
        Ok(())
    }

    /// Resets and rewinds the device to the beginning.
    pub fn restart(&mut self) -> Result<()> {
        self.reset()?;
        self.request_seek(0.0)?;
        Ok(())
    }

    fn grace_expired(&self, seek: &PendingSeek) -> bool {
        self.clock.now_ms().saturating_sub(seek.issued_at_ms) >= self.config.seek_grace_ms
    }

    fn finish_seek(&mut self) {
        self.seek = None;
        self.session.is_seeking = false;
    }

    fn end(&mut self) {
        info!(time = self.session.current_time, "playback ended");
        self.session.is_playing = false;
        self.intent = None;
        self.finish_seek();
        self.set_state(PlaybackState::Ended);
        self.emit(PlaybackEvent::Ended);
    }

    fn fail(&mut self, message: String) {
        warn!(error = %message, "media device failed");
        self.session.is_playing = false;
        self.intent = None;
        self.finish_seek();
        self.error = Some(message.clone());
        self.set_state(PlaybackState::Failed);
        self.emit(PlaybackEvent::Failed(message));
    }

    fn device_call(
        &mut self,
        command: impl FnOnce(&mut dyn MediaDevice) -> Result<()>,
    ) -> Result<()> {
        if let Err(err) = command(self.device.as_mut()) {
            let message = err.to_string();
            self.fail(message.clone());
            return Err(SyncError::Device(message));
        }
        Ok(())
    }

    fn set_state(&mut self, state: PlaybackState) {
        if self.session.state == state {
            return;
        }
        debug!(from = ?self.session.state, to = ?state, "playback state change");
        self.session.state = state;
        self.emit(PlaybackEvent::StateChanged(state));
    }

    fn emit(&self, event: PlaybackEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }
}

impl fmt::Debug for PlaybackSynchronizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaybackSynchronizer")
            .field("session", &self.session)
            .field("intent", &self.intent)
            .field("seek", &self.seek)
            .field("error", &self.error)
            .finish()
    }
}
