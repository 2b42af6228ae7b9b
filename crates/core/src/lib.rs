//! Media sync and capture core for the Dance Trainer.
//!
//! The crate keeps a reference video, a derived beat clock and a live camera
//! feed consistent with each other. Each module owns a distinct subsystem:
//! beat arithmetic, playback synchronisation, the snapshot capture queue and
//! the contract with the external pose analysis service. A
//! [`PracticeSession`] wires them together; nothing here is a process-wide
//! singleton, so every piece can be constructed and tested in isolation.

pub mod analysis;
pub mod beat;
pub mod capture;
pub mod clock;
pub mod config;
pub mod error;
pub mod playback;
pub mod session;

pub use analysis::{
    AnalysisBackend, AnalysisBatch, AnalysisResponse, HttpAnalysisBackend, SnapshotPayload,
};
pub use beat::{
    classify_timing, compute_beat, compute_beat_progress, compute_time_to_next_beat,
    segment_for_beat, BeatClock, BeatState, BeatTracker, BeatUpdate, Segment, SegmentPosition,
    Timing,
};
pub use capture::driver::{AutoCapture, CapturedFrame, DriverStatus, FrameSource};
pub use capture::{
    CaptureItem, CaptureQueue, DrainOutcome, Metadata, QueueConfig, QueueStatus, SkipReason,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AnalysisConfig, AppConfig, BeatConfig, CaptureConfig, PlaybackConfig};
pub use error::{Result, SyncError};
pub use playback::{
    MediaDevice, PlaybackEvent, PlaybackSession, PlaybackState, PlaybackSynchronizer,
};
pub use session::{PracticeSession, SessionEvent, SESSION_ID_KEY, VIDEO_TIMESTAMP_KEY};
