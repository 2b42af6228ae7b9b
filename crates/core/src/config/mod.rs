use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{Result, Segment, SyncError};

/// Top-level configuration structure for a practice session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub beat: BeatConfig,
    pub playback: PlaybackConfig,
    pub capture: CaptureConfig,
    pub analysis: AnalysisConfig,
}

impl AppConfig {
    /// Parses a JSON document. Missing sections fall back to their defaults.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        self.beat.validate()?;
        self.playback.validate()?;
        self.capture.validate()?;
        if self.analysis.endpoint.trim().is_empty() {
            return Err(SyncError::config("analysis endpoint must not be empty"));
        }
        Ok(())
    }
}

/// Tempo and layout of the routine being practised.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeatConfig {
    pub bpm: f64,
    pub total_beats: usize,
    /// Distance from a beat boundary (as a fraction of a beat) still counted
    /// as "on beat".
    pub on_beat_epsilon: f64,
    pub timing_threshold_secs: f64,
    pub segments: Vec<Segment>,
}

impl Default for BeatConfig {
    fn default() -> Self {
        Self {
            bpm: 120.0,
            total_beats: 48,
            on_beat_epsilon: 0.1,
            timing_threshold_secs: 0.1,
            segments: Vec::new(),
        }
    }
}

impl BeatConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.bpm.is_finite() && self.bpm > 0.0) {
            return Err(SyncError::config(format!(
                "bpm must be positive, got {}",
                self.bpm
            )));
        }
        if self.total_beats == 0 {
            return Err(SyncError::config("total_beats must be at least 1"));
        }
        if !(0.0..=0.5).contains(&self.on_beat_epsilon) {
            return Err(SyncError::config("on_beat_epsilon must be within [0, 0.5]"));
        }
        if !(self.timing_threshold_secs.is_finite() && self.timing_threshold_secs > 0.0) {
            return Err(SyncError::config("timing_threshold_secs must be positive"));
        }
        if self.segments.iter().any(|segment| segment.beat_count == 0) {
            return Err(SyncError::config("segments must contain at least one beat"));
        }
        Ok(())
    }
}

/// Tolerances used when reconciling requested and observed playback time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub seek_grace_ms: u64,
    pub seek_tolerance_secs: f64,
    pub end_tolerance_secs: f64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            seek_grace_ms: 100,
            seek_tolerance_secs: 0.1,
            end_tolerance_secs: 0.1,
        }
    }
}

impl PlaybackConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("seek_tolerance_secs", self.seek_tolerance_secs),
            ("end_tolerance_secs", self.end_tolerance_secs),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(SyncError::config(format!("{name} must be positive")));
            }
        }
        Ok(())
    }
}

/// Capture cadence, queue bounds and batching for outbound snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub max_size: usize,
    pub min_spacing_ms: u64,
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    /// Pause between consecutive batches of one drain.
    pub batch_gap_ms: u64,
    pub capture_interval_ms: u64,
    pub feedback_history: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            min_spacing_ms: 100,
            batch_size: 5,
            batch_timeout_ms: 10_000,
            batch_gap_ms: 100,
            capture_interval_ms: 500,
            feedback_history: 10,
        }
    }
}

impl CaptureConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_size < 1 {
            return Err(SyncError::config("max_size must be at least 1"));
        }
        if self.batch_size < 1 {
            return Err(SyncError::config("batch_size must be at least 1"));
        }
        if self.batch_timeout_ms == 0 {
            return Err(SyncError::config("batch_timeout_ms must be positive"));
        }
        if self.capture_interval_ms == 0 {
            return Err(SyncError::config("capture_interval_ms must be positive"));
        }
        Ok(())
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn batch_gap(&self) -> Duration {
        Duration::from_millis(self.batch_gap_ms)
    }

    pub fn capture_interval(&self) -> Duration {
        Duration::from_millis(self.capture_interval_ms)
    }
}

/// Location of the external pose analysis service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub endpoint: String,
    /// Tagged onto every frame sent through a [`crate::PracticeSession`] so
    /// the service can group snapshots per practice run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8000/api/analyze-pose".to_string(),
            session_id: None,
        }
    }
}
