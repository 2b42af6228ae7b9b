//! Beat-domain arithmetic.
//!
//! The free functions are tolerant: a non-positive tempo or a negative time
//! maps to beat zero so that callers can render "no beat yet" while media is
//! still loading. [`BeatClock`] is the strict counterpart used once a routine
//! is configured; it refuses a non-positive tempo up front.

use serde::{Deserialize, Serialize};

use crate::{BeatConfig, Result};

const SECONDS_PER_MINUTE: f64 = 60.0;

/// Snapshot of the beat position derived from a single playback time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BeatState {
    pub current_time: f64,
    pub bpm: f64,
    pub total_beats: usize,
    pub current_beat: usize,
    pub beat_progress: f64,
    pub is_on_beat: bool,
    pub time_to_next_beat_ms: f64,
}

/// How a moment relates to the ideal time of a beat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Timing {
    OnTime,
    Ahead,
    Behind,
}

/// A contiguous group of beats within a routine (a verse, a chorus, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    #[serde(alias = "beats")]
    pub beat_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Segment {
    pub fn new(beat_count: usize) -> Self {
        Self {
            beat_count,
            label: None,
        }
    }
}

/// Location of a beat inside the segment list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentPosition {
    pub segment_index: usize,
    pub beat_in_segment: usize,
}

fn beats_elapsed(time: f64, bpm: f64) -> Option<f64> {
    if !bpm.is_finite() || bpm <= 0.0 || !time.is_finite() || time < 0.0 {
        return None;
    }
    Some(time * bpm / SECONDS_PER_MINUTE)
}

/// Index of the beat playing at `time`, clamped to `[0, total_beats - 1]`.
pub fn compute_beat(time: f64, bpm: f64, total_beats: usize) -> usize {
    let Some(beats) = beats_elapsed(time, bpm) else {
        return 0;
    };
    let last = total_beats.saturating_sub(1);
    // Float to int casts saturate, so huge times land on the clamp.
    (beats.floor() as usize).min(last)
}

/// Fractional position within the current beat, in `[0, 1)`.
pub fn compute_beat_progress(time: f64, bpm: f64) -> f64 {
    match beats_elapsed(time, bpm) {
        Some(beats) => beats.fract(),
        None => 0.0,
    }
}

/// Milliseconds until the next beat boundary.
pub fn compute_time_to_next_beat(time: f64, bpm: f64) -> f64 {
    if beats_elapsed(time, bpm).is_none() {
        return 0.0;
    }
    let progress = compute_beat_progress(time, bpm);
    (1.0 - progress) * (SECONDS_PER_MINUTE / bpm) * 1000.0
}

/// Ideal start time of `beat_index` in seconds, or `None` without a tempo.
pub fn ideal_beat_time(beat_index: usize, bpm: f64) -> Option<f64> {
    (bpm > 0.0 && bpm.is_finite()).then(|| beat_index as f64 * SECONDS_PER_MINUTE / bpm)
}

/// Compares `time` against the ideal time of `beat_index`.
///
/// Without a usable tempo there is no ideal time to miss, so the result is
/// [`Timing::OnTime`].
pub fn classify_timing(time: f64, beat_index: usize, bpm: f64, threshold_secs: f64) -> Timing {
    let Some(ideal) = ideal_beat_time(beat_index, bpm) else {
        return Timing::OnTime;
    };
    let offset = time - ideal;
    if offset.abs() < threshold_secs {
        Timing::OnTime
    } else if offset > 0.0 {
        Timing::Ahead
    } else {
        Timing::Behind
    }
}

/// Maps a routine-wide beat index onto the segment list.
///
/// Beats past the end of the routine resolve to the last segment with a
/// zero offset. Returns `None` when there are no segments.
pub fn segment_for_beat(beat_index: usize, segments: &[Segment]) -> Option<SegmentPosition> {
    let mut start = 0usize;
    for (segment_index, segment) in segments.iter().enumerate() {
        let end = start + segment.beat_count;
        if beat_index < end {
            return Some(SegmentPosition {
                segment_index,
                beat_in_segment: beat_index - start,
            });
        }
        start = end;
    }

    segments.len().checked_sub(1).map(|segment_index| SegmentPosition {
        segment_index,
        beat_in_segment: 0,
    })
}

/// Configured beat clock for one routine. Every query is a pure function of
/// its arguments and the configuration; nothing is cached between calls.
#[derive(Debug, Clone, PartialEq)]
pub struct BeatClock {
    bpm: f64,
    total_beats: usize,
    on_beat_epsilon: f64,
    timing_threshold_secs: f64,
    segments: Vec<Segment>,
}

impl BeatClock {
    pub fn new(config: &BeatConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            bpm: config.bpm,
            total_beats: config.total_beats,
            on_beat_epsilon: config.on_beat_epsilon,
            timing_threshold_secs: config.timing_threshold_secs,
            segments: config.segments.clone(),
        })
    }

    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    pub fn total_beats(&self) -> usize {
        self.total_beats
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Length of one beat in seconds.
    pub fn beat_duration(&self) -> f64 {
        SECONDS_PER_MINUTE / self.bpm
    }

    pub fn state_at(&self, time: f64) -> BeatState {
        let beat_progress = compute_beat_progress(time, self.bpm);
        BeatState {
            current_time: time,
            bpm: self.bpm,
            total_beats: self.total_beats,
            current_beat: compute_beat(time, self.bpm, self.total_beats),
            beat_progress,
            is_on_beat: beat_progress < self.on_beat_epsilon
                || beat_progress > 1.0 - self.on_beat_epsilon,
            time_to_next_beat_ms: compute_time_to_next_beat(time, self.bpm),
        }
    }

    pub fn timing(&self, time: f64, beat_index: usize) -> Timing {
        classify_timing(time, beat_index, self.bpm, self.timing_threshold_secs)
    }

    /// Absolute distance in seconds between `time` and the ideal time of
    /// `beat_index`.
    pub fn beat_offset(&self, time: f64, beat_index: usize) -> f64 {
        ideal_beat_time(beat_index, self.bpm)
            .map(|ideal| (time - ideal).abs())
            .unwrap_or(0.0)
    }

    pub fn segment_for(&self, beat_index: usize) -> Option<SegmentPosition> {
        segment_for_beat(beat_index, &self.segments)
    }
}

/// Result of feeding one time update through a [`BeatTracker`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeatUpdate {
    pub state: BeatState,
    /// Set when the beat index differs from the previous update.
    pub beat_changed: Option<usize>,
    /// Set when the segment index differs from the previous update.
    pub segment_changed: Option<usize>,
}

/// Wraps a [`BeatClock`] and reports beat and segment transitions. The only
/// remembered values are the last indices reported, used for change
/// detection; the returned state is always recomputed from the given time.
#[derive(Debug, Clone)]
pub struct BeatTracker {
    clock: BeatClock,
    last_beat: Option<usize>,
    last_segment: Option<usize>,
}

impl BeatTracker {
    pub fn new(clock: BeatClock) -> Self {
        Self {
            clock,
            last_beat: None,
            last_segment: None,
        }
    }

    pub fn clock(&self) -> &BeatClock {
        &self.clock
    }

    pub fn update(&mut self, time: f64) -> BeatUpdate {
        let state = self.clock.state_at(time);

        let beat_changed =
            (self.last_beat != Some(state.current_beat)).then_some(state.current_beat);
        self.last_beat = Some(state.current_beat);

        let segment = self
            .clock
            .segment_for(state.current_beat)
            .map(|position| position.segment_index);
        let segment_changed = match segment {
            Some(index) if self.last_segment != Some(index) => Some(index),
            _ => None,
        };
        self.last_segment = segment;

        BeatUpdate {
            state,
            beat_changed,
            segment_changed,
        }
    }

    /// Forgets the previously reported indices so the next update reports a
    /// change again.
    pub fn reset(&mut self) {
        self.last_beat = None;
        self.last_segment = None;
    }
}
