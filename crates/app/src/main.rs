use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use dance_sync_core::{
    AnalysisBackend, AnalysisBatch, AnalysisResponse, AppConfig, BeatClock, CaptureItem, Clock,
    HttpAnalysisBackend, ManualClock, MediaDevice, Metadata, PracticeSession, SessionEvent,
    SnapshotPayload, SyncError, SystemClock, SESSION_ID_KEY, VIDEO_TIMESTAMP_KEY,
};
use tracing_subscriber::EnvFilter;

const STEP_MS: u64 = 100;

#[tokio::main]
async fn main() -> dance_sync_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Beat {
            time,
            bpm,
            total_beats,
            config,
        } => run_beat(time, bpm, total_beats, config.as_deref()),
        Commands::Simulate {
            config,
            duration,
            seek,
            endpoint,
            dry_run,
        } => run_simulate(config.as_deref(), duration, seek, endpoint, dry_run).await,
        Commands::Analyze {
            frame,
            config,
            video_timestamp,
            endpoint,
        } => run_analyze(&frame, config.as_deref(), video_timestamp, endpoint).await,
    }
}

fn load_config(path: Option<&Path>) -> dance_sync_core::Result<AppConfig> {
    match path {
        Some(path) => AppConfig::load(path),
        None => Ok(AppConfig::default()),
    }
}

fn run_beat(
    time: f64,
    bpm: Option<f64>,
    total_beats: Option<usize>,
    config: Option<&Path>,
) -> dance_sync_core::Result<()> {
    let mut config = load_config(config)?;
    if let Some(bpm) = bpm {
        config.beat.bpm = bpm;
    }
    if let Some(total_beats) = total_beats {
        config.beat.total_beats = total_beats;
    }

    let clock = BeatClock::new(&config.beat)?;
    let state = clock.state_at(time);
    let report = serde_json::json!({
        "state": state,
        "timing": clock.timing(time, state.current_beat),
        "offset_secs": clock.beat_offset(time, state.current_beat),
        "segment": clock.segment_for(state.current_beat),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_simulate(
    config: Option<&Path>,
    duration: f64,
    seek: Option<f64>,
    endpoint: Option<String>,
    dry_run: bool,
) -> dance_sync_core::Result<()> {
    if !(duration.is_finite() && duration > 0.0) {
        return Err(SyncError::config("simulated duration must be positive"));
    }
    let mut config = load_config(config)?;
    if let Some(endpoint) = endpoint {
        config.analysis.endpoint = endpoint;
    }
    tracing::info!(
        duration,
        dry_run,
        endpoint = %config.analysis.endpoint,
        "running simulated practice"
    );

    let backend: Arc<dyn AnalysisBackend> = if dry_run {
        Arc::new(LoggingBackend)
    } else {
        Arc::new(HttpAnalysisBackend::new(&config.analysis))
    };
    let clock = ManualClock::new(0);
    let device = SimulatedDevice::new(duration);
    let mut session = PracticeSession::new(
        &config,
        Box::new(device.clone()),
        backend,
        Arc::new(clock.clone()),
    )?;

    session.synchronizer_mut().attach("simulated://reference")?;
    device.flush(&mut session)?;
    session.synchronizer_mut().request_play()?;
    device.flush(&mut session)?;

    let capture_every = config.capture.capture_interval_ms.max(STEP_MS);
    let mut seek_pending = seek;
    let mut ended = false;
    let mut elapsed_ms = 0u64;

    while !ended {
        clock.advance(STEP_MS);
        elapsed_ms += STEP_MS;
        device.advance(STEP_MS);
        session.synchronizer_mut().poll();
        device.flush(&mut session)?;

        if let Some(target) = seek_pending {
            if elapsed_ms >= 1_000 {
                session.synchronizer_mut().request_seek(target)?;
                seek_pending = None;
            }
        }

        for event in session.pump()? {
            match event {
                SessionEvent::BeatChanged(beat) => tracing::debug!(beat, "beat"),
                SessionEvent::SegmentChanged(segment) => tracing::info!(segment, "segment"),
                SessionEvent::Ended => ended = true,
                SessionEvent::Failed(message) => return Err(SyncError::Device(message)),
                _ => {}
            }
        }

        if elapsed_ms % capture_every == 0 {
            let mut metadata = Metadata::new();
            metadata.insert(
                "beat".to_string(),
                serde_json::json!(session.beat_state().current_beat),
            );
            let frame = format!("frame@{}", clock.now_ms()).into_bytes();
            session.capture(Bytes::from(frame), metadata)?;
        }

        if elapsed_ms % 1_000 == 0 {
            if let Err(err) = session.drain_feedback().await {
                tracing::warn!(error = %err, "analysis unavailable, keeping snapshots queued");
            }
        }
    }

    let status = session.queue().status();
    let summary = serde_json::json!({
        "session": session.synchronizer().session(),
        "beat": session.beat_state(),
        "queue": status,
        "feedback": session.feedback_history().collect::<Vec<_>>(),
        "last_error": session.last_error(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn run_analyze(
    frame: &Path,
    config: Option<&Path>,
    video_timestamp: Option<f64>,
    endpoint: Option<String>,
) -> dance_sync_core::Result<()> {
    let mut config = load_config(config)?;
    if let Some(endpoint) = endpoint {
        config.analysis.endpoint = endpoint;
    }

    let payload = std::fs::read(frame)?;
    let mut item = CaptureItem::new(SystemClock::start().now_ms(), payload);
    if let Some(video_timestamp) = video_timestamp {
        item.metadata.insert(
            VIDEO_TIMESTAMP_KEY.to_string(),
            serde_json::json!(video_timestamp),
        );
    }
    if let Some(session_id) = &config.analysis.session_id {
        item.metadata
            .insert(SESSION_ID_KEY.to_string(), serde_json::json!(session_id));
    }
    tracing::info!(
        frame = %frame.display(),
        bytes = item.payload.len(),
        endpoint = %config.analysis.endpoint,
        "sending single snapshot"
    );

    let backend = HttpAnalysisBackend::new(&config.analysis);
    let response = backend
        .analyze_one(&SnapshotPayload::from_item(&item))
        .await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

/// Signals the simulated device reports back to the synchronizer.
#[derive(Debug, Clone, PartialEq)]
enum DeviceSignal {
    Metadata(f64),
    Playing,
    Paused,
    Time(f64),
}

#[derive(Debug, Default)]
struct DeviceState {
    duration: f64,
    position: f64,
    playing: bool,
    rate: f64,
    pending: VecDeque<DeviceSignal>,
}

/// In-memory stand-in for a video element. Commands take effect immediately
/// and are confirmed through queued signals, like browser media events.
#[derive(Debug, Clone)]
struct SimulatedDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl SimulatedDevice {
    fn new(duration: f64) -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                duration,
                rate: 1.0,
                ..Default::default()
            })),
        }
    }

    fn lock(&self) -> dance_sync_core::Result<std::sync::MutexGuard<'_, DeviceState>> {
        self.state
            .lock()
            .map_err(|_| SyncError::msg("simulated device has been poisoned"))
    }

    fn advance(&self, delta_ms: u64) {
        if let Ok(mut state) = self.state.lock() {
            if !state.playing {
                return;
            }
            let step = delta_ms as f64 / 1000.0 * state.rate;
            state.position = (state.position + step).min(state.duration);
            let position = state.position;
            state.pending.push_back(DeviceSignal::Time(position));
            if position >= state.duration {
                state.playing = false;
                state.pending.push_back(DeviceSignal::Paused);
            }
        }
    }

    fn flush(&self, session: &mut PracticeSession) -> dance_sync_core::Result<()> {
        let signals: Vec<DeviceSignal> = self.lock()?.pending.drain(..).collect();
        let sync = session.synchronizer_mut();
        for signal in signals {
            match signal {
                DeviceSignal::Metadata(duration) => sync.on_metadata_ready(duration)?,
                DeviceSignal::Playing => sync.on_device_playing(),
                DeviceSignal::Paused => sync.on_device_paused(),
                DeviceSignal::Time(time) => {
                    sync.on_device_time_update(time);
                }
            }
        }
        Ok(())
    }
}

impl MediaDevice for SimulatedDevice {
    fn load(&mut self, _source: &str) -> dance_sync_core::Result<()> {
        let mut state = self.lock()?;
        state.position = 0.0;
        let duration = state.duration;
        state.pending.push_back(DeviceSignal::Metadata(duration));
        Ok(())
    }

    fn play(&mut self) -> dance_sync_core::Result<()> {
        let mut state = self.lock()?;
        state.playing = true;
        state.pending.push_back(DeviceSignal::Playing);
        Ok(())
    }

    fn pause(&mut self) -> dance_sync_core::Result<()> {
        let mut state = self.lock()?;
        state.playing = false;
        state.pending.push_back(DeviceSignal::Paused);
        Ok(())
    }

    fn seek(&mut self, time: f64) -> dance_sync_core::Result<()> {
        self.lock()?.position = time;
        Ok(())
    }

    fn set_playback_rate(&mut self, rate: f64) -> dance_sync_core::Result<()> {
        self.lock()?.rate = rate;
        Ok(())
    }
}

/// Analysis stand-in for `--dry-run`: logs and acknowledges every request.
struct LoggingBackend;

#[async_trait]
impl AnalysisBackend for LoggingBackend {
    async fn analyze_batch(
        &self,
        batch: &AnalysisBatch,
    ) -> dance_sync_core::Result<AnalysisResponse> {
        let timestamps: Vec<u64> = batch.snapshots.iter().map(|s| s.timestamp).collect();
        tracing::info!(size = batch.len(), ?timestamps, "dry-run batch");
        Ok(serde_json::json!({ "accepted": batch.len() }))
    }

    async fn analyze_one(
        &self,
        snapshot: &SnapshotPayload,
    ) -> dance_sync_core::Result<AnalysisResponse> {
        tracing::info!(timestamp = snapshot.timestamp, "dry-run snapshot");
        Ok(serde_json::json!({ "accepted": 1 }))
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Beat sync and snapshot capture for dance practice", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the beat state for a playback time.
    Beat {
        /// Playback time in seconds.
        time: f64,
        /// Tempo override in beats per minute.
        #[arg(long)]
        bpm: Option<f64>,
        /// Routine length override in beats.
        #[arg(long)]
        total_beats: Option<usize>,
        /// JSON configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Run a simulated practice session against the analysis service.
    Simulate {
        /// JSON configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Length of the simulated reference video in seconds.
        #[arg(long, default_value_t = 10.0)]
        duration: f64,
        /// Seek to this time one second into the run.
        #[arg(long)]
        seek: Option<f64>,
        /// Analysis endpoint override.
        #[arg(long)]
        endpoint: Option<String>,
        /// Log batches instead of posting them.
        #[arg(long)]
        dry_run: bool,
    },
    /// Send one image straight to the analysis service and print the verdict.
    Analyze {
        /// Image file to send.
        frame: PathBuf,
        /// JSON configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Reference video time the frame corresponds to, in seconds.
        #[arg(long)]
        video_timestamp: Option<f64>,
        /// Analysis endpoint override.
        #[arg(long)]
        endpoint: Option<String>,
    },
}
