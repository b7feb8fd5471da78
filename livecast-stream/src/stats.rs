use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Process-wide frame counters
///
/// The ingest task is the only writer; readers get approximate values, which
/// is all a monitoring endpoint needs.
#[derive(Debug)]
pub struct Stats {
    started_at: Instant,
    processed_video_frames: AtomicU64,
    processed_audio_frames: AtomicU64,
    dropped_frames: AtomicU64,
    encoding_errors: AtomicU64,
}

/// Point-in-time view served as JSON on `/stats`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub processed_video_frames: u64,
    pub processed_audio_frames: u64,
    pub video_fps: f64,
    pub audio_fps: f64,
    pub encoding_errors: u64,
    pub dropped_frames: u64,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    #[must_use]
    pub fn new() -> Self {
        Self::started_at(Instant::now())
    }

    #[must_use]
    pub fn started_at(started_at: Instant) -> Self {
        Self {
            started_at,
            processed_video_frames: AtomicU64::new(0),
            processed_audio_frames: AtomicU64::new(0),
            dropped_frames: AtomicU64::new(0),
            encoding_errors: AtomicU64::new(0),
        }
    }

    pub fn record_video(&self) {
        self.processed_video_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_audio(&self) {
        self.processed_audio_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.encoding_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn video_frames(&self) -> u64 {
        self.processed_video_frames.load(Ordering::Relaxed)
    }

    pub fn audio_frames(&self) -> u64 {
        self.processed_audio_frames.load(Ordering::Relaxed)
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    pub fn encoding_errors(&self) -> u64 {
        self.encoding_errors.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> StatsSnapshot {
        let elapsed = now.saturating_duration_since(self.started_at);
        let video = self.video_frames();
        let audio = self.audio_frames();

        StatsSnapshot {
            processed_video_frames: video,
            processed_audio_frames: audio,
            video_fps: rate(video, elapsed),
            audio_fps: rate(audio, elapsed),
            encoding_errors: self.encoding_errors(),
            dropped_frames: self.dropped_frames(),
        }
    }
}

/// `count / elapsed`, or 0 before anything was counted or any time passed
#[must_use]
pub fn rate(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if count == 0 || secs <= 0.0 {
        return 0.0;
    }
    count as f64 / secs
}

/// Log a stats line every `interval` until `cancel` fires
pub fn spawn_stats_logger(
    stats: Arc<Stats>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let s = stats.snapshot();
                    tracing::info!(
                        video_frames = s.processed_video_frames,
                        audio_frames = s.processed_audio_frames,
                        video_fps = format_args!("{:.2}", s.video_fps),
                        audio_fps = format_args!("{:.2}", s.audio_fps),
                        encoding_errors = s.encoding_errors,
                        dropped_frames = s.dropped_frames,
                        "Stream stats"
                    );
                }
            }
        }

        tracing::debug!("Stats logger stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_guards() {
        assert_eq!(rate(0, Duration::from_secs(10)), 0.0);
        assert_eq!(rate(100, Duration::ZERO), 0.0);
        assert_eq!(rate(100, Duration::from_secs(4)), 25.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_rates() {
        let t0 = Instant::now();
        let stats = Stats::started_at(t0);
        for _ in 0..60 {
            stats.record_video();
        }
        for _ in 0..20 {
            stats.record_audio();
        }
        stats.record_error();
        stats.record_dropped();

        let snapshot = stats.snapshot_at(t0 + Duration::from_secs(2));
        assert_eq!(snapshot.processed_video_frames, 60);
        assert_eq!(snapshot.processed_audio_frames, 20);
        assert_eq!(snapshot.video_fps, 30.0);
        assert_eq!(snapshot.audio_fps, 10.0);
        assert_eq!(snapshot.encoding_errors, 1);
        assert_eq!(snapshot.dropped_frames, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_at_start_is_zero_rate() {
        let stats = Stats::new();
        stats.record_video();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.processed_video_frames, 1);
        assert_eq!(snapshot.video_fps, 0.0);
    }

    #[test]
    fn test_snapshot_json_fields() {
        let stats = Stats::new();
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        for field in [
            "processed_video_frames",
            "processed_audio_frames",
            "video_fps",
            "audio_fps",
            "encoding_errors",
            "dropped_frames",
        ] {
            assert!(json.get(field).is_some(), "missing {field}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_logger_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let handle = spawn_stats_logger(Arc::new(Stats::new()), Duration::from_secs(5), cancel.clone());

        tokio::time::sleep(Duration::from_secs(12)).await;
        cancel.cancel();
        handle.await.unwrap();
    }
}
