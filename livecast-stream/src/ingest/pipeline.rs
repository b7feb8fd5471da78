use livecast_core::StreamConfig;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::hls::{FrameOutcome, OutputLayout, SchedulerError, SegmentScheduler, SegmentStore};
use crate::media::{
    FrameGeometry, MediaError, MediaSink, MediaSource, Packet, SourceContainer, TransportOptions,
};
use crate::stats::Stats;

/// Emit a progress line every this many video frames
const PROGRESS_LOG_INTERVAL: u64 = 100;

/// Failures that end an ingest run
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("failed to open source {locator}: {source}")]
    SourceOpen { locator: String, source: MediaError },

    #[error("failed to read from source: {0}")]
    SourceRead(MediaError),

    #[error("source has no video stream")]
    NoVideoStream,

    #[error(transparent)]
    Segment(#[from] SchedulerError),
}

/// How a run ended without a fatal error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    EndOfStream,
    Cancelled,
}

/// Pulls units from the source and feeds the segment scheduler
///
/// One run is a single sequential task; nothing inside it runs concurrently,
/// so the scheduler needs no locking. Readers only ever see the store.
pub struct IngestPipeline {
    config: Arc<StreamConfig>,
    stats: Arc<Stats>,
    store: Arc<SegmentStore>,
}

impl IngestPipeline {
    pub fn new(config: Arc<StreamConfig>, stats: Arc<Stats>, store: Arc<SegmentStore>) -> Self {
        Self {
            config,
            stats,
            store,
        }
    }

    /// Run until end of stream, cancellation or a fatal error
    ///
    /// The source handle is closed on every exit path, after the open segment
    /// has been finalized.
    pub async fn run(
        &self,
        source: &dyn MediaSource,
        sink: Arc<dyn MediaSink>,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, PipelineError> {
        let locator = self.config.source.url.as_str();
        let transport = TransportOptions::from(&self.config.source);

        info!(
            locator = %locator,
            transport = %transport.rtsp_transport,
            "Opening source"
        );
        let mut container = tokio::select! {
            () = cancel.cancelled() => return Ok(RunOutcome::Cancelled),
            opened = source.open(locator, &transport) => opened.map_err(|source| {
                PipelineError::SourceOpen {
                    locator: locator.to_string(),
                    source,
                }
            })?,
        };

        let result = self.process(container.as_mut(), sink, &cancel).await;

        if let Err(e) = container.close().await {
            warn!("Failed to close source: {}", e);
        }
        match &result {
            Ok(outcome) => info!(?outcome, "Ingest finished"),
            Err(e) => error!("Ingest failed: {}", e),
        }
        result
    }

    async fn process(
        &self,
        container: &mut dyn SourceContainer,
        sink: Arc<dyn MediaSink>,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, PipelineError> {
        let info = container.info().clone();
        if info.video.is_none() {
            return Err(PipelineError::NoVideoStream);
        }

        let mut layout = OutputLayout::from_config(&self.config, info.audio.is_some());
        if sink.copies_input() {
            layout = layout.with_source_codecs(&info);
        }
        let target = layout.video_geometry().cloned().unwrap_or_else(|| {
            FrameGeometry::yuv420p(self.config.video.width, self.config.video.height)
        });
        let mut scheduler = SegmentScheduler::new(&self.config, layout, sink, self.store.clone());
        scheduler.ensure_open(Instant::now()).await?;

        let result = self
            .frame_loop(container, &mut scheduler, &target, cancel)
            .await;

        // The open segment is published on every exit; a fatal error from the
        // loop takes precedence over one from finishing.
        let finished = scheduler.finish(Instant::now()).await;
        let outcome = result?;
        finished?;
        Ok(outcome)
    }

    async fn frame_loop(
        &self,
        container: &mut dyn SourceContainer,
        scheduler: &mut SegmentScheduler,
        target: &FrameGeometry,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, PipelineError> {
        loop {
            let packet = tokio::select! {
                () = cancel.cancelled() => return Ok(RunOutcome::Cancelled),
                next = container.demux() => next.map_err(PipelineError::SourceRead)?,
            };
            for _ in 0..container.take_discarded() {
                self.stats.record_dropped();
            }
            let Some(packet) = packet else {
                return Ok(RunOutcome::EndOfStream);
            };

            // Rotation happens before the unit, so a unit never straddles two segments
            scheduler.maybe_rotate(Instant::now()).await?;

            if let Err(e) = self.process_unit(container, scheduler, target, packet).await {
                self.stats.record_error();
                warn!("Dropped unit: {}", e);
            }
        }
    }

    /// Decode, convert, encode and mux one unit; failures only affect this unit
    async fn process_unit(
        &self,
        container: &mut dyn SourceContainer,
        scheduler: &mut SegmentScheduler,
        target: &FrameGeometry,
        packet: Packet,
    ) -> Result<(), MediaError> {
        let frames = container.decode(packet)?;

        for mut frame in frames {
            if frame.needs_reformat(target) {
                frame = container.reformat(frame, target)?;
            }

            match scheduler.write_frame(frame).await? {
                FrameOutcome::Video => {
                    self.stats.record_video();
                    let count = self.stats.video_frames();
                    if count % PROGRESS_LOG_INTERVAL == 0 {
                        debug!(
                            frames = count,
                            segment = scheduler.active().map(|s| s.id),
                            "Processed video frames"
                        );
                    }
                }
                FrameOutcome::Audio => self.stats.record_audio(),
                FrameOutcome::Dropped => self.stats.record_dropped(),
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for IngestPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestPipeline")
            .field("source", &self.config.source.url)
            .field("segments", &self.store.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{
        EncoderStream, Frame, MediaKind, SinkContainer, SourceInfo, StreamInfo, StreamParams,
    };
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[derive(Clone)]
    enum Step {
        Unit(MediaKind, &'static [u8]),
        /// Thrown away inside the demuxer, never yielded
        Discard,
        Fail,
    }

    /// Video units carrying this payload decode at camera resolution
    const FULL_HD: &[u8] = b"1080p";

    /// Yields scripted units, one every `interval`
    struct ScriptedSource {
        script: Vec<Step>,
        interval: Duration,
        info: SourceInfo,
        fail_open: bool,
        fail_reformat: bool,
        closed: Arc<AtomicBool>,
    }

    struct ScriptedContainer {
        script: VecDeque<Step>,
        interval: Duration,
        info: SourceInfo,
        fail_reformat: bool,
        discarded: u64,
        closed: Arc<AtomicBool>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Step>, interval: Duration) -> Self {
            Self {
                script,
                interval,
                info: SourceInfo {
                    video: Some(StreamInfo {
                        index: 0,
                        codec: "h264".to_string(),
                    }),
                    audio: None,
                },
                fail_open: false,
                fail_reformat: false,
                closed: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait]
    impl MediaSource for ScriptedSource {
        async fn open(
            &self,
            _locator: &str,
            _transport: &TransportOptions,
        ) -> Result<Box<dyn SourceContainer>, MediaError> {
            if self.fail_open {
                return Err(MediaError::Open("connection refused".to_string()));
            }
            Ok(Box::new(ScriptedContainer {
                script: self.script.clone().into(),
                interval: self.interval,
                info: self.info.clone(),
                fail_reformat: self.fail_reformat,
                discarded: 0,
                closed: self.closed.clone(),
            }))
        }
    }

    #[async_trait]
    impl SourceContainer for ScriptedContainer {
        fn info(&self) -> &SourceInfo {
            &self.info
        }

        async fn demux(&mut self) -> Result<Option<Packet>, MediaError> {
            while let Some(step) = self.script.pop_front() {
                tokio::time::sleep(self.interval).await;
                match step {
                    Step::Unit(kind, data) => {
                        return Ok(Some(Packet {
                            kind,
                            stream_index: 0,
                            pts: None,
                            keyframe: true,
                            data: Bytes::from_static(data),
                        }))
                    }
                    Step::Discard => self.discarded += 1,
                    Step::Fail => return Err(MediaError::Demux("connection reset".to_string())),
                }
            }
            Ok(None)
        }

        fn decode(&mut self, packet: Packet) -> Result<Vec<Frame>, MediaError> {
            if packet.data.as_ref() == b"corrupt" {
                return Err(MediaError::Decode("invalid NAL unit".to_string()));
            }
            let geometry = (packet.data.as_ref() == FULL_HD).then(|| FrameGeometry {
                width: 1920,
                height: 1080,
                pixel_format: "yuvj420p".to_string(),
            });
            Ok(vec![Frame {
                kind: packet.kind,
                pts: packet.pts,
                keyframe: packet.keyframe,
                geometry,
                data: packet.data,
            }])
        }

        fn take_discarded(&mut self) -> u64 {
            std::mem::take(&mut self.discarded)
        }

        fn reformat(&mut self, frame: Frame, target: &FrameGeometry) -> Result<Frame, MediaError> {
            if self.fail_reformat {
                return Err(MediaError::Unsupported("no scaler for yuvj420p".to_string()));
            }
            Ok(Frame {
                geometry: Some(target.clone()),
                ..frame
            })
        }

        async fn close(&mut self) -> Result<(), MediaError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Counts muxed packets per segment path and records encoded geometry
    #[derive(Default)]
    struct CountingSink {
        muxed: Arc<Mutex<Vec<String>>>,
        encoded: Arc<Mutex<Vec<Option<FrameGeometry>>>>,
    }

    struct CountingContainer {
        name: String,
        muxed: Arc<Mutex<Vec<String>>>,
        encoded: Arc<Mutex<Vec<Option<FrameGeometry>>>>,
    }

    struct CopyEncoder {
        kind: MediaKind,
        encoded: Arc<Mutex<Vec<Option<FrameGeometry>>>>,
    }

    impl EncoderStream for CopyEncoder {
        fn kind(&self) -> MediaKind {
            self.kind
        }

        fn encode(&mut self, frame: Option<Frame>) -> Result<Vec<Packet>, MediaError> {
            if let Some(f) = &frame {
                self.encoded.lock().push(f.geometry.clone());
            }
            Ok(frame
                .map(|f| Packet {
                    kind: f.kind,
                    stream_index: 0,
                    pts: f.pts,
                    keyframe: f.keyframe,
                    data: f.data,
                })
                .into_iter()
                .collect())
        }
    }

    #[async_trait]
    impl MediaSink for CountingSink {
        async fn open(&self, path: &Path) -> Result<Box<dyn SinkContainer>, MediaError> {
            Ok(Box::new(CountingContainer {
                name: path.file_name().unwrap().to_string_lossy().into_owned(),
                muxed: self.muxed.clone(),
                encoded: self.encoded.clone(),
            }))
        }
    }

    #[async_trait]
    impl SinkContainer for CountingContainer {
        fn add_stream(
            &mut self,
            _codec: &str,
            params: &StreamParams,
        ) -> Result<Box<dyn EncoderStream>, MediaError> {
            Ok(Box::new(CopyEncoder {
                kind: params.kind(),
                encoded: self.encoded.clone(),
            }))
        }

        async fn mux(&mut self, _packet: Packet) -> Result<(), MediaError> {
            self.muxed.lock().push(self.name.clone());
            Ok(())
        }

        async fn close(&mut self) -> Result<(), MediaError> {
            Ok(())
        }
    }

    struct Harness {
        pipeline: IngestPipeline,
        stats: Arc<Stats>,
        store: Arc<SegmentStore>,
    }

    fn harness(segment_secs: u64) -> Harness {
        let mut config = StreamConfig::default();
        config.source.url = "rtsp://camera/stream".to_string();
        config.hls.segment_duration_secs = segment_secs;
        let stats = Arc::new(Stats::new());
        let store = Arc::new(SegmentStore::new(
            config.hls.retained_segments(),
            Arc::new(MemoryStorage::new()),
        ));
        Harness {
            pipeline: IngestPipeline::new(Arc::new(config), stats.clone(), store.clone()),
            stats,
            store,
        }
    }

    fn video_units(n: usize) -> Vec<Step> {
        vec![Step::Unit(MediaKind::Video, b"frame"); n]
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_and_a_half_seconds_make_four_segments() {
        let h = harness(1);
        let source = ScriptedSource::new(video_units(35), Duration::from_millis(100));
        let sink = Arc::new(CountingSink::default());

        let outcome = h
            .pipeline
            .run(&source, sink.clone(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::EndOfStream);

        let segments = h.store.snapshot();
        let ids: Vec<u64> = segments.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        for segment in &segments[..3] {
            assert!(segment.duration >= Duration::from_secs(1));
        }
        assert!(segments[3].duration < Duration::from_secs(1));
        assert!(segments[3].duration > Duration::ZERO);

        assert_eq!(h.stats.video_frames(), 35);
        assert_eq!(sink.muxed.lock().len(), 35);
        assert!(source.closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_decode_failure_is_isolated() {
        let h = harness(4);
        let mut script = video_units(5);
        script[2] = Step::Unit(MediaKind::Video, b"corrupt");
        let source = ScriptedSource::new(script, Duration::from_millis(33));

        h.pipeline
            .run(&source, Arc::new(CountingSink::default()), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(h.stats.encoding_errors(), 1);
        assert_eq!(h.stats.video_frames(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failure_is_fatal() {
        let h = harness(4);
        let mut source = ScriptedSource::new(video_units(1), Duration::from_millis(10));
        source.fail_open = true;

        let err = h
            .pipeline
            .run(&source, Arc::new(CountingSink::default()), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::SourceOpen { .. }));
        assert!(h.store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_failure_is_fatal_and_releases_source() {
        let h = harness(4);
        let mut script = video_units(3);
        script.push(Step::Fail);
        let source = ScriptedSource::new(script, Duration::from_millis(10));

        let err = h
            .pipeline
            .run(&source, Arc::new(CountingSink::default()), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::SourceRead(_)));
        assert!(source.closed.load(Ordering::SeqCst));
        // what was written before the failure is still published
        assert_eq!(h.store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_video_is_fatal() {
        let h = harness(4);
        let mut source = ScriptedSource::new(video_units(1), Duration::from_millis(10));
        source.info.video = None;

        let err = h
            .pipeline
            .run(&source, Arc::new(CountingSink::default()), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NoVideoStream));
        assert!(source.closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_audio_without_output_is_counted_as_dropped() {
        let h = harness(4);
        let script = vec![
            Step::Unit(MediaKind::Video, b"v"),
            Step::Unit(MediaKind::Audio, b"a"),
        ];
        let source = ScriptedSource::new(script, Duration::from_millis(10));

        h.pipeline
            .run(&source, Arc::new(CountingSink::default()), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(h.stats.audio_frames(), 0);
        assert_eq!(h.stats.dropped_frames(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_finishes_open_segment() {
        let h = harness(4);
        let source = ScriptedSource::new(video_units(1000), Duration::from_millis(100));
        let cancel = CancellationToken::new();

        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2050)).await;
            stopper.cancel();
        });

        let outcome = h
            .pipeline
            .run(&source, Arc::new(CountingSink::default()), cancel)
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome::Cancelled);
        assert_eq!(h.store.len(), 1);
        assert_eq!(h.stats.video_frames(), 20);
        assert!(source.closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mismatched_geometry_is_reformatted() {
        let h = harness(4);
        let script = vec![
            Step::Unit(MediaKind::Video, FULL_HD),
            Step::Unit(MediaKind::Video, b"frame"),
        ];
        let source = ScriptedSource::new(script, Duration::from_millis(33));
        let sink = Arc::new(CountingSink::default());

        h.pipeline
            .run(&source, sink.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            *sink.encoded.lock(),
            vec![Some(FrameGeometry::yuv420p(1280, 720)), None]
        );
        assert_eq!(h.stats.video_frames(), 2);
        assert_eq!(h.stats.encoding_errors(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reformat_failure_drops_only_that_unit() {
        let h = harness(4);
        let script = vec![
            Step::Unit(MediaKind::Video, b"frame"),
            Step::Unit(MediaKind::Video, FULL_HD),
            Step::Unit(MediaKind::Video, b"frame"),
            Step::Unit(MediaKind::Video, b"frame"),
        ];
        let mut source = ScriptedSource::new(script, Duration::from_millis(33));
        source.fail_reformat = true;
        let sink = Arc::new(CountingSink::default());

        let outcome = h
            .pipeline
            .run(&source, sink.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome::EndOfStream);
        assert_eq!(h.stats.encoding_errors(), 1);
        assert_eq!(h.stats.video_frames(), 3);
        assert_eq!(sink.muxed.lock().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_units_discarded_by_demuxer_are_counted_as_dropped() {
        let h = harness(4);
        let script = vec![
            Step::Unit(MediaKind::Video, b"frame"),
            Step::Discard,
            Step::Discard,
            Step::Unit(MediaKind::Video, b"frame"),
            Step::Discard,
        ];
        let source = ScriptedSource::new(script, Duration::from_millis(10));

        h.pipeline
            .run(&source, Arc::new(CountingSink::default()), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(h.stats.video_frames(), 2);
        assert_eq!(h.stats.dropped_frames(), 3);
        assert_eq!(h.stats.encoding_errors(), 0);
    }
}
