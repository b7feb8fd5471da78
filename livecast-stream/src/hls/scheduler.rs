use livecast_core::StreamConfig;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::store::{segment_file_name, Segment, SegmentStore};
use crate::media::{
    EncoderStream, Frame, FrameGeometry, MediaError, MediaKind, MediaSink, SinkContainer,
    SourceInfo, StreamParams,
};

/// Failures that end the ingest run
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("failed to open segment {id}: {source}")]
    Open { id: u64, source: MediaError },

    #[error("failed to close segment {id}: {source}")]
    Close { id: u64, source: MediaError },
}

/// Streams every segment file is created with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    pub video_codec: String,
    pub video: StreamParams,
    /// Present only when the source carries audio
    pub audio: Option<(String, StreamParams)>,
}

impl OutputLayout {
    /// First entry of each bitrate ladder is the one encoded
    #[must_use]
    pub fn from_config(config: &StreamConfig, with_audio: bool) -> Self {
        let video = &config.video;
        let mut options = BTreeMap::new();
        options.insert("preset".to_string(), video.preset.clone());
        options.insert("tune".to_string(), "zerolatency".to_string());
        options.insert("profile".to_string(), "baseline".to_string());
        options.insert("g".to_string(), video.keyframe_interval.to_string());

        let audio = with_audio.then(|| {
            (
                config.audio.codec.clone(),
                StreamParams::Audio {
                    bit_rate: config.audio.encode_bitrate(),
                    sample_rate: config.audio.sample_rate,
                    channels: config.audio.channels,
                },
            )
        });

        Self {
            video_codec: video.codec.clone(),
            video: StreamParams::Video {
                geometry: FrameGeometry::yuv420p(video.width, video.height),
                bit_rate: video.encode_bitrate(),
                fps: video.fps,
                options,
            },
            audio,
        }
    }

    /// Label the output streams with the codecs the source carries
    #[must_use]
    pub fn with_source_codecs(mut self, info: &SourceInfo) -> Self {
        if let Some(video) = &info.video {
            self.video_codec.clone_from(&video.codec);
        }
        if let (Some((codec, _)), Some(audio)) = (self.audio.as_mut(), &info.audio) {
            codec.clone_from(&audio.codec);
        }
        self
    }

    /// Geometry decoded video frames are converted to
    #[must_use]
    pub fn video_geometry(&self) -> Option<&FrameGeometry> {
        match &self.video {
            StreamParams::Video { geometry, .. } => Some(geometry),
            StreamParams::Audio { .. } => None,
        }
    }
}

/// Where a forwarded frame ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Video,
    Audio,
    /// No output stream for this kind of frame
    Dropped,
}

struct ActiveSegment {
    segment: Segment,
    container: Box<dyn SinkContainer>,
    video: Box<dyn EncoderStream>,
    audio: Option<Box<dyn EncoderStream>>,
    frames: u64,
}

/// Owns the open segment and rotates it on the duration boundary
///
/// Only the ingest task drives this, so it needs no interior locking. Closed
/// segments are handed to the [`SegmentStore`].
pub struct SegmentScheduler {
    sink: Arc<dyn MediaSink>,
    store: Arc<SegmentStore>,
    layout: OutputLayout,
    output_root: PathBuf,
    segment_duration: Duration,
    next_id: u64,
    active: Option<ActiveSegment>,
}

impl SegmentScheduler {
    pub fn new(
        config: &StreamConfig,
        layout: OutputLayout,
        sink: Arc<dyn MediaSink>,
        store: Arc<SegmentStore>,
    ) -> Self {
        Self {
            sink,
            store,
            layout,
            output_root: config.hls.output_path.clone(),
            segment_duration: config.hls.segment_duration(),
            next_id: 1,
            active: None,
        }
    }

    /// The open segment, if any
    #[must_use]
    pub fn active(&self) -> Option<&Segment> {
        self.active.as_ref().map(|a| &a.segment)
    }

    /// Open the next segment unless one is already open
    pub async fn ensure_open(&mut self, now: Instant) -> Result<(), SchedulerError> {
        if self.active.is_some() {
            return Ok(());
        }

        let id = self.next_id;
        let path = self.output_root.join(segment_file_name(id));
        let mut container = self
            .sink
            .open(&path)
            .await
            .map_err(|source| SchedulerError::Open { id, source })?;

        let streams = self.add_streams(container.as_mut());
        let (video, audio) = match streams {
            Ok(streams) => streams,
            Err(source) => {
                container.close().await.ok();
                return Err(SchedulerError::Open { id, source });
            }
        };

        self.next_id += 1;
        debug!(segment = id, path = %path.display(), "Opened segment");
        self.active = Some(ActiveSegment {
            segment: Segment {
                id,
                path,
                started_at: now,
                duration: Duration::ZERO,
            },
            container,
            video,
            audio,
            frames: 0,
        });
        Ok(())
    }

    #[allow(clippy::type_complexity)]
    fn add_streams(
        &self,
        container: &mut dyn SinkContainer,
    ) -> Result<(Box<dyn EncoderStream>, Option<Box<dyn EncoderStream>>), MediaError> {
        let video = container.add_stream(&self.layout.video_codec, &self.layout.video)?;
        let audio = match &self.layout.audio {
            Some((codec, params)) => Some(container.add_stream(codec, params)?),
            None => None,
        };
        Ok((video, audio))
    }

    /// Rotate when the open segment has reached the target duration
    ///
    /// Returns whether a rotation happened. A segment that has not received a
    /// frame yet is never rotated, so a stalled source cannot publish empty
    /// segments.
    pub async fn maybe_rotate(&mut self, now: Instant) -> Result<bool, SchedulerError> {
        let Some(active) = self.active.as_ref() else {
            self.ensure_open(now).await?;
            return Ok(false);
        };
        if active.frames == 0
            || now.saturating_duration_since(active.segment.started_at) < self.segment_duration
        {
            return Ok(false);
        }

        self.close_active(now).await?;
        self.ensure_open(now).await?;
        Ok(true)
    }

    /// Encode `frame` into the open segment
    ///
    /// Errors here only concern this frame; the segment stays usable.
    pub async fn write_frame(&mut self, frame: Frame) -> Result<FrameOutcome, MediaError> {
        let Some(active) = self.active.as_mut() else {
            return Err(MediaError::Mux("no open segment".to_string()));
        };

        let kind = frame.kind;
        let encoder = match kind {
            MediaKind::Video => &mut active.video,
            MediaKind::Audio => match active.audio.as_mut() {
                Some(encoder) => encoder,
                None => return Ok(FrameOutcome::Dropped),
            },
        };
        let packets = encoder.encode(Some(frame))?;
        for packet in packets {
            active.container.mux(packet).await?;
        }
        active.frames += 1;

        Ok(match kind {
            MediaKind::Video => FrameOutcome::Video,
            MediaKind::Audio => FrameOutcome::Audio,
        })
    }

    /// Close and publish the open segment at end of stream
    ///
    /// A segment that never received a frame is discarded instead.
    pub async fn finish(&mut self, now: Instant) -> Result<(), SchedulerError> {
        let Some(active) = self.active.as_ref() else {
            return Ok(());
        };
        if active.frames > 0 {
            return self.close_active(now).await;
        }

        if let Some(mut active) = self.active.take() {
            let id = active.segment.id;
            active.container.close().await.ok();
            if let Err(e) = self.store.storage().delete(&active.segment.file_name()).await {
                warn!("Failed to remove empty segment {}: {}", id, e);
            }
            debug!(segment = id, "Discarded empty segment");
        }
        Ok(())
    }

    async fn close_active(&mut self, now: Instant) -> Result<(), SchedulerError> {
        let Some(mut active) = self.active.take() else {
            return Ok(());
        };
        let id = active.segment.id;

        // Flush encoder state into this segment before it is closed
        let mut flushed = Vec::new();
        for encoder in std::iter::once(&mut active.video).chain(active.audio.as_mut()) {
            match encoder.encode(None) {
                Ok(packets) => flushed.extend(packets),
                Err(e) => warn!(segment = id, "Failed to flush {} encoder: {}", encoder.kind(), e),
            }
        }
        for packet in flushed {
            if let Err(e) = active.container.mux(packet).await {
                warn!(segment = id, "Failed to mux flushed packet: {}", e);
            }
        }

        active
            .container
            .close()
            .await
            .map_err(|source| SchedulerError::Close { id, source })?;

        let mut segment = active.segment;
        segment.duration = now.saturating_duration_since(segment.started_at);
        info!(
            segment = id,
            duration_ms = segment.duration.as_millis() as u64,
            frames = active.frames,
            "Segment finalized"
        );
        self.store.append(segment).await;
        Ok(())
    }
}
