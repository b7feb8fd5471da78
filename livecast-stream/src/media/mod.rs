// Codec/container collaborator boundary
//
// The ingest pipeline only ever talks to these traits:
// - MediaSource / SourceContainer: open(locator) -> demux() -> decode()
// - MediaSink / SinkContainer / EncoderStream: open(path) -> add_stream() -> encode() -> mux()
//
// `mpegts` provides a passthrough implementation over MPEG-TS byte streams.

pub mod mpegts;

use async_trait::async_trait;
use bytes::Bytes;
use livecast_core::config::SourceConfig;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video,
    Audio,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Video => f.write_str("video"),
            Self::Audio => f.write_str("audio"),
        }
    }
}

/// Raw picture geometry of a decoded video frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
    pub pixel_format: String,
}

impl FrameGeometry {
    #[must_use]
    pub fn yuv420p(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixel_format: "yuv420p".to_string(),
        }
    }
}

/// Encoded unit, either demuxed from the source or produced by an encoder
#[derive(Debug, Clone)]
pub struct Packet {
    pub kind: MediaKind,
    /// Index of the stream inside its container
    pub stream_index: usize,
    /// Presentation timestamp in 90 kHz ticks
    pub pts: Option<i64>,
    pub keyframe: bool,
    pub data: Bytes,
}

/// Decoded unit handed to an encoder
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: MediaKind,
    pub pts: Option<i64>,
    pub keyframe: bool,
    /// `None` when the frame is not raw pixels (passthrough payloads)
    pub geometry: Option<FrameGeometry>,
    pub data: Bytes,
}

impl Frame {
    /// Whether this frame must be converted before it reaches a video encoder
    /// configured for `target`.
    #[must_use]
    pub fn needs_reformat(&self, target: &FrameGeometry) -> bool {
        self.kind == MediaKind::Video
            && self.geometry.as_ref().is_some_and(|g| g != target)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub index: usize,
    pub codec: String,
}

/// Elementary streams discovered when a source was opened
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceInfo {
    pub video: Option<StreamInfo>,
    pub audio: Option<StreamInfo>,
}

/// Connection options applied when opening a network source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    /// "tcp" or "udp" for RTSP sources
    pub rtsp_transport: String,
    pub timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            rtsp_transport: "tcp".to_string(),
            timeout: Duration::from_secs(5),
        }
    }
}

impl From<&SourceConfig> for TransportOptions {
    fn from(config: &SourceConfig) -> Self {
        Self {
            rtsp_transport: config.rtsp_transport.clone(),
            timeout: Duration::from_micros(config.timeout_us),
        }
    }
}

/// Encoder parameters for one output stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamParams {
    Video {
        geometry: FrameGeometry,
        bit_rate: u64,
        fps: u32,
        options: BTreeMap<String, String>,
    },
    Audio {
        bit_rate: u64,
        sample_rate: u32,
        channels: u16,
    },
}

impl StreamParams {
    #[must_use]
    pub const fn kind(&self) -> MediaKind {
        match self {
            Self::Video { .. } => MediaKind::Video,
            Self::Audio { .. } => MediaKind::Audio,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Open error: {0}")]
    Open(String),

    #[error("Demux error: {0}")]
    Demux(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Mux error: {0}")]
    Mux(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn open(
        &self,
        locator: &str,
        transport: &TransportOptions,
    ) -> Result<Box<dyn SourceContainer>, MediaError>;
}

/// An opened input
///
/// `demux` yields `Ok(None)` once at end-of-stream; any `Err` from it is a
/// failure of the source itself.
#[async_trait]
pub trait SourceContainer: Send {
    fn info(&self) -> &SourceInfo;

    async fn demux(&mut self) -> Result<Option<Packet>, MediaError>;

    fn decode(&mut self, packet: Packet) -> Result<Vec<Frame>, MediaError>;

    /// Units the demuxer threw away since the last call, reset on read
    fn take_discarded(&mut self) -> u64 {
        0
    }

    /// Convert a decoded video frame to `target`
    fn reformat(&mut self, frame: Frame, target: &FrameGeometry) -> Result<Frame, MediaError> {
        let _ = frame;
        Err(MediaError::Unsupported(format!(
            "reformat to {}x{} {}",
            target.width, target.height, target.pixel_format
        )))
    }

    async fn close(&mut self) -> Result<(), MediaError>;
}

#[async_trait]
pub trait MediaSink: Send + Sync {
    async fn open(&self, path: &Path) -> Result<Box<dyn SinkContainer>, MediaError>;

    /// True when units are written unchanged, so output streams must carry
    /// the source's codec rather than the configured one
    fn copies_input(&self) -> bool {
        false
    }
}

/// An output file being written
#[async_trait]
pub trait SinkContainer: Send {
    fn add_stream(
        &mut self,
        codec: &str,
        params: &StreamParams,
    ) -> Result<Box<dyn EncoderStream>, MediaError>;

    async fn mux(&mut self, packet: Packet) -> Result<(), MediaError>;

    async fn close(&mut self) -> Result<(), MediaError>;
}

pub trait EncoderStream: Send {
    fn kind(&self) -> MediaKind;

    /// Encode a frame; `None` flushes buffered state at end-of-stream.
    fn encode(&mut self, frame: Option<Frame>) -> Result<Vec<Packet>, MediaError>;
}
