use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Stream configuration
///
/// Loaded once at startup, validated, then shared read-only (behind an `Arc`)
/// with every component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub source: SourceConfig,
    pub hls: HlsConfig,
    pub video: VideoConfig,
    pub audio: AudioConfig,
    pub server: ServerConfig,
    pub features: FeatureFlags,
    pub logging: LoggingConfig,
}

/// Where the live feed comes from and how to connect to it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Source locator (`rtsp://...`, `tcp://host:port`, `file:///path.ts`, ...)
    pub url: String,
    /// Transport used for RTSP sources ("tcp" or "udp")
    pub rtsp_transport: String,
    /// Socket timeout in microseconds
    pub timeout_us: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            rtsp_transport: "tcp".to_string(),
            timeout_us: 5_000_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HlsConfig {
    /// Directory receiving `segment_{id}.ts` files
    pub output_path: PathBuf,
    /// Target segment duration in seconds (lower bound, cuts land on the next unit)
    pub segment_duration_secs: u64,
    /// Number of segments advertised in the media playlist
    pub playlist_size: usize,
    /// Number of finalized segments kept on disk; defaults to `2 * playlist_size`
    pub retained_segments: Option<usize>,
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            output_path: PathBuf::from("hls_output"),
            segment_duration_secs: 4,
            playlist_size: 5,
            retained_segments: None,
        }
    }
}

impl HlsConfig {
    #[must_use]
    pub const fn segment_duration(&self) -> Duration {
        Duration::from_secs(self.segment_duration_secs)
    }

    /// Eviction threshold of the segment store
    #[must_use]
    pub fn retained_segments(&self) -> usize {
        self.retained_segments
            .unwrap_or_else(|| self.playlist_size.saturating_mul(2))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub codec: String,
    pub preset: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub keyframe_interval: u32,
    /// Advertised bitrate ladder in bits/s; only the first entry is encoded
    pub bitrates: Vec<u64>,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            codec: "h264".to_string(),
            preset: "ultrafast".to_string(),
            width: 1280,
            height: 720,
            fps: 30,
            keyframe_interval: 60,
            bitrates: vec![2_000_000, 1_000_000, 500_000],
        }
    }
}

impl VideoConfig {
    /// Bitrate actually used for encoding
    #[must_use]
    pub fn encode_bitrate(&self) -> u64 {
        self.bitrates.first().copied().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub codec: String,
    pub bitrates: Vec<u64>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            codec: "aac".to_string(),
            bitrates: vec![128_000, 64_000],
            sample_rate: 44100,
            channels: 2,
        }
    }
}

impl AudioConfig {
    #[must_use]
    pub fn encode_bitrate(&self) -> u64 {
        self.bitrates.first().copied().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub hls_port: u16,
    pub rtsp_port: u16,
    /// Max concurrent RTSP connections
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            hls_port: 8080,
            rtsp_port: 8554,
            max_connections: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    pub enable_stats: bool,
    pub enable_debug: bool,
    pub enable_rtsp: bool,
    pub enable_hls: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            enable_stats: true,
            enable_debug: false,
            enable_rtsp: true,
            enable_hls: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl StreamConfig {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // LIVECAST_SOURCE__URL, LIVECAST_HLS__SEGMENT_DURATION_SECS, ...
        builder = builder.add_source(
            Environment::with_prefix("LIVECAST")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("video.bitrates")
                .with_list_parse_key("audio.bitrates")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Check every bound at once so the operator sees all problems in one run.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.source.url.trim().is_empty() {
            errors.push("source.url is required".to_string());
        }
        if !matches!(self.source.rtsp_transport.as_str(), "tcp" | "udp") {
            errors.push(format!(
                "source.rtsp_transport must be \"tcp\" or \"udp\", got {:?}",
                self.source.rtsp_transport
            ));
        }
        if self.video.bitrates.is_empty() {
            errors.push("At least one video bitrate must be specified".to_string());
        }
        if self.video.bitrates.contains(&0) {
            errors.push("video.bitrates must all be positive".to_string());
        }
        if self.audio.bitrates.is_empty() {
            errors.push("At least one audio bitrate must be specified".to_string());
        }
        if self.audio.bitrates.contains(&0) {
            errors.push("audio.bitrates must all be positive".to_string());
        }
        if self.audio.sample_rate == 0 {
            errors.push("Invalid audio sample rate".to_string());
        }
        if self.audio.channels == 0 {
            errors.push("Invalid audio channel count".to_string());
        }
        if self.video.width == 0 || self.video.height == 0 {
            errors.push(format!(
                "Invalid video dimensions: {}x{}",
                self.video.width, self.video.height
            ));
        }
        if self.video.fps == 0 {
            errors.push("Invalid FPS value".to_string());
        }
        if self.hls.segment_duration_secs == 0 {
            errors.push("Invalid segment duration".to_string());
        }
        if self.hls.playlist_size == 0 {
            errors.push("Invalid playlist size".to_string());
        }
        if self.hls.retained_segments() < self.hls.playlist_size {
            errors.push(format!(
                "hls.retained_segments ({}) must be >= hls.playlist_size ({})",
                self.hls.retained_segments(),
                self.hls.playlist_size
            ));
        }
        if self.features.enable_hls && self.features.enable_rtsp
            && self.server.hls_port == self.server.rtsp_port
        {
            errors.push(format!(
                "server.hls_port and server.rtsp_port must differ (both {})",
                self.server.hls_port
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    #[must_use]
    pub fn hls_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.hls_port)
    }

    #[must_use]
    pub fn rtsp_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.rtsp_port)
    }
}
