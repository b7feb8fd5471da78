use livecast_core::StreamConfig;
use std::fmt::Write;

use super::store::{Segment, SegmentStore};

/// CODECS attribute advertised for every variant (H.264 baseline + AAC-LC)
const VARIANT_CODECS: &str = "avc1.42E01E,mp4a.40.2";

/// Renders live playlists from the segment store
///
/// Every call renders from scratch; nothing is cached and no wall-clock value
/// is embedded, so the same snapshot always yields the same bytes.
#[derive(Debug, Clone)]
pub struct PlaylistGenerator {
    bitrates: Vec<u64>,
    width: u32,
    height: u32,
    target_duration_secs: u64,
    playlist_size: usize,
}

impl PlaylistGenerator {
    #[must_use]
    pub fn new(config: &StreamConfig) -> Self {
        Self {
            bitrates: config.video.bitrates.clone(),
            width: config.video.width,
            height: config.video.height,
            target_duration_secs: config.hls.segment_duration_secs,
            playlist_size: config.hls.playlist_size,
        }
    }

    /// Master playlist with one variant per configured video bitrate
    ///
    /// Only one rendition is ever encoded, so every variant resolves to the
    /// same segments.
    #[must_use]
    pub fn master(&self) -> String {
        let mut m3u8 = String::new();
        m3u8.push_str("#EXTM3U\n");
        m3u8.push_str("#EXT-X-VERSION:3\n");

        for bitrate in &self.bitrates {
            let _ = writeln!(
                m3u8,
                "#EXT-X-STREAM-INF:BANDWIDTH={bitrate},RESOLUTION={}x{},CODECS=\"{VARIANT_CODECS}\"",
                self.width, self.height
            );
            let _ = writeln!(m3u8, "/stream_{bitrate}.m3u8");
        }

        m3u8
    }

    /// Live media playlist over the given segments, oldest first
    ///
    /// The caller passes the window; this never emits `#EXT-X-ENDLIST`.
    #[must_use]
    pub fn media(&self, segments: &[Segment]) -> String {
        let mut m3u8 = String::new();
        m3u8.push_str("#EXTM3U\n");
        m3u8.push_str("#EXT-X-VERSION:3\n");

        // A segment may overshoot the target by up to one unit; the tag must
        // still bound every EXTINF once rounded.
        let longest = segments
            .iter()
            .map(|s| s.duration.as_secs_f64().round() as u64)
            .max()
            .unwrap_or(0);
        let target = self.target_duration_secs.max(longest);
        let _ = writeln!(m3u8, "#EXT-X-TARGETDURATION:{target}");

        let first_id = segments.first().map_or(0, |s| s.id);
        let _ = writeln!(m3u8, "#EXT-X-MEDIA-SEQUENCE:{first_id}");

        for segment in segments {
            let _ = writeln!(m3u8, "#EXTINF:{:.3},", segment.duration.as_secs_f64());
            let _ = writeln!(m3u8, "/{}", segment.file_name());
        }

        m3u8
    }

    /// Media playlist over the store's current window
    pub fn media_from_store(&self, store: &SegmentStore) -> String {
        self.media(&store.window(self.playlist_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hls::store::segment_file_name;
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::time::Instant;

    fn generator() -> PlaylistGenerator {
        let mut config = StreamConfig::default();
        config.hls.playlist_size = 3;
        PlaylistGenerator::new(&config)
    }

    fn segment(id: u64, millis: u64) -> Segment {
        Segment {
            id,
            path: PathBuf::from(segment_file_name(id)),
            started_at: Instant::now(),
            duration: Duration::from_millis(millis),
        }
    }

    #[test]
    fn test_master_playlist() {
        let expected = "#EXTM3U\n\
#EXT-X-VERSION:3\n\
#EXT-X-STREAM-INF:BANDWIDTH=2000000,RESOLUTION=1280x720,CODECS=\"avc1.42E01E,mp4a.40.2\"\n\
/stream_2000000.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=1000000,RESOLUTION=1280x720,CODECS=\"avc1.42E01E,mp4a.40.2\"\n\
/stream_1000000.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=500000,RESOLUTION=1280x720,CODECS=\"avc1.42E01E,mp4a.40.2\"\n\
/stream_500000.m3u8\n";

        assert_eq!(generator().master(), expected);
    }

    #[test]
    fn test_media_playlist() {
        let segments = vec![segment(4, 4000), segment(5, 4100), segment(6, 3950)];
        let expected = "#EXTM3U\n\
#EXT-X-VERSION:3\n\
#EXT-X-TARGETDURATION:4\n\
#EXT-X-MEDIA-SEQUENCE:4\n\
#EXTINF:4.000,\n\
/segment_4.ts\n\
#EXTINF:4.100,\n\
/segment_5.ts\n\
#EXTINF:3.950,\n\
/segment_6.ts\n";

        assert_eq!(generator().media(&segments), expected);
    }

    #[test]
    fn test_empty_media_playlist() {
        let m3u8 = generator().media(&[]);
        assert!(m3u8.contains("#EXT-X-TARGETDURATION:4\n"));
        assert!(m3u8.contains("#EXT-X-MEDIA-SEQUENCE:0\n"));
        assert!(!m3u8.contains("#EXTINF"));
        assert!(!m3u8.contains("#EXT-X-ENDLIST"));
    }

    #[test]
    fn test_target_duration_covers_long_segment() {
        let m3u8 = generator().media(&[segment(1, 6600)]);
        assert!(m3u8.contains("#EXT-X-TARGETDURATION:7\n"));
    }

    #[tokio::test]
    async fn test_media_from_store_uses_window() {
        let storage = std::sync::Arc::new(crate::storage::MemoryStorage::new());
        let store = SegmentStore::new(10, storage);
        for id in 1..=5 {
            store.append(segment(id, 4000)).await;
        }

        let generator = generator();
        let m3u8 = generator.media_from_store(&store);
        assert!(m3u8.contains("#EXT-X-MEDIA-SEQUENCE:3\n"));
        assert_eq!(m3u8.matches("#EXTINF").count(), 3);
        assert!(!m3u8.contains("/segment_2.ts"));
        assert!(m3u8.ends_with("/segment_5.ts\n"));

        // same snapshot, same bytes
        assert_eq!(m3u8, generator.media_from_store(&store));
    }
}
