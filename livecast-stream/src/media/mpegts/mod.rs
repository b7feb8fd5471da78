// MPEG-TS passthrough backend
//
// Source side: reads 188-byte transport packets, learns the program layout
// from PAT/PMT and groups elementary-stream packets into PES units.
// Sink side: writes fresh PAT/PMT at the head of every segment file and
// restamps PID + continuity counter of every passed-through packet.

pub mod crc32;
pub mod psi;
pub mod sink;
pub mod source;

pub use sink::{PassthroughEncoder, TsSink, TsSinkContainer};
pub use source::{TsSource, TsSourceContainer};

use crate::media::MediaKind;

pub const TS_PACKET_SIZE: usize = 188;
pub const SYNC_BYTE: u8 = 0x47;
pub const PAT_PID: u16 = 0x0000;

/// PMT PID written by the sink
pub const OUTPUT_PMT_PID: u16 = 0x1000;
/// First elementary-stream PID written by the sink
pub const OUTPUT_FIRST_ES_PID: u16 = 0x0100;

pub mod stream_type {
    pub const MPEG2_VIDEO: u8 = 0x02;
    pub const MPEG1_AUDIO: u8 = 0x03;
    pub const MPEG2_AUDIO: u8 = 0x04;
    pub const AAC: u8 = 0x0F;
    pub const MPEG4_VIDEO: u8 = 0x10;
    pub const H264: u8 = 0x1B;
    pub const H265: u8 = 0x24;
    pub const AC3: u8 = 0x81;
}

/// Classify a PMT stream type as (kind, codec name)
#[must_use]
pub fn classify_stream_type(stream_type: u8) -> Option<(MediaKind, &'static str)> {
    match stream_type {
        stream_type::H264 => Some((MediaKind::Video, "h264")),
        stream_type::H265 => Some((MediaKind::Video, "hevc")),
        stream_type::MPEG2_VIDEO => Some((MediaKind::Video, "mpeg2video")),
        stream_type::MPEG4_VIDEO => Some((MediaKind::Video, "mpeg4")),
        stream_type::AAC => Some((MediaKind::Audio, "aac")),
        stream_type::MPEG1_AUDIO | stream_type::MPEG2_AUDIO => Some((MediaKind::Audio, "mp3")),
        stream_type::AC3 => Some((MediaKind::Audio, "ac3")),
        _ => None,
    }
}

/// Inverse of [`classify_stream_type`] for the codec names the sink accepts
#[must_use]
pub fn stream_type_for_codec(codec: &str) -> Option<u8> {
    match codec.to_ascii_lowercase().as_str() {
        "h264" | "avc" | "libx264" => Some(stream_type::H264),
        "hevc" | "h265" | "libx265" => Some(stream_type::H265),
        "mpeg2video" => Some(stream_type::MPEG2_VIDEO),
        "mpeg4" => Some(stream_type::MPEG4_VIDEO),
        "aac" => Some(stream_type::AAC),
        "mp3" | "mp2" => Some(stream_type::MPEG1_AUDIO),
        "ac3" => Some(stream_type::AC3),
        _ => None,
    }
}

/// Fixed 4-byte transport packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TsHeader {
    pub pid: u16,
    pub payload_unit_start: bool,
    pub adaptation_field_control: u8,
    pub continuity_counter: u8,
}

impl TsHeader {
    /// Parse the header of a full 188-byte packet
    #[must_use]
    pub fn parse(packet: &[u8]) -> Option<Self> {
        if packet.len() != TS_PACKET_SIZE || packet[0] != SYNC_BYTE {
            return None;
        }
        Some(Self {
            pid: (u16::from(packet[1] & 0x1F) << 8) | u16::from(packet[2]),
            payload_unit_start: packet[1] & 0x40 != 0,
            adaptation_field_control: (packet[3] >> 4) & 0x03,
            continuity_counter: packet[3] & 0x0F,
        })
    }

    #[must_use]
    pub const fn has_payload(&self) -> bool {
        self.adaptation_field_control & 0x01 != 0
    }

    #[must_use]
    pub const fn has_adaptation_field(&self) -> bool {
        self.adaptation_field_control & 0x02 != 0
    }
}

/// Slice of `packet` carrying payload bytes, if any
#[must_use]
pub fn payload(packet: &[u8]) -> Option<&[u8]> {
    let header = TsHeader::parse(packet)?;
    if !header.has_payload() {
        return None;
    }
    let start = if header.has_adaptation_field() {
        5 + usize::from(packet[4])
    } else {
        4
    };
    (start < TS_PACKET_SIZE).then(|| &packet[start..])
}

/// `random_access_indicator` from the adaptation field
#[must_use]
pub fn random_access(packet: &[u8]) -> bool {
    TsHeader::parse(packet).is_some_and(|h| {
        h.has_adaptation_field() && packet[4] > 0 && packet[5] & 0x40 != 0
    })
}

/// PTS (90 kHz) from a PES header at the start of `pes`
#[must_use]
pub fn parse_pts(pes: &[u8]) -> Option<i64> {
    if pes.len() < 14 || pes[..3] != [0x00, 0x00, 0x01] {
        return None;
    }
    if pes[7] & 0x80 == 0 {
        return None;
    }
    let b = &pes[9..14];
    let pts = (i64::from(b[0] >> 1) & 0x07) << 30
        | i64::from(b[1]) << 22
        | i64::from(b[2] >> 1) << 15
        | i64::from(b[3]) << 7
        | i64::from(b[4] >> 1);
    Some(pts)
}
