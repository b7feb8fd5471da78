use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{
    classify_stream_type, parse_pts, payload, psi, random_access, TsHeader, PAT_PID, SYNC_BYTE,
    TS_PACKET_SIZE,
};
use crate::media::{
    Frame, MediaError, MediaKind, MediaSource, Packet, SourceContainer, SourceInfo, StreamInfo,
    TransportOptions,
};

/// Packets read while looking for PAT/PMT before giving up
const SCAN_PACKET_LIMIT: usize = 20_000;

/// Upper bound for one reassembled PES unit
const MAX_UNIT_SIZE: usize = 8 * 1024 * 1024;

/// PTS clock rate
const PTS_HZ: u64 = 90_000;

/// A forward PTS jump beyond this restarts pacing instead of stalling
const MAX_PACING_GAP: i64 = 10 * 90_000;

type TsPacket = [u8; TS_PACKET_SIZE];
type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Opens MPEG-TS byte streams
///
/// - `file:///path/to/input.ts` or a plain path reads a file
/// - `tcp://host:port` connects to a raw MPEG-TS socket
/// - anything else (`rtsp://`, `http://`, `srt://`, ...) is remuxed to
///   MPEG-TS by an `ffmpeg` child process
///
/// Files are replayed at their recorded speed: video units are released no
/// faster than their PTS advance, so a replayed recording rotates segments
/// like a live feed. Network sources are never paced.
#[derive(Debug, Clone)]
pub struct TsSource {
    ffmpeg_path: String,
    pace_files: bool,
}

impl Default for TsSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TsSource {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            pace_files: true,
        }
    }

    #[must_use]
    pub fn with_ffmpeg_path(mut self, path: impl Into<String>) -> Self {
        self.ffmpeg_path = path.into();
        self
    }

    /// Read files as fast as the disk allows instead of at recorded speed
    #[must_use]
    pub fn with_file_pacing(mut self, enabled: bool) -> Self {
        self.pace_files = enabled;
        self
    }

    fn spawn_remuxer(
        &self,
        locator: &str,
        transport: &TransportOptions,
    ) -> Result<(ByteStream, Child), MediaError> {
        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.args(["-hide_banner", "-loglevel", "error"]);
        if locator.starts_with("rtsp://") || locator.starts_with("rtsps://") {
            cmd.args(["-rtsp_transport", transport.rtsp_transport.as_str()]);
        }
        cmd.args(["-timeout", &transport.timeout.as_micros().to_string()])
            .args(["-i", locator])
            .args(["-c", "copy", "-f", "mpegts", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            MediaError::Open(format!("failed to spawn {}: {e}", self.ffmpeg_path))
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MediaError::Open("remuxer stdout not captured".to_string()))?;

        Ok((Box::new(stdout), child))
    }
}

#[async_trait]
impl MediaSource for TsSource {
    async fn open(
        &self,
        locator: &str,
        transport: &TransportOptions,
    ) -> Result<Box<dyn SourceContainer>, MediaError> {
        let mut pacer = None;
        let (reader, child): (ByteStream, Option<Child>) =
            if let Some(addr) = locator.strip_prefix("tcp://") {
                let stream = tokio::time::timeout(transport.timeout, TcpStream::connect(addr))
                    .await
                    .map_err(|_| MediaError::Open(format!("connect to {addr} timed out")))?
                    .map_err(|e| MediaError::Open(format!("connect to {addr}: {e}")))?;
                (Box::new(stream) as ByteStream, None)
            } else if let Some(path) = file_path(locator) {
                let file = tokio::fs::File::open(path)
                    .await
                    .map_err(|e| MediaError::Open(format!("{path}: {e}")))?;
                if self.pace_files {
                    pacer = Some(Pacer::default());
                }
                (Box::new(file) as ByteStream, None)
            } else {
                let (reader, child) = self.spawn_remuxer(locator, transport)?;
                (reader, Some(child))
            };

        let mut container = TsSourceContainer::new(reader, child);
        container.pacer = pacer;
        if let Err(e) = container.read_program().await {
            container.close().await.ok();
            return Err(e);
        }

        info!(
            locator = %locator,
            video = ?container.info.video.as_ref().map(|s| &s.codec),
            audio = ?container.info.audio.as_ref().map(|s| &s.codec),
            "Opened MPEG-TS source"
        );
        Ok(Box::new(container))
    }
}

fn file_path(locator: &str) -> Option<&str> {
    if let Some(path) = locator.strip_prefix("file://") {
        return Some(path);
    }
    (!locator.contains("://")).then_some(locator)
}

/// Maps video PTS onto the wall clock from the first paced unit
#[derive(Debug, Default)]
struct Pacer {
    anchor: Option<(i64, Instant)>,
}

impl Pacer {
    /// When a unit stamped `pts` is due, or `None` to release it at once
    fn deadline(&mut self, pts: i64, now: Instant) -> Option<Instant> {
        if let Some((base, start)) = self.anchor {
            let ahead = pts - base;
            if (0..=MAX_PACING_GAP).contains(&ahead) {
                let micros = ahead.unsigned_abs() * 1_000_000 / PTS_HZ;
                return Some(start + Duration::from_micros(micros));
            }
            debug!(pts, base, "PTS discontinuity, restarting pacing");
        }
        self.anchor = Some((pts, now));
        None
    }
}

#[derive(Debug, Clone, Copy)]
struct Track {
    pid: u16,
    kind: MediaKind,
    stream_index: usize,
}

#[derive(Debug)]
struct PendingUnit {
    track: Track,
    pts: Option<i64>,
    keyframe: bool,
    data: BytesMut,
}

impl PendingUnit {
    fn into_packet(self) -> Packet {
        Packet {
            kind: self.track.kind,
            stream_index: self.track.stream_index,
            pts: self.pts,
            keyframe: self.keyframe,
            data: self.data.freeze(),
        }
    }
}

/// An opened MPEG-TS input
///
/// Every demuxed [`Packet`] holds the raw transport packets of one PES unit,
/// so the sink can pass them through untouched apart from PID and continuity
/// counter.
pub struct TsSourceContainer {
    reader: BufReader<ByteStream>,
    child: Option<Child>,
    info: SourceInfo,
    tracks: Vec<Track>,
    /// Packets read while looking for the program tables, replayed before reading further
    backlog: VecDeque<TsPacket>,
    pending: Vec<PendingUnit>,
    ready: VecDeque<Packet>,
    eof: bool,
    max_unit_size: usize,
    /// Oversized units thrown away since the pipeline last asked
    discarded: u64,
    pacer: Option<Pacer>,
}

impl TsSourceContainer {
    fn new(reader: ByteStream, child: Option<Child>) -> Self {
        Self {
            reader: BufReader::new(reader),
            child,
            info: SourceInfo::default(),
            tracks: Vec::new(),
            backlog: VecDeque::new(),
            pending: Vec::new(),
            ready: VecDeque::new(),
            eof: false,
            max_unit_size: MAX_UNIT_SIZE,
            discarded: 0,
            pacer: None,
        }
    }

    /// Read until PAT and PMT are known
    async fn read_program(&mut self) -> Result<(), MediaError> {
        let mut pmt_pid = None;

        for _ in 0..SCAN_PACKET_LIMIT {
            let Some(packet) = self.read_packet().await? else {
                break;
            };
            let Some(header) = TsHeader::parse(&packet) else {
                continue;
            };

            if header.pid == PAT_PID && header.payload_unit_start {
                if let Some(entry) = payload(&packet)
                    .and_then(|p| psi::parse_pat(p).ok())
                    .and_then(|entries| entries.into_iter().next())
                {
                    pmt_pid = Some(entry.pmt_pid);
                }
                continue;
            }

            if Some(header.pid) == pmt_pid && header.payload_unit_start {
                match payload(&packet).map(psi::parse_pmt) {
                    Some(Ok(pmt)) => {
                        self.select_tracks(&pmt);
                        return Ok(());
                    }
                    Some(Err(e)) => debug!("Skipping bad PMT: {e}"),
                    None => {}
                }
                continue;
            }

            self.backlog.push_back(packet);
        }

        Err(MediaError::Open(
            "no program map table found in MPEG-TS input".to_string(),
        ))
    }

    fn select_tracks(&mut self, pmt: &psi::Pmt) {
        for (index, stream) in pmt.streams.iter().enumerate() {
            let Some((kind, codec)) = classify_stream_type(stream.stream_type) else {
                debug!(
                    pid = stream.pid,
                    stream_type = stream.stream_type,
                    "Ignoring elementary stream"
                );
                continue;
            };
            let slot = match kind {
                MediaKind::Video => &mut self.info.video,
                MediaKind::Audio => &mut self.info.audio,
            };
            if slot.is_some() {
                continue;
            }
            *slot = Some(StreamInfo {
                index,
                codec: codec.to_string(),
            });
            self.tracks.push(Track {
                pid: stream.pid,
                kind,
                stream_index: index,
            });
        }
    }

    async fn read_packet(&mut self) -> Result<Option<TsPacket>, MediaError> {
        let mut skipped = 0usize;
        loop {
            match self.reader.read_u8().await {
                Ok(SYNC_BYTE) => break,
                Ok(_) => skipped += 1,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
                Err(e) => return Err(MediaError::Demux(e.to_string())),
            }
        }
        if skipped > 0 {
            warn!(skipped, "Lost MPEG-TS sync, skipped bytes");
        }

        let mut packet = [0u8; TS_PACKET_SIZE];
        packet[0] = SYNC_BYTE;
        match self.reader.read_exact(&mut packet[1..]).await {
            Ok(_) => Ok(Some(packet)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(MediaError::Demux(e.to_string())),
        }
    }

    fn push_ts_packet(&mut self, packet: &TsPacket) {
        let Some(header) = TsHeader::parse(packet) else {
            return;
        };
        let Some(track) = self.tracks.iter().copied().find(|t| t.pid == header.pid) else {
            return;
        };
        let slot = self.pending.iter().position(|u| u.track.pid == track.pid);

        if header.payload_unit_start {
            if let Some(i) = slot {
                let unit = self.pending.swap_remove(i);
                self.ready.push_back(unit.into_packet());
            }
            let mut data = BytesMut::with_capacity(TS_PACKET_SIZE * 8);
            data.extend_from_slice(packet);
            self.pending.push(PendingUnit {
                track,
                pts: payload(packet).and_then(parse_pts),
                keyframe: track.kind == MediaKind::Audio || random_access(packet),
                data,
            });
            return;
        }

        // Continuation packets before the first unit start are useless
        let Some(i) = slot else {
            return;
        };
        if self.pending[i].data.len() + TS_PACKET_SIZE > self.max_unit_size {
            warn!(
                pid = track.pid,
                "PES unit exceeds {} bytes, discarding",
                self.max_unit_size
            );
            self.pending.swap_remove(i);
            self.discarded += 1;
            return;
        }
        self.pending[i].data.extend_from_slice(packet);
    }

    fn flush_pending(&mut self) {
        for unit in self.pending.drain(..) {
            self.ready.push_back(unit.into_packet());
        }
    }
}

#[async_trait]
impl SourceContainer for TsSourceContainer {
    fn info(&self) -> &SourceInfo {
        &self.info
    }

    async fn demux(&mut self) -> Result<Option<Packet>, MediaError> {
        loop {
            if let Some(packet) = self.ready.pop_front() {
                if let (Some(pacer), Some(pts), MediaKind::Video) =
                    (self.pacer.as_mut(), packet.pts, packet.kind)
                {
                    if let Some(deadline) = pacer.deadline(pts, Instant::now()) {
                        tokio::time::sleep_until(deadline).await;
                    }
                }
                return Ok(Some(packet));
            }
            if self.eof {
                return Ok(None);
            }

            let next = match self.backlog.pop_front() {
                Some(packet) => Some(packet),
                None => self.read_packet().await?,
            };
            match next {
                Some(packet) => self.push_ts_packet(&packet),
                None => {
                    self.eof = true;
                    self.flush_pending();
                }
            }
        }
    }

    fn take_discarded(&mut self) -> u64 {
        std::mem::take(&mut self.discarded)
    }

    fn decode(&mut self, packet: Packet) -> Result<Vec<Frame>, MediaError> {
        let data: &Bytes = &packet.data;
        if data.is_empty() || data.len() % TS_PACKET_SIZE != 0 {
            return Err(MediaError::Decode(format!(
                "{} unit of {} bytes is not packet aligned",
                packet.kind,
                data.len()
            )));
        }
        let first = &data[..TS_PACKET_SIZE];
        let starts_unit = TsHeader::parse(first).is_some_and(|h| h.payload_unit_start);
        let has_start_code = payload(first).is_some_and(|p| p.starts_with(&[0x00, 0x00, 0x01]));
        if !starts_unit || !has_start_code {
            return Err(MediaError::Decode(format!(
                "{} unit does not start with a PES header",
                packet.kind
            )));
        }

        Ok(vec![Frame {
            kind: packet.kind,
            pts: packet.pts,
            keyframe: packet.keyframe,
            geometry: None,
            data: packet.data,
        }])
    }

    async fn close(&mut self) -> Result<(), MediaError> {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill().await {
                debug!("Remuxer already exited: {e}");
            }
        }
        Ok(())
    }
}
