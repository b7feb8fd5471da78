use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::debug;

use super::{
    psi, stream_type_for_codec, TsHeader, OUTPUT_FIRST_ES_PID, OUTPUT_PMT_PID, PAT_PID,
    TS_PACKET_SIZE,
};
use crate::media::{
    EncoderStream, Frame, MediaError, MediaKind, MediaSink, Packet, SinkContainer, StreamParams,
};

/// Writes MPEG-TS segment files
#[derive(Debug, Clone, Default)]
pub struct TsSink;

#[async_trait]
impl MediaSink for TsSink {
    async fn open(&self, path: &Path) -> Result<Box<dyn SinkContainer>, MediaError> {
        let file = File::create(path)
            .await
            .map_err(|e| MediaError::Open(format!("{}: {e}", path.display())))?;
        Ok(Box::new(TsSinkContainer {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            streams: Vec::new(),
            continuity: HashMap::new(),
            tables_written: false,
        }))
    }

    fn copies_input(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy)]
struct OutputStream {
    pid: u16,
    stream_type: u8,
    kind: MediaKind,
}

/// One segment file being written
pub struct TsSinkContainer {
    writer: BufWriter<File>,
    path: PathBuf,
    streams: Vec<OutputStream>,
    continuity: HashMap<u16, u8>,
    tables_written: bool,
}

impl TsSinkContainer {
    fn next_cc(&mut self, pid: u16) -> u8 {
        let cc = self.continuity.entry(pid).or_insert(0x0F);
        *cc = (*cc + 1) & 0x0F;
        *cc
    }

    /// PAT and PMT at the head of the file so every segment decodes on its own
    async fn write_tables(&mut self) -> Result<(), MediaError> {
        let pcr_pid = self
            .streams
            .iter()
            .find(|s| s.kind == MediaKind::Video)
            .or_else(|| self.streams.first())
            .map_or(OUTPUT_FIRST_ES_PID, |s| s.pid);

        let pat = psi::write_pat(&[psi::PatEntry {
            program_number: 1,
            pmt_pid: OUTPUT_PMT_PID,
        }]);
        let pmt = psi::write_pmt(&psi::Pmt {
            program_number: 1,
            pcr_pid,
            streams: self
                .streams
                .iter()
                .map(|s| psi::PmtStream {
                    stream_type: s.stream_type,
                    pid: s.pid,
                })
                .collect(),
        });

        let pat_cc = self.next_cc(PAT_PID);
        let pmt_cc = self.next_cc(OUTPUT_PMT_PID);
        self.writer
            .write_all(&psi::packetize_section(PAT_PID, pat_cc, &pat))
            .await?;
        self.writer
            .write_all(&psi::packetize_section(OUTPUT_PMT_PID, pmt_cc, &pmt))
            .await?;
        self.tables_written = true;
        Ok(())
    }
}

#[async_trait]
impl SinkContainer for TsSinkContainer {
    fn add_stream(
        &mut self,
        codec: &str,
        params: &StreamParams,
    ) -> Result<Box<dyn EncoderStream>, MediaError> {
        if self.tables_written {
            return Err(MediaError::Mux(
                "streams must be added before the first packet is muxed".to_string(),
            ));
        }
        let stream_type = stream_type_for_codec(codec)
            .ok_or_else(|| MediaError::Unsupported(format!("codec {codec}")))?;

        let stream_index = self.streams.len();
        let pid = OUTPUT_FIRST_ES_PID + stream_index as u16;
        self.streams.push(OutputStream {
            pid,
            stream_type,
            kind: params.kind(),
        });

        debug!(
            path = %self.path.display(),
            codec,
            pid,
            "Added {} output stream",
            params.kind()
        );
        Ok(Box::new(PassthroughEncoder {
            kind: params.kind(),
            stream_index,
        }))
    }

    async fn mux(&mut self, packet: Packet) -> Result<(), MediaError> {
        if !self.tables_written {
            self.write_tables().await?;
        }
        let stream = *self.streams.get(packet.stream_index).ok_or_else(|| {
            MediaError::Mux(format!("no output stream {}", packet.stream_index))
        })?;
        if packet.data.len() % TS_PACKET_SIZE != 0 {
            return Err(MediaError::Mux(format!(
                "{} bytes is not a whole number of transport packets",
                packet.data.len()
            )));
        }

        for chunk in packet.data.chunks_exact(TS_PACKET_SIZE) {
            let mut ts = [0u8; TS_PACKET_SIZE];
            ts.copy_from_slice(chunk);
            let header = TsHeader::parse(&ts)
                .ok_or_else(|| MediaError::Mux("lost transport packet sync".to_string()))?;

            ts[1] = (ts[1] & 0xE0) | ((stream.pid >> 8) as u8 & 0x1F);
            ts[2] = (stream.pid & 0xFF) as u8;
            if header.has_payload() {
                let cc = self.next_cc(stream.pid);
                ts[3] = (ts[3] & 0xF0) | cc;
            }
            self.writer.write_all(&ts).await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), MediaError> {
        if !self.tables_written {
            self.write_tables().await?;
        }
        self.writer.flush().await?;
        Ok(())
    }
}

/// Encoder stream for already-encoded units
///
/// Frames carrying raw pictures (a `geometry`) cannot be passed through.
#[derive(Debug)]
pub struct PassthroughEncoder {
    kind: MediaKind,
    stream_index: usize,
}

impl EncoderStream for PassthroughEncoder {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn encode(&mut self, frame: Option<Frame>) -> Result<Vec<Packet>, MediaError> {
        // nothing is buffered, so flushing yields nothing
        let Some(frame) = frame else {
            return Ok(Vec::new());
        };
        if frame.kind != self.kind {
            return Err(MediaError::Encode(format!(
                "{} frame sent to {} encoder",
                frame.kind, self.kind
            )));
        }
        if frame.geometry.is_some() {
            return Err(MediaError::Encode(
                "raw pictures cannot be passed through".to_string(),
            ));
        }

        Ok(vec![Packet {
            kind: frame.kind,
            stream_index: self.stream_index,
            pts: frame.pts,
            keyframe: frame.keyframe,
            data: frame.data,
        }])
    }
}
