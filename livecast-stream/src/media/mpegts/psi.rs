use bytes::{BufMut, BytesMut};

use super::{crc32::crc32, SYNC_BYTE, TS_PACKET_SIZE};

const PAT_TABLE_ID: u8 = 0x00;
const PMT_TABLE_ID: u8 = 0x02;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatEntry {
    pub program_number: u16,
    pub pmt_pid: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PmtStream {
    pub stream_type: u8,
    pub pid: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pmt {
    pub program_number: u16,
    pub pcr_pid: u16,
    pub streams: Vec<PmtStream>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PsiError {
    #[error("section truncated")]
    Truncated,

    #[error("unexpected table id {0:#04x}")]
    TableId(u8),

    #[error("CRC mismatch")]
    Crc,
}

//ITU-T H.222.0 2.4.4.3
pub fn write_pat(programs: &[PatEntry]) -> BytesMut {
    let mut section = BytesMut::with_capacity(12 + programs.len() * 4);

    /*table id*/
    section.put_u8(PAT_TABLE_ID);
    /*section length*/
    let length = programs.len() as u16 * 4 + 5 + 4;
    section.put_u16(0xB000 | length);
    /*transport_stream_id*/
    section.put_u16(1);
    /*version_number 0, current_next 1*/
    section.put_u8(0xC1);
    /*section_number, last_section_number*/
    section.put_u16(0x0000);

    for program in programs {
        section.put_u16(program.program_number);
        section.put_u16(0xE000 | program.pmt_pid);
    }

    let crc = crc32(&section);
    section.put_u32(crc);
    section
}

//ITU-T H.222.0 2.4.4.8
pub fn write_pmt(pmt: &Pmt) -> BytesMut {
    let mut section = BytesMut::with_capacity(16 + pmt.streams.len() * 5);

    section.put_u8(PMT_TABLE_ID);
    let length = pmt.streams.len() as u16 * 5 + 9 + 4;
    section.put_u16(0xB000 | length);
    section.put_u16(pmt.program_number);
    section.put_u8(0xC1);
    section.put_u16(0x0000);
    /*PCR_PID*/
    section.put_u16(0xE000 | pmt.pcr_pid);
    /*program_info_length*/
    section.put_u16(0xF000);

    for stream in &pmt.streams {
        section.put_u8(stream.stream_type);
        section.put_u16(0xE000 | stream.pid);
        /*ES_info_length*/
        section.put_u16(0xF000);
    }

    let crc = crc32(&section);
    section.put_u32(crc);
    section
}

/// Wrap a PSI section into one transport packet (pointer field 0, 0xFF stuffing)
#[must_use]
pub fn packetize_section(pid: u16, continuity_counter: u8, section: &[u8]) -> [u8; TS_PACKET_SIZE] {
    let mut packet = [0xFFu8; TS_PACKET_SIZE];
    packet[0] = SYNC_BYTE;
    packet[1] = 0x40 | ((pid >> 8) as u8 & 0x1F);
    packet[2] = (pid & 0xFF) as u8;
    packet[3] = 0x10 | (continuity_counter & 0x0F);
    packet[4] = 0x00;
    let len = section.len().min(TS_PACKET_SIZE - 5);
    packet[5..5 + len].copy_from_slice(&section[..len]);
    packet
}

/// Locate a section inside a PUSI packet payload and check its CRC
fn section_from_payload(payload: &[u8], table_id: u8) -> Result<&[u8], PsiError> {
    let pointer = usize::from(*payload.first().ok_or(PsiError::Truncated)?);
    let section = payload.get(1 + pointer..).ok_or(PsiError::Truncated)?;
    if section.len() < 3 {
        return Err(PsiError::Truncated);
    }
    if section[0] != table_id {
        return Err(PsiError::TableId(section[0]));
    }
    let length = usize::from(u16::from_be_bytes([section[1], section[2]]) & 0x0FFF);
    let section = section.get(..3 + length).ok_or(PsiError::Truncated)?;
    if length < 4 || crc32(section) != 0 {
        return Err(PsiError::Crc);
    }
    Ok(section)
}

pub fn parse_pat(payload: &[u8]) -> Result<Vec<PatEntry>, PsiError> {
    let section = section_from_payload(payload, PAT_TABLE_ID)?;
    let body = section
        .get(8..section.len() - 4)
        .ok_or(PsiError::Truncated)?;

    Ok(body
        .chunks_exact(4)
        .map(|entry| PatEntry {
            program_number: u16::from_be_bytes([entry[0], entry[1]]),
            pmt_pid: u16::from_be_bytes([entry[2], entry[3]]) & 0x1FFF,
        })
        // program 0 points at the network PID, not a PMT
        .filter(|entry| entry.program_number != 0)
        .collect())
}

pub fn parse_pmt(payload: &[u8]) -> Result<Pmt, PsiError> {
    let section = section_from_payload(payload, PMT_TABLE_ID)?;
    if section.len() < 16 {
        return Err(PsiError::Truncated);
    }
    let program_number = u16::from_be_bytes([section[3], section[4]]);
    let pcr_pid = u16::from_be_bytes([section[8], section[9]]) & 0x1FFF;
    let program_info_length = usize::from(u16::from_be_bytes([section[10], section[11]]) & 0x0FFF);

    let end = section.len() - 4;
    let mut offset = 12 + program_info_length;
    let mut streams = Vec::new();
    while offset + 5 <= end {
        let stream_type = section[offset];
        let pid = u16::from_be_bytes([section[offset + 1], section[offset + 2]]) & 0x1FFF;
        let es_info_length =
            usize::from(u16::from_be_bytes([section[offset + 3], section[offset + 4]]) & 0x0FFF);
        streams.push(PmtStream { stream_type, pid });
        offset += 5 + es_info_length;
    }

    Ok(Pmt {
        program_number,
        pcr_pid,
        streams,
    })
}
