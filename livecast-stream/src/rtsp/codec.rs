//! RTSP/1.0 message framing over a byte stream
//!
//! A request is a head terminated by an empty line, followed by
//! `Content-Length` bytes of body. Heads whose request line or
//! `Content-Length` cannot be parsed are still framed and surfaced as
//! [`RtspMessage::Malformed`] so the caller can answer them; only the size
//! limits close the connection.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt::Write;
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound for a request head, request line included
pub const MAX_HEAD_SIZE: usize = 8 * 1024;
/// Upper bound for a request body
pub const MAX_BODY_SIZE: usize = 64 * 1024;

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

#[derive(Debug, thiserror::Error)]
pub enum RtspError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("request head exceeds {MAX_HEAD_SIZE} bytes")]
    HeadTooLarge,

    #[error("request body of {0} bytes exceeds {MAX_BODY_SIZE} bytes")]
    BodyTooLarge(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    /// `OPTIONS`, also reached through the `CAPABILITY` token
    Options,
    Describe,
    Setup,
    Play,
    Other(String),
}

impl Method {
    fn parse(token: &str) -> Self {
        match token {
            "OPTIONS" | "CAPABILITY" => Self::Options,
            "DESCRIBE" => Self::Describe,
            "SETUP" => Self::Setup,
            "PLAY" => Self::Play,
            other => Self::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Options => f.write_str("OPTIONS"),
            Self::Describe => f.write_str("DESCRIBE"),
            Self::Setup => f.write_str("SETUP"),
            Self::Play => f.write_str("PLAY"),
            Self::Other(token) => f.write_str(token),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtspRequest {
    pub method: Method,
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl RtspRequest {
    /// Header lookup, case-insensitive on the name
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    #[must_use]
    pub fn cseq(&self) -> Option<&str> {
        self.header("CSeq")
    }
}

/// One framed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtspMessage {
    Request(RtspRequest),
    /// The request line or `Content-Length` did not parse; holds the raw
    /// request line
    Malformed(String),
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn parse_head(head: &str, body: Bytes) -> RtspMessage {
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();

    let headers: Vec<(String, String)> = lines
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect();

    let mut parts = request_line.split_whitespace();
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(uri), Some(version), None) if version.starts_with("RTSP/") => {
            RtspMessage::Request(RtspRequest {
                method: Method::parse(method),
                uri: uri.to_string(),
                headers,
                body,
            })
        }
        _ => RtspMessage::Malformed(request_line.to_string()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtspResponse {
    pub status: u16,
    pub reason: &'static str,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl RtspResponse {
    #[must_use]
    pub fn ok() -> Self {
        Self {
            status: 200,
            reason: "OK",
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    #[must_use]
    pub fn bad_request() -> Self {
        Self {
            status: 400,
            reason: "Bad Request",
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    #[must_use]
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    /// Attach a body; `Content-Length` is added when encoding
    #[must_use]
    pub fn body(mut self, content_type: &str, body: impl Into<Bytes>) -> Self {
        self.headers
            .push(("Content-Type".to_string(), content_type.to_string()));
        self.body = body.into();
        self
    }

    #[must_use]
    pub fn get_header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn write_to(&self, dst: &mut BytesMut) {
        let mut head = String::with_capacity(128);
        let _ = write!(head, "RTSP/1.0 {} {}\r\n", self.status, self.reason);
        for (name, value) in &self.headers {
            let _ = write!(head, "{name}: {value}\r\n");
        }
        if !self.body.is_empty() {
            let _ = write!(head, "Content-Length: {}\r\n", self.body.len());
        }
        head.push_str("\r\n");

        dst.reserve(head.len() + self.body.len());
        dst.put_slice(head.as_bytes());
        dst.put_slice(&self.body);
    }

    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.write_to(&mut buf);
        buf.freeze()
    }
}

#[derive(Debug, Default)]
pub struct RtspCodec;

impl Decoder for RtspCodec {
    type Item = RtspMessage;
    type Error = RtspError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Interleaved empty lines are keep-alives
        while src.starts_with(b"\r\n") {
            src.advance(2);
        }

        let Some(head_len) = src
            .windows(HEAD_TERMINATOR.len())
            .position(|w| w == HEAD_TERMINATOR)
        else {
            if src.len() > MAX_HEAD_SIZE {
                return Err(RtspError::HeadTooLarge);
            }
            return Ok(None);
        };
        if head_len > MAX_HEAD_SIZE {
            return Err(RtspError::HeadTooLarge);
        }

        let head = String::from_utf8_lossy(&src[..head_len]).into_owned();
        let body_len = match head
            .split("\r\n")
            .skip(1)
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("Content-Length"))
        {
            Some((_, value)) => match value.trim().parse::<usize>() {
                Ok(len) => len,
                Err(_) => {
                    // Without a length the body cannot be framed; take the head alone
                    src.advance(head_len + HEAD_TERMINATOR.len());
                    let request_line = head.split("\r\n").next().unwrap_or_default();
                    return Ok(Some(RtspMessage::Malformed(request_line.to_string())));
                }
            },
            None => 0,
        };
        if body_len > MAX_BODY_SIZE {
            return Err(RtspError::BodyTooLarge(body_len));
        }

        let total = head_len + HEAD_TERMINATOR.len() + body_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(total);
        frame.advance(head_len + HEAD_TERMINATOR.len());
        Ok(Some(parse_head(&head, frame.freeze())))
    }
}

impl Encoder<RtspResponse> for RtspCodec {
    type Error = RtspError;

    fn encode(&mut self, item: RtspResponse, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.write_to(dst);
        Ok(())
    }
}
