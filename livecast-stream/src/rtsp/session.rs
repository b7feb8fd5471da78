use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use super::codec::{Method, RtspMessage, RtspRequest, RtspResponse};

/// Methods advertised in reply to OPTIONS
pub const PUBLIC_METHODS: &str = "OPTIONS, DESCRIBE, SETUP, PLAY";

/// Fixed session description: one H.264 video track, no real media behind it
pub const SDP: &str = "v=0\r\n\
o=- 0 0 IN IP4 127.0.0.1\r\n\
s=Stream\r\n\
c=IN IP4 127.0.0.1\r\n\
t=0 0\r\n\
m=video 0 RTP/AVP 96\r\n\
a=rtpmap:96 H264/90000\r\n";

/// Transport answered when the client did not send one
pub const DEFAULT_TRANSPORT: &str = "RTP/AVP;unicast;client_port=8000-8001";

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Mint a process-wide unique `session_{n}` id
pub fn next_session_id() -> String {
    let n = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
    format!("session_{n}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Ready,
    Playing,
}

/// Per-connection negotiation state
///
/// ```text
/// INIT --OPTIONS--> INIT
/// INIT --DESCRIBE--> INIT
/// INIT --SETUP--> READY
/// READY --PLAY--> PLAYING
/// ```
///
/// Anything else is answered with 400 and leaves the state untouched.
/// Reaching PLAYING never starts media delivery.
#[derive(Debug)]
pub struct RtspSession {
    id: String,
    state: SessionState,
}

impl Default for RtspSession {
    fn default() -> Self {
        Self::new()
    }
}

impl RtspSession {
    #[must_use]
    pub fn new() -> Self {
        Self::with_id(next_session_id())
    }

    #[must_use]
    pub const fn with_id(id: String) -> Self {
        Self {
            id,
            state: SessionState::Init,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    pub fn handle(&mut self, message: &RtspMessage) -> RtspResponse {
        let request = match message {
            RtspMessage::Request(request) => request,
            RtspMessage::Malformed(line) => {
                debug!(session = %self.id, line = %line, "Malformed request line");
                return RtspResponse::bad_request();
            }
        };

        let response = match (self.state, &request.method) {
            (SessionState::Init, Method::Options) => {
                RtspResponse::ok().header("Public", PUBLIC_METHODS)
            }
            (SessionState::Init, Method::Describe) => {
                RtspResponse::ok().body("application/sdp", SDP)
            }
            (SessionState::Init, Method::Setup) => {
                self.state = SessionState::Ready;
                RtspResponse::ok()
                    .header(
                        "Transport",
                        request.header("Transport").unwrap_or(DEFAULT_TRANSPORT),
                    )
                    .header("Session", self.id.clone())
            }
            (SessionState::Ready, Method::Play) => {
                self.state = SessionState::Playing;
                RtspResponse::ok()
                    .header("Range", "npt=0.000-")
                    .header("Session", self.id.clone())
            }
            (state, method) => {
                debug!(session = %self.id, ?state, %method, "Rejected request");
                RtspResponse::bad_request()
            }
        };

        debug!(
            session = %self.id,
            method = %request.method,
            status = response.status,
            state = ?self.state,
            "Handled request"
        );
        with_cseq(response, request)
    }
}

fn with_cseq(mut response: RtspResponse, request: &RtspRequest) -> RtspResponse {
    if let Some(cseq) = request.cseq() {
        response
            .headers
            .insert(0, ("CSeq".to_string(), cseq.to_string()));
    }
    response
}
