//! RTSP/1.0 control endpoint
//!
//! Negotiates OPTIONS, DESCRIBE, SETUP and PLAY per connection. No RTP media
//! is ever delivered; clients are expected to play the HLS output.

pub mod codec;
pub mod server;
pub mod session;

pub use codec::{Method, RtspCodec, RtspError, RtspMessage, RtspRequest, RtspResponse};
pub use server::RtspServer;
pub use session::{RtspSession, SessionState};
