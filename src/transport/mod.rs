//! Connection to the remote conversational audio service
//!
//! The session core only sees two things from here: a [`RealtimeSink`] that
//! accepts microphone chunks, and a stream of [`TransportEvent`]s.

mod live;
mod protocol;

pub use live::{LiveConfig, LiveSession};
pub use protocol::ServerMessage;

/// One captured frame, ready for the wire
#[derive(Clone, Debug, PartialEq)]
pub struct RealtimeChunk {
    /// e.g. `audio/pcm;rate=16000`
    pub mime_type: String,
    /// Base64-encoded 16-bit little-endian PCM
    pub data: String,
    pub sample_rate_hz: u32,
}

/// Outbound half of the transport. Fire-and-forget.
pub trait RealtimeSink {
    fn send_realtime(&self, chunk: RealtimeChunk);
}

/// Notifications from the remote session
#[derive(Clone, Debug)]
pub enum TransportEvent {
    Open,
    Message(ServerMessage),
    Error(String),
    Close(String),
}
