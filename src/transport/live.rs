//! Gemini Live WebSocket client
//!
//! The connection runs on its own task. Microphone chunks go out through a
//! bounded queue and server frames come back as [`TransportEvent`]s, so the
//! session reactor never waits on the network.

use super::protocol::{setup_message, RealtimeInputMessage, ServerMessage};
use super::{RealtimeChunk, RealtimeSink, TransportEvent};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, trace, warn};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError, UnboundedSender};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

/// Gemini Live WebSocket endpoint
const GEMINI_LIVE_WS_URL: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Capacity of the outbound queue, roughly four seconds of 256-sample frames
const OUTBOUND_QUEUE: usize = 256;

/// How long [`LiveSession::close`] waits for the close frame to go out
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Connection parameters
#[derive(Clone, Debug)]
pub struct LiveConfig {
    pub api_key: String,
    pub model: String,
    pub voice: String,
}

#[derive(Debug)]
enum OutboundMessage {
    Audio(RealtimeChunk),
    Close,
}

/// Handle to a running Gemini Live connection
#[derive(Clone)]
pub struct LiveSession {
    outbound: mpsc::Sender<OutboundMessage>,
    session_id: String,
}

impl LiveSession {
    /// Start connecting in the background. Progress and server messages
    /// are reported on `events`.
    pub fn spawn(config: LiveConfig, events: UnboundedSender<TransportEvent>) -> Self {
        let (outbound, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let session_id = Uuid::new_v4().to_string();

        tokio::spawn(run_connection(config, session_id.clone(), rx, events));

        Self {
            outbound,
            session_id,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Ask the connection task to send a close frame and wait for it to
    /// exit
    pub async fn close(&self) {
        if self.outbound.send(OutboundMessage::Close).await.is_err() {
            return;
        }
        if tokio::time::timeout(CLOSE_TIMEOUT, self.outbound.closed())
            .await
            .is_err()
        {
            warn!("[{}] Connection did not close in time", self.session_id);
        }
    }
}

impl RealtimeSink for LiveSession {
    fn send_realtime(&self, chunk: RealtimeChunk) {
        match self.outbound.try_send(OutboundMessage::Audio(chunk)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("[{}] Outbound queue full, dropping audio chunk", self.session_id);
            }
            Err(TrySendError::Closed(_)) => {
                trace!("[{}] Connection closed, dropping audio chunk", self.session_id);
            }
        }
    }
}

async fn run_connection(
    config: LiveConfig,
    session_id: String,
    rx: mpsc::Receiver<OutboundMessage>,
    events: UnboundedSender<TransportEvent>,
) {
    let ws = match connect(&config, &session_id).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!("[{}] {}", session_id, e);
            let _ = events.send(TransportEvent::Error(e));
            let _ = events.send(TransportEvent::Close("connection failed".to_string()));
            return;
        }
    };

    let _ = events.send(TransportEvent::Open);

    let (sink, stream) = ws.split();
    tokio::select! {
        _ = outbound_loop(rx, sink, &session_id) => {
            let _ = events.send(TransportEvent::Close("closed by client".to_string()));
        }
        _ = inbound_loop(stream, &events, &session_id) => {}
    }

    debug!("[{}] Connection task finished", session_id);
}

async fn connect(config: &LiveConfig, session_id: &str) -> Result<WsStream, String> {
    let url = format!("{}?key={}", GEMINI_LIVE_WS_URL, config.api_key);

    info!(
        "[{}] Connecting to Gemini Live (model {}, voice {})",
        session_id, config.model, config.voice
    );

    let (mut ws, _response) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .map_err(|e| format!("Failed to connect to Gemini Live: {}", e))?;

    let setup = serde_json::to_string(&setup_message(&config.model, &config.voice))
        .map_err(|e| format!("Failed to serialize setup message: {}", e))?;
    ws.send(WsMessage::Text(setup.into()))
        .await
        .map_err(|e| format!("Failed to send setup message: {}", e))?;

    Ok(ws)
}

/// Serialize queued chunks onto the socket until closed
async fn outbound_loop(
    mut rx: mpsc::Receiver<OutboundMessage>,
    mut sink: SplitSink<WsStream, WsMessage>,
    session_id: &str,
) {
    let mut chunks_sent: u64 = 0;

    while let Some(msg) = rx.recv().await {
        match msg {
            OutboundMessage::Audio(chunk) => {
                let json = match serde_json::to_string(&RealtimeInputMessage::from(&chunk)) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("[{}] Failed to serialize audio chunk: {}", session_id, e);
                        continue;
                    }
                };

                if sink.send(WsMessage::Text(json.into())).await.is_err() {
                    warn!("[{}] WebSocket send failed, closing outbound loop", session_id);
                    return;
                }

                chunks_sent += 1;
                if chunks_sent == 1 || chunks_sent % 500 == 0 {
                    debug!("[{}] Sent {} audio chunks", session_id, chunks_sent);
                }
            }
            OutboundMessage::Close => {
                let _ = sink.send(WsMessage::Close(None)).await;
                info!("[{}] Closed by client after {} chunks", session_id, chunks_sent);
                return;
            }
        }
    }
}

/// Turn server frames into transport events until the socket closes
async fn inbound_loop(
    mut stream: SplitStream<WsStream>,
    events: &UnboundedSender<TransportEvent>,
    session_id: &str,
) {
    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(WsMessage::Text(text)) => text.as_str().to_string(),
            // Gemini Live sends JSON in binary frames too
            Ok(WsMessage::Binary(data)) if data.first() == Some(&b'{') => {
                match std::str::from_utf8(&data) {
                    Ok(text) => text.to_string(),
                    Err(e) => {
                        warn!("[{}] Non-UTF-8 JSON frame: {}", session_id, e);
                        continue;
                    }
                }
            }
            Ok(WsMessage::Close(frame)) => {
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .unwrap_or_default();
                info!("[{}] Server closed the connection: {}", session_id, reason);
                let _ = events.send(TransportEvent::Close(reason));
                return;
            }
            Ok(other) => {
                trace!("[{}] Ignoring frame: {:?}", session_id, other);
                continue;
            }
            Err(e) => {
                let _ = events.send(TransportEvent::Error(format!("WebSocket error: {}", e)));
                let _ = events.send(TransportEvent::Close("connection lost".to_string()));
                return;
            }
        };

        match ServerMessage::parse(&text) {
            Ok(msg) => {
                if msg.is_setup_complete() {
                    info!("[{}] Setup complete, ready to stream", session_id);
                }
                if let Some(message) = msg.error_message() {
                    let _ = events.send(TransportEvent::Error(message));
                }
                let _ = events.send(TransportEvent::Message(msg));
            }
            Err(e) => {
                let _ = events.send(TransportEvent::Error(format!(
                    "Failed to parse server message: {}",
                    e
                )));
            }
        }
    }

    let _ = events.send(TransportEvent::Close("stream ended".to_string()));
}
