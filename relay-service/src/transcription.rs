//! Outbound stream client for the transcription backend.
//!
//! One instance exists per room while an audio source is attached. The
//! connection is initiated when the client is created and completes
//! asynchronously; audio forwarding is gated on the handshake having been
//! sent, and frames that arrive earlier are dropped. The client never
//! reconnects on its own: transcription context is tied to source identity,
//! and a silent reconnect would fabricate continuity that does not exist.
//! A new source attach builds a new client.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use scribear_proto::{
    BackendHandshake, StreamConfig, TranscriptMessage, TranscriptSegments,
    TranscriptionSessionConfig,
};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

/// Bound on establishing the backend connection, handshake included.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Audio frames queued towards the backend. When the backend stalls past
/// this, frames are dropped rather than blocking the producer.
const AUDIO_QUEUE_CAPACITY: usize = 64;

/// Where the backend connection for a room lives.
#[derive(Debug, Clone)]
pub struct BackendSettings {
    /// `host[:port]`; the room's `useSsl` flag picks the scheme.
    pub authority: String,
    pub api_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the stream task, in backend order.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptionEvent {
    Connected,
    IpTranscript(TranscriptSegments),
    FinalTranscript(TranscriptSegments),
    Disconnected { code: Option<u16>, reason: String },
    Error(String),
}

/// Handle to the per-room backend stream.
///
/// Dropping the handle closes the stream (the task observes the audio
/// channel closing and sends a normal close); [`disconnect`] does the same
/// explicitly and is valid in any state.
///
/// [`disconnect`]: TranscriptionClient::disconnect
#[derive(Debug)]
pub struct TranscriptionClient {
    audio_tx: mpsc::Sender<Bytes>,
    state_rx: watch::Receiver<ClientState>,
    shutdown_tx: watch::Sender<bool>,
}

impl TranscriptionClient {
    /// Creates the client and initiates the connection. Completion is
    /// asynchronous: the room stays observable with
    /// `transcriptionConnected=false` until the `Connected` event lands.
    pub fn connect(
        backend: &BackendSettings,
        config: &TranscriptionSessionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TranscriptionEvent>) {
        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_QUEUE_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ClientState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(run_stream(StreamTask {
            url: stream_url(&backend.authority, config.use_ssl, &config.provider_key),
            api_key: backend.api_key.clone(),
            config: config.stream_config(),
            audio_rx,
            events: events_tx,
            state: state_tx,
            shutdown: shutdown_rx,
        }));

        (
            Self {
                audio_tx,
                state_rx,
                shutdown_tx,
            },
            events_rx,
        )
    }

    pub fn state(&self) -> ClientState {
        *self.state_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Connected
    }

    /// Best-effort audio passthrough. Frames sent before the handshake
    /// completes, after a disconnect, or while the outbound queue is full are
    /// dropped silently; the producer has no way to be told to pause.
    pub fn send_audio(&self, frame: Bytes) {
        if !self.is_connected() {
            trace!("dropping audio frame: backend stream not connected");
            return;
        }
        if self.audio_tx.try_send(frame).is_err() {
            debug!("dropping audio frame: backend send queue full");
        }
    }

    /// Requests a normal close of the backend stream.
    pub fn disconnect(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

struct StreamTask {
    url: String,
    api_key: String,
    config: StreamConfig,
    audio_rx: mpsc::Receiver<Bytes>,
    events: mpsc::UnboundedSender<TranscriptionEvent>,
    state: watch::Sender<ClientState>,
    shutdown: watch::Receiver<bool>,
}

async fn run_stream(mut task: StreamTask) {
    let ws = tokio::select! {
        result = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(&task.url)) => {
            match result {
                Ok(Ok((ws, _))) => ws,
                Ok(Err(e)) => {
                    let _ = task.events.send(TranscriptionEvent::Error(format!(
                        "backend connect failed: {e}"
                    )));
                    task.state.send_replace(ClientState::Disconnected);
                    return;
                }
                Err(_) => {
                    let _ = task.events.send(TranscriptionEvent::Error(
                        "backend connect timed out".to_string(),
                    ));
                    task.state.send_replace(ClientState::Disconnected);
                    return;
                }
            }
        }
        _ = task.shutdown.changed() => {
            task.state.send_replace(ClientState::Disconnected);
            return;
        }
    };

    let (mut sink, mut stream) = ws.split();

    // Ordered handshake: AUTH first, then CONFIG. Only after both frames are
    // on the wire does the client count as connected.
    let handshake = [
        BackendHandshake::Auth {
            api_key: task.api_key.clone(),
        },
        BackendHandshake::Config {
            config: task.config,
        },
    ];
    for frame in handshake {
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(e) => {
                let _ = task.events.send(TranscriptionEvent::Error(format!(
                    "handshake encode failed: {e}"
                )));
                task.state.send_replace(ClientState::Disconnected);
                return;
            }
        };
        if let Err(e) = sink.send(Message::Text(text)).await {
            let _ = task.events.send(TranscriptionEvent::Error(format!(
                "handshake send failed: {e}"
            )));
            task.state.send_replace(ClientState::Disconnected);
            return;
        }
    }

    task.state.send_replace(ClientState::Connected);
    let _ = task.events.send(TranscriptionEvent::Connected);
    info!(url = %task.url, "transcription stream connected");

    loop {
        tokio::select! {
            frame = task.audio_rx.recv() => match frame {
                // Each producer frame maps to exactly one backend frame.
                Some(bytes) => {
                    if let Err(e) = sink.send(Message::Binary(bytes.to_vec())).await {
                        let _ = task.events.send(TranscriptionEvent::Error(format!(
                            "audio send failed: {e}"
                        )));
                        break;
                    }
                }
                // The owning room dropped the handle; close cleanly.
                None => {
                    let _ = sink.send(close_normal()).await;
                    break;
                }
            },
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if let Some(event) = parse_backend_frame(&text) {
                        if task.events.send(event).is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(f) => (Some(u16::from(f.code)), f.reason.to_string()),
                        None => (None, String::new()),
                    };
                    let _ = task.events.send(TranscriptionEvent::Disconnected { code, reason });
                    break;
                }
                Some(Ok(_)) => {} // binary/ping/pong from the backend carry no transcripts
                Some(Err(e)) => {
                    let _ = task.events.send(TranscriptionEvent::Error(format!(
                        "backend stream error: {e}"
                    )));
                    break;
                }
                None => {
                    let _ = task.events.send(TranscriptionEvent::Disconnected {
                        code: None,
                        reason: String::new(),
                    });
                    break;
                }
            },
            changed = task.shutdown.changed() => {
                if changed.is_err() || *task.shutdown.borrow() {
                    let _ = sink.send(close_normal()).await;
                    break;
                }
            }
        }
    }

    task.state.send_replace(ClientState::Disconnected);
}

fn close_normal() -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "".into(),
    }))
}

/// Maps one backend text frame to an event. Unknown message types and
/// malformed JSON are dropped without terminating the stream.
fn parse_backend_frame(text: &str) -> Option<TranscriptionEvent> {
    match serde_json::from_str::<TranscriptMessage>(text) {
        Ok(TranscriptMessage::IpTranscript(segments)) => {
            Some(TranscriptionEvent::IpTranscript(segments))
        }
        Ok(TranscriptMessage::FinalTranscript(segments)) => {
            Some(TranscriptionEvent::FinalTranscript(segments))
        }
        Ok(TranscriptMessage::Unknown) => {
            debug!("ignoring backend message of unknown type");
            None
        }
        Err(e) => {
            warn!(error = %e, "dropping malformed backend message");
            None
        }
    }
}

fn stream_url(authority: &str, use_ssl: bool, provider_key: &str) -> String {
    let scheme = if use_ssl { "wss" } else { "ws" };
    format!("{scheme}://{authority}/transcription_stream/{provider_key}")
}
