use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::protocol::{CloseFrame, Message, frame::coding::CloseCode},
};

use crate::types::{
    Blob, FunctionResponse, RealtimeInput, RealtimeInputRequest, ServerMessage, Setup,
    SetupRequest, ToolResponse, ToolResponseRequest,
};

pub mod config;
pub mod consts;
mod utils;

pub use config::{Config, ConfigBuilder};

type WsWriter =
    futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsReader = futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Close code used when the socket ends without a close frame.
const ABNORMAL_CLOSURE: u16 = 1006;

/// What the reader produced: a decoded server message or the end of the connection.
#[derive(Debug, Clone)]
pub enum Incoming {
    Message(Box<ServerMessage>),
    Closed { code: u16, reason: String },
}

impl Incoming {
    fn closed(frame: Option<CloseFrame<'static>>) -> Self {
        match frame {
            Some(frame) => Incoming::Closed {
                code: u16::from(frame.code),
                reason: frame.reason.into_owned(),
            },
            None => Incoming::Closed {
                code: ABNORMAL_CLOSURE,
                reason: String::new(),
            },
        }
    }
}

/// Returns true for a close code that signals an orderly shutdown.
pub fn is_normal_close(code: u16) -> bool {
    code == u16::from(CloseCode::Normal) || code == u16::from(CloseCode::Away)
}

/// A connected Gemini Live session whose setup handshake has completed.
pub struct GeminiClient {
    writer: GeminiWriter,
    reader: GeminiReader,
}

/// Opens the websocket, sends the setup message and waits for `setupComplete`.
pub async fn connect(config: &Config, setup: Setup) -> Result<GeminiClient> {
    let request = utils::build_request(config).context("Failed to build Gemini Live request")?;
    let (ws_stream, _) = connect_async(request)
        .await
        .context("Failed to connect to Gemini Live WebSocket")?;
    tracing::info!("Connected to Gemini Live WebSocket, sending setup.");

    let (write, read) = ws_stream.split();
    let writer = GeminiWriter {
        inner: Arc::new(Mutex::new(write)),
    };
    let mut reader = GeminiReader { read };

    writer
        .send_json(&SetupRequest { setup }, "setup")
        .await?;

    loop {
        match reader.next_event().await? {
            Incoming::Message(message) if message.setup_complete.is_some() => {
                tracing::info!("Gemini Live setup complete.");
                break;
            }
            Incoming::Message(message) => {
                tracing::warn!("Ignoring message received before setup completed: {:?}", message);
            }
            Incoming::Closed { code, reason } => {
                anyhow::bail!("connection closed during setup (code {code}): {reason}");
            }
        }
    }

    Ok(GeminiClient { writer, reader })
}

impl GeminiClient {
    pub fn writer(&self) -> GeminiWriter {
        self.writer.clone()
    }

    /// Separates the cloneable send half from the receive half.
    pub fn split(self) -> (GeminiWriter, GeminiReader) {
        (self.writer, self.reader)
    }
}

/// Send half of the connection. Clones share one socket; each send completes
/// before the next one starts.
#[derive(Clone)]
pub struct GeminiWriter {
    inner: Arc<Mutex<WsWriter>>,
}

impl GeminiWriter {
    async fn send_json<T: Serialize>(&self, message: &T, what: &str) -> Result<()> {
        let json = serde_json::to_string(message)
            .with_context(|| format!("Failed to serialize {what} message"))?;
        self.inner
            .lock()
            .await
            .send(Message::Text(json))
            .await
            .with_context(|| format!("Failed to send {what} message"))
    }

    /// Sends one base64 PCM chunk as realtime input.
    pub async fn send_realtime_audio(&self, mime_type: &str, data: String) -> Result<()> {
        let req = RealtimeInputRequest {
            realtime_input: RealtimeInput {
                media_chunks: vec![Blob {
                    mime_type: mime_type.to_string(),
                    data,
                }],
            },
        };
        self.send_json(&req, "realtime input").await
    }

    /// Answers one or more function calls.
    pub async fn send_tool_response(&self, responses: Vec<FunctionResponse>) -> Result<()> {
        let req = ToolResponseRequest {
            tool_response: ToolResponse {
                function_responses: responses,
            },
        };
        self.send_json(&req, "tool response").await
    }

    /// Sends a normal close frame and shuts the sink.
    pub async fn close(&self) -> Result<()> {
        let mut write = self.inner.lock().await;
        write
            .send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            })))
            .await
            .context("Failed to send close frame")?;
        write.close().await.context("Failed to close Gemini Live socket")
    }
}

/// Receive half of the connection.
pub struct GeminiReader {
    read: WsReader,
}

impl GeminiReader {
    /// Reads the next event from the server. Text and binary frames both carry JSON.
    pub async fn next_event(&mut self) -> Result<Incoming> {
        while let Some(msg) = self.read.next().await {
            let payload = match msg {
                Ok(Message::Text(text)) => text.into_bytes(),
                Ok(Message::Binary(bin)) => bin,
                Ok(Message::Close(frame)) => {
                    tracing::info!("Gemini Live connection closed: {:?}", frame);
                    return Ok(Incoming::closed(frame));
                }
                Ok(_) => continue, // Ping/Pong
                Err(e) => {
                    tracing::error!("Error reading from Gemini Live WebSocket: {}", e);
                    return Err(e.into());
                }
            };

            match serde_json::from_slice::<ServerMessage>(&payload) {
                Ok(message) => return Ok(Incoming::Message(Box::new(message))),
                Err(e) => {
                    tracing::error!(
                        "failed to deserialize server message: {}, text=> {:?}",
                        e,
                        String::from_utf8_lossy(&payload)
                    );
                }
            }
        }
        Ok(Incoming::closed(None))
    }
}
