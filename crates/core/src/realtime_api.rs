use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::error::SessionError;
use crate::generic_types::{AudioFrame, LiveEvent, LiveSetup, ToolResult};

/// Send side of an open live session.
/// Every method returns once the transport has accepted the message.
#[async_trait]
pub trait LiveChannel: Send + Sync {
    /// Streams one microphone frame.
    async fn send_realtime_audio(&self, frame: AudioFrame) -> Result<()>;

    /// Answers a single tool call.
    async fn send_tool_response(&self, result: &ToolResult) -> Result<()>;

    /// Closes the connection.
    async fn close(&self) -> Result<()>;
}

/// An opened connection: the send handle plus the inbound event stream.
/// The stream ends after a [`LiveEvent::Closed`] or [`LiveEvent::Error`].
pub struct LiveConnection {
    pub channel: Arc<dyn LiveChannel>,
    pub events: tokio::sync::mpsc::Receiver<LiveEvent>,
}

/// A real-time, bidirectional AI service provider.
#[async_trait]
pub trait LiveConnector: Send + Sync {
    /// Opens the channel and completes the setup handshake.
    async fn connect(&self, setup: LiveSetup) -> Result<LiveConnection, SessionError>;
}
