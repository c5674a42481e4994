use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use gemini_live::types::{FunctionDeclaration, FunctionResponse, ServerMessage, Setup};
use gemini_live::{GeminiReader, GeminiWriter, Incoming};
use serde_json::json;
use tokio::sync::mpsc;
use tta_core::error::SessionError;
use tta_core::generic_types::{
    AudioFrame, GroundingChunk, LiveEvent, LiveSetup, Speaker, ToolCall, ToolResult,
};
use tta_core::realtime_api::{LiveChannel, LiveConnection, LiveConnector};

/// Opens Gemini Live sessions for the voice session.
pub struct GeminiConnector {
    config: gemini_live::Config,
}

impl GeminiConnector {
    pub fn new(config: gemini_live::Config) -> Self {
        Self { config }
    }
}

fn build_setup(model: &str, setup: LiveSetup) -> Setup {
    let declarations = setup
        .tools
        .into_iter()
        .map(|tool| FunctionDeclaration {
            name: tool.name,
            description: tool.description,
            parameters: tool.parameters,
        })
        .collect();
    Setup::audio(model, &setup.voice_name)
        .with_system_instruction(&setup.system_instruction)
        .with_function_declarations(declarations)
}

#[async_trait]
impl LiveConnector for GeminiConnector {
    async fn connect(&self, setup: LiveSetup) -> Result<LiveConnection, SessionError> {
        let setup = build_setup(self.config.model(), setup);
        let client = gemini_live::connect(&self.config, setup)
            .await
            .map_err(|e| SessionError::from_remote(format!("{e:#}")))?;
        let (writer, reader) = client.split();

        let (tx, rx) = mpsc::channel(self.config.capacity());
        tokio::spawn(forward_events(reader, tx));

        Ok(LiveConnection {
            channel: Arc::new(GeminiChannel { writer }),
            events: rx,
        })
    }
}

/// Reads the socket until it ends, translating every message.
async fn forward_events(mut reader: GeminiReader, tx: mpsc::Sender<LiveEvent>) {
    loop {
        let events = match reader.next_event().await {
            Ok(Incoming::Message(message)) => translate(*message),
            Ok(Incoming::Closed { code, reason }) => vec![closed_event(code, reason)],
            Err(e) => vec![LiveEvent::Error(format!("{e:#}"))],
        };

        let terminal = events
            .iter()
            .any(|e| matches!(e, LiveEvent::Closed | LiveEvent::Error(_)));
        for event in events {
            if tx.send(event).await.is_err() {
                tracing::debug!("Live event receiver dropped, stopping reader.");
                return;
            }
        }
        if terminal {
            break;
        }
    }
    tracing::info!("Gemini Live reader finished.");
}

fn closed_event(code: u16, reason: String) -> LiveEvent {
    if gemini_live::is_normal_close(code) {
        LiveEvent::Closed
    } else if reason.is_empty() {
        LiveEvent::Error(format!("connection closed with code {code}"))
    } else {
        LiveEvent::Error(reason)
    }
}

/// Splits one server message into provider-neutral events.
///
/// Tool calls come before audio so a call in the same message starts thinking
/// first; the turn boundary comes last.
pub fn translate(message: ServerMessage) -> Vec<LiveEvent> {
    let mut events = Vec::new();

    let content = message.server_content.unwrap_or_default();
    let parts = content.model_turn.map(|turn| turn.parts);
    if parts.is_some() {
        events.push(LiveEvent::ModelTurn);
    }

    if let Some(tool_call) = message.tool_call {
        let calls: Vec<ToolCall> = tool_call
            .function_calls
            .into_iter()
            .map(|call| ToolCall {
                id: call.id,
                name: call.name,
                args: call.args,
            })
            .collect();
        if !calls.is_empty() {
            events.push(LiveEvent::ToolCall(calls));
        }
    }

    if let Some(metadata) = content.grounding_metadata {
        let chunks: Vec<GroundingChunk> = metadata
            .grounding_chunks
            .into_iter()
            .filter_map(|chunk| chunk.web)
            .map(|web| GroundingChunk {
                uri: web.uri,
                title: web.title,
            })
            .collect();
        if !chunks.is_empty() {
            events.push(LiveEvent::Grounding(chunks));
        }
    }

    for part in parts.into_iter().flatten() {
        if let Some(blob) = part.inline_data {
            events.push(LiveEvent::Audio {
                data: blob.data,
                mime_type: blob.mime_type,
            });
        }
    }

    if content.interrupted == Some(true) {
        events.push(LiveEvent::Interrupted);
    }

    if let Some(t) = content.input_transcription {
        events.push(LiveEvent::Transcript {
            speaker: Speaker::User,
            text: t.text,
        });
    }
    if let Some(t) = content.output_transcription {
        events.push(LiveEvent::Transcript {
            speaker: Speaker::Assistant,
            text: t.text,
        });
    }

    if content.turn_complete == Some(true) {
        events.push(LiveEvent::TurnComplete);
    }

    if let Some(go_away) = message.go_away {
        events.push(LiveEvent::GoAway {
            time_left: go_away.time_left,
        });
    }

    if let Some(cancellation) = message.tool_call_cancellation {
        tracing::debug!("ignoring tool call cancellation for {:?}", cancellation.ids);
    }

    events
}

/// Send half of an open Gemini Live session.
pub struct GeminiChannel {
    writer: GeminiWriter,
}

fn function_response(result: &ToolResult) -> FunctionResponse {
    FunctionResponse {
        id: result.id.clone(),
        name: result.name.clone(),
        response: json!({ "result": result.result_text }),
    }
}

#[async_trait]
impl LiveChannel for GeminiChannel {
    async fn send_realtime_audio(&self, frame: AudioFrame) -> Result<()> {
        self.writer
            .send_realtime_audio(&frame.mime_type, frame.data)
            .await
    }

    async fn send_tool_response(&self, result: &ToolResult) -> Result<()> {
        self.writer
            .send_tool_response(vec![function_response(result)])
            .await
    }

    async fn close(&self) -> Result<()> {
        self.writer.close().await
    }
}
