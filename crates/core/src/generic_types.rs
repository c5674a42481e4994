use serde::{Deserialize, Serialize};

/// Provider-neutral session setup, sent once per open.
#[derive(Debug, Clone, Default)]
pub struct LiveSetup {
    pub voice_name: String,
    pub system_instruction: String,
    pub tools: Vec<ToolDeclaration>,
}

/// Schema of one function the remote model may call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// A function invocation requested by the remote service.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: serde_json::Value,
}

/// The single answer owed for a [`ToolCall`].
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub id: String,
    pub name: String,
    pub result_text: String,
}

impl ToolResult {
    pub fn for_call(call: &ToolCall, result_text: impl Into<String>) -> Self {
        Self {
            id: call.id.clone(),
            name: call.name.clone(),
            result_text: result_text.into(),
        }
    }
}

/// One encoded microphone frame ready for the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GroundingChunk {
    pub uri: Option<String>,
    pub title: Option<String>,
}

/// Everything the remote service can tell us, in provider-neutral form.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    /// The message carried a model turn (used for request accounting).
    ModelTurn,
    Audio { data: String, mime_type: String },
    ToolCall(Vec<ToolCall>),
    Interrupted,
    Transcript { speaker: Speaker, text: String },
    Grounding(Vec<GroundingChunk>),
    TurnComplete,
    GoAway { time_left: Option<String> },
    Error(String),
    Closed,
}
