//! Minimal websocket client for the Gemini Live bidirectional streaming API.

pub mod client;
pub mod types;

pub use client::{
    Config, ConfigBuilder, GeminiClient, GeminiReader, GeminiWriter, Incoming, connect,
    is_normal_close,
};
