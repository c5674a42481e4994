pub mod audio_backend;
pub mod config;
pub mod gemini_adapter;
pub mod prompt_loader;
