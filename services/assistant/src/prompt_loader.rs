use anyhow::{Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

/// File in the prompts directory that replaces the built-in system instruction.
pub const SYSTEM_PROMPT_FILE: &str = "system.md";

/// Returns the `system.md` override, if the prompts directory has a non-blank one.
/// A missing directory or file is not an error.
pub fn system_instruction(dir_path: &Path) -> Result<Option<String>> {
    let path = dir_path.join(SYSTEM_PROMPT_FILE);
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e)
                .with_context(|| format!("Failed to read prompt file: {}", path.display()));
        }
    };

    let text = text.trim();
    Ok((!text.is_empty()).then(|| text.to_string()))
}
