use serde::{Deserialize, Serialize};

/// The assistant state shown by the avatar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AvatarMode {
    Intro,
    #[default]
    Idle,
    Connecting,
    Thinking,
    Talking,
}

/// Events that are allowed to move the avatar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvatarTrigger {
    UserStart { has_intro: bool },
    IntroEnded,
    Opened,
    ToolBatchStarted,
    ToolBatchFinished,
    AudioChunk,
    PlaybackDrained,
    Interrupted,
    Stop,
}

/// Derives the avatar mode from session events.
///
/// Unlisted (mode, trigger) pairs leave the mode untouched. While a stop is in
/// progress only [`AvatarTrigger::Stop`] is accepted.
#[derive(Debug, Default)]
pub struct AvatarMachine {
    mode: AvatarMode,
    stopping: bool,
}

impl AvatarMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> AvatarMode {
        self.mode
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    /// Blocks every trigger but `Stop` until [`AvatarMachine::end_stop`].
    pub fn begin_stop(&mut self) {
        self.stopping = true;
    }

    pub fn end_stop(&mut self) {
        self.stopping = false;
    }

    /// Applies a trigger and returns the new mode when it changed.
    pub fn apply(&mut self, trigger: AvatarTrigger) -> Option<AvatarMode> {
        use AvatarMode::*;
        use AvatarTrigger::*;

        if self.stopping && trigger != Stop {
            tracing::trace!("avatar trigger {:?} ignored while stopping", trigger);
            return None;
        }

        let next = match (self.mode, trigger) {
            (_, Stop) => Idle,
            (Idle, UserStart { has_intro: true }) => Intro,
            (Idle, UserStart { has_intro: false }) => Connecting,
            (Intro, IntroEnded) => Idle,
            (Connecting, Opened) => Idle,
            (_, ToolBatchStarted) => Thinking,
            (Thinking, ToolBatchFinished) => Idle,
            (Idle, AudioChunk) => Talking,
            (Talking, PlaybackDrained) => Idle,
            (Talking | Thinking, Interrupted) => Idle,
            (current, _) => current,
        };

        if next == self.mode {
            return None;
        }
        tracing::debug!("avatar mode {:?} -> {:?} on {:?}", self.mode, next, trigger);
        self.mode = next;
        Some(next)
    }
}
