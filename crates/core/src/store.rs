use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::{Product, SYSTEM_PROMPT, sample_catalog};
use crate::error::ErrorCategory;
use crate::generic_types::{GroundingChunk, Speaker};

/// Oldest entries are dropped past this many log lines.
pub const MAX_LOG_ENTRIES: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Info,
    Error,
    User,
    Ai,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: LogKind,
    pub category: Option<ErrorCategory>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeadPriority {
    #[default]
    Normal,
    Urgent,
}

/// Fields captured by the lead tool; the store fills in the rest.
#[derive(Debug, Clone, PartialEq)]
pub struct NewLead {
    pub customer_name: String,
    pub customer_phone: Option<String>,
    pub interested_products: String,
    pub summary: String,
    pub priority: LeadPriority,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SalesLead {
    pub id: String,
    pub customer_name: String,
    pub customer_phone: Option<String>,
    pub interested_products: String,
    pub summary: String,
    pub timestamp: DateTime<Utc>,
    pub priority: LeadPriority,
    pub processed: bool,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodoTask {
    pub id: String,
    pub text: String,
    pub completed: bool,
    pub priority: TaskPriority,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub id: String,
    pub url: String,
    pub prompt: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyCount {
    pub date: NaiveDate,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    pub requests_today: u32,
    pub total_sessions: u32,
    pub last_reset: NaiveDate,
    pub history: Vec<DailyCount>,
}

impl UsageStats {
    fn new(today: NaiveDate) -> Self {
        Self {
            requests_today: 0,
            total_sessions: 0,
            last_reset: today,
            history: Vec::new(),
        }
    }

    /// Rolls the daily counter into history when the day changed.
    fn roll_to(&mut self, today: NaiveDate) {
        if self.last_reset != today {
            self.history.push(DailyCount {
                date: self.last_reset,
                count: self.requests_today,
            });
            self.requests_today = 0;
            self.last_reset = today;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VoiceName {
    #[default]
    Fenrir,
    Charon,
    Puck,
    Kore,
    Zephyr,
}

impl VoiceName {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoiceName::Fenrir => "Fenrir",
            VoiceName::Charon => "Charon",
            VoiceName::Puck => "Puck",
            VoiceName::Kore => "Kore",
            VoiceName::Zephyr => "Zephyr",
        }
    }
}

impl FromStr for VoiceName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fenrir" => Ok(VoiceName::Fenrir),
            "charon" => Ok(VoiceName::Charon),
            "puck" => Ok(VoiceName::Puck),
            "kore" => Ok(VoiceName::Kore),
            "zephyr" => Ok(VoiceName::Zephyr),
            other => Err(format!("unknown voice name: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub selected_voice: VoiceName,
    pub is_maintenance_mode: bool,
    pub maintenance_message: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            selected_voice: VoiceName::Fenrir,
            is_maintenance_mode: false,
            maintenance_message: "Service momentanément indisponible.".to_string(),
        }
    }
}

/// Application state the session reads and mutates. Implementations own the lifecycle
/// of every collection; the session only appends and toggles.
pub trait AssistantStore: Send + Sync {
    fn catalog(&self) -> Vec<Product>;

    fn add_lead(&self, lead: NewLead) -> SalesLead;
    /// Raises the "new report" notification for the operator.
    fn trigger_report_toast(&self);

    fn todos(&self) -> Vec<TodoTask>;
    fn add_todo(&self, text: &str, priority: TaskPriority) -> TodoTask;
    /// Flips completion; false when the id is unknown.
    fn toggle_todo(&self, id: &str) -> bool;
    fn delete_todo(&self, id: &str) -> bool;

    fn add_generated_image(&self, url: String, prompt: &str) -> GeneratedImage;

    fn add_log(&self, kind: LogKind, category: Option<ErrorCategory>, message: &str);

    fn set_transcription(&self, speaker: Speaker, text: &str);
    fn set_grounding_chunks(&self, chunks: Vec<GroundingChunk>);

    fn config(&self) -> AppConfig;
    fn system_instruction(&self) -> String;

    fn increment_requests(&self);
    fn increment_sessions(&self);

    fn log_info(&self, message: &str) {
        self.add_log(LogKind::Info, None, message);
    }

    fn log_error(&self, category: ErrorCategory, message: &str) {
        self.add_log(LogKind::Error, Some(category), message);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreState {
    catalog: Vec<Product>,
    leads: Vec<SalesLead>,
    todos: Vec<TodoTask>,
    images: Vec<GeneratedImage>,
    logs: Vec<LogEntry>,
    config: AppConfig,
    usage: UsageStats,
    system_instruction: String,

    #[serde(skip)]
    user_transcription: Option<String>,
    #[serde(skip)]
    assistant_transcription: Option<String>,
    #[serde(skip)]
    grounding_chunks: Vec<GroundingChunk>,
    #[serde(skip)]
    report_toasts: u32,
}

impl Default for StoreState {
    fn default() -> Self {
        Self {
            catalog: sample_catalog(),
            leads: Vec::new(),
            todos: Vec::new(),
            images: Vec::new(),
            logs: Vec::new(),
            config: AppConfig::default(),
            usage: UsageStats::new(Local::now().date_naive()),
            system_instruction: SYSTEM_PROMPT.to_string(),
            user_transcription: None,
            assistant_transcription: None,
            grounding_chunks: Vec::new(),
            report_toasts: 0,
        }
    }
}

/// Process-local store, optionally persisted as JSON.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: AppConfig) -> Self {
        let store = Self::new();
        store.state().config = config;
        store
    }

    /// Loads a saved snapshot, or starts fresh when the file does not exist yet.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("No state file at {}, starting with defaults.", path.display());
            return Ok(Self::new());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read state file: {}", path.display()))?;
        let state: StoreState = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse state file: {}", path.display()))?;
        Ok(Self {
            state: Mutex::new(state),
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&*self.state())
            .context("Failed to serialize store state")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write state file: {}", path.display()))
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn leads(&self) -> Vec<SalesLead> {
        self.state().leads.clone()
    }

    pub fn images(&self) -> Vec<GeneratedImage> {
        self.state().images.clone()
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.state().logs.clone()
    }

    pub fn usage(&self) -> UsageStats {
        self.state().usage.clone()
    }

    pub fn transcription(&self, speaker: Speaker) -> Option<String> {
        let state = self.state();
        match speaker {
            Speaker::User => state.user_transcription.clone(),
            Speaker::Assistant => state.assistant_transcription.clone(),
        }
    }

    pub fn grounding_chunks(&self) -> Vec<GroundingChunk> {
        self.state().grounding_chunks.clone()
    }

    pub fn report_toasts(&self) -> u32 {
        self.state().report_toasts
    }

    pub fn set_maintenance_mode(&self, enabled: bool) {
        self.state().config.is_maintenance_mode = enabled;
    }

    pub fn set_selected_voice(&self, voice: VoiceName) {
        self.state().config.selected_voice = voice;
    }

    pub fn set_system_instruction(&self, instruction: &str) {
        self.state().system_instruction = instruction.to_string();
    }

    fn increment_requests_on(&self, today: NaiveDate) {
        let mut state = self.state();
        state.usage.roll_to(today);
        state.usage.requests_today += 1;
    }
}

impl AssistantStore for InMemoryStore {
    fn catalog(&self) -> Vec<Product> {
        self.state().catalog.clone()
    }

    fn add_lead(&self, lead: NewLead) -> SalesLead {
        let lead = SalesLead {
            id: uuid::Uuid::new_v4().to_string(),
            customer_name: lead.customer_name,
            customer_phone: lead.customer_phone,
            interested_products: lead.interested_products,
            summary: lead.summary,
            timestamp: Utc::now(),
            priority: lead.priority,
            processed: false,
            notes: None,
        };
        self.state().leads.insert(0, lead.clone());
        lead
    }

    fn trigger_report_toast(&self) {
        self.state().report_toasts += 1;
    }

    fn todos(&self) -> Vec<TodoTask> {
        self.state().todos.clone()
    }

    fn add_todo(&self, text: &str, priority: TaskPriority) -> TodoTask {
        let task = TodoTask {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.to_string(),
            completed: false,
            priority,
            timestamp: Utc::now(),
        };
        self.state().todos.push(task.clone());
        task
    }

    fn toggle_todo(&self, id: &str) -> bool {
        let mut state = self.state();
        match state.todos.iter_mut().find(|t| t.id == id) {
            Some(task) => {
                task.completed = !task.completed;
                true
            }
            None => false,
        }
    }

    fn delete_todo(&self, id: &str) -> bool {
        let mut state = self.state();
        let before = state.todos.len();
        state.todos.retain(|t| t.id != id);
        state.todos.len() != before
    }

    fn add_generated_image(&self, url: String, prompt: &str) -> GeneratedImage {
        let image = GeneratedImage {
            id: uuid::Uuid::new_v4().to_string(),
            url,
            prompt: prompt.to_string(),
            timestamp: Utc::now(),
        };
        self.state().images.insert(0, image.clone());
        image
    }

    fn add_log(&self, kind: LogKind, category: Option<ErrorCategory>, message: &str) {
        let mut state = self.state();
        state.logs.push(LogEntry {
            timestamp: Utc::now(),
            kind,
            category,
            message: message.to_string(),
        });
        if state.logs.len() > MAX_LOG_ENTRIES {
            let excess = state.logs.len() - MAX_LOG_ENTRIES;
            state.logs.drain(..excess);
        }
    }

    fn set_transcription(&self, speaker: Speaker, text: &str) {
        let mut state = self.state();
        match speaker {
            Speaker::User => state.user_transcription = Some(text.to_string()),
            Speaker::Assistant => state.assistant_transcription = Some(text.to_string()),
        }
    }

    fn set_grounding_chunks(&self, chunks: Vec<GroundingChunk>) {
        self.state().grounding_chunks = chunks;
    }

    fn config(&self) -> AppConfig {
        self.state().config.clone()
    }

    fn system_instruction(&self) -> String {
        self.state().system_instruction.clone()
    }

    fn increment_requests(&self) {
        self.increment_requests_on(Local::now().date_naive());
    }

    fn increment_sessions(&self) {
        self.state().usage.total_sessions += 1;
    }
}
