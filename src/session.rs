//! Per-user conversational state.
//!
//! A [`Session`] is created at login and owned by the
//! [`ConversationEngine`](crate::engine::ConversationEngine) driving it.
//! The transcript is append-only: no method reorders, edits or removes a
//! turn; [`Session::clear`] drops the whole session at logout.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Config enums ─────────────────────────────────────────────────────────────

/// Target student age group the coaching is tuned for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgeGroup {
    #[default]
    Elementary,
    JuniorHigh,
    SeniorHigh,
}

impl AgeGroup {
    pub const ALL: [AgeGroup; 3] = [AgeGroup::Elementary, AgeGroup::JuniorHigh, AgeGroup::SeniorHigh];

    pub fn key(self) -> &'static str {
        match self {
            AgeGroup::Elementary => "elementary",
            AgeGroup::JuniorHigh => "junior_high",
            AgeGroup::SeniorHigh => "senior_high",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            AgeGroup::Elementary => "國小",
            AgeGroup::JuniorHigh => "國中",
            AgeGroup::SeniorHigh => "高中",
        }
    }
}

impl fmt::Display for AgeGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for AgeGroup {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        AgeGroup::ALL
            .into_iter()
            .find(|g| g.key().eq_ignore_ascii_case(s) || g.label() == s)
            .ok_or_else(|| format!("unknown age group '{s}' (expected elementary, junior_high or senior_high)"))
    }
}

/// Conversation language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Language {
    #[default]
    #[serde(rename = "zh-tw")]
    TraditionalChinese,
    #[serde(rename = "yue")]
    Cantonese,
    #[serde(rename = "en")]
    English,
}

impl Language {
    pub const ALL: [Language; 3] = [Language::TraditionalChinese, Language::Cantonese, Language::English];

    pub fn key(self) -> &'static str {
        match self {
            Language::TraditionalChinese => "zh-tw",
            Language::Cantonese => "yue",
            Language::English => "en",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Language::TraditionalChinese => "繁體中文",
            Language::Cantonese => "粵語",
            Language::English => "English",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        Language::ALL
            .into_iter()
            .find(|l| l.key().eq_ignore_ascii_case(s) || l.label().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown language '{s}' (expected zh-tw, yue or en)"))
    }
}

/// Configuration rendered into the session prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionConfig {
    pub age_group: AgeGroup,
    pub language: Language,
}

// ── Turns ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// One message in the transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into() }
    }
}

// ── Session ──────────────────────────────────────────────────────────────────

/// Metadata exported alongside the transcript.
#[derive(Debug, Clone)]
pub struct SessionMeta {
    pub identifier: String,
    pub config: SessionConfig,
    pub started_at: DateTime<Local>,
}

#[derive(Debug, Clone)]
pub struct Session {
    id: Uuid,
    identifier: String,
    started_at: DateTime<Local>,
    config: SessionConfig,
    transcript: Vec<Turn>,
    knowledge: Arc<str>,
}

impl Session {
    /// Start a session for `identifier`. Returns `None` when the identifier
    /// is empty after trimming.
    pub fn new(identifier: &str, config: SessionConfig, knowledge: Arc<str>) -> Option<Self> {
        Self::with_start_time(identifier, config, knowledge, Local::now())
    }

    pub fn with_start_time(
        identifier: &str,
        config: SessionConfig,
        knowledge: Arc<str>,
        started_at: DateTime<Local>,
    ) -> Option<Self> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return None;
        }
        Some(Self {
            id: Uuid::now_v7(),
            identifier: identifier.to_string(),
            started_at,
            config,
            transcript: Vec::new(),
            knowledge,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn started(&self) -> DateTime<Local> {
        self.started_at
    }

    pub fn config(&self) -> SessionConfig {
        self.config
    }

    pub(crate) fn set_config(&mut self, config: SessionConfig) {
        self.config = config;
    }

    pub fn knowledge(&self) -> &str {
        &self.knowledge
    }

    pub fn transcript(&self) -> &[Turn] {
        &self.transcript
    }

    pub fn last_turn(&self) -> Option<&Turn> {
        self.transcript.last()
    }

    pub(crate) fn append(&mut self, turn: Turn) {
        self.transcript.push(turn);
    }

    pub fn meta(&self) -> SessionMeta {
        SessionMeta {
            identifier: self.identifier.clone(),
            config: self.config,
            started_at: self.started_at,
        }
    }

    /// Drop identity, transcript and knowledge reference.
    pub(crate) fn clear(&mut self) {
        self.identifier.clear();
        self.transcript.clear();
        self.knowledge = Arc::from("");
    }

    pub fn is_cleared(&self) -> bool {
        self.identifier.is_empty()
    }
}
