//! Process-scope state: one coaching room per process.
//!
//! `CoachRoom` owns what outlives a single session (the cached knowledge
//! base, the credential, discovered models and the user's grade/language
//! preferences) plus at most one [`ConversationEngine`]. The console drives
//! it one action at a time.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Local;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::engine::{ConfigChange, ConversationEngine, EngineError, EngineState, ExportOutcome, SubmitOutcome};
use crate::export::{self, sheets, ExportError, ExportSink, TabularLog};
use crate::knowledge::{DocumentReader, KnowledgeBase, LoadReport, PdfReader};
use crate::llm::{self, providers, LlmProvider, ModelHandle, ProviderError};
use crate::session::{AgeGroup, Language, Role, Session, SessionConfig, Turn};

#[derive(Debug, Error)]
pub enum RoomError {
    #[error("nickname cannot be empty")]
    EmptyIdentifier,
    #[error("'{0}' is still logged in; log out first")]
    SessionActive(String),
    #[error("not logged in")]
    NotLoggedIn,
    #[error("unknown model '{0}'")]
    UnknownModel(String),
    #[error("knowledge load task failed: {0}")]
    LoadTask(String),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Export(#[from] ExportError),
}

/// Something the user should know that does not stop the room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advisory {
    NoDocuments { dir: String },
    DocumentFailed { path: String, reason: String },
    EmptyKnowledge,
    MissingApiKey,
    ProviderUnavailable(String),
    NoModels,
    ChatReady { model: String },
}

impl fmt::Display for Advisory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Advisory::NoDocuments { dir } => write!(f, "no knowledge documents found in {dir}"),
            Advisory::DocumentFailed { path, reason } => write!(f, "failed to read {path}: {reason}"),
            Advisory::EmptyKnowledge => f.write_str("knowledge base is empty; chat is disabled"),
            Advisory::MissingApiKey => f.write_str("no API key; set GEMINI_API_KEY or use /key"),
            Advisory::ProviderUnavailable(reason) => write!(f, "model provider unavailable: {reason}"),
            Advisory::NoModels => f.write_str("API key invalid or network unavailable; no model to select"),
            Advisory::ChatReady { model } => write!(f, "chat ready ({model})"),
        }
    }
}

/// Result of logging out.
#[derive(Debug, Clone, PartialEq)]
pub enum Logout {
    /// Nothing had been said; the session was closed without export.
    Empty,
    Exported(export::ExportReceipt),
}

pub struct CoachRoom {
    config: Config,
    knowledge: Arc<KnowledgeBase>,
    reader: Arc<dyn DocumentReader>,
    fixed_provider: Option<LlmProvider>,
    remote_log: Option<TabularLog>,
    interactive_key: Option<String>,
    provider: Option<LlmProvider>,
    models: Vec<String>,
    selected_model: Option<String>,
    preferences: SessionConfig,
    engine: Option<ConversationEngine>,
    /// Transcript length at the last successful `/download`.
    saved_turns: usize,
    logged_out: bool,
}

impl CoachRoom {
    pub fn new(config: Config) -> Self {
        let preferences = config.session.config;
        Self {
            config,
            knowledge: Arc::new(KnowledgeBase::new()),
            reader: Arc::new(PdfReader),
            fixed_provider: None,
            remote_log: None,
            interactive_key: None,
            provider: None,
            models: Vec::new(),
            selected_model: None,
            preferences,
            engine: None,
            saved_turns: 0,
            logged_out: false,
        }
    }

    /// Replace the PDF reader.
    pub fn with_reader(mut self, reader: Arc<dyn DocumentReader>) -> Self {
        self.reader = reader;
        self
    }

    /// Use `provider` instead of building one from config and credential.
    pub fn with_provider(mut self, provider: LlmProvider) -> Self {
        self.fixed_provider = Some(provider);
        self
    }

    /// Use `log` instead of connecting to Google Sheets when
    /// `[sheets].enabled`.
    pub fn with_remote_log(mut self, log: TabularLog) -> Self {
        self.remote_log = Some(log);
        self
    }

    // ── accessors ────────────────────────────────────────────────────────────

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn identifier(&self) -> Option<&str> {
        self.engine.as_ref().map(|e| e.session().identifier())
    }

    pub fn transcript(&self) -> &[Turn] {
        self.engine.as_ref().map(|e| e.session().transcript()).unwrap_or_default()
    }

    pub fn engine(&self) -> Option<&ConversationEngine> {
        self.engine.as_ref()
    }

    pub fn chat_enabled(&self) -> bool {
        self.engine.as_ref().is_some_and(|e| e.state() == EngineState::Active)
    }

    pub fn knowledge_report(&self) -> Option<&LoadReport> {
        self.knowledge.report()
    }

    pub fn models(&self) -> &[String] {
        &self.models
    }

    pub fn selected_model(&self) -> Option<&str> {
        self.selected_model.as_deref()
    }

    pub fn preferences(&self) -> SessionConfig {
        self.preferences
    }

    /// True once a session has ended; cleared by the next login.
    pub fn logged_out(&self) -> bool {
        self.logged_out
    }

    fn api_key(&self) -> Option<&str> {
        self.interactive_key.as_deref().or(self.config.llm_api_key.as_deref())
    }

    // ── login ────────────────────────────────────────────────────────────────

    /// Open a session for `identifier`: load the knowledge base (first login
    /// only), discover models if needed, and start chat when everything is
    /// in place. Missing pieces come back as advisories.
    pub async fn login(&mut self, identifier: &str) -> Result<Vec<Advisory>, RoomError> {
        if let Some(active) = self.engine.as_ref().filter(|e| e.state() != EngineState::Closed) {
            return Err(RoomError::SessionActive(active.session().identifier().to_string()));
        }
        if identifier.trim().is_empty() {
            return Err(RoomError::EmptyIdentifier);
        }

        let (knowledge, mut advisories) = self.load_knowledge().await?;
        let session = Session::new(identifier, self.preferences, knowledge).ok_or(RoomError::EmptyIdentifier)?;
        info!(session_id = %session.id(), identifier = %session.identifier(), "login");
        self.engine = Some(ConversationEngine::new(session, self.config.session.config_change));
        self.saved_turns = 0;
        self.logged_out = false;

        if self.provider.is_none() {
            advisories.extend(self.refresh_models().await);
        }
        advisories.extend(self.try_start());
        Ok(advisories)
    }

    async fn load_knowledge(&self) -> Result<(Arc<str>, Vec<Advisory>), RoomError> {
        let kb = Arc::clone(&self.knowledge);
        let (text, report) = if kb.is_loaded() {
            debug!("knowledge base already cached");
            let report = kb.report().cloned().unwrap_or_default();
            (kb.text().unwrap_or_else(|| Arc::from("")), report)
        } else {
            let reader = Arc::clone(&self.reader);
            let sources = self.config.knowledge.sources();
            tokio::task::spawn_blocking(move || {
                let (text, report) = kb.get_or_load(&sources, reader.as_ref());
                (text, report.clone())
            })
            .await
            .map_err(|e| RoomError::LoadTask(e.to_string()))?
        };

        let mut advisories = Vec::new();
        if report.no_sources() {
            advisories.push(Advisory::NoDocuments { dir: self.config.knowledge.dir.display().to_string() });
        }
        advisories.extend(
            report
                .failures
                .iter()
                .map(|(path, reason)| Advisory::DocumentFailed { path: path.clone(), reason: reason.clone() }),
        );
        Ok((text, advisories))
    }

    /// Start chat if the session is waiting and a model is available.
    fn try_start(&mut self) -> Vec<Advisory> {
        let handle = match (&self.provider, &self.selected_model) {
            (Some(p), Some(m)) => Some(ModelHandle::new(p.clone(), m.clone())),
            _ => None,
        };
        let Some(engine) = self.engine.as_mut().filter(|e| e.state() == EngineState::Uninitialized) else {
            return Vec::new();
        };
        if engine.session().knowledge().trim().is_empty() {
            return vec![Advisory::EmptyKnowledge];
        }
        let Some(handle) = handle else {
            // Provider advisories were already reported by refresh_models.
            return Vec::new();
        };
        let model = handle.model.clone();
        match engine.start(Some(handle), &self.config.prompts.dir, self.config.prompts.knowledge_char_budget) {
            Ok(()) => vec![Advisory::ChatReady { model }],
            Err(e) => {
                warn!(error = %e, "chat not started");
                vec![Advisory::ProviderUnavailable(e.to_string())]
            }
        }
    }

    // ── credential and model ─────────────────────────────────────────────────

    /// Store an interactively entered key; it wins over `GEMINI_API_KEY`.
    pub async fn set_api_key(&mut self, key: &str) -> Vec<Advisory> {
        let key = key.trim();
        self.interactive_key = (!key.is_empty()).then(|| key.to_string());
        let mut advisories = self.refresh_models().await;
        advisories.extend(self.try_start());
        advisories
    }

    /// Rebuild the provider and list its models. Keeps the current selection
    /// when it is still offered, otherwise prefers the configured model.
    pub async fn refresh_models(&mut self) -> Vec<Advisory> {
        let built = match &self.fixed_provider {
            Some(p) => Ok(p.clone()),
            None => providers::build(&self.config.llm, self.api_key()),
        };
        let provider = match built {
            Ok(p) => p,
            Err(e) => {
                self.provider = None;
                self.models.clear();
                self.selected_model = None;
                return vec![match e {
                    ProviderError::MissingCredential(_) => Advisory::MissingApiKey,
                    other => Advisory::ProviderUnavailable(other.to_string()),
                }];
            }
        };

        self.models = provider.discover_models().await;
        let preferred = self
            .selected_model
            .clone()
            .unwrap_or_else(|| self.config.llm.gemini.model.clone());
        self.selected_model = llm::select_model(&self.models, &preferred);
        self.provider = Some(provider);

        match &self.selected_model {
            Some(model) => {
                info!(%model, available = self.models.len(), "model selected");
                Vec::new()
            }
            None => vec![Advisory::NoModels],
        }
    }

    /// Pick a model from the discovered list. A running session keeps the
    /// model it started with.
    pub fn select_model(&mut self, name: &str) -> Result<Vec<Advisory>, RoomError> {
        let chosen = self
            .models
            .iter()
            .find(|m| llm::same_model(m, name))
            .cloned()
            .ok_or_else(|| RoomError::UnknownModel(name.trim().to_string()))?;
        info!(model = %chosen, "model chosen");
        self.selected_model = Some(chosen);
        Ok(self.try_start())
    }

    // ── preferences ──────────────────────────────────────────────────────────

    pub fn set_age_group(&mut self, age_group: AgeGroup) -> Result<Option<ConfigChange>, RoomError> {
        self.apply_preferences(SessionConfig { age_group, ..self.preferences })
    }

    pub fn set_language(&mut self, language: Language) -> Result<Option<ConfigChange>, RoomError> {
        self.apply_preferences(SessionConfig { language, ..self.preferences })
    }

    /// Preferences always update; the running session reacts per
    /// `[session].config_change`. `None` when nobody is logged in.
    fn apply_preferences(&mut self, config: SessionConfig) -> Result<Option<ConfigChange>, RoomError> {
        self.preferences = config;
        match self.engine.as_mut().filter(|e| e.state() != EngineState::Closed) {
            Some(engine) => Ok(Some(engine.reconfigure(config)?)),
            None => Ok(None),
        }
    }

    // ── chat ─────────────────────────────────────────────────────────────────

    pub async fn submit(&mut self, text: &str) -> Result<SubmitOutcome, RoomError> {
        let engine = self.engine.as_mut().ok_or(RoomError::NotLoggedIn)?;
        Ok(engine.submit_turn(text).await?)
    }

    pub async fn retry(&mut self) -> Result<SubmitOutcome, RoomError> {
        let engine = self.engine.as_mut().ok_or(RoomError::NotLoggedIn)?;
        Ok(engine.retry_pending().await?)
    }

    // ── export and logout ────────────────────────────────────────────────────

    /// Write the transcript CSV into `[export].dir` without ending the
    /// session. `None` when there is nothing to write.
    pub fn download_csv(&mut self) -> Result<Option<PathBuf>, RoomError> {
        let engine = self.engine.as_ref().ok_or(RoomError::NotLoggedIn)?;
        let session = engine.session();
        if session.transcript().is_empty() {
            return Ok(None);
        }
        let path = export::write_local(&self.config.export.dir, session.transcript(), &session.meta())?;
        self.saved_turns = session.transcript().len();
        Ok(Some(path))
    }

    /// True when the teacher has said something since login or the last
    /// download. The welcome alone does not count.
    pub fn has_unsaved_turns(&self) -> bool {
        self.transcript().iter().skip(self.saved_turns).any(|t| t.role == Role::User)
    }

    fn export_sink(&self) -> Result<ExportSink, ExportError> {
        if !self.config.sheets.enabled {
            return Ok(ExportSink::LocalFile { dir: self.config.export.dir.clone() });
        }
        let log = match &self.remote_log {
            Some(log) => log.clone(),
            None => sheets::connect(&self.config.sheets, self.config.sheets_access_token.as_deref())?,
        };
        Ok(ExportSink::Remote {
            log,
            spreadsheet: self.config.sheets.spreadsheet.clone(),
            worksheet: self.config.sheets.worksheet.clone(),
        })
    }

    /// Export the transcript, then end the session. On failure the session
    /// stays logged in with its transcript.
    pub async fn export_and_logout(&mut self) -> Result<Logout, RoomError> {
        let Some(engine) = self.engine.as_mut() else {
            return Err(RoomError::NotLoggedIn);
        };
        // An empty transcript never reaches the sink, so a missing remote
        // credential cannot block the logout.
        if engine.session().transcript().is_empty() {
            engine.force_close();
            self.end_session();
            return Ok(Logout::Empty);
        }
        let sink = self.export_sink()?;
        let engine = self.engine.as_mut().ok_or(RoomError::NotLoggedIn)?;
        let outcome = engine.export_and_close(&sink, Local::now()).await?;
        let logout = match outcome {
            ExportOutcome::NothingToExport => {
                engine.force_close();
                Logout::Empty
            }
            ExportOutcome::Exported(receipt) => Logout::Exported(receipt),
        };
        self.end_session();
        Ok(logout)
    }

    /// End the session without exporting.
    pub fn force_logout(&mut self) -> Result<(), RoomError> {
        let engine = self.engine.as_mut().ok_or(RoomError::NotLoggedIn)?;
        engine.force_close();
        self.end_session();
        Ok(())
    }

    fn end_session(&mut self) {
        self.engine = None;
        self.saved_turns = 0;
        self.logged_out = true;
        info!("logout");
    }
}
