//! Turn-taking state machine for one coaching session.
//!
//! ```text
//! Uninitialized ──start──▶ Active ──export ok──▶ Closed
//!                            │  ▲
//!                     export │  │ export failed
//!                            ▼  │
//!                          Exporting
//!
//! any ──force_close──▶ Closed
//! ```
//!
//! The engine owns the [`Session`] and the remote [`ChatContext`]. Every
//! operation runs to completion before the next one starts; there is no
//! interior locking.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::ConfigChangePolicy;
use crate::export::{ExportError, ExportReceipt, ExportSink};
use crate::llm::{ChatContext, LlmProvider, ModelHandle, ProviderError};
use crate::prompt;
use crate::session::{Session, SessionConfig, Turn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Active,
    Exporting,
    Closed,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EngineState::Uninitialized => "uninitialized",
            EngineState::Active => "active",
            EngineState::Exporting => "exporting",
            EngineState::Closed => "closed",
        })
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("chat unavailable: {0}")]
    Unavailable(String),
    #[error("session already started")]
    AlreadyStarted,
    #[error("session is not active ({0})")]
    NotActive(EngineState),
    #[error("no unanswered message to retry")]
    NothingPending,
    #[error("{0}")]
    Model(#[from] ProviderError),
    #[error("export failed: {0}")]
    Export(#[from] ExportError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Blank input; nothing happened.
    Ignored,
    Replied(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExportOutcome {
    NothingToExport,
    Exported(ExportReceipt),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigChange {
    /// Session not started yet; the new config will be rendered at start.
    Applied,
    /// Running prompt unchanged; the new config takes effect next session.
    NextSession,
    /// A new remote context was seeded with a re-rendered prompt.
    Reseeded,
}

/// Rendering inputs captured at start, reused when reseeding.
#[derive(Debug, Clone)]
struct PromptSource {
    dir: PathBuf,
    char_budget: usize,
}

#[derive(Debug)]
pub struct ConversationEngine {
    state: EngineState,
    session: Session,
    provider: Option<LlmProvider>,
    context: Option<ChatContext>,
    pending: Option<String>,
    rendered_prompt: Option<String>,
    prompt_source: Option<PromptSource>,
    policy: ConfigChangePolicy,
}

impl ConversationEngine {
    pub fn new(session: Session, policy: ConfigChangePolicy) -> Self {
        Self {
            state: EngineState::Uninitialized,
            session,
            provider: None,
            context: None,
            pending: None,
            rendered_prompt: None,
            prompt_source: None,
            policy,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn rendered_prompt(&self) -> Option<&str> {
        self.rendered_prompt.as_deref()
    }

    /// User text that has not been answered yet.
    pub fn pending(&self) -> Option<&str> {
        self.pending.as_deref()
    }

    pub fn model(&self) -> Option<&str> {
        self.context.as_ref().map(ChatContext::model)
    }

    /// Render the prompt and welcome, open the remote context, show the
    /// welcome. Requires a non-empty knowledge base and a model.
    pub fn start(&mut self, handle: Option<ModelHandle>, prompts_dir: &Path, char_budget: usize) -> Result<(), EngineError> {
        if self.state != EngineState::Uninitialized {
            return Err(EngineError::AlreadyStarted);
        }
        if self.session.knowledge().trim().is_empty() {
            return Err(EngineError::Unavailable("knowledge base is empty".into()));
        }
        let (provider, model) = match handle {
            Some(h) if !h.model.trim().is_empty() => (h.provider, h.model),
            _ => return Err(EngineError::Unavailable("no model selected".into())),
        };

        let source = PromptSource { dir: prompts_dir.to_path_buf(), char_budget };
        let config = self.session.config();
        let rendered = self.render(&source, config);
        let welcome = prompt::welcome(self.session.identifier(), config);

        self.context =
            Some(provider.start_context(&model, vec![Turn::user(rendered.clone()), Turn::assistant(welcome.clone())]));
        self.provider = Some(provider);
        self.session.append(Turn::assistant(welcome));
        self.rendered_prompt = Some(rendered);
        self.prompt_source = Some(source);
        self.state = EngineState::Active;

        info!(
            session_id = %self.session.id(),
            identifier = %self.session.identifier(),
            %model,
            age_group = config.age_group.key(),
            language = config.language.key(),
            "session started"
        );
        Ok(())
    }

    /// Append `text` as a user turn and ask the model for a reply.
    ///
    /// On failure the user turn stays in the transcript without a reply and
    /// can be resent with [`retry_pending`](Self::retry_pending).
    pub async fn submit_turn(&mut self, text: &str) -> Result<SubmitOutcome, EngineError> {
        if text.trim().is_empty() {
            return Ok(SubmitOutcome::Ignored);
        }
        self.require_active()?;

        if let Some(dropped) = self.pending.take() {
            debug!(session_id = %self.session.id(), chars = dropped.chars().count(), "unanswered turn superseded");
        }
        self.session.append(Turn::user(text));
        self.exchange(text.to_string()).await
    }

    /// Resend the last unanswered user text. No new user turn is appended.
    pub async fn retry_pending(&mut self) -> Result<SubmitOutcome, EngineError> {
        self.require_active()?;
        let text = self.pending.take().ok_or(EngineError::NothingPending)?;
        debug!(session_id = %self.session.id(), "retrying unanswered turn");
        self.exchange(text).await
    }

    async fn exchange(&mut self, text: String) -> Result<SubmitOutcome, EngineError> {
        let (Some(provider), Some(ctx)) = (self.provider.as_ref(), self.context.as_mut()) else {
            return Err(EngineError::NotActive(self.state));
        };
        let result = provider.send(ctx, &text).await;
        match result {
            Ok(reply) => {
                self.session.append(Turn::assistant(reply.clone()));
                debug!(session_id = %self.session.id(), turns = self.session.transcript().len(), "reply received");
                Ok(SubmitOutcome::Replied(reply))
            }
            Err(e) => {
                warn!(session_id = %self.session.id(), error = %e, "model request failed");
                self.pending = Some(text);
                Err(EngineError::Model(e))
            }
        }
    }

    /// Hand the transcript to `sink`; on success close the session and clear
    /// it. On failure the session stays active and intact.
    pub async fn export_and_close(
        &mut self,
        sink: &ExportSink,
        now: DateTime<Local>,
    ) -> Result<ExportOutcome, EngineError> {
        if self.session.transcript().is_empty() {
            return Ok(ExportOutcome::NothingToExport);
        }
        self.require_active()?;

        self.state = EngineState::Exporting;
        let meta = self.session.meta();
        let result = sink.export(self.session.transcript(), &meta, now).await;
        match result {
            Ok(receipt) => {
                info!(session_id = %self.session.id(), identifier = %meta.identifier, "session exported");
                self.close();
                Ok(ExportOutcome::Exported(receipt))
            }
            Err(e) => {
                warn!(session_id = %self.session.id(), error = %e, "export failed; session kept");
                self.state = EngineState::Active;
                Err(EngineError::Export(e))
            }
        }
    }

    /// Close without exporting.
    pub fn force_close(&mut self) {
        info!(session_id = %self.session.id(), state = %self.state, "session force-closed");
        self.close();
    }

    fn close(&mut self) {
        self.session.clear();
        self.provider = None;
        self.context = None;
        self.pending = None;
        self.rendered_prompt = None;
        self.state = EngineState::Closed;
    }

    /// Change age group or language.
    pub fn reconfigure(&mut self, config: SessionConfig) -> Result<ConfigChange, EngineError> {
        match self.state {
            EngineState::Uninitialized => {
                self.session.set_config(config);
                Ok(ConfigChange::Applied)
            }
            EngineState::Active if config == self.session.config() => Ok(ConfigChange::Applied),
            EngineState::Active => match self.policy {
                ConfigChangePolicy::NextSession => Ok(ConfigChange::NextSession),
                ConfigChangePolicy::Reseed => {
                    self.reseed(config)?;
                    Ok(ConfigChange::Reseeded)
                }
            },
            state => Err(EngineError::NotActive(state)),
        }
    }

    /// New remote context: re-rendered prompt and welcome, then every turn
    /// the model has already seen after the old welcome. The visible
    /// transcript keeps the original welcome.
    fn reseed(&mut self, config: SessionConfig) -> Result<(), EngineError> {
        let (Some(provider), Some(ctx), Some(source)) =
            (self.provider.as_ref(), self.context.as_ref(), self.prompt_source.as_ref())
        else {
            return Err(EngineError::NotActive(self.state));
        };
        let rendered = self.render(source, config);
        let welcome = prompt::welcome(self.session.identifier(), config);
        let mut seed = vec![Turn::user(rendered.clone()), Turn::assistant(welcome)];
        seed.extend(ctx.history().iter().skip(2).cloned());

        let context = provider.start_context(ctx.model(), seed);
        self.context = Some(context);
        self.rendered_prompt = Some(rendered);
        self.session.set_config(config);
        info!(
            session_id = %self.session.id(),
            age_group = config.age_group.key(),
            language = config.language.key(),
            "session reseeded with new config"
        );
        Ok(())
    }

    fn render(&self, source: &PromptSource, config: SessionConfig) -> String {
        prompt::coach_prompt(
            &source.dir,
            source.char_budget,
            self.session.identifier(),
            config,
            self.session.knowledge(),
        )
    }

    fn require_active(&self) -> Result<(), EngineError> {
        match self.state {
            EngineState::Active => Ok(()),
            state => Err(EngineError::NotActive(state)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::*;
    use crate::export::{MemoryLog, TabularLog};
    use crate::llm::providers::scripted::ScriptedProvider;
    use crate::session::{AgeGroup, Language, Role};

    struct Fixture {
        engine: ConversationEngine,
        scripted: ScriptedProvider,
        _prompts: TempDir,
    }

    fn fixture(outcomes: Vec<Result<String, String>>, policy: ConfigChangePolicy) -> Fixture {
        let prompts = TempDir::new().unwrap();
        let scripted = ScriptedProvider::new(outcomes);
        let session = Session::new("001", SessionConfig::default(), Arc::from("Connect before Correct.")).unwrap();
        let mut engine = ConversationEngine::new(session, policy);
        engine.start(Some(handle(&scripted, "models/test")), prompts.path(), 1000).unwrap();
        Fixture { engine, scripted, _prompts: prompts }
    }

    fn handle(scripted: &ScriptedProvider, model: &str) -> ModelHandle {
        ModelHandle::new(LlmProvider::Scripted(scripted.clone()), model)
    }

    fn idle_engine(knowledge: &str) -> ConversationEngine {
        let session = Session::new("001", SessionConfig::default(), Arc::from(knowledge)).unwrap();
        ConversationEngine::new(session, ConfigChangePolicy::NextSession)
    }

    fn ok(replies: &[&str]) -> Vec<Result<String, String>> {
        replies.iter().map(|r| Ok(r.to_string())).collect()
    }

    fn remote_sink() -> (MemoryLog, ExportSink) {
        let mem = MemoryLog::new().with_spreadsheet("log");
        let sink = ExportSink::Remote {
            log: TabularLog::Memory(mem.clone()),
            spreadsheet: "log".into(),
            worksheet: "sessions".into(),
        };
        (mem, sink)
    }

    #[test]
    fn start_shows_welcome_and_seeds_context() {
        let f = fixture(vec![], ConfigChangePolicy::NextSession);
        assert_eq!(f.engine.state(), EngineState::Active);
        let transcript = f.engine.session().transcript();
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].role, Role::Assistant);
        assert!(transcript[0].content.contains("001"));
        assert!(f.engine.rendered_prompt().unwrap().contains("Connect before Correct."));
        assert_eq!(f.engine.model(), Some("models/test"));
    }

    #[test]
    fn start_requires_knowledge() {
        let dir = TempDir::new().unwrap();
        let mut engine = idle_engine("  ");
        let scripted = ScriptedProvider::default();
        assert!(matches!(engine.start(Some(handle(&scripted, "m")), dir.path(), 10), Err(EngineError::Unavailable(_))));
        assert_eq!(engine.state(), EngineState::Uninitialized);
        assert!(engine.session().transcript().is_empty());
    }

    #[test]
    fn start_requires_model() {
        let dir = TempDir::new().unwrap();
        let mut engine = idle_engine("kb");
        let scripted = ScriptedProvider::default();
        assert!(matches!(engine.start(None, dir.path(), 10), Err(EngineError::Unavailable(_))));
        assert!(matches!(engine.start(Some(handle(&scripted, " ")), dir.path(), 10), Err(EngineError::Unavailable(_))));
        engine.start(Some(handle(&scripted, "m")), dir.path(), 10).unwrap();
        assert!(matches!(engine.start(Some(handle(&scripted, "m")), dir.path(), 10), Err(EngineError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn first_request_carries_prompt_and_welcome() {
        let mut f = fixture(ok(&["r1"]), ConfigChangePolicy::NextSession);
        f.engine.submit_turn("q1").await.unwrap();
        let requests = f.scripted.requests();
        let req = &requests[0];
        assert_eq!(req.len(), 3);
        assert_eq!(req[0], Turn::user(f.engine.rendered_prompt().unwrap()));
        assert_eq!(req[1], f.engine.session().transcript()[0]);
        assert_eq!(req[2], Turn::user("q1"));
    }

    #[tokio::test]
    async fn successful_submits_grow_transcript_by_two() {
        let mut f = fixture(ok(&["a", "b", "c"]), ConfigChangePolicy::NextSession);
        for (i, q) in ["x", "y", "z"].into_iter().enumerate() {
            let out = f.engine.submit_turn(q).await.unwrap();
            assert!(matches!(out, SubmitOutcome::Replied(_)));
            assert_eq!(f.engine.session().transcript().len(), 1 + 2 * (i + 1));
        }
        let contents: Vec<&str> = f.engine.session().transcript().iter().map(|t| t.content.as_str()).collect();
        assert_eq!(&contents[1..], &["x", "a", "y", "b", "z", "c"]);
    }

    #[tokio::test]
    async fn blank_submit_is_ignored() {
        let mut f = fixture(vec![], ConfigChangePolicy::NextSession);
        for blank in ["", "   ", "\n\t"] {
            assert_eq!(f.engine.submit_turn(blank).await.unwrap(), SubmitOutcome::Ignored);
        }
        assert_eq!(f.engine.session().transcript().len(), 1);
        assert!(f.scripted.requests().is_empty());
    }

    #[tokio::test]
    async fn failed_submit_keeps_user_turn_and_retry_answers_once() {
        let mut f = fixture(vec![Err("429 Resource has been exhausted".into())], ConfigChangePolicy::NextSession);
        let err = f.engine.submit_turn("help").await.unwrap_err();
        assert_eq!(err.to_string(), "429 Resource has been exhausted");
        assert_eq!(f.engine.state(), EngineState::Active);
        assert_eq!(f.engine.session().transcript().len(), 2);
        assert_eq!(f.engine.session().last_turn().unwrap(), &Turn::user("help"));
        assert_eq!(f.engine.pending(), Some("help"));

        f.scripted.push(Ok("answer".into()));
        f.engine.retry_pending().await.unwrap();
        let transcript = f.engine.session().transcript();
        assert_eq!(transcript.len(), 3);
        assert_eq!(transcript[1], Turn::user("help"));
        assert_eq!(transcript[2], Turn::assistant("answer"));
        assert_eq!(f.engine.pending(), None);

        // The retried request did not repeat the failed attempt.
        let last = f.scripted.requests().pop().unwrap();
        assert_eq!(last.iter().filter(|t| t.content == "help").count(), 1);
    }

    #[tokio::test]
    async fn new_submit_supersedes_pending() {
        let mut f = fixture(vec![Err("timeout".into()), Ok("ok".into())], ConfigChangePolicy::NextSession);
        f.engine.submit_turn("first").await.unwrap_err();
        f.engine.submit_turn("second").await.unwrap();
        assert!(matches!(f.engine.retry_pending().await, Err(EngineError::NothingPending)));
        assert_eq!(f.engine.session().transcript().len(), 4);
    }

    #[tokio::test]
    async fn export_of_empty_transcript_makes_no_call() {
        let dir = TempDir::new().unwrap();
        let mut engine = idle_engine("");
        let _ = engine.start(Some(handle(&ScriptedProvider::default(), "m")), dir.path(), 10);
        let (mem, sink) = remote_sink();
        let out = engine.export_and_close(&sink, Local::now()).await.unwrap();
        assert_eq!(out, ExportOutcome::NothingToExport);
        assert_eq!(mem.calls(), 0);
        assert_eq!(engine.state(), EngineState::Uninitialized);
    }

    #[tokio::test]
    async fn export_success_closes_and_clears() {
        let mut f = fixture(ok(&["r"]), ConfigChangePolicy::NextSession);
        f.engine.submit_turn("q").await.unwrap();
        let (mem, sink) = remote_sink();
        let out = f.engine.export_and_close(&sink, Local::now()).await.unwrap();
        assert!(matches!(out, ExportOutcome::Exported(ExportReceipt::Row(ref row)) if row.usage_count == 1));
        assert_eq!(f.engine.state(), EngineState::Closed);
        assert!(f.engine.session().is_cleared());
        assert_eq!(mem.rows("log", "sessions").len(), 2);
        assert!(matches!(f.engine.submit_turn("more").await, Err(EngineError::NotActive(EngineState::Closed))));
    }

    #[tokio::test]
    async fn export_failure_keeps_session_active() {
        let mut f = fixture(ok(&["r"]), ConfigChangePolicy::NextSession);
        f.engine.submit_turn("q").await.unwrap();
        let (mem, sink) = remote_sink();
        mem.set_failure(Some("network down"));

        let err = f.engine.export_and_close(&sink, Local::now()).await.unwrap_err();
        assert!(err.to_string().contains("network down"));
        assert_eq!(f.engine.state(), EngineState::Active);
        assert_eq!(f.engine.session().transcript().len(), 3);

        mem.set_failure(None);
        f.engine.export_and_close(&sink, Local::now()).await.unwrap();
        assert_eq!(f.engine.state(), EngineState::Closed);
    }

    #[tokio::test]
    async fn force_close_skips_export() {
        let mut f = fixture(ok(&["r"]), ConfigChangePolicy::NextSession);
        f.engine.submit_turn("q").await.unwrap();
        f.engine.force_close();
        assert_eq!(f.engine.state(), EngineState::Closed);
        assert!(f.engine.session().transcript().is_empty());
        assert!(matches!(f.engine.retry_pending().await, Err(EngineError::NotActive(_))));
    }

    #[tokio::test]
    async fn reconfigure_defaults_to_next_session() {
        let mut f = fixture(ok(&["r"]), ConfigChangePolicy::NextSession);
        let before = f.engine.rendered_prompt().unwrap().to_string();
        let change = f
            .engine
            .reconfigure(SessionConfig { age_group: AgeGroup::SeniorHigh, language: Language::English })
            .unwrap();
        assert_eq!(change, ConfigChange::NextSession);
        assert_eq!(f.engine.rendered_prompt().unwrap(), before);
        assert_eq!(f.engine.session().config(), SessionConfig::default());
    }

    #[tokio::test]
    async fn reconfigure_reseed_replays_seen_turns() {
        let mut f = fixture(ok(&["r1", "r2"]), ConfigChangePolicy::Reseed);
        f.engine.submit_turn("q1").await.unwrap();
        let config = SessionConfig { age_group: AgeGroup::SeniorHigh, language: Language::English };
        assert_eq!(f.engine.reconfigure(config).unwrap(), ConfigChange::Reseeded);
        assert!(f.engine.rendered_prompt().unwrap().contains("Reply only in English"));
        assert_eq!(f.engine.session().transcript().len(), 3);

        f.engine.submit_turn("q2").await.unwrap();
        let req = f.scripted.requests().pop().unwrap();
        assert!(req[0].content.contains("高中"));
        assert!(req[1].content.starts_with("Hello 001"));
        assert!(f.engine.session().transcript()[0].content.starts_with("你好"));
        let tail: Vec<&str> = req[2..].iter().map(|t| t.content.as_str()).collect();
        assert_eq!(tail, vec!["q1", "r1", "q2"]);
    }

    #[test]
    fn reconfigure_before_start_applies() {
        let mut engine = idle_engine("kb");
        let config = SessionConfig { age_group: AgeGroup::JuniorHigh, language: Language::Cantonese };
        assert_eq!(engine.reconfigure(config).unwrap(), ConfigChange::Applied);
        assert_eq!(engine.session().config(), config);
    }

    #[tokio::test]
    async fn two_turn_scenario_shape() {
        let mut f = fixture(ok(&["r1", "r2"]), ConfigChangePolicy::NextSession);
        f.engine.submit_turn("q1").await.unwrap();
        f.engine.submit_turn("q2").await.unwrap();
        let shape: Vec<(Role, &str)> = f.engine.session().transcript()[1..]
            .iter()
            .map(|t| (t.role, t.content.as_str()))
            .collect();
        assert_eq!(
            shape,
            vec![(Role::User, "q1"), (Role::Assistant, "r1"), (Role::User, "q2"), (Role::Assistant, "r2")]
        );
        assert_eq!(f.engine.session().transcript()[0].role, Role::Assistant);
    }
}
