//! LLM provider abstraction.
//!
//! `LlmProvider` is an enum over concrete provider implementations.
//! Add a new variant + module in `providers/` for each additional backend.
//!
//! Providers are stateless request adapters; conversation state lives in a
//! [`ChatContext`] owned by the caller. [`LlmProvider::send`] replays the
//! context plus the new utterance and only advances the context when the
//! provider answers, so a failed call leaves it exactly as it was.

pub mod providers;

use thiserror::Error;
use tracing::{debug, warn};

use crate::session::Turn;

// ── Error ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
    #[error("no API key configured for provider '{0}'")]
    MissingCredential(String),
    #[error("{0}")]
    Request(String),
}

// ── Context ───────────────────────────────────────────────────────────────────

/// Handle to one remote conversation: the model plus the turns replayed on
/// every request.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatContext {
    model: String,
    history: Vec<Turn>,
}

impl ChatContext {
    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn history(&self) -> &[Turn] {
        &self.history
    }
}

/// A provider plus the model chosen on it; everything needed to open a
/// conversation.
#[derive(Debug, Clone)]
pub struct ModelHandle {
    pub provider: LlmProvider,
    pub model: String,
}

impl ModelHandle {
    pub fn new(provider: LlmProvider, model: impl Into<String>) -> Self {
        Self { provider, model: model.into() }
    }
}

// ── Provider enum ─────────────────────────────────────────────────────────────

/// All available provider backends.
///
/// Enum dispatch avoids `dyn` trait objects and the `async-trait` dependency.
/// Adding a backend = new module + new variant + new match arms.
#[derive(Debug, Clone)]
pub enum LlmProvider {
    Dummy(providers::dummy::DummyProvider),
    #[cfg(any(test, feature = "test-support"))]
    Scripted(providers::scripted::ScriptedProvider),
    #[cfg(feature = "provider-gemini")]
    Gemini(providers::gemini::GeminiProvider),
}

impl LlmProvider {
    pub fn name(&self) -> &'static str {
        match self {
            LlmProvider::Dummy(_) => "dummy",
            #[cfg(any(test, feature = "test-support"))]
            LlmProvider::Scripted(_) => "scripted",
            #[cfg(feature = "provider-gemini")]
            LlmProvider::Gemini(_) => "gemini",
        }
    }

    /// Open a conversation seeded with `seed`. Local only; no request is made
    /// until the first [`send`](Self::send).
    pub fn start_context(&self, model: &str, seed: Vec<Turn>) -> ChatContext {
        debug!(provider = self.name(), %model, seed_turns = seed.len(), "chat context started");
        ChatContext { model: model.to_string(), history: seed }
    }

    /// Send `text` within `ctx` and return the reply.
    ///
    /// On success `ctx` gains the user turn and the reply; on failure it is
    /// untouched.
    pub async fn send(&self, ctx: &mut ChatContext, text: &str) -> Result<String, ProviderError> {
        let mut contents = ctx.history.clone();
        contents.push(Turn::user(text));

        let reply = self.generate(&ctx.model, &contents).await?;

        ctx.history = contents;
        ctx.history.push(Turn::assistant(reply.clone()));
        Ok(reply)
    }

    async fn generate(&self, model: &str, contents: &[Turn]) -> Result<String, ProviderError> {
        match self {
            LlmProvider::Dummy(p) => p.generate(contents).await,
            #[cfg(any(test, feature = "test-support"))]
            LlmProvider::Scripted(p) => p.generate(contents).await,
            #[cfg(feature = "provider-gemini")]
            LlmProvider::Gemini(p) => p.generate(model, contents).await,
        }
        .inspect_err(|e| debug!(provider = self.name(), %model, error = %e, "generate failed"))
    }

    /// Models that support conversational generation.
    pub async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        match self {
            LlmProvider::Dummy(p) => p.list_models().await,
            #[cfg(any(test, feature = "test-support"))]
            LlmProvider::Scripted(p) => p.list_models().await,
            #[cfg(feature = "provider-gemini")]
            LlmProvider::Gemini(p) => p.list_models().await,
        }
    }

    /// [`list_models`](Self::list_models) with failures degraded to "no
    /// model selectable".
    pub async fn discover_models(&self) -> Vec<String> {
        match self.list_models().await {
            Ok(models) => {
                debug!(provider = self.name(), count = models.len(), "models discovered");
                models
            }
            Err(e) => {
                warn!(provider = self.name(), error = %e, "model discovery failed: API key invalid or network unavailable");
                Vec::new()
            }
        }
    }
}

/// Model ids compare equal with or without the `models/` prefix.
pub fn same_model(a: &str, b: &str) -> bool {
    let bare = |m: &str| m.trim().trim_start_matches("models/").to_string();
    bare(a) == bare(b)
}

/// Pick `preferred` when it is available, otherwise the first model.
pub fn select_model(available: &[String], preferred: &str) -> Option<String> {
    available
        .iter()
        .find(|m| same_model(m, preferred))
        .or_else(|| available.first())
        .cloned()
}
