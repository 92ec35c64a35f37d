//! Dummy LLM provider: echoes the latest user turn prefixed with `[echo]`.
//! Used to exercise the whole session flow without an API key.

use crate::llm::ProviderError;
use crate::session::{Role, Turn};

#[derive(Debug, Clone)]
pub struct DummyProvider;

impl DummyProvider {
    pub async fn generate(&self, contents: &[Turn]) -> Result<String, ProviderError> {
        let last = contents
            .iter()
            .rev()
            .find(|t| t.role == Role::User)
            .map(|t| t.content.as_str())
            .unwrap_or_default();
        Ok(format!("[echo] {last}"))
    }

    pub async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        Ok(vec!["dummy".to_string()])
    }
}
