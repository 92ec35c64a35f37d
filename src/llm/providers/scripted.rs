//! Scripted provider: replays a queue of canned outcomes and records every
//! request it receives. Test double for the session engine; clones share
//! the same script.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::llm::ProviderError;
use crate::session::Turn;

#[derive(Debug, Default)]
struct Script {
    outcomes: VecDeque<Result<String, String>>,
    requests: Vec<Vec<Turn>>,
    discovery: Option<Result<Vec<String>, String>>,
}

#[derive(Debug, Clone, Default)]
pub struct ScriptedProvider {
    script: Arc<Mutex<Script>>,
}

impl ScriptedProvider {
    pub fn new(outcomes: Vec<Result<String, String>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(Script { outcomes: outcomes.into(), ..Script::default() })),
        }
    }

    /// Script of successful replies only.
    pub fn replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(replies.into_iter().map(|r| Ok(r.into())).collect())
    }

    /// Queue another outcome.
    pub fn push(&self, outcome: Result<String, String>) {
        if let Ok(mut s) = self.script.lock() {
            s.outcomes.push_back(outcome);
        }
    }

    pub fn with_models<I, S>(self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Ok(mut s) = self.script.lock() {
            s.discovery = Some(Ok(models.into_iter().map(Into::into).collect()));
        }
        self
    }

    pub fn failing_discovery(self, reason: &str) -> Self {
        if let Ok(mut s) = self.script.lock() {
            s.discovery = Some(Err(reason.to_string()));
        }
        self
    }

    /// Every `contents` slice passed to [`generate`](Self::generate), in order.
    pub fn requests(&self) -> Vec<Vec<Turn>> {
        self.script.lock().map(|s| s.requests.clone()).unwrap_or_default()
    }

    pub async fn generate(&self, contents: &[Turn]) -> Result<String, ProviderError> {
        let mut s = self
            .script
            .lock()
            .map_err(|_| ProviderError::Request("scripted provider lock poisoned".into()))?;
        s.requests.push(contents.to_vec());
        match s.outcomes.pop_front() {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(reason)) => Err(ProviderError::Request(reason)),
            None => Err(ProviderError::Request("script exhausted".into())),
        }
    }

    pub async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        let s = self
            .script
            .lock()
            .map_err(|_| ProviderError::Request("scripted provider lock poisoned".into()))?;
        match &s.discovery {
            None => Ok(vec!["scripted".to_string()]),
            Some(Ok(models)) => Ok(models.clone()),
            Some(Err(reason)) => Err(ProviderError::Request(reason.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn outcomes_replay_in_order() {
        let p = ScriptedProvider::new(vec![Ok("a".into()), Err("boom".into())]);
        assert_eq!(p.generate(&[]).await.unwrap(), "a");
        assert_eq!(p.generate(&[]).await.unwrap_err().to_string(), "boom");
        assert!(p.generate(&[]).await.is_err());
        assert_eq!(p.requests().len(), 3);
    }

    #[tokio::test]
    async fn clones_share_script() {
        let p = ScriptedProvider::default();
        let q = p.clone();
        q.push(Ok("late".into()));
        assert_eq!(p.generate(&[]).await.unwrap(), "late");
    }
}
