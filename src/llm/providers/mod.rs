//! LLM provider implementations.
//!
//! `build(config, api_key)` is the factory, called once a credential is
//! known. Adding a new backend = new module + new match arm.

pub mod dummy;
#[cfg(feature = "provider-gemini")]
pub mod gemini;
#[cfg(any(test, feature = "test-support"))]
pub mod scripted;

use crate::config::LlmConfig;
use crate::llm::{LlmProvider, ProviderError};

/// Construct a `LlmProvider` from config and an optional API key.
///
/// `api_key` is the interactively entered key or `GEMINI_API_KEY` (never
/// TOML). Remote providers refuse to build without one.
pub fn build(config: &LlmConfig, api_key: Option<&str>) -> Result<LlmProvider, ProviderError> {
    match config.provider.as_str() {
        "dummy" => Ok(LlmProvider::Dummy(dummy::DummyProvider)),
        #[cfg(feature = "provider-gemini")]
        "gemini" => {
            let key = api_key
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .ok_or_else(|| ProviderError::MissingCredential("gemini".into()))?;
            let g = &config.gemini;
            let p = gemini::GeminiProvider::new(
                g.api_base_url.clone(),
                g.temperature,
                g.timeout_seconds,
                key.to_string(),
            )?;
            Ok(LlmProvider::Gemini(p))
        }
        _ => Err(ProviderError::UnknownProvider(config.provider.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn llm_config(provider: &str) -> LlmConfig {
        let mut cfg = Config::test_default(std::path::Path::new("/tmp")).llm;
        cfg.provider = provider.into();
        cfg
    }

    #[test]
    fn dummy_needs_no_key() {
        let p = build(&llm_config("dummy"), None).unwrap();
        assert_eq!(p.name(), "dummy");
    }

    #[test]
    fn unknown_provider_errors() {
        let err = build(&llm_config("nope"), Some("k")).unwrap_err();
        assert!(matches!(err, ProviderError::UnknownProvider(ref p) if p == "nope"));
    }

    #[cfg(feature = "provider-gemini")]
    #[test]
    fn gemini_requires_key() {
        assert!(matches!(
            build(&llm_config("gemini"), None),
            Err(ProviderError::MissingCredential(_))
        ));
        assert!(matches!(
            build(&llm_config("gemini"), Some("  ")),
            Err(ProviderError::MissingCredential(_))
        ));
        assert_eq!(build(&llm_config("gemini"), Some("key")).unwrap().name(), "gemini");
    }
}
