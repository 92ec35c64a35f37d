//! Google Gemini provider (`generateContent` + `models.list`).
//!
//! All Gemini wire types are private to this module; callers see only
//! [`Turn`]s in and text out. The API key travels in the `x-goog-api-key`
//! header so it never shows up in logged URLs.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace};

use crate::llm::ProviderError;
use crate::session::{Role, Turn};

const API_KEY_HEADER: &str = "x-goog-api-key";

/// Categories relaxed to `BLOCK_NONE`: teachers describe student aggression
/// and distress, which the default thresholds reject.
const RELAXED_CATEGORIES: [&str; 3] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

/// Constructed once a key is known, then cheaply cloned (`reqwest::Client`
/// is an `Arc` internally).
#[derive(Debug, Clone)]
pub struct GeminiProvider {
    client: Client,
    api_base_url: String,
    temperature: f32,
    api_key: String,
}

impl GeminiProvider {
    pub fn new(
        api_base_url: String,
        temperature: f32,
        timeout_seconds: u64,
        api_key: String,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| ProviderError::Request(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            temperature,
            api_key,
        })
    }

    /// One `generateContent` round-trip over the full `contents`.
    pub async fn generate(&self, model: &str, contents: &[Turn]) -> Result<String, ProviderError> {
        let url = format!("{}/{}:generateContent", self.api_base_url, model_path(model));
        let payload = GenerateRequest {
            contents: contents.iter().map(Content::from).collect(),
            generation_config: GenerationConfig { temperature: self.temperature },
            safety_settings: RELAXED_CATEGORIES
                .iter()
                .map(|c| SafetySetting { category: c, threshold: "BLOCK_NONE" })
                .collect(),
        };

        debug!(%model, turns = contents.len(), "sending Gemini request");
        if tracing::enabled!(tracing::Level::TRACE) {
            let json = serde_json::to_string_pretty(&payload)
                .unwrap_or_else(|e| format!("<serialization failed: {e}>"));
            trace!(payload = %json, "full Gemini request payload");
        }

        let response = self
            .client
            .post(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                error!(%url, error = %e, "Gemini HTTP request failed (transport)");
                ProviderError::Request(e.to_string())
            })?;
        let response = check_status(response).await?;

        let parsed = response.json::<GenerateResponse>().await.map_err(|e| {
            error!(error = %e, "failed to deserialize Gemini response");
            ProviderError::Request(format!("failed to parse response body: {e}"))
        })?;

        if let Some(usage) = &parsed.usage_metadata {
            debug!(
                prompt_tokens = usage.prompt_token_count,
                reply_tokens = usage.candidates_token_count,
                "Gemini usage"
            );
        }
        extract_text(parsed)
    }

    /// Models whose `supportedGenerationMethods` include `generateContent`,
    /// following pagination.
    pub async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        let url = format!("{}/models", self.api_base_url);
        let mut models = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut req = self
                .client
                .get(&url)
                .header(API_KEY_HEADER, &self.api_key)
                .query(&[("pageSize", "1000")]);
            if let Some(token) = &page_token {
                req = req.query(&[("pageToken", token.as_str())]);
            }
            let response = req
                .send()
                .await
                .map_err(|e| ProviderError::Request(e.to_string()))?;
            let page = check_status(response)
                .await?
                .json::<ModelsPage>()
                .await
                .map_err(|e| ProviderError::Request(format!("failed to parse model list: {e}")))?;

            models.extend(
                page.models
                    .into_iter()
                    .filter(|m| m.supported_generation_methods.iter().any(|g| g == "generateContent"))
                    .map(|m| m.name),
            );
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(models)
    }
}

/// `gemini-1.5-flash` and `models/gemini-1.5-flash` both address the same model.
fn model_path(model: &str) -> String {
    if model.starts_with("models/") || model.starts_with("tunedModels/") {
        model.to_string()
    } else {
        format!("models/{model}")
    }
}

fn extract_text(parsed: GenerateResponse) -> Result<String, ProviderError> {
    let Some(candidate) = parsed.candidates.into_iter().next() else {
        let reason = parsed
            .prompt_feedback
            .and_then(|f| f.block_reason)
            .unwrap_or_else(|| "no candidates returned".to_string());
        return Err(ProviderError::Request(format!("response blocked: {reason}")));
    };

    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();
    let text = text.trim().to_string();
    if text.is_empty() {
        let reason = candidate.finish_reason.unwrap_or_else(|| "UNKNOWN".into());
        return Err(ProviderError::Request(format!("empty reply (finish reason: {reason})")));
    }
    Ok(text)
}

// ── Private wire types ────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
    safety_settings: Vec<SafetySetting<'a>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

impl From<&Turn> for Content {
    fn from(turn: &Turn) -> Self {
        let role = match turn.role {
            Role::User => "user",
            Role::Assistant => "model",
        };
        Content {
            role: Some(role.to_string()),
            parts: vec![Part { text: Some(turn.content.clone()) }],
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct SafetySetting<'a> {
    category: &'a str,
    threshold: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelsPage {
    #[serde(default)]
    models: Vec<ModelInfo>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelInfo {
    name: String,
    #[serde(default)]
    supported_generation_methods: Vec<String>,
}

// Google API error envelope.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
    #[serde(default)]
    status: Option<String>,
}

/// Consume the response and return it if successful, or a structured error.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<failed to read error body>".to_string());

    let message = match serde_json::from_str::<ErrorEnvelope>(&body) {
        Ok(env) => {
            let code = env.error.status.map(|s| format!(" [{s}]")).unwrap_or_default();
            format!("HTTP {status}{code}: {}", env.error.message)
        }
        Err(_) => format!("HTTP {status}: {body}"),
    };

    error!(%status, %message, "Gemini request returned HTTP error");
    Err(ProviderError::Request(message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_path_adds_prefix_once() {
        assert_eq!(model_path("gemini-1.5-flash"), "models/gemini-1.5-flash");
        assert_eq!(model_path("models/gemini-1.5-flash"), "models/gemini-1.5-flash");
    }

    #[test]
    fn turns_map_to_gemini_roles() {
        let user = Content::from(&Turn::user("q"));
        let model = Content::from(&Turn::assistant("a"));
        assert_eq!(user.role.as_deref(), Some("user"));
        assert_eq!(model.role.as_deref(), Some("model"));
        assert_eq!(model.parts[0].text.as_deref(), Some("a"));
    }

    #[test]
    fn request_serializes_camel_case_with_safety_settings() {
        let req = GenerateRequest {
            contents: vec![Content::from(&Turn::user("hi"))],
            generation_config: GenerationConfig { temperature: 0.5 },
            safety_settings: vec![SafetySetting { category: RELAXED_CATEGORIES[0], threshold: "BLOCK_NONE" }],
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["contents"][0]["role"], "user");
        assert_eq!(json["contents"][0]["parts"][0]["text"], "hi");
        assert_eq!(json["generationConfig"]["temperature"], 0.5);
        assert_eq!(json["safetySettings"][0]["threshold"], "BLOCK_NONE");
    }

    #[test]
    fn extract_text_joins_parts() {
        let parsed: GenerateResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hello "},{"text":"teacher"}]},"finishReason":"STOP"}]}"#,
        )
        .unwrap();
        assert_eq!(extract_text(parsed).unwrap(), "Hello teacher");
    }

    #[test]
    fn extract_text_reports_block_reason() {
        let parsed: GenerateResponse =
            serde_json::from_str(r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#).unwrap();
        let err = extract_text(parsed).unwrap_err();
        assert!(err.to_string().contains("SAFETY"));
    }

    #[test]
    fn extract_text_rejects_empty_reply() {
        let parsed: GenerateResponse =
            serde_json::from_str(r#"{"candidates":[{"finishReason":"MAX_TOKENS"}]}"#).unwrap();
        let err = extract_text(parsed).unwrap_err();
        assert!(err.to_string().contains("MAX_TOKENS"));
    }

    #[test]
    fn models_page_parses() {
        let page: ModelsPage = serde_json::from_str(
            r#"{"models":[{"name":"models/gemini-1.5-flash","supportedGenerationMethods":["generateContent","countTokens"]},{"name":"models/embedding-001","supportedGenerationMethods":["embedContent"]}],"nextPageToken":""}"#,
        )
        .unwrap();
        assert_eq!(page.models.len(), 2);
        assert_eq!(page.models[0].name, "models/gemini-1.5-flash");
        assert_eq!(page.next_page_token.as_deref(), Some(""));
    }
}
