//! Configuration loading with env-var overrides.
//!
//! Reads `config/default.toml` relative to the current working directory,
//! then applies `COACHBOT_WORK_DIR` and `COACHBOT_LOG_LEVEL` env overrides.
//! Secrets (`GEMINI_API_KEY`, `SHEETS_ACCESS_TOKEN`) come from the
//! environment only, never from TOML.

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::error::AppError;
use crate::knowledge::Sources;
use crate::session::{AgeGroup, Language, SessionConfig};

/// Default knowledge excerpt budget, in characters.
pub const DEFAULT_KNOWLEDGE_CHAR_BUDGET: usize = 30_000;

/// Knowledge document discovery.
#[derive(Debug, Clone)]
pub struct KnowledgeConfig {
    /// Directory scanned when `files` is empty.
    pub dir: PathBuf,
    /// Extension matched during the scan (no leading dot).
    pub extension: String,
    /// Explicit file list; overrides the directory scan when non-empty.
    pub files: Vec<PathBuf>,
}

impl KnowledgeConfig {
    pub fn sources(&self) -> Sources {
        if self.files.is_empty() {
            Sources::Scan { dir: self.dir.clone(), extension: self.extension.clone() }
        } else {
            Sources::Files(self.files.clone())
        }
    }
}

#[derive(Debug, Clone)]
pub struct PromptsConfig {
    /// Directory holding prompt template fragments.
    pub dir: PathBuf,
    /// Maximum knowledge characters embedded in the system prompt.
    pub knowledge_char_budget: usize,
}

/// Gemini provider configuration (`[llm.gemini]`).
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    /// API root, e.g. `https://generativelanguage.googleapis.com/v1beta`.
    pub api_base_url: String,
    /// Preferred model id; falls back to the first discovered model.
    pub model: String,
    pub temperature: f32,
    /// Per-request HTTP timeout in seconds.
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Active provider (`"gemini"` or `"dummy"`), from `default` in `[llm]`.
    pub provider: String,
    pub gemini: GeminiConfig,
}

/// What a mid-session age-group / language change does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigChangePolicy {
    /// Running session keeps its rendered prompt; change applies at next login.
    #[default]
    NextSession,
    /// Re-render the prompt and re-seed the model context, keeping history.
    Reseed,
}

#[derive(Debug, Clone)]
pub struct SessionDefaults {
    pub config: SessionConfig,
    pub config_change: ConfigChangePolicy,
}

#[derive(Debug, Clone)]
pub struct ExportConfig {
    /// Directory for downloaded CSV transcripts.
    pub dir: PathBuf,
}

/// Remote append-row log (`[sheets]`).
#[derive(Debug, Clone)]
pub struct SheetsConfig {
    pub enabled: bool,
    /// Spreadsheet name, resolved to an id through Drive.
    pub spreadsheet: String,
    pub worksheet: String,
    pub sheets_api_base_url: String,
    pub drive_api_base_url: String,
    pub timeout_seconds: u64,
}

/// Fully-resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub app_name: String,
    /// Base directory for relative paths (already expanded, no `~`).
    pub work_dir: PathBuf,
    pub log_level: String,
    pub knowledge: KnowledgeConfig,
    pub prompts: PromptsConfig,
    pub llm: LlmConfig,
    pub session: SessionDefaults,
    pub export: ExportConfig,
    pub sheets: SheetsConfig,
    /// From `GEMINI_API_KEY`; an interactively entered key takes precedence.
    pub llm_api_key: Option<String>,
    /// From `SHEETS_ACCESS_TOKEN`.
    pub sheets_access_token: Option<String>,
}

// ── Raw TOML shape ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RawConfig {
    app: RawApp,
    #[serde(default)]
    knowledge: RawKnowledge,
    #[serde(default)]
    prompts: RawPrompts,
    #[serde(default)]
    llm: RawLlm,
    #[serde(default)]
    session: RawSession,
    #[serde(default)]
    export: RawExport,
    #[serde(default)]
    sheets: RawSheets,
}

#[derive(Deserialize)]
struct RawApp {
    name: String,
    work_dir: String,
    log_level: String,
}

#[derive(Deserialize)]
struct RawKnowledge {
    #[serde(default = "default_knowledge_dir")]
    dir: String,
    #[serde(default = "default_knowledge_extension")]
    extension: String,
    #[serde(default)]
    files: Vec<String>,
}

impl Default for RawKnowledge {
    fn default() -> Self {
        Self { dir: default_knowledge_dir(), extension: default_knowledge_extension(), files: Vec::new() }
    }
}

#[derive(Deserialize)]
struct RawPrompts {
    #[serde(default = "default_prompts_dir")]
    dir: String,
    #[serde(default = "default_knowledge_char_budget")]
    knowledge_char_budget: usize,
}

impl Default for RawPrompts {
    fn default() -> Self {
        Self { dir: default_prompts_dir(), knowledge_char_budget: default_knowledge_char_budget() }
    }
}

#[derive(Deserialize)]
struct RawLlm {
    #[serde(rename = "default", default = "default_llm_provider")]
    provider: String,
    #[serde(default)]
    gemini: RawGemini,
}

impl Default for RawLlm {
    fn default() -> Self {
        Self { provider: default_llm_provider(), gemini: RawGemini::default() }
    }
}

#[derive(Deserialize)]
struct RawGemini {
    #[serde(default = "default_gemini_api_base_url")]
    api_base_url: String,
    #[serde(default = "default_gemini_model")]
    model: String,
    #[serde(default = "default_gemini_temperature")]
    temperature: f32,
    #[serde(default = "default_timeout_seconds")]
    timeout_seconds: u64,
}

impl Default for RawGemini {
    fn default() -> Self {
        Self {
            api_base_url: default_gemini_api_base_url(),
            model: default_gemini_model(),
            temperature: default_gemini_temperature(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

#[derive(Deserialize, Default)]
struct RawSession {
    #[serde(default)]
    age_group: Option<String>,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    config_change: ConfigChangePolicy,
}

#[derive(Deserialize)]
struct RawExport {
    #[serde(default = "default_export_dir")]
    dir: String,
}

impl Default for RawExport {
    fn default() -> Self {
        Self { dir: default_export_dir() }
    }
}

#[derive(Deserialize)]
struct RawSheets {
    #[serde(default)]
    enabled: bool,
    #[serde(default = "default_spreadsheet")]
    spreadsheet: String,
    #[serde(default = "default_worksheet")]
    worksheet: String,
    #[serde(default = "default_sheets_api_base_url")]
    sheets_api_base_url: String,
    #[serde(default = "default_drive_api_base_url")]
    drive_api_base_url: String,
    #[serde(default = "default_timeout_seconds")]
    timeout_seconds: u64,
}

impl Default for RawSheets {
    fn default() -> Self {
        Self {
            enabled: false,
            spreadsheet: default_spreadsheet(),
            worksheet: default_worksheet(),
            sheets_api_base_url: default_sheets_api_base_url(),
            drive_api_base_url: default_drive_api_base_url(),
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

fn default_knowledge_dir() -> String { ".".to_string() }
fn default_knowledge_extension() -> String { "pdf".to_string() }
fn default_prompts_dir() -> String { "config/prompts".to_string() }
fn default_knowledge_char_budget() -> usize { DEFAULT_KNOWLEDGE_CHAR_BUDGET }
fn default_llm_provider() -> String { "gemini".to_string() }
fn default_gemini_api_base_url() -> String { "https://generativelanguage.googleapis.com/v1beta".to_string() }
fn default_gemini_model() -> String { "models/gemini-1.5-flash".to_string() }
fn default_gemini_temperature() -> f32 { 0.7 }
fn default_timeout_seconds() -> u64 { 60 }
fn default_export_dir() -> String { "exports".to_string() }
fn default_spreadsheet() -> String { "coaching-log".to_string() }
fn default_worksheet() -> String { "sessions".to_string() }
fn default_sheets_api_base_url() -> String { "https://sheets.googleapis.com/v4".to_string() }
fn default_drive_api_base_url() -> String { "https://www.googleapis.com/drive/v3".to_string() }

/// Load config from `config/default.toml`, then apply env-var overrides.
pub fn load() -> Result<Config, AppError> {
    let work_dir_override = env::var("COACHBOT_WORK_DIR").ok();
    let log_level_override = env::var("COACHBOT_LOG_LEVEL").ok();
    let mut config = load_from(
        Path::new("config/default.toml"),
        work_dir_override.as_deref(),
        log_level_override.as_deref(),
    )?;
    config.llm_api_key = non_empty_env("GEMINI_API_KEY");
    config.sheets_access_token = non_empty_env("SHEETS_ACCESS_TOKEN");
    Ok(config)
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Internal loader: accepts an explicit path and optional overrides.
/// Tests pass overrides directly instead of mutating env vars. Secrets are
/// left unset.
pub fn load_from(
    path: &Path,
    work_dir_override: Option<&str>,
    log_level_override: Option<&str>,
) -> Result<Config, AppError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;

    let parsed: RawConfig = toml::from_str(&raw)
        .map_err(|e| AppError::Config(format!("parse error in {}: {e}", path.display())))?;

    let a = parsed.app;
    let work_dir = expand_home(work_dir_override.unwrap_or(&a.work_dir));
    let log_level = log_level_override.unwrap_or(&a.log_level).to_string();
    // Plain levels are validated here; filter directives are left to the logger.
    if !log_level.contains(['=', ',']) {
        crate::logger::parse_level(&log_level)?;
    }
    let resolve = |p: &str| {
        let path = expand_home(p);
        if path.is_absolute() { path } else { work_dir.join(path) }
    };

    let mut session = SessionConfig::default();
    if let Some(g) = parsed.session.age_group.as_deref() {
        session.age_group = g.parse::<AgeGroup>().map_err(AppError::Config)?;
    }
    if let Some(l) = parsed.session.language.as_deref() {
        session.language = l.parse::<Language>().map_err(AppError::Config)?;
    }

    if parsed.prompts.knowledge_char_budget == 0 {
        return Err(AppError::Config("prompts.knowledge_char_budget must be greater than 0".into()));
    }

    Ok(Config {
        app_name: a.name,
        log_level,
        knowledge: KnowledgeConfig {
            dir: resolve(parsed.knowledge.dir.as_str()),
            extension: parsed.knowledge.extension.trim_start_matches('.').to_string(),
            files: parsed.knowledge.files.iter().map(|f| resolve(f.as_str())).collect(),
        },
        prompts: PromptsConfig {
            dir: resolve(parsed.prompts.dir.as_str()),
            knowledge_char_budget: parsed.prompts.knowledge_char_budget,
        },
        llm: LlmConfig {
            provider: parsed.llm.provider,
            gemini: GeminiConfig {
                api_base_url: parsed.llm.gemini.api_base_url,
                model: parsed.llm.gemini.model,
                temperature: parsed.llm.gemini.temperature,
                timeout_seconds: parsed.llm.gemini.timeout_seconds,
            },
        },
        session: SessionDefaults { config: session, config_change: parsed.session.config_change },
        export: ExportConfig { dir: resolve(parsed.export.dir.as_str()) },
        sheets: SheetsConfig {
            enabled: parsed.sheets.enabled,
            spreadsheet: parsed.sheets.spreadsheet,
            worksheet: parsed.sheets.worksheet,
            sheets_api_base_url: parsed.sheets.sheets_api_base_url,
            drive_api_base_url: parsed.sheets.drive_api_base_url,
            timeout_seconds: parsed.sheets.timeout_seconds,
        },
        work_dir,
        llm_api_key: None,
        sheets_access_token: None,
    })
}

/// Expand a leading `~` to the user's home directory.
/// Absolute or relative paths without `~` are returned unchanged.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

// ── test helpers ──────────────────────────────────────────────────────────────

impl Config {
    /// Safe `Config` for tests: dummy LLM, no secrets, sheets disabled,
    /// every path under `work_dir`.
    pub fn test_default(work_dir: &Path) -> Self {
        Self {
            app_name: "test".into(),
            work_dir: work_dir.to_path_buf(),
            log_level: "info".into(),
            knowledge: KnowledgeConfig {
                dir: work_dir.join("knowledge"),
                extension: "pdf".into(),
                files: Vec::new(),
            },
            prompts: PromptsConfig {
                dir: work_dir.join("prompts"),
                knowledge_char_budget: DEFAULT_KNOWLEDGE_CHAR_BUDGET,
            },
            llm: LlmConfig {
                provider: "dummy".into(),
                gemini: GeminiConfig {
                    api_base_url: "http://localhost:0/v1beta".into(),
                    model: "models/test-model".into(),
                    temperature: 0.0,
                    timeout_seconds: 1,
                },
            },
            session: SessionDefaults {
                config: SessionConfig::default(),
                config_change: ConfigChangePolicy::NextSession,
            },
            export: ExportConfig { dir: work_dir.join("exports") },
            sheets: SheetsConfig {
                enabled: false,
                spreadsheet: "test-log".into(),
                worksheet: "sessions".into(),
                sheets_api_base_url: "http://localhost:0/v4".into(),
                drive_api_base_url: "http://localhost:0/drive/v3".into(),
                timeout_seconds: 1,
            },
            llm_api_key: None,
            sheets_access_token: None,
        }
    }
}
