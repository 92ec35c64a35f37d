//! Layered prompt builder for the coaching persona.
//!
//! Prompts are assembled from plain-text fragments stored under
//! `config/prompts/`. Each layer is appended in order; a missing file falls
//! back to the built-in text so the coach always has a persona.
//!
//! ## Layer ordering
//!
//! ```text
//! 0. persona.md    : who the coach is, age group, language
//! 1. guidelines.md : behavioural rules (validate first, Socratic, no answers)
//! 2. knowledge     : bounded head of the knowledge base
//! ```
//!
//! Variable substitution uses `{{key}}` syntax and runs once, in a single
//! pass over the joined template at [`build()`](PromptBuilder::build) time.
//! Substituted values are never re-scanned, so knowledge text containing
//! braces is embedded verbatim.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use crate::session::{AgeGroup, Language, SessionConfig};

const SEPARATOR: &str = "\n\n";

pub const PERSONA_FILE: &str = "persona.md";
pub const GUIDELINES_FILE: &str = "guidelines.md";

pub const DEFAULT_PERSONA: &str = "\
Role: You are a \"Trauma-Informed Implementation Coach\" for teachers.
Current Context: Working with {{age_group}} students.
Language: Reply only in {{language}}.";

pub const DEFAULT_GUIDELINES: &str = "\
Guidelines:
1. Empathize with the teacher first. Validate their experience before offering any advice.
2. Use Socratic questioning to help the teacher identify the student's behavior as a trauma response (4F: Fight, Flight, Freeze, Fawn).
3. Do not hand out ready-made solutions; guide the teacher to discover their own next step.
4. Differentiate advice by age group:
   - For 國小 (elementary): focus on sensory regulation and safety routines.
   - For 國中/高中 (junior/senior high): focus on autonomy, respect, and collaborative problem-solving.
5. Refer to the 'Strength-Based' and 'Connect before Correct' principles from the knowledge base.";

const KNOWLEDGE_HEADER: &str = "Knowledge Base:\n{{knowledge}}";

/// Fluent builder that assembles a layered prompt from template files.
pub struct PromptBuilder {
    prompts_dir: PathBuf,
    parts: Vec<String>,
    vars: HashMap<String, String>,
}

impl PromptBuilder {
    /// Create a builder rooted at `prompts_dir` (e.g. `"config/prompts"`).
    pub fn new(prompts_dir: impl Into<PathBuf>) -> Self {
        Self {
            prompts_dir: prompts_dir.into(),
            parts: Vec::new(),
            vars: HashMap::new(),
        }
    }

    /// Append a layer loaded from `filename`; use `fallback` when the file
    /// is missing or blank.
    pub fn layer_or(mut self, filename: &str, fallback: &str) -> Self {
        let path = self.prompts_dir.join(filename);
        let text = match fs::read_to_string(&path) {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) | Err(_) => {
                tracing::debug!("prompt: layer '{}' not found, using built-in text", path.display());
                fallback.to_string()
            }
        };
        self.append(text)
    }

    /// Directly append a text fragment.
    pub fn append(mut self, text: impl Into<String>) -> Self {
        let s = text.into();
        let trimmed = s.trim();
        if !trimmed.is_empty() {
            self.parts.push(trimmed.to_string());
        }
        self
    }

    /// Register a single `{{key}}` → `value` substitution.
    pub fn var(mut self, key: &str, value: impl Into<String>) -> Self {
        self.vars.insert(key.to_string(), value.into());
        self
    }

    /// Assemble all layers, join with blank lines, and apply variable
    /// substitution. Unknown placeholders are left as written.
    pub fn build(self) -> String {
        render(&self.parts.join(SEPARATOR), &self.vars)
    }
}

/// Single-pass `{{key}}` substitution.
fn render(template: &str, vars: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = &after[..end];
                match vars.get(key.trim()) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push_str("{{");
                        out.push_str(key);
                        out.push_str("}}");
                    }
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Head of `text`, at most `max_chars` Unicode scalar values long.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

/// Render the system prompt for a session.
///
/// `knowledge` is cut to `char_budget` characters (head kept, silently).
pub fn coach_prompt(
    prompts_dir: impl Into<PathBuf>,
    char_budget: usize,
    identifier: &str,
    config: SessionConfig,
    knowledge: &str,
) -> String {
    PromptBuilder::new(prompts_dir)
        .layer_or(PERSONA_FILE, DEFAULT_PERSONA)
        .layer_or(GUIDELINES_FILE, DEFAULT_GUIDELINES)
        .append(KNOWLEDGE_HEADER)
        .var("identifier", identifier)
        .var("age_group", config.age_group.label())
        .var("language", config.language.label())
        .var("knowledge", truncate_chars(knowledge, char_budget))
        .build()
}

/// Opening assistant message, rendered locally in the session language.
pub fn welcome(identifier: &str, config: SessionConfig) -> String {
    let grade = config.age_group.label();
    match config.language {
        Language::TraditionalChinese => format!(
            "你好 {identifier} 老師，很高興能擔任您的 AI 實作教練。目前針對 {grade} 班級的教學現場，\
             有沒有什麼讓你感到挫折或困難的具體個案，我們一起來討論看看？"
        ),
        Language::Cantonese => format!(
            "你好 {identifier} 老師，好高興可以做你嘅 AI 實作教練。而家喺 {grade} 班嘅教學現場，\
             有冇啲令你覺得挫敗或者困難嘅具體個案？我哋一齊傾吓。"
        ),
        Language::English => {
            let grade = match config.age_group {
                AgeGroup::Elementary => "elementary school",
                AgeGroup::JuniorHigh => "junior high",
                AgeGroup::SeniorHigh => "senior high",
            };
            format!(
                "Hello {identifier}, I'm glad to be your AI implementation coach. Thinking about your \
                 {grade} classroom, is there a specific situation that has felt frustrating or \
                 difficult? Let's talk it through together."
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn empty_dir() -> TempDir {
        TempDir::new().unwrap()
    }

    #[test]
    fn builder_uses_fallback_for_missing_layer() {
        let dir = empty_dir();
        let result = PromptBuilder::new(dir.path())
            .layer_or("nonexistent_file_xyz.md", "fallback text")
            .append("hello")
            .build();
        assert_eq!(result, "fallback text\n\nhello");
    }

    #[test]
    fn builder_prefers_file_over_fallback() {
        let dir = empty_dir();
        fs::write(dir.path().join(PERSONA_FILE), "Custom persona for {{age_group}}\n").unwrap();
        let result = PromptBuilder::new(dir.path())
            .layer_or(PERSONA_FILE, DEFAULT_PERSONA)
            .var("age_group", "國中")
            .build();
        assert_eq!(result, "Custom persona for 國中");
    }

    #[test]
    fn render_does_not_rescan_values() {
        let mut vars = HashMap::new();
        vars.insert("knowledge".to_string(), "{{language}} stays".to_string());
        vars.insert("language".to_string(), "English".to_string());
        assert_eq!(render("{{knowledge}} / {{language}}", &vars), "{{language}} stays / English");
    }

    #[test]
    fn render_keeps_unknown_and_unclosed_placeholders() {
        let vars = HashMap::new();
        assert_eq!(render("a {{missing}} b {{open", &vars), "a {{missing}} b {{open");
    }

    #[test]
    fn truncate_is_exact_and_char_safe() {
        assert_eq!(truncate_chars("abcdef", 3), "abc");
        assert_eq!(truncate_chars("創傷知情教練", 2), "創傷");
        assert_eq!(truncate_chars("short", 100), "short");
        assert_eq!(truncate_chars("abc", 0), "");
    }

    #[test]
    fn coach_prompt_embeds_config_and_bounded_knowledge() {
        let dir = empty_dir();
        let knowledge = "K".repeat(50) + &"X".repeat(50);
        let config = SessionConfig { age_group: AgeGroup::SeniorHigh, language: Language::English };
        let prompt = coach_prompt(dir.path(), 50, "001", config, &knowledge);
        assert!(prompt.contains("Working with 高中 students"));
        assert!(prompt.contains("Reply only in English"));
        assert!(prompt.contains(&"K".repeat(50)));
        assert!(!prompt.contains('X'));
        assert!(prompt.contains("Socratic"));
        assert!(!prompt.contains("{{"));
    }

    #[test]
    fn coach_prompt_substitutes_identifier_from_file_layer() {
        let dir = empty_dir();
        fs::write(dir.path().join(PERSONA_FILE), "Coaching {{identifier}} ({{language}})").unwrap();
        let prompt = coach_prompt(dir.path(), 10, "王老師", SessionConfig::default(), "kb");
        assert!(prompt.starts_with("Coaching 王老師 (繁體中文)"));
    }

    #[test]
    fn coach_prompt_is_deterministic() {
        let dir = empty_dir();
        let config = SessionConfig::default();
        assert_eq!(
            coach_prompt(dir.path(), 100, "001", config, "kb"),
            coach_prompt(dir.path(), 100, "001", config, "kb")
        );
    }

    #[test]
    fn welcome_addresses_identifier_in_each_language() {
        for language in Language::ALL {
            let config = SessionConfig { age_group: AgeGroup::JuniorHigh, language };
            let text = welcome("001", config);
            assert!(text.contains("001"), "{language}: {text}");
            assert!(text.ends_with('？') || text.ends_with('。') || text.ends_with('.'), "{text}");
        }
        let zh = welcome("001", SessionConfig { age_group: AgeGroup::JuniorHigh, language: Language::TraditionalChinese });
        assert!(zh.contains("國中"));
    }
}
