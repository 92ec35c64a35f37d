//! Interactive console: reads lines from stdin, drives the [`CoachRoom`],
//! prints the chat to stdout.
//!
//! Before login a plain line is taken as the nickname; after login it is a
//! chat message. Lines starting with `/` are commands (see [`HELP`]). Runs
//! until `/quit`, stdin closes, or the `shutdown` token is cancelled
//! (Ctrl-C). With unsaved chat the first `/quit` only prints a reminder.

use std::io::Write;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{ConfigChange, SubmitOutcome};
use crate::error::AppError;
use crate::export::ExportReceipt;
use crate::room::{Advisory, CoachRoom, Logout, RoomError};
use crate::session::{AgeGroup, Language, Role, Turn};

pub const HELP: &str = "\
Commands:
  /key <api-key>     set the Gemini API key (overrides GEMINI_API_KEY)
  /models            list available models
  /model <name>      choose a model
  /grade <group>     elementary | junior_high | senior_high (or 國小/國中/高中)
  /lang <language>   zh-tw | yue | en (or 繁體中文/粵語/English)
  /retry             resend the last unanswered message
  /download          write the transcript as CSV without logging out
  /logout            save the transcript and log out
  /force-logout      log out without saving
  /status            show session, model and preferences
  /help              show this help
  /quit              exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Text(String),
    Key(String),
    Models,
    Model(String),
    Grade(String),
    Lang(String),
    Retry,
    Download,
    Logout,
    ForceLogout,
    Status,
    Help,
    Quit,
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Command {
        let line = line.trim();
        let Some(rest) = line.strip_prefix('/') else {
            return Command::Text(line.to_string());
        };
        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim().to_string()),
            None => (rest, String::new()),
        };
        match name {
            "key" => Command::Key(arg),
            "models" => Command::Models,
            "model" => Command::Model(arg),
            "grade" => Command::Grade(arg),
            "lang" | "language" => Command::Lang(arg),
            "retry" => Command::Retry,
            "download" | "export" => Command::Download,
            "logout" => Command::Logout,
            "force-logout" => Command::ForceLogout,
            "status" => Command::Status,
            "help" | "?" => Command::Help,
            "quit" | "exit" => Command::Quit,
            other => Command::Unknown(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Run the console on stdin/stdout.
pub async fn run(room: &mut CoachRoom, shutdown: CancellationToken) -> Result<(), AppError> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut stdout = std::io::stdout();
    run_with(room, stdin, &mut stdout, shutdown).await
}

/// Console loop over any line source and sink.
pub async fn run_with<R, W>(
    room: &mut CoachRoom,
    input: R,
    out: &mut W,
    shutdown: CancellationToken,
) -> Result<(), AppError>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    info!(app = %room.config().app_name, "console started");
    writeln!(out, "─────────────────────────────────")?;
    writeln!(out, " {}  (/help for commands, Ctrl-C to quit)", room.config().app_name)?;
    writeln!(out, "─────────────────────────────────")?;
    writeln!(out, "Please enter your nickname to begin.")?;

    let mut lines = input.lines();
    let mut quit_warned = false;
    loop {
        write!(out, "{}", prompt(room))?;
        out.flush()?;

        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                writeln!(out)?;
                remind_unsaved(room, out)?;
                info!("console shutting down");
                break;
            }

            line = lines.next_line() => {
                match line {
                    Err(e) => {
                        warn!("console read error: {e}");
                        break;
                    }
                    Ok(None) => {
                        remind_unsaved(room, out)?;
                        info!("console input closed");
                        break;
                    }
                    Ok(Some(line)) => {
                        debug!(chars = line.chars().count(), "console line");
                        let command = Command::parse(&line);
                        if command == Command::Quit && !quit_warned && room.has_unsaved_turns() {
                            remind_unsaved(room, out)?;
                            writeln!(out, "  Enter /quit again to leave anyway.")?;
                            quit_warned = true;
                        } else {
                            quit_warned = false;
                            if handle(room, command, out).await? == Flow::Quit {
                                break;
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

fn remind_unsaved<W: Write>(room: &CoachRoom, out: &mut W) -> std::io::Result<()> {
    if room.has_unsaved_turns() {
        writeln!(out, "! Your conversation has not been saved. Use /download or /logout before leaving.")?;
    }
    Ok(())
}

fn prompt(room: &CoachRoom) -> String {
    match room.identifier() {
        Some(id) => format!("{id}> "),
        None => "nickname> ".to_string(),
    }
}

/// Execute one command, writing everything the user should see to `out`.
pub async fn handle<W: Write>(room: &mut CoachRoom, command: Command, out: &mut W) -> Result<Flow, AppError> {
    match command {
        Command::Text(text) => {
            if room.identifier().is_none() {
                login(room, &text, out).await?;
            } else {
                chat(room, &text, out).await?;
            }
        }
        Command::Key(key) => {
            if key.is_empty() {
                writeln!(out, "usage: /key <api-key>")?;
            } else {
                let advisories = room.set_api_key(&key).await;
                writeln!(out, "API key set.")?;
                show_advisories(room, &advisories, out)?;
            }
        }
        Command::Models => {
            if room.models().is_empty() {
                writeln!(out, "No models available.")?;
            }
            for m in room.models() {
                let marker = if Some(m.as_str()) == room.selected_model() { "*" } else { " " };
                writeln!(out, " {marker} {m}")?;
            }
        }
        Command::Model(name) => match room.select_model(&name) {
            Ok(advisories) => {
                writeln!(out, "Model: {}", room.selected_model().unwrap_or("-"))?;
                show_advisories(room, &advisories, out)?;
            }
            Err(e) => writeln!(out, "✗ {e}")?,
        },
        Command::Grade(arg) => match arg.parse::<AgeGroup>() {
            Ok(group) => match room.set_age_group(group) {
                Ok(change) => writeln!(out, "Grade: {group}{}", change_note(change))?,
                Err(e) => writeln!(out, "✗ {e}")?,
            },
            Err(e) => writeln!(out, "✗ {e}")?,
        },
        Command::Lang(arg) => match arg.parse::<Language>() {
            Ok(language) => match room.set_language(language) {
                Ok(change) => writeln!(out, "Language: {language}{}", change_note(change))?,
                Err(e) => writeln!(out, "✗ {e}")?,
            },
            Err(e) => writeln!(out, "✗ {e}")?,
        },
        Command::Retry => {
            let before = room.transcript().len();
            match room.retry().await {
                Ok(_) => render_new_turns(room, before, out)?,
                Err(e) => writeln!(out, "✗ {e}")?,
            }
        }
        Command::Download => match room.download_csv() {
            Ok(Some(path)) => writeln!(out, "Transcript saved to {}", path.display())?,
            Ok(None) => writeln!(out, "Nothing to save yet.")?,
            Err(e) => writeln!(out, "✗ {e}")?,
        },
        Command::Logout => match room.export_and_logout().await {
            Ok(Logout::Empty) => writeln!(out, "Logged out. Nothing to save.")?,
            Ok(Logout::Exported(ExportReceipt::File(path))) => {
                writeln!(out, "Transcript saved to {}. Logged out.", path.display())?
            }
            Ok(Logout::Exported(ExportReceipt::Row(row))) => writeln!(
                out,
                "Session logged ({:.1} min, visit #{}). Logged out.",
                row.duration_minutes, row.usage_count
            )?,
            Err(e) => writeln!(out, "✗ {e}\n  Your session is still open; try /logout again or /download.")?,
        },
        Command::ForceLogout => match room.force_logout() {
            Ok(()) => writeln!(out, "Logged out without saving.")?,
            Err(e) => writeln!(out, "✗ {e}")?,
        },
        Command::Status => status(room, out)?,
        Command::Help => writeln!(out, "{HELP}")?,
        Command::Quit => return Ok(Flow::Quit),
        Command::Unknown(name) => writeln!(out, "Unknown command /{name}; try /help")?,
    }
    Ok(Flow::Continue)
}

async fn login<W: Write>(room: &mut CoachRoom, nickname: &str, out: &mut W) -> Result<(), AppError> {
    match room.login(nickname).await {
        Ok(advisories) => {
            writeln!(out, "Welcome, {}.", room.identifier().unwrap_or(nickname))?;
            show_advisories(room, &advisories, out)?;
        }
        Err(RoomError::EmptyIdentifier) => writeln!(out, "✗ Nickname cannot be empty.")?,
        Err(e) => writeln!(out, "✗ {e}")?,
    }
    Ok(())
}

async fn chat<W: Write>(room: &mut CoachRoom, text: &str, out: &mut W) -> Result<(), AppError> {
    let before = room.transcript().len();
    match room.submit(text).await {
        Ok(SubmitOutcome::Ignored) => {}
        Ok(SubmitOutcome::Replied(_)) => render_new_turns(room, before + 1, out)?,
        Err(e) => {
            writeln!(out, "✗ {e}")?;
            if room.engine().and_then(|engine| engine.pending()).is_some() {
                writeln!(out, "  Your message was kept; use /retry to resend it.")?;
            }
        }
    }
    Ok(())
}

/// Print advisories; when chat just became ready, show the welcome.
fn show_advisories<W: Write>(room: &CoachRoom, advisories: &[Advisory], out: &mut W) -> std::io::Result<()> {
    for a in advisories {
        writeln!(out, "  ! {a}")?;
    }
    if advisories.iter().any(|a| matches!(a, Advisory::ChatReady { .. })) {
        render_new_turns(room, 0, out)?;
    }
    Ok(())
}

/// Print assistant turns from `from` onward. User turns are already on
/// screen as typed input.
fn render_new_turns<W: Write>(room: &CoachRoom, from: usize, out: &mut W) -> std::io::Result<()> {
    for turn in room.transcript().iter().skip(from) {
        render_turn(turn, out)?;
    }
    Ok(())
}

fn render_turn<W: Write>(turn: &Turn, out: &mut W) -> std::io::Result<()> {
    match turn.role {
        Role::Assistant => writeln!(out, "coach> {}\n", turn.content),
        Role::User => Ok(()),
    }
}

fn change_note(change: Option<ConfigChange>) -> &'static str {
    match change {
        Some(ConfigChange::NextSession) => " (takes effect next session)",
        Some(ConfigChange::Reseeded) => " (conversation updated)",
        Some(ConfigChange::Applied) | None => "",
    }
}

fn status<W: Write>(room: &CoachRoom, out: &mut W) -> std::io::Result<()> {
    let prefs = room.preferences();
    writeln!(out, "User:      {}", room.identifier().unwrap_or("-"))?;
    writeln!(out, "Chat:      {}", if room.chat_enabled() { "enabled" } else { "disabled" })?;
    writeln!(out, "Model:     {}", room.selected_model().unwrap_or("-"))?;
    writeln!(out, "Grade:     {}", prefs.age_group)?;
    writeln!(out, "Language:  {}", prefs.language)?;
    if let Some(report) = room.knowledge_report() {
        writeln!(
            out,
            "Knowledge: {} of {} documents, {} characters",
            report.files_loaded,
            report.files_found,
            report.chars
        )?;
    }
    writeln!(out, "Turns:     {}", room.transcript().len())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::*;
    use crate::config::Config;
    use crate::knowledge::{DocumentReader, KnowledgeError, Pages};
    use crate::llm::providers::scripted::ScriptedProvider;
    use crate::llm::LlmProvider;

    struct OnePage;

    impl DocumentReader for OnePage {
        fn read_pages(&self, _: &std::path::Path) -> Result<Pages, KnowledgeError> {
            Ok(vec![Ok("Connect before Correct".into())])
        }
    }

    fn room(tmp: &TempDir, scripted: &ScriptedProvider) -> CoachRoom {
        let config = Config::test_default(tmp.path());
        std::fs::create_dir_all(&config.knowledge.dir).unwrap();
        std::fs::write(config.knowledge.dir.join("a.pdf"), b"x").unwrap();
        CoachRoom::new(config)
            .with_reader(Arc::new(OnePage))
            .with_provider(LlmProvider::Scripted(scripted.clone()))
    }

    async fn transcript_of(room: &mut CoachRoom, input: &str) -> String {
        let mut out = Vec::new();
        run_with(room, input.as_bytes(), &mut out, CancellationToken::new()).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn parses_commands() {
        assert_eq!(Command::parse("hello there"), Command::Text("hello there".into()));
        assert_eq!(Command::parse("/key  abc "), Command::Key("abc".into()));
        assert_eq!(Command::parse("/grade 國中"), Command::Grade("國中".into()));
        assert_eq!(Command::parse("/force-logout"), Command::ForceLogout);
        assert_eq!(Command::parse("/model"), Command::Model(String::new()));
        assert_eq!(Command::parse("/what"), Command::Unknown("what".into()));
    }

    #[tokio::test]
    async fn login_chat_and_logout() {
        let tmp = TempDir::new().unwrap();
        let scripted = ScriptedProvider::replies(["Tell me more."]);
        let mut room = room(&tmp, &scripted);
        let text = transcript_of(&mut room, "王老師\nHe keeps shouting\n/logout\n").await;
        assert!(text.contains("Welcome, 王老師."));
        assert!(text.contains("coach> 你好 王老師 老師"));
        assert!(text.contains("coach> Tell me more."));
        assert!(text.contains("Logged out."));
        assert!(tmp.path().join("exports/consultation_elementary_王老師.csv").exists());
    }

    #[tokio::test]
    async fn empty_nickname_shows_hint() {
        let tmp = TempDir::new().unwrap();
        let mut room = room(&tmp, &ScriptedProvider::default());
        let text = transcript_of(&mut room, "   \n").await;
        assert!(text.contains("Nickname cannot be empty"));
        assert!(room.identifier().is_none());
    }

    #[tokio::test]
    async fn failure_offers_retry() {
        let tmp = TempDir::new().unwrap();
        let scripted = ScriptedProvider::new(vec![Err("429 quota exceeded".into())]);
        let mut room = room(&tmp, &scripted);
        let text = transcript_of(&mut room, "001\nhelp me\n").await;
        assert!(text.contains("✗ 429 quota exceeded"));
        assert!(text.contains("/retry"));

        scripted.push(Ok("Let's look at it together.".into()));
        let text = transcript_of(&mut room, "/retry\n").await;
        assert!(text.contains("coach> Let's look at it together."));
        assert_eq!(room.transcript().len(), 3);
    }

    #[tokio::test]
    async fn quit_stops_before_remaining_input() {
        let tmp = TempDir::new().unwrap();
        let mut room = room(&tmp, &ScriptedProvider::default());
        transcript_of(&mut room, "/quit\n001\n").await;
        assert!(room.identifier().is_none());
    }

    #[tokio::test]
    async fn quit_with_unsaved_chat_asks_twice() {
        let tmp = TempDir::new().unwrap();
        let scripted = ScriptedProvider::replies(["Go on."]);
        let mut room = room(&tmp, &scripted);
        let text = transcript_of(&mut room, "001\nhi\n/quit\n/status\n").await;
        assert!(text.contains("has not been saved"));
        assert!(text.contains("/quit again"));
        assert!(text.contains("Turns:"));
        assert_eq!(room.identifier(), Some("001"));

        let text = transcript_of(&mut room, "/quit\n/quit\n/status\n").await;
        assert!(text.contains("/quit again"));
        assert!(!text.contains("Turns:"));
    }

    #[tokio::test]
    async fn quit_after_download_leaves_at_once() {
        let tmp = TempDir::new().unwrap();
        let scripted = ScriptedProvider::replies(["Go on."]);
        let mut room = room(&tmp, &scripted);
        let text = transcript_of(&mut room, "001\nhi\n/download\n/quit\n/status\n").await;
        assert!(text.contains("Transcript saved to"));
        assert!(!text.contains("has not been saved"));
        assert!(!text.contains("Turns:"));
    }

    #[tokio::test]
    async fn closed_input_reminds_about_unsaved_chat() {
        let tmp = TempDir::new().unwrap();
        let scripted = ScriptedProvider::replies(["Go on."]);
        let mut room = room(&tmp, &scripted);
        let text = transcript_of(&mut room, "001\nhi\n").await;
        assert!(text.contains("has not been saved"));
    }

    #[tokio::test]
    async fn cancelled_token_ends_loop() {
        let tmp = TempDir::new().unwrap();
        let mut room = room(&tmp, &ScriptedProvider::default());
        let token = CancellationToken::new();
        token.cancel();
        let mut out = Vec::new();
        run_with(&mut room, "001\n".as_bytes(), &mut out, token).await.unwrap();
        assert!(room.identifier().is_none());
    }
}
