//! Transcript export: local CSV download and the remote append-row log.
//!
//! Both sinks are pure functions of `(transcript, meta)` plus the sink
//! itself; nothing here touches session state.

pub mod sheets;

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::session::{Role, SessionMeta, Turn};

pub use sheets::{AppendedRow, MemoryLog, TabularLog};

/// UTF-8 byte-order mark; spreadsheet apps use it to detect the encoding.
pub const BOM: &[u8] = b"\xEF\xBB\xBF";

pub const CSV_HEADER: [&str; 6] = ["role", "content", "nickname", "grade", "language", "started_at"];

pub(crate) const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("cannot write {path}: {reason}")]
    Write { path: String, reason: String },
    #[error("remote log: {0}")]
    Remote(String),
    #[error("remote log unavailable: {0}")]
    Unavailable(String),
}

/// One parsed row of an exported CSV.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExportRow {
    pub role: Role,
    pub content: String,
    pub nickname: String,
    pub grade: String,
    pub language: String,
    pub started_at: String,
}

/// Encode the transcript as CSV (with BOM), one row per turn, session
/// metadata repeated on every row.
pub fn to_csv(transcript: &[Turn], meta: &SessionMeta) -> Result<Vec<u8>, ExportError> {
    let started = meta.started_at.format(TIME_FORMAT).to_string();
    let mut writer = csv::Writer::from_writer(BOM.to_vec());
    writer
        .write_record(CSV_HEADER)
        .map_err(|e| ExportError::Encode(e.to_string()))?;
    for turn in transcript {
        writer
            .write_record([
                turn.role.as_str(),
                turn.content.as_str(),
                meta.identifier.as_str(),
                meta.config.age_group.label(),
                meta.config.language.label(),
                started.as_str(),
            ])
            .map_err(|e| ExportError::Encode(e.to_string()))?;
    }
    writer.into_inner().map_err(|e| ExportError::Encode(e.to_string()))
}

/// Parse bytes produced by [`to_csv`]. A leading BOM is optional.
pub fn parse_csv(bytes: &[u8]) -> Result<Vec<ExportRow>, ExportError> {
    let body = bytes.strip_prefix(BOM).unwrap_or(bytes);
    csv::Reader::from_reader(body)
        .deserialize::<ExportRow>()
        .map(|row| row.map_err(|e| ExportError::Decode(e.to_string())))
        .collect()
}

/// Download file name: `consultation_{grade}_{identifier}.csv`.
pub fn file_name(meta: &SessionMeta) -> String {
    let identifier: String = meta
        .identifier
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() || c.is_whitespace() => '_',
            c => c,
        })
        .collect();
    format!("consultation_{}_{}.csv", meta.config.age_group.key(), identifier)
}

/// Write the CSV into `dir` (created if needed) and return the file path.
pub fn write_local(dir: &Path, transcript: &[Turn], meta: &SessionMeta) -> Result<PathBuf, ExportError> {
    let bytes = to_csv(transcript, meta)?;
    let write_err = |path: &Path, e: std::io::Error| ExportError::Write {
        path: path.display().to_string(),
        reason: e.to_string(),
    };
    fs::create_dir_all(dir).map_err(|e| write_err(dir, e))?;
    let path = dir.join(file_name(meta));
    fs::write(&path, bytes).map_err(|e| write_err(&path, e))?;
    info!(path = %path.display(), turns = transcript.len(), "transcript written");
    Ok(path)
}

/// Transcript as one text block: a `[grade / language]` line, then one
/// `role: content` line per turn.
pub fn transcript_block(transcript: &[Turn], meta: &SessionMeta) -> String {
    let mut lines = Vec::with_capacity(transcript.len() + 1);
    lines.push(format!("[{} / {}]", meta.config.age_group.label(), meta.config.language.label()));
    lines.extend(transcript.iter().map(|t| format!("{}: {}", t.role, t.content)));
    lines.join("\n")
}

// ── Sink ──────────────────────────────────────────────────────────────────────

/// Where export-and-logout sends the transcript.
#[derive(Debug, Clone)]
pub enum ExportSink {
    LocalFile { dir: PathBuf },
    Remote { log: TabularLog, spreadsheet: String, worksheet: String },
}

/// What a successful export produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ExportReceipt {
    File(PathBuf),
    Row(AppendedRow),
}

impl ExportSink {
    pub async fn export(
        &self,
        transcript: &[Turn],
        meta: &SessionMeta,
        logout_at: DateTime<Local>,
    ) -> Result<ExportReceipt, ExportError> {
        match self {
            ExportSink::LocalFile { dir } => write_local(dir, transcript, meta).map(ExportReceipt::File),
            ExportSink::Remote { log, spreadsheet, worksheet } => {
                sheets::append_session(log, spreadsheet, worksheet, transcript, meta, logout_at)
                    .await
                    .map(ExportReceipt::Row)
            }
        }
    }
}
