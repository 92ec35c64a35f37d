//! Knowledge base: reference documents flattened into prompt context.
//!
//! Sources are a fixed file list or a directory scan for one extension.
//! Each file is read page by page through a [`DocumentReader`]; failed
//! pages and failed files are reported and skipped, never fatal.
//!
//! [`KnowledgeBase`] runs the load at most once per process and caches the
//! text, including an empty result.

pub mod pdf;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use thiserror::Error;
use tracing::{debug, info, warn};

pub use pdf::PdfReader;

#[derive(Debug, Error)]
pub enum KnowledgeError {
    #[error("cannot read {path}: {reason}")]
    Read { path: String, reason: String },
    #[error("cannot scan {dir}: {reason}")]
    Scan { dir: String, reason: String },
}

/// Ordered page texts for one document; each page may fail independently.
pub type Pages = Vec<Result<String, String>>;

/// Document source collaborator.
pub trait DocumentReader: Send + Sync {
    fn read_pages(&self, path: &Path) -> Result<Pages, KnowledgeError>;
}

/// Where documents come from.
#[derive(Debug, Clone)]
pub enum Sources {
    /// Explicit paths, loaded in the given order.
    Files(Vec<PathBuf>),
    /// Every file in `dir` whose extension matches (case-insensitive),
    /// loaded in path order.
    Scan { dir: PathBuf, extension: String },
}

impl Sources {
    /// Resolve to a concrete, ordered path list.
    pub fn resolve(&self) -> Result<Vec<PathBuf>, KnowledgeError> {
        match self {
            Sources::Files(files) => Ok(files.clone()),
            Sources::Scan { dir, extension } => scan_dir(dir, extension),
        }
    }
}

fn scan_dir(dir: &Path, extension: &str) -> Result<Vec<PathBuf>, KnowledgeError> {
    let entries = fs::read_dir(dir).map_err(|e| KnowledgeError::Scan {
        dir: dir.display().to_string(),
        reason: e.to_string(),
    })?;
    let mut found: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .filter(|p| {
            p.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case(extension))
        })
        .collect();
    found.sort();
    Ok(found)
}

/// What a load found, for advisories and `/status`. The text itself is
/// returned alongside.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    /// Characters in the loaded text.
    pub chars: usize,
    pub files_found: usize,
    pub files_loaded: usize,
    /// `(path, reason)` for each file that could not be read.
    pub failures: Vec<(String, String)>,
}

impl LoadReport {
    pub fn no_sources(&self) -> bool {
        self.files_found == 0
    }
}

/// Read every source and concatenate page texts.
///
/// Each non-empty page contributes its text followed by `\n`; files are
/// concatenated in source order.
pub fn load(sources: &Sources, reader: &dyn DocumentReader) -> (String, LoadReport) {
    let paths = match sources.resolve() {
        Ok(paths) => paths,
        Err(e) => {
            warn!(error = %e, "knowledge sources unavailable");
            Vec::new()
        }
    };

    let mut text = String::new();
    let mut report = LoadReport { files_found: paths.len(), ..LoadReport::default() };
    if paths.is_empty() {
        warn!("no knowledge documents found, coaching runs without background knowledge");
        return (text, report);
    }

    for path in &paths {
        let pages = match reader.read_pages(path) {
            Ok(pages) => pages,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "failed to read knowledge document");
                report.failures.push((path.display().to_string(), e.to_string()));
                continue;
            }
        };

        let mut chars = 0usize;
        for (idx, page) in pages.into_iter().enumerate() {
            match page {
                Ok(page) if page.is_empty() => {}
                Ok(page) => {
                    chars += page.chars().count();
                    text.push_str(&page);
                    text.push('\n');
                }
                Err(reason) => {
                    warn!(file = %path.display(), page = idx + 1, %reason, "page extraction failed");
                }
            }
        }
        debug!(file = %path.display(), chars, "knowledge document loaded");
        report.files_loaded += 1;
    }

    report.chars = text.chars().count();
    info!(
        files_found = report.files_found,
        files_loaded = report.files_loaded,
        chars = report.chars,
        "knowledge base loaded"
    );
    (text, report)
}

/// Process-lifetime cache around [`load`].
#[derive(Debug, Default)]
pub struct KnowledgeBase {
    cell: OnceLock<(Arc<str>, LoadReport)>,
}

impl KnowledgeBase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load on first call; later calls return the cached result untouched.
    pub fn get_or_load(&self, sources: &Sources, reader: &dyn DocumentReader) -> (Arc<str>, &LoadReport) {
        let (text, report) = self.cell.get_or_init(|| {
            let (text, report) = load(sources, reader);
            (Arc::from(text), report)
        });
        (Arc::clone(text), report)
    }

    /// Cached text, if a load has been attempted.
    pub fn text(&self) -> Option<Arc<str>> {
        self.cell.get().map(|(text, _)| Arc::clone(text))
    }

    pub fn report(&self) -> Option<&LoadReport> {
        self.cell.get().map(|(_, report)| report)
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.get().is_some()
    }
}
