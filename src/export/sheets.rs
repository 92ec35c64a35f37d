//! Remote append-row log.
//!
//! [`TabularLog`] is the collaborator contract: open a spreadsheet by name,
//! open or create a worksheet with a header row, read one column, append one
//! row. [`append_session`] builds the per-session log row on top of it.
//!
//! The usage count is read, incremented locally, then appended. Two processes
//! exporting the same identifier at once can both read the same count; the
//! count is best-effort.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local};
use tracing::{debug, info};

use super::{transcript_block, ExportError, TIME_FORMAT};
use crate::config::SheetsConfig;
use crate::session::{SessionMeta, Turn};

/// Header written when the worksheet is created.
pub const LOG_HEADER: [&str; 6] = [
    "login_time",
    "logout_time",
    "nickname",
    "duration_minutes",
    "usage_count",
    "transcript",
];

/// Zero-based column holding the identifier.
pub const IDENTIFIER_COLUMN: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpreadsheetRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorksheetRef {
    pub spreadsheet_id: String,
    pub title: String,
}

/// Row appended for one session.
#[derive(Debug, Clone, PartialEq)]
pub struct AppendedRow {
    pub duration_minutes: f64,
    pub usage_count: usize,
    pub values: Vec<String>,
}

// ── Collaborator ─────────────────────────────────────────────────────────────

/// Remote tabular log backends.
#[derive(Debug, Clone)]
pub enum TabularLog {
    Memory(MemoryLog),
    #[cfg(feature = "export-sheets")]
    Sheets(google::SheetsClient),
}

impl TabularLog {
    pub async fn open_spreadsheet(&self, name: &str) -> Result<SpreadsheetRef, ExportError> {
        match self {
            TabularLog::Memory(m) => m.open_spreadsheet(name),
            #[cfg(feature = "export-sheets")]
            TabularLog::Sheets(s) => s.open_spreadsheet(name).await,
        }
    }

    pub async fn open_or_create_worksheet(
        &self,
        spreadsheet: &SpreadsheetRef,
        name: &str,
        header: &[&str],
    ) -> Result<WorksheetRef, ExportError> {
        match self {
            TabularLog::Memory(m) => m.open_or_create_worksheet(spreadsheet, name, header),
            #[cfg(feature = "export-sheets")]
            TabularLog::Sheets(s) => s.open_or_create_worksheet(spreadsheet, name, header).await,
        }
    }

    pub async fn read_column(&self, worksheet: &WorksheetRef, index: usize) -> Result<Vec<String>, ExportError> {
        match self {
            TabularLog::Memory(m) => m.read_column(worksheet, index),
            #[cfg(feature = "export-sheets")]
            TabularLog::Sheets(s) => s.read_column(worksheet, index).await,
        }
    }

    pub async fn append_row(&self, worksheet: &WorksheetRef, values: &[String]) -> Result<(), ExportError> {
        match self {
            TabularLog::Memory(m) => m.append_row(worksheet, values),
            #[cfg(feature = "export-sheets")]
            TabularLog::Sheets(s) => s.append_row(worksheet, values).await,
        }
    }
}

/// Build the configured remote log. Needs an access token.
pub fn connect(config: &SheetsConfig, access_token: Option<&str>) -> Result<TabularLog, ExportError> {
    #[cfg(feature = "export-sheets")]
    {
        let token = access_token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ExportError::Unavailable("SHEETS_ACCESS_TOKEN is not set".into()))?;
        let client = google::SheetsClient::new(
            &config.sheets_api_base_url,
            &config.drive_api_base_url,
            config.timeout_seconds,
            token.to_string(),
        )?;
        Ok(TabularLog::Sheets(client))
    }
    #[cfg(not(feature = "export-sheets"))]
    {
        let _ = (config, access_token);
        Err(ExportError::Unavailable("built without the export-sheets feature".into()))
    }
}

/// Append one row describing the session:
/// `(login, logout, identifier, duration_minutes, usage_count, transcript)`.
pub async fn append_session(
    log: &TabularLog,
    spreadsheet: &str,
    worksheet: &str,
    transcript: &[Turn],
    meta: &SessionMeta,
    logout_at: DateTime<Local>,
) -> Result<AppendedRow, ExportError> {
    let ss = log.open_spreadsheet(spreadsheet).await?;
    let ws = log.open_or_create_worksheet(&ss, worksheet, &LOG_HEADER).await?;

    let column = log.read_column(&ws, IDENTIFIER_COLUMN).await?;
    let previous = column
        .iter()
        .enumerate()
        .filter(|(i, v)| !(*i == 0 && v.as_str() == LOG_HEADER[IDENTIFIER_COLUMN]))
        .filter(|(_, v)| v.as_str() == meta.identifier)
        .count();
    let usage_count = previous + 1;

    let duration_minutes = duration_minutes(meta.started_at, logout_at);
    let values = vec![
        meta.started_at.format(TIME_FORMAT).to_string(),
        logout_at.format(TIME_FORMAT).to_string(),
        meta.identifier.clone(),
        format!("{duration_minutes:.1}"),
        usage_count.to_string(),
        transcript_block(transcript, meta),
    ];
    log.append_row(&ws, &values).await?;

    info!(
        identifier = %meta.identifier,
        worksheet = %ws.title,
        usage_count,
        duration_minutes,
        "session appended to remote log"
    );
    Ok(AppendedRow { duration_minutes, usage_count, values })
}

/// Minutes between login and logout, rounded to one decimal place, never
/// negative.
pub fn duration_minutes(login: DateTime<Local>, logout: DateTime<Local>) -> f64 {
    let secs = (logout - login).num_seconds().max(0) as f64;
    (secs / 60.0 * 10.0).round() / 10.0
}

// ── In-memory backend ────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct MemoryState {
    /// spreadsheet name -> worksheet title -> rows
    books: HashMap<String, HashMap<String, Vec<Vec<String>>>>,
    calls: usize,
    fail_with: Option<String>,
}

/// Process-local log. Spreadsheets must be registered up front, mirroring a
/// remote service where the spreadsheet is provisioned by hand. Clones share
/// state.
#[derive(Debug, Clone, Default)]
pub struct MemoryLog {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_spreadsheet(self, name: &str) -> Self {
        if let Ok(mut s) = self.state.lock() {
            s.books.entry(name.to_string()).or_default();
        }
        self
    }

    /// Make every subsequent call fail with `reason` (`None` to recover).
    pub fn set_failure(&self, reason: Option<&str>) {
        if let Ok(mut s) = self.state.lock() {
            s.fail_with = reason.map(str::to_string);
        }
    }

    /// Number of collaborator calls made so far.
    pub fn calls(&self) -> usize {
        self.state.lock().map(|s| s.calls).unwrap_or_default()
    }

    pub fn rows(&self, spreadsheet: &str, worksheet: &str) -> Vec<Vec<String>> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.books.get(spreadsheet).and_then(|b| b.get(worksheet)).cloned())
            .unwrap_or_default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> Result<T, ExportError>) -> Result<T, ExportError> {
        let mut s = self
            .state
            .lock()
            .map_err(|_| ExportError::Remote("memory log lock poisoned".into()))?;
        s.calls += 1;
        if let Some(reason) = &s.fail_with {
            return Err(ExportError::Remote(reason.clone()));
        }
        f(&mut *s)
    }

    fn open_spreadsheet(&self, name: &str) -> Result<SpreadsheetRef, ExportError> {
        self.with_state(|s| {
            if s.books.contains_key(name) {
                Ok(SpreadsheetRef { id: name.to_string(), name: name.to_string() })
            } else {
                Err(ExportError::Unavailable(format!("spreadsheet '{name}' not found")))
            }
        })
    }

    fn open_or_create_worksheet(
        &self,
        spreadsheet: &SpreadsheetRef,
        name: &str,
        header: &[&str],
    ) -> Result<WorksheetRef, ExportError> {
        self.with_state(|s| {
            let book = s
                .books
                .get_mut(&spreadsheet.id)
                .ok_or_else(|| ExportError::Unavailable(format!("spreadsheet '{}' not found", spreadsheet.name)))?;
            book.entry(name.to_string())
                .or_insert_with(|| vec![header.iter().map(|h| h.to_string()).collect()]);
            Ok(WorksheetRef { spreadsheet_id: spreadsheet.id.clone(), title: name.to_string() })
        })
    }

    fn sheet<'a>(s: &'a mut MemoryState, ws: &WorksheetRef) -> Result<&'a mut Vec<Vec<String>>, ExportError> {
        s.books
            .get_mut(&ws.spreadsheet_id)
            .and_then(|b| b.get_mut(&ws.title))
            .ok_or_else(|| ExportError::Remote(format!("worksheet '{}' not found", ws.title)))
    }

    fn read_column(&self, ws: &WorksheetRef, index: usize) -> Result<Vec<String>, ExportError> {
        self.with_state(|s| {
            let rows = Self::sheet(s, ws)?;
            Ok(rows.iter().map(|r| r.get(index).cloned().unwrap_or_default()).collect())
        })
    }

    fn append_row(&self, ws: &WorksheetRef, values: &[String]) -> Result<(), ExportError> {
        self.with_state(|s| {
            Self::sheet(s, ws)?.push(values.to_vec());
            debug!(worksheet = %ws.title, "row appended to memory log");
            Ok(())
        })
    }
}

// ── Google Sheets backend ────────────────────────────────────────────────────

#[cfg(feature = "export-sheets")]
pub mod google {
    //! Google Sheets v4 + Drive v3 REST client.
    //!
    //! Spreadsheets are looked up by name through Drive. Requests carry a
    //! bearer access token obtained outside this process (`SHEETS_ACCESS_TOKEN`).

    use std::time::Duration;

    use reqwest::{Client, Url};
    use serde::Deserialize;
    use serde_json::json;
    use tracing::{debug, error};

    use super::{SpreadsheetRef, WorksheetRef};
    use crate::export::ExportError;

    const SPREADSHEET_MIME: &str = "application/vnd.google-apps.spreadsheet";

    #[derive(Debug, Clone)]
    pub struct SheetsClient {
        client: Client,
        sheets_api_base_url: String,
        drive_api_base_url: String,
        access_token: String,
    }

    impl SheetsClient {
        pub fn new(
            sheets_api_base_url: &str,
            drive_api_base_url: &str,
            timeout_seconds: u64,
            access_token: String,
        ) -> Result<Self, ExportError> {
            let client = Client::builder()
                .timeout(Duration::from_secs(timeout_seconds))
                .build()
                .map_err(|e| ExportError::Remote(format!("failed to build HTTP client: {e}")))?;
            Ok(Self {
                client,
                sheets_api_base_url: sheets_api_base_url.trim_end_matches('/').to_string(),
                drive_api_base_url: drive_api_base_url.trim_end_matches('/').to_string(),
                access_token,
            })
        }

        pub async fn open_spreadsheet(&self, name: &str) -> Result<SpreadsheetRef, ExportError> {
            let query = format!(
                "name = '{}' and mimeType = '{SPREADSHEET_MIME}' and trashed = false",
                escape_query(name)
            );
            let req = self
                .client
                .get(format!("{}/files", self.drive_api_base_url))
                .query(&[("q", query.as_str()), ("fields", "files(id,name)"), ("pageSize", "1")]);
            let list: FileList = self.send_json(req).await?;
            let file = list
                .files
                .into_iter()
                .next()
                .ok_or_else(|| ExportError::Unavailable(format!("spreadsheet '{name}' not found")))?;
            debug!(%name, id = %file.id, "spreadsheet resolved");
            Ok(SpreadsheetRef { id: file.id, name: file.name })
        }

        pub async fn open_or_create_worksheet(
            &self,
            spreadsheet: &SpreadsheetRef,
            name: &str,
            header: &[&str],
        ) -> Result<WorksheetRef, ExportError> {
            let ws = WorksheetRef { spreadsheet_id: spreadsheet.id.clone(), title: name.to_string() };

            let req = self
                .client
                .get(format!("{}/spreadsheets/{}", self.sheets_api_base_url, spreadsheet.id))
                .query(&[("fields", "sheets.properties.title")]);
            let meta: SpreadsheetMeta = self.send_json(req).await?;
            if meta.sheets.iter().any(|s| s.properties.title == name) {
                return Ok(ws);
            }

            let body = json!({ "requests": [{ "addSheet": { "properties": { "title": name } } }] });
            let req = self
                .client
                .post(format!("{}/spreadsheets/{}:batchUpdate", self.sheets_api_base_url, spreadsheet.id))
                .json(&body);
            let _: serde_json::Value = self.send_json(req).await?;
            debug!(worksheet = %name, "worksheet created");

            let header: Vec<String> = header.iter().map(|h| h.to_string()).collect();
            self.append_row(&ws, &header).await?;
            Ok(ws)
        }

        pub async fn read_column(&self, ws: &WorksheetRef, index: usize) -> Result<Vec<String>, ExportError> {
            let letter = column_letter(index);
            let url = self.values_url(ws, &format!("{}!{letter}:{letter}", quote_title(&ws.title)))?;
            let req = self.client.get(url).query(&[("majorDimension", "COLUMNS")]);
            let range: ValueRange = self.send_json(req).await?;
            Ok(range.values.into_iter().next().unwrap_or_default())
        }

        pub async fn append_row(&self, ws: &WorksheetRef, values: &[String]) -> Result<(), ExportError> {
            let url = self.values_url(ws, &format!("{}!A1:append", quote_title(&ws.title)))?;
            let req = self
                .client
                .post(url)
                .query(&[("valueInputOption", "RAW"), ("insertDataOption", "INSERT_ROWS")])
                .json(&json!({ "values": [values] }));
            let _: serde_json::Value = self.send_json(req).await?;
            Ok(())
        }

        /// `{base}/spreadsheets/{id}/values/{range}` with `range` encoded as
        /// one path segment.
        fn values_url(&self, ws: &WorksheetRef, range: &str) -> Result<Url, ExportError> {
            let mut url = Url::parse(&format!(
                "{}/spreadsheets/{}/values",
                self.sheets_api_base_url, ws.spreadsheet_id
            ))
            .map_err(|e| ExportError::Remote(format!("invalid sheets URL: {e}")))?;
            url.path_segments_mut()
                .map_err(|_| ExportError::Remote("sheets URL cannot be a base".into()))?
                .push(range);
            Ok(url)
        }

        async fn send_json<T: for<'de> Deserialize<'de>>(
            &self,
            req: reqwest::RequestBuilder,
        ) -> Result<T, ExportError> {
            let response = req
                .bearer_auth(&self.access_token)
                .send()
                .await
                .map_err(|e| {
                    error!(error = %e, "sheets HTTP request failed (transport)");
                    ExportError::Remote(e.to_string())
                })?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                let message = serde_json::from_str::<ErrorEnvelope>(&body)
                    .map(|env| env.error.message)
                    .unwrap_or(body);
                error!(%status, %message, "sheets request returned HTTP error");
                return Err(ExportError::Remote(format!("HTTP {status}: {message}")));
            }
            response
                .json::<T>()
                .await
                .map_err(|e| ExportError::Remote(format!("failed to parse response body: {e}")))
        }
    }

    /// A1 column letters: 0 → A, 25 → Z, 26 → AA.
    pub fn column_letter(index: usize) -> String {
        let mut n = index + 1;
        let mut letters = Vec::new();
        while n > 0 {
            let rem = (n - 1) % 26;
            letters.push(b'A' + rem as u8);
            n = (n - 1) / 26;
        }
        letters.reverse();
        String::from_utf8(letters).unwrap_or_default()
    }

    /// Sheet titles are single-quoted in A1 ranges; embedded quotes double.
    pub fn quote_title(title: &str) -> String {
        format!("'{}'", title.replace('\'', "''"))
    }

    /// Drive query string literal escaping.
    pub fn escape_query(value: &str) -> String {
        value.replace('\\', "\\\\").replace('\'', "\\'")
    }

    #[derive(Debug, Deserialize)]
    struct FileList {
        #[serde(default)]
        files: Vec<DriveFile>,
    }

    #[derive(Debug, Deserialize)]
    struct DriveFile {
        id: String,
        #[serde(default)]
        name: String,
    }

    #[derive(Debug, Deserialize)]
    struct SpreadsheetMeta {
        #[serde(default)]
        sheets: Vec<Sheet>,
    }

    #[derive(Debug, Deserialize)]
    struct Sheet {
        properties: SheetProperties,
    }

    #[derive(Debug, Deserialize)]
    struct SheetProperties {
        title: String,
    }

    #[derive(Debug, Deserialize)]
    struct ValueRange {
        #[serde(default)]
        values: Vec<Vec<String>>,
    }

    #[derive(Debug, Deserialize)]
    struct ErrorEnvelope {
        error: ErrorBody,
    }

    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        message: String,
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn column_letters() {
            assert_eq!(column_letter(0), "A");
            assert_eq!(column_letter(2), "C");
            assert_eq!(column_letter(25), "Z");
            assert_eq!(column_letter(26), "AA");
            assert_eq!(column_letter(27), "AB");
        }

        #[test]
        fn titles_and_queries_are_escaped() {
            assert_eq!(quote_title("Teacher's log"), "'Teacher''s log'");
            assert_eq!(escape_query("O'Brien"), "O\\'Brien");
        }

        #[test]
        fn values_url_encodes_range_as_one_segment() {
            let client = SheetsClient::new("https://sheets.example/v4", "https://drive.example/v3", 1, "t".into()).unwrap();
            let ws = WorksheetRef { spreadsheet_id: "abc".into(), title: "2024 log/1".into() };
            let url = client.values_url(&ws, &format!("{}!C:C", quote_title(&ws.title))).unwrap();
            assert!(url.as_str().starts_with("https://sheets.example/v4/spreadsheets/abc/values/"));
            assert!(!url.path().ends_with("/1'!C:C"));
            assert!(url.path().contains("%2F"));
        }
    }
}
