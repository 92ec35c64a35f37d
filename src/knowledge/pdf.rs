//! PDF text extraction via `lopdf`.

use std::path::Path;

use lopdf::Document;

use super::{DocumentReader, KnowledgeError, Pages};

/// Extracts text page by page; a page that fails to decode is reported in
/// place and does not abort the document.
#[derive(Debug, Clone, Copy, Default)]
pub struct PdfReader;

impl DocumentReader for PdfReader {
    fn read_pages(&self, path: &Path) -> Result<Pages, KnowledgeError> {
        let doc = Document::load(path).map_err(|e| KnowledgeError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        // `get_pages` is keyed by 1-based page number, already in order.
        let pages = doc
            .get_pages()
            .into_keys()
            .map(|page_no| doc.extract_text(&[page_no]).map_err(|e| e.to_string()))
            .collect();
        Ok(pages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_is_read_error() {
        let err = PdfReader.read_pages(Path::new("/nonexistent/handbook.pdf")).unwrap_err();
        assert!(matches!(err, KnowledgeError::Read { .. }));
        assert!(err.to_string().contains("handbook.pdf"));
    }

    #[test]
    fn garbage_file_is_read_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("fake.pdf");
        std::fs::write(&path, b"this is not a pdf").unwrap();
        assert!(PdfReader.read_pages(&path).is_err());
    }
}
