use crate::error::ExtractionError;
use crate::models::DocumentKind;
use crate::traits::TextExtractor;
use lopdf::Document;

const UTF8_BOM: &str = "\u{feff}";

/// Plain-text and PDF extraction. PDF pages become blank-line separated blocks.
#[derive(Debug, Default, Clone, Copy)]
pub struct DocumentExtractor;

impl DocumentExtractor {
    fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractionError> {
        let document = Document::load_mem(bytes)
            .map_err(|error| ExtractionError::with_source(DocumentKind::Pdf, error))?;

        let mut pages = Vec::new();
        for page_no in document.get_pages().into_keys() {
            let text = document
                .extract_text(&[page_no])
                .map_err(|error| ExtractionError::with_source(DocumentKind::Pdf, error))?;
            let text = text.trim();
            if !text.is_empty() {
                pages.push(text.to_string());
            }
        }

        if pages.is_empty() {
            return Err(ExtractionError::new(
                DocumentKind::Pdf,
                "pdf had no readable page text",
            ));
        }
        Ok(pages.join("\n\n"))
    }

    fn extract_plain(bytes: &[u8]) -> String {
        let text = match std::str::from_utf8(bytes) {
            Ok(text) => text.to_string(),
            // Latin-1 maps every byte to the code point of the same value.
            Err(_) => bytes.iter().map(|byte| char::from(*byte)).collect(),
        };
        match text.strip_prefix(UTF8_BOM) {
            Some(stripped) => stripped.to_string(),
            None => text,
        }
    }
}

impl TextExtractor for DocumentExtractor {
    fn extract_text(&self, bytes: &[u8], kind: DocumentKind) -> Result<String, ExtractionError> {
        match kind {
            DocumentKind::Pdf => Self::extract_pdf(bytes),
            DocumentKind::Text => Ok(Self::extract_plain(bytes)),
        }
    }
}
