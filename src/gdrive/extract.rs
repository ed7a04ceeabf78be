//! Text extraction from exported Drive artifacts: PDF plain text and OpenXML
//! structure for word-processing documents.

use crate::error::{ProviderError, Result};
use std::io::Read;

/// Decompressed bytes read from one ZIP entry are capped (zip-bomb guard).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Plain text from PDF bytes.
pub fn pdf_text(bytes: &[u8]) -> Result<String> {
    pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| ProviderError::ExtractionFailed(format!("pdf: {e}")).into())
}

/// OpenXML payload of a word-processing document: the raw
/// `word/document.xml` plus paragraph-preserving plain text.
pub struct OpenXmlDocument {
    pub document_xml: String,
    pub plain_text: String,
}

/// Extract `word/document.xml` from DOCX bytes.
pub fn docx_openxml(bytes: &[u8]) -> Result<OpenXmlDocument> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| ProviderError::ExtractionFailed(format!("ooxml: {e}")))?;

    let mut xml = Vec::new();
    {
        let entry = archive
            .by_name("word/document.xml")
            .map_err(|e| ProviderError::ExtractionFailed(format!("ooxml: {e}")))?;
        entry
            .take(MAX_XML_ENTRY_BYTES)
            .read_to_end(&mut xml)
            .map_err(|e| ProviderError::ExtractionFailed(format!("ooxml: {e}")))?;
        if xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
            return Err(
                ProviderError::ExtractionFailed("word/document.xml exceeds size limit".into())
                    .into(),
            );
        }
    }

    let plain_text = paragraph_text(&xml)?;
    let document_xml = String::from_utf8_lossy(&xml).into_owned();
    Ok(OpenXmlDocument {
        document_xml,
        plain_text,
    })
}

/// Walk `w:t` runs, emitting a paragraph break at each `w:p` end.
fn paragraph_text(xml: &[u8]) -> Result<String> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);

    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_text = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_text = true;
                }
            }
            Ok(quick_xml::events::Event::Text(e)) => {
                if in_text {
                    current.push_str(e.unescape().unwrap_or_default().as_ref());
                }
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let trimmed = current.trim();
                    if !trimmed.is_empty() {
                        paragraphs.push(trimmed.to_string());
                    }
                    current.clear();
                }
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => {
                return Err(ProviderError::ExtractionFailed(format!("ooxml: {e}")).into());
            }
            _ => {}
        }
        buf.clear();
    }

    let trimmed = current.trim();
    if !trimmed.is_empty() {
        paragraphs.push(trimmed.to_string());
    }
    Ok(paragraphs.join("\n\n"))
}
