// SPDX-License-Identifier: MIT OR Apache-2.0
//! Encoding detection and HTML section extraction.
//!
//! The parser stage decodes raw fetched bytes (charset parameter first,
//! statistical detection second, lossy UTF-8 last) and splits the document
//! into heading-delimited sections. A document with extractable text but no
//! headings yields a single section titled "Content".

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Byte-to-text decoding.
pub mod encoding;
/// Section extraction from HTML.
pub mod html;

use rdp_core::canonical;
use serde::{Deserialize, Serialize};

/// Errors from decoding or extraction.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// The document produced no extractable text at all.
    #[error("no extractable content in document from {source_url}")]
    EmptyContent {
        /// URL of the offending document.
        source_url: String,
    },
}

/// One heading-delimited slice of a parsed document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParsedSection {
    /// 1-based position within the document.
    pub id: u32,
    /// Heading depth, 1–4.
    pub level: u8,
    /// Heading text ("Content" for the headingless fallback).
    pub heading: String,
    /// Body text up to the next heading.
    pub text: String,
    /// sha256 of [`text`](Self::text), hex-encoded.
    pub sha256: String,
    /// Byte offset of the heading within the extracted text.
    pub byte_offset_start: usize,
    /// Byte offset of the end of the section within the extracted text.
    pub byte_offset_end: usize,
    /// Structured tables, when the source carried any.
    #[serde(default)]
    pub tables: Vec<serde_json::Value>,
    /// Language tag of the section.
    pub language: String,
}

/// A fully parsed snapshot of one document.
///
/// Deliberately excludes fetch timestamps: the content hash over this value
/// must be identical across re-crawls of identical bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParsedDocument {
    /// URL the document was crawled from.
    pub source_url: String,
    /// Publication date extracted from the page, when present.
    pub published_date: Option<String>,
    /// Detected or defaulted language tag.
    pub language: String,
    /// Heading-delimited sections, in document order.
    pub sections: Vec<ParsedSection>,
}

impl ParsedDocument {
    /// The canonical JSON value of this document.
    ///
    /// Infallible in practice: the document contains no non-string map keys
    /// or non-finite numbers.
    #[must_use]
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// sha256 over the canonical JSON form.
    #[must_use]
    pub fn content_hash(&self) -> String {
        canonical::content_hash(&self.to_value())
    }
}

/// Decode raw bytes and extract a [`ParsedDocument`].
///
/// # Errors
///
/// Returns [`ParseError::EmptyContent`] when no text can be extracted.
pub fn parse_document(
    bytes: &[u8],
    content_type: Option<&str>,
    source_url: &str,
) -> Result<(ParsedDocument, encoding::DetectedEncoding), ParseError> {
    let (text, detected) = encoding::decode(bytes, content_type);
    let document = html::parse_html_document(&text, source_url)?;
    Ok((document, detected))
}
