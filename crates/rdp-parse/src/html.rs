// SPDX-License-Identifier: MIT OR Apache-2.0
//! Section extraction from HTML.
//!
//! Sections are delimited by h1–h4 headings; the body of a section is the
//! text of the heading's following siblings up to the next heading. Nested
//! layouts where headings live in separate containers degrade to the
//! headingless fallback, a single section titled "Content".

use crate::{ParseError, ParsedDocument, ParsedSection};
use rdp_core::canonical;
use scraper::{ElementRef, Html, Selector};
use std::sync::OnceLock;
use tracing::debug;

fn selector(css: &'static str, cell: &'static OnceLock<Selector>) -> &'static Selector {
    cell.get_or_init(|| Selector::parse(css).expect("static selector"))
}

fn heading_selector() -> &'static Selector {
    static CELL: OnceLock<Selector> = OnceLock::new();
    selector("h1, h2, h3, h4", &CELL)
}

const SKIPPED_ELEMENTS: [&str; 6] = ["script", "style", "noscript", "template", "head", "title"];

/// Parse decoded HTML into a [`ParsedDocument`].
///
/// # Errors
///
/// Returns [`ParseError::EmptyContent`] when no text can be extracted.
pub fn parse_html_document(html: &str, source_url: &str) -> Result<ParsedDocument, ParseError> {
    let document = Html::parse_document(html);
    let extracted = extract_text(&document);
    let sections = extract_sections(&document, &extracted);

    if sections.is_empty() && extracted.trim().is_empty() {
        return Err(ParseError::EmptyContent {
            source_url: source_url.to_string(),
        });
    }

    let sections = if sections.is_empty() {
        // Text but no headings: one synthetic section over the whole body.
        vec![ParsedSection {
            id: 1,
            level: 1,
            heading: "Content".to_string(),
            sha256: canonical::sha256_hex(extracted.as_bytes()),
            byte_offset_start: 0,
            byte_offset_end: extracted.len(),
            text: extracted.clone(),
            tables: Vec::new(),
            language: "en".to_string(),
        }]
    } else {
        sections
    };

    debug!(
        target: "rdp.parse",
        source_url,
        sections = sections.len(),
        "extracted sections"
    );

    Ok(ParsedDocument {
        source_url: source_url.to_string(),
        published_date: published_date(&document),
        language: page_language(&document),
        sections,
    })
}

/// Concatenated text of the page, skipping non-content elements.
#[must_use]
pub fn extract_text(document: &Html) -> String {
    let mut parts: Vec<&str> = Vec::new();
    collect_text(document.root_element(), &mut parts);
    parts.join("\n")
}

fn collect_text<'a>(element: ElementRef<'a>, parts: &mut Vec<&'a str>) {
    if SKIPPED_ELEMENTS.contains(&element.value().name()) {
        return;
    }
    for child in element.children() {
        if let Some(text) = child.value().as_text() {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                parts.push(trimmed);
            }
        } else if let Some(child_el) = ElementRef::wrap(child) {
            collect_text(child_el, parts);
        }
    }
}

fn heading_level(name: &str) -> Option<u8> {
    match name {
        "h1" => Some(1),
        "h2" => Some(2),
        "h3" => Some(3),
        "h4" => Some(4),
        _ => None,
    }
}

fn extract_sections(document: &Html, extracted: &str) -> Vec<ParsedSection> {
    let mut sections = Vec::new();
    let mut next_id: u32 = 1;

    for heading in document.select(heading_selector()) {
        let Some(level) = heading_level(heading.value().name()) else {
            continue;
        };
        let heading_text = element_text(heading);
        if heading_text.is_empty() {
            continue;
        }

        let mut parts: Vec<String> = Vec::new();
        for sibling in heading.next_siblings() {
            if let Some(sibling_el) = ElementRef::wrap(sibling) {
                let name = sibling_el.value().name();
                if heading_level(name).is_some() {
                    break;
                }
                if SKIPPED_ELEMENTS.contains(&name) || name == "meta" {
                    continue;
                }
                let text = element_text(sibling_el);
                if !text.is_empty() {
                    parts.push(text);
                }
            } else if let Some(text) = sibling.value().as_text() {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    parts.push(trimmed.to_string());
                }
            }
        }

        let mut text = parts.join("\n");
        if text.is_empty() {
            text = heading_text.clone();
        }

        let byte_offset_start = extracted.find(&heading_text).unwrap_or(0);
        let byte_offset_end = byte_offset_start + heading_text.len() + text.len();

        sections.push(ParsedSection {
            id: next_id,
            level,
            sha256: canonical::sha256_hex(text.as_bytes()),
            heading: heading_text,
            text,
            byte_offset_start,
            byte_offset_end,
            tables: Vec::new(),
            language: "en".to_string(),
        });
        next_id += 1;
    }

    sections
}

fn element_text(element: ElementRef<'_>) -> String {
    let mut parts: Vec<&str> = Vec::new();
    collect_text(element, &mut parts);
    parts.join("\n")
}

fn published_date(document: &Html) -> Option<String> {
    static PUBLISHED: OnceLock<Selector> = OnceLock::new();
    static DATE: OnceLock<Selector> = OnceLock::new();
    static DCTERMS: OnceLock<Selector> = OnceLock::new();
    static TIME: OnceLock<Selector> = OnceLock::new();

    let meta_selectors = [
        selector("meta[property=\"article:published_time\"]", &PUBLISHED),
        selector("meta[name=\"date\"]", &DATE),
        selector("meta[name=\"dcterms.date\"]", &DCTERMS),
    ];
    for sel in meta_selectors {
        if let Some(content) = document
            .select(sel)
            .find_map(|el| el.value().attr("content"))
        {
            let content = content.trim();
            if !content.is_empty() {
                return Some(content.to_string());
            }
        }
    }
    document
        .select(selector("time[datetime]", &TIME))
        .find_map(|el| el.value().attr("datetime"))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn page_language(document: &Html) -> String {
    document
        .root_element()
        .value()
        .attr("lang")
        .map(|lang| lang.trim().to_string())
        .filter(|lang| !lang.is_empty())
        .unwrap_or_else(|| "en".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headings_delimit_sections() {
        let html = r#"<html><body>
            <h1>Scope</h1><p>Applies to all operators.</p><p>Without exception.</p>
            <h2>Definitions</h2><p>Operator means anyone.</p>
            <h3>Notes</h3>
        </body></html>"#;
        let doc = parse_html_document(html, "https://x.test/reg").unwrap();
        assert_eq!(doc.sections.len(), 3);

        let scope = &doc.sections[0];
        assert_eq!(scope.id, 1);
        assert_eq!(scope.level, 1);
        assert_eq!(scope.heading, "Scope");
        assert_eq!(scope.text, "Applies to all operators.\nWithout exception.");
        assert_eq!(scope.sha256, canonical::sha256_hex(scope.text.as_bytes()));

        let defs = &doc.sections[1];
        assert_eq!(defs.level, 2);
        assert_eq!(defs.text, "Operator means anyone.");

        // A heading with no body falls back to its own text.
        let notes = &doc.sections[2];
        assert_eq!(notes.level, 3);
        assert_eq!(notes.text, "Notes");
    }

    #[test]
    fn headingless_page_yields_single_content_section() {
        let html = "<html><body><p>Just a paragraph of text.</p></body></html>";
        let doc = parse_html_document(html, "https://x.test").unwrap();
        assert_eq!(doc.sections.len(), 1);
        assert_eq!(doc.sections[0].heading, "Content");
        assert_eq!(doc.sections[0].level, 1);
        assert!(doc.sections[0].text.contains("Just a paragraph"));
    }

    #[test]
    fn empty_page_is_an_error() {
        let html = "<html><head><script>var x = 1;</script></head><body></body></html>";
        let err = parse_html_document(html, "https://x.test").unwrap_err();
        assert!(matches!(err, ParseError::EmptyContent { .. }));
    }

    #[test]
    fn script_and_style_are_ignored() {
        let html = r"<html><body>
            <h1>Title</h1>
            <script>ignored()</script>
            <p>kept</p>
            <style>.x{}</style>
        </body></html>";
        let doc = parse_html_document(html, "https://x.test").unwrap();
        assert_eq!(doc.sections[0].text, "kept");
    }

    #[test]
    fn published_date_comes_from_meta_tags() {
        let html = r#"<html><head>
            <meta property="article:published_time" content="2026-01-15" />
        </head><body><h1>T</h1><p>b</p></body></html>"#;
        let doc = parse_html_document(html, "https://x.test").unwrap();
        assert_eq!(doc.published_date.as_deref(), Some("2026-01-15"));
    }

    #[test]
    fn language_comes_from_the_html_element() {
        let html = r#"<html lang="de"><body><h1>T</h1><p>b</p></body></html>"#;
        let doc = parse_html_document(html, "https://x.test").unwrap();
        assert_eq!(doc.language, "de");

        let html = "<html><body><h1>T</h1><p>b</p></body></html>";
        let doc = parse_html_document(html, "https://x.test").unwrap();
        assert_eq!(doc.language, "en");
    }

    #[test]
    fn section_offsets_point_into_the_extracted_text() {
        let html = "<html><body><h1>Alpha</h1><p>beta</p></body></html>";
        let doc = parse_html_document(html, "https://x.test").unwrap();
        let section = &doc.sections[0];
        assert_eq!(section.byte_offset_start, 0);
        assert_eq!(
            section.byte_offset_end,
            "Alpha".len() + "beta".len()
        );
    }
}
