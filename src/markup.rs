//! XML checks and minification for report payloads.
//!
//! A payload is accepted once it is at least [`MIN_PAYLOAD_LEN`] bytes long
//! and parses as a single well-formed XML document. Minification keeps the
//! document structure but drops comments and whitespace-only text, and
//! collapses every other whitespace run to a single space.

use quick_xml::events::{BytesText, Event};
use quick_xml::{Reader, Writer};
use thiserror::Error;

/// Anything shorter is still being written or is not a report at all
pub const MIN_PAYLOAD_LEN: usize = 50;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MarkupError {
    #[error("payload too small: {len} bytes")]
    TooSmall { len: usize },
    #[error("malformed XML at byte {position}: {reason}")]
    Malformed { position: u64, reason: String },
    #[error("failed to write minified XML: {0}")]
    Write(String),
}

/// Check that `data` is large enough and is well-formed XML
pub fn validate(data: &[u8]) -> Result<(), MarkupError> {
    if data.len() < MIN_PAYLOAD_LEN {
        return Err(MarkupError::TooSmall { len: data.len() });
    }
    check_well_formed(data)
}

/// Walk every event of the document, tracking nesting by hand so that
/// truncated documents and stray content outside the root are rejected.
fn check_well_formed(data: &[u8]) -> Result<(), MarkupError> {
    let mut reader = Reader::from_reader(data);
    reader.config_mut().check_end_names = true;

    let mut open: Vec<Vec<u8>> = Vec::new();
    let mut seen_root = false;

    loop {
        let position = reader.buffer_position() as u64;
        let event = reader
            .read_event()
            .map_err(|e| malformed(reader.error_position() as u64, e))?;

        match event {
            Event::Start(e) => {
                if open.is_empty() && seen_root {
                    return Err(malformed(position, "multiple root elements"));
                }
                for attr in e.attributes() {
                    attr.map_err(|err| malformed(position, err))?;
                }
                open.push(e.name().as_ref().to_vec());
                seen_root = true;
            }
            Event::Empty(e) => {
                if open.is_empty() && seen_root {
                    return Err(malformed(position, "multiple root elements"));
                }
                for attr in e.attributes() {
                    attr.map_err(|err| malformed(position, err))?;
                }
                seen_root = true;
            }
            Event::End(_) => {
                if open.pop().is_none() {
                    return Err(malformed(position, "unexpected closing tag"));
                }
            }
            Event::Text(e) => {
                let text = e.unescape().map_err(|err| malformed(position, err))?;
                if open.is_empty() && !text.trim().is_empty() {
                    return Err(malformed(position, "text outside of the root element"));
                }
            }
            Event::CData(_) => {
                if open.is_empty() {
                    return Err(malformed(position, "CDATA outside of the root element"));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some(name) = open.last() {
        return Err(malformed(
            reader.buffer_position() as u64,
            format!("unclosed element <{}>", String::from_utf8_lossy(name)),
        ));
    }
    if !seen_root {
        return Err(malformed(reader.buffer_position() as u64, "no root element"));
    }
    Ok(())
}

/// Strip comments and redundant whitespace from a document
pub fn minify(data: &[u8]) -> Result<Vec<u8>, MarkupError> {
    let mut reader = Reader::from_reader(data);
    let mut writer = Writer::new(Vec::with_capacity(data.len()));

    loop {
        let event = reader
            .read_event()
            .map_err(|e| malformed(reader.error_position() as u64, e))?;

        match event {
            Event::Eof => break,
            Event::Comment(_) => {}
            Event::Text(e) => {
                let raw = String::from_utf8_lossy(&e);
                if raw.chars().all(is_xml_whitespace) {
                    continue;
                }
                let collapsed = collapse_whitespace(&raw);
                writer
                    .write_event(Event::Text(BytesText::from_escaped(collapsed)))
                    .map_err(|e| MarkupError::Write(e.to_string()))?;
            }
            other => writer
                .write_event(other)
                .map_err(|e| MarkupError::Write(e.to_string()))?,
        }
    }

    Ok(writer.into_inner())
}

/// Replace each whitespace run with one space, keeping leading and
/// trailing runs so mixed content keeps its word boundaries
fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_run = false;
    for ch in text.chars() {
        if is_xml_whitespace(ch) {
            if !in_run {
                out.push(' ');
            }
            in_run = true;
        } else {
            out.push(ch);
            in_run = false;
        }
    }
    out
}

fn is_xml_whitespace(ch: char) -> bool {
    matches!(ch, ' ' | '\t' | '\r' | '\n')
}

fn malformed(position: u64, reason: impl ToString) -> MarkupError {
    MarkupError::Malformed {
        position,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!-- nightly export -->
<report id="42">
    <entry kind="sale">
        <amount>10.50</amount>
    </entry>
    <note>  hello
        world  </note>
    <empty/>
</report>
"#;

    #[test]
    fn test_valid_report_passes() {
        assert_eq!(validate(REPORT.as_bytes()), Ok(()));
    }

    #[test]
    fn test_short_payload_rejected() {
        let data = b"<a>tiny</a>";
        assert_eq!(validate(data), Err(MarkupError::TooSmall { len: data.len() }));
    }

    #[test]
    fn test_short_payload_rejected_even_when_well_formed() {
        let data = "<r>".to_string() + &"x".repeat(40) + "</r>";
        assert!(data.len() < MIN_PAYLOAD_LEN);
        assert!(matches!(validate(data.as_bytes()), Err(MarkupError::TooSmall { .. })));
    }

    #[test]
    fn test_truncated_document_rejected() {
        let truncated = &REPORT[..REPORT.find("<empty/>").unwrap()];
        assert!(truncated.len() >= MIN_PAYLOAD_LEN);
        assert!(matches!(
            validate(truncated.as_bytes()),
            Err(MarkupError::Malformed { .. })
        ));
    }

    #[test]
    fn test_mismatched_tags_rejected() {
        let data = "<report><entry>".to_string() + &"x".repeat(60) + "</report></entry>";
        assert!(matches!(validate(data.as_bytes()), Err(MarkupError::Malformed { .. })));
    }

    #[test]
    fn test_plain_text_rejected() {
        let data = "this is not xml at all, just a long line of plain text content";
        assert!(data.len() >= MIN_PAYLOAD_LEN);
        assert!(matches!(validate(data.as_bytes()), Err(MarkupError::Malformed { .. })));
    }

    #[test]
    fn test_multiple_roots_rejected() {
        let data = "<a>".to_string() + &"x".repeat(30) + "</a><b>" + &"y".repeat(30) + "</b>";
        assert!(matches!(validate(data.as_bytes()), Err(MarkupError::Malformed { .. })));
    }

    #[test]
    fn test_unknown_entity_rejected() {
        let data = "<report>".to_string() + &"x".repeat(50) + "&bogus;</report>";
        assert!(matches!(validate(data.as_bytes()), Err(MarkupError::Malformed { .. })));
    }

    #[test]
    fn test_minify_drops_comments_and_whitespace() {
        let minified = String::from_utf8(minify(REPORT.as_bytes()).unwrap()).unwrap();

        assert!(!minified.contains("nightly export"));
        assert!(!minified.contains('\n'));
        assert!(minified.contains(r#"<report id="42">"#));
        assert!(minified.contains("<amount>10.50</amount>"));
        assert!(minified.contains("<note> hello world </note>"));
        assert!(minified.contains("<empty/>"));
        assert!(minified.len() < REPORT.len());
    }

    #[test]
    fn test_minified_output_is_still_valid() {
        let minified = minify(REPORT.as_bytes()).unwrap();
        assert_eq!(check_well_formed(&minified), Ok(()));
    }

    #[test]
    fn test_minify_keeps_spaces_in_mixed_content() {
        let data = b"<r><p>Total: <b>10</b> EUR</p><v> 42 </v></r>";
        let minified = String::from_utf8(minify(data).unwrap()).unwrap();
        assert_eq!(minified, "<r><p>Total: <b>10</b> EUR</p><v> 42 </v></r>");
    }

    #[test]
    fn test_minify_collapses_runs_inside_text() {
        let data = b"<r>\n  <v>a \t\n  b</v>\n</r>";
        let minified = String::from_utf8(minify(data).unwrap()).unwrap();
        assert_eq!(minified, "<r><v>a b</v></r>");
    }

    #[test]
    fn test_minify_keeps_escaped_text() {
        let data = b"<r>a &amp; b &lt; c</r>";
        let minified = String::from_utf8(minify(data).unwrap()).unwrap();
        assert_eq!(minified, "<r>a &amp; b &lt; c</r>");
    }
}
