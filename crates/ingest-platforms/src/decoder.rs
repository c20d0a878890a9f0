//! Tolerant decoding of provider result payloads.
//!
//! Providers do not always return a single well-formed document. Each
//! [`DecodeStrategy`] is a pure parser; [`ResponseDecoder`] tries them in
//! order and the first success wins.

use serde_json::{Deserializer, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("payload is empty")]
    Empty,
    #[error("no decoding strategy accepted the payload ({len} bytes, starts with {preview:?})")]
    Unparseable { len: usize, preview: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStrategy {
    /// The payload is one JSON document.
    WholeDocument,
    /// JSON values back to back, with or without whitespace between them.
    Concatenated,
    /// One JSON value per non-empty line.
    NewlineDelimited,
    /// First balanced `{..}` or `[..]` inside surrounding noise.
    EmbeddedStructure,
}

impl DecodeStrategy {
    pub const ORDERED: [DecodeStrategy; 4] = [
        DecodeStrategy::WholeDocument,
        DecodeStrategy::Concatenated,
        DecodeStrategy::NewlineDelimited,
        DecodeStrategy::EmbeddedStructure,
    ];

    pub fn name(self) -> &'static str {
        match self {
            DecodeStrategy::WholeDocument => "whole_document",
            DecodeStrategy::Concatenated => "concatenated",
            DecodeStrategy::NewlineDelimited => "newline_delimited",
            DecodeStrategy::EmbeddedStructure => "embedded_structure",
        }
    }

    /// Top-level values found by this strategy, or `None` if it does not apply.
    pub fn apply(self, text: &str) -> Option<Vec<JsonValue>> {
        match self {
            DecodeStrategy::WholeDocument => serde_json::from_str(text).ok().map(|v| vec![v]),
            DecodeStrategy::Concatenated => parse_concatenated(text),
            DecodeStrategy::NewlineDelimited => parse_lines(text),
            DecodeStrategy::EmbeddedStructure => parse_embedded(text),
        }
    }
}

fn parse_concatenated(text: &str) -> Option<Vec<JsonValue>> {
    let mut values = Vec::new();
    for value in Deserializer::from_str(text).into_iter::<JsonValue>() {
        values.push(value.ok()?);
    }
    (!values.is_empty()).then_some(values)
}

fn parse_lines(text: &str) -> Option<Vec<JsonValue>> {
    let mut values = Vec::new();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        values.push(serde_json::from_str(line).ok()?);
    }
    (!values.is_empty()).then_some(values)
}

fn parse_embedded(text: &str) -> Option<Vec<JsonValue>> {
    let mut from = 0;
    while let Some(offset) = text[from..].find(|c: char| c == '{' || c == '[') {
        let start = from + offset;
        // A structure still open at end of input is a cut-off payload, not noise.
        let end = candidate_end(text, start)?;
        if let Ok(value) = serde_json::from_str::<JsonValue>(&text[start..end]) {
            return Some(vec![value]);
        }
        from = end;
    }
    None
}

/// Byte offset just past the candidate opened at `start`: its balanced close,
/// or the first mismatched closer. `None` when input ends with it still open.
/// String literals and escapes are honoured.
fn candidate_end(text: &str, start: usize) -> Option<usize> {
    let mut stack: Vec<u8> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (idx, byte) in text.bytes().enumerate().skip(start) {
        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => stack.push(b'}'),
            b'[' => stack.push(b']'),
            b'}' | b']' => {
                if stack.pop() != Some(byte) || stack.is_empty() {
                    return Some(idx + 1);
                }
            }
            _ => {}
        }
    }
    None
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPayload {
    pub strategy: DecodeStrategy,
    /// Object items in payload order; top-level arrays are flattened.
    pub items: Vec<JsonValue>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResponseDecoder;

impl ResponseDecoder {
    pub fn decode(raw: &[u8]) -> Result<DecodedPayload, DecodeError> {
        let text = std::str::from_utf8(raw)?;
        let text = text.trim_start_matches('\u{feff}').trim();
        if text.is_empty() {
            return Err(DecodeError::Empty);
        }

        for strategy in DecodeStrategy::ORDERED {
            if let Some(values) = strategy.apply(text) {
                let items = flatten_objects(values);
                debug!(strategy = strategy.name(), items = items.len(), "payload decoded");
                return Ok(DecodedPayload { strategy, items });
            }
        }

        Err(DecodeError::Unparseable {
            len: raw.len(),
            preview: text.chars().take(64).collect(),
        })
    }
}

fn flatten_objects(values: Vec<JsonValue>) -> Vec<JsonValue> {
    let mut items = Vec::new();
    for value in values {
        match value {
            JsonValue::Array(elements) => {
                items.extend(elements.into_iter().filter(JsonValue::is_object))
            }
            JsonValue::Object(_) => items.push(value),
            _ => {}
        }
    }
    items
}
