//! Positional field extraction over an unstructured text blob.
//!
//! A [`FieldRule`] names an anchor substring that starts every repeated
//! listing block, and a marker/offset/terminator triple that locates the
//! field value inside a fixed-size window after each anchor. No markup
//! parsing happens here; everything is substring search.

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Characters inspected after each anchor unless a rule says otherwise.
pub const DEFAULT_WINDOW: usize = 100;

fn default_window() -> usize {
    DEFAULT_WINDOW
}

/// How a failed marker/terminator lookup is treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractMode {
    /// A failed lookup is a `MalformedField` error.
    #[default]
    Strict,
    /// A failed lookup yields an empty string.
    Permissive,
}

/// Where and how to pull one field out of every listing block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRule {
    /// Field name used in error messages.
    pub name: String,
    /// Substring marking the start of each listing block.
    pub anchor: String,
    /// Substring searched for inside the window.
    pub marker: String,
    /// Substring ending the value.
    pub terminator: String,
    /// Characters from the start of `marker` to the start of the value.
    pub offset: usize,
    /// Window size in characters, counted from the anchor position.
    #[serde(default = "default_window")]
    pub window: usize,
    /// Text following the anchor that means "this listing has no value".
    #[serde(default)]
    pub absent_marker: Option<String>,
}

/// One extracted field occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    Value(String),
    /// The block carried the rule's `absent_marker` instead of a value.
    Absent,
}

impl Field {
    pub fn as_value(&self) -> Option<&str> {
        match self {
            Field::Value(v) => Some(v),
            Field::Absent => None,
        }
    }
}

impl FieldRule {
    pub fn new(name: &str, anchor: &str, marker: &str, terminator: &str, offset: usize) -> Self {
        Self {
            name: name.to_string(),
            anchor: anchor.to_string(),
            marker: marker.to_string(),
            terminator: terminator.to_string(),
            offset,
            window: DEFAULT_WINDOW,
            absent_marker: None,
        }
    }

    pub fn with_absent_marker(mut self, marker: &str) -> Self {
        self.absent_marker = Some(marker.to_string());
        self
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }

    /// Structural checks that do not need a document.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let invalid = |reason: &str| PipelineError::InvalidRule {
            field: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.anchor.is_empty() {
            return Err(invalid("anchor is empty"));
        }
        if self.marker.is_empty() {
            return Err(invalid("marker is empty"));
        }
        if self.terminator.is_empty() {
            return Err(invalid("terminator is empty"));
        }
        if self.window == 0 {
            return Err(invalid("window must be at least one character"));
        }
        if self.absent_marker.as_deref() == Some("") {
            return Err(invalid("absent marker is empty"));
        }
        Ok(())
    }

    /// Locate the value inside one window.
    fn lookup<'a>(&self, window: &'a str) -> Option<&'a str> {
        let marker_at = window.find(&self.marker)?;
        let start = advance_chars(window, marker_at, self.offset)?;
        let len = window[start..].find(&self.terminator)?;
        Some(&window[start..start + len])
    }

    fn is_absent(&self, window: &str) -> bool {
        let Some(marker) = self.absent_marker.as_deref() else {
            return false;
        };
        let rest = window.get(self.anchor.len()..).unwrap_or("");
        rest.trim_start_matches(|c: char| c == '"' || c == ':' || c.is_whitespace())
            .starts_with(marker)
    }
}

/// Byte positions of every occurrence of `anchor`, in document order.
///
/// Each search resumes one character after the previous match start, so
/// overlapping occurrences are reported too.
pub fn scan_anchors(blob: &str, anchor: &str) -> Vec<usize> {
    let mut positions = Vec::new();
    if anchor.is_empty() {
        return positions;
    }
    let mut from = 0;
    while let Some(rel) = blob[from..].find(anchor) {
        let pos = from + rel;
        positions.push(pos);
        from = pos + blob[pos..].chars().next().map_or(1, char::len_utf8);
    }
    positions
}

/// Run one rule over the blob, one result per anchor occurrence.
pub fn extract(blob: &str, rule: &FieldRule, mode: ExtractMode) -> Result<Vec<Field>, PipelineError> {
    scan_anchors(blob, &rule.anchor)
        .into_iter()
        .enumerate()
        .map(|(index, pos)| {
            let window = window_at(blob, pos, rule.window);
            if rule.is_absent(window) {
                return Ok(Field::Absent);
            }
            match (rule.lookup(window), mode) {
                (Some(value), _) => Ok(Field::Value(value.to_string())),
                (None, ExtractMode::Permissive) => Ok(Field::Value(String::new())),
                (None, ExtractMode::Strict) => Err(PipelineError::MalformedField {
                    field: rule.name.clone(),
                    index,
                    raw: window.to_string(),
                }),
            }
        })
        .collect()
}

/// Text from each `start` occurrence up to the next `end` marker.
///
/// A block with no closing marker runs to the end of the blob.
pub fn extract_spans<'a>(blob: &'a str, start: &str, end: &str) -> Vec<&'a str> {
    scan_anchors(blob, start)
        .into_iter()
        .map(|pos| {
            let search_from = pos + start.len();
            let stop = blob[search_from..]
                .find(end)
                .map_or(blob.len(), |rel| search_from + rel);
            &blob[pos..stop]
        })
        .collect()
}

/// Slice of at most `chars` characters starting at byte `start`.
fn window_at(blob: &str, start: usize, chars: usize) -> &str {
    let end = blob[start..]
        .char_indices()
        .nth(chars)
        .map_or(blob.len(), |(i, _)| start + i);
    &blob[start..end]
}

/// Byte index `n` characters after `from`, or `None` past the end.
fn advance_chars(s: &str, from: usize, n: usize) -> Option<usize> {
    s[from..]
        .char_indices()
        .map(|(i, _)| from + i)
        .chain(std::iter::once(s.len()))
        .nth(n)
}
