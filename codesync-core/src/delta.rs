//! Editor-native text deltas.
//!
//! Indices are counted in Unicode scalar values (`char`s), not bytes.

use serde::{Deserialize, Serialize};

/// A single edit against a visible text buffer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TextDelta {
    Insert { index: usize, text: String },
    Delete { index: usize, len: usize },
}

impl TextDelta {
    pub fn insert(index: usize, text: impl Into<String>) -> Self {
        TextDelta::Insert {
            index,
            text: text.into(),
        }
    }

    pub fn delete(index: usize, len: usize) -> Self {
        TextDelta::Delete { index, len }
    }

    /// Whether applying this delta changes nothing.
    pub fn is_noop(&self) -> bool {
        match self {
            TextDelta::Insert { text, .. } => text.is_empty(),
            TextDelta::Delete { len, .. } => *len == 0,
        }
    }

    /// Apply to a plain string. Out-of-range positions are clamped.
    pub fn apply_to(&self, target: &mut String) {
        match self {
            TextDelta::Insert { index, text } => {
                let at = byte_offset(target, *index);
                target.insert_str(at, text);
            }
            TextDelta::Delete { index, len } => {
                let start = byte_offset(target, *index);
                let end = byte_offset(target, index + len);
                target.replace_range(start..end, "");
            }
        }
    }
}

/// Byte offset of the `index`-th char, clamped to the string length.
pub fn byte_offset(s: &str, index: usize) -> usize {
    s.char_indices().nth(index).map_or(s.len(), |(i, _)| i)
}

/// Compute a minimal delta turning `old` into `new`.
///
/// Trims the common prefix and suffix and emits at most one delete
/// followed by one insert, both positioned at the first differing char.
pub fn diff(old: &str, new: &str) -> Vec<TextDelta> {
    let old_chars: Vec<char> = old.chars().collect();
    let new_chars: Vec<char> = new.chars().collect();

    let prefix = old_chars
        .iter()
        .zip(new_chars.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let max_suffix = old_chars.len().min(new_chars.len()) - prefix;
    let suffix = old_chars[prefix..]
        .iter()
        .rev()
        .zip(new_chars[prefix..].iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();

    let removed = old_chars.len() - prefix - suffix;
    let inserted: String = new_chars[prefix..new_chars.len() - suffix].iter().collect();

    let mut deltas = Vec::with_capacity(2);
    if removed > 0 {
        deltas.push(TextDelta::delete(prefix, removed));
    }
    if !inserted.is_empty() {
        deltas.push(TextDelta::insert(prefix, inserted));
    }
    deltas
}
