/// Line-safe escape codec for text crossing the process boundary.
///
/// Every value in the stdin envelope and the detail field of the result
/// marker goes through `escape`; the receiving side applies `unescape`.
/// The harness templates carry byte-for-byte equivalents of both functions.

use std::fmt;

/// Escape introducer
pub const ESCAPE: char = '\\';

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnescapeError {
    /// Input ended right after the escape introducer
    Dangling,
    /// Escape introducer followed by a character with no mapping
    Unknown(char),
}

impl fmt::Display for UnescapeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnescapeError::Dangling => write!(f, "dangling escape at end of input"),
            UnescapeError::Unknown(c) => write!(f, "unknown escape sequence \\{}", c),
        }
    }
}

impl std::error::Error for UnescapeError {}

/// Replace every line-significant character with a two-character sequence
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + text.len() / 8);
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out
}

/// Exact inverse of [`escape`]
pub fn unescape(text: &str) -> Result<String, UnescapeError> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != ESCAPE {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some(other) => return Err(UnescapeError::Unknown(other)),
            None => return Err(UnescapeError::Dangling),
        }
    }
    Ok(out)
}
