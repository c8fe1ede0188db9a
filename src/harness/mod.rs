//! Execution harness.
//!
//! User code never runs on its own: it is spliced verbatim between a fixed
//! per-language prefix and suffix. The prefix declares the capability the
//! user implements (pick the next move from a read-only maze view); the
//! suffix reads the stdin envelope, drives the maze-solving loop and prints
//! the result marker.

pub mod envelope;
pub mod escape;

use sha2::{Digest, Sha256};

/// Fixed code placed around user source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HarnessTemplate {
    pub prefix: &'static str,
    pub suffix: &'static str,
}

impl HarnessTemplate {
    /// `prefix + user + suffix`, with no rewriting of the user text
    pub fn wrap(&self, user_code: &str) -> WrappedSource {
        let mut text =
            String::with_capacity(self.prefix.len() + user_code.len() + self.suffix.len() + 2);
        text.push_str(self.prefix);
        text.push_str(user_code);
        if !user_code.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(self.suffix);
        WrappedSource::new(text)
    }
}

/// Complete program text handed to the compiler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedSource {
    text: String,
    digest: String,
}

impl WrappedSource {
    fn new(text: String) -> Self {
        let digest = format!("{:x}", Sha256::digest(text.as_bytes()));
        Self { text, digest }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// SHA-256 of the wrapped text, hex encoded
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: HarnessTemplate = HarnessTemplate {
        prefix: "// prefix\n",
        suffix: "// suffix\n",
    };

    #[test]
    fn test_wrap_is_verbatim() {
        let user = "fn next_move() {}\n";
        let wrapped = TEMPLATE.wrap(user);
        assert_eq!(wrapped.text(), "// prefix\nfn next_move() {}\n// suffix\n");
    }

    #[test]
    fn test_wrap_terminates_last_user_line() {
        let wrapped = TEMPLATE.wrap("// trailing comment");
        assert!(wrapped.text().contains("// trailing comment\n// suffix"));
    }

    #[test]
    fn test_digest_tracks_content() {
        let a = TEMPLATE.wrap("a");
        let b = TEMPLATE.wrap("b");
        assert_eq!(a.digest().len(), 64);
        assert_ne!(a.digest(), b.digest());
        assert_eq!(a.digest(), TEMPLATE.wrap("a").digest());
    }
}
