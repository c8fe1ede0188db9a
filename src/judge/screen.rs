/// Token screen for user source.
///
/// Identifiers are matched as whole words. Patterns are matched against the
/// text with all whitespace removed, so `env ! (` and `env!(` both hit.
pub struct Denylist {
    pub identifiers: &'static [&'static str],
    pub patterns: &'static [&'static str],
}

impl Denylist {
    pub fn find(&self, code: &str) -> Option<String> {
        let compact: String = code.chars().filter(|c| !c.is_whitespace()).collect();
        if let Some(pattern) = self.patterns.iter().find(|p| compact.contains(*p)) {
            return Some((*pattern).to_string());
        }

        code.split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .find(|word| self.identifiers.contains(word))
            .map(str::to_string)
    }
}
