use crate::config::types::{MazeboxError, Result};
use crate::judge::adapter::LanguageAdapter;
use crate::judge::languages::{java::JavaAdapter, rust::RustAdapter};

/// Canonical names accepted by [`adapter_for`]
pub const SUPPORTED_LANGUAGES: &[&str] = &["rust", "java"];

pub fn adapter_for(language: &str) -> Result<Box<dyn LanguageAdapter>> {
    match language.trim().to_ascii_lowercase().as_str() {
        "rust" | "rs" => Ok(Box::new(RustAdapter)),
        "java" => Ok(Box::new(JavaAdapter)),
        _ => Err(MazeboxError::UnsupportedLanguage(language.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_languages() {
        assert_eq!(adapter_for("rust").unwrap().language(), "rust");
        assert_eq!(adapter_for("RS").unwrap().language(), "rust");
        assert_eq!(adapter_for("java").unwrap().language(), "java");
        for name in SUPPORTED_LANGUAGES {
            assert_eq!(adapter_for(name).unwrap().language(), *name);
        }
    }

    #[test]
    fn test_unknown_language() {
        assert!(matches!(
            adapter_for("cobol"),
            Err(MazeboxError::UnsupportedLanguage(name)) if name == "cobol"
        ));
    }
}
