//! Pluggable document parsing.
//!
//! Parsers turn uploaded bytes into plain text keyed by file type. Rich
//! formats (PDF, DOCX) are external plug-ins registered through the same
//! trait; the built-ins cover plain text and markdown.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ParseError {
    #[error("unsupported file type: {file_type}")]
    #[diagnostic(
        code(ragloom::parse::unsupported),
        help("Register a DocumentParser for `{file_type}` or upload a supported format.")
    )]
    Unsupported { file_type: String },

    #[error("document decoded to empty text")]
    #[diagnostic(code(ragloom::parse::empty))]
    Empty,

    #[error("parse failure: {message}")]
    #[diagnostic(code(ragloom::parse::failed))]
    Failed { message: String },
}

/// Turns raw file bytes into plain text.
pub trait DocumentParser: Send + Sync {
    fn parse(&self, bytes: &[u8]) -> Result<String, ParseError>;
}

/// UTF-8 text, lossily decoded.
pub struct PlainTextParser;

impl DocumentParser for PlainTextParser {
    fn parse(&self, bytes: &[u8]) -> Result<String, ParseError> {
        let text = String::from_utf8_lossy(bytes).into_owned();
        if text.trim().is_empty() {
            return Err(ParseError::Empty);
        }
        Ok(text)
    }
}

/// Markdown: decoded as text with heading markers and code fences dropped so
/// chunk content reads as prose.
pub struct MarkdownParser;

impl DocumentParser for MarkdownParser {
    fn parse(&self, bytes: &[u8]) -> Result<String, ParseError> {
        let raw = String::from_utf8_lossy(bytes);
        let mut out = String::with_capacity(raw.len());
        for line in raw.lines() {
            let trimmed = line.trim_start();
            if trimmed.starts_with("```") {
                continue;
            }
            let stripped = trimmed.trim_start_matches('#').trim_start();
            out.push_str(stripped);
            out.push('\n');
        }
        if out.trim().is_empty() {
            return Err(ParseError::Empty);
        }
        Ok(out)
    }
}

/// File-type keyed parser lookup.
#[derive(Clone, Default)]
pub struct ParserRegistry {
    parsers: FxHashMap<String, Arc<dyn DocumentParser>>,
}

impl ParserRegistry {
    /// Registry with the built-in text and markdown parsers.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::default();
        let text: Arc<dyn DocumentParser> = Arc::new(PlainTextParser);
        registry.register("txt", text.clone());
        registry.register("text", text);
        registry.register("md", Arc::new(MarkdownParser));
        registry
    }

    pub fn register(&mut self, file_type: &str, parser: Arc<dyn DocumentParser>) {
        self.parsers.insert(file_type.to_ascii_lowercase(), parser);
    }

    pub fn parse(&self, file_type: &str, bytes: &[u8]) -> Result<String, ParseError> {
        let parser = self
            .parsers
            .get(&file_type.to_ascii_lowercase())
            .ok_or_else(|| ParseError::Unsupported {
                file_type: file_type.to_string(),
            })?;
        parser.parse(bytes)
    }

    #[must_use]
    pub fn supports(&self, file_type: &str) -> bool {
        self.parsers.contains_key(&file_type.to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_rejects_empty_input() {
        assert!(matches!(
            PlainTextParser.parse(b"   \n\t "),
            Err(ParseError::Empty)
        ));
    }

    #[test]
    fn markdown_strips_heading_markers_and_fences() {
        let input = b"# Title\n\n```rust\nfn hidden() {}\n```\nBody text.";
        let text = MarkdownParser.parse(input).unwrap();
        assert!(text.contains("Title"));
        assert!(text.contains("Body text."));
        assert!(!text.contains("```"));
    }

    #[test]
    fn registry_dispatches_by_lowercased_type() {
        let registry = ParserRegistry::with_builtins();
        assert!(registry.parse("TXT", b"hello").is_ok());
        assert!(matches!(
            registry.parse("pdf", b"%PDF"),
            Err(ParseError::Unsupported { .. })
        ));
    }
}
