//! Tree-sitter syntax validation for parsed source files.
//!
//! Extraction itself is regex-based (see `symbols.rs`); tree-sitter gates it
//! so that a file with syntax errors contributes zero records instead of
//! garbage ones. Validation failures are reported per file, never thrown
//! across files.

use crate::models::Language;

fn grammar(language: Language) -> tree_sitter::Language {
    match language {
        Language::Python => tree_sitter_python::LANGUAGE.into(),
        Language::Java => tree_sitter_java::LANGUAGE.into(),
        Language::TypeScript => tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
        Language::Go => tree_sitter_go::LANGUAGE.into(),
    }
}

/// Parse `source` with the language grammar and report whether the tree is
/// syntactically clean.
pub fn validate_source(language: Language, source: &str) -> Result<(), String> {
    let mut parser = tree_sitter::Parser::new();
    parser
        .set_language(&grammar(language))
        .map_err(|e| format!("failed to load {} grammar: {e}", language.as_str()))?;

    let tree = parser
        .parse(source.as_bytes(), None)
        .ok_or_else(|| format!("{} parser produced no tree", language.as_str()))?;

    if tree.root_node().has_error() {
        return Err(format!(
            "{} source contains syntax errors",
            language.as_str()
        ));
    }
    Ok(())
}
