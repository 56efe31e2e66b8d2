//! Filesystem scanning helpers for the parse pass.

use std::path::{Path, PathBuf};

use ignore::WalkBuilder;

use crate::models::Language;

const LANGUAGE_BY_EXTENSION: &[(&str, Language)] = &[
    (".py", Language::Python),
    (".java", Language::Java),
    (".ts", Language::TypeScript),
    (".tsx", Language::TypeScript),
    (".go", Language::Go),
];

/// File-name patterns that are never indexed, regardless of extension.
const DEFAULT_SENSITIVE_EXCLUDE_PATTERNS: &[&str] = &[
    ".env",
    ".env.*",
    "*.pem",
    "*.key",
    "*.p12",
    "*secret*",
    "*secrets*",
    "*credential*",
    "id_rsa",
    "id_dsa",
];

/// A source file selected for parsing.
#[derive(Clone, Debug)]
pub struct SourceFile {
    /// Path relative to the snapshot root, normalized to `/` separators.
    pub path: String,
    pub absolute: PathBuf,
    pub language: Language,
}

/// Detect the language of a file from its extension. Unsupported extensions
/// yield `None` and the file is skipped, not errored.
pub fn detect_language(path: &str) -> Option<Language> {
    let lowered = path.to_lowercase();
    LANGUAGE_BY_EXTENSION
        .iter()
        .find(|(ext, _)| lowered.ends_with(ext))
        .map(|(_, lang)| *lang)
}

/// Simple glob match supporting `*` and `?`.
fn glob_match(text: &str, pattern: &str) -> bool {
    let t_chars: Vec<char> = text.chars().collect();
    let p_chars: Vec<char> = pattern.chars().collect();
    let (tl, pl) = (t_chars.len(), p_chars.len());
    let mut dp = vec![vec![false; pl + 1]; tl + 1];
    dp[0][0] = true;
    for j in 1..=pl {
        if p_chars[j - 1] == '*' {
            dp[0][j] = dp[0][j - 1];
        }
    }
    for i in 1..=tl {
        for j in 1..=pl {
            if p_chars[j - 1] == '*' {
                dp[i][j] = dp[i][j - 1] || dp[i - 1][j];
            } else if p_chars[j - 1] == '?' || t_chars[i - 1] == p_chars[j - 1] {
                dp[i][j] = dp[i - 1][j - 1];
            }
        }
    }
    dp[tl][pl]
}

/// Whether a file name matches the sensitive-file exclusion list.
pub fn is_sensitive(file_name: &str) -> bool {
    let lowered = file_name.to_lowercase();
    DEFAULT_SENSITIVE_EXCLUDE_PATTERNS
        .iter()
        .any(|pattern| glob_match(&lowered, pattern))
}

/// Walk a repository root and return every indexable source file.
///
/// The walk honors `.gitignore`/`.ignore` rules and skips hidden
/// directories; sensitive file names and unsupported extensions are dropped.
/// Results are sorted by relative path for determinism.
pub fn scan_repo_files(root: &Path) -> Vec<SourceFile> {
    let mut files = Vec::new();

    for entry in WalkBuilder::new(root).build().flatten() {
        let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
        if !is_file {
            continue;
        }
        let path = entry.path();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if is_sensitive(&file_name) {
            continue;
        }
        let rel = path
            .strip_prefix(root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");
        let language = match detect_language(&rel) {
            Some(l) => l,
            None => continue,
        };
        files.push(SourceFile {
            path: rel,
            absolute: path.to_path_buf(),
            language,
        });
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    files
}
