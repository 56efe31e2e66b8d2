//! Function extraction and call-site scanning from source text.
//!
//! Extraction is regex-based line scanning: Python uses indentation to find
//! function extents, the brace languages (Java, TypeScript, Go) use brace
//! counting. Call-sites are collected per function body and stay unresolved
//! until call-graph construction.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::models::{record_id, CallName, FunctionRecord, Language, Visibility};

// ---------------------------------------------------------------------------
// Regex patterns (compiled once via LazyLock)
// ---------------------------------------------------------------------------

static CALL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:([A-Za-z_][A-Za-z0-9_]*)\s*\.\s*)?([A-Za-z_][A-Za-z0-9_]*)\s*\(").unwrap()
});

static PY_DEF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\s*)(?:async\s+)?def\s+([A-Za-z_][A-Za-z0-9_]*)\s*\(").unwrap());

static PY_CLASS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\s*)class\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap());

static JAVA_CLASS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bclass\s+([A-Za-z_$][A-Za-z0-9_$]*)").unwrap());

static JAVA_METHOD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:(?:public|private|protected|static|final|abstract|synchronized|native)\s+)*[\w<>\[\],.]+\s+([A-Za-z_$][A-Za-z0-9_$]*)\s*\([^;{]*\)\s*(?:throws\s+[\w,.\s]+)?\{",
    )
    .unwrap()
});

static TS_CLASS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bclass\s+([A-Za-z_$][A-Za-z0-9_$]*)").unwrap());

static TS_FUNCTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:export\s+)?(?:default\s+)?(?:async\s+)?function\s+([A-Za-z_$][A-Za-z0-9_$]*)\s*\(")
        .unwrap()
});

static TS_ARROW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:export\s+)?(?:const|let|var)\s+([A-Za-z_$][A-Za-z0-9_$]*)[^=]*=\s*(?:async\s*)?\([^)]*\)\s*(?::\s*[^=]+)?=>",
    )
    .unwrap()
});

static TS_METHOD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:(?:public|private|protected|static|async|readonly)\s+)*([A-Za-z_$][A-Za-z0-9_$]*)\s*\([^)]*\)\s*(?::\s*[\w<>\[\],.\s|]+)?\s*\{",
    )
    .unwrap()
});

static GO_FUNC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^func\s+(?:\(\s*\w+\s+\*?([A-Za-z_][A-Za-z0-9_]*)\s*\)\s*)?([A-Za-z_][A-Za-z0-9_]*)\s*\(")
        .unwrap()
});

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Language keywords that look like function calls but are not.
fn is_call_keyword(name: &str) -> bool {
    matches!(
        name,
        "if" | "for" | "while" | "switch" | "return" | "new" | "function" | "class" | "catch"
    )
}

/// Convert a file path to a dotted module name.
pub fn to_module_name(path: &str) -> String {
    let p = Path::new(path);
    let without_ext = p.with_extension("");
    let parts: Vec<&str> = without_ext
        .components()
        .filter_map(|c| match c {
            std::path::Component::Normal(os) => os.to_str(),
            _ => None,
        })
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    parts.join(".")
}

fn visibility_for(language: Language, name: &str) -> Visibility {
    match language {
        Language::Go => {
            if name.chars().next().map(|c| c.is_lowercase()).unwrap_or(true) {
                Visibility::Private
            } else {
                Visibility::Public
            }
        }
        _ => {
            if name.starts_with('_') {
                Visibility::Private
            } else {
                Visibility::Public
            }
        }
    }
}

fn indent_width(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

/// Find the last line of a brace-delimited block opened on `start_idx`.
fn brace_block_end(lines: &[&str], start_idx: usize) -> usize {
    let mut depth: i64 = 0;
    let mut opened = false;
    for (offset, line) in lines[start_idx..].iter().enumerate() {
        for ch in line.chars() {
            match ch {
                '{' => {
                    depth += 1;
                    opened = true;
                }
                '}' => depth -= 1,
                _ => {}
            }
        }
        if opened && depth <= 0 {
            return start_idx + offset;
        }
    }
    lines.len().saturating_sub(1)
}

/// Find the last line of a Python block whose `def` sits on `start_idx`.
fn python_block_end(lines: &[&str], start_idx: usize, def_indent: usize) -> usize {
    let mut end = start_idx;
    for (offset, line) in lines[start_idx + 1..].iter().enumerate() {
        let idx = start_idx + 1 + offset;
        if line.trim().is_empty() {
            continue;
        }
        if indent_width(line) <= def_indent {
            break;
        }
        end = idx;
    }
    end
}

/// Extract call-sites from a function body, skipping keywords and lines
/// that define rather than call.
pub fn extract_call_names(body: &str, first_line: i64) -> Vec<CallName> {
    let mut calls = Vec::new();
    for (index, line) in body.lines().enumerate() {
        let line_number = first_line + index as i64;
        for caps in CALL_RE.captures_iter(line) {
            let receiver = caps.get(1).map(|m| m.as_str().to_string());
            let name = match caps.get(2) {
                Some(m) => m.as_str(),
                None => continue,
            };
            if is_call_keyword(name) {
                continue;
            }
            let match_start = caps.get(0).map(|m| m.start()).unwrap_or(0);
            let prefix = line[..match_start].trim_end();
            if prefix.ends_with("def")
                || prefix.ends_with("function")
                || prefix.ends_with("func")
                || prefix.ends_with("class")
                || prefix.ends_with("new")
            {
                continue;
            }
            calls.push(CallName {
                name: name.to_string(),
                line: line_number,
                receiver,
            });
        }
    }
    calls
}

// ---------------------------------------------------------------------------
// Per-language extraction
// ---------------------------------------------------------------------------

struct RawFunction {
    name: String,
    class_name: Option<String>,
    start_idx: usize,
    end_idx: usize,
}

fn extract_python(lines: &[&str]) -> Vec<RawFunction> {
    let mut functions = Vec::new();
    // Stack of (indent, class name) for qualification.
    let mut class_stack: Vec<(usize, String)> = Vec::new();

    for (idx, line) in lines.iter().enumerate() {
        if let Some(caps) = PY_CLASS_RE.captures(line) {
            let indent = caps.get(1).map(|m| m.as_str().len()).unwrap_or(0);
            let name = caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default();
            while matches!(class_stack.last(), Some((i, _)) if *i >= indent) {
                class_stack.pop();
            }
            class_stack.push((indent, name));
            continue;
        }
        if let Some(caps) = PY_DEF_RE.captures(line) {
            let indent = caps.get(1).map(|m| m.as_str().len()).unwrap_or(0);
            let name = caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default();
            while matches!(class_stack.last(), Some((i, _)) if *i >= indent) {
                class_stack.pop();
            }
            let class_name = class_stack.last().map(|(_, n)| n.clone());
            let end_idx = python_block_end(lines, idx, indent);
            functions.push(RawFunction {
                name,
                class_name,
                start_idx: idx,
                end_idx,
            });
        }
    }
    functions
}

/// Innermost enclosing class for each line, computed from class declaration
/// spans (brace languages only).
fn class_spans(lines: &[&str], class_re: &Regex) -> Vec<(usize, usize, String)> {
    let mut spans = Vec::new();
    for (idx, line) in lines.iter().enumerate() {
        if let Some(caps) = class_re.captures(line) {
            if let Some(name) = caps.get(1) {
                let end = brace_block_end(lines, idx);
                spans.push((idx, end, name.as_str().to_string()));
            }
        }
    }
    spans
}

fn enclosing_class(spans: &[(usize, usize, String)], idx: usize) -> Option<String> {
    spans
        .iter()
        .filter(|(start, end, _)| *start < idx && idx <= *end)
        .min_by_key(|(start, end, _)| end - start)
        .map(|(_, _, name)| name.clone())
}

fn extract_java(lines: &[&str]) -> Vec<RawFunction> {
    let spans = class_spans(lines, &JAVA_CLASS_RE);
    let mut functions = Vec::new();
    for (idx, line) in lines.iter().enumerate() {
        if let Some(caps) = JAVA_METHOD_RE.captures(line) {
            let name = caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();
            if is_call_keyword(&name) {
                continue;
            }
            functions.push(RawFunction {
                name,
                class_name: enclosing_class(&spans, idx),
                start_idx: idx,
                end_idx: brace_block_end(lines, idx),
            });
        }
    }
    functions
}

fn extract_typescript(lines: &[&str]) -> Vec<RawFunction> {
    let spans = class_spans(lines, &TS_CLASS_RE);
    let mut functions = Vec::new();
    for (idx, line) in lines.iter().enumerate() {
        if let Some(caps) = TS_FUNCTION_RE.captures(line) {
            let name = caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();
            functions.push(RawFunction {
                name,
                class_name: None,
                start_idx: idx,
                end_idx: brace_block_end(lines, idx),
            });
            continue;
        }
        if let Some(caps) = TS_ARROW_RE.captures(line) {
            let name = caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();
            let end_idx = if line.contains('{') {
                brace_block_end(lines, idx)
            } else {
                idx
            };
            functions.push(RawFunction {
                name,
                class_name: None,
                start_idx: idx,
                end_idx,
            });
            continue;
        }
        // Methods only make sense inside a class body.
        if let Some(class_name) = enclosing_class(&spans, idx) {
            if let Some(caps) = TS_METHOD_RE.captures(line) {
                let name = caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default();
                if is_call_keyword(&name) || name == "constructor" {
                    continue;
                }
                functions.push(RawFunction {
                    name,
                    class_name: Some(class_name),
                    start_idx: idx,
                    end_idx: brace_block_end(lines, idx),
                });
            }
        }
    }
    functions
}

fn extract_go(lines: &[&str]) -> Vec<RawFunction> {
    let mut functions = Vec::new();
    for (idx, line) in lines.iter().enumerate() {
        if let Some(caps) = GO_FUNC_RE.captures(line) {
            let receiver = caps.get(1).map(|m| m.as_str().to_string());
            let name = caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default();
            functions.push(RawFunction {
                name,
                class_name: receiver,
                start_idx: idx,
                end_idx: brace_block_end(lines, idx),
            });
        }
    }
    functions
}

// ---------------------------------------------------------------------------
// Main entry point
// ---------------------------------------------------------------------------

/// Extract every function/method record from one source file.
pub fn extract_functions(source: &str, file_path: &str, language: Language) -> Vec<FunctionRecord> {
    let lines: Vec<&str> = source.lines().collect();
    let raw = match language {
        Language::Python => extract_python(&lines),
        Language::Java => extract_java(&lines),
        Language::TypeScript => extract_typescript(&lines),
        Language::Go => extract_go(&lines),
    };

    let module_path = to_module_name(file_path);
    let mut records = Vec::with_capacity(raw.len());

    for function in raw {
        let qualified_name = match &function.class_name {
            Some(class_name) => format!("{module_path}.{class_name}.{}", function.name),
            None => format!("{module_path}.{}", function.name),
        };
        let start_line = function.start_idx as i64 + 1;
        let end_line = function.end_idx as i64 + 1;
        let text = lines[function.start_idx..=function.end_idx].join("\n");
        // The signature line matches the call pattern in brace languages;
        // a function is not a call-site of itself.
        let call_names: Vec<CallName> = extract_call_names(&text, start_line)
            .into_iter()
            .filter(|c| !(c.line == start_line && c.name == function.name))
            .collect();

        records.push(FunctionRecord {
            id: record_id(&module_path, &qualified_name),
            language,
            file_path: file_path.to_string(),
            module_path: module_path.clone(),
            name: function.name.clone(),
            qualified_name,
            start_line,
            end_line,
            text,
            call_names,
            visibility: visibility_for(language, &function.name),
        });
    }

    records
}
