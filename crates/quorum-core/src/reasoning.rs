//! Reasoning-service boundary: request/response contract, prompt assembly
//! from opaque text assets, and strict tagged parsing of model output.
//!
//! The service is an injectable trait so every pipeline scenario is testable
//! against deterministic mocks; no vendor protocol leaks into the core.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::errors::QuorumResult;
use crate::models::{CodeLocation, ContextBundle, Hypothesis, Severity};

/// Schema hint sent with scan-phase requests.
pub const FINDINGS_SCHEMA_HINT: &str =
    r#"{"findings":[{"severity":"...","locations":[{"file":"...","line":0}],"rationale":"..."}]}"#;

/// Schema hint sent with confirm-phase requests.
pub const VOTE_SCHEMA_HINT: &str = r#"{"vote":"yes|no","rationale":"..."}"#;

/// One request to the reasoning service.
#[derive(Clone, Debug)]
pub struct ReasoningRequest {
    pub prompt: String,
    pub rule_key: String,
    pub schema_hint: &'static str,
}

/// One raw response from the reasoning service.
#[derive(Clone, Debug)]
pub struct ReasoningResponse {
    pub text: String,
}

/// Boundary to the external reasoning provider. Implementations own their
/// transport and per-call timeout; errors they return drive the shared
/// retry helper.
pub trait ReasoningService: Send + Sync {
    fn complete(&self, request: &ReasoningRequest) -> QuorumResult<ReasoningResponse>;
}

// ---------------------------------------------------------------------------
// Prompt kit
// ---------------------------------------------------------------------------

/// Opaque natural-language assets: phase preambles plus one checklist per
/// rule key. The pipeline only concatenates these, never interprets them.
#[derive(Clone, Debug, Default)]
pub struct PromptKit {
    pub scan_preamble: String,
    pub confirm_preamble: String,
    pub rules: BTreeMap<String, String>,
}

impl PromptKit {
    pub fn rule_keys(&self) -> Vec<String> {
        self.rules.keys().cloned().collect()
    }

    /// Build one scan-phase prompt for a (bundle, rule) pair.
    pub fn scan_prompt(&self, bundle: &ContextBundle, rule_key: &str) -> String {
        let checklist = self.rules.get(rule_key).map(String::as_str).unwrap_or("");
        format!(
            "{}\n\n[rule:{}]\n{}\n\n[code]\n{}",
            self.scan_preamble, rule_key, checklist, bundle.text
        )
    }

    /// Build one confirm-phase prompt: an adversarial re-examination of the
    /// canonical claim, not a repeat of its own rationale.
    pub fn confirm_prompt(&self, bundle_text: &str, claim: &Hypothesis) -> String {
        let locations: Vec<String> = claim
            .locations
            .iter()
            .map(|l| format!("{}:{}", l.file, l.line))
            .collect();
        format!(
            "{}\n\n[claim rule:{} severity:{} at:{}]\n{}\n\n[code]\n{}",
            self.confirm_preamble,
            claim.rule_key,
            claim
                .severity
                .map(|s| s.as_str())
                .unwrap_or("unspecified"),
            locations.join(","),
            claim.rationale,
            bundle_text
        )
    }
}

// ---------------------------------------------------------------------------
// Strict tagged response parsing
// ---------------------------------------------------------------------------

/// One structured finding decoded from a scan response.
#[derive(Clone, Debug, PartialEq)]
pub struct FindingPayload {
    pub severity: Option<Severity>,
    pub locations: Vec<CodeLocation>,
    pub rationale: String,
}

/// Tagged decoding result. Malformed structured fields degrade to
/// `RationaleOnly`, never to a guessed dictionary; empty output is
/// `Unparseable`.
#[derive(Clone, Debug, PartialEq)]
pub enum ParsedResponse {
    Structured(Vec<FindingPayload>),
    RationaleOnly(String),
    Unparseable,
}

fn location_from_value(value: &Value) -> Option<CodeLocation> {
    let obj = value.as_object()?;
    let file = obj.get("file")?.as_str()?.to_string();
    let line = obj.get("line").and_then(Value::as_i64).unwrap_or(0);
    Some(CodeLocation { file, line })
}

fn finding_from_value(value: &Value) -> Option<FindingPayload> {
    let obj = value.as_object()?;
    let rationale = obj
        .get("rationale")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let severity = obj
        .get("severity")
        .and_then(Value::as_str)
        .and_then(Severity::parse);
    let locations: Vec<CodeLocation> = obj
        .get("locations")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(location_from_value).collect())
        .unwrap_or_default();
    if rationale.is_empty() && locations.is_empty() && severity.is_none() {
        return None;
    }
    Some(FindingPayload {
        severity,
        locations,
        rationale,
    })
}

fn findings_from_value(value: &Value) -> Option<Vec<FindingPayload>> {
    let array = match value {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => map.get("findings")?.as_array()?.as_slice(),
        _ => return None,
    };
    let findings: Vec<FindingPayload> = array.iter().filter_map(finding_from_value).collect();
    Some(findings)
}

/// Extract a fenced ```json block, if present.
fn fenced_json(text: &str) -> Option<&str> {
    let start = text.find("```json")? + "```json".len();
    let rest = &text[start..];
    let end = rest.find("```")?;
    Some(rest[..end].trim())
}

/// Decode a scan response into its tagged form.
///
/// The ladder: whole body as JSON, then a fenced ```json block, then plain
/// rationale text, then `Unparseable` for blank output.
pub fn parse_response(text: &str) -> ParsedResponse {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return ParsedResponse::Unparseable;
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if let Some(findings) = findings_from_value(&value) {
            return ParsedResponse::Structured(findings);
        }
    }
    if let Some(block) = fenced_json(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(block) {
            if let Some(findings) = findings_from_value(&value) {
                return ParsedResponse::Structured(findings);
            }
        }
    }

    ParsedResponse::RationaleOnly(trimmed.to_string())
}
