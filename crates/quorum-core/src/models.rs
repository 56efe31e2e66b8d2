//! Shared typed models used across indexing, scheduling, and storage layers.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// Identity helpers
// ---------------------------------------------------------------------------

/// Derive a stable function-record identifier from a module path and a
/// qualified name (first 16 hex chars of SHA-256).
pub fn record_id(module_path: &str, qualified_name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(module_path.as_bytes());
    hasher.update(b"::");
    hasher.update(qualified_name.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

// ---------------------------------------------------------------------------
// Language / visibility
// ---------------------------------------------------------------------------

/// Source language of a parsed file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Language {
    Python,
    Java,
    TypeScript,
    Go,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Java => "java",
            Language::TypeScript => "typescript",
            Language::Go => "go",
        }
    }
}

/// Declared visibility of a symbol. Names with a leading underscore are
/// treated as private for languages without explicit modifiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Visibility {
    Public,
    Private,
}

// ---------------------------------------------------------------------------
// FunctionRecord
// ---------------------------------------------------------------------------

/// An unresolved call-site extracted from a function body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallName {
    pub name: String,
    pub line: i64,
    pub receiver: Option<String>,
}

/// One parsed function or method. Immutable once a snapshot has been parsed;
/// superseded, never mutated, on re-parse.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FunctionRecord {
    /// Stable id derived from module path + qualified name.
    pub id: String,
    pub language: Language,
    pub file_path: String,
    pub module_path: String,
    pub name: String,
    pub qualified_name: String,
    pub start_line: i64,
    pub end_line: i64,
    pub text: String,
    /// Declared outbound call names, unresolved at parse time.
    pub call_names: Vec<CallName>,
    pub visibility: Visibility,
}

// ---------------------------------------------------------------------------
// Locations / severity
// ---------------------------------------------------------------------------

/// A referenced source location inside a hypothesis.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CodeLocation {
    pub file: String,
    pub line: i64,
}

/// Severity attached to a candidate finding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// Lenient parse from service output; unknown values map to `None`.
    pub fn parse(value: &str) -> Option<Severity> {
        match value.trim().to_lowercase().as_str() {
            "info" | "informational" | "note" => Some(Severity::Info),
            "low" | "minor" => Some(Severity::Low),
            "medium" | "moderate" => Some(Severity::Medium),
            "high" | "major" => Some(Severity::High),
            "critical" | "severe" => Some(Severity::Critical),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// BusinessFlow
// ---------------------------------------------------------------------------

/// How a business flow was derived.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowOrigin {
    /// Derived from a call-graph entry point.
    EntryPoint,
    /// Supplied by the caller.
    Manual,
}

impl FlowOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowOrigin::EntryPoint => "entry_point",
            FlowOrigin::Manual => "manual",
        }
    }
}

/// One coherent unit of analysis: an entry function plus the functions it
/// structurally relates to. Ordered and deduplicated.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BusinessFlow {
    pub name: String,
    pub origin: FlowOrigin,
    pub function_ids: Vec<String>,
}

impl BusinessFlow {
    /// Build a caller-supplied flow, deduplicating ids while preserving order.
    pub fn manual(name: impl Into<String>, function_ids: Vec<String>) -> Self {
        let mut seen = std::collections::HashSet::new();
        let deduped: Vec<String> = function_ids
            .into_iter()
            .filter(|id| seen.insert(id.clone()))
            .collect();
        Self {
            name: name.into(),
            origin: FlowOrigin::Manual,
            function_ids: deduped,
        }
    }
}

// ---------------------------------------------------------------------------
// ContextBundle
// ---------------------------------------------------------------------------

/// Materialized, budget-bounded context text for one business flow.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContextBundle {
    pub flow_name: String,
    /// Serialized text: flow members, then call-graph neighbors, then
    /// embedding neighbors, each group ordered by record id.
    pub text: String,
    pub flow_ids: Vec<String>,
    pub call_neighbor_ids: Vec<String>,
    pub embedding_neighbor_ids: Vec<String>,
    pub bytes_used: usize,
    /// Number of neighbor records dropped to satisfy the budget.
    pub truncated: usize,
}

// ---------------------------------------------------------------------------
// Hypothesis
// ---------------------------------------------------------------------------

/// One raw candidate-vulnerability claim from one scan iteration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Hypothesis {
    pub flow_name: String,
    pub rule_key: String,
    pub iteration: u32,
    pub severity: Option<Severity>,
    pub locations: Vec<CodeLocation>,
    pub rationale: String,
}

impl Hypothesis {
    /// Count of populated structured fields, used when picking a cluster's
    /// canonical representative.
    pub fn completeness(&self) -> u32 {
        let mut score = 0;
        if self.severity.is_some() {
            score += 1;
        }
        if !self.locations.is_empty() {
            score += 1;
        }
        score
    }

    /// The first referenced location, if any.
    pub fn primary_location(&self) -> Option<&CodeLocation> {
        self.locations.first()
    }
}

/// A set of hypotheses judged equivalent, reduced to one canonical claim.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HypothesisCluster {
    pub rule_key: String,
    pub representative: Hypothesis,
    pub members: Vec<Hypothesis>,
}

// ---------------------------------------------------------------------------
// Confirmation
// ---------------------------------------------------------------------------

/// Categorical judgment of a single confirmation vote.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoteJudgment {
    Affirm,
    Reject,
    Abstain,
}

impl VoteJudgment {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteJudgment::Affirm => "affirm",
            VoteJudgment::Reject => "reject",
            VoteJudgment::Abstain => "abstain",
        }
    }

    pub fn parse(value: &str) -> Option<VoteJudgment> {
        match value.trim().to_lowercase().as_str() {
            "affirm" => Some(VoteJudgment::Affirm),
            "reject" => Some(VoteJudgment::Reject),
            "abstain" => Some(VoteJudgment::Abstain),
            _ => None,
        }
    }
}

/// One vote produced during one (round, request) pair of the confirm phase.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfirmationVote {
    pub round: u32,
    pub request: u32,
    pub judgment: VoteJudgment,
    pub rationale: String,
}

/// Final outcome for one cluster after the voting protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Confirmed,
    Rejected,
    /// No threshold reached after all configured rounds.
    Unconfirmed,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Confirmed => "confirmed",
            Verdict::Rejected => "rejected",
            Verdict::Unconfirmed => "unconfirmed",
        }
    }

    pub fn parse(value: &str) -> Option<Verdict> {
        match value.trim().to_lowercase().as_str() {
            "confirmed" => Some(Verdict::Confirmed),
            "rejected" => Some(Verdict::Rejected),
            "unconfirmed" => Some(Verdict::Unconfirmed),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// Which phase a persisted task belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskPhase {
    /// One task per (flow, rule key).
    Scan,
    /// One task per hypothesis cluster.
    Confirm,
}

impl TaskPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPhase::Scan => "scan",
            TaskPhase::Confirm => "confirm",
        }
    }

    pub fn parse(value: &str) -> Option<TaskPhase> {
        match value {
            "scan" => Some(TaskPhase::Scan),
            "confirm" => Some(TaskPhase::Confirm),
            _ => None,
        }
    }
}

/// Task state machine: `pending -> scanning -> scanned -> confirming ->
/// confirmed | rejected | failed`. Confirm-phase tasks skip the scan states
/// (`pending -> confirming`). Any non-terminal state may fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Pending,
    Scanning,
    Scanned,
    Confirming,
    Confirmed,
    Rejected,
    Failed,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Scanning => "scanning",
            TaskState::Scanned => "scanned",
            TaskState::Confirming => "confirming",
            TaskState::Confirmed => "confirmed",
            TaskState::Rejected => "rejected",
            TaskState::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<TaskState> {
        match value {
            "pending" => Some(TaskState::Pending),
            "scanning" => Some(TaskState::Scanning),
            "scanned" => Some(TaskState::Scanned),
            "confirming" => Some(TaskState::Confirming),
            "confirmed" => Some(TaskState::Confirmed),
            "rejected" => Some(TaskState::Rejected),
            "failed" => Some(TaskState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Confirmed | TaskState::Rejected | TaskState::Failed
        )
    }

    /// Whether `self -> to` is a valid transition.
    pub fn can_transition(&self, to: TaskState) -> bool {
        match (self, to) {
            (TaskState::Pending, TaskState::Scanning)
            | (TaskState::Pending, TaskState::Confirming)
            | (TaskState::Scanning, TaskState::Scanned)
            | (TaskState::Scanned, TaskState::Confirming)
            | (TaskState::Confirming, TaskState::Confirmed)
            | (TaskState::Confirming, TaskState::Rejected) => true,
            (from, TaskState::Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// The unit of persisted, resumable work.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub uuid: String,
    pub project_id: String,
    pub phase: TaskPhase,
    pub flow_name: String,
    pub rule_key: String,
    pub state: TaskState,
    pub verdict: Option<Verdict>,
    pub cancelled: bool,
    /// Scan task this confirm task was spawned from, if any.
    pub parent_uuid: Option<String>,
    /// Index of the owning cluster within the parent's partition.
    pub cluster_index: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

impl Task {
    /// Build a fresh scan-phase task for one (flow, rule key) pair.
    pub fn new_scan(project_id: &str, flow_name: &str, rule_key: &str) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            phase: TaskPhase::Scan,
            flow_name: flow_name.to_string(),
            rule_key: rule_key.to_string(),
            state: TaskState::Pending,
            verdict: None,
            cancelled: false,
            parent_uuid: None,
            cluster_index: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    /// Build a fresh confirm-phase task for one cluster of a scan task.
    pub fn new_confirm(parent: &Task, cluster_index: i64) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            project_id: parent.project_id.clone(),
            phase: TaskPhase::Confirm,
            flow_name: parent.flow_name.clone(),
            rule_key: parent.rule_key.clone(),
            state: TaskState::Pending,
            verdict: None,
            cancelled: false,
            parent_uuid: Some(parent.uuid.clone()),
            cluster_index: Some(cluster_index),
            created_at: String::new(),
            updated_at: String::new(),
        }
    }
}
