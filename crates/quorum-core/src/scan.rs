//! Scan phase: repeated, independent reasoning queries per context bundle.
//!
//! The same (bundle, rule key) pair is deliberately queried `iterations`
//! times: the reasoning service is non-deterministic and the divergent
//! outputs are the raw material the convergence engine works on. Iterations
//! share no mutable state, complete in any order, and fail independently.

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::config::{RetryPolicy, ScanConfig};
use crate::errors::QuorumResult;
use crate::models::{ContextBundle, Hypothesis, Task};
use crate::reasoning::{
    parse_response, ParsedResponse, PromptKit, ReasoningRequest, ReasoningService,
    FINDINGS_SCHEMA_HINT,
};
use crate::retry::with_backoff;
use crate::store::TaskStore;

/// Result of one scan pass over one task.
#[derive(Clone, Debug, Default)]
pub struct ScanOutcome {
    pub hypotheses: Vec<Hypothesis>,
    /// Iterations that produced nothing after exhausting their retries.
    pub failed_iterations: u32,
    /// Iterations skipped because the task was cancelled.
    pub skipped_iterations: u32,
}

/// Runs scan iterations for tasks on a caller-provided bounded pool.
pub struct HypothesisScheduler<'a> {
    service: &'a dyn ReasoningService,
    store: &'a TaskStore,
    kit: &'a PromptKit,
    config: &'a ScanConfig,
    retry: &'a RetryPolicy,
}

enum IterationResult {
    Produced(Vec<Hypothesis>),
    Failed,
    Skipped,
}

impl<'a> HypothesisScheduler<'a> {
    pub fn new(
        service: &'a dyn ReasoningService,
        store: &'a TaskStore,
        kit: &'a PromptKit,
        config: &'a ScanConfig,
        retry: &'a RetryPolicy,
    ) -> Self {
        Self {
            service,
            store,
            kit,
            config,
            retry,
        }
    }

    fn run_iteration(&self, task: &Task, bundle: &ContextBundle, iteration: u32) -> IterationResult {
        // Cooperative cancellation: checked before the expensive call.
        match self.store.is_cancelled(&task.uuid) {
            Ok(true) => return IterationResult::Skipped,
            Ok(false) => {}
            Err(err) => {
                warn!(uuid = task.uuid.as_str(), "cancellation check failed: {err}");
            }
        }

        let request = ReasoningRequest {
            prompt: self.kit.scan_prompt(bundle, &task.rule_key),
            rule_key: task.rule_key.clone(),
            schema_hint: FINDINGS_SCHEMA_HINT,
        };

        let response = match with_backoff(self.retry, "scan", || self.service.complete(&request)) {
            Ok(response) => response,
            Err(err) => {
                // The absence of a hypothesis is not an error for the task.
                warn!(
                    uuid = task.uuid.as_str(),
                    iteration, "iteration produced no hypotheses: {err}"
                );
                return IterationResult::Failed;
            }
        };

        let hypotheses: Vec<Hypothesis> = match parse_response(&response.text) {
            ParsedResponse::Structured(findings) => findings
                .into_iter()
                .map(|finding| Hypothesis {
                    flow_name: task.flow_name.clone(),
                    rule_key: task.rule_key.clone(),
                    iteration,
                    severity: finding.severity,
                    locations: finding.locations,
                    rationale: finding.rationale,
                })
                .collect(),
            ParsedResponse::RationaleOnly(rationale) => vec![Hypothesis {
                flow_name: task.flow_name.clone(),
                rule_key: task.rule_key.clone(),
                iteration,
                severity: None,
                locations: Vec::new(),
                rationale,
            }],
            ParsedResponse::Unparseable => Vec::new(),
        };

        for hypothesis in &hypotheses {
            if let Err(err) = self.store.append_hypothesis(&task.uuid, hypothesis) {
                warn!(uuid = task.uuid.as_str(), "failed to persist hypothesis: {err}");
            }
        }

        IterationResult::Produced(hypotheses)
    }

    /// Run all configured iterations for one task on `pool`.
    pub fn run(
        &self,
        pool: &rayon::ThreadPool,
        task: &Task,
        bundle: &ContextBundle,
    ) -> QuorumResult<ScanOutcome> {
        let iterations = self.config.iterations;
        let results: Vec<IterationResult> = pool.install(|| {
            (0..iterations)
                .into_par_iter()
                .map(|iteration| self.run_iteration(task, bundle, iteration))
                .collect()
        });

        let mut outcome = ScanOutcome::default();
        for result in results {
            match result {
                IterationResult::Produced(hypotheses) => outcome.hypotheses.extend(hypotheses),
                IterationResult::Failed => outcome.failed_iterations += 1,
                IterationResult::Skipped => outcome.skipped_iterations += 1,
            }
        }
        debug!(
            uuid = task.uuid.as_str(),
            produced = outcome.hypotheses.len(),
            failed = outcome.failed_iterations,
            "scan pass complete"
        );
        Ok(outcome)
    }
}
