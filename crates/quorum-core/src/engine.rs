//! Pipeline wiring: parse output in, verdicts out.
//!
//! The engine owns the two worker pools, creates or resumes tasks through
//! the store, and drives each one through scan, convergence, and
//! confirmation. Resumability lives entirely behind the store: anything
//! already terminal is skipped, anything caught mid-phase is replayed.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::AnalysisConfig;
use crate::context::ContextAssembler;
use crate::confirm::ConfirmationEngine;
use crate::converge::cluster;
use crate::embedding::{EmbeddingIndex, EmbeddingService};
use crate::errors::{QuorumError, QuorumResult};
use crate::flows::derive_entry_flows;
use crate::indexer::pipeline::ProjectSnapshot;
use crate::models::{BusinessFlow, ContextBundle, Task, TaskState, Verdict};
use crate::reasoning::{PromptKit, ReasoningService};
use crate::scan::HypothesisScheduler;
use crate::store::TaskStore;

/// Aggregate counts from one engine run. Partial failures show up here as
/// failed tasks, never as a lost unit of work.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub flows: usize,
    pub scan_tasks: usize,
    pub scan_tasks_skipped: usize,
    pub clusters: usize,
    pub confirmed: usize,
    pub rejected: usize,
    pub unconfirmed: usize,
    pub failed: usize,
}

/// Orchestrates the full analysis over one frozen snapshot.
pub struct AnalysisEngine {
    project_id: String,
    config: AnalysisConfig,
    store: Arc<TaskStore>,
    reasoning: Arc<dyn ReasoningService>,
    embedding: Option<Arc<dyn EmbeddingService>>,
    kit: PromptKit,
}

impl AnalysisEngine {
    pub fn new(
        project_id: impl Into<String>,
        config: AnalysisConfig,
        store: Arc<TaskStore>,
        reasoning: Arc<dyn ReasoningService>,
        embedding: Option<Arc<dyn EmbeddingService>>,
        kit: PromptKit,
    ) -> QuorumResult<Self> {
        Ok(Self {
            project_id: project_id.into(),
            config: config.validated()?,
            store,
            reasoning,
            embedding,
            kit,
        })
    }

    fn build_pool(&self, workers: usize, what: &str) -> QuorumResult<rayon::ThreadPool> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| QuorumError::Config(format!("failed to build {what} pool: {e}")))
    }

    /// Analyze flows derived from the snapshot's call-graph entry points.
    pub fn run(&self, snapshot: &ProjectSnapshot) -> QuorumResult<RunSummary> {
        let flows = derive_entry_flows(snapshot, &self.config.flows);
        self.run_flows(snapshot, &flows)
    }

    /// Analyze an explicit set of flows.
    pub fn run_flows(
        &self,
        snapshot: &ProjectSnapshot,
        flows: &[BusinessFlow],
    ) -> QuorumResult<RunSummary> {
        let rules = self.kit.rule_keys();
        if rules.is_empty() {
            warn!("no rule checklists configured; nothing to analyze");
            return Ok(RunSummary::default());
        }

        // The similarity index and bundles are built before either pool
        // starts; they stay read-only for the rest of the run.
        let index = self.embedding.as_ref().map(|service| {
            EmbeddingIndex::build(
                snapshot.records.values(),
                service.as_ref(),
                &self.config.retry,
            )
        });
        let assembler = ContextAssembler::new(
            &snapshot.records,
            &snapshot.call_graph,
            index.as_ref(),
            &self.config.context,
        );

        let scan_pool = self.build_pool(self.config.scan.workers, "scan")?;
        let confirm_pool = self.build_pool(self.config.confirm.workers, "confirm")?;

        let mut summary = RunSummary {
            flows: flows.len(),
            ..RunSummary::default()
        };

        for flow in flows {
            let bundle = assembler.assemble(flow);
            for rule_key in &rules {
                let result = self.process_scan_task(
                    &scan_pool,
                    &confirm_pool,
                    flow,
                    &bundle,
                    rule_key,
                    &mut summary,
                );
                if let Err(err) = result {
                    // Recover at task scope; only store corruption should
                    // abort the run, and that resurfaces on the next task.
                    warn!(
                        flow = flow.name.as_str(),
                        rule = rule_key.as_str(),
                        "task failed: {err}"
                    );
                    summary.failed += 1;
                    if let Ok(Some(task)) =
                        self.store.find_scan_task(&self.project_id, &flow.name, rule_key)
                    {
                        if !task.state.is_terminal() {
                            let _ = self.store.transition(&task.uuid, TaskState::Failed);
                        }
                    }
                }
            }
        }

        info!(
            flows = summary.flows,
            confirmed = summary.confirmed,
            rejected = summary.rejected,
            unconfirmed = summary.unconfirmed,
            failed = summary.failed,
            "analysis run complete"
        );
        Ok(summary)
    }

    fn process_scan_task(
        &self,
        scan_pool: &rayon::ThreadPool,
        confirm_pool: &rayon::ThreadPool,
        flow: &BusinessFlow,
        bundle: &ContextBundle,
        rule_key: &str,
        summary: &mut RunSummary,
    ) -> QuorumResult<()> {
        let task = match self
            .store
            .find_scan_task(&self.project_id, &flow.name, rule_key)?
        {
            Some(existing) => existing,
            None => {
                let task = Task::new_scan(&self.project_id, &flow.name, rule_key);
                self.store.create(&task)?;
                task
            }
        };

        if task.state.is_terminal() {
            summary.scan_tasks_skipped += 1;
            return Ok(());
        }
        if task.cancelled {
            summary.scan_tasks_skipped += 1;
            return Ok(());
        }
        summary.scan_tasks += 1;

        let scheduler = HypothesisScheduler::new(
            self.reasoning.as_ref(),
            &self.store,
            &self.kit,
            &self.config.scan,
            &self.config.retry,
        );

        match task.state {
            TaskState::Pending => {
                self.store.transition(&task.uuid, TaskState::Scanning)?;
                scheduler.run(scan_pool, &task, bundle)?;
                self.store.transition(&task.uuid, TaskState::Scanned)?;
            }
            TaskState::Scanning => {
                // Died mid-scan on a previous run: replay the iterations
                // from scratch so the population is not double-counted.
                self.store.clear_hypotheses(&task.uuid)?;
                scheduler.run(scan_pool, &task, bundle)?;
                self.store.transition(&task.uuid, TaskState::Scanned)?;
            }
            TaskState::Scanned | TaskState::Confirming => {}
            _ => unreachable!("terminal states were handled above"),
        }

        self.confirm_clusters(confirm_pool, &task, bundle, summary)
    }

    fn confirm_clusters(
        &self,
        confirm_pool: &rayon::ThreadPool,
        parent: &Task,
        bundle: &ContextBundle,
        summary: &mut RunSummary,
    ) -> QuorumResult<()> {
        let hypotheses = self.store.hypotheses_for_task(&parent.uuid)?;
        let clusters = cluster(&hypotheses, self.config.scan.similarity_threshold);
        summary.clusters += clusters.len();

        let parent_state = self.store.get(&parent.uuid)?.state;
        if parent_state == TaskState::Scanned {
            self.store.transition(&parent.uuid, TaskState::Confirming)?;
        }

        if clusters.is_empty() {
            // Nothing worth confirming; the conservative default applies.
            self.store.set_verdict(&parent.uuid, Verdict::Unconfirmed)?;
            self.store.transition(&parent.uuid, TaskState::Rejected)?;
            summary.unconfirmed += 1;
            return Ok(());
        }

        let engine = ConfirmationEngine::new(
            self.reasoning.as_ref(),
            &self.store,
            &self.kit,
            &self.config.confirm,
            &self.config.retry,
        );

        let mut any_confirmed = false;
        for (cluster_index, claim) in clusters.iter().enumerate() {
            let confirm_task = match self
                .store
                .find_confirm_task(&parent.uuid, cluster_index as i64)?
            {
                Some(existing) => existing,
                None => {
                    let task = Task::new_confirm(parent, cluster_index as i64);
                    self.store.create(&task)?;
                    task
                }
            };

            if confirm_task.state.is_terminal() {
                match confirm_task.verdict {
                    Some(Verdict::Confirmed) => {
                        any_confirmed = true;
                        summary.confirmed += 1;
                    }
                    Some(Verdict::Rejected) => summary.rejected += 1,
                    _ => summary.unconfirmed += 1,
                }
                continue;
            }

            if confirm_task.state == TaskState::Pending {
                self.store
                    .transition(&confirm_task.uuid, TaskState::Confirming)?;
            }

            let outcome = engine.run(confirm_pool, &confirm_task, &bundle.text, claim)?;
            self.store.set_verdict(&confirm_task.uuid, outcome.verdict)?;
            let final_state = match outcome.verdict {
                Verdict::Confirmed => TaskState::Confirmed,
                // Unconfirmed claims terminate as rejected with the exact
                // verdict kept on the row for reporting.
                Verdict::Rejected | Verdict::Unconfirmed => TaskState::Rejected,
            };
            self.store.transition(&confirm_task.uuid, final_state)?;

            match outcome.verdict {
                Verdict::Confirmed => {
                    any_confirmed = true;
                    summary.confirmed += 1;
                }
                Verdict::Rejected => summary.rejected += 1,
                Verdict::Unconfirmed => summary.unconfirmed += 1,
            }
        }

        let parent_verdict = if any_confirmed {
            Verdict::Confirmed
        } else {
            Verdict::Rejected
        };
        self.store.set_verdict(&parent.uuid, parent_verdict)?;
        let parent_final = match parent_verdict {
            Verdict::Confirmed => TaskState::Confirmed,
            _ => TaskState::Rejected,
        };
        self.store.transition(&parent.uuid, parent_final)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::config::RetryPolicy;
    use crate::errors::QuorumResult;
    use crate::indexer::pipeline::parse_sources;
    use crate::models::{Hypothesis, Language, TaskPhase};
    use crate::reasoning::{
        ReasoningRequest, ReasoningResponse, ReasoningService, VOTE_SCHEMA_HINT,
    };

    fn snapshot() -> ProjectSnapshot {
        parse_sources(
            vec![
                (
                    "app.py".into(),
                    Language::Python,
                    "def main():\n    helper()\n".into(),
                ),
                (
                    "util.py".into(),
                    Language::Python,
                    "def helper():\n    pass\n".into(),
                ),
            ],
            1,
        )
    }

    fn kit() -> PromptKit {
        let mut kit = PromptKit {
            scan_preamble: "scan for vulnerabilities".into(),
            confirm_preamble: "adversarially verify".into(),
            rules: Default::default(),
        };
        kit.rules.insert("injection".into(), "checklist".into());
        kit
    }

    fn config() -> AnalysisConfig {
        let mut config = AnalysisConfig::default();
        config.scan.iterations = 3;
        config.scan.workers = 2;
        config.confirm.workers = 2;
        config.confirm.rounds = 2;
        config.confirm.requests_per_round = 3;
        config.confirm.decision_ratio = 2.0 / 3.0;
        config.retry = RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            call_timeout: Duration::from_secs(1),
        };
        config
    }

    /// Deterministic service: scan requests yield one fixed finding, vote
    /// requests affirm. Calls are counted for resumability assertions.
    struct DeterministicService {
        calls: AtomicU32,
    }

    impl DeterministicService {
        fn new() -> Self {
            Self {
                calls: AtomicU32::new(0),
            }
        }
    }

    impl ReasoningService for DeterministicService {
        fn complete(&self, request: &ReasoningRequest) -> QuorumResult<ReasoningResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let text = if request.schema_hint == VOTE_SCHEMA_HINT {
                r#"{"vote":"yes","rationale":"reproducible"}"#.to_string()
            } else {
                r#"{"findings":[{"severity":"high","locations":[{"file":"app.py","line":2}],"rationale":"helper output flows into an unsanitized sink"}]}"#
                    .to_string()
            };
            Ok(ReasoningResponse { text })
        }
    }

    fn engine(store: Arc<TaskStore>, service: Arc<DeterministicService>) -> AnalysisEngine {
        AnalysisEngine::new("proj", config(), store, service, None, kit()).unwrap()
    }

    #[test]
    fn full_run_confirms_single_claim() {
        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        let service = Arc::new(DeterministicService::new());
        let engine = engine(store.clone(), service.clone());

        let summary = engine.run(&snapshot()).unwrap();
        assert_eq!(summary.flows, 1);
        assert_eq!(summary.scan_tasks, 1);
        assert_eq!(summary.clusters, 1);
        assert_eq!(summary.confirmed, 1);
        assert_eq!(summary.failed, 0);

        // 3 scan iterations + 3 first-round votes (unanimous early exit).
        assert_eq!(service.calls.load(Ordering::SeqCst), 6);

        // Everything is terminal and persisted.
        assert!(store.load_pending("proj").unwrap().is_empty());
        let scan_task = store
            .find_scan_task("proj", "app.main", "injection")
            .unwrap()
            .unwrap();
        assert_eq!(scan_task.state, TaskState::Confirmed);
        assert_eq!(scan_task.verdict, Some(Verdict::Confirmed));
        let confirm_task = store.find_confirm_task(&scan_task.uuid, 0).unwrap().unwrap();
        assert_eq!(confirm_task.phase, TaskPhase::Confirm);
        assert_eq!(confirm_task.state, TaskState::Confirmed);
    }

    #[test]
    fn rerun_skips_terminal_work() {
        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        let service = Arc::new(DeterministicService::new());
        let engine = engine(store.clone(), service.clone());

        engine.run(&snapshot()).unwrap();
        let calls_after_first = service.calls.load(Ordering::SeqCst);

        let summary = engine.run(&snapshot()).unwrap();
        assert_eq!(summary.scan_tasks, 0);
        assert_eq!(summary.scan_tasks_skipped, 1);
        // No further reasoning calls were issued.
        assert_eq!(service.calls.load(Ordering::SeqCst), calls_after_first);
    }

    #[test]
    fn interrupted_scan_replays_to_same_verdicts() {
        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        let service = Arc::new(DeterministicService::new());

        // Simulate a run killed mid-scan: the task sits in `scanning` with
        // a partial hypothesis population.
        let task = Task::new_scan("proj", "app.main", "injection");
        store.create(&task).unwrap();
        store.transition(&task.uuid, TaskState::Scanning).unwrap();
        store
            .append_hypothesis(
                &task.uuid,
                &Hypothesis {
                    flow_name: "app.main".into(),
                    rule_key: "injection".into(),
                    iteration: 0,
                    severity: None,
                    locations: vec![],
                    rationale: "partial leftover from the dead run".into(),
                },
            )
            .unwrap();

        let engine = engine(store.clone(), service);
        let summary = engine.run(&snapshot()).unwrap();

        // The replay converges to the same single confirmed claim an
        // uninterrupted run produces; the leftover does not survive.
        assert_eq!(summary.clusters, 1);
        assert_eq!(summary.confirmed, 1);
        let hypotheses = store.hypotheses_for_task(&task.uuid).unwrap();
        assert_eq!(hypotheses.len(), 3);
        assert!(hypotheses
            .iter()
            .all(|h| h.rationale != "partial leftover from the dead run"));
    }

    #[test]
    fn cancelled_task_is_skipped() {
        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        let service = Arc::new(DeterministicService::new());

        let task = Task::new_scan("proj", "app.main", "injection");
        store.create(&task).unwrap();
        store.cancel(&task.uuid).unwrap();

        let engine = engine(store.clone(), service.clone());
        let summary = engine.run(&snapshot()).unwrap();
        assert_eq!(summary.scan_tasks_skipped, 1);
        assert_eq!(service.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn empty_rule_set_is_a_noop() {
        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        let service = Arc::new(DeterministicService::new());
        let engine = AnalysisEngine::new(
            "proj",
            config(),
            store,
            service.clone(),
            None,
            PromptKit::default(),
        )
        .unwrap();

        let summary = engine.run(&snapshot()).unwrap();
        assert_eq!(summary, RunSummary::default());
        assert_eq!(service.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unparseable_scan_output_ends_unconfirmed() {
        /// Blank scan output, so no hypotheses ever materialize.
        struct SilentService;
        impl ReasoningService for SilentService {
            fn complete(&self, _request: &ReasoningRequest) -> QuorumResult<ReasoningResponse> {
                Ok(ReasoningResponse {
                    text: String::new(),
                })
            }
        }

        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        let engine = AnalysisEngine::new(
            "proj",
            config(),
            store.clone(),
            Arc::new(SilentService),
            None,
            kit(),
        )
        .unwrap();

        let summary = engine.run(&snapshot()).unwrap();
        assert_eq!(summary.clusters, 0);
        assert_eq!(summary.unconfirmed, 1);

        let task = store
            .find_scan_task("proj", "app.main", "injection")
            .unwrap()
            .unwrap();
        assert_eq!(task.state, TaskState::Rejected);
        assert_eq!(task.verdict, Some(Verdict::Unconfirmed));
    }

    #[test]
    fn manual_flows_are_analyzed() {
        let store = Arc::new(TaskStore::open_in_memory().unwrap());
        let service = Arc::new(DeterministicService::new());
        let engine = engine(store, service);

        let snapshot = snapshot();
        let helper_id = snapshot
            .records
            .values()
            .find(|r| r.name == "helper")
            .unwrap()
            .id
            .clone();
        let flows = vec![BusinessFlow::manual("helper_only", vec![helper_id])];

        let summary = engine.run_flows(&snapshot, &flows).unwrap();
        assert_eq!(summary.flows, 1);
        assert_eq!(summary.confirmed, 1);
    }
}
