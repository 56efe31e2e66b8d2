//! Confirm phase: a multi-round voting protocol over each canonical claim.
//!
//! Rounds run sequentially; within a round the votes are independent,
//! adversarial re-examinations collected concurrently. Once the accumulated
//! votes satisfy the decision ratio in either direction, remaining rounds
//! are skipped. A claim that never reaches a threshold stays unconfirmed,
//! the conservative default against false positives.

use rayon::prelude::*;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{ConfirmConfig, RetryPolicy};
use crate::errors::QuorumResult;
use crate::models::{ConfirmationVote, HypothesisCluster, Task, Verdict, VoteJudgment};
use crate::reasoning::{PromptKit, ReasoningRequest, ReasoningService, VOTE_SCHEMA_HINT};
use crate::retry::with_backoff;
use crate::store::TaskStore;

/// Result of the voting protocol for one cluster.
#[derive(Clone, Debug)]
pub struct ConfirmationOutcome {
    pub verdict: Verdict,
    pub votes: Vec<ConfirmationVote>,
    pub rounds_run: u32,
}

/// Decode one vote response. Accepts the structured `{"vote": "yes"|"no"}`
/// form or a bare leading yes/no; anything else abstains.
fn parse_vote(text: &str) -> (VoteJudgment, String) {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if let Some(obj) = value.as_object() {
            let vote = obj.get("vote").and_then(Value::as_str).unwrap_or("");
            let rationale = obj
                .get("rationale")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            let judgment = match vote.trim().to_lowercase().as_str() {
                "yes" | "confirmed" | "true" => VoteJudgment::Affirm,
                "no" | "rejected" | "false" => VoteJudgment::Reject,
                _ => VoteJudgment::Abstain,
            };
            return (judgment, rationale);
        }
    }
    let first_word = trimmed
        .split_whitespace()
        .next()
        .unwrap_or("")
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase();
    let judgment = match first_word.as_str() {
        "yes" | "confirmed" => VoteJudgment::Affirm,
        "no" | "rejected" => VoteJudgment::Reject,
        _ => VoteJudgment::Abstain,
    };
    (judgment, trimmed.to_string())
}

/// Runs the voting protocol for confirm tasks on a caller-provided pool,
/// independent of the scan pool.
pub struct ConfirmationEngine<'a> {
    service: &'a dyn ReasoningService,
    store: &'a TaskStore,
    kit: &'a PromptKit,
    config: &'a ConfirmConfig,
    retry: &'a RetryPolicy,
}

impl<'a> ConfirmationEngine<'a> {
    pub fn new(
        service: &'a dyn ReasoningService,
        store: &'a TaskStore,
        kit: &'a PromptKit,
        config: &'a ConfirmConfig,
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

    fn collect_vote(
        &self,
        task: &Task,
        bundle_text: &str,
        cluster: &HypothesisCluster,
        round: u32,
        request_index: u32,
    ) -> ConfirmationVote {
        let request = ReasoningRequest {
            prompt: self.kit.confirm_prompt(bundle_text, &cluster.representative),
            rule_key: cluster.rule_key.clone(),
            schema_hint: VOTE_SCHEMA_HINT,
        };

        match with_backoff(self.retry, "confirm", || self.service.complete(&request)) {
            Ok(response) => {
                let (judgment, rationale) = parse_vote(&response.text);
                ConfirmationVote {
                    round,
                    request: request_index,
                    judgment,
                    rationale,
                }
            }
            Err(err) => {
                // A failed vote is an abstention, not a vote for either side.
                warn!(
                    uuid = task.uuid.as_str(),
                    round, request_index, "vote abstained: {err}"
                );
                ConfirmationVote {
                    round,
                    request: request_index,
                    judgment: VoteJudgment::Abstain,
                    rationale: String::new(),
                }
            }
        }
    }

    fn decide(&self, votes: &[ConfirmationVote]) -> Option<Verdict> {
        let total = votes.len();
        if total == 0 {
            return None;
        }
        let affirm = votes
            .iter()
            .filter(|v| v.judgment == VoteJudgment::Affirm)
            .count();
        let reject = votes
            .iter()
            .filter(|v| v.judgment == VoteJudgment::Reject)
            .count();
        let ratio = self.config.decision_ratio;
        if affirm as f64 / total as f64 >= ratio {
            Some(Verdict::Confirmed)
        } else if reject as f64 / total as f64 >= ratio {
            Some(Verdict::Rejected)
        } else {
            None
        }
    }

    /// Run the rounds for one cluster on `pool`.
    pub fn run(
        &self,
        pool: &rayon::ThreadPool,
        task: &Task,
        bundle_text: &str,
        cluster: &HypothesisCluster,
    ) -> QuorumResult<ConfirmationOutcome> {
        let mut votes: Vec<ConfirmationVote> = Vec::new();
        let mut rounds_run = 0u32;
        let mut verdict: Option<Verdict> = None;

        for round in 1..=self.config.rounds {
            if self.store.is_cancelled(&task.uuid).unwrap_or(false) {
                debug!(uuid = task.uuid.as_str(), "confirmation cancelled");
                break;
            }
            rounds_run = round;

            let round_votes: Vec<ConfirmationVote> = pool.install(|| {
                (1..=self.config.requests_per_round)
                    .into_par_iter()
                    .map(|request_index| {
                        self.collect_vote(task, bundle_text, cluster, round, request_index)
                    })
                    .collect()
            });

            for vote in &round_votes {
                if let Err(err) = self.store.append_vote(&task.uuid, vote) {
                    warn!(uuid = task.uuid.as_str(), "failed to persist vote: {err}");
                }
            }
            votes.extend(round_votes);

            // Early exit: a threshold met after any completed round skips
            // the remaining rounds.
            if let Some(decided) = self.decide(&votes) {
                verdict = Some(decided);
                break;
            }
        }

        let verdict = verdict.unwrap_or(Verdict::Unconfirmed);
        debug!(
            uuid = task.uuid.as_str(),
            verdict = verdict.as_str(),
            rounds = rounds_run,
            "confirmation complete"
        );
        Ok(ConfirmationOutcome {
            verdict,
            votes,
            rounds_run,
        })
    }
}
