//! Convergence engine: collapse a population of raw hypotheses into a
//! finite set of distinct claims.
//!
//! The space of distinct claims a reasoning service produces for a fixed
//! input is empirically finite even though raw sampling is unbounded;
//! clustering converts the open-ended stream into the closed set worth
//! confirming. The partition must be idempotent so interrupted runs can
//! safely re-cluster.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use indexmap::IndexMap;
use regex::Regex;

use crate::models::{Hypothesis, HypothesisCluster};

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]+").unwrap());

fn rationale_tokens(text: &str) -> BTreeSet<String> {
    TOKEN_RE
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

/// Two hypotheses carry the same claim when their primary locations
/// coincide, or their rationale token sets are similar enough. Rule keys
/// are compared by the caller (clusters never span rules).
fn same_claim(a: &Hypothesis, b: &Hypothesis, threshold: f64) -> bool {
    if let (Some(loc_a), Some(loc_b)) = (a.primary_location(), b.primary_location()) {
        if loc_a == loc_b {
            return true;
        }
    }
    jaccard(
        &rationale_tokens(&a.rationale),
        &rationale_tokens(&b.rationale),
    ) >= threshold
}

/// Stable ordering key so the partition never depends on arrival order.
fn sort_key(h: &Hypothesis) -> (u32, String, String) {
    let location = h
        .primary_location()
        .map(|l| format!("{}:{}", l.file, l.line))
        .unwrap_or_default();
    (h.iteration, location, h.rationale.clone())
}

/// Pick the canonical representative: most complete structured fields,
/// ties broken by earliest iteration, then by rationale text.
fn representative(members: &[Hypothesis]) -> Hypothesis {
    members
        .iter()
        .min_by(|a, b| {
            b.completeness()
                .cmp(&a.completeness())
                .then(a.iteration.cmp(&b.iteration))
                .then(a.rationale.cmp(&b.rationale))
        })
        .cloned()
        .expect("cluster cannot be empty")
}

/// Partition hypotheses into clusters of equivalent claims.
///
/// Greedy single-linkage over a deterministic ordering: a hypothesis joins
/// the first existing cluster (in creation order) containing any member it
/// matches, otherwise it seeds a new cluster. Clustering the same set twice
/// yields the same partition.
pub fn cluster(hypotheses: &[Hypothesis], threshold: f64) -> Vec<HypothesisCluster> {
    // Group by rule key first; clusters never span rules.
    let mut by_rule: IndexMap<String, Vec<Hypothesis>> = IndexMap::new();
    let mut sorted: Vec<Hypothesis> = hypotheses.to_vec();
    sorted.sort_by_key(sort_key);
    for hypothesis in sorted {
        by_rule
            .entry(hypothesis.rule_key.clone())
            .or_default()
            .push(hypothesis);
    }
    by_rule.sort_keys();

    let mut clusters: Vec<HypothesisCluster> = Vec::new();

    for (rule_key, group) in by_rule {
        let mut partitions: Vec<Vec<Hypothesis>> = Vec::new();
        for hypothesis in group {
            let joined = partitions.iter_mut().find(|members| {
                members
                    .iter()
                    .any(|member| same_claim(member, &hypothesis, threshold))
            });
            match joined {
                Some(members) => members.push(hypothesis),
                None => partitions.push(vec![hypothesis]),
            }
        }
        for members in partitions {
            clusters.push(HypothesisCluster {
                rule_key: rule_key.clone(),
                representative: representative(&members),
                members,
            });
        }
    }

    clusters
}
