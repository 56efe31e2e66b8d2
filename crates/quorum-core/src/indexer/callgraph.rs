//! Call graph construction over a snapshot of function records.
//!
//! Resolution policy: a call name becomes an edge only when exactly one
//! record matches it by name within the caller's module scope, or failing
//! that, exactly one record matches snapshot-wide. Ambiguous and unresolved
//! names are dropped, never guessed.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::models::FunctionRecord;

/// A resolved call edge between two records.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallEdge {
    pub caller: String,
    pub callee: String,
    pub line: i64,
}

/// Directed call graph over record ids. Built once per snapshot, read-only
/// afterward; every referenced id exists in the snapshot by construction.
#[derive(Clone, Debug, Default)]
pub struct CallGraph {
    edges: Vec<CallEdge>,
    forward: BTreeMap<String, Vec<String>>,
    reverse: BTreeMap<String, Vec<String>>,
}

impl CallGraph {
    /// Build the graph from a snapshot's records.
    pub fn build(records: &BTreeMap<String, FunctionRecord>) -> Self {
        // Name index over all candidates.
        let mut by_name: HashMap<&str, Vec<&FunctionRecord>> = HashMap::new();
        for record in records.values() {
            by_name.entry(record.name.as_str()).or_default().push(record);
        }

        let mut edges: Vec<CallEdge> = Vec::new();
        let mut seen: HashSet<(String, String)> = HashSet::new();

        for caller in records.values() {
            for call in &caller.call_names {
                let candidates = match by_name.get(call.name.as_str()) {
                    Some(c) => c,
                    None => continue,
                };

                let same_module: Vec<&&FunctionRecord> = candidates
                    .iter()
                    .filter(|c| c.module_path == caller.module_path)
                    .collect();

                let target = if same_module.len() == 1 {
                    Some(*same_module[0])
                } else if same_module.is_empty() && candidates.len() == 1 {
                    Some(candidates[0])
                } else {
                    None // ambiguous, dropped
                };

                if let Some(target) = target {
                    let key = (caller.id.clone(), target.id.clone());
                    if seen.insert(key) {
                        edges.push(CallEdge {
                            caller: caller.id.clone(),
                            callee: target.id.clone(),
                            line: call.line,
                        });
                    }
                }
            }
        }

        edges.sort_by(|a, b| a.caller.cmp(&b.caller).then(a.callee.cmp(&b.callee)));

        let mut forward: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut reverse: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for edge in &edges {
            forward
                .entry(edge.caller.clone())
                .or_default()
                .push(edge.callee.clone());
            reverse
                .entry(edge.callee.clone())
                .or_default()
                .push(edge.caller.clone());
        }
        for list in forward.values_mut().chain(reverse.values_mut()) {
            list.sort();
            list.dedup();
        }

        Self {
            edges,
            forward,
            reverse,
        }
    }

    pub fn edges(&self) -> &[CallEdge] {
        &self.edges
    }

    /// Records directly called by `id`.
    pub fn callees(&self, id: &str) -> &[String] {
        self.forward.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Records that directly call `id`.
    pub fn callers(&self, id: &str) -> &[String] {
        self.reverse.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// One-hop neighbors in both directions, sorted and deduplicated.
    pub fn neighbors(&self, id: &str) -> Vec<String> {
        let mut out: Vec<String> = self
            .callees(id)
            .iter()
            .chain(self.callers(id).iter())
            .cloned()
            .collect();
        out.sort();
        out.dedup();
        out
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }
}
