//! Context bundle assembly: structural plus semantic retrieval under a
//! byte budget.
//!
//! Selection order is a design invariant: flow members always survive,
//! call-graph neighbors outrank embedding neighbors when space runs out.
//! Construction is deterministic for identical inputs.

use std::collections::BTreeMap;
use std::collections::HashSet;

use tracing::debug;

use crate::config::ContextConfig;
use crate::embedding::EmbeddingIndex;
use crate::indexer::callgraph::CallGraph;
use crate::models::{BusinessFlow, ContextBundle, FunctionRecord};

/// Rough token estimate for budget accounting elsewhere; bundles themselves
/// are budgeted in bytes.
pub fn estimate_tokens(text: &str) -> i64 {
    if text.is_empty() {
        return 0;
    }
    (text.len() as f64 / 3.5).max(1.0) as i64
}

/// Assembles bounded context bundles for business flows over one frozen
/// snapshot. The embedding index is optional: with no index available every
/// flow simply has zero semantic neighbors.
pub struct ContextAssembler<'a> {
    records: &'a BTreeMap<String, FunctionRecord>,
    graph: &'a CallGraph,
    index: Option<&'a EmbeddingIndex>,
    config: &'a ContextConfig,
}

impl<'a> ContextAssembler<'a> {
    pub fn new(
        records: &'a BTreeMap<String, FunctionRecord>,
        graph: &'a CallGraph,
        index: Option<&'a EmbeddingIndex>,
        config: &'a ContextConfig,
    ) -> Self {
        Self {
            records,
            graph,
            index,
            config,
        }
    }

    fn serialize_record(&self, record: &FunctionRecord, group: &str) -> String {
        format!(
            "// {}:{}-{} {} ({group})\n{}\n\n",
            record.file_path, record.start_line, record.end_line, record.qualified_name, record.text
        )
    }

    /// Build the bundle for one flow.
    ///
    /// Groups are collected in priority order (flow members, 1-hop
    /// call-graph neighbors in both directions, top-k embedding neighbors of
    /// sufficiently long flow members), deduplicated by record id, each
    /// group internally ordered by id. Over budget, records are dropped from
    /// the tail of the embedding group first, then the call-graph group;
    /// flow members are never dropped.
    pub fn assemble(&self, flow: &BusinessFlow) -> ContextBundle {
        let mut present: HashSet<&str> = HashSet::new();

        // Group 1: the flow's own records, ordered by id.
        let mut flow_ids: Vec<&str> = flow
            .function_ids
            .iter()
            .filter(|id| self.records.contains_key(id.as_str()))
            .map(String::as_str)
            .collect();
        flow_ids.sort_unstable();
        flow_ids.dedup();
        present.extend(flow_ids.iter().copied());

        // Group 2: 1-hop call-graph neighbors not already present.
        let mut call_ids: Vec<String> = Vec::new();
        for id in &flow_ids {
            for neighbor in self.graph.neighbors(id) {
                if self.records.contains_key(&neighbor) && !present.contains(neighbor.as_str()) {
                    call_ids.push(neighbor);
                }
            }
        }
        call_ids.sort_unstable();
        call_ids.dedup();
        for id in &call_ids {
            present.insert(id.as_str());
        }

        // Group 3: embedding neighbors of flow members with enough content.
        let mut embed_ids: Vec<String> = Vec::new();
        if let Some(index) = self.index {
            for id in &flow_ids {
                let record = &self.records[*id];
                if record.text.len() < self.config.min_embed_len {
                    continue;
                }
                for neighbor in index.query_by_id(id, self.config.embedding_neighbors) {
                    if self.records.contains_key(&neighbor)
                        && !present.contains(neighbor.as_str())
                        && !embed_ids.contains(&neighbor)
                    {
                        embed_ids.push(neighbor);
                    }
                }
            }
        }
        embed_ids.sort_unstable();

        // Serialize each group, then trim from the lowest-priority tail
        // until the budget holds.
        let flow_blocks: Vec<String> = flow_ids
            .iter()
            .map(|id| self.serialize_record(&self.records[*id], "flow"))
            .collect();
        let mut call_blocks: Vec<(String, String)> = call_ids
            .iter()
            .map(|id| {
                (
                    id.clone(),
                    self.serialize_record(&self.records[id.as_str()], "call_graph"),
                )
            })
            .collect();
        let mut embed_blocks: Vec<(String, String)> = embed_ids
            .iter()
            .map(|id| {
                (
                    id.clone(),
                    self.serialize_record(&self.records[id.as_str()], "embedding"),
                )
            })
            .collect();

        let flow_bytes: usize = flow_blocks.iter().map(String::len).sum();
        let mut total: usize = flow_bytes
            + call_blocks.iter().map(|(_, b)| b.len()).sum::<usize>()
            + embed_blocks.iter().map(|(_, b)| b.len()).sum::<usize>();
        let mut truncated = 0usize;

        while total > self.config.byte_budget {
            if let Some((_, block)) = embed_blocks.pop() {
                total -= block.len();
                truncated += 1;
            } else if let Some((_, block)) = call_blocks.pop() {
                total -= block.len();
                truncated += 1;
            } else {
                // Only flow members remain; they are never dropped.
                break;
            }
        }

        if truncated > 0 {
            debug!(
                flow = flow.name.as_str(),
                truncated, "bundle over budget, neighbors dropped"
            );
        }

        let mut text = String::with_capacity(total);
        for block in &flow_blocks {
            text.push_str(block);
        }
        for (_, block) in &call_blocks {
            text.push_str(block);
        }
        for (_, block) in &embed_blocks {
            text.push_str(block);
        }

        ContextBundle {
            flow_name: flow.name.clone(),
            bytes_used: text.len(),
            text,
            flow_ids: flow_ids.iter().map(|s| s.to_string()).collect(),
            call_neighbor_ids: call_blocks.into_iter().map(|(id, _)| id).collect(),
            embedding_neighbor_ids: embed_blocks.into_iter().map(|(id, _)| id).collect(),
            truncated,
        }
    }
}
