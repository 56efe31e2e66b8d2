//! Business-flow derivation from the call graph.
//!
//! An entry point is a record nobody calls; its flow is the entry plus its
//! callees expanded breadth-first to a bounded depth. Caller-supplied flows
//! come in through `BusinessFlow::manual`.

use std::collections::{HashSet, VecDeque};

use crate::config::FlowConfig;
use crate::indexer::pipeline::ProjectSnapshot;
use crate::models::{BusinessFlow, FlowOrigin};

/// Derive one flow per call-graph entry point, sorted by flow name.
pub fn derive_entry_flows(snapshot: &ProjectSnapshot, config: &FlowConfig) -> Vec<BusinessFlow> {
    let mut flows = Vec::new();

    for record in snapshot.records.values() {
        if !snapshot.call_graph.callers(&record.id).is_empty() {
            continue;
        }

        // Bounded BFS along callees; order of discovery is the flow order.
        let mut ids = vec![record.id.clone()];
        let mut seen: HashSet<String> = ids.iter().cloned().collect();
        let mut queue: VecDeque<(String, usize)> = VecDeque::new();
        queue.push_back((record.id.clone(), 0));

        while let Some((current, depth)) = queue.pop_front() {
            if depth >= config.max_depth {
                continue;
            }
            for callee in snapshot.call_graph.callees(&current) {
                if seen.insert(callee.clone()) {
                    ids.push(callee.clone());
                    queue.push_back((callee.clone(), depth + 1));
                }
            }
        }

        flows.push(BusinessFlow {
            name: record.qualified_name.clone(),
            origin: FlowOrigin::EntryPoint,
            function_ids: ids,
        });
    }

    flows.sort_by(|a, b| a.name.cmp(&b.name));
    flows
}
