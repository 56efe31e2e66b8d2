//! Quorum core library — context assembly and hypothesis convergence for
//! reasoning-service-driven vulnerability analysis.
//!
//! The pipeline parses a multi-language snapshot into function records and a
//! call graph, builds a semantic similarity index, assembles bounded context
//! bundles per business flow, schedules deliberately repeated reasoning
//! queries to produce a hypothesis population, clusters that population into
//! distinct claims, and confirms each claim through a multi-round voting
//! protocol. Every unit of work is persisted in a resumable task store.

pub mod config;
pub mod confirm;
pub mod context;
pub mod converge;
pub mod embedding;
pub mod engine;
pub mod errors;
pub mod flows;
pub mod indexer;
pub mod models;
pub mod reasoning;
pub mod retry;
pub mod scan;
pub mod store;

pub use config::AnalysisConfig;
pub use engine::{AnalysisEngine, RunSummary};
pub use errors::{QuorumError, QuorumResult};
pub use indexer::pipeline::{parse_project, parse_sources, ProjectSnapshot};
pub use models::{
    BusinessFlow, ContextBundle, Hypothesis, HypothesisCluster, Task, TaskState, Verdict,
};
pub use reasoning::{PromptKit, ReasoningService};
pub use store::TaskStore;
