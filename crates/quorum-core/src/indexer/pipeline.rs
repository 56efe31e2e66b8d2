//! Parse pipeline: filesystem scan, per-file extraction on a bounded Rayon
//! pool, and snapshot assembly.
//!
//! Per-file isolation is the contract here: a file that fails to read or
//! validate contributes zero records and one diagnostic, and never aborts
//! its siblings. The resulting snapshot is frozen before analysis begins.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

use rayon::prelude::*;
use tracing::{info, warn};

use crate::errors::QuorumResult;
use crate::indexer::callgraph::CallGraph;
use crate::indexer::filesystem::{scan_repo_files, SourceFile};
use crate::indexer::parser::validate_source;
use crate::indexer::symbols::extract_functions;
use crate::models::{FunctionRecord, Language};

/// A per-file parse failure, reported rather than thrown.
#[derive(Clone, Debug)]
pub struct ParseDiagnostic {
    pub file_path: String,
    pub stage: String,
    pub message: String,
}

/// Summary statistics from one parse run.
#[derive(Clone, Debug, Default)]
pub struct SnapshotStats {
    pub files_seen: usize,
    pub files_parsed: usize,
    pub records: usize,
    pub edges: usize,
    pub elapsed_ms: u128,
}

/// The frozen output of one parse run: records, call graph, diagnostics.
#[derive(Clone, Debug, Default)]
pub struct ProjectSnapshot {
    pub records: BTreeMap<String, FunctionRecord>,
    pub call_graph: CallGraph,
    pub diagnostics: Vec<ParseDiagnostic>,
    pub stats: SnapshotStats,
}

impl ProjectSnapshot {
    pub fn record(&self, id: &str) -> Option<&FunctionRecord> {
        self.records.get(id)
    }
}

enum FileOutcome {
    Parsed(Vec<FunctionRecord>),
    Failed(ParseDiagnostic),
}

fn parse_one(path: &str, language: Language, source: &str) -> FileOutcome {
    if let Err(message) = validate_source(language, source) {
        return FileOutcome::Failed(ParseDiagnostic {
            file_path: path.to_string(),
            stage: "validate".to_string(),
            message,
        });
    }
    FileOutcome::Parsed(extract_functions(source, path, language))
}

fn read_and_parse(file: &SourceFile) -> FileOutcome {
    let source = match std::fs::read_to_string(&file.absolute) {
        Ok(s) => s,
        Err(e) => {
            return FileOutcome::Failed(ParseDiagnostic {
                file_path: file.path.clone(),
                stage: "read".to_string(),
                message: e.to_string(),
            })
        }
    };
    parse_one(&file.path, file.language, &source)
}

fn assemble(outcomes: Vec<FileOutcome>, files_seen: usize, started: Instant) -> ProjectSnapshot {
    let mut records: BTreeMap<String, FunctionRecord> = BTreeMap::new();
    let mut diagnostics = Vec::new();
    let mut files_parsed = 0usize;

    for outcome in outcomes {
        match outcome {
            FileOutcome::Parsed(file_records) => {
                files_parsed += 1;
                for record in file_records {
                    if records.contains_key(&record.id) {
                        diagnostics.push(ParseDiagnostic {
                            file_path: record.file_path.clone(),
                            stage: "dedupe".to_string(),
                            message: format!(
                                "duplicate record id for {}; keeping the first occurrence",
                                record.qualified_name
                            ),
                        });
                        continue;
                    }
                    records.insert(record.id.clone(), record);
                }
            }
            FileOutcome::Failed(diagnostic) => {
                warn!(
                    file = diagnostic.file_path.as_str(),
                    stage = diagnostic.stage.as_str(),
                    "parse failure: {}",
                    diagnostic.message
                );
                diagnostics.push(diagnostic);
            }
        }
    }

    let call_graph = CallGraph::build(&records);
    let stats = SnapshotStats {
        files_seen,
        files_parsed,
        records: records.len(),
        edges: call_graph.edge_count(),
        elapsed_ms: started.elapsed().as_millis(),
    };
    info!(
        files = stats.files_parsed,
        records = stats.records,
        edges = stats.edges,
        "snapshot parsed"
    );

    ProjectSnapshot {
        records,
        call_graph,
        diagnostics,
        stats,
    }
}

/// Run a closure of per-file jobs on a bounded pool, falling back to
/// sequential execution when the pool cannot be built.
fn run_pool<T, F>(workers: usize, jobs: Vec<T>, worker: F) -> Vec<FileOutcome>
where
    T: Send + Sync,
    F: Fn(&T) -> FileOutcome + Send + Sync,
{
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build();
    match pool {
        Ok(pool) => pool.install(|| jobs.par_iter().map(&worker).collect()),
        Err(_) => jobs.iter().map(&worker).collect(),
    }
}

/// Parse a project directory into a frozen snapshot.
pub fn parse_project(root: &Path, workers: usize) -> QuorumResult<ProjectSnapshot> {
    let started = Instant::now();
    let files = scan_repo_files(root);
    let files_seen = files.len();
    let outcomes = run_pool(workers, files, read_and_parse);
    Ok(assemble(outcomes, files_seen, started))
}

/// Parse in-memory sources into a snapshot. Used by callers that already
/// hold file contents, and by tests.
pub fn parse_sources(
    sources: Vec<(String, Language, String)>,
    workers: usize,
) -> ProjectSnapshot {
    let started = Instant::now();
    let files_seen = sources.len();
    let outcomes = run_pool(workers, sources, |(path, language, text)| {
        parse_one(path, *language, text)
    });
    assemble(outcomes, files_seen, started)
}
