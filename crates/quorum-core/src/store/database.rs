//! SQLite task store: the single owner of all Task state.
//!
//! One connection behind a mutex serializes every mutation, which is what
//! gives the per-id write discipline the worker pools rely on. Tasks are
//! never deleted, only driven to a terminal state; hypotheses and votes are
//! immutable once attached.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::errors::{QuorumError, QuorumResult};
use crate::models::{
    ConfirmationVote, Hypothesis, Task, TaskPhase, TaskState, Verdict, VoteJudgment,
};
use crate::store::schema;

/// Persistent, resumable task state keyed by uuid.
pub struct TaskStore {
    conn: Mutex<Connection>,
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let phase_raw: String = row.get("phase")?;
    let state_raw: String = row.get("state")?;
    let verdict_raw: Option<String> = row.get("verdict")?;
    Ok(Task {
        uuid: row.get("uuid")?,
        project_id: row.get("project_id")?,
        phase: TaskPhase::parse(&phase_raw).unwrap_or(TaskPhase::Scan),
        flow_name: row.get("flow_name")?,
        rule_key: row.get("rule_key")?,
        state: TaskState::parse(&state_raw).unwrap_or(TaskState::Failed),
        verdict: verdict_raw.as_deref().and_then(Verdict::parse),
        cancelled: row.get::<_, i64>("cancelled")? != 0,
        parent_uuid: row.get("parent_uuid")?,
        cluster_index: row.get("cluster_index")?,
        created_at: row.get::<_, Option<String>>("created_at")?.unwrap_or_default(),
        updated_at: row.get::<_, Option<String>>("updated_at")?.unwrap_or_default(),
    })
}

const TASK_COLUMNS: &str = "uuid, project_id, phase, flow_name, rule_key, state, verdict, \
                            cancelled, parent_uuid, cluster_index, created_at, updated_at";

impl TaskStore {
    /// Open (creating if needed) a store at `path`, initialise the schema,
    /// and run pending migrations.
    pub fn open(path: &Path) -> QuorumResult<TaskStore> {
        let resolved: PathBuf = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&resolved)?;
        Self::init(&conn)?;
        Ok(TaskStore {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store, used by tests and dry runs.
    pub fn open_in_memory() -> QuorumResult<TaskStore> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(TaskStore {
            conn: Mutex::new(conn),
        })
    }

    fn init(conn: &Connection) -> QuorumResult<()> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        for stmt in schema::SCHEMA_STATEMENTS {
            conn.execute_batch(stmt)?;
        }
        schema::migrate_schema(conn)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Task CRUD
    // -----------------------------------------------------------------------

    /// Insert a new task row in its initial state.
    pub fn create(&self, task: &Task) -> QuorumResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO tasks ( \
                 uuid, project_id, phase, flow_name, rule_key, state, verdict, \
                 cancelled, parent_uuid, cluster_index \
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10);",
            params![
                task.uuid,
                task.project_id,
                task.phase.as_str(),
                task.flow_name,
                task.rule_key,
                task.state.as_str(),
                task.verdict.map(|v| v.as_str()),
                task.cancelled as i64,
                task.parent_uuid,
                task.cluster_index,
            ],
        )?;
        debug!(uuid = task.uuid.as_str(), phase = task.phase.as_str(), "task created");
        Ok(())
    }

    /// Load one task by uuid.
    pub fn get(&self, uuid: &str) -> QuorumResult<Task> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE uuid = ?1;");
        conn.query_row(&sql, params![uuid], row_to_task)
            .optional()?
            .ok_or_else(|| QuorumError::TaskNotFound(uuid.to_string()))
    }

    /// Find the scan task for one (project, flow, rule) triple, if any.
    pub fn find_scan_task(
        &self,
        project_id: &str,
        flow_name: &str,
        rule_key: &str,
    ) -> QuorumResult<Option<Task>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE project_id = ?1 AND phase = 'scan' \
               AND flow_name = ?2 AND rule_key = ?3 \
             ORDER BY created_at DESC, uuid DESC LIMIT 1;"
        );
        let task = conn
            .query_row(&sql, params![project_id, flow_name, rule_key], row_to_task)
            .optional()?;
        Ok(task)
    }

    /// Find the confirm task for one cluster of a scan task, if any.
    pub fn find_confirm_task(
        &self,
        parent_uuid: &str,
        cluster_index: i64,
    ) -> QuorumResult<Option<Task>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE parent_uuid = ?1 AND cluster_index = ?2 \
             ORDER BY created_at DESC, uuid DESC LIMIT 1;"
        );
        let task = conn
            .query_row(&sql, params![parent_uuid, cluster_index], row_to_task)
            .optional()?;
        Ok(task)
    }

    /// Transition a task to a new state, rejecting anything the state
    /// machine does not allow. An invalid transition leaves the stored state
    /// unchanged.
    pub fn transition(&self, uuid: &str, to: TaskState) -> QuorumResult<()> {
        let conn = self.conn.lock();
        let current_raw: Option<String> = conn
            .query_row(
                "SELECT state FROM tasks WHERE uuid = ?1;",
                params![uuid],
                |row| row.get(0),
            )
            .optional()?;
        let current_raw = current_raw.ok_or_else(|| QuorumError::TaskNotFound(uuid.to_string()))?;
        let current = TaskState::parse(&current_raw)
            .ok_or_else(|| QuorumError::Store(format!("unknown stored state {current_raw}")))?;

        if !current.can_transition(to) {
            return Err(QuorumError::InvalidTransition {
                uuid: uuid.to_string(),
                from: current.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }

        conn.execute(
            "UPDATE tasks SET state = ?1, updated_at = CURRENT_TIMESTAMP WHERE uuid = ?2;",
            params![to.as_str(), uuid],
        )?;
        debug!(uuid, from = current.as_str(), to = to.as_str(), "task transition");
        Ok(())
    }

    /// Record the final verdict for a task.
    pub fn set_verdict(&self, uuid: &str, verdict: Verdict) -> QuorumResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE tasks SET verdict = ?1, updated_at = CURRENT_TIMESTAMP WHERE uuid = ?2;",
            params![verdict.as_str(), uuid],
        )?;
        if changed == 0 {
            return Err(QuorumError::TaskNotFound(uuid.to_string()));
        }
        Ok(())
    }

    /// All tasks for a project that have not reached a terminal state,
    /// oldest first. This is the single resumability surface: a restarted
    /// run reprocesses exactly what this returns.
    pub fn load_pending(&self, project_id: &str) -> QuorumResult<Vec<Task>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE project_id = ?1 \
               AND state NOT IN ('confirmed', 'rejected', 'failed') \
             ORDER BY created_at ASC, uuid ASC;"
        );
        let mut stmt = conn.prepare(&sql)?;
        let tasks: Vec<Task> = stmt
            .query_map(params![project_id], row_to_task)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(tasks)
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    /// Mark a task cancelled. Workers check this flag before each expensive
    /// call; there is no forced interruption.
    pub fn cancel(&self, uuid: &str) -> QuorumResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE tasks SET cancelled = 1, updated_at = CURRENT_TIMESTAMP WHERE uuid = ?1;",
            params![uuid],
        )?;
        if changed == 0 {
            return Err(QuorumError::TaskNotFound(uuid.to_string()));
        }
        Ok(())
    }

    pub fn is_cancelled(&self, uuid: &str) -> QuorumResult<bool> {
        let conn = self.conn.lock();
        let cancelled: Option<i64> = conn
            .query_row(
                "SELECT cancelled FROM tasks WHERE uuid = ?1;",
                params![uuid],
                |row| row.get(0),
            )
            .optional()?;
        Ok(cancelled.unwrap_or(0) != 0)
    }

    // -----------------------------------------------------------------------
    // Hypotheses
    // -----------------------------------------------------------------------

    /// Attach one immutable hypothesis to a task.
    pub fn append_hypothesis(&self, uuid: &str, hypothesis: &Hypothesis) -> QuorumResult<()> {
        let locations_json = serde_json::to_string(&hypothesis.locations)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO hypotheses ( \
                 task_uuid, flow_name, rule_key, iteration, severity, locations_json, rationale \
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7);",
            params![
                uuid,
                hypothesis.flow_name,
                hypothesis.rule_key,
                hypothesis.iteration,
                hypothesis.severity.map(|s| s.as_str()),
                locations_json,
                hypothesis.rationale,
            ],
        )?;
        Ok(())
    }

    /// Drop all hypotheses attached to a task. Used when a run resumes a
    /// task that died mid-scan and replays its iterations from scratch.
    pub fn clear_hypotheses(&self, uuid: &str) -> QuorumResult<usize> {
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM hypotheses WHERE task_uuid = ?1;",
            params![uuid],
        )?;
        Ok(deleted)
    }

    /// Load a task's hypotheses ordered by (iteration, insertion).
    pub fn hypotheses_for_task(&self, uuid: &str) -> QuorumResult<Vec<Hypothesis>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT flow_name, rule_key, iteration, severity, locations_json, rationale \
             FROM hypotheses WHERE task_uuid = ?1 \
             ORDER BY iteration ASC, id ASC;",
        )?;
        let rows: Vec<(String, String, u32, Option<String>, String, String)> = stmt
            .query_map(params![uuid], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })?
            .filter_map(|r| r.ok())
            .collect();

        let mut hypotheses = Vec::with_capacity(rows.len());
        for (flow_name, rule_key, iteration, severity, locations_json, rationale) in rows {
            hypotheses.push(Hypothesis {
                flow_name,
                rule_key,
                iteration,
                severity: severity.as_deref().and_then(crate::models::Severity::parse),
                locations: serde_json::from_str(&locations_json)?,
                rationale,
            });
        }
        Ok(hypotheses)
    }

    // -----------------------------------------------------------------------
    // Votes
    // -----------------------------------------------------------------------

    /// Attach one immutable confirmation vote to a task.
    pub fn append_vote(&self, uuid: &str, vote: &ConfirmationVote) -> QuorumResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO votes (task_uuid, round, request, judgment, rationale) \
             VALUES (?1, ?2, ?3, ?4, ?5);",
            params![
                uuid,
                vote.round,
                vote.request,
                vote.judgment.as_str(),
                vote.rationale,
            ],
        )?;
        Ok(())
    }

    /// Load a task's votes ordered by (round, request).
    pub fn votes_for_task(&self, uuid: &str) -> QuorumResult<Vec<ConfirmationVote>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT round, request, judgment, rationale \
             FROM votes WHERE task_uuid = ?1 \
             ORDER BY round ASC, request ASC, id ASC;",
        )?;
        let votes: Vec<ConfirmationVote> = stmt
            .query_map(params![uuid], |row| {
                let judgment_raw: String = row.get(2)?;
                Ok(ConfirmationVote {
                    round: row.get(0)?,
                    request: row.get(1)?,
                    judgment: VoteJudgment::parse(&judgment_raw).unwrap_or(VoteJudgment::Abstain),
                    rationale: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(votes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CodeLocation, Severity};

    fn store() -> TaskStore {
        TaskStore::open_in_memory().unwrap()
    }

    fn scan_task(store: &TaskStore) -> Task {
        let task = Task::new_scan("proj", "checkout", "injection");
        store.create(&task).unwrap();
        task
    }

    fn hypothesis(iteration: u32, rationale: &str) -> Hypothesis {
        Hypothesis {
            flow_name: "checkout".into(),
            rule_key: "injection".into(),
            iteration,
            severity: Some(Severity::High),
            locations: vec![CodeLocation {
                file: "a.py".into(),
                line: 3,
            }],
            rationale: rationale.into(),
        }
    }

    #[test]
    fn create_and_get_roundtrip() {
        let store = store();
        let task = scan_task(&store);
        let loaded = store.get(&task.uuid).unwrap();
        assert_eq!(loaded.uuid, task.uuid);
        assert_eq!(loaded.state, TaskState::Pending);
        assert_eq!(loaded.phase, TaskPhase::Scan);
        assert!(!loaded.cancelled);
        assert!(!loaded.created_at.is_empty());
    }

    #[test]
    fn get_missing_task_errors() {
        let store = store();
        assert!(matches!(
            store.get("nope"),
            Err(QuorumError::TaskNotFound(_))
        ));
    }

    #[test]
    fn valid_transitions_apply() {
        let store = store();
        let task = scan_task(&store);
        store.transition(&task.uuid, TaskState::Scanning).unwrap();
        store.transition(&task.uuid, TaskState::Scanned).unwrap();
        store.transition(&task.uuid, TaskState::Confirming).unwrap();
        store.transition(&task.uuid, TaskState::Confirmed).unwrap();
        assert_eq!(store.get(&task.uuid).unwrap().state, TaskState::Confirmed);
    }

    #[test]
    fn invalid_transition_rejected_state_unchanged() {
        let store = store();
        let task = scan_task(&store);
        store.transition(&task.uuid, TaskState::Scanning).unwrap();

        let result = store.transition(&task.uuid, TaskState::Confirmed);
        assert!(matches!(
            result,
            Err(QuorumError::InvalidTransition { .. })
        ));
        assert_eq!(store.get(&task.uuid).unwrap().state, TaskState::Scanning);
    }

    #[test]
    fn terminal_states_are_sticky() {
        let store = store();
        let task = scan_task(&store);
        store.transition(&task.uuid, TaskState::Failed).unwrap();
        assert!(store.transition(&task.uuid, TaskState::Scanning).is_err());
        assert_eq!(store.get(&task.uuid).unwrap().state, TaskState::Failed);
    }

    #[test]
    fn load_pending_skips_terminal() {
        let store = store();
        let open_task = scan_task(&store);
        let done_task = Task::new_scan("proj", "login", "xss");
        store.create(&done_task).unwrap();
        store.transition(&done_task.uuid, TaskState::Failed).unwrap();

        let pending = store.load_pending("proj").unwrap();
        let uuids: Vec<&str> = pending.iter().map(|t| t.uuid.as_str()).collect();
        assert!(uuids.contains(&open_task.uuid.as_str()));
        assert!(!uuids.contains(&done_task.uuid.as_str()));
    }

    #[test]
    fn load_pending_scoped_to_project() {
        let store = store();
        let mine = scan_task(&store);
        let other = Task::new_scan("other_project", "checkout", "injection");
        store.create(&other).unwrap();

        let pending = store.load_pending("proj").unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].uuid, mine.uuid);
    }

    #[test]
    fn hypotheses_roundtrip() {
        let store = store();
        let task = scan_task(&store);
        store.append_hypothesis(&task.uuid, &hypothesis(1, "b")).unwrap();
        store.append_hypothesis(&task.uuid, &hypothesis(0, "a")).unwrap();

        let loaded = store.hypotheses_for_task(&task.uuid).unwrap();
        assert_eq!(loaded.len(), 2);
        // Ordered by iteration, not insertion.
        assert_eq!(loaded[0].rationale, "a");
        assert_eq!(loaded[0].severity, Some(Severity::High));
        assert_eq!(loaded[0].locations[0].file, "a.py");
    }

    #[test]
    fn clear_hypotheses_empties_task() {
        let store = store();
        let task = scan_task(&store);
        store.append_hypothesis(&task.uuid, &hypothesis(0, "a")).unwrap();
        assert_eq!(store.clear_hypotheses(&task.uuid).unwrap(), 1);
        assert!(store.hypotheses_for_task(&task.uuid).unwrap().is_empty());
    }

    #[test]
    fn votes_roundtrip() {
        let store = store();
        let task = scan_task(&store);
        store
            .append_vote(
                &task.uuid,
                &ConfirmationVote {
                    round: 1,
                    request: 2,
                    judgment: VoteJudgment::Affirm,
                    rationale: "looks real".into(),
                },
            )
            .unwrap();
        store
            .append_vote(
                &task.uuid,
                &ConfirmationVote {
                    round: 1,
                    request: 1,
                    judgment: VoteJudgment::Abstain,
                    rationale: String::new(),
                },
            )
            .unwrap();

        let votes = store.votes_for_task(&task.uuid).unwrap();
        assert_eq!(votes.len(), 2);
        assert_eq!(votes[0].request, 1);
        assert_eq!(votes[0].judgment, VoteJudgment::Abstain);
        assert_eq!(votes[1].judgment, VoteJudgment::Affirm);
    }

    #[test]
    fn cancellation_flag_roundtrip() {
        let store = store();
        let task = scan_task(&store);
        assert!(!store.is_cancelled(&task.uuid).unwrap());
        store.cancel(&task.uuid).unwrap();
        assert!(store.is_cancelled(&task.uuid).unwrap());
    }

    #[test]
    fn verdict_persisted() {
        let store = store();
        let task = scan_task(&store);
        store.set_verdict(&task.uuid, Verdict::Unconfirmed).unwrap();
        assert_eq!(
            store.get(&task.uuid).unwrap().verdict,
            Some(Verdict::Unconfirmed)
        );
    }

    #[test]
    fn confirm_task_lookup_by_parent() {
        let store = store();
        let parent = scan_task(&store);
        let confirm = Task::new_confirm(&parent, 2);
        store.create(&confirm).unwrap();

        let found = store.find_confirm_task(&parent.uuid, 2).unwrap().unwrap();
        assert_eq!(found.uuid, confirm.uuid);
        assert_eq!(found.parent_uuid.as_deref(), Some(parent.uuid.as_str()));
        assert!(store.find_confirm_task(&parent.uuid, 9).unwrap().is_none());
    }

    #[test]
    fn scan_task_lookup_by_identity() {
        let store = store();
        let task = scan_task(&store);
        let found = store
            .find_scan_task("proj", "checkout", "injection")
            .unwrap()
            .unwrap();
        assert_eq!(found.uuid, task.uuid);
        assert!(store
            .find_scan_task("proj", "checkout", "other_rule")
            .unwrap()
            .is_none());
    }

    #[test]
    fn reopen_on_disk_preserves_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.db");
        let uuid;
        {
            let store = TaskStore::open(&path).unwrap();
            let task = Task::new_scan("proj", "checkout", "injection");
            store.create(&task).unwrap();
            store.transition(&task.uuid, TaskState::Scanning).unwrap();
            uuid = task.uuid;
        }
        let store = TaskStore::open(&path).unwrap();
        let task = store.get(&uuid).unwrap();
        assert_eq!(task.state, TaskState::Scanning);
    }
}
