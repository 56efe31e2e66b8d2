//! SQLite schema DDL and migration framework for the task store.

use rusqlite::Connection;

use crate::errors::QuorumResult;

/// Current schema version. Migrations run from whatever the DB currently
/// reports up to this value.
pub const SCHEMA_VERSION: i32 = 3;

/// Core DDL statements: 5 CREATE TABLE + 5 CREATE INDEX.
///
/// Executed with `CREATE … IF NOT EXISTS` so they are safe to replay on an
/// already-initialised database.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    // ── tables (5) ──────────────────────────────────────────────────────
    "CREATE TABLE IF NOT EXISTS meta (
        key TEXT PRIMARY KEY,
        value TEXT
    );",
    "CREATE TABLE IF NOT EXISTS tasks (
        uuid TEXT PRIMARY KEY,
        project_id TEXT NOT NULL,
        phase TEXT NOT NULL,
        flow_name TEXT NOT NULL,
        rule_key TEXT NOT NULL,
        state TEXT NOT NULL DEFAULT 'pending',
        verdict TEXT,
        cancelled INTEGER NOT NULL DEFAULT 0,
        parent_uuid TEXT,
        cluster_index INTEGER,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP,
        updated_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    "CREATE TABLE IF NOT EXISTS hypotheses (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_uuid TEXT NOT NULL REFERENCES tasks(uuid),
        flow_name TEXT NOT NULL,
        rule_key TEXT NOT NULL,
        iteration INTEGER NOT NULL,
        severity TEXT,
        locations_json TEXT NOT NULL,
        rationale TEXT NOT NULL,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    "CREATE TABLE IF NOT EXISTS votes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        task_uuid TEXT NOT NULL REFERENCES tasks(uuid),
        round INTEGER NOT NULL,
        request INTEGER NOT NULL,
        judgment TEXT NOT NULL,
        rationale TEXT,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    "CREATE TABLE IF NOT EXISTS migration_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        from_version INTEGER NOT NULL,
        to_version INTEGER NOT NULL,
        status TEXT NOT NULL,
        error_message TEXT,
        created_at TEXT DEFAULT CURRENT_TIMESTAMP
    );",
    // ── indexes (5) ─────────────────────────────────────────────────────
    "CREATE INDEX IF NOT EXISTS idx_tasks_project_state ON tasks(project_id, state);",
    "CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_uuid, cluster_index);",
    "CREATE INDEX IF NOT EXISTS idx_tasks_identity ON tasks(project_id, phase, flow_name, rule_key);",
    "CREATE INDEX IF NOT EXISTS idx_hypotheses_task ON hypotheses(task_uuid, iteration);",
    "CREATE INDEX IF NOT EXISTS idx_votes_task ON votes(task_uuid, round, request);",
];

// ─── Migration framework ────────────────────────────────────────────────────

/// Run all pending migrations from the current stored version up to
/// [`SCHEMA_VERSION`]. Each step is wrapped in a SAVEPOINT so a failure
/// rolls back only that single step.
pub fn migrate_schema(conn: &Connection) -> QuorumResult<()> {
    let mut current_version = get_schema_version(conn);

    while current_version < SCHEMA_VERSION {
        let next_version = current_version + 1;
        conn.execute_batch("SAVEPOINT quorum_migrate_step;")?;

        let step_result = (|| -> QuorumResult<()> {
            match next_version {
                1 => migrate_to_v1(conn)?,
                2 => migrate_to_v2(conn)?,
                3 => migrate_to_v3(conn)?,
                _ => {} // future versions: no-op until migration is defined
            }
            set_schema_version(conn, next_version)?;
            record_migration_step(conn, current_version, next_version, "success", None)?;
            conn.execute_batch("RELEASE SAVEPOINT quorum_migrate_step;")?;
            Ok(())
        })();

        match step_result {
            Ok(()) => {
                current_version = next_version;
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK TO SAVEPOINT quorum_migrate_step;");
                let _ = conn.execute_batch("RELEASE SAVEPOINT quorum_migrate_step;");
                let _ = record_migration_step(
                    conn,
                    current_version,
                    next_version,
                    "failed",
                    Some(&e.to_string()),
                );
                return Err(e);
            }
        }
    }

    Ok(())
}

/// Read the current schema version from `meta`.
/// Returns 0 when the key is absent or unparseable.
pub fn get_schema_version(conn: &Connection) -> i32 {
    let result: Result<String, _> = conn.query_row(
        "SELECT value FROM meta WHERE key = 'schema_version';",
        [],
        |row| row.get(0),
    );
    match result {
        Ok(v) => v.parse::<i32>().unwrap_or(0),
        Err(_) => 0,
    }
}

fn set_schema_version(conn: &Connection, version: i32) -> QuorumResult<()> {
    conn.execute(
        "INSERT INTO meta(key, value) \
         VALUES('schema_version', ?1) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value;",
        rusqlite::params![version.to_string()],
    )?;
    Ok(())
}

fn record_migration_step(
    conn: &Connection,
    from_v: i32,
    to_v: i32,
    status: &str,
    error_msg: Option<&str>,
) -> QuorumResult<()> {
    conn.execute(
        "INSERT INTO migration_history(from_version, to_version, status, error_message) \
         VALUES (?1, ?2, ?3, ?4);",
        rusqlite::params![from_v, to_v, status, error_msg],
    )?;
    Ok(())
}

// ─── Individual migration steps ─────────────────────────────────────────────

/// v0 -> v1: baseline, no-op.
fn migrate_to_v1(_conn: &Connection) -> QuorumResult<()> {
    // Intentionally empty -- baseline schema already created by SCHEMA_STATEMENTS.
    Ok(())
}

/// v1 -> v2: add the parent-lookup index for confirm tasks.
fn migrate_to_v2(conn: &Connection) -> QuorumResult<()> {
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_uuid, cluster_index);",
    )?;
    Ok(())
}

/// v2 -> v3: add per-task indexes on hypotheses and votes.
fn migrate_to_v3(conn: &Connection) -> QuorumResult<()> {
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_hypotheses_task ON hypotheses(task_uuid, iteration);",
    )?;
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_votes_task ON votes(task_uuid, round, request);",
    )?;
    Ok(())
}
