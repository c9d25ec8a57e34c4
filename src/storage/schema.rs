//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS runs (
            number INTEGER PRIMARY KEY,
            run_id TEXT NOT NULL UNIQUE,
            job TEXT NOT NULL,
            trigger_kind TEXT NOT NULL,
            mode TEXT NOT NULL,
            status TEXT NOT NULL,
            failed_step TEXT,
            error_class TEXT,
            error_message TEXT,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            log_path TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS artifacts (
            id INTEGER PRIMARY KEY,
            run_number INTEGER NOT NULL,
            relative_path TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            sha256 TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE (run_number, relative_path),
            FOREIGN KEY (run_number) REFERENCES runs(number) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_runs_started ON runs(started_at);
        CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
        CREATE INDEX IF NOT EXISTS idx_artifacts_run ON artifacts(run_number);",
    )?;

    // Migration: record whether the failure notification went out
    let has_notified: i32 = conn
        .query_row(
            "SELECT count(*) FROM pragma_table_info('runs') WHERE name='notified'",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if has_notified == 0 {
        conn.execute(
            "ALTER TABLE runs ADD COLUMN notified INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM runs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM artifacts", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();

        let has_notified: i64 = conn
            .query_row(
                "SELECT count(*) FROM pragma_table_info('runs') WHERE name='notified'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(has_notified, 1);
    }
}
