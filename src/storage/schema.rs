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

        CREATE TABLE IF NOT EXISTS traces (
            id INTEGER PRIMARY KEY,
            ingest_id TEXT NOT NULL,
            ip_source TEXT NOT NULL,
            ip_destination TEXT NOT NULL,
            is_anomaly INTEGER NOT NULL DEFAULT 0,
            flow_time TEXT NOT NULL DEFAULT '',
            labels_json TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_traces_created ON traces(created_at);
        CREATE INDEX IF NOT EXISTS idx_traces_ingest ON traces(ingest_id);
        CREATE INDEX IF NOT EXISTS idx_traces_ip_source ON traces(ip_source);",
    )?;

    // Migration: scores were added after the first schema.
    let has_score: i32 = conn
        .query_row(
            "SELECT count(*) FROM pragma_table_info('traces') WHERE name='anomaly_probability'",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if has_score == 0 {
        conn.execute("ALTER TABLE traces ADD COLUMN anomaly_probability REAL", [])?;
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
            .query_row("SELECT COUNT(*) FROM traces", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);

        let scored: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM traces WHERE anomaly_probability IS NULL",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(scored, 0);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap(); // Should not error
    }
}
