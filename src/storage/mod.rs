//! SQLite storage layer -- ingested flows and their scores.

pub mod schema;

use std::path::Path;

use anyhow::{Context, Result};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Row};
use serde::Serialize;
use uuid::Uuid;

use crate::trace::{Trace, TraceLabels};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: impl AsRef<Path>) -> Result<Pool> {
    let path = path.as_ref();
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)
        .with_context(|| format!("failed to open database: {}", path.display()))?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// A flow as stored, with its ingestion metadata.
#[derive(Debug, Clone, Serialize)]
pub struct StoredTrace {
    pub id: i64,
    pub ingest_id: String,
    #[serde(flatten)]
    pub trace: Trace,
    pub anomaly_probability: Option<f64>,
    pub created_at: String,
}

/// Append one ingestion batch in a single transaction. Returns the row ids in
/// input order.
pub fn append_traces(pool: &Pool, ingest_id: &Uuid, traces: &[Trace]) -> Result<Vec<i64>> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    let ingest = ingest_id.to_string();
    let mut ids = Vec::with_capacity(traces.len());
    {
        let mut stmt = tx.prepare(
            "INSERT INTO traces (ingest_id, ip_source, ip_destination, is_anomaly, flow_time, labels_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for t in traces {
            let labels = serde_json::to_string(&t.labels)?;
            stmt.execute(params![
                ingest,
                t.ip_source,
                t.ip_destination,
                t.is_anomaly,
                t.timestamp,
                labels
            ])?;
            ids.push(tx.last_insert_rowid());
        }
    }
    tx.commit()?;
    Ok(ids)
}

/// Attach the online anomaly score to a stored flow.
pub fn record_score(pool: &Pool, id: i64, anomaly_probability: f32) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "UPDATE traces SET anomaly_probability = ?1 WHERE id = ?2",
        params![f64::from(anomaly_probability), id],
    )?;
    Ok(())
}

/// Newest first.
pub fn recent_traces(pool: &Pool, limit: usize) -> Result<Vec<StoredTrace>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT id, ingest_id, ip_source, ip_destination, is_anomaly, flow_time, labels_json,
                anomaly_probability, created_at
         FROM traces ORDER BY id DESC LIMIT ?1",
    )?;
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let rows = stmt.query_map(params![limit], stored_from_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row??);
    }
    Ok(out)
}

/// Every stored flow, oldest first. Feeds the batch classifier.
pub fn all_traces(pool: &Pool) -> Result<Vec<Trace>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT id, ingest_id, ip_source, ip_destination, is_anomaly, flow_time, labels_json,
                anomaly_probability, created_at
         FROM traces ORDER BY id ASC",
    )?;
    let rows = stmt.query_map([], stored_from_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row??.trace);
    }
    Ok(out)
}

pub fn count_traces(pool: &Pool) -> Result<u64> {
    let conn = pool.get()?;
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM traces", [], |row| row.get(0))?;
    Ok(u64::try_from(n).unwrap_or(0))
}

/// Label JSON is decoded after the row is read so that a bad blob surfaces as
/// an error instead of a panic inside the rusqlite callback.
fn stored_from_row(row: &Row<'_>) -> rusqlite::Result<Result<StoredTrace>> {
    let labels_json: String = row.get(6)?;
    let id: i64 = row.get(0)?;
    let ingest_id: String = row.get(1)?;
    let ip_source: String = row.get(2)?;
    let ip_destination: String = row.get(3)?;
    let is_anomaly: bool = row.get(4)?;
    let timestamp: String = row.get(5)?;
    let anomaly_probability: Option<f64> = row.get(7)?;
    let created_at: String = row.get(8)?;

    Ok(serde_json::from_str::<TraceLabels>(&labels_json)
        .with_context(|| format!("corrupt labels for trace {id}"))
        .map(|labels| StoredTrace {
            id,
            ingest_id,
            trace: Trace {
                ip_source,
                ip_destination,
                is_anomaly,
                labels,
                timestamp,
            },
            anomaly_probability,
            created_at,
        }))
}
