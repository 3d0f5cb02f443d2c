use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{Persistence, PersistenceError};
use crate::batch::Batch;
use crate::job::{Job, JobFilter};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        state TEXT NOT NULL,
        batch_id TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        data TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state);
    CREATE INDEX IF NOT EXISTS idx_jobs_batch_id ON jobs(batch_id);
    CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at);

    CREATE TABLE IF NOT EXISTS batches (
        id TEXT PRIMARY KEY,
        created_at TEXT NOT NULL,
        data TEXT NOT NULL
    );
"#;

/// SQLite-backed persistence storing JSON snapshots.
pub struct SqlitePersistence {
    conn: Mutex<Connection>,
}

/// Fixed-width UTC timestamps so text comparison matches time order.
fn timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl SqlitePersistence {
    /// Open (or create) the database file and its tables.
    pub fn new(path: &Path) -> Result<Self, PersistenceError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database (useful for testing).
    pub fn in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn build_where_clause(filter: &JobFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(state) = filter.state {
            conditions.push("state = ?");
            params.push(Box::new(state.as_str().to_string()));
        }

        if let Some(ref batch_id) = filter.batch_id {
            conditions.push("batch_id = ?");
            params.push(Box::new(batch_id.clone()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        (where_clause, params)
    }
}

impl Persistence for SqlitePersistence {
    fn save_job(&self, job: &Job) -> Result<(), PersistenceError> {
        let data = serde_json::to_string(job)?;
        self.conn().execute(
            r#"
            INSERT INTO jobs (id, state, batch_id, created_at, updated_at, data)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                batch_id = excluded.batch_id,
                updated_at = excluded.updated_at,
                data = excluded.data
            WHERE excluded.updated_at >= jobs.updated_at
            "#,
            params![
                job.id,
                job.state.as_str(),
                job.batch_id,
                timestamp(&job.created_at),
                timestamp(&job.updated_at),
                data,
            ],
        )?;
        Ok(())
    }

    fn save_batch(&self, batch: &Batch) -> Result<(), PersistenceError> {
        let data = serde_json::to_string(batch)?;
        self.conn().execute(
            "INSERT OR REPLACE INTO batches (id, created_at, data) VALUES (?1, ?2, ?3)",
            params![batch.id, timestamp(&batch.created_at), data],
        )?;
        Ok(())
    }

    fn load_job(&self, job_id: &str) -> Result<Option<Job>, PersistenceError> {
        let data: Option<String> = self
            .conn()
            .query_row("SELECT data FROM jobs WHERE id = ?1", [job_id], |row| {
                row.get(0)
            })
            .optional()?;
        data.map(|d| serde_json::from_str(&d).map_err(PersistenceError::from))
            .transpose()
    }

    fn load_batch(&self, batch_id: &str) -> Result<Option<Batch>, PersistenceError> {
        let data: Option<String> = self
            .conn()
            .query_row("SELECT data FROM batches WHERE id = ?1", [batch_id], |row| {
                row.get(0)
            })
            .optional()?;
        data.map(|d| serde_json::from_str(&d).map_err(PersistenceError::from))
            .transpose()
    }

    fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, PersistenceError> {
        let conn = self.conn();
        let (where_clause, params) = Self::build_where_clause(filter);
        let sql = format!(
            "SELECT data FROM jobs {} ORDER BY created_at, id LIMIT ?",
            where_clause
        );

        let mut all_params = params;
        // SQLite treats a negative limit as no limit.
        all_params.push(Box::new(filter.limit.map(|l| l as i64).unwrap_or(-1)));
        let param_refs: Vec<&dyn rusqlite::ToSql> = all_params.iter().map(|p| p.as_ref()).collect();

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(param_refs.as_slice(), |row| row.get::<_, String>(0))?;

        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(serde_json::from_str(&row?)?);
        }
        Ok(jobs)
    }

    fn list_batches(&self) -> Result<Vec<Batch>, PersistenceError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT data FROM batches ORDER BY created_at, id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut batches = Vec::new();
        for row in rows {
            batches.push(serde_json::from_str(&row?)?);
        }
        Ok(batches)
    }

    fn delete_batch(&self, batch_id: &str) -> Result<(), PersistenceError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM jobs WHERE batch_id = ?1", [batch_id])?;
        tx.execute("DELETE FROM batches WHERE id = ?1", [batch_id])?;
        tx.commit()?;
        Ok(())
    }
}
