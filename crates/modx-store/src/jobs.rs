use std::path::Path;

use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use modx_core::time::now_iso8601;
use modx_core::{AnalysisJob, JobStatus};

use crate::error::{Result, StoreError};
use crate::schema;

const JOB_COLUMNS: &str =
    "id, model_reference, model_id, status, submitted_at, updated_at, result, error";

/// SQLite-backed analysis job records.
pub struct JobStore {
    conn: Connection,
}

impl JobStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    pub fn insert(&self, job: &AnalysisJob) -> Result<()> {
        let result = job.result.as_ref().map(serde_json::to_string).transpose()?;
        self.conn.execute(
            "INSERT INTO analysis_jobs (id, model_reference, model_id, status, submitted_at, updated_at, result, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                job.id.to_string(),
                job.model_reference,
                job.model_id,
                job.status.as_str(),
                job.submitted_at,
                job.updated_at,
                result,
                job.error,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Result<Option<AnalysisJob>> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM analysis_jobs WHERE id = ?1"),
                [id.to_string()],
                RawJob::from_row,
            )
            .optional()?;
        raw.map(RawJob::into_job).transpose()
    }

    /// Newest first. `limit` of `None` returns every job.
    pub fn list(&self, limit: Option<usize>) -> Result<Vec<AnalysisJob>> {
        let limit = limit.map_or(-1, |l| l as i64);
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM analysis_jobs
             ORDER BY submitted_at DESC, rowid DESC LIMIT ?1"
        ))?;
        let rows: Vec<RawJob> = stmt
            .query_map([limit], RawJob::from_row)?
            .collect::<std::result::Result<_, _>>()?;
        rows.into_iter().map(RawJob::into_job).collect()
    }

    pub fn count(&self) -> Result<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM analysis_jobs", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// Move a job to `to`, recording a result or error alongside.
    ///
    /// The status check and the write are one conditional UPDATE, so two
    /// racing writers cannot both move the same job out of a state.
    pub fn transition(
        &self,
        id: Uuid,
        to: JobStatus,
        result: Option<&serde_json::Value>,
        error: Option<&str>,
    ) -> Result<AnalysisJob> {
        let allowed: Vec<String> = to
            .predecessors()
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect();
        let refused = |from| StoreError::InvalidTransition { id, from, to };
        if allowed.is_empty() {
            let current = self.get(id)?.map(|j| j.status);
            return Err(refused(current));
        }

        let result = result.map(serde_json::to_string).transpose()?;
        let changed = self.conn.execute(
            &format!(
                "UPDATE analysis_jobs
                 SET status = ?1, updated_at = ?2,
                     result = COALESCE(?3, result), error = COALESCE(?4, error)
                 WHERE id = ?5 AND status IN ({})",
                allowed.join(", ")
            ),
            params![to.as_str(), now_iso8601(), result, error, id.to_string()],
        )?;

        let job = self.get(id)?;
        match job {
            Some(job) if changed == 1 => {
                tracing::debug!("job {id} -> {to}");
                Ok(job)
            }
            other => Err(refused(other.map(|j| j.status))),
        }
    }
}

struct RawJob {
    id: String,
    model_reference: String,
    model_id: Option<String>,
    status: String,
    submitted_at: String,
    updated_at: String,
    result: Option<String>,
    error: Option<String>,
}

impl RawJob {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            model_reference: row.get(1)?,
            model_id: row.get(2)?,
            status: row.get(3)?,
            submitted_at: row.get(4)?,
            updated_at: row.get(5)?,
            result: row.get(6)?,
            error: row.get(7)?,
        })
    }

    fn into_job(self) -> Result<AnalysisJob> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| StoreError::InvalidData(format!("bad job id '{}': {e}", self.id)))?;
        let status = self
            .status
            .parse::<JobStatus>()
            .map_err(|e| StoreError::InvalidData(e.to_string()))?;
        let result = self.result.as_deref().map(serde_json::from_str).transpose()?;
        Ok(AnalysisJob {
            id,
            model_reference: self.model_reference,
            model_id: self.model_id,
            status,
            submitted_at: self.submitted_at,
            updated_at: self.updated_at,
            result,
            error: self.error,
        })
    }
}
