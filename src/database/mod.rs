pub mod models;

#[cfg(test)]
mod tests;

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

pub use models::*;

const TASK_COLUMNS: &str = "id, owner_id, filename, source_file, status, progress, current_stage, \
     stage_details, result_id, result_token, error_message, created_at, completed_at, cancelled_at";

/// Durable store for analysis tasks and their results.
///
/// Every state transition out of `processing` is a single-row
/// compare-and-set (`... WHERE status = 'processing'`), so concurrent cancel
/// and complete calls resolve to whichever write lands first.
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        // Enable WAL mode for concurrent reads
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA foreign_keys=ON;
            PRAGMA temp_store=MEMORY;
        ",
        )?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow!("database lock poisoned: {}", e))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS analysis_tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner_id INTEGER NOT NULL,
                filename TEXT NOT NULL,
                source_file TEXT,
                status TEXT NOT NULL DEFAULT 'processing',
                progress INTEGER NOT NULL DEFAULT 0,
                current_stage TEXT NOT NULL DEFAULT 'preparing',
                stage_details TEXT NOT NULL DEFAULT '',
                result_id INTEGER,
                result_token TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                completed_at TEXT,
                cancelled_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_analysis_tasks_owner ON analysis_tasks(owner_id);
            CREATE INDEX IF NOT EXISTS idx_analysis_tasks_status ON analysis_tasks(status);
            CREATE INDEX IF NOT EXISTS idx_analysis_tasks_created ON analysis_tasks(created_at);

            -- Persisted analysis artifacts (written by the result sink)
            CREATE TABLE IF NOT EXISTS analysis_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                access_token TEXT NOT NULL UNIQUE,
                owner_id INTEGER NOT NULL,
                task_id INTEGER NOT NULL,
                filename TEXT NOT NULL,
                file_type TEXT NOT NULL,
                artifact_json TEXT NOT NULL,
                metadata_json TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_analysis_results_owner ON analysis_results(owner_id);
            CREATE INDEX IF NOT EXISTS idx_analysis_results_task ON analysis_results(task_id);
        "#,
        )?;
        Ok(())
    }

    fn row_to_task(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
        let result_id: Option<i64> = row.get(8)?;
        let result_token: Option<String> = row.get(9)?;
        Ok(TaskRecord {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            filename: row.get(2)?,
            source_file: row.get(3)?,
            status: row.get::<_, String>(4)?.into(),
            progress: row.get(5)?,
            current_stage: row.get(6)?,
            stage_details: row.get(7)?,
            result: match (result_id, result_token) {
                (Some(id), Some(access_token)) => Some(ResultRef { id, access_token }),
                _ => None,
            },
            error_message: row.get(10)?,
            created_at: row.get(11)?,
            completed_at: row.get(12)?,
            cancelled_at: row.get(13)?,
        })
    }

    // =========================================================================
    // Task lifecycle
    // =========================================================================

    /// Insert a new task in `processing` state with zero progress.
    pub fn create_task(&self, owner_id: i64, filename: &str) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO analysis_tasks (owner_id, filename, status, progress) VALUES (?, ?, 'processing', 0)",
            params![owner_id, filename],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn set_source_file(&self, task_id: i64, source_file: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE analysis_tasks SET source_file = ? WHERE id = ?",
            params![source_file, task_id],
        )?;
        Ok(())
    }

    pub fn update_filename(&self, task_id: i64, filename: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE analysis_tasks SET filename = ? WHERE id = ?",
            params![filename, task_id],
        )?;
        Ok(())
    }

    pub fn get_task(&self, task_id: i64) -> Result<Option<TaskRecord>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM analysis_tasks WHERE id = ?", TASK_COLUMNS);
        let task = conn
            .query_row(&sql, params![task_id], Self::row_to_task)
            .optional()?;
        Ok(task)
    }

    pub fn get_task_for_owner(&self, task_id: i64, owner_id: i64) -> Result<Option<TaskRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM analysis_tasks WHERE id = ? AND owner_id = ?",
            TASK_COLUMNS
        );
        let task = conn
            .query_row(&sql, params![task_id, owner_id], Self::row_to_task)
            .optional()?;
        Ok(task)
    }

    pub fn get_status(&self, task_id: i64) -> Result<Option<TaskStatus>> {
        let conn = self.conn()?;
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM analysis_tasks WHERE id = ?",
                params![task_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(status.map(TaskStatus::from))
    }

    pub fn list_tasks(&self, owner_id: Option<i64>, limit: i64) -> Result<Vec<TaskRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM analysis_tasks WHERE (?1 IS NULL OR owner_id = ?1) ORDER BY id DESC LIMIT ?2",
            TASK_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let tasks = stmt
            .query_map(params![owner_id, limit], Self::row_to_task)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    /// Record stage progress. Only applies while the task is processing, and
    /// never lowers the stored percentage. Returns the number of rows touched.
    pub fn update_progress(
        &self,
        task_id: i64,
        progress: i32,
        stage: &str,
        details: &str,
    ) -> Result<usize> {
        let conn = self.conn()?;
        let count = conn.execute(
            "UPDATE analysis_tasks
             SET progress = MAX(progress, ?), current_stage = ?, stage_details = ?
             WHERE id = ? AND status = 'processing'",
            params![progress.clamp(0, 100), stage, details, task_id],
        )?;
        Ok(count)
    }

    /// Owner-scoped cancel. Returns false when the task is unknown, belongs to
    /// someone else, or has already left `processing`.
    pub fn cancel_task(&self, task_id: i64, owner_id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let count = conn.execute(
            "UPDATE analysis_tasks
             SET status = 'cancelled', cancelled_at = datetime('now')
             WHERE id = ? AND owner_id = ? AND status = 'processing'",
            params![task_id, owner_id],
        )?;
        Ok(count == 1)
    }

    /// Worker-side cancel for a task whose cancellation was observed without
    /// a prior durable write.
    pub fn mark_cancelled(&self, task_id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let count = conn.execute(
            "UPDATE analysis_tasks
             SET status = 'cancelled', cancelled_at = datetime('now')
             WHERE id = ? AND status = 'processing'",
            params![task_id],
        )?;
        Ok(count == 1)
    }

    pub fn mark_completed(&self, task_id: i64, result: &ResultRef) -> Result<bool> {
        let conn = self.conn()?;
        let count = conn.execute(
            "UPDATE analysis_tasks
             SET status = 'completed', progress = 100, current_stage = 'done', stage_details = '',
                 result_id = ?, result_token = ?, completed_at = datetime('now')
             WHERE id = ? AND status = 'processing'",
            params![result.id, result.access_token, task_id],
        )?;
        Ok(count == 1)
    }

    pub fn mark_failed(&self, task_id: i64, error: &str) -> Result<bool> {
        let conn = self.conn()?;
        let count = conn.execute(
            "UPDATE analysis_tasks
             SET status = 'failed', error_message = ?, completed_at = datetime('now')
             WHERE id = ? AND status = 'processing'",
            params![error, task_id],
        )?;
        Ok(count == 1)
    }

    // =========================================================================
    // Housekeeping
    // =========================================================================

    /// Fail any task still marked processing. Called once at startup, before
    /// any worker exists, so every such row belongs to a dead process.
    pub fn fail_interrupted_tasks(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count = conn.execute(
            "UPDATE analysis_tasks
             SET status = 'failed', error_message = 'interrupted: worker did not finish', completed_at = datetime('now')
             WHERE status = 'processing'",
            [],
        )?;
        if count > 0 {
            log::info!("Marked {} interrupted tasks as failed", count);
        }
        Ok(count)
    }

    /// Delete terminal tasks older than `days`.
    pub fn delete_old_tasks(&self, days: i64) -> Result<usize> {
        let conn = self.conn()?;
        let count = conn.execute(
            "DELETE FROM analysis_tasks
             WHERE status != 'processing' AND created_at < datetime('now', ?)",
            params![format!("-{} days", days)],
        )?;
        Ok(count)
    }

    /// Source files still owned by processing tasks.
    pub fn active_source_files(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT source_file FROM analysis_tasks WHERE status = 'processing' AND source_file IS NOT NULL",
        )?;
        let files = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(files)
    }

    pub fn count_tasks(&self) -> Result<TaskCounts> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM analysis_tasks GROUP BY status")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut counts = TaskCounts::default();
        for (status, n) in rows {
            match TaskStatus::from(status) {
                TaskStatus::Processing => counts.processing += n,
                TaskStatus::Completed => counts.completed += n,
                TaskStatus::Failed => counts.failed += n,
                TaskStatus::Cancelled => counts.cancelled += n,
            }
        }
        Ok(counts)
    }

    // =========================================================================
    // Results
    // =========================================================================

    pub fn insert_result(
        &self,
        owner_id: i64,
        task_id: i64,
        filename: &str,
        file_type: &str,
        artifact_json: &str,
        metadata_json: Option<&str>,
    ) -> Result<ResultRef> {
        let conn = self.conn()?;
        let access_token = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO analysis_results (access_token, owner_id, task_id, filename, file_type, artifact_json, metadata_json)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![access_token, owner_id, task_id, filename, file_type, artifact_json, metadata_json],
        )?;
        Ok(ResultRef {
            id: conn.last_insert_rowid(),
            access_token,
        })
    }

    pub fn delete_result(&self, result_id: i64) -> Result<usize> {
        let conn = self.conn()?;
        let count = conn.execute(
            "DELETE FROM analysis_results WHERE id = ?",
            params![result_id],
        )?;
        Ok(count)
    }

    pub fn get_result_by_token(&self, access_token: &str) -> Result<Option<StoredResult>> {
        let conn = self.conn()?;
        let result = conn
            .query_row(
                "SELECT id, access_token, owner_id, task_id, filename, file_type, artifact_json, metadata_json, created_at
                 FROM analysis_results WHERE access_token = ?",
                params![access_token],
                |row| {
                    Ok(StoredResult {
                        id: row.get(0)?,
                        access_token: row.get(1)?,
                        owner_id: row.get(2)?,
                        task_id: row.get(3)?,
                        filename: row.get(4)?,
                        file_type: row.get(5)?,
                        artifact_json: row.get(6)?,
                        metadata_json: row.get(7)?,
                        created_at: row.get(8)?,
                    })
                },
            )
            .optional()?;
        Ok(result)
    }

    pub fn count_results_for_task(&self, task_id: i64) -> Result<i64> {
        let conn = self.conn()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM analysis_results WHERE task_id = ?",
            params![task_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}
