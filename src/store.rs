//! Persistent store for tasks and steps.
//!
//! The engine never speaks SQL directly; everything goes through the
//! [`Store`] facade so runs can be driven against the in-memory
//! implementation in [`crate::testing`]. The production implementation,
//! [`PgStore`], talks to PostgreSQL through sqlx with connection options
//! taken from the standard `PG*` environment variables (`PGSSLMODE`
//! defaults to `disable`).

use crate::error::{Error, Result};
use crate::settings::merge_task_settings;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres, Row};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::info;

/// One row of the `tasks` table
#[derive(Debug, Clone)]
pub struct TaskRow {
    /// Primary key
    pub id: i64,
    /// Human name
    pub name: String,
    /// Textual status; only `active` tasks join the global sweep
    pub status: String,
    /// Filesystem base path tracked files resolve against
    pub local_path: Option<String>,
    /// Shared settings document
    pub settings: Value,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

/// One row of the `steps` table
#[derive(Debug, Clone)]
pub struct StepRow {
    /// Primary key
    pub id: i64,
    /// Owning task
    pub task_id: i64,
    /// Human title
    pub title: String,
    /// Settings document (exactly one type key)
    pub settings: Value,
    /// Result document, rewritten on every execution
    pub results: Value,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

impl StepRow {
    /// The `result` field of the results document, empty when never run
    #[must_use]
    pub fn result_kind(&self) -> &str {
        self.results
            .get("result")
            .and_then(Value::as_str)
            .unwrap_or("")
    }
}

/// Data-access facade the engine and handlers run against
#[async_trait]
pub trait Store: Send + Sync {
    /// Fetch one task
    async fn task(&self, id: i64) -> Result<TaskRow>;

    /// All tasks, ascending id
    async fn tasks(&self) -> Result<Vec<TaskRow>>;

    /// Tasks whose status is `active`, ascending id
    async fn active_tasks(&self) -> Result<Vec<TaskRow>>;

    /// Insert a task, returning the stored row
    async fn create_task(
        &self,
        name: &str,
        status: &str,
        local_path: Option<&str>,
        settings: Value,
    ) -> Result<TaskRow>;

    /// Update a task's name/status/local_path (None leaves a field alone)
    async fn update_task(
        &self,
        id: i64,
        name: Option<&str>,
        status: Option<&str>,
        local_path: Option<&str>,
    ) -> Result<()>;

    /// Merge a partial update into a task's settings document and write the
    /// whole document back atomically
    async fn update_task_settings(&self, id: i64, updates: &Value) -> Result<Value>;

    /// Delete a task and its steps
    async fn delete_task(&self, id: i64) -> Result<()>;

    /// Fetch one step
    async fn step(&self, id: i64) -> Result<StepRow>;

    /// All steps of a task, ascending id
    async fn steps_for_task(&self, task_id: i64) -> Result<Vec<StepRow>>;

    /// Insert a step, returning the stored row
    async fn create_step(&self, task_id: i64, title: &str, settings: Value) -> Result<StepRow>;

    /// Replace a step's settings document
    async fn update_step_settings(&self, id: i64, settings: Value) -> Result<()>;

    /// Replace a step's results document
    async fn update_step_results(&self, id: i64, results: Value) -> Result<()>;

    /// Replace a step's title
    async fn update_step_title(&self, id: i64, title: &str) -> Result<()>;

    /// Delete one step
    async fn delete_step(&self, id: i64) -> Result<()>;

    /// Delete several steps at once
    async fn delete_steps(&self, ids: &[i64]) -> Result<u64>;

    /// Try to take the advisory run lock for a task; `false` when contended
    async fn try_lock_task(&self, task_id: i64) -> Result<bool>;

    /// Release the advisory run lock for a task
    async fn unlock_task(&self, task_id: i64) -> Result<()>;
}

/// An embedded schema migration
struct Migration {
    version: i64,
    name: &'static str,
    up: &'static str,
    down: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_tasks",
        up: "CREATE TABLE IF NOT EXISTS tasks (
                id BIGSERIAL PRIMARY KEY,
                name TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                local_path TEXT,
                settings JSONB NOT NULL DEFAULT '{}'::jsonb,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
        down: "DROP TABLE IF EXISTS tasks",
    },
    Migration {
        version: 2,
        name: "create_steps",
        up: "CREATE TABLE IF NOT EXISTS steps (
                id BIGSERIAL PRIMARY KEY,
                task_id BIGINT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                title TEXT NOT NULL,
                settings JSONB NOT NULL DEFAULT '{}'::jsonb,
                results JSONB NOT NULL DEFAULT '{}'::jsonb,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
        down: "DROP TABLE IF EXISTS steps",
    },
    Migration {
        version: 3,
        name: "index_steps_task_id",
        up: "CREATE INDEX IF NOT EXISTS idx_steps_task_id ON steps(task_id)",
        down: "DROP INDEX IF EXISTS idx_steps_task_id",
    },
];

/// PostgreSQL-backed store
pub struct PgStore {
    pool: PgPool,
    // Advisory locks are session-scoped, so each held lock pins the pool
    // connection it was taken on until release.
    lock_conns: Mutex<HashMap<i64, PoolConnection<Postgres>>>,
}

impl PgStore {
    /// Connect using the `PG*` environment variables. `PGSSLMODE` defaults
    /// to `disable` when unset.
    ///
    /// # Errors
    /// Returns a database error when the connection cannot be established.
    pub async fn connect_from_env() -> Result<Self> {
        let mut options = PgConnectOptions::new();
        if std::env::var("PGSSLMODE").is_err() {
            options = options.ssl_mode(PgSslMode::Disable);
        }
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self::with_pool(pool))
    }

    /// Wrap an existing pool
    #[must_use]
    pub fn with_pool(pool: PgPool) -> Self {
        Self {
            pool,
            lock_conns: Mutex::new(HashMap::new()),
        }
    }

    async fn ensure_migrations_table(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version BIGINT PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn applied_versions(&self) -> Result<Vec<i64>> {
        self.ensure_migrations_table().await?;
        let rows = sqlx::query("SELECT version FROM schema_migrations ORDER BY version")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| r.get::<i64, _>("version")).collect())
    }

    /// Apply every pending forward migration
    ///
    /// # Errors
    /// Returns a database error when a statement fails.
    pub async fn migrate_up(&self) -> Result<()> {
        let applied = self.applied_versions().await?;
        for m in MIGRATIONS {
            if applied.contains(&m.version) {
                continue;
            }
            info!(version = m.version, name = m.name, "applying migration");
            sqlx::query(m.up).execute(&self.pool).await?;
            sqlx::query("INSERT INTO schema_migrations (version, name) VALUES ($1, $2)")
                .bind(m.version)
                .bind(m.name)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Roll back the most recent migration
    ///
    /// # Errors
    /// Returns a database error when a statement fails.
    pub async fn migrate_down(&self) -> Result<()> {
        let applied = self.applied_versions().await?;
        let Some(last) = applied.last().copied() else {
            info!("no applied migrations to roll back");
            return Ok(());
        };
        let Some(m) = MIGRATIONS.iter().find(|m| m.version == last) else {
            return Err(Error::custom(format!("unknown applied migration version {last}")));
        };
        info!(version = m.version, name = m.name, "rolling back migration");
        sqlx::query(m.down).execute(&self.pool).await?;
        sqlx::query("DELETE FROM schema_migrations WHERE version = $1")
            .bind(m.version)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Report each migration with its applied state
    ///
    /// # Errors
    /// Returns a database error when the migrations table cannot be read.
    pub async fn migrate_status(&self) -> Result<Vec<(i64, &'static str, bool)>> {
        let applied = self.applied_versions().await?;
        Ok(MIGRATIONS
            .iter()
            .map(|m| (m.version, m.name, applied.contains(&m.version)))
            .collect())
    }

    /// Roll back everything, then re-apply
    ///
    /// # Errors
    /// Returns a database error when a statement fails.
    pub async fn migrate_reset(&self) -> Result<()> {
        let applied = self.applied_versions().await?;
        for _ in 0..applied.len() {
            self.migrate_down().await?;
        }
        self.migrate_up().await
    }
}

fn task_from_row(row: &sqlx::postgres::PgRow) -> TaskRow {
    TaskRow {
        id: row.get("id"),
        name: row.get("name"),
        status: row.get("status"),
        local_path: row.get("local_path"),
        settings: row.get("settings"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn step_from_row(row: &sqlx::postgres::PgRow) -> StepRow {
    StepRow {
        id: row.get("id"),
        task_id: row.get("task_id"),
        title: row.get("title"),
        settings: row.get("settings"),
        results: row.get("results"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

const TASK_COLUMNS: &str = "id, name, status, local_path, settings, created_at, updated_at";
const STEP_COLUMNS: &str = "id, task_id, title, settings, results, created_at, updated_at";

#[async_trait]
impl Store for PgStore {
    async fn task(&self, id: i64) -> Result<TaskRow> {
        let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| task_from_row(&r))
            .ok_or(Error::TaskNotFound { task_id: id })
    }

    async fn tasks(&self) -> Result<Vec<TaskRow>> {
        let rows = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(task_from_row).collect())
    }

    async fn active_tasks(&self) -> Result<Vec<TaskRow>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'active' ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(task_from_row).collect())
    }

    async fn create_task(
        &self,
        name: &str,
        status: &str,
        local_path: Option<&str>,
        settings: Value,
    ) -> Result<TaskRow> {
        let row = sqlx::query(&format!(
            "INSERT INTO tasks (name, status, local_path, settings)
             VALUES ($1, $2, $3, $4) RETURNING {TASK_COLUMNS}"
        ))
        .bind(name)
        .bind(status)
        .bind(local_path)
        .bind(settings)
        .fetch_one(&self.pool)
        .await?;
        Ok(task_from_row(&row))
    }

    async fn update_task(
        &self,
        id: i64,
        name: Option<&str>,
        status: Option<&str>,
        local_path: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE tasks SET
                name = COALESCE($2, name),
                status = COALESCE($3, status),
                local_path = COALESCE($4, local_path),
                updated_at = now()
             WHERE id = $1",
        )
        .bind(id)
        .bind(name)
        .bind(status)
        .bind(local_path)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::TaskNotFound { task_id: id });
        }
        Ok(())
    }

    async fn update_task_settings(&self, id: i64, updates: &Value) -> Result<Value> {
        // Read–merge–write inside one transaction; the row lock makes the
        // whole-document write atomic under the primary key.
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT settings FROM tasks WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(Error::TaskNotFound { task_id: id })?;
        let current: Value = row.get("settings");
        let merged = merge_task_settings(&current, updates);
        sqlx::query("UPDATE tasks SET settings = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(&merged)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(merged)
    }

    async fn delete_task(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::TaskNotFound { task_id: id });
        }
        Ok(())
    }

    async fn step(&self, id: i64) -> Result<StepRow> {
        let row = sqlx::query(&format!("SELECT {STEP_COLUMNS} FROM steps WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| step_from_row(&r))
            .ok_or(Error::StepNotFound { step_id: id })
    }

    async fn steps_for_task(&self, task_id: i64) -> Result<Vec<StepRow>> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM steps WHERE task_id = $1 ORDER BY id"
        ))
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(step_from_row).collect())
    }

    async fn create_step(&self, task_id: i64, title: &str, settings: Value) -> Result<StepRow> {
        let row = sqlx::query(&format!(
            "INSERT INTO steps (task_id, title, settings, results)
             VALUES ($1, $2, $3, '{{}}'::jsonb) RETURNING {STEP_COLUMNS}"
        ))
        .bind(task_id)
        .bind(title)
        .bind(settings)
        .fetch_one(&self.pool)
        .await?;
        Ok(step_from_row(&row))
    }

    async fn update_step_settings(&self, id: i64, settings: Value) -> Result<()> {
        let result = sqlx::query("UPDATE steps SET settings = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(settings)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::StepNotFound { step_id: id });
        }
        Ok(())
    }

    async fn update_step_results(&self, id: i64, results: Value) -> Result<()> {
        let result = sqlx::query("UPDATE steps SET results = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(results)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::StepNotFound { step_id: id });
        }
        Ok(())
    }

    async fn update_step_title(&self, id: i64, title: &str) -> Result<()> {
        let result = sqlx::query("UPDATE steps SET title = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(title)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::StepNotFound { step_id: id });
        }
        Ok(())
    }

    async fn delete_step(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM steps WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::StepNotFound { step_id: id });
        }
        Ok(())
    }

    async fn delete_steps(&self, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        // Typed array parameter instead of a string-spliced IN (...)
        let result = sqlx::query("DELETE FROM steps WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn try_lock_task(&self, task_id: i64) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query("SELECT pg_try_advisory_lock($1) AS locked")
            .bind(task_id)
            .fetch_one(&mut *conn)
            .await?;
        let locked: bool = row.get("locked");
        if locked {
            self.lock_conns.lock().await.insert(task_id, conn);
        }
        Ok(locked)
    }

    async fn unlock_task(&self, task_id: i64) -> Result<()> {
        let conn = self.lock_conns.lock().await.remove(&task_id);
        if let Some(mut conn) = conn {
            sqlx::query("SELECT pg_advisory_unlock($1)")
                .bind(task_id)
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }
}
