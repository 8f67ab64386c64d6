//! SQLite persistence for tasks, users, and the append-only action log.
//!
//! All coordination logic lives in [`crate::board`]; this module is the
//! narrow persistence collaborator it calls through. The one concurrency
//! primitive provided here is `update_task_if_version` — an atomic
//! compare-on-version UPDATE that strictly orders racing mutations to the
//! same task.

use anyhow::{Context as _, Result};
use serde::Serialize;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::{collections::HashMap, path::Path, str::FromStr};

/// Default timeout for individual SQLite queries.
/// Prevents hung queries from blocking the daemon indefinitely; expiry
/// surfaces to callers as a storage error and is never retried here.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Execute a future with the standard query timeout.
async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "database query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        )),
    }
}

/// Whether an error is a SQLite UNIQUE constraint violation.
/// Duplicate-title races that slip past the application pre-check land here.
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.to_string().contains("UNIQUE constraint failed"))
}

// ─── Rows ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct TaskRow {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: String,
    pub priority: String,
    pub assigned_to: Option<String>,
    pub created_by: String,
    pub position: i64,
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRow {
    pub id: String,
    pub username: String,
    pub email: String,
    pub created_at: String,
}

/// An action log row joined with the acting user's name and the affected
/// task's title (where those still exist) for display.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRow {
    pub id: String,
    pub kind: String,
    pub task_id: String,
    pub user_id: String,
    /// JSON text: before/after values captured at mutation time.
    pub details: String,
    pub created_at: String,
    pub username: Option<String>,
    pub task_title: Option<String>,
}

const ACTION_SELECT: &str = "SELECT a.id, a.kind, a.task_id, a.user_id, a.details, a.created_at, \
     u.username AS username, t.title AS task_title \
     FROM actions a \
     LEFT JOIN users u ON u.id = a.user_id \
     LEFT JOIN tasks t ON t.id = a.task_id";

// ─── Storage ─────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("boardd.db");
        let opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);
        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory database for tests. Capped at one connection — every
    /// pooled connection to `sqlite::memory:` would otherwise open its own
    /// empty database.
    pub async fn in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::migrate!("src/storage/migrations")
            .run(pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(())
    }

    /// Return a clone of the connection pool (cheap — Arc-backed).
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    // ─── Users ───────────────────────────────────────────────────────────────

    /// Insert or refresh a user record at auth time. Insertion order is
    /// preserved by `created_at` and defines the smart-assign tie-break.
    pub async fn upsert_user(&self, id: &str, username: &str, email: &str) -> Result<()> {
        with_timeout(async {
            sqlx::query(
                "INSERT INTO users (id, username, email, created_at) VALUES (?, ?, ?, ?) \
                 ON CONFLICT(id) DO UPDATE SET username = excluded.username, email = excluded.email",
            )
            .bind(id)
            .bind(username)
            .bind(email)
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    pub async fn get_user(&self, id: &str) -> Result<Option<UserRow>> {
        with_timeout(async {
            Ok(sqlx::query_as("SELECT * FROM users WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?)
        })
        .await
    }

    /// All known users in stable enumeration order (first registered first).
    pub async fn list_users(&self) -> Result<Vec<UserRow>> {
        with_timeout(async {
            Ok(
                sqlx::query_as("SELECT * FROM users ORDER BY created_at ASC, id ASC")
                    .fetch_all(&self.pool)
                    .await?,
            )
        })
        .await
    }

    // ─── Tasks ───────────────────────────────────────────────────────────────

    pub async fn insert_task(&self, row: &TaskRow) -> Result<()> {
        with_timeout(async {
            sqlx::query(
                "INSERT INTO tasks (id, title, description, status, priority, assigned_to, \
                 created_by, position, version, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&row.id)
            .bind(&row.title)
            .bind(&row.description)
            .bind(&row.status)
            .bind(&row.priority)
            .bind(&row.assigned_to)
            .bind(&row.created_by)
            .bind(row.position)
            .bind(row.version)
            .bind(&row.created_at)
            .bind(&row.updated_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<TaskRow>> {
        with_timeout(async {
            Ok(sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?)
        })
        .await
    }

    /// Exact-match title lookup, optionally excluding one task id
    /// (used when re-validating a title change against all other tasks).
    pub async fn find_by_title(
        &self,
        title: &str,
        exclude: Option<&str>,
    ) -> Result<Option<TaskRow>> {
        with_timeout(async {
            let row = match exclude {
                Some(id) => {
                    sqlx::query_as("SELECT * FROM tasks WHERE title = ? AND id != ?")
                        .bind(title)
                        .bind(id)
                        .fetch_optional(&self.pool)
                        .await?
                }
                None => {
                    sqlx::query_as("SELECT * FROM tasks WHERE title = ?")
                        .bind(title)
                        .fetch_optional(&self.pool)
                        .await?
                }
            };
            Ok(row)
        })
        .await
    }

    /// Board ordering: explicit position first, newest-created first within
    /// a position.
    pub async fn list_tasks(&self) -> Result<Vec<TaskRow>> {
        with_timeout(async {
            Ok(
                sqlx::query_as("SELECT * FROM tasks ORDER BY position ASC, created_at DESC")
                    .fetch_all(&self.pool)
                    .await?,
            )
        })
        .await
    }

    /// Atomic compare-on-version update of every mutable column.
    ///
    /// Returns `false` when the stored version no longer matches
    /// `expected_version` — the caller lost a race and must surface a
    /// conflict rather than silently overwrite. SQLite executes the
    /// UPDATE atomically, so two racers are strictly ordered.
    pub async fn update_task_if_version(
        &self,
        row: &TaskRow,
        expected_version: i64,
    ) -> Result<bool> {
        with_timeout(async {
            let result = sqlx::query(
                "UPDATE tasks SET title = ?, description = ?, status = ?, priority = ?, \
                 assigned_to = ?, position = ?, version = version + 1, updated_at = ? \
                 WHERE id = ? AND version = ?",
            )
            .bind(&row.title)
            .bind(&row.description)
            .bind(&row.status)
            .bind(&row.priority)
            .bind(&row.assigned_to)
            .bind(row.position)
            .bind(&row.updated_at)
            .bind(&row.id)
            .bind(expected_version)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    /// Unconditional reassignment (smart-assign path): targeted field write
    /// that bypasses the version check by design but still bumps `version`.
    /// Returns `false` when the task no longer exists.
    pub async fn reassign_task(&self, id: &str, assigned_to: Option<&str>) -> Result<bool> {
        with_timeout(async {
            let result = sqlx::query(
                "UPDATE tasks SET assigned_to = ?, version = version + 1, updated_at = ? \
                 WHERE id = ?",
            )
            .bind(assigned_to)
            .bind(chrono::Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    /// Hard removal. Returns `false` when the task did not exist.
    pub async fn delete_task(&self, id: &str) -> Result<bool> {
        with_timeout(async {
            let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() == 1)
        })
        .await
    }

    /// Per-user count of assigned tasks in the active subset
    /// (status `Todo` or `In Progress`). Users with zero active tasks are
    /// simply absent from the map.
    pub async fn active_assignment_counts(&self) -> Result<HashMap<String, i64>> {
        with_timeout(async {
            let rows: Vec<(String, i64)> = sqlx::query_as(
                "SELECT assigned_to, COUNT(*) FROM tasks \
                 WHERE status IN ('Todo', 'In Progress') AND assigned_to IS NOT NULL \
                 GROUP BY assigned_to",
            )
            .fetch_all(&self.pool)
            .await?;
            Ok(rows.into_iter().collect())
        })
        .await
    }

    // ─── Action log (append-only) ───────────────────────────────────────────

    pub async fn record_action(
        &self,
        kind: &str,
        task_id: &str,
        user_id: &str,
        details: &serde_json::Value,
    ) -> Result<()> {
        with_timeout(async {
            sqlx::query(
                "INSERT INTO actions (id, kind, task_id, user_id, details, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(kind)
            .bind(task_id)
            .bind(user_id)
            .bind(details.to_string())
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    /// Newest-first global feed, capped (callers pass 20).
    pub async fn recent_actions(&self, limit: i64) -> Result<Vec<ActionRow>> {
        with_timeout(async {
            Ok(sqlx::query_as(&format!(
                "{ACTION_SELECT} ORDER BY a.created_at DESC, a.rowid DESC LIMIT ?"
            ))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?)
        })
        .await
    }

    /// Newest-first per-task history, uncapped.
    pub async fn actions_for_task(&self, task_id: &str) -> Result<Vec<ActionRow>> {
        with_timeout(async {
            Ok(sqlx::query_as(&format!(
                "{ACTION_SELECT} WHERE a.task_id = ? ORDER BY a.created_at DESC, a.rowid DESC"
            ))
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?)
        })
        .await
    }

    /// Newest-first per-user feed, capped (callers pass 20).
    pub async fn actions_for_user(&self, user_id: &str, limit: i64) -> Result<Vec<ActionRow>> {
        with_timeout(async {
            Ok(sqlx::query_as(&format!(
                "{ACTION_SELECT} WHERE a.user_id = ? ORDER BY a.created_at DESC, a.rowid DESC LIMIT ?"
            ))
            .bind(user_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?)
        })
        .await
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn task_row(id: &str, title: &str) -> TaskRow {
        let now = chrono::Utc::now().to_rfc3339();
        TaskRow {
            id: id.to_string(),
            title: title.to_string(),
            description: String::new(),
            status: "Todo".to_string(),
            priority: "Medium".to_string(),
            assigned_to: None,
            created_by: "u1".to_string(),
            position: 0,
            version: 1,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn version_cas_rejects_stale_writer() {
        let s = Storage::in_memory().await.unwrap();
        s.insert_task(&task_row("t1", "Write docs")).await.unwrap();

        let mut row = s.get_task("t1").await.unwrap().unwrap();
        row.status = "In Progress".to_string();
        assert!(s.update_task_if_version(&row, 1).await.unwrap());

        // A second writer still holding version 1 loses.
        row.status = "Done".to_string();
        assert!(!s.update_task_if_version(&row, 1).await.unwrap());

        let stored = s.get_task("t1").await.unwrap().unwrap();
        assert_eq!(stored.status, "In Progress");
        assert_eq!(stored.version, 2);
    }

    #[tokio::test]
    async fn duplicate_title_hits_unique_index() {
        let s = Storage::in_memory().await.unwrap();
        s.insert_task(&task_row("t1", "Same")).await.unwrap();
        let err = s.insert_task(&task_row("t2", "Same")).await.unwrap_err();
        assert!(is_unique_violation(&err));
    }

    #[tokio::test]
    async fn active_counts_exclude_done_and_unassigned() {
        let s = Storage::in_memory().await.unwrap();
        let mut a = task_row("t1", "A");
        a.assigned_to = Some("u1".to_string());
        let mut b = task_row("t2", "B");
        b.assigned_to = Some("u1".to_string());
        b.status = "Done".to_string();
        let mut c = task_row("t3", "C");
        c.assigned_to = Some("u2".to_string());
        c.status = "In Progress".to_string();
        let d = task_row("t4", "D"); // unassigned
        for row in [&a, &b, &c, &d] {
            s.insert_task(row).await.unwrap();
        }

        let counts = s.active_assignment_counts().await.unwrap();
        assert_eq!(counts.get("u1"), Some(&1));
        assert_eq!(counts.get("u2"), Some(&1));
        assert_eq!(counts.len(), 2);
    }

    #[tokio::test]
    async fn action_feed_joins_and_caps() {
        let s = Storage::in_memory().await.unwrap();
        s.upsert_user("u1", "alice", "a@x.io").await.unwrap();
        s.insert_task(&task_row("t1", "Join me")).await.unwrap();
        for i in 0..25 {
            s.record_action("update", "t1", "u1", &serde_json::json!({ "i": i }))
                .await
                .unwrap();
        }

        let recent = s.recent_actions(20).await.unwrap();
        assert_eq!(recent.len(), 20);
        assert_eq!(recent[0].username.as_deref(), Some("alice"));
        assert_eq!(recent[0].task_title.as_deref(), Some("Join me"));
        // Newest first.
        assert_eq!(recent[0].details, r#"{"i":24}"#);

        let for_task = s.actions_for_task("t1").await.unwrap();
        assert_eq!(for_task.len(), 25);
    }

    #[tokio::test]
    async fn user_enumeration_is_insertion_ordered() {
        let s = Storage::in_memory().await.unwrap();
        s.upsert_user("u2", "bob", "").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        s.upsert_user("u1", "alice", "").await.unwrap();
        // Re-auth does not move bob to the back.
        s.upsert_user("u2", "bobby", "b@x.io").await.unwrap();

        let users = s.list_users().await.unwrap();
        assert_eq!(users[0].id, "u2");
        assert_eq!(users[0].username, "bobby");
        assert_eq!(users[1].id, "u1");
    }
}
