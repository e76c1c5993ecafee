//! SQLite-backed task store implementation.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::patch::TaskPatch;
use super::store::{validate_new_task, StoreError, TaskFilter, TaskStore};
use super::types::{NewTask, Task, TaskError, TaskStatus};

const SELECT_COLUMNS: &str = "SELECT id, topic, status, payload, parent_task_id, error, completed_at, created_at, updated_at FROM tasks";

/// SQLite-backed task store.
///
/// All writes go through one connection behind a mutex, so a patch's
/// read-check-write sequence is atomic with respect to every other caller.
pub struct SqliteTaskStore {
    conn: Mutex<Connection>,
}

impl SqliteTaskStore {
    /// Create a new SQLite task store, creating the database file and tables if needed.
    pub fn new(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(db_err)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory SQLite task store (useful for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                topic TEXT NOT NULL,
                status TEXT NOT NULL,
                payload TEXT NOT NULL,
                parent_task_id TEXT,
                error TEXT,
                completed_at TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_topic ON tasks(topic);
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_task_id);
            "#,
        )
        .map_err(db_err)
    }

    /// Locks the connection. A poisoned lock still guards a consistent
    /// connection because every write runs inside a transaction.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn build_where_clause(filter: &TaskFilter) -> (String, Vec<String>) {
        let mut conditions = Vec::new();
        let mut params = Vec::new();

        if let Some(ref id) = filter.id {
            conditions.push("id = ?".to_string());
            params.push(id.clone());
        }

        if !filter.topics.is_empty() {
            let marks = vec!["?"; filter.topics.len()].join(", ");
            conditions.push(format!("topic IN ({})", marks));
            params.extend(filter.topics.iter().cloned());
        }

        if !filter.statuses.is_empty() {
            let marks = vec!["?"; filter.statuses.len()].join(", ");
            conditions.push(format!("status IN ({})", marks));
            params.extend(filter.statuses.iter().map(|s| s.as_str().to_string()));
        }

        if let Some(ref parent) = filter.parent_task_id {
            conditions.push("parent_task_id = ?".to_string());
            params.push(parent.clone());
        }

        // Payload conditions are evaluated in Rust on the narrowed rows.
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        (where_clause, params)
    }

    fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<RawTask> {
        Ok(RawTask {
            id: row.get(0)?,
            topic: row.get(1)?,
            status: row.get(2)?,
            payload: row.get(3)?,
            parent_task_id: row.get(4)?,
            error: row.get(5)?,
            completed_at: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn query(conn: &Connection, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        let (where_clause, params) = Self::build_where_clause(filter);
        let sql = format!("{} {} ORDER BY seq ASC", SELECT_COLUMNS, where_clause);

        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), Self::row_to_task)
            .map_err(db_err)?;

        let mut tasks = Vec::new();
        for row in rows {
            let task = row.map_err(db_err)?.into_task()?;
            if filter.matches(&task) {
                tasks.push(task);
            }
        }
        Ok(tasks)
    }

    fn load(conn: &Connection, id: &str) -> Result<Option<Task>, StoreError> {
        conn.query_row(
            &format!("{} WHERE id = ?", SELECT_COLUMNS),
            params![id],
            Self::row_to_task,
        )
        .optional()
        .map_err(db_err)?
        .map(RawTask::into_task)
        .transpose()
    }

    fn insert(conn: &Connection, request: NewTask) -> Result<Task, StoreError> {
        validate_new_task(&request)?;

        let now = Utc::now();
        let task = Task {
            id: uuid::Uuid::new_v4().to_string(),
            topic: request.topic,
            status: request.status,
            payload: request.payload,
            parent_task_id: request.parent_task_id,
            error: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };

        conn.execute(
            "INSERT INTO tasks (id, topic, status, payload, parent_task_id, error, completed_at, created_at, updated_at) VALUES (?, ?, ?, ?, ?, NULL, NULL, ?, ?)",
            params![
                task.id,
                task.topic,
                task.status.as_str(),
                task.payload.to_string(),
                task.parent_task_id,
                now.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )
        .map_err(db_err)?;

        Ok(task)
    }

    fn write(conn: &Connection, task: &Task) -> Result<(), StoreError> {
        let error_json = task
            .error
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Database(e.to_string()))?;

        conn.execute(
            "UPDATE tasks SET status = ?, payload = ?, error = ?, completed_at = ?, updated_at = ? WHERE id = ?",
            params![
                task.status.as_str(),
                task.payload.to_string(),
                error_json,
                task.completed_at.map(|t| t.to_rfc3339()),
                task.updated_at.to_rfc3339(),
                task.id,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn create_many_sync(&self, requests: Vec<NewTask>) -> Result<Vec<Task>, StoreError> {
        if requests.is_empty() {
            return Err(StoreError::Validation(
                "task list must not be empty".to_string(),
            ));
        }

        let mut conn = self.conn();
        let tx = conn.transaction().map_err(db_err)?;
        let mut created = Vec::with_capacity(requests.len());
        for request in requests {
            created.push(Self::insert(&tx, request)?);
        }
        tx.commit().map_err(db_err)?;
        Ok(created)
    }

    fn update_sync(&self, id: &str, patch: TaskPatch) -> Result<Task, StoreError> {
        if id.is_empty() {
            return Err(StoreError::Validation("task id must be provided".to_string()));
        }

        let mut conn = self.conn();
        let tx = conn.transaction().map_err(db_err)?;
        let mut task = Self::load(&tx, id)?.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        patch.apply(&mut task, Utc::now())?;
        Self::write(&tx, &task)?;
        tx.commit().map_err(db_err)?;
        Ok(task)
    }

    fn remove_sync(&self, id: &str) -> Result<Option<Task>, StoreError> {
        if id.is_empty() {
            return Err(StoreError::Validation("task id must be provided".to_string()));
        }

        let conn = self.conn();
        let task = Self::load(&conn, id)?;
        if task.is_some() {
            conn.execute("DELETE FROM tasks WHERE id = ?", params![id])
                .map_err(db_err)?;
        }
        Ok(task)
    }

    fn remove_many_sync(&self, filter: &TaskFilter) -> Result<usize, StoreError> {
        if filter.is_empty() {
            return Err(StoreError::Validation(
                "task filter must be provided".to_string(),
            ));
        }

        let mut conn = self.conn();
        let tx = conn.transaction().map_err(db_err)?;
        let doomed = Self::query(&tx, filter)?;
        for task in &doomed {
            tx.execute("DELETE FROM tasks WHERE id = ?", params![task.id])
                .map_err(db_err)?;
        }
        tx.commit().map_err(db_err)?;
        Ok(doomed.len())
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn create(&self, task: NewTask) -> Result<Task, StoreError> {
        let conn = self.conn();
        Self::insert(&conn, task)
    }

    async fn create_many(&self, tasks: Vec<NewTask>) -> Result<Vec<Task>, StoreError> {
        self.create_many_sync(tasks)
    }

    async fn find_one(&self, filter: &TaskFilter) -> Result<Option<Task>, StoreError> {
        let conn = self.conn();
        Ok(Self::query(&conn, filter)?.into_iter().next())
    }

    async fn find_all(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        let conn = self.conn();
        Self::query(&conn, filter)
    }

    async fn update(&self, id: &str, patch: TaskPatch) -> Result<Task, StoreError> {
        self.update_sync(id, patch)
    }

    async fn remove(&self, id: &str) -> Result<Option<Task>, StoreError> {
        self.remove_sync(id)
    }

    async fn remove_many(&self, filter: &TaskFilter) -> Result<usize, StoreError> {
        self.remove_many_sync(filter)
    }
}

/// Row as stored, before JSON/timestamp decoding.
struct RawTask {
    id: String,
    topic: String,
    status: String,
    payload: String,
    parent_task_id: Option<String>,
    error: Option<String>,
    completed_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawTask {
    fn into_task(self) -> Result<Task, StoreError> {
        let status = TaskStatus::parse(&self.status).ok_or_else(|| {
            StoreError::Database(format!("unknown status '{}' for task {}", self.status, self.id))
        })?;
        let payload =
            serde_json::from_str(&self.payload).map_err(|e| StoreError::Database(e.to_string()))?;
        let error: Option<TaskError> = self
            .error
            .map(|json| serde_json::from_str(&json))
            .transpose()
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Task {
            id: self.id,
            topic: self.topic,
            status,
            payload,
            parent_task_id: self.parent_task_id,
            error,
            completed_at: self.completed_at.as_deref().map(parse_time).transpose()?,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
        })
    }
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Database(format!("bad timestamp '{}': {}", value, e)))
}

fn db_err(e: rusqlite::Error) -> StoreError {
    StoreError::Database(e.to_string())
}
