//! Durable task records, the forward-only state machine and task stores.

mod patch;
mod remote;
mod sqlite_store;
mod store;
mod types;

pub use patch::{get_path, set_path, TaskPatch};
pub use remote::{topics, RemoteTaskStore, StoreService};
pub use sqlite_store::SqliteTaskStore;
pub use store::{StoreError, TaskFilter, TaskStore};
pub use types::{NewTask, Task, TaskError, TaskStatus};
