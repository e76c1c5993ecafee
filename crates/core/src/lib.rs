pub mod bus;
pub mod collaborators;
pub mod config;
pub mod coordination;
pub mod dispatch;
pub mod maintenance;
pub mod metrics;
pub mod orchestration;
pub mod task;
pub mod testing;
pub mod workflows;

pub use bus::{LocalBus, MessageBus, MessageHandler};
pub use config::{load_config, load_config_from_str, validate_config, Config, ConfigError};
pub use dispatch::{DispatchError, DispatchOutcome, Router};
pub use maintenance::{Maintenance, PurgeReport, ReplayReport};
pub use task::{NewTask, SqliteTaskStore, StoreError, Task, TaskFilter, TaskPatch, TaskStatus, TaskStore};
pub use workflows::downloader::Downloader;
pub use workflows::encoder::Encoder;
