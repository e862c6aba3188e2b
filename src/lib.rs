pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod storage;

pub use config::{AppConfig, TargetConfig, DEFAULT_CONFIG_FILE};
pub use self::core::{Operation, RunReport, SyncEngine, TargetSet};
pub use error::{Result, SyncError};
pub use storage::{create_store, ObjectStore, StoreSettings};
