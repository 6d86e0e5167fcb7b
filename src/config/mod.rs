//! Configuration Management Module
//!
//! Handles persistent storage of forwarding rules and runtime settings.

pub mod storage;
pub mod types;

pub use storage::{config_dir, rules_file, ConfigStorage, StorageError};
pub use types::{ConfigFile, ForwardSettings, CONFIG_VERSION};
