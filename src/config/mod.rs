//! Configuration module for sqlbridge.
//!
//! Handles the worker transport, image storage, and logging settings.

mod settings;

pub use settings::{
    expand_env_vars, LogFormat, LoggingSettings, Settings, SettingsError, StorageSettings,
    Transport, WorkerSettings,
};
