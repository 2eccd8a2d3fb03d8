// src/errors.rs

//! Crate-wide error taxonomy.
//!
//! Only `Configuration` is raised at graph build time. `Handler` and
//! `Routing` end a run in `terminated`; `Persistence` and `Timeout` are
//! absorbed by the driver and reported through the message log instead of
//! reaching the caller.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StepflowError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Handler error in node '{node}': {message}")]
    Handler { node: String, message: String },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Timeout in node '{node}'")]
    Timeout { node: String },

    #[error("Routing error in node '{node}': router returned unknown key '{key}'")]
    Routing { node: String, key: String },

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run '{0}' has already finished")]
    RunFinished(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, StepflowError>;
