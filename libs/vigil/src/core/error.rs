//! Error types for the vigil host.
//!
//! Covers module loading, pipeline assembly and stage lifecycle. Stages
//! surface their own runtime failures as events, not as host errors.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HostError {
    #[error("failed to load stage module '{path}': {detail}")]
    ModuleLoadFailed { path: PathBuf, detail: String },

    #[error("stage module '{path}' does not export zm_plugin_init")]
    SymbolMissing { path: PathBuf },

    #[error("stage declared ABI version {got}, host supports version 1")]
    IncompatibleVersion { got: u32 },

    #[error("invalid stage from '{path}': {reason}")]
    InvalidStage { path: PathBuf, reason: String },

    #[error("malformed pipeline: {reason}")]
    MalformedPipeline { reason: String },

    #[error("stage {index} failed to start (code {code})")]
    StageStartFailed { index: usize, code: i32 },

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type that uses HostError
pub type Result<T> = std::result::Result<T, HostError>;
