//! Shared types, error model, and configuration for linkflow.
//!
//! This crate is the foundation depended on by all other linkflow crates.
//! It provides:
//! - [`LinkflowError`], the unified error type
//! - Domain types ([`WorkItem`], [`Status`], [`Stage`], [`StageOutput`], [`ItemId`])
//! - Configuration ([`AppConfig`], [`PipelineConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, ClassificationConfig, DatabaseConfig, PipelineConfig, RetryConfig, StageConfig,
    StagePolicy, StagesConfig, SweeperConfig, config_dir, config_file_path, init_config,
    load_config, load_config_from, resolve_db_path, validate_config,
};
pub use error::{LinkflowError, Result};
pub use types::{
    Classification, FailureKind, ItemId, ItemRef, Outcome, Provenance, Stage, StageOutput, Status,
    TransitionRecord, UpsertResult, WorkItem,
};
