//! Shared types, error model, and configuration for epgsync.
//!
//! This crate is the foundation depended on by the other epgsync crates.
//! It provides:
//! - [`EpgSyncError`] — the unified error type
//! - Domain types ([`RegionCode`], [`Region`], [`RunId`], [`Stage`])
//! - Configuration ([`AppConfig`], [`Credentials`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BranchStrategy, CONFIG_FILE_NAME, ChannelFileConfig, ChannelsConfig,
    Credentials, CredentialsConfig, FailurePolicy, GrabberConfig, LauncherConfig, OutputConfig,
    PipelineConfig, RegionConfig, SourcesConfig, WorkspaceConfig, WorkspacePaths, config_base,
    config_dir, init_config, load_config_from, locate_config,
};
pub use error::{EpgSyncError, Result};
pub use types::{Region, RegionCode, RunId, Stage};
