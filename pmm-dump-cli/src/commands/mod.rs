//! CLI command implementations

pub mod export;
pub mod import;
pub mod show_meta;

use pmm_dump_core::{ConnectionConfig, ConnectionParams, ToolVersion};
use std::path::PathBuf;

/// Options shared by every command.
pub struct CommonOpts {
    pub connection: ConnectionParams,
    pub dump_core: bool,
    pub dump_qan: bool,
    pub dump_path: Option<PathBuf>,
    pub workers: Option<usize>,
    pub vm_native_data: bool,
}

/// Version of this binary, embedded at build time.
pub fn tool_version() -> ToolVersion {
    ToolVersion {
        git_branch: env!("GIT_BRANCH").to_string(),
        git_commit: env!("GIT_COMMIT").to_string(),
        git_version: env!("GIT_VERSION").to_string(),
    }
}

/// Basic-auth credentials in the shape the adapters take.
pub fn credentials(config: &ConnectionConfig) -> Option<(String, Option<String>)> {
    config.username.clone().map(|user| (user, config.password.clone()))
}
