//! CLI Commands

pub mod list;
pub mod run;
pub mod validate;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;
use uiflow_e2e::RunnerConfig;

/// Exit status: every scenario passed
pub const EXIT_PASSED: u8 = 0;
/// Exit status: at least one scenario failed or errored
pub const EXIT_FAILED: u8 = 1;
/// Exit status: the runner itself could not proceed
pub const EXIT_RUNNER_ERROR: u8 = 2;

/// Config file (if present) with `UIFLOW_*` overrides applied
pub fn load_config(path: &Path) -> Result<RunnerConfig> {
    let config = RunnerConfig::load_with_env(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
    debug!("Loaded configuration: {:?}", config);
    Ok(config)
}

/// Explicit paths, or the configured scenarios directory when none are given
pub fn scenario_paths(paths: &[PathBuf], config: &RunnerConfig) -> Vec<PathBuf> {
    if paths.is_empty() {
        vec![config.scenarios_dir.clone()]
    } else {
        paths.to_vec()
    }
}
