use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EseError, IoResultExt, Result};

pub mod project;

pub use project::{PexTool, ProjectIdentity, ProjectIdentityBuilder, ProjectSide};

pub const DEFAULT_ENVIRONMENT_PATH: &str = "/slowfs/us01dwt3p170/msip_ESE";
pub const DEFAULT_PROJECTS_ROOT: &str = "/remote/proj";
/// Wait budget of one sample extraction run.
pub const DEFAULT_SAMPLE_WAIT_SECS: u64 = 180;
pub const DEFAULT_FALLBACK_METAL_STACK: &str = "DEFAULT_METAL_STACK";

/// Static configuration of the flow.
///
/// Read once from an optional TOML file, then overridden by command line
/// arguments. Never modified after the flow starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EseConfig {
    /// Root of the LOGS/REPORTS/RESULTS/... working environment.
    pub environment_path: PathBuf,
    /// Directory containing `<project type>/<project name>/<release>` trees.
    pub projects_root: PathBuf,
    pub sample_wait_secs: u64,
    pub poll_interval_ms: u64,
    /// Metal stack used by extraction jobs when none can be resolved.
    pub fallback_metal_stack: String,
    /// File identifying a metal stack directory under a release's `cad` directory.
    pub env_descriptor: String,
    pub sample_library: String,
    pub sample_cell: String,
    pub tools: ToolsConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub shell: PathBuf,
    pub ude: String,
    pub layout_viewer: String,
}

impl Default for EseConfig {
    fn default() -> Self {
        Self {
            environment_path: PathBuf::from(DEFAULT_ENVIRONMENT_PATH),
            projects_root: PathBuf::from(DEFAULT_PROJECTS_ROOT),
            sample_wait_secs: DEFAULT_SAMPLE_WAIT_SECS,
            poll_interval_ms: 500,
            fallback_metal_stack: DEFAULT_FALLBACK_METAL_STACK.to_string(),
            env_descriptor: "env.tcl".to_string(),
            sample_library: "ese_sample_lib".to_string(),
            sample_cell: "ese_sample_cell".to_string(),
            tools: ToolsConfig::default(),
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("/bin/bash"),
            ude: "ude".to_string(),
            layout_viewer: "icwbev".to_string(),
        }
    }
}

impl EseConfig {
    #[inline]
    pub fn sample_wait(&self) -> Duration {
        Duration::from_secs(self.sample_wait_secs)
    }

    #[inline]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

pub fn parse_ese_config(path: impl AsRef<Path>) -> Result<EseConfig> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path).at(path)?;
    toml::from_str(&contents).map_err(|source| EseError::ConfigFile {
        path: path.to_owned(),
        source,
    })
}
