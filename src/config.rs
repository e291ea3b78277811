//! Environment configuration

use std::path::PathBuf;
use std::time::Duration;

/// How long `dispose` waits for outstanding drain work.
pub const GRACE_PERIOD: Duration = Duration::from_secs(1);

/// Path of the build tool binary under test
pub const ENV_TOOL: &str = "BLACKBOX_TOOL";
/// Root directory for per-test working directories
pub const ENV_WORK_ROOT: &str = "BLACKBOX_WORK_ROOT";
/// Set to keep per-test directories after the test
pub const ENV_KEEP_WORK: &str = "BLACKBOX_KEEP_WORK";

/// Configuration for the local environment preparer
#[derive(Debug, Clone, Default)]
pub struct EnvConfig {
    /// Build tool binary run by `ExecutionContext::run_tool`
    pub tool: Option<PathBuf>,
    /// Root directory for temp working directories
    pub workdir_root: Option<PathBuf>,
    /// Preserve working directories after each test (for debugging)
    pub preserve_work: bool,
    /// Environment variables exported to every test
    pub env: Vec<(String, String)>,
}

impl EnvConfig {
    /// Defaults overridden by `BLACKBOX_*` variables from the process environment.
    pub fn from_env() -> Self {
        Self {
            tool: std::env::var_os(ENV_TOOL).map(PathBuf::from),
            workdir_root: std::env::var_os(ENV_WORK_ROOT).map(PathBuf::from),
            preserve_work: std::env::var_os(ENV_KEEP_WORK).is_some(),
            env: Vec::new(),
        }
    }

    pub fn tool(mut self, tool: impl Into<PathBuf>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    pub fn workdir_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workdir_root = Some(root.into());
        self
    }

    pub fn preserve_work(mut self, preserve: bool) -> Self {
        self.preserve_work = preserve;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}
