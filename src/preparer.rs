//! Environment preparers
//!
//! A preparer turns a test name and its setup directives into an
//! [`ExecutionContext`]. Different deployments plug in different
//! strategies; [`LocalPreparer`] builds directories under the local temp
//! dir.

use tracing::debug;

use crate::config::EnvConfig;
use crate::context::ExecutionContext;
use crate::directive::{apply_all, ToolsSetup, Workspace};
use crate::error::SetupError;
use crate::pool::DrainPool;

/// Strategy that builds a test's workspace and context.
///
/// Implementations may clone `pool` into the context but must not keep it
/// past the owning environment's `dispose`.
pub trait EnvironmentPreparer: Send + Sync {
    fn prepare(
        &self,
        test_name: &str,
        tools: &[Box<dyn ToolsSetup>],
        pool: &DrainPool,
    ) -> Result<ExecutionContext, SetupError>;
}

impl<F> EnvironmentPreparer for F
where
    F: Fn(&str, &[Box<dyn ToolsSetup>], &DrainPool) -> Result<ExecutionContext, SetupError>
        + Send
        + Sync,
{
    fn prepare(
        &self,
        test_name: &str,
        tools: &[Box<dyn ToolsSetup>],
        pool: &DrainPool,
    ) -> Result<ExecutionContext, SetupError> {
        self(test_name, tools, pool)
    }
}

/// Prepares each test in a fresh temp directory laid out as
/// `blackbox-<test>-XXXX/{work,tmp}`.
#[derive(Debug, Clone, Default)]
pub struct LocalPreparer {
    config: EnvConfig,
}

impl LocalPreparer {
    pub fn new(config: EnvConfig) -> Self {
        Self { config }
    }

    /// Configuration applied to every test this preparer sets up.
    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    fn create_base(&self, test_name: &str) -> Result<tempfile::TempDir, std::io::Error> {
        let prefix = format!("blackbox-{}-", sanitize(test_name));
        if let Some(ref root) = self.config.workdir_root {
            std::fs::create_dir_all(root)?;
            tempfile::Builder::new().prefix(&prefix).tempdir_in(root)
        } else {
            tempfile::Builder::new().prefix(&prefix).tempdir()
        }
    }
}

impl EnvironmentPreparer for LocalPreparer {
    fn prepare(
        &self,
        test_name: &str,
        tools: &[Box<dyn ToolsSetup>],
        pool: &DrainPool,
    ) -> Result<ExecutionContext, SetupError> {
        let base = self.create_base(test_name).map_err(|e| {
            SetupError::workspace(format!("failed to create workdir: {}", e)).with_test(test_name)
        })?;
        let work = base.path().join("work");
        let tmp = base.path().join("tmp");
        for dir in [&work, &tmp] {
            std::fs::create_dir_all(dir).map_err(|e| {
                SetupError::workspace(format!("{}: {}", dir.display(), e)).with_test(test_name)
            })?;
        }
        debug!(
            test = test_name,
            work = %work.display(),
            directives = tools.len(),
            "preparing workspace"
        );

        let mut workspace = Workspace::new(work, tmp);
        for (k, v) in &self.config.env {
            workspace.set_env(k, v);
        }
        apply_all(tools, &mut workspace).map_err(|e| e.with_test(test_name))?;

        let mut ctx = ExecutionContext::new(
            test_name,
            workspace,
            self.config.tool.clone(),
            pool.clone(),
            Some(base),
        );
        if self.config.preserve_work {
            ctx.preserve();
        }
        Ok(ctx)
    }
}

/// Make a test name safe for use in a directory name.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
