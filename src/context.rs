//! Per-test execution context
//!
//! Returned by [`crate::TestEnvironment::prepare_environment`]. The test
//! owns it; the drain pool inside is borrowed from the environment and
//! stays valid until the environment is disposed.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};

use crate::directive::Workspace;
use crate::error::{ErrorKind, SetupError};
use crate::pool::DrainPool;
use crate::process::{ProcessError, ProcessResult, ProcessRunner};

/// Handle a test uses to run the build tool and inspect its workspace.
#[derive(Debug)]
pub struct ExecutionContext {
    test_name: String,
    work_dir: PathBuf,
    tmp_dir: PathBuf,
    tool: Option<PathBuf>,
    env: Vec<(String, String)>,
    pool: DrainPool,
    /// Removed on drop unless the work is preserved
    base: Option<tempfile::TempDir>,
}

impl ExecutionContext {
    /// Assemble a context over an already prepared workspace.
    ///
    /// `base`, if given, is the temp directory that contains the workspace;
    /// it is deleted when the context is dropped.
    pub fn new(
        test_name: impl Into<String>,
        workspace: Workspace,
        tool: Option<PathBuf>,
        pool: DrainPool,
        base: Option<tempfile::TempDir>,
    ) -> Self {
        let work_dir = workspace.root().to_path_buf();
        let tmp_dir = workspace.tmp().to_path_buf();
        Self {
            test_name: test_name.into(),
            work_dir,
            tmp_dir,
            tool,
            env: workspace.into_env(),
            pool,
            base,
        }
    }

    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    /// Directory the build tool runs in.
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Scratch directory exported to child processes as `TEST_TMPDIR`.
    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    /// Environment exported to every process this context runs.
    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    /// The shared stream drain pool.
    pub fn drain_pool(&self) -> &DrainPool {
        &self.pool
    }

    /// Build tool binary, if one is configured.
    pub fn tool(&self) -> Option<&Path> {
        self.tool.as_deref()
    }

    /// Keep the directories on disk after the context is dropped and
    /// return their location.
    pub fn preserve(&mut self) -> PathBuf {
        match self.base.take() {
            Some(base) => {
                let path = base.path().to_path_buf();
                std::mem::forget(base); // leak to preserve
                info!(test = %self.test_name, path = %path.display(), "preserving test directory");
                path
            }
            None => self.work_dir.clone(),
        }
    }

    /// Start building a process that runs in the work dir with the
    /// context's environment and drain pool.
    pub fn command(&self, program: impl AsRef<std::ffi::OsStr>) -> ProcessRunner {
        ProcessRunner::new(program, self.pool.clone())
            .current_dir(&self.work_dir)
            .env("TEST_TMPDIR", self.tmp_dir.display().to_string())
            .envs(&self.env)
    }

    /// Run an arbitrary program in the work dir.
    pub fn run<I, S>(
        &self,
        program: impl AsRef<std::ffi::OsStr>,
        args: I,
    ) -> Result<ProcessResult, ProcessError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command(program).args(args).run()
    }

    /// Run the build tool under test.
    pub fn run_tool<I, S>(&self, args: I) -> Result<ProcessResult, ProcessError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tool_command(args, None)?.run()
    }

    /// Run the build tool, killing it after `timeout`.
    pub fn run_tool_with_timeout<I, S>(
        &self,
        args: I,
        timeout: Duration,
    ) -> Result<ProcessResult, ProcessError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tool_command(args, Some(timeout))?.run()
    }

    fn tool_command<I, S>(
        &self,
        args: I,
        timeout: Option<Duration>,
    ) -> Result<ProcessRunner, ProcessError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let Some(ref tool) = self.tool else {
            return Err(ProcessError::Spawn {
                program: "<build tool>".into(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no build tool configured (set BLACKBOX_TOOL)",
                ),
            });
        };
        debug!(test = %self.test_name, tool = %tool.display(), "running build tool");
        let mut runner = self.command(tool).args(args);
        if let Some(timeout) = timeout {
            runner = runner.timeout(timeout);
        }
        Ok(runner)
    }

    /// Write a file relative to the work dir.
    pub fn write(&self, path: &str, content: impl AsRef<[u8]>) -> Result<PathBuf, SetupError> {
        self.workspace_view().write_file(path, content)
    }

    /// Read a file relative to the work dir.
    pub fn read(&self, path: &str) -> Result<String, SetupError> {
        self.workspace_view().read_file(path)
    }

    /// Read a file and compare it against `expected`, returning a unified
    /// diff on mismatch.
    pub fn assert_file(&self, path: &str, expected: &str) -> Result<(), SetupError> {
        let actual = self.read(path)?;
        crate::golden::compare(expected, &actual, path)
            .map_err(|diff| SetupError::new(ErrorKind::Other, diff))
    }

    fn workspace_view(&self) -> Workspace {
        Workspace::new(self.work_dir.clone(), self.tmp_dir.clone())
    }
}
