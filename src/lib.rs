//! emx-blackbox: shared environment lifecycle for black-box E2E tests
//!
//! Tests that exercise a build tool end to end each need an isolated
//! working directory, a way to run the tool as a child process, and a way
//! to capture its output. This crate provides the group-level piece that
//! ties those together.
//!
//! # Overview
//!
//! A test group creates one [`TestEnvironment`]. It owns a [`DrainPool`]
//! of exactly two threads, used to read a child's stdout and stderr
//! concurrently so neither pipe can fill up and stall the child. Each test
//! calls [`TestEnvironment::prepare_environment`] to get an
//! [`ExecutionContext`] (its own directories plus a handle to the shared
//! pool), and the group calls [`TestEnvironment::dispose`] once at the end.
//!
//! ```rust,ignore
//! use emx_blackbox::{DefaultWorkspaceFile, EnvConfig, TestEnvironment, ToolsSetup, WriteFile};
//!
//! let env = TestEnvironment::local(EnvConfig::from_env())?;
//! let tools: Vec<Box<dyn ToolsSetup>> = vec![
//!     Box::new(DefaultWorkspaceFile),
//!     Box::new(WriteFile::new("BUILD", "genrule(...)")),
//! ];
//! let ctx = env.prepare_environment("genrule_runs", &tools)?;
//! let result = ctx.run_tool(["build", "//..."])?;
//! assert!(result.success(), "{}", result.stderr);
//! env.dispose()?;
//! ```
//!
//! # Setup directives
//!
//! | Directive | Description |
//! |-----------|-------------|
//! | `WriteFile` | Write a file into the work dir |
//! | `CreateDir` | Create a directory |
//! | `SetEnv` | Export a variable to processes the test runs |
//! | `TxtarFixture` | Unpack a txtar archive |
//! | `DefaultWorkspaceFile` | Write the default `WORKSPACE` document |
//! | `FnSetup` | Any closure |
//!
//! # Environment variables
//!
//! - `BLACKBOX_TOOL` - build tool binary run by `run_tool`
//! - `BLACKBOX_WORK_ROOT` - where per-test directories are created
//! - `BLACKBOX_KEEP_WORK` - keep per-test directories after the test

mod config;
mod context;
mod directive;
mod environment;
mod error;
mod golden;
mod pool;
mod preparer;
mod process;
mod workspace;

pub use config::{EnvConfig, ENV_KEEP_WORK, ENV_TOOL, ENV_WORK_ROOT, GRACE_PERIOD};
pub use context::ExecutionContext;
pub use directive::{
    apply_all, CreateDir, DefaultWorkspaceFile, FnSetup, SetEnv, ToolsSetup, TxtarFixture,
    Workspace, WriteFile,
};
pub use environment::TestEnvironment;
pub use error::{EnvError, ErrorKind, PoolError, SetupError};
pub use golden::compare as compare_golden;
pub use pool::{DrainPool, DrainTask, DRAIN_WORKERS};
pub use preparer::{EnvironmentPreparer, LocalPreparer};
pub use process::{ProcessError, ProcessResult, ProcessRunner};
pub use workspace::{workspace_with_default_repos, DEFAULT_WORKSPACE_FILE};
