//! Environment errors

use std::fmt;

/// The kind of setup error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Creating the test directories failed
    Workspace,
    /// A tool setup directive failed
    Directive,
    /// A path escaped the workspace root
    PathEscape,
    /// A fixture archive could not be parsed
    Fixture,
    /// IO error
    Io,
    /// Other error
    Other,
}

/// An error raised while preparing a test environment.
///
/// Carries the test name and the directive that failed when known, so the
/// message reads `test: directive: message`.
#[derive(Debug)]
pub struct SetupError {
    pub kind: ErrorKind,
    pub message: String,
    pub test: Option<String>,
    pub directive: Option<String>,
}

impl SetupError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            test: None,
            directive: None,
        }
    }

    pub fn with_test(mut self, test: impl Into<String>) -> Self {
        self.test = Some(test.into());
        self
    }

    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        if self.directive.is_none() {
            self.directive = Some(directive.into());
        }
        self
    }

    pub fn workspace(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Workspace, msg)
    }

    pub fn directive(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Directive, msg)
    }

    pub fn path_escape(path: &str, root: &std::path::Path) -> Self {
        Self::new(
            ErrorKind::PathEscape,
            format!("path escapes workspace: {} (root: {})", path, root.display()),
        )
    }
}

impl fmt::Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref test) = self.test {
            write!(f, "{}: ", test)?;
        }
        if let Some(ref directive) = self.directive {
            write!(f, "{}: ", directive)?;
        }
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for SetupError {}

impl From<std::io::Error> for SetupError {
    fn from(e: std::io::Error) -> Self {
        Self::new(ErrorKind::Io, e.to_string())
    }
}

/// Errors from the drain pool
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    /// The pool no longer accepts work
    #[error("drain pool is shut down")]
    Shutdown,
    /// The task was discarded by a forced shutdown, or its worker panicked
    #[error("drain task was abandoned before completing")]
    Abandoned,
    /// `join_timeout` expired before the task finished
    #[error("drain task did not finish in time")]
    Timeout,
}

/// Errors surfaced by [`crate::TestEnvironment`].
#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    /// The environment was used after `dispose`. This is a bug in the
    /// calling harness, never a runtime condition.
    #[error("test environment misuse: {op} called after dispose")]
    Disposed { op: &'static str },
    /// The preparer failed; the error is passed through as-is.
    #[error(transparent)]
    Setup(#[from] SetupError),
}

impl EnvError {
    pub fn is_misuse(&self) -> bool {
        matches!(self, EnvError::Disposed { .. })
    }

    /// The underlying setup error, if this is one.
    pub fn as_setup(&self) -> Option<&SetupError> {
        match self {
            EnvError::Setup(e) => Some(e),
            EnvError::Disposed { .. } => None,
        }
    }
}
