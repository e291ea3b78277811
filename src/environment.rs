//! Test environment lifecycle
//!
//! One [`TestEnvironment`] serves a whole test group. It owns the stream
//! drain pool, hands each test an [`ExecutionContext`] wired to it, and
//! shuts the pool down exactly once in [`TestEnvironment::dispose`].
//!
//! ```rust,ignore
//! let env = TestEnvironment::local(EnvConfig::from_env())?;
//! let ctx = env.prepare_environment("builds_hello", &[Box::new(DefaultWorkspaceFile)])?;
//! let result = ctx.run_tool(["build", "//:hello"])?;
//! assert!(result.success());
//! env.dispose()?;
//! ```

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::config::{EnvConfig, GRACE_PERIOD};
use crate::context::ExecutionContext;
use crate::directive::ToolsSetup;
use crate::error::EnvError;
use crate::pool::DrainPool;
use crate::preparer::{EnvironmentPreparer, LocalPreparer};

/// Whether the drain pool is still available.
enum PoolSlot {
    Active(DrainPool),
    Disposed,
}

/// Shared environment for a group of black-box tests.
pub struct TestEnvironment {
    preparer: Box<dyn EnvironmentPreparer>,
    slot: RwLock<PoolSlot>,
}

impl TestEnvironment {
    /// Create an environment using `preparer`. The drain pool is started
    /// immediately.
    pub fn new(preparer: impl EnvironmentPreparer + 'static) -> std::io::Result<Self> {
        let pool = DrainPool::new()?;
        debug!("test environment created");
        Ok(Self {
            preparer: Box::new(preparer),
            slot: RwLock::new(PoolSlot::Active(pool)),
        })
    }

    /// Create an environment backed by a [`LocalPreparer`].
    pub fn local(config: EnvConfig) -> std::io::Result<Self> {
        Self::new(LocalPreparer::new(config))
    }

    /// Prepare a fresh workspace for `test_name`, apply `tools` in order and
    /// return the test's context.
    ///
    /// Fails with [`EnvError::Disposed`] after `dispose`. Errors from the
    /// preparer are returned as they are.
    pub fn prepare_environment(
        &self,
        test_name: &str,
        tools: &[Box<dyn ToolsSetup>],
    ) -> Result<ExecutionContext, EnvError> {
        // The read guard is held for the whole hook: dispose takes the write
        // side, so it waits for preparations already in flight.
        let slot = self.slot.read();
        let pool = match &*slot {
            PoolSlot::Active(pool) => pool,
            PoolSlot::Disposed => {
                return Err(EnvError::Disposed {
                    op: "prepare_environment",
                })
            }
        };
        info!(test = test_name, directives = tools.len(), "preparing test environment");
        Ok(self.preparer.prepare(test_name, tools, pool)?)
    }

    /// Shut down the drain pool, waiting at most [`GRACE_PERIOD`] for
    /// outstanding drain tasks. Work still running after that is abandoned.
    ///
    /// Must be called exactly once, after the last test of the group
    /// (including when tests failed). A second call fails with
    /// [`EnvError::Disposed`]. Preparations in progress finish first.
    pub fn dispose(&self) -> Result<(), EnvError> {
        let slot = std::mem::replace(&mut *self.slot.write(), PoolSlot::Disposed);
        let pool = match slot {
            PoolSlot::Active(pool) => pool,
            PoolSlot::Disposed => return Err(EnvError::Disposed { op: "dispose" }),
        };
        if pool.shutdown_and_await(GRACE_PERIOD) {
            info!("test environment disposed");
        } else {
            warn!(
                grace = ?GRACE_PERIOD,
                "test environment disposed with drain tasks still running"
            );
        }
        Ok(())
    }

    /// Whether `dispose` has been called.
    pub fn is_disposed(&self) -> bool {
        matches!(*self.slot.read(), PoolSlot::Disposed)
    }
}

impl Drop for TestEnvironment {
    fn drop(&mut self) {
        if let PoolSlot::Active(pool) = &*self.slot.get_mut() {
            warn!("test environment dropped without dispose, stopping drain pool");
            pool.shutdown();
        }
    }
}

impl std::fmt::Debug for TestEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestEnvironment")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
