//! Child process runner
//!
//! Spawns a program with piped stdout/stderr, drains both streams on the
//! shared [`DrainPool`], and waits for the exit status.

use std::ffi::OsStr;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use regex::Regex;
use tracing::{debug, warn};

use crate::error::PoolError;
use crate::pool::{DrainPool, DrainTask};

/// How often a timed wait polls the child.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long to keep reading a killed process's streams. A grandchild that
/// inherited the pipes can hold them open long after the kill.
const KILLED_DRAIN_WAIT: Duration = Duration::from_millis(250);

/// Errors from running a child process
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to execute '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to wait for '{program}': {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read {stream} of '{program}': {source}")]
    Read {
        program: String,
        stream: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot drain output of '{program}': {source}")]
    Drain {
        program: String,
        #[source]
        source: PoolError,
    },
    #[error("'{program}' failed with {result}")]
    Failed { program: String, result: String },
}

/// Captured outcome of one child process
#[derive(Debug, Clone)]
pub struct ProcessResult {
    /// Exit code, or None if the process was killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Whether the process was killed after exceeding its timeout
    pub timed_out: bool,
    /// Whether a stream was still open after the kill, so output is partial
    pub truncated: bool,
    pub duration: Duration,
}

impl ProcessResult {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Whether stdout contains a match for `pattern`.
    pub fn stdout_matches(&self, pattern: &str) -> Result<bool, regex::Error> {
        Ok(Regex::new(pattern)?.is_match(&self.stdout))
    }

    /// Whether stderr contains a match for `pattern`.
    pub fn stderr_matches(&self, pattern: &str) -> Result<bool, regex::Error> {
        Ok(Regex::new(pattern)?.is_match(&self.stderr))
    }

    fn describe(&self) -> String {
        if self.timed_out {
            format!("timeout after {}ms", self.duration.as_millis())
        } else {
            match self.exit_code {
                Some(code) => format!("exit code {}", code),
                None => "termination by signal".into(),
            }
        }
    }
}

/// Builder-style runner for one child process.
pub struct ProcessRunner {
    program: PathBuf,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: Vec<(String, String)>,
    timeout: Option<Duration>,
    pool: DrainPool,
}

impl ProcessRunner {
    pub fn new(program: impl AsRef<OsStr>, pool: DrainPool) -> Self {
        Self {
            program: PathBuf::from(program.as_ref()),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            timeout: None,
            pool,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn envs(mut self, vars: &[(String, String)]) -> Self {
        self.env.extend(vars.iter().cloned());
        self
    }

    /// Kill the process if it runs longer than `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn program_name(&self) -> String {
        self.program.display().to_string()
    }

    /// Run to completion, capturing both streams in full.
    pub fn run(self) -> Result<ProcessResult, ProcessError> {
        let program = self.program_name();
        debug!(program = %program, args = ?self.args, "spawning process");
        let start = Instant::now();

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(ref cwd) = self.cwd {
            cmd.current_dir(cwd);
        }
        for (k, v) in &self.env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: program.clone(),
            source,
        })?;

        let (stdout, stderr) = match self.start_drains(&mut child) {
            Ok(d) => d,
            Err(source) => {
                // Without readers the child could block forever on a full pipe.
                abort_child(&mut child);
                return Err(ProcessError::Drain { program, source });
            }
        };

        let (status, timed_out) = match wait_child(&mut child, self.timeout) {
            Ok(waited) => waited,
            Err(source) => {
                abort_child(&mut child);
                return Err(ProcessError::Wait { program, source });
            }
        };
        if timed_out {
            warn!(program = %program, timeout = ?self.timeout, "process timed out and was killed");
        }

        let (stdout, stdout_complete) = collect(&program, "stdout", stdout, timed_out)?;
        let (stderr, stderr_complete) = collect(&program, "stderr", stderr, timed_out)?;

        let result = ProcessResult {
            exit_code: status.and_then(|s| s.code()),
            stdout,
            stderr,
            timed_out,
            truncated: !(stdout_complete && stderr_complete),
            duration: start.elapsed(),
        };
        debug!(
            program = %program,
            exit_code = ?result.exit_code,
            elapsed = ?result.duration,
            "process finished"
        );
        Ok(result)
    }

    /// Like [`run`](Self::run), but a non-zero exit is an error.
    pub fn run_checked(self) -> Result<ProcessResult, ProcessError> {
        let program = self.program_name();
        let result = self.run()?;
        if !result.success() {
            return Err(ProcessError::Failed {
                program,
                result: result.describe(),
            });
        }
        Ok(result)
    }

    /// Queue one drain per piped stream. Both are queued in one step so
    /// they sit next to each other in the pool's queue.
    fn start_drains(
        &self,
        child: &mut Child,
    ) -> Result<(Option<Capture>, Option<Capture>), PoolError> {
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_buf = Arc::new(Mutex::new(Vec::new()));
        let err_buf = Arc::new(Mutex::new(Vec::new()));
        let out_sink = out_buf.clone();
        let err_sink = err_buf.clone();

        let (out_task, err_task) = match (stdout, stderr) {
            (Some(out), Some(err)) => {
                let (o, e) = self.pool.submit_pair(
                    move || read_into(out, out_sink),
                    move || read_into(err, err_sink),
                )?;
                (Some(o), Some(e))
            }
            (Some(out), None) => (Some(self.pool.submit(move || read_into(out, out_sink))?), None),
            (None, Some(err)) => (None, Some(self.pool.submit(move || read_into(err, err_sink))?)),
            (None, None) => (None, None),
        };

        let stdout = out_task.map(|task| Capture { buf: out_buf, task });
        let stderr = err_task.map(|task| Capture { buf: err_buf, task });
        Ok((stdout, stderr))
    }
}

/// A stream being drained into a shared buffer, readable even if the
/// drain never finishes.
struct Capture {
    buf: Arc<Mutex<Vec<u8>>>,
    task: DrainTask<std::io::Result<()>>,
}

fn read_into<R: Read>(mut reader: R, buf: Arc<Mutex<Vec<u8>>>) -> std::io::Result<()> {
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) => return Ok(()),
            Ok(n) => buf.lock().extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Kill and reap a child whose run is being abandoned, so its pipes close
/// and the drains holding pool workers can finish.
fn abort_child(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Wait for exit, killing the child once `timeout` elapses.
/// Returns the status (None if it could not be collected) and whether it timed out.
fn wait_child(
    child: &mut Child,
    timeout: Option<Duration>,
) -> std::io::Result<(Option<ExitStatus>, bool)> {
    let Some(timeout) = timeout else {
        return child.wait().map(|s| (Some(s), false));
    };
    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok((Some(status), false));
        }
        if start.elapsed() >= timeout {
            let _ = child.kill();
            return Ok((child.wait().ok(), true));
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Collect a stream's output. After a kill the wait is bounded by
/// [`KILLED_DRAIN_WAIT`]; whatever was read by then is returned and the
/// second value is false.
fn collect(
    program: &str,
    stream: &'static str,
    capture: Option<Capture>,
    killed: bool,
) -> Result<(String, bool), ProcessError> {
    let Some(Capture { buf, task }) = capture else {
        return Ok((String::new(), true));
    };
    let joined = if killed {
        task.join_timeout(KILLED_DRAIN_WAIT)
    } else {
        task.join()
    };
    let complete = match joined {
        Ok(read) => {
            read.map_err(|source| ProcessError::Read {
                program: program.to_string(),
                stream,
                source,
            })?;
            true
        }
        Err(PoolError::Timeout) => {
            warn!(
                program = %program,
                stream,
                "stream still open after kill, keeping partial output"
            );
            false
        }
        Err(source) => {
            return Err(ProcessError::Drain {
                program: program.to_string(),
                source,
            })
        }
    };
    let bytes = buf.lock();
    Ok((String::from_utf8_lossy(&bytes).into_owned(), complete))
}
