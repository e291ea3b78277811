//! Stream drain pool
//!
//! A fixed pool of two worker threads that read a child process's stdout
//! and stderr concurrently, so a full pipe buffer on one stream can never
//! stall the other or the parent waiting on the child.
//!
//! Tasks queue FIFO behind the two workers. Shutdown is two-phase: the
//! pool first stops accepting work and lets queued tasks run; if that does
//! not finish within half the grace period, queued tasks are discarded and
//! running ones get the other half before being abandoned.

use std::collections::VecDeque;
use std::io::Read;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::error::PoolError;

/// Number of drain workers: one per output stream.
pub const DRAIN_WORKERS: usize = 2;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    queue: VecDeque<Job>,
    shutdown: bool,
    /// Tasks currently running on a worker
    active: usize,
    /// Workers that have not exited yet
    live_workers: usize,
}

impl PoolState {
    fn terminated(&self) -> bool {
        self.shutdown && self.live_workers == 0
    }
}

struct Shared {
    state: Mutex<PoolState>,
    /// Signaled when work is queued or shutdown is requested
    work: Condvar,
    /// Signaled when a task finishes or a worker exits
    done: Condvar,
}

impl Shared {
    fn request_shutdown(&self) -> bool {
        let mut state = self.state.lock();
        let first = !state.shutdown;
        state.shutdown = true;
        drop(state);
        self.work.notify_all();
        first
    }
}

/// Owns the pool on behalf of all clones; the last clone dropped shuts it down.
struct PoolHandle {
    shared: Arc<Shared>,
}

impl Drop for PoolHandle {
    fn drop(&mut self) {
        if self.shared.request_shutdown() {
            debug!("drain pool dropped without shutdown, stopping workers");
        }
    }
}

/// Shared handle to the two-thread drain pool.
///
/// Cloning is cheap; all clones submit to the same workers.
#[derive(Clone)]
pub struct DrainPool {
    handle: Arc<PoolHandle>,
}

impl DrainPool {
    /// Start the pool. Both workers are spawned before this returns.
    pub fn new() -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                shutdown: false,
                active: 0,
                live_workers: 0,
            }),
            work: Condvar::new(),
            done: Condvar::new(),
        });
        // Built before spawning so a failed spawn still stops earlier workers.
        let pool = Self {
            handle: Arc::new(PoolHandle { shared: shared.clone() }),
        };

        for i in 0..DRAIN_WORKERS {
            let worker_shared = shared.clone();
            shared.state.lock().live_workers += 1;
            let spawned = thread::Builder::new()
                .name(format!("blackbox-drain-{}", i))
                .spawn(move || worker_loop(worker_shared));
            if let Err(e) = spawned {
                shared.state.lock().live_workers -= 1;
                return Err(e);
            }
        }

        debug!(workers = DRAIN_WORKERS, "drain pool started");
        Ok(pool)
    }

    fn shared(&self) -> &Shared {
        &self.handle.shared
    }

    /// Queue a task. Fails once shutdown has been requested.
    pub fn submit<F, T>(&self, f: F) -> Result<DrainTask<T>, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (job, task) = package(f);
        let mut state = self.shared().state.lock();
        if state.shutdown {
            return Err(PoolError::Shutdown);
        }
        state.queue.push_back(job);
        drop(state);
        self.shared().work.notify_one();
        Ok(task)
    }

    /// Queue two tasks back to back in one step, so no other submission
    /// can land between them.
    ///
    /// Used for a child's stdout and stderr drains: with the pair adjacent
    /// in the queue, a worker never sits on one stream of a process while
    /// the other stream's drain waits behind unrelated work.
    pub fn submit_pair<F1, T1, F2, T2>(
        &self,
        first: F1,
        second: F2,
    ) -> Result<(DrainTask<T1>, DrainTask<T2>), PoolError>
    where
        F1: FnOnce() -> T1 + Send + 'static,
        T1: Send + 'static,
        F2: FnOnce() -> T2 + Send + 'static,
        T2: Send + 'static,
    {
        let (first_job, first_task) = package(first);
        let (second_job, second_task) = package(second);
        let mut state = self.shared().state.lock();
        if state.shutdown {
            return Err(PoolError::Shutdown);
        }
        state.queue.push_back(first_job);
        state.queue.push_back(second_job);
        drop(state);
        self.shared().work.notify_all();
        Ok((first_task, second_task))
    }

    /// Queue a task that reads `reader` to EOF and returns every byte in
    /// the order it was read.
    pub fn drain<R>(&self, mut reader: R) -> Result<DrainTask<std::io::Result<Vec<u8>>>, PoolError>
    where
        R: Read + Send + 'static,
    {
        self.submit(move || {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf).map(|_| buf)
        })
    }

    /// Stop accepting new work. Queued and running tasks still complete.
    pub fn shutdown(&self) {
        if self.shared().request_shutdown() {
            debug!("drain pool shutdown requested");
        }
    }

    /// Shut down and block for at most `grace` waiting for work to finish.
    ///
    /// The first half of the grace period lets queued tasks run. If the
    /// pool is still busy, queued tasks are discarded (their `DrainTask`
    /// reports [`PoolError::Abandoned`]) and running tasks get the second
    /// half. Returns whether every worker exited.
    pub fn shutdown_and_await(&self, grace: Duration) -> bool {
        let start = Instant::now();
        let half = start + grace / 2;
        let deadline = start + grace;
        self.shutdown();

        let shared = self.shared();
        let mut state = shared.state.lock();
        if wait_terminated(shared, &mut state, half) {
            debug!(elapsed = ?start.elapsed(), "drain pool terminated");
            return true;
        }

        let discarded = state.queue.len();
        state.queue.clear();
        warn!(
            discarded,
            running = state.active,
            "drain pool still busy after half the grace period, discarding queued tasks"
        );

        let terminated = wait_terminated(shared, &mut state, deadline);
        if !terminated {
            warn!(
                running = state.active,
                grace = ?grace,
                "drain pool did not terminate within the grace period, abandoning running tasks"
            );
        }
        terminated
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared().state.lock().shutdown
    }

    /// True once shutdown was requested and both workers exited.
    pub fn is_terminated(&self) -> bool {
        self.shared().state.lock().terminated()
    }

    /// Tasks currently running.
    pub fn active_count(&self) -> usize {
        self.shared().state.lock().active
    }

    /// Tasks waiting for a free worker.
    pub fn queued_count(&self) -> usize {
        self.shared().state.lock().queue.len()
    }

    /// Whether two handles refer to the same pool.
    pub fn same_pool(&self, other: &DrainPool) -> bool {
        Arc::ptr_eq(&self.handle, &other.handle)
    }
}

impl std::fmt::Debug for DrainPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared().state.lock();
        f.debug_struct("DrainPool")
            .field("shutdown", &state.shutdown)
            .field("active", &state.active)
            .field("queued", &state.queue.len())
            .field("live_workers", &state.live_workers)
            .finish()
    }
}

/// Wrap `f` as a queue job whose result is delivered to the returned task.
fn package<F, T>(f: F) -> (Job, DrainTask<T>)
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    let job: Job = Box::new(move || {
        // The receiver may be gone if the caller stopped caring.
        let _ = tx.send(f());
    });
    (job, DrainTask { rx })
}

fn wait_terminated(shared: &Shared, state: &mut MutexGuard<'_, PoolState>, until: Instant) -> bool {
    while !state.terminated() {
        if shared.done.wait_until(state, until).timed_out() {
            return state.terminated();
        }
    }
    true
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if let Some(job) = state.queue.pop_front() {
                    state.active += 1;
                    break Some(job);
                }
                if state.shutdown {
                    break None;
                }
                shared.work.wait(&mut state);
            }
        };
        let Some(job) = job else { break };

        // A panicking task drops its sender, so its DrainTask sees Abandoned.
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            warn!("drain task panicked");
        }

        shared.state.lock().active -= 1;
        shared.done.notify_all();
    }

    shared.state.lock().live_workers -= 1;
    shared.done.notify_all();
}

/// Pending result of a task submitted to a [`DrainPool`].
#[derive(Debug)]
pub struct DrainTask<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> DrainTask<T> {
    /// Block until the task finishes.
    pub fn join(self) -> Result<T, PoolError> {
        self.rx.recv().map_err(|_| PoolError::Abandoned)
    }

    /// Block for at most `timeout`.
    pub fn join_timeout(self, timeout: Duration) -> Result<T, PoolError> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            mpsc::RecvTimeoutError::Timeout => PoolError::Timeout,
            mpsc::RecvTimeoutError::Disconnected => PoolError::Abandoned,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    #[test]
    fn test_submit_returns_result() {
        let pool = DrainPool::new().unwrap();
        let task = pool.submit(|| 21 * 2).unwrap();
        assert_eq!(task.join().unwrap(), 42);
        assert!(pool.shutdown_and_await(Duration::from_secs(1)));
    }

    #[test]
    fn test_drain_reads_everything() {
        let pool = DrainPool::new().unwrap();
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let task = pool.drain(std::io::Cursor::new(data.clone())).unwrap();
        assert_eq!(task.join().unwrap().unwrap(), data);
    }

    #[test]
    fn test_two_workers_run_concurrently() {
        let pool = DrainPool::new().unwrap();
        // Both tasks must be running at once for the barrier to release.
        let barrier = Arc::new(Barrier::new(2));
        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let b = barrier.clone();
                pool.submit(move || {
                    b.wait();
                })
                .unwrap()
            })
            .collect();
        for t in tasks {
            t.join_timeout(Duration::from_secs(5)).unwrap();
        }
    }

    #[test]
    fn test_excess_tasks_queue_fifo() {
        let pool = DrainPool::new().unwrap();
        // Each blocker holds one worker until its own gate opens.
        let gates: Vec<_> = (0..2).map(|_| Arc::new(Barrier::new(2))).collect();
        let blockers: Vec<_> = gates
            .iter()
            .map(|gate| {
                let g = gate.clone();
                pool.submit(move || {
                    g.wait();
                })
                .unwrap()
            })
            .collect();
        while pool.active_count() < 2 {
            thread::yield_now();
        }

        let order = Arc::new(Mutex::new(Vec::new()));
        let queued: Vec<_> = (0..4)
            .map(|i| {
                let o = order.clone();
                pool.submit(move || o.lock().push(i)).unwrap()
            })
            .collect();
        assert_eq!(pool.queued_count(), 4);

        // Free a single worker: it alone runs the queue, one task at a time.
        gates[0].wait();
        for t in queued {
            t.join_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);

        gates[1].wait();
        for t in blockers {
            t.join().unwrap();
        }
    }

    #[test]
    fn test_submit_pair_stays_adjacent() {
        let pool = DrainPool::new().unwrap();
        let gates: Vec<_> = (0..2).map(|_| Arc::new(Barrier::new(2))).collect();
        let blockers: Vec<_> = gates
            .iter()
            .map(|gate| {
                let g = gate.clone();
                pool.submit(move || {
                    g.wait();
                })
                .unwrap()
            })
            .collect();
        while pool.active_count() < 2 {
            thread::yield_now();
        }

        let order = Arc::new(Mutex::new(Vec::new()));
        let record = |label: &'static str| {
            let o = order.clone();
            move || o.lock().push(label)
        };
        let (a_out, a_err) = pool.submit_pair(record("a-out"), record("a-err")).unwrap();
        let b_single = pool.submit(record("b")).unwrap();
        let (c_out, c_err) = pool.submit_pair(record("c-out"), record("c-err")).unwrap();
        assert_eq!(pool.queued_count(), 5);

        gates[0].wait();
        for t in [a_out, a_err, b_single, c_out, c_err] {
            t.join_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(*order.lock(), vec!["a-out", "a-err", "b", "c-out", "c-err"]);

        gates[1].wait();
        for t in blockers {
            t.join().unwrap();
        }
    }

    #[test]
    fn test_submit_pair_after_shutdown_fails() {
        let pool = DrainPool::new().unwrap();
        pool.shutdown();
        assert_eq!(pool.submit_pair(|| 1, || 2).unwrap_err(), PoolError::Shutdown);
        assert_eq!(pool.queued_count(), 0);
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let pool = DrainPool::new().unwrap();
        pool.shutdown();
        assert!(pool.is_shutdown());
        assert_eq!(pool.submit(|| ()).unwrap_err(), PoolError::Shutdown);
    }

    #[test]
    fn test_graceful_shutdown_runs_queued_tasks() {
        let pool = DrainPool::new().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<_> = (0..6)
            .map(|_| {
                let c = count.clone();
                pool.submit(move || {
                    thread::sleep(Duration::from_millis(10));
                    c.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap()
            })
            .collect();
        assert!(pool.shutdown_and_await(Duration::from_secs(2)));
        assert!(pool.is_terminated());
        assert_eq!(count.load(Ordering::SeqCst), 6);
        for t in tasks {
            t.join().unwrap();
        }
    }

    #[test]
    fn test_shutdown_abandons_slow_tasks() {
        let pool = DrainPool::new().unwrap();
        let grace = Duration::from_millis(200);
        let slow: Vec<_> = (0..2)
            .map(|_| pool.submit(move || thread::sleep(grace * 10)).unwrap())
            .collect();
        let queued = pool.submit(|| ()).unwrap();

        let start = Instant::now();
        assert!(!pool.shutdown_and_await(grace));
        assert!(start.elapsed() < grace * 3);

        assert_eq!(queued.join().unwrap_err(), PoolError::Abandoned);
        drop(slow);
    }

    #[test]
    fn test_panicking_task_is_abandoned_and_worker_survives() {
        let pool = DrainPool::new().unwrap();
        let bad = pool.submit(|| -> u32 { panic!("boom") }).unwrap();
        assert_eq!(bad.join().unwrap_err(), PoolError::Abandoned);
        for i in 0..4 {
            assert_eq!(pool.submit(move || i).unwrap().join().unwrap(), i);
        }
    }

    #[test]
    fn test_join_timeout_expires() {
        let pool = DrainPool::new().unwrap();
        let task = pool.submit(|| thread::sleep(Duration::from_millis(300))).unwrap();
        assert_eq!(
            task.join_timeout(Duration::from_millis(10)).unwrap_err(),
            PoolError::Timeout,
        );
    }

    #[test]
    fn test_clones_share_pool_and_last_drop_shuts_down() {
        let pool = DrainPool::new().unwrap();
        let clone = pool.clone();
        assert!(pool.same_pool(&clone));
        assert!(!pool.same_pool(&DrainPool::new().unwrap()));

        let shared = pool.handle.shared.clone();
        drop(pool);
        assert!(!shared.state.lock().shutdown);
        drop(clone);
        assert!(shared.state.lock().shutdown);
    }
}
