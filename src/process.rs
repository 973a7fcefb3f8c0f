/// Handle to a spawned sandboxed process.
use crate::cgroup::{Cgroup, CgroupPool};
use crate::types::{RunStatus, WaitResult};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

/// A running or completed execution.
///
/// The container call runs on a dedicated thread; when it returns, the
/// result is published, the bound cgroup handle goes back to its pool, and
/// the done channel disconnects. `wait` may be called from any number of
/// threads.
#[derive(Debug)]
pub struct Process {
    done: Receiver<()>,
    result: Arc<Mutex<Option<WaitResult>>>,
}

impl Process {
    /// Run `f` to completion on a runner thread, releasing `cg` to `pool`
    /// once it returns.
    pub(crate) fn spawn<F>(
        f: F,
        cg: Option<Arc<dyn Cgroup>>,
        pool: Option<Arc<CgroupPool>>,
    ) -> Process
    where
        F: FnOnce() -> WaitResult + Send + 'static,
    {
        let (done_tx, done) = bounded::<()>(0);
        let result = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&result);

        thread::spawn(move || {
            // Nothing is ever sent; dropping the sender disconnects the
            // channel and wakes every receiver.
            let _signal: Sender<()> = done_tx;
            let res = f();
            if let (Some(pool), Some(cg)) = (pool, cg) {
                pool.put(cg);
            }
            *slot.lock().unwrap() = Some(res);
        });

        Process { done, result }
    }

    /// Block until the process has finished and return its result
    pub fn wait(&self) -> WaitResult {
        let _ = self.done.recv();
        self.result.lock().unwrap().clone().unwrap_or_else(|| WaitResult {
            status: RunStatus::InternalError,
            error: Some("runner thread exited without a result".to_string()),
            ..WaitResult::default()
        })
    }

    /// Completion signal; disconnects when the runner thread finishes
    pub(crate) fn done_receiver(&self) -> &Receiver<()> {
        &self.done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::mock::MockBuilder;
    use std::time::Duration;

    #[test]
    fn test_wait_returns_runner_result() {
        let p = Process::spawn(
            || WaitResult {
                exit_code: 42,
                ..WaitResult::default()
            },
            None,
            None,
        );
        assert_eq!(p.wait().exit_code, 42);
    }

    #[test]
    fn test_wait_is_idempotent() {
        let p = Process::spawn(WaitResult::default, None, None);
        let _ = p.wait();
        assert_eq!(p.wait().status, RunStatus::Normal);
    }

    #[test]
    fn test_cgroup_released_on_completion() {
        let pool = Arc::new(CgroupPool::new(Box::new(MockBuilder::new())));
        let cg = pool.get().unwrap();
        let p = Process::spawn(
            || {
                std::thread::sleep(Duration::from_millis(10));
                WaitResult::default()
            },
            Some(cg),
            Some(Arc::clone(&pool)),
        );
        assert_eq!(pool.available(), 0);
        let _ = p.wait();
        assert_eq!(pool.available(), 1);
    }
}
