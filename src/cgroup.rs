/// Cgroup capability interface and the reusable handle pool.
///
/// The cgroup filesystem driver itself lives outside this crate; executions
/// consume it through the [`Cgroup`] trait. The pool amortizes the cost of
/// creating kernel cgroup objects across executions.
use std::os::fd::OwnedFd;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Errors from the cgroup subsystem.
///
/// `NotInitialized` and `NotFound` mean the kernel does not expose the
/// requested controller; limit application treats those as benign and
/// continues, everything else aborts the execution setup.
#[derive(Error, Debug)]
pub enum CgroupError {
    #[error("cgroup controller not initialized")]
    NotInitialized,

    #[error("cgroup entry does not exist")]
    NotFound,

    #[error("cgroup IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cgroup error: {0}")]
    Other(String),
}

impl CgroupError {
    /// Whether this failure may be ignored during limit application
    pub fn is_benign(&self) -> bool {
        matches!(self, CgroupError::NotInitialized | CgroupError::NotFound)
    }
}

/// Result type alias for cgroup operations
pub type CgroupResult<T> = std::result::Result<T, CgroupError>;

/// One kernel cgroup, exclusively owned by a single execution between
/// [`CgroupPool::get`] and [`CgroupPool::put`].
pub trait Cgroup: Send + Sync {
    /// Identifier for logging
    fn name(&self) -> &str;

    fn set_cpuset(&self, cpuset: &str) -> CgroupResult<()>;

    /// Limit CPU usage to a fraction of one core
    fn set_cpu_rate(&self, rate: f64) -> CgroupResult<()>;

    fn set_memory_limit(&self, bytes: u64) -> CgroupResult<()>;

    fn set_proc_limit(&self, count: u64) -> CgroupResult<()>;

    /// Move a pid into this cgroup
    fn add_proc(&self, pid: u32) -> CgroupResult<()>;

    /// Open the cgroup directory for fd-based attachment at spawn time
    fn open(&self) -> CgroupResult<OwnedFd>;

    /// Clear all limits and empty the membership so the handle can be
    /// reused by an unrelated execution
    fn reset(&self) -> CgroupResult<()>;
}

/// Creates fresh cgroup handles for the pool when it runs dry
pub trait CgroupBuilder: Send + Sync {
    fn build(&self) -> CgroupResult<Arc<dyn Cgroup>>;
}

/// Bounded-bookkeeping pool of reusable cgroup handles.
///
/// `get` never blocks: when the free list is empty a new handle is built.
/// `put` resets the handle before making it available again, so a future
/// execution can never inherit stale limits; a handle whose reset fails is
/// discarded rather than recycled.
pub struct CgroupPool {
    builder: Box<dyn CgroupBuilder>,
    free: Mutex<Vec<Arc<dyn Cgroup>>>,
}

impl CgroupPool {
    pub fn new(builder: Box<dyn CgroupBuilder>) -> Self {
        Self {
            builder,
            free: Mutex::new(Vec::new()),
        }
    }

    /// Acquire a handle for exclusive use by one execution
    pub fn get(&self) -> CgroupResult<Arc<dyn Cgroup>> {
        if let Some(cg) = self.free.lock().unwrap().pop() {
            return Ok(cg);
        }
        self.builder.build()
    }

    /// Return a handle once its execution has completed
    pub fn put(&self, cg: Arc<dyn Cgroup>) {
        match cg.reset() {
            Ok(()) => self.free.lock().unwrap().push(cg),
            Err(e) => {
                log::warn!("discarding cgroup {} after failed reset: {}", cg.name(), e);
            }
        }
    }

    /// Number of handles currently available without building a new one
    pub fn available(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    /// Seed a handle without the reset round-trip
    #[cfg(test)]
    pub(crate) fn seed(&self, cg: Arc<dyn Cgroup>) {
        self.free.lock().unwrap().push(cg);
    }
}
