/// Interface to the process-isolation primitive.
///
/// Namespace setup, clone/exec mechanics and seccomp program compilation
/// live behind this trait; the environment layer only assembles spawn
/// requests and consumes wait results.
use crate::rlimits::RlimitEntry;
use crate::types::{Result, RunStatus, WaitResult};
use std::os::fd::{OwnedFd, RawFd};
use std::sync::Arc;

/// Compiled seccomp BPF program, shared read-only between executions.
///
/// The bytes are opaque to this crate; the isolation primitive installs
/// them verbatim before exec.
#[derive(Clone)]
pub struct SeccompFilter(Arc<Vec<u8>>);

impl SeccompFilter {
    pub fn from_bytes(program: Vec<u8>) -> Self {
        Self(Arc::new(program))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Callback invoked with the child's pid after it is created but before it
/// executes the target program. Used to attach the pid to a cgroup when
/// fd-based attachment is unavailable.
pub type SyncFn = Box<dyn FnOnce(u32) -> std::io::Result<()> + Send>;

/// Caller-facing spawn parameters for one execution
#[derive(Clone, Debug, Default)]
pub struct SpawnParams {
    /// argv, argv[0] included
    pub args: Vec<String>,
    /// Environment variables as KEY=VALUE strings
    pub envs: Vec<String>,
    /// File descriptor table for the child (stdin, stdout, stderr, ...).
    /// The caller keeps these open until `execve` returns.
    pub fds: Vec<RawFd>,
    /// Whether fds\[0\] becomes the controlling TTY
    pub tty: bool,
    /// Replacement executable fd, overriding args\[0\] lookup
    pub exec_fd: Option<RawFd>,
}

/// Full spawn request handed to the isolation primitive.
///
/// Exactly one of `cgroup_fd` or a cgroup-attaching `sync_fn` is set when
/// resource control is active; `sync_after_exec` tells the primitive it may
/// defer the sync round-trip until after exec when the callback has no
/// pre-exec work to do.
pub struct ContainerSpawn {
    pub params: SpawnParams,
    pub rlimits: Vec<RlimitEntry>,
    pub seccomp: Option<SeccompFilter>,
    pub sync_fn: Option<SyncFn>,
    pub sync_after_exec: bool,
    pub cgroup_fd: Option<OwnedFd>,
}

/// One container-backed sandbox instance.
///
/// `execve` blocks until the spawned process exits and reports its exit
/// status and resource usage; the spawn/sync join in the environment layer
/// runs it on a dedicated thread.
pub trait Container: Send + Sync {
    fn execve(&self, spawn: ContainerSpawn) -> WaitResult;

    /// Clear the sandbox filesystem tree for reuse
    fn reset(&self) -> Result<()>;

    /// Release the container; must be called at most once
    fn destroy(&self) -> Result<()>;
}

/// No-isolation debug backend.
///
/// Spawns nothing: the sync callback is still honored (with pid 0) so the
/// spawn/sync join behaves as with a real container, and a callback failure
/// is reported the same way the primitive would report it. Useful for
/// exercising staging and setup logic without namespaces or privileges.
#[derive(Default)]
pub struct NopContainer;

impl Container for NopContainer {
    fn execve(&self, spawn: ContainerSpawn) -> WaitResult {
        if let Some(sync_fn) = spawn.sync_fn {
            if let Err(e) = sync_fn(0) {
                return WaitResult {
                    status: RunStatus::InternalError,
                    error: Some(e.to_string()),
                    ..WaitResult::default()
                };
            }
        }
        WaitResult::default()
    }

    fn reset(&self) -> Result<()> {
        Ok(())
    }

    fn destroy(&self) -> Result<()> {
        Ok(())
    }
}
