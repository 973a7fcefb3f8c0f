/// Execution environment capability interface and its cgroup-backed
/// implementation.
use crate::cgroup::{Cgroup, CgroupPool, CgroupResult};
use crate::container::{Container, ContainerSpawn, SeccompFilter, SpawnParams, SyncFn};
use crate::process::Process;
use crate::rlimits::RLimits;
use crate::types::{EnvError, ExecutionLimit, Result};
use crate::workdir;
use crossbeam_channel::{bounded, select};
use nix::fcntl::{openat, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::symlinkat;
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::os::fd::{AsRawFd, FromRawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Capability contract an execution engine uses to drive one sandbox.
///
/// All filesystem operations are relative to the environment's private work
/// directory; absolute paths are rebased under it and rejected when they
/// point elsewhere. The one concrete backend is [`SandboxEnviron`];
/// alternate backends (a no-isolation debug mode, for instance) can be
/// substituted behind this trait.
pub trait Environment: Send + Sync {
    /// Spawn a process inside the environment under `limit`
    fn execve(&self, limit: &ExecutionLimit, params: SpawnParams) -> Result<Process>;

    /// The open work directory handle. Callers must not close it; the
    /// handle is rewound before each handout.
    fn work_dir(&self) -> &File;

    /// Open a file relative to the work directory
    fn open_at(&self, path: &Path, flags: OFlag, mode: Mode) -> Result<File>;

    /// Ensure the work directory itself exists
    fn mk_work_dir(&self) -> Result<()>;

    /// Create a directory and all missing parents inside the sandbox
    fn mkdir_all(&self, path: &Path, mode: Mode) -> Result<()>;

    /// Create a symlink inside the sandbox
    fn symlink(&self, target: &Path, link: &Path) -> Result<()>;

    /// Recursively clone a host directory into the sandbox
    fn copy_dir(&self, src: &Path, dst: &Path) -> Result<()>;

    /// Clear the sandbox tree for reuse by a subsequent execution
    fn reset(&self) -> Result<()>;

    /// Release all owned resources; call at most once
    fn destroy(&self) -> Result<()>;
}

/// Static configuration for a [`SandboxEnviron`]
pub struct EnvironConfig {
    /// Host path of the sandbox work directory
    pub work_dir: PathBuf,
    /// Default CPU set applied when a request does not override it
    pub cpuset: String,
    /// Whether CPU-rate limiting is enabled globally
    pub cpu_rate: bool,
    /// Whether the isolation primitive supports cgroup-fd attachment at
    /// spawn time (preferred over the pid sync callback)
    pub cgroup_fd: bool,
    /// Compiled seccomp filter shared by all executions
    pub seccomp: Option<SeccompFilter>,
    /// Cgroup pool; without one, executions rely on rlimits alone
    pub pool: Option<Arc<CgroupPool>>,
}

impl EnvironConfig {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            cpuset: String::new(),
            cpu_rate: false,
            cgroup_fd: false,
            seccomp: None,
            pool: None,
        }
    }
}

/// Cgroup-backed Linux sandbox environment, one instance per execution
/// slot.
pub struct SandboxEnviron {
    container: Arc<dyn Container>,
    pool: Option<Arc<CgroupPool>>,
    work_dir: File,
    work_dir_path: PathBuf,
    cpuset: String,
    seccomp: Option<SeccompFilter>,
    cpu_rate: bool,
    cgroup_fd: bool,
}

impl SandboxEnviron {
    pub fn new(container: Arc<dyn Container>, config: EnvironConfig) -> Result<Self> {
        let work_dir_path = config.work_dir.canonicalize()?;
        let work_dir = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_DIRECTORY | libc::O_CLOEXEC)
            .open(&work_dir_path)?;
        Ok(Self {
            container,
            pool: config.pool,
            work_dir,
            work_dir_path,
            cpuset: config.cpuset,
            seccomp: config.seccomp,
            cpu_rate: config.cpu_rate,
            cgroup_fd: config.cgroup_fd,
        })
    }

    /// Rebase an absolute path under the work directory.
    ///
    /// Relative paths pass through untouched. Absolute paths are lexically
    /// normalized first, so `..` segments cannot fake a work-dir prefix;
    /// anything that does not resolve to a descendant of the work directory
    /// fails with [`EnvError::InvalidPath`] before any filesystem mutation.
    fn confine(&self, path: &Path) -> Result<PathBuf> {
        if !path.is_absolute() {
            return Ok(path.to_path_buf());
        }
        match normalize(path).strip_prefix(&self.work_dir_path) {
            Ok(rel) if rel.as_os_str().is_empty() => Ok(PathBuf::from(".")),
            Ok(rel) => Ok(rel.to_path_buf()),
            Err(_) => Err(EnvError::InvalidPath(path.display().to_string())),
        }
    }

    fn apply_cgroup_limits(&self, cg: &Arc<dyn Cgroup>, limit: &ExecutionLimit) -> Result<()> {
        let cpuset = if limit.cpuset.is_empty() {
            self.cpuset.as_str()
        } else {
            limit.cpuset.as_str()
        };
        if !cpuset.is_empty() {
            check_limit(cg.set_cpuset(cpuset), "cpuset")?;
        }
        if self.cpu_rate && limit.rate > 0.0 {
            check_limit(cg.set_cpu_rate(limit.rate), "cpu rate")?;
        }
        check_limit(cg.set_memory_limit(limit.memory), "memory")?;
        check_limit(cg.set_proc_limit(limit.proc), "process")?;
        Ok(())
    }
}

/// Resolve `.` and `..` components of an absolute path without touching
/// the filesystem. `..` at the root stays at the root, as the kernel would
/// resolve it.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            c => out.push(c),
        }
    }
    out
}

/// Benign conditions (controller absent on this kernel) are swallowed;
/// anything else aborts the execution setup.
fn check_limit(res: CgroupResult<()>, what: &str) -> Result<()> {
    match res {
        Ok(()) => Ok(()),
        Err(e) if e.is_benign() => {
            log::debug!("cgroup {what} limit unsupported: {e}");
            Ok(())
        }
        Err(e) => Err(EnvError::Cgroup(format!(
            "execve: cgroup: failed to set {what} limit: {e}"
        ))),
    }
}

impl Environment for SandboxEnviron {
    fn execve(&self, limit: &ExecutionLimit, params: SpawnParams) -> Result<Process> {
        let mut cg: Option<Arc<dyn Cgroup>> = None;
        let mut cgroup_fd = None;
        let mut attach_via_sync = false;

        if let Some(pool) = &self.pool {
            let handle = pool
                .get()
                .map_err(|e| EnvError::Cgroup(format!("execve: failed to get cgroup: {e}")))?;
            if let Err(e) = self.apply_cgroup_limits(&handle, limit) {
                pool.put(handle);
                return Err(e);
            }
            if self.cgroup_fd {
                match handle.open() {
                    Ok(fd) => cgroup_fd = Some(fd),
                    Err(e) => {
                        pool.put(handle);
                        return Err(EnvError::Cgroup(format!(
                            "execve: failed to get cgroup fd: {e}"
                        )));
                    }
                }
            } else {
                attach_via_sync = true;
            }
            cg = Some(handle);
        }

        let rlimits = RLimits::from_limit(limit, self.pool.is_some());

        let (sync_tx, sync_done) = bounded::<()>(0);
        let attach_cg = cg.clone().filter(|_| attach_via_sync);
        let sync_fn: SyncFn = Box::new(move |pid| {
            // Dropping the sender disconnects sync_done when the callback
            // finishes, success or failure.
            let _signal = sync_tx;
            if let Some(cg) = attach_cg {
                cg.add_proc(pid).map_err(|e| {
                    io::Error::new(
                        io::ErrorKind::Other,
                        format!("execve: cgroup: failed to add process {pid}: {e}"),
                    )
                })?;
            }
            Ok(())
        });

        let spawn = ContainerSpawn {
            params,
            rlimits: rlimits.entries(),
            seccomp: self.seccomp.clone(),
            sync_fn: Some(sync_fn),
            sync_after_exec: !attach_via_sync,
            cgroup_fd,
        };

        let container = Arc::clone(&self.container);
        let proc = Process::spawn(move || container.execve(spawn), cg, self.pool.clone());

        // Block until either the whole spawn attempt or the sync callback
        // has completed, whichever happens first. Descriptors referenced by
        // the spawn request must stay open while the child is still
        // mid-creation; both signals are allowed to finish their own
        // cleanup independently.
        select! {
            recv(proc.done_receiver()) -> _ => {}
            recv(sync_done) -> _ => {}
        }

        Ok(proc)
    }

    fn work_dir(&self) -> &File {
        let _ = (&self.work_dir).seek(SeekFrom::Start(0));
        &self.work_dir
    }

    fn open_at(&self, path: &Path, flags: OFlag, mode: Mode) -> Result<File> {
        let rel = self.confine(path)?;
        let fd = openat(
            self.work_dir.as_raw_fd(),
            rel.as_path(),
            flags | OFlag::O_CLOEXEC,
            mode,
        )?;
        Ok(unsafe { File::from_raw_fd(fd) })
    }

    fn mk_work_dir(&self) -> Result<()> {
        workdir::ensure_work_dir(self.work_dir.as_raw_fd()).map_err(EnvError::Io)
    }

    fn mkdir_all(&self, path: &Path, mode: Mode) -> Result<()> {
        let rel = self.confine(path)?;
        workdir::mkdir_all_at(self.work_dir.as_raw_fd(), &rel, mode).map_err(EnvError::Io)
    }

    fn symlink(&self, target: &Path, link: &Path) -> Result<()> {
        let target = self.confine(target)?;
        let link = self.confine(link)?;
        symlinkat(
            target.as_path(),
            Some(self.work_dir.as_raw_fd()),
            link.as_path(),
        )?;
        Ok(())
    }

    fn copy_dir(&self, src: &Path, dst: &Path) -> Result<()> {
        let rel = self.confine(dst)?;
        workdir::copy_dir_into(&self.work_dir, src, &rel).map_err(EnvError::Io)
    }

    fn reset(&self) -> Result<()> {
        self.container.reset()
    }

    fn destroy(&self) -> Result<()> {
        self.container.destroy()
    }
}
