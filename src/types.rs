/// Core value types shared across the environment layer
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Abstract resource limits for one execution request.
///
/// Immutable once built; translated into kernel rlimits by
/// [`crate::rlimits::RLimits::from_limit`] and into cgroup limits by the
/// environment during `execve`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionLimit {
    /// Wall-clock time budget
    pub time: Duration,
    /// Memory budget in bytes
    pub memory: u64,
    /// Stack size budget in bytes
    pub stack: u64,
    /// Output (file size) budget in bytes
    pub output: u64,
    /// Maximum number of open file descriptors
    pub open_file: u64,
    /// Maximum number of processes/threads
    pub proc: u64,
    /// CPU rate as a fraction of one core (0 disables rate limiting)
    pub rate: f64,
    /// CPU set string, e.g. "0-3" (empty uses the environment default)
    pub cpuset: String,
    /// Cap the data segment in addition to the cgroup memory controller
    pub data_segment: bool,
    /// Cap the whole address space
    pub address_space: bool,
}

impl Default for ExecutionLimit {
    fn default() -> Self {
        Self {
            time: Duration::from_secs(10),
            memory: 256 * 1024 * 1024,
            stack: 8 * 1024 * 1024,
            output: 64 * 1024 * 1024,
            open_file: 256,
            proc: 1,
            rate: 0.0,
            cpuset: String::new(),
            data_segment: false,
            address_space: false,
        }
    }
}

/// Content source for one copy-in entry.
///
/// Dispatch is explicit over the three variants; a host path is never
/// re-inspected to guess whether it is a file or a directory.
#[derive(Clone, Debug)]
pub enum FileSource {
    /// Inline bytes written verbatim to the destination
    Memory(Vec<u8>),
    /// Regular file on the host filesystem
    HostFile(PathBuf),
    /// Directory tree on the host filesystem, cloned recursively
    HostDir(PathBuf),
}

/// Phase tag for a per-file staging failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileErrorKind {
    /// Failed to open the host-side source
    OpenFile,
    /// Failed to create a destination parent directory
    CreateDir,
    /// Failed to create the destination file
    CreateFile,
    /// Failed while streaming content into the destination
    CopyContent,
    /// Source could not be identified (stat failure or wrong type)
    UnknownFile,
    /// Symlink creation failed
    Symlink,
}

/// One partial failure from a batch staging operation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileError {
    /// Sandbox-relative destination name
    pub name: String,
    /// Phase that failed
    pub kind: FileErrorKind,
    /// Human-readable cause
    pub message: String,
}

/// Coarse classification of how a sandboxed process ended
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// Process exited on its own
    #[default]
    Normal,
    /// Process was terminated by a signal
    Signaled,
    /// The environment failed before or during the run
    InternalError,
}

/// Exit status and resource usage reported by the isolation primitive
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct WaitResult {
    pub status: RunStatus,
    pub exit_code: i32,
    /// Terminating signal, if any
    pub signal: Option<i32>,
    /// CPU time consumed
    pub cpu_time: Duration,
    /// Wall-clock time elapsed
    pub wall_time: Duration,
    /// Peak memory usage in bytes
    pub memory: u64,
    /// Internal error message when `status` is `InternalError`
    pub error: Option<String>,
}

/// Custom error types for the environment layer
#[derive(Error, Debug)]
pub enum EnvError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cgroup error: {0}")]
    Cgroup(String),

    #[error("spawn error: {0}")]
    Spawn(String),

    /// An absolute path did not resolve to a descendant of the work
    /// directory. Reported distinctly from IO errors so callers can tell
    /// misuse from environmental failure.
    #[error("path escapes work directory: {0}")]
    InvalidPath(String),

    #[error("staging failed for {} file(s)", .0.len())]
    Staging(Vec<FileError>),

    #[error("symlink {}: {}", .0.name, .0.message)]
    SymlinkBatch(FileError),
}

impl From<nix::errno::Errno> for EnvError {
    fn from(err: nix::errno::Errno) -> Self {
        EnvError::Io(std::io::Error::from_raw_os_error(err as i32))
    }
}

/// Result type alias for environment operations
pub type Result<T> = std::result::Result<T, EnvError>;
