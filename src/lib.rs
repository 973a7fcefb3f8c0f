//! envbox: the execution-environment layer of a sandboxed code judge
//!
//! # Architecture
//!
//! This crate sits between an execution engine and a Linux isolation
//! primitive, organized by concern:
//!
//! ## Environment ([`environ`])
//! - [`Environment`]: capability trait the engine drives one sandbox through
//! - [`SandboxEnviron`]: cgroup-backed implementation with descriptor-confined
//!   filesystem access and a race-free spawn/sync join
//!
//! ## Resource Control ([`cgroup`], [`rlimits`])
//! - [`CgroupPool`]: reusable cgroup handles, reset between executions
//! - [`RLimits`]: translation of abstract limits into kernel rlimit entries
//!
//! ## Process Lifecycle ([`container`], [`process`])
//! - [`Container`]: interface to the namespace/exec primitive
//! - [`Process`]: completion handle that releases its cgroup to the pool
//!
//! ## File Staging ([`staging`])
//! - [`copy_in`]: concurrent, failure-collecting input staging
//! - [`stage_symlinks`]: ordered symlink creation, first failure stops
//!
//! # Design Principles
//!
//! 1. **Descriptor confinement** - sandbox writes resolve relative to an
//!    open work-directory descriptor, never through absolute host paths
//! 2. **Exclusive cgroup ownership** - one execution per handle between
//!    pool get and put, with a mandatory reset in between
//! 3. **Partial failure is data** - batch staging reports every failed
//!    entry with the phase it failed in

pub mod cgroup;
pub mod container;
pub mod environ;
pub mod process;
pub mod rlimits;
pub mod staging;
pub mod types;

mod workdir;

pub use cgroup::{Cgroup, CgroupBuilder, CgroupError, CgroupPool, CgroupResult};
pub use container::{Container, ContainerSpawn, NopContainer, SeccompFilter, SpawnParams, SyncFn};
pub use environ::{EnvironConfig, Environment, SandboxEnviron};
pub use process::Process;
pub use rlimits::{RLimits, RlimitEntry};
pub use staging::{copy_in, stage_symlinks};
pub use types::{
    EnvError, ExecutionLimit, FileError, FileErrorKind, FileSource, Result, RunStatus, WaitResult,
};
