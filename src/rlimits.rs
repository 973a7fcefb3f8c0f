/// Translation of abstract execution limits into kernel rlimit values.
///
/// This is the sandbox's kernel-level backstop: even if cgroup controllers
/// are missing or misconfigured, the rlimits derived here still bound the
/// process. The translation is pure and exhaustively unit tested.
use crate::types::ExecutionLimit;
use nix::sys::resource::Resource;
use serde::{Deserialize, Serialize};

/// Concrete per-process resource limits derived from an [`ExecutionLimit`].
///
/// Derived once per execution; never mutated afterwards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RLimits {
    /// CPU time limit in whole seconds
    pub cpu: u64,
    /// Maximum file size in bytes
    pub file_size: u64,
    /// Stack size in bytes
    pub stack: u64,
    /// Maximum number of open files
    pub open_file: u64,
    /// Data segment cap in bytes, if requested or required
    pub data: Option<u64>,
    /// Address space cap in bytes, if requested
    pub address_space: Option<u64>,
    /// Core dumps are always disabled for sandboxed processes
    pub disable_core: bool,
}

/// One prepared `setrlimit` call for the isolation primitive to apply
/// between fork and exec.
#[derive(Clone, Copy, Debug)]
pub struct RlimitEntry {
    pub resource: Resource,
    pub cur: u64,
    pub max: u64,
}

impl RLimits {
    /// Translate an [`ExecutionLimit`] into concrete rlimit values.
    ///
    /// The CPU rlimit only has one-second granularity, so it is set to the
    /// wall budget truncated to whole seconds plus one; the kernel can then
    /// never fire a fraction of a second before the configured budget. A
    /// zero budget maps to one second.
    ///
    /// `has_cgroup` states whether a cgroup memory controller backs this
    /// execution. Without one, the data segment is capped unconditionally so
    /// that a kernel-level memory bound always exists.
    pub fn from_limit(limit: &ExecutionLimit, has_cgroup: bool) -> Self {
        Self {
            cpu: limit.time.as_secs() + 1,
            file_size: limit.output,
            stack: limit.stack,
            open_file: limit.open_file,
            data: (limit.data_segment || !has_cgroup).then_some(limit.memory),
            address_space: limit.address_space.then_some(limit.memory),
            disable_core: true,
        }
    }

    /// Expand into the `setrlimit` calls the isolation primitive applies to
    /// the child, soft and hard limits both set to the derived value.
    pub fn entries(&self) -> Vec<RlimitEntry> {
        let mut out = vec![
            entry(Resource::RLIMIT_CPU, self.cpu),
            entry(Resource::RLIMIT_FSIZE, self.file_size),
            entry(Resource::RLIMIT_STACK, self.stack),
            entry(Resource::RLIMIT_NOFILE, self.open_file),
        ];
        if let Some(data) = self.data {
            out.push(entry(Resource::RLIMIT_DATA, data));
        }
        if let Some(address_space) = self.address_space {
            out.push(entry(Resource::RLIMIT_AS, address_space));
        }
        if self.disable_core {
            out.push(entry(Resource::RLIMIT_CORE, 0));
        }
        out
    }
}

fn entry(resource: Resource, value: u64) -> RlimitEntry {
    RlimitEntry {
        resource,
        cur: value,
        max: value,
    }
}
