//! Filesystem and syscall facade for Joblet.
//!
//! Every other crate performs kernel interaction through the [`Platform`]
//! trait. [`LinuxPlatform`] is the production implementation; a filesystem
//! backed test double lives in [`testing`].
//!
//! Failures carry the operation name and the kernel errno so callers can
//! branch on `EBUSY`, `ENOENT`, and friends without knowing which syscall
//! produced them.

pub mod linux;
pub mod spawn;
pub mod testing;

use std::path::{Path, PathBuf};
use std::process::Output;

use joblet_core::Result;

pub use linux::LinuxPlatform;
pub use spawn::{ChildExit, NamespaceSet, SpawnRequest, SpawnedChild, decode_exec_result};

/// Kind of device node to create with mknod.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Char,
    Block,
}

/// A signal the supervisor delivers to a job's init process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

impl Signal {
    pub fn number(&self) -> i32 {
        match self {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

/// Narrow capability set over the kernel. Only implementations of this trait
/// may invoke syscalls.
pub trait Platform: Send + Sync {
    // Filesystem.
    fn read_to_string(&self, path: &Path) -> Result<String>;
    fn read(&self, path: &Path) -> Result<Vec<u8>>;
    fn write(&self, path: &Path, contents: &[u8]) -> Result<()>;
    fn append(&self, path: &Path, contents: &[u8]) -> Result<()>;
    fn create_dir_all(&self, path: &Path) -> Result<()>;
    /// Remove a single, empty directory.
    fn remove_dir(&self, path: &Path) -> Result<()>;
    fn remove_dir_all(&self, path: &Path) -> Result<()>;
    fn remove_file(&self, path: &Path) -> Result<()>;
    fn exists(&self, path: &Path) -> bool;
    fn is_dir(&self, path: &Path) -> bool;
    fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>>;
    /// Force a file's data to stable storage.
    fn sync_file(&self, path: &Path) -> Result<()>;

    // Mount plumbing, used by the isolated-init process.
    fn bind_mount(&self, source: &Path, target: &Path, readonly: bool) -> Result<()>;
    /// Mount a kernel filesystem such as proc, sysfs, or tmpfs.
    fn mount_special(&self, fstype: &str, target: &Path, data: Option<&str>) -> Result<()>;
    fn unmount(&self, target: &Path, lazy: bool) -> Result<()>;
    fn pivot_root(&self, new_root: &Path, put_old: &Path) -> Result<()>;
    fn mknod(&self, path: &Path, kind: DeviceKind, major: u64, minor: u64, mode: u32)
    -> Result<()>;
    fn set_hostname(&self, name: &str) -> Result<()>;
    fn chdir(&self, path: &Path) -> Result<()>;

    // Processes.
    fn signal(&self, pid: i32, signal: Signal) -> Result<()>;
    fn process_exists(&self, pid: i32) -> bool;
    /// Run a host utility to completion and capture its output. Used for the
    /// iproute2 veth join and GPU queries; never for job commands.
    fn run_command(&self, program: &str, args: &[&str]) -> Result<Output>;
    /// Re-exec this binary inside the requested namespaces. See [`spawn`].
    fn spawn_isolated(&self, request: &SpawnRequest) -> Result<SpawnedChild>;
    /// Block until the child exits. Callers run this on a blocking thread.
    fn wait_child(&self, pid: i32) -> Result<ChildExit>;
    /// Replace the current process image. On success this never returns; the
    /// `Ok` arm exists only for test doubles.
    fn exec(&self, program: &str, args: &[String], env: &[(String, String)]) -> Result<()>;
}
