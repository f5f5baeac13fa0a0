//! Production platform implementation over nix and std.

use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sys::signal::{Signal as NixSignal, kill};
use nix::sys::stat::{Mode, SFlag, makedev, mknod};
use nix::unistd::{Pid, chdir, pivot_root, sethostname};

use joblet_core::{Error, Result};

use crate::spawn::{self, ChildExit, SpawnRequest, SpawnedChild};
use crate::{DeviceKind, Platform, Signal};

/// The real thing. Stateless; cheap to clone behind an `Arc`.
#[derive(Debug, Default, Clone)]
pub struct LinuxPlatform;

impl LinuxPlatform {
    pub fn new() -> Self {
        Self
    }
}

fn sys_err(op: String, errno: nix::Error) -> Error {
    Error::syscall(op, std::io::Error::from_raw_os_error(errno as i32))
}

fn io_err(op: &str, path: &Path, source: std::io::Error) -> Error {
    Error::syscall(format!("{op} {}", path.display()), source)
}

impl Platform for LinuxPlatform {
    fn read_to_string(&self, path: &Path) -> Result<String> {
        fs::read_to_string(path).map_err(|e| io_err("read", path, e))
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path).map_err(|e| io_err("read", path, e))
    }

    fn write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        fs::write(path, contents).map_err(|e| io_err("write", path, e))
    }

    fn append(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| io_err("open", path, e))?;
        file.write_all(contents)
            .map_err(|e| io_err("append", path, e))
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).map_err(|e| io_err("mkdir", path, e))
    }

    fn remove_dir(&self, path: &Path) -> Result<()> {
        fs::remove_dir(path).map_err(|e| io_err("rmdir", path, e))
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        fs::remove_dir_all(path).map_err(|e| io_err("rm -r", path, e))
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).map_err(|e| io_err("unlink", path, e))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let entries = fs::read_dir(path).map_err(|e| io_err("readdir", path, e))?;
        let mut paths = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_err("readdir", path, e))?;
            paths.push(entry.path());
        }
        paths.sort();
        Ok(paths)
    }

    fn sync_file(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::open(path).map_err(|e| io_err("open", path, e))?;
        file.sync_all().map_err(|e| io_err("fsync", path, e))
    }

    fn bind_mount(&self, source: &Path, target: &Path, readonly: bool) -> Result<()> {
        mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )
        .map_err(|e| {
            sys_err(
                format!("bind {} -> {}", source.display(), target.display()),
                e,
            )
        })?;
        if readonly {
            // Read-only bind mounts need a remount pass.
            mount(
                None::<&str>,
                target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            )
            .map_err(|e| sys_err(format!("remount ro {}", target.display()), e))?;
        }
        Ok(())
    }

    fn mount_special(&self, fstype: &str, target: &Path, data: Option<&str>) -> Result<()> {
        mount(
            Some(fstype),
            target,
            Some(fstype),
            MsFlags::empty(),
            data,
        )
        .map_err(|e| sys_err(format!("mount {fstype} on {}", target.display()), e))
    }

    fn unmount(&self, target: &Path, lazy: bool) -> Result<()> {
        let flags = if lazy {
            MntFlags::MNT_DETACH
        } else {
            MntFlags::empty()
        };
        umount2(target, flags).map_err(|e| sys_err(format!("umount {}", target.display()), e))
    }

    fn pivot_root(&self, new_root: &Path, put_old: &Path) -> Result<()> {
        pivot_root(new_root, put_old).map_err(|e| {
            sys_err(
                format!(
                    "pivot_root {} {}",
                    new_root.display(),
                    put_old.display()
                ),
                e,
            )
        })
    }

    fn mknod(
        &self,
        path: &Path,
        kind: DeviceKind,
        major: u64,
        minor: u64,
        mode: u32,
    ) -> Result<()> {
        let sflag = match kind {
            DeviceKind::Char => SFlag::S_IFCHR,
            DeviceKind::Block => SFlag::S_IFBLK,
        };
        mknod(
            path,
            sflag,
            Mode::from_bits_truncate(mode),
            makedev(major, minor),
        )
        .map_err(|e| sys_err(format!("mknod {}", path.display()), e))
    }

    fn set_hostname(&self, name: &str) -> Result<()> {
        sethostname(name).map_err(|e| sys_err(format!("sethostname {name}"), e))
    }

    fn chdir(&self, path: &Path) -> Result<()> {
        chdir(path).map_err(|e| sys_err(format!("chdir {}", path.display()), e))
    }

    fn signal(&self, pid: i32, signal: Signal) -> Result<()> {
        let sig = match signal {
            Signal::Term => NixSignal::SIGTERM,
            Signal::Kill => NixSignal::SIGKILL,
        };
        kill(Pid::from_raw(pid), sig).map_err(|e| sys_err(format!("kill {pid}"), e))
    }

    fn process_exists(&self, pid: i32) -> bool {
        // Signal 0 probes liveness without delivering anything.
        kill(Pid::from_raw(pid), None::<NixSignal>).is_ok()
    }

    fn run_command(&self, program: &str, args: &[&str]) -> Result<Output> {
        Command::new(program)
            .args(args)
            .output()
            .map_err(|e| Error::syscall(format!("exec {program}"), e))
    }

    fn spawn_isolated(&self, request: &SpawnRequest) -> Result<SpawnedChild> {
        spawn::spawn_isolated(request)
    }

    fn wait_child(&self, pid: i32) -> Result<ChildExit> {
        spawn::wait_child(pid)
    }

    fn exec(&self, program: &str, args: &[String], env: &[(String, String)]) -> Result<()> {
        let program_c = std::ffi::CString::new(program)
            .map_err(|_| Error::InvalidArgument(format!("embedded NUL in {program:?}")))?;
        let argv: Vec<std::ffi::CString> = std::iter::once(program.to_string())
            .chain(args.iter().cloned())
            .map(|arg| {
                std::ffi::CString::new(arg.clone())
                    .map_err(|_| Error::InvalidArgument(format!("embedded NUL in {arg:?}")))
            })
            .collect::<Result<_>>()?;
        let envp: Vec<std::ffi::CString> = env
            .iter()
            .map(|(k, v)| {
                std::ffi::CString::new(format!("{k}={v}"))
                    .map_err(|_| Error::InvalidArgument(format!("embedded NUL in {k:?}")))
            })
            .collect::<Result<_>>()?;
        // PATH lookup uses the environment we are about to install.
        let err = nix::unistd::execvpe(&program_c, &argv, &envp).unwrap_err();
        Err(sys_err(format!("execvpe {program}"), err))
    }
}
