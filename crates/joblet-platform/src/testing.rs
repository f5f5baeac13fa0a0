//! Test double for the platform facade.
//!
//! Filesystem calls go straight to std against whatever directory the test
//! points at (typically a tempdir). Kernel-only operations (mounts, pivots,
//! device nodes, signals) are recorded instead of executed, so isolation
//! logic can be asserted without privileges.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Mutex;
use std::time::Duration;

use joblet_core::{Error, Result};

use crate::spawn::{ChildExit, SpawnRequest, SpawnedChild};
use crate::{DeviceKind, LinuxPlatform, Platform, Signal};

/// One recorded kernel interaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SysCall {
    BindMount {
        source: PathBuf,
        target: PathBuf,
        readonly: bool,
    },
    MountSpecial {
        fstype: String,
        target: PathBuf,
        data: Option<String>,
    },
    Unmount {
        target: PathBuf,
        lazy: bool,
    },
    PivotRoot {
        new_root: PathBuf,
        put_old: PathBuf,
    },
    Mknod {
        path: PathBuf,
        kind: DeviceKindTag,
        major: u64,
        minor: u64,
        mode: u32,
    },
    SetHostname(String),
    Chdir(PathBuf),
    Signal {
        pid: i32,
        signal: i32,
    },
    Command {
        program: String,
        args: Vec<String>,
    },
}

/// `DeviceKind` mirror that derives Eq for assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKindTag {
    Char,
    Block,
}

impl From<DeviceKind> for DeviceKindTag {
    fn from(kind: DeviceKind) -> Self {
        match kind {
            DeviceKind::Char => DeviceKindTag::Char,
            DeviceKind::Block => DeviceKindTag::Block,
        }
    }
}

/// Child-side pipe ends of a fake spawn, for tests to script job output.
#[derive(Debug)]
pub struct FakeChild {
    pub pid: i32,
    pub request: SpawnRequest,
    /// The child's stdin (the plan the supervisor wrote).
    pub plan: File,
    pub stdout: File,
    pub stderr: File,
    /// Dropping this unwritten signals a successful exec.
    pub exec_result: File,
}

#[derive(Debug, Default)]
pub struct RecordingPlatform {
    fs: LinuxPlatform,
    calls: Mutex<Vec<SysCall>>,
    /// PIDs `process_exists` should report as alive.
    pub live_pids: Mutex<Vec<i32>>,
    next_pid: Mutex<i32>,
    spawned: Mutex<Vec<FakeChild>>,
    exit_statuses: Mutex<HashMap<i32, ChildExit>>,
}

impl RecordingPlatform {
    pub fn new() -> Self {
        Self {
            next_pid: Mutex::new(10_000),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<SysCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Take the child-side handles of the most recent fake spawn.
    pub fn take_spawned(&self) -> Option<FakeChild> {
        self.spawned.lock().unwrap().pop()
    }

    /// Arrange for `wait_child(pid)` to return.
    pub fn set_exit(&self, pid: i32, exit_code: i32) {
        self.exit_statuses.lock().unwrap().insert(
            pid,
            ChildExit {
                exit_code,
                signaled: false,
            },
        );
    }

    fn record(&self, call: SysCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Platform for RecordingPlatform {
    fn read_to_string(&self, path: &Path) -> Result<String> {
        self.fs.read_to_string(path)
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        self.fs.read(path)
    }

    fn write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        self.fs.write(path, contents)
    }

    fn append(&self, path: &Path, contents: &[u8]) -> Result<()> {
        self.fs.append(path, contents)
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        self.fs.create_dir_all(path)
    }

    fn remove_dir(&self, path: &Path) -> Result<()> {
        self.fs.remove_dir(path)
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        self.fs.remove_dir_all(path)
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        self.fs.remove_file(path)
    }

    fn exists(&self, path: &Path) -> bool {
        self.fs.exists(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.fs.is_dir(path)
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        self.fs.list_dir(path)
    }

    fn sync_file(&self, path: &Path) -> Result<()> {
        self.fs.sync_file(path)
    }

    fn bind_mount(&self, source: &Path, target: &Path, readonly: bool) -> Result<()> {
        self.record(SysCall::BindMount {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            readonly,
        });
        Ok(())
    }

    fn mount_special(&self, fstype: &str, target: &Path, data: Option<&str>) -> Result<()> {
        self.record(SysCall::MountSpecial {
            fstype: fstype.to_string(),
            target: target.to_path_buf(),
            data: data.map(str::to_string),
        });
        Ok(())
    }

    fn unmount(&self, target: &Path, lazy: bool) -> Result<()> {
        self.record(SysCall::Unmount {
            target: target.to_path_buf(),
            lazy,
        });
        Ok(())
    }

    fn pivot_root(&self, new_root: &Path, put_old: &Path) -> Result<()> {
        self.record(SysCall::PivotRoot {
            new_root: new_root.to_path_buf(),
            put_old: put_old.to_path_buf(),
        });
        Ok(())
    }

    fn mknod(
        &self,
        path: &Path,
        kind: DeviceKind,
        major: u64,
        minor: u64,
        mode: u32,
    ) -> Result<()> {
        self.record(SysCall::Mknod {
            path: path.to_path_buf(),
            kind: kind.into(),
            major,
            minor,
            mode,
        });
        Ok(())
    }

    fn set_hostname(&self, name: &str) -> Result<()> {
        self.record(SysCall::SetHostname(name.to_string()));
        Ok(())
    }

    fn chdir(&self, path: &Path) -> Result<()> {
        self.record(SysCall::Chdir(path.to_path_buf()));
        Ok(())
    }

    fn signal(&self, pid: i32, signal: Signal) -> Result<()> {
        self.record(SysCall::Signal {
            pid,
            signal: signal.number(),
        });
        Ok(())
    }

    fn process_exists(&self, pid: i32) -> bool {
        self.live_pids.lock().unwrap().contains(&pid)
    }

    fn run_command(&self, program: &str, args: &[&str]) -> Result<Output> {
        self.record(SysCall::Command {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        });
        Ok(success_output())
    }

    fn spawn_isolated(&self, request: &SpawnRequest) -> Result<SpawnedChild> {
        let pid = {
            let mut next = self.next_pid.lock().unwrap();
            *next += 1;
            *next
        };
        let (plan_r, plan_w) = pipe_files()?;
        let (out_r, out_w) = pipe_files()?;
        let (err_r, err_w) = pipe_files()?;
        let (res_r, res_w) = pipe_files()?;
        self.live_pids.lock().unwrap().push(pid);
        self.spawned.lock().unwrap().push(FakeChild {
            pid,
            request: request.clone(),
            plan: plan_r,
            stdout: out_w,
            stderr: err_w,
            exec_result: res_w,
        });
        Ok(SpawnedChild {
            pid,
            plan: plan_w,
            stdout: out_r,
            stderr: err_r,
            exec_result: res_r,
        })
    }

    fn wait_child(&self, pid: i32) -> Result<ChildExit> {
        // Poll until a test scripts the exit.
        for _ in 0..1_000 {
            if let Some(exit) = self.exit_statuses.lock().unwrap().get(&pid) {
                self.live_pids.lock().unwrap().retain(|p| *p != pid);
                return Ok(*exit);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        Err(Error::Timeout(format!("no scripted exit for pid {pid}")))
    }

    fn exec(&self, program: &str, args: &[String], env: &[(String, String)]) -> Result<()> {
        let _ = env;
        self.record(SysCall::Command {
            program: program.to_string(),
            args: args.to_vec(),
        });
        Ok(())
    }
}

fn pipe_files() -> Result<(File, File)> {
    let (read, write) = nix::unistd::pipe()
        .map_err(|e| Error::syscall("pipe", std::io::Error::from_raw_os_error(e as i32)))?;
    Ok((File::from(read), File::from(write)))
}

/// A zero-exit `Output` without running anything.
fn success_output() -> Output {
    use std::os::unix::process::ExitStatusExt;
    Output {
        status: std::process::ExitStatus::from_raw(0),
        stdout: Vec::new(),
        stderr: Vec::new(),
    }
}
