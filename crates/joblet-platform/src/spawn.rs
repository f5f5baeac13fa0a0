//! Namespaced process spawn.
//!
//! The supervisor re-executes its own binary inside a fresh set of
//! namespaces; the child becomes PID 1 of the new PID namespace and turns
//! into the isolated-init process. Four pipes connect the two sides:
//!
//! - plan: parent writes the serialized isolation plan; the child reads it
//!   on stdin. The parent only writes after the cgroup attach, which is what
//!   keeps the child from proceeding too early.
//! - stdout / stderr: the job's output.
//! - exec_result: close-on-exec in the child. A successful exec yields EOF;
//!   a failed one yields the errno bytes.

use std::ffi::{CString, c_char};
use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;

use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::sched::CloneFlags;
use nix::sys::wait::{WaitStatus as NixWait, waitpid};
use nix::unistd::{Pid, pipe};

use joblet_core::{Error, Result};

/// Which namespaces the child is created in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NamespaceSet {
    pub pid: bool,
    pub mount: bool,
    pub ipc: bool,
    pub uts: bool,
    pub cgroup: bool,
    pub net: bool,
}

impl NamespaceSet {
    /// The standard job set; network is mode-dependent.
    pub fn isolated(net: bool) -> Self {
        Self {
            pid: true,
            mount: true,
            ipc: true,
            uts: true,
            cgroup: true,
            net,
        }
    }

    fn clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();
        if self.pid {
            flags |= CloneFlags::CLONE_NEWPID;
        }
        if self.mount {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        if self.ipc {
            flags |= CloneFlags::CLONE_NEWIPC;
        }
        if self.uts {
            flags |= CloneFlags::CLONE_NEWUTS;
        }
        if self.cgroup {
            flags |= CloneFlags::CLONE_NEWCGROUP;
        }
        if self.net {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        flags
    }
}

/// What to spawn. `env` replaces the child environment entirely.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub exe: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub namespaces: NamespaceSet,
}

/// Parent-side handles to a spawned child.
#[derive(Debug)]
pub struct SpawnedChild {
    pub pid: i32,
    /// Write end of the plan pipe (the child's stdin).
    pub plan: File,
    pub stdout: File,
    pub stderr: File,
    /// Read end of the exec-result pipe. EOF means the exec went through.
    pub exec_result: File,
}

/// Terminal status of a waited child. Signal deaths are folded into
/// `exit_code` as 128 + signo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    pub exit_code: i32,
    pub signaled: bool,
}

pub(crate) fn spawn_isolated(request: &SpawnRequest) -> Result<SpawnedChild> {
    let (plan_r, plan_w) = make_pipe()?;
    let (out_r, out_w) = make_pipe()?;
    let (err_r, err_w) = make_pipe()?;
    let (res_r, res_w) = make_pipe()?;

    // The result pipe closes on a successful exec; that EOF is the signal
    // that the child is running the new image.
    fcntl(res_w.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
        .map_err(|e| errno_err("fcntl FD_CLOEXEC", e))?;

    // Everything the child touches is prepared before the clone. After the
    // clone we are a copy of one thread of a multi-threaded process, so the
    // child must not allocate or take locks until it execs.
    let exe = cstring(request.exe.to_string_lossy().as_ref())?;
    let argv_storage: Vec<CString> = std::iter::once(request.exe.to_string_lossy().to_string())
        .chain(request.args.iter().cloned())
        .map(|arg| cstring(&arg))
        .collect::<Result<_>>()?;
    let env_storage: Vec<CString> = request
        .env
        .iter()
        .map(|(k, v)| cstring(&format!("{k}={v}")))
        .collect::<Result<_>>()?;
    let argv = nul_terminated(&argv_storage);
    let envp = nul_terminated(&env_storage);

    let plan_r_fd = plan_r.as_raw_fd();
    let plan_w_fd = plan_w.as_raw_fd();
    let out_r_fd = out_r.as_raw_fd();
    let out_w_fd = out_w.as_raw_fd();
    let err_r_fd = err_r.as_raw_fd();
    let err_w_fd = err_w.as_raw_fd();
    let res_r_fd = res_r.as_raw_fd();
    let res_w_fd = res_w.as_raw_fd();
    let exe_ptr = exe.as_ptr();
    let argv_ptr = argv.as_ptr();
    let envp_ptr = envp.as_ptr();

    let mut stack = vec![0u8; 512 * 1024];
    let flags = request.namespaces.clone_flags();

    let child = unsafe {
        nix::sched::clone(
            Box::new(move || {
                // Async-signal-safe territory: libc only, no allocation.
                unsafe {
                    libc::close(plan_w_fd);
                    libc::close(out_r_fd);
                    libc::close(err_r_fd);
                    libc::close(res_r_fd);
                    if libc::dup2(plan_r_fd, 0) < 0
                        || libc::dup2(out_w_fd, 1) < 0
                        || libc::dup2(err_w_fd, 2) < 0
                    {
                        report_and_abort(res_w_fd);
                    }
                    libc::close(plan_r_fd);
                    libc::close(out_w_fd);
                    libc::close(err_w_fd);

                    libc::execve(
                        exe_ptr,
                        argv_ptr as *const *const c_char,
                        envp_ptr as *const *const c_char,
                    );
                    report_and_abort(res_w_fd)
                }
            }),
            &mut stack,
            flags,
            Some(libc::SIGCHLD),
        )
    }
    .map_err(|e| errno_err("clone", e))?;

    Ok(SpawnedChild {
        pid: child.as_raw(),
        plan: File::from(plan_w),
        stdout: File::from(out_r),
        stderr: File::from(err_r),
        exec_result: File::from(res_r),
    })
}

pub(crate) fn wait_child(pid: i32) -> Result<ChildExit> {
    loop {
        match waitpid(Pid::from_raw(pid), None) {
            Ok(NixWait::Exited(_, code)) => {
                return Ok(ChildExit {
                    exit_code: code,
                    signaled: false,
                });
            }
            Ok(NixWait::Signaled(_, signal, _)) => {
                return Ok(ChildExit {
                    exit_code: 128 + signal as i32,
                    signaled: true,
                });
            }
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => return Err(errno_err(&format!("waitpid {pid}"), e)),
        }
    }
}

/// Write the errno to the result pipe and die. Runs in the cloned child, so
/// libc only.
unsafe fn report_and_abort(res_fd: i32) -> isize {
    unsafe {
        let errno = *libc::__errno_location();
        let bytes = errno.to_ne_bytes();
        libc::write(res_fd, bytes.as_ptr().cast(), bytes.len());
        libc::_exit(255);
    }
}

fn make_pipe() -> Result<(OwnedFd, OwnedFd)> {
    pipe().map_err(|e| errno_err("pipe", e))
}

fn cstring(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| Error::InvalidArgument(format!("embedded NUL in {s:?}")))
}

fn nul_terminated(storage: &[CString]) -> Vec<*const c_char> {
    storage
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

fn errno_err(op: &str, errno: nix::Error) -> Error {
    Error::syscall(op, std::io::Error::from_raw_os_error(errno as i32))
}

/// Decode the exec-result pipe contents: empty means success, otherwise the
/// first four bytes carry the child's errno.
pub fn decode_exec_result(buf: &[u8]) -> std::result::Result<(), std::io::Error> {
    if buf.is_empty() {
        return Ok(());
    }
    let mut bytes = [0u8; 4];
    let len = buf.len().min(4);
    bytes[..len].copy_from_slice(&buf[..len]);
    Err(std::io::Error::from_raw_os_error(i32::from_ne_bytes(bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read as _;

    // Namespace creation needs privileges, but with an empty namespace set
    // the clone is an ordinary fork+exec we can exercise for real.
    fn plain(exe: &str, args: &[&str]) -> SpawnRequest {
        SpawnRequest {
            exe: PathBuf::from(exe),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: vec![("PATH".to_string(), "/usr/bin:/bin".to_string())],
            namespaces: NamespaceSet::default(),
        }
    }

    #[test]
    fn child_execs_and_its_output_comes_back() {
        let mut child = spawn_isolated(&plain("/bin/echo", &["hello"])).unwrap();
        drop(child.plan);

        let mut result = Vec::new();
        child.exec_result.read_to_end(&mut result).unwrap();
        decode_exec_result(&result).unwrap();

        let mut stdout = String::new();
        child.stdout.read_to_string(&mut stdout).unwrap();
        assert_eq!(stdout, "hello\n");

        let exit = wait_child(child.pid).unwrap();
        assert_eq!(exit.exit_code, 0);
        assert!(!exit.signaled);
    }

    #[test]
    fn child_reads_the_plan_pipe_as_stdin() {
        let mut child = spawn_isolated(&plain("/bin/cat", &[])).unwrap();
        use std::io::Write as _;
        child.plan.write_all(b"handshake\n").unwrap();
        drop(child.plan);

        let mut stdout = String::new();
        child.stdout.read_to_string(&mut stdout).unwrap();
        assert_eq!(stdout, "handshake\n");
        assert_eq!(wait_child(child.pid).unwrap().exit_code, 0);
    }

    #[test]
    fn failed_exec_reports_the_errno() {
        let mut child = spawn_isolated(&plain("/no/such/binary", &[])).unwrap();
        drop(child.plan);

        let mut result = Vec::new();
        child.exec_result.read_to_end(&mut result).unwrap();
        let err = decode_exec_result(&result).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));

        let exit = wait_child(child.pid).unwrap();
        assert_eq!(exit.exit_code, 255);
    }

    #[test]
    fn isolated_set_requests_every_namespace_but_net_conditionally() {
        let all = NamespaceSet::isolated(true);
        assert!(all.pid && all.mount && all.ipc && all.uts && all.cgroup && all.net);
        let host_net = NamespaceSet::isolated(false);
        assert!(!host_net.net);
        assert!(host_net.pid);
    }
}
