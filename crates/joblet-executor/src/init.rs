//! The isolated-init path.
//!
//! After the supervisor clones the binary into fresh namespaces, the new
//! process re-enters `main`, sees `EXEC_MODE=isolated-init`, and lands here
//! as PID 1 of the job's PID namespace. It reads the plan from stdin (which
//! the supervisor only writes after the cgroup attach), assembles the
//! filesystem view, and execs the user command in place.
//!
//! Anything written to stderr here ends up in the job's log stream, which is
//! exactly where a pre-exec failure should surface.

use std::io::Read;
use std::path::Path;

use joblet_core::{Error, NetworkMode, Result};
use joblet_platform::Platform;

use crate::PRE_EXEC_FAILURE_CODE;
use crate::plan::IsolationPlan;

/// Entry point for `EXEC_MODE=isolated-init`. Never returns: on success the
/// process image is replaced by the user command, on failure it exits with
/// the pre-exec sentinel.
pub fn run(platform: &dyn Platform) -> ! {
    let mut buf = String::new();
    if let Err(err) = std::io::stdin().read_to_string(&mut buf) {
        eprintln!("joblet-init: reading plan: {err}");
        std::process::exit(PRE_EXEC_FAILURE_CODE);
    }
    let plan: IsolationPlan = match serde_json::from_str(&buf) {
        Ok(plan) => plan,
        Err(err) => {
            eprintln!("joblet-init: decoding plan: {err}");
            std::process::exit(PRE_EXEC_FAILURE_CODE);
        }
    };
    drop(buf);

    if let Err(err) = enter(platform, &plan) {
        eprintln!("joblet-init: {err}");
        std::process::exit(PRE_EXEC_FAILURE_CODE);
    }
    // exec only returns on failure; the Ok arm exists for test doubles.
    std::process::exit(PRE_EXEC_FAILURE_CODE);
}

/// Apply the plan and exec. Split from [`run`] so the sequence is testable
/// against a recording platform.
pub fn enter(platform: &dyn Platform, plan: &IsolationPlan) -> Result<()> {
    platform.set_hostname(&plan.hostname)?;
    configure_network(platform, plan)?;

    if !plan.build_mode {
        build_root(platform, plan)?;
        pivot(platform, plan)?;
    }

    let cwd = plan.working_dir.clone().unwrap_or_else(|| "/".to_string());
    platform.chdir(Path::new(&cwd))?;

    platform.exec(&plan.command, &plan.args, &plan.env)
}

/// Bring up loopback and, in bridge mode, the veth end the supervisor moved
/// into this namespace. Runs before the pivot so the host's iproute2 is
/// still on the PATH.
fn configure_network(platform: &dyn Platform, plan: &IsolationPlan) -> Result<()> {
    if !plan.network.mode.unshares_netns() {
        return Ok(());
    }
    run_ip(platform, &["link", "set", "lo", "up"])?;

    if plan.network.mode == NetworkMode::None {
        return Ok(());
    }
    let (Some(interface), Some(address), Some(gateway)) = (
        plan.network.interface.as_deref(),
        plan.network.address.as_deref(),
        plan.network.gateway.as_deref(),
    ) else {
        return Ok(());
    };
    run_ip(platform, &["addr", "add", address, "dev", interface])?;
    run_ip(platform, &["link", "set", interface, "up"])?;
    run_ip(platform, &["route", "add", "default", "via", gateway])?;
    Ok(())
}

fn run_ip(platform: &dyn Platform, args: &[&str]) -> Result<()> {
    let output = platform.run_command("ip", args)?;
    if !output.status.success() {
        return Err(Error::Internal(format!(
            "ip {}: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Assemble the new root: self-bind to make it a mount point, apply the
/// plan's binds, then the kernel filesystems, /dev shim, and device nodes.
fn build_root(platform: &dyn Platform, plan: &IsolationPlan) -> Result<()> {
    platform.create_dir_all(&plan.root)?;
    platform.bind_mount(&plan.root, &plan.root, false)?;

    for bind in &plan.binds {
        let target = plan.root.join(&bind.target);
        platform.create_dir_all(&target)?;
        platform.bind_mount(&bind.source, &target, bind.readonly)?;
    }

    let proc_dir = plan.root.join("proc");
    platform.create_dir_all(&proc_dir)?;
    platform.mount_special("proc", &proc_dir, None)?;

    let sys_dir = plan.root.join("sys");
    platform.create_dir_all(&sys_dir)?;
    platform.mount_special("sysfs", &sys_dir, None)?;

    let dev_dir = plan.root.join("dev");
    platform.create_dir_all(&dev_dir)?;
    platform.mount_special("tmpfs", &dev_dir, Some("mode=755"))?;
    for device in &plan.devices {
        platform.mknod(
            &dev_dir.join(&device.name),
            joblet_platform::DeviceKind::Char,
            device.major,
            device.minor,
            device.mode,
        )?;
    }

    let tmp_dir = plan.root.join("tmp");
    platform.create_dir_all(&tmp_dir)?;
    platform.mount_special("tmpfs", &tmp_dir, Some("mode=1777"))?;

    Ok(())
}

/// Swap into the new root and drop the old one.
fn pivot(platform: &dyn Platform, plan: &IsolationPlan) -> Result<()> {
    let put_old = plan.root.join(".oldroot");
    platform.create_dir_all(&put_old)?;
    platform.pivot_root(&plan.root, &put_old)?;
    platform.chdir(Path::new("/"))?;
    platform.unmount(Path::new("/.oldroot"), true)?;
    platform.remove_dir(Path::new("/.oldroot"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{NetworkPlan, PlanBuilder};
    use joblet_core::{Job, JobId, JobSpec};
    use joblet_platform::testing::{RecordingPlatform, SysCall};
    use tempfile::TempDir;

    fn plan_for(dir: &TempDir, network: NetworkPlan) -> IsolationPlan {
        let mut spec = JobSpec::new("echo");
        spec.args = vec!["hi".to_string()];
        let job = Job::new(JobId::new(), spec);
        PlanBuilder::new(&job, dir.path().join("rootfs"))
            .network(network)
            .build()
    }

    #[test]
    fn mounts_precede_pivot_and_pivot_precedes_exec() {
        let dir = TempDir::new().unwrap();
        let platform = RecordingPlatform::new();
        let plan = plan_for(&dir, NetworkPlan::none());
        enter(&platform, &plan).unwrap();

        let calls = platform.calls();
        let first_mount = calls
            .iter()
            .position(|c| matches!(c, SysCall::BindMount { .. }))
            .unwrap();
        let proc_mount = calls
            .iter()
            .position(|c| matches!(c, SysCall::MountSpecial { fstype, .. } if fstype == "proc"))
            .unwrap();
        let pivot = calls
            .iter()
            .position(|c| matches!(c, SysCall::PivotRoot { .. }))
            .unwrap();
        let exec = calls
            .iter()
            .position(|c| matches!(c, SysCall::Command { program, .. } if program == "echo"))
            .unwrap();
        assert!(first_mount < proc_mount);
        assert!(proc_mount < pivot);
        assert!(pivot < exec);
    }

    #[test]
    fn hostname_is_set_first() {
        let dir = TempDir::new().unwrap();
        let platform = RecordingPlatform::new();
        let plan = plan_for(&dir, NetworkPlan::none());
        enter(&platform, &plan).unwrap();
        assert!(matches!(platform.calls().first(), Some(SysCall::SetHostname(_))));
    }

    #[test]
    fn device_shim_gets_standard_nodes() {
        let dir = TempDir::new().unwrap();
        let platform = RecordingPlatform::new();
        let plan = plan_for(&dir, NetworkPlan::none());
        enter(&platform, &plan).unwrap();
        let nodes: Vec<_> = platform
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                SysCall::Mknod { path, .. } => Some(path),
                _ => None,
            })
            .collect();
        assert!(nodes.iter().any(|p| p.ends_with("dev/null")));
        assert!(nodes.iter().any(|p| p.ends_with("dev/urandom")));
    }

    #[test]
    fn none_mode_only_brings_up_loopback() {
        let dir = TempDir::new().unwrap();
        let platform = RecordingPlatform::new();
        let plan = plan_for(&dir, NetworkPlan::none());
        enter(&platform, &plan).unwrap();
        let ip_calls: Vec<_> = platform
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                SysCall::Command { program, args } if program == "ip" => Some(args),
                _ => None,
            })
            .collect();
        assert_eq!(ip_calls, vec![vec![
            "link".to_string(),
            "set".to_string(),
            "lo".to_string(),
            "up".to_string()
        ]]);
    }

    #[test]
    fn bridge_mode_configures_address_and_route() {
        let dir = TempDir::new().unwrap();
        let platform = RecordingPlatform::new();
        let plan = plan_for(
            &dir,
            NetworkPlan {
                mode: joblet_core::NetworkMode::Bridge,
                interface: Some("eth0".into()),
                address: Some("10.88.0.7/16".into()),
                gateway: Some("10.88.0.1".into()),
            },
        );
        enter(&platform, &plan).unwrap();
        let ip_calls: Vec<Vec<String>> = platform
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                SysCall::Command { program, args } if program == "ip" => Some(args),
                _ => None,
            })
            .collect();
        assert_eq!(ip_calls.len(), 4);
        assert!(ip_calls[1].contains(&"10.88.0.7/16".to_string()));
        assert!(ip_calls[3].contains(&"10.88.0.1".to_string()));
    }

    #[test]
    fn build_mode_skips_the_pivot() {
        let dir = TempDir::new().unwrap();
        let platform = RecordingPlatform::new();
        let mut plan = plan_for(&dir, NetworkPlan::none());
        plan.build_mode = true;
        enter(&platform, &plan).unwrap();
        assert!(!platform
            .calls()
            .iter()
            .any(|c| matches!(c, SysCall::PivotRoot { .. })));
    }
}
