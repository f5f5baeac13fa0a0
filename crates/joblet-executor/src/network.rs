//! Veth attachment to the host bridge.
//!
//! Bridges themselves (devices, addressing, forwarding rules) are
//! provisioned by host tooling; the attacher only joins jobs to them. The
//! default bridge serves `bridge` mode, and each configured custom network
//! is its own bridge with its own address pool. For each attached job the
//! supervisor creates a veth pair, enslaves the host end, and pushes the
//! peer into the job's network namespace named `eth0`. The isolated-init
//! process assigns the leased address on its side before pivoting.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use joblet_config::system::NetworkConfig;
use joblet_core::{Error, JobId, NetworkMode, Result};
use joblet_platform::Platform;

use crate::plan::NetworkPlan;

/// Pool key for the default bridge. Custom networks pool under their name.
const DEFAULT_POOL: &str = "bridge";

/// One attachable network, parsed out of configuration at startup.
#[derive(Debug, Clone)]
struct Network {
    bridge: String,
    subnet: Ipv4Addr,
    prefix: u8,
    gateway: String,
}

pub struct NetworkAttacher {
    platform: Arc<dyn Platform>,
    networks: HashMap<String, Network>,
    leased: Mutex<HashMap<String, HashSet<u32>>>,
}

impl NetworkAttacher {
    /// Parse and validate every configured network up front so a bad subnet
    /// fails the daemon at boot, not a job at spawn.
    pub fn new(platform: Arc<dyn Platform>, config: NetworkConfig) -> Result<Self> {
        let mut networks = HashMap::new();
        let (subnet, prefix) = parse_cidr(&config.subnet)?;
        networks.insert(
            DEFAULT_POOL.to_string(),
            Network {
                bridge: config.bridge.clone(),
                subnet,
                prefix,
                gateway: config.gateway.clone(),
            },
        );
        for (name, custom) in &config.custom {
            let (subnet, prefix) = parse_cidr(&custom.subnet)
                .map_err(|e| Error::InvalidArgument(format!("network {name}: {e}")))?;
            networks.insert(
                name.clone(),
                Network {
                    bridge: custom.bridge.clone(),
                    subnet,
                    prefix,
                    gateway: custom.gateway.clone(),
                },
            );
        }
        Ok(Self {
            platform,
            networks,
            leased: Mutex::new(HashMap::new()),
        })
    }

    /// Build the network half of the isolation plan, leasing an address for
    /// bridge-backed modes.
    pub fn prepare(&self, job_id: &JobId, mode: &NetworkMode) -> Result<NetworkPlan> {
        match mode {
            NetworkMode::Host | NetworkMode::None => Ok(NetworkPlan {
                mode: mode.clone(),
                interface: None,
                address: None,
                gateway: None,
            }),
            NetworkMode::Bridge | NetworkMode::Custom(_) => {
                let (pool, network) = self.network_for(mode)?;
                let address = self.lease(pool, network)?;
                debug!(job_id = %job_id, network = %pool, address = %address, "Leased job address");
                Ok(NetworkPlan {
                    mode: mode.clone(),
                    interface: Some("eth0".to_string()),
                    address: Some(format!("{address}/{}", network.prefix)),
                    gateway: Some(network.gateway.clone()),
                })
            }
        }
    }

    /// Create the veth pair and move the peer into the job's namespace.
    /// Called after the clone, before the plan is written to the child.
    pub fn attach(&self, job_id: &JobId, pid: i32, plan: &NetworkPlan) -> Result<()> {
        if plan.address.is_none() {
            return Ok(());
        }
        let (_, network) = self.network_for(&plan.mode)?;
        let host_end = host_ifname(job_id);
        let peer_end = format!("{host_end}p");
        let pid_arg = pid.to_string();
        self.run_ip(&[
            "link",
            "add",
            host_end.as_str(),
            "type",
            "veth",
            "peer",
            "name",
            peer_end.as_str(),
        ])?;
        if let Err(err) = self
            .run_ip(&[
                "link",
                "set",
                host_end.as_str(),
                "master",
                network.bridge.as_str(),
                "up",
            ])
            .and_then(|_| {
                self.run_ip(&[
                    "link",
                    "set",
                    peer_end.as_str(),
                    "netns",
                    pid_arg.as_str(),
                    "name",
                    "eth0",
                ])
            })
        {
            // Half-attached pairs would leak on the host side.
            let _ = self.run_ip(&["link", "del", host_end.as_str()]);
            return Err(err);
        }
        Ok(())
    }

    /// Release a job's lease and tear down the host end. The veth pair dies
    /// with the namespace, so a delete failure is only noise.
    pub fn release(&self, job_id: &JobId, plan: &NetworkPlan) {
        if let Some(address) = &plan.address {
            if let Some(host) = address
                .split('/')
                .next()
                .and_then(|ip| ip.parse::<Ipv4Addr>().ok())
            {
                let pool = pool_key(&plan.mode);
                if let Some(leased) = self.leased.lock().unwrap().get_mut(pool) {
                    leased.remove(&u32::from(host));
                }
            }
            let host_end = host_ifname(job_id);
            if let Err(err) = self.run_ip(&["link", "del", host_end.as_str()]) {
                debug!(interface = %host_end, error = %err, "Veth already gone");
            }
        }
    }

    fn network_for<'a>(&'a self, mode: &'a NetworkMode) -> Result<(&'a str, &'a Network)> {
        let pool = pool_key(mode);
        self.networks
            .get(pool)
            .map(|network| (pool, network))
            .ok_or_else(|| Error::InvalidArgument(format!("unknown network {pool}")))
    }

    /// Lease the next free host address from one network's pool. The
    /// gateway and the network and broadcast addresses are never handed out.
    fn lease(&self, pool: &str, network: &Network) -> Result<Ipv4Addr> {
        let mut pools = self.leased.lock().unwrap();
        let leased = pools.entry(pool.to_string()).or_default();
        let base = u32::from(network.subnet);
        let host_bits = 32 - u32::from(network.prefix);
        let capacity = (1u64 << host_bits) as u32;
        let gateway: u32 = network
            .gateway
            .parse::<Ipv4Addr>()
            .map(u32::from)
            .unwrap_or(base + 1);
        for offset in 2..capacity.saturating_sub(1) {
            let candidate = base + offset;
            if candidate == gateway || leased.contains(&candidate) {
                continue;
            }
            leased.insert(candidate);
            return Ok(Ipv4Addr::from(candidate));
        }
        Err(Error::ResourceExhausted(format!(
            "no free addresses in network {pool}"
        )))
    }

    fn run_ip(&self, args: &[&str]) -> Result<()> {
        let output = self.platform.run_command("ip", args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(args = ?args, stderr = %stderr, "ip command failed");
            return Err(Error::Internal(format!(
                "ip {}: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(())
    }
}

fn pool_key(mode: &NetworkMode) -> &str {
    match mode {
        NetworkMode::Custom(name) => name.as_str(),
        _ => DEFAULT_POOL,
    }
}

/// Host-side veth name, bounded by IFNAMSIZ.
fn host_ifname(job_id: &JobId) -> String {
    let short: String = job_id.to_string().chars().take(8).collect();
    format!("jb-{short}")
}

fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, u8)> {
    let (addr, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| Error::InvalidArgument(format!("malformed subnet: {cidr}")))?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("malformed subnet: {cidr}")))?;
    let prefix: u8 = prefix
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("malformed subnet: {cidr}")))?;
    if prefix > 30 {
        return Err(Error::InvalidArgument(format!(
            "subnet too small for jobs: {cidr}"
        )));
    }
    Ok((addr, prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use joblet_config::system::CustomNetwork;
    use joblet_platform::testing::{RecordingPlatform, SysCall};

    fn config_with_team0() -> NetworkConfig {
        let mut config = NetworkConfig::default();
        config.custom.insert(
            "team0".to_string(),
            CustomNetwork {
                bridge: "team0-br".to_string(),
                subnet: "10.99.0.0/24".to_string(),
                gateway: "10.99.0.1".to_string(),
            },
        );
        config
    }

    fn attacher() -> (Arc<RecordingPlatform>, NetworkAttacher) {
        let platform = Arc::new(RecordingPlatform::new());
        let attacher = NetworkAttacher::new(platform.clone(), config_with_team0()).unwrap();
        (platform, attacher)
    }

    #[test]
    fn bridge_mode_leases_unique_addresses() {
        let (_, attacher) = attacher();
        let a = attacher
            .prepare(&JobId::new(), &NetworkMode::Bridge)
            .unwrap();
        let b = attacher
            .prepare(&JobId::new(), &NetworkMode::Bridge)
            .unwrap();
        assert_ne!(a.address, b.address);
        assert_eq!(a.gateway.as_deref(), Some("10.88.0.1"));
    }

    #[test]
    fn gateway_is_never_leased() {
        let (_, attacher) = attacher();
        for _ in 0..32 {
            let plan = attacher
                .prepare(&JobId::new(), &NetworkMode::Bridge)
                .unwrap();
            assert_ne!(plan.address.as_deref(), Some("10.88.0.1/16"));
        }
    }

    #[test]
    fn host_and_none_modes_get_no_lease() {
        let (_, attacher) = attacher();
        let host = attacher.prepare(&JobId::new(), &NetworkMode::Host).unwrap();
        assert!(host.address.is_none());
        let none = attacher.prepare(&JobId::new(), &NetworkMode::None).unwrap();
        assert!(none.address.is_none());
    }

    #[test]
    fn attach_creates_and_moves_the_pair() {
        let (platform, attacher) = attacher();
        let id = JobId::new();
        let plan = attacher.prepare(&id, &NetworkMode::Bridge).unwrap();
        attacher.attach(&id, 4242, &plan).unwrap();

        let commands: Vec<Vec<String>> = platform
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                SysCall::Command { args, .. } => Some(args),
                _ => None,
            })
            .collect();
        assert_eq!(commands.len(), 3);
        assert!(commands[0].contains(&"veth".to_string()));
        assert!(commands[1].contains(&"joblet0".to_string()));
        assert!(commands[2].contains(&"4242".to_string()));
        assert!(commands[2].contains(&"eth0".to_string()));
    }

    #[test]
    fn release_frees_the_lease_for_reuse() {
        let (_, attacher) = attacher();
        let id = JobId::new();
        let plan = attacher.prepare(&id, &NetworkMode::Bridge).unwrap();
        let first = plan.address.clone();
        attacher.release(&id, &plan);
        let again = attacher
            .prepare(&JobId::new(), &NetworkMode::Bridge)
            .unwrap();
        assert_eq!(again.address, first);
    }

    #[test]
    fn custom_mode_uses_its_own_bridge_and_pool() {
        let (platform, attacher) = attacher();
        let id = JobId::new();
        let plan = attacher
            .prepare(&id, &NetworkMode::Custom("team0".into()))
            .unwrap();
        assert!(plan.address.as_deref().unwrap().starts_with("10.99.0."));
        assert!(plan.address.as_deref().unwrap().ends_with("/24"));
        assert_eq!(plan.gateway.as_deref(), Some("10.99.0.1"));

        attacher.attach(&id, 7, &plan).unwrap();
        let enslave = platform
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                SysCall::Command { args, .. } => Some(args),
                _ => None,
            })
            .nth(1)
            .unwrap();
        assert!(enslave.contains(&"team0-br".to_string()));
    }

    #[test]
    fn unknown_custom_network_is_rejected() {
        let (_, attacher) = attacher();
        let err = attacher
            .prepare(&JobId::new(), &NetworkMode::Custom("ghost".into()))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn bad_custom_subnet_fails_at_construction() {
        let platform = Arc::new(RecordingPlatform::new());
        let mut config = NetworkConfig::default();
        config.custom.insert(
            "broken".to_string(),
            CustomNetwork {
                bridge: "b0".to_string(),
                subnet: "not-a-subnet".to_string(),
                gateway: "10.0.0.1".to_string(),
            },
        );
        assert!(NetworkAttacher::new(platform, config).is_err());
    }
}
