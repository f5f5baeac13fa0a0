//! Network attachment modes.

use serde::{Deserialize, Serialize};

/// How a job's network namespace is wired up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// Veth pair joined to the host bridge. The bridge itself is provisioned
    /// by external tooling.
    #[default]
    Bridge,
    /// Share the host network namespace; no unshare of NET.
    Host,
    /// Fresh network namespace with only loopback.
    None,
    /// A named custom network, resolved against daemon configuration.
    #[serde(untagged)]
    Custom(String),
}

impl NetworkMode {
    /// Whether the spawn must unshare the network namespace.
    pub fn unshares_netns(&self) -> bool {
        !matches!(self, NetworkMode::Host)
    }
}

impl std::fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkMode::Bridge => f.write_str("bridge"),
            NetworkMode::Host => f.write_str("host"),
            NetworkMode::None => f.write_str("none"),
            NetworkMode::Custom(name) => f.write_str(name),
        }
    }
}

/// Custom network names end up as bridge device names, so they inherit the
/// kernel's interface-name limits.
const MAX_NETWORK_NAME: usize = 15;

impl std::str::FromStr for NetworkMode {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "" | "bridge" => Ok(NetworkMode::Bridge),
            "host" => Ok(NetworkMode::Host),
            "none" => Ok(NetworkMode::None),
            custom => {
                if custom.len() > MAX_NETWORK_NAME
                    || !custom
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
                {
                    return Err(crate::Error::InvalidArgument(format!(
                        "malformed network name: {custom:?}"
                    )));
                }
                Ok(NetworkMode::Custom(custom.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_strings_round_trip() {
        for s in ["bridge", "host", "none", "team-net"] {
            let mode: NetworkMode = s.parse().unwrap();
            assert_eq!(mode.to_string(), s);
        }
    }

    #[test]
    fn only_host_mode_keeps_the_host_netns() {
        assert!(NetworkMode::Bridge.unshares_netns());
        assert!(NetworkMode::None.unshares_netns());
        assert!(NetworkMode::Custom("x".into()).unshares_netns());
        assert!(!NetworkMode::Host.unshares_netns());
    }

    #[test]
    fn malformed_custom_names_are_rejected() {
        assert!("team net".parse::<NetworkMode>().is_err());
        assert!("a/b".parse::<NetworkMode>().is_err());
        assert!("way-too-long-for-an-interface".parse::<NetworkMode>().is_err());
        assert!("team0".parse::<NetworkMode>().is_ok());
    }
}
