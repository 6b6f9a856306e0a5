//! Declarative container description
//!
//! A [`Container`] is loaded from `container.json` in the container's data
//! directory and is read-only for the duration of a launch.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::{CgroupSpec, Error, Result};

/// File name of the container description inside the data directory
pub const CONTAINER_FILE: &str = "container.json";

/// Container specification
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Container {
    /// Hostname set inside a new UTS namespace
    #[serde(default)]
    pub hostname: Option<String>,

    /// Allocate an interactive terminal
    #[serde(default)]
    pub tty: bool,

    /// Working directory inside the container
    #[serde(default)]
    pub working_dir: Option<String>,

    /// Environment for the container's program (`KEY=value`)
    #[serde(default)]
    pub env: Vec<String>,

    /// Namespace name to enabled flag, e.g. `"NEWNET": true`
    #[serde(default)]
    pub namespaces: HashMap<String, bool>,

    /// Optional resource limits
    #[serde(default)]
    pub cgroups: Option<CgroupSpec>,

    /// Network stacks to construct, one strategy each
    #[serde(default)]
    pub networks: Vec<Network>,

    /// Host interfaces relocated into the container
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterface>,
}

impl Container {
    /// Load `container.json` from a data directory
    ///
    /// # Errors
    /// Returns error if the file is missing or malformed
    pub fn load(data_path: &Path) -> Result<Self> {
        let path = data_path.join(CONTAINER_FILE);
        let raw = std::fs::read_to_string(&path).map_err(|e| Error::InvalidConfig {
            message: format!("cannot read {}: {e}", path.display()),
        })?;

        let container: Self = serde_json::from_str(&raw)?;
        tracing::debug!(
            path = %path.display(),
            networks = container.networks.len(),
            interfaces = container.network_interfaces.len(),
            "Loaded container description"
        );
        Ok(container)
    }

    /// Whether a namespace is requested and enabled
    #[must_use]
    pub fn namespace_enabled(&self, key: &str) -> bool {
        self.namespaces.get(key).copied().unwrap_or(false)
    }
}

/// One network stack configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    /// Strategy discriminator (`loopback`, `veth`, `none`)
    #[serde(rename = "type")]
    pub kind: String,

    /// Address in CIDR notation assigned inside the container
    #[serde(default)]
    pub address: Option<String>,

    /// Default gateway inside the container
    #[serde(default)]
    pub gateway: Option<String>,

    /// Link MTU
    #[serde(default)]
    pub mtu: Option<u32>,

    /// Strategy-specific parameters (`bridge`, `prefix`, ...)
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl Network {
    /// Network config of the given type with no parameters
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            address: None,
            gateway: None,
            mtu: None,
            context: HashMap::new(),
        }
    }
}

/// A host interface bound into the container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    /// Interface name as seen from the host
    pub host_iface_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "hostname": "web",
        "namespaces": {"NEWNET": true, "NEWPID": true, "NEWUTS": false},
        "networks": [
            {"type": "loopback", "address": "127.0.0.1/0", "mtu": 1500},
            {"type": "veth", "address": "172.17.0.2/16", "gateway": "172.17.42.1",
             "mtu": 1500, "context": {"bridge": "docker0", "prefix": "veth"}}
        ],
        "network_interfaces": [{"host_iface_name": "eth1"}]
    }"#;

    #[test]
    fn test_container_from_json() {
        let container: Container = serde_json::from_str(SAMPLE).unwrap();

        assert_eq!(container.hostname.as_deref(), Some("web"));
        assert!(!container.tty);
        assert!(container.cgroups.is_none());
        assert_eq!(container.networks.len(), 2);
        assert_eq!(container.networks[1].kind, "veth");
        assert_eq!(
            container.networks[1].context.get("bridge").map(String::as_str),
            Some("docker0")
        );
        assert_eq!(container.network_interfaces[0].host_iface_name, "eth1");
    }

    #[test]
    fn test_namespace_enabled() {
        let container: Container = serde_json::from_str(SAMPLE).unwrap();

        assert!(container.namespace_enabled("NEWNET"));
        assert!(!container.namespace_enabled("NEWUTS"));
        assert!(!container.namespace_enabled("NEWIPC"));
    }

    #[test]
    fn test_network_type_round_trip() {
        let network = Network::new("none");
        let json = serde_json::to_string(&network).unwrap();
        assert!(json.contains(r#""type":"none""#));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Container::load(dir.path()).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }
}
