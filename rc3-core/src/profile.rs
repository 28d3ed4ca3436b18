//! Resource profiles for instance size classes
//!
//! The tier table below is the only place the system defines how much CPU and
//! memory a size class gets. Everything downstream (the container options sent
//! to the cluster, tests, docs) derives from `ProfileResolver::resolve`.

use crate::{CoreError, InstanceSize, Result};
use serde::{Deserialize, Serialize};

/// Every instance gets the same root disk.
pub const DISK_GB: u64 = 60;

struct Tier {
    cores: u32,
    cpu_limit: u32,
    memory_mb: u64,
}

fn tier(size: InstanceSize) -> Option<Tier> {
    match size {
        InstanceSize::Small => Some(Tier {
            cores: 2,
            cpu_limit: 2,
            memory_mb: 2048,
        }),
        InstanceSize::Medium => Some(Tier {
            cores: 2,
            cpu_limit: 2,
            memory_mb: 4096,
        }),
        InstanceSize::Large => Some(Tier {
            cores: 4,
            cpu_limit: 4,
            memory_mb: 8192,
        }),
        InstanceSize::Unknown => None,
    }
}

/// Network attachment for a new instance: DHCP on the default bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    pub interface: String,
    pub bridge: String,
    pub firewall: bool,
    pub dhcp: bool,
}

impl Default for NetworkSpec {
    fn default() -> Self {
        Self {
            interface: "eth0".to_string(),
            bridge: "vmbr0".to_string(),
            firewall: false,
            dhcp: true,
        }
    }
}

impl NetworkSpec {
    /// Render as a `net0` value, e.g. `name=eth0,bridge=vmbr0,firewall=0,ip=dhcp`.
    pub fn render(&self) -> String {
        let mut value = format!(
            "name={},bridge={},firewall={}",
            self.interface,
            self.bridge,
            u8::from(self.firewall)
        );
        if self.dhcp {
            value.push_str(",ip=dhcp");
        }
        value
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceProfile {
    pub size: InstanceSize,
    pub cores: u32,
    pub cpu_limit: u32,
    pub memory_mb: u64,
    pub disk_gb: u64,
    pub os_template: String,
    pub storage: String,
    pub network: NetworkSpec,
}

impl ResourceProfile {
    /// Ordered key/value options for a container create call.
    pub fn container_options(&self) -> Vec<(String, String)> {
        vec![
            ("arch".to_string(), "amd64".to_string()),
            ("onboot".to_string(), "1".to_string()),
            ("ostype".to_string(), "ubuntu".to_string()),
            ("unprivileged".to_string(), "1".to_string()),
            ("features".to_string(), "nesting=1".to_string()),
            ("ostemplate".to_string(), self.os_template.clone()),
            ("net0".to_string(), self.network.render()),
            (
                "rootfs".to_string(),
                format!("{}:{}", self.storage, self.disk_gb),
            ),
            ("cores".to_string(), self.cores.to_string()),
            ("cpulimit".to_string(), self.cpu_limit.to_string()),
            ("memory".to_string(), self.memory_mb.to_string()),
        ]
    }
}

/// Maps size classes to concrete profiles. Holds the deployment-wide OS
/// template and storage pool so `resolve` stays a pure function of size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileResolver {
    os_template: String,
    storage: String,
}

impl ProfileResolver {
    pub fn new(os_template: impl Into<String>, storage: impl Into<String>) -> Self {
        Self {
            os_template: os_template.into(),
            storage: storage.into(),
        }
    }

    pub fn resolve(&self, size: InstanceSize) -> Result<ResourceProfile> {
        let tier = tier(size).ok_or_else(|| CoreError::InvalidSize(size.to_string()))?;

        Ok(ResourceProfile {
            size,
            cores: tier.cores,
            cpu_limit: tier.cpu_limit,
            memory_mb: tier.memory_mb,
            disk_gb: DISK_GB,
            os_template: self.os_template.clone(),
            storage: self.storage.clone(),
            network: NetworkSpec::default(),
        })
    }
}
