// HANDOFF: Coordinated Service Migration between Cache Replicas on an Emulated Testbed
// Copyright (C) 2024-2025 Roland Schmid <roschmi@ethz.ch> and Tibor Schneider <sctibor@ethz.ch>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//! Description of the emulated testbed: one switch and the hosts attached to it.

use std::net::{IpAddr, SocketAddr};

use ipnet::Ipv4Net;
use itertools::Itertools;
use mac_address::MacAddress;
use serde::{Deserialize, Serialize};

use crate::backend::HostRef;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("Host {0} does not exist in the testbed")]
    UnknownHost(String),
    #[error("Host {0} cannot run backends")]
    NotABackendHost(String),
    #[error("Host {0} is defined more than once")]
    DuplicateHost(String),
    #[error("Switch interface {0} is used by more than one host")]
    DuplicateInterface(String),
}

/// Resolves host names to host references. Used to validate the target of a migration before
/// anything is provisioned.
pub trait HostResolver: Send + Sync {
    fn resolve_host(&self, name: &str) -> Result<HostRef, TopologyError>;
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum HostRole {
    Server,
    #[default]
    Cache,
    Client,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    pub name: String,
    #[serde(default)]
    pub role: HostRole,
    /// Address (and subnet) of the service-facing interface.
    pub ip: Ipv4Net,
    #[serde(default)]
    pub mac: Option<MacAddress>,
    /// Address on the internal network between the caches.
    #[serde(default)]
    pub internal_ip: Option<Ipv4Net>,
    /// Switch interface facing this host, e.g. `s1-cache1`.
    pub switch_interface: String,
}

impl HostConfig {
    fn new(name: &str, role: HostRole, ip: [u8; 4], mac_last: u8, switch: &str) -> Self {
        Self {
            name: name.to_string(),
            role,
            // a /24 prefix is always valid
            ip: Ipv4Net::new(ip.into(), 24).unwrap(),
            mac: Some(MacAddress::new([0, 0, 0, 0, 0, mac_last])),
            internal_ip: None,
            switch_interface: format!("{switch}-{name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Testbed {
    /// Name of the OpenFlow switch all hosts are attached to.
    pub switch: String,
    pub hosts: Vec<HostConfig>,
}

impl Testbed {
    pub fn host(&self, name: &str) -> Option<&HostConfig> {
        self.hosts.iter().find(|h| h.name == name)
    }

    /// All hosts that can run a backend.
    pub fn caches(&self) -> impl Iterator<Item = &HostConfig> {
        self.hosts.iter().filter(|h| h.role == HostRole::Cache)
    }

    /// Service endpoint of a backend listening on `port` on `host`.
    pub fn endpoint(&self, host: &HostRef, port: u16) -> Result<SocketAddr, TopologyError> {
        let cfg = self
            .host(host.as_str())
            .ok_or_else(|| TopologyError::UnknownHost(host.to_string()))?;
        Ok(SocketAddr::new(IpAddr::V4(cfg.ip.addr()), port))
    }

    /// Check that host names and switch interfaces are unique.
    pub fn validate(&self) -> Result<(), TopologyError> {
        if let Some(name) = self.hosts.iter().map(|h| &h.name).duplicates().next() {
            return Err(TopologyError::DuplicateHost(name.clone()));
        }
        if let Some(ifce) = self
            .hosts
            .iter()
            .map(|h| &h.switch_interface)
            .duplicates()
            .next()
        {
            return Err(TopologyError::DuplicateInterface(ifce.clone()));
        }
        Ok(())
    }
}

impl Default for Testbed {
    /// One server, two caches sharing the service address, one client, all on switch `s1`.
    fn default() -> Self {
        let switch = "s1";
        let mut cache1 = HostConfig::new("cache1", HostRole::Cache, [10, 0, 0, 12], 0x12, switch);
        cache1.internal_ip = Ipv4Net::new([192, 168, 0, 12].into(), 24).ok();
        let mut cache2 = HostConfig::new("cache2", HostRole::Cache, [10, 0, 0, 12], 0x12, switch);
        cache2.internal_ip = Ipv4Net::new([192, 168, 0, 13].into(), 24).ok();
        Self {
            switch: switch.to_string(),
            hosts: vec![
                HostConfig::new("server", HostRole::Server, [10, 0, 0, 11], 0x11, switch),
                cache1,
                cache2,
                HostConfig::new("client", HostRole::Client, [10, 0, 0, 13], 0x13, switch),
            ],
        }
    }
}

impl HostResolver for Testbed {
    fn resolve_host(&self, name: &str) -> Result<HostRef, TopologyError> {
        match self.host(name) {
            Some(h) if h.role == HostRole::Cache => Ok(HostRef::new(&h.name)),
            Some(_) => Err(TopologyError::NotABackendHost(name.to_string())),
            None => Err(TopologyError::UnknownHost(name.to_string())),
        }
    }
}
