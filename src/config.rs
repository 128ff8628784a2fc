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
//! Testbed configuration, loaded from a JSON file.

use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use handoff_utils::serde::duration_secs;

use crate::{
    backend::{FlowId, ServiceSpec},
    retry::Backoff,
    topology::{HostResolver, Testbed, TopologyError},
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Topology error: {0}")]
    Topology(#[from] TopologyError),
    #[error("Flow {0} has no ingress interface")]
    EmptyFlow(FlowId),
    #[error("Flow {flow} uses interface {interface}, which belongs to no host")]
    UnknownInterface { flow: FlowId, interface: String },
    #[error("Flow {0} is defined more than once")]
    DuplicateFlow(FlowId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub testbed: Testbed,
    #[serde(default)]
    pub service: ServiceSpec,
    #[serde(default = "default_flows")]
    pub flows: Vec<FlowConfig>,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub switch: SwitchConfig,
    #[serde(default)]
    pub migration: MigrationDefaults,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            testbed: Testbed::default(),
            service: ServiceSpec::default(),
            flows: default_flows(),
            runtime: RuntimeConfig::default(),
            switch: SwitchConfig::default(),
            migration: MigrationDefaults::default(),
        }
    }
}

/// A flow is a set of switch ingress ports whose traffic is forwarded to the same backend. All
/// rules of a flow are updated together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowConfig {
    pub id: FlowId,
    /// Switch interfaces on which the traffic of this flow enters, e.g. `s1-client`.
    pub ingress: Vec<String>,
    /// Host serving the flow when the testbed starts.
    pub initial_host: String,
}

/// Both the client and the server talk to the cache through the same redirect set.
fn default_flows() -> Vec<FlowConfig> {
    vec![FlowConfig {
        id: FlowId::new("cache"),
        ingress: vec!["s1-client".to_string(), "s1-server".to_string()],
        initial_host: "cache1".to_string(),
    }]
}

/// How readiness of a new backend is determined.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadinessProbe {
    /// The container is running.
    #[default]
    Running,
    /// A TCP connection to the service endpoint succeeds.
    Tcp,
    /// The command exits successfully inside the container.
    Exec(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Docker binary.
    pub docker: String,
    /// Prefix of the containers emulating the hosts (`mn.cache1`).
    pub host_prefix: String,
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,
    pub probe: ReadinessProbe,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker: "docker".to_string(),
            host_prefix: "mn.".to_string(),
            poll_interval: Duration::from_millis(200),
            probe: ReadinessProbe::Running,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchConfig {
    pub ovs_ofctl: String,
    pub ovs_vsctl: String,
    /// Protocol used for bundled updates of multi-port flows.
    pub openflow_version: String,
    /// Check the installed action with `dump-flows` after every update.
    pub verify: bool,
}

impl Default for SwitchConfig {
    fn default() -> Self {
        Self {
            ovs_ofctl: "ovs-ofctl".to_string(),
            ovs_vsctl: "ovs-vsctl".to_string(),
            openflow_version: "OpenFlow14".to_string(),
            verify: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationDefaults {
    #[serde(with = "duration_secs")]
    pub readiness_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub drain_grace: Duration,
    pub backoff: Backoff,
}

impl Default for MigrationDefaults {
    fn default() -> Self {
        Self {
            readiness_timeout: Duration::from_secs(30),
            drain_grace: Duration::from_secs(3),
            backoff: Backoff::default(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        log::debug!("Loading config from {path:?}");
        let config: Self = serde_json::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.testbed.validate()?;
        for (i, flow) in self.flows.iter().enumerate() {
            if self.flows[..i].iter().any(|f| f.id == flow.id) {
                return Err(ConfigError::DuplicateFlow(flow.id.clone()));
            }
            if flow.ingress.is_empty() {
                return Err(ConfigError::EmptyFlow(flow.id.clone()));
            }
            if let Some(interface) = flow.ingress.iter().find(|ifce| {
                !self
                    .testbed
                    .hosts
                    .iter()
                    .any(|h| &&h.switch_interface == ifce)
            }) {
                return Err(ConfigError::UnknownInterface {
                    flow: flow.id.clone(),
                    interface: interface.clone(),
                });
            }
            self.testbed.resolve_host(&flow.initial_host)?;
        }
        Ok(())
    }

    pub fn flow(&self, id: &FlowId) -> Option<&FlowConfig> {
        self.flows.iter().find(|f| &f.id == id)
    }
}
