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
//! Identity and addressing of deployable service instances.

use std::{fmt, net::SocketAddr};

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Opaque identifier of one backend instance, assigned by the provisioner.
    BackendId
);
string_id!(
    /// Reference to an emulated host, as returned by a `HostResolver`.
    HostRef
);
string_id!(
    /// Identifies a traffic class whose forwarding target is controlled as one unit.
    FlowId
);
string_id!(
    /// Caller-supplied id making `BackendProvisioner::start` idempotent.
    RequestId
);

/// One running instance of a service. Created by `BackendProvisioner::start` and immutable
/// thereafter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendHandle {
    pub id: BackendId,
    pub host: HostRef,
    pub endpoint: SocketAddr,
}

impl BackendHandle {
    pub fn new(id: impl Into<BackendId>, host: impl Into<HostRef>, endpoint: SocketAddr) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            endpoint,
        }
    }
}

impl fmt::Display for BackendHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} ({})", self.id, self.host, self.endpoint)
    }
}

/// Description of the service that gets deployed onto a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Service name. Instances are called `<name>_<host>`, e.g. `cache_server_cache2`.
    pub name: String,
    /// Container image to run.
    pub image: String,
    /// Port on which the service accepts client traffic.
    pub port: u16,
    /// Additional arguments passed to the container entrypoint.
    #[serde(default)]
    pub args: Vec<String>,
}

impl ServiceSpec {
    /// Name of the instance of this service on `host`.
    pub fn instance_name(&self, host: &HostRef) -> String {
        format!("{}_{}", self.name, host)
    }
}

impl Default for ServiceSpec {
    fn default() -> Self {
        Self {
            name: "cache_server".to_string(),
            image: "davideparpi/nginx-hls-cache".to_string(),
            port: 80,
            args: Vec::new(),
        }
    }
}
