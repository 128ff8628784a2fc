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
//! Library for migrating a service between equivalent backends on an emulated testbed, without
//! ever forwarding traffic to a backend that is not ready.
//!
//! The [`orchestrator`] drives the migration through the [`provisioner::BackendProvisioner`]
//! (container runtime) and the [`redirector::TrafficRedirector`] (switch control plane). Both are
//! implemented for Docker and Open vSwitch ([`docker`], [`ovs`]) and in memory ([`emulated`]).

pub mod backend;
pub mod config;
pub mod docker;
pub mod emulated;
pub mod orchestrator;
pub mod ovs;
pub mod provisioner;
pub mod records;
pub mod redirector;
pub mod retry;
pub mod topology;
pub mod util;

#[cfg(test)]
mod test;

pub mod prelude {
    pub use super::{
        backend::{BackendHandle, FlowId, HostRef, RequestId, ServiceSpec},
        orchestrator::{
            MigrationError, MigrationOrchestrator, MigrationOutcome, MigrationPlan, MigrationState,
        },
        provisioner::BackendProvisioner,
        redirector::TrafficRedirector,
        topology::HostResolver,
    };
}
