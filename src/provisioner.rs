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
//! Interface to the container runtime that starts and stops backend instances.

use std::time::Duration;

use crate::{
    backend::{BackendHandle, HostRef, RequestId, ServiceSpec},
    util::CommandError,
};

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("Host {0} is not reachable")]
    HostUnreachable(HostRef),
    #[error("Runtime rejected the service on {host}: {reason}")]
    Rejected { host: HostRef, reason: String },
    #[error("Instance {0} already exists for a different request")]
    NameConflict(String),
    #[error("Command error: {0}")]
    Command(#[from] CommandError),
}

#[derive(Debug, thiserror::Error)]
pub enum ReadyError {
    #[error("Backend did not become ready within {0:?}")]
    TimedOut(Duration),
}

#[derive(Debug, thiserror::Error)]
pub enum StopError {
    #[error("Runtime refused to stop {instance}: {reason}")]
    Refused { instance: String, reason: String },
    #[error("Command error: {0}")]
    Command(#[from] CommandError),
}

#[async_trait::async_trait]
pub trait BackendProvisioner: Send + Sync {
    /// Instantiate `spec` on `host`.
    ///
    /// Calling `start` again with the same `request` returns the handle created by the first call
    /// instead of creating a second instance.
    async fn start(
        &self,
        request: &RequestId,
        host: &HostRef,
        spec: &ServiceSpec,
    ) -> Result<BackendHandle, ProvisionError>;

    /// Poll until the instance accepts traffic, or fail after `timeout`. Must not mutate any other
    /// state.
    async fn wait_ready(&self, handle: &BackendHandle, timeout: Duration)
        -> Result<(), ReadyError>;

    /// Tear down the instance. Stopping an instance that is already gone succeeds.
    async fn stop(&self, handle: &BackendHandle) -> Result<(), StopError>;
}
