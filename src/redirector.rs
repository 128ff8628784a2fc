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
//! Interface to the switch control plane that decides where a flow is forwarded to.

use crate::{
    backend::{BackendHandle, FlowId, HostRef},
    util::CommandError,
};

#[derive(Debug, thiserror::Error)]
pub enum RedirectError {
    /// The forwarding device cannot be programmed yet. Callers retry with backoff.
    #[error("Forwarding device is not ready: {0}")]
    DeviceNotReady(String),
    #[error("Flow {0} is not known to the control plane")]
    UnknownFlow(FlowId),
    #[error("No forwarding port leads to host {0}")]
    UnknownHost(HostRef),
    #[error("Control plane rejected the rule update: {0}")]
    Rejected(String),
    #[error("Installed rule for {flow} forwards to {found} instead of {expected}")]
    Verification {
        flow: FlowId,
        expected: String,
        found: String,
    },
    /// The update could neither be confirmed nor reverted. The switch may already forward the
    /// flow to the new backend.
    #[error("Update of flow {flow} could not be confirmed nor reverted: {reason}")]
    Unreverted { flow: FlowId, reason: String },
    #[error("Command error: {0}")]
    Command(#[from] CommandError),
}

impl RedirectError {
    pub fn is_device_not_ready(&self) -> bool {
        matches!(self, Self::DeviceNotReady(_))
    }

    /// Whether the new target may be in place despite the error. The new backend must then be
    /// treated as live.
    pub fn may_be_applied(&self) -> bool {
        matches!(self, Self::Unreverted { .. })
    }
}

#[async_trait::async_trait]
pub trait TrafficRedirector: Send + Sync {
    /// Current forwarding target of `flow`, or `None` before the first assignment.
    async fn get_target(&self, flow: &FlowId) -> Result<Option<BackendHandle>, RedirectError>;

    /// Point `flow` at `handle`. New connections observe the change as one instantaneous switch;
    /// implementations never remove the old rule before the new one is in place. Once this
    /// returns `Ok`, `get_target` returns `handle`. On any error other than
    /// [`RedirectError::Unreverted`], the flow still forwards to its previous target.
    async fn set_target(&self, flow: &FlowId, handle: &BackendHandle)
        -> Result<(), RedirectError>;
}
