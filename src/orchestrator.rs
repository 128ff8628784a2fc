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
//! Migration orchestrator: moves the traffic of a flow from one backend to an equivalent backend
//! on another host.
//!
//! Every flow runs through the following state machine:
//!
//! ```text
//! IDLE -> PROVISIONING_NEW -> READY_TO_SWITCH -> DRAINING -> IDLE
//!                 |                  |
//!                 +------------------+--> FAILED
//! ```
//!
//! The flow is never redirected to a backend that has not passed
//! [`BackendProvisioner::wait_ready`], and a failed migration leaves the flow on the backend it
//! was on before. Plans for the same flow are serialized (a second plan is rejected with
//! [`MigrationError::MigrationInProgress`]), plans for different flows run in parallel. The flow
//! table lock is only held for bookkeeping, never across a call to the provisioner or the
//! redirector.
//!
//! A migration whose future is dropped before it terminates leaves its flow in `FAILED` (or `IDLE`
//! if the flow was already switched). The backend it left behind is stopped before the next plan
//! runs, unless the switch forwards to it, in which case it becomes the active backend.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    backend::{BackendHandle, FlowId, HostRef, RequestId, ServiceSpec},
    provisioner::{BackendProvisioner, ProvisionError, ReadyError, StopError},
    redirector::{RedirectError, TrafficRedirector},
    retry::Backoff,
    topology::{HostResolver, TopologyError},
};

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
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationState {
    #[default]
    Idle,
    ProvisioningNew,
    ReadyToSwitch,
    Draining,
    Failed,
}

impl MigrationState {
    /// Whether a migration is currently running, i.e., a new plan must be rejected.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::ProvisioningNew | Self::ReadyToSwitch | Self::Draining
        )
    }
}

/// Redirection state of one flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowTarget {
    pub flow: FlowId,
    /// Backend currently receiving the traffic, `None` before the first assignment.
    pub active: Option<BackendHandle>,
    /// Backend being drained. Only set while in `DRAINING`.
    pub previous: Option<BackendHandle>,
    pub state: MigrationState,
}

impl FlowTarget {
    fn new(flow: FlowId, active: Option<BackendHandle>) -> Self {
        Self {
            flow,
            active,
            previous: None,
            state: MigrationState::Idle,
        }
    }
}

/// Request to move a flow onto a backend on `target_host`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationPlan {
    pub flow: FlowId,
    pub target_host: String,
    pub readiness_timeout: Duration,
    pub drain_grace: Duration,
    /// Makes provisioning idempotent when the same plan is submitted again.
    pub request: RequestId,
}

static NEXT_REQUEST: AtomicU64 = AtomicU64::new(0);

impl MigrationPlan {
    /// Create a plan with a fresh request id.
    pub fn new(
        flow: impl Into<FlowId>,
        target_host: impl Into<String>,
        readiness_timeout: Duration,
        drain_grace: Duration,
    ) -> Self {
        let flow = flow.into();
        let target_host = target_host.into();
        let request = RequestId::new(format!(
            "{flow}-{target_host}-{}",
            NEXT_REQUEST.fetch_add(1, Ordering::Relaxed)
        ));
        Self {
            flow,
            target_host,
            readiness_timeout,
            drain_grace,
            request,
        }
    }

    pub fn with_request(mut self, request: impl Into<RequestId>) -> Self {
        self.request = request.into();
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("Flow {0} is not managed by this orchestrator")]
    UnknownFlow(FlowId),
    #[error("Invalid target: {0}")]
    UnknownHost(#[from] TopologyError),
    #[error("Flow {flow} is already served from {host}")]
    AlreadyOnHost { flow: FlowId, host: HostRef },
    #[error("A migration of flow {0} is already in progress")]
    MigrationInProgress(FlowId),
    #[error("Provisioning failed: {0}")]
    Provision(#[from] ProvisionError),
    #[error("New backend not ready: {0}")]
    NotReady(#[from] ReadyError),
    #[error("Redirect failed: {0}")]
    Redirect(#[from] RedirectError),
    #[error("Migration of flow {0} was cancelled before the traffic was switched")]
    Cancelled(FlowId),
}

impl MigrationError {
    /// State the flow is left in. `None` if the plan was rejected before anything happened.
    pub fn final_state(&self) -> Option<MigrationState> {
        match self {
            Self::UnknownFlow(_)
            | Self::UnknownHost(_)
            | Self::AlreadyOnHost { .. }
            | Self::MigrationInProgress(_) => None,
            Self::Provision(_) | Self::NotReady(_) | Self::Redirect(_) | Self::Cancelled(_) => {
                Some(MigrationState::Failed)
            }
        }
    }

    /// Whether submitting a fresh plan later may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::UnknownFlow(_) | Self::UnknownHost(_) | Self::AlreadyOnHost { .. }
        )
    }
}

/// Result of a successful migration.
#[derive(Debug)]
pub struct MigrationOutcome {
    pub flow: FlowId,
    pub new_backend: BackendHandle,
    pub old_backend: Option<BackendHandle>,
    /// Time from submission until the flow was switched to the new backend.
    pub switched_after: Duration,
    /// Total time including the drain and the teardown.
    pub elapsed: Duration,
    /// The drain grace was cut short by cancellation.
    pub drain_cancelled: bool,
    /// Teardown of the old backend failed. It may still be running but receives no traffic.
    pub stop_error: Option<StopError>,
}

pub struct MigrationOrchestrator<P, R, H> {
    provisioner: P,
    redirector: R,
    hosts: H,
    service: ServiceSpec,
    backoff: Backoff,
    flows: Mutex<HashMap<FlowId, FlowTarget>>,
    /// Backends left behind by migrations that were dropped before they terminated.
    orphans: Mutex<Vec<(FlowId, BackendHandle)>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cleans up the flow table if a migration is dropped before it terminates.
struct Unfinished<'a> {
    flows: &'a Mutex<HashMap<FlowId, FlowTarget>>,
    orphans: &'a Mutex<Vec<(FlowId, BackendHandle)>>,
    flow: FlowId,
    new: Option<BackendHandle>,
    finished: bool,
}

impl Drop for Unfinished<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let left_behind = {
            let mut flows = lock(self.flows);
            let Some(target) = flows.get_mut(&self.flow) else {
                return;
            };
            log::warn!(
                "Migration of flow {} was dropped in state {}",
                self.flow,
                target.state
            );
            if target.state == MigrationState::Draining {
                // switched already, only the teardown is missing
                target.state = MigrationState::Idle;
                target.previous.take()
            } else {
                target.state = MigrationState::Failed;
                target.previous = None;
                self.new.take()
            }
        };
        if let Some(handle) = left_behind {
            lock(self.orphans).push((self.flow.clone(), handle));
        }
    }
}

impl<P, R, H> MigrationOrchestrator<P, R, H>
where
    P: BackendProvisioner,
    R: TrafficRedirector,
    H: HostResolver,
{
    pub fn new(provisioner: P, redirector: R, hosts: H, service: ServiceSpec) -> Self {
        Self {
            provisioner,
            redirector,
            hosts,
            service,
            backoff: Backoff::default(),
            flows: Mutex::new(HashMap::new()),
            orphans: Mutex::new(Vec::new()),
        }
    }

    /// Set the backoff used when the forwarding device is not ready.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn provisioner(&self) -> &P {
        &self.provisioner
    }

    pub fn redirector(&self) -> &R {
        &self.redirector
    }

    /// Start managing `flow`. Its current target is read from the redirector. Registering a flow
    /// twice returns the existing record.
    pub async fn register_flow(&self, flow: impl Into<FlowId>) -> Result<FlowTarget, MigrationError> {
        let flow = flow.into();
        if let Some(target) = self.flow_target(&flow).await {
            return Ok(target);
        }
        let active = self.redirector.get_target(&flow).await?;
        let mut flows = lock(&self.flows);
        Ok(flows
            .entry(flow.clone())
            .or_insert_with(|| FlowTarget::new(flow, active))
            .clone())
    }

    pub async fn flow_target(&self, flow: &FlowId) -> Option<FlowTarget> {
        lock(&self.flows).get(flow).cloned()
    }

    pub async fn state(&self, flow: &FlowId) -> Option<MigrationState> {
        lock(&self.flows).get(flow).map(|t| t.state)
    }

    /// Snapshot of all managed flows, sorted by flow id.
    pub async fn flows(&self) -> Vec<FlowTarget> {
        lock(&self.flows)
            .values()
            .cloned()
            .sorted_by(|a, b| a.flow.cmp(&b.flow))
            .collect()
    }

    /// Backends left behind by dropped migrations that were not stopped yet.
    pub fn orphans(&self) -> Vec<BackendHandle> {
        lock(&self.orphans).iter().map(|(_, h)| h.clone()).collect()
    }

    /// Execute `plan`. The returned error tells in which step the migration failed; the flow keeps
    /// forwarding to the last backend that was confirmed to be ready.
    ///
    /// `cancel` shortens the readiness wait and the redirect backoff (failing the migration) and
    /// the drain grace (the old backend is still stopped).
    pub async fn migrate(
        &self,
        plan: &MigrationPlan,
        cancel: &CancellationToken,
    ) -> Result<MigrationOutcome, MigrationError> {
        let start = Instant::now();
        let host = self.hosts.resolve_host(&plan.target_host)?;
        self.reap_orphans().await;
        let old = self.claim(&plan.flow, &host)?;

        let mut guard = Unfinished {
            flows: &self.flows,
            orphans: &self.orphans,
            flow: plan.flow.clone(),
            new: None,
            finished: false,
        };
        let result = self.run(plan, host, old, cancel, start, &mut guard).await;
        guard.finished = true;
        result
    }

    /// Stop the backends left behind by dropped migrations. A backend the switch still forwards
    /// to becomes the active backend of its flow instead.
    pub async fn reap_orphans(&self) {
        let orphans = std::mem::take(&mut *lock(&self.orphans));
        for (flow, handle) in orphans {
            match self.redirector.get_target(&flow).await {
                Ok(Some(live)) if live == handle => {
                    let adopted = {
                        let mut flows = lock(&self.flows);
                        let target = flows.get_mut(&flow).filter(|t| !t.state.is_busy());
                        target.map(|t| t.active.replace(handle.clone()))
                    };
                    match adopted {
                        Some(stale) => {
                            log::warn!("Flow {flow} forwards to {handle}, which was left behind");
                            if let Some(stale) = stale.filter(|s| *s != handle) {
                                self.discard(&stale).await;
                            }
                        }
                        None => lock(&self.orphans).push((flow, handle)),
                    }
                }
                Ok(_) => {
                    log::info!("Stopping {handle}, left behind by a migration of flow {flow}");
                    self.discard(&handle).await;
                }
                Err(e) => {
                    log::warn!("Cannot tell whether flow {flow} uses {handle}, keeping it: {e}");
                    lock(&self.orphans).push((flow, handle));
                }
            }
        }
    }

    async fn run(
        &self,
        plan: &MigrationPlan,
        host: HostRef,
        old: Option<BackendHandle>,
        cancel: &CancellationToken,
        start: Instant,
        guard: &mut Unfinished<'_>,
    ) -> Result<MigrationOutcome, MigrationError> {
        let flow = &plan.flow;
        log::info!(
            "Migrating flow {flow} from {} to {host} (request {})",
            old.as_ref()
                .map(|h| h.host.to_string())
                .unwrap_or_else(|| "nowhere".to_string()),
            plan.request,
        );

        // PROVISIONING_NEW
        let new = match self
            .provisioner
            .start(&plan.request, &host, &self.service)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                log::error!("Cannot start backend on {host} for flow {flow}: {e}");
                self.fail(flow);
                return Err(e.into());
            }
        };
        guard.new = Some(new.clone());
        log::debug!("Started backend {new}, waiting until it is ready");

        let ready = tokio::select! {
            r = self.provisioner.wait_ready(&new, plan.readiness_timeout) => r.map_err(MigrationError::from),
            _ = cancel.cancelled() => Err(MigrationError::Cancelled(flow.clone())),
        };
        if let Err(e) = ready {
            log::error!("Backend {new} for flow {flow} is not ready: {e}");
            self.discard(&new).await;
            self.fail(flow);
            return Err(e);
        }
        self.transition(flow, MigrationState::ReadyToSwitch);

        // READY_TO_SWITCH
        let target = &new;
        let redirect = self
            .backoff
            .retry("redirect", cancel, RedirectError::is_device_not_ready, move || {
                self.redirector.set_target(flow, target)
            })
            .await;
        if let Err(e) = redirect {
            if e.may_be_applied() {
                log::error!("Flow {flow} may already forward to {new}, keeping it: {e}");
                self.keep_unconfirmed(flow, new);
                return Err(e.into());
            }
            log::error!("Cannot redirect flow {flow} to {new}: {e}");
            self.discard(&new).await;
            self.fail(flow);
            if cancel.is_cancelled() && e.is_device_not_ready() {
                return Err(MigrationError::Cancelled(flow.clone()));
            }
            return Err(e.into());
        }
        let switched_after = start.elapsed();
        let previous = self.switch_active(flow, new.clone());
        log::info!("Flow {flow} now forwards to {new} (after {switched_after:?})");

        // DRAINING
        let mut drain_cancelled = false;
        let mut stop_error = None;
        if let Some(previous) = previous.as_ref() {
            tokio::select! {
                _ = tokio::time::sleep(plan.drain_grace) => {}
                _ = cancel.cancelled() => {
                    log::warn!("Drain of {previous} cancelled, stopping it right away");
                    drain_cancelled = true;
                }
            }
            if let Err(e) = self.provisioner.stop(previous).await {
                log::warn!("Cannot stop old backend {previous}, it keeps running unused: {e}");
                stop_error = Some(e);
            }
        }
        self.finish(flow);

        Ok(MigrationOutcome {
            flow: flow.clone(),
            new_backend: new,
            old_backend: previous,
            switched_after,
            elapsed: start.elapsed(),
            drain_cancelled,
            stop_error,
        })
    }

    /// Move an idle (or failed) flow into `PROVISIONING_NEW`, returning its active backend.
    fn claim(&self, flow: &FlowId, host: &HostRef) -> Result<Option<BackendHandle>, MigrationError> {
        let mut flows = lock(&self.flows);
        let target = flows
            .get_mut(flow)
            .ok_or_else(|| MigrationError::UnknownFlow(flow.clone()))?;
        if target.state.is_busy() {
            return Err(MigrationError::MigrationInProgress(flow.clone()));
        }
        if target.active.as_ref().is_some_and(|a| &a.host == host) {
            return Err(MigrationError::AlreadyOnHost {
                flow: flow.clone(),
                host: host.clone(),
            });
        }
        target.state = MigrationState::ProvisioningNew;
        Ok(target.active.clone())
    }

    fn transition(&self, flow: &FlowId, state: MigrationState) {
        if let Some(target) = lock(&self.flows).get_mut(flow) {
            log::trace!("flow {flow}: {} -> {state}", target.state);
            target.state = state;
        }
    }

    fn fail(&self, flow: &FlowId) {
        if let Some(target) = lock(&self.flows).get_mut(flow) {
            target.previous = None;
            target.state = MigrationState::Failed;
        }
    }

    /// Record the successful redirect and enter `DRAINING`. Returns the backend to drain.
    fn switch_active(&self, flow: &FlowId, new: BackendHandle) -> Option<BackendHandle> {
        let mut flows = lock(&self.flows);
        let target = flows.get_mut(flow)?;
        target.previous = target.active.replace(new);
        target.state = MigrationState::Draining;
        target.previous.clone()
    }

    /// The switch may forward to `new` although the redirect failed. Keep `new` as the active
    /// backend and leave the old one to `reap_orphans`, which stops it unless the switch still
    /// forwards to it.
    fn keep_unconfirmed(&self, flow: &FlowId, new: BackendHandle) {
        let old = {
            let mut flows = lock(&self.flows);
            let Some(target) = flows.get_mut(flow) else {
                return;
            };
            target.previous = None;
            target.state = MigrationState::Failed;
            target.active.replace(new)
        };
        if let Some(old) = old {
            lock(&self.orphans).push((flow.clone(), old));
        }
    }

    fn finish(&self, flow: &FlowId) {
        if let Some(target) = lock(&self.flows).get_mut(flow) {
            target.previous = None;
            target.state = MigrationState::Idle;
        }
    }

    /// Best-effort teardown of a backend that receives no traffic.
    async fn discard(&self, handle: &BackendHandle) {
        if let Err(e) = self.provisioner.stop(handle).await {
            log::warn!("Cannot stop unused backend {handle}: {e}");
        }
    }
}
