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
//! In-memory container runtime and switch. Used to run migrations without a testbed (`--emulate`)
//! and to inject failures in tests.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use tokio::{sync::Mutex, time::Instant};

use crate::{
    backend::{BackendHandle, BackendId, FlowId, HostRef, RequestId, ServiceSpec},
    provisioner::{BackendProvisioner, ProvisionError, ReadyError, StopError},
    redirector::{RedirectError, TrafficRedirector},
    topology::Testbed,
};

#[derive(Debug)]
struct Instance {
    handle: BackendHandle,
    started_at: Instant,
    running: bool,
    ready_confirmed: bool,
    stop_calls: usize,
}

#[derive(Debug, Default)]
struct RuntimeState {
    instances: HashMap<BackendId, Instance>,
    requests: HashMap<RequestId, BackendId>,
    start_calls: usize,
    next_id: u64,
    ready_delay: Duration,
    unreachable: HashSet<HostRef>,
    rejecting: HashSet<HostRef>,
    never_ready: HashSet<HostRef>,
    failing_stop: HashSet<HostRef>,
}

/// Container runtime keeping all instances in memory. Instances become ready `ready_delay` after
/// they were started.
#[derive(Debug, Clone)]
pub struct EmulatedRuntime {
    testbed: Arc<Testbed>,
    state: Arc<Mutex<RuntimeState>>,
}

impl EmulatedRuntime {
    pub fn new(testbed: Testbed) -> Self {
        Self {
            testbed: Arc::new(testbed),
            state: Arc::new(Mutex::new(RuntimeState {
                ready_delay: Duration::from_millis(100),
                ..Default::default()
            })),
        }
    }

    pub async fn set_ready_delay(&self, delay: Duration) {
        self.state.lock().await.ready_delay = delay;
    }

    /// `start` fails with `HostUnreachable` on `host`.
    pub async fn make_unreachable(&self, host: impl Into<HostRef>) {
        self.state.lock().await.unreachable.insert(host.into());
    }

    /// `start` fails with `Rejected` on `host`.
    pub async fn reject_on(&self, host: impl Into<HostRef>) {
        self.state.lock().await.rejecting.insert(host.into());
    }

    /// Instances on `host` never become ready.
    pub async fn never_ready_on(&self, host: impl Into<HostRef>) {
        self.state.lock().await.never_ready.insert(host.into());
    }

    /// `stop` fails on `host`, leaving the instance running.
    pub async fn fail_stop_on(&self, host: impl Into<HostRef>) {
        self.state.lock().await.failing_stop.insert(host.into());
    }

    /// Remove all injected faults of `host`.
    pub async fn heal(&self, host: impl Into<HostRef>) {
        let host = host.into();
        let mut state = self.state.lock().await;
        state.unreachable.remove(&host);
        state.rejecting.remove(&host);
        state.never_ready.remove(&host);
        state.failing_stop.remove(&host);
    }

    pub async fn running(&self) -> Vec<BackendHandle> {
        let state = self.state.lock().await;
        let mut handles: Vec<_> = state
            .instances
            .values()
            .filter(|i| i.running)
            .map(|i| i.handle.clone())
            .collect();
        handles.sort_by(|a, b| a.id.cmp(&b.id));
        handles
    }

    pub async fn is_running(&self, id: &BackendId) -> bool {
        let state = self.state.lock().await;
        state.instances.get(id).is_some_and(|i| i.running)
    }

    /// Whether `wait_ready` ever succeeded for this instance.
    pub async fn was_ready(&self, id: &BackendId) -> bool {
        let state = self.state.lock().await;
        state.instances.get(id).is_some_and(|i| i.ready_confirmed)
    }

    pub async fn stop_calls(&self, id: &BackendId) -> usize {
        let state = self.state.lock().await;
        state.instances.get(id).map(|i| i.stop_calls).unwrap_or(0)
    }

    /// Number of instances that were actually created.
    pub async fn start_calls(&self) -> usize {
        self.state.lock().await.start_calls
    }
}

#[async_trait::async_trait]
impl BackendProvisioner for EmulatedRuntime {
    async fn start(
        &self,
        request: &RequestId,
        host: &HostRef,
        spec: &ServiceSpec,
    ) -> Result<BackendHandle, ProvisionError> {
        let endpoint = self
            .testbed
            .endpoint(host, spec.port)
            .map_err(|_| ProvisionError::HostUnreachable(host.clone()))?;

        let mut state = self.state.lock().await;
        if state.unreachable.contains(host) {
            return Err(ProvisionError::HostUnreachable(host.clone()));
        }
        if state.rejecting.contains(host) {
            return Err(ProvisionError::Rejected {
                host: host.clone(),
                reason: format!("image {} cannot be started", spec.image),
            });
        }
        if let Some(id) = state.requests.get(request) {
            if let Some(instance) = state.instances.get(id).filter(|i| i.running) {
                log::debug!("request {request} already started {}", instance.handle);
                return Ok(instance.handle.clone());
            }
        }

        let id = BackendId::new(format!(
            "{}-{}",
            spec.instance_name(host),
            state.next_id
        ));
        state.next_id += 1;
        state.start_calls += 1;
        let handle = BackendHandle::new(id.clone(), host.clone(), endpoint);
        state.instances.insert(
            id.clone(),
            Instance {
                handle: handle.clone(),
                started_at: Instant::now(),
                running: true,
                ready_confirmed: false,
                stop_calls: 0,
            },
        );
        state.requests.insert(request.clone(), id);
        Ok(handle)
    }

    async fn wait_ready(
        &self,
        handle: &BackendHandle,
        timeout: Duration,
    ) -> Result<(), ReadyError> {
        let ready_at = {
            let state = self.state.lock().await;
            match state.instances.get(&handle.id) {
                Some(i) if i.running && !state.never_ready.contains(&handle.host) => {
                    Some(i.started_at + state.ready_delay)
                }
                _ => None,
            }
        };
        let deadline = Instant::now() + timeout;
        match ready_at {
            Some(ready_at) if ready_at <= deadline => {
                tokio::time::sleep_until(ready_at).await;
                let mut state = self.state.lock().await;
                if let Some(i) = state.instances.get_mut(&handle.id) {
                    i.ready_confirmed = true;
                }
                Ok(())
            }
            _ => {
                tokio::time::sleep_until(deadline).await;
                Err(ReadyError::TimedOut(timeout))
            }
        }
    }

    async fn stop(&self, handle: &BackendHandle) -> Result<(), StopError> {
        let mut state = self.state.lock().await;
        let refuse = state.failing_stop.contains(&handle.host);
        let Some(instance) = state.instances.get_mut(&handle.id) else {
            return Ok(());
        };
        instance.stop_calls += 1;
        if !instance.running {
            return Ok(());
        }
        if refuse {
            return Err(StopError::Refused {
                instance: handle.id.to_string(),
                reason: "container is busy".to_string(),
            });
        }
        instance.running = false;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct SwitchState {
    targets: HashMap<FlowId, Option<BackendHandle>>,
    not_ready_for: usize,
    rejecting: bool,
    unconfirmed: bool,
    history: Vec<(FlowId, BackendHandle)>,
}

/// Switch keeping one forwarding target per flow in memory.
#[derive(Debug, Clone, Default)]
pub struct EmulatedSwitch {
    state: Arc<Mutex<SwitchState>>,
}

impl EmulatedSwitch {
    pub fn new(flows: impl IntoIterator<Item = FlowId>) -> Self {
        let state = SwitchState {
            targets: flows.into_iter().map(|f| (f, None)).collect(),
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// The next `n` rule updates fail with `DeviceNotReady`.
    pub async fn not_ready_for(&self, n: usize) {
        self.state.lock().await.not_ready_for = n;
    }

    /// Reject all rule updates from now on.
    pub async fn reject_updates(&self, reject: bool) {
        self.state.lock().await.rejecting = reject;
    }

    /// Rule updates are applied, but reported as `Unreverted`.
    pub async fn unconfirmed_updates(&self, unconfirmed: bool) {
        self.state.lock().await.unconfirmed = unconfirmed;
    }

    /// All rule updates that were applied, in order.
    pub async fn history(&self) -> Vec<(FlowId, BackendHandle)> {
        self.state.lock().await.history.clone()
    }
}

#[async_trait::async_trait]
impl TrafficRedirector for EmulatedSwitch {
    async fn get_target(&self, flow: &FlowId) -> Result<Option<BackendHandle>, RedirectError> {
        self.state
            .lock()
            .await
            .targets
            .get(flow)
            .cloned()
            .ok_or_else(|| RedirectError::UnknownFlow(flow.clone()))
    }

    async fn set_target(
        &self,
        flow: &FlowId,
        handle: &BackendHandle,
    ) -> Result<(), RedirectError> {
        let mut state = self.state.lock().await;
        if state.not_ready_for > 0 {
            state.not_ready_for -= 1;
            return Err(RedirectError::DeviceNotReady("switch is booting".to_string()));
        }
        if state.rejecting {
            return Err(RedirectError::Rejected(format!("flow {flow} is read-only")));
        }
        let Some(target) = state.targets.get_mut(flow) else {
            return Err(RedirectError::UnknownFlow(flow.clone()));
        };
        *target = Some(handle.clone());
        state.history.push((flow.clone(), handle.clone()));
        if state.unconfirmed {
            return Err(RedirectError::Unreverted {
                flow: flow.clone(),
                reason: "lost connection after the update".to_string(),
            });
        }
        Ok(())
    }
}
