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
//! End-to-end tests of the migration orchestrator on the emulated runtime and switch.
//!
//! All tests run on a paused tokio clock, so timeouts and drain periods elapse instantly:
//!
//! ```shell
//! cargo test -- --nocapture
//! ```

use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    backend::{BackendHandle, FlowId, RequestId, ServiceSpec},
    emulated::{EmulatedRuntime, EmulatedSwitch},
    orchestrator::{MigrationOrchestrator, MigrationPlan},
    provisioner::BackendProvisioner,
    redirector::TrafficRedirector,
    retry::Backoff,
    topology::Testbed,
};

pub(crate) type Emulated = MigrationOrchestrator<EmulatedRuntime, EmulatedSwitch, Testbed>;

pub(crate) const READY_DELAY: Duration = Duration::from_millis(500);
pub(crate) const READINESS_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const DRAIN_GRACE: Duration = Duration::from_secs(3);

pub(crate) fn init_logging() {
    let _ = pretty_env_logger::try_init();
}

/// Orchestrator managing `flows`, none of which has a backend yet.
pub(crate) async fn setup(flows: &[&str]) -> Emulated {
    init_logging();
    let runtime = EmulatedRuntime::new(Testbed::default());
    runtime.set_ready_delay(READY_DELAY).await;
    let switch = EmulatedSwitch::new(flows.iter().map(|f| FlowId::new(*f)));
    let orch = MigrationOrchestrator::new(runtime, switch, Testbed::default(), ServiceSpec::default())
        .with_backoff(Backoff {
            jitter: 0.0,
            ..Default::default()
        });
    for flow in flows {
        orch.register_flow(*flow).await.unwrap();
    }
    orch
}

/// Orchestrator managing `flow`, which is already forwarded to a ready backend on `host`. The
/// backend is set up directly at the runtime and the switch, as if it was deployed by hand.
pub(crate) async fn setup_with_backend(flow: &str, host: &str) -> (Emulated, BackendHandle) {
    init_logging();
    let runtime = EmulatedRuntime::new(Testbed::default());
    runtime.set_ready_delay(READY_DELAY).await;
    let switch = EmulatedSwitch::new([FlowId::new(flow)]);

    let handle = runtime
        .start(
            &RequestId::new(format!("initial-{flow}")),
            &host.into(),
            &ServiceSpec::default(),
        )
        .await
        .unwrap();
    runtime.wait_ready(&handle, READINESS_TIMEOUT).await.unwrap();
    switch.set_target(&flow.into(), &handle).await.unwrap();

    let orch = MigrationOrchestrator::new(runtime, switch, Testbed::default(), ServiceSpec::default())
        .with_backoff(Backoff {
            jitter: 0.0,
            ..Default::default()
        });
    let target = orch.register_flow(flow).await.unwrap();
    assert_eq!(target.active.as_ref(), Some(&handle));
    (orch, handle)
}

/// Empty scratch directory, unique to the test `name`.
pub(crate) fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("handoff-{}-{name}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Install a shell script in `dir` that stands in for the command `name`, and return its path.
pub(crate) fn fake_command(dir: &Path, name: &str, script: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

pub(crate) fn plan(flow: &str, host: &str) -> MigrationPlan {
    MigrationPlan::new(flow, host, READINESS_TIMEOUT, DRAIN_GRACE)
}

mod failures;
