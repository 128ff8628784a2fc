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
//! Failures in every step of a migration.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::{
    backend::HostRef,
    orchestrator::{MigrationError, MigrationState},
    provisioner::ProvisionError,
    redirector::{RedirectError, TrafficRedirector},
    retry::Backoff,
    topology::TopologyError,
};

use super::{plan, setup_with_backend};

#[tokio::test(start_paused = true)]
async fn provision_error_does_not_touch_the_flow() {
    let (orch, b1) = setup_with_backend("f1", "cache1").await;
    orch.provisioner().reject_on("cache2").await;

    let err = orch
        .migrate(&plan("f1", "cache2"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MigrationError::Provision(ProvisionError::Rejected { .. })
    ));

    let target = orch.flow_target(&"f1".into()).await.unwrap();
    assert_eq!(target.state, MigrationState::Failed);
    assert_eq!(target.active, Some(b1.clone()));
    // no redirect was attempted
    assert_eq!(orch.redirector().history().await.len(), 1);
    assert_eq!(orch.provisioner().running().await, vec![b1]);
}

#[tokio::test(start_paused = true)]
async fn unreachable_host() {
    let (orch, b1) = setup_with_backend("f1", "cache1").await;
    orch.provisioner().make_unreachable("cache2").await;

    let err = orch
        .migrate(&plan("f1", "cache2"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MigrationError::Provision(ProvisionError::HostUnreachable(_))
    ));
    assert_eq!(
        orch.redirector().get_target(&"f1".into()).await.unwrap(),
        Some(b1)
    );
}

#[tokio::test(start_paused = true)]
async fn redirect_error_stops_new_backend() {
    let (orch, b1) = setup_with_backend("f1", "cache1").await;
    orch.redirector().reject_updates(true).await;

    let err = orch
        .migrate(&plan("f1", "cache2"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MigrationError::Redirect(RedirectError::Rejected(_))
    ));

    let target = orch.flow_target(&"f1".into()).await.unwrap();
    assert_eq!(target.state, MigrationState::Failed);
    assert_eq!(target.active, Some(b1.clone()));
    assert_eq!(target.previous, None);
    // the unused backend on cache2 is gone, the old one keeps serving
    assert_eq!(orch.provisioner().running().await, vec![b1.clone()]);
    assert_eq!(
        orch.redirector().get_target(&"f1".into()).await.unwrap(),
        Some(b1)
    );
}

#[tokio::test(start_paused = true)]
async fn device_not_ready_is_retried() {
    let (orch, b1) = setup_with_backend("f1", "cache1").await;
    orch.redirector().not_ready_for(3).await;

    let outcome = orch
        .migrate(&plan("f1", "cache2"), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome.old_backend, Some(b1));
    assert_eq!(
        orch.redirector().get_target(&"f1".into()).await.unwrap(),
        Some(outcome.new_backend)
    );
}

#[tokio::test(start_paused = true)]
async fn device_never_ready() {
    let (orch, b1) = setup_with_backend("f1", "cache1").await;
    let orch = orch.with_backoff(Backoff {
        initial: Duration::from_millis(10),
        max_attempts: 3,
        jitter: 0.0,
        ..Default::default()
    });
    orch.redirector().not_ready_for(3).await;

    let err = orch
        .migrate(&plan("f1", "cache2"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MigrationError::Redirect(RedirectError::DeviceNotReady(_))
    ));
    assert_eq!(
        orch.flow_target(&"f1".into()).await.unwrap().active,
        Some(b1.clone())
    );
    assert_eq!(orch.provisioner().running().await, vec![b1]);
}

#[tokio::test(start_paused = true)]
async fn stop_error_is_not_fatal() {
    let (orch, b1) = setup_with_backend("f1", "cache1").await;
    orch.provisioner().fail_stop_on("cache1").await;

    let outcome = orch
        .migrate(&plan("f1", "cache2"), &CancellationToken::new())
        .await
        .unwrap();
    assert!(outcome.stop_error.is_some());

    let target = orch.flow_target(&"f1".into()).await.unwrap();
    assert_eq!(target.state, MigrationState::Idle);
    assert_eq!(target.previous, None);
    assert_eq!(target.active, Some(outcome.new_backend.clone()));
    // the old backend lingers, but receives no traffic
    assert!(orch.provisioner().is_running(&b1.id).await);
    assert_eq!(
        orch.redirector().get_target(&"f1".into()).await.unwrap(),
        Some(outcome.new_backend)
    );
}

#[tokio::test(start_paused = true)]
async fn invalid_plans_are_rejected_without_state_change() {
    let (orch, b1) = setup_with_backend("f1", "cache1").await;
    let cancel = CancellationToken::new();

    let err = orch.migrate(&plan("f2", "cache2"), &cancel).await.unwrap_err();
    assert!(matches!(err, MigrationError::UnknownFlow(_)));

    let err = orch.migrate(&plan("f1", "client"), &cancel).await.unwrap_err();
    assert!(matches!(
        err,
        MigrationError::UnknownHost(TopologyError::NotABackendHost(_))
    ));

    let err = orch.migrate(&plan("f1", "cache7"), &cancel).await.unwrap_err();
    assert!(matches!(
        err,
        MigrationError::UnknownHost(TopologyError::UnknownHost(_))
    ));

    let err = orch.migrate(&plan("f1", "cache1"), &cancel).await.unwrap_err();
    assert!(matches!(err, MigrationError::AlreadyOnHost { .. }));
    assert_eq!(err.final_state(), None);

    let target = orch.flow_target(&"f1".into()).await.unwrap();
    assert_eq!(target.state, MigrationState::Idle);
    assert_eq!(target.active, Some(b1));
    assert_eq!(orch.provisioner().start_calls().await, 1);
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_redirect_keeps_new_backend() {
    let (orch, b1) = setup_with_backend("f1", "cache1").await;
    orch.redirector().unconfirmed_updates(true).await;

    let err = orch
        .migrate(&plan("f1", "cache2"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        MigrationError::Redirect(RedirectError::Unreverted { .. })
    ));
    assert_eq!(err.final_state(), Some(MigrationState::Failed));

    // the switch may forward to the new backend, so it must keep running
    let target = orch.flow_target(&"f1".into()).await.unwrap();
    let b2 = target.active.clone().unwrap();
    assert_eq!(b2.host, HostRef::new("cache2"));
    assert_eq!(target.state, MigrationState::Failed);
    assert!(orch.provisioner().is_running(&b2.id).await);
    assert!(orch.provisioner().is_running(&b1.id).await);
    assert_eq!(orch.orphans(), vec![b1.clone()]);

    // the next plan stops the old backend, which no longer receives traffic
    orch.redirector().unconfirmed_updates(false).await;
    let outcome = orch
        .migrate(&plan("f1", "cache1"), &CancellationToken::new())
        .await
        .unwrap();
    assert!(!orch.provisioner().is_running(&b1.id).await);
    assert_eq!(outcome.old_backend, Some(b2.clone()));
    assert!(!orch.provisioner().is_running(&b2.id).await);
    assert_eq!(orch.provisioner().running().await, vec![outcome.new_backend]);
}
