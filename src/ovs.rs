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
//! Traffic redirector programming an Open vSwitch bridge with `ovs-ofctl`.
//!
//! A flow is mapped to the OpenFlow rules `in_port=<ingress>,actions=output:<backend port>`, one
//! per ingress interface. Redirecting modifies the actions of the existing rules in place, such
//! that there is never a moment without a rule. Flows with several ingress interfaces are updated
//! in a single bundle, which the switch applies atomically.
//!
//! After an update, the installed rules are read back. If they cannot be confirmed, the previous
//! rules are restored. Targets installed by an earlier run are read from the switch; the backend
//! is then identified by its instance name.

use std::collections::HashMap;

use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use tokio::sync::Mutex;

use crate::{
    backend::{BackendHandle, FlowId, HostRef, ServiceSpec},
    config::{Config, SwitchConfig},
    redirector::{RedirectError, TrafficRedirector},
    topology::Testbed,
    util::{run_command, run_command_with_input, CommandError},
};

lazy_static! {
    static ref OUTPUT_ACTION: Regex = Regex::new(r"actions=output:(?P<port>\d+)").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Update {
    Add,
    Modify,
    Delete,
}

impl Update {
    fn command(self, bundle: bool) -> &'static str {
        match (self, bundle) {
            (Self::Add, false) => "add-flow",
            (Self::Add, true) => "add-flows",
            (Self::Modify, _) => "mod-flows",
            (Self::Delete, _) => "del-flows",
        }
    }
}

pub struct OvsRedirector {
    bridge: String,
    config: SwitchConfig,
    testbed: Testbed,
    service: ServiceSpec,
    flows: HashMap<FlowId, Vec<String>>,
    ports: Mutex<HashMap<String, u32>>,
    targets: Mutex<HashMap<FlowId, BackendHandle>>,
}

impl OvsRedirector {
    pub fn new(config: &Config) -> Self {
        Self {
            bridge: config.testbed.switch.clone(),
            config: config.switch.clone(),
            testbed: config.testbed.clone(),
            service: config.service.clone(),
            flows: config
                .flows
                .iter()
                .map(|f| (f.id.clone(), f.ingress.clone()))
                .collect(),
            ports: Mutex::new(HashMap::new()),
            targets: Mutex::new(HashMap::new()),
        }
    }

    /// OpenFlow port number of a switch interface.
    pub async fn ofport(&self, interface: &str) -> Result<u32, RedirectError> {
        if let Some(port) = self.ports.lock().await.get(interface) {
            return Ok(*port);
        }
        let out = run_command(
            &self.config.ovs_vsctl,
            ["get", "Interface", interface, "ofport"],
        )
        .await
        .map_err(classify)?;
        let port = parse_ofport(&out).ok_or_else(|| {
            RedirectError::DeviceNotReady(format!("{interface} has no OpenFlow port yet ({out})"))
        })?;
        log::debug!("{interface} is OpenFlow port {port}");
        self.ports.lock().await.insert(interface.to_string(), port);
        Ok(port)
    }

    fn ingress(&self, flow: &FlowId) -> Result<&[String], RedirectError> {
        self.flows
            .get(flow)
            .map(Vec::as_slice)
            .ok_or_else(|| RedirectError::UnknownFlow(flow.clone()))
    }

    /// Port of the switch interface facing `host`.
    async fn host_port(&self, host: &HostRef) -> Result<u32, RedirectError> {
        let interface = self
            .testbed
            .host(host.as_str())
            .map(|h| h.switch_interface.as_str())
            .ok_or_else(|| RedirectError::UnknownHost(host.clone()))?;
        self.ofport(interface).await
    }

    /// Cache host behind `port`, if any.
    async fn host_behind(&self, port: u32) -> Result<Option<HostRef>, RedirectError> {
        for host in self.testbed.caches() {
            if self.ofport(&host.switch_interface).await? == port {
                return Ok(Some(HostRef::new(&host.name)));
            }
        }
        Ok(None)
    }

    /// Output ports of the rules currently installed for `in_port`.
    async fn installed_outputs(&self, in_port: u32) -> Result<Vec<u32>, RedirectError> {
        let out = run_command(
            &self.config.ovs_ofctl,
            [
                "--no-names".to_string(),
                "dump-flows".to_string(),
                self.bridge.clone(),
                format!("in_port={in_port}"),
            ],
        )
        .await
        .map_err(classify)?;
        Ok(parse_output_ports(&out))
    }

    /// Backend the switch forwards `flow` to, identified from the installed rules.
    async fn read_target(&self, flow: &FlowId) -> Result<Option<BackendHandle>, RedirectError> {
        let Some(interface) = self.ingress(flow)?.first() else {
            return Ok(None);
        };
        let in_port = self.ofport(interface).await?;
        let Some(out_port) = self.installed_outputs(in_port).await?.first().copied() else {
            return Ok(None);
        };
        let Some(host) = self.host_behind(out_port).await? else {
            log::warn!("Flow {flow} forwards to port {out_port}, which leads to no cache host");
            return Ok(None);
        };
        let endpoint = self
            .testbed
            .endpoint(&host, self.service.port)
            .map_err(|_| RedirectError::UnknownHost(host.clone()))?;
        Ok(Some(BackendHandle::new(
            self.service.instance_name(&host),
            host,
            endpoint,
        )))
    }

    async fn apply(&self, update: Update, rules: &[String]) -> Result<(), RedirectError> {
        let ofctl = &self.config.ovs_ofctl;
        let result = match rules {
            [rule] => {
                run_command(
                    ofctl,
                    [update.command(false), self.bridge.as_str(), rule.as_str()],
                )
                .await
            }
            _ => {
                let input = rules.iter().join("\n");
                run_command_with_input(
                    ofctl,
                    [
                        "-O",
                        self.config.openflow_version.as_str(),
                        "--bundle",
                        update.command(true),
                        self.bridge.as_str(),
                        "-",
                    ],
                    Some(&input),
                )
                .await
            }
        };
        result.map(|_| ()).map_err(classify)
    }

    /// Check that every ingress port forwards to `out_port`.
    async fn confirm(
        &self,
        flow: &FlowId,
        in_ports: &[u32],
        out_port: u32,
    ) -> Result<(), RedirectError> {
        if !self.config.verify {
            return Ok(());
        }
        for in_port in in_ports {
            let outputs = self.installed_outputs(*in_port).await?;
            if outputs != [out_port] {
                return Err(RedirectError::Verification {
                    flow: flow.clone(),
                    expected: format!("output:{out_port}"),
                    found: outputs.iter().map(|p| format!("output:{p}")).join(","),
                });
            }
        }
        Ok(())
    }

    /// Restore the rules of `previous`, or remove the rules if the flow had no target.
    async fn revert(
        &self,
        in_ports: &[u32],
        previous: Option<&BackendHandle>,
    ) -> Result<(), RedirectError> {
        match previous {
            Some(previous) => {
                let out_port = self.host_port(&previous.host).await?;
                let rules = in_ports.iter().map(|p| flow_rule(*p, out_port)).collect_vec();
                self.apply(Update::Modify, &rules).await
            }
            None => {
                let matches = in_ports.iter().map(|p| format!("in_port={p}")).collect_vec();
                self.apply(Update::Delete, &matches).await
            }
        }
    }
}

/// Rule forwarding everything entering at `in_port` to `out_port`.
pub fn flow_rule(in_port: u32, out_port: u32) -> String {
    format!("in_port={in_port},actions=output:{out_port}")
}

/// Parse the output of `ovs-vsctl get Interface <ifce> ofport`. Interfaces that are not attached
/// yet report `[]` or `-1`.
pub fn parse_ofport(s: &str) -> Option<u32> {
    s.trim().parse::<i64>().ok().and_then(|p| u32::try_from(p).ok()).filter(|p| *p > 0)
}

/// Output ports of all rules in the output of `ovs-ofctl dump-flows`.
pub fn parse_output_ports(dump: &str) -> Vec<u32> {
    OUTPUT_ACTION
        .captures_iter(dump)
        .filter_map(|c| c.name("port")?.as_str().parse().ok())
        .collect()
}

/// Map a failed control-plane command to a `RedirectError`. Failures to reach the switch mean
/// that it is not ready yet.
fn classify(e: CommandError) -> RedirectError {
    const NOT_READY: [&str; 5] = [
        "is not a bridge or a socket",
        "Connection refused",
        "failed to connect",
        "database connection failed",
        "no row",
    ];
    match e {
        CommandError::Failed { ref stderr, .. } if NOT_READY.iter().any(|m| stderr.contains(m)) => {
            RedirectError::DeviceNotReady(stderr.clone())
        }
        CommandError::Failed { stderr, .. } => RedirectError::Rejected(stderr),
        e => RedirectError::Command(e),
    }
}

#[async_trait::async_trait]
impl TrafficRedirector for OvsRedirector {
    async fn get_target(&self, flow: &FlowId) -> Result<Option<BackendHandle>, RedirectError> {
        self.ingress(flow)?;
        if let Some(handle) = self.targets.lock().await.get(flow) {
            return Ok(Some(handle.clone()));
        }
        let Some(handle) = self.read_target(flow).await? else {
            return Ok(None);
        };
        log::info!("Flow {flow} already forwards to {handle}");
        Ok(Some(
            self.targets
                .lock()
                .await
                .entry(flow.clone())
                .or_insert(handle)
                .clone(),
        ))
    }

    async fn set_target(
        &self,
        flow: &FlowId,
        handle: &BackendHandle,
    ) -> Result<(), RedirectError> {
        let ingress = self.ingress(flow)?;
        // resolve all ports before touching any rule
        let out_port = self.host_port(&handle.host).await?;
        let mut in_ports = Vec::with_capacity(ingress.len());
        for interface in ingress {
            in_ports.push(self.ofport(interface).await?);
        }
        let previous = self.get_target(flow).await?;
        let rules = in_ports
            .iter()
            .map(|in_port| flow_rule(*in_port, out_port))
            .collect_vec();

        let update = if previous.is_some() {
            Update::Modify
        } else {
            Update::Add
        };
        log::debug!(
            "{update:?} flow {flow} on {}: {}",
            self.bridge,
            rules.iter().join("; ")
        );
        self.apply(update, &rules).await?;

        if let Err(e) = self.confirm(flow, &in_ports, out_port).await {
            log::warn!("Cannot confirm the update of flow {flow}, reverting it: {e}");
            if let Err(revert) = self.revert(&in_ports, previous.as_ref()).await {
                log::error!("Cannot revert the update of flow {flow}: {revert}");
                self.targets
                    .lock()
                    .await
                    .insert(flow.clone(), handle.clone());
                return Err(RedirectError::Unreverted {
                    flow: flow.clone(),
                    reason: format!("{e}; revert failed: {revert}"),
                });
            }
            return Err(e);
        }

        self.targets
            .lock()
            .await
            .insert(flow.clone(), handle.clone());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::{
        fs,
        path::{Path, PathBuf},
        time::Duration,
    };

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{
        backend::BackendId,
        emulated::EmulatedRuntime,
        orchestrator::{MigrationError, MigrationOrchestrator, MigrationPlan},
        retry::Backoff,
        test::{fake_command, init_logging, scratch_dir},
    };

    #[test]
    fn test_flow_rule() {
        assert_eq!(flow_rule(4, 2), "in_port=4,actions=output:2");
    }

    #[test]
    fn test_parse_ofport() {
        assert_eq!(parse_ofport("3\n"), Some(3));
        assert_eq!(parse_ofport("[]"), None);
        assert_eq!(parse_ofport("-1"), None);
        assert_eq!(parse_ofport("0"), None);
    }

    #[test]
    fn test_parse_dump_flows() {
        let dump = "NXST_FLOW reply (xid=0x4):\n \
            cookie=0x0, duration=12.5s, table=0, n_packets=8, n_bytes=648, idle_age=1, in_port=4 actions=output:3\n";
        assert_eq!(parse_output_ports(dump), vec![3]);
        let dump = " cookie=0x0, duration=1.2s, table=0, n_packets=0, n_bytes=0, in_port=4,actions=output:3\n";
        assert_eq!(parse_output_ports(dump), vec![3]);
        assert_eq!(parse_output_ports("NXST_FLOW reply (xid=0x4):"), Vec::<u32>::new());
    }

    #[test]
    fn test_classify() {
        let not_ready = CommandError::Failed {
            command: "ovs-ofctl mod-flows s1 -".to_string(),
            code: Some(1),
            stderr: "ovs-ofctl: s1 is not a bridge or a socket".to_string(),
        };
        assert!(classify(not_ready).is_device_not_ready());

        let rejected = CommandError::Failed {
            command: "ovs-ofctl mod-flows s1 -".to_string(),
            code: Some(1),
            stderr: "ovs-ofctl: unknown keyword actoins".to_string(),
        };
        assert!(matches!(classify(rejected), RedirectError::Rejected(_)));
    }

    /// Stand-in for `ovs-ofctl` that keeps the output port of the installed rules in `port` and
    /// logs every invocation to `ofctl.log`. Touching `fail-dump` makes `dump-flows` fail, and
    /// with `stuck` also every later update. `wrong-port` overrides the port that is dumped.
    const FAKE_OFCTL: &str = r#"#!/bin/sh
dir=$(dirname "$0")
for last; do :; done
if [ "$last" = "-" ]; then rules=$(cat); else rules=$last; fi
echo "$* $(echo $rules)" >> "$dir/ofctl.log"
case " $* " in
*" dump-flows "*)
    if [ -e "$dir/fail-dump" ]; then
        if [ -e "$dir/stuck" ]; then touch "$dir/fail-update"; fi
        echo "ovs-ofctl: s1: protocol error" >&2
        exit 1
    fi
    echo "NXST_FLOW reply (xid=0x4):"
    if [ -e "$dir/port" ]; then
        out=$(cat "$dir/port")
        if [ -e "$dir/wrong-port" ]; then out=$(cat "$dir/wrong-port"); fi
        echo " cookie=0x0, table=0, n_packets=0, $last actions=output:$out"
    fi
    ;;
*)
    if [ -e "$dir/fail-update" ]; then
        echo "ovs-ofctl: s1: protocol error" >&2
        exit 1
    fi
    case " $* " in
    *" del-flows "*) rm -f "$dir/port" ;;
    *) echo "$rules" | sed -n 's/.*actions=output:\([0-9]*\).*/\1/p' | head -n 1 > "$dir/port" ;;
    esac
    ;;
esac
"#;

    const FAKE_VSCTL: &str = r#"#!/bin/sh
case "$3" in
s1-server) echo 1 ;;
s1-cache1) echo 2 ;;
s1-cache2) echo 3 ;;
s1-client) echo 4 ;;
*) echo "ovs-vsctl: no row \"$3\" in table Interface" >&2; exit 1 ;;
esac
"#;

    fn fake_switch(name: &str, ingress: &[&str]) -> (OvsRedirector, PathBuf) {
        init_logging();
        let dir = scratch_dir(name);
        let mut config = Config::default();
        config.switch.ovs_ofctl = fake_command(&dir, "ovs-ofctl", FAKE_OFCTL);
        config.switch.ovs_vsctl = fake_command(&dir, "ovs-vsctl", FAKE_VSCTL);
        config.flows[0].ingress = ingress.iter().map(|i| i.to_string()).collect();
        (OvsRedirector::new(&config), dir)
    }

    fn ofctl_calls(dir: &Path) -> Vec<String> {
        fs::read_to_string(dir.join("ofctl.log"))
            .unwrap_or_default()
            .lines()
            .map(String::from)
            .collect()
    }

    fn installed_port(dir: &Path) -> Option<u32> {
        fs::read_to_string(dir.join("port"))
            .ok()
            .and_then(|p| p.trim().parse().ok())
    }

    fn backend(host: &str) -> BackendHandle {
        BackendHandle::new(format!("b-{host}"), host, "10.0.0.12:80".parse().unwrap())
    }

    const BOTH: [&str; 2] = ["s1-client", "s1-server"];

    #[tokio::test]
    async fn test_add_then_modify_in_bundle() {
        let (ovs, dir) = fake_switch("ovs-bundle", &BOTH);
        let flow = FlowId::new("cache");
        assert_eq!(ovs.get_target(&flow).await.unwrap(), None);

        ovs.set_target(&flow, &backend("cache1")).await.unwrap();
        assert_eq!(installed_port(&dir), Some(2));
        ovs.set_target(&flow, &backend("cache2")).await.unwrap();
        assert_eq!(installed_port(&dir), Some(3));
        assert_eq!(ovs.get_target(&flow).await.unwrap(), Some(backend("cache2")));

        let updates = ofctl_calls(&dir)
            .into_iter()
            .filter(|c| !c.contains("dump-flows"))
            .collect_vec();
        assert_eq!(
            updates,
            vec![
                "-O OpenFlow14 --bundle add-flows s1 - in_port=4,actions=output:2 in_port=1,actions=output:2",
                "-O OpenFlow14 --bundle mod-flows s1 - in_port=4,actions=output:3 in_port=1,actions=output:3",
            ]
        );
        // both ingress ports are read back after each update
        assert!(ofctl_calls(&dir)
            .iter()
            .any(|c| c.starts_with("--no-names dump-flows s1 in_port=1")));
    }

    #[tokio::test]
    async fn test_single_ingress_without_bundle() {
        let (ovs, dir) = fake_switch("ovs-single", &["s1-client"]);
        let flow = FlowId::new("cache");
        ovs.set_target(&flow, &backend("cache1")).await.unwrap();
        ovs.set_target(&flow, &backend("cache2")).await.unwrap();

        let calls = ofctl_calls(&dir);
        assert!(calls
            .iter()
            .any(|c| c.starts_with("add-flow s1 in_port=4,actions=output:2")));
        assert!(calls
            .iter()
            .any(|c| c.starts_with("mod-flows s1 in_port=4,actions=output:3")));
        assert!(!calls.iter().any(|c| c.contains("--bundle")));
        assert_eq!(installed_port(&dir), Some(3));
    }

    #[tokio::test]
    async fn test_unconfirmed_update_is_reverted() {
        let (ovs, dir) = fake_switch("ovs-revert", &BOTH);
        let flow = FlowId::new("cache");
        ovs.set_target(&flow, &backend("cache1")).await.unwrap();

        fs::write(dir.join("fail-dump"), "").unwrap();
        let err = ovs.set_target(&flow, &backend("cache2")).await.unwrap_err();
        assert!(matches!(err, RedirectError::Rejected(_)));
        assert!(!err.may_be_applied());
        // the rules of the previous target are back in place
        assert_eq!(installed_port(&dir), Some(2));
        assert!(ofctl_calls(&dir)
            .last()
            .unwrap()
            .starts_with("-O OpenFlow14 --bundle mod-flows s1 - in_port=4,actions=output:2"));

        fs::remove_file(dir.join("fail-dump")).unwrap();
        assert_eq!(ovs.get_target(&flow).await.unwrap(), Some(backend("cache1")));
    }

    #[tokio::test]
    async fn test_failed_revert_keeps_new_target() {
        let (ovs, dir) = fake_switch("ovs-unreverted", &BOTH);
        let flow = FlowId::new("cache");
        ovs.set_target(&flow, &backend("cache1")).await.unwrap();

        fs::write(dir.join("fail-dump"), "").unwrap();
        fs::write(dir.join("stuck"), "").unwrap();
        let err = ovs.set_target(&flow, &backend("cache2")).await.unwrap_err();
        assert!(matches!(err, RedirectError::Unreverted { .. }));
        assert!(err.may_be_applied());
        assert_eq!(installed_port(&dir), Some(3));
        assert_eq!(ovs.get_target(&flow).await.unwrap(), Some(backend("cache2")));
    }

    #[tokio::test]
    async fn test_wrong_first_assignment_is_removed() {
        let (ovs, dir) = fake_switch("ovs-remove", &BOTH);
        let flow = FlowId::new("cache");
        fs::write(dir.join("wrong-port"), "9").unwrap();

        let err = ovs.set_target(&flow, &backend("cache1")).await.unwrap_err();
        assert!(matches!(err, RedirectError::Verification { .. }));
        assert_eq!(installed_port(&dir), None);
        assert!(ofctl_calls(&dir)
            .last()
            .unwrap()
            .starts_with("-O OpenFlow14 --bundle del-flows s1 - in_port=4 in_port=1"));
        assert_eq!(ovs.get_target(&flow).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_target_read_from_switch() {
        let (ovs, dir) = fake_switch("ovs-readback", &BOTH);
        let flow = FlowId::new("cache");
        // rules left behind by an earlier run
        fs::write(dir.join("port"), "3\n").unwrap();

        let handle = ovs.get_target(&flow).await.unwrap().unwrap();
        assert_eq!(handle.id, BackendId::new("cache_server_cache2"));
        assert_eq!(handle.host, HostRef::new("cache2"));
        assert_eq!(handle.endpoint, "10.0.0.12:80".parse().unwrap());

        // the existing rules are modified, not added
        ovs.set_target(&flow, &backend("cache1")).await.unwrap();
        assert!(ofctl_calls(&dir).iter().any(|c| c.contains("--bundle mod-flows")));
        assert!(!ofctl_calls(&dir).iter().any(|c| c.contains("add-flows")));
    }

    #[tokio::test]
    async fn test_unknown_flow_and_host() {
        let (ovs, dir) = fake_switch("ovs-unknown", &BOTH);
        assert!(matches!(
            ovs.get_target(&"video".into()).await,
            Err(RedirectError::UnknownFlow(_))
        ));
        let err = ovs
            .set_target(&"cache".into(), &backend("cache9"))
            .await
            .unwrap_err();
        assert!(matches!(err, RedirectError::UnknownHost(_)));
        assert!(ofctl_calls(&dir).is_empty());

        // an interface the switch does not know yet
        let (ovs, _) = fake_switch("ovs-unattached", &["s1-video"]);
        assert!(ovs
            .get_target(&"cache".into())
            .await
            .unwrap_err()
            .is_device_not_ready());
    }

    #[tokio::test]
    async fn test_migration_rolled_back_on_switch() {
        let (ovs, dir) = fake_switch("ovs-migration", &BOTH);
        let runtime = EmulatedRuntime::new(Testbed::default());
        runtime.set_ready_delay(Duration::from_millis(10)).await;
        let orch =
            MigrationOrchestrator::new(runtime, ovs, Testbed::default(), ServiceSpec::default())
                .with_backoff(Backoff::none());
        orch.register_flow("cache").await.unwrap();
        let plan = |host: &str| {
            MigrationPlan::new("cache", host, Duration::from_secs(1), Duration::from_millis(10))
        };

        let first = orch
            .migrate(&plan("cache1"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(installed_port(&dir), Some(2));

        fs::write(dir.join("fail-dump"), "").unwrap();
        let err = orch
            .migrate(&plan("cache2"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MigrationError::Redirect(RedirectError::Rejected(_))
        ));
        assert_eq!(installed_port(&dir), Some(2));
        let target = orch.flow_target(&"cache".into()).await.unwrap();
        assert_eq!(target.active, Some(first.new_backend.clone()));
        assert_eq!(orch.provisioner().running().await, vec![first.new_backend]);
    }
}
