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
//! Migrate the cache service of the testbed back and forth between the cache hosts.
use std::{path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

use anyhow::{bail, Context};
use clap::Parser;
use itertools::Itertools;
use tokio::{task::JoinSet, time::Instant};
use tokio_util::sync::CancellationToken;

use handoff::{
    backend::FlowId,
    config::Config,
    docker::DockerProvisioner,
    emulated::{EmulatedRuntime, EmulatedSwitch},
    orchestrator::{MigrationOrchestrator, MigrationPlan},
    ovs::OvsRedirector,
    provisioner::BackendProvisioner,
    records::{MigrationRecord, RecordWriter},
    redirector::TrafficRedirector,
    topology::Testbed,
    util,
};
use handoff_utils::other::{get_time_of_day, secs_str};

#[derive(Parser, Debug)]
#[command(about, long_about = None)]
struct Args {
    /// Testbed configuration (JSON). Uses the built-in testbed if omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Only migrate the given flow. Can be applied multiple times.
    #[arg(short, long)]
    flow: Vec<String>,
    /// Number of migrations after the initial deployment.
    #[arg(short, long, default_value_t = 2)]
    rounds: usize,
    /// Seconds to wait before each migration.
    #[arg(short, long, default_value_t = 30.0)]
    interval: f64,
    /// Overwrite the readiness timeout of the configuration, in seconds.
    #[arg(long)]
    readiness_timeout: Option<f64>,
    /// Overwrite the drain grace period of the configuration, in seconds.
    #[arg(long)]
    drain_grace: Option<f64>,
    /// Use the in-memory runtime and switch instead of docker and Open vSwitch.
    #[arg(long)]
    emulate: bool,
    /// Prefix of the CSV file recording all migrations.
    #[arg(short, long, default_value = "./data/migrations")]
    out: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    util::init_logging();
    let args = Args::parse();

    match run(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => {
            log::error!("At least one migration failed.");
            ExitCode::FAILURE
        }
        Err(e) => {
            log::error!("{e:?}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<bool> {
    let mut config = match &args.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {path:?}"))?,
        None => Config::default(),
    };
    if let Some(secs) = args.readiness_timeout {
        config.migration.readiness_timeout = Duration::try_from_secs_f64(secs)?;
    }
    if let Some(secs) = args.drain_grace {
        config.migration.drain_grace = Duration::try_from_secs_f64(secs)?;
    }
    let interval = Duration::try_from_secs_f64(args.interval)?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("Interrupted, finishing the running migrations...");
                cancel.cancel();
            }
        });
    }

    if args.emulate {
        log::info!("Running on the emulated runtime and switch");
        let runtime = EmulatedRuntime::new(config.testbed.clone());
        let switch = EmulatedSwitch::new(config.flows.iter().map(|f| f.id.clone()));
        let orch = MigrationOrchestrator::new(
            runtime,
            switch,
            config.testbed.clone(),
            config.service.clone(),
        );
        drive(orch, &config, &args, interval, cancel).await
    } else {
        let provisioner = DockerProvisioner::new(config.testbed.clone(), config.runtime.clone());
        let redirector = OvsRedirector::new(&config);
        let orch = MigrationOrchestrator::new(
            provisioner,
            redirector,
            config.testbed.clone(),
            config.service.clone(),
        );
        drive(orch, &config, &args, interval, cancel).await
    }
}

async fn drive<P, R>(
    orch: MigrationOrchestrator<P, R, Testbed>,
    config: &Config,
    args: &Args,
    interval: Duration,
    cancel: CancellationToken,
) -> anyhow::Result<bool>
where
    P: BackendProvisioner + 'static,
    R: TrafficRedirector + 'static,
{
    let orch = Arc::new(orch.with_backoff(config.migration.backoff));

    let flows = config
        .flows
        .iter()
        .filter(|f| args.flow.is_empty() || args.flow.contains(&f.id.to_string()))
        .collect_vec();
    if let Some(unknown) = args
        .flow
        .iter()
        .find(|name| config.flow(&FlowId::new(name.as_str())).is_none())
    {
        bail!("flow {unknown} is not part of the configuration");
    }
    for flow in &flows {
        orch.register_flow(flow.id.clone()).await?;
    }

    let caches = config.testbed.caches().map(|h| h.name.clone()).collect_vec();
    if caches.len() < 2 {
        bail!("the testbed needs at least two cache hosts, found {caches:?}");
    }

    let mut writer = RecordWriter::create(&args.out)?;
    log::info!("Recording migrations to {:?}", writer.path());
    let mut all_ok = true;

    for round in 0..=args.rounds {
        if round > 0 {
            log::info!(
                "{}: Starting migration {round}/{} in {interval:?}...",
                get_time_of_day(),
                args.rounds
            );
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => break,
            }
        }

        let mut tasks = JoinSet::new();
        for flow in &flows {
            let current = orch
                .flow_target(&flow.id)
                .await
                .and_then(|t| t.active)
                .map(|h| h.host.to_string());
            let target = match &current {
                // round 0 deploys the flows that have no backend yet
                None => flow.initial_host.clone(),
                Some(_) if round == 0 => continue,
                Some(host) => next_cache(&caches, host),
            };
            let plan = MigrationPlan::new(
                flow.id.clone(),
                target,
                config.migration.readiness_timeout,
                config.migration.drain_grace,
            );
            let orch = orch.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let start = Instant::now();
                let result = orch.migrate(&plan, &cancel).await;
                (plan, current, result, start.elapsed())
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (plan, from, result, elapsed) = joined?;
            match &result {
                Ok(outcome) => log::info!(
                    "{}: Migration of flow {} to {} took {}s (switched after {}s)",
                    get_time_of_day(),
                    plan.flow,
                    plan.target_host,
                    secs_str(outcome.elapsed),
                    secs_str(outcome.switched_after),
                ),
                Err(e) => log::error!(
                    "{}: Migration of flow {} to {} failed after {}s: {e}",
                    get_time_of_day(),
                    plan.flow,
                    plan.target_host,
                    secs_str(elapsed),
                ),
            }
            let record = MigrationRecord::new(round, &plan, from, &result, elapsed);
            all_ok &= record.succeeded();
            writer.write(&record)?;
        }
    }

    for target in orch.flows().await {
        log::info!(
            "Flow {} is {} on {}",
            target.flow,
            target.state,
            target
                .active
                .map(|h| h.to_string())
                .unwrap_or_else(|| "no backend".to_string())
        );
    }
    Ok(all_ok)
}

/// The cache host after `current`, wrapping around.
fn next_cache(caches: &[String], current: &str) -> String {
    let pos = caches.iter().position(|c| c == current).unwrap_or(caches.len() - 1);
    caches[(pos + 1) % caches.len()].clone()
}
