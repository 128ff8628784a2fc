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
//! Remove all service containers from the testbed, e.g., after an interrupted run.
use std::{path::PathBuf, process::ExitCode};

use clap::Parser;

use handoff::{backend::HostRef, config::Config, docker::DockerProvisioner, util};

#[derive(Parser, Debug)]
#[command(about, long_about = None)]
struct Args {
    /// Testbed configuration (JSON). Uses the built-in testbed if omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Additional containers to remove. Can be applied multiple times.
    #[arg(short, long, default_values_t = ["streaming_server".to_string(), "test_client".to_string()])]
    extra: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    util::init_logging();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                log::error!("Cannot load {path:?}: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => Config::default(),
    };
    let docker = DockerProvisioner::new(config.testbed.clone(), config.runtime.clone());

    let containers = config
        .testbed
        .caches()
        .map(|h| config.service.instance_name(&HostRef::new(&h.name)))
        .chain(args.extra.iter().cloned());

    // try every container, even if removing one of them fails
    let mut failed = 0;
    for container in containers {
        match docker.remove_container(&container).await {
            Ok(true) => log::info!("Removed {container}"),
            Ok(false) => log::debug!("{container} does not exist"),
            Err(e) => {
                log::error!("Cannot remove {container}: {e}");
                failed += 1;
            }
        }
    }

    if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
