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
//! Backend provisioner that runs the service as a Docker container inside the network namespace
//! of an emulated host.

use std::{collections::HashMap, time::Duration};

use tokio::{net::TcpStream, sync::Mutex};

use crate::{
    backend::{BackendHandle, BackendId, HostRef, RequestId, ServiceSpec},
    config::{ReadinessProbe, RuntimeConfig},
    provisioner::{BackendProvisioner, ProvisionError, ReadyError, StopError},
    topology::Testbed,
    util::{run_command, CommandError},
};

const REQUEST_LABEL: &str = "handoff.request";

pub struct DockerProvisioner {
    testbed: Testbed,
    config: RuntimeConfig,
    requests: Mutex<HashMap<RequestId, BackendHandle>>,
}

impl DockerProvisioner {
    pub fn new(testbed: Testbed, config: RuntimeConfig) -> Self {
        Self {
            testbed,
            config,
            requests: Mutex::new(HashMap::new()),
        }
    }

    async fn docker<I, S>(&self, args: I) -> Result<String, CommandError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        run_command(&self.config.docker, args).await
    }

    /// Field of `docker inspect` for a container, or `None` if the container does not exist.
    async fn inspect(&self, container: &str, format: &str) -> Result<Option<String>, CommandError> {
        match self.docker(["inspect", "-f", format, container]).await {
            Ok(out) => Ok(Some(out)),
            Err(e) if e.stderr().is_some_and(is_missing) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn is_running(&self, container: &str) -> Result<bool, CommandError> {
        Ok(self
            .inspect(container, "{{.State.Running}}")
            .await?
            .is_some_and(|s| s == "true"))
    }

    fn host_container(&self, host: &HostRef) -> String {
        format!("{}{}", self.config.host_prefix, host)
    }

    /// Remove a container by name or id. Returns `false` if it did not exist.
    pub async fn remove_container(&self, container: &str) -> Result<bool, StopError> {
        match self.docker(["rm", "-f", container]).await {
            Ok(_) => Ok(true),
            Err(e) if e.stderr().is_some_and(is_missing) => Ok(false),
            Err(CommandError::Failed { stderr, .. }) => Err(StopError::Refused {
                instance: container.to_string(),
                reason: stderr,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Take over an existing container if it was started for the same request.
    async fn adopt(
        &self,
        name: &str,
        request: &RequestId,
        host: &HostRef,
        endpoint: std::net::SocketAddr,
    ) -> Result<BackendHandle, ProvisionError> {
        let format = format!("{{{{.Id}}}} {{{{index .Config.Labels \"{REQUEST_LABEL}\"}}}}");
        let info = self.inspect(name, &format).await?.unwrap_or_default();
        match info.split_once(' ') {
            Some((id, label)) if label == request.as_str() => {
                log::debug!("Container {name} was already started for request {request}");
                Ok(BackendHandle::new(short_id(id), host.clone(), endpoint))
            }
            _ => Err(ProvisionError::NameConflict(name.to_string())),
        }
    }

    async fn probe(&self, handle: &BackendHandle) -> Result<bool, CommandError> {
        if !self.is_running(handle.id.as_str()).await? {
            return Ok(false);
        }
        Ok(match &self.config.probe {
            ReadinessProbe::Running => true,
            ReadinessProbe::Tcp => TcpStream::connect(handle.endpoint).await.is_ok(),
            ReadinessProbe::Exec(cmd) => {
                let mut args = vec!["exec".to_string(), handle.id.to_string()];
                args.extend(cmd.iter().cloned());
                self.docker(args).await.is_ok()
            }
        })
    }
}

fn is_missing(stderr: &str) -> bool {
    stderr.contains("No such container") || stderr.contains("No such object")
}

fn short_id(id: &str) -> BackendId {
    BackendId::new(id.chars().take(12).collect::<String>())
}

#[async_trait::async_trait]
impl BackendProvisioner for DockerProvisioner {
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

        let known = self.requests.lock().await.get(request).cloned();
        if let Some(handle) = known {
            if self.is_running(handle.id.as_str()).await? {
                return Ok(handle);
            }
        }

        let host_container = self.host_container(host);
        if !self.is_running(&host_container).await? {
            return Err(ProvisionError::HostUnreachable(host.clone()));
        }

        let name = spec.instance_name(host);
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            name.clone(),
            "--network".to_string(),
            format!("container:{host_container}"),
            "--label".to_string(),
            format!("{REQUEST_LABEL}={request}"),
            spec.image.clone(),
        ];
        args.extend(spec.args.iter().cloned());

        log::info!("Deploy {} on {host} as {name}", spec.image);
        let handle = match self.docker(args).await {
            Ok(id) => BackendHandle::new(short_id(&id), host.clone(), endpoint),
            Err(e) if e.stderr().is_some_and(|s| s.contains("is already in use")) => {
                self.adopt(&name, request, host, endpoint).await?
            }
            Err(CommandError::Failed { stderr, .. }) => {
                return Err(ProvisionError::Rejected {
                    host: host.clone(),
                    reason: stderr,
                })
            }
            Err(e) => return Err(e.into()),
        };

        self.requests
            .lock()
            .await
            .insert(request.clone(), handle.clone());
        Ok(handle)
    }

    async fn wait_ready(
        &self,
        handle: &BackendHandle,
        timeout: Duration,
    ) -> Result<(), ReadyError> {
        let poll = async {
            loop {
                match self.probe(handle).await {
                    Ok(true) => return,
                    Ok(false) => {}
                    Err(e) => log::debug!("Readiness probe of {handle} failed: {e}"),
                }
                tokio::time::sleep(self.config.poll_interval).await;
            }
        };
        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| ReadyError::TimedOut(timeout))
    }

    async fn stop(&self, handle: &BackendHandle) -> Result<(), StopError> {
        if self.remove_container(handle.id.as_str()).await? {
            log::info!("Removed backend {handle}");
        } else {
            log::debug!("Backend {handle} was already removed");
        }
        self.requests.lock().await.retain(|_, h| *h != *handle);
        Ok(())
    }
}
