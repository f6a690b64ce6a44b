//! Single-host Docker container driver.
//!
//! One container per deployment. Replica counts above one are not
//! expressible on a single host and are rejected as an invalid spec rather
//! than silently running a single replica; scale-to-zero maps to stopping
//! the container.

use super::{BackendPhase, BackendStatus, ContainerDriver, ContainerSpec, DriverError};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use tracing::{debug, info};

pub struct DockerDriver {
    docker: Docker,
}

impl DockerDriver {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Connect to the local Docker engine (socket or `DOCKER_HOST`).
    pub fn connect() -> Result<Self, DriverError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| DriverError::Connection(e.to_string()))?;
        Ok(Self::new(docker))
    }
}

fn map_docker_error(error: bollard::errors::Error) -> DriverError {
    match error {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => match status_code {
            404 => DriverError::NotFound(message),
            409 => DriverError::Conflict(message),
            400 => DriverError::InvalidSpec(message),
            _ => DriverError::Backend(format!("{message} ({status_code})")),
        },
        bollard::errors::Error::RequestTimeoutError => {
            DriverError::Timeout(std::time::Duration::from_secs(30))
        }
        other => DriverError::Connection(other.to_string()),
    }
}

/// Parse a Kubernetes-style cpu quantity ("500m", "2") into nano-cpus.
fn parse_cpu_limit(value: &str) -> Option<i64> {
    if let Some(millis) = value.strip_suffix('m') {
        millis.parse::<i64>().ok().map(|m| m * 1_000_000)
    } else {
        value.parse::<f64>().ok().map(|cores| {
            // nano_cpus is whole nanocores; fractional cores are fine
            (cores * 1_000_000_000.0) as i64
        })
    }
}

/// Parse a Kubernetes-style memory quantity ("512Mi", "1Gi", "256M") into bytes.
fn parse_memory_limit(value: &str) -> Option<i64> {
    let suffixes: [(&str, i64); 6] = [
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("K", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
    ];
    for (suffix, multiplier) in suffixes {
        if let Some(number) = value.strip_suffix(suffix) {
            return number.parse::<i64>().ok().map(|n| n * multiplier);
        }
    }
    value.parse::<i64>().ok()
}

#[async_trait]
impl ContainerDriver for DockerDriver {
    fn backend_name(&self) -> &'static str {
        "docker"
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, DriverError> {
        if spec.replicas > 1 {
            return Err(DriverError::InvalidSpec(format!(
                "single-host backend cannot run {} replicas",
                spec.replicas
            )));
        }

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect();

        let port_key = format!("{}/tcp", spec.container_port);
        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(port_key.clone(), HashMap::new());
        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            port_key,
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(spec.container_port.to_string()),
            }]),
        );

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(env),
            exposed_ports: Some(exposed_ports),
            labels: Some(spec.labels.clone()),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                nano_cpus: parse_cpu_limit(&spec.cpu_limit),
                memory: parse_memory_limit(&spec.memory_limit),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        match self.docker.create_container(Some(options), config).await {
            Ok(response) => {
                info!(container = %spec.name, id = %response.id, "Created container");
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => {
                // A container with our logical name already exists: adopt it.
                info!(container = %spec.name, "Container already exists, adopting");
            }
            Err(e) => return Err(map_docker_error(e)),
        }

        Ok(spec.name.clone())
    }

    async fn start(&self, handle: &str) -> Result<(), DriverError> {
        match self
            .docker
            .start_container(handle, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => {
                info!(container = %handle, "Started container");
                Ok(())
            }
            // 304: already running
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(map_docker_error(e)),
        }
    }

    async fn stop(&self, handle: &str) -> Result<(), DriverError> {
        match self
            .docker
            .stop_container(handle, Some(StopContainerOptions { t: 10 }))
            .await
        {
            Ok(()) => {
                info!(container = %handle, "Stopped container");
                Ok(())
            }
            // 304: already stopped
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(map_docker_error(e)),
        }
    }

    async fn scale(&self, handle: &str, replicas: i32) -> Result<(), DriverError> {
        match replicas {
            0 => self.stop(handle).await,
            1 => self.start(handle).await,
            n => Err(DriverError::InvalidSpec(format!(
                "single-host backend cannot scale to {n} replicas"
            ))),
        }
    }

    async fn delete(&self, handle: &str) -> Result<(), DriverError> {
        match self
            .docker
            .remove_container(
                handle,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => {
                info!(container = %handle, "Removed container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container = %handle, "Container already gone");
                Ok(())
            }
            Err(e) => Err(map_docker_error(e)),
        }
    }

    async fn get_status(&self, handle: &str) -> Result<BackendStatus, DriverError> {
        let inspection = self
            .docker
            .inspect_container(handle, None::<InspectContainerOptions>)
            .await
            .map_err(map_docker_error)?;

        let state = inspection.state.as_ref();
        let running = state.and_then(|s| s.running).unwrap_or(false);
        let error = state
            .and_then(|s| s.error.clone())
            .filter(|message| !message.is_empty());
        let exited_badly = state
            .and_then(|s| s.exit_code)
            .map(|code| code != 0)
            .unwrap_or(false);

        let (phase, ready, desired) = if running {
            (BackendPhase::Running, 1, 1)
        } else if error.is_some() || exited_badly {
            (BackendPhase::Failed, 0, 1)
        } else {
            (BackendPhase::Stopped, 0, 0)
        };

        Ok(BackendStatus {
            phase,
            replicas_desired: desired,
            replicas_ready: ready,
            message: error,
        })
    }

    async fn stream_logs(&self, handle: &str, tail: i64) -> Result<String, DriverError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.logs(handle, Some(options));
        let mut output = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_docker_error)?;
            output.push_str(&String::from_utf8_lossy(&chunk.into_bytes()));
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_limit() {
        assert_eq!(parse_cpu_limit("500m"), Some(500_000_000));
        assert_eq!(parse_cpu_limit("2"), Some(2_000_000_000));
        assert_eq!(parse_cpu_limit("0.5"), Some(500_000_000));
        assert_eq!(parse_cpu_limit("garbage"), None);
    }

    #[test]
    fn test_parse_memory_limit() {
        assert_eq!(parse_memory_limit("512Mi"), Some(512 * (1 << 20)));
        assert_eq!(parse_memory_limit("1Gi"), Some(1 << 30));
        assert_eq!(parse_memory_limit("256M"), Some(256_000_000));
        assert_eq!(parse_memory_limit("1024"), Some(1024));
        assert_eq!(parse_memory_limit("lots"), None);
    }
}
