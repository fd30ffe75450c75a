//! Container runtime seam and its Docker Engine implementation

use async_trait::async_trait;
use bollard::container::{
    InspectContainerOptions, RestartContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::Docker;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Failure reported by a container runtime
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("container '{0}' not found")]
    NotFound(String),

    #[error("container runtime error: {0}")]
    Runtime(String),
}

/// The three capabilities the proxy needs from a container runtime,
/// plus restart for the management API.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Start a stopped container. Starting a running container is not an error.
    async fn start(&self, container: &str) -> Result<(), RuntimeError>;

    /// Stop a container. Stopping a stopped container is not an error.
    async fn stop(&self, container: &str) -> Result<(), RuntimeError>;

    /// Stop then start a container
    async fn restart(&self, container: &str) -> Result<(), RuntimeError>;

    /// Whether the container is currently running. Inspection failures read as false.
    async fn is_running(&self, container: &str) -> bool;
}

pub type SharedRuntime = Arc<dyn ContainerRuntime>;

/// Manages containers through the Docker Engine API
pub struct DockerRuntime {
    client: Docker,
    stop_timeout: Duration,
}

impl DockerRuntime {
    /// Connect to the Docker daemon
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable / local defaults
    pub async fn connect(docker_host: Option<&str>, stop_timeout: Duration) -> anyhow::Result<Self> {
        let client = match docker_host {
            Some(host) => Self::connect_to_host(host).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to Docker at '{}': {}. \
                     Ensure Docker is running and the socket path is correct.",
                    host,
                    e
                )
            })?,
            None => Docker::connect_with_local_defaults()
                .map_err(|e| anyhow::anyhow!("Cannot connect to Docker daemon: {}", e))?,
        };

        // A daemon that is briefly down is not fatal: inspection reads as
        // "stopped" and starts fail until it comes back.
        match client.ping().await {
            Ok(_) => debug!("Connected to Docker daemon"),
            Err(e) => warn!(
                error = %e,
                "Docker daemon is not responding, containers will read as stopped until it is"
            ),
        }

        Ok(Self { client, stop_timeout })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    fn stop_secs(&self) -> isize {
        self.stop_timeout.as_secs() as isize
    }
}

fn map_error(container: &str, err: bollard::errors::Error) -> RuntimeError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(container.to_string()),
        other => RuntimeError::Runtime(other.to_string()),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn start(&self, container: &str) -> Result<(), RuntimeError> {
        match self
            .client
            .start_container(container, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => {
                info!(container, "Started Docker container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container, "Container was already running");
                Ok(())
            }
            Err(e) => Err(map_error(container, e)),
        }
    }

    async fn stop(&self, container: &str) -> Result<(), RuntimeError> {
        let options = StopContainerOptions {
            t: self.stop_secs() as i64,
        };

        match self.client.stop_container(container, Some(options)).await {
            Ok(()) => {
                info!(container, "Stopped Docker container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container, "Container was already stopped");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container, "Container not found");
                Ok(())
            }
            Err(e) => Err(map_error(container, e)),
        }
    }

    async fn restart(&self, container: &str) -> Result<(), RuntimeError> {
        let options = RestartContainerOptions { t: self.stop_secs() };

        self.client
            .restart_container(container, Some(options))
            .await
            .map_err(|e| map_error(container, e))?;
        info!(container, "Restarted Docker container");
        Ok(())
    }

    async fn is_running(&self, container: &str) -> bool {
        match self
            .client
            .inspect_container(container, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => info.state.and_then(|s| s.running).unwrap_or(false),
            Err(_) => false,
        }
    }
}

/// In-memory runtime for unit tests
#[cfg(test)]
pub(crate) mod fake {
    use super::{ContainerRuntime, RuntimeError};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::time::Duration;

    #[derive(Default)]
    pub struct FakeRuntime {
        running: Mutex<HashSet<String>>,
        start_calls: Mutex<Vec<String>>,
        stop_calls: Mutex<Vec<String>>,
        restart_calls: Mutex<Vec<String>>,
        /// Containers that never come up after `start`
        stuck: Mutex<HashSet<String>>,
        /// Containers whose `start`/`stop`/`restart` fail
        failing: Mutex<HashSet<String>>,
        /// Containers whose `stop` never returns
        hanging_stop: Mutex<HashSet<String>>,
        start_delay: Mutex<Duration>,
    }

    impl FakeRuntime {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_running(&self, container: &str, running: bool) {
            let mut set = self.running.lock();
            if running {
                set.insert(container.to_string());
            } else {
                set.remove(container);
            }
        }

        pub fn is_running_now(&self, container: &str) -> bool {
            self.running.lock().contains(container)
        }

        pub fn set_stuck(&self, container: &str) {
            self.stuck.lock().insert(container.to_string());
        }

        pub fn set_failing(&self, container: &str) {
            self.failing.lock().insert(container.to_string());
        }

        pub fn set_hanging_stop(&self, container: &str) {
            self.hanging_stop.lock().insert(container.to_string());
        }

        pub fn set_start_delay(&self, delay: Duration) {
            *self.start_delay.lock() = delay;
        }

        pub fn start_calls(&self) -> Vec<String> {
            self.start_calls.lock().clone()
        }

        pub fn stop_calls(&self) -> Vec<String> {
            self.stop_calls.lock().clone()
        }

        pub fn restart_calls(&self) -> Vec<String> {
            self.restart_calls.lock().clone()
        }

        fn fails(&self, container: &str) -> bool {
            self.failing.lock().contains(container)
        }
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn start(&self, container: &str) -> Result<(), RuntimeError> {
            self.start_calls.lock().push(container.to_string());
            let delay = *self.start_delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if self.fails(container) {
                return Err(RuntimeError::Runtime("start failed".to_string()));
            }
            if !self.stuck.lock().contains(container) {
                self.set_running(container, true);
            }
            Ok(())
        }

        async fn stop(&self, container: &str) -> Result<(), RuntimeError> {
            self.stop_calls.lock().push(container.to_string());
            let hangs = self.hanging_stop.lock().contains(container);
            if hangs {
                std::future::pending::<()>().await;
            }
            if self.fails(container) {
                return Err(RuntimeError::Runtime("stop failed".to_string()));
            }
            self.set_running(container, false);
            Ok(())
        }

        async fn restart(&self, container: &str) -> Result<(), RuntimeError> {
            self.restart_calls.lock().push(container.to_string());
            if self.fails(container) {
                return Err(RuntimeError::Runtime("restart failed".to_string()));
            }
            self.set_running(container, true);
            Ok(())
        }

        async fn is_running(&self, container: &str) -> bool {
            self.running.lock().contains(container)
        }
    }
}
