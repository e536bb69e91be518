//! Thin capability boundary over the local container runtime.
//!
//! A `bollard::Docker` wrapper exposing list/logs/start/stop/restart,
//! mapped onto the watcher's own status/handle types. Everything stays in
//! the async world throughout, since the whole daemon already runs on a
//! Tokio runtime — no block_on bridging layer needed.

use async_trait::async_trait;
use bollard::container::{
    LogOutput, LogsOptions, RestartContainerOptions, StopContainerOptions,
};
use bollard::Docker;
use futures_util::StreamExt;

use crate::error::DriverError;

/// A handle identifying one managed container, opaque beyond its name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerHandle {
    pub name: String,
}

impl ContainerHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[derive(Debug, Clone)]
pub struct ContainerStatus {
    pub handle: ContainerHandle,
    pub docker_status: String,
    pub is_running: bool,
}

/// Capability boundary the supervisor depends on. A fake implementation
/// backs the unit and scenario tests; `BollardDriver` is the production
/// implementation.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    async fn list_status(&self, name: &str) -> Result<ContainerStatus, DriverError>;
    async fn tail_logs(&self, handle: &ContainerHandle, n: usize) -> Result<String, DriverError>;
    async fn restart(&self, handle: &ContainerHandle) -> Result<(), DriverError>;
    async fn start(&self, handle: &ContainerHandle) -> Result<(), DriverError>;
    async fn stop(&self, handle: &ContainerHandle) -> Result<(), DriverError>;
}

pub struct BollardDriver {
    client: Docker,
}

const RESTART_TIMEOUT_SECS: i64 = 30;
const STOP_TIMEOUT_SECS: i64 = 30;

impl BollardDriver {
    pub fn connect() -> Result<Self, DriverError> {
        let client = Docker::connect_with_local_defaults()
            .map_err(|e| DriverError::Transport(e.to_string()))?;
        Ok(Self { client })
    }

    pub async fn ping(&self) -> Result<(), DriverError> {
        self.client
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| DriverError::Transport(e.to_string()))
    }
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError { status_code, .. } if *status_code == 404
    )
}

#[async_trait]
impl ContainerDriver for BollardDriver {
    async fn list_status(&self, name: &str) -> Result<ContainerStatus, DriverError> {
        let inspect = self
            .client
            .inspect_container(name, None)
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    DriverError::NotFound(name.to_string())
                } else {
                    DriverError::Transport(e.to_string())
                }
            })?;

        let docker_status = inspect
            .state
            .as_ref()
            .and_then(|s| s.status)
            .map(|s| format!("{s:?}").to_lowercase())
            .unwrap_or_else(|| "unknown".to_string());
        let is_running = docker_status == "running";

        Ok(ContainerStatus {
            handle: ContainerHandle::new(name),
            docker_status,
            is_running,
        })
    }

    async fn tail_logs(&self, handle: &ContainerHandle, n: usize) -> Result<String, DriverError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: n.to_string(),
            ..Default::default()
        };

        let mut stream = self.client.logs(&handle.name, Some(options));
        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| {
                if is_not_found(&e) {
                    DriverError::NotFound(handle.name.clone())
                } else {
                    DriverError::Transport(e.to_string())
                }
            })?;
            let bytes: &[u8] = match &chunk {
                LogOutput::StdOut { message } => message,
                LogOutput::StdErr { message } => message,
                LogOutput::Console { message } => message,
                LogOutput::StdIn { message } => message,
            };
            out.push_str(&String::from_utf8_lossy(bytes));
        }
        Ok(out)
    }

    async fn restart(&self, handle: &ContainerHandle) -> Result<(), DriverError> {
        let options = RestartContainerOptions {
            t: RESTART_TIMEOUT_SECS,
        };
        self.client
            .restart_container(&handle.name, Some(options))
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    DriverError::NotFound(handle.name.clone())
                } else {
                    DriverError::Transport(e.to_string())
                }
            })
    }

    async fn start(&self, handle: &ContainerHandle) -> Result<(), DriverError> {
        self.client
            .start_container::<String>(&handle.name, None)
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    DriverError::NotFound(handle.name.clone())
                } else {
                    DriverError::Transport(e.to_string())
                }
            })
    }

    async fn stop(&self, handle: &ContainerHandle) -> Result<(), DriverError> {
        let options = StopContainerOptions {
            t: STOP_TIMEOUT_SECS,
        };
        self.client
            .stop_container(&handle.name, Some(options))
            .await
            .map_err(|e| {
                if is_not_found(&e) {
                    DriverError::NotFound(handle.name.clone())
                } else {
                    DriverError::Transport(e.to_string())
                }
            })
    }
}

/// An in-memory driver for tests (unit tests in this crate and the
/// scenario tests in `tests/integration_test.rs`). Not behind `#[cfg(test)]`
/// so integration tests, which link the library as an ordinary dependency,
/// can see it too.
pub mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Clone)]
    pub struct FakeContainer {
        pub docker_status: String,
        pub is_running: bool,
        pub logs: String,
    }

    impl FakeContainer {
        pub fn running(logs: impl Into<String>) -> Self {
            Self {
                docker_status: "running".to_string(),
                is_running: true,
                logs: logs.into(),
            }
        }

        pub fn stopped() -> Self {
            Self {
                docker_status: "exited".to_string(),
                is_running: false,
                logs: String::new(),
            }
        }
    }

    #[derive(Default)]
    pub struct FakeDriver {
        pub containers: Mutex<HashMap<String, FakeContainer>>,
        pub restart_count: Mutex<HashMap<String, usize>>,
        pub fail_restart: Mutex<std::collections::HashSet<String>>,
        pub panic_on_status: Mutex<std::collections::HashSet<String>>,
    }

    impl FakeDriver {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set(&self, name: &str, container: FakeContainer) {
            self.containers.lock().unwrap().insert(name.to_string(), container);
        }

        pub fn restart_count(&self, name: &str) -> usize {
            *self.restart_count.lock().unwrap().get(name).unwrap_or(&0)
        }
    }

    #[async_trait]
    impl ContainerDriver for FakeDriver {
        async fn list_status(&self, name: &str) -> Result<ContainerStatus, DriverError> {
            if self.panic_on_status.lock().unwrap().contains(name) {
                panic!("simulated panic fetching status for '{name}'");
            }
            let containers = self.containers.lock().unwrap();
            let c = containers.get(name).ok_or_else(|| DriverError::NotFound(name.to_string()))?;
            Ok(ContainerStatus {
                handle: ContainerHandle::new(name),
                docker_status: c.docker_status.clone(),
                is_running: c.is_running,
            })
        }

        async fn tail_logs(&self, handle: &ContainerHandle, _n: usize) -> Result<String, DriverError> {
            let containers = self.containers.lock().unwrap();
            let c = containers
                .get(&handle.name)
                .ok_or_else(|| DriverError::NotFound(handle.name.clone()))?;
            Ok(c.logs.clone())
        }

        async fn restart(&self, handle: &ContainerHandle) -> Result<(), DriverError> {
            *self
                .restart_count
                .lock()
                .unwrap()
                .entry(handle.name.clone())
                .or_insert(0) += 1;
            if self.fail_restart.lock().unwrap().contains(&handle.name) {
                return Err(DriverError::Transport("simulated restart failure".to_string()));
            }
            Ok(())
        }

        async fn start(&self, handle: &ContainerHandle) -> Result<(), DriverError> {
            if let Some(c) = self.containers.lock().unwrap().get_mut(&handle.name) {
                c.is_running = true;
                c.docker_status = "running".to_string();
            }
            Ok(())
        }

        async fn stop(&self, handle: &ContainerHandle) -> Result<(), DriverError> {
            if let Some(c) = self.containers.lock().unwrap().get_mut(&handle.name) {
                c.is_running = false;
                c.docker_status = "exited".to_string();
            }
            Ok(())
        }
    }
}
