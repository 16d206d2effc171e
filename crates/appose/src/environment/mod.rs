//! Environments: provisioned runtimes that launch worker services
//!
//! An [`EnvironmentResolver`] turns an [`EnvironmentSpec`] into a shared
//! [`Environment`], provisioning it at most once per content id. The
//! environment then hands out [`Service`]s running its worker command.

mod resolver;
mod restart;
mod spec;

pub use resolver::{EnvironmentMarker, EnvironmentResolver, ExistingInterpreter, MARKER_FILE, Provisioner};
pub use restart::RestartPolicy;
pub use spec::{Dependency, EnvironmentSpec};

use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::service::{Service, ServiceConfig, ServiceError, WorkerCommand};
use restart::Supervisor;

#[derive(Debug, thiserror::Error)]
pub enum EnvError {
    #[error("Invalid environment document: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Provisioning of environment {id} failed: {reason}")]
    Provision { id: String, reason: String },

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error("Worker of environment {id} crashed after {restarts} restarts, giving up")]
    RestartsExhausted { id: String, restarts: u32 },

    #[error("Environment {0} is closed")]
    Closed(String),
}

struct Pool {
    current: Option<Service>,
    spawned: Vec<Service>,
    supervisor: Supervisor,
    closed: bool,
}

/// A provisioned runtime able to launch workers
pub struct Environment {
    id: String,
    spec: EnvironmentSpec,
    dir: PathBuf,
    worker: WorkerCommand,
    service_config: ServiceConfig,
    pool: Mutex<Pool>,
}

impl Environment {
    pub(crate) fn new(
        id: String,
        spec: EnvironmentSpec,
        dir: PathBuf,
        worker: WorkerCommand,
        service_config: ServiceConfig,
        restart_policy: RestartPolicy,
    ) -> Self {
        Self {
            id,
            spec,
            dir,
            worker,
            service_config,
            pool: Mutex::new(Pool {
                current: None,
                spawned: Vec::new(),
                supervisor: Supervisor::new(restart_policy),
                closed: false,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn spec(&self) -> &EnvironmentSpec {
        &self.spec
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn worker(&self) -> &WorkerCommand {
        &self.worker
    }

    /// The environment's shared service, spawned on first use.
    ///
    /// If the previous worker crashed it is respawned according to the
    /// restart policy.
    pub async fn service(&self) -> Result<Service, EnvError> {
        let mut pool = self.pool.lock().await;
        if pool.closed {
            return Err(EnvError::Closed(self.id.clone()));
        }

        if let Some(service) = &pool.current {
            if service.is_active() {
                return Ok(service.clone());
            }
            if service.crashed() {
                let Some(delay) = pool.supervisor.record_crash() else {
                    return Err(EnvError::RestartsExhausted {
                        id: self.id.clone(),
                        restarts: pool.supervisor.restarts(),
                    });
                };
                warn!(
                    "Worker of environment {} crashed, respawning in {:?} (restart {})",
                    self.id,
                    delay,
                    pool.supervisor.restarts()
                );
                tokio::time::sleep(delay).await;
            }
        }

        let service = self.spawn(&mut pool).await?;
        pool.current = Some(service.clone());
        Ok(service)
    }

    /// A dedicated service that is never shared with other callers
    pub async fn new_service(&self) -> Result<Service, EnvError> {
        let mut pool = self.pool.lock().await;
        if pool.closed {
            return Err(EnvError::Closed(self.id.clone()));
        }
        self.spawn(&mut pool).await
    }

    async fn spawn(&self, pool: &mut Pool) -> Result<Service, EnvError> {
        let mut worker = self.worker.clone();
        if worker.current_dir.is_none() && self.dir.is_dir() {
            worker.current_dir = Some(self.dir.clone());
        }
        let service = Service::spawn(&worker, self.service_config.clone()).await?;
        pool.supervisor.record_start();
        pool.spawned.retain(Service::is_active);
        pool.spawned.push(service.clone());
        info!("Environment {} started service {}", self.id, service.id());
        Ok(service)
    }

    /// Close every live service. Later `service()` calls fail.
    pub async fn close(&self) {
        let services = {
            let mut pool = self.pool.lock().await;
            pool.closed = true;
            pool.current = None;
            std::mem::take(&mut pool.spawned)
        };
        for service in services {
            service.close().await;
        }
        info!("Environment {} closed", self.id);
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("id", &self.id)
            .field("dir", &self.dir)
            .field("worker", &self.worker)
            .finish()
    }
}
