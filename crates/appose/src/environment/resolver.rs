//! Environment resolution and provisioning
//!
//! Each content id gets its own `OnceCell`, so the same document is
//! provisioned once even under concurrent `resolve` calls, while different
//! documents provision in parallel.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::{EnvError, Environment, EnvironmentSpec, RestartPolicy};
use crate::config::ApposeConfig;
use crate::service::{ServiceConfig, WorkerCommand};

/// File written into an environment directory once provisioning succeeds
pub const MARKER_FILE: &str = "environment.json";

/// Contents of [`MARKER_FILE`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentMarker {
    pub id: String,
    pub spec: EnvironmentSpec,
    pub worker: WorkerCommand,
    pub provisioned_at: DateTime<Utc>,
}

/// Installs whatever an environment needs and says how to start its workers
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(&self, spec: &EnvironmentSpec, dir: &Path) -> Result<WorkerCommand, EnvError>;

    /// Whether a previously provisioned environment can be used as-is
    async fn is_current(&self, _marker: &EnvironmentMarker) -> bool {
        true
    }
}

/// Runs a fixed worker program and installs nothing
#[derive(Debug, Clone)]
pub struct ExistingInterpreter {
    worker: WorkerCommand,
}

impl ExistingInterpreter {
    pub fn new(worker: WorkerCommand) -> Self {
        Self { worker }
    }

    pub fn worker(&self) -> &WorkerCommand {
        &self.worker
    }
}

impl Default for ExistingInterpreter {
    fn default() -> Self {
        Self::new(WorkerCommand::locate_default())
    }
}

#[async_trait]
impl Provisioner for ExistingInterpreter {
    async fn provision(&self, spec: &EnvironmentSpec, _dir: &Path) -> Result<WorkerCommand, EnvError> {
        if let Some(version) = spec.python_version() {
            debug!(
                "Environment requests python {}, using existing worker {}",
                version, self.worker
            );
        }
        Ok(self.worker.clone())
    }

    async fn is_current(&self, marker: &EnvironmentMarker) -> bool {
        marker.worker == self.worker
    }
}

pub struct EnvironmentResolver<P = ExistingInterpreter> {
    root: PathBuf,
    provisioner: P,
    service_config: ServiceConfig,
    restart_policy: RestartPolicy,
    environments: DashMap<String, Arc<OnceCell<Arc<Environment>>>>,
}

impl<P: Provisioner> EnvironmentResolver<P> {
    pub fn new(root: impl Into<PathBuf>, provisioner: P) -> Self {
        Self {
            root: root.into(),
            provisioner,
            service_config: ServiceConfig::default(),
            restart_policy: RestartPolicy::default(),
            environments: DashMap::new(),
        }
    }

    pub fn from_config(config: &ApposeConfig, provisioner: P) -> Self {
        Self::new(config.environments.root_dir.clone(), provisioner)
            .with_service_config(config.service_config())
            .with_restart_policy(config.restart_policy())
    }

    pub fn with_service_config(mut self, config: ServiceConfig) -> Self {
        self.service_config = config;
        self
    }

    pub fn with_restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn provisioner(&self) -> &P {
        &self.provisioner
    }

    /// Resolve a document to its environment, provisioning on first use
    pub async fn resolve(&self, spec: &EnvironmentSpec) -> Result<Arc<Environment>, EnvError> {
        let id = spec.id();
        let cell = Arc::clone(self.environments.entry(id.clone()).or_default().value());
        let environment = cell.get_or_try_init(|| self.materialize(&id, spec)).await?;
        Ok(Arc::clone(environment))
    }

    pub async fn resolve_yaml(&self, yaml: &str) -> Result<Arc<Environment>, EnvError> {
        self.resolve(&EnvironmentSpec::from_yaml(yaml)?).await
    }

    pub async fn resolve_file(&self, path: impl AsRef<Path>) -> Result<Arc<Environment>, EnvError> {
        self.resolve(&EnvironmentSpec::from_file(path)?).await
    }

    /// Ids of the environments resolved by this resolver, sorted
    pub fn provisioned(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .environments
            .iter()
            .filter(|entry| entry.value().initialized())
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Close the services of every resolved environment
    pub async fn close_all(&self) {
        let environments: Vec<Arc<Environment>> = self
            .environments
            .iter()
            .filter_map(|entry| entry.value().get().cloned())
            .collect();
        for environment in environments {
            environment.close().await;
        }
    }

    async fn materialize(&self, id: &str, spec: &EnvironmentSpec) -> Result<Arc<Environment>, EnvError> {
        let dir = self.root.join(id);
        tokio::fs::create_dir_all(&dir).await.map_err(|source| EnvError::Io {
            path: dir.clone(),
            source,
        })?;

        let marker_path = dir.join(MARKER_FILE);
        let reusable = match read_marker(&marker_path).await {
            Some(marker) if marker.id == id => {
                let current = self.provisioner.is_current(&marker).await;
                if !current {
                    warn!("Environment {} at {} is stale, provisioning again", id, dir.display());
                }
                current.then_some(marker)
            }
            Some(_) => {
                warn!("Environment {} at {} is stale, provisioning again", id, dir.display());
                None
            }
            None => None,
        };

        let worker = match reusable {
            Some(marker) => {
                info!("Reusing environment {} at {}", id, dir.display());
                marker.worker
            }
            None => {
                info!("Provisioning environment {} in {}", id, dir.display());
                let worker = self.provisioner.provision(spec, &dir).await?;
                let marker = EnvironmentMarker {
                    id: id.to_string(),
                    spec: spec.clone(),
                    worker: worker.clone(),
                    provisioned_at: Utc::now(),
                };
                write_marker(&marker_path, &marker).await?;
                info!("Environment {} provisioned", id);
                worker
            }
        };

        Ok(Arc::new(Environment::new(
            id.to_string(),
            spec.clone(),
            dir,
            worker,
            self.service_config.clone(),
            self.restart_policy.clone(),
        )))
    }
}

impl Default for EnvironmentResolver<ExistingInterpreter> {
    fn default() -> Self {
        Self::from_config(&ApposeConfig::default(), ExistingInterpreter::default())
    }
}

async fn read_marker(path: &Path) -> Option<EnvironmentMarker> {
    let bytes = tokio::fs::read(path).await.ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(marker) => Some(marker),
        Err(e) => {
            warn!("Ignoring unreadable environment marker {}: {}", path.display(), e);
            None
        }
    }
}

async fn write_marker(path: &Path, marker: &EnvironmentMarker) -> Result<(), EnvError> {
    let io_error = |source: std::io::Error| EnvError::Io {
        path: path.to_path_buf(),
        source,
    };
    let body = serde_json::to_vec_pretty(marker).map_err(|e| io_error(e.into()))?;
    tokio::fs::write(path, body).await.map_err(io_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const DOC: &str = "name: rotation\ndependencies:\n  - python=3.10\n  - numpy\n";

    /// Counts provisionings; fails the first `failures` of them
    struct CountingProvisioner {
        calls: AtomicUsize,
        failures: usize,
        delay: Duration,
    }

    impl CountingProvisioner {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failures: 0,
                delay: Duration::from_millis(50),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Provisioner for CountingProvisioner {
        async fn provision(&self, spec: &EnvironmentSpec, dir: &Path) -> Result<WorkerCommand, EnvError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if call < self.failures {
                return Err(EnvError::Provision {
                    id: spec.id(),
                    reason: "mirror unreachable".into(),
                });
            }
            Ok(WorkerCommand::new(dir.join("bin/worker")))
        }
    }

    #[tokio::test]
    async fn concurrent_resolves_provision_once() {
        let root = tempfile::tempdir().unwrap();
        let resolver = EnvironmentResolver::new(root.path(), CountingProvisioner::new());
        let spec = EnvironmentSpec::from_yaml(DOC).unwrap();

        let (a, b) = tokio::join!(resolver.resolve(&spec), resolver.resolve(&spec));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.id(), spec.id());
        assert_eq!(resolver.provisioner().calls(), 1);
        assert_eq!(resolver.provisioned(), vec![spec.id()]);
        assert!(a.dir().join(MARKER_FILE).is_file());
    }

    #[tokio::test]
    async fn different_documents_provision_in_parallel() {
        let root = tempfile::tempdir().unwrap();
        let mut provisioner = CountingProvisioner::new();
        provisioner.delay = Duration::from_millis(300);
        let resolver = EnvironmentResolver::new(root.path(), provisioner);
        let first = EnvironmentSpec::from_yaml(DOC).unwrap();
        let second = EnvironmentSpec::from_yaml(&DOC.replace("numpy", "scipy")).unwrap();

        let started = std::time::Instant::now();
        let (a, b) = tokio::join!(resolver.resolve(&first), resolver.resolve(&second));
        assert_ne!(a.unwrap().id(), b.unwrap().id());
        assert_eq!(resolver.provisioner().calls(), 2);
        assert!(started.elapsed() < Duration::from_millis(550));
    }

    #[tokio::test]
    async fn failed_provisioning_is_retried() {
        let root = tempfile::tempdir().unwrap();
        let mut provisioner = CountingProvisioner::new();
        provisioner.failures = 1;
        let resolver = EnvironmentResolver::new(root.path(), provisioner);
        let spec = EnvironmentSpec::from_yaml(DOC).unwrap();

        let first = resolver.resolve(&spec).await;
        assert!(matches!(first, Err(EnvError::Provision { .. })));
        assert!(resolver.provisioned().is_empty());

        let environment = tokio_test::assert_ok!(resolver.resolve(&spec).await);
        assert_eq!(environment.worker().program, environment.dir().join("bin/worker"));
        assert_eq!(resolver.provisioner().calls(), 2);
    }

    #[tokio::test]
    async fn provisioned_environments_are_reused_from_disk() {
        let root = tempfile::tempdir().unwrap();
        let spec = EnvironmentSpec::from_yaml(DOC).unwrap();

        let first = EnvironmentResolver::new(root.path(), CountingProvisioner::new());
        let worker = first.resolve(&spec).await.unwrap().worker().clone();
        assert_eq!(first.provisioner().calls(), 1);

        let second = EnvironmentResolver::new(root.path(), CountingProvisioner::new());
        let reused = second.resolve(&spec).await.unwrap();
        assert_eq!(second.provisioner().calls(), 0);
        assert_eq!(reused.worker(), &worker);
    }

    #[tokio::test]
    async fn unreadable_markers_trigger_provisioning() {
        let root = tempfile::tempdir().unwrap();
        let spec = EnvironmentSpec::from_yaml(DOC).unwrap();
        let dir = root.path().join(spec.id());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(MARKER_FILE), b"{ truncated").unwrap();

        let resolver = EnvironmentResolver::new(root.path(), CountingProvisioner::new());
        resolver.resolve(&spec).await.unwrap();
        assert_eq!(resolver.provisioner().calls(), 1);

        let marker: EnvironmentMarker =
            serde_json::from_slice(&std::fs::read(dir.join(MARKER_FILE)).unwrap()).unwrap();
        assert_eq!(marker.id, spec.id());
        assert_eq!(marker.spec, spec);
    }

    #[tokio::test]
    async fn existing_interpreter_invalidates_markers_for_other_workers() {
        let root = tempfile::tempdir().unwrap();
        let spec = EnvironmentSpec::from_yaml(DOC).unwrap();

        let first = EnvironmentResolver::new(root.path(), ExistingInterpreter::new(WorkerCommand::new("/opt/a")));
        first.resolve(&spec).await.unwrap();

        let second = EnvironmentResolver::new(root.path(), ExistingInterpreter::new(WorkerCommand::new("/opt/b")));
        let environment = second.resolve(&spec).await.unwrap();
        assert_eq!(environment.worker().program, PathBuf::from("/opt/b"));
    }

    #[tokio::test]
    async fn closed_environments_refuse_services() {
        let root = tempfile::tempdir().unwrap();
        let resolver = EnvironmentResolver::new(root.path(), CountingProvisioner::new());
        let environment = resolver.resolve_yaml(DOC).await.unwrap();
        environment.close().await;
        assert!(matches!(environment.service().await, Err(EnvError::Closed(_))));
    }
}
