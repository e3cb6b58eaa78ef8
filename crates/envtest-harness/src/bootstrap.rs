//! ---
//! envtest_section: "01-core-functionality"
//! envtest_subsection: "module"
//! envtest_type: "source"
//! envtest_scope: "code"
//! envtest_description: "Starts the ephemeral control plane and preloads resource definitions."
//! envtest_version: "v0.0.0-prealpha"
//! envtest_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use envtest_apiserver::{ControlPlane, ObjectStore, RunningControlPlane};
use envtest_common::{ControlPlaneConfig, ProcessSpec};
use envtest_logging::{harness_debug, harness_info, harness_warn, LogContext};
use envtest_runtime::{Client, ConnectionConfig, Scheme};
use envtest_schema::{load_definitions, CustomResourceDefinition};
use tempfile::TempDir;
use url::Url;

use crate::error::SetupFailure;
use crate::process::ProcessRegistry;

/// Variable pointing companion processes at the connection file.
pub const CONNECTION_ENV: &str = "ENVTEST_CONNECTION";
/// Variable carrying the control plane base URL for companion processes.
pub const HOST_ENV: &str = "ENVTEST_HOST";
pub const CONNECTION_FILE: &str = "connection.json";

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A started environment: control plane, scratch directory, and companion processes.
#[derive(Debug)]
pub struct TestEnvironment {
    connection: ConnectionConfig,
    definitions: Vec<CustomResourceDefinition>,
    control_plane: Option<RunningControlPlane>,
    workdir: TempDir,
    connection_file: PathBuf,
    processes: ProcessRegistry,
}

impl TestEnvironment {
    pub fn connection(&self) -> &ConnectionConfig {
        &self.connection
    }

    pub fn definitions(&self) -> &[CustomResourceDefinition] {
        &self.definitions
    }

    /// `false` when attached to an existing control plane.
    pub fn owns_control_plane(&self) -> bool {
        self.control_plane.is_some()
    }

    /// Direct access to the in-memory store of an owned control plane.
    pub fn store(&self) -> Option<Arc<ObjectStore>> {
        self.control_plane.as_ref().map(RunningControlPlane::store)
    }

    pub fn workdir(&self) -> &Path {
        self.workdir.path()
    }

    pub fn connection_file(&self) -> &Path {
        &self.connection_file
    }

    pub fn processes(&self) -> &ProcessRegistry {
        &self.processes
    }

    /// Start a companion process with the connection variables set.
    pub fn spawn_process(&mut self, spec: &ProcessSpec) -> Result<u32, SetupFailure> {
        let env = [
            (CONNECTION_ENV, self.connection_file.display().to_string()),
            (HOST_ENV, self.connection.host.to_string()),
        ];
        self.processes
            .spawn(spec, &env)
            .map_err(|source| SetupFailure::Process {
                name: spec.name.clone(),
                source,
            })
    }

    /// Split into what teardown releases in separate stages.
    pub fn into_parts(self) -> (ProcessRegistry, EnvironmentResources) {
        (
            self.processes,
            EnvironmentResources {
                control_plane: self.control_plane,
                workdir: Some(self.workdir),
            },
        )
    }
}

/// Control plane and scratch directory, released last during teardown.
#[derive(Debug)]
pub struct EnvironmentResources {
    control_plane: Option<RunningControlPlane>,
    workdir: Option<TempDir>,
}

impl EnvironmentResources {
    /// Stop the control plane within `timeout` and remove the scratch
    /// directory. Both are attempted even if the first fails.
    pub async fn release(mut self, timeout: Duration) -> anyhow::Result<()> {
        let mut problems = Vec::new();
        if let Some(plane) = self.control_plane.take() {
            let address = plane.local_addr();
            match plane.stop(timeout).await {
                Ok(()) => harness_debug!("control plane at {address} stopped"),
                Err(err) => problems.push(err.to_string()),
            }
        }
        if let Some(workdir) = self.workdir.take() {
            let path = workdir.path().to_path_buf();
            if let Err(err) = workdir.close() {
                problems.push(format!("failed to remove {}: {err}", path.display()));
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!(problems.join("; ")))
        }
    }
}

/// Brings a [`TestEnvironment`] up in a single bounded attempt.
#[derive(Debug, Clone)]
pub struct EnvironmentBootstrapper {
    config: ControlPlaneConfig,
    request_timeout: Duration,
}

impl EnvironmentBootstrapper {
    pub fn new(config: ControlPlaneConfig) -> Self {
        Self {
            config,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn config(&self) -> &ControlPlaneConfig {
        &self.config
    }

    /// Start the environment. Any failure, or running past
    /// `startup_timeout`, is fatal; whatever was acquired is dropped.
    pub async fn start(&self) -> Result<TestEnvironment, SetupFailure> {
        self.config
            .validate()
            .map_err(|err| SetupFailure::Config(format!("{err:#}")))?;
        let limit = self.config.startup_timeout;
        tokio::time::timeout(limit, self.start_unbounded())
            .await
            .map_err(|_| SetupFailure::Timeout {
                stage: "bootstrap",
                after: limit,
            })?
    }

    /// Walks and parses the schema directories on the blocking pool.
    async fn read_definitions(&self) -> Result<Vec<CustomResourceDefinition>, SetupFailure> {
        let paths = self.config.schema_directories.clone();
        let error_if_missing = self.config.error_if_schema_path_missing;
        let loaded = tokio::task::spawn_blocking(move || {
            load_definitions(paths.as_slice(), error_if_missing)
        })
        .await
        .map_err(|err| SetupFailure::Config(format!("definition loader did not finish: {err}")))?;
        Ok(loaded?)
    }

    async fn start_unbounded(&self) -> Result<TestEnvironment, SetupFailure> {
        let ctx = LogContext::new().with_stage("bootstrap");

        // Definitions are read before anything is started so a malformed file
        // costs nothing to clean up.
        let definitions = self.read_definitions().await?;
        harness_info!(context = ctx, "loaded {} resource definition(s)", definitions.len());

        let workdir = tempfile::Builder::new()
            .prefix("envtest-")
            .tempdir()
            .map_err(|source| SetupFailure::Io {
                path: std::env::temp_dir(),
                source,
            })?;

        let (control_plane, host) = match &self.config.existing_endpoint {
            Some(endpoint) => {
                harness_info!(context = ctx, "attaching to existing control plane at {endpoint}");
                (None, endpoint.clone())
            }
            None => {
                let plane = ControlPlane::bind(self.config.bind_address).await?.spawn();
                let host = Url::parse(&plane.base_url())
                    .map_err(|err| SetupFailure::Config(format!("control plane url: {err}")))?;
                (Some(plane), host)
            }
        };

        let connection = ConnectionConfig::new(host).with_request_timeout(self.request_timeout);
        let client = Client::new(connection.clone(), Arc::new(Scheme::new())).map_err(|err| {
            SetupFailure::NotReady {
                endpoint: connection.host.to_string(),
                message: err.to_string(),
            }
        })?;

        self.wait_ready(&client, &ctx).await;
        self.install(&client, &definitions, &ctx).await?;
        self.wait_discovery(&client, &definitions, &ctx).await;

        let connection_file = workdir.path().join(CONNECTION_FILE);
        write_connection_file(&connection_file, &connection).await?;

        let mut environment = TestEnvironment {
            connection,
            definitions,
            control_plane,
            workdir,
            connection_file,
            processes: ProcessRegistry::new(),
        };
        for spec in &self.config.processes {
            environment.spawn_process(spec)?;
        }
        harness_info!(
            context = ctx,
            "environment ready at {}",
            environment.connection.host
        );
        Ok(environment)
    }

    /// Poll `/readyz` until it answers. Bounded by the caller's timeout.
    async fn wait_ready(&self, client: &Client, ctx: &LogContext<'_>) {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match client.readyz().await {
                Ok(()) => {
                    harness_debug!(context = ctx, "control plane ready after {attempts} probe(s)");
                    return;
                }
                Err(err) => {
                    harness_debug!(context = ctx, "readiness probe {attempts} failed: {err}");
                }
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn install(
        &self,
        client: &Client,
        definitions: &[CustomResourceDefinition],
        ctx: &LogContext<'_>,
    ) -> Result<(), SetupFailure> {
        for definition in definitions {
            match client.install_definition(definition).await {
                Ok(_) => harness_debug!(context = ctx, "installed {}", definition.name()),
                Err(err) if err.is_already_exists() => {
                    harness_warn!(context = ctx, "definition {} already installed", definition.name());
                }
                Err(source) => {
                    return Err(SetupFailure::Install {
                        definition: definition.name().to_owned(),
                        source,
                    })
                }
            }
        }
        Ok(())
    }

    /// Poll discovery until every served version of every definition is listed.
    async fn wait_discovery(
        &self,
        client: &Client,
        definitions: &[CustomResourceDefinition],
        ctx: &LogContext<'_>,
    ) {
        let expected: Vec<_> = definitions
            .iter()
            .flat_map(CustomResourceDefinition::served_resources)
            .collect();
        if expected.is_empty() {
            return;
        }
        loop {
            match client.discovery().await {
                Ok(list) if expected.iter().all(|gvr| list.serves(gvr)) => {
                    harness_debug!(context = ctx, "{} resource(s) discoverable", expected.len());
                    return;
                }
                Ok(_) => harness_debug!(context = ctx, "waiting for definitions to be served"),
                Err(err) => harness_debug!(context = ctx, "discovery failed: {err}"),
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}

async fn write_connection_file(path: &Path, connection: &ConnectionConfig) -> Result<(), SetupFailure> {
    let io_error = |source| SetupFailure::Io {
        path: path.to_path_buf(),
        source,
    };
    let body = serde_json::to_vec_pretty(connection)
        .map_err(|err| io_error(std::io::Error::other(err)))?;
    tokio::fs::write(path, body).await.map_err(io_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    const DEFINITION: &str = r#"
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: widgets.boot.example.io
spec:
  group: boot.example.io
  names:
    kind: Widget
    plural: widgets
  scope: Namespaced
  versions:
    - name: v1
      served: true
      storage: true
"#;

    fn config_with(dir: &Path) -> ControlPlaneConfig {
        ControlPlaneConfig {
            startup_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(20),
            ..ControlPlaneConfig::default()
        }
        .with_schema_directory(dir)
    }

    #[tokio::test]
    async fn starts_installs_and_writes_connection_file() {
        let schemas = tempfile::tempdir().unwrap();
        std::fs::write(schemas.path().join("widgets.yaml"), DEFINITION).unwrap();

        let environment = EnvironmentBootstrapper::new(config_with(schemas.path()))
            .start()
            .await
            .unwrap();
        assert!(environment.owns_control_plane());
        assert_eq!(environment.definitions().len(), 1);
        let store = environment.store().unwrap();
        assert!(store.definition("widgets.boot.example.io").is_ok());

        let written: ConnectionConfig =
            serde_json::from_slice(&std::fs::read(environment.connection_file()).unwrap()).unwrap();
        assert_eq!(&written, environment.connection());

        let workdir = environment.workdir().to_path_buf();
        let (_, resources) = environment.into_parts();
        resources.release(Duration::from_secs(5)).await.unwrap();
        assert!(!workdir.exists());
    }

    #[tokio::test]
    async fn unresponsive_endpoint_times_out() {
        // Accepts connections but never answers.
        let silent = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Url::parse(&format!("http://{}", silent.local_addr().unwrap())).unwrap();
        let config = ControlPlaneConfig {
            existing_endpoint: Some(endpoint),
            startup_timeout: Duration::from_millis(400),
            poll_interval: Duration::from_millis(20),
            ..ControlPlaneConfig::default()
        };

        let started = std::time::Instant::now();
        let err = EnvironmentBootstrapper::new(config).start().await.unwrap_err();
        assert!(matches!(err, SetupFailure::Timeout { stage: "bootstrap", .. }), "{err}");
        assert!(started.elapsed() < Duration::from_secs(5));
        drop(silent);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn definitions_load_on_a_single_threaded_runtime() {
        let schemas = tempfile::tempdir().unwrap();
        std::fs::write(schemas.path().join("widgets.yaml"), DEFINITION).unwrap();
        let bootstrapper = EnvironmentBootstrapper::new(config_with(schemas.path()));

        let definitions = bootstrapper.read_definitions().await.unwrap();
        assert_eq!(definitions.len(), 1);
        assert_eq!(definitions[0].name(), "widgets.boot.example.io");

        std::fs::write(schemas.path().join("broken.yaml"), "kind: [unclosed").unwrap();
        let err = bootstrapper.read_definitions().await.unwrap_err();
        assert!(matches!(err, SetupFailure::Schema(_)), "{err}");
    }

    #[tokio::test]
    async fn missing_schema_directory_is_fatal_when_required() {
        let config = ControlPlaneConfig {
            error_if_schema_path_missing: true,
            ..ControlPlaneConfig::default()
        }
        .with_schema_directory("/nonexistent/envtest/crds");
        let err = EnvironmentBootstrapper::new(config).start().await.unwrap_err();
        assert!(matches!(err, SetupFailure::Schema(_)), "{err}");
    }
}
