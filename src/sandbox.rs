//! Sandbox provisioning
//!
//! Starts a disposable Postgres engine, waits for its readiness log and hands
//! out a bounded connection handle with the default timeouts lifted.
//!
//! The engine technology sits behind [`SandboxProvisioner`] / [`Sandbox`] so the
//! later stages only ever see a [`SqlSession`].

use crate::db::{PoolLimits, PoolSession, SandboxEndpoint, SqlSession};
use crate::error::{PipelineError, PipelineResult, Stage};
use async_trait::async_trait;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::time::Duration;
use testcontainers::core::error::{TestcontainersError, WaitContainerError};
use testcontainers::core::wait::LogWaitStrategy;
use testcontainers::core::{IntoContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const POSTGRES_PORT: u16 = 5432;

/// Statements that lift the default limits on the sandbox session
pub const DISABLE_TIMEOUT_STATEMENTS: [&str; 3] = [
    "SET statement_timeout = 0;",
    "SET idle_in_transaction_session_timeout = 0;",
    "SET lock_timeout = 0;",
];

/// Sandbox engine configuration
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub image: String,
    pub tag: String,
    pub database: String,
    pub user: String,
    pub password: String,
    /// Log line that signals readiness
    pub ready_log: String,
    /// How many times the readiness line must appear
    pub ready_occurrences: usize,
    pub startup_timeout: Duration,
    pub pool: PoolLimits,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "docker.io/postgres".to_string(),
            tag: "15.2-alpine".to_string(),
            database: "postgres".to_string(),
            user: "tapp".to_string(),
            password: "tapp".to_string(),
            ready_log: "database system is ready to accept connections".to_string(),
            ready_occurrences: 2,
            startup_timeout: Duration::from_secs(10),
            pool: PoolLimits::default(),
        }
    }
}

/// Starts sandboxes
#[async_trait]
pub trait SandboxProvisioner: Send + Sync {
    type Sandbox: Sandbox;

    /// Start a fresh sandbox and return it once its session is usable
    async fn start(&self, cancel: &CancellationToken) -> PipelineResult<Self::Sandbox>;
}

/// A running sandbox owning its engine and connection handle
#[async_trait]
pub trait Sandbox: Send + Sync {
    type Session: SqlSession;

    /// Connection handle shared by every stage
    fn session(&self) -> &Self::Session;

    /// Role the stages work as inside the sandbox
    fn working_user(&self) -> &str;

    /// Masked connection string for operators
    fn connection_string(&self) -> String;

    /// Terminate the sandbox
    async fn stop(self) -> PipelineResult<()>;
}

/// Disable statement, idle-transaction and lock timeouts on the session
pub async fn disable_session_timeouts<S: SqlSession + ?Sized>(session: &S) -> PipelineResult<()> {
    for statement in DISABLE_TIMEOUT_STATEMENTS {
        session.execute(statement).await.map_err(|e| {
            PipelineError::ProvisioningFailed(format!("{} failed: {}", statement.trim_end_matches(';'), e))
        })?;
    }
    Ok(())
}

/// Map a container start failure; only a missed readiness wait is a timeout
fn start_error(error: TestcontainersError, timeout: Duration, image: &str) -> PipelineError {
    match error {
        TestcontainersError::WaitContainer(WaitContainerError::StartupTimeout) => {
            PipelineError::ProvisioningTimeout { timeout }
        }
        other => PipelineError::ProvisioningFailed(format!("Failed to start {}: {}", image, other)),
    }
}

/// Holds a value whose destructor never runs unless it is taken back with
/// [`Detached::into_inner`]. A dropped container stays up.
struct Detached<T>(ManuallyDrop<T>);

impl<T> Detached<T> {
    fn new(inner: T) -> Self {
        Self(ManuallyDrop::new(inner))
    }

    fn into_inner(self) -> T {
        ManuallyDrop::into_inner(self.0)
    }
}

impl<T> Deref for Detached<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

/// Provisioner running the sandbox as a container
pub struct ContainerProvisioner {
    config: SandboxConfig,
}

impl ContainerProvisioner {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    fn image(&self) -> testcontainers::ContainerRequest<GenericImage> {
        let config = &self.config;
        GenericImage::new(config.image.clone(), config.tag.clone())
            .with_exposed_port(POSTGRES_PORT.tcp())
            .with_wait_for(WaitFor::Log(
                LogWaitStrategy::stderr(config.ready_log.clone()).with_times(config.ready_occurrences),
            ))
            .with_env_var("POSTGRES_DB", config.database.clone())
            .with_env_var("POSTGRES_USER", config.user.clone())
            .with_env_var("POSTGRES_PASSWORD", config.password.clone())
            .with_startup_timeout(config.startup_timeout)
    }

    /// Start the container. The readiness wait is bounded by the request's
    /// startup timeout; pulling the image is not.
    async fn launch(&self) -> PipelineResult<Detached<ContainerAsync<GenericImage>>> {
        let image = format!("{}:{}", self.config.image, self.config.tag);
        self.image()
            .start()
            .await
            .map(Detached::new)
            .map_err(|e| start_error(e, self.config.startup_timeout, &image))
    }

    async fn connect(
        &self,
        container: &ContainerAsync<GenericImage>,
    ) -> PipelineResult<(PoolSession, SandboxEndpoint)> {
        let host = container
            .get_host()
            .await
            .map_err(|e| PipelineError::ProvisioningFailed(format!("Failed to resolve sandbox host: {}", e)))?;
        let port = container
            .get_host_port_ipv4(POSTGRES_PORT.tcp())
            .await
            .map_err(|e| PipelineError::ProvisioningFailed(format!("Failed to resolve sandbox port: {}", e)))?;

        let endpoint = SandboxEndpoint {
            host: host.to_string(),
            port,
            user: self.config.user.clone(),
            password: self.config.password.clone(),
            database: self.config.database.clone(),
        };

        let session = PoolSession::connect(&endpoint, self.config.pool)
            .map_err(|e| PipelineError::ProvisioningFailed(e.to_string()))?;

        session
            .query_text("SELECT 1 AS ok")
            .await
            .map_err(|e| PipelineError::ProvisioningFailed(format!("Sandbox connection test failed: {}", e)))?;

        disable_session_timeouts(&session).await?;

        info!("Sandbox ready at {}", endpoint.to_display_string());
        Ok((session, endpoint))
    }
}

#[async_trait]
impl SandboxProvisioner for ContainerProvisioner {
    type Sandbox = ContainerSandbox;

    async fn start(&self, cancel: &CancellationToken) -> PipelineResult<ContainerSandbox> {
        info!(
            "Starting sandbox {}:{} (database {}, user {})",
            self.config.image, self.config.tag, self.config.database, self.config.user
        );

        let container = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled { stage: Stage::Provisioning }),
            started = self.launch() => started?,
        };
        debug!("Sandbox container {} started", container.id());

        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PipelineError::Cancelled { stage: Stage::Provisioning }),
            connected = self.connect(&container) => connected,
        };
        let (session, endpoint) = connected.inspect_err(|_| {
            warn!("Sandbox container {} left running after a failed start", container.id());
        })?;

        Ok(ContainerSandbox {
            container,
            session,
            endpoint,
        })
    }
}

/// Sandbox running in a container. Dropping it leaves the container up;
/// [`Sandbox::stop`] is the only teardown.
pub struct ContainerSandbox {
    container: Detached<ContainerAsync<GenericImage>>,
    session: PoolSession,
    endpoint: SandboxEndpoint,
}

#[async_trait]
impl Sandbox for ContainerSandbox {
    type Session = PoolSession;

    fn session(&self) -> &PoolSession {
        &self.session
    }

    fn working_user(&self) -> &str {
        &self.endpoint.user
    }

    fn connection_string(&self) -> String {
        self.endpoint.to_display_string()
    }

    async fn stop(self) -> PipelineResult<()> {
        let container = self.container.into_inner();
        info!("Stopping sandbox container {}", container.id());
        self.session.close();

        if let Err(e) = container.stop().await {
            warn!("Failed to stop sandbox container: {}", e);
        }
        container
            .rm()
            .await
            .map_err(|e| PipelineError::ProvisioningFailed(format!("Failed to remove sandbox container: {}", e)))?;

        info!("Sandbox stopped and removed");
        Ok(())
    }
}
