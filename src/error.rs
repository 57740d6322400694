//! Error handling module
//!
//! Provides the error taxonomy shared by every stage of the pipeline.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Pipeline stage an error is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Configuration,
    Provisioning,
    Bridge,
    Migration,
    Benchmark,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Configuration => "configuration",
            Stage::Provisioning => "provisioning",
            Stage::Bridge => "bridge",
            Stage::Migration => "migration",
            Stage::Benchmark => "benchmark",
        };
        f.write_str(name)
    }
}

/// Failure of a single statement issued against the sandbox
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("Statement rejected: {0}")]
    Rejected(String),
}

/// Pipeline-wide error type
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Sandbox did not become ready within {timeout:?}")]
    ProvisioningTimeout { timeout: Duration },

    #[error("Sandbox provisioning failed: {0}")]
    ProvisioningFailed(String),

    #[error("Foreign bridge setup failed at {step}: {source}")]
    BridgeSetupFailed {
        step: String,
        #[source]
        source: SessionError,
    },

    #[error("Migration failed{}: {reason}", version.map(|v| format!(" at version {}", v)).unwrap_or_default())]
    MigrationFailed { version: Option<u64>, reason: String },

    #[error("Benchmark query {index} failed ({query}): {source}")]
    BenchmarkQueryFailed {
        index: usize,
        query: String,
        #[source]
        source: SessionError,
    },

    #[error("{stage} stage cancelled")]
    Cancelled { stage: Stage },

    #[error("Both clone attempts failed. Schema-level: {schema_level}. Table-level: {table_level}")]
    CloneAttemptsExhausted {
        schema_level: Box<PipelineError>,
        table_level: Box<PipelineError>,
    },

    #[error("Failed to write benchmark results: {0}")]
    ResultSink(#[from] std::io::Error),
}

impl PipelineError {
    /// Stage the failure belongs to
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::Configuration(_) => Stage::Configuration,
            PipelineError::ProvisioningTimeout { .. } | PipelineError::ProvisioningFailed(_) => {
                Stage::Provisioning
            }
            PipelineError::BridgeSetupFailed { .. } => Stage::Bridge,
            PipelineError::MigrationFailed { .. } => Stage::Migration,
            PipelineError::BenchmarkQueryFailed { .. } | PipelineError::ResultSink(_) => {
                Stage::Benchmark
            }
            PipelineError::Cancelled { stage } => *stage,
            PipelineError::CloneAttemptsExhausted { table_level, .. } => table_level.stage(),
        }
    }
}

/// Result type alias for pipeline stages
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Helper function to create a configuration error
pub fn configuration_error(msg: impl Into<String>) -> PipelineError {
    PipelineError::Configuration(msg.into())
}

/// Helper function to create a bridge setup error for a named step
pub fn bridge_error(step: impl Into<String>) -> impl FnOnce(SessionError) -> PipelineError {
    let step = step.into();
    move |source| PipelineError::BridgeSetupFailed { step, source }
}
