//! Plan and outcome types for a benchmark run

use crate::benchmark::{BenchmarkQuery, BenchmarkSummary};
use crate::bridge::{BridgeReport, CloneSelection};
use crate::connection::ConnectionTarget;
use crate::migration::MigrationReport;
use serde::Serialize;
use std::path::PathBuf;
use uuid::Uuid;

/// Clone selection with its single fallback
#[derive(Debug, Clone)]
pub struct ClonePlan {
    /// First attempt, normally schema-level selectors
    pub primary: CloneSelection,
    /// Used once, on a fresh sandbox, when the first attempt fails
    pub fallback: Option<CloneSelection>,
}

impl ClonePlan {
    pub fn new(primary: CloneSelection) -> Self {
        Self { primary, fallback: None }
    }

    pub fn with_fallback(mut self, fallback: CloneSelection) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

/// Everything a run needs besides the sandbox technology
#[derive(Debug, Clone)]
pub struct PipelinePlan {
    pub target: ConnectionTarget,
    pub clone: ClonePlan,
    /// Migration set location (`file://` URI or path)
    pub migrations: Option<String>,
    pub queries: Vec<BenchmarkQuery>,
    /// Data-migration script with benchmark checkpoint markers
    pub data_migration: Option<PathBuf>,
}

/// Serializable record of a finished run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: Uuid,
    pub connection_string: String,
    pub clone_attempts: usize,
    pub bridge: BridgeReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub migration: Option<MigrationReport>,
    pub benchmarks: Vec<BenchmarkSummary>,
}

/// A finished run; the caller owns the live sandbox and decides its teardown
pub struct PipelineOutcome<S> {
    pub sandbox: S,
    pub summary: RunSummary,
}
