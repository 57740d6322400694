//! Benchmark harness
//!
//! Times a list of SQL statements against the sandbox and captures the shape
//! of every result.

pub mod checkpoint;
pub mod runner;
pub mod sink;

use crate::error::{configuration_error, PipelineResult};
use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::time::Duration;

pub use checkpoint::CheckpointRunner;
pub use runner::BenchmarkRunner;
pub use sink::{JsonLinesSink, ResultSink, TextFileSink};

/// Text written for SQL NULL in text artifacts
pub const NULL_SENTINEL: &str = "NULL";

/// One SQL statement to time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchmarkQuery {
    pub sql: String,
}

impl BenchmarkQuery {
    pub fn new(sql: impl Into<String>) -> Self {
        Self { sql: sql.into() }
    }

    /// Stable identifier of the statement text
    pub fn query_id(&self) -> String {
        let digest = Sha256::digest(self.sql.as_bytes());
        format!("{:x}", digest)[..16].to_string()
    }
}

/// Read a JSON array of statement strings
pub fn load_queries(path: &Path) -> PipelineResult<Vec<BenchmarkQuery>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        configuration_error(format!("Cannot read queries file {}: {}", path.display(), e))
    })?;
    parse_queries(&content)
}

pub fn parse_queries(content: &str) -> PipelineResult<Vec<BenchmarkQuery>> {
    let statements: Vec<String> = serde_json::from_str(content)
        .map_err(|e| configuration_error(format!("Queries must be a JSON array of strings: {}", e)))?;
    Ok(statements.into_iter().map(BenchmarkQuery::new).collect())
}

/// Displayable form of one column value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayValue {
    Null,
    Text(String),
}

impl From<Option<String>> for DisplayValue {
    fn from(value: Option<String>) -> Self {
        value.map_or(DisplayValue::Null, DisplayValue::Text)
    }
}

impl fmt::Display for DisplayValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisplayValue::Null => f.write_str(NULL_SENTINEL),
            DisplayValue::Text(text) => f.write_str(text),
        }
    }
}

impl Serialize for DisplayValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            DisplayValue::Null => serializer.serialize_none(),
            DisplayValue::Text(text) => serializer.serialize_str(text),
        }
    }
}

/// A captured row: values keyed by column name, in column order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchmarkRow {
    pub values: Vec<(String, DisplayValue)>,
}

impl Serialize for BenchmarkRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (column, value) in &self.values {
            map.serialize_entry(column, value)?;
        }
        map.end()
    }
}

impl BenchmarkRow {
    pub fn get(&self, column: &str) -> Option<&DisplayValue> {
        self.values.iter().find(|(name, _)| name == column).map(|(_, v)| v)
    }

    pub fn display_values(&self) -> Vec<String> {
        self.values.iter().map(|(_, v)| v.to_string()).collect()
    }
}

fn serialize_millis<S: Serializer>(elapsed: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(elapsed.as_secs_f64() * 1000.0)
}

/// Outcome of one timed statement
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkResult {
    pub index: usize,
    pub query: String,
    pub query_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<usize>,
    pub columns: Vec<String>,
    pub row_count: usize,
    #[serde(rename = "elapsedMs", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
    pub started_at: DateTime<Utc>,
    pub rows: Vec<BenchmarkRow>,
}

/// Aggregate timings of a benchmark pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BenchmarkSummary {
    pub checkpoint: Option<usize>,
    pub queries: usize,
    pub total_rows: usize,
    #[serde(rename = "totalElapsedMs", serialize_with = "serialize_millis")]
    pub total_elapsed: Duration,
}

impl BenchmarkSummary {
    pub fn record(&mut self, result: &BenchmarkResult) {
        self.queries += 1;
        self.total_rows += result.row_count;
        self.total_elapsed += result.elapsed;
    }
}
