use super::{BenchmarkQuery, BenchmarkResult, BenchmarkRow, BenchmarkSummary, DisplayValue, ResultSink};
use crate::db::SqlSession;
use crate::error::{PipelineError, PipelineResult};
use chrono::Utc;
use std::time::Instant;
use tracing::{debug, info};

/// Runs benchmark queries one after another, recording each result
#[derive(Debug, Clone, Copy, Default)]
pub struct BenchmarkRunner {
    checkpoint: Option<usize>,
}

impl BenchmarkRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tag every result with a 1-based checkpoint number
    pub fn at_checkpoint(checkpoint: usize) -> Self {
        Self { checkpoint: Some(checkpoint) }
    }

    /// Execute `queries` in order. The first failing query aborts the run;
    /// results recorded before it stay in the sink. There is no mid-query
    /// cancellation.
    pub async fn run<S: SqlSession + ?Sized>(
        &self,
        session: &S,
        queries: &[BenchmarkQuery],
        sink: &mut dyn ResultSink,
    ) -> PipelineResult<BenchmarkSummary> {
        let mut summary = BenchmarkSummary {
            checkpoint: self.checkpoint,
            ..BenchmarkSummary::default()
        };

        for (index, query) in queries.iter().enumerate() {
            debug!("Running benchmark query {}: {}", index, query.sql);
            let started_at = Utc::now();
            let start = Instant::now();

            let result_set = session.query_text(&query.sql).await.map_err(|source| {
                PipelineError::BenchmarkQueryFailed {
                    index,
                    query: query.sql.clone(),
                    source,
                }
            })?;

            let columns = result_set.columns;
            let rows: Vec<BenchmarkRow> = result_set
                .rows
                .into_iter()
                .map(|raw| BenchmarkRow {
                    values: columns
                        .iter()
                        .cloned()
                        .zip(raw.into_iter().map(DisplayValue::from))
                        .collect(),
                })
                .collect();
            let elapsed = start.elapsed();

            let result = BenchmarkResult {
                index,
                query: query.sql.clone(),
                query_id: query.query_id(),
                checkpoint: self.checkpoint,
                row_count: rows.len(),
                columns,
                elapsed,
                started_at,
                rows,
            };

            sink.record(&result)?;
            info!("  {}", progress_line(&result));
            summary.record(&result);
        }

        info!(
            "Benchmark finished: {} queries, {} rows in {:?}",
            summary.queries, summary.total_rows, summary.total_elapsed
        );
        Ok(summary)
    }
}

/// One-line summary of a finished query for the progress log
fn progress_line(result: &BenchmarkResult) -> String {
    format!(
        "Query {}: {}: {} rows in {:?}",
        result.index, result.query, result.row_count, result.elapsed
    )
}
