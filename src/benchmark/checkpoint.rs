use super::{BenchmarkQuery, BenchmarkRunner, BenchmarkSummary, ResultSink};
use crate::db::SqlSession;
use crate::error::{configuration_error, PipelineError, PipelineResult, Stage};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub const CHECKPOINT_MARKER: &str = r"\prompt 'benchmark'";
const ESCAPED_CHECKPOINT_MARKER: &str = r"\\prompt 'benchmark'";

/// Split a data-migration script on its benchmark markers.
/// The doubly escaped marker is only honoured when the plain one is absent.
pub fn split_script(script: &str) -> Vec<&str> {
    let marker = if script.contains(CHECKPOINT_MARKER) && !only_escaped(script) {
        CHECKPOINT_MARKER
    } else if script.contains(ESCAPED_CHECKPOINT_MARKER) {
        ESCAPED_CHECKPOINT_MARKER
    } else {
        return vec![script];
    };
    script.split(marker).collect()
}

// Every plain marker is part of an escaped one
fn only_escaped(script: &str) -> bool {
    script.matches(CHECKPOINT_MARKER).count() == script.matches(ESCAPED_CHECKPOINT_MARKER).count()
}

/// Executes a data migration, benchmarking at every marker
pub struct CheckpointRunner<'a> {
    queries: &'a [BenchmarkQuery],
}

impl<'a> CheckpointRunner<'a> {
    pub fn new(queries: &'a [BenchmarkQuery]) -> Self {
        Self { queries }
    }

    pub async fn run_file<S: SqlSession + ?Sized>(
        &self,
        session: &S,
        path: &Path,
        sink: &mut dyn ResultSink,
        cancel: &CancellationToken,
    ) -> PipelineResult<Vec<BenchmarkSummary>> {
        let script = std::fs::read_to_string(path).map_err(|e| {
            configuration_error(format!("Cannot read data migration {}: {}", path.display(), e))
        })?;
        self.run_script(session, &script, sink, cancel).await
    }

    pub async fn run_script<S: SqlSession + ?Sized>(
        &self,
        session: &S,
        script: &str,
        sink: &mut dyn ResultSink,
        cancel: &CancellationToken,
    ) -> PipelineResult<Vec<BenchmarkSummary>> {
        let sections = split_script(script);
        let last = sections.len() - 1;
        let mut summaries = Vec::new();

        for (i, section) in sections.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled { stage: Stage::Migration });
            }

            let sql = section.trim();
            if !sql.is_empty() {
                info!("Applying data migration section {}", i + 1);
                session.execute(sql).await.map_err(|e| PipelineError::MigrationFailed {
                    version: None,
                    reason: format!("data migration section {} failed: {}", i + 1, e),
                })?;
            }

            if i < last {
                let checkpoint = i + 1;
                info!("Benchmark checkpoint {}", checkpoint);
                let summary = BenchmarkRunner::at_checkpoint(checkpoint)
                    .run(session, self.queries, sink)
                    .await?;
                summaries.push(summary);
            }
        }

        Ok(summaries)
    }
}
