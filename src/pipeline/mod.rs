//! Benchmark Pipeline Module
//!
//! Sequences the four stages of one benchmarking run against a single
//! disposable sandbox:
//!
//! 1. **Provision**: start the sandbox and lift its session timeouts
//! 2. **Bridge**: link it to the source database and clone the selection
//! 3. **Migrate**: apply the versioned migration set
//! 4. **Benchmark**: time the query list, optionally at data-migration checkpoints
//!
//! Provision + bridge are retried once with the fallback selection on a
//! fresh sandbox; every other failure ends the run.

pub mod orchestrator;
pub mod types;

pub use orchestrator::BenchmarkPipeline;
pub use types::{ClonePlan, PipelineOutcome, PipelinePlan, RunSummary};
