//! Orchestrator - runs the stages of one benchmark run in order

use crate::benchmark::{BenchmarkRunner, CheckpointRunner, ResultSink};
use crate::bridge::{BridgeEstablisher, BridgeReport, BridgeSettings, CloneSelection};
use crate::connection::ConnectionTarget;
use crate::db::SqlSession;
use crate::error::{PipelineError, PipelineResult, Stage};
use crate::migration::MigrationApplier;
use crate::pipeline::types::{PipelineOutcome, PipelinePlan, RunSummary};
use crate::sandbox::{Sandbox, SandboxProvisioner};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

/// Drives provision, bridge, migrations and benchmark against one sandbox
pub struct BenchmarkPipeline<P> {
    provisioner: P,
    bridge: BridgeSettings,
}

impl<P: SandboxProvisioner> BenchmarkPipeline<P> {
    pub fn new(provisioner: P, bridge: BridgeSettings) -> Self {
        Self { provisioner, bridge }
    }

    #[cfg(test)]
    pub fn provisioner(&self) -> &P {
        &self.provisioner
    }

    /// Execute the whole run. The returned outcome owns the live sandbox;
    /// stopping it is left to the caller.
    pub async fn run(
        &self,
        plan: &PipelinePlan,
        sink: &mut dyn ResultSink,
        cancel: &CancellationToken,
    ) -> PipelineResult<PipelineOutcome<P::Sandbox>> {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id);
        self.execute(run_id, plan, sink, cancel).instrument(span).await
    }

    async fn execute(
        &self,
        run_id: Uuid,
        plan: &PipelinePlan,
        sink: &mut dyn ResultSink,
        cancel: &CancellationToken,
    ) -> PipelineResult<PipelineOutcome<P::Sandbox>> {
        info!("Benchmark run against {}", plan.target.to_display_string());

        let (sandbox, bridge, clone_attempts) = self.provision_and_clone(plan, cancel).await?;
        let session = sandbox.session();
        session.release_idle();

        let migration = match &plan.migrations {
            Some(location) => {
                ensure_active(cancel, Stage::Migration)?;
                info!("Applying migrations from {}", location);
                let report = MigrationApplier::apply(session, location).await?;
                session.release_idle();
                Some(report)
            }
            None => None,
        };

        ensure_active(cancel, Stage::Benchmark)?;
        info!("Running {} benchmark queries", plan.queries.len());
        let mut benchmarks = vec![BenchmarkRunner::new().run(session, &plan.queries, sink).await?];
        session.release_idle();

        if let Some(path) = &plan.data_migration {
            info!("Running data migration {}", path.display());
            let checkpoints = CheckpointRunner::new(&plan.queries)
                .run_file(session, path, sink, cancel)
                .await?;
            benchmarks.extend(checkpoints);
            session.release_idle();
        }

        let summary = RunSummary {
            run_id,
            connection_string: sandbox.connection_string(),
            clone_attempts,
            bridge,
            migration,
            benchmarks,
        };
        info!("Benchmark run complete, sandbox at {}", summary.connection_string);
        Ok(PipelineOutcome { sandbox, summary })
    }

    /// First attempt with the primary selection; on failure one more attempt
    /// with the fallback selection on a freshly provisioned sandbox.
    async fn provision_and_clone(
        &self,
        plan: &PipelinePlan,
        cancel: &CancellationToken,
    ) -> PipelineResult<(P::Sandbox, BridgeReport, usize)> {
        let first = match self.attempt(&plan.target, &plan.clone.primary, cancel).await {
            Ok((sandbox, report)) => return Ok((sandbox, report, 1)),
            Err(e) => e,
        };

        let fallback = match &plan.clone.fallback {
            Some(fallback) if !matches!(first, PipelineError::Cancelled { .. }) => fallback,
            _ => return Err(first),
        };

        warn!(
            "Clone of {} failed ({}), retrying with {} on a fresh sandbox",
            plan.clone.primary.describe(),
            first,
            fallback.describe()
        );

        match self.attempt(&plan.target, fallback, cancel).await {
            Ok((sandbox, report)) => Ok((sandbox, report, 2)),
            Err(second @ PipelineError::Cancelled { .. }) => Err(second),
            Err(second) => Err(PipelineError::CloneAttemptsExhausted {
                schema_level: Box::new(first),
                table_level: Box::new(second),
            }),
        }
    }

    async fn attempt(
        &self,
        target: &ConnectionTarget,
        selection: &CloneSelection,
        cancel: &CancellationToken,
    ) -> PipelineResult<(P::Sandbox, BridgeReport)> {
        info!("Cloning {}", selection.describe());
        let sandbox = self.provisioner.start(cancel).await?;

        // A failed sandbox is left running; only Sandbox::stop tears it down
        let report = BridgeEstablisher::new(&self.bridge)
            .establish_and_clone(
                sandbox.session(),
                sandbox.working_user(),
                target,
                selection,
                cancel,
            )
            .await?;
        Ok((sandbox, report))
    }
}

fn ensure_active(cancel: &CancellationToken, stage: Stage) -> PipelineResult<()> {
    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled { stage });
    }
    Ok(())
}
