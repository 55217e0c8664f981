//! Runs the stage graph to completion for one PDF.
//!
//! ## Scheduling
//!
//! The executor works in waves. Each wave collects every node whose
//! predecessors all completed, runs them concurrently against the same
//! snapshot of the state, and waits for all of them (the join barrier).
//! Their updates are then applied in declaration order, and the next wave
//! starts. A node whose predecessor failed or was skipped is itself marked
//! skipped, so only the branch below a failure is lost.
//!
//! ## Failure scopes
//!
//! | Node        | On failure                                   |
//! |-------------|----------------------------------------------|
//! | mandatory   | run aborted → `Err(IngestError::StageFailed)` |
//! | optional    | recorded, dependents skipped, run continues  |
//!
//! Every invocation goes through [`crate::retry::with_retry`], so a node
//! only counts as failed once its retries are spent.

use crate::error::{IngestError, StageError};
use crate::graph::{Node, PipelineGraph, StageId};
use crate::progress::{NoopProgressCallback, ProgressCallback};
use crate::retry::{with_retry, RetryPolicy};
use crate::state::ArtifactState;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// How a single node ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Completed { duration_ms: u64 },
    Failed { error: StageError },
    /// Not run because `blocked_by` failed or was skipped.
    Skipped { blocked_by: StageId },
}

impl StageOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, StageOutcome::Completed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Complete,
    /// At least one optional node failed or was skipped.
    Partial,
}

/// Result of one executor run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub state: ArtifactState,
    pub outcomes: BTreeMap<StageId, StageOutcome>,
}

impl RunReport {
    pub fn status(&self) -> RunStatus {
        if self.outcomes.values().all(StageOutcome::is_completed) {
            RunStatus::Complete
        } else {
            RunStatus::Partial
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status() == RunStatus::Complete
    }

    /// Nodes that failed or were skipped, in stage order.
    pub fn incomplete_stages(&self) -> Vec<StageId> {
        self.outcomes
            .iter()
            .filter(|(_, o)| !o.is_completed())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn outcome(&self, id: StageId) -> Option<&StageOutcome> {
        self.outcomes.get(&id)
    }

    /// Treat a partial run as an error.
    pub fn into_result(self) -> Result<ArtifactState, IngestError> {
        match self.status() {
            RunStatus::Complete => Ok(self.state),
            RunStatus::Partial => Err(IngestError::PartialPipelineFailure {
                file: self.state.file_name(),
                failed: self.incomplete_stages(),
            }),
        }
    }
}

/// Walks a [`PipelineGraph`] over one [`ArtifactState`].
pub struct Executor {
    graph: Arc<PipelineGraph>,
    retry: RetryPolicy,
    progress: ProgressCallback,
}

impl Executor {
    pub fn new(graph: Arc<PipelineGraph>, retry: RetryPolicy) -> Self {
        Self {
            graph,
            retry,
            progress: Arc::new(NoopProgressCallback),
        }
    }

    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = progress;
        self
    }

    pub fn graph(&self) -> &PipelineGraph {
        &self.graph
    }

    /// Run every node once. Returns `Err` only when a mandatory node fails.
    pub async fn run(&self, mut state: ArtifactState) -> Result<RunReport, IngestError> {
        let file = state.file_name();
        let mut outcomes: BTreeMap<StageId, StageOutcome> = BTreeMap::new();
        let started = Instant::now();

        loop {
            self.propagate_skips(&mut outcomes);

            let ready: Vec<&Node> = self
                .graph
                .nodes()
                .iter()
                .filter(|n| !outcomes.contains_key(&n.id()))
                .filter(|n| {
                    n.predecessors
                        .iter()
                        .all(|p| outcomes.get(p).is_some_and(StageOutcome::is_completed))
                })
                .collect();
            if ready.is_empty() {
                break;
            }

            let snapshot = &state;
            let results = join_all(ready.iter().map(|node| {
                let file = file.as_str();
                async move {
                    let id = node.id();
                    let label = format!("{}/{}", file, id);
                    self.progress.on_stage_start(file, id);
                    debug!("{}: starting", label);
                    let t0 = Instant::now();
                    let result =
                        with_retry(&self.retry, &label, || node.stage.run(snapshot)).await;
                    (node, result, t0.elapsed().as_millis() as u64)
                }
            }))
            .await;

            for (node, result, duration_ms) in results {
                let id = node.id();
                match result {
                    Ok(update) => {
                        state.apply(update);
                        debug!("{}/{}: completed in {} ms", file, id, duration_ms);
                        self.progress.on_stage_complete(&file, id, duration_ms);
                        outcomes.insert(id, StageOutcome::Completed { duration_ms });
                    }
                    Err(err) if node.mandatory => {
                        error!("{}: mandatory stage '{}' failed: {}", file, id, err);
                        self.progress.on_stage_error(&file, id, &err.to_string());
                        return Err(IngestError::StageFailed {
                            file,
                            stage: id,
                            source: err,
                        });
                    }
                    Err(err) => {
                        warn!("{}: stage '{}' failed, dependents skipped: {}", file, id, err);
                        self.progress.on_stage_error(&file, id, &err.to_string());
                        outcomes.insert(id, StageOutcome::Failed { error: err });
                    }
                }
            }
        }

        let report = RunReport { state, outcomes };
        match report.status() {
            RunStatus::Complete => info!(
                "{}: all {} stages completed in {:.1}s",
                file,
                report.outcomes.len(),
                started.elapsed().as_secs_f64()
            ),
            RunStatus::Partial => warn!(
                "{}: partial run, incomplete stages: {:?}",
                file,
                report.incomplete_stages()
            ),
        }
        Ok(report)
    }

    /// Mark every undecided node with a failed or skipped predecessor as skipped.
    fn propagate_skips(&self, outcomes: &mut BTreeMap<StageId, StageOutcome>) {
        let mut changed = true;
        while changed {
            changed = false;
            for node in self.graph.nodes() {
                if outcomes.contains_key(&node.id()) {
                    continue;
                }
                let blocker = node
                    .predecessors
                    .iter()
                    .find(|p| outcomes.get(*p).is_some_and(|o| !o.is_completed()));
                if let Some(&blocked_by) = blocker {
                    debug!("stage '{}' skipped, blocked by '{}'", node.id(), blocked_by);
                    outcomes.insert(node.id(), StageOutcome::Skipped { blocked_by });
                    changed = true;
                }
            }
        }
    }
}
