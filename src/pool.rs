//! Worker contexts and the parallel batch runner.
//!
//! Each worker owns one reusable [`ChoiceSet`], one observation recorder and one
//! consistency summary. The scheduler hands a context to exactly one task at a time,
//! so no locking is needed; results depend only on the cases, never on how they were
//! split across workers.

use std::sync::Arc;

use rayon::prelude::*;

use crate::choice_set::ChoiceSet;
use crate::error::Result;
use crate::model::{Case, ChoiceModel, Outcome};
use crate::observation::{EstimationSummary, MemorySink, ObservationRecorder, ObservationSink};
use crate::options::EngineOptions;
use crate::random::RandomStream;
use crate::simulation::ConsistencySummary;

/// Per-worker mutable state.
#[derive(Debug)]
pub struct WorkerContext<S = MemorySink> {
    id: usize,
    pub(crate) choice_set: ChoiceSet,
    pub(crate) recorder: ObservationRecorder<S>,
    pub(crate) consistency: ConsistencySummary,
}

impl<S: ObservationSink> WorkerContext<S> {
    /// Creates an idle context writing observations to `sink`.
    pub fn new(id: usize, sink: S) -> Self {
        Self {
            id,
            choice_set: ChoiceSet::new(0, Arc::default(), false),
            recorder: ObservationRecorder::new("", sink),
            consistency: ConsistencySummary::default(),
        }
    }
}

impl<S> WorkerContext<S> {
    /// Worker slot index.
    pub fn id(&self) -> usize {
        self.id
    }

    /// The choice set of the last case run on this worker.
    pub fn choice_set(&self) -> &ChoiceSet {
        &self.choice_set
    }

    /// Observation recorder of this worker.
    pub fn recorder(&self) -> &ObservationRecorder<S> {
        &self.recorder
    }

    /// Mutable observation recorder of this worker.
    pub fn recorder_mut(&mut self) -> &mut ObservationRecorder<S> {
        &mut self.recorder
    }

    /// Test-mode counts of this worker.
    pub fn consistency(&self) -> &ConsistencySummary {
        &self.consistency
    }
}

/// A fixed set of worker contexts.
#[derive(Debug)]
pub struct CalculatorPool<S = MemorySink> {
    workers: Vec<WorkerContext<S>>,
}

impl<S> CalculatorPool<S>
where
    S: ObservationSink + Send,
{
    /// Creates `workers` contexts (at least one), each with a sink from `sink`.
    pub fn new<F>(workers: usize, mut sink: F) -> Self
    where
        F: FnMut(usize) -> S,
    {
        Self {
            workers: (0..workers.max(1))
                .map(|id| WorkerContext::new(id, sink(id)))
                .collect(),
        }
    }

    /// One context per configured worker.
    pub fn from_options<F>(options: &EngineOptions, sink: F) -> Self
    where
        F: FnMut(usize) -> S,
    {
        Self::new(options.workers, sink)
    }

    /// Number of worker contexts.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Always false; a pool has at least one worker.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Worker contexts in slot order.
    pub fn workers(&self) -> &[WorkerContext<S>] {
        &self.workers
    }

    /// Consumes the pool, returning its contexts.
    pub fn into_workers(self) -> Vec<WorkerContext<S>> {
        self.workers
    }

    /// Runs `model` over `cases`, splitting them into contiguous chunks, one per worker.
    ///
    /// Results come back in case order. A failing case is logged with its entity id and
    /// returned as an error; it never stops the rest of the batch.
    pub fn run_batch<F>(&mut self, model: &ChoiceModel, cases: &[Case], build: F) -> Vec<Result<Outcome>>
    where
        F: Fn(&Case, &mut ChoiceSet, &mut RandomStream) -> Result<()> + Sync,
    {
        if cases.is_empty() {
            return Vec::new();
        }
        let chunk_size = cases.len().div_ceil(self.workers.len());

        let results: Vec<Result<Outcome>> = self
            .workers
            .par_iter_mut()
            .zip(cases.par_chunks(chunk_size))
            .map(|(worker, chunk)| {
                chunk
                    .iter()
                    .map(|case| {
                        let result = model.run(worker, case, |set, stream| build(case, set, stream));
                        if let Err(err) = &result {
                            log::warn!("{}: entity {} failed: {err}", model.name(), case.entity_id);
                        }
                        result
                    })
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>()
            .into_iter()
            .flatten()
            .collect();

        let failed = results.iter().filter(|r| r.is_err()).count();
        log::debug!(
            "{}: ran {} cases on {} workers ({failed} failed)",
            model.name(),
            cases.len(),
            self.workers.len()
        );
        results
    }

    /// Estimation statistics merged over all workers.
    pub fn estimation_summary(&self) -> EstimationSummary {
        let mut summary = EstimationSummary::default();
        for worker in &self.workers {
            summary.merge(worker.recorder.summary());
        }
        summary
    }

    /// Test-mode consistency counts merged over all workers.
    pub fn consistency_summary(&self) -> ConsistencySummary {
        let mut summary = ConsistencySummary::default();
        for worker in &self.workers {
            summary.merge(&worker.consistency);
        }
        summary
    }
}
