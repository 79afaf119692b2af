//! Execution protocol shared by every choice model.
//!
//! A [`ChoiceModel`] is initialized once with its coefficients and the engine options,
//! which fix the [`ExecutionMode`] it runs in. Each [`ChoiceModel::run`] then builds the
//! alternatives of one case in the worker's choice set and, depending on the mode,
//! records the observation, compares a draw with the observed choice, or draws.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::alternative::Choice;
use crate::choice_set::ChoiceSet;
use crate::coefficients::{CoefficientSource, Coefficients};
use crate::error::{ChoiceError, Result};
use crate::observation::ObservationSink;
use crate::options::{EngineOptions, ExecutionMode};
use crate::pool::WorkerContext;
use crate::random::{RandomStream, StreamKey};
use crate::simulation::{self, ObservedComparison, SimulatedChoice};

/// One decision to evaluate: who decides, when, and what was observed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Case {
    pub case_id: u64,
    pub entity_id: u64,
    pub day: u32,
    /// Distinguishes repeated calls of one model for the same entity (e.g. tour number).
    pub call_index: u32,
    /// Observed alternative index, when known.
    pub observed: Option<usize>,
}

impl Case {
    /// A case identified by its entity id.
    pub fn new(entity_id: u64, day: u32) -> Self {
        Self {
            case_id: entity_id,
            entity_id,
            day,
            call_index: 0,
            observed: None,
        }
    }

    /// Overrides the case id used in outcomes and observations.
    pub fn with_case_id(mut self, case_id: u64) -> Self {
        self.case_id = case_id;
        self
    }

    /// Sets the call index mixed into the stream key.
    pub fn with_call_index(mut self, call_index: u32) -> Self {
        self.call_index = call_index;
        self
    }

    /// Sets the observed alternative index.
    pub fn with_observed(mut self, observed: usize) -> Self {
        self.observed = Some(observed);
        self
    }

    /// Stream key of this case for a model with `model_constant`.
    pub fn stream_key(&self, model_constant: u32) -> StreamKey {
        StreamKey::new(self.entity_id, self.day).for_model(model_constant, self.call_index)
    }
}

/// What a run produced.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    /// Estimation: the observation was written.
    Recorded { case_id: u64 },
    /// Estimation or test-estimation: the case was not a usable observation.
    Skipped { case_id: u64, reason: String },
    /// Application: the drawn alternative and the choice-set logsum.
    Simulated {
        case_id: u64,
        choice: SimulatedChoice,
        payload: Option<Choice>,
        logsum: f64,
    },
    /// Test-estimation: draw plus fitted probability of the observed choice.
    Tested(ObservedComparison),
}

impl Outcome {
    /// Case the outcome belongs to.
    pub fn case_id(&self) -> u64 {
        match self {
            Self::Recorded { case_id }
            | Self::Skipped { case_id, .. }
            | Self::Simulated { case_id, .. } => *case_id,
            Self::Tested(comparison) => comparison.case_id,
        }
    }

    /// Index of the simulated alternative, if a draw took place.
    pub fn chosen_index(&self) -> Option<usize> {
        match self {
            Self::Simulated { choice, .. } => Some(choice.index),
            Self::Tested(comparison) => Some(comparison.simulated.index),
            _ => None,
        }
    }
}

/// A named model bound to its coefficients and execution mode.
#[derive(Clone, Debug)]
pub struct ChoiceModel {
    name: String,
    coefficients: Arc<Coefficients>,
    model_constant: u32,
    mode: ExecutionMode,
    trace: bool,
}

impl ChoiceModel {
    /// Loads coefficients and resolves the mode this model runs in.
    pub fn run_initialize<S>(name: &str, source: &S, options: &EngineOptions) -> Result<Self>
    where
        S: CoefficientSource + ?Sized,
    {
        if name.is_empty() {
            return Err(ChoiceError::invalid_argument("model initialization", "empty model name"));
        }
        let coefficients = source.load()?;
        let mode = options.mode_for(name);
        log::debug!(
            "initialized model {name} ({} coefficients, mode {mode:?})",
            coefficients.iter().count()
        );
        Ok(Self {
            name: name.to_string(),
            coefficients,
            model_constant: 0,
            mode,
            trace: options.trace_simulated_choices,
        })
    }

    /// Sets the constant mixed into every stream key of this model.
    pub fn with_model_constant(mut self, model_constant: u32) -> Self {
        self.model_constant = model_constant;
        self
    }

    /// Name the model was initialized with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mode resolved for this model.
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Constant mixed into stream keys.
    pub fn model_constant(&self) -> u32 {
        self.model_constant
    }

    /// Coefficient table shared by every run.
    pub fn coefficients(&self) -> &Arc<Coefficients> {
        &self.coefficients
    }

    /// Runs one case in the worker's context.
    ///
    /// `build` fills the choice set; it receives the case stream so samplers can derive
    /// their sub-streams from it. In estimation mode `case.observed`, when given, is
    /// marked chosen after `build` returns; an observed choice that is missing or
    /// unavailable skips the case. Test-estimation skips an observed index outside the
    /// choice set.
    pub fn run<S, F>(&self, context: &mut WorkerContext<S>, case: &Case, build: F) -> Result<Outcome>
    where
        S: ObservationSink,
        F: FnOnce(&mut ChoiceSet, &mut RandomStream) -> Result<()>,
    {
        let estimating = self.mode.is_estimation();
        context
            .choice_set
            .start(case.case_id, Arc::clone(&self.coefficients), estimating);
        let mut stream = RandomStream::new(case.stream_key(self.model_constant));
        build(&mut context.choice_set, &mut stream)?;

        match self.mode {
            ExecutionMode::Estimation => self.record(context, case),
            ExecutionMode::TestEstimationInApplication => {
                let Some(observed) = case.observed else {
                    return self.simulate(context, case, &mut stream);
                };
                let evaluation = context.choice_set.evaluate()?;
                if observed >= evaluation.len() {
                    log::warn!(
                        "{}: entity {} skipped: observed alternative {observed} is not in a set of {}",
                        self.name,
                        case.entity_id,
                        evaluation.len()
                    );
                    return Ok(Outcome::Skipped {
                        case_id: case.case_id,
                        reason: format!("observed alternative {observed} out of range"),
                    });
                }
                let comparison = simulation::simulate_choice_with_observed(
                    &evaluation,
                    &mut stream,
                    case.case_id,
                    observed,
                )?;
                context.consistency.record(&evaluation, &comparison);
                Ok(Outcome::Tested(comparison))
            }
            ExecutionMode::Application => self.simulate(context, case, &mut stream),
        }
    }

    fn record<S: ObservationSink>(&self, context: &mut WorkerContext<S>, case: &Case) -> Result<Outcome> {
        if context.recorder.model() != self.name {
            context.recorder.set_model(self.name.as_str());
        }
        if let Some(observed) = case.observed {
            if let Err(err) = context.choice_set.mark_chosen(observed) {
                log::warn!("{}: entity {} skipped: {err}", self.name, case.entity_id);
                context.recorder.reject();
                return Ok(Outcome::Skipped {
                    case_id: case.case_id,
                    reason: err.to_string(),
                });
            }
        }

        if context.recorder.write_observation(&context.choice_set)? {
            Ok(Outcome::Recorded {
                case_id: case.case_id,
            })
        } else {
            Ok(Outcome::Skipped {
                case_id: case.case_id,
                reason: "invalid observation".to_string(),
            })
        }
    }

    fn simulate<S>(
        &self,
        context: &mut WorkerContext<S>,
        case: &Case,
        stream: &mut RandomStream,
    ) -> Result<Outcome> {
        let evaluation = context.choice_set.evaluate()?;
        let choice = simulation::simulate_choice(&evaluation, stream)?;
        if self.trace {
            log::trace!(
                "{}: entity {} chose alternative {} (p = {:.6})",
                self.name,
                case.entity_id,
                choice.index,
                choice.probability
            );
        }
        Ok(Outcome::Simulated {
            case_id: case.case_id,
            choice,
            payload: context
                .choice_set
                .alternative(choice.index)
                .and_then(|alternative| alternative.payload().cloned()),
            logsum: evaluation.compute_logsum(),
        })
    }

    /// Evaluates this model as a sub-model and returns its logsum.
    ///
    /// Uses a fresh choice set, so it can be called from inside another model's
    /// `build` closure. Returns `0.0` when nothing is available.
    pub fn nested_logsum<F>(&self, case_id: u64, build: F) -> Result<f64>
    where
        F: FnOnce(&mut ChoiceSet) -> Result<()>,
    {
        let mut set = ChoiceSet::new(case_id, Arc::clone(&self.coefficients), false);
        build(&mut set)?;
        match set.evaluate() {
            Ok(evaluation) => Ok(evaluation.compute_logsum()),
            Err(ChoiceError::NoAvailableAlternatives { .. }) => Ok(0.0),
            Err(err) => Err(err),
        }
    }
}
