//! Discrete-choice evaluation for activity-based travel demand microsimulation.
//!
//! This crate turns a set of candidate alternatives (destinations, modes, schedules,
//! activity patterns) into nested logit choice probabilities, draws reproducible
//! stochastic choices, and in estimation mode records observations for offline
//! coefficient fitting. It offers tools to
//!
//! - hold validated coefficient tables (`coefficients` module),
//! - accumulate utilities and nest alternatives (`alternative`, `choice_set`),
//! - evaluate nested logit probabilities and logsums (`evaluation` module),
//! - derive entity-keyed random streams and draw choices (`random`, `simulation`),
//! - sample destinations from a large universe with correction terms (`sampling`),
//! - write estimation observations as JSON lines (`observation` module), and
//! - run models per case in the three execution modes over a worker pool (`model`, `pool`).
//!
//! Per-model utility specifications, skims and coefficient file parsing are left to
//! the host application.
//!
//! # Quick start
//!
//! ```no_run
//! use nlchoice::{Case, ChoiceModel, CalculatorPool, Coefficients, EngineOptions, MemorySink};
//!
//! let coefficients = Coefficients::from_values("TourMode", &[1.0, -0.05]).expect("valid table");
//! let model = ChoiceModel::run_initialize("TourMode", &coefficients, &EngineOptions::default())
//!     .expect("model initialized")
//!     .with_model_constant(40);
//!
//! let cases: Vec<Case> = (1..=100).map(|household| Case::new(household, 1)).collect();
//! let mut pool = CalculatorPool::new(4, |_| MemorySink::default());
//!
//! let outcomes = pool.run_batch(&model, &cases, |case, set, _stream| {
//!     for (index, time) in [20.0, 35.0, 50.0].iter().enumerate() {
//!         let alternative = set.get_alternative(index, true, false)?;
//!         alternative.add_utility_term(0, 1.0 - index as f64 * 0.5)?;
//!         alternative.add_utility_term(1, time + case.entity_id as f64 % 7.0)?;
//!     }
//!     Ok(())
//! });
//!
//! for outcome in outcomes.into_iter().flatten() {
//!     println!("case {} chose {:?}", outcome.case_id(), outcome.chosen_index());
//! }
//! ```

pub mod alternative;
pub mod choice_set;
pub mod coefficients;
pub mod error;
pub mod evaluation;
pub mod model;
pub mod observation;
pub mod options;
pub mod pool;
pub mod random;
pub mod sampling;
pub mod simulation;

pub use alternative::{Alternative, Choice, UtilityComponent, UtilityTerm};
pub use choice_set::ChoiceSet;
pub use coefficients::{Coefficient, CoefficientKind, CoefficientSource, Coefficients};
pub use error::{ChoiceError, Result};
pub use evaluation::Evaluation;
pub use model::{Case, ChoiceModel, Outcome};
pub use observation::{JsonLinesSink, MemorySink, ObservationRecord, ObservationRecorder, ObservationSink};
pub use options::{EngineOptions, ExecutionMode, SamplingOptions};
pub use pool::{CalculatorPool, WorkerContext};
pub use random::{RandomStream, StreamKey, STREAM_HASH_VERSION};
pub use sampling::{DestinationSampler, IntermediateStopSampler, SampleItem, SampleUniverse, UniverseElement};
pub use simulation::{ConsistencySummary, SimulatedChoice};
