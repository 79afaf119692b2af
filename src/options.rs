//! Engine and sampler configuration.
//!
//! All options are plain values with serde support so the host application can load
//! them from whatever configuration file it already reads.

use serde::{Deserialize, Serialize};

/// How a model run treats the alternatives it builds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    /// Record observed choices for offline coefficient fitting; no draw.
    Estimation,
    /// Simulate with the observed choice injected and compare fitted probabilities.
    TestEstimationInApplication,
    /// Draw a stochastic choice.
    #[default]
    Application,
}

impl ExecutionMode {
    /// True for [`ExecutionMode::Estimation`].
    pub fn is_estimation(self) -> bool {
        self == Self::Estimation
    }
}

/// Process-wide engine settings, read once and passed by value into model runs.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Configured execution mode.
    pub mode: ExecutionMode,
    /// Name of the single model estimated when `mode` is not `Application`.
    pub estimation_model: Option<String>,
    /// Log every simulated outcome at trace level.
    pub trace_simulated_choices: bool,
    /// Number of worker slots in the calculator pool.
    pub workers: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Application,
            estimation_model: None,
            trace_simulated_choices: false,
            workers: 1,
        }
    }
}

impl EngineOptions {
    /// Estimate `model` while every other model runs in application mode.
    pub fn estimating<S: Into<String>>(model: S) -> Self {
        Self {
            mode: ExecutionMode::Estimation,
            estimation_model: Some(model.into()),
            ..Self::default()
        }
    }

    /// Set the configured execution mode.
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the model estimated or tested outside application mode.
    pub fn with_estimation_model<S: Into<String>>(mut self, model: S) -> Self {
        self.estimation_model = Some(model.into());
        self
    }

    /// Log every simulated outcome at trace level.
    pub fn with_trace_simulated_choices(mut self, trace: bool) -> Self {
        self.trace_simulated_choices = trace;
        self
    }

    /// Set the number of worker slots (at least one).
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Mode a particular model runs in under this configuration.
    ///
    /// Only the configured estimation model leaves application mode.
    pub fn mode_for(&self, model_name: &str) -> ExecutionMode {
        match self.mode {
            ExecutionMode::Application => ExecutionMode::Application,
            mode if self.estimation_model.as_deref() == Some(model_name) => mode,
            _ => ExecutionMode::Application,
        }
    }
}

/// Configuration for the importance-sampling destination sampler.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingOptions {
    /// Number of draws per case.
    pub sample_size: usize,
    /// Elements with size below this are rejected and redrawn.
    pub minimum_size: f64,
    /// Redraw limit for a single draw before giving up.
    pub max_draw_attempts: usize,
}

impl Default for SamplingOptions {
    fn default() -> Self {
        Self {
            sample_size: 20,
            minimum_size: 0.0,
            max_draw_attempts: 1_000,
        }
    }
}

impl SamplingOptions {
    /// Set the number of draws per case.
    pub fn with_sample_size(mut self, sample_size: usize) -> Self {
        self.sample_size = sample_size;
        self
    }

    /// Set the size below which drawn elements are rejected.
    pub fn with_minimum_size(mut self, minimum_size: f64) -> Self {
        self.minimum_size = minimum_size;
        self
    }

    /// Set the redraw limit per draw (at least one).
    pub fn with_max_draw_attempts(mut self, attempts: usize) -> Self {
        self.max_draw_attempts = attempts.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_estimated_model_leaves_application_mode() {
        let options = EngineOptions::estimating("WorkLocation");
        assert_eq!(options.mode_for("WorkLocation"), ExecutionMode::Estimation);
        assert_eq!(options.mode_for("TourMode"), ExecutionMode::Application);

        let testing = options.with_mode(ExecutionMode::TestEstimationInApplication);
        assert_eq!(
            testing.mode_for("WorkLocation"),
            ExecutionMode::TestEstimationInApplication
        );
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let options: EngineOptions =
            serde_json::from_str(r#"{ "mode": "Estimation", "estimation_model": "m" }"#).unwrap();
        assert_eq!(options.mode, ExecutionMode::Estimation);
        assert_eq!(options.workers, 1);

        let sampling: SamplingOptions = serde_json::from_str(r#"{ "sample_size": 5 }"#).unwrap();
        assert_eq!(sampling.sample_size, 5);
        assert_eq!(sampling.max_draw_attempts, 1_000);
    }
}
