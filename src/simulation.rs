//! Drawing a simulated choice from an evaluated choice set.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ChoiceError, Result};
use crate::evaluation::Evaluation;
use crate::random::RandomStream;

/// Outcome of one draw.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimulatedChoice {
    pub index: usize,
    /// Model probability of the drawn alternative.
    pub probability: f64,
}

/// A draw together with how the model scored the observed alternative.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObservedComparison {
    pub case_id: u64,
    pub simulated: SimulatedChoice,
    pub observed: usize,
    pub observed_available: bool,
    /// Whether any alternative other than the observed one was available.
    pub others_available: bool,
    /// Fitted probability of the observed alternative, when the comparison is informative
    /// (observed alternative available alongside at least one other).
    pub observed_probability: Option<f64>,
}

/// Draws one alternative using the next uniform of `stream`.
pub fn simulate_choice(evaluation: &Evaluation, stream: &mut RandomStream) -> Result<SimulatedChoice> {
    select(evaluation, stream.next_uniform())
}

/// Returns the first available alternative whose cumulative probability exceeds `draw`.
///
/// Available alternatives are walked in index order. If rounding leaves `draw` above
/// the final cumulative mass, the last alternative with positive probability wins.
pub fn select(evaluation: &Evaluation, draw: f64) -> Result<SimulatedChoice> {
    let total: f64 = evaluation
        .available_indices()
        .map(|index| evaluation.probability(index))
        .sum();
    if total.is_nan() || total <= 0.0 {
        return Err(ChoiceError::DegenerateDistribution {
            case_id: evaluation.case_id(),
            total,
        });
    }

    let mut remaining = draw;
    let mut last = None;
    for index in evaluation.available_indices() {
        let probability = evaluation.probability(index);
        if probability <= 0.0 {
            continue;
        }
        last = Some(SimulatedChoice { index, probability });
        remaining -= probability;
        if remaining < 0.0 {
            break;
        }
    }

    last.ok_or(ChoiceError::DegenerateDistribution {
        case_id: evaluation.case_id(),
        total,
    })
}

/// Draws as [`simulate_choice`] does and reports the fitted probability of `observed`.
///
/// Fails with `InvalidArgument` when `observed` is not an index of the set.
pub fn simulate_choice_with_observed(
    evaluation: &Evaluation,
    stream: &mut RandomStream,
    case_id: u64,
    observed: usize,
) -> Result<ObservedComparison> {
    if observed >= evaluation.len() {
        return Err(ChoiceError::invalid_argument(
            "test estimation",
            format!(
                "observed alternative {observed} is outside a set of {}",
                evaluation.len()
            ),
        ));
    }
    let simulated = simulate_choice(evaluation, stream)?;
    let observed_available = evaluation.is_available(observed);
    let others_available = evaluation
        .available_indices()
        .any(|index| index != observed);

    Ok(ObservedComparison {
        case_id,
        simulated,
        observed,
        observed_available,
        others_available,
        observed_probability: (observed_available && others_available)
            .then(|| evaluation.probability(observed)),
    })
}

/// Per-alternative counters of a model run in test-estimation mode.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AlternativeConsistency {
    /// Observed alternative was the only one available.
    pub chosen_only_available: u64,
    /// Observed alternative was not available.
    pub chosen_not_available: u64,
    /// Available in an informative case.
    pub available_valid: u64,
    /// Observed in an informative case.
    pub chosen_valid: u64,
    /// Drawn in an informative case.
    pub predicted: u64,
    /// Sum of fitted probabilities over informative cases.
    pub sum_probabilities: f64,
}

/// Compares simulated against observed choices across cases.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsistencySummary {
    model: String,
    alternatives: Vec<AlternativeConsistency>,
}

impl ConsistencySummary {
    /// Empty summary for `model`.
    pub fn new<S: Into<String>>(model: S) -> Self {
        Self {
            model: model.into(),
            alternatives: Vec::new(),
        }
    }

    /// Model the summary describes.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Counts per alternative index.
    pub fn alternatives(&self) -> &[AlternativeConsistency] {
        &self.alternatives
    }

    /// Counts of alternative `index`, if seen.
    pub fn alternative(&self, index: usize) -> Option<&AlternativeConsistency> {
        self.alternatives.get(index)
    }

    fn slot(&mut self, index: usize) -> &mut AlternativeConsistency {
        if index >= self.alternatives.len() {
            self.alternatives.resize_with(index + 1, Default::default);
        }
        &mut self.alternatives[index]
    }

    /// Adds one compared case.
    ///
    /// Comparisons whose indices lie outside `evaluation` are ignored.
    pub fn record(&mut self, evaluation: &Evaluation, comparison: &ObservedComparison) {
        let observed = comparison.observed;
        if observed >= evaluation.len() || comparison.simulated.index >= evaluation.len() {
            return;
        }
        if !comparison.observed_available {
            self.slot(observed).chosen_not_available += 1;
            return;
        }
        if !comparison.others_available {
            self.slot(observed).chosen_only_available += 1;
            return;
        }

        self.slot(observed).chosen_valid += 1;
        self.slot(comparison.simulated.index).predicted += 1;
        for index in evaluation.available_indices() {
            let probability = evaluation.probability(index);
            let slot = self.slot(index);
            slot.available_valid += 1;
            slot.sum_probabilities += probability;
        }
    }

    /// Folds another summary (e.g. from another worker) into this one.
    pub fn merge(&mut self, other: &ConsistencySummary) {
        if self.model.is_empty() {
            self.model = other.model.clone();
        }
        for (index, counts) in other.alternatives.iter().enumerate() {
            let slot = self.slot(index);
            slot.chosen_only_available += counts.chosen_only_available;
            slot.chosen_not_available += counts.chosen_not_available;
            slot.available_valid += counts.available_valid;
            slot.chosen_valid += counts.chosen_valid;
            slot.predicted += counts.predicted;
            slot.sum_probabilities += counts.sum_probabilities;
        }
    }

    /// Cases counted across all alternatives.
    pub fn cases(&self) -> u64 {
        self.alternatives
            .iter()
            .map(|a| a.chosen_only_available + a.chosen_not_available + a.chosen_valid)
            .sum()
    }
}

impl fmt::Display for ConsistencySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "test of estimation model {} in application mode", self.model)?;
        for (index, a) in self.alternatives.iter().enumerate() {
            writeln!(
                f,
                "alt {index} chosen_only_available={} chosen_not_available={} \
                 available_valid={} chosen_valid={} predicted={} sum_probabilities={:.4}",
                a.chosen_only_available,
                a.chosen_not_available,
                a.available_valid,
                a.chosen_valid,
                a.predicted,
                a.sum_probabilities
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use approx::assert_relative_eq;

    use super::*;
    use crate::choice_set::ChoiceSet;
    use crate::coefficients::Coefficients;
    use crate::random::StreamKey;

    fn evaluate(utilities: &[Option<f64>]) -> Evaluation {
        let coefficients = Arc::new(Coefficients::from_values("sim", &[1.0]).unwrap());
        let mut set = ChoiceSet::new(11, coefficients, false);
        for (index, utility) in utilities.iter().enumerate() {
            let alt = set.get_alternative(index, utility.is_some(), false).unwrap();
            if let Some(u) = utility {
                alt.add_utility_term(0, *u).unwrap();
            }
        }
        set.evaluate().unwrap()
    }

    #[test]
    fn draw_walks_cumulative_probability() {
        let evaluation = evaluate(&[Some(0.0), Some(1.0)]);
        assert_eq!(select(&evaluation, 0.1).unwrap().index, 0);
        assert_eq!(select(&evaluation, 0.9).unwrap().index, 1);
        let choice = select(&evaluation, 0.5).unwrap();
        assert_eq!(choice.index, 1);
        assert_relative_eq!(choice.probability, 0.731_058_578_630_004_9, epsilon = 1e-12);
    }

    #[test]
    fn unavailable_alternatives_are_never_drawn() {
        let evaluation = evaluate(&[None, Some(0.0), None, Some(0.0)]);
        assert_eq!(select(&evaluation, 0.0).unwrap().index, 1);
        assert_eq!(select(&evaluation, 0.999_999).unwrap().index, 3);
        assert_eq!(select(&evaluation, 1.0).unwrap().index, 3);
    }

    #[test]
    fn drawn_frequencies_follow_probabilities() {
        let evaluation = evaluate(&[Some(0.0), Some(1.0), Some(-0.5)]);
        let mut stream = RandomStream::new(StreamKey::new(5, 1).for_model(40, 1));
        let mut counts = [0usize; 3];
        let n = 30_000;
        for _ in 0..n {
            counts[simulate_choice(&evaluation, &mut stream).unwrap().index] += 1;
        }
        for (index, count) in counts.iter().enumerate() {
            let share = *count as f64 / n as f64;
            assert!((share - evaluation.probability(index)).abs() < 0.01);
        }
    }

    #[test]
    fn observed_comparison_feeds_summary() {
        let evaluation = evaluate(&[Some(0.0), Some(1.0), None]);
        let mut stream = RandomStream::new(StreamKey::new(1, 1));
        let before = stream.position();
        let comparison = simulate_choice_with_observed(&evaluation, &mut stream, 11, 0).unwrap();
        assert_eq!(stream.position(), before + 1);
        assert_relative_eq!(
            comparison.observed_probability.unwrap(),
            0.268_941_421_369_995_1,
            epsilon = 1e-12
        );

        let mut summary = ConsistencySummary::new("sim");
        summary.record(&evaluation, &comparison);
        let unavailable = simulate_choice_with_observed(&evaluation, &mut stream, 11, 2).unwrap();
        assert_eq!(unavailable.observed_probability, None);
        summary.record(&evaluation, &unavailable);

        assert_eq!(summary.alternative(0).unwrap().chosen_valid, 1);
        assert_eq!(summary.alternative(2).unwrap().chosen_not_available, 1);
        assert_relative_eq!(summary.alternative(1).unwrap().sum_probabilities, 0.731_058_578_630_004_9, epsilon = 1e-12);
        assert_eq!(summary.cases(), 2);

        let mut merged = ConsistencySummary::default();
        merged.merge(&summary);
        merged.merge(&summary);
        assert_eq!(merged.cases(), 4);
        assert_eq!(merged.model(), "sim");
        assert!(merged.to_string().contains("alt 2 chosen_only_available=0 chosen_not_available=2"));
    }

    #[test]
    fn observed_index_outside_the_set_is_rejected() {
        let evaluation = evaluate(&[Some(0.0), Some(1.0)]);
        let mut stream = RandomStream::new(StreamKey::new(2, 1));
        for observed in [2, usize::MAX] {
            assert!(matches!(
                simulate_choice_with_observed(&evaluation, &mut stream, 11, observed),
                Err(ChoiceError::InvalidArgument { .. })
            ));
        }

        let mut comparison = simulate_choice_with_observed(&evaluation, &mut stream, 11, 0).unwrap();
        comparison.observed = usize::MAX;
        let mut summary = ConsistencySummary::new("sim");
        summary.record(&evaluation, &comparison);
        assert_eq!(summary.cases(), 0);
        assert!(summary.alternatives().is_empty());
    }
}
