//! Per-case container of alternatives and nest links.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::alternative::{Alternative, NestRef, UtilityComponent};
use crate::coefficients::Coefficients;
use crate::error::{ChoiceError, Result};
use crate::evaluation::{self, Evaluation};

/// The alternatives of one case, owned by the worker evaluating it.
///
/// Slots are dense by alternative index; the set itself is reused from case to case.
#[derive(Clone, Debug)]
pub struct ChoiceSet {
    case_id: u64,
    coefficients: Arc<Coefficients>,
    recording: bool,
    alternatives: Vec<Option<Alternative>>,
    nest_parents: BTreeMap<usize, NestRef>,
}

impl ChoiceSet {
    /// Creates an empty set for `case_id`. `recording` keeps raw terms for estimation.
    pub fn new(case_id: u64, coefficients: Arc<Coefficients>, recording: bool) -> Self {
        Self {
            case_id,
            coefficients,
            recording,
            alternatives: Vec::new(),
            nest_parents: BTreeMap::new(),
        }
    }

    /// Clears the set for another case.
    pub(crate) fn start(&mut self, case_id: u64, coefficients: Arc<Coefficients>, recording: bool) {
        self.case_id = case_id;
        self.coefficients = coefficients;
        self.recording = recording;
        self.alternatives.clear();
        self.nest_parents.clear();
    }

    /// Case the set currently holds.
    pub fn case_id(&self) -> u64 {
        self.case_id
    }

    /// Whether raw terms are kept for estimation.
    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Coefficient table shared by the alternatives.
    pub fn coefficients(&self) -> &Arc<Coefficients> {
        &self.coefficients
    }

    /// Number of alternative slots (one past the highest index used).
    pub fn len(&self) -> usize {
        self.alternatives.len()
    }

    /// True when no alternative has been created.
    pub fn is_empty(&self) -> bool {
        self.alternatives.iter().all(Option::is_none)
    }

    /// Creates or resets the alternative at `index`.
    ///
    /// Fails with [`ChoiceError::InconsistentChosenAlternative`] when `chosen` is set
    /// on an unavailable alternative.
    pub fn get_alternative(
        &mut self,
        index: usize,
        available: bool,
        chosen: bool,
    ) -> Result<&mut Alternative> {
        if chosen && !available {
            log::error!(
                "case {}: alternative {index} marked chosen while unavailable",
                self.case_id
            );
            return Err(ChoiceError::InconsistentChosenAlternative { index });
        }
        if index >= self.alternatives.len() {
            self.alternatives.resize_with(index + 1, || None);
        }

        let recording = self.recording;
        let coefficients = &self.coefficients;
        let alternative = self.alternatives[index].get_or_insert_with(|| {
            Alternative::new(index, available, chosen, Arc::clone(coefficients), recording)
        });
        alternative.reset(available, chosen, recording);
        Ok(alternative)
    }

    /// Alternative at `index`, if created.
    pub fn alternative(&self, index: usize) -> Option<&Alternative> {
        self.alternatives.get(index).and_then(Option::as_ref)
    }

    /// Mutable alternative at `index`, if created.
    pub fn alternative_mut(&mut self, index: usize) -> Option<&mut Alternative> {
        self.alternatives.get_mut(index).and_then(Option::as_mut)
    }

    /// Iterates over populated alternatives in index order.
    pub fn alternatives(&self) -> impl Iterator<Item = &Alternative> {
        self.alternatives.iter().flatten()
    }

    /// A fresh component sharing this set's coefficients and recording mode.
    pub fn new_utility_component(&self, index: usize) -> UtilityComponent {
        UtilityComponent::new(index, Arc::clone(&self.coefficients), self.recording)
    }

    /// Nests `child_nest` inside `parent_nest`, whose theta is `theta_parameter`.
    pub fn add_nested_nest(&mut self, child_nest: usize, parent_nest: usize, theta_parameter: usize) {
        self.nest_parents.insert(
            child_nest,
            NestRef {
                id: parent_nest,
                theta_parameter,
            },
        );
    }

    pub(crate) fn nest_parents(&self) -> &BTreeMap<usize, NestRef> {
        &self.nest_parents
    }

    /// Marks the observed alternative as chosen.
    ///
    /// A missing or unavailable alternative is inconsistent with the observation.
    pub fn mark_chosen(&mut self, index: usize) -> Result<()> {
        match self.alternative_mut(index) {
            Some(alternative) if alternative.is_available() => {
                alternative.mark_chosen();
                Ok(())
            }
            _ => Err(ChoiceError::InconsistentChosenAlternative { index }),
        }
    }

    /// Indices of all alternatives flagged as chosen.
    pub fn chosen_indices(&self) -> Vec<usize> {
        self.alternatives()
            .filter(|a| a.is_chosen())
            .map(Alternative::index)
            .collect()
    }

    /// Number of available alternatives.
    pub fn available_count(&self) -> usize {
        self.alternatives().filter(|a| a.is_available()).count()
    }

    /// Evaluates nested logit probabilities over the current alternatives.
    pub fn evaluate(&self) -> Result<Evaluation> {
        evaluation::evaluate(self)
    }
}
