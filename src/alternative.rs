//! Utility accumulation for single alternatives and reusable utility components.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::coefficients::{CoefficientKind, Coefficients};
use crate::error::{ChoiceError, Result};

/// The real-world object an alternative stands for, carried through evaluation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Choice {
    /// A plain alternative number (mode, pattern, count).
    Index(usize),
    /// Reference to an external entity such as a parcel.
    Entity(u64),
    /// Tuple of schedule values (arrival/departure periods, duration).
    Schedule(Vec<i32>),
}

/// One `(coefficient index, value)` pair as recorded for estimation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct UtilityTerm {
    pub coefficient: usize,
    pub value: f64,
}

/// Nest membership: the nest identifier and the coefficient holding its theta.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NestRef {
    pub id: usize,
    pub theta_parameter: usize,
}

/// Shared accumulation state for alternatives and components.
#[derive(Clone, Debug, Default)]
struct Accumulator {
    utility: f64,
    size: f64,
    terms: Vec<UtilityTerm>,
}

impl Accumulator {
    fn reset(&mut self) {
        self.utility = 0.0;
        self.size = 0.0;
        self.terms.clear();
    }

    fn add(
        &mut self,
        coefficients: &Coefficients,
        recording: bool,
        owner: usize,
        parameter: usize,
        value: f64,
    ) -> Result<()> {
        if !value.is_finite() {
            return Err(ChoiceError::NonFiniteUtilityTerm {
                index: owner,
                coefficient: parameter,
                value,
            });
        }

        let Some(coefficient) = coefficients.get(parameter) else {
            return Ok(());
        };

        if recording {
            self.record(UtilityTerm {
                coefficient: parameter,
                value,
            });
        }

        if value == 0.0 {
            return Ok(());
        }

        match coefficient.kind {
            CoefficientKind::BaseSize => self.size += value,
            CoefficientKind::Size => self.size += value * coefficient.value.exp(),
            CoefficientKind::SizeFunctionMultiplier => {}
            CoefficientKind::Regular | CoefficientKind::Nest => {
                self.utility += value * coefficient.value
            }
        }
        Ok(())
    }

    fn record(&mut self, term: UtilityTerm) {
        match self
            .terms
            .iter_mut()
            .find(|existing| existing.coefficient == term.coefficient)
        {
            Some(existing) => existing.value += term.value,
            None => self.terms.push(term),
        }
    }

    fn merge(&mut self, other: &Accumulator, recording: bool) {
        self.utility += other.utility;
        self.size += other.size;
        if recording {
            for term in &other.terms {
                self.record(*term);
            }
        }
    }
}

/// One candidate in a choice set.
#[derive(Clone, Debug)]
pub struct Alternative {
    index: usize,
    available: bool,
    chosen: bool,
    nest: Option<NestRef>,
    payload: Option<Choice>,
    accumulator: Accumulator,
    coefficients: Arc<Coefficients>,
    recording: bool,
}

impl Alternative {
    pub(crate) fn new(
        index: usize,
        available: bool,
        chosen: bool,
        coefficients: Arc<Coefficients>,
        recording: bool,
    ) -> Self {
        Self {
            index,
            available,
            chosen,
            nest: None,
            payload: None,
            accumulator: Accumulator::default(),
            coefficients,
            recording,
        }
    }

    /// Reinitializes a slot for a new case, keeping its term buffer.
    pub(crate) fn reset(&mut self, available: bool, chosen: bool, recording: bool) {
        self.available = available;
        self.chosen = chosen;
        self.nest = None;
        self.payload = None;
        self.accumulator.reset();
        self.recording = recording;
    }

    /// Dense index of the alternative within its choice set.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Whether the alternative takes part in the evaluation.
    pub fn is_available(&self) -> bool {
        self.available
    }

    /// Withdraws the alternative, e.g. when the time window rules it out.
    ///
    /// A chosen alternative stays chosen; the observation boundary rejects the case.
    pub fn set_available(&mut self, available: bool) {
        self.available = available;
    }

    /// Ground-truth chosen flag set while building the case.
    pub fn is_chosen(&self) -> bool {
        self.chosen
    }

    pub(crate) fn mark_chosen(&mut self) {
        self.chosen = true;
    }

    /// Utility accumulated from regular terms (size function not applied).
    pub fn utility(&self) -> f64 {
        self.accumulator.utility
    }

    /// Accumulated size from size and base-size terms.
    pub fn size(&self) -> f64 {
        self.accumulator.size
    }

    /// Raw `(coefficient, value)` terms recorded for estimation.
    pub fn terms(&self) -> &[UtilityTerm] {
        &self.accumulator.terms
    }

    /// Nest this alternative belongs to, if any.
    pub fn nest(&self) -> Option<NestRef> {
        self.nest
    }

    /// Real-world object the alternative stands for.
    pub fn payload(&self) -> Option<&Choice> {
        self.payload.as_ref()
    }

    /// Attaches the real-world object the alternative stands for.
    pub fn set_payload(&mut self, payload: Choice) {
        self.payload = Some(payload);
    }

    /// Adds `coefficient[parameter] * value` to the utility (or size).
    ///
    /// Unknown parameters contribute nothing. While recording for estimation the raw
    /// pair is kept regardless of value.
    pub fn add_utility_term(&mut self, parameter: usize, value: f64) -> Result<()> {
        self.accumulator.add(
            &self.coefficients,
            self.recording,
            self.index,
            parameter,
            value,
        )
    }

    /// Adds a precomputed component shared between alternatives.
    pub fn add_utility_component(&mut self, component: &UtilityComponent) {
        self.accumulator
            .merge(&component.accumulator, self.recording);
    }

    /// Places the alternative in nest `nest_id`, whose theta is `theta_parameter`.
    pub fn add_nested_alternative(&mut self, nest_id: usize, theta_parameter: usize) {
        self.nest = Some(NestRef {
            id: nest_id,
            theta_parameter,
        });
    }

    /// Utility used by the evaluator: regular utility plus the size function term.
    pub(crate) fn total_utility(&self) -> f64 {
        let size = self.accumulator.size;
        if size >= f64::EPSILON {
            self.accumulator.utility + size.ln() * self.coefficients.size_function_multiplier()
        } else {
            self.accumulator.utility
        }
    }

    /// Whether any recorded term sits on a size coefficient, and whether one is non-zero.
    pub(crate) fn size_term_status(&self) -> (bool, bool) {
        let mut uses_size = false;
        let mut has_nonzero = false;
        for term in &self.accumulator.terms {
            let is_size = self
                .coefficients
                .get(term.coefficient)
                .map_or(false, |c| c.kind.is_size());
            if is_size {
                uses_size = true;
                has_nonzero |= term.value.abs() > f64::EPSILON;
            }
        }
        (uses_size, has_nonzero)
    }
}

/// Partial utility built once and added to several alternatives.
#[derive(Clone, Debug)]
pub struct UtilityComponent {
    index: usize,
    accumulator: Accumulator,
    coefficients: Arc<Coefficients>,
    recording: bool,
}

impl UtilityComponent {
    pub(crate) fn new(index: usize, coefficients: Arc<Coefficients>, recording: bool) -> Self {
        Self {
            index,
            accumulator: Accumulator::default(),
            coefficients,
            recording,
        }
    }

    /// Index of the alternative the component was created for.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Utility accumulated from regular terms.
    pub fn utility(&self) -> f64 {
        self.accumulator.utility
    }

    /// Accumulated size from size and base-size terms.
    pub fn size(&self) -> f64 {
        self.accumulator.size
    }

    /// Adds `coefficient[parameter] * value` to the component.
    pub fn add_utility_term(&mut self, parameter: usize, value: f64) -> Result<()> {
        self.accumulator.add(
            &self.coefficients,
            self.recording,
            self.index,
            parameter,
            value,
        )
    }
}
