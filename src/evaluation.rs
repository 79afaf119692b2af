//! Nested logit evaluation: conditional probabilities and logsums through a nest tree.
//!
//! Every nest `n` with dissimilarity `theta_n` has logsum
//! `LS_n = ln sum_c exp(V_c / theta_n)` over its available children and passes
//! `theta_n * LS_n` to its parent. The implicit root has `theta = 1`, so its logsum is
//! the composite utility other models consume as an accessibility term.

use std::collections::BTreeMap;

use nalgebra::DVector;

use crate::choice_set::ChoiceSet;
use crate::error::{ChoiceError, Result};

/// Probabilities and logsums of one evaluated choice set.
#[derive(Clone, Debug)]
pub struct Evaluation {
    case_id: u64,
    utilities: DVector<f64>,
    probabilities: DVector<f64>,
    nest_logsums: BTreeMap<usize, f64>,
    logsum: f64,
}

impl Evaluation {
    /// Case the evaluation belongs to.
    pub fn case_id(&self) -> u64 {
        self.case_id
    }

    /// Unconditional probability per alternative slot; zero for unavailable slots.
    pub fn probabilities(&self) -> &DVector<f64> {
        &self.probabilities
    }

    /// Unconditional probability of `index`; zero when unknown or unavailable.
    pub fn probability(&self, index: usize) -> f64 {
        self.probabilities.get(index).copied().unwrap_or(0.0)
    }

    /// Total utility entering the evaluation, `None` for unavailable alternatives.
    pub fn utility(&self, index: usize) -> Option<f64> {
        self.utilities
            .get(index)
            .copied()
            .filter(|u| u.is_finite())
    }

    /// Whether `index` entered the evaluation.
    pub fn is_available(&self, index: usize) -> bool {
        self.utility(index).is_some()
    }

    /// Available slots in index order.
    pub fn available_indices(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.utilities.len()).filter(move |&index| self.is_available(index))
    }

    /// Logsum of the whole choice set (root nest).
    pub fn compute_logsum(&self) -> f64 {
        self.logsum
    }

    /// `LS_n` of an inner nest, before scaling by its theta.
    pub fn nest_logsum(&self, nest_id: usize) -> Option<f64> {
        self.nest_logsums.get(&nest_id).copied()
    }

    /// Sum of all probabilities (one for a proper distribution).
    pub fn total_probability(&self) -> f64 {
        self.probabilities.iter().sum()
    }

    /// Number of alternative slots covered.
    pub fn len(&self) -> usize {
        self.probabilities.len()
    }

    /// True when the set had no slots.
    pub fn is_empty(&self) -> bool {
        self.probabilities.is_empty()
    }
}

#[derive(Clone, Copy, Debug)]
enum Child {
    Alternative(usize),
    Nest(usize),
}

#[derive(Clone, Debug)]
struct NestState {
    theta: f64,
    parent: Option<usize>,
    depth: usize,
    logsum: f64,
    value: f64,
}

/// `ln sum exp(v)` with the maximum factored out; `-inf` for an empty or all `-inf` input.
pub fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    let sum: f64 = values.iter().map(|v| (v - max).exp()).sum();
    max + sum.ln()
}

/// Evaluates the choice set bottom-up for logsums, then top-down for probabilities.
pub fn evaluate(set: &ChoiceSet) -> Result<Evaluation> {
    let case_id = set.case_id();
    let n = set.len();

    let mut utilities = DVector::from_element(n, f64::NEG_INFINITY);
    for alternative in set.alternatives().filter(|a| a.is_available()) {
        utilities[alternative.index()] = alternative.total_utility();
    }

    let mut nests = collect_nests(set)?;

    let mut children: BTreeMap<Option<usize>, Vec<Child>> = BTreeMap::new();
    for alternative in set.alternatives().filter(|a| a.is_available()) {
        children
            .entry(alternative.nest().map(|nest| nest.id))
            .or_default()
            .push(Child::Alternative(alternative.index()));
    }
    for (id, nest) in &nests {
        children
            .entry(nest.parent)
            .or_default()
            .push(Child::Nest(*id));
    }

    let mut order: Vec<usize> = nests.keys().copied().collect();
    order.sort_by_key(|id| std::cmp::Reverse(nests[id].depth));

    for id in &order {
        let theta = nests[id].theta;
        let scaled: Vec<f64> = children
            .get(&Some(*id))
            .map(|members| {
                members
                    .iter()
                    .map(|child| child_value(*child, &utilities, &nests) / theta)
                    .collect()
            })
            .unwrap_or_default();
        let logsum = log_sum_exp(&scaled);
        if let Some(state) = nests.get_mut(id) {
            state.logsum = logsum;
            state.value = theta * logsum;
        }
    }

    let root_values: Vec<f64> = children
        .get(&None)
        .map(|members| {
            members
                .iter()
                .map(|child| child_value(*child, &utilities, &nests))
                .collect()
        })
        .unwrap_or_default();
    let logsum = log_sum_exp(&root_values);
    if logsum == f64::NEG_INFINITY {
        return Err(ChoiceError::NoAvailableAlternatives { case_id });
    }
    if !logsum.is_finite() {
        return Err(ChoiceError::DegenerateDistribution {
            case_id,
            total: logsum,
        });
    }

    let mut probabilities = DVector::zeros(n);
    let mut nest_probabilities: BTreeMap<usize, f64> = BTreeMap::new();
    for (child, value) in children
        .get(&None)
        .into_iter()
        .flatten()
        .zip(root_values.iter())
    {
        assign(
            &mut probabilities,
            &mut nest_probabilities,
            *child,
            conditional(*value, 1.0, logsum),
        );
    }

    for id in order.iter().rev() {
        let state = &nests[id];
        let parent_probability = nest_probabilities.get(id).copied().unwrap_or(0.0);
        for child in children.get(&Some(*id)).into_iter().flatten() {
            let value = child_value(*child, &utilities, &nests);
            assign(
                &mut probabilities,
                &mut nest_probabilities,
                *child,
                parent_probability * conditional(value, state.theta, state.logsum),
            );
        }
    }

    Ok(Evaluation {
        case_id,
        utilities,
        probabilities,
        nest_logsums: nests
            .iter()
            .map(|(id, state)| (*id, state.logsum))
            .collect(),
        logsum,
    })
}

fn assign(
    probabilities: &mut DVector<f64>,
    nest_probabilities: &mut BTreeMap<usize, f64>,
    child: Child,
    probability: f64,
) {
    match child {
        Child::Alternative(index) => probabilities[index] = probability,
        Child::Nest(id) => {
            nest_probabilities.insert(id, probability);
        }
    }
}

fn conditional(value: f64, theta: f64, logsum: f64) -> f64 {
    if value == f64::NEG_INFINITY || logsum == f64::NEG_INFINITY {
        0.0
    } else {
        (value / theta - logsum).exp()
    }
}

fn child_value(child: Child, utilities: &DVector<f64>, nests: &BTreeMap<usize, NestState>) -> f64 {
    match child {
        Child::Alternative(index) => utilities[index],
        Child::Nest(id) => nests.get(&id).map_or(f64::NEG_INFINITY, |nest| nest.value),
    }
}

fn register(
    registry: &mut BTreeMap<usize, usize>,
    nest_id: usize,
    theta_parameter: usize,
) -> Result<()> {
    match registry.insert(nest_id, theta_parameter) {
        Some(previous) if previous != theta_parameter => Err(ChoiceError::invalid_argument(
            "nest registration",
            format!(
                "nest {nest_id} declared with theta parameters {previous} and {theta_parameter}"
            ),
        )),
        _ => Ok(()),
    }
}

fn collect_nests(set: &ChoiceSet) -> Result<BTreeMap<usize, NestState>> {
    let mut registry = BTreeMap::new();
    for parent in set.nest_parents().values() {
        register(&mut registry, parent.id, parent.theta_parameter)?;
    }
    for nest in set.alternatives().filter_map(|a| a.nest()) {
        register(&mut registry, nest.id, nest.theta_parameter)?;
    }
    for child in set.nest_parents().keys() {
        if !registry.contains_key(child) {
            return Err(ChoiceError::invalid_argument(
                "nest registration",
                format!("nest {child} has a parent but neither members nor a theta"),
            ));
        }
    }

    let coefficients = set.coefficients();
    let mut nests = BTreeMap::new();
    for (&id, &parameter) in &registry {
        let theta = coefficients.value(parameter).unwrap_or(f64::NAN);
        if !(theta > 0.0 && theta <= 1.0) {
            return Err(ChoiceError::InvalidTheta {
                nest_id: id,
                parameter,
                theta,
            });
        }
        nests.insert(
            id,
            NestState {
                theta,
                parent: set.nest_parents().get(&id).map(|parent| parent.id),
                depth: 0,
                logsum: f64::NEG_INFINITY,
                value: f64::NEG_INFINITY,
            },
        );
    }

    let ids: Vec<usize> = nests.keys().copied().collect();
    for id in ids {
        let mut depth = 0;
        let mut cursor = nests[&id].parent;
        while let Some(parent) = cursor {
            depth += 1;
            if depth > nests.len() {
                return Err(ChoiceError::invalid_argument(
                    "nest registration",
                    format!("nest {id} is part of a parent cycle"),
                ));
            }
            cursor = nests.get(&parent).and_then(|nest| nest.parent);
        }
        if let Some(state) = nests.get_mut(&id) {
            state.depth = depth;
        }
    }

    Ok(nests)
}
