//! Fitted coefficient tables consumed by every choice model.
//!
//! Coefficients are addressed by a dense parameter index, the same index used by
//! utility terms and recorded in estimation observations. Parsing coefficient files
//! is left to the host application; this module only holds and validates the table.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{ChoiceError, Result};

/// How a coefficient participates in utility accumulation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoefficientKind {
    /// Ordinary linear utility coefficient.
    #[default]
    Regular,
    /// Size variable: contributes `value * exp(coefficient)` to the alternative size.
    Size,
    /// Base size variable: contributes `value` unscaled to the alternative size.
    BaseSize,
    /// Multiplier applied to `ln(size)` at evaluation time.
    SizeFunctionMultiplier,
    /// Nest dissimilarity parameter.
    Nest,
}

impl CoefficientKind {
    /// Classifies a coefficient from its label prefix (`Gamm`, `LSM_`, `Nest`).
    pub fn from_label(label: &str) -> Self {
        if label.starts_with("LSM_") {
            Self::SizeFunctionMultiplier
        } else if label.starts_with("Gamm") {
            Self::Size
        } else if label.starts_with("Nest") {
            Self::Nest
        } else {
            Self::Regular
        }
    }

    /// Whether terms on this coefficient feed the size function.
    pub fn is_size(self) -> bool {
        matches!(self, Self::Size | Self::BaseSize)
    }
}

/// A single fitted coefficient.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coefficient {
    pub parameter: usize,
    pub label: String,
    pub value: f64,
    /// Held fixed during estimation.
    #[serde(default)]
    pub fixed: bool,
    #[serde(default)]
    pub kind: CoefficientKind,
}

impl Coefficient {
    /// Regular coefficient with an explicit label.
    pub fn new<S: Into<String>>(parameter: usize, label: S, value: f64) -> Self {
        Self {
            parameter,
            label: label.into(),
            value,
            fixed: false,
            kind: CoefficientKind::Regular,
        }
    }

    /// Coefficient whose kind is inferred from the label prefix.
    pub fn labeled<S: Into<String>>(parameter: usize, label: S, value: f64) -> Self {
        let label = label.into();
        let kind = CoefficientKind::from_label(&label);
        Self {
            parameter,
            label,
            value,
            fixed: false,
            kind,
        }
    }

    /// Marks the coefficient as fixed during estimation.
    pub fn fixed(mut self, fixed: bool) -> Self {
        self.fixed = fixed;
        self
    }

    /// Overrides the kind inferred from the label.
    pub fn kind(mut self, kind: CoefficientKind) -> Self {
        self.kind = kind;
        self
    }
}

/// Validated, index-addressable coefficient table.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Coefficients {
    title: String,
    slots: Vec<Option<Coefficient>>,
    size_function_multiplier: Option<usize>,
}

impl Coefficients {
    /// Starts a builder for a table with the given model title.
    pub fn builder<S: Into<String>>(title: S) -> CoefficientsBuilder {
        CoefficientsBuilder::new(title)
    }

    /// Builds a table of regular coefficients from dense values (`parameter = position`).
    pub fn from_values<S: Into<String>>(title: S, values: &[f64]) -> Result<Self> {
        values
            .iter()
            .enumerate()
            .fold(CoefficientsBuilder::new(title), |builder, (parameter, value)| {
                builder.coefficient(Coefficient::new(parameter, format!("par_{parameter}"), *value))
            })
            .build()
    }

    /// Title of the table (usually the model name).
    pub fn title(&self) -> &str {
        &self.title
    }

    /// One past the highest parameter index.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when no slot is filled.
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Coefficient at `parameter`, if set.
    pub fn get(&self, parameter: usize) -> Option<&Coefficient> {
        self.slots.get(parameter).and_then(Option::as_ref)
    }

    /// Value of the coefficient at `parameter`, if set.
    pub fn value(&self, parameter: usize) -> Option<f64> {
        self.get(parameter).map(|c| c.value)
    }

    /// Value of the size-function multiplier, or `1.0` when the model has none.
    pub fn size_function_multiplier(&self) -> f64 {
        self.size_function_multiplier
            .and_then(|parameter| self.value(parameter))
            .unwrap_or(1.0)
    }

    /// Iterates over the defined coefficients in parameter order.
    pub fn iter(&self) -> impl Iterator<Item = &Coefficient> {
        self.slots.iter().flatten()
    }
}

/// Builder that validates the table before constructing [`Coefficients`].
#[derive(Debug)]
pub struct CoefficientsBuilder {
    title: String,
    coefficients: Vec<Coefficient>,
}

impl CoefficientsBuilder {
    /// Starts an empty table titled `title`.
    pub fn new<S: Into<String>>(title: S) -> Self {
        Self {
            title: title.into(),
            coefficients: Vec::new(),
        }
    }

    /// Adds one coefficient.
    pub fn coefficient(mut self, coefficient: Coefficient) -> Self {
        self.coefficients.push(coefficient);
        self
    }

    /// Finalizes construction after checking for duplicates and non-finite values.
    ///
    /// The first fixed, zero-valued size coefficient is promoted to the base size
    /// variable when no base size coefficient was declared explicitly.
    pub fn build(self) -> Result<Coefficients> {
        let mut seen = HashSet::new();
        let mut multiplier = None;
        let max = self
            .coefficients
            .iter()
            .map(|c| c.parameter + 1)
            .max()
            .unwrap_or(0);
        let mut slots = vec![None; max];
        let mut has_base_size = self
            .coefficients
            .iter()
            .any(|c| c.kind == CoefficientKind::BaseSize);

        for mut coefficient in self.coefficients {
            if !seen.insert(coefficient.parameter) {
                return Err(ChoiceError::InvalidCoefficients {
                    reason: format!("parameter {} defined twice", coefficient.parameter),
                });
            }
            if !coefficient.value.is_finite() {
                return Err(ChoiceError::InvalidCoefficients {
                    reason: format!(
                        "parameter {} ({}) has non-finite value {}",
                        coefficient.parameter, coefficient.label, coefficient.value
                    ),
                });
            }
            match coefficient.kind {
                CoefficientKind::SizeFunctionMultiplier => {
                    if multiplier.replace(coefficient.parameter).is_some() {
                        return Err(ChoiceError::InvalidCoefficients {
                            reason: "more than one size function multiplier".to_string(),
                        });
                    }
                }
                CoefficientKind::Size
                    if !has_base_size && coefficient.fixed && coefficient.value.abs() < 1e-12 =>
                {
                    coefficient.kind = CoefficientKind::BaseSize;
                    has_base_size = true;
                }
                _ => {}
            }
            let parameter = coefficient.parameter;
            slots[parameter] = Some(coefficient);
        }

        Ok(Coefficients {
            title: self.title,
            slots,
            size_function_multiplier: multiplier,
        })
    }
}

/// Anything that can hand a model its fitted coefficients at initialization.
pub trait CoefficientSource {
    fn load(&self) -> Result<Arc<Coefficients>>;
}

impl CoefficientSource for Coefficients {
    fn load(&self) -> Result<Arc<Coefficients>> {
        Ok(Arc::new(self.clone()))
    }
}

impl CoefficientSource for Arc<Coefficients> {
    fn load(&self) -> Result<Arc<Coefficients>> {
        Ok(Arc::clone(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_classifies_and_promotes_base_size() {
        let table = Coefficients::builder("destination")
            .coefficient(Coefficient::new(1, "dist", -0.5))
            .coefficient(Coefficient::labeled(4, "Gamm_emp", 0.0).fixed(true))
            .coefficient(Coefficient::labeled(5, "Gamm_hh", -1.2))
            .coefficient(Coefficient::labeled(6, "LSM_size", 0.8))
            .build()
            .expect("valid table");

        assert_eq!(table.len(), 7);
        assert!(table.get(0).is_none());
        assert_eq!(table.get(4).unwrap().kind, CoefficientKind::BaseSize);
        assert_eq!(table.get(5).unwrap().kind, CoefficientKind::Size);
        assert_eq!(table.size_function_multiplier(), 0.8);
    }

    #[test]
    fn builder_rejects_duplicates() {
        let result = Coefficients::builder("m")
            .coefficient(Coefficient::new(1, "a", 1.0))
            .coefficient(Coefficient::new(1, "b", 2.0))
            .build();
        assert!(matches!(result, Err(ChoiceError::InvalidCoefficients { .. })));
    }

    #[test]
    fn missing_multiplier_defaults_to_one() {
        let table = Coefficients::from_values("m", &[0.1, 0.2]).unwrap();
        assert_eq!(table.size_function_multiplier(), 1.0);
        assert_eq!(table.value(1), Some(0.2));
    }
}
