//! Estimation-mode observation records and the sinks they are written to.
//!
//! Each accepted case becomes one [`ObservationRecord`]: the chosen alternative and
//! the raw `(coefficient, value)` terms of every alternative, which is all an offline
//! maximum-likelihood fit needs. [`JsonLinesSink`] writes one JSON object per line:
//!
//! ```text
//! {"model":"m","case_id":7,"chosen":1,"alternatives":[{"index":0,"available":true,"terms":[[0,1.5]]}]}
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::choice_set::ChoiceSet;
use crate::error::Result;

/// Recorded terms of one alternative.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AlternativeObservation {
    pub index: usize,
    pub available: bool,
    /// `(coefficient index, value)` pairs; empty for unavailable alternatives.
    pub terms: Vec<(usize, f64)>,
}

/// One estimation observation. Immutable once written.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObservationRecord {
    pub model: String,
    pub case_id: u64,
    pub chosen: usize,
    pub alternatives: Vec<AlternativeObservation>,
}

impl ObservationRecord {
    fn from_set(model: &str, set: &ChoiceSet, chosen: usize) -> Self {
        let alternatives = set
            .alternatives()
            .map(|alternative| AlternativeObservation {
                index: alternative.index(),
                available: alternative.is_available(),
                terms: if alternative.is_available() {
                    alternative
                        .terms()
                        .iter()
                        .map(|term| (term.coefficient, term.value))
                        .collect()
                } else {
                    Vec::new()
                },
            })
            .collect();

        Self {
            model: model.to_string(),
            case_id: set.case_id(),
            chosen,
            alternatives,
        }
    }
}

/// Destination for accepted observations.
pub trait ObservationSink {
    fn write(&mut self, record: &ObservationRecord) -> Result<()>;
}

/// Writes records as JSON lines, flushing after every record.
#[derive(Debug)]
pub struct JsonLinesSink<W: Write> {
    writer: W,
}

impl<W: Write> JsonLinesSink<W> {
    /// Wraps `writer`.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Borrows the underlying writer.
    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    /// Returns the underlying writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> ObservationSink for JsonLinesSink<W> {
    fn write(&mut self, record: &ObservationRecord) -> Result<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Keeps records in memory.
#[derive(Clone, Debug, Default)]
pub struct MemorySink {
    records: Vec<ObservationRecord>,
}

impl MemorySink {
    /// Records written so far.
    pub fn records(&self) -> &[ObservationRecord] {
        &self.records
    }

    /// Removes and returns the records written so far.
    pub fn take(&mut self) -> Vec<ObservationRecord> {
        std::mem::take(&mut self.records)
    }
}

impl ObservationSink for MemorySink {
    fn write(&mut self, record: &ObservationRecord) -> Result<()> {
        self.records.push(record.clone());
        Ok(())
    }
}

/// Why a case was not written.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rejection {
    NoChosenAlternative,
    MultipleChosenAlternatives(usize),
    /// The chosen alternative was withdrawn after being marked.
    ChosenUnavailable(usize),
    /// The chosen alternative uses size terms but all of them are zero.
    ChosenWithoutSize(usize),
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoChosenAlternative => write!(f, "no chosen alternative"),
            Self::MultipleChosenAlternatives(n) => write!(f, "{n} chosen alternatives"),
            Self::ChosenUnavailable(index) => {
                write!(f, "chosen alternative {index} is not available")
            }
            Self::ChosenWithoutSize(index) => {
                write!(f, "chosen alternative {index} has zero size")
            }
        }
    }
}

/// Returns the chosen index when the set is a usable observation.
pub fn validate(set: &ChoiceSet) -> std::result::Result<usize, Rejection> {
    let chosen = set.chosen_indices();
    let index = match chosen.as_slice() {
        [] => return Err(Rejection::NoChosenAlternative),
        [index] => *index,
        many => return Err(Rejection::MultipleChosenAlternatives(many.len())),
    };

    let Some(alternative) = set.alternative(index) else {
        return Err(Rejection::NoChosenAlternative);
    };
    if !alternative.is_available() {
        return Err(Rejection::ChosenUnavailable(index));
    }
    match alternative.size_term_status() {
        (true, false) => Err(Rejection::ChosenWithoutSize(index)),
        _ => Ok(index),
    }
}

/// Occurrence counts of one alternative over accepted observations.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AlternativeOccurrences {
    pub chosen: u64,
    /// Available, and carrying a non-zero size term when the set uses size variables.
    pub available: u64,
}

/// Sum and non-zero count of one coefficient's recorded values.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TermTotals {
    pub total_value: f64,
    pub non_zero: u64,
}

/// Descriptive statistics over the observations of one model.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EstimationSummary {
    pub accepted: u64,
    pub rejected: u64,
    pub alternatives: Vec<AlternativeOccurrences>,
    pub coefficients: BTreeMap<usize, TermTotals>,
}

impl EstimationSummary {
    fn occurrences(&mut self, index: usize) -> &mut AlternativeOccurrences {
        if index >= self.alternatives.len() {
            self.alternatives.resize_with(index + 1, Default::default);
        }
        &mut self.alternatives[index]
    }

    fn add(&mut self, set: &ChoiceSet) {
        let uses_size = set.alternatives().any(|a| a.size_term_status().0);
        for alternative in set.alternatives() {
            let has_size = alternative.size_term_status().1;
            let counted = alternative.is_available() && (!uses_size || has_size);
            let occurrences = self.occurrences(alternative.index());
            occurrences.chosen += u64::from(alternative.is_chosen());
            occurrences.available += u64::from(counted);

            if !alternative.is_available() {
                continue;
            }
            for term in alternative.terms() {
                let totals = self.coefficients.entry(term.coefficient).or_default();
                totals.total_value += term.value;
                if term.value.abs() > f64::EPSILON {
                    totals.non_zero += 1;
                }
            }
        }
    }

    /// Adds the counts of `other` (e.g. another worker's summary).
    pub fn merge(&mut self, other: &EstimationSummary) {
        self.accepted += other.accepted;
        self.rejected += other.rejected;
        for (index, counts) in other.alternatives.iter().enumerate() {
            let occurrences = self.occurrences(index);
            occurrences.chosen += counts.chosen;
            occurrences.available += counts.available;
        }
        for (parameter, totals) in &other.coefficients {
            let entry = self.coefficients.entry(*parameter).or_default();
            entry.total_value += totals.total_value;
            entry.non_zero += totals.non_zero;
        }
    }
}

/// Validates cases and writes the accepted ones to a sink.
#[derive(Debug)]
pub struct ObservationRecorder<S = MemorySink> {
    model: String,
    sink: S,
    summary: EstimationSummary,
}

impl<S: ObservationSink> ObservationRecorder<S> {
    /// Creates a recorder for `model` writing to `sink`.
    pub fn new<M: Into<String>>(model: M, sink: S) -> Self {
        Self {
            model: model.into(),
            sink,
            summary: EstimationSummary::default(),
        }
    }

    /// Model whose observations are being recorded.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Switches to recording `model`.
    pub fn set_model<M: Into<String>>(&mut self, model: M) {
        self.model = model.into();
    }

    /// Borrows the sink.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Mutably borrows the sink.
    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Returns the sink.
    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Statistics over the cases seen so far.
    pub fn summary(&self) -> &EstimationSummary {
        &self.summary
    }

    /// Writes the case if it is a valid observation.
    ///
    /// Returns `Ok(false)` for rejected cases; only sink failures are errors.
    pub fn write_observation(&mut self, set: &ChoiceSet) -> Result<bool> {
        let chosen = match validate(set) {
            Ok(chosen) => chosen,
            Err(rejection) => {
                log::warn!(
                    "{}: case {} rejected: {rejection}",
                    self.model,
                    set.case_id()
                );
                self.summary.rejected += 1;
                return Ok(false);
            }
        };

        let record = ObservationRecord::from_set(&self.model, set, chosen);
        self.sink.write(&record)?;
        self.summary.accepted += 1;
        self.summary.add(set);
        Ok(true)
    }

    /// Counts a case skipped before it reached the recorder.
    pub(crate) fn reject(&mut self) {
        self.summary.rejected += 1;
    }
}

impl fmt::Display for EstimationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "accepted={} rejected={}", self.accepted, self.rejected)?;
        for (index, counts) in self.alternatives.iter().enumerate() {
            writeln!(f, "alt {index} chosen={} available={}", counts.chosen, counts.available)?;
        }
        for (parameter, totals) in &self.coefficients {
            let mean = if self.accepted > 0 {
                totals.total_value / self.accepted as f64
            } else {
                0.0
            };
            writeln!(f, "coef {parameter} non_zero={} mean={mean:.4}", totals.non_zero)?;
        }
        Ok(())
    }
}
