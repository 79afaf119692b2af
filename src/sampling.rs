//! Importance sampling of destination alternatives from a large universe.
//!
//! A draw first picks a stratum (zone) with probability proportional to a
//! caller-supplied weight, then an element (parcel) inside the stratum with probability
//! proportional to its size. Draws are made with replacement; an element drawn `f`
//! times out of `n` with per-draw probability `p` gets the additive utility correction
//! `-ln(n * p / f)`, which keeps the sampled-set logit consistent with the full set.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::alternative::{Alternative, Choice};
use crate::choice_set::ChoiceSet;
use crate::error::{ChoiceError, Result};
use crate::options::{ExecutionMode, SamplingOptions};
use crate::random::RandomStream;

const PROBABILITY_EPSILON: f64 = 1e-40;

/// A candidate destination.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct UniverseElement {
    pub id: u64,
    pub stratum: usize,
    pub size: f64,
}

impl UniverseElement {
    /// Element `id` in `stratum` with attraction `size`.
    pub fn new(id: u64, stratum: usize, size: f64) -> Self {
        Self { id, stratum, size }
    }
}

#[derive(Clone, Debug)]
struct Stratum {
    /// Element positions, largest size first.
    ranked: Vec<usize>,
    total_size: f64,
}

/// Elements partitioned into strata. Read-only once built and shared across workers.
#[derive(Clone, Debug)]
pub struct SampleUniverse {
    elements: Vec<UniverseElement>,
    strata: BTreeMap<usize, Stratum>,
    positions: HashMap<u64, usize>,
}

impl SampleUniverse {
    /// Builds the universe from elements with unique ids and finite, non-negative sizes.
    pub fn new(elements: Vec<UniverseElement>) -> Result<Self> {
        let mut positions = HashMap::with_capacity(elements.len());
        let mut strata: BTreeMap<usize, Stratum> = BTreeMap::new();

        for (position, element) in elements.iter().enumerate() {
            if !element.size.is_finite() || element.size < 0.0 {
                return Err(ChoiceError::invalid_argument(
                    "sample universe",
                    format!("element {} has invalid size {}", element.id, element.size),
                ));
            }
            if positions.insert(element.id, position).is_some() {
                return Err(ChoiceError::invalid_argument(
                    "sample universe",
                    format!("element {} appears twice", element.id),
                ));
            }
            let stratum = strata.entry(element.stratum).or_insert_with(|| Stratum {
                ranked: Vec::new(),
                total_size: 0.0,
            });
            stratum.ranked.push(position);
            stratum.total_size += element.size;
        }

        for stratum in strata.values_mut() {
            stratum
                .ranked
                .sort_by(|a, b| elements[*b].size.total_cmp(&elements[*a].size));
        }

        Ok(Self {
            elements,
            strata,
            positions,
        })
    }

    /// Partitions arbitrary items using a mapping to [`UniverseElement`].
    pub fn partition<T, F>(items: &[T], element: F) -> Result<Self>
    where
        F: Fn(&T) -> UniverseElement,
    {
        Self::new(items.iter().map(element).collect())
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// True when the universe has no element.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Element with `id`, if present.
    pub fn element(&self, id: u64) -> Option<&UniverseElement> {
        self.positions.get(&id).map(|position| &self.elements[*position])
    }

    /// Stratum ids in ascending order.
    pub fn strata(&self) -> impl Iterator<Item = usize> + '_ {
        self.strata.keys().copied()
    }

    /// Total element size of `stratum`; zero when unknown.
    pub fn stratum_size(&self, stratum: usize) -> f64 {
        self.strata.get(&stratum).map_or(0.0, |s| s.total_size)
    }
}

/// One sampled (or forced, usual, or oddball) alternative.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SampleItem {
    /// Universe element; `None` for the oddball alternative.
    pub element: Option<UniverseElement>,
    pub alternative_index: usize,
    pub available: bool,
    pub is_chosen: bool,
    /// The entity's usual location (e.g. regular workplace), kept in every sample.
    pub is_usual: bool,
    /// Additive log correction for the sampling.
    pub adjustment_factor: f64,
    /// Per-draw probability of selecting this element.
    pub sampling_probability: f64,
}

impl SampleItem {
    /// True for the unsampled catch-all alternative.
    pub fn is_oddball(&self) -> bool {
        self.element.is_none()
    }

    fn oddball(alternative_index: usize) -> Self {
        Self {
            element: None,
            alternative_index,
            available: true,
            is_chosen: false,
            is_usual: false,
            adjustment_factor: 0.0,
            sampling_probability: 1.0,
        }
    }
}

/// Distinct drawn positions in first-draw order, with their frequencies.
#[derive(Debug, Default)]
struct Draws {
    order: Vec<(usize, u32)>,
    slots: HashMap<usize, usize>,
}

impl Draws {
    fn add(&mut self, position: usize) {
        match self.slots.get(&position) {
            Some(&slot) => self.order[slot].1 += 1,
            None => self.insert(position),
        }
    }

    /// Appends `position` with frequency one unless it was already drawn.
    fn insert(&mut self, position: usize) {
        if !self.slots.contains_key(&position) {
            self.slots.insert(position, self.order.len());
            self.order.push((position, 1));
        }
    }
}

/// Stratified destination sampler for one origin.
///
/// Draws that land on an element below `minimum_size` are thrown away and redrawn, so
/// the reported probabilities are conditional on a draw being accepted.
#[derive(Debug)]
pub struct DestinationSampler<'a> {
    universe: &'a SampleUniverse,
    options: SamplingOptions,
    mode: ExecutionMode,
    /// Every stratum with positive weight.
    stratum_weights: HashMap<usize, f64>,
    /// `(stratum, weight)` of strata that can yield an accepted draw, heaviest first.
    weights: Vec<(usize, f64)>,
    total_weight: f64,
    /// Size of the non-excluded elements at or above `minimum_size`, per weighted stratum.
    eligible_size: HashMap<usize, f64>,
    /// Probability that a single attempt is accepted.
    accepted_mass: f64,
    excluded: HashSet<usize>,
    excluded_size: HashMap<usize, f64>,
    usual: Option<usize>,
}

impl<'a> DestinationSampler<'a> {
    /// Creates a sampler with stratum weights from `weight` (e.g. attraction from the origin).
    pub fn new<W>(
        universe: &'a SampleUniverse,
        options: SamplingOptions,
        mode: ExecutionMode,
        weight: W,
    ) -> Result<Self>
    where
        W: Fn(usize) -> f64,
    {
        if options.sample_size == 0 {
            return Err(ChoiceError::invalid_argument(
                "destination sampling",
                "sample size must be positive",
            ));
        }

        let mut stratum_weights = HashMap::new();
        let mut eligible_size = HashMap::new();
        for (stratum, members) in &universe.strata {
            let w = weight(*stratum);
            if !w.is_finite() || w < 0.0 {
                return Err(ChoiceError::insufficient_universe(format!(
                    "stratum {stratum} has invalid weight {w}"
                )));
            }
            if w > 0.0 {
                let eligible: f64 = members
                    .ranked
                    .iter()
                    .map(|position| universe.elements[*position].size)
                    .take_while(|size| *size >= options.minimum_size)
                    .sum();
                stratum_weights.insert(*stratum, w);
                eligible_size.insert(*stratum, eligible);
            }
        }
        if stratum_weights.is_empty() {
            return Err(ChoiceError::insufficient_universe("total stratum weight is zero"));
        }

        let mut sampler = Self {
            universe,
            options,
            mode,
            stratum_weights,
            weights: Vec::new(),
            total_weight: 0.0,
            eligible_size,
            accepted_mass: 0.0,
            excluded: HashSet::new(),
            excluded_size: HashMap::new(),
            usual: None,
        };
        sampler.refresh();
        if sampler.weights.is_empty() {
            return Err(ChoiceError::insufficient_universe(format!(
                "no weighted stratum has an element of size {} or more",
                sampler.options.minimum_size
            )));
        }
        Ok(sampler)
    }

    /// Creates a sampler from dense per-stratum weights indexed by stratum id.
    pub fn with_stratum_weights(
        universe: &'a SampleUniverse,
        options: SamplingOptions,
        mode: ExecutionMode,
        weights: &[f64],
    ) -> Result<Self> {
        let required = universe.strata().last().map_or(0, |stratum| stratum + 1);
        if weights.len() < required {
            return Err(ChoiceError::dimension_mismatch(
                "stratum weights",
                required,
                weights.len(),
            ));
        }
        Self::new(universe, options, mode, |stratum| weights[stratum])
    }

    /// Never draws element `id` (e.g. the origin) and removes its size from its stratum.
    ///
    /// A stratum left with nothing drawable drops out of the stratum draw.
    pub fn exclude(mut self, id: u64) -> Self {
        if let Some(&position) = self.universe.positions.get(&id) {
            if self.excluded.insert(position) {
                let element = self.universe.elements[position];
                *self.excluded_size.entry(element.stratum).or_default() += element.size;
                if element.size >= self.options.minimum_size {
                    if let Some(eligible) = self.eligible_size.get_mut(&element.stratum) {
                        *eligible -= element.size;
                    }
                }
                self.refresh();
            }
        }
        self
    }

    /// Keeps element `id`, the entity's usual location, in every sample.
    ///
    /// It is appended after the draws (and after a forced chosen element) unless it was
    /// drawn, in which case the drawn item is flagged instead.
    pub fn with_usual(mut self, id: u64) -> Result<Self> {
        let Some(&position) = self.universe.positions.get(&id) else {
            return Err(ChoiceError::invalid_argument(
                "destination sampling",
                format!("usual element {id} is not in the universe"),
            ));
        };
        self.usual = Some(position);
        Ok(self)
    }

    /// Mode the sampler runs in.
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Sampling configuration.
    pub fn options(&self) -> &SamplingOptions {
        &self.options
    }

    /// Rebuilds the stratum draw and the accepted mass after a change in exclusions.
    fn refresh(&mut self) {
        let mut weights: Vec<(usize, f64)> = self
            .stratum_weights
            .iter()
            .filter(|(stratum, _)| self.is_drawable(**stratum))
            .map(|(stratum, weight)| (*stratum, *weight))
            .collect();
        weights.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        let total_weight: f64 = weights.iter().map(|(_, w)| w).sum();

        self.accepted_mass = if total_weight > 0.0 {
            weights
                .iter()
                .map(|(stratum, weight)| {
                    weight / total_weight * self.eligible(*stratum) / self.available_size(*stratum)
                })
                .sum()
        } else {
            0.0
        };
        self.weights = weights;
        self.total_weight = total_weight;
    }

    fn is_drawable(&self, stratum: usize) -> bool {
        self.available_size(stratum) > f64::EPSILON && self.eligible(stratum) > f64::EPSILON
    }

    fn eligible(&self, stratum: usize) -> f64 {
        self.eligible_size.get(&stratum).copied().unwrap_or(0.0)
    }

    fn available_size(&self, stratum: usize) -> f64 {
        self.universe.stratum_size(stratum) - self.excluded_size.get(&stratum).copied().unwrap_or(0.0)
    }

    /// Probability that one accepted draw selects the element at `position`.
    ///
    /// An excluded element (only ever present as a forced item) is scored against its
    /// whole stratum.
    fn probability(&self, position: usize) -> f64 {
        let element = &self.universe.elements[position];
        if self.accepted_mass <= 0.0 {
            return 0.0;
        }
        let weight = self.stratum_weights.get(&element.stratum).copied().unwrap_or(0.0);
        let stratum_size = if self.excluded.contains(&position) {
            self.universe.stratum_size(element.stratum)
        } else if self.is_drawable(element.stratum) {
            self.available_size(element.stratum)
        } else {
            return 0.0;
        };
        weight / self.total_weight * element.size / stratum_size.max(f64::EPSILON) / self.accepted_mass
    }

    fn draw_stratum(&self, stream: &mut RandomStream) -> Option<usize> {
        let target = stream.next_uniform() * self.total_weight;
        let mut cumulative = 0.0;
        for (stratum, weight) in &self.weights {
            cumulative += weight;
            if cumulative > target {
                return Some(*stratum);
            }
        }
        self.weights.last().map(|(stratum, _)| *stratum)
    }

    fn draw_element(&self, stratum: usize, stream: &mut RandomStream) -> Option<usize> {
        let available = self.available_size(stratum);
        if available <= f64::EPSILON {
            return None;
        }
        let ranked = &self.universe.strata.get(&stratum)?.ranked;
        let target = stream.next_uniform() * available;
        let mut cumulative = 0.0;
        let mut last = None;
        for &position in ranked.iter().filter(|p| !self.excluded.contains(*p)) {
            let size = self.universe.elements[position].size;
            if size <= 0.0 {
                continue;
            }
            last = Some(position);
            cumulative += size;
            if cumulative > target {
                break;
            }
        }
        last.filter(|position| self.universe.elements[*position].size >= self.options.minimum_size)
    }

    /// One accepted draw from its own stream, redrawing rejected elements.
    fn draw(&self, stream: &mut RandomStream) -> Result<usize> {
        for _ in 0..self.options.max_draw_attempts {
            let Some(stratum) = self.draw_stratum(stream) else {
                break;
            };
            if let Some(position) = self.draw_element(stratum, stream) {
                return Ok(position);
            }
        }
        Err(ChoiceError::insufficient_universe(format!(
            "no valid element after {} attempts",
            self.options.max_draw_attempts
        )))
    }

    fn chosen_position(&self, chosen: Option<u64>) -> Result<Option<usize>> {
        let Some(id) = chosen else {
            return Ok(None);
        };
        match self.universe.positions.get(&id) {
            Some(position) => Ok(Some(*position)),
            None if self.mode.is_estimation() => Err(ChoiceError::invalid_argument(
                "destination sampling",
                format!("chosen element {id} is not in the universe"),
            )),
            None => Ok(None),
        }
    }

    /// Turns merged draws into items, scoring each position with `probability`.
    fn items<P>(&self, draws: Draws, chosen: Option<usize>, probability: P) -> Vec<(SampleItem, u32)>
    where
        P: Fn(usize, u32) -> (f64, f64),
    {
        draws
            .order
            .into_iter()
            .enumerate()
            .map(|(alternative_index, (position, frequency))| {
                let element = self.universe.elements[position];
                let (sampling_probability, adjustment_factor) = probability(position, frequency);
                let item = SampleItem {
                    element: Some(element),
                    alternative_index,
                    available: sampling_probability > 0.0 && element.size >= self.options.minimum_size,
                    is_chosen: chosen == Some(position),
                    is_usual: self.usual == Some(position),
                    adjustment_factor,
                    sampling_probability,
                };
                (item, frequency)
            })
            .collect()
    }

    /// Draws the sample and returns each distinct element with its draw frequency.
    ///
    /// Draw `i` uses `stream.sub_stream(i)`. In estimation mode a chosen element that
    /// was not drawn is appended with frequency one, and the usual element follows it
    /// the same way.
    pub fn sample_and_return_tour_destinations(
        &self,
        stream: &RandomStream,
        chosen: Option<u64>,
    ) -> Result<Vec<(SampleItem, u32)>> {
        let chosen_position = self.chosen_position(chosen)?;

        let mut draws = Draws::default();
        for draw_index in 0..self.options.sample_size {
            let mut draw_stream = stream.sub_stream(draw_index as u64);
            draws.add(self.draw(&mut draw_stream)?);
        }
        if self.mode.is_estimation() {
            if let Some(position) = chosen_position {
                draws.insert(position);
            }
        }
        if let Some(position) = self.usual {
            draws.insert(position);
        }

        let n = self.options.sample_size as f64;
        Ok(self.items(draws, chosen_position, |position, frequency| {
            let p = self.probability(position);
            let adjustment = if p >= PROBABILITY_EPSILON {
                -(n * p / f64::from(frequency)).ln()
            } else {
                0.0
            };
            (p, adjustment)
        }))
    }

    /// Samples, creates one alternative per item plus a final oddball alternative, and
    /// hands each to `setter` to fill in utility terms.
    ///
    /// Alternatives carry [`Choice::Entity`] payloads. The chosen flag is only set in
    /// estimation mode. Fails when no alternative is available afterwards.
    pub fn sample_tour_destinations<F>(
        &self,
        set: &mut ChoiceSet,
        stream: &RandomStream,
        chosen: Option<u64>,
        setter: F,
    ) -> Result<Vec<(SampleItem, u32)>>
    where
        F: FnMut(&mut Alternative, &SampleItem, u32) -> Result<()>,
    {
        let items = self.sample_and_return_tour_destinations(stream, chosen)?;
        populate(set, self.mode, items, true, setter)
    }
}

/// Samples stops between a tour origin and a trip origin.
///
/// The first half of the draws (rounded down) comes from the tour-origin sampler, the
/// rest from the trip-origin sampler. Both samplers must share the universe and mode;
/// each normally excludes both origins. An element drawn `f` times gets the correction
/// `-ln((n1 * p1 + n2 * p2) / f)`.
#[derive(Debug)]
pub struct IntermediateStopSampler<'a> {
    tour: DestinationSampler<'a>,
    trip: DestinationSampler<'a>,
}

impl<'a> IntermediateStopSampler<'a> {
    /// Pairs a tour-origin sampler with a trip-origin sampler.
    pub fn new(tour: DestinationSampler<'a>, trip: DestinationSampler<'a>) -> Result<Self> {
        if !std::ptr::eq(tour.universe, trip.universe) {
            return Err(ChoiceError::invalid_argument(
                "intermediate stop sampling",
                "tour and trip samplers use different universes",
            ));
        }
        if tour.mode != trip.mode {
            return Err(ChoiceError::invalid_argument(
                "intermediate stop sampling",
                format!("tour sampler runs in {:?}, trip sampler in {:?}", tour.mode, trip.mode),
            ));
        }
        Ok(Self { tour, trip })
    }

    /// Draws from the tour origin and the trip origin, as `(n1, n2)`.
    pub fn draw_counts(&self) -> (usize, usize) {
        let n = self.tour.options.sample_size;
        (n / 2, n - n / 2)
    }

    /// Draws the stop sample; draw `i` uses `stream.sub_stream(i)`.
    ///
    /// `sampling_probability` is the mean per-draw probability over both origins. In
    /// estimation mode a chosen element that was not drawn is appended.
    pub fn sample_and_return_intermediate_stop_destinations(
        &self,
        stream: &RandomStream,
        chosen: Option<u64>,
    ) -> Result<Vec<(SampleItem, u32)>> {
        let chosen_position = self.tour.chosen_position(chosen)?;
        let (n1, n2) = self.draw_counts();

        let mut draws = Draws::default();
        for draw_index in 0..n1 + n2 {
            let sampler = if draw_index < n1 { &self.tour } else { &self.trip };
            let mut draw_stream = stream.sub_stream(draw_index as u64);
            draws.add(sampler.draw(&mut draw_stream)?);
        }
        if self.tour.mode.is_estimation() {
            if let Some(position) = chosen_position {
                draws.insert(position);
            }
        }

        let (n1, n2) = (n1 as f64, n2 as f64);
        Ok(self.tour.items(draws, chosen_position, |position, frequency| {
            let mut p1 = self.tour.probability(position);
            let mut p2 = self.trip.probability(position);
            if p1 < PROBABILITY_EPSILON && p2 < PROBABILITY_EPSILON {
                p1 = 2.0 * PROBABILITY_EPSILON;
                p2 = 2.0 * PROBABILITY_EPSILON;
            }
            let expected = n1 * p1 + n2 * p2;
            (expected / (n1 + n2), -(expected / f64::from(frequency)).ln())
        }))
    }

    /// Samples and creates one alternative per item, without an oddball alternative.
    pub fn sample_intermediate_stop_destinations<F>(
        &self,
        set: &mut ChoiceSet,
        stream: &RandomStream,
        chosen: Option<u64>,
        setter: F,
    ) -> Result<Vec<(SampleItem, u32)>>
    where
        F: FnMut(&mut Alternative, &SampleItem, u32) -> Result<()>,
    {
        let items = self.sample_and_return_intermediate_stop_destinations(stream, chosen)?;
        populate(set, self.tour.mode, items, false, setter)
    }
}

/// Creates the alternatives of `items` (and optionally the oddball) and runs `setter`.
fn populate<F>(
    set: &mut ChoiceSet,
    mode: ExecutionMode,
    mut items: Vec<(SampleItem, u32)>,
    oddball: bool,
    mut setter: F,
) -> Result<Vec<(SampleItem, u32)>>
where
    F: FnMut(&mut Alternative, &SampleItem, u32) -> Result<()>,
{
    let estimating = mode.is_estimation();
    for (item, frequency) in &items {
        let chosen = estimating && item.is_chosen && item.available;
        let alternative = set.get_alternative(item.alternative_index, item.available, chosen)?;
        if let Some(element) = item.element {
            alternative.set_payload(Choice::Entity(element.id));
        }
        setter(alternative, item, *frequency)?;
    }

    let sampled = items.len();
    if oddball {
        let oddball = SampleItem::oddball(sampled);
        let alternative = set.get_alternative(oddball.alternative_index, true, false)?;
        setter(alternative, &oddball, 1)?;
        items.push((oddball, 1));
    }

    for (item, _) in items.iter_mut() {
        item.available = set
            .alternative(item.alternative_index)
            .map_or(false, Alternative::is_available);
    }
    if set.available_count() == 0 {
        return Err(ChoiceError::InsufficientAvailableAlternatives { sampled });
    }

    log::trace!("case {}: sampled {sampled} distinct destinations", set.case_id());
    Ok(items)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use approx::assert_relative_eq;

    use super::*;
    use crate::coefficients::Coefficients;
    use crate::random::StreamKey;

    fn uniform_universe(n: u64, strata: u64) -> SampleUniverse {
        SampleUniverse::new(
            (0..n)
                .map(|id| UniverseElement::new(id, (id % strata) as usize, 1.0))
                .collect(),
        )
        .unwrap()
    }

    fn stream(entity: u64) -> RandomStream {
        RandomStream::new(StreamKey::new(entity, 1).for_model(20, 1))
    }

    #[test]
    fn uniform_universe_gives_flat_adjustments() {
        let universe = uniform_universe(1000, 10);
        let options = SamplingOptions::default().with_sample_size(5);
        let sampler =
            DestinationSampler::new(&universe, options, ExecutionMode::Application, |_| 1.0).unwrap();

        let items = sampler
            .sample_and_return_tour_destinations(&stream(1), None)
            .unwrap();
        let draws: u32 = items.iter().map(|(_, f)| f).sum();
        assert_eq!(draws, 5);
        for (item, frequency) in &items {
            assert_relative_eq!(item.sampling_probability, 0.001, epsilon = 1e-12);
            let expected = -(5.0 * 0.001 / f64::from(*frequency)).ln();
            assert_relative_eq!(item.adjustment_factor, expected, epsilon = 1e-9);
        }
    }

    #[test]
    fn estimation_forces_the_chosen_element() {
        let universe = uniform_universe(1000, 10);
        let options = SamplingOptions::default().with_sample_size(5);
        let sampler =
            DestinationSampler::new(&universe, options, ExecutionMode::Estimation, |_| 1.0).unwrap();
        let items = sampler
            .sample_and_return_tour_destinations(&stream(2), Some(999_999))
            .unwrap_err();
        assert!(matches!(items, ChoiceError::InvalidArgument { .. }));

        let drawn = sampler
            .sample_and_return_tour_destinations(&stream(2), None)
            .unwrap();
        let drawn_ids: Vec<u64> = drawn.iter().map(|(i, _)| i.element.unwrap().id).collect();
        let chosen = (0..1000).find(|id| !drawn_ids.contains(id)).unwrap();

        let forced = sampler
            .sample_and_return_tour_destinations(&stream(2), Some(chosen))
            .unwrap();
        assert_eq!(forced.len(), drawn.len() + 1);
        let (last, frequency) = forced.last().unwrap();
        assert!(last.is_chosen);
        assert_eq!(*frequency, 1);
        assert_eq!(last.element.unwrap().id, chosen);
        assert_eq!(forced.iter().filter(|(i, _)| i.is_chosen).count(), 1);
    }

    #[test]
    fn probabilities_follow_weights_and_sizes() {
        let universe = SampleUniverse::new(vec![
            UniverseElement::new(1, 0, 3.0),
            UniverseElement::new(2, 0, 1.0),
            UniverseElement::new(3, 1, 2.0),
            UniverseElement::new(4, 1, 0.0),
        ])
        .unwrap();
        let options = SamplingOptions::default().with_sample_size(4);
        let sampler = DestinationSampler::new(&universe, options, ExecutionMode::Application, |s| {
            if s == 0 {
                3.0
            } else {
                1.0
            }
        })
        .unwrap()
        .exclude(2);

        assert_relative_eq!(sampler.probability(0), 0.75, epsilon = 1e-12);
        assert_relative_eq!(sampler.probability(2), 0.25, epsilon = 1e-12);
        assert_eq!(sampler.probability(3), 0.0);

        let items = sampler
            .sample_and_return_tour_destinations(&stream(3), None)
            .unwrap();
        assert!(items
            .iter()
            .all(|(item, _)| matches!(item.element.map(|e| e.id), Some(1) | Some(3))));
    }

    #[test]
    fn minimum_size_and_empty_universes_fail_cleanly() {
        let universe = uniform_universe(10, 2);
        let options = SamplingOptions::default().with_minimum_size(5.0);
        assert!(matches!(
            DestinationSampler::new(&universe, options, ExecutionMode::Application, |_| 1.0),
            Err(ChoiceError::InsufficientSampleUniverse { .. })
        ));

        let mut elements: Vec<UniverseElement> =
            (1..=10_000).map(|id| UniverseElement::new(id, 0, 0.5)).collect();
        elements.push(UniverseElement::new(0, 0, 1.0));
        let sparse = SampleUniverse::new(elements).unwrap();
        let options = SamplingOptions::default()
            .with_minimum_size(1.0)
            .with_max_draw_attempts(1);
        let sampler =
            DestinationSampler::new(&sparse, options, ExecutionMode::Application, |_| 1.0).unwrap();
        assert!(matches!(
            sampler.sample_and_return_tour_destinations(&stream(4), None),
            Err(ChoiceError::InsufficientSampleUniverse { .. })
        ));

        assert!(matches!(
            DestinationSampler::new(&universe, SamplingOptions::default(), ExecutionMode::Application, |_| 0.0),
            Err(ChoiceError::InsufficientSampleUniverse { .. })
        ));
        assert!(matches!(
            DestinationSampler::with_stratum_weights(
                &universe,
                SamplingOptions::default(),
                ExecutionMode::Application,
                &[1.0],
            ),
            Err(ChoiceError::DimensionMismatch {
                expected: 2,
                found: 1,
                ..
            })
        ));
    }

    #[test]
    fn probabilities_are_conditional_on_accepted_draws() {
        let universe = SampleUniverse::new(vec![
            UniverseElement::new(1, 0, 3.0),
            UniverseElement::new(2, 0, 1.0),
            UniverseElement::new(3, 1, 2.0),
        ])
        .unwrap();
        let options = SamplingOptions::default().with_minimum_size(2.0);
        let sampler =
            DestinationSampler::new(&universe, options, ExecutionMode::Application, |_| 1.0).unwrap();

        // A quarter of stratum 0's draws land on the rejected element 2.
        assert_relative_eq!(sampler.accepted_mass, 0.875, epsilon = 1e-12);
        assert_relative_eq!(sampler.probability(0), 0.375 / 0.875, epsilon = 1e-12);
        assert_relative_eq!(sampler.probability(2), 0.5 / 0.875, epsilon = 1e-12);
        assert_relative_eq!(
            sampler.probability(0) + sampler.probability(2),
            1.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn strata_emptied_by_exclusion_leave_the_draw() {
        let universe = SampleUniverse::new(vec![
            UniverseElement::new(1, 0, 1.0),
            UniverseElement::new(2, 1, 1.0),
            UniverseElement::new(3, 1, 1.0),
        ])
        .unwrap();
        let options = SamplingOptions::default().with_sample_size(10);
        let sampler = DestinationSampler::new(&universe, options, ExecutionMode::Estimation, |_| 1.0)
            .unwrap()
            .exclude(1);

        assert_eq!(sampler.weights, vec![(1, 1.0)]);
        assert_relative_eq!(sampler.accepted_mass, 1.0, epsilon = 1e-12);
        assert_relative_eq!(sampler.probability(1), 0.5, epsilon = 1e-12);
        assert_relative_eq!(sampler.probability(2), 0.5, epsilon = 1e-12);

        // The excluded origin can still be forced in as the chosen element.
        let items = sampler
            .sample_and_return_tour_destinations(&stream(6), Some(1))
            .unwrap();
        let (forced, _) = items.last().unwrap();
        assert!(forced.is_chosen);
        assert!(forced.available);
        assert!(forced.sampling_probability > 0.0);
    }

    #[test]
    fn usual_location_is_always_in_the_sample() {
        let universe = uniform_universe(1000, 10);
        let options = SamplingOptions::default().with_sample_size(5);
        fn drawn_ids(sampler: &DestinationSampler<'_>, chosen: Option<u64>) -> Vec<(u64, bool, bool)> {
            sampler
                .sample_and_return_tour_destinations(&stream(7), chosen)
                .unwrap()
                .iter()
                .map(|(item, _)| (item.element.unwrap().id, item.is_chosen, item.is_usual))
                .collect()
        }

        let plain = DestinationSampler::new(&universe, options.clone(), ExecutionMode::Application, |_| 1.0)
            .unwrap();
        let drawn = drawn_ids(&plain, None);
        let first = drawn[0].0;
        let usual = (0..1000).find(|id| drawn.iter().all(|d| d.0 != *id)).unwrap();
        let chosen = (0..1000)
            .find(|id| *id != usual && drawn.iter().all(|d| d.0 != *id))
            .unwrap();

        let application = DestinationSampler::new(&universe, options.clone(), ExecutionMode::Application, |_| 1.0)
            .unwrap()
            .with_usual(usual)
            .unwrap();
        let items = drawn_ids(&application, None);
        assert_eq!(items.len(), drawn.len() + 1);
        assert_eq!(items.last().unwrap(), &(usual, false, true));

        let already_drawn = DestinationSampler::new(&universe, options.clone(), ExecutionMode::Application, |_| 1.0)
            .unwrap()
            .with_usual(first)
            .unwrap();
        let items = drawn_ids(&already_drawn, None);
        assert_eq!(items.len(), drawn.len());
        assert!(items[0].2);

        let estimation = DestinationSampler::new(&universe, options.clone(), ExecutionMode::Estimation, |_| 1.0)
            .unwrap()
            .with_usual(usual)
            .unwrap();
        let items = drawn_ids(&estimation, Some(chosen));
        assert_eq!(items.len(), drawn.len() + 2);
        assert_eq!(items[drawn.len()], (chosen, true, false));
        assert_eq!(items[drawn.len() + 1], (usual, false, true));

        let items = drawn_ids(&estimation, Some(usual));
        assert_eq!(items.len(), drawn.len() + 1);
        assert_eq!(items.last().unwrap(), &(usual, true, true));

        assert!(matches!(
            DestinationSampler::new(&universe, options, ExecutionMode::Application, |_| 1.0)
                .unwrap()
                .with_usual(5_000),
            Err(ChoiceError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn intermediate_stops_mix_both_origins() {
        let universe = SampleUniverse::new(
            (0..40)
                .map(|id| UniverseElement::new(id, (id / 10) as usize, 1.0))
                .collect(),
        )
        .unwrap();
        let options = SamplingOptions::default().with_sample_size(7);
        // The tour origin only attracts stratum 0, the trip origin only stratum 3.
        let tour = DestinationSampler::new(&universe, options.clone(), ExecutionMode::Application, |s| {
            if s == 0 {
                1.0
            } else {
                0.0
            }
        })
        .unwrap()
        .exclude(0)
        .exclude(39);
        let trip = DestinationSampler::new(&universe, options, ExecutionMode::Application, |s| {
            if s == 3 {
                1.0
            } else {
                0.0
            }
        })
        .unwrap()
        .exclude(0)
        .exclude(39);
        let sampler = IntermediateStopSampler::new(tour, trip).unwrap();
        assert_eq!(sampler.draw_counts(), (3, 4));

        let items = sampler
            .sample_and_return_intermediate_stop_destinations(&stream(8), None)
            .unwrap();
        let mut from_tour = 0;
        let mut from_trip = 0;
        for (item, frequency) in &items {
            let element = item.element.unwrap();
            assert!(element.id != 0 && element.id != 39);
            let expected = if element.stratum == 0 {
                from_tour += frequency;
                3.0 / 9.0
            } else {
                assert_eq!(element.stratum, 3);
                from_trip += frequency;
                4.0 / 9.0
            };
            assert_relative_eq!(
                item.adjustment_factor,
                -(expected / f64::from(*frequency)).ln(),
                epsilon = 1e-12
            );
            assert_relative_eq!(item.sampling_probability, expected / 7.0, epsilon = 1e-12);
        }
        assert_eq!((from_tour, from_trip), (3, 4));

        let coefficients = Arc::new(Coefficients::from_values("stop", &[1.0]).unwrap());
        let mut set = ChoiceSet::new(8, coefficients, false);
        let created = sampler
            .sample_intermediate_stop_destinations(&mut set, &stream(8), None, |alternative, item, _| {
                alternative.add_utility_term(0, item.adjustment_factor)
            })
            .unwrap();
        assert_eq!(created.len(), items.len());
        assert!(created.iter().all(|(item, _)| !item.is_oddball()));
        assert_eq!(set.len(), items.len());
    }

    #[test]
    fn intermediate_stop_samplers_must_agree() {
        let first = uniform_universe(20, 2);
        let second = uniform_universe(20, 2);
        fn sampler(universe: &SampleUniverse, mode: ExecutionMode) -> DestinationSampler<'_> {
            let options = SamplingOptions::default().with_sample_size(4);
            DestinationSampler::new(universe, options, mode, |_| 1.0).unwrap()
        }

        assert!(matches!(
            IntermediateStopSampler::new(
                sampler(&first, ExecutionMode::Application),
                sampler(&second, ExecutionMode::Application),
            ),
            Err(ChoiceError::InvalidArgument { .. })
        ));
        assert!(matches!(
            IntermediateStopSampler::new(
                sampler(&first, ExecutionMode::Application),
                sampler(&first, ExecutionMode::Estimation),
            ),
            Err(ChoiceError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn sampled_set_builds_alternatives_and_oddball() {
        let universe = uniform_universe(50, 5);
        let coefficients = Arc::new(Coefficients::from_values("dest", &[1.0, 1.0]).unwrap());
        let mut set = ChoiceSet::new(9, coefficients, false);
        let options = SamplingOptions::default().with_sample_size(8);
        let sampler =
            DestinationSampler::new(&universe, options, ExecutionMode::Application, |_| 1.0).unwrap();

        let items = sampler
            .sample_tour_destinations(&mut set, &stream(5), None, |alternative, item, _| {
                if item.is_oddball() {
                    alternative.set_available(false);
                    return Ok(());
                }
                alternative.add_utility_term(0, item.adjustment_factor)
            })
            .unwrap();

        let (oddball, _) = items.last().unwrap();
        assert!(oddball.is_oddball());
        assert!(!oddball.available);
        assert_eq!(set.len(), items.len());
        assert_eq!(set.available_count(), items.len() - 1);
        let first = set.alternative(0).unwrap();
        assert!(matches!(first.payload(), Some(Choice::Entity(_))));
        assert_relative_eq!(first.utility(), items[0].0.adjustment_factor, epsilon = 1e-12);

        let err = sampler
            .sample_tour_destinations(&mut set, &stream(5), None, |alternative, _, _| {
                alternative.set_available(false);
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, ChoiceError::InsufficientAvailableAlternatives { .. }));
    }
}
