use crate::{
    error::{Result, SepiaError},
    event::Event,
};

/// Maximum number of values buffered for percentile calculation. Exceeding
/// it fails the aggregation instead of exhausting memory.
const MAX_PERCENTILE_VALUES: usize = 1_000_000;

/// The statistics an aggregation can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Aggregation {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    P50,
    P95,
    P99,
}

/// Results of one aggregation pass. Fields not covered by the matched events
/// (an empty result, or a missing field) are zero.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AggregateResult {
    pub count: u64,
    pub sum: f64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Single-pass accumulator folded over a scan.
pub(crate) struct Aggregator {
    field: String,
    needs_percentiles: bool,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    values: Vec<f64>,
}

impl Aggregator {
    pub(crate) fn new(field: &str, needs_percentiles: bool) -> Self {
        Self {
            field: field.to_string(),
            needs_percentiles,
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            values: Vec::new(),
        }
    }

    /// Folds one event into the running state. Events without a numeric value
    /// for the configured field are skipped; with an empty field every event
    /// counts.
    pub(crate) fn add(&mut self, event: &Event) -> Result<()> {
        if self.field.is_empty() {
            self.count += 1;
            return Ok(());
        }
        let Some(value) = extract_numeric(event, &self.field) else {
            return Ok(());
        };
        self.count += 1;
        self.sum += value;
        if value < self.min {
            self.min = value;
        }
        if value > self.max {
            self.max = value;
        }
        if self.needs_percentiles {
            if self.values.len() >= MAX_PERCENTILE_VALUES {
                return Err(SepiaError::TooManyValues);
            }
            self.values.push(value);
        }
        Ok(())
    }

    pub(crate) fn finish(mut self) -> AggregateResult {
        let mut result = AggregateResult {
            count: self.count,
            ..Default::default()
        };

        if self.count > 0 && !self.field.is_empty() {
            result.sum = self.sum;
            result.avg = self.sum / self.count as f64;
            result.min = self.min;
            result.max = self.max;

            if self.needs_percentiles && !self.values.is_empty() {
                self.values.sort_by(f64::total_cmp);
                result.p50 = percentile(&self.values, 0.50);
                result.p95 = percentile(&self.values, 0.95);
                result.p99 = percentile(&self.values, 0.99);
            }
        }

        result
    }
}

pub(crate) fn needs_percentiles(aggregations: &[Aggregation]) -> bool {
    aggregations.iter().any(|agg| {
        matches!(
            agg,
            Aggregation::P50 | Aggregation::P95 | Aggregation::P99
        )
    })
}

/// Looks up `field` in the payload and widens any JSON number to `f64`.
/// Booleans, strings, compound values and absent fields are non-numeric.
fn extract_numeric(event: &Event, field: &str) -> Option<f64> {
    event.data.get(field)?.as_f64()
}

/// The p-th quantile of a sorted slice, by linear interpolation between the
/// adjacent ranks.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }

    let rank = p * (sorted.len() - 1) as f64;
    let lower = rank as usize;
    let upper = lower + 1;
    if upper >= sorted.len() {
        return sorted[sorted.len() - 1];
    }

    let weight = rank - lower as f64;
    sorted[lower] * (1.0 - weight) + sorted[upper] * weight
}
