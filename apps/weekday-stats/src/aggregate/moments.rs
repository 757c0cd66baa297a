use super::types::{Sample, WeekdayAggregate};
use chrono::{DateTime, Utc};

/// First and second raw moments plus extrema of one batch, gathered in a single pass.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BatchMoments {
    pub count: i64,
    pub sum: f64,
    pub sum_sq: f64,
    pub min: f64,
    pub max: f64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BatchMoments {
    pub fn from_samples(samples: &[Sample]) -> Option<Self> {
        let (first, rest) = samples.split_first()?;
        let mut moments = Self {
            count: 1,
            sum: first.value,
            sum_sq: first.value * first.value,
            min: first.value,
            max: first.value,
            start: first.timestamp,
            end: first.timestamp,
        };
        for sample in rest {
            moments.count += 1;
            moments.sum += sample.value;
            moments.sum_sq += sample.value * sample.value;
            moments.min = moments.min.min(sample.value);
            moments.max = moments.max.max(sample.value);
            if sample.timestamp < moments.start {
                moments.start = sample.timestamp;
            }
            if sample.timestamp > moments.end {
                moments.end = sample.timestamp;
            }
        }
        Some(moments)
    }

    pub fn mean(&self) -> f64 {
        self.sum / self.count as f64
    }

    /// Population standard deviation. Rounding can push the variance a hair
    /// below zero for constant batches, so it is clamped.
    pub fn std_dev(&self) -> f64 {
        let mean = self.mean();
        (self.sum_sq / self.count as f64 - mean * mean).max(0.0).sqrt()
    }
}

pub fn weighted_average(value1: f64, weight1: f64, value2: f64, weight2: f64) -> f64 {
    (value1 * weight1 + value2 * weight2) / (weight1 + weight2)
}

/// Folds `batch` into `aggregate` in place.
///
/// Mean and standard deviation are combined with weights proportional to each
/// side's share of the post-merge sample count. `sum`, `count`, the extrema and
/// the time bounds are exact.
pub fn fold_into(aggregate: &mut WeekdayAggregate, batch: &BatchMoments, now: DateTime<Utc>) {
    aggregate.min = Some(aggregate.min.map_or(batch.min, |min| min.min(batch.min)));
    aggregate.max = Some(aggregate.max.map_or(batch.max, |max| max.max(batch.max)));

    // Rows written before any merge may carry a zero epoch instead of NULL.
    aggregate.start = match aggregate.start.filter(|start| start.timestamp() > 0) {
        Some(start) if start <= batch.start => Some(start),
        _ => Some(batch.start),
    };
    aggregate.end = Some(aggregate.end.map_or(batch.end, |end| end.max(batch.end)));

    let batch_mean = batch.mean();
    let batch_std_dev = batch.std_dev();

    if aggregate.count > 0 {
        let total = (aggregate.count + batch.count) as f64;
        let prior_weight = aggregate.count as f64 / total;
        let batch_weight = batch.count as f64 / total;

        aggregate.mean = Some(match aggregate.mean {
            Some(mean) => weighted_average(mean, prior_weight, batch_mean, batch_weight),
            None => batch_mean,
        });
        aggregate.std_dev = Some(match aggregate.std_dev {
            Some(std_dev) => weighted_average(std_dev, prior_weight, batch_std_dev, batch_weight),
            None => batch_std_dev,
        });
        aggregate.sum = Some(aggregate.sum.unwrap_or(0.0) + batch.sum);
    } else {
        aggregate.mean = Some(batch_mean);
        aggregate.std_dev = Some(batch_std_dev);
        aggregate.sum = Some(batch.sum);
    }

    aggregate.count += batch.count;
    aggregate.evaluations += 1;
    aggregate.last_updated = now;
}
