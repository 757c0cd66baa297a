use super::merger::{BatchMerger, MergeError};
use super::types::{weekday_from_index, Sample};
use crate::telemetry::Metric;
use chrono::{Datelike, Weekday};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSummary {
    pub points: usize,
    pub samples: usize,
    pub merges: usize,
    pub failed_merges: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatch cancelled after {merged} weekday merges")]
    Cancelled { merged: usize },
    #[error("{failed} weekday merges failed across {points} points; first: {first}")]
    PartialFailure {
        failed: usize,
        points: usize,
        first: MergeError,
    },
}

/// Result of merging every weekday bucket of one point.
#[derive(Debug, Default)]
pub(crate) struct PointOutcome {
    pub(crate) samples: usize,
    pub(crate) merged: usize,
    pub(crate) failed: usize,
    pub(crate) first_error: Option<MergeError>,
}

impl PointOutcome {
    fn record_failure(&mut self, err: MergeError) {
        self.failed += 1;
        if self.first_error.is_none() {
            self.first_error = Some(err);
        }
    }
}

/// Fans a metric batch out to one unit of work per point, at most
/// `max_concurrent_points` at a time, and waits for all of them.
#[derive(Clone)]
pub struct Dispatcher {
    merger: BatchMerger,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(merger: BatchMerger, max_concurrent_points: usize) -> Self {
        Self {
            merger,
            permits: Arc::new(Semaphore::new(max_concurrent_points.max(1))),
        }
    }

    pub async fn run(
        &self,
        batch: Vec<Metric>,
        cancel: &CancellationToken,
    ) -> Result<DispatchSummary, DispatchError> {
        let started = Instant::now();
        let grouped = group_by_point(batch);
        let mut summary = DispatchSummary {
            points: grouped.len(),
            ..Default::default()
        };
        let mut first_error: Option<MergeError> = None;

        let mut workers = JoinSet::new();
        for (point_id, samples) in grouped {
            let merger = self.merger.clone();
            let permits = self.permits.clone();
            let cancel = cancel.clone();
            workers.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = permits.acquire_owned() => permit.ok(),
                };
                let Some(_permit) = permit else {
                    let mut outcome = PointOutcome {
                        samples: samples.len(),
                        ..Default::default()
                    };
                    outcome.record_failure(MergeError::Cancelled);
                    return outcome;
                };
                merge_point(&merger, point_id, samples, &cancel).await
            });
        }

        while let Some(joined) = workers.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(err) => {
                    tracing::error!(error = %err, "point worker failed");
                    let mut outcome = PointOutcome::default();
                    outcome.record_failure(MergeError::Aborted(err.to_string()));
                    outcome
                }
            };
            summary.samples += outcome.samples;
            summary.merges += outcome.merged;
            summary.failed_merges += outcome.failed;
            if first_error.is_none() {
                first_error = outcome.first_error;
            }
        }

        tracing::debug!(
            points = summary.points,
            samples = summary.samples,
            merges = summary.merges,
            failed = summary.failed_merges,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "dispatched metric batch"
        );

        if cancel.is_cancelled() {
            return Err(DispatchError::Cancelled {
                merged: summary.merges,
            });
        }
        match first_error {
            Some(first) => Err(DispatchError::PartialFailure {
                failed: summary.failed_merges,
                points: summary.points,
                first,
            }),
            None => Ok(summary),
        }
    }
}

/// Merges every non-empty weekday bucket of one point, one bucket at a time.
/// A failed bucket is logged and does not stop the others.
pub(crate) async fn merge_point(
    merger: &BatchMerger,
    point_id: u32,
    samples: Vec<Sample>,
    cancel: &CancellationToken,
) -> PointOutcome {
    let mut outcome = PointOutcome {
        samples: samples.len(),
        ..Default::default()
    };

    for (day_of_week, bucket) in bucket_by_weekday(samples) {
        if cancel.is_cancelled() {
            outcome.record_failure(MergeError::Cancelled);
            break;
        }
        match merger.merge(point_id, day_of_week, &bucket, cancel).await {
            Ok(_) => outcome.merged += 1,
            Err(MergeError::Cancelled) => {
                outcome.record_failure(MergeError::Cancelled);
                break;
            }
            Err(err) => {
                tracing::warn!(
                    point_id,
                    weekday = %day_of_week,
                    samples = bucket.len(),
                    error = %err,
                    "weekday merge abandoned"
                );
                outcome.record_failure(err);
            }
        }
    }

    outcome
}

pub fn group_by_point(metrics: Vec<Metric>) -> HashMap<u32, Vec<Sample>> {
    let mut grouped: HashMap<u32, Vec<Sample>> = HashMap::new();
    for metric in metrics {
        if !metric.value.is_finite() {
            tracing::trace!(point_id = metric.point_id, "dropping non-finite metric value");
            continue;
        }
        grouped.entry(metric.point_id).or_default().push(Sample {
            value: metric.value,
            timestamp: metric.timestamp,
        });
    }
    grouped
}

/// Splits samples by UTC calendar weekday, Monday first, skipping empty days.
pub fn bucket_by_weekday(samples: Vec<Sample>) -> Vec<(Weekday, Vec<Sample>)> {
    let mut days: [Vec<Sample>; 7] = Default::default();
    for sample in samples {
        let index = sample.timestamp.weekday().num_days_from_monday() as usize;
        days[index].push(sample);
    }
    days.into_iter()
        .enumerate()
        .filter(|(_, bucket)| !bucket.is_empty())
        .filter_map(|(index, bucket)| weekday_from_index(index as i64).map(|day| (day, bucket)))
        .collect()
}
