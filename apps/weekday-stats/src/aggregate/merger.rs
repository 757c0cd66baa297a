use super::moments::{fold_into, BatchMoments};
use super::store::{AggregateStore, StoreError};
use super::types::{Sample, WeekdayAggregate};
use chrono::{Utc, Weekday};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

const MAX_MERGE_ATTEMPTS: usize = 3;

type AggregateKey = (u32, Weekday);

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("aggregate for point {point_id} on {day_of_week} conflicted on create but is not readable")]
    Missing { point_id: u32, day_of_week: Weekday },
    #[error("gave up after {attempts} concurrent modifications")]
    Contended { attempts: usize },
    #[error("merge cancelled")]
    Cancelled,
    #[error("point worker aborted: {0}")]
    Aborted(String),
}

/// Async locks keyed by (point, weekday). Entries are dropped once nobody
/// holds or waits on them, so the map only grows with in-flight keys.
#[derive(Clone, Default)]
struct KeyLocks {
    inner: Arc<Mutex<HashMap<AggregateKey, Arc<AsyncMutex<()>>>>>,
}

struct KeyGuard {
    key: AggregateKey,
    locks: KeyLocks,
    _guard: OwnedMutexGuard<()>,
}

impl KeyLocks {
    async fn acquire(&self, key: AggregateKey) -> KeyGuard {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            map.entry(key).or_default().clone()
        };
        let guard = lock.lock_owned().await;
        KeyGuard {
            key,
            locks: self.clone(),
            _guard: guard,
        }
    }

    fn release(&self, key: &AggregateKey) {
        let mut map = self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // One reference lives in the map, one in the guard being dropped.
        if map.get(key).is_some_and(|lock| Arc::strong_count(lock) <= 2) {
            map.remove(key);
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.inner.lock().map(|map| map.len()).unwrap_or(0)
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        self.locks.release(&self.key);
    }
}

/// Folds sample batches into persisted weekday aggregates.
///
/// Each merge holds the key lock for the whole read-compute-write span and
/// saves with a version check, so concurrent merges for the same key are
/// serialized in-process and detected across processes.
#[derive(Clone)]
pub struct BatchMerger {
    store: Arc<dyn AggregateStore>,
    locks: KeyLocks,
}

impl BatchMerger {
    pub fn new(store: Arc<dyn AggregateStore>) -> Self {
        Self {
            store,
            locks: KeyLocks::default(),
        }
    }

    /// Returns `Ok(None)` without touching the store when `samples` is empty.
    pub async fn merge(
        &self,
        point_id: u32,
        day_of_week: Weekday,
        samples: &[Sample],
        cancel: &CancellationToken,
    ) -> Result<Option<WeekdayAggregate>, MergeError> {
        let Some(batch) = BatchMoments::from_samples(samples) else {
            return Ok(None);
        };

        let _guard = self.locks.acquire((point_id, day_of_week)).await;

        for attempt in 1..=MAX_MERGE_ATTEMPTS {
            if cancel.is_cancelled() {
                return Err(MergeError::Cancelled);
            }

            let mut aggregate = self.load_or_create(point_id, day_of_week).await?;
            let expected = aggregate.evaluations;
            fold_into(&mut aggregate, &batch, Utc::now());

            if cancel.is_cancelled() {
                return Err(MergeError::Cancelled);
            }

            match self.store.save(&aggregate, expected).await {
                Ok(()) => {
                    tracing::debug!(
                        point_id,
                        weekday = %day_of_week,
                        samples = batch.count,
                        count = aggregate.count,
                        evaluations = aggregate.evaluations,
                        "merged weekday batch"
                    );
                    return Ok(Some(aggregate));
                }
                Err(StoreError::Stale { .. }) => {
                    tracing::debug!(
                        point_id,
                        weekday = %day_of_week,
                        attempt,
                        "aggregate changed concurrently; retrying merge"
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }

        Err(MergeError::Contended {
            attempts: MAX_MERGE_ATTEMPTS,
        })
    }

    async fn load_or_create(
        &self,
        point_id: u32,
        day_of_week: Weekday,
    ) -> Result<WeekdayAggregate, MergeError> {
        if let Some(existing) = self.store.get(point_id, day_of_week).await? {
            return Ok(existing);
        }

        match self.store.create(point_id, day_of_week).await {
            Ok(id) => Ok(WeekdayAggregate::empty(id, point_id, day_of_week, Utc::now())),
            Err(StoreError::Conflict { .. }) => {
                tracing::debug!(
                    point_id,
                    weekday = %day_of_week,
                    "aggregate created concurrently; re-fetching"
                );
                self.store
                    .get(point_id, day_of_week)
                    .await?
                    .ok_or(MergeError::Missing {
                        point_id,
                        day_of_week,
                    })
            }
            Err(err) => Err(err.into()),
        }
    }
}
