use super::types::WeekdayAggregate;
use async_trait::async_trait;
use chrono::Weekday;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("aggregate for point {point_id} on {day_of_week} already exists")]
    Conflict { point_id: u32, day_of_week: Weekday },
    #[error("aggregate {id} no longer exists")]
    NotFound { id: i64 },
    #[error("aggregate {id} changed underneath us (expected evaluations {expected})")]
    Stale { id: i64, expected: i64 },
    #[error("aggregate store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Persistence contract for weekday aggregates, keyed by (point, weekday).
///
/// Implementations must enforce one row per key even with concurrent
/// creators, reporting the loser as [`StoreError::Conflict`].
#[async_trait]
pub trait AggregateStore: Send + Sync {
    /// Point lookup by composite key. A missing row is `Ok(None)`.
    async fn get(
        &self,
        point_id: u32,
        day_of_week: Weekday,
    ) -> Result<Option<WeekdayAggregate>, StoreError>;

    /// Inserts a zero-valued aggregate and returns its id.
    async fn create(&self, point_id: u32, day_of_week: Weekday) -> Result<i64, StoreError>;

    /// Writes every mutable field of `aggregate` by id, provided the stored row
    /// still has `expected_evaluations`. Otherwise fails with
    /// [`StoreError::Stale`], or [`StoreError::NotFound`] if the row is gone.
    async fn save(
        &self,
        aggregate: &WeekdayAggregate,
        expected_evaluations: i64,
    ) -> Result<(), StoreError>;
}
