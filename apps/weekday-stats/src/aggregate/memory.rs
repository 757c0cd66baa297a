use super::store::{AggregateStore, StoreError};
use super::types::WeekdayAggregate;
use async_trait::async_trait;
use chrono::{Utc, Weekday};
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    rows: HashMap<i64, WeekdayAggregate>,
    keys: HashMap<(u32, Weekday), i64>,
}

/// In-process [`AggregateStore`] used by the unit tests.
#[derive(Default)]
pub(crate) struct MemoryAggregateStore {
    state: Mutex<MemoryState>,
}

impl MemoryAggregateStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn snapshot(&self) -> Vec<WeekdayAggregate> {
        let state = self.state.lock().await;
        let mut rows: Vec<WeekdayAggregate> = state.rows.values().cloned().collect();
        rows.sort_by_key(|row| (row.point_id, row.day_of_week.num_days_from_monday()));
        rows
    }

    pub(crate) async fn remove(&self, id: i64) {
        let mut state = self.state.lock().await;
        if let Some(row) = state.rows.remove(&id) {
            state.keys.remove(&(row.point_id, row.day_of_week));
        }
    }
}

#[async_trait]
impl AggregateStore for MemoryAggregateStore {
    async fn get(
        &self,
        point_id: u32,
        day_of_week: Weekday,
    ) -> Result<Option<WeekdayAggregate>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .keys
            .get(&(point_id, day_of_week))
            .and_then(|id| state.rows.get(id))
            .cloned())
    }

    async fn create(&self, point_id: u32, day_of_week: Weekday) -> Result<i64, StoreError> {
        let mut state = self.state.lock().await;
        if state.keys.contains_key(&(point_id, day_of_week)) {
            return Err(StoreError::Conflict {
                point_id,
                day_of_week,
            });
        }
        state.next_id += 1;
        let id = state.next_id;
        state.keys.insert((point_id, day_of_week), id);
        state.rows.insert(
            id,
            WeekdayAggregate::empty(id, point_id, day_of_week, Utc::now()),
        );
        Ok(id)
    }

    async fn save(
        &self,
        aggregate: &WeekdayAggregate,
        expected_evaluations: i64,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let stored = state
            .rows
            .get_mut(&aggregate.id)
            .ok_or(StoreError::NotFound { id: aggregate.id })?;
        if stored.evaluations != expected_evaluations {
            return Err(StoreError::Stale {
                id: aggregate.id,
                expected: expected_evaluations,
            });
        }
        *stored = aggregate.clone();
        Ok(())
    }
}
