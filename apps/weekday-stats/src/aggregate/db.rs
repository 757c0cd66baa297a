use super::store::{AggregateStore, StoreError};
use super::types::{weekday_from_index, weekday_index, WeekdayAggregate};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc, Weekday};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::time::Duration;

const UNIQUE_VIOLATION: &str = "23505";

pub async fn build_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(8))
        .connect(database_url)
        .await
        .context("failed to connect to the aggregate database")?;
    Ok(pool)
}

#[derive(Clone)]
pub struct PgAggregateStore {
    pool: PgPool,
}

impl PgAggregateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS weekday_aggregates (
                id bigserial primary key,
                point_id bigint not null,
                day_of_week smallint not null check (day_of_week between 0 and 6),
                last_updated timestamptz not null default now(),
                start_time timestamptz null,
                end_time timestamptz null,
                evaluations bigint not null default 0,
                count bigint not null default 0,
                sum double precision null,
                mean double precision null,
                std_dev double precision null,
                min double precision null,
                max double precision null,
                unique (point_id, day_of_week)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create weekday_aggregates")?;
        Ok(())
    }
}

fn map_row(row: &PgRow) -> Result<WeekdayAggregate, StoreError> {
    let point_id = row.try_get::<i64, _>("point_id")?;
    let point_id = u32::try_from(point_id)
        .map_err(|_| StoreError::Unavailable(format!("point_id {point_id} out of range")))?;
    let day_index = row.try_get::<i16, _>("day_of_week")?;
    let day_of_week = weekday_from_index(day_index as i64)
        .ok_or_else(|| StoreError::Unavailable(format!("day_of_week {day_index} out of range")))?;

    Ok(WeekdayAggregate {
        id: row.try_get("id")?,
        point_id,
        day_of_week,
        last_updated: row.try_get::<DateTime<Utc>, _>("last_updated")?,
        start: row.try_get::<Option<DateTime<Utc>>, _>("start_time")?,
        end: row.try_get::<Option<DateTime<Utc>>, _>("end_time")?,
        evaluations: row.try_get("evaluations")?,
        count: row.try_get("count")?,
        sum: row.try_get("sum")?,
        mean: row.try_get("mean")?,
        std_dev: row.try_get("std_dev")?,
        min: row.try_get("min")?,
        max: row.try_get("max")?,
    })
}

#[async_trait]
impl AggregateStore for PgAggregateStore {
    async fn get(
        &self,
        point_id: u32,
        day_of_week: Weekday,
    ) -> Result<Option<WeekdayAggregate>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                id, point_id, day_of_week, last_updated, start_time, end_time,
                evaluations, count, sum, mean, std_dev, min, max
            FROM weekday_aggregates
            WHERE point_id = $1 AND day_of_week = $2
            "#,
        )
        .bind(point_id as i64)
        .bind(weekday_index(day_of_week))
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(map_row).transpose()
    }

    async fn create(&self, point_id: u32, day_of_week: Weekday) -> Result<i64, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO weekday_aggregates (point_id, day_of_week, last_updated, evaluations, count)
            VALUES ($1, $2, $3, 0, 0)
            RETURNING id
            "#,
        )
        .bind(point_id as i64)
        .bind(weekday_index(day_of_week))
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => Ok(row.try_get::<i64, _>("id")?),
            Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
                Err(StoreError::Conflict {
                    point_id,
                    day_of_week,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn save(
        &self,
        aggregate: &WeekdayAggregate,
        expected_evaluations: i64,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE weekday_aggregates
            SET last_updated = $3,
                start_time = $4,
                end_time = $5,
                evaluations = $6,
                count = $7,
                sum = $8,
                mean = $9,
                std_dev = $10,
                min = $11,
                max = $12
            WHERE id = $1
              AND evaluations = $2
            "#,
        )
        .bind(aggregate.id)
        .bind(expected_evaluations)
        .bind(aggregate.last_updated)
        .bind(aggregate.start)
        .bind(aggregate.end)
        .bind(aggregate.evaluations)
        .bind(aggregate.count)
        .bind(aggregate.sum)
        .bind(aggregate.mean)
        .bind(aggregate.std_dev)
        .bind(aggregate.min)
        .bind(aggregate.max)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        let exists = sqlx::query("SELECT 1 FROM weekday_aggregates WHERE id = $1")
            .bind(aggregate.id)
            .fetch_optional(&self.pool)
            .await?
            .is_some();
        if exists {
            Err(StoreError::Stale {
                id: aggregate.id,
                expected: expected_evaluations,
            })
        } else {
            Err(StoreError::NotFound { id: aggregate.id })
        }
    }
}
