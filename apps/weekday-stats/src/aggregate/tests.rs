use super::{AggregateStore, BatchMerger, PgAggregateStore, StoreError};
use crate::aggregate::types::Sample;
use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc, Weekday};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::env;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

async fn setup_test_pool(database_url: &str, schema: &str) -> Result<PgPool> {
    let admin_pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(database_url)
        .await?;
    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema))
        .execute(&admin_pool)
        .await?;
    drop(admin_pool);

    let schema_name = schema.to_string();
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .after_connect(move |conn, _meta| {
            let schema = schema_name.clone();
            Box::pin(async move {
                sqlx::query(&format!("SET search_path TO {}", schema))
                    .execute(conn)
                    .await?;
                Ok(())
            })
        })
        .connect(database_url)
        .await?;

    PgAggregateStore::new(pool.clone()).ensure_schema().await?;
    Ok(pool)
}

async fn drop_schema(database_url: &str, schema: &str) -> Result<()> {
    let admin_pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(database_url)
        .await?;
    let _ = sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema))
        .execute(&admin_pool)
        .await;
    Ok(())
}

fn test_database_url() -> Option<String> {
    if env::var("DOW_INTEGRATION_TEST").ok().as_deref() != Some("1") {
        return None;
    }
    env::var("DOW_TEST_DATABASE_URL").ok()
}

fn monday(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap()
}

fn samples(values: &[f64]) -> Vec<Sample> {
    values
        .iter()
        .enumerate()
        .map(|(hour, value)| Sample {
            value: *value,
            timestamp: monday(hour as u32),
        })
        .collect()
}

#[tokio::test]
async fn test_store_create_get_save_roundtrip() -> Result<()> {
    let Some(database_url) = test_database_url() else {
        return Ok(());
    };
    let schema = format!("dow_test_store_{}", std::process::id());
    let pool = setup_test_pool(&database_url, &schema).await?;
    let store = PgAggregateStore::new(pool);

    assert!(store.get(7, Weekday::Mon).await?.is_none());
    let id = store.create(7, Weekday::Mon).await?;

    let err = store.create(7, Weekday::Mon).await.unwrap_err();
    assert!(matches!(
        err,
        StoreError::Conflict {
            point_id: 7,
            day_of_week: Weekday::Mon
        }
    ));

    let mut aggregate = store.get(7, Weekday::Mon).await?.unwrap();
    assert_eq!(aggregate.id, id);
    assert_eq!(aggregate.evaluations, 0);
    assert_eq!(aggregate.count, 0);
    assert!(aggregate.mean.is_none());
    assert!(aggregate.start.is_none());

    aggregate.evaluations = 1;
    aggregate.count = 2;
    aggregate.sum = Some(10.0);
    aggregate.mean = Some(5.0);
    aggregate.std_dev = Some(1.0);
    aggregate.min = Some(4.0);
    aggregate.max = Some(6.0);
    aggregate.start = Some(monday(1));
    aggregate.end = Some(monday(2));
    store.save(&aggregate, 0).await?;

    let stored = store.get(7, Weekday::Mon).await?.unwrap();
    assert_eq!(stored.evaluations, 1);
    assert_eq!(stored.count, 2);
    assert_eq!(stored.sum, Some(10.0));
    assert_eq!(stored.start, Some(monday(1)));
    assert_eq!(stored.end, Some(monday(2)));

    let err = store.save(&aggregate, 0).await.unwrap_err();
    assert!(matches!(err, StoreError::Stale { expected: 0, .. }));

    aggregate.id = id + 1000;
    let err = store.save(&aggregate, 1).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));

    drop_schema(&database_url, &schema).await
}

#[tokio::test]
async fn test_merges_accumulate_in_postgres() -> Result<()> {
    let Some(database_url) = test_database_url() else {
        return Ok(());
    };
    let schema = format!("dow_test_merge_{}", std::process::id());
    let pool = setup_test_pool(&database_url, &schema).await?;
    let store = Arc::new(PgAggregateStore::new(pool));
    let merger = BatchMerger::new(store.clone());
    let cancel = CancellationToken::new();

    merger.merge(3, Weekday::Mon, &samples(&[3.0]), &cancel).await?;
    let merged = merger
        .merge(3, Weekday::Mon, &samples(&[5.0, 7.0]), &cancel)
        .await?
        .unwrap();

    assert_eq!(merged.count, 3);
    assert_eq!(merged.evaluations, 2);
    assert!((merged.mean.unwrap() - 5.0).abs() < 1e-9);
    assert!((merged.sum.unwrap() - 15.0).abs() < 1e-9);
    assert!((merged.std_dev.unwrap() - 2.0 / 3.0).abs() < 1e-9);

    let stored = store.get(3, Weekday::Mon).await?.unwrap();
    assert_eq!(stored.id, merged.id);
    assert_eq!(stored.count, merged.count);
    assert_eq!(stored.min, Some(3.0));
    assert_eq!(stored.max, Some(7.0));
    assert_eq!(stored.start, Some(monday(0)));
    assert_eq!(stored.end, Some(monday(1)));

    drop_schema(&database_url, &schema).await
}

#[tokio::test]
async fn test_independent_mergers_do_not_lose_updates() -> Result<()> {
    let Some(database_url) = test_database_url() else {
        return Ok(());
    };
    let schema = format!("dow_test_cas_{}", std::process::id());
    let pool = setup_test_pool(&database_url, &schema).await?;

    // Separate mergers share no key locks, so only the evaluations check
    // keeps the two writers apart.
    let first = BatchMerger::new(Arc::new(PgAggregateStore::new(pool.clone())));
    let second = BatchMerger::new(Arc::new(PgAggregateStore::new(pool.clone())));
    let cancel = CancellationToken::new();

    let batch_a = samples(&[1.0, 2.0]);
    let batch_b = samples(&[3.0, 4.0, 5.0]);
    let (a, b) = tokio::join!(
        first.merge(9, Weekday::Mon, &batch_a, &cancel),
        second.merge(9, Weekday::Mon, &batch_b, &cancel),
    );
    a?;
    b?;

    let stored = PgAggregateStore::new(pool)
        .get(9, Weekday::Mon)
        .await?
        .unwrap();
    assert_eq!(stored.count, 5);
    assert_eq!(stored.evaluations, 2);
    assert_eq!(stored.min, Some(1.0));
    assert_eq!(stored.max, Some(5.0));
    assert!((stored.sum.unwrap() - 15.0).abs() < 1e-9);

    drop_schema(&database_url, &schema).await
}
