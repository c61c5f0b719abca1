//! Integration tests for the lock-retrying store cursor
//!
//! Tests verify that contention is retried, exhaustion is surfaced, and that nothing other than
//! contention is retried

use chain_price_core::address::normalize;
use chain_price_core::database::{LocalStore, RetryPolicy, SqlValue};
use chain_price_core::errors::CoreError;
use chain_price_core::price_cache::PriceCache;
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Connection, Row, SqliteConnection};
use std::str::FromStr;
use std::time::Duration;
use tempfile::TempDir;

const SCHEMA: &str =
    "CREATE TABLE IF NOT EXISTS entries (writer TEXT NOT NULL, n INTEGER NOT NULL, UNIQUE (writer, n))";

fn store_in(dir: &TempDir, policy: RetryPolicy) -> LocalStore {
    LocalStore::new(dir.path().join("cache.sqlite"), policy).with_schema([SCHEMA])
}

async fn count_rows(store: &LocalStore) -> i64 {
    store
        .with_cursor(|cursor| {
            Box::pin(async move {
                let row = cursor
                    .fetchone("SELECT COUNT(*) AS n FROM entries", &[])
                    .await?
                    .expect("count always returns a row");
                Ok(row.get::<i64, _>("n"))
            })
        })
        .await
        .expect("count")
}

/// Test a basic insert then read back
#[tokio::test]
async fn test_insert_and_fetchone() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir, RetryPolicy::default());
    let cursor = store.connect().await.expect("connect");

    cursor
        .insert(
            "entries",
            &[("writer", SqlValue::from("a")), ("n", SqlValue::from(7i64))],
        )
        .await
        .expect("insert");

    let row = cursor
        .fetchone(
            "SELECT n FROM entries WHERE writer = ?",
            &[SqlValue::from("a")],
        )
        .await
        .unwrap()
        .expect("row present");
    assert_eq!(row.get::<i64, _>("n"), 7);

    let missing = cursor
        .fetchone(
            "SELECT n FROM entries WHERE writer = ?",
            &[SqlValue::from("nobody")],
        )
        .await
        .unwrap();
    assert!(missing.is_none());

    let all = cursor.fetchall("SELECT n FROM entries", &[]).await.unwrap();
    assert_eq!(all.len(), 1);
    cursor.close().await;
}

/// Test that missing parent directories are created on connect
#[tokio::test]
async fn test_connect_creates_parent_directories() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("deeper").join("cache.sqlite");
    let store = LocalStore::new(&path, RetryPolicy::default()).with_schema([SCHEMA]);

    store.connect().await.expect("connect").close().await;
    assert!(path.exists());
}

/// Test that constraint violations and bad statements are rejected without retrying
#[tokio::test]
async fn test_rejections_are_not_retried() {
    let dir = TempDir::new().unwrap();
    // a retried rejection would take 50 * 200ms
    let store = store_in(&dir, RetryPolicy::new(Duration::from_millis(200), 50));
    let cursor = store.connect().await.unwrap();
    let row = [("writer", SqlValue::from("a")), ("n", SqlValue::from(1i64))];
    cursor.insert("entries", &row).await.unwrap();

    let started = std::time::Instant::now();
    let duplicate = cursor.insert("entries", &row).await;
    assert!(
        matches!(duplicate, Err(CoreError::StoreRejected { .. })),
        "got {:?}",
        duplicate
    );

    let unknown = cursor
        .insert("no_such_table", &[("x", SqlValue::from(1i64))])
        .await;
    assert!(matches!(unknown, Err(CoreError::StoreRejected { .. })));

    let injected = cursor
        .insert("entries; DROP TABLE entries", &[("x", SqlValue::Null)])
        .await;
    assert!(matches!(injected, Err(CoreError::StoreRejected { .. })));

    assert!(started.elapsed() < Duration::from_secs(2));
    cursor.close().await;
    assert_eq!(count_rows(&store).await, 1);
}

/// Test that two independent writers on one file never lose a row
#[tokio::test]
async fn test_concurrent_writers_lose_nothing() {
    let dir = TempDir::new().unwrap();
    let policy = RetryPolicy::new(Duration::from_millis(5), 400);
    // separate handles: separate in-process writer locks, so the engine arbitrates
    let first = store_in(&dir, policy);
    let second = store_in(&dir, policy);
    const PER_WRITER: i64 = 25;

    let write_all = |store: LocalStore, name: &'static str| async move {
        let cursor = store.connect().await?;
        let mut outcomes = Vec::new();
        for n in 0..PER_WRITER {
            outcomes.push(
                cursor
                    .insert(
                        "entries",
                        &[("writer", SqlValue::from(name)), ("n", SqlValue::from(n))],
                    )
                    .await,
            );
        }
        cursor.close().await;
        Ok::<_, CoreError>(outcomes)
    };

    let (a, b) = tokio::join!(
        tokio::spawn(write_all(first.clone(), "a")),
        tokio::spawn(write_all(second, "b")),
    );
    let outcomes: Vec<_> = a.unwrap().unwrap().into_iter().chain(b.unwrap().unwrap()).collect();

    let mut succeeded = 0;
    for outcome in outcomes {
        match outcome {
            Ok(()) => succeeded += 1,
            Err(CoreError::StoreContention { .. }) => {}
            Err(other) => panic!("write failed silently: {:?}", other),
        }
    }
    assert_eq!(succeeded, 2 * PER_WRITER);
    assert_eq!(count_rows(&first).await, succeeded);
}

/// Test that a lock held past the retry budget surfaces StoreContention
#[tokio::test]
async fn test_exhausted_retries_surface_contention() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir, RetryPolicy::new(Duration::from_millis(5), 4));
    let cursor = store.connect().await.unwrap();

    let options = SqliteConnectOptions::new().filename(store.path());
    let mut blocker = SqliteConnection::connect_with(&options).await.unwrap();
    sqlx::query("BEGIN EXCLUSIVE")
        .execute(&mut blocker)
        .await
        .unwrap();

    let result = cursor
        .insert(
            "entries",
            &[("writer", SqlValue::from("a")), ("n", SqlValue::from(1i64))],
        )
        .await;
    match result {
        Err(CoreError::StoreContention { attempts, .. }) => assert_eq!(attempts, 4),
        other => panic!("expected contention, got {:?}", other),
    }

    sqlx::query("ROLLBACK").execute(&mut blocker).await.unwrap();
    blocker.close().await.unwrap();

    cursor
        .insert(
            "entries",
            &[("writer", SqlValue::from("a")), ("n", SqlValue::from(1i64))],
        )
        .await
        .expect("insert succeeds once the lock is released");
    cursor.close().await;
}

/// Test that with_cursor returns the closure's value and its errors unchanged
#[tokio::test]
async fn test_with_cursor_passes_results_through() {
    let dir = TempDir::new().unwrap();
    let store = store_in(&dir, RetryPolicy::default());

    let inserted = store
        .with_cursor(|cursor| {
            Box::pin(async move {
                cursor
                    .insert(
                        "entries",
                        &[("writer", SqlValue::from("w")), ("n", SqlValue::from(1i64))],
                    )
                    .await?;
                Ok(42)
            })
        })
        .await
        .unwrap();
    assert_eq!(inserted, 42);

    let failed: Result<(), CoreError> = store
        .with_cursor(|cursor| {
            Box::pin(async move {
                cursor.fetchone("SELECT * FROM missing_table", &[]).await?;
                Ok(())
            })
        })
        .await;
    assert!(matches!(failed, Err(CoreError::StoreRejected { .. })));
    assert_eq!(count_rows(&store).await, 1);
}

/// Test that a later price supersedes an earlier one for the same token and block
#[tokio::test]
async fn test_price_cache_latest_entry_wins() {
    let dir = TempDir::new().unwrap();
    let cache = PriceCache::new(LocalStore::new(dir.path().join("prices.sqlite"), RetryPolicy::default()), 1);
    let token = normalize("0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2").unwrap();

    assert_eq!(cache.get_price(token, 100).await.unwrap(), None);

    cache
        .set_price(token, 100, Decimal::from_str("1999.5").unwrap())
        .await
        .unwrap();
    cache
        .set_price(token, 100, Decimal::from_str("2001.25").unwrap())
        .await
        .unwrap();
    cache
        .set_price(token, 101, Decimal::from_str("2002").unwrap())
        .await
        .unwrap();

    assert_eq!(
        cache.get_price(token, 100).await.unwrap(),
        Some(Decimal::from_str("2001.25").unwrap())
    );

    let history = cache.history(token).await.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].block, 100);
    assert_eq!(history[2].block, 101);
    assert!(history.iter().all(|e| e.token == token));

    let other = normalize(1u64).unwrap();
    assert!(cache.history(other).await.unwrap().is_empty());
}

/// Test that prices for different chains do not leak into each other
#[tokio::test]
async fn test_price_cache_is_per_chain() {
    let dir = TempDir::new().unwrap();
    let store = LocalStore::new(dir.path().join("prices.sqlite"), RetryPolicy::default());
    let mainnet = PriceCache::new(store.clone(), 1);
    let arbitrum = PriceCache::new(store, 42161);
    let token = normalize(10u64).unwrap();

    mainnet.set_price(token, 5, Decimal::ONE).await.unwrap();
    assert_eq!(arbitrum.get_price(token, 5).await.unwrap(), None);
    assert_eq!(mainnet.get_price(token, 5).await.unwrap(), Some(Decimal::ONE));
}

/// Test that ids and blocks beyond the integer column range are rejected rather than wrapped
#[tokio::test]
async fn test_price_cache_rejects_out_of_range_keys() {
    let dir = TempDir::new().unwrap();
    let store = LocalStore::new(dir.path().join("prices.sqlite"), RetryPolicy::default());
    let huge_chain = PriceCache::new(store.clone(), u64::MAX);
    let token = normalize(10u64).unwrap();

    for err in [
        huge_chain.set_price(token, 5, Decimal::ONE).await.unwrap_err(),
        huge_chain.get_price(token, 5).await.unwrap_err(),
        huge_chain.history(token).await.unwrap_err(),
    ] {
        assert!(matches!(err, CoreError::StoreRejected { .. }), "{:?}", err);
    }

    let mainnet = PriceCache::new(store, 1);
    assert!(matches!(
        mainnet.set_price(token, u64::MAX, Decimal::ONE).await,
        Err(CoreError::StoreRejected { .. })
    ));
    assert!(mainnet.history(token).await.unwrap().is_empty());
}
