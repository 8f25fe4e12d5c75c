mod helpers;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use agentmem::db::{self, is_retryable_db_error, transaction_with_retry};

#[test]
fn lock_contention_is_classified_retryable() {
    let (_tmp, path, holder) = helpers::temp_db();
    holder.execute_batch("BEGIN IMMEDIATE").unwrap();

    let other = db::open_database(&path, Duration::from_millis(0)).unwrap();
    let err = other
        .execute("INSERT INTO tools (name) VALUES ('rg')", [])
        .unwrap_err();
    assert!(is_retryable_db_error(&err), "unexpected error: {err}");
}

#[test]
fn constraint_violation_is_not_retryable() {
    let (_tmp, _path, conn) = helpers::temp_db();
    conn.execute("INSERT INTO tools (name) VALUES ('rg')", []).unwrap();
    let err = conn
        .execute("INSERT INTO tools (name) VALUES ('rg')", [])
        .unwrap_err();
    assert!(!is_retryable_db_error(&err));
}

#[tokio::test]
async fn exhausted_retries_return_the_last_error() {
    let (_tmp, path, holder) = helpers::temp_db();
    holder.execute_batch("BEGIN IMMEDIATE").unwrap();
    let conn = helpers::impatient_connection(&path);

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let err = transaction_with_retry(&conn, &helpers::fast_policy(2), move |tx| {
        counter.fetch_add(1, Ordering::SeqCst);
        tx.execute("INSERT INTO tools (name) VALUES ('fd')", [])?;
        Ok(())
    })
    .await
    .unwrap_err();

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let err: &(dyn std::error::Error + 'static) = err.as_ref();
    assert!(is_retryable_db_error(err));
}

#[tokio::test]
async fn retries_until_the_lock_is_released() {
    let (_tmp, path, holder) = helpers::temp_db();
    let (locked_tx, locked_rx) = mpsc::channel();
    let releaser = std::thread::spawn(move || {
        holder.execute_batch("BEGIN IMMEDIATE").unwrap();
        locked_tx.send(()).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        holder.execute_batch("COMMIT").unwrap();
        holder
    });
    locked_rx.recv().unwrap();

    let conn = helpers::impatient_connection(&path);
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let id = transaction_with_retry(&conn, &helpers::fast_policy(10), move |tx| {
        counter.fetch_add(1, Ordering::SeqCst);
        tx.execute("INSERT INTO tools (name) VALUES ('jq')", [])?;
        Ok(tx.last_insert_rowid())
    })
    .await
    .unwrap();

    let holder = releaser.join().unwrap();
    assert!(attempts.load(Ordering::SeqCst) > 1);
    assert_eq!(helpers::tool_count(&holder), 1);
    assert!(id > 0);
}

#[tokio::test]
async fn non_retryable_failure_rolls_back_without_retry() {
    let (_tmp, _path, conn) = helpers::temp_db();
    conn.execute("INSERT INTO tools (name) VALUES ('rg')", []).unwrap();
    let conn = db::shared(conn);

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let result = transaction_with_retry(&conn, &helpers::fast_policy(3), move |tx| {
        counter.fetch_add(1, Ordering::SeqCst);
        tx.execute("INSERT INTO tools (name) VALUES ('bat')", [])?;
        tx.execute("INSERT INTO tools (name) VALUES ('rg')", [])?;
        Ok(())
    })
    .await;

    assert!(result.is_err());
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(helpers::tool_count(&conn.lock().unwrap()), 1);
}

#[tokio::test]
async fn open_transaction_runs_work_once_without_retry() {
    let (_tmp, _path, conn) = helpers::temp_db();
    conn.execute_batch("BEGIN").unwrap();
    let conn = db::shared(conn);

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    let result: anyhow::Result<()> = transaction_with_retry(&conn, &helpers::fast_policy(3), move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("database is locked")
    })
    .await;
    assert!(result.is_err());
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    // Work joins the caller's transaction; the caller decides to commit.
    transaction_with_retry(&conn, &helpers::fast_policy(3), |tx| {
        tx.execute("INSERT INTO tools (name) VALUES ('sd')", [])?;
        Ok(())
    })
    .await
    .unwrap();
    let guard = conn.lock().unwrap();
    assert!(!guard.is_autocommit());
    guard.execute_batch("COMMIT").unwrap();
    assert_eq!(helpers::tool_count(&guard), 1);
}
