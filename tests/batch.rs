//! Tests for the batch fetch engine against a live Redis server.

mod common;

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::time::Duration;
use strata::{Options, StrataError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const EXPIRE: Duration = Duration::from_secs(60);

/// A batch fetch function answering `values` after `delay`.
fn slow_values(
    values: HashMap<usize, String>,
    delay: Duration,
) -> impl Fn(Vec<usize>) -> BoxFuture<'static, Result<HashMap<usize, String>, strata::FetchError>>
       + Send
       + Sync
       + 'static {
    move |_idxs| {
        let values = values.clone();
        async move {
            tokio::time::sleep(delay).await;
            Ok(values)
        }
        .boxed()
    }
}

#[tokio::test]
async fn weak_batch_contention_shares_the_first_writers_values() {
    let Some(rc) = common::client().await else {
        return common::skip("weak_batch_contention_shares_the_first_writers_values");
    };
    let Some(rc2) = common::client().await else {
        return common::skip("weak_batch_contention_shares_the_first_writers_values");
    };
    let n = 16;
    let keys = common::unique_keys("weak-batch", n);
    let values1 = common::indexed_values(n, "value_");
    let values2 = common::indexed_values(n, "eulav_");
    let values3 = common::indexed_values(n, "vvvv_");
    let began = Instant::now();

    let first = {
        let keys = keys.clone();
        let values1 = values1.clone();
        tokio::spawn(async move {
            rc2.fetch_batch(&keys, EXPIRE, slow_values(values1, Duration::from_millis(200)))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let got = rc
        .fetch_batch(&keys, EXPIRE, slow_values(values2, Duration::from_millis(200)))
        .await
        .unwrap();
    assert_eq!(got, values1);
    assert!(began.elapsed() > Duration::from_millis(150));
    assert_eq!(first.await.unwrap().unwrap(), values1);

    rc.tag_as_deleted_batch(&keys).await.unwrap();

    // Weak mode keeps answering with the tombstoned values while the
    // detached refresh installs values3.
    let began = Instant::now();
    let got = rc
        .fetch_batch(&keys, EXPIRE, slow_values(values3.clone(), Duration::from_millis(200)))
        .await
        .unwrap();
    assert_eq!(got, values1);
    assert!(began.elapsed() < Duration::from_millis(200));

    tokio::time::sleep(Duration::from_millis(300)).await;
    let got = rc
        .fetch_batch(&keys, EXPIRE, slow_values(common::indexed_values(n, "uuuu_"), Duration::from_millis(200)))
        .await
        .unwrap();
    assert_eq!(got, values3);
}

#[tokio::test]
async fn overlapping_batches_keep_the_first_writers_overlap() {
    let Some(rc) = common::client().await else {
        return common::skip("overlapping_batches_keep_the_first_writers_overlap");
    };
    let Some(rc2) = common::client().await else {
        return common::skip("overlapping_batches_keep_the_first_writers_overlap");
    };
    let keys = common::unique_keys("batch-overlap", 100);
    let keys1: Vec<String> = keys[..60].to_vec();
    let keys2: Vec<String> = keys[40..].to_vec();
    let values1 = common::indexed_values(60, "value_");
    let values2 = common::indexed_values(60, "eulav_");
    let began = Instant::now();

    let first = {
        let values1 = values1.clone();
        tokio::spawn(async move {
            rc2.fetch_batch(&keys1, EXPIRE, slow_values(values1, Duration::from_millis(200)))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let got = rc
        .fetch_batch(&keys2, EXPIRE, slow_values(values2.clone(), Duration::from_millis(200)))
        .await
        .unwrap();
    assert!(began.elapsed() > Duration::from_millis(150));
    assert_eq!(got.len(), keys2.len());
    // Overlap keys [40, 60) were locked by the first writer, so its values
    // win there; the rest are ours.
    for i in 40..60 {
        assert_eq!(got[&(i - 40)], format!("value_{i}"));
    }
    for i in 60..100 {
        assert_eq!(got[&(i - 40)], format!("eulav_{}", i - 40));
    }
    assert_eq!(first.await.unwrap().unwrap(), values1);
}

#[tokio::test]
async fn strong_batch_waits_out_the_tombstone() {
    let Some(rc) = common::client_with(Options {
        strong_consistency: true,
        ..Options::default()
    })
    .await
    else {
        return common::skip("strong_batch_waits_out_the_tombstone");
    };
    let n = 12;
    let keys = common::unique_keys("strong-batch", n);
    let values1 = common::indexed_values(n, "value_");
    let values3 = common::indexed_values(n, "vvvv_");

    let got = rc
        .fetch_batch(&keys, EXPIRE, slow_values(values1.clone(), Duration::from_millis(50)))
        .await
        .unwrap();
    assert_eq!(got, values1);

    rc.tag_as_deleted_batch(&keys).await.unwrap();

    let began = Instant::now();
    let got = rc
        .fetch_batch(&keys, EXPIRE, slow_values(values3.clone(), Duration::from_millis(200)))
        .await
        .unwrap();
    assert_eq!(got, values3);
    assert!(began.elapsed() > Duration::from_millis(150));

    let got = rc
        .fetch_batch(&keys, EXPIRE, slow_values(common::indexed_values(n, "uuuu_"), Duration::from_millis(200)))
        .await
        .unwrap();
    assert_eq!(got, values3);
}

#[tokio::test]
async fn failed_batch_fetch_releases_every_lock() {
    for strong in [false, true] {
        let Some(rc) = common::client_with(Options {
            strong_consistency: strong,
            ..Options::default()
        })
        .await
        else {
            return common::skip("failed_batch_fetch_releases_every_lock");
        };
        let n = 12;
        let keys = common::unique_keys("batch-error", n);

        let err = rc
            .fetch_batch(&keys, EXPIRE, |_idxs| async {
                Err("db offline".into())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::Fetch(_)), "{err}");

        let began = Instant::now();
        let values = common::indexed_values(n, "value_");
        let got = rc
            .fetch_batch(&keys, EXPIRE, slow_values(values.clone(), Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(got, values);
        assert!(began.elapsed() < Duration::from_millis(150));
    }
}

#[tokio::test]
async fn batch_panic_is_caught_and_releases_every_lock() {
    let Some(rc) = common::client().await else {
        return common::skip("batch_panic_is_caught_and_releases_every_lock");
    };
    let n = 8;
    let keys = common::unique_keys("batch-panic", n);

    let err = rc
        .fetch_batch(&keys, EXPIRE, |_idxs| async { panic!("boom") })
        .await
        .unwrap_err();
    assert!(matches!(err, StrataError::FetchPanicked));

    let began = Instant::now();
    let values = common::indexed_values(n, "value_");
    let got = rc
        .fetch_batch(&keys, EXPIRE, slow_values(values.clone(), Duration::ZERO))
        .await
        .unwrap();
    assert_eq!(got, values);
    assert!(began.elapsed() < Duration::from_millis(150));
}

#[tokio::test]
async fn batch_empty_results_follow_the_empty_expire_policy() {
    for strong in [false, true] {
        for empty_expire in [Duration::ZERO, Duration::from_secs(10)] {
            let Some(rc) = common::client_with(Options {
                empty_expire,
                strong_consistency: strong,
                ..Options::default()
            })
            .await
            else {
                return common::skip("batch_empty_results_follow_the_empty_expire_policy");
            };
            let n = 10;
            let keys = common::unique_keys("batch-empty", n);

            // fn answers nothing: every index records an empty result.
            let got = rc
                .fetch_batch(&keys, EXPIRE, |_idxs| async { Ok(HashMap::new()) })
                .await
                .unwrap();
            assert_eq!(got.len(), n);
            assert!(got.values().all(|v| v.is_empty()));

            let retry = rc
                .fetch_batch(&keys, EXPIRE, |_idxs| async {
                    Err("db offline".into())
                })
                .await;
            if empty_expire.is_zero() {
                // Nothing was cached, so the failing source surfaces.
                assert!(
                    matches!(retry.unwrap_err(), StrataError::Fetch(_)),
                    "strong={strong}"
                );
            } else {
                // The recorded empties answer without touching the source.
                let got = retry.unwrap();
                assert_eq!(got.len(), n, "strong={strong}");
                assert!(got.values().all(|v| v.is_empty()));
            }
        }
    }
}

#[tokio::test]
async fn batch_cancellation_interrupts_the_waiters() {
    for strong in [false, true] {
        let Some(rc) = common::client_with(Options {
            strong_consistency: strong,
            ..Options::default()
        })
        .await
        else {
            return common::skip("batch_cancellation_interrupts_the_waiters");
        };
        let Some(rc2) = common::client().await else {
            return common::skip("batch_cancellation_interrupts_the_waiters");
        };
        let n = 12;
        let keys = common::unique_keys("batch-cancel", n);
        let values1 = common::indexed_values(n, "value_");

        let holder = {
            let keys = keys.clone();
            let values1 = values1.clone();
            tokio::spawn(async move {
                rc2.fetch_batch(&keys, EXPIRE, slow_values(values1, Duration::from_millis(450)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                cancel.cancel();
            });
        }

        let began = Instant::now();
        let err = rc
            .fetch_batch_with(
                &cancel,
                &keys,
                EXPIRE,
                slow_values(common::indexed_values(n, "eulav_"), Duration::from_millis(200)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StrataError::Cancelled));
        assert!(began.elapsed() > Duration::from_millis(150));
        assert!(began.elapsed() < Duration::from_millis(400));

        assert_eq!(holder.await.unwrap().unwrap(), values1);
    }
}
