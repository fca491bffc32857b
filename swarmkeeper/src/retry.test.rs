use super::*;
use assert_matches::assert_matches;
use std::sync::atomic::{AtomicU32, Ordering};

const FAST: RetryPolicy = RetryPolicy::new(Duration::ZERO, 4);

#[test_log::test(tokio::test)]
async fn test_poll_until_returns_first_value() {
    let calls = AtomicU32::new(0);
    let result: Result<u32, RetryError<ApiError>> = poll_until(FAST, "third call", || async {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok((n == 3).then_some(n))
    })
    .await;

    assert_eq!(result.unwrap(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test_log::test(tokio::test)]
async fn test_poll_until_exhausts_budget() {
    let calls = AtomicU32::new(0);
    let result: Result<(), RetryError<ApiError>> = poll_until(FAST, "never", || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    })
    .await;

    assert_matches!(result, Err(RetryError::Exhausted { attempts: 4, last_error: None, .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[test_log::test(tokio::test)]
async fn test_poll_until_retries_transient_errors() {
    let calls = AtomicU32::new(0);
    let result = poll_until(FAST, "flaky", || async {
        match calls.fetch_add(1, Ordering::SeqCst) {
            0 | 1 => Err(ApiError::Transient("busy".into())),
            _ => Ok(Some("done")),
        }
    })
    .await;

    assert_eq!(result.unwrap(), "done");
}

#[test_log::test(tokio::test)]
async fn test_poll_until_stops_on_fatal_error() {
    let calls = AtomicU32::new(0);
    let result: Result<(), _> = poll_until(FAST, "fatal", || async {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(ApiError::Fatal("forbidden".into()))
    })
    .await;

    assert_matches!(result, Err(RetryError::Failed(ApiError::Fatal(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test_log::test(tokio::test)]
async fn test_retry_transient_records_last_error() {
    let result: Result<(), _> = retry_transient(RetryPolicy::new(Duration::ZERO, 2), "busy", || async {
        Err(ApiError::Transient("throttled".into()))
    })
    .await;

    assert_matches!(
        result,
        Err(RetryError::Exhausted { last_error: Some(ref e), .. }) if e.contains("throttled")
    );
}

#[test]
fn test_budget() {
    assert_eq!(RetryPolicy::from_secs(30, 3).budget(), Duration::from_secs(60));
    assert_eq!(RetryPolicy::from_secs(30, 0).budget(), Duration::ZERO);
}
