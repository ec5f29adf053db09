//! Polling assertions for async test scenarios.
//!
//! Registry pushes and connection re-picks happen on background tasks, so
//! tests wait for an observable condition instead of sleeping a fixed time.

use std::{future::Future, time::Duration};

use tokio::time::{Instant, sleep};

/// Default polling interval.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Polls a synchronous condition until it holds or `timeout` expires.
///
/// Returns whether the condition held; the condition is checked one final
/// time after the deadline.
///
/// # Example
///
/// ```no_run
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use std::sync::Arc;
/// use std::time::Duration;
/// use inferadb_ledger_test_utils::assert_eventually;
///
/// #[tokio::test]
/// async fn test_flag_set() {
///     let flag = Arc::new(AtomicBool::new(false));
///     let setter = Arc::clone(&flag);
///     tokio::spawn(async move { setter.store(true, Ordering::SeqCst) });
///
///     assert!(assert_eventually(Duration::from_secs(1), || flag.load(Ordering::SeqCst)).await);
/// }
/// ```
pub async fn assert_eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    eventually_async(timeout, || std::future::ready(condition())).await
}

/// Polls an asynchronous condition until it holds or `timeout` expires.
///
/// Each check runs to completion; a slow check delays the next one but is
/// never cancelled by the deadline. Useful when the check itself is an RPC.
pub async fn eventually_async<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;

    while Instant::now() < deadline {
        if condition().await {
            return true;
        }
        sleep(POLL_INTERVAL).await;
    }

    condition().await
}
