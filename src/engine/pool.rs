//! Bounded-concurrency draining of gateway work.

use futures::stream::{self, StreamExt};
use std::future::Future;

/// Default width of the gateway worker pool.
pub const DEFAULT_HOLD_WORKERS: usize = 5;

/// Run `f` over every item with at most `width` calls in flight.
///
/// The whole batch is always drained; per-item failures come back in the
/// result vector so the caller can count or propagate them after the fact.
pub async fn drain_bounded<I, T, R, F, Fut>(items: I, width: usize, f: F) -> Vec<R>
where
    I: IntoIterator<Item = T>,
    F: Fn(T) -> Fut,
    Fut: Future<Output = R>,
{
    stream::iter(items)
        .map(f)
        .buffer_unordered(width.max(1))
        .collect()
        .await
}

/// Split results, keeping the first error for propagation after the drain.
pub fn first_error<O, E>(results: Vec<Result<O, E>>) -> (Vec<O>, Option<E>) {
    let mut oks = Vec::with_capacity(results.len());
    let mut err = None;
    for result in results {
        match result {
            Ok(o) => oks.push(o),
            Err(e) => {
                if err.is_none() {
                    err = Some(e);
                }
            }
        }
    }
    (oks, err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_drain_bounded_runs_everything() {
        let counter = Arc::new(AtomicUsize::new(0));
        let results = drain_bounded(0..20, 5, |i| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                i * 2
            }
        })
        .await;

        assert_eq!(counter.load(Ordering::SeqCst), 20);
        assert_eq!(results.len(), 20);
    }

    #[tokio::test]
    async fn test_drain_bounded_caps_concurrency() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        drain_bounded(0..50, 5, |_| {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }
        })
        .await;

        assert!(peak.load(Ordering::SeqCst) <= 5);
    }

    #[tokio::test]
    async fn test_zero_width_still_drains() {
        let results = drain_bounded(0..3, 0, |i| async move { i }).await;
        assert_eq!(results.len(), 3);
    }

    #[test]
    fn test_first_error_keeps_oks() {
        let results: Vec<Result<i32, &str>> = vec![Ok(1), Err("a"), Ok(2), Err("b")];
        let (oks, err) = first_error(results);
        assert_eq!(oks, vec![1, 2]);
        assert_eq!(err, Some("a"));
    }
}
