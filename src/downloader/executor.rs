//! Bounded fan-out/fan-in over a list of work items

use futures::future;
use futures::stream::{self, StreamExt};
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Run `worker` over every item with at most `max_concurrency` in flight.
///
/// Results come back in completion order; carry an index in `R` when
/// positions matter. Once `cancel` fires no further items are started,
/// so the result set may be shorter than the input. Workers already in
/// flight are expected to watch the same token themselves.
pub async fn run<T, R, F, Fut>(
    items: impl IntoIterator<Item = T>,
    max_concurrency: usize,
    cancel: &CancellationToken,
    worker: F,
) -> Vec<R>
where
    F: FnMut(T) -> Fut,
    Fut: Future<Output = R>,
{
    stream::iter(items)
        .take_while(|_| future::ready(!cancel.is_cancelled()))
        .map(worker)
        .buffer_unordered(max_concurrency.max(1))
        .collect()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Default)]
    struct Gauge {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Gauge {
        fn enter(&self) {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
        }

        fn exit(&self) {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_never_exceeds_limit_and_processes_all() {
        let gauge = Arc::new(Gauge::default());
        let cancel = CancellationToken::new();

        let results = run(0..40usize, 4, &cancel, |i| {
            let gauge = Arc::clone(&gauge);
            async move {
                gauge.enter();
                tokio::time::sleep(Duration::from_millis((i % 5) as u64 * 2)).await;
                gauge.exit();
                i
            }
        })
        .await;

        assert_eq!(results.len(), 40);
        let mut sorted = results.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..40).collect::<Vec<_>>(), "every item exactly once");
        assert!(gauge.peak.load(Ordering::SeqCst) <= 4);
        assert!(gauge.peak.load(Ordering::SeqCst) >= 2, "work actually overlapped");
    }

    #[tokio::test]
    async fn test_results_in_completion_order() {
        let cancel = CancellationToken::new();
        let results = run(vec![30u64, 1], 2, &cancel, |delay| async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            delay
        })
        .await;
        assert_eq!(results, vec![1, 30]);
    }

    #[tokio::test]
    async fn test_cancel_stops_new_items() {
        let cancel = CancellationToken::new();
        let started = Arc::new(AtomicUsize::new(0));

        let results = run(0..100usize, 2, &cancel, |i| {
            let cancel = cancel.clone();
            let started = Arc::clone(&started);
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                if i == 3 {
                    cancel.cancel();
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
                i
            }
        })
        .await;

        assert!(results.len() < 100);
        assert!(started.load(Ordering::SeqCst) < 100);
    }

    #[test]
    fn test_zero_concurrency_still_makes_progress() {
        let cancel = CancellationToken::new();
        let results = tokio_test::block_on(run(vec![1, 2, 3], 0, &cancel, |i| async move { i * 10 }));
        assert_eq!(results, vec![10, 20, 30]);
    }
}
