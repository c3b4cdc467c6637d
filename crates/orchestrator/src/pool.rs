//! Bounded worker pool for one round of claimed tasks.

use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use tokio::sync::Semaphore;

/// Runs `work` over every item with at most `limit` futures past the gate at once.
///
/// Results come back in completion order. Items start in input order because
/// the semaphore hands out permits FIFO.
pub async fn run_bounded<T, R, F, Fut>(items: Vec<T>, limit: usize, work: F) -> Vec<R>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = R>,
{
    let semaphore = Semaphore::new(limit.max(1));
    let work = &work;
    let semaphore = &semaphore;

    let mut in_flight: FuturesUnordered<_> = items
        .into_iter()
        .map(|item| async move {
            // The semaphore is never closed, so acquire only waits.
            let _permit = semaphore.acquire().await.ok();
            work(item).await
        })
        .collect();

    let mut results = Vec::with_capacity(in_flight.len());
    while let Some(result) = in_flight.next().await {
        results.push(result);
    }
    results
}
