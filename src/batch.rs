//! Chunked batch processing
//!
//! Splits a workload into fixed-size chunks, runs the items of each chunk
//! through a caller-supplied worker with bounded concurrency, and pauses
//! between chunks. The pause exists to spread load over time even when each
//! individual item is cheap; downstream rate limiting still applies on top.
//!
//! Results come back in input order regardless of completion order, and the
//! first item failure aborts the batch without starting later chunks.

use crate::errors::GenerationError;
use bon::Builder;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Shape of a chunked batch run.
#[derive(Debug, Clone, Builder)]
pub struct BatchOptions {
    /// Items per chunk.
    #[builder(default = 5)]
    pub chunk_size: usize,
    /// Pause between consecutive chunks. Not applied after the last chunk.
    #[builder(default = Duration::from_secs(60))]
    pub delay_between_chunks: Duration,
    /// Items of one chunk processed concurrently. The orchestrator keeps
    /// this at 1; the scheduler serializes requests anyway.
    #[builder(default = 1)]
    pub max_concurrent: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Run `worker` over `items` in chunks, returning results in input order.
///
/// Fails fast: the error of the first failing item is returned and no
/// further chunk is started.
pub async fn process_in_chunks<T, R, F, Fut>(
    items: Vec<T>,
    worker: F,
    options: &BatchOptions,
) -> Result<Vec<R>, GenerationError>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<R, GenerationError>>,
{
    let total = items.len();
    if total == 0 {
        return Ok(Vec::new());
    }

    let chunk_size = options.chunk_size.max(1);
    let concurrency = options.max_concurrent.max(1);
    let chunk_count = total.div_ceil(chunk_size);
    let mut results = Vec::with_capacity(total);

    let mut chunks = Vec::with_capacity(chunk_count);
    let mut items = items.into_iter();
    for _ in 0..chunk_count {
        chunks.push(items.by_ref().take(chunk_size).collect::<Vec<_>>());
    }

    for (index, chunk) in chunks.into_iter().enumerate() {
        debug!(
            chunk = index + 1,
            chunk_count,
            items = chunk.len(),
            "processing batch chunk"
        );

        let chunk_results: Vec<R> = stream::iter(chunk)
            .map(&worker)
            .buffered(concurrency)
            .try_collect()
            .await?;
        results.extend(chunk_results);

        if index + 1 < chunk_count && !options.delay_between_chunks.is_zero() {
            tokio::time::sleep(options.delay_between_chunks).await;
        }
    }

    Ok(results)
}
