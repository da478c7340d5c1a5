//! Read-modify-write retry on optimistic concurrency conflicts.

use crate::error::StoreResult;
use std::future::Future;
use tracing::debug;

/// Attempts used by the orchestrator's convergent writers
pub const DEFAULT_CONFLICT_RETRIES: u32 = 5;

/// Run `op` until it succeeds, fails with something other than a conflict,
/// or `attempts` runs out.
///
/// `op` must re-read the record on every call; retrying a write with a stale
/// version would only conflict again.
pub async fn retry_on_conflict<T, F, Fut>(attempts: u32, mut op: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Err(e) if e.is_conflict() && attempt < attempts => {
                debug!(attempt, error = %e, "Write conflict, re-reading");
            }
            other => return other,
        }
    }
}
