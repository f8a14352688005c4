//! Fail-open helper for side effects that must never fail a run
//!
//! Partial-text flushes while streaming and retention pruning after a
//! persisted artifact write are infrastructure: a failure is logged and the
//! run carries on.
//!
//! DO NOT use fail-open for:
//! - Effect commits (they are reported, not swallowed)
//! - Finalization (it must observe its own result)

use std::future::Future;
use tracing::warn;

use crate::Result;

/// Await `fut`, logging and discarding its error
///
/// Returns `None` if the operation failed.
pub async fn fail_open<Fut, T>(operation_name: &str, fut: Fut) -> Option<T>
where
    Fut: Future<Output = Result<T>>,
{
    match fut.await {
        Ok(val) => Some(val),
        Err(e) => {
            warn!(code = e.code(), "{} failed (fail-open): {}", operation_name, e);
            None
        }
    }
}
