//! Cancellation scoped to a deadline

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Child of `parent` that is also cancelled once `deadline` passes.
///
/// Cancelling the child stops its timer.
pub fn child_with_deadline(parent: &CancellationToken, deadline: Instant) -> CancellationToken {
    let child = parent.child_token();
    let timer = child.clone();

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => timer.cancel(),
            _ = timer.cancelled() => {}
        }
    });

    child
}

/// Runtime instant matching a wall-clock expiry; already passed maps to now
pub fn deadline_from(expiry: DateTime<Utc>) -> Instant {
    let remaining = (expiry - Utc::now()).to_std().unwrap_or_default();
    Instant::now() + remaining
}
