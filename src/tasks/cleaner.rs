//! Window Cleaner Task
//!
//! One-shot timer that resets a rate limiter's window when it elapses, so callers
//! queued on a full window are admitted without waiting for another `lock()`.
//! It reschedules itself while callers remain queued and exits otherwise, so an
//! idle limiter keeps no live timer.

use std::sync::Weak;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::sync::LimiterInner;

/// Spawns the cleaner for one limiter, first firing at `deadline`.
///
/// The task only holds a weak reference, so dropping the last limiter handle
/// lets it exit on its next wake-up. `generation` identifies this arming; a
/// limiter that re-armed since then ignores the stale task.
///
/// # Returns
/// The task handle, or `None` when called outside a tokio runtime.
pub(crate) fn spawn_window_cleaner(
    limiter: Weak<LimiterInner>,
    generation: u64,
    deadline: Instant,
) -> Option<JoinHandle<()>> {
    let Ok(runtime) = Handle::try_current() else {
        warn!("No tokio runtime available, window cleaner not scheduled");
        return None;
    };

    Some(runtime.spawn(async move {
        let mut deadline = deadline;
        debug!(generation, "Window cleaner scheduled");

        loop {
            sleep_until(deadline).await;

            let Some(inner) = limiter.upgrade() else {
                debug!(generation, "Rate limiter dropped, window cleaner exiting");
                return;
            };

            match inner.on_cleaner_fired(generation) {
                Some(next) => {
                    debug!(generation, "Callers still queued, window cleaner rescheduled");
                    deadline = next;
                }
                None => {
                    debug!(generation, "Window cleaner retired");
                    return;
                }
            }
        }
    }))
}
