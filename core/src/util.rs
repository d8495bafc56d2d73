use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Notify;
use tracing::debug;

/// Make a Notify that fires when SIGINT occurs, used to propagate client
/// disconnects/cancellation into an in-flight request's suspension points.
pub fn notify_on_sigint() -> Arc<Notify> {
    let notify = Arc::new(Notify::new());

    tokio::spawn({
        let notify = Arc::clone(&notify);
        async move {
            loop {
                tokio::signal::ctrl_c().await.ok();
                debug!("interrupt received");
                notify.notify_waiters();
            }
        }
    });

    notify
}

/// Default exponential back-off schedule with jitter: 200ms -> 400ms -> 800ms
/// -> 1600ms, ... Used for bounded retries of `start`/`stop` RPCs and other
/// transport operations; never for a submission's one-shot `exec`.
pub fn backoff(attempt: u64) -> Duration {
    let base_delay_ms = 200u64 * (1u64 << attempt.saturating_sub(1).min(8));
    let jitter = rand::rng().random_range(0.8..1.2);
    let delay_ms = (base_delay_ms as f64 * jitter) as u64;
    Duration::from_millis(delay_ms)
}
