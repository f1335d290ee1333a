//! Communication watchdog
//!
//! Supervises liveness of a polled device: the session feeds it after every
//! successful exchange, and a periodic check reports starvation. The report
//! repeats on every check tick while the starvation lasts; deciding what to do
//! about it belongs to the owner.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Callback invoked with the time since the last feed
pub type TimeoutCallback = Arc<dyn Fn(Duration) + Send + Sync>;

pub const DEFAULT_THRESHOLD: Duration = Duration::from_secs(5);
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

struct WatchdogState {
    running: AtomicBool,
    last_feed: Mutex<Instant>,
}

pub struct Watchdog {
    name: String,
    threshold: Duration,
    check_interval: Duration,
    state: Arc<WatchdogState>,
    on_timeout: TimeoutCallback,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog")
            .field("name", &self.name)
            .field("threshold", &self.threshold)
            .field("running", &self.is_running())
            .finish()
    }
}

impl Watchdog {
    pub fn new(
        name: impl Into<String>,
        threshold: Duration,
        check_interval: Duration,
        on_timeout: TimeoutCallback,
    ) -> Self {
        Self {
            name: name.into(),
            threshold,
            check_interval,
            state: Arc::new(WatchdogState {
                running: AtomicBool::new(false),
                last_feed: Mutex::new(Instant::now()),
            }),
            on_timeout,
            task: Mutex::new(None),
        }
    }

    /// Text reported to the console when the device goes quiet
    pub fn timeout_message(elapsed: Duration) -> String {
        format!(
            "communication timeout: no data for {:.1}s",
            elapsed.as_secs_f64()
        )
    }

    /// Reset the feed time and begin periodic checks; restarts if running
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        self.stop();

        *self.state.last_feed.lock() = Instant::now();
        self.state.running.store(true, Ordering::SeqCst);

        let token = CancellationToken::new();
        let handle = tokio::spawn(check_loop(
            self.name.clone(),
            self.threshold,
            self.check_interval,
            Arc::clone(&self.state),
            Arc::clone(&self.on_timeout),
            token.clone(),
        ));
        *self.task.lock() = Some((token, handle));
        debug!("[{}] watchdog started ({:?})", self.name, self.threshold);
    }

    /// Halt checks; safe to call when already stopped
    pub fn stop(&self) {
        self.state.running.store(false, Ordering::SeqCst);
        if let Some((token, handle)) = self.task.lock().take() {
            token.cancel();
            handle.abort();
            debug!("[{}] watchdog stopped", self.name);
        }
    }

    /// Record a successful exchange; ignored while stopped
    pub fn feed(&self) {
        if self.state.running.load(Ordering::SeqCst) {
            *self.state.last_feed.lock() = Instant::now();
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    /// Time since the last feed (or start)
    pub fn elapsed(&self) -> Duration {
        self.state.last_feed.lock().elapsed()
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn check_loop(
    name: String,
    threshold: Duration,
    check_interval: Duration,
    state: Arc<WatchdogState>,
    on_timeout: TimeoutCallback,
    token: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + check_interval, check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {},
        }
        if !state.running.load(Ordering::SeqCst) {
            break;
        }
        let elapsed = state.last_feed.lock().elapsed();
        if elapsed > threshold {
            warn!("[{}] {}", name, Watchdog::timeout_message(elapsed));
            on_timeout(elapsed);
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    fn counting_watchdog() -> (Watchdog, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let watchdog = Watchdog::new(
            "test",
            DEFAULT_THRESHOLD,
            DEFAULT_CHECK_INTERVAL,
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (watchdog, fired)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_every_tick_while_starved() {
        let (watchdog, fired) = counting_watchdog();
        watchdog.start();

        // ticks at 1..=8s; elapsed exceeds 5s at 6, 7 and 8
        sleep(Duration::from_millis(8500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_feed_resets_elapsed() {
        let (watchdog, fired) = counting_watchdog();
        watchdog.start();

        sleep(Duration::from_secs(4)).await;
        watchdog.feed();
        assert!(watchdog.elapsed() < Duration::from_millis(1));

        sleep(Duration::from_millis(4500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        // tick at 10s sees 6s of silence
        sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_checks() {
        let (watchdog, fired) = counting_watchdog();
        watchdog.start();
        sleep(Duration::from_millis(7500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        watchdog.stop();
        assert!(!watchdog.is_running());
        sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_feed_ignored_while_stopped() {
        let (watchdog, _fired) = counting_watchdog();
        sleep(Duration::from_secs(2)).await;
        watchdog.feed();
        assert!(watchdog.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_resets_feed_time() {
        let (watchdog, fired) = counting_watchdog();
        watchdog.start();
        sleep(Duration::from_millis(4500)).await;
        watchdog.start();
        sleep(Duration::from_millis(4500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_timeout_message() {
        assert_eq!(
            Watchdog::timeout_message(Duration::from_millis(6040)),
            "communication timeout: no data for 6.0s"
        );
    }
}
