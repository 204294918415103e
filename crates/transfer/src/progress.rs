use std::time::Duration;

use kuro_protocol::Progress;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::session::{SharedSession, lock_session};

/// Callback invoked with each progress report.
pub type ProgressCallback = Box<dyn Fn(Progress) + Send + Sync>;

/// Shortest tick period the reporter will run at.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Periodic progress task bound to one session.
///
/// The first report fires one interval after spawning. Each tick locks the
/// session, checks that it has not finished, and emits while still holding
/// the lock, so no report can follow the transition that ends the session.
/// Dropping the reporter cancels it.
pub struct ProgressReporter {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ProgressReporter {
    /// Spawns the reporter on the current tokio runtime.
    pub fn spawn(session: SharedSession, interval: Duration, emit: ProgressCallback) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let period = interval.max(MIN_INTERVAL);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let s = lock_session(&session);
                        if s.is_finished() || token.is_cancelled() {
                            break;
                        }
                        emit(s.progress());
                    }
                }
            }
        });

        Self { cancel, handle }
    }

    /// Stops the reporter. No report is emitted after this returns.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.handle.abort();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.cancel();
    }
}
