use std::future;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::{self, Instant, Sleep};

use crate::entry::Expiry;

/// Longest deadline an entry timer will accept (~100 years).
///
/// Larger TTLs are capped so `Instant + Duration` cannot overflow.
const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Resettable one-shot alarm owned by a single entry actor.
///
/// A disarmed timer (`Expiry::Never`) never fires.
pub(crate) struct EntryTimer {
    sleep: Pin<Box<Sleep>>,
    armed: bool,
}

impl EntryTimer {
    pub(crate) fn new(expiry: Expiry) -> Self {
        match expiry {
            Expiry::After(ttl) => Self {
                sleep: Box::pin(time::sleep_until(deadline(ttl))),
                armed: true,
            },
            Expiry::Never => Self {
                sleep: Box::pin(time::sleep(Duration::ZERO)),
                armed: false,
            },
        }
    }

    /// Completes once the current deadline passes. Pending forever while disarmed.
    pub(crate) async fn fired(&mut self) {
        if !self.armed {
            return future::pending().await;
        }
        self.sleep.as_mut().await;
        self.armed = false;
    }

    /// Rearms the timer to `expiry` from now.
    ///
    /// Disarms, then installs the new deadline. `Sleep::reset` keeps no fire
    /// signal, so a deadline that passed without the actor loop observing it
    /// is thrown away by the reset itself.
    /// Resetting to `Expiry::Never` leaves the timer untouched.
    pub(crate) fn reset(&mut self, expiry: Expiry) {
        let Expiry::After(ttl) = expiry else {
            return;
        };

        let was_armed = std::mem::replace(&mut self.armed, false);
        if was_armed && self.sleep.is_elapsed() {
            tracing::trace!("discarding elapsed deadline on rearm");
        }

        self.sleep.as_mut().reset(deadline(ttl));
        self.armed = true;
    }

    #[cfg(test)]
    pub(crate) fn is_armed(&self) -> bool {
        self.armed
    }
}

fn deadline(ttl: Duration) -> Instant {
    Instant::now() + ttl.min(MAX_TTL)
}
