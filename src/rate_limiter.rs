//! Global rate limiting for outbound search commands.
//!
//! Search bots throttle or ban clients that query too often, so the relay
//! enforces a minimum interval between accepted searches. Unlike a waiting
//! limiter, [`SearchRateLimiter::try_acquire`] never sleeps: callers are told
//! immediately whether the search may go out and, if not, how long to wait.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use bookrelay::rate_limiter::{RateDecision, SearchRateLimiter};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let limiter = SearchRateLimiter::new(Duration::from_secs(10));
//!
//! assert_eq!(limiter.try_acquire(), RateDecision::Accepted);
//! assert!(matches!(limiter.try_acquire(), RateDecision::Rejected { .. }));
//! # }
//! ```

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, instrument};

/// Outcome of a [`SearchRateLimiter::try_acquire`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// The search may be sent now; the limiter window has been restarted.
    Accepted,
    /// The search must wait; `retry_after` is `next_allowed - now`.
    Rejected { retry_after: Duration },
}

impl RateDecision {
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// Minimum-interval gate shared by every search request.
///
/// Designed to be wrapped in `Arc` and shared across tasks. The check and the
/// timestamp update happen under one lock, so two concurrent callers can never
/// both be accepted inside the same window.
#[derive(Debug)]
pub struct SearchRateLimiter {
    /// Minimum time between accepted searches.
    interval: Duration,

    /// Time of the last accepted search.
    /// `None` until the first search goes out (first search is always accepted).
    last_accepted: Mutex<Option<Instant>>,
}

impl SearchRateLimiter {
    /// Creates a limiter with the given minimum interval.
    ///
    /// No floor is applied here; the CLI clamps the interval before it gets here.
    #[must_use]
    #[instrument(skip_all, fields(interval_secs = interval.as_secs()))]
    pub fn new(interval: Duration) -> Self {
        debug!("creating search rate limiter");
        Self {
            interval,
            last_accepted: Mutex::new(None),
        }
    }

    /// Returns the configured interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Checks the window and, when open, claims it.
    #[instrument(skip(self))]
    pub fn try_acquire(&self) -> RateDecision {
        // The critical section only touches the timestamp; nothing here awaits.
        let mut last = self
            .last_accepted
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();

        if let Some(last_at) = *last {
            let next_allowed = last_at + self.interval;
            if now < next_allowed {
                let retry_after = next_allowed - now;
                debug!(
                    wait_ms = retry_after.as_millis(),
                    "search rejected by rate limiter"
                );
                return RateDecision::Rejected { retry_after };
            }
        }

        *last = Some(now);
        debug!("search accepted by rate limiter");
        RateDecision::Accepted
    }
}
