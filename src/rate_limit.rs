//! Per-user request counting with a periodic global reset.
//!
//! Counts are only bumped after a request went through the whole pipeline.
//! While a request runs it holds a [`Reservation`], taken under the same lock
//! as the check, so concurrent commands from one user cannot get past the cap
//! together. The table is cleared for everyone at once by
//! [`spawn_reset_task`], so the wait a limited user faces is "until the next
//! global reset", not a rolling window per user.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::info;

struct LimiterState {
    counts: HashMap<i64, u32>,
    in_flight: HashMap<i64, u32>,
    last_reset: Instant,
}

impl LimiterState {
    fn used(&self, user_id: i64) -> u32 {
        let count = self.counts.get(&user_id).copied().unwrap_or(0);
        let running = self.in_flight.get(&user_id).copied().unwrap_or(0);
        count.saturating_add(running)
    }

    fn release(&mut self, user_id: i64) {
        if let Some(running) = self.in_flight.get_mut(&user_id) {
            *running = running.saturating_sub(1);
            if *running == 0 {
                self.in_flight.remove(&user_id);
            }
        }
    }
}

/// In-memory request counter shared by all in-flight commands.
pub struct RateLimiter {
    max_requests: u32,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    /// Creates an empty table allowing `max_requests` successful requests per
    /// user between resets.
    #[must_use]
    pub fn new(max_requests: u32) -> Self {
        Self {
            max_requests,
            state: Mutex::new(LimiterState {
                counts: HashMap::new(),
                in_flight: HashMap::new(),
                last_reset: Instant::now(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        // The table holds plain counters, a panic mid-update cannot leave it
        // inconsistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Configured per-user cap.
    #[must_use]
    pub const fn max_requests(&self) -> u32 {
        self.max_requests
    }

    /// True unless successful plus running requests already reach the cap.
    /// Read only.
    #[must_use]
    pub fn check_allowed(&self, user_id: i64) -> bool {
        self.lock().used(user_id) < self.max_requests
    }

    /// Checks the allowance and, if there is room, holds one slot for a
    /// request that is about to run. The slot turns into a count with
    /// [`Reservation::commit`] and is given back when the reservation is
    /// dropped uncommitted.
    #[must_use]
    pub fn try_reserve(limiter: &Arc<Self>, user_id: i64) -> Option<Reservation> {
        let mut state = limiter.lock();
        if state.used(user_id) >= limiter.max_requests {
            return None;
        }
        let running = state.in_flight.entry(user_id).or_insert(0);
        *running = running.saturating_add(1);
        Some(Reservation {
            limiter: Arc::clone(limiter),
            user_id,
            committed: false,
        })
    }

    /// Counts one successful request for the user.
    pub fn record_success(&self, user_id: i64) {
        let mut state = self.lock();
        let count = state.counts.entry(user_id).or_insert(0);
        *count = count.saturating_add(1);
    }

    /// Requests of the user currently holding a reservation.
    #[must_use]
    pub fn in_flight(&self, user_id: i64) -> u32 {
        self.lock().in_flight.get(&user_id).copied().unwrap_or(0)
    }

    /// Clears every counter. Running requests keep their reservations and
    /// count in the new window once they commit. Returns the number of users
    /// that were tracked.
    pub fn reset_all(&self) -> usize {
        let mut state = self.lock();
        let cleared = state.counts.len();
        state.counts.clear();
        state.last_reset = Instant::now();
        cleared
    }

    /// Current count for the user (0 when absent).
    #[must_use]
    pub fn count(&self, user_id: i64) -> u32 {
        self.lock().counts.get(&user_id).copied().unwrap_or(0)
    }

    /// Time left until the next reset of a schedule with the given period,
    /// measured from the last reset.
    #[must_use]
    pub fn time_until_reset(&self, period: Duration) -> Duration {
        period.saturating_sub(self.lock().last_reset.elapsed())
    }
}

/// One slot of a user's allowance held by a running request.
#[must_use = "dropping a reservation releases the slot immediately"]
pub struct Reservation {
    limiter: Arc<RateLimiter>,
    user_id: i64,
    committed: bool,
}

impl Reservation {
    /// User the slot belongs to.
    pub const fn user_id(&self) -> i64 {
        self.user_id
    }

    /// Turns the slot into a counted success. Returns the new count.
    pub fn commit(mut self) -> u32 {
        self.committed = true;
        let mut state = self.limiter.lock();
        state.release(self.user_id);
        let count = state.counts.entry(self.user_id).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.committed {
            self.limiter.lock().release(self.user_id);
        }
    }
}

/// Spawns the task that clears `limiter` every `period`, starting one period
/// from now, until `shutdown` is cancelled.
pub fn spawn_reset_task(
    limiter: Arc<RateLimiter>,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let period = period.max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Rate limit reset task stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let cleared = limiter.reset_all();
                    info!(cleared, "Rate limit table cleared");
                }
            }
        }
    })
}
