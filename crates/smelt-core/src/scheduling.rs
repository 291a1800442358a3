//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Tick pacing and reconnect backoff for the polling loops."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};

/// Async rate limiter whose period can change without restarting the loop.
///
/// Ticks that fall behind are delayed rather than bursted, so a slow cycle
/// never produces back-to-back catch-up cycles.
#[derive(Debug)]
pub struct RateLimiter {
    interval: tokio::time::Interval,
}

impl RateLimiter {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }

    pub async fn tick(&mut self) -> Instant {
        self.interval.tick().await
    }

    pub fn period(&self) -> Duration {
        self.interval.period()
    }

    /// Switch to `period`; the next tick fires one new period from now.
    pub fn set_period(&mut self, period: Duration) {
        if period == self.interval.period() {
            return;
        }
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.interval = interval;
    }
}

/// Exponential reconnect backoff that never sleeps.
///
/// A loop asks [`Backoff::ready`] on each tick and only attempts a reconnect
/// once the current delay has elapsed, so a dead link costs one cheap check
/// per cycle instead of a blocking retry.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    delay: Duration,
    next_attempt: Option<Instant>,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            delay: initial,
            next_attempt: None,
            attempts: 0,
        }
    }

    pub fn ready(&self, now: Instant) -> bool {
        self.next_attempt.map_or(true, |at| now >= at)
    }

    /// Record a failed attempt and push the next one out.
    pub fn failed(&mut self, now: Instant) -> Duration {
        let wait = self.delay;
        self.next_attempt = Some(now + wait);
        self.delay = (self.delay * 2).min(self.max);
        self.attempts += 1;
        wait
    }

    pub fn reset(&mut self) {
        self.delay = self.initial;
        self.next_attempt = None;
        self.attempts = 0;
    }

    /// Failed attempts since the last success.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        let now = Instant::now();
        assert!(backoff.ready(now));
        assert_eq!(backoff.failed(now), Duration::from_millis(100));
        assert!(!backoff.ready(now));
        assert!(backoff.ready(now + Duration::from_millis(100)));
        assert_eq!(backoff.failed(now), Duration::from_millis(200));
        assert_eq!(backoff.failed(now), Duration::from_millis(350));
        assert_eq!(backoff.failed(now), Duration::from_millis(350));
        assert_eq!(backoff.attempts(), 4);

        backoff.reset();
        assert!(backoff.ready(now));
        assert_eq!(backoff.failed(now), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_switches_period_in_place() {
        let mut limiter = RateLimiter::new(Duration::from_secs(5));
        let first = limiter.tick().await;
        limiter.set_period(Duration::from_millis(200));
        assert_eq!(limiter.period(), Duration::from_millis(200));
        let second = limiter.tick().await;
        let third = limiter.tick().await;
        assert!(second - first < Duration::from_secs(1));
        assert_eq!(third - second, Duration::from_millis(200));
    }
}
