//! Delays between reconnection attempts.
//!
//! A [`ReconnectionPolicy`] hands out [`ReconnectionSchedule`]s. A schedule is
//! stateful: each call to `next_delay` advances it. Resetting after a
//! successful reconnection means replacing the schedule with a fresh one.

use std::fmt::Debug;
use std::time::Duration;

pub trait ReconnectionPolicy: Debug + Send + Sync {
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule>;
}

pub trait ReconnectionSchedule: Send + Sync {
    /// Delay before the next reconnection attempt.
    fn next_delay(&mut self) -> Duration;
}

/// Waits the same amount of time before every attempt.
#[derive(Debug, Clone, Copy)]
pub struct ConstantReconnectionPolicy {
    delay: Duration,
}

impl ConstantReconnectionPolicy {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl ReconnectionPolicy for ConstantReconnectionPolicy {
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule> {
        Box::new(ConstantSchedule { delay: self.delay })
    }
}

struct ConstantSchedule {
    delay: Duration,
}

impl ReconnectionSchedule for ConstantSchedule {
    fn next_delay(&mut self) -> Duration {
        self.delay
    }
}

/// Doubles the delay after every attempt, starting at `base_delay`,
/// never exceeding `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialReconnectionPolicy {
    base_delay: Duration,
    max_delay: Duration,
}

impl ExponentialReconnectionPolicy {
    /// `max_delay` lower than `base_delay` is raised to `base_delay`.
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }
}

impl Default for ExponentialReconnectionPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(600))
    }
}

impl ReconnectionPolicy for ExponentialReconnectionPolicy {
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule> {
        Box::new(ExponentialSchedule {
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            attempts: 0,
        })
    }
}

struct ExponentialSchedule {
    base_delay: Duration,
    max_delay: Duration,
    attempts: u32,
}

impl ReconnectionSchedule for ExponentialSchedule {
    fn next_delay(&mut self) -> Duration {
        // 2^31 times any nonzero base is past any sensible max already.
        let factor = 1_u32.checked_shl(self.attempts).unwrap_or(u32::MAX);
        self.attempts = self.attempts.saturating_add(1).min(31);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}
