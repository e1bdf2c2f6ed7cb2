//! Per-market circuit breaker on consecutive adverse fills

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    consecutive: u32,
    tripped_until: Option<DateTime<Utc>>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown_secs: i64) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown: Duration::seconds(cooldown_secs),
            consecutive: 0,
            tripped_until: None,
        }
    }

    /// Carry an existing suspension over to a rebuilt breaker
    pub fn with_trip(mut self, tripped_until: Option<DateTime<Utc>>) -> Self {
        self.tripped_until = tripped_until;
        self
    }

    /// Record one fill outcome. Returns the suspension end if this fill tripped it.
    pub fn record(&mut self, adverse: bool, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !adverse {
            self.consecutive = 0;
            return None;
        }
        self.consecutive += 1;
        if self.consecutive >= self.threshold && !self.is_open(now) {
            let until = now + self.cooldown;
            self.tripped_until = Some(until);
            self.consecutive = 0;
            return Some(until);
        }
        None
    }

    /// Suspended right now; expiry is evaluated lazily against `now`
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.tripped_until.is_some_and(|until| now < until)
    }

    /// Clear an expired suspension. Returns true if one was cleared.
    pub fn expire(&mut self, now: DateTime<Utc>) -> bool {
        match self.tripped_until {
            Some(until) if now >= until => {
                self.tripped_until = None;
                true
            }
            _ => false,
        }
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn tripped_until(&self) -> Option<DateTime<Utc>> {
        self.tripped_until
    }
}
