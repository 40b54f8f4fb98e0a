use core::fmt;

use chrono::{DateTime, Utc};

/// Single source of "now" shared by everything that writes or checks an event's schedule, token
/// expiry and attendance window.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
pub use fixed::FixedClock;
