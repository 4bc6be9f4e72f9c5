//! Time source for server-assigned message timestamps.
//!
//! Production code uses [`SystemClock`]; tests pin time with [`FixedClock`]
//! so the `DD/MM/YYYY HH:mm:ss` stamp is predictable.

use std::fmt::Debug;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use parking_lot::Mutex;

/// Display format of [`crate::ChatMessage::timestamp`].
pub const TIMESTAMP_FORMAT: &str = "%d/%m/%Y %H:%M:%S";

pub trait Clock: Send + Sync + Debug {
    /// Current wall-clock time in the server's local zone.
    fn now(&self) -> DateTime<Local>;

    /// Current time rendered as `DD/MM/YYYY HH:mm:ss`.
    fn timestamp(&self) -> String {
        format_timestamp(&self.now())
    }
}

pub fn format_timestamp<Tz: TimeZone>(at: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    at.format(TIMESTAMP_FORMAT).to_string()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Clock that returns the same instant until told otherwise.
#[derive(Debug)]
pub struct FixedClock {
    at: Mutex<DateTime<Local>>,
}

impl FixedClock {
    pub fn new(at: DateTime<Local>) -> Self {
        Self { at: Mutex::new(at) }
    }

    /// Build from a naive local date-time. Ambiguous local times (DST fold)
    /// resolve to the earlier instant.
    pub fn from_local(naive: NaiveDateTime) -> Option<Self> {
        Local
            .from_local_datetime(&naive)
            .earliest()
            .map(Self::new)
    }

    pub fn set(&self, at: DateTime<Local>) {
        *self.at.lock() = at;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut at = self.at.lock();
        *at += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Local> {
        *self.at.lock()
    }
}
