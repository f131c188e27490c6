//! Timestamp helpers and the injectable clock.

use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

/// Source of "now" for everything that stamps records or ages them out.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(start),
        })
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub fn default_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

/// RFC-3339 with nanosecond precision, always `Z`.
pub fn rfc3339_nano(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn system_time_rfc3339_nano(ts: SystemTime) -> String {
    rfc3339_nano(DateTime::<Utc>::from(ts))
}

/// True when `since` lies at least `grace` before `now`.
pub fn older_than(since: DateTime<Utc>, now: DateTime<Utc>, grace: Duration) -> bool {
    match chrono::Duration::from_std(grace) {
        Ok(grace) => now.signed_duration_since(since) >= grace,
        Err(_) => false,
    }
}
