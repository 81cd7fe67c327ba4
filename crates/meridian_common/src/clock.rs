use parking_lot::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::Timestamp;

/// Monotonic wall-clock source. Successive `now()` calls return strictly
/// increasing timestamps even if the system clock stalls or steps backwards:
/// the clock never hands out a value at or below the last one it produced.
#[derive(Debug)]
pub struct Clock {
    last: Mutex<i64>,
}

impl Clock {
    pub fn new() -> Self {
        Clock { last: Mutex::new(0) }
    }

    pub fn now(&self) -> Timestamp {
        let mut last = self.last.lock();
        let mut now = system_micros();
        if now <= *last {
            now = *last + 1;
        }
        *last = now;
        Timestamp(now)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

fn system_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}
