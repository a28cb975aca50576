use chrono::{DateTime, Utc};

/// Port for reading wall-clock time.
///
/// Probe latency math and heartbeat freshness both depend on `now`; routing
/// every read through this trait lets tests drive time deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system wall clock
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
