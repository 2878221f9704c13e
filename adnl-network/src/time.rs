//! The process-wide ADNL epoch, modeled as an explicit value captured
//! at startup and threaded through construction rather than a mutable
//! global.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::RngCore;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdnlStartTime(i32);

impl AdnlStartTime {
    pub fn now() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_secs();
        AdnlStartTime(secs as i32)
    }

    pub fn get(self) -> i32 {
        self.0
    }
}

pub fn unix_time() -> i32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs() as i32
}

/// Pick a uniformly random duration in `[lo, hi)`, used everywhere a
/// timer needs to be jittered rather than fire in lockstep across peers
/// (DHT republication, `try_reinit_at` backoff, `respond_with_nop_at`).
pub fn jittered(lo: Duration, hi: Duration) -> Duration {
    let lo_ns = lo.as_nanos() as u64;
    let hi_ns = hi.as_nanos() as u64;
    let span = hi_ns.saturating_sub(lo_ns).max(1);
    let offset = rand::rngs::OsRng.next_u64() % span;
    Duration::from_nanos(lo_ns + offset)
}
