//! Token-bucket limiter gating non-channel sends: a bucket of 50 tokens
//! refilling at 100 tokens/s, i.e. a half-second refill period.

use std::time::Instant;

pub struct RateLimiter {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        RateLimiter {
            capacity,
            tokens: capacity,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Try to take one token. Returns `true` if a token was available.
    pub fn try_acquire(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// How long until at least one token will be available.
    pub fn ready_in(&mut self) -> std::time::Duration {
        self.refill();
        if self.tokens >= 1.0 {
            std::time::Duration::ZERO
        } else {
            let deficit = 1.0 - self.tokens;
            std::time::Duration::from_secs_f64(deficit / self.refill_per_sec)
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        RateLimiter::new(50.0, 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_full() {
        let mut rl = RateLimiter::new(2.0, 1.0);
        assert!(rl.try_acquire());
        assert!(rl.try_acquire());
        assert!(!rl.try_acquire());
    }
}
