//! Sliding-window rate limiter with a temporary ban on violation, keyed
//! by remote IP address rather than by authenticated identity: a
//! connection gets rate-limited before it has ever produced a user id,
//! and a banned client can't evade the ban by opening a fresh connection
//! from the same address. One instance guards the message-receive path
//! of every gateway connection.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Cap on tracked keys to bound memory under a flood of distinct
/// addresses; oldest-by-last-activity entries are evicted past this.
const MAX_TRACKED_KEYS: usize = 100_000;

struct Window {
    /// Timestamps of messages within the current sliding window.
    hits: Vec<Instant>,
    banned_until: Option<Instant>,
}

pub struct RateLimiter {
    window: Duration,
    max_per_window: u32,
    ban_duration: Duration,
    state: Mutex<HashMap<IpAddr, Window>>,
}

pub enum Verdict {
    Allow,
    Banned { remaining: Duration },
}

impl RateLimiter {
    pub fn new(window_secs: u64, max_per_window: u32, ban_secs: u64) -> Self {
        Self {
            window: Duration::from_secs(window_secs),
            max_per_window,
            ban_duration: Duration::from_secs(ban_secs),
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Records one message attempt from `addr` and returns whether it
    /// should be processed. Entering a ban evicts hits older than the
    /// window on every call so the structure doesn't grow unbounded for a
    /// steady sender.
    pub fn check(&self, addr: IpAddr) -> Verdict {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();

        if state.len() >= MAX_TRACKED_KEYS && !state.contains_key(&addr) {
            self.evict_stale(&mut state, now);
        }

        let entry = state.entry(addr).or_insert_with(|| Window { hits: Vec::new(), banned_until: None });

        if let Some(until) = entry.banned_until {
            if now < until {
                return Verdict::Banned { remaining: until - now };
            }
            entry.banned_until = None;
            entry.hits.clear();
        }

        entry.hits.retain(|t| now.duration_since(*t) < self.window);
        entry.hits.push(now);

        if entry.hits.len() as u32 > self.max_per_window {
            entry.banned_until = Some(now + self.ban_duration);
            entry.hits.clear();
            return Verdict::Banned { remaining: self.ban_duration };
        }

        Verdict::Allow
    }

    fn evict_stale(&self, state: &mut HashMap<IpAddr, Window>, now: Instant) {
        state.retain(|_, w| {
            w.banned_until.is_some_and(|until| now < until)
                || w.hits.last().is_some_and(|t| now.duration_since(*t) < self.window)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last_octet: u8) -> IpAddr {
        IpAddr::from([127, 0, 0, last_octet])
    }

    #[test]
    fn allows_up_to_the_limit() {
        let limiter = RateLimiter::new(5, 5, 30);
        let ip = addr(1);
        for _ in 0..5 {
            assert!(matches!(limiter.check(ip), Verdict::Allow));
        }
    }

    #[test]
    fn bans_after_exceeding_limit() {
        let limiter = RateLimiter::new(5, 3, 30);
        let ip = addr(2);
        for _ in 0..3 {
            assert!(matches!(limiter.check(ip), Verdict::Allow));
        }
        assert!(matches!(limiter.check(ip), Verdict::Banned { .. }));
    }

    #[test]
    fn ban_blocks_further_attempts_until_expiry() {
        let limiter = RateLimiter::new(5, 1, 30);
        let ip = addr(3);
        assert!(matches!(limiter.check(ip), Verdict::Allow));
        assert!(matches!(limiter.check(ip), Verdict::Banned { .. }));
        assert!(matches!(limiter.check(ip), Verdict::Banned { .. }));
    }

    #[test]
    fn distinct_addresses_tracked_independently() {
        let limiter = RateLimiter::new(5, 1, 30);
        let a = addr(4);
        let b = addr(5);
        assert!(matches!(limiter.check(a), Verdict::Allow));
        assert!(matches!(limiter.check(a), Verdict::Banned { .. }));
        assert!(matches!(limiter.check(b), Verdict::Allow));
    }
}
