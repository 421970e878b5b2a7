//! Per-user sliding-window rate limiting for agent-proxy turns.

use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

const WINDOW: Duration = Duration::from_secs(60);

pub struct RateLimiter {
    per_window: u32,
    hits: DashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
    /// `per_minute == 0` disables limiting.
    pub fn per_minute(per_minute: u32) -> Self {
        Self {
            per_window: per_minute,
            hits: DashMap::new(),
        }
    }

    /// Record a hit for `user_id`. Returns the wait until a slot frees up
    /// when the window is full; a rejected hit is not recorded.
    pub fn check(&self, user_id: &str) -> Result<(), Duration> {
        if self.per_window == 0 {
            return Ok(());
        }
        let now = Instant::now();
        let mut hits = self.hits.entry(user_id.to_string()).or_default();
        while hits
            .front()
            .is_some_and(|&at| now.duration_since(at) >= WINDOW)
        {
            hits.pop_front();
        }

        if hits.len() >= self.per_window as usize {
            let oldest = hits.front().copied().unwrap_or(now);
            return Err(WINDOW.saturating_sub(now.duration_since(oldest)));
        }
        hits.push_back(now);
        Ok(())
    }

    /// Drop users whose window is empty.
    pub fn prune(&self) {
        let now = Instant::now();
        self.hits.retain(|_, hits| {
            hits.back()
                .is_some_and(|&at| now.duration_since(at) < WINDOW)
        });
    }
}
