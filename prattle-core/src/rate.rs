use std::time::Duration;

use tokio::time::Instant;

/// Time-quantized rate limiter: a ring of per-second buckets covering the
/// configured window. Exceeding `total` within the window throttles the
/// owner for `wait` seconds, after which the window restarts empty.
///
/// One instance tracks bytes per stream; another, keyed by remote IP, tracks
/// connection attempts per listener.
#[derive(Debug)]
pub struct RateLimit {
    total: u64,
    wait: u64,
    buckets: Vec<u64>,
    head: usize,
    head_at: Instant,
    throttled_until: Option<Instant>,
}

impl RateLimit {
    pub fn new(total: u64, seconds: u64, wait: u64) -> Self {
        Self {
            total,
            wait,
            buckets: vec![0; seconds.max(1) as usize],
            head: 0,
            head_at: Instant::now(),
            throttled_until: None,
        }
    }

    fn advance(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.head_at).as_secs();
        if elapsed == 0 {
            return;
        }
        if elapsed >= self.buckets.len() as u64 {
            self.buckets.iter_mut().for_each(|b| *b = 0);
            self.head = 0;
        } else {
            for _ in 0..elapsed {
                self.head = (self.head + 1) % self.buckets.len();
                self.buckets[self.head] = 0;
            }
        }
        self.head_at += Duration::from_secs(elapsed);
    }

    fn in_window(&self) -> u64 {
        self.buckets.iter().sum()
    }

    /// Records `n` units. Returns `false` when the window total is now
    /// exceeded, in which case the owner is throttled.
    pub fn add(&mut self, n: u64) -> bool {
        let now = Instant::now();
        self.advance(now);
        self.buckets[self.head] += n;
        if self.in_window() > self.total {
            self.throttled_until = Some(now + Duration::from_secs(self.wait));
            false
        } else {
            true
        }
    }

    pub fn left(&mut self) -> u64 {
        self.advance(Instant::now());
        self.total.saturating_sub(self.in_window())
    }

    /// Whether the owner is still paused. The window is reset when the
    /// throttle expires, so reads resume with a clean slate.
    pub fn is_throttled(&mut self) -> bool {
        match self.throttled_until {
            Some(until) if Instant::now() >= until => {
                self.throttled_until = None;
                self.buckets.iter_mut().for_each(|b| *b = 0);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    pub fn throttle_remaining(&self) -> Option<Duration> {
        let until = self.throttled_until?;
        Some(until.saturating_duration_since(Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{self, Duration};

    #[tokio::test(start_paused = true)]
    async fn stays_within_budget() {
        let mut rate = RateLimit::new(100, 5, 10);
        assert!(rate.add(60));
        assert!(rate.add(40));
        assert_eq!(rate.left(), 0);
        assert!(!rate.is_throttled());
    }

    #[tokio::test(start_paused = true)]
    async fn exceeding_budget_throttles() {
        let mut rate = RateLimit::new(100, 5, 10);
        assert!(rate.add(100));
        assert!(!rate.add(1));
        assert!(rate.is_throttled());
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_expires_after_wait() {
        let mut rate = RateLimit::new(10, 5, 10);
        rate.add(11);
        assert!(rate.is_throttled());
        time::advance(Duration::from_secs(10)).await;
        assert!(!rate.is_throttled());
        assert!(rate.add(5));
    }

    #[tokio::test(start_paused = true)]
    async fn window_rolls_over() {
        let mut rate = RateLimit::new(10, 2, 5);
        assert!(rate.add(10));
        time::advance(Duration::from_secs(3)).await;
        assert_eq!(rate.left(), 10);
        assert!(rate.add(10));
    }

    #[tokio::test(start_paused = true)]
    async fn partial_rollover_keeps_recent_buckets() {
        let mut rate = RateLimit::new(10, 3, 5);
        rate.add(4);
        time::advance(Duration::from_secs(1)).await;
        rate.add(4);
        time::advance(Duration::from_secs(1)).await;
        // both contributions are still inside the 3 s window
        assert_eq!(rate.left(), 2);
    }
}
