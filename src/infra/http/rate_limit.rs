use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sliding-window request counter keyed by client and route.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    window: Duration,
    max_requests: u32,
    trust_forwarded_for: bool,
    buckets: Arc<DashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: u32) -> Self {
        Self {
            window,
            max_requests,
            trust_forwarded_for: false,
            buckets: Arc::new(DashMap::new()),
        }
    }

    /// Key clients on the first `X-Forwarded-For` hop instead of the peer address.
    pub fn trust_forwarded_for(mut self, trust: bool) -> Self {
        self.trust_forwarded_for = trust;
        self
    }

    pub fn trusts_forwarded_for(&self) -> bool {
        self.trust_forwarded_for
    }

    /// Record a request and report whether it may proceed, with the slots left.
    pub fn allow(&self, key: &str, route: &str) -> (bool, u32) {
        self.allow_at(key, route, Instant::now())
    }

    fn allow_at(&self, key: &str, route: &str, now: Instant) -> (bool, u32) {
        let bucket_key = format!("{key}:{route}");
        let window = self.window;

        let mut entry = self.buckets.entry(bucket_key).or_default();
        entry.retain(|instant| now.duration_since(*instant) < window);

        let remaining = self.max_requests.saturating_sub(entry.len() as u32);
        if remaining == 0 {
            return (false, 0);
        }

        entry.push(now);
        // after push, one fewer slot remains
        (true, remaining.saturating_sub(1))
    }

    /// Drop buckets whose requests have all aged out of the window.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let window = self.window;
        let before = self.buckets.len();
        self.buckets.retain(|_, instants| {
            instants.retain(|instant| now.duration_since(*instant) < window);
            !instants.is_empty()
        });
        before.saturating_sub(self.buckets.len())
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn retry_after_secs(&self) -> u64 {
        self.window.as_secs().max(1)
    }

    pub fn limit(&self) -> u32 {
        self.max_requests
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_past_the_ceiling() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 2);

        assert_eq!(limiter.allow("1.2.3.4", "/healthz"), (true, 1));
        assert_eq!(limiter.allow("1.2.3.4", "/healthz"), (true, 0));
        assert_eq!(limiter.allow("1.2.3.4", "/healthz"), (false, 0));
    }

    #[test]
    fn buckets_are_per_client_and_route() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 1);

        assert!(limiter.allow("a", "/").0);
        assert!(limiter.allow("b", "/").0);
        assert!(limiter.allow("a", "/healthz").0);
        assert!(!limiter.allow("a", "/").0);
    }

    #[test]
    fn peer_keys_by_default() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 1);
        assert!(!limiter.trusts_forwarded_for());
        assert!(limiter.trust_forwarded_for(true).trusts_forwarded_for());
    }

    #[test]
    fn window_slides() {
        let limiter = RateLimiter::new(Duration::from_millis(50), 1);
        let start = Instant::now();

        assert!(limiter.allow_at("a", "/", start).0);
        assert!(!limiter.allow_at("a", "/", start + Duration::from_millis(10)).0);
        assert!(limiter.allow_at("a", "/", start + Duration::from_millis(60)).0);
    }

    #[test]
    fn prune_drops_idle_buckets() {
        let limiter = RateLimiter::new(Duration::from_millis(1), 5);
        limiter.allow("a", "/");
        limiter.allow("b", "/");
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(limiter.prune(), 2);
        assert_eq!(limiter.prune(), 0);
    }
}
