//! Per-host request pacing.
//!
//! Two mechanisms, both maps keyed by host behind a lightweight mutex: a
//! token bucket (steady rate, burst 1) every fetch passes through, and an
//! exponential backoff registry fed by 429s and transient failures. Backoff
//! on one host never blocks another.

use std::collections::HashMap;
use std::time::Duration;

use rand::RngExt;
use tokio::sync::Mutex;
use tokio::time::Instant;

const BACKOFF_START: Duration = Duration::from_secs(2);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
const MAX_JITTER_MS: u64 = 150;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct HostRateLimiter {
    rate_per_sec: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl HostRateLimiter {
    pub fn new(rate_per_sec: f64) -> HostRateLimiter {
        HostRateLimiter {
            rate_per_sec: rate_per_sec.max(0.01),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take one token for `host`, sleeping until the bucket refills. Burst
    /// capacity is 1: at most one immediate request per host, then the
    /// steady rate.
    pub async fn acquire(&self, host: &str) {
        loop {
            let wait = {
                let mut buckets = self.buckets.lock().await;
                let now = Instant::now();
                let bucket = buckets.entry(host.to_string()).or_insert(Bucket {
                    tokens: 1.0,
                    last_refill: now,
                });
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.rate_per_sec).min(1.0);
                bucket.last_refill = now;

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64(
                        (1.0 - bucket.tokens) / self.rate_per_sec,
                    ))
                }
            };
            match wait {
                None => return,
                Some(base) => {
                    let jitter = Duration::from_millis(rand::rng().random_range(0..MAX_JITTER_MS));
                    tokio::time::sleep(base + jitter).await;
                }
            }
        }
    }
}

struct BackoffState {
    delay: Duration,
    until: Instant,
}

#[derive(Default)]
pub struct HostBackoff {
    states: Mutex<HashMap<String, BackoffState>>,
}

impl HostBackoff {
    pub fn new() -> HostBackoff {
        HostBackoff::default()
    }

    /// Sleep out any active backoff window for `host`.
    pub async fn wait_if_backed_off(&self, host: &str) {
        let wait = {
            let states = self.states.lock().await;
            states.get(host).and_then(|s| {
                let now = Instant::now();
                (s.until > now).then(|| s.until - now)
            })
        };
        if let Some(wait) = wait {
            tracing::debug!("host {} backed off for {:?}", host, wait);
            tokio::time::sleep(wait).await;
        }
    }

    /// Double the host's delay (2s start, 60s cap) and open a new window.
    pub async fn note_failure(&self, host: &str) {
        let mut states = self.states.lock().await;
        let now = Instant::now();
        let state = states.entry(host.to_string()).or_insert(BackoffState {
            delay: BACKOFF_START / 2,
            until: now,
        });
        state.delay = (state.delay * 2).min(BACKOFF_CAP);
        state.until = now + state.delay;
    }

    pub async fn note_success(&self, host: &str) {
        self.states.lock().await.remove(host);
    }

    pub async fn current_delay(&self, host: &str) -> Option<Duration> {
        self.states.lock().await.get(host).map(|s| s.delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn first_acquire_is_immediate_second_waits() {
        let limiter = HostRateLimiter::new(1.0);
        let start = Instant::now();
        limiter.acquire("example.org").await;
        assert!(start.elapsed() < Duration::from_millis(50));

        limiter.acquire("example.org").await;
        // Paused clock auto-advances through sleeps; the second token costs
        // about one second at 1 rps.
        assert!(start.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test(start_paused = true)]
    async fn hosts_do_not_share_buckets() {
        let limiter = HostRateLimiter::new(1.0);
        let start = Instant::now();
        limiter.acquire("a.example").await;
        limiter.acquire("b.example").await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn backoff_doubles_and_caps() {
        let backoff = HostBackoff::new();
        backoff.note_failure("h.example").await;
        assert_eq!(backoff.current_delay("h.example").await, Some(Duration::from_secs(2)));
        backoff.note_failure("h.example").await;
        assert_eq!(backoff.current_delay("h.example").await, Some(Duration::from_secs(4)));
        for _ in 0..10 {
            backoff.note_failure("h.example").await;
        }
        assert_eq!(backoff.current_delay("h.example").await, Some(Duration::from_secs(60)));

        backoff.note_success("h.example").await;
        assert_eq!(backoff.current_delay("h.example").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_on_one_host_leaves_others_alone() {
        let backoff = HostBackoff::new();
        backoff.note_failure("slow.example").await;
        let start = Instant::now();
        backoff.wait_if_backed_off("fast.example").await;
        assert!(start.elapsed() < Duration::from_millis(10));
    }
}
