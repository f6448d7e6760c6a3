//! Per-process rate governor for outbound Okta API calls.
//!
//! Two limits compose: a ceiling on concurrent in-flight requests (semaphore)
//! and a per-second budget (token bucket refilled on a monotonic clock). The
//! sandbox child asks for a permit before every HTTP call and releases it
//! when the call returns; the governor itself never touches the network.

use std::sync::Arc;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Concurrency + per-second limiter, cheap to share via `Arc`.
pub struct RateGovernor {
    concurrent: Arc<Semaphore>,
    bucket: Mutex<Bucket>,
    per_second: f64,
    burst: f64,
}

/// Holding one of these keeps a concurrency slot occupied.
pub struct RatePermit {
    _slot: OwnedSemaphorePermit,
}

impl RateGovernor {
    pub fn new(concurrent_limit: usize, per_second: u32) -> Self {
        let per_second = f64::from(per_second.max(1));
        Self {
            concurrent: Arc::new(Semaphore::new(concurrent_limit.max(1))),
            bucket: Mutex::new(Bucket {
                tokens: per_second,
                last_refill: Instant::now(),
            }),
            per_second,
            burst: per_second,
        }
    }

    /// Waits for a concurrency slot and one rate token.
    pub async fn acquire(&self) -> RatePermit {
        let slot = Arc::clone(&self.concurrent)
            .acquire_owned()
            .await
            .expect("governor semaphore never closes");
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let elapsed = bucket.last_refill.elapsed().as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.per_second).min(self.burst);
                bucket.last_refill = Instant::now();
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    None
                } else {
                    Some((1.0 - bucket.tokens) / self.per_second)
                }
            };
            match wait {
                None => return RatePermit { _slot: slot },
                Some(seconds) => {
                    tokio::time::sleep(std::time::Duration::from_secs_f64(seconds)).await
                }
            }
        }
    }

    /// Free concurrency slots right now (observability and tests).
    pub fn available_slots(&self) -> usize {
        self.concurrent.available_permits()
    }
}
