//! Clock port - 時刻の抽象化
//!
//! worker loop の時間予算・cooldown・drain 待ちはすべて Clock 経由。
//! `sleep` も Clock に含めているので、FixedClock ではスリープ = 時刻を進める、になり
//! ループ全体を一瞬で決定的にテストできる。

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by `tokio::time`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Manually driven clock for tests. `sleep` advances the time instead of waiting.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let delta = TimeDelta::from_std(duration).unwrap_or_else(|_| TimeDelta::zero());
        *self.now.lock() += delta;
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }
}

#[async_trait]
impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

/// Time passed since `since`; zero if the clock went backwards.
pub fn elapsed_since(clock: &dyn Clock, since: DateTime<Utc>) -> Duration {
    (clock.now() - since).to_std().unwrap_or(Duration::ZERO)
}
