//! 重连退避
//!
//! 指数增长，带±5%随机抖动，成功后复位。

use std::time::{Duration, Instant};

/// 单个连接的重连节奏
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempts: u32,
    next_attempt: Option<Instant>,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempts: 0,
            next_attempt: None,
        }
    }

    /// 是否已到下次重试的时间
    pub fn ready(&self, now: Instant) -> bool {
        self.next_attempt.map_or(true, |at| now >= at)
    }

    /// 记录一次失败并安排下次重试，返回等待时长
    pub fn fail(&mut self, now: Instant) -> Duration {
        let delay = self.current_delay();
        self.attempts = self.attempts.saturating_add(1);
        self.next_attempt = Some(now + delay);
        delay
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.next_attempt = None;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// 距离下次重试还需等待多久
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.next_attempt.map(|at| at.saturating_duration_since(now))
    }

    fn current_delay(&self) -> Duration {
        let factor = 1u32.checked_shl(self.attempts.min(16)).unwrap_or(u32::MAX);
        let delay = self.base.saturating_mul(factor).min(self.max);
        let jitter = rand::random_range(0..=10);
        delay + (delay * jitter) / 100 - delay / 20
    }
}
