//! 指数退避
//!
//! delay = base × factor^attempt + jitter，jitter 在 [0, max_jitter] 内均匀分布。
//! 默认参数下约为 1s、4s、16s。

use std::time::Duration;

use rand::Rng;

use crate::config::RetrySection;

/// 重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 首次调用之后最多再试几次
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: u64,
    pub max_jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySection::default())
    }
}

impl From<&RetrySection> for RetryPolicy {
    fn from(section: &RetrySection) -> Self {
        Self {
            max_retries: section.max_retries,
            base_delay_ms: section.base_delay_ms,
            backoff_factor: section.backoff_factor.max(1),
            max_jitter_ms: section.max_jitter_ms,
        }
    }
}

impl RetryPolicy {
    /// 不含抖动的退避基数（attempt 从 0 开始）
    pub fn base_delay(&self, attempt: u32) -> u64 {
        self.base_delay_ms
            .saturating_mul(self.backoff_factor.saturating_pow(attempt))
    }

    /// 给定抖动值计算延迟；jitter 超出上限时截断
    pub fn delay_with_jitter(&self, attempt: u32, jitter_ms: u64) -> Duration {
        let jitter = jitter_ms.min(self.max_jitter_ms);
        Duration::from_millis(self.base_delay(attempt).saturating_add(jitter))
    }

    /// 随机抖动的实际延迟
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let jitter = if self.max_jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.max_jitter_ms)
        };
        self.delay_with_jitter(attempt, jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay(0), 1000);
        assert_eq!(policy.base_delay(1), 4000);
        assert_eq!(policy.base_delay(2), 16_000);
    }

    #[test]
    fn test_jitter_is_bounded() {
        let policy = RetryPolicy::default();
        for attempt in 0..3 {
            for _ in 0..50 {
                let d = policy.next_delay(attempt).as_millis() as u64;
                let base = policy.base_delay(attempt);
                assert!(d >= base && d <= base + 500, "attempt {attempt}: {d}");
            }
        }
        assert_eq!(policy.delay_with_jitter(0, 10_000), Duration::from_millis(1500));
    }

    #[test]
    fn test_large_attempt_saturates() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.base_delay(200), u64::MAX);
    }
}
