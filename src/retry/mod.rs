//! 重试：错误分类 + 指数退避 + 账本事件
//!
//! `with_retry` 只对分类为可重试的错误重试；永久错误零延迟直接返回。
//! 每次重试与最终失败都会写一条账本事件；重试后成功与首次成功分开记录。
//! 各次调用之间没有共享的退避状态。

pub mod backoff;
pub mod classifier;

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

pub use backoff::RetryPolicy;
pub use classifier::{classify, Classification, ErrorClass};

use crate::ledger::{emit_best_effort, Ledger, LedgerEvent};

/// 账本中错误消息的最大长度
const MAX_LEDGER_ERROR_CHARS: usize = 200;

/// 一次失败尝试的记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryAttempt {
    /// 1 起始：第几次尝试失败
    pub attempt: u32,
    pub reason: String,
    /// 下一次尝试前等待的毫秒数
    pub delay_ms: u64,
    pub error: String,
}

/// 重试的最终结果
#[derive(Debug)]
pub struct RetryResult<T, E> {
    pub success: bool,
    pub outcome: Result<T, E>,
    /// 实际调用次数
    pub attempts: u32,
    pub retry_history: Vec<RetryAttempt>,
}

impl<T, E> RetryResult<T, E> {
    pub fn result(&self) -> Option<&T> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&E> {
        self.outcome.as_ref().err()
    }

    pub fn into_result(self) -> Result<T, E> {
        self.outcome
    }
}

/// with_retry 的调用选项
#[derive(Clone, Default)]
pub struct RetryOptions {
    pub policy: RetryPolicy,
    /// 账本中的 agent_type
    pub agent_type: String,
    pub run_id: Option<String>,
    pub work_item_id: Option<String>,
    pub ledger: Option<Arc<dyn Ledger>>,
}

impl RetryOptions {
    pub fn new(agent_type: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            ..Default::default()
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn Ledger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_run(mut self, run_id: Option<String>, work_item_id: Option<String>) -> Self {
        self.run_id = run_id;
        self.work_item_id = work_item_id;
        self
    }

    fn emit(&self, kind: &str, payload: serde_json::Value) {
        if let Some(ledger) = &self.ledger {
            let event = LedgerEvent::new(kind, self.agent_type.clone(), payload)
                .with_run(self.run_id.clone(), self.work_item_id.clone());
            emit_best_effort(ledger.as_ref(), event);
        }
    }
}

fn truncate_error(message: &str) -> String {
    if message.chars().count() > MAX_LEDGER_ERROR_CHARS {
        format!("{}...", message.chars().take(MAX_LEDGER_ERROR_CHARS).collect::<String>())
    } else {
        message.to_string()
    }
}

/// 带分类的重试：`op` 接收 0 起始的尝试序号
pub async fn with_retry<T, E, F, Fut>(options: &RetryOptions, mut op: F) -> RetryResult<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let policy = options.policy;
    let mut history = Vec::new();
    let mut attempt: u32 = 0;

    loop {
        match op(attempt).await {
            Ok(value) => {
                let attempts = attempt + 1;
                if history.is_empty() {
                    tracing::debug!(agent = %options.agent_type, "succeeded on first attempt");
                } else {
                    tracing::info!(
                        agent = %options.agent_type,
                        attempts,
                        "succeeded after {} retries",
                        history.len()
                    );
                    options.emit(
                        "retry_recovered",
                        serde_json::json!({ "attempts": attempts, "retries": history.len() }),
                    );
                }
                return RetryResult {
                    success: true,
                    outcome: Ok(value),
                    attempts,
                    retry_history: history,
                };
            }
            Err(err) => {
                let message = err.to_string();
                let classification = classify(&message);
                let attempts = attempt + 1;
                let error = truncate_error(&message);

                if !classification.is_retryable() {
                    tracing::warn!(
                        agent = %options.agent_type,
                        reason = %classification.reason,
                        "permanent failure, not retrying: {}",
                        error
                    );
                    options.emit(
                        "permanent_failure",
                        serde_json::json!({
                            "attempt": attempts,
                            "reason": classification.reason,
                            "delayMs": 0,
                            "error": error,
                        }),
                    );
                    return RetryResult {
                        success: false,
                        outcome: Err(err),
                        attempts,
                        retry_history: history,
                    };
                }

                if attempt >= policy.max_retries {
                    tracing::warn!(
                        agent = %options.agent_type,
                        reason = %classification.reason,
                        attempts,
                        "retries exhausted: {}",
                        error
                    );
                    options.emit(
                        "retry_exhausted",
                        serde_json::json!({
                            "attempt": attempts,
                            "reason": classification.reason,
                            "delayMs": 0,
                            "error": error,
                        }),
                    );
                    return RetryResult {
                        success: false,
                        outcome: Err(err),
                        attempts,
                        retry_history: history,
                    };
                }

                let delay = policy.next_delay(attempt);
                let delay_ms = delay.as_millis() as u64;
                tracing::info!(
                    agent = %options.agent_type,
                    reason = %classification.reason,
                    attempt = attempts,
                    delay_ms,
                    "retrying after transient failure"
                );
                options.emit(
                    "retry_scheduled",
                    serde_json::json!({
                        "attempt": attempts,
                        "reason": classification.reason,
                        "delayMs": delay_ms,
                        "error": error,
                    }),
                );
                history.push(RetryAttempt {
                    attempt: attempts,
                    reason: classification.reason,
                    delay_ms,
                    error,
                });

                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_fails_twice_then_succeeds() {
        let ledger = Arc::new(MemoryLedger::new());
        let options = RetryOptions::new("writer").with_ledger(ledger.clone());
        let calls = AtomicU32::new(0);

        let result = with_retry(&options, |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("ECONNRESET".to_string())
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert!(result.success);
        assert_eq!(result.result(), Some(&"done"));
        assert_eq!(result.attempts, 3);
        assert_eq!(result.retry_history.len(), 2);
        let first = result.retry_history[0].delay_ms;
        let second = result.retry_history[1].delay_ms;
        assert!((1000..=1500).contains(&first), "first delay {first}");
        assert!((4000..=4500).contains(&second), "second delay {second}");
        assert!(second > first);
        assert_eq!(
            ledger.kinds(),
            vec!["retry_scheduled", "retry_scheduled", "retry_recovered"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_short_circuits() {
        let ledger = Arc::new(MemoryLedger::new());
        let options = RetryOptions::new("writer").with_ledger(ledger.clone());
        let start = tokio::time::Instant::now();

        let result: RetryResult<(), String> =
            with_retry(&options, |_| async { Err("401 unauthorized".to_string()) }).await;

        assert!(!result.success);
        assert_eq!(result.attempts, 1);
        assert!(result.retry_history.is_empty());
        assert_eq!(result.error().map(String::as_str), Some("401 unauthorized"));
        assert_eq!(start.elapsed(), std::time::Duration::ZERO);
        assert_eq!(ledger.kinds(), vec!["permanent_failure"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_after_max_retries() {
        let ledger = Arc::new(MemoryLedger::new());
        let options = RetryOptions::new("writer").with_ledger(ledger.clone());

        let result: RetryResult<(), String> =
            with_retry(&options, |_| async { Err("503 service unavailable".to_string()) }).await;

        assert!(!result.success);
        assert_eq!(result.attempts, 4);
        assert_eq!(result.retry_history.len(), 3);
        let kinds = ledger.kinds();
        assert_eq!(kinds.last().map(String::as_str), Some("retry_exhausted"));
        assert_eq!(kinds.len(), 4);
    }

    #[tokio::test]
    async fn test_first_try_success_emits_nothing() {
        let ledger = Arc::new(MemoryLedger::new());
        let options = RetryOptions::new("writer").with_ledger(ledger.clone());
        let result: RetryResult<u32, String> = with_retry(&options, |_| async { Ok(7) }).await;
        assert_eq!(result.attempts, 1);
        assert_eq!(result.into_result(), Ok(7));
        assert!(ledger.events().is_empty());
    }

    #[test]
    fn test_truncate_error() {
        let long = "x".repeat(500);
        assert_eq!(truncate_error(&long).chars().count(), MAX_LEDGER_ERROR_CHARS + 3);
        assert_eq!(truncate_error("short"), "short");
    }
}
