//! 事件账本（Ledger）
//!
//! 追加式事件流，记录重试 / 终止失败等可观测事件。发射是尽力而为：
//! `emit` 不得阻塞调用方，失败只记日志，绝不影响执行本身的成败。

use std::sync::Mutex;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

/// 账本事件
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEvent {
    pub run_id: Option<String>,
    /// 事件种类，如 retry_scheduled / retry_exhausted
    pub kind: String,
    /// 产生事件的 Agent 类型
    pub agent_type: String,
    pub work_item_id: Option<String>,
    pub payload: serde_json::Value,
    pub at: chrono::DateTime<chrono::Utc>,
}

impl LedgerEvent {
    pub fn new(kind: impl Into<String>, agent_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            run_id: None,
            kind: kind.into(),
            agent_type: agent_type.into(),
            work_item_id: None,
            payload,
            at: chrono::Utc::now(),
        }
    }

    pub fn with_run(mut self, run_id: Option<String>, work_item_id: Option<String>) -> Self {
        self.run_id = run_id;
        self.work_item_id = work_item_id;
        self
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Ledger sink closed")]
    Closed,
    #[error("Ledger serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// 账本接口：实现必须立即返回（需要 IO 的实现应内部排队）
pub trait Ledger: Send + Sync {
    fn emit(&self, event: LedgerEvent) -> Result<(), LedgerError>;
}

/// 尽力发射：失败只记 warn
pub fn emit_best_effort(ledger: &dyn Ledger, event: LedgerEvent) {
    let kind = event.kind.clone();
    if let Err(e) = ledger.emit(event) {
        tracing::warn!(kind = %kind, "Ledger emit failed: {}", e);
    }
}

/// 默认账本：以结构化 JSON 写入 tracing 日志
#[derive(Debug, Default)]
pub struct TracingLedger;

impl Ledger for TracingLedger {
    fn emit(&self, event: LedgerEvent) -> Result<(), LedgerError> {
        let audit = serde_json::to_string(&event)?;
        tracing::info!(ledger = %audit, "ledger");
        Ok(())
    }
}

/// 内存账本（测试用，可读回所有事件）
#[derive(Debug, Default)]
pub struct MemoryLedger {
    events: Mutex<Vec<LedgerEvent>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LedgerEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn kinds(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.kind).collect()
    }
}

impl Ledger for MemoryLedger {
    fn emit(&self, event: LedgerEvent) -> Result<(), LedgerError> {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
        Ok(())
    }
}

/// 通道账本：事件转发给后台消费者（如写数据库的任务），发送永不阻塞
pub struct ChannelLedger {
    tx: mpsc::UnboundedSender<LedgerEvent>,
}

impl ChannelLedger {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LedgerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Ledger for ChannelLedger {
    fn emit(&self, event: LedgerEvent) -> Result<(), LedgerError> {
        self.tx.send(event).map_err(|_| LedgerError::Closed)
    }
}
