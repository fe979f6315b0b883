//! 检查点存储：进程内注册表 + 持久化后端
//!
//! 注册表只做按键替换；持久化写入在后台任务中完成，调用方不等待。
//! 后台写入串行执行且总是写注册表中的最新值，已删除的检查点不会被迟到的写入复活。
//! 读取时过期（now > expires_at）的检查点被丢弃，永不用于续跑；
//! 保存与列举时顺带清理注册表中所有过期条目，持久化副本在后台删除。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use super::{CheckpointError, DurableStore, PipelineCheckpoint, CHECKPOINT_VERSION};
use crate::config::CheckpointSection;

const KEY_PREFIX: &str = "pipeline_checkpoint:";

/// can_resume 的结果
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeStatus {
    /// 仍有未执行步骤时为 true
    pub resumable: bool,
    pub checkpoint: Option<PipelineCheckpoint>,
    pub steps_remaining: usize,
    pub steps_completed: usize,
}

impl ResumeStatus {
    fn absent() -> Self {
        Self {
            resumable: false,
            checkpoint: None,
            steps_remaining: 0,
            steps_completed: 0,
        }
    }
}

/// 检查点存储
pub struct CheckpointStore {
    registry: Arc<RwLock<HashMap<String, PipelineCheckpoint>>>,
    durable: Arc<dyn DurableStore>,
    write_lock: Arc<Mutex<()>>,
    ttl: chrono::Duration,
}

impl CheckpointStore {
    pub fn new(durable: Arc<dyn DurableStore>, ttl: std::time::Duration) -> Self {
        Self {
            registry: Arc::new(RwLock::new(HashMap::new())),
            durable,
            write_lock: Arc::new(Mutex::new(())),
            ttl: chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(1)),
        }
    }

    /// 按 [checkpoint] 配置打开后端
    pub fn from_config(section: &CheckpointSection) -> Result<Self, CheckpointError> {
        let durable = super::open_durable_store(section)?;
        Ok(Self::new(durable, std::time::Duration::from_secs(section.ttl_secs)))
    }

    fn key(pipeline_id: &str) -> String {
        format!("{KEY_PREFIX}{pipeline_id}")
    }

    /// 保存检查点（刷新 updated_at / expires_at）；返回后台写入句柄，调用方可忽略
    pub async fn save_checkpoint(&self, checkpoint: PipelineCheckpoint) -> JoinHandle<()> {
        self.save_checkpoint_at(checkpoint, Utc::now()).await
    }

    pub async fn save_checkpoint_at(
        &self,
        mut checkpoint: PipelineCheckpoint,
        now: DateTime<Utc>,
    ) -> JoinHandle<()> {
        checkpoint.version = CHECKPOINT_VERSION;
        checkpoint.updated_at = now;
        checkpoint.expires_at = now + self.ttl;

        let pipeline_id = checkpoint.pipeline_id.clone();
        let swept = {
            let mut registry = self.registry.write().await;
            let swept = sweep_expired(&mut registry, now);
            registry.insert(pipeline_id.clone(), checkpoint);
            swept
        };

        let registry = Arc::clone(&self.registry);
        let durable = Arc::clone(&self.durable);
        let write_lock = Arc::clone(&self.write_lock);
        tokio::spawn(async move {
            let _guard = write_lock.lock().await;
            purge_durable(&registry, durable.as_ref(), &swept).await;
            let latest = registry.read().await.get(&pipeline_id).cloned();
            let Some(latest) = latest else {
                return;
            };
            let result = match serde_json::to_string(&latest) {
                Ok(json) => durable.set(&Self::key(&pipeline_id), json).await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = result {
                tracing::warn!(pipeline_id = %pipeline_id, "Failed to persist checkpoint: {}", e);
            }
        })
    }

    /// 读取检查点；不存在或已过期返回 None
    pub async fn load_checkpoint(&self, pipeline_id: &str) -> Result<Option<PipelineCheckpoint>, CheckpointError> {
        self.load_checkpoint_at(pipeline_id, Utc::now()).await
    }

    pub async fn load_checkpoint_at(
        &self,
        pipeline_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<PipelineCheckpoint>, CheckpointError> {
        let cached = self.registry.read().await.get(pipeline_id).cloned();
        let checkpoint = match cached {
            Some(cp) => cp,
            None => match self.load_durable(pipeline_id).await? {
                Some(cp) => cp,
                None => return Ok(None),
            },
        };

        if checkpoint.is_expired(now) {
            tracing::info!(
                pipeline_id = %pipeline_id,
                updated_at = %checkpoint.updated_at,
                "Discarding stale checkpoint"
            );
            if let Err(e) = self.delete_checkpoint(pipeline_id).await {
                tracing::warn!(pipeline_id = %pipeline_id, "Failed to delete stale checkpoint: {}", e);
            }
            return Ok(None);
        }

        self.registry
            .write()
            .await
            .insert(pipeline_id.to_string(), checkpoint.clone());
        Ok(Some(checkpoint))
    }

    async fn load_durable(&self, pipeline_id: &str) -> Result<Option<PipelineCheckpoint>, CheckpointError> {
        let Some(json) = self.durable.get(&Self::key(pipeline_id)).await? else {
            return Ok(None);
        };
        let checkpoint: PipelineCheckpoint = serde_json::from_str(&json)?;
        if checkpoint.pipeline_id != pipeline_id {
            tracing::warn!(
                pipeline_id = %pipeline_id,
                stored_id = %checkpoint.pipeline_id,
                "Ignoring checkpoint stored under a different pipeline id"
            );
            return Ok(None);
        }
        if checkpoint.version != CHECKPOINT_VERSION {
            tracing::warn!(
                pipeline_id = %pipeline_id,
                version = checkpoint.version,
                "Ignoring checkpoint with unsupported version"
            );
            return Ok(None);
        }
        Ok(Some(checkpoint))
    }

    /// 是否可续跑：存在、未过期且仍有剩余步骤
    pub async fn can_resume(&self, pipeline_id: &str) -> Result<ResumeStatus, CheckpointError> {
        self.can_resume_at(pipeline_id, Utc::now()).await
    }

    pub async fn can_resume_at(
        &self,
        pipeline_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ResumeStatus, CheckpointError> {
        let Some(checkpoint) = self.load_checkpoint_at(pipeline_id, now).await? else {
            return Ok(ResumeStatus::absent());
        };
        let steps_remaining = checkpoint.steps_remaining();
        Ok(ResumeStatus {
            resumable: steps_remaining > 0,
            steps_remaining,
            steps_completed: checkpoint.steps_completed(),
            checkpoint: Some(checkpoint),
        })
    }

    /// 完成或放弃时删除
    pub async fn delete_checkpoint(&self, pipeline_id: &str) -> Result<(), CheckpointError> {
        let _guard = self.write_lock.lock().await;
        self.registry.write().await.remove(pipeline_id);
        self.durable.delete(&Self::key(pipeline_id)).await
    }

    /// 注册表中未过期的检查点 ID
    pub async fn active_ids(&self) -> Vec<String> {
        self.active_ids_at(Utc::now()).await
    }

    pub async fn active_ids_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let (mut ids, swept) = {
            let mut registry = self.registry.write().await;
            let swept = sweep_expired(&mut registry, now);
            (registry.keys().cloned().collect::<Vec<_>>(), swept)
        };
        if !swept.is_empty() {
            let registry = Arc::clone(&self.registry);
            let durable = Arc::clone(&self.durable);
            let write_lock = Arc::clone(&self.write_lock);
            tokio::spawn(async move {
                let _guard = write_lock.lock().await;
                purge_durable(&registry, durable.as_ref(), &swept).await;
            });
        }
        ids.sort();
        ids
    }
}

/// 从注册表移除过期条目，返回被移除的 ID
fn sweep_expired(registry: &mut HashMap<String, PipelineCheckpoint>, now: DateTime<Utc>) -> Vec<String> {
    let mut swept = Vec::new();
    registry.retain(|id, cp| {
        let keep = !cp.is_expired(now);
        if !keep {
            swept.push(id.clone());
        }
        keep
    });
    if !swept.is_empty() {
        tracing::info!(count = swept.len(), "Swept expired checkpoints");
    }
    swept
}

/// 删除被清理条目的持久化副本；调用方持有 write_lock，期间重新保存过的 ID 跳过
async fn purge_durable(
    registry: &RwLock<HashMap<String, PipelineCheckpoint>>,
    durable: &dyn DurableStore,
    swept: &[String],
) {
    for id in swept {
        if registry.read().await.contains_key(id) {
            continue;
        }
        if let Err(e) = durable.delete(&CheckpointStore::key(id)).await {
            tracing::warn!(pipeline_id = %id, "Failed to delete expired checkpoint: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::MemoryDurableStore;
    use crate::orchestration::{ArtifactTotals, ExecutionType, Step, StepResult};
    use std::time::Duration;

    fn store() -> (CheckpointStore, Arc<MemoryDurableStore>) {
        let durable = Arc::new(MemoryDurableStore::new());
        (CheckpointStore::new(durable.clone(), Duration::from_secs(3600)), durable)
    }

    fn checkpoint(id: &str) -> PipelineCheckpoint {
        let steps = vec![Step::new("a", "one"), Step::new("b", "two")];
        PipelineCheckpoint::new(id, "hello", steps, "cli", None)
    }

    fn step_result(index: usize) -> StepResult {
        StepResult {
            step_index: index,
            agent_name: "a".to_string(),
            skill_name: None,
            output: "first".to_string(),
            duration_ms: 5,
            input_tokens: 1,
            output_tokens: 2,
            cost_usd: 0.01,
            execution_type: ExecutionType::Heavy,
            session_id: "s1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_save_then_load_within_ttl() {
        let (store, durable) = store();
        let now = Utc::now();
        let mut cp = checkpoint("p1");
        cp.record_step(step_result(0), ArtifactTotals::default());
        store.save_checkpoint_at(cp.clone(), now).await.await.unwrap();
        assert_eq!(durable.len().await, 1);

        let loaded = store
            .load_checkpoint_at("p1", now + chrono::Duration::minutes(59))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.completed_steps, cp.completed_steps);
        assert_eq!(loaded.next_step_index, 1);
        assert_eq!(loaded.expires_at, now + chrono::Duration::hours(1));
    }

    #[tokio::test]
    async fn test_stale_checkpoint_is_discarded() {
        let (store, durable) = store();
        let now = Utc::now();
        store.save_checkpoint_at(checkpoint("p1"), now).await.await.unwrap();

        let loaded = store
            .load_checkpoint_at("p1", now + chrono::Duration::minutes(61))
            .await
            .unwrap();
        assert!(loaded.is_none());
        assert_eq!(durable.len().await, 0);
        assert!(store.active_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_durable_store_is_authoritative_after_restart() {
        let durable = Arc::new(MemoryDurableStore::new());
        let first = CheckpointStore::new(durable.clone(), Duration::from_secs(3600));
        first.save_checkpoint(checkpoint("p2")).await.await.unwrap();

        // 新进程：注册表为空，只剩持久化后端
        let second = CheckpointStore::new(durable, Duration::from_secs(3600));
        let status = second.can_resume("p2").await.unwrap();
        assert!(status.resumable);
        assert_eq!(status.steps_remaining, 2);
        assert_eq!(status.steps_completed, 0);
        assert_eq!(second.active_ids().await, vec!["p2".to_string()]);
    }

    #[tokio::test]
    async fn test_can_resume_false_when_all_steps_done() {
        let (store, _) = store();
        let mut cp = checkpoint("p3");
        cp.record_step(step_result(0), ArtifactTotals::default());
        cp.record_step(step_result(1), ArtifactTotals::default());
        store.save_checkpoint(cp).await.await.unwrap();

        let status = store.can_resume("p3").await.unwrap();
        assert!(!status.resumable);
        assert_eq!(status.steps_remaining, 0);
        assert_eq!(status.steps_completed, 2);
        assert!(status.checkpoint.is_some());
    }

    #[tokio::test]
    async fn test_missing_and_deleted() {
        let (store, durable) = store();
        assert!(!store.can_resume("nope").await.unwrap().resumable);

        store.save_checkpoint(checkpoint("p4")).await.await.unwrap();
        store.delete_checkpoint("p4").await.unwrap();
        assert!(store.load_checkpoint("p4").await.unwrap().is_none());
        assert_eq!(durable.len().await, 0);
    }

    #[tokio::test]
    async fn test_rapid_saves_persist_latest() {
        let durable = Arc::new(MemoryDurableStore::new());
        let store = CheckpointStore::new(durable.clone(), Duration::from_secs(3600));
        let mut cp = checkpoint("p6");
        let first = store.save_checkpoint(cp.clone()).await;
        cp.record_step(step_result(0), ArtifactTotals::default());
        let second = store.save_checkpoint(cp).await;
        first.await.unwrap();
        second.await.unwrap();

        let restarted = CheckpointStore::new(durable, Duration::from_secs(3600));
        let loaded = restarted.load_checkpoint("p6").await.unwrap().unwrap();
        assert_eq!(loaded.next_step_index, 1);
    }

    #[tokio::test]
    async fn test_expired_entries_swept_from_registry() {
        let (store, durable) = store();
        let now = Utc::now();
        let earlier = now - chrono::Duration::hours(5);
        for id in ["p0", "p1", "p2"] {
            store.save_checkpoint_at(checkpoint(id), earlier).await.await.unwrap();
        }
        assert_eq!(store.active_ids_at(earlier).await.len(), 3);

        store.save_checkpoint_at(checkpoint("fresh"), now).await.await.unwrap();
        assert_eq!(store.active_ids_at(now).await, vec!["fresh".to_string()]);
        assert_eq!(durable.len().await, 1);
    }

    #[tokio::test]
    async fn test_listing_sweeps_expired_entries() {
        let (store, durable) = store();
        let now = Utc::now();
        store.save_checkpoint_at(checkpoint("old"), now).await.await.unwrap();

        assert!(store.active_ids_at(now + chrono::Duration::hours(2)).await.is_empty());
        for _ in 0..50 {
            if durable.len().await == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(durable.len().await, 0);
    }

    #[tokio::test]
    async fn test_mismatched_pipeline_id_treated_as_absent() {
        let (store, durable) = store();
        let mut cp = checkpoint("other");
        cp.expires_at = Utc::now() + chrono::Duration::hours(1);
        durable
            .set("pipeline_checkpoint:p7", serde_json::to_string(&cp).unwrap())
            .await
            .unwrap();
        assert!(store.load_checkpoint("p7").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_version_treated_as_absent() {
        let (store, durable) = store();
        let mut cp = checkpoint("p5");
        cp.version = 99;
        cp.expires_at = Utc::now() + chrono::Duration::hours(1);
        durable
            .set("pipeline_checkpoint:p5", serde_json::to_string(&cp).unwrap())
            .await
            .unwrap();
        assert!(store.load_checkpoint("p5").await.unwrap().is_none());
    }
}
