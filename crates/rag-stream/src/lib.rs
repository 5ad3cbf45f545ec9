pub mod memory;
pub mod redis_impl;

pub use memory::MemoryStreamManager;
pub use redis_impl::RedisStreamManager;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rag_core::References;
use rag_error::{RagError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// 一条活跃流的快照
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StreamInfo {
    pub session_id: String,
    pub request_id: String,
    pub query: String,
    pub content: String,
    pub knowledge_references: References,
    pub last_updated: DateTime<Utc>,
    pub is_completed: bool,
}

/// 活跃流管理器。同一 (session_id, request_id) 至多一个写入方；
/// 对不存在的键执行 update/complete 是空操作（流可能已过期）。
/// 任何时刻读到的 content 都是之后任何快照的前缀，直到完成。
#[async_trait]
pub trait StreamManager: Send + Sync {
    /// 注册新流，内容为空
    async fn register_stream(&self, session_id: &str, request_id: &str, query: &str)
        -> Result<()>;

    /// 追加增量；references 非空时整体替换
    async fn update_stream(
        &self,
        session_id: &str,
        request_id: &str,
        content: &str,
        references: Option<&References>,
    ) -> Result<()>;

    /// 标记完成，30 秒后删除
    async fn complete_stream(&self, session_id: &str, request_id: &str) -> Result<()>;

    /// 读取快照，不存在返回 None
    async fn get_stream(&self, session_id: &str, request_id: &str) -> Result<Option<StreamInfo>>;
}

/// 完成后的清理延迟
pub const COMPLETED_CLEANUP_DELAY: Duration = Duration::from_secs(30);
/// 默认 TTL
pub const DEFAULT_STREAM_TTL: Duration = Duration::from_secs(3600);

/// 按配置选择实现：memory 或 redis
pub async fn new_stream_manager(
    manager_type: &str,
    redis_addr: Option<&str>,
    redis_password: Option<&str>,
    redis_db: Option<i64>,
    redis_prefix: Option<&str>,
    ttl: Option<Duration>,
) -> Result<Arc<dyn StreamManager>> {
    match manager_type {
        "" | "memory" => Ok(Arc::new(MemoryStreamManager::new(
            ttl.unwrap_or(DEFAULT_STREAM_TTL),
        ))),
        "redis" => {
            let addr = redis_addr.ok_or_else(|| RagError::Configuration {
                key: "REDIS_ADDR".into(),
                reason: "redis stream manager requires an address".into(),
            })?;
            let manager =
                RedisStreamManager::new(addr, redis_password, redis_db, redis_prefix, ttl).await?;
            Ok(Arc::new(manager))
        }
        other => Err(RagError::Configuration {
            key: "STREAM_MANAGER_TYPE".into(),
            reason: format!("unknown stream manager type {}", other),
        }),
    }
}
