//! 持久层接口。问答与摄取管线只依赖这些 trait；
//! 进程内实现见 memory 模块，关系型后端可在不改调用方的前提下替换。

pub mod memory;

pub use memory::{
    MemoryChunkStore, MemoryKnowledgeBaseStore, MemoryKnowledgeStore, MemoryMessageStore,
    MemoryModelStore, MemorySessionStore, MemoryTenantStore,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rag_core::{Chunk, Knowledge, KnowledgeBase, Message, Model, Session, Tenant};
use rag_error::Result;

#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn create(&self, tenant: Tenant) -> Result<Tenant>;
    async fn get(&self, id: u32) -> Result<Option<Tenant>>;
    async fn get_by_api_key(&self, api_key: &str) -> Result<Option<Tenant>>;
    async fn update(&self, tenant: Tenant) -> Result<Tenant>;
    async fn delete(&self, id: u32) -> Result<()>;
    async fn list(&self) -> Result<Vec<Tenant>>;

    /// 调整已用存储。实现必须对同一租户的并发调整串行化，
    /// 结果下限为 0。
    async fn adjust_storage_used(&self, tenant_id: u32, delta: i64) -> Result<()>;
}

#[async_trait]
pub trait KnowledgeBaseStore: Send + Sync {
    async fn create(&self, kb: KnowledgeBase) -> Result<KnowledgeBase>;
    async fn get(&self, id: &str) -> Result<Option<KnowledgeBase>>;
    async fn update(&self, kb: KnowledgeBase) -> Result<KnowledgeBase>;
    async fn delete(&self, id: &str) -> Result<()>;
    async fn list(&self, tenant_id: u32) -> Result<Vec<KnowledgeBase>>;
}

#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    async fn create(&self, knowledge: Knowledge) -> Result<Knowledge>;
    async fn get(&self, id: &str) -> Result<Option<Knowledge>>;
    async fn batch_get(&self, ids: &[String]) -> Result<Vec<Knowledge>>;
    async fn update(&self, knowledge: Knowledge) -> Result<Knowledge>;
    async fn delete(&self, id: &str) -> Result<()>;
    async fn list(&self, knowledge_base_id: &str) -> Result<Vec<Knowledge>>;

    /// 知识库内按内容哈希查重
    async fn find_by_hash(&self, knowledge_base_id: &str, file_hash: &str)
        -> Result<Option<Knowledge>>;
}

#[async_trait]
pub trait ChunkStore: Send + Sync {
    async fn batch_create(&self, chunks: Vec<Chunk>) -> Result<()>;
    /// 软删除的 chunk 依然可取到，消息引用保持可解析
    async fn get(&self, id: &str) -> Result<Option<Chunk>>;
    async fn get_many(&self, ids: &[String]) -> Result<Vec<Chunk>>;
    /// 按 chunk_index 升序返回未删除的 chunk
    async fn list_by_knowledge(&self, knowledge_id: &str) -> Result<Vec<Chunk>>;
    async fn delete(&self, knowledge_id: &str, chunk_id: &str) -> Result<()>;
    async fn delete_by_knowledge(&self, knowledge_id: &str) -> Result<Vec<String>>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: Session) -> Result<Session>;
    async fn get(&self, id: &str) -> Result<Option<Session>>;
    async fn update(&self, session: Session) -> Result<Session>;
    async fn delete(&self, id: &str) -> Result<()>;
    async fn list(&self, tenant_id: u32) -> Result<Vec<Session>>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create(&self, message: Message) -> Result<Message>;
    async fn get(&self, session_id: &str, id: &str) -> Result<Option<Message>>;
    async fn get_by_request(&self, session_id: &str, request_id: &str)
        -> Result<Option<Message>>;
    /// 最近 limit 条消息，按 created_at 升序返回，用于多轮改写
    async fn list_recent(&self, session_id: &str, limit: usize) -> Result<Vec<Message>>;
    /// created_at < before_time 的最新 limit 条，按 created_at 降序
    async fn list_before(
        &self,
        session_id: &str,
        before_time: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Message>>;
    async fn soft_delete(&self, session_id: &str, id: &str) -> Result<()>;
}

#[async_trait]
pub trait ModelStore: Send + Sync {
    async fn create(&self, model: Model) -> Result<Model>;
    async fn get(&self, id: &str) -> Result<Option<Model>>;
    async fn list(&self, tenant_id: u32) -> Result<Vec<Model>>;
}
