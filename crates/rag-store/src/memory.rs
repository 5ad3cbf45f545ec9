use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rag_core::{Chunk, Knowledge, KnowledgeBase, Message, Model, Session, Tenant};
use rag_error::{RagError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

// ========== Tenant ==========

#[derive(Default)]
pub struct MemoryTenantStore {
    tenants: RwLock<HashMap<u32, Tenant>>,
    next_id: AtomicU32,
}

impl MemoryTenantStore {
    pub fn new() -> Self {
        Self {
            tenants: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }
}

#[async_trait]
impl crate::TenantStore for MemoryTenantStore {
    async fn create(&self, mut tenant: Tenant) -> Result<Tenant> {
        let mut tenants = self.tenants.write().await;
        if tenant.id == 0 {
            tenant.id = self.next_id.fetch_add(1, Ordering::SeqCst);
        }
        if tenant.api_key.is_empty() {
            tenant.api_key = Tenant::new_api_key();
        }
        tenant.created_at = Utc::now();
        tenant.updated_at = tenant.created_at;
        tenants.insert(tenant.id, tenant.clone());
        Ok(tenant)
    }

    async fn get(&self, id: u32) -> Result<Option<Tenant>> {
        Ok(self.tenants.read().await.get(&id).cloned())
    }

    async fn get_by_api_key(&self, api_key: &str) -> Result<Option<Tenant>> {
        Ok(self
            .tenants
            .read()
            .await
            .values()
            .find(|t| t.api_key == api_key)
            .cloned())
    }

    async fn update(&self, mut tenant: Tenant) -> Result<Tenant> {
        let mut tenants = self.tenants.write().await;
        let existing = tenants.get(&tenant.id).ok_or_else(|| RagError::NotFound {
            resource: format!("tenant {}", tenant.id),
        })?;
        // 更新即轮换 API key
        tenant.api_key = Tenant::new_api_key();
        tenant.storage_used = existing.storage_used;
        tenant.created_at = existing.created_at;
        tenant.updated_at = Utc::now();
        tenants.insert(tenant.id, tenant.clone());
        Ok(tenant)
    }

    async fn delete(&self, id: u32) -> Result<()> {
        self.tenants.write().await.remove(&id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Tenant>> {
        let mut all: Vec<Tenant> = self.tenants.read().await.values().cloned().collect();
        all.sort_by_key(|t| t.id);
        Ok(all)
    }

    async fn adjust_storage_used(&self, tenant_id: u32, delta: i64) -> Result<()> {
        // 写锁即每租户串行化的悲观锁
        let mut tenants = self.tenants.write().await;
        let tenant = tenants.get_mut(&tenant_id).ok_or_else(|| RagError::NotFound {
            resource: format!("tenant {}", tenant_id),
        })?;
        tenant.storage_used = (tenant.storage_used + delta).max(0);
        if tenant.storage_quota > 0 && tenant.storage_used > tenant.storage_quota {
            tenant.storage_used = (tenant.storage_used - delta).max(0);
            return Err(RagError::QuotaExceeded {
                resource: "storage".into(),
                limit: tenant.storage_quota.to_string(),
            });
        }
        Ok(())
    }
}

// ========== KnowledgeBase ==========

#[derive(Default)]
pub struct MemoryKnowledgeBaseStore {
    kbs: RwLock<HashMap<String, KnowledgeBase>>,
}

impl MemoryKnowledgeBaseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl crate::KnowledgeBaseStore for MemoryKnowledgeBaseStore {
    async fn create(&self, mut kb: KnowledgeBase) -> Result<KnowledgeBase> {
        if let Some(config) = &kb.chunking_config {
            config.validate()?;
        }
        if kb.id.is_empty() {
            kb.id = new_id();
        }
        kb.created_at = Utc::now();
        kb.updated_at = kb.created_at;
        self.kbs.write().await.insert(kb.id.clone(), kb.clone());
        Ok(kb)
    }

    async fn get(&self, id: &str) -> Result<Option<KnowledgeBase>> {
        Ok(self.kbs.read().await.get(id).cloned())
    }

    async fn update(&self, mut kb: KnowledgeBase) -> Result<KnowledgeBase> {
        if let Some(config) = &kb.chunking_config {
            config.validate()?;
        }
        let mut kbs = self.kbs.write().await;
        let existing = kbs.get(&kb.id).ok_or_else(|| RagError::NotFound {
            resource: format!("knowledge base {}", kb.id),
        })?;
        kb.created_at = existing.created_at;
        kb.updated_at = Utc::now();
        kbs.insert(kb.id.clone(), kb.clone());
        Ok(kb)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.kbs.write().await.remove(id);
        Ok(())
    }

    async fn list(&self, tenant_id: u32) -> Result<Vec<KnowledgeBase>> {
        let mut all: Vec<KnowledgeBase> = self
            .kbs
            .read()
            .await
            .values()
            .filter(|kb| kb.tenant_id == tenant_id)
            .cloned()
            .collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all)
    }
}

// ========== Knowledge ==========

#[derive(Default)]
pub struct MemoryKnowledgeStore {
    items: RwLock<HashMap<String, Knowledge>>,
}

impl MemoryKnowledgeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl crate::KnowledgeStore for MemoryKnowledgeStore {
    async fn create(&self, mut knowledge: Knowledge) -> Result<Knowledge> {
        if knowledge.id.is_empty() {
            knowledge.id = new_id();
        }
        knowledge.created_at = Utc::now();
        knowledge.updated_at = knowledge.created_at;
        self.items
            .write()
            .await
            .insert(knowledge.id.clone(), knowledge.clone());
        Ok(knowledge)
    }

    async fn get(&self, id: &str) -> Result<Option<Knowledge>> {
        Ok(self.items.read().await.get(id).cloned())
    }

    async fn batch_get(&self, ids: &[String]) -> Result<Vec<Knowledge>> {
        let items = self.items.read().await;
        Ok(ids.iter().filter_map(|id| items.get(id).cloned()).collect())
    }

    async fn update(&self, mut knowledge: Knowledge) -> Result<Knowledge> {
        let mut items = self.items.write().await;
        let existing = items.get(&knowledge.id).ok_or_else(|| RagError::NotFound {
            resource: format!("knowledge {}", knowledge.id),
        })?;
        knowledge.created_at = existing.created_at;
        knowledge.updated_at = Utc::now();
        items.insert(knowledge.id.clone(), knowledge.clone());
        Ok(knowledge)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.items.write().await.remove(id);
        Ok(())
    }

    async fn list(&self, knowledge_base_id: &str) -> Result<Vec<Knowledge>> {
        let mut all: Vec<Knowledge> = self
            .items
            .read()
            .await
            .values()
            .filter(|k| k.knowledge_base_id == knowledge_base_id)
            .cloned()
            .collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all)
    }

    async fn find_by_hash(
        &self,
        knowledge_base_id: &str,
        file_hash: &str,
    ) -> Result<Option<Knowledge>> {
        Ok(self
            .items
            .read()
            .await
            .values()
            .find(|k| k.knowledge_base_id == knowledge_base_id && k.file_hash == file_hash)
            .cloned())
    }
}

// ========== Chunk ==========

#[derive(Default)]
pub struct MemoryChunkStore {
    chunks: RwLock<HashMap<String, Chunk>>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl crate::ChunkStore for MemoryChunkStore {
    async fn batch_create(&self, batch: Vec<Chunk>) -> Result<()> {
        let mut chunks = self.chunks.write().await;
        for chunk in batch {
            chunks.insert(chunk.id.clone(), chunk);
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Chunk>> {
        Ok(self.chunks.read().await.get(id).cloned())
    }

    async fn get_many(&self, ids: &[String]) -> Result<Vec<Chunk>> {
        let chunks = self.chunks.read().await;
        Ok(ids.iter().filter_map(|id| chunks.get(id).cloned()).collect())
    }

    async fn list_by_knowledge(&self, knowledge_id: &str) -> Result<Vec<Chunk>> {
        let mut all: Vec<Chunk> = self
            .chunks
            .read()
            .await
            .values()
            .filter(|c| c.knowledge_id == knowledge_id && !c.is_deleted())
            .cloned()
            .collect();
        all.sort_by_key(|c| c.chunk_index);
        Ok(all)
    }

    async fn delete(&self, knowledge_id: &str, chunk_id: &str) -> Result<()> {
        let mut chunks = self.chunks.write().await;
        if let Some(chunk) = chunks.get_mut(chunk_id) {
            if chunk.knowledge_id == knowledge_id {
                chunk.deleted_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn delete_by_knowledge(&self, knowledge_id: &str) -> Result<Vec<String>> {
        let mut chunks = self.chunks.write().await;
        let now = Utc::now();
        let mut deleted = Vec::new();
        for chunk in chunks.values_mut() {
            if chunk.knowledge_id == knowledge_id && !chunk.is_deleted() {
                chunk.deleted_at = Some(now);
                deleted.push(chunk.id.clone());
            }
        }
        Ok(deleted)
    }
}

// ========== Session ==========

#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl crate::SessionStore for MemorySessionStore {
    async fn create(&self, mut session: Session) -> Result<Session> {
        if session.id.is_empty() {
            session.id = new_id();
        }
        session.created_at = Utc::now();
        session.updated_at = session.created_at;
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn get(&self, id: &str) -> Result<Option<Session>> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn update(&self, mut session: Session) -> Result<Session> {
        let mut sessions = self.sessions.write().await;
        let existing = sessions.get(&session.id).ok_or_else(|| RagError::NotFound {
            resource: format!("session {}", session.id),
        })?;
        session.created_at = existing.created_at;
        session.updated_at = Utc::now();
        sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.sessions.write().await.remove(id);
        Ok(())
    }

    async fn list(&self, tenant_id: u32) -> Result<Vec<Session>> {
        let mut all: Vec<Session> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| s.tenant_id == tenant_id)
            .cloned()
            .collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }
}

// ========== Message ==========

#[derive(Default)]
pub struct MemoryMessageStore {
    messages: RwLock<Vec<Message>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl crate::MessageStore for MemoryMessageStore {
    async fn create(&self, mut message: Message) -> Result<Message> {
        if message.id.is_empty() {
            message.id = new_id();
        }
        if message.created_at.timestamp() == 0 {
            message.created_at = Utc::now();
        }
        message.updated_at = Utc::now();
        self.messages.write().await.push(message.clone());
        Ok(message)
    }

    async fn get(&self, session_id: &str, id: &str) -> Result<Option<Message>> {
        Ok(self
            .messages
            .read()
            .await
            .iter()
            .find(|m| m.session_id == session_id && m.id == id && m.deleted_at.is_none())
            .cloned())
    }

    async fn get_by_request(
        &self,
        session_id: &str,
        request_id: &str,
    ) -> Result<Option<Message>> {
        Ok(self
            .messages
            .read()
            .await
            .iter()
            .find(|m| {
                m.session_id == session_id
                    && m.request_id == request_id
                    && m.deleted_at.is_none()
            })
            .cloned())
    }

    async fn list_recent(&self, session_id: &str, limit: usize) -> Result<Vec<Message>> {
        let messages = self.messages.read().await;
        let mut recent: Vec<Message> = messages
            .iter()
            .filter(|m| m.session_id == session_id && m.deleted_at.is_none())
            .cloned()
            .collect();
        recent.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        recent.truncate(limit);
        recent.reverse();
        Ok(recent)
    }

    async fn list_before(
        &self,
        session_id: &str,
        before_time: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let messages = self.messages.read().await;
        let mut result: Vec<Message> = messages
            .iter()
            .filter(|m| {
                m.session_id == session_id
                    && m.created_at < before_time
                    && m.deleted_at.is_none()
            })
            .cloned()
            .collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        result.truncate(limit);
        Ok(result)
    }

    async fn soft_delete(&self, session_id: &str, id: &str) -> Result<()> {
        let mut messages = self.messages.write().await;
        for message in messages.iter_mut() {
            if message.session_id == session_id && message.id == id {
                message.deleted_at = Some(Utc::now());
            }
        }
        Ok(())
    }
}

// ========== Model ==========

#[derive(Default)]
pub struct MemoryModelStore {
    models: RwLock<HashMap<String, Model>>,
}

impl MemoryModelStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl crate::ModelStore for MemoryModelStore {
    async fn create(&self, mut model: Model) -> Result<Model> {
        if model.id.is_empty() {
            model.id = new_id();
        }
        self.models
            .write()
            .await
            .insert(model.id.clone(), model.clone());
        Ok(model)
    }

    async fn get(&self, id: &str) -> Result<Option<Model>> {
        Ok(self.models.read().await.get(id).cloned())
    }

    async fn list(&self, tenant_id: u32) -> Result<Vec<Model>> {
        Ok(self
            .models
            .read()
            .await
            .values()
            .filter(|m| m.tenant_id == tenant_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChunkStore, KnowledgeStore, MessageStore, TenantStore};
    use chrono::Duration;
    use rag_core::MessageRole;
    use std::sync::Arc;

    #[tokio::test]
    async fn concurrent_storage_adjustments_are_not_lost() {
        let store = Arc::new(MemoryTenantStore::new());
        let tenant = store
            .create(Tenant {
                name: "t".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            let id = tenant.id;
            handles.push(tokio::spawn(async move {
                store.adjust_storage_used(id, 10).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let tenant = store.get(tenant.id).await.unwrap().unwrap();
        assert_eq!(tenant.storage_used, 500);
    }

    #[tokio::test]
    async fn storage_used_never_goes_negative() {
        let store = MemoryTenantStore::new();
        let tenant = store.create(Tenant::default()).await.unwrap();
        store.adjust_storage_used(tenant.id, -100).await.unwrap();
        assert_eq!(store.get(tenant.id).await.unwrap().unwrap().storage_used, 0);
    }

    #[tokio::test]
    async fn update_rotates_api_key() {
        let store = MemoryTenantStore::new();
        let tenant = store.create(Tenant::default()).await.unwrap();
        let old_key = tenant.api_key.clone();
        let updated = store.update(tenant).await.unwrap();
        assert_ne!(updated.api_key, old_key);
    }

    #[tokio::test]
    async fn find_by_hash_scopes_to_knowledge_base() {
        let store = MemoryKnowledgeStore::new();
        store
            .create(Knowledge {
                knowledge_base_id: "kb1".into(),
                file_hash: "abc".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(store.find_by_hash("kb1", "abc").await.unwrap().is_some());
        assert!(store.find_by_hash("kb2", "abc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn soft_deleted_chunks_stay_resolvable() {
        let store = MemoryChunkStore::new();
        store
            .batch_create(vec![Chunk {
                id: "c1".into(),
                knowledge_id: "k1".into(),
                chunk_index: 0,
                ..Default::default()
            }])
            .await
            .unwrap();
        store.delete("k1", "c1").await.unwrap();

        assert!(store.list_by_knowledge("k1").await.unwrap().is_empty());
        // 引用解析仍然可用
        assert!(store.get("c1").await.unwrap().unwrap().is_deleted());
    }

    #[tokio::test]
    async fn list_before_returns_newest_first_with_limit() {
        let store = MemoryMessageStore::new();
        let base = Utc::now();
        for i in 0..5 {
            store
                .create(Message {
                    session_id: "s1".into(),
                    role: MessageRole::User,
                    content: format!("m{}", i),
                    created_at: base + Duration::seconds(i),
                    ..Default::default()
                })
                .await
                .unwrap();
        }

        let result = store
            .list_before("s1", base + Duration::seconds(4), 2)
            .await
            .unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].content, "m3");
        assert_eq!(result[1].content, "m2");
    }
}
