use futures::future::join_all;
use rag_core::{
    Chunk, ChunkType, IndexInfo, Knowledge, KnowledgeBase, KnowledgeType, ParseStatus,
    RetrieverType, Tenant,
};
use rag_error::{RagError, Result};
use rag_llm::ModelResolver;
use rag_retriever::IndexService;
use rag_store::{ChunkStore, KnowledgeStore, TenantStore};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::docreader::{DocChunk, DocReader, ReadConfig};

const EMBED_BATCH_SIZE: usize = 16;
/// 批量向量化的并发上限
const EMBED_CONCURRENCY: usize = 4;

/// 知识摄取编排：DocReader -> 向量化 -> 多引擎索引。
/// 中途失败触发补偿删除，不留半成品。
pub struct KnowledgeIngestor {
    tenant_store: Arc<dyn TenantStore>,
    knowledge_store: Arc<dyn KnowledgeStore>,
    chunk_store: Arc<dyn ChunkStore>,
    index_service: Arc<IndexService>,
    resolver: Arc<dyn ModelResolver>,
    doc_reader: Arc<dyn DocReader>,
}

impl KnowledgeIngestor {
    pub fn new(
        tenant_store: Arc<dyn TenantStore>,
        knowledge_store: Arc<dyn KnowledgeStore>,
        chunk_store: Arc<dyn ChunkStore>,
        index_service: Arc<IndexService>,
        resolver: Arc<dyn ModelResolver>,
        doc_reader: Arc<dyn DocReader>,
    ) -> Self {
        Self {
            tenant_store,
            knowledge_store,
            chunk_store,
            index_service,
            resolver,
            doc_reader,
        }
    }

    fn content_hash(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        format!("{:x}", hasher.finalize())
    }

    fn read_config(kb: &KnowledgeBase, enable_multimodal: bool) -> ReadConfig {
        let chunking = kb.chunking_config.clone().unwrap_or_default();
        ReadConfig {
            enable_multimodal: enable_multimodal && chunking.enable_multimodal,
            chunking,
            vlm_model_id: kb.vlm_model_id.clone(),
            storage: kb.storage_config.clone(),
        }
    }

    async fn dimension_for(&self, kb: &KnowledgeBase) -> usize {
        match self.resolver.embedder(&kb.embedding_model_id).await {
            Ok(embedder) => embedder.dimensions(),
            Err(_) => 0,
        }
    }

    /// 摄取一个上传文件。知识库内按内容哈希去重。
    #[instrument(skip(self, tenant, kb, data), fields(kb = %kb.id, file = %file_name))]
    pub async fn ingest_file(
        &self,
        tenant: &Tenant,
        kb: &KnowledgeBase,
        file_name: &str,
        data: &[u8],
        enable_multimodal: bool,
    ) -> Result<Knowledge> {
        let config = Self::read_config(kb, enable_multimodal);
        config.chunking.validate()?;

        let file_hash = Self::content_hash(data);
        if let Some(existing) = self
            .knowledge_store
            .find_by_hash(&kb.id, &file_hash)
            .await?
        {
            return Err(RagError::Duplicate {
                resource: "knowledge".into(),
                details: format!("content already ingested as {}", existing.id),
            });
        }

        let knowledge = self
            .knowledge_store
            .create(Knowledge {
                tenant_id: tenant.id,
                knowledge_base_id: kb.id.clone(),
                knowledge_type: KnowledgeType::File,
                title: file_name.to_string(),
                source: file_name.to_string(),
                file_name: file_name.to_string(),
                file_type: file_name.rsplit('.').next().unwrap_or_default().to_string(),
                file_size: data.len() as i64,
                file_hash,
                parse_status: ParseStatus::Pending,
                enable_status: true,
                embedding_model_id: kb.embedding_model_id.clone(),
                ..Default::default()
            })
            .await?;

        if let Err(err) = self
            .tenant_store
            .adjust_storage_used(tenant.id, data.len() as i64)
            .await
        {
            self.knowledge_store.delete(&knowledge.id).await?;
            return Err(err);
        }

        let doc_chunks = match self.doc_reader.read_from_file(file_name, data, &config).await {
            Ok(chunks) => chunks,
            Err(err) => {
                self.mark_failed(tenant, kb, &knowledge, &err).await;
                return Err(err);
            }
        };
        self.finish_ingestion(tenant, kb, knowledge, doc_chunks).await
    }

    /// 摄取一个 URL。内容哈希取解析结果的拼接文本。
    #[instrument(skip(self, tenant, kb), fields(kb = %kb.id, url = %url))]
    pub async fn ingest_url(
        &self,
        tenant: &Tenant,
        kb: &KnowledgeBase,
        url: &str,
        enable_multimodal: bool,
    ) -> Result<Knowledge> {
        let config = Self::read_config(kb, enable_multimodal);
        config.chunking.validate()?;

        let doc_chunks = self.doc_reader.read_from_url(url, &config).await?;
        let joined: String = doc_chunks
            .iter()
            .map(|c| c.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let file_hash = Self::content_hash(joined.as_bytes());
        if let Some(existing) = self
            .knowledge_store
            .find_by_hash(&kb.id, &file_hash)
            .await?
        {
            return Err(RagError::Duplicate {
                resource: "knowledge".into(),
                details: format!("content already ingested as {}", existing.id),
            });
        }

        let knowledge = self
            .knowledge_store
            .create(Knowledge {
                tenant_id: tenant.id,
                knowledge_base_id: kb.id.clone(),
                knowledge_type: KnowledgeType::Url,
                title: url.to_string(),
                source: url.to_string(),
                file_size: joined.len() as i64,
                file_hash,
                parse_status: ParseStatus::Pending,
                enable_status: true,
                embedding_model_id: kb.embedding_model_id.clone(),
                ..Default::default()
            })
            .await?;

        if let Err(err) = self
            .tenant_store
            .adjust_storage_used(tenant.id, joined.len() as i64)
            .await
        {
            self.knowledge_store.delete(&knowledge.id).await?;
            return Err(err);
        }
        self.finish_ingestion(tenant, kb, knowledge, doc_chunks).await
    }

    async fn finish_ingestion(
        &self,
        tenant: &Tenant,
        kb: &KnowledgeBase,
        mut knowledge: Knowledge,
        doc_chunks: Vec<DocChunk>,
    ) -> Result<Knowledge> {
        knowledge.parse_status = ParseStatus::Processing;
        knowledge = self.knowledge_store.update(knowledge).await?;

        match self.index_chunks(tenant, kb, &knowledge, doc_chunks).await {
            Ok(count) => {
                knowledge.parse_status = ParseStatus::Ready;
                knowledge = self.knowledge_store.update(knowledge).await?;
                info!(knowledge = %knowledge.id, chunks = count, "knowledge ingested");
                Ok(knowledge)
            }
            Err(err) => {
                self.mark_failed(tenant, kb, &knowledge, &err).await;
                Err(err)
            }
        }
    }

    /// 建 chunk 链、落库，再按批向量化并扇出到全部引擎
    async fn index_chunks(
        &self,
        tenant: &Tenant,
        kb: &KnowledgeBase,
        knowledge: &Knowledge,
        doc_chunks: Vec<DocChunk>,
    ) -> Result<usize> {
        if doc_chunks.is_empty() {
            return Ok(0);
        }
        let ids: Vec<String> = doc_chunks
            .iter()
            .map(|_| Uuid::new_v4().to_string())
            .collect();

        let mut chunks = Vec::with_capacity(doc_chunks.len());
        for (i, doc_chunk) in doc_chunks.iter().enumerate() {
            let image_info = if doc_chunk.images.is_empty() {
                String::new()
            } else {
                serde_json::to_string(&doc_chunk.images)?
            };
            chunks.push(Chunk {
                id: ids[i].clone(),
                tenant_id: tenant.id,
                knowledge_id: knowledge.id.clone(),
                knowledge_base_id: kb.id.clone(),
                content: doc_chunk.content.clone(),
                chunk_index: i as i32,
                is_enabled: true,
                start_at: doc_chunk.start_at,
                end_at: doc_chunk.end_at,
                pre_chunk_id: if i > 0 { ids[i - 1].clone() } else { String::new() },
                next_chunk_id: ids.get(i + 1).cloned().unwrap_or_default(),
                chunk_type: ChunkType::Text,
                ..Default::default()
            });
        }
        self.chunk_store.batch_create(chunks.clone()).await?;

        let needs_embedder = tenant
            .retriever_engines
            .iter()
            .any(|p| p.retriever_type == RetrieverType::Vector);
        let embedder = if needs_embedder {
            Some(self.resolver.embedder(&kb.embedding_model_id).await?)
        } else {
            None
        };

        let semaphore = Arc::new(Semaphore::new(EMBED_CONCURRENCY));
        let tasks = chunks.chunks(EMBED_BATCH_SIZE).map(|batch| {
            let infos: Vec<IndexInfo> = batch
                .iter()
                .map(|chunk| IndexInfo {
                    chunk_id: chunk.id.clone(),
                    knowledge_id: chunk.knowledge_id.clone(),
                    knowledge_base_id: chunk.knowledge_base_id.clone(),
                    content: chunk.content.clone(),
                    chunk_index: chunk.chunk_index,
                    image_info: (!chunk.image_info.is_empty())
                        .then(|| chunk.image_info.clone()),
                })
                .collect();
            let semaphore = semaphore.clone();
            let embedder = embedder.clone();
            let engines = tenant.retriever_engines.clone();
            async move {
                let _permit = semaphore.acquire().await.map_err(|e| RagError::Concurrency {
                    operation: "embed_semaphore".into(),
                    message: e.to_string(),
                })?;
                self.index_service
                    .batch_index(embedder, &engines, &infos)
                    .await
            }
        });

        for outcome in join_all(tasks).await {
            outcome?;
        }
        Ok(chunks.len())
    }

    /// 失败补偿：删 chunk、清各引擎索引、退存储、标记失败
    async fn mark_failed(
        &self,
        tenant: &Tenant,
        kb: &KnowledgeBase,
        knowledge: &Knowledge,
        err: &RagError,
    ) {
        error!(knowledge = %knowledge.id, error = %err, "ingestion failed, compensating");

        if let Err(e) = self.chunk_store.delete_by_knowledge(&knowledge.id).await {
            warn!(error = %e, "failed to remove chunks during compensation");
        }
        let dimension = self.dimension_for(kb).await;
        if let Err(e) = self
            .index_service
            .delete_by_knowledge_ids(
                &tenant.retriever_engines,
                &[knowledge.id.clone()],
                dimension,
            )
            .await
        {
            warn!(error = %e, "failed to remove index entries during compensation");
        }
        if let Err(e) = self
            .tenant_store
            .adjust_storage_used(tenant.id, -knowledge.file_size)
            .await
        {
            warn!(error = %e, "failed to refund storage during compensation");
        }

        let mut failed = knowledge.clone();
        failed.parse_status = ParseStatus::Failed;
        failed.error_message = err.to_string();
        if let Err(e) = self.knowledge_store.update(failed).await {
            warn!(error = %e, "failed to mark knowledge as failed");
        }
    }

    /// 删除知识：chunk、索引、存储计数级联
    #[instrument(skip(self, tenant, kb))]
    pub async fn delete_knowledge(
        &self,
        tenant: &Tenant,
        kb: &KnowledgeBase,
        knowledge_id: &str,
    ) -> Result<()> {
        let knowledge = self
            .knowledge_store
            .get(knowledge_id)
            .await?
            .ok_or_else(|| RagError::NotFound {
                resource: format!("knowledge {}", knowledge_id),
            })?;

        self.chunk_store.delete_by_knowledge(knowledge_id).await?;
        let dimension = self.dimension_for(kb).await;
        self.index_service
            .delete_by_knowledge_ids(
                &tenant.retriever_engines,
                &[knowledge_id.to_string()],
                dimension,
            )
            .await?;
        self.tenant_store
            .adjust_storage_used(tenant.id, -knowledge.file_size)
            .await?;
        self.knowledge_store.delete(knowledge_id).await?;
        Ok(())
    }

    /// 知识库复制：克隆知识与 chunk 记录，索引载荷按 id 映射
    /// 复制，不重新计算向量。
    #[instrument(skip(self, tenant, src_kb, dst_kb), fields(src = %src_kb.id, dst = %dst_kb.id))]
    pub async fn copy_knowledge_base(
        &self,
        tenant: &Tenant,
        src_kb: &KnowledgeBase,
        dst_kb: &KnowledgeBase,
    ) -> Result<HashMap<String, String>> {
        let mut chunk_id_map: HashMap<String, String> = HashMap::new();
        let mut total_size = 0i64;

        for knowledge in self.knowledge_store.list(&src_kb.id).await? {
            let new_knowledge = self
                .knowledge_store
                .create(Knowledge {
                    id: String::new(),
                    knowledge_base_id: dst_kb.id.clone(),
                    ..knowledge.clone()
                })
                .await?;
            total_size += knowledge.file_size;

            let chunks = self.chunk_store.list_by_knowledge(&knowledge.id).await?;
            for chunk in &chunks {
                chunk_id_map.insert(chunk.id.clone(), Uuid::new_v4().to_string());
            }
            let copies: Vec<Chunk> = chunks
                .into_iter()
                .map(|chunk| Chunk {
                    id: chunk_id_map[&chunk.id].clone(),
                    knowledge_id: new_knowledge.id.clone(),
                    knowledge_base_id: dst_kb.id.clone(),
                    pre_chunk_id: chunk_id_map
                        .get(&chunk.pre_chunk_id)
                        .cloned()
                        .unwrap_or_default(),
                    next_chunk_id: chunk_id_map
                        .get(&chunk.next_chunk_id)
                        .cloned()
                        .unwrap_or_default(),
                    ..chunk
                })
                .collect();
            self.chunk_store.batch_create(copies).await?;
        }

        let kb_id_map = HashMap::from([(src_kb.id.clone(), dst_kb.id.clone())]);
        let dimension = self.dimension_for(src_kb).await;
        self.index_service
            .copy_indices(
                &tenant.retriever_engines,
                &src_kb.id,
                &kb_id_map,
                &chunk_id_map,
                &dst_kb.id,
                dimension,
            )
            .await?;

        self.tenant_store
            .adjust_storage_used(tenant.id, total_size)
            .await?;
        Ok(chunk_id_map)
    }
}
