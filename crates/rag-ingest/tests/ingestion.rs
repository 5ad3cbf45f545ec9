//! 摄取编排的端到端测试：去重、回滚补偿、级联删除、知识库复制。

use async_trait::async_trait;
use rag_core::{
    IndexInfo, IndexParams, KnowledgeBase, ParseStatus, RetrieveParams, RetrieveResult,
    RetrieverEngineParams, RetrieverEngineType, RetrieverType, Tenant,
};
use rag_error::{RagError, Result};
use rag_ingest::{KnowledgeIngestor, PlainTextDocReader};
use rag_llm::{Embedder, MockEmbedder};
use rag_pipeline::testkit::StaticResolver;
use rag_retriever::{
    HybridSearchParams, HybridSearcher, IndexService, MemoryRetrieveEngine,
    RetrieveEngine, RetrieveEngineRegistry,
};
use rag_store::{
    ChunkStore, KnowledgeStore, MemoryChunkStore, MemoryKnowledgeStore, MemoryTenantStore,
    TenantStore,
};
use std::collections::HashMap;
use std::sync::Arc;

struct BrokenEngine;

#[async_trait]
impl RetrieveEngine for BrokenEngine {
    fn engine_type(&self) -> RetrieverEngineType {
        RetrieverEngineType::Qdrant
    }

    fn support(&self) -> Vec<RetrieverType> {
        vec![RetrieverType::Vector]
    }

    async fn batch_save(&self, _: &[IndexInfo], _: &IndexParams) -> Result<()> {
        Err(RagError::VectorStore {
            operation: "batch_save".into(),
            message: "permanently broken".into(),
        })
    }

    async fn estimate_storage_size(&self, _: &[IndexInfo], _: &IndexParams) -> i64 {
        0
    }

    async fn delete_by_chunk_ids(&self, _: &[String], _: usize) -> Result<()> {
        Ok(())
    }

    async fn delete_by_knowledge_ids(&self, _: &[String], _: usize) -> Result<()> {
        Ok(())
    }

    async fn copy_indices(
        &self,
        _: &str,
        _: &HashMap<String, String>,
        _: &HashMap<String, String>,
        _: &str,
        _: usize,
    ) -> Result<()> {
        Ok(())
    }

    async fn retrieve(&self, _: RetrieveParams) -> Result<Vec<RetrieveResult>> {
        Ok(Vec::new())
    }
}

struct Fixture {
    ingestor: KnowledgeIngestor,
    tenant: Tenant,
    kb: KnowledgeBase,
    engine: Arc<MemoryRetrieveEngine>,
    registry: Arc<RetrieveEngineRegistry>,
    tenant_store: Arc<MemoryTenantStore>,
    knowledge_store: Arc<MemoryKnowledgeStore>,
    chunk_store: Arc<MemoryChunkStore>,
}

async fn fixture(with_broken_engine: bool) -> Fixture {
    let engine = Arc::new(MemoryRetrieveEngine::new());
    let mut registry = RetrieveEngineRegistry::new();
    registry.register(engine.clone()).unwrap();
    let mut engines = vec![RetrieverEngineParams {
        retriever_type: RetrieverType::Vector,
        retriever_engine_type: RetrieverEngineType::Memory,
    }];
    if with_broken_engine {
        registry.register(Arc::new(BrokenEngine)).unwrap();
        engines.push(RetrieverEngineParams {
            retriever_type: RetrieverType::Vector,
            retriever_engine_type: RetrieverEngineType::Qdrant,
        });
    }
    let registry = Arc::new(registry);

    let tenant_store = Arc::new(MemoryTenantStore::new());
    let tenant = tenant_store
        .create(Tenant {
            name: "tenant".into(),
            retriever_engines: engines,
            ..Default::default()
        })
        .await
        .unwrap();

    let knowledge_store = Arc::new(MemoryKnowledgeStore::new());
    let chunk_store = Arc::new(MemoryChunkStore::new());
    let resolver = Arc::new(StaticResolver::with_embedder(Arc::new(MockEmbedder::new(
        256,
    ))));

    let ingestor = KnowledgeIngestor::new(
        tenant_store.clone(),
        knowledge_store.clone(),
        chunk_store.clone(),
        Arc::new(IndexService::new(registry.clone())),
        resolver,
        Arc::new(PlainTextDocReader),
    );

    let kb = KnowledgeBase {
        id: "kb-src".into(),
        tenant_id: tenant.id,
        embedding_model_id: "embed-1".into(),
        summary_model_id: "chat-1".into(),
        ..Default::default()
    };

    Fixture {
        ingestor,
        tenant,
        kb,
        engine,
        registry,
        tenant_store,
        knowledge_store,
        chunk_store,
    }
}

const SAMPLE: &[u8] = b"First paragraph about stars and galaxies.\n\n\
COMET is a short-period object.\n\n\
Third paragraph about asteroid belts.";

#[tokio::test]
async fn successful_ingestion_indexes_every_chunk() {
    let f = fixture(false).await;
    let knowledge = f
        .ingestor
        .ingest_file(&f.tenant, &f.kb, "A.txt", SAMPLE, false)
        .await
        .unwrap();

    assert_eq!(knowledge.parse_status, ParseStatus::Ready);
    let chunks = f.chunk_store.list_by_knowledge(&knowledge.id).await.unwrap();
    assert!(!chunks.is_empty());
    // 每个配置引擎恰好持有 N 条索引
    assert_eq!(f.engine.entry_count().await, chunks.len());

    // chunk 链自洽
    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.chunk_index, i as i32);
        if i > 0 {
            assert_eq!(chunk.pre_chunk_id, chunks[i - 1].id);
        }
        if i + 1 < chunks.len() {
            assert_eq!(chunk.next_chunk_id, chunks[i + 1].id);
        }
    }

    // 存储计数被记入
    let tenant = f.tenant_store.get(f.tenant.id).await.unwrap().unwrap();
    assert_eq!(tenant.storage_used, SAMPLE.len() as i64);
}

#[tokio::test]
async fn duplicate_upload_is_rejected_and_leaves_indices_unchanged() {
    let f = fixture(false).await;
    f.ingestor
        .ingest_file(&f.tenant, &f.kb, "A.txt", SAMPLE, false)
        .await
        .unwrap();
    let entries_before = f.engine.entry_count().await;

    let err = f
        .ingestor
        .ingest_file(&f.tenant, &f.kb, "A.txt", SAMPLE, false)
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::Duplicate { .. }));
    assert_eq!(err.code(), "duplicate_file");

    assert_eq!(f.engine.entry_count().await, entries_before);
    assert_eq!(f.knowledge_store.list(&f.kb.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn failing_engine_rolls_back_everything() {
    let f = fixture(true).await;
    let err = f
        .ingestor
        .ingest_file(&f.tenant, &f.kb, "A.txt", SAMPLE, false)
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::VectorStore { .. }));

    // 先写成功的引擎被补偿删除
    assert_eq!(f.engine.entry_count().await, 0);

    // 状态 failed，列表里看不到半成品 chunk
    let knowledge = &f.knowledge_store.list(&f.kb.id).await.unwrap()[0];
    assert_eq!(knowledge.parse_status, ParseStatus::Failed);
    assert!(!knowledge.error_message.is_empty());
    assert!(f
        .chunk_store
        .list_by_knowledge(&knowledge.id)
        .await
        .unwrap()
        .is_empty());

    // 存储计数被退回
    let tenant = f.tenant_store.get(f.tenant.id).await.unwrap().unwrap();
    assert_eq!(tenant.storage_used, 0);
}

#[tokio::test]
async fn delete_knowledge_cascades_to_chunks_and_indices() {
    let f = fixture(false).await;
    let knowledge = f
        .ingestor
        .ingest_file(&f.tenant, &f.kb, "A.txt", SAMPLE, false)
        .await
        .unwrap();
    assert!(f.engine.entry_count().await > 0);

    f.ingestor
        .delete_knowledge(&f.tenant, &f.kb, &knowledge.id)
        .await
        .unwrap();

    assert_eq!(f.engine.entry_count().await, 0);
    assert!(f
        .chunk_store
        .list_by_knowledge(&knowledge.id)
        .await
        .unwrap()
        .is_empty());
    let tenant = f.tenant_store.get(f.tenant.id).await.unwrap().unwrap();
    assert_eq!(tenant.storage_used, 0);
}

#[tokio::test]
async fn copied_knowledge_base_answers_the_same_queries() {
    let f = fixture(false).await;
    f.ingestor
        .ingest_file(&f.tenant, &f.kb, "A.txt", SAMPLE, false)
        .await
        .unwrap();

    let dst_kb = KnowledgeBase {
        id: "kb-dst".into(),
        ..f.kb.clone()
    };
    let chunk_id_map = f
        .ingestor
        .copy_knowledge_base(&f.tenant, &f.kb, &dst_kb)
        .await
        .unwrap();
    assert!(!chunk_id_map.is_empty());

    let searcher = HybridSearcher::new(f.registry.clone());
    let embedder: Arc<dyn Embedder> = Arc::new(MockEmbedder::new(256));
    let query = |kb_id: &str| HybridSearchParams {
        query_text: "COMET is a short-period object.".into(),
        knowledge_base_id: kb_id.into(),
        vector_threshold: 0.1,
        keyword_threshold: 0.1,
        match_count: 5,
        ..Default::default()
    };

    let src_results = searcher
        .search(
            &f.tenant.retriever_engines,
            Some(embedder.clone()),
            &query("kb-src"),
        )
        .await
        .unwrap();
    let dst_results = searcher
        .search(&f.tenant.retriever_engines, Some(embedder), &query("kb-dst"))
        .await
        .unwrap();

    // 映射后 chunk 集合一致
    let mut mapped: Vec<String> = src_results
        .iter()
        .map(|r| chunk_id_map[&r.chunk_id].clone())
        .collect();
    let mut copied: Vec<String> = dst_results.iter().map(|r| r.chunk_id.clone()).collect();
    mapped.sort();
    copied.sort();
    assert_eq!(mapped, copied);
}
