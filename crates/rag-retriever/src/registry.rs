use rag_core::{IndexInfo, IndexParams, RetrieverEngineParams, RetrieverEngineType, RetrieverType};
use rag_error::{RagError, Result};
use rag_llm::Embedder;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::RetrieveEngine;

/// 进程级引擎注册表。启动阶段按 RETRIEVE_DRIVER 注册驱动，
/// 之后只读。
#[derive(Default)]
pub struct RetrieveEngineRegistry {
    engines: HashMap<RetrieverEngineType, Arc<dyn RetrieveEngine>>,
}

impl RetrieveEngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, engine: Arc<dyn RetrieveEngine>) -> Result<()> {
        let engine_type = engine.engine_type();
        if self.engines.contains_key(&engine_type) {
            return Err(RagError::Configuration {
                key: "retrieve_driver".into(),
                reason: format!("engine {} registered twice", engine_type.as_str()),
            });
        }
        info!(engine = engine_type.as_str(), "registered retrieve engine");
        self.engines.insert(engine_type, engine);
        Ok(())
    }

    pub fn get(&self, engine_type: RetrieverEngineType) -> Result<Arc<dyn RetrieveEngine>> {
        self.engines
            .get(&engine_type)
            .cloned()
            .ok_or_else(|| RagError::Configuration {
                key: "retrieve_driver".into(),
                reason: format!("engine {} is not registered", engine_type.as_str()),
            })
    }

    pub fn all(&self) -> Vec<Arc<dyn RetrieveEngine>> {
        self.engines.values().cloned().collect()
    }

    /// 按逗号分隔的驱动列表初始化，例如 "memory,qdrant"
    pub fn from_drivers(drivers: &str, qdrant_url: Option<&str>) -> Result<Self> {
        let mut registry = Self::new();
        for driver in drivers.split(',').filter(|s| !s.trim().is_empty()) {
            let engine_type =
                RetrieverEngineType::parse(driver).ok_or_else(|| RagError::Configuration {
                    key: "RETRIEVE_DRIVER".into(),
                    reason: format!("unknown driver {}", driver),
                })?;
            match engine_type {
                RetrieverEngineType::Memory => {
                    registry.register(Arc::new(crate::MemoryRetrieveEngine::new()))?;
                }
                RetrieverEngineType::Qdrant => {
                    let url = qdrant_url.ok_or_else(|| RagError::Configuration {
                        key: "QDRANT_URL".into(),
                        reason: "qdrant driver requires QDRANT_URL".into(),
                    })?;
                    registry.register(Arc::new(crate::QdrantRetrieveEngine::new(
                        url, "rag_index",
                    )?))?;
                }
            }
        }
        Ok(registry)
    }
}

/// 跨引擎写入服务。向所有配置引擎扇出索引，
/// 任一引擎失败即对已写入引擎做补偿删除后上抛。
pub struct IndexService {
    registry: Arc<RetrieveEngineRegistry>,
}

impl IndexService {
    pub fn new(registry: Arc<RetrieveEngineRegistry>) -> Self {
        Self { registry }
    }

    /// 按引擎归并 (检索方式, 引擎) 组合，保持首次出现的顺序
    fn group_by_engine(
        engines: &[RetrieverEngineParams],
    ) -> Vec<(RetrieverEngineType, Vec<RetrieverType>)> {
        let mut grouped: Vec<(RetrieverEngineType, Vec<RetrieverType>)> = Vec::new();
        for params in engines {
            match grouped
                .iter_mut()
                .find(|(t, _)| *t == params.retriever_engine_type)
            {
                Some((_, types)) => {
                    if !types.contains(&params.retriever_type) {
                        types.push(params.retriever_type);
                    }
                }
                None => grouped.push((params.retriever_engine_type, vec![params.retriever_type])),
            }
        }
        grouped
    }

    #[instrument(skip_all, fields(batch = infos.len()))]
    pub async fn batch_index(
        &self,
        embedder: Option<Arc<dyn Embedder>>,
        engines: &[RetrieverEngineParams],
        infos: &[IndexInfo],
    ) -> Result<()> {
        if infos.is_empty() || engines.is_empty() {
            return Ok(());
        }
        let grouped = Self::group_by_engine(engines);

        let needs_vectors = engines
            .iter()
            .any(|p| p.retriever_type == RetrieverType::Vector);
        let (embeddings, dimension) = if needs_vectors {
            let embedder = embedder.ok_or(RagError::Configuration {
                key: "embedding_model_id".into(),
                reason: "vector engines configured but no embedder provided".into(),
            })?;
            let texts: Vec<String> = infos.iter().map(|i| i.content.clone()).collect();
            let vectors = embedder.embed_batch(&texts).await?;
            let mut map = HashMap::with_capacity(infos.len());
            for (info, vector) in infos.iter().zip(vectors) {
                map.insert(info.chunk_id.clone(), vector);
            }
            (map, embedder.dimensions())
        } else {
            (HashMap::new(), 0)
        };

        let chunk_ids: Vec<String> = infos.iter().map(|i| i.chunk_id.clone()).collect();
        let mut written: Vec<Arc<dyn RetrieveEngine>> = Vec::new();

        for (engine_type, retriever_types) in grouped {
            let engine = self.registry.get(engine_type)?;
            let supported: Vec<RetrieverType> = retriever_types
                .into_iter()
                .filter(|t| engine.support().contains(t))
                .collect();
            if supported.is_empty() {
                continue;
            }
            let params = IndexParams {
                retriever_types: supported,
                embeddings: embeddings.clone(),
                dimension,
            };
            if let Err(err) = engine.batch_save(infos, &params).await {
                error!(
                    engine = engine_type.as_str(),
                    error = %err,
                    "batch index failed, rolling back prior engines"
                );
                self.rollback(&written, &chunk_ids, dimension).await;
                return Err(err);
            }
            written.push(engine);
        }
        Ok(())
    }

    /// 对已写入引擎做尽力而为的补偿删除
    async fn rollback(
        &self,
        written: &[Arc<dyn RetrieveEngine>],
        chunk_ids: &[String],
        dimension: usize,
    ) {
        for engine in written {
            if let Err(err) = engine.delete_by_chunk_ids(chunk_ids, dimension).await {
                warn!(
                    engine = engine.engine_type().as_str(),
                    error = %err,
                    "compensating delete failed"
                );
            }
        }
    }

    pub async fn delete_by_knowledge_ids(
        &self,
        engines: &[RetrieverEngineParams],
        knowledge_ids: &[String],
        dimension: usize,
    ) -> Result<()> {
        let mut first_err = None;
        for (engine_type, _) in Self::group_by_engine(engines) {
            let engine = self.registry.get(engine_type)?;
            if let Err(err) = engine.delete_by_knowledge_ids(knowledge_ids, dimension).await {
                warn!(engine = engine_type.as_str(), error = %err, "delete by knowledge failed");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub async fn delete_by_chunk_ids(
        &self,
        engines: &[RetrieverEngineParams],
        chunk_ids: &[String],
        dimension: usize,
    ) -> Result<()> {
        let mut first_err = None;
        for (engine_type, _) in Self::group_by_engine(engines) {
            let engine = self.registry.get(engine_type)?;
            if let Err(err) = engine.delete_by_chunk_ids(chunk_ids, dimension).await {
                warn!(engine = engine_type.as_str(), error = %err, "delete by chunk failed");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub async fn copy_indices(
        &self,
        engines: &[RetrieverEngineParams],
        source_kb_id: &str,
        kb_id_map: &HashMap<String, String>,
        chunk_id_map: &HashMap<String, String>,
        target_kb_id: &str,
        dimension: usize,
    ) -> Result<()> {
        for (engine_type, _) in Self::group_by_engine(engines) {
            let engine = self.registry.get(engine_type)?;
            engine
                .copy_indices(source_kb_id, kb_id_map, chunk_id_map, target_kb_id, dimension)
                .await?;
        }
        Ok(())
    }

    pub async fn estimate_storage_size(
        &self,
        engines: &[RetrieverEngineParams],
        infos: &[IndexInfo],
        params: &IndexParams,
    ) -> i64 {
        let mut total = 0;
        for (engine_type, _) in Self::group_by_engine(engines) {
            if let Ok(engine) = self.registry.get(engine_type) {
                total += engine.estimate_storage_size(infos, params).await;
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryRetrieveEngine;
    use async_trait::async_trait;
    use rag_core::{RetrieveParams, RetrieveResult};
    use rag_llm::MockEmbedder;

    /// 写入永久失败的引擎，用于验证补偿删除
    struct BrokenEngine;

    #[async_trait]
    impl RetrieveEngine for BrokenEngine {
        fn engine_type(&self) -> RetrieverEngineType {
            RetrieverEngineType::Qdrant
        }

        fn support(&self) -> Vec<RetrieverType> {
            vec![RetrieverType::Vector]
        }

        async fn batch_save(&self, _infos: &[IndexInfo], _params: &IndexParams) -> Result<()> {
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

    fn pairs(list: &[(RetrieverType, RetrieverEngineType)]) -> Vec<RetrieverEngineParams> {
        list.iter()
            .map(|(rt, et)| RetrieverEngineParams {
                retriever_type: *rt,
                retriever_engine_type: *et,
            })
            .collect()
    }

    fn infos() -> Vec<IndexInfo> {
        vec![
            IndexInfo {
                chunk_id: "c1".into(),
                knowledge_id: "k1".into(),
                knowledge_base_id: "kb1".into(),
                content: "alpha beta gamma".into(),
                chunk_index: 0,
                image_info: None,
            },
            IndexInfo {
                chunk_id: "c2".into(),
                knowledge_id: "k1".into(),
                knowledge_base_id: "kb1".into(),
                content: "delta epsilon zeta".into(),
                chunk_index: 1,
                image_info: None,
            },
        ]
    }

    #[tokio::test]
    async fn fan_out_writes_every_engine() {
        let memory = Arc::new(MemoryRetrieveEngine::new());
        let mut registry = RetrieveEngineRegistry::new();
        registry.register(memory.clone()).unwrap();
        let service = IndexService::new(Arc::new(registry));

        let embedder = Arc::new(MockEmbedder::new(32));
        service
            .batch_index(
                Some(embedder),
                &pairs(&[
                    (RetrieverType::Vector, RetrieverEngineType::Memory),
                    (RetrieverType::Keyword, RetrieverEngineType::Memory),
                ]),
                &infos(),
            )
            .await
            .unwrap();
        assert_eq!(memory.entry_count().await, 2);
    }

    #[tokio::test]
    async fn failed_engine_triggers_compensating_delete() {
        let memory = Arc::new(MemoryRetrieveEngine::new());
        let mut registry = RetrieveEngineRegistry::new();
        registry.register(memory.clone()).unwrap();
        registry.register(Arc::new(BrokenEngine)).unwrap();
        let service = IndexService::new(Arc::new(registry));

        let embedder = Arc::new(MockEmbedder::new(32));
        let result = service
            .batch_index(
                Some(embedder),
                &pairs(&[
                    (RetrieverType::Vector, RetrieverEngineType::Memory),
                    (RetrieverType::Vector, RetrieverEngineType::Qdrant),
                ]),
                &infos(),
            )
            .await;
        assert!(result.is_err());
        // 先写成功的 memory 引擎被回滚
        assert_eq!(memory.entry_count().await, 0);
    }

    #[tokio::test]
    async fn duplicate_registration_rejected() {
        let mut registry = RetrieveEngineRegistry::new();
        registry
            .register(Arc::new(MemoryRetrieveEngine::new()))
            .unwrap();
        assert!(registry
            .register(Arc::new(MemoryRetrieveEngine::new()))
            .is_err());
    }

    #[tokio::test]
    async fn vector_engines_require_embedder() {
        let mut registry = RetrieveEngineRegistry::new();
        registry
            .register(Arc::new(MemoryRetrieveEngine::new()))
            .unwrap();
        let service = IndexService::new(Arc::new(registry));
        let result = service
            .batch_index(
                None,
                &pairs(&[(RetrieverType::Vector, RetrieverEngineType::Memory)]),
                &infos(),
            )
            .await;
        assert!(matches!(result, Err(RagError::Configuration { .. })));
    }
}
