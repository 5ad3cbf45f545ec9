use futures::future::join_all;
use rag_core::{
    MatchType, RetrieveParams, RetrieveResult, RetrieverEngineParams, RetrieverType,
};
use rag_error::{RagError, Result};
use rag_llm::Embedder;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::registry::RetrieveEngineRegistry;

/// RRF 融合常数
pub const RRF_K: f64 = 60.0;
/// 每个引擎召回 match_count 的倍数，供融合阶段筛选
const K_OVER: usize = 3;
const RETRIEVE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Default)]
pub struct HybridSearchParams {
    pub query_text: String,
    /// 预计算的查询向量；为空且存在向量引擎时由 searcher 计算一次
    pub query_embedding: Option<Vec<f32>>,
    pub knowledge_base_id: String,
    pub vector_threshold: f64,
    pub keyword_threshold: f64,
    pub match_count: usize,
}

/// 混合检索协调器：并行查询所有配置的 (检索方式, 引擎) 组合，
/// 分数归一化后按 RRF 融合。
pub struct HybridSearcher {
    registry: Arc<RetrieveEngineRegistry>,
}

/// 单引擎的一次命中，携带引擎内排名
struct EngineHit {
    result: RetrieveResult,
    pair_index: usize,
    rank: usize,
    normalized_score: f64,
}

impl HybridSearcher {
    pub fn new(registry: Arc<RetrieveEngineRegistry>) -> Self {
        Self { registry }
    }

    #[instrument(skip_all, fields(kb = %params.knowledge_base_id, match_count = params.match_count))]
    pub async fn search(
        &self,
        engines: &[RetrieverEngineParams],
        embedder: Option<Arc<dyn Embedder>>,
        params: &HybridSearchParams,
    ) -> Result<Vec<RetrieveResult>> {
        if params.match_count == 0 || engines.is_empty() {
            return Ok(Vec::new());
        }

        // 向量引擎参与时只计算一次查询向量并复用
        let has_vector = engines
            .iter()
            .any(|p| p.retriever_type == RetrieverType::Vector);
        let query_embedding = match (&params.query_embedding, has_vector) {
            (Some(v), _) => Some(v.clone()),
            (None, true) => {
                let embedder = embedder.ok_or(RagError::Configuration {
                    key: "embedding_model_id".into(),
                    reason: "vector retriever configured but no embedder available".into(),
                })?;
                Some(embedder.embed(&params.query_text).await?)
            }
            (None, false) => None,
        };

        let per_engine_top_k = params.match_count * K_OVER;
        let tasks = engines.iter().enumerate().map(|(pair_index, pair)| {
            let registry = self.registry.clone();
            let query_embedding = query_embedding.clone();
            let params = params.clone();
            let pair = *pair;
            async move {
                let engine = registry.get(pair.retriever_engine_type)?;
                if !engine.support().contains(&pair.retriever_type) {
                    return Err(RagError::Configuration {
                        key: "retriever_engines".into(),
                        reason: format!(
                            "engine {} does not support {:?}",
                            pair.retriever_engine_type.as_str(),
                            pair.retriever_type
                        ),
                    });
                }
                let threshold = match pair.retriever_type {
                    RetrieverType::Vector => params.vector_threshold,
                    RetrieverType::Keyword => params.keyword_threshold,
                };
                let retrieve_params = RetrieveParams {
                    query: params.query_text.clone(),
                    query_embedding: (pair.retriever_type == RetrieverType::Vector)
                        .then_some(query_embedding)
                        .flatten(),
                    knowledge_base_ids: vec![params.knowledge_base_id.clone()],
                    top_k: per_engine_top_k,
                    threshold,
                    retriever_type: Some(pair.retriever_type),
                };
                match tokio::time::timeout(RETRIEVE_TIMEOUT, engine.retrieve(retrieve_params)).await
                {
                    Ok(result) => result.map(|r| (pair_index, pair, r)),
                    Err(_) => Err(RagError::Timeout {
                        operation: format!("retrieve:{}", pair.retriever_engine_type.as_str()),
                        timeout_ms: RETRIEVE_TIMEOUT.as_millis() as u64,
                    }),
                }
            }
        });

        let outcomes = join_all(tasks).await;
        let mut hits_per_pair: Vec<(usize, RetrieverEngineParams, Vec<RetrieveResult>)> =
            Vec::new();
        let mut errors = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(hit) => hits_per_pair.push(hit),
                Err(err) => {
                    warn!(error = %err, "retrieve engine failed, continuing with the rest");
                    errors.push(err);
                }
            }
        }
        // 全部失败才算检索失败；部分成功继续融合
        if hits_per_pair.is_empty() {
            if !errors.is_empty() {
                return Err(RagError::RetrievalFailed {
                    message: format!("{} engines failed", errors.len()),
                });
            }
            return Ok(Vec::new());
        }

        Ok(Self::fuse(hits_per_pair, params.match_count))
    }

    /// min-max 归一化（引擎内）后 RRF 融合，并列时先比最高单引擎
    /// 归一化分，再按 chunk_id 升序
    fn fuse(
        hits_per_pair: Vec<(usize, RetrieverEngineParams, Vec<RetrieveResult>)>,
        match_count: usize,
    ) -> Vec<RetrieveResult> {
        let mut all_hits: Vec<(RetrieverEngineParams, EngineHit)> = Vec::new();
        for (pair_index, pair, results) in hits_per_pair {
            if results.is_empty() {
                continue;
            }
            let min = results.iter().map(|r| r.score).fold(f64::INFINITY, f64::min);
            let max = results
                .iter()
                .map(|r| r.score)
                .fold(f64::NEG_INFINITY, f64::max);
            let range = max - min;
            for (rank, result) in results.into_iter().enumerate() {
                let normalized_score = if range > 0.0 {
                    (result.score - min) / range
                } else {
                    1.0
                };
                all_hits.push((
                    pair,
                    EngineHit {
                        result,
                        pair_index,
                        rank: rank + 1,
                        normalized_score,
                    },
                ));
            }
        }

        struct Fused {
            result: RetrieveResult,
            fused_score: f64,
            best_normalized: f64,
            best_raw: f64,
            contributors: Vec<usize>,
            first_type: RetrieverType,
        }

        let mut fused: HashMap<String, Fused> = HashMap::new();
        for (pair, hit) in all_hits {
            let contribution = 1.0 / (RRF_K + hit.rank as f64);
            let entry = fused
                .entry(hit.result.chunk_id.clone())
                .or_insert_with(|| Fused {
                    result: hit.result.clone(),
                    fused_score: 0.0,
                    best_normalized: 0.0,
                    best_raw: f64::NEG_INFINITY,
                    contributors: Vec::new(),
                    first_type: pair.retriever_type,
                });
            entry.fused_score += contribution;
            if hit.normalized_score > entry.best_normalized {
                entry.best_normalized = hit.normalized_score;
            }
            // 快照保留原始得分最高的那个引擎的版本
            if hit.result.score > entry.best_raw {
                entry.best_raw = hit.result.score;
                entry.result = hit.result;
            }
            if !entry.contributors.contains(&hit.pair_index) {
                entry.contributors.push(hit.pair_index);
            }
        }

        let mut candidates: Vec<Fused> = fused.into_values().collect();
        candidates.sort_by(|a, b| {
            b.fused_score
                .partial_cmp(&a.fused_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(
                    b.best_normalized
                        .partial_cmp(&a.best_normalized)
                        .unwrap_or(std::cmp::Ordering::Equal),
                )
                .then_with(|| a.result.chunk_id.cmp(&b.result.chunk_id))
        });
        candidates.truncate(match_count);

        let total = candidates.len();
        let results: Vec<RetrieveResult> = candidates
            .into_iter()
            .map(|c| {
                let mut result = c.result;
                result.score = c.fused_score;
                result.match_type = if c.contributors.len() > 1 {
                    MatchType::Hybrid
                } else {
                    c.first_type.into()
                };
                result
            })
            .collect();
        debug!(total, "hybrid fusion complete");
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryRetrieveEngine, RetrieveEngine};
    use async_trait::async_trait;
    use rag_core::{IndexInfo, IndexParams, RetrieverEngineType};
    use rag_llm::{Embedder, MockEmbedder};

    /// 返回固定结果的向量引擎桩，注册为 qdrant 类型
    struct StubEngine {
        results: Vec<RetrieveResult>,
        fail: bool,
    }

    #[async_trait]
    impl RetrieveEngine for StubEngine {
        fn engine_type(&self) -> RetrieverEngineType {
            RetrieverEngineType::Qdrant
        }

        fn support(&self) -> Vec<RetrieverType> {
            vec![RetrieverType::Vector]
        }

        async fn batch_save(&self, _: &[IndexInfo], _: &IndexParams) -> Result<()> {
            Ok(())
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
            if self.fail {
                return Err(RagError::VectorStore {
                    operation: "retrieve".into(),
                    message: "down".into(),
                });
            }
            Ok(self.results.clone())
        }
    }

    fn hit(chunk_id: &str, score: f64) -> RetrieveResult {
        RetrieveResult {
            chunk_id: chunk_id.into(),
            knowledge_id: "k1".into(),
            knowledge_base_id: "kb1".into(),
            content: format!("content of {}", chunk_id),
            chunk_index: 0,
            score,
            match_type: MatchType::Vector,
            image_info: None,
        }
    }

    fn pair(rt: RetrieverType, et: RetrieverEngineType) -> RetrieverEngineParams {
        RetrieverEngineParams {
            retriever_type: rt,
            retriever_engine_type: et,
        }
    }

    async fn seeded_memory(embedder: &MockEmbedder) -> Arc<MemoryRetrieveEngine> {
        let engine = Arc::new(MemoryRetrieveEngine::new());
        let infos = vec![
            IndexInfo {
                chunk_id: "shared".into(),
                knowledge_id: "k1".into(),
                knowledge_base_id: "kb1".into(),
                content: "comets are icy visitors from deep space".into(),
                chunk_index: 0,
                image_info: None,
            },
            IndexInfo {
                chunk_id: "mem-only".into(),
                knowledge_id: "k1".into(),
                knowledge_base_id: "kb1".into(),
                content: "asteroids orbit mostly between mars and jupiter".into(),
                chunk_index: 1,
                image_info: None,
            },
        ];
        let texts: Vec<String> = infos.iter().map(|i| i.content.clone()).collect();
        let vectors = embedder.embed_batch(&texts).await.unwrap();
        let mut params = IndexParams {
            retriever_types: vec![RetrieverType::Vector, RetrieverType::Keyword],
            dimension: embedder.dimensions(),
            ..Default::default()
        };
        for (i, v) in vectors.into_iter().enumerate() {
            params.embeddings.insert(infos[i].chunk_id.clone(), v);
        }
        engine.batch_save(&infos, &params).await.unwrap();
        engine
    }

    #[tokio::test]
    async fn match_count_zero_returns_empty() {
        let registry = Arc::new(RetrieveEngineRegistry::new());
        let searcher = HybridSearcher::new(registry);
        let results = searcher
            .search(
                &[pair(RetrieverType::Keyword, RetrieverEngineType::Memory)],
                None,
                &HybridSearchParams {
                    query_text: "anything".into(),
                    knowledge_base_id: "kb1".into(),
                    match_count: 0,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn single_engine_keeps_its_match_type() {
        let embedder = MockEmbedder::new(64);
        let memory = seeded_memory(&embedder).await;
        let mut registry = RetrieveEngineRegistry::new();
        registry.register(memory).unwrap();
        let searcher = HybridSearcher::new(Arc::new(registry));

        let results = searcher
            .search(
                &[pair(RetrieverType::Vector, RetrieverEngineType::Memory)],
                Some(Arc::new(MockEmbedder::new(64))),
                &HybridSearchParams {
                    query_text: "comets are icy visitors from deep space".into(),
                    knowledge_base_id: "kb1".into(),
                    vector_threshold: 0.1,
                    keyword_threshold: 0.0,
                    match_count: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_id, "shared");
        assert_eq!(results[0].match_type, MatchType::Vector);
    }

    #[tokio::test]
    async fn rrf_fusion_orders_shared_chunk_first_then_tie_breaks() {
        // memory（向量+关键词能力，此处只用向量）返回 shared(rank1), mem-only(rank2)
        // stub 返回 shared(rank1), stub-only(rank2)
        let embedder = MockEmbedder::new(64);
        let memory = Arc::new(MemoryRetrieveEngine::new());
        let stub = Arc::new(StubEngine {
            results: vec![hit("shared", 0.9), hit("stub-only", 0.5)],
            fail: false,
        });

        // 手工构造 memory 返回顺序：shared 相似度高于 mem-only
        let infos = vec![
            IndexInfo {
                chunk_id: "shared".into(),
                knowledge_id: "k1".into(),
                knowledge_base_id: "kb1".into(),
                content: "comets are icy visitors".into(),
                chunk_index: 0,
                image_info: None,
            },
            IndexInfo {
                chunk_id: "mem-only".into(),
                knowledge_id: "k1".into(),
                knowledge_base_id: "kb1".into(),
                content: "comets sometimes break apart near perihelion icy".into(),
                chunk_index: 1,
                image_info: None,
            },
        ];
        let texts: Vec<String> = infos.iter().map(|i| i.content.clone()).collect();
        let vectors = embedder.embed_batch(&texts).await.unwrap();
        let mut params = IndexParams {
            retriever_types: vec![RetrieverType::Vector],
            dimension: 64,
            ..Default::default()
        };
        for (i, v) in vectors.into_iter().enumerate() {
            params.embeddings.insert(infos[i].chunk_id.clone(), v);
        }
        memory.batch_save(&infos, &params).await.unwrap();

        let mut registry = RetrieveEngineRegistry::new();
        registry.register(memory).unwrap();
        registry.register(stub).unwrap();
        let searcher = HybridSearcher::new(Arc::new(registry));

        let results = searcher
            .search(
                &[
                    pair(RetrieverType::Vector, RetrieverEngineType::Memory),
                    pair(RetrieverType::Vector, RetrieverEngineType::Qdrant),
                ],
                Some(Arc::new(MockEmbedder::new(64))),
                &HybridSearchParams {
                    query_text: "comets are icy visitors".into(),
                    knowledge_base_id: "kb1".into(),
                    vector_threshold: 0.0,
                    keyword_threshold: 0.0,
                    match_count: 3,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        // 两个引擎都把 shared 排第一：RRF = 2/61，领先于单引擎的 1/62
        assert_eq!(results[0].chunk_id, "shared");
        assert_eq!(results[0].match_type, MatchType::Hybrid);
        assert!((results[0].score - 2.0 / 61.0).abs() < 1e-9);
        // rank2 的两条各自 1/62，并列；归一化后各自引擎内都是最小值 0，
        // 按 chunk_id 升序决出 mem-only < stub-only
        assert_eq!(results[1].chunk_id, "mem-only");
        assert_eq!(results[2].chunk_id, "stub-only");
        assert_eq!(results[1].match_type, MatchType::Vector);
    }

    #[tokio::test]
    async fn partial_failure_returns_remaining_engine_results() {
        let embedder = MockEmbedder::new(64);
        let memory = seeded_memory(&embedder).await;
        let broken = Arc::new(StubEngine {
            results: Vec::new(),
            fail: true,
        });
        let mut registry = RetrieveEngineRegistry::new();
        registry.register(memory).unwrap();
        registry.register(broken).unwrap();
        let searcher = HybridSearcher::new(Arc::new(registry));

        let results = searcher
            .search(
                &[
                    pair(RetrieverType::Vector, RetrieverEngineType::Memory),
                    pair(RetrieverType::Vector, RetrieverEngineType::Qdrant),
                ],
                Some(Arc::new(MockEmbedder::new(64))),
                &HybridSearchParams {
                    query_text: "comets are icy visitors from deep space".into(),
                    knowledge_base_id: "kb1".into(),
                    vector_threshold: 0.1,
                    keyword_threshold: 0.0,
                    match_count: 5,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!results.is_empty());
    }

    #[tokio::test]
    async fn all_engines_failing_is_a_retrieval_error() {
        let broken = Arc::new(StubEngine {
            results: Vec::new(),
            fail: true,
        });
        let mut registry = RetrieveEngineRegistry::new();
        registry.register(broken).unwrap();
        let searcher = HybridSearcher::new(Arc::new(registry));

        let result = searcher
            .search(
                &[pair(RetrieverType::Vector, RetrieverEngineType::Qdrant)],
                None,
                &HybridSearchParams {
                    query_text: "anything".into(),
                    query_embedding: Some(vec![0.0; 64]),
                    knowledge_base_id: "kb1".into(),
                    match_count: 5,
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(RagError::RetrievalFailed { .. })));
    }

    #[tokio::test]
    async fn no_duplicate_chunk_ids_in_fused_output() {
        let stub_a = Arc::new(StubEngine {
            results: vec![hit("x", 0.9), hit("y", 0.8)],
            fail: false,
        });
        let mut registry = RetrieveEngineRegistry::new();
        registry.register(stub_a).unwrap();
        let searcher = HybridSearcher::new(Arc::new(registry));

        let results = searcher
            .search(
                &[pair(RetrieverType::Vector, RetrieverEngineType::Qdrant)],
                None,
                &HybridSearchParams {
                    query_text: "q".into(),
                    query_embedding: Some(vec![0.0; 8]),
                    knowledge_base_id: "kb1".into(),
                    match_count: 10,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let mut ids: Vec<&str> = results.iter().map(|r| r.chunk_id.as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), results.len());
    }
}
