use async_trait::async_trait;
use rag_core::{
    IndexInfo, IndexParams, MatchType, RetrieveParams, RetrieveResult, RetrieverEngineType,
    RetrieverType,
};
use rag_error::{RagError, Result};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::{debug, instrument};

/// 进程内检索引擎，同时提供向量（余弦）与关键词（BM25）两种检索方式。
/// 默认驱动，也是测试的基础设施。
pub struct MemoryRetrieveEngine {
    index: RwLock<MemoryIndex>,
    stop_words: HashSet<String>,
    min_word_length: usize,
}

#[derive(Default)]
struct MemoryIndex {
    /// chunk_id -> 条目
    entries: HashMap<String, StoredEntry>,
    /// term -> 含该词的 chunk id 集合
    inverted: HashMap<String, HashSet<String>>,
}

#[derive(Clone)]
struct StoredEntry {
    info: IndexInfo,
    vector: Option<Vec<f32>>,
    term_freq: HashMap<String, u32>,
    token_count: u32,
}

const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;

impl Default for MemoryRetrieveEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRetrieveEngine {
    pub fn new() -> Self {
        let mut stop_words = HashSet::new();
        for word in &[
            "的", "了", "在", "是", "我", "有", "和", "就", "不", "人", "都", "一", "上", "也",
            "到", "说", "要", "去", "你", "会", "着", "看", "好", "这",
        ] {
            stop_words.insert(word.to_string());
        }
        for word in &[
            "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with",
            "by", "this", "that", "is", "are", "was", "were", "be", "been", "have", "has", "had",
            "do", "does", "did", "will", "would", "could", "should", "me", "about",
        ] {
            stop_words.insert(word.to_string());
        }
        Self {
            index: RwLock::new(MemoryIndex::default()),
            stop_words,
            min_word_length: 2,
        }
    }

    fn tokenize(&self, text: &str) -> Vec<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.chars().count() >= self.min_word_length)
            .filter(|t| !self.stop_words.contains(*t))
            .map(|t| t.to_string())
            .collect()
    }

    fn term_frequency(tokens: &[String]) -> HashMap<String, u32> {
        let mut freq = HashMap::new();
        for token in tokens {
            *freq.entry(token.clone()).or_insert(0) += 1;
        }
        freq
    }

    fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
        if a.is_empty() || a.len() != b.len() {
            return 0.0;
        }
        let mut dot = 0.0f64;
        let mut norm_a = 0.0f64;
        let mut norm_b = 0.0f64;
        for i in 0..a.len() {
            dot += (a[i] * b[i]) as f64;
            norm_a += (a[i] * a[i]) as f64;
            norm_b += (b[i] * b[i]) as f64;
        }
        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }
        dot / (norm_a.sqrt() * norm_b.sqrt())
    }

    fn to_result(entry: &StoredEntry, score: f64, match_type: MatchType) -> RetrieveResult {
        RetrieveResult {
            chunk_id: entry.info.chunk_id.clone(),
            knowledge_id: entry.info.knowledge_id.clone(),
            knowledge_base_id: entry.info.knowledge_base_id.clone(),
            content: entry.info.content.clone(),
            chunk_index: entry.info.chunk_index,
            score,
            match_type,
            image_info: entry.info.image_info.clone(),
        }
    }

    async fn retrieve_vector(&self, params: &RetrieveParams) -> Result<Vec<RetrieveResult>> {
        let query_vector = params
            .query_embedding
            .as_ref()
            .ok_or(RagError::InvalidRequest {
                reason: "vector retrieval requires a query embedding".into(),
            })?;
        let kb_ids: HashSet<&String> = params.knowledge_base_ids.iter().collect();

        let index = self.index.read().await;
        let mut scored: Vec<RetrieveResult> = index
            .entries
            .values()
            .filter(|e| kb_ids.is_empty() || kb_ids.contains(&e.info.knowledge_base_id))
            .filter_map(|entry| {
                let vector = entry.vector.as_ref()?;
                let score = Self::cosine_similarity(vector, query_vector);
                (score >= params.threshold)
                    .then(|| Self::to_result(entry, score, MatchType::Vector))
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(params.top_k);
        Ok(scored)
    }

    /// BM25 检索。分数除以“全词命中”的理论上限归一到 (0,1]，
    /// 使 keyword_threshold 与向量阈值同量纲。
    async fn retrieve_keyword(&self, params: &RetrieveParams) -> Result<Vec<RetrieveResult>> {
        let query_terms = self.tokenize(&params.query);
        if query_terms.is_empty() {
            return Ok(Vec::new());
        }
        let kb_ids: HashSet<&String> = params.knowledge_base_ids.iter().collect();

        let index = self.index.read().await;
        let candidates: Vec<&StoredEntry> = index
            .entries
            .values()
            .filter(|e| kb_ids.is_empty() || kb_ids.contains(&e.info.knowledge_base_id))
            .collect();
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let total_docs = candidates.len() as f64;
        let avg_len = candidates.iter().map(|e| e.token_count as f64).sum::<f64>() / total_docs;

        let mut idf = HashMap::new();
        for term in &query_terms {
            let df = index
                .inverted
                .get(term)
                .map(|ids| {
                    ids.iter()
                        .filter(|id| {
                            index
                                .entries
                                .get(*id)
                                .map(|e| {
                                    kb_ids.is_empty()
                                        || kb_ids.contains(&e.info.knowledge_base_id)
                                })
                                .unwrap_or(false)
                        })
                        .count() as f64
                })
                .unwrap_or(0.0);
            idf.insert(
                term.clone(),
                ((total_docs - df + 0.5) / (df + 0.5) + 1.0).ln(),
            );
        }
        let max_score: f64 = idf.values().map(|v| v * (BM25_K1 + 1.0)).sum();
        if max_score <= 0.0 {
            return Ok(Vec::new());
        }

        let mut scored: Vec<RetrieveResult> = candidates
            .into_iter()
            .filter_map(|entry| {
                let doc_len = entry.token_count as f64;
                let mut score = 0.0;
                for term in &query_terms {
                    let tf = *entry.term_freq.get(term).unwrap_or(&0) as f64;
                    if tf == 0.0 {
                        continue;
                    }
                    let norm = BM25_K1 * (1.0 - BM25_B + BM25_B * doc_len / avg_len.max(1.0));
                    score += idf[term] * tf * (BM25_K1 + 1.0) / (tf + norm);
                }
                let score = score / max_score;
                (score >= params.threshold && score > 0.0)
                    .then(|| Self::to_result(entry, score, MatchType::Keyword))
            })
            .collect();

        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(params.top_k);
        Ok(scored)
    }

    fn remove_entry(index: &mut MemoryIndex, chunk_id: &str) {
        if let Some(entry) = index.entries.remove(chunk_id) {
            for term in entry.term_freq.keys() {
                if let Some(ids) = index.inverted.get_mut(term) {
                    ids.remove(chunk_id);
                    if ids.is_empty() {
                        index.inverted.remove(term);
                    }
                }
            }
        }
    }

    /// 当前索引条目数
    pub async fn entry_count(&self) -> usize {
        self.index.read().await.entries.len()
    }
}

#[async_trait]
impl crate::RetrieveEngine for MemoryRetrieveEngine {
    fn engine_type(&self) -> RetrieverEngineType {
        RetrieverEngineType::Memory
    }

    fn support(&self) -> Vec<RetrieverType> {
        vec![RetrieverType::Vector, RetrieverType::Keyword]
    }

    #[instrument(skip(self, infos, params), fields(batch = infos.len()))]
    async fn batch_save(&self, infos: &[IndexInfo], params: &IndexParams) -> Result<()> {
        let index_vectors = params.retriever_types.contains(&RetrieverType::Vector);
        if index_vectors {
            for info in infos {
                if !params.embeddings.contains_key(&info.chunk_id) {
                    return Err(RagError::VectorStore {
                        operation: "batch_save".into(),
                        message: format!("missing embedding for chunk {}", info.chunk_id),
                    });
                }
            }
        }

        let mut index = self.index.write().await;
        for info in infos {
            // 覆盖写：同 chunk_id 重复写入是幂等的
            Self::remove_entry(&mut index, &info.chunk_id);

            let tokens = self.tokenize(&info.content);
            let term_freq = Self::term_frequency(&tokens);
            for term in term_freq.keys() {
                index
                    .inverted
                    .entry(term.clone())
                    .or_default()
                    .insert(info.chunk_id.clone());
            }
            index.entries.insert(
                info.chunk_id.clone(),
                StoredEntry {
                    vector: index_vectors
                        .then(|| params.embeddings[&info.chunk_id].clone()),
                    term_freq,
                    token_count: tokens.len() as u32,
                    info: info.clone(),
                },
            );
        }
        debug!(total = index.entries.len(), "memory index updated");
        Ok(())
    }

    async fn estimate_storage_size(&self, infos: &[IndexInfo], params: &IndexParams) -> i64 {
        infos
            .iter()
            .map(|info| {
                let vector_bytes = params
                    .embeddings
                    .get(&info.chunk_id)
                    .map(|v| v.len() * std::mem::size_of::<f32>())
                    .unwrap_or(0);
                (info.content.len() + vector_bytes) as i64
            })
            .sum()
    }

    async fn delete_by_chunk_ids(&self, chunk_ids: &[String], _dimension: usize) -> Result<()> {
        let mut index = self.index.write().await;
        for chunk_id in chunk_ids {
            Self::remove_entry(&mut index, chunk_id);
        }
        Ok(())
    }

    async fn delete_by_knowledge_ids(
        &self,
        knowledge_ids: &[String],
        _dimension: usize,
    ) -> Result<()> {
        let targets: Vec<String> = {
            let index = self.index.read().await;
            index
                .entries
                .values()
                .filter(|e| knowledge_ids.contains(&e.info.knowledge_id))
                .map(|e| e.info.chunk_id.clone())
                .collect()
        };
        let mut index = self.index.write().await;
        for chunk_id in &targets {
            Self::remove_entry(&mut index, chunk_id);
        }
        Ok(())
    }

    #[instrument(skip(self, kb_id_map, chunk_id_map))]
    async fn copy_indices(
        &self,
        source_kb_id: &str,
        kb_id_map: &HashMap<String, String>,
        chunk_id_map: &HashMap<String, String>,
        target_kb_id: &str,
        _dimension: usize,
    ) -> Result<()> {
        let copies: Vec<StoredEntry> = {
            let index = self.index.read().await;
            index
                .entries
                .values()
                .filter(|e| e.info.knowledge_base_id == source_kb_id)
                .filter_map(|entry| {
                    let new_chunk_id = chunk_id_map.get(&entry.info.chunk_id)?;
                    let mut copy = entry.clone();
                    copy.info.chunk_id = new_chunk_id.clone();
                    copy.info.knowledge_base_id = kb_id_map
                        .get(source_kb_id)
                        .cloned()
                        .unwrap_or_else(|| target_kb_id.to_string());
                    Some(copy)
                })
                .collect()
        };

        let mut index = self.index.write().await;
        for entry in copies {
            for term in entry.term_freq.keys() {
                index
                    .inverted
                    .entry(term.clone())
                    .or_default()
                    .insert(entry.info.chunk_id.clone());
            }
            index.entries.insert(entry.info.chunk_id.clone(), entry);
        }
        Ok(())
    }

    async fn retrieve(&self, params: RetrieveParams) -> Result<Vec<RetrieveResult>> {
        if params.top_k == 0 {
            return Ok(Vec::new());
        }
        match params.retriever_type {
            Some(RetrieverType::Keyword) => self.retrieve_keyword(&params).await,
            _ => self.retrieve_vector(&params).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RetrieveEngine;
    use rag_llm::{Embedder, MockEmbedder};

    fn info(chunk_id: &str, knowledge_id: &str, kb_id: &str, content: &str, idx: i32) -> IndexInfo {
        IndexInfo {
            chunk_id: chunk_id.into(),
            knowledge_id: knowledge_id.into(),
            knowledge_base_id: kb_id.into(),
            content: content.into(),
            chunk_index: idx,
            image_info: None,
        }
    }

    async fn seeded_engine(embedder: &MockEmbedder) -> MemoryRetrieveEngine {
        let engine = MemoryRetrieveEngine::new();
        let infos = vec![
            info("c1", "k1", "kb1", "The solar system has eight planets.", 0),
            info("c2", "k1", "kb1", "COMET is a short-period object.", 1),
            info("c3", "k1", "kb1", "Rust is a systems programming language.", 2),
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
    async fn unique_text_ranks_first() {
        let embedder = MockEmbedder::new(64);
        let engine = seeded_engine(&embedder).await;

        let query = "COMET is a short-period object.";
        let results = engine
            .retrieve(RetrieveParams {
                query: query.into(),
                query_embedding: Some(embedder.embed(query).await.unwrap()),
                knowledge_base_ids: vec!["kb1".into()],
                top_k: 1,
                threshold: 0.1,
                retriever_type: Some(RetrieverType::Vector),
            })
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_id, "c2");
        assert_eq!(results[0].chunk_index, 1);
        assert_eq!(results[0].match_type, MatchType::Vector);
    }

    #[tokio::test]
    async fn keyword_retrieval_scores_in_unit_range() {
        let embedder = MockEmbedder::new(64);
        let engine = seeded_engine(&embedder).await;

        let results = engine
            .retrieve(RetrieveParams {
                query: "comet object".into(),
                query_embedding: None,
                knowledge_base_ids: vec!["kb1".into()],
                top_k: 5,
                threshold: 0.0,
                retriever_type: Some(RetrieverType::Keyword),
            })
            .await
            .unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0].chunk_id, "c2");
        for r in &results {
            assert!(r.score > 0.0 && r.score <= 1.0);
            assert_eq!(r.match_type, MatchType::Keyword);
        }
    }

    #[tokio::test]
    async fn high_threshold_filters_everything() {
        let embedder = MockEmbedder::new(64);
        let engine = seeded_engine(&embedder).await;

        let results = engine
            .retrieve(RetrieveParams {
                query: "anything".into(),
                query_embedding: Some(embedder.embed("anything").await.unwrap()),
                knowledge_base_ids: vec!["kb1".into()],
                top_k: 5,
                threshold: 0.99,
                retriever_type: Some(RetrieverType::Vector),
            })
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn top_k_zero_returns_empty() {
        let embedder = MockEmbedder::new(64);
        let engine = seeded_engine(&embedder).await;
        let results = engine
            .retrieve(RetrieveParams {
                query: "comet".into(),
                query_embedding: None,
                knowledge_base_ids: vec!["kb1".into()],
                top_k: 0,
                threshold: 0.0,
                retriever_type: Some(RetrieverType::Keyword),
            })
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn delete_by_knowledge_removes_all_entries() {
        let embedder = MockEmbedder::new(64);
        let engine = seeded_engine(&embedder).await;
        assert_eq!(engine.entry_count().await, 3);

        engine
            .delete_by_knowledge_ids(&["k1".into()], 64)
            .await
            .unwrap();
        assert_eq!(engine.entry_count().await, 0);
    }

    #[tokio::test]
    async fn batch_save_is_idempotent_per_chunk() {
        let embedder = MockEmbedder::new(64);
        let engine = seeded_engine(&embedder).await;
        let again = info("c2", "k1", "kb1", "COMET is a short-period object.", 1);
        let mut params = IndexParams {
            retriever_types: vec![RetrieverType::Vector, RetrieverType::Keyword],
            dimension: 64,
            ..Default::default()
        };
        params.embeddings.insert(
            "c2".into(),
            embedder.embed(&again.content).await.unwrap(),
        );
        engine.batch_save(&[again], &params).await.unwrap();
        assert_eq!(engine.entry_count().await, 3);
    }

    #[tokio::test]
    async fn copy_preserves_vectors_and_maps_ids() {
        let embedder = MockEmbedder::new(64);
        let engine = seeded_engine(&embedder).await;

        let kb_map = HashMap::from([("kb1".to_string(), "kb2".to_string())]);
        let chunk_map = HashMap::from([
            ("c1".to_string(), "d1".to_string()),
            ("c2".to_string(), "d2".to_string()),
            ("c3".to_string(), "d3".to_string()),
        ]);
        engine
            .copy_indices("kb1", &kb_map, &chunk_map, "kb2", 64)
            .await
            .unwrap();
        assert_eq!(engine.entry_count().await, 6);

        let query = "COMET is a short-period object.";
        let results = engine
            .retrieve(RetrieveParams {
                query: query.into(),
                query_embedding: Some(embedder.embed(query).await.unwrap()),
                knowledge_base_ids: vec!["kb2".into()],
                top_k: 1,
                threshold: 0.1,
                retriever_type: Some(RetrieverType::Vector),
            })
            .await
            .unwrap();
        assert_eq!(results[0].chunk_id, "d2");
        assert_eq!(results[0].knowledge_base_id, "kb2");
    }
}
