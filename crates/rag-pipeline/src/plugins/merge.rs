use async_trait::async_trait;
use rag_core::ChunkType;
use rag_store::ChunkStore;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use crate::event::{EventType, Next, Plugin, PluginResult};
use crate::turn::ChatTurn;

/// 结果归并：按 (knowledge_id, chunk_index) 去重，
/// 可选地把相邻 chunk 拼入正文提升上下文连贯性。
pub struct PluginMergeResult {
    chunk_store: Arc<dyn ChunkStore>,
    enable_neighbor_expansion: bool,
}

impl PluginMergeResult {
    pub fn new(chunk_store: Arc<dyn ChunkStore>) -> Self {
        Self {
            chunk_store,
            enable_neighbor_expansion: true,
        }
    }

    pub fn with_neighbor_expansion(mut self, enabled: bool) -> Self {
        self.enable_neighbor_expansion = enabled;
        self
    }
}

#[async_trait]
impl Plugin for PluginMergeResult {
    fn name(&self) -> &'static str {
        "merge_result"
    }

    fn activation_events(&self) -> Vec<EventType> {
        vec![EventType::MergeResult]
    }

    async fn on_event(
        &self,
        _event: EventType,
        turn: &mut ChatTurn,
        next: Next<'_>,
    ) -> PluginResult {
        // 去重，保持分数顺序
        let mut seen: HashSet<(String, i32)> = HashSet::new();
        let mut merged = Vec::new();
        for result in &turn.rerank_results {
            if seen.insert((result.knowledge_id.clone(), result.chunk_index)) {
                merged.push(result.clone());
            }
        }

        if self.enable_neighbor_expansion {
            let occupied: HashSet<(String, i32)> = seen.clone();
            for result in &mut merged {
                let Ok(Some(chunk)) = self.chunk_store.get(&result.chunk_id).await else {
                    continue;
                };
                if chunk.chunk_type != ChunkType::Text {
                    continue;
                }
                // 前后相邻 chunk 拼接到正文两侧；已在结果集中的不重复拼接
                if !chunk.pre_chunk_id.is_empty() {
                    if let Ok(Some(pre)) = self.chunk_store.get(&chunk.pre_chunk_id).await {
                        if !occupied.contains(&(pre.knowledge_id.clone(), pre.chunk_index)) {
                            result.content = format!("{}\n{}", pre.content, result.content);
                        }
                    }
                }
                if !chunk.next_chunk_id.is_empty() {
                    if let Ok(Some(next_chunk)) = self.chunk_store.get(&chunk.next_chunk_id).await
                    {
                        if !occupied
                            .contains(&(next_chunk.knowledge_id.clone(), next_chunk.chunk_index))
                        {
                            result.content =
                                format!("{}\n{}", result.content, next_chunk.content);
                        }
                    }
                }
            }
        }

        debug!(merged = merged.len(), "results merged");
        turn.references = merged.iter().map(|r| r.into()).collect();
        turn.merge_results = merged;
        next.call(turn).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventManager;
    use rag_core::{Chunk, MatchType, RetrieveResult};
    use rag_store::MemoryChunkStore;

    fn result(chunk_id: &str, knowledge_id: &str, index: i32, score: f64) -> RetrieveResult {
        RetrieveResult {
            chunk_id: chunk_id.into(),
            knowledge_id: knowledge_id.into(),
            knowledge_base_id: "kb1".into(),
            content: format!("content {}", chunk_id),
            chunk_index: index,
            score,
            match_type: MatchType::Vector,
            image_info: None,
        }
    }

    #[tokio::test]
    async fn duplicates_by_knowledge_and_index_are_dropped() {
        let store = Arc::new(MemoryChunkStore::new());
        let mut manager = EventManager::new();
        manager.register(Arc::new(
            PluginMergeResult::new(store).with_neighbor_expansion(false),
        ));

        let mut turn = ChatTurn {
            rerank_results: vec![
                result("c1", "k1", 0, 0.9),
                result("c1-dup", "k1", 0, 0.8),
                result("c2", "k1", 1, 0.7),
            ],
            ..Default::default()
        };
        manager
            .trigger(EventType::MergeResult, &mut turn)
            .await
            .unwrap();

        assert_eq!(turn.merge_results.len(), 2);
        assert_eq!(turn.merge_results[0].chunk_id, "c1");
        assert_eq!(turn.references.len(), 2);
    }

    #[tokio::test]
    async fn neighbors_are_stitched_into_content() {
        let store = Arc::new(MemoryChunkStore::new());
        store
            .batch_create(vec![
                Chunk {
                    id: "c0".into(),
                    knowledge_id: "k1".into(),
                    chunk_index: 0,
                    content: "before".into(),
                    next_chunk_id: "c1".into(),
                    ..Default::default()
                },
                Chunk {
                    id: "c1".into(),
                    knowledge_id: "k1".into(),
                    chunk_index: 1,
                    content: "middle".into(),
                    pre_chunk_id: "c0".into(),
                    next_chunk_id: "c2".into(),
                    ..Default::default()
                },
                Chunk {
                    id: "c2".into(),
                    knowledge_id: "k1".into(),
                    chunk_index: 2,
                    content: "after".into(),
                    pre_chunk_id: "c1".into(),
                    ..Default::default()
                },
            ])
            .await
            .unwrap();

        let mut manager = EventManager::new();
        manager.register(Arc::new(PluginMergeResult::new(store)));

        let mut turn = ChatTurn {
            rerank_results: vec![result("c1", "k1", 1, 0.9)],
            ..Default::default()
        };
        manager
            .trigger(EventType::MergeResult, &mut turn)
            .await
            .unwrap();

        assert_eq!(turn.merge_results[0].content, "before\ncontent c1\nafter");
    }
}
