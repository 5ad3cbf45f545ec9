use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::event::{EventType, Next, Plugin, PluginError, PluginResult};
use crate::resolver::ModelResolver;
use crate::turn::ChatTurn;

/// 重排：配置了重排模型时对候选段落打分，
/// 留下 score >= rerank_threshold 的前 rerank_top_k 条。
pub struct PluginRerank {
    resolver: Arc<dyn ModelResolver>,
}

impl PluginRerank {
    pub fn new(resolver: Arc<dyn ModelResolver>) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl Plugin for PluginRerank {
    fn name(&self) -> &'static str {
        "rerank"
    }

    fn activation_events(&self) -> Vec<EventType> {
        vec![EventType::Rerank]
    }

    async fn on_event(
        &self,
        _event: EventType,
        turn: &mut ChatTurn,
        next: Next<'_>,
    ) -> PluginResult {
        if turn.session.rerank_model_id.is_empty() || turn.retrieve_results.is_empty() {
            turn.rerank_results = turn.retrieve_results.clone();
            return next.call(turn).await;
        }

        let reranker = self
            .resolver
            .reranker(&turn.session.rerank_model_id)
            .await
            .map_err(PluginError::new)?;

        let passages: Vec<String> = turn
            .retrieve_results
            .iter()
            .map(|r| r.content.clone())
            .collect();
        let ranked = reranker
            .rerank(&turn.query, &passages)
            .await
            .map_err(PluginError::new)?;

        let top_k = turn.session.rerank_top_k.max(0) as usize;
        let mut kept = Vec::new();
        for rank in ranked {
            if rank.relevance_score < turn.session.rerank_threshold {
                continue;
            }
            if let Some(result) = turn.retrieve_results.get(rank.index) {
                let mut result = result.clone();
                result.score = rank.relevance_score;
                kept.push(result);
            }
            if top_k > 0 && kept.len() >= top_k {
                break;
            }
        }

        debug!(
            before = turn.retrieve_results.len(),
            after = kept.len(),
            "rerank finished"
        );
        turn.rerank_results = kept;
        next.call(turn).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventManager;
    use crate::testkit::StaticResolver;
    use rag_core::{MatchType, RetrieveResult, Session};
    use rag_llm::MockReranker;

    fn result(chunk_id: &str, content: &str) -> RetrieveResult {
        RetrieveResult {
            chunk_id: chunk_id.into(),
            knowledge_id: "k1".into(),
            knowledge_base_id: "kb1".into(),
            content: content.into(),
            chunk_index: 0,
            score: 0.5,
            match_type: MatchType::Vector,
            image_info: None,
        }
    }

    #[tokio::test]
    async fn threshold_and_top_k_are_applied() {
        let resolver = Arc::new(StaticResolver::with_reranker(Arc::new(MockReranker)));
        let mut manager = EventManager::new();
        manager.register(Arc::new(PluginRerank::new(resolver)));

        let mut turn = ChatTurn {
            query: "comet orbit".into(),
            session: Session {
                rerank_model_id: "rerank-1".into(),
                rerank_threshold: 0.6,
                rerank_top_k: 5,
                ..Default::default()
            },
            retrieve_results: vec![
                result("c1", "a comet has an orbit around the sun"),
                result("c2", "unrelated text about databases"),
            ],
            ..Default::default()
        };
        manager.trigger(EventType::Rerank, &mut turn).await.unwrap();

        assert_eq!(turn.rerank_results.len(), 1);
        assert_eq!(turn.rerank_results[0].chunk_id, "c1");
        assert!(turn.rerank_results[0].score >= 0.6);
    }

    #[tokio::test]
    async fn no_rerank_model_passes_results_through() {
        let resolver = Arc::new(StaticResolver::default());
        let mut manager = EventManager::new();
        manager.register(Arc::new(PluginRerank::new(resolver)));

        let mut turn = ChatTurn {
            retrieve_results: vec![result("c1", "text")],
            ..Default::default()
        };
        manager.trigger(EventType::Rerank, &mut turn).await.unwrap();
        assert_eq!(turn.rerank_results.len(), 1);
    }
}
