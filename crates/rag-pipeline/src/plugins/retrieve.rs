use async_trait::async_trait;
use rag_retriever::{HybridSearchParams, HybridSearcher};
use std::sync::Arc;
use tracing::info;

use crate::event::{EventType, Next, Plugin, PluginError, PluginResult};
use crate::turn::ChatTurn;

/// 混合检索：按会话阈值查询租户配置的全部引擎组合
pub struct PluginRetrieve {
    searcher: Arc<HybridSearcher>,
}

impl PluginRetrieve {
    pub fn new(searcher: Arc<HybridSearcher>) -> Self {
        Self { searcher }
    }
}

#[async_trait]
impl Plugin for PluginRetrieve {
    fn name(&self) -> &'static str {
        "retrieve"
    }

    fn activation_events(&self) -> Vec<EventType> {
        vec![EventType::Retrieve]
    }

    async fn on_event(
        &self,
        _event: EventType,
        turn: &mut ChatTurn,
        next: Next<'_>,
    ) -> PluginResult {
        let params = HybridSearchParams {
            query_text: turn.query.clone(),
            query_embedding: turn.query_embedding.clone(),
            knowledge_base_id: turn.session.knowledge_base_id.clone(),
            vector_threshold: turn.session.vector_threshold,
            keyword_threshold: turn.session.keyword_threshold,
            match_count: turn.session.embedding_top_k.max(0) as usize,
        };

        let results = self
            .searcher
            .search(&turn.tenant.retriever_engines, None, &params)
            .await
            .map_err(PluginError::new)?;

        info!(candidates = results.len(), "hybrid retrieval finished");
        turn.retrieve_results = results;
        next.call(turn).await
    }
}
