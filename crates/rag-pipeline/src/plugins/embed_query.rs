use async_trait::async_trait;
use rag_core::RetrieverType;
use rag_error::RagError;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::event::{EventType, Next, Plugin, PluginError, PluginResult};
use crate::resolver::ModelResolver;
use crate::turn::ChatTurn;

const EMBED_DEADLINE: Duration = Duration::from_secs(30);

/// 查询向量化。租户未配置向量引擎时跳过；
/// 向量在整个回合内只计算一次，检索阶段直接复用。
pub struct PluginEmbedQuery {
    resolver: Arc<dyn ModelResolver>,
}

impl PluginEmbedQuery {
    pub fn new(resolver: Arc<dyn ModelResolver>) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl Plugin for PluginEmbedQuery {
    fn name(&self) -> &'static str {
        "embed_query"
    }

    fn activation_events(&self) -> Vec<EventType> {
        vec![EventType::EmbedQuery]
    }

    async fn on_event(
        &self,
        _event: EventType,
        turn: &mut ChatTurn,
        next: Next<'_>,
    ) -> PluginResult {
        let has_vector = turn
            .tenant
            .retriever_engines
            .iter()
            .any(|p| p.retriever_type == RetrieverType::Vector);
        if !has_vector {
            return next.call(turn).await;
        }

        let embedder = self
            .resolver
            .embedder(&turn.knowledge_base.embedding_model_id)
            .await
            .map_err(PluginError::new)?;

        let embedding = tokio::select! {
            _ = turn.cancel.cancelled() => {
                return Err(PluginError::new(RagError::Cancelled {
                    operation: "embed_query".into(),
                }));
            }
            result = tokio::time::timeout(EMBED_DEADLINE, embedder.embed(&turn.query)) => {
                match result {
                    Ok(embedding) => embedding.map_err(PluginError::new)?,
                    Err(_) => {
                        return Err(PluginError::new(RagError::Timeout {
                            operation: "embed_query".into(),
                            timeout_ms: EMBED_DEADLINE.as_millis() as u64,
                        }));
                    }
                }
            }
        };

        debug!(dimension = embedding.len(), "query embedded");
        turn.query_embedding = Some(embedding);
        next.call(turn).await
    }
}
