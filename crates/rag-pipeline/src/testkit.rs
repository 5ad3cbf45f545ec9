//! 单元与集成测试共用的桩。

use async_trait::async_trait;
use rag_error::{RagError, Result};
use rag_llm::{ChatModel, Embedder, Reranker};
use std::sync::Arc;

use crate::resolver::ModelResolver;

/// 固定返回注入客户端的解析器
#[derive(Default)]
pub struct StaticResolver {
    pub chat: Option<Arc<dyn ChatModel>>,
    pub embedder: Option<Arc<dyn Embedder>>,
    pub reranker: Option<Arc<dyn Reranker>>,
}

impl StaticResolver {
    pub fn with_chat(chat: Arc<dyn ChatModel>) -> Self {
        Self {
            chat: Some(chat),
            ..Default::default()
        }
    }

    pub fn with_embedder(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder: Some(embedder),
            ..Default::default()
        }
    }

    pub fn with_reranker(reranker: Arc<dyn Reranker>) -> Self {
        Self {
            reranker: Some(reranker),
            ..Default::default()
        }
    }

    pub fn chat(mut self, chat: Arc<dyn ChatModel>) -> Self {
        self.chat = Some(chat);
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }
}

#[async_trait]
impl ModelResolver for StaticResolver {
    async fn chat_model(&self, model_id: &str) -> Result<Arc<dyn ChatModel>> {
        self.chat.clone().ok_or_else(|| RagError::Configuration {
            key: "chat_model".into(),
            reason: format!("no chat model for {}", model_id),
        })
    }

    async fn embedder(&self, model_id: &str) -> Result<Arc<dyn Embedder>> {
        self.embedder.clone().ok_or_else(|| RagError::Configuration {
            key: "embedding_model".into(),
            reason: format!("no embedder for {}", model_id),
        })
    }

    async fn reranker(&self, model_id: &str) -> Result<Arc<dyn Reranker>> {
        self.reranker.clone().ok_or_else(|| RagError::Configuration {
            key: "rerank_model".into(),
            reason: format!("no reranker for {}", model_id),
        })
    }
}
