pub mod chat;
pub mod embedding;
pub mod mock;
pub mod rerank;

pub use chat::{ChatModel, OllamaChat, RemoteApiChat};
pub use embedding::{Embedder, OllamaEmbedder, RemoteApiEmbedder};
pub use mock::{MockEmbedder, MockReranker, ScriptedChatModel};
pub use rerank::{RankResult, RemoteApiReranker, Reranker};

pub use rag_error::{RagError, Result};

use async_trait::async_trait;
use rag_core::{Model, ModelSource, ModelType};
use std::sync::Arc;

/// 按模型 ID 解析具体客户端。应用层基于模型注册表实现，
/// 测试里直接注入 mock。
#[async_trait]
pub trait ModelResolver: Send + Sync {
    async fn chat_model(&self, model_id: &str) -> Result<Arc<dyn ChatModel>>;

    async fn embedder(&self, model_id: &str) -> Result<Arc<dyn Embedder>>;

    async fn reranker(&self, model_id: &str) -> Result<Arc<dyn Reranker>>;
}

/// 按模型注册项构造客户端
pub fn new_chat_model(model: &Model) -> Result<Arc<dyn ChatModel>> {
    match model.source {
        ModelSource::Remote => Ok(Arc::new(RemoteApiChat::new(
            model.name.clone(),
            model.id.clone(),
            model.parameters.base_url.clone(),
            model.parameters.api_key.clone(),
        ))),
        ModelSource::Local => Ok(Arc::new(OllamaChat::new(
            model.name.clone(),
            model.id.clone(),
            model.parameters.base_url.clone(),
        ))),
    }
}

pub fn new_embedder(model: &Model) -> Result<Arc<dyn Embedder>> {
    let dimension = model.parameters.embedding_parameters.dimension;
    if dimension == 0 {
        return Err(RagError::Configuration {
            key: "embedding_parameters.dimension".into(),
            reason: format!("embedding model {} has no dimension", model.id),
        });
    }
    match model.source {
        ModelSource::Remote => Ok(Arc::new(RemoteApiEmbedder::new(
            model.name.clone(),
            model.id.clone(),
            model.parameters.base_url.clone(),
            model.parameters.api_key.clone(),
            dimension,
            model.parameters.embedding_parameters.truncate_prompt_tokens,
        ))),
        ModelSource::Local => Ok(Arc::new(OllamaEmbedder::new(
            model.name.clone(),
            model.id.clone(),
            model.parameters.base_url.clone(),
            dimension,
        ))),
    }
}

pub fn new_reranker(model: &Model) -> Result<Arc<dyn Reranker>> {
    match model.model_type {
        ModelType::Rerank => Ok(Arc::new(RemoteApiReranker::new(
            model.name.clone(),
            model.id.clone(),
            model.parameters.base_url.clone(),
            model.parameters.api_key.clone(),
        ))),
        _ => Err(RagError::Configuration {
            key: "model_type".into(),
            reason: format!("model {} is not a rerank model", model.id),
        }),
    }
}
