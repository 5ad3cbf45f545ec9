use async_trait::async_trait;
use rag_core::{
    EmbeddingParameters, Model, ModelParameters, ModelSource, ModelType,
};
use rag_error::{RagError, Result};
use rag_ingest::{HttpDocReader, KnowledgeIngestor, PlainTextDocReader};
use rag_llm::{ChatModel, Embedder, ModelResolver, Reranker};
use rag_pipeline::ChatService;
use rag_retriever::{HybridSearcher, IndexService, RetrieveEngineRegistry};
use rag_store::{
    ChunkStore, KnowledgeBaseStore, KnowledgeStore, MemoryChunkStore, MemoryKnowledgeBaseStore,
    MemoryKnowledgeStore, MemoryMessageStore, MemoryModelStore, MemorySessionStore,
    MemoryTenantStore, MessageStore, ModelStore, SessionStore, TenantStore,
};
use rag_stream::{new_stream_manager, StreamManager};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::config::AppConfig;

/// 进程级服务容器，启动时装配一次
pub struct ServiceContainer {
    pub config: AppConfig,

    pub tenant_store: Arc<dyn TenantStore>,
    pub kb_store: Arc<dyn KnowledgeBaseStore>,
    pub knowledge_store: Arc<dyn KnowledgeStore>,
    pub chunk_store: Arc<dyn ChunkStore>,
    pub session_store: Arc<dyn SessionStore>,
    pub message_store: Arc<dyn MessageStore>,
    pub model_store: Arc<dyn ModelStore>,

    pub registry: Arc<RetrieveEngineRegistry>,
    pub index_service: Arc<IndexService>,
    pub searcher: Arc<HybridSearcher>,
    pub stream_manager: Arc<dyn StreamManager>,
    pub resolver: Arc<dyn ModelResolver>,
    pub ingestor: Arc<KnowledgeIngestor>,
    pub chat_service: Arc<ChatService>,
}

impl ServiceContainer {
    pub async fn build(config: AppConfig) -> Result<Arc<Self>> {
        let tenant_store: Arc<dyn TenantStore> = Arc::new(MemoryTenantStore::new());
        let kb_store: Arc<dyn KnowledgeBaseStore> = Arc::new(MemoryKnowledgeBaseStore::new());
        let knowledge_store: Arc<dyn KnowledgeStore> = Arc::new(MemoryKnowledgeStore::new());
        let chunk_store: Arc<dyn ChunkStore> = Arc::new(MemoryChunkStore::new());
        let session_store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
        let message_store: Arc<dyn MessageStore> = Arc::new(MemoryMessageStore::new());
        let model_store: Arc<dyn ModelStore> = Arc::new(MemoryModelStore::new());

        register_builtin_models(model_store.as_ref()).await?;

        let registry = Arc::new(RetrieveEngineRegistry::from_drivers(
            &config.retriever.driver,
            (!config.retriever.qdrant_url.is_empty()).then_some(config.retriever.qdrant_url.as_str()),
        )?);
        let index_service = Arc::new(IndexService::new(registry.clone()));
        let searcher = Arc::new(HybridSearcher::new(registry.clone()));

        let stream_manager = new_stream_manager(
            &config.stream_manager.r#type,
            (!config.stream_manager.redis_addr.is_empty())
                .then_some(config.stream_manager.redis_addr.as_str()),
            (!config.stream_manager.redis_password.is_empty())
                .then_some(config.stream_manager.redis_password.as_str()),
            Some(config.stream_manager.redis_db),
            (!config.stream_manager.redis_prefix.is_empty())
                .then_some(config.stream_manager.redis_prefix.as_str()),
            None,
        )
        .await?;

        let resolver: Arc<dyn ModelResolver> =
            Arc::new(StoreModelResolver::new(model_store.clone()));

        let doc_reader: Arc<dyn rag_ingest::DocReader> = if config.docreader.addr.is_empty() {
            info!("no docreader configured, falling back to the plain text reader");
            Arc::new(PlainTextDocReader)
        } else {
            Arc::new(HttpDocReader::new(config.docreader.addr.clone()))
        };

        let ingestor = Arc::new(KnowledgeIngestor::new(
            tenant_store.clone(),
            knowledge_store.clone(),
            chunk_store.clone(),
            index_service.clone(),
            resolver.clone(),
            doc_reader,
        ));

        let chat_service = Arc::new(ChatService::standard(
            resolver.clone(),
            searcher.clone(),
            chunk_store.clone(),
            message_store.clone(),
            stream_manager.clone(),
        ));

        Ok(Arc::new(Self {
            config,
            tenant_store,
            kb_store,
            knowledge_store,
            chunk_store,
            session_store,
            message_store,
            model_store,
            registry,
            index_service,
            searcher,
            stream_manager,
            resolver,
            ingestor,
            chat_service,
        }))
    }
}

/// INIT_* 环境变量注册的默认模型
async fn register_builtin_models(model_store: &dyn ModelStore) -> Result<()> {
    let env = |key: &str| std::env::var(key).unwrap_or_default();

    let llm_name = env("INIT_LLM_MODEL_NAME");
    if !llm_name.is_empty() {
        let id = {
            let id = env("INIT_LLM_MODEL_ID");
            if id.is_empty() {
                Model::builtin_id(ModelSource::Remote, &llm_name, 0)
            } else {
                id
            }
        };
        model_store
            .create(Model {
                id,
                name: llm_name,
                model_type: ModelType::Chat,
                source: ModelSource::Remote,
                parameters: ModelParameters {
                    base_url: env("INIT_LLM_MODEL_BASE_URL"),
                    api_key: env("INIT_LLM_MODEL_API_KEY"),
                    ..Default::default()
                },
                status: "active".into(),
                ..Default::default()
            })
            .await?;
    }

    let embedding_name = env("INIT_EMBEDDING_MODEL_NAME");
    if !embedding_name.is_empty() {
        let dimension: usize = env("INIT_EMBEDDING_MODEL_DIMENSION").parse().map_err(|_| {
            RagError::Configuration {
                key: "INIT_EMBEDDING_MODEL_DIMENSION".into(),
                reason: "embedding model requires a numeric dimension".into(),
            }
        })?;
        let id = {
            let id = env("INIT_EMBEDDING_MODEL_ID");
            if id.is_empty() {
                Model::builtin_id(ModelSource::Remote, &embedding_name, dimension)
            } else {
                id
            }
        };
        model_store
            .create(Model {
                id,
                name: embedding_name,
                model_type: ModelType::Embedding,
                source: ModelSource::Remote,
                parameters: ModelParameters {
                    base_url: env("INIT_EMBEDDING_MODEL_BASE_URL"),
                    api_key: env("INIT_EMBEDDING_MODEL_API_KEY"),
                    embedding_parameters: EmbeddingParameters {
                        dimension,
                        ..Default::default()
                    },
                },
                status: "active".into(),
                ..Default::default()
            })
            .await?;
    }

    let rerank_name = env("INIT_RERANK_MODEL_NAME");
    if !rerank_name.is_empty() {
        model_store
            .create(Model {
                id: {
                    let id = env("INIT_RERANK_MODEL_ID");
                    if id.is_empty() {
                        Model::builtin_id(ModelSource::Remote, &rerank_name, 0)
                    } else {
                        id
                    }
                },
                name: rerank_name,
                model_type: ModelType::Rerank,
                source: ModelSource::Remote,
                parameters: ModelParameters {
                    base_url: env("INIT_RERANK_MODEL_BASE_URL"),
                    api_key: env("INIT_RERANK_MODEL_API_KEY"),
                    ..Default::default()
                },
                status: "active".into(),
                ..Default::default()
            })
            .await?;
    }

    let vlm_name = env("VLM_MODEL_NAME");
    if !vlm_name.is_empty() {
        model_store
            .create(Model {
                id: {
                    let id = env("VLM_MODEL_ID");
                    if id.is_empty() {
                        Model::builtin_id(ModelSource::Remote, &vlm_name, 0)
                    } else {
                        id
                    }
                },
                name: vlm_name,
                model_type: ModelType::Vlm,
                source: ModelSource::Remote,
                parameters: ModelParameters {
                    base_url: env("VLM_MODEL_BASE_URL"),
                    api_key: env("VLM_MODEL_API_KEY"),
                    ..Default::default()
                },
                status: "active".into(),
                ..Default::default()
            })
            .await?;
    }
    Ok(())
}

/// 基于模型注册表的解析器，客户端按模型 ID 缓存复用
pub struct StoreModelResolver {
    model_store: Arc<dyn ModelStore>,
    chat_cache: RwLock<HashMap<String, Arc<dyn ChatModel>>>,
    embed_cache: RwLock<HashMap<String, Arc<dyn Embedder>>>,
    rerank_cache: RwLock<HashMap<String, Arc<dyn Reranker>>>,
}

impl StoreModelResolver {
    pub fn new(model_store: Arc<dyn ModelStore>) -> Self {
        Self {
            model_store,
            chat_cache: RwLock::new(HashMap::new()),
            embed_cache: RwLock::new(HashMap::new()),
            rerank_cache: RwLock::new(HashMap::new()),
        }
    }

    async fn load(&self, model_id: &str) -> Result<Model> {
        self.model_store
            .get(model_id)
            .await?
            .ok_or_else(|| RagError::NotFound {
                resource: format!("model {}", model_id),
            })
    }
}

#[async_trait]
impl ModelResolver for StoreModelResolver {
    async fn chat_model(&self, model_id: &str) -> Result<Arc<dyn ChatModel>> {
        if let Some(client) = self.chat_cache.read().await.get(model_id) {
            return Ok(client.clone());
        }
        let model = self.load(model_id).await?;
        let client = rag_llm::new_chat_model(&model)?;
        self.chat_cache
            .write()
            .await
            .insert(model_id.to_string(), client.clone());
        Ok(client)
    }

    async fn embedder(&self, model_id: &str) -> Result<Arc<dyn Embedder>> {
        if let Some(client) = self.embed_cache.read().await.get(model_id) {
            return Ok(client.clone());
        }
        let model = self.load(model_id).await?;
        let client = rag_llm::new_embedder(&model)?;
        self.embed_cache
            .write()
            .await
            .insert(model_id.to_string(), client.clone());
        Ok(client)
    }

    async fn reranker(&self, model_id: &str) -> Result<Arc<dyn Reranker>> {
        if let Some(client) = self.rerank_cache.read().await.get(model_id) {
            return Ok(client.clone());
        }
        let model = self.load(model_id).await?;
        let client = rag_llm::new_reranker(&model)?;
        self.rerank_cache
            .write()
            .await
            .insert(model_id.to_string(), client.clone());
        Ok(client)
    }
}
