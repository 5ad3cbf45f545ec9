use axum::{
    extract::{Path, State},
    Extension, Json,
};
use rag_core::{ChunkingConfig, KnowledgeBase, ModelType, ObjectStorageConfig, Tenant};
use rag_error::{RagError, Result};
use rag_retriever::HybridSearchParams;
use serde::Deserialize;
use std::sync::Arc;

use crate::container::ServiceContainer;
use crate::handlers::ok;

#[derive(Deserialize)]
pub struct UpsertKnowledgeBaseRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub chunking_config: Option<ChunkingConfig>,
    #[serde(default)]
    pub embedding_model_id: String,
    #[serde(default)]
    pub summary_model_id: String,
    #[serde(default)]
    pub rerank_model_id: Option<String>,
    #[serde(default)]
    pub vlm_model_id: Option<String>,
}

/// 多模态处理的默认对象存储，取 MINIO_* 环境变量
fn default_storage_config() -> Option<ObjectStorageConfig> {
    let access_key_id = std::env::var("MINIO_ACCESS_KEY_ID").unwrap_or_default();
    let secret_access_key = std::env::var("MINIO_SECRET_ACCESS_KEY").unwrap_or_default();
    if access_key_id.is_empty() || secret_access_key.is_empty() {
        return None;
    }
    Some(ObjectStorageConfig {
        provider: "minio".into(),
        bucket_name: std::env::var("MINIO_BUCKET_NAME").unwrap_or_else(|_| "rag-images".into()),
        endpoint: std::env::var("MINIO_ENDPOINT").unwrap_or_default(),
        access_key_id,
        secret_access_key,
        path_prefix: String::new(),
    })
}

/// 未指定模型时落到 INIT_* 注册的内置模型
async fn default_model_id(
    container: &ServiceContainer,
    model_type: ModelType,
) -> Result<String> {
    let models = container.model_store.list(0).await?;
    models
        .into_iter()
        .find(|m| m.model_type == model_type)
        .map(|m| m.id)
        .ok_or_else(|| RagError::Configuration {
            key: format!("{:?}", model_type),
            reason: "no default model registered".into(),
        })
}

pub async fn create(
    State(container): State<Arc<ServiceContainer>>,
    Extension(tenant): Extension<Tenant>,
    Json(body): Json<UpsertKnowledgeBaseRequest>,
) -> Result<Json<serde_json::Value>> {
    let embedding_model_id = if body.embedding_model_id.is_empty() {
        default_model_id(&container, ModelType::Embedding).await?
    } else {
        body.embedding_model_id
    };
    let summary_model_id = if body.summary_model_id.is_empty() {
        default_model_id(&container, ModelType::Chat).await?
    } else {
        body.summary_model_id
    };

    let kb = container
        .kb_store
        .create(KnowledgeBase {
            tenant_id: tenant.id,
            name: body.name,
            description: body.description,
            chunking_config: body.chunking_config.or_else(|| Some(ChunkingConfig::default())),
            embedding_model_id,
            summary_model_id,
            rerank_model_id: body.rerank_model_id,
            vlm_model_id: body.vlm_model_id,
            storage_config: default_storage_config(),
            ..Default::default()
        })
        .await?;
    Ok(ok(kb))
}

async fn load_owned(
    container: &ServiceContainer,
    tenant: &Tenant,
    id: &str,
) -> Result<KnowledgeBase> {
    let kb = container
        .kb_store
        .get(id)
        .await?
        .ok_or_else(|| RagError::NotFound {
            resource: format!("knowledge base {}", id),
        })?;
    if kb.tenant_id != tenant.id {
        return Err(RagError::NotFound {
            resource: format!("knowledge base {}", id),
        });
    }
    Ok(kb)
}

pub async fn get(
    State(container): State<Arc<ServiceContainer>>,
    Extension(tenant): Extension<Tenant>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    Ok(ok(load_owned(&container, &tenant, &id).await?))
}

pub async fn update(
    State(container): State<Arc<ServiceContainer>>,
    Extension(tenant): Extension<Tenant>,
    Path(id): Path<String>,
    Json(body): Json<UpsertKnowledgeBaseRequest>,
) -> Result<Json<serde_json::Value>> {
    let existing = load_owned(&container, &tenant, &id).await?;

    // 已有知识的库不允许更换向量模型
    if !body.embedding_model_id.is_empty()
        && body.embedding_model_id != existing.embedding_model_id
        && !container.knowledge_store.list(&id).await?.is_empty()
    {
        return Err(RagError::InvalidRequest {
            reason: "embedding model is immutable once knowledge exists".into(),
        });
    }

    let updated = container
        .kb_store
        .update(KnowledgeBase {
            name: body.name,
            description: body.description,
            chunking_config: body.chunking_config.or(existing.chunking_config.clone()),
            embedding_model_id: if body.embedding_model_id.is_empty() {
                existing.embedding_model_id.clone()
            } else {
                body.embedding_model_id
            },
            summary_model_id: if body.summary_model_id.is_empty() {
                existing.summary_model_id.clone()
            } else {
                body.summary_model_id
            },
            rerank_model_id: body.rerank_model_id.or(existing.rerank_model_id.clone()),
            vlm_model_id: body.vlm_model_id.or(existing.vlm_model_id.clone()),
            ..existing
        })
        .await?;
    Ok(ok(updated))
}

pub async fn remove(
    State(container): State<Arc<ServiceContainer>>,
    Extension(tenant): Extension<Tenant>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let kb = load_owned(&container, &tenant, &id).await?;
    for knowledge in container.knowledge_store.list(&kb.id).await? {
        container
            .ingestor
            .delete_knowledge(&tenant, &kb, &knowledge.id)
            .await?;
    }
    container.kb_store.delete(&id).await?;
    Ok(ok(serde_json::json!({ "id": id })))
}

pub async fn list(
    State(container): State<Arc<ServiceContainer>>,
    Extension(tenant): Extension<Tenant>,
) -> Result<Json<serde_json::Value>> {
    Ok(ok(container.kb_store.list(tenant.id).await?))
}

#[derive(Deserialize)]
pub struct HybridSearchRequest {
    pub query_text: String,
    #[serde(default)]
    pub vector_threshold: f64,
    #[serde(default)]
    pub keyword_threshold: f64,
    #[serde(default = "default_match_count")]
    pub match_count: usize,
}

fn default_match_count() -> usize {
    10
}

pub async fn hybrid_search(
    State(container): State<Arc<ServiceContainer>>,
    Extension(tenant): Extension<Tenant>,
    Path(id): Path<String>,
    Json(body): Json<HybridSearchRequest>,
) -> Result<Json<serde_json::Value>> {
    let kb = load_owned(&container, &tenant, &id).await?;
    let embedder = container
        .resolver
        .embedder(&kb.embedding_model_id)
        .await
        .ok();

    let results = container
        .searcher
        .search(
            &tenant.retriever_engines,
            embedder,
            &HybridSearchParams {
                query_text: body.query_text,
                query_embedding: None,
                knowledge_base_id: kb.id,
                vector_threshold: body.vector_threshold,
                keyword_threshold: body.keyword_threshold,
                match_count: body.match_count,
            },
        )
        .await?;
    Ok(ok(results))
}

#[derive(Deserialize)]
pub struct CopyKnowledgeBaseRequest {
    pub source_knowledge_base_id: String,
    #[serde(default)]
    pub name: String,
}

pub async fn copy(
    State(container): State<Arc<ServiceContainer>>,
    Extension(tenant): Extension<Tenant>,
    Json(body): Json<CopyKnowledgeBaseRequest>,
) -> Result<Json<serde_json::Value>> {
    let source = load_owned(&container, &tenant, &body.source_knowledge_base_id).await?;

    let target = container
        .kb_store
        .create(KnowledgeBase {
            id: String::new(),
            name: if body.name.is_empty() {
                format!("{} (copy)", source.name)
            } else {
                body.name
            },
            ..source.clone()
        })
        .await?;

    let chunk_id_map = container
        .ingestor
        .copy_knowledge_base(&tenant, &source, &target)
        .await?;
    Ok(ok(serde_json::json!({
        "knowledge_base": target,
        "copied_chunks": chunk_id_map.len(),
    })))
}
