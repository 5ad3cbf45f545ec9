use axum::{
    extract::{Path, State},
    Extension, Json,
};
use rag_core::Tenant;
use rag_error::{RagError, Result};
use std::sync::Arc;

use crate::container::ServiceContainer;
use crate::handlers::ok;

async fn embedding_dimension(container: &ServiceContainer, knowledge_id: &str) -> usize {
    let Ok(Some(knowledge)) = container.knowledge_store.get(knowledge_id).await else {
        return 0;
    };
    match container
        .resolver
        .embedder(&knowledge.embedding_model_id)
        .await
    {
        Ok(embedder) => embedder.dimensions(),
        Err(_) => 0,
    }
}

pub async fn list(
    State(container): State<Arc<ServiceContainer>>,
    Extension(tenant): Extension<Tenant>,
    Path(knowledge_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    container
        .knowledge_store
        .get(&knowledge_id)
        .await?
        .filter(|k| k.tenant_id == tenant.id)
        .ok_or_else(|| RagError::NotFound {
            resource: format!("knowledge {}", knowledge_id),
        })?;
    Ok(ok(container
        .chunk_store
        .list_by_knowledge(&knowledge_id)
        .await?))
}

pub async fn remove(
    State(container): State<Arc<ServiceContainer>>,
    Extension(tenant): Extension<Tenant>,
    Path((knowledge_id, id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>> {
    container
        .knowledge_store
        .get(&knowledge_id)
        .await?
        .filter(|k| k.tenant_id == tenant.id)
        .ok_or_else(|| RagError::NotFound {
            resource: format!("knowledge {}", knowledge_id),
        })?;

    container.chunk_store.delete(&knowledge_id, &id).await?;
    let dimension = embedding_dimension(&container, &knowledge_id).await;
    container
        .index_service
        .delete_by_chunk_ids(&tenant.retriever_engines, &[id.clone()], dimension)
        .await?;
    Ok(ok(serde_json::json!({ "id": id })))
}

pub async fn remove_all(
    State(container): State<Arc<ServiceContainer>>,
    Extension(tenant): Extension<Tenant>,
    Path(knowledge_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    container
        .knowledge_store
        .get(&knowledge_id)
        .await?
        .filter(|k| k.tenant_id == tenant.id)
        .ok_or_else(|| RagError::NotFound {
            resource: format!("knowledge {}", knowledge_id),
        })?;

    let deleted = container
        .chunk_store
        .delete_by_knowledge(&knowledge_id)
        .await?;
    let dimension = embedding_dimension(&container, &knowledge_id).await;
    container
        .index_service
        .delete_by_knowledge_ids(
            &tenant.retriever_engines,
            &[knowledge_id.clone()],
            dimension,
        )
        .await?;
    Ok(ok(serde_json::json!({ "deleted": deleted.len() })))
}
