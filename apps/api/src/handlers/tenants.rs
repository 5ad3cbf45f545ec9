use axum::{
    extract::{Path, State},
    Extension, Json,
};
use rag_core::{RetrieverEngineParams, Tenant};
use rag_error::{RagError, Result};
use serde::Deserialize;
use std::sync::Arc;

use crate::container::ServiceContainer;
use crate::handlers::ok;

#[derive(Deserialize)]
pub struct UpsertTenantRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub retriever_engines: Vec<RetrieverEngineParams>,
    #[serde(default)]
    pub storage_quota: i64,
}

/// 未显式配置引擎组合时，按已注册驱动的能力全开
fn default_engines(container: &ServiceContainer) -> Vec<RetrieverEngineParams> {
    let mut engines = Vec::new();
    for engine in container.registry.all() {
        for retriever_type in engine.support() {
            engines.push(RetrieverEngineParams {
                retriever_type,
                retriever_engine_type: engine.engine_type(),
            });
        }
    }
    engines
}

pub async fn create(
    State(container): State<Arc<ServiceContainer>>,
    Json(body): Json<UpsertTenantRequest>,
) -> Result<Json<serde_json::Value>> {
    if body.name.trim().is_empty() {
        return Err(RagError::InvalidRequest {
            reason: "tenant name must not be empty".into(),
        });
    }
    let retriever_engines = if body.retriever_engines.is_empty() {
        default_engines(&container)
    } else {
        body.retriever_engines
    };
    let tenant = container
        .tenant_store
        .create(Tenant {
            name: body.name,
            description: body.description,
            retriever_engines,
            storage_quota: body.storage_quota,
            ..Default::default()
        })
        .await?;
    Ok(ok(tenant))
}

pub async fn get(
    State(container): State<Arc<ServiceContainer>>,
    Path(id): Path<u32>,
) -> Result<Json<serde_json::Value>> {
    let tenant = container
        .tenant_store
        .get(id)
        .await?
        .ok_or_else(|| RagError::NotFound {
            resource: format!("tenant {}", id),
        })?;
    Ok(ok(tenant))
}

pub async fn update(
    State(container): State<Arc<ServiceContainer>>,
    Extension(current): Extension<Tenant>,
    Path(id): Path<u32>,
    Json(body): Json<UpsertTenantRequest>,
) -> Result<Json<serde_json::Value>> {
    let existing = container
        .tenant_store
        .get(id)
        .await?
        .ok_or_else(|| RagError::NotFound {
            resource: format!("tenant {}", id),
        })?;
    let retriever_engines = if body.retriever_engines.is_empty() {
        existing.retriever_engines.clone()
    } else {
        body.retriever_engines
    };
    let updated = container
        .tenant_store
        .update(Tenant {
            id,
            name: body.name,
            description: body.description,
            retriever_engines,
            storage_quota: body.storage_quota,
            ..existing
        })
        .await?;
    tracing::info!(tenant_id = id, by = current.id, "tenant updated, api key rotated");
    Ok(ok(updated))
}

pub async fn remove(
    State(container): State<Arc<ServiceContainer>>,
    Path(id): Path<u32>,
) -> Result<Json<serde_json::Value>> {
    container.tenant_store.delete(id).await?;
    Ok(ok(serde_json::json!({ "id": id })))
}

pub async fn list(
    State(container): State<Arc<ServiceContainer>>,
) -> Result<Json<serde_json::Value>> {
    Ok(ok(container.tenant_store.list().await?))
}
