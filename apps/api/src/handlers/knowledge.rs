use axum::{
    extract::{Multipart, Path, Query, State},
    http::header,
    response::IntoResponse,
    Extension, Json,
};
use rag_core::{KnowledgeBase, Tenant};
use rag_error::{RagError, Result};
use serde::Deserialize;
use std::sync::Arc;

use crate::container::ServiceContainer;
use crate::handlers::ok;

async fn load_kb(
    container: &ServiceContainer,
    tenant: &Tenant,
    kb_id: &str,
) -> Result<KnowledgeBase> {
    let kb = container
        .kb_store
        .get(kb_id)
        .await?
        .ok_or_else(|| RagError::NotFound {
            resource: format!("knowledge base {}", kb_id),
        })?;
    if kb.tenant_id != tenant.id {
        return Err(RagError::NotFound {
            resource: format!("knowledge base {}", kb_id),
        });
    }
    Ok(kb)
}

/// multipart 上传：file 字段为内容，enable_multimodel 为可选开关
pub async fn upload_file(
    State(container): State<Arc<ServiceContainer>>,
    Extension(tenant): Extension<Tenant>,
    Path(kb_id): Path<String>,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>> {
    let kb = load_kb(&container, &tenant, &kb_id).await?;

    let mut file_name = String::new();
    let mut data: Option<Vec<u8>> = None;
    let mut enable_multimodal = false;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        RagError::InvalidRequest {
            reason: format!("invalid multipart body: {}", e),
        }
    })? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                file_name = field.file_name().unwrap_or("upload.bin").to_string();
                let bytes = field.bytes().await.map_err(|e| RagError::InvalidRequest {
                    reason: format!("failed to read file field: {}", e),
                })?;
                data = Some(bytes.to_vec());
            }
            "enable_multimodel" => {
                let value = field.text().await.unwrap_or_default();
                enable_multimodal = value == "true" || value == "1";
            }
            _ => {}
        }
    }

    let data = data.ok_or(RagError::InvalidRequest {
        reason: "missing file field".into(),
    })?;

    let knowledge = container
        .ingestor
        .ingest_file(&tenant, &kb, &file_name, &data, enable_multimodal)
        .await?;
    Ok(ok(knowledge))
}

#[derive(Deserialize)]
pub struct IngestUrlRequest {
    pub url: String,
    #[serde(default)]
    pub enable_multimodel: bool,
}

pub async fn ingest_url(
    State(container): State<Arc<ServiceContainer>>,
    Extension(tenant): Extension<Tenant>,
    Path(kb_id): Path<String>,
    Json(body): Json<IngestUrlRequest>,
) -> Result<Json<serde_json::Value>> {
    let kb = load_kb(&container, &tenant, &kb_id).await?;
    let knowledge = container
        .ingestor
        .ingest_url(&tenant, &kb, &body.url, body.enable_multimodel)
        .await?;
    Ok(ok(knowledge))
}

pub async fn list(
    State(container): State<Arc<ServiceContainer>>,
    Extension(tenant): Extension<Tenant>,
    Path(kb_id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    load_kb(&container, &tenant, &kb_id).await?;
    Ok(ok(container.knowledge_store.list(&kb_id).await?))
}

#[derive(Deserialize)]
pub struct BatchGetQuery {
    /// 逗号分隔的知识 ID
    pub ids: String,
}

pub async fn batch_get(
    State(container): State<Arc<ServiceContainer>>,
    Extension(tenant): Extension<Tenant>,
    Query(query): Query<BatchGetQuery>,
) -> Result<Json<serde_json::Value>> {
    let ids: Vec<String> = query
        .ids
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    let items: Vec<_> = container
        .knowledge_store
        .batch_get(&ids)
        .await?
        .into_iter()
        .filter(|k| k.tenant_id == tenant.id)
        .collect();
    Ok(ok(items))
}

pub async fn get(
    State(container): State<Arc<ServiceContainer>>,
    Extension(tenant): Extension<Tenant>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let knowledge = container
        .knowledge_store
        .get(&id)
        .await?
        .filter(|k| k.tenant_id == tenant.id)
        .ok_or_else(|| RagError::NotFound {
            resource: format!("knowledge {}", id),
        })?;
    Ok(ok(knowledge))
}

pub async fn remove(
    State(container): State<Arc<ServiceContainer>>,
    Extension(tenant): Extension<Tenant>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let knowledge = container
        .knowledge_store
        .get(&id)
        .await?
        .filter(|k| k.tenant_id == tenant.id)
        .ok_or_else(|| RagError::NotFound {
            resource: format!("knowledge {}", id),
        })?;
    let kb = load_kb(&container, &tenant, &knowledge.knowledge_base_id).await?;
    container
        .ingestor
        .delete_knowledge(&tenant, &kb, &id)
        .await?;
    Ok(ok(serde_json::json!({ "id": id })))
}

/// 下载解析后的文本内容（按 chunk_index 重组）
pub async fn download(
    State(container): State<Arc<ServiceContainer>>,
    Extension(tenant): Extension<Tenant>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let knowledge = container
        .knowledge_store
        .get(&id)
        .await?
        .filter(|k| k.tenant_id == tenant.id)
        .ok_or_else(|| RagError::NotFound {
            resource: format!("knowledge {}", id),
        })?;

    let chunks = container.chunk_store.list_by_knowledge(&id).await?;
    let content: String = chunks
        .iter()
        .map(|c| c.content.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    let file_name = if knowledge.file_name.is_empty() {
        format!("{}.txt", knowledge.id)
    } else {
        knowledge.file_name.clone()
    };
    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", file_name),
            ),
        ],
        content,
    ))
}
