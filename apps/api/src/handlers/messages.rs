use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use rag_core::Tenant;
use rag_error::{RagError, Result};
use serde::Deserialize;
use std::sync::Arc;

use crate::container::ServiceContainer;
use crate::handlers::ok;

#[derive(Deserialize)]
pub struct LoadMessagesQuery {
    #[serde(default)]
    pub before_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub limit: Option<usize>,
}

async fn ensure_session(
    container: &ServiceContainer,
    tenant: &Tenant,
    session_id: &str,
) -> Result<()> {
    container
        .session_store
        .get(session_id)
        .await?
        .filter(|s| s.tenant_id == tenant.id)
        .ok_or_else(|| RagError::NotFound {
            resource: format!("session {}", session_id),
        })?;
    Ok(())
}

/// 按 created_at < before_time 向前翻页，新消息在前
pub async fn load(
    State(container): State<Arc<ServiceContainer>>,
    Extension(tenant): Extension<Tenant>,
    Path(session_id): Path<String>,
    Query(query): Query<LoadMessagesQuery>,
) -> Result<Json<serde_json::Value>> {
    ensure_session(&container, &tenant, &session_id).await?;
    let before_time = query.before_time.unwrap_or_else(Utc::now);
    let limit = query.limit.unwrap_or(20).min(100);
    let messages = container
        .message_store
        .list_before(&session_id, before_time, limit)
        .await?;
    Ok(ok(messages))
}

pub async fn remove(
    State(container): State<Arc<ServiceContainer>>,
    Extension(tenant): Extension<Tenant>,
    Path((session_id, id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>> {
    ensure_session(&container, &tenant, &session_id).await?;
    container.message_store.soft_delete(&session_id, &id).await?;
    Ok(ok(serde_json::json!({ "id": id })))
}
