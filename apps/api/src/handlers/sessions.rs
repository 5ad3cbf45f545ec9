use axum::{
    extract::{Path, Query, State},
    response::sse::{Event, KeepAlive, Sse},
    Extension, Json,
};
use futures::Stream;
use rag_core::{ChatMessage, ChatOptions, Session, StreamResponse, Tenant};
use rag_error::{RagError, Result};
use rag_pipeline::ChatTurn;
use rag_retriever::HybridSearchParams;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use crate::container::ServiceContainer;
use crate::handlers::ok;
use crate::middleware::RequestId;

#[derive(Deserialize)]
pub struct UpsertSessionRequest {
    pub knowledge_base_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub max_rounds: Option<i32>,
    #[serde(default)]
    pub enable_rewrite: Option<bool>,
    #[serde(default)]
    pub fallback_strategy: Option<rag_core::FallbackStrategy>,
    #[serde(default)]
    pub fallback_response: Option<String>,
    #[serde(default)]
    pub embedding_top_k: Option<i32>,
    #[serde(default)]
    pub keyword_threshold: Option<f64>,
    #[serde(default)]
    pub vector_threshold: Option<f64>,
    #[serde(default)]
    pub rerank_model_id: Option<String>,
    #[serde(default)]
    pub rerank_top_k: Option<i32>,
    #[serde(default)]
    pub rerank_threshold: Option<f64>,
    #[serde(default)]
    pub summary_model_id: Option<String>,
    #[serde(default)]
    pub summary_parameters: Option<rag_core::SummaryConfig>,
}

async fn load_owned_session(
    container: &ServiceContainer,
    tenant: &Tenant,
    id: &str,
) -> Result<Session> {
    let session = container
        .session_store
        .get(id)
        .await?
        .ok_or_else(|| RagError::NotFound {
            resource: format!("session {}", id),
        })?;
    if session.tenant_id != tenant.id {
        return Err(RagError::NotFound {
            resource: format!("session {}", id),
        });
    }
    Ok(session)
}

pub async fn create(
    State(container): State<Arc<ServiceContainer>>,
    Extension(tenant): Extension<Tenant>,
    Json(body): Json<UpsertSessionRequest>,
) -> Result<Json<serde_json::Value>> {
    let kb = container
        .kb_store
        .get(&body.knowledge_base_id)
        .await?
        .filter(|kb| kb.tenant_id == tenant.id)
        .ok_or_else(|| RagError::NotFound {
            resource: format!("knowledge base {}", body.knowledge_base_id),
        })?;

    let defaults = &container.config.conversation;
    let session = container
        .session_store
        .create(Session {
            title: body.title,
            description: body.description,
            tenant_id: tenant.id,
            knowledge_base_id: kb.id.clone(),
            max_rounds: body.max_rounds.unwrap_or(defaults.max_rounds),
            enable_rewrite: body.enable_rewrite.unwrap_or(defaults.enable_rewrite),
            fallback_strategy: body.fallback_strategy.unwrap_or_default(),
            fallback_response: body
                .fallback_response
                .unwrap_or_else(|| defaults.fallback_response.clone()),
            embedding_top_k: body.embedding_top_k.unwrap_or(defaults.embedding_top_k),
            keyword_threshold: body.keyword_threshold.unwrap_or(defaults.keyword_threshold),
            vector_threshold: body.vector_threshold.unwrap_or(defaults.vector_threshold),
            rerank_model_id: body
                .rerank_model_id
                .or_else(|| kb.rerank_model_id.clone())
                .unwrap_or_default(),
            rerank_top_k: body.rerank_top_k.unwrap_or(defaults.rerank_top_k),
            rerank_threshold: body.rerank_threshold.unwrap_or(defaults.rerank_threshold),
            summary_model_id: body
                .summary_model_id
                .unwrap_or_else(|| kb.summary_model_id.clone()),
            summary_parameters: body.summary_parameters.unwrap_or_default(),
            ..Default::default()
        })
        .await?;
    Ok(ok(session))
}

pub async fn get(
    State(container): State<Arc<ServiceContainer>>,
    Extension(tenant): Extension<Tenant>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    Ok(ok(load_owned_session(&container, &tenant, &id).await?))
}

pub async fn update(
    State(container): State<Arc<ServiceContainer>>,
    Extension(tenant): Extension<Tenant>,
    Path(id): Path<String>,
    Json(body): Json<UpsertSessionRequest>,
) -> Result<Json<serde_json::Value>> {
    let existing = load_owned_session(&container, &tenant, &id).await?;
    let updated = container
        .session_store
        .update(Session {
            title: if body.title.is_empty() {
                existing.title.clone()
            } else {
                body.title
            },
            description: body.description,
            max_rounds: body.max_rounds.unwrap_or(existing.max_rounds),
            enable_rewrite: body.enable_rewrite.unwrap_or(existing.enable_rewrite),
            fallback_strategy: body
                .fallback_strategy
                .unwrap_or(existing.fallback_strategy),
            fallback_response: body
                .fallback_response
                .unwrap_or_else(|| existing.fallback_response.clone()),
            embedding_top_k: body.embedding_top_k.unwrap_or(existing.embedding_top_k),
            keyword_threshold: body
                .keyword_threshold
                .unwrap_or(existing.keyword_threshold),
            vector_threshold: body.vector_threshold.unwrap_or(existing.vector_threshold),
            rerank_model_id: body
                .rerank_model_id
                .unwrap_or_else(|| existing.rerank_model_id.clone()),
            rerank_top_k: body.rerank_top_k.unwrap_or(existing.rerank_top_k),
            rerank_threshold: body.rerank_threshold.unwrap_or(existing.rerank_threshold),
            summary_model_id: body
                .summary_model_id
                .unwrap_or_else(|| existing.summary_model_id.clone()),
            summary_parameters: body
                .summary_parameters
                .unwrap_or_else(|| existing.summary_parameters.clone()),
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
    load_owned_session(&container, &tenant, &id).await?;
    container.session_store.delete(&id).await?;
    Ok(ok(serde_json::json!({ "id": id })))
}

pub async fn list(
    State(container): State<Arc<ServiceContainer>>,
    Extension(tenant): Extension<Tenant>,
) -> Result<Json<serde_json::Value>> {
    Ok(ok(container.session_store.list(tenant.id).await?))
}

const GENERATE_TITLE_PROMPT: &str = "Summarize the conversation into a short title of at most \
ten words. Output only the title.";

pub async fn generate_title(
    State(container): State<Arc<ServiceContainer>>,
    Extension(tenant): Extension<Tenant>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let mut session = load_owned_session(&container, &tenant, &id).await?;
    let messages = container.message_store.list_recent(&id, 6).await?;
    if messages.is_empty() {
        return Err(RagError::InvalidRequest {
            reason: "session has no messages to summarize".into(),
        });
    }

    let mut chat_messages = vec![ChatMessage::system(GENERATE_TITLE_PROMPT)];
    for message in &messages {
        chat_messages.push(ChatMessage {
            role: message.role.as_str().to_string(),
            content: message.content.clone(),
        });
    }

    let chat = container
        .resolver
        .chat_model(&session.summary_model_id)
        .await?;
    let response = chat.chat(&chat_messages, &ChatOptions::default()).await?;
    session.title = response.content.trim().to_string();
    let session = container.session_store.update(session).await?;
    Ok(ok(session))
}

#[derive(Deserialize)]
pub struct KnowledgeChatRequest {
    pub query: String,
    #[serde(default)]
    pub request_id: String,
}

fn sse_from_receiver(
    rx: tokio::sync::mpsc::Receiver<StreamResponse>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let stream = ReceiverStream::new(rx).map(|frame| {
        let data = serde_json::to_string(&frame).unwrap_or_else(|_| "{}".to_string());
        Ok(Event::default().data(data))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// 知识问答，SSE 返回 references / answer 帧
pub async fn knowledge_chat(
    State(container): State<Arc<ServiceContainer>>,
    Extension(tenant): Extension<Tenant>,
    Extension(request_id): Extension<RequestId>,
    Path(session_id): Path<String>,
    Json(body): Json<KnowledgeChatRequest>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let session = load_owned_session(&container, &tenant, &session_id).await?;
    let kb = container
        .kb_store
        .get(&session.knowledge_base_id)
        .await?
        .ok_or_else(|| RagError::NotFound {
            resource: format!("knowledge base {}", session.knowledge_base_id),
        })?;

    let request_id = if body.request_id.is_empty() {
        request_id.0
    } else {
        body.request_id
    };
    let turn = ChatTurn::new(tenant, session, kb, body.query, request_id);
    let rx = container.chat_service.knowledge_qa(turn).await?;
    Ok(sse_from_receiver(rx))
}

#[derive(Deserialize)]
pub struct ContinueStreamQuery {
    pub message_id: String,
}

/// 断线续流：message_id 即发起问答时的 request_id
pub async fn continue_stream(
    State(container): State<Arc<ServiceContainer>>,
    Extension(tenant): Extension<Tenant>,
    Path(session_id): Path<String>,
    Query(query): Query<ContinueStreamQuery>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    load_owned_session(&container, &tenant, &session_id).await?;
    let rx = container
        .chat_service
        .continue_stream(&session_id, &query.message_id)
        .await?;
    Ok(sse_from_receiver(rx))
}

#[derive(Deserialize)]
pub struct KnowledgeSearchRequest {
    pub session_id: String,
    pub query: String,
}

/// 只检索不生成
pub async fn knowledge_search(
    State(container): State<Arc<ServiceContainer>>,
    Extension(tenant): Extension<Tenant>,
    Json(body): Json<KnowledgeSearchRequest>,
) -> Result<Json<serde_json::Value>> {
    let session = load_owned_session(&container, &tenant, &body.session_id).await?;
    let kb = container
        .kb_store
        .get(&session.knowledge_base_id)
        .await?
        .ok_or_else(|| RagError::NotFound {
            resource: format!("knowledge base {}", session.knowledge_base_id),
        })?;
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
                query_text: body.query,
                query_embedding: None,
                knowledge_base_id: kb.id,
                vector_threshold: session.vector_threshold,
                keyword_threshold: session.keyword_threshold,
                match_count: session.embedding_top_k.max(0) as usize,
            },
        )
        .await?;
    Ok(ok(results))
}
