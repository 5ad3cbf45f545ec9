use axum::{
    middleware::from_fn,
    middleware::from_fn_with_state,
    routing::{delete, get, post},
    Json, Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::container::ServiceContainer;
use crate::handlers;
use crate::middleware;

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

pub fn build_router(container: Arc<ServiceContainer>) -> Router {
    let api = Router::new()
        // 租户
        .route(
            "/tenants",
            post(handlers::tenants::create).get(handlers::tenants::list),
        )
        .route(
            "/tenants/{id}",
            get(handlers::tenants::get)
                .put(handlers::tenants::update)
                .delete(handlers::tenants::remove),
        )
        // 知识库
        .route(
            "/knowledge-bases",
            post(handlers::knowledge_bases::create).get(handlers::knowledge_bases::list),
        )
        .route(
            "/knowledge-bases/{id}",
            get(handlers::knowledge_bases::get)
                .put(handlers::knowledge_bases::update)
                .delete(handlers::knowledge_bases::remove),
        )
        .route(
            "/knowledge-bases/{id}/hybrid-search",
            get(handlers::knowledge_bases::hybrid_search)
                .post(handlers::knowledge_bases::hybrid_search),
        )
        .route(
            "/knowledge-bases/copy",
            post(handlers::knowledge_bases::copy),
        )
        // 知识
        .route(
            "/knowledge-bases/{id}/knowledge/file",
            post(handlers::knowledge::upload_file),
        )
        .route(
            "/knowledge-bases/{id}/knowledge/url",
            post(handlers::knowledge::ingest_url),
        )
        .route(
            "/knowledge-bases/{id}/knowledge",
            get(handlers::knowledge::list),
        )
        .route("/knowledge/batch", get(handlers::knowledge::batch_get))
        .route(
            "/knowledge/{id}",
            get(handlers::knowledge::get).delete(handlers::knowledge::remove),
        )
        .route(
            "/knowledge/{id}/download",
            get(handlers::knowledge::download),
        )
        // chunk
        .route(
            "/chunks/{knowledge_id}",
            get(handlers::chunks::list).delete(handlers::chunks::remove_all),
        )
        .route(
            "/chunks/{knowledge_id}/{id}",
            delete(handlers::chunks::remove),
        )
        // 会话与消息
        .route(
            "/sessions",
            post(handlers::sessions::create).get(handlers::sessions::list),
        )
        .route(
            "/sessions/{id}",
            get(handlers::sessions::get)
                .put(handlers::sessions::update)
                .delete(handlers::sessions::remove),
        )
        .route(
            "/sessions/{id}/generate_title",
            post(handlers::sessions::generate_title),
        )
        .route(
            "/sessions/continue-stream/{session_id}",
            get(handlers::sessions::continue_stream),
        )
        .route(
            "/knowledge-chat/{session_id}",
            post(handlers::sessions::knowledge_chat),
        )
        .route(
            "/knowledge-search",
            post(handlers::sessions::knowledge_search),
        )
        .route(
            "/messages/{session_id}/load",
            get(handlers::messages::load),
        )
        .route(
            "/messages/{session_id}/{id}",
            delete(handlers::messages::remove),
        );

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api)
        .layer(from_fn_with_state(container.clone(), middleware::auth))
        .layer(from_fn(middleware::request_id))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(container)
}
