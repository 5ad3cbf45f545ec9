use axum::{
    body::Body,
    extract::State,
    http::{HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use rag_error::RagError;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::container::ServiceContainer;

pub const API_KEY_HEADER: &str = "X-API-Key";
pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

/// 租户创建是引导入口，放行认证
fn is_public(method: &axum::http::Method, path: &str) -> bool {
    path == "/health" || (method == axum::http::Method::POST && path == "/api/v1/tenants")
}

/// X-API-Key 认证：查到租户后挂到请求扩展里
pub async fn auth(
    State(container): State<Arc<ServiceContainer>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    if is_public(request.method(), request.uri().path()) {
        return next.run(request).await;
    }

    let api_key = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    if api_key.is_empty() {
        return RagError::Unauthorized {
            message: "missing X-API-Key header".into(),
        }
        .into_response();
    }

    match container.tenant_store.get_by_api_key(&api_key).await {
        Ok(Some(tenant)) => {
            debug!(tenant_id = tenant.id, "tenant authenticated");
            request.extensions_mut().insert(tenant);
            next.run(request).await
        }
        Ok(None) => RagError::Unauthorized {
            message: "invalid api key".into(),
        }
        .into_response(),
        Err(err) => err.into_response(),
    }
}

/// X-Request-ID 透传，缺失时生成并回写响应头
pub async fn request_id(mut request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    request.extensions_mut().insert(RequestId(request_id.clone()));
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

#[derive(Debug, Clone)]
pub struct RequestId(pub String);
