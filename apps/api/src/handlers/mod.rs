pub mod chunks;
pub mod knowledge;
pub mod knowledge_bases;
pub mod messages;
pub mod sessions;
pub mod tenants;

use axum::Json;
use serde::Serialize;
use serde_json::json;

/// 统一成功响应包装
pub fn ok<T: Serialize>(data: T) -> Json<serde_json::Value> {
    Json(json!({ "success": true, "data": data }))
}
