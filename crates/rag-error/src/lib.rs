use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

#[cfg(feature = "axum")]
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json},
};

/// 系统统一错误类型
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum RagError {
    // === 业务错误 ===
    #[error("resource not found: {resource}")]
    NotFound { resource: String },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    #[error("duplicate {resource}: {details}")]
    Duplicate { resource: String, details: String },

    #[error("quota exceeded: {resource} reached {limit}")]
    QuotaExceeded { resource: String, limit: String },

    // === 上游服务错误 ===
    #[error("LLM service error ({provider})")]
    LlmService {
        provider: String,
        message: String,
        #[serde(skip)]
        retry_after: Option<std::time::Duration>,
    },

    #[error("embedding service error ({provider})")]
    EmbeddingService {
        provider: String,
        message: String,
        #[serde(skip)]
        retry_after: Option<std::time::Duration>,
    },

    #[error("rerank service error ({provider})")]
    RerankService {
        provider: String,
        message: String,
        #[serde(skip)]
        retry_after: Option<std::time::Duration>,
    },

    #[error("external service unavailable: {service}")]
    ServiceUnavailable {
        service: String,
        #[serde(skip)]
        retry_after: Option<std::time::Duration>,
    },

    // === 检索错误 ===
    #[error("all retrieve engines failed: {message}")]
    RetrievalFailed { message: String },

    #[error("vector store error: {operation}")]
    VectorStore { operation: String, message: String },

    #[error("search engine error: {engine}")]
    SearchEngine { engine: String, message: String },

    // === 模板错误 ===
    #[error("template parse error: {message}")]
    TemplateParse { message: String },

    #[error("template execute error: {message}")]
    TemplateExecute { message: String },

    // === 系统错误 ===
    #[error("operation cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("timeout: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("network error: {operation}")]
    Network { operation: String, message: String },

    #[error("serialization error: {format}")]
    Serialization { format: String, message: String },

    #[error("configuration error: {key} - {reason}")]
    Configuration { key: String, reason: String },

    #[error("storage error: {operation}")]
    Storage { operation: String, message: String },

    #[error("concurrency error: {operation}")]
    Concurrency { operation: String, message: String },

    #[error("internal error: {message}")]
    Internal {
        message: String,
        details: Option<String>,
    },
}

/// 错误严重级别
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Low,      // 可预期的业务错误
    Medium,   // 技术错误但不影响核心功能
    High,     // 影响核心功能的错误
    Critical, // 系统级严重错误
}

impl RagError {
    /// 获取错误的严重级别
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            RagError::NotFound { .. }
            | RagError::InvalidRequest { .. }
            | RagError::Duplicate { .. } => ErrorSeverity::Low,
            RagError::Unauthorized { .. }
            | RagError::QuotaExceeded { .. }
            | RagError::Cancelled { .. } => ErrorSeverity::Medium,
            RagError::LlmService { .. }
            | RagError::EmbeddingService { .. }
            | RagError::RerankService { .. }
            | RagError::ServiceUnavailable { .. }
            | RagError::Network { .. }
            | RagError::Timeout { .. } => ErrorSeverity::Medium,
            RagError::RetrievalFailed { .. }
            | RagError::VectorStore { .. }
            | RagError::SearchEngine { .. }
            | RagError::Storage { .. }
            | RagError::Serialization { .. }
            | RagError::Concurrency { .. }
            | RagError::TemplateParse { .. }
            | RagError::TemplateExecute { .. } => ErrorSeverity::High,
            RagError::Internal { .. } | RagError::Configuration { .. } => ErrorSeverity::Critical,
        }
    }

    /// 是否为可重试错误
    pub fn is_retryable(&self) -> bool {
        match self {
            RagError::ServiceUnavailable { retry_after, .. } => retry_after.is_some(),
            RagError::LlmService { retry_after, .. }
            | RagError::EmbeddingService { retry_after, .. }
            | RagError::RerankService { retry_after, .. } => retry_after.is_some(),
            RagError::Network { .. } | RagError::Timeout { .. } | RagError::Concurrency { .. } => {
                true
            }
            _ => false,
        }
    }

    /// 获取重试延迟时间
    pub fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            RagError::ServiceUnavailable { retry_after, .. }
            | RagError::LlmService { retry_after, .. }
            | RagError::EmbeddingService { retry_after, .. }
            | RagError::RerankService { retry_after, .. } => *retry_after,
            RagError::Network { .. } => Some(std::time::Duration::from_millis(500)),
            RagError::Timeout { .. } => Some(std::time::Duration::from_millis(1000)),
            RagError::Concurrency { .. } => Some(std::time::Duration::from_millis(100)),
            _ => None,
        }
    }

    /// 错误码，用于 API 错误响应体
    pub fn code(&self) -> &'static str {
        match self {
            RagError::NotFound { .. } => "not_found",
            RagError::InvalidRequest { .. } => "bad_request",
            RagError::Unauthorized { .. } => "unauthorized",
            RagError::Duplicate { .. } => "duplicate_file",
            RagError::QuotaExceeded { .. } => "quota_exceeded",
            RagError::LlmService { .. }
            | RagError::EmbeddingService { .. }
            | RagError::RerankService { .. }
            | RagError::ServiceUnavailable { .. }
            | RagError::Network { .. } => "upstream_unavailable",
            RagError::RetrievalFailed { .. } => "retrieval_failed",
            RagError::TemplateParse { .. } => "template_parse",
            RagError::TemplateExecute { .. } => "template_execute",
            RagError::Cancelled { .. } | RagError::Timeout { .. } => "cancelled",
            RagError::VectorStore { .. }
            | RagError::SearchEngine { .. }
            | RagError::Serialization { .. }
            | RagError::Configuration { .. }
            | RagError::Storage { .. }
            | RagError::Concurrency { .. }
            | RagError::Internal { .. } => "internal",
        }
    }

    /// 转换为 HTTP 状态码
    pub fn to_http_status(&self) -> u16 {
        match self {
            RagError::NotFound { .. } => 404,
            RagError::InvalidRequest { .. } => 400,
            RagError::Unauthorized { .. } => 401,
            RagError::Duplicate { .. } => 409,
            RagError::QuotaExceeded { .. } => 429,
            RagError::LlmService { .. }
            | RagError::EmbeddingService { .. }
            | RagError::RerankService { .. }
            | RagError::ServiceUnavailable { .. }
            | RagError::Network { .. } => 503,
            RagError::RetrievalFailed { .. } => 502,
            RagError::Cancelled { .. } | RagError::Timeout { .. } => 408,
            _ => 500,
        }
    }

    /// 记录错误日志，按严重级别选择日志级别
    pub fn log(&self, component: &str, request_id: Option<&str>) {
        match self.severity() {
            ErrorSeverity::Low | ErrorSeverity::Medium => {
                warn!(
                    component = %component,
                    request_id = ?request_id,
                    code = %self.code(),
                    error = %self,
                    "request failed"
                );
            }
            ErrorSeverity::High | ErrorSeverity::Critical => {
                error!(
                    component = %component,
                    request_id = ?request_id,
                    code = %self.code(),
                    error = %self,
                    severity = ?self.severity(),
                    "request failed"
                );
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, RagError>;

// === 转换实现 ===

impl From<serde_json::Error> for RagError {
    fn from(err: serde_json::Error) -> Self {
        RagError::Serialization {
            format: "json".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for RagError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RagError::Timeout {
                operation: "http_request".to_string(),
                timeout_ms: 30000,
            }
        } else if err.is_connect() {
            RagError::Network {
                operation: "connect".to_string(),
                message: err.to_string(),
            }
        } else {
            RagError::Network {
                operation: "http_request".to_string(),
                message: err.to_string(),
            }
        }
    }
}

impl From<redis::RedisError> for RagError {
    fn from(err: redis::RedisError) -> Self {
        RagError::ServiceUnavailable {
            service: format!("redis ({})", err),
            retry_after: Some(std::time::Duration::from_millis(500)),
        }
    }
}

impl From<uuid::Error> for RagError {
    fn from(err: uuid::Error) -> Self {
        RagError::Serialization {
            format: "uuid".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for RagError {
    fn from(err: tokio::task::JoinError) -> Self {
        RagError::Concurrency {
            operation: "task_join".to_string(),
            message: err.to_string(),
        }
    }
}

// Axum integration
#[cfg(feature = "axum")]
impl IntoResponse for RagError {
    fn into_response(self) -> axum::response::Response {
        let status = StatusCode::from_u16(self.to_http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let details = match &self {
            RagError::Internal { details, .. } => details.clone(),
            _ => None,
        };

        let body = serde_json::json!({
            "success": false,
            "error": {
                "code": self.code(),
                "message": self.to_string(),
                "details": details,
            }
        });

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_maps_to_conflict() {
        let err = RagError::Duplicate {
            resource: "knowledge".into(),
            details: "file hash already exists".into(),
        };
        assert_eq!(err.to_http_status(), 409);
        assert_eq!(err.code(), "duplicate_file");
    }

    #[test]
    fn upstream_errors_share_code() {
        let err = RagError::EmbeddingService {
            provider: "openai_compat".into(),
            message: "connection refused".into(),
            retry_after: Some(std::time::Duration::from_secs(1)),
        };
        assert_eq!(err.code(), "upstream_unavailable");
        assert_eq!(err.to_http_status(), 503);
        assert!(err.is_retryable());
    }

    #[test]
    fn retrieval_failed_is_bad_gateway() {
        let err = RagError::RetrievalFailed {
            message: "2 engines failed".into(),
        };
        assert_eq!(err.code(), "retrieval_failed");
        assert_eq!(err.to_http_status(), 502);
        assert!(!err.is_retryable());
    }
}
