use serde::{Deserialize, Serialize};

use crate::message::References;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// 单次对话调用参数，零值字段不发送
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatOptions {
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: i32,
    pub max_completion_tokens: i32,
    pub frequency_penalty: f64,
    pub presence_penalty: f64,
    /// 思考模式开关，仅部分模型支持
    pub thinking: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatUsage {
    pub prompt_tokens: i32,
    pub completion_tokens: i32,
    pub total_tokens: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatResponse {
    pub content: String,
    pub usage: ChatUsage,
}

/// SSE 帧类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    /// 引用帧，首个 answer 帧之前恰好发送一次
    References,
    Answer,
}

/// 流式响应的一帧
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamResponse {
    pub response_type: ResponseType,
    #[serde(default)]
    pub content: String,
    pub done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub references: Option<References>,
    /// 出错终止时携带错误码
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StreamResponse {
    pub fn references(references: References) -> Self {
        Self {
            response_type: ResponseType::References,
            content: String::new(),
            done: false,
            references: Some(references),
            error: None,
        }
    }

    pub fn answer_delta(content: impl Into<String>) -> Self {
        Self {
            response_type: ResponseType::Answer,
            content: content.into(),
            done: false,
            references: None,
            error: None,
        }
    }

    pub fn answer_done() -> Self {
        Self {
            response_type: ResponseType::Answer,
            content: String::new(),
            done: true,
            references: None,
            error: None,
        }
    }

    pub fn answer_error(code: impl Into<String>) -> Self {
        Self {
            response_type: ResponseType::Answer,
            content: String::new(),
            done: true,
            references: None,
            error: Some(code.into()),
        }
    }
}
