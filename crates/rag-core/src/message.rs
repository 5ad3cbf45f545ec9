use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::retriever::{MatchType, RetrieveResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    #[default]
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }
}

/// 答案引用的一条知识来源
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reference {
    pub chunk_id: String,
    pub knowledge_id: String,
    pub score: f64,
    pub match_type: MatchType,
}

pub type References = Vec<Reference>;

impl From<&RetrieveResult> for Reference {
    fn from(r: &RetrieveResult) -> Self {
        Reference {
            chunk_id: r.chunk_id.clone(),
            knowledge_id: r.knowledge_id.clone(),
            score: r.score,
            match_type: r.match_type,
        }
    }
}

/// 会话内的一条消息，按 created_at 排序
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    /// 产生该消息的请求 ID，续流时作为定位键
    pub request_id: String,
    pub role: MessageRole,
    pub content: String,
    pub knowledge_references: References,
    pub is_completed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}
