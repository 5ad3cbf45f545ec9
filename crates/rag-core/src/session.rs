use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 检索无结果时的兜底策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FallbackStrategy {
    /// 返回固定话术
    #[default]
    Fixed,
    /// 让模型在无上下文时直接回答
    Model,
}

/// 总结模型参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryConfig {
    pub max_tokens: i32,
    pub top_p: f64,
    pub frequency_penalty: f64,
    pub presence_penalty: f64,
    /// 系统提示词
    pub prompt: String,
    /// 上下文模板，字段：Query / Contexts / CurrentTime / CurrentWeek
    pub context_template: String,
    /// 无匹配时答案前缀
    pub no_match_prefix: String,
    pub temperature: f64,
    pub max_completion_tokens: i32,
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            max_tokens: 2048,
            top_p: 0.9,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            prompt: DEFAULT_SUMMARY_PROMPT.to_string(),
            context_template: DEFAULT_CONTEXT_TEMPLATE.to_string(),
            no_match_prefix: String::new(),
            temperature: 0.3,
            max_completion_tokens: 0,
        }
    }
}

pub const DEFAULT_SUMMARY_PROMPT: &str = "You are a helpful assistant. Answer the user's \
question strictly based on the provided context. If the context does not contain the answer, \
say you do not know.";

pub const DEFAULT_CONTEXT_TEMPLATE: &str = "Current time: {{CurrentTime}} ({{CurrentWeek}})\n\
Known information:\n{{#each Contexts}}{{this}}\n---\n{{/each}}\n\
Question: {{Query}}";

/// 会话，持有一次多轮问答的检索与兜底配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub title: String,
    pub description: String,
    pub tenant_id: u32,
    pub knowledge_base_id: String,

    /// 多轮保留轮数
    pub max_rounds: i32,
    /// 是否启用多轮改写
    pub enable_rewrite: bool,
    pub fallback_strategy: FallbackStrategy,
    pub fallback_response: String,
    /// 向量召回 TopK
    pub embedding_top_k: i32,
    pub keyword_threshold: f64,
    pub vector_threshold: f64,
    pub rerank_model_id: String,
    pub rerank_top_k: i32,
    pub rerank_threshold: f64,
    pub summary_model_id: String,
    pub summary_parameters: SummaryConfig,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for Session {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            title: String::new(),
            description: String::new(),
            tenant_id: 0,
            knowledge_base_id: String::new(),
            max_rounds: 5,
            enable_rewrite: false,
            fallback_strategy: FallbackStrategy::Fixed,
            fallback_response: "Sorry, I cannot answer this question.".to_string(),
            embedding_top_k: 10,
            keyword_threshold: 0.3,
            vector_threshold: 0.5,
            rerank_model_id: String::new(),
            rerank_top_k: 5,
            rerank_threshold: 0.5,
            summary_model_id: String::new(),
            summary_parameters: SummaryConfig::default(),
            created_at: now,
            updated_at: now,
        }
    }
}
