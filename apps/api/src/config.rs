use config as cfg;
use rag_error::{RagError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// 新会话的检索与兜底默认值
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    #[serde(default = "default_max_rounds")]
    pub max_rounds: i32,
    #[serde(default = "default_embedding_top_k")]
    pub embedding_top_k: i32,
    #[serde(default = "default_keyword_threshold")]
    pub keyword_threshold: f64,
    #[serde(default = "default_vector_threshold")]
    pub vector_threshold: f64,
    #[serde(default = "default_rerank_top_k")]
    pub rerank_top_k: i32,
    #[serde(default = "default_rerank_threshold")]
    pub rerank_threshold: f64,
    #[serde(default)]
    pub enable_rewrite: bool,
    #[serde(default = "default_fallback_response")]
    pub fallback_response: String,
}

fn default_max_rounds() -> i32 {
    5
}
fn default_embedding_top_k() -> i32 {
    10
}
fn default_keyword_threshold() -> f64 {
    0.3
}
fn default_vector_threshold() -> f64 {
    0.5
}
fn default_rerank_top_k() -> i32 {
    5
}
fn default_rerank_threshold() -> f64 {
    0.5
}
fn default_fallback_response() -> String {
    "Sorry, I cannot answer this question.".into()
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            embedding_top_k: default_embedding_top_k(),
            keyword_threshold: default_keyword_threshold(),
            vector_threshold: default_vector_threshold(),
            rerank_top_k: default_rerank_top_k(),
            rerank_threshold: default_rerank_threshold(),
            enable_rewrite: false,
            fallback_response: default_fallback_response(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StreamManagerConfig {
    /// memory | redis
    #[serde(default)]
    pub r#type: String,
    #[serde(default)]
    pub redis_addr: String,
    #[serde(default)]
    pub redis_password: String,
    #[serde(default)]
    pub redis_db: i64,
    #[serde(default)]
    pub redis_prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RetrieverConfig {
    /// 逗号分隔的引擎驱动
    #[serde(default)]
    pub driver: String,
    #[serde(default)]
    pub qdrant_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DocReaderConfig {
    #[serde(default)]
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub stream_manager: StreamManagerConfig,
    #[serde(default)]
    pub retriever: RetrieverConfig,
    #[serde(default)]
    pub docreader: DocReaderConfig,
}

impl AppConfig {
    /// 配置分层：可选的 config/config.yaml，
    /// 再叠加 APP__ 前缀的环境变量，最后是专有环境变量。
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let builder = cfg::Config::builder()
            .add_source(cfg::File::with_name("config/config").required(false))
            .add_source(cfg::Environment::with_prefix("APP").separator("__"));

        let settings = builder.build().map_err(|e| RagError::Configuration {
            key: "config".into(),
            reason: e.to_string(),
        })?;
        let mut config: AppConfig = settings.try_deserialize().unwrap_or_default();

        // 专有环境变量优先
        if let Ok(value) = std::env::var("RETRIEVE_DRIVER") {
            config.retriever.driver = value;
        }
        if config.retriever.driver.is_empty() {
            config.retriever.driver = "memory".into();
        }
        if let Ok(value) = std::env::var("QDRANT_URL") {
            config.retriever.qdrant_url = value;
        }
        if let Ok(value) = std::env::var("STREAM_MANAGER_TYPE") {
            config.stream_manager.r#type = value;
        }
        if let Ok(value) = std::env::var("REDIS_ADDR") {
            config.stream_manager.redis_addr = value;
        }
        if let Ok(value) = std::env::var("REDIS_PASSWORD") {
            config.stream_manager.redis_password = value;
        }
        if let Ok(value) = std::env::var("REDIS_DB") {
            config.stream_manager.redis_db = value.parse().unwrap_or(0);
        }
        if let Ok(value) = std::env::var("REDIS_PREFIX") {
            config.stream_manager.redis_prefix = value;
        }
        if let Ok(value) = std::env::var("DOCREADER_ADDR") {
            config.docreader.addr = value;
        }
        Ok(config)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
