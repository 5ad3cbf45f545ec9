use chrono::{DateTime, Utc};
use rag_error::{RagError, Result};
use serde::{Deserialize, Serialize};

/// 文档分块配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub chunk_size: i32,
    pub chunk_overlap: i32,
    /// 切分标记，按优先级排序
    pub separators: Vec<String>,
    pub enable_multimodal: bool,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            chunk_overlap: 50,
            separators: vec!["\n\n".into(), "\n".into(), "。".into(), ".".into()],
            enable_multimodal: false,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size <= 0 {
            return Err(RagError::InvalidRequest {
                reason: "chunk_size must be positive".into(),
            });
        }
        if self.chunk_overlap < 0 || self.chunk_overlap >= self.chunk_size {
            return Err(RagError::InvalidRequest {
                reason: format!(
                    "chunk_overlap {} must be smaller than chunk_size {}",
                    self.chunk_overlap, self.chunk_size
                ),
            });
        }
        if self.separators.is_empty() {
            return Err(RagError::InvalidRequest {
                reason: "separators must not be empty".into(),
            });
        }
        Ok(())
    }
}

/// 对象存储配置，传递给 DocReader 做多模态处理
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ObjectStorageConfig {
    pub provider: String,
    pub bucket_name: String,
    pub endpoint: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub path_prefix: String,
}

/// 知识库，租户下共享分块与模型配置的文档集合
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KnowledgeBase {
    pub id: String,
    pub tenant_id: u32,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub chunking_config: Option<ChunkingConfig>,
    /// 知识库内存在 Knowledge 后不可变更
    pub embedding_model_id: String,
    pub summary_model_id: String,
    pub rerank_model_id: Option<String>,
    pub vlm_model_id: Option<String>,
    #[serde(default)]
    pub storage_config: Option<ObjectStorageConfig>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum KnowledgeType {
    #[default]
    File,
    Url,
    Passage,
}

/// 解析状态机：pending -> processing -> ready | failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParseStatus {
    #[default]
    Pending,
    Processing,
    Ready,
    Failed,
}

/// 知识库中的一个源文档（文件或 URL）
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Knowledge {
    pub id: String,
    pub tenant_id: u32,
    pub knowledge_base_id: String,
    #[serde(rename = "type")]
    pub knowledge_type: KnowledgeType,
    pub title: String,
    pub description: String,
    pub source: String,
    pub file_name: String,
    pub file_path: String,
    pub file_type: String,
    pub file_size: i64,
    /// 内容 sha256，知识库内去重键
    pub file_hash: String,
    pub parse_status: ParseStatus,
    pub enable_status: bool,
    pub embedding_model_id: String,
    /// parse_status = failed 时的错误信息
    pub error_message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
