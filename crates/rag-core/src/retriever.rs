use serde::{Deserialize, Serialize};

/// 检索方式：向量 / 关键词
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrieverType {
    Vector,
    Keyword,
}

/// 检索引擎后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrieverEngineType {
    Memory,
    Qdrant,
}

impl RetrieverEngineType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrieverEngineType::Memory => "memory",
            RetrieverEngineType::Qdrant => "qdrant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Some(RetrieverEngineType::Memory),
            "qdrant" => Some(RetrieverEngineType::Qdrant),
            _ => None,
        }
    }
}

/// 租户配置的一个 (检索方式, 引擎后端) 组合
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RetrieverEngineParams {
    pub retriever_type: RetrieverType,
    pub retriever_engine_type: RetrieverEngineType,
}

/// 结果命中类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Vector,
    Keyword,
    Hybrid,
}

impl From<RetrieverType> for MatchType {
    fn from(t: RetrieverType) -> Self {
        match t {
            RetrieverType::Vector => MatchType::Vector,
            RetrieverType::Keyword => MatchType::Keyword,
        }
    }
}

/// 写入索引的条目，引擎按 chunk_id 幂等存储
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IndexInfo {
    pub chunk_id: String,
    pub knowledge_id: String,
    pub knowledge_base_id: String,
    pub content: String,
    pub chunk_index: i32,
    /// 图片信息快照（JSON），随索引条目返回
    pub image_info: Option<String>,
}

/// 索引写入的附加参数
#[derive(Debug, Clone, Default)]
pub struct IndexParams {
    /// 本次写入要覆盖的检索方式，引擎只处理自己支持的部分
    pub retriever_types: Vec<RetrieverType>,
    /// chunk_id -> 预计算向量，向量引擎必需
    pub embeddings: std::collections::HashMap<String, Vec<f32>>,
    pub dimension: usize,
}

/// 单引擎检索参数
#[derive(Debug, Clone, Default)]
pub struct RetrieveParams {
    pub query: String,
    /// 预计算的查询向量，向量检索时复用
    pub query_embedding: Option<Vec<f32>>,
    pub knowledge_base_ids: Vec<String>,
    pub top_k: usize,
    pub threshold: f64,
    pub retriever_type: Option<RetrieverType>,
}

/// 单条检索结果，携带 chunk 快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrieveResult {
    pub chunk_id: String,
    pub knowledge_id: String,
    pub knowledge_base_id: String,
    pub content: String,
    pub chunk_index: i32,
    pub score: f64,
    pub match_type: MatchType,
    pub image_info: Option<String>,
}
