use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    #[default]
    Chat,
    Embedding,
    Rerank,
    Vlm,
}

/// 模型来源：远端 OpenAI 兼容 API 或本地 ollama
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModelSource {
    #[default]
    Remote,
    Local,
}

impl ModelSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelSource::Remote => "remote",
            ModelSource::Local => "local",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EmbeddingParameters {
    pub dimension: usize,
    /// 输入 token 截断上限，0 表示不截断
    #[serde(default)]
    pub truncate_prompt_tokens: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ModelParameters {
    pub base_url: String,
    pub api_key: String,
    #[serde(default)]
    pub embedding_parameters: EmbeddingParameters,
}

/// 租户可见的模型注册项
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Model {
    pub id: String,
    pub tenant_id: u32,
    pub name: String,
    #[serde(rename = "type")]
    pub model_type: ModelType,
    pub source: ModelSource,
    pub parameters: ModelParameters,
    pub status: String,
}

impl Model {
    /// 内置模型标识：builtin:<source>:<model-name>:<dim>
    pub fn builtin_id(source: ModelSource, name: &str, dimension: usize) -> String {
        format!("builtin:{}:{}:{}", source.as_str(), name, dimension)
    }
}
