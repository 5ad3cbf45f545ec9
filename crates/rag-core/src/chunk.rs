use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Chunk 类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    #[default]
    Text,
    ImageOcr,
    ImageCaption,
    Summary,
    Entity,
    Relationship,
}

/// chunk 关联的图片信息，序列化为 JSON 列表存放在 Chunk.image_info
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ImageInfo {
    /// 对象存储中的图片 URL
    #[serde(default)]
    pub url: String,
    /// 原始图片 URL
    #[serde(default)]
    pub original_url: String,
    /// 图片在文本中的起始位置
    #[serde(default)]
    pub start_pos: i32,
    /// 图片在文本中的结束位置
    #[serde(default)]
    pub end_pos: i32,
    #[serde(default)]
    pub caption: String,
    #[serde(default)]
    pub ocr_text: String,
}

/// 文档分块，知识库检索的基本单位。
/// 同一 Knowledge 内 chunk_index 稠密递增，pre/next 构成双向链。
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Chunk {
    pub id: String,
    pub tenant_id: u32,
    pub knowledge_id: String,
    pub knowledge_base_id: String,
    pub content: String,
    pub chunk_index: i32,
    pub is_enabled: bool,
    /// 原文中的起止字符位置
    pub start_at: i32,
    pub end_at: i32,
    pub pre_chunk_id: String,
    pub next_chunk_id: String,
    pub chunk_type: ChunkType,
    /// 图片 chunk 关联的原文 chunk
    pub parent_chunk_id: String,
    /// 图片信息，JSON 字符串
    pub image_info: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// 软删除标记，被消息引用的 chunk 删除后仍可解析
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Chunk {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// 解析 image_info JSON，解析失败视为无图片
    pub fn parse_image_info(&self) -> Vec<ImageInfo> {
        if self.image_info.is_empty() {
            return Vec::new();
        }
        serde_json::from_str(&self.image_info).unwrap_or_default()
    }
}
