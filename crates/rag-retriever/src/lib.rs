pub mod hybrid;
pub mod memory;
pub mod qdrant;
pub mod registry;

pub use hybrid::{HybridSearchParams, HybridSearcher, RRF_K};
pub use memory::MemoryRetrieveEngine;
pub use qdrant::QdrantRetrieveEngine;
pub use registry::{IndexService, RetrieveEngineRegistry};

pub use rag_error::{RagError, Result};

use async_trait::async_trait;
use rag_core::{
    IndexInfo, IndexParams, RetrieveParams, RetrieveResult, RetrieverEngineType, RetrieverType,
};
use std::collections::HashMap;

/// 检索引擎适配器。每个后端以能力集合的方式注册：
/// 检索 / 写入 / 估算 / 复制 / 删除，新增后端只需实现本 trait。
#[async_trait]
pub trait RetrieveEngine: Send + Sync {
    /// 引擎后端类型
    fn engine_type(&self) -> RetrieverEngineType;

    /// 支持的检索方式
    fn support(&self) -> Vec<RetrieverType>;

    /// 写入单条索引，按 chunk_id 幂等
    async fn save(&self, info: IndexInfo, params: &IndexParams) -> Result<()> {
        self.batch_save(std::slice::from_ref(&info), params).await
    }

    /// 批量写入索引
    async fn batch_save(&self, infos: &[IndexInfo], params: &IndexParams) -> Result<()>;

    /// 估算该批条目占用的存储（字节）
    async fn estimate_storage_size(&self, infos: &[IndexInfo], params: &IndexParams) -> i64;

    /// 删除指定 chunk 的全部索引条目
    async fn delete_by_chunk_ids(&self, chunk_ids: &[String], dimension: usize) -> Result<()>;

    /// 删除指定 knowledge 拥有的全部索引条目
    async fn delete_by_knowledge_ids(&self, knowledge_ids: &[String], dimension: usize)
        -> Result<()>;

    /// 知识库复制时按 id 映射复制索引载荷，不重新计算向量
    async fn copy_indices(
        &self,
        source_kb_id: &str,
        kb_id_map: &HashMap<String, String>,
        chunk_id_map: &HashMap<String, String>,
        target_kb_id: &str,
        dimension: usize,
    ) -> Result<()>;

    /// 执行检索
    async fn retrieve(&self, params: RetrieveParams) -> Result<Vec<RetrieveResult>>;
}
