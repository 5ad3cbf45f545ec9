use async_trait::async_trait;
use qdrant_client::qdrant::{
    value::Kind, Condition, CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter,
    PointId, PointStruct, PointsIdsList, ScrollPointsBuilder, SearchPointsBuilder,
    UpsertPointsBuilder, Value, VectorParamsBuilder,
};
use qdrant_client::{Payload, Qdrant};
use rag_core::{
    IndexInfo, IndexParams, MatchType, RetrieveParams, RetrieveResult, RetrieverEngineType,
    RetrieverType,
};
use rag_error::{RagError, Result};
use serde_json::json;
use std::collections::HashMap;
use tracing::{info, instrument, warn};

/// Qdrant 向量引擎。向量由调用方预先算好，
/// 集合按维度切分，复制索引不触发重新向量化。
pub struct QdrantRetrieveEngine {
    client: Qdrant,
    collection_prefix: String,
}

const SCROLL_PAGE_SIZE: u32 = 256;

impl QdrantRetrieveEngine {
    pub fn new(url: &str, collection_prefix: impl Into<String>) -> Result<Self> {
        let client = Qdrant::from_url(url)
            .build()
            .map_err(|e| RagError::VectorStore {
                operation: "connect".into(),
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            collection_prefix: collection_prefix.into(),
        })
    }

    fn collection_name(&self, dimension: usize) -> String {
        format!("{}_{}", self.collection_prefix, dimension)
    }

    async fn ensure_collection(&self, dimension: usize) -> Result<String> {
        let name = self.collection_name(dimension);
        let exists = self
            .client
            .collection_exists(&name)
            .await
            .map_err(|e| RagError::VectorStore {
                operation: "collection_exists".into(),
                message: e.to_string(),
            })?;
        if !exists {
            self.client
                .create_collection(
                    CreateCollectionBuilder::new(&name).vectors_config(
                        VectorParamsBuilder::new(dimension as u64, Distance::Cosine).build(),
                    ),
                )
                .await
                .map_err(|e| RagError::VectorStore {
                    operation: "create_collection".into(),
                    message: e.to_string(),
                })?;
            info!(collection = %name, "created qdrant collection");
        }
        Ok(name)
    }

    fn value_str(value: &Value) -> String {
        match &value.kind {
            Some(Kind::StringValue(s)) => s.clone(),
            _ => String::new(),
        }
    }

    fn value_int(value: &Value) -> i64 {
        match &value.kind {
            Some(Kind::IntegerValue(i)) => *i,
            _ => 0,
        }
    }

    fn payload_to_result(
        payload: &HashMap<String, Value>,
        score: f64,
    ) -> RetrieveResult {
        let get = |key: &str| payload.get(key).map(Self::value_str).unwrap_or_default();
        let image_info = get("image_info");
        RetrieveResult {
            chunk_id: get("chunk_id"),
            knowledge_id: get("knowledge_id"),
            knowledge_base_id: get("knowledge_base_id"),
            content: get("content"),
            chunk_index: payload
                .get("chunk_index")
                .map(Self::value_int)
                .unwrap_or_default() as i32,
            score,
            match_type: MatchType::Vector,
            image_info: (!image_info.is_empty()).then_some(image_info),
        }
    }

    fn kb_filter(knowledge_base_ids: &[String]) -> Filter {
        Filter::should(
            knowledge_base_ids
                .iter()
                .map(|id| Condition::matches("knowledge_base_id", id.clone()))
                .collect::<Vec<_>>(),
        )
    }
}

#[async_trait]
impl crate::RetrieveEngine for QdrantRetrieveEngine {
    fn engine_type(&self) -> RetrieverEngineType {
        RetrieverEngineType::Qdrant
    }

    fn support(&self) -> Vec<RetrieverType> {
        vec![RetrieverType::Vector]
    }

    #[instrument(skip(self, infos, params), fields(batch = infos.len()))]
    async fn batch_save(&self, infos: &[IndexInfo], params: &IndexParams) -> Result<()> {
        if !params.retriever_types.contains(&RetrieverType::Vector) {
            return Ok(());
        }
        let collection = self.ensure_collection(params.dimension).await?;

        let mut points = Vec::with_capacity(infos.len());
        for info in infos {
            let vector =
                params
                    .embeddings
                    .get(&info.chunk_id)
                    .ok_or_else(|| RagError::VectorStore {
                        operation: "batch_save".into(),
                        message: format!("missing embedding for chunk {}", info.chunk_id),
                    })?;
            let payload: Payload = json!({
                "chunk_id": info.chunk_id,
                "knowledge_id": info.knowledge_id,
                "knowledge_base_id": info.knowledge_base_id,
                "content": info.content,
                "chunk_index": info.chunk_index,
                "image_info": info.image_info.clone().unwrap_or_default(),
            })
            .try_into()
            .map_err(|e| RagError::Serialization {
                format: "qdrant_payload".into(),
                message: format!("{:?}", e),
            })?;
            points.push(PointStruct::new(
                info.chunk_id.clone(),
                vector.clone(),
                payload,
            ));
        }

        self.client
            .upsert_points(UpsertPointsBuilder::new(&collection, points).wait(true))
            .await
            .map_err(|e| RagError::VectorStore {
                operation: "upsert_points".into(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn estimate_storage_size(&self, infos: &[IndexInfo], params: &IndexParams) -> i64 {
        infos
            .iter()
            .map(|info| (info.content.len() + params.dimension * std::mem::size_of::<f32>()) as i64)
            .sum()
    }

    async fn delete_by_chunk_ids(&self, chunk_ids: &[String], dimension: usize) -> Result<()> {
        if chunk_ids.is_empty() {
            return Ok(());
        }
        let collection = self.collection_name(dimension);
        let ids: Vec<PointId> = chunk_ids.iter().map(|id| id.clone().into()).collect();
        self.client
            .delete_points(
                DeletePointsBuilder::new(&collection)
                    .points(PointsIdsList { ids })
                    .wait(true),
            )
            .await
            .map_err(|e| RagError::VectorStore {
                operation: "delete_by_chunk_ids".into(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    async fn delete_by_knowledge_ids(
        &self,
        knowledge_ids: &[String],
        dimension: usize,
    ) -> Result<()> {
        if knowledge_ids.is_empty() {
            return Ok(());
        }
        let collection = self.collection_name(dimension);
        let filter = Filter::should(
            knowledge_ids
                .iter()
                .map(|id| Condition::matches("knowledge_id", id.clone()))
                .collect::<Vec<_>>(),
        );
        self.client
            .delete_points(
                DeletePointsBuilder::new(&collection)
                    .points(filter)
                    .wait(true),
            )
            .await
            .map_err(|e| RagError::VectorStore {
                operation: "delete_by_knowledge_ids".into(),
                message: e.to_string(),
            })?;
        Ok(())
    }

    /// 逐页 scroll 源知识库的点位，映射 id 后带原向量重新写入
    #[instrument(skip(self, kb_id_map, chunk_id_map))]
    async fn copy_indices(
        &self,
        source_kb_id: &str,
        kb_id_map: &HashMap<String, String>,
        chunk_id_map: &HashMap<String, String>,
        target_kb_id: &str,
        dimension: usize,
    ) -> Result<()> {
        let collection = self.collection_name(dimension);
        let filter = Filter::must([Condition::matches(
            "knowledge_base_id",
            source_kb_id.to_string(),
        )]);

        let mut offset: Option<PointId> = None;
        loop {
            let mut builder = ScrollPointsBuilder::new(&collection)
                .filter(filter.clone())
                .with_payload(true)
                .with_vectors(true)
                .limit(SCROLL_PAGE_SIZE);
            if let Some(ref o) = offset {
                builder = builder.offset(o.clone());
            }
            let page = self
                .client
                .scroll(builder)
                .await
                .map_err(|e| RagError::VectorStore {
                    operation: "scroll".into(),
                    message: e.to_string(),
                })?;

            let mut points = Vec::new();
            for point in page.result {
                let source_chunk_id = point
                    .payload
                    .get("chunk_id")
                    .map(Self::value_str)
                    .unwrap_or_default();
                let Some(new_chunk_id) = chunk_id_map.get(&source_chunk_id) else {
                    continue;
                };
                let Some(vector) = point.vectors.as_ref().and_then(|v| match &v.vectors_options {
                    Some(qdrant_client::qdrant::vectors_output::VectorsOptions::Vector(v)) => {
                        Some(v.data.clone())
                    }
                    _ => None,
                }) else {
                    warn!(chunk_id = %source_chunk_id, "source point has no vector, skipping");
                    continue;
                };

                let target_kb = kb_id_map
                    .get(source_kb_id)
                    .cloned()
                    .unwrap_or_else(|| target_kb_id.to_string());
                let payload: Payload = json!({
                    "chunk_id": new_chunk_id,
                    "knowledge_id": point.payload.get("knowledge_id").map(Self::value_str).unwrap_or_default(),
                    "knowledge_base_id": target_kb,
                    "content": point.payload.get("content").map(Self::value_str).unwrap_or_default(),
                    "chunk_index": point.payload.get("chunk_index").map(Self::value_int).unwrap_or_default(),
                    "image_info": point.payload.get("image_info").map(Self::value_str).unwrap_or_default(),
                })
                .try_into()
                .map_err(|e| RagError::Serialization {
                    format: "qdrant_payload".into(),
                    message: format!("{:?}", e),
                })?;
                points.push(PointStruct::new(new_chunk_id.clone(), vector, payload));
            }

            if !points.is_empty() {
                self.client
                    .upsert_points(UpsertPointsBuilder::new(&collection, points).wait(true))
                    .await
                    .map_err(|e| RagError::VectorStore {
                        operation: "copy_upsert".into(),
                        message: e.to_string(),
                    })?;
            }

            match page.next_page_offset {
                Some(next) => offset = Some(next),
                None => break,
            }
        }
        Ok(())
    }

    #[instrument(skip(self, params), fields(top_k = params.top_k))]
    async fn retrieve(&self, params: RetrieveParams) -> Result<Vec<RetrieveResult>> {
        if params.top_k == 0 {
            return Ok(Vec::new());
        }
        let query_vector = params.query_embedding.ok_or(RagError::InvalidRequest {
            reason: "vector retrieval requires a query embedding".into(),
        })?;
        let collection = self.collection_name(query_vector.len());

        let mut builder =
            SearchPointsBuilder::new(&collection, query_vector, params.top_k as u64)
                .with_payload(true)
                .score_threshold(params.threshold as f32);
        if !params.knowledge_base_ids.is_empty() {
            builder = builder.filter(Self::kb_filter(&params.knowledge_base_ids));
        }

        let response = self
            .client
            .search_points(builder)
            .await
            .map_err(|e| RagError::VectorStore {
                operation: "search_points".into(),
                message: e.to_string(),
            })?;

        Ok(response
            .result
            .iter()
            .map(|point| Self::payload_to_result(&point.payload, point.score as f64))
            .collect())
    }
}
