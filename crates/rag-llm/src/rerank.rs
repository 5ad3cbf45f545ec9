use async_trait::async_trait;
use rag_error::{RagError, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::instrument;

/// 单条重排结果，index 指向传入的 passage 下标
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankResult {
    pub index: usize,
    pub relevance_score: f64,
}

/// 重排器抽象。只负责打分排序，阈值过滤由管线完成。
#[async_trait]
pub trait Reranker: Send + Sync {
    /// 对 (query, passage) 逐对打分，按分数降序返回
    async fn rerank(&self, query: &str, passages: &[String]) -> Result<Vec<RankResult>>;

    fn model_id(&self) -> &str;
}

const DEFAULT_RERANK_TIMEOUT: Duration = Duration::from_secs(15);

pub struct RemoteApiReranker {
    http: Client,
    model_name: String,
    model_id: String,
    base_url: String,
    api_key: String,
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [String],
}

#[derive(Deserialize)]
struct RerankResultItem {
    index: usize,
    relevance_score: f64,
}

#[derive(Deserialize)]
struct RerankResponse {
    results: Vec<RerankResultItem>,
}

impl RemoteApiReranker {
    pub fn new(model_name: String, model_id: String, base_url: String, api_key: String) -> Self {
        Self {
            http: Client::new(),
            model_name,
            model_id,
            base_url,
            api_key,
        }
    }
}

#[async_trait]
impl Reranker for RemoteApiReranker {
    #[instrument(skip(self, query, passages), fields(model = %self.model_name, passages = passages.len()))]
    async fn rerank(&self, query: &str, passages: &[String]) -> Result<Vec<RankResult>> {
        if passages.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/rerank", self.base_url.trim_end_matches('/'));
        let body = RerankRequest {
            model: &self.model_name,
            query,
            documents: passages,
        };

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(DEFAULT_RERANK_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| RagError::RerankService {
                provider: "remote_api".into(),
                message: e.to_string(),
                retry_after: Some(Duration::from_secs(10)),
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(RagError::RerankService {
                provider: "remote_api".into(),
                message: format!("status={} body={}", status, text),
                retry_after: (status.as_u16() == 429).then(|| Duration::from_secs(60)),
            });
        }

        let data: RerankResponse = resp.json().await.map_err(|e| RagError::Network {
            operation: "rerank_response_read".into(),
            message: e.to_string(),
        })?;

        let mut results: Vec<RankResult> = data
            .results
            .into_iter()
            .map(|r| RankResult {
                index: r.index,
                relevance_score: r.relevance_score,
            })
            .collect();
        results.sort_by(|a, b| {
            b.relevance_score
                .partial_cmp(&a.relevance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(results)
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}
