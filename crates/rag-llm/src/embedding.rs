use async_trait::async_trait;
use rag_error::{RagError, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{instrument, warn};

/// 向量化客户端抽象。输出维度对配置的模型恒定。
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn model_id(&self) -> &str;

    fn dimensions(&self) -> usize;
}

const DEFAULT_EMBED_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_ATTEMPTS: usize = 3;
const DEFAULT_RETRY_BASE_MS: u64 = 500;

// ========== OpenAI-compatible remote embedder ==========

pub struct RemoteApiEmbedder {
    http: Client,
    model_name: String,
    model_id: String,
    base_url: String,
    api_key: String,
    dimension: usize,
    /// 输入 token 截断上限，0 表示不截断
    truncate_prompt_tokens: usize,
    max_attempts: usize,
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    truncate_prompt_tokens: Option<usize>,
}

#[derive(Deserialize)]
struct EmbedData {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct EmbedResponse {
    data: Vec<EmbedData>,
}

impl RemoteApiEmbedder {
    pub fn new(
        model_name: String,
        model_id: String,
        base_url: String,
        api_key: String,
        dimension: usize,
        truncate_prompt_tokens: usize,
    ) -> Self {
        Self {
            http: Client::new(),
            model_name,
            model_id,
            base_url,
            api_key,
            dimension,
            truncate_prompt_tokens,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// 瞬时故障按指数退避重试，4xx 视为永久错误直接上抛
    async fn request_embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let body = EmbedRequest {
            model: &self.model_name,
            input: texts,
            truncate_prompt_tokens: if self.truncate_prompt_tokens > 0 {
                Some(self.truncate_prompt_tokens)
            } else {
                None
            },
        };

        let mut backoff_ms = DEFAULT_RETRY_BASE_MS;
        let mut attempt = 0usize;

        loop {
            attempt += 1;
            let result = self
                .http
                .post(&url)
                .bearer_auth(&self.api_key)
                .timeout(DEFAULT_EMBED_TIMEOUT)
                .json(&body)
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => {
                    let data: EmbedResponse = resp.json().await.map_err(|e| RagError::Network {
                        operation: "embed_response_read".into(),
                        message: e.to_string(),
                    })?;
                    return Ok(data.data.into_iter().map(|d| d.embedding).collect());
                }
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    let retryable = status.as_u16() == 429 || status.is_server_error();
                    if retryable && attempt < self.max_attempts {
                        warn!(attempt, %status, "embedding request failed, retrying");
                        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                        backoff_ms = backoff_ms.saturating_mul(2);
                        continue;
                    }
                    return Err(RagError::EmbeddingService {
                        provider: "remote_api".into(),
                        message: format!("status={} body={}", status, text),
                        retry_after: retryable.then(|| Duration::from_secs(30)),
                    });
                }
                Err(e) => {
                    if attempt < self.max_attempts {
                        warn!(attempt, error = %e, "embedding request failed, retrying");
                        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                        backoff_ms = backoff_ms.saturating_mul(2);
                        continue;
                    }
                    return Err(RagError::EmbeddingService {
                        provider: "remote_api".into(),
                        message: e.to_string(),
                        retry_after: Some(Duration::from_secs(30)),
                    });
                }
            }
        }
    }

    fn check_dimension(&self, vectors: &[Vec<f32>]) -> Result<()> {
        for v in vectors {
            if v.len() != self.dimension {
                return Err(RagError::EmbeddingService {
                    provider: "remote_api".into(),
                    message: format!(
                        "model {} returned dimension {}, expected {}",
                        self.model_name,
                        v.len(),
                        self.dimension
                    ),
                    retry_after: None,
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Embedder for RemoteApiEmbedder {
    #[instrument(skip(self, text))]
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors.into_iter().next().ok_or(RagError::EmbeddingService {
            provider: "remote_api".into(),
            message: "empty embedding response".into(),
            retry_after: None,
        })
    }

    #[instrument(skip(self, texts), fields(batch = texts.len()))]
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = self.request_embeddings(texts).await?;
        self.check_dimension(&vectors)?;
        Ok(vectors)
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimensions(&self) -> usize {
        self.dimension
    }
}

// ========== Ollama local embedder ==========

pub struct OllamaEmbedder {
    http: Client,
    model_name: String,
    model_id: String,
    base_url: String,
    dimension: usize,
    /// 首次使用前确保模型已拉取
    pulled: tokio::sync::OnceCell<()>,
}

#[derive(Serialize)]
struct OllamaEmbedRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct OllamaEmbedResponse {
    embedding: Vec<f32>,
}

#[derive(Serialize)]
struct OllamaPullRequest<'a> {
    name: &'a str,
    stream: bool,
}

impl OllamaEmbedder {
    pub fn new(model_name: String, model_id: String, base_url: String, dimension: usize) -> Self {
        Self {
            http: Client::new(),
            model_name,
            model_id,
            base_url,
            dimension,
            pulled: tokio::sync::OnceCell::new(),
        }
    }

    async fn ensure_model_available(&self) -> Result<()> {
        self.pulled
            .get_or_try_init(|| async {
                let url = format!("{}/api/pull", self.base_url.trim_end_matches('/'));
                let resp = self
                    .http
                    .post(&url)
                    .json(&OllamaPullRequest {
                        name: &self.model_name,
                        stream: false,
                    })
                    .send()
                    .await
                    .map_err(|e| RagError::ServiceUnavailable {
                        service: format!("ollama ({})", e),
                        retry_after: Some(Duration::from_secs(10)),
                    })?;
                if !resp.status().is_success() {
                    return Err(RagError::ServiceUnavailable {
                        service: format!("ollama pull ({})", resp.status()),
                        retry_after: None,
                    });
                }
                Ok(())
            })
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    #[instrument(skip(self, text))]
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.ensure_model_available().await?;

        let url = format!("{}/api/embeddings", self.base_url.trim_end_matches('/'));
        let resp = self
            .http
            .post(&url)
            .timeout(DEFAULT_EMBED_TIMEOUT)
            .json(&OllamaEmbedRequest {
                model: &self.model_name,
                prompt: text,
            })
            .send()
            .await
            .map_err(|e| RagError::EmbeddingService {
                provider: "ollama".into(),
                message: e.to_string(),
                retry_after: Some(Duration::from_secs(10)),
            })?;

        if !resp.status().is_success() {
            return Err(RagError::EmbeddingService {
                provider: "ollama".into(),
                message: format!("status={}", resp.status()),
                retry_after: None,
            });
        }

        let data: OllamaEmbedResponse = resp.json().await.map_err(|e| RagError::Network {
            operation: "ollama_embed_read".into(),
            message: e.to_string(),
        })?;
        Ok(data.embedding)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        // ollama 的 embeddings 接口是单条的，串行即可，批内并发由上层信号量控制
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimensions(&self) -> usize {
        self.dimension
    }
}
