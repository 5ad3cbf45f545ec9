use async_trait::async_trait;
use rag_core::{ChunkingConfig, ImageInfo, ObjectStorageConfig};
use rag_error::{RagError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::instrument;

/// DocReader 返回的一个有序分块
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DocChunk {
    pub content: String,
    pub seq: i32,
    pub start_at: i32,
    pub end_at: i32,
    #[serde(default)]
    pub images: Vec<ImageInfo>,
}

/// 传给 DocReader 的解析配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReadConfig {
    pub chunking: ChunkingConfig,
    pub enable_multimodal: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vlm_model_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<ObjectStorageConfig>,
}

/// 文档解析服务。解析与多模态处理在外部服务完成，
/// 这里只拿回有序分块与图片元信息。
#[async_trait]
pub trait DocReader: Send + Sync {
    async fn read_from_file(
        &self,
        file_name: &str,
        data: &[u8],
        config: &ReadConfig,
    ) -> Result<Vec<DocChunk>>;

    async fn read_from_url(&self, url: &str, config: &ReadConfig) -> Result<Vec<DocChunk>>;
}

/// 大文件解析可能极慢
const DOCREADER_TIMEOUT: Duration = Duration::from_secs(12 * 3600);

/// 远端 DocReader 服务客户端
pub struct HttpDocReader {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct ReadResponse {
    chunks: Vec<DocChunk>,
}

impl HttpDocReader {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    async fn parse_response(resp: reqwest::Response) -> Result<Vec<DocChunk>> {
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(RagError::ServiceUnavailable {
                service: format!("docreader ({})", status),
                retry_after: status.is_server_error().then(|| Duration::from_secs(30)),
            });
        }
        let body: ReadResponse = resp.json().await.map_err(|e| RagError::Network {
            operation: "docreader_response_read".into(),
            message: e.to_string(),
        })?;
        Ok(body.chunks)
    }
}

#[async_trait]
impl DocReader for HttpDocReader {
    #[instrument(skip(self, data, config), fields(file = %file_name, bytes = data.len()))]
    async fn read_from_file(
        &self,
        file_name: &str,
        data: &[u8],
        config: &ReadConfig,
    ) -> Result<Vec<DocChunk>> {
        let url = format!("{}/read/file", self.base_url.trim_end_matches('/'));
        let form = reqwest::multipart::Form::new()
            .part(
                "file",
                reqwest::multipart::Part::bytes(data.to_vec()).file_name(file_name.to_string()),
            )
            .text("config", serde_json::to_string(config)?);

        let resp = self
            .http
            .post(&url)
            .timeout(DOCREADER_TIMEOUT)
            .multipart(form)
            .send()
            .await
            .map_err(|e| RagError::ServiceUnavailable {
                service: format!("docreader ({})", e),
                retry_after: Some(Duration::from_secs(30)),
            })?;
        Self::parse_response(resp).await
    }

    #[instrument(skip(self, config))]
    async fn read_from_url(&self, url: &str, config: &ReadConfig) -> Result<Vec<DocChunk>> {
        let endpoint = format!("{}/read/url", self.base_url.trim_end_matches('/'));
        let resp = self
            .http
            .post(&endpoint)
            .timeout(DOCREADER_TIMEOUT)
            .json(&serde_json::json!({ "url": url, "config": config }))
            .send()
            .await
            .map_err(|e| RagError::ServiceUnavailable {
                service: format!("docreader ({})", e),
                retry_after: Some(Duration::from_secs(30)),
            })?;
        Self::parse_response(resp).await
    }
}

/// 纯文本分块器：按分隔符优先级递归切分，带重叠。
/// 用于测试和无外部 DocReader 的部署。
pub struct PlainTextDocReader;

impl PlainTextDocReader {
    fn split_recursive<'a>(text: &'a str, separators: &[String], pieces: &mut Vec<&'a str>) {
        let Some((separator, rest)) = separators.split_first() else {
            pieces.push(text);
            return;
        };
        for part in text.split(separator.as_str()) {
            if part.is_empty() {
                continue;
            }
            if rest.is_empty() {
                pieces.push(part);
            } else {
                Self::split_recursive(part, rest, pieces);
            }
        }
    }

    fn chunk_text(text: &str, config: &ChunkingConfig) -> Vec<DocChunk> {
        let chunk_size = config.chunk_size.max(1) as usize;
        let overlap = config.chunk_overlap.max(0) as usize;

        let mut pieces = Vec::new();
        Self::split_recursive(text, &config.separators, &mut pieces);

        let mut chunks: Vec<DocChunk> = Vec::new();
        let mut current = String::new();
        for piece in pieces {
            let piece = piece.trim();
            if piece.is_empty() {
                continue;
            }
            if !current.is_empty() && current.chars().count() + piece.chars().count() > chunk_size
            {
                chunks.push(DocChunk {
                    content: current.clone(),
                    ..Default::default()
                });
                // 尾部 overlap 个字符进入下一块
                current = if overlap > 0 {
                    let tail: Vec<char> = current.chars().collect();
                    tail[tail.len().saturating_sub(overlap)..].iter().collect()
                } else {
                    String::new()
                };
            }
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(piece);
        }
        if !current.trim().is_empty() {
            chunks.push(DocChunk {
                content: current,
                ..Default::default()
            });
        }

        let mut offset = 0i32;
        for (i, chunk) in chunks.iter_mut().enumerate() {
            chunk.seq = i as i32;
            chunk.start_at = offset;
            chunk.end_at = offset + chunk.content.chars().count() as i32;
            offset = chunk.end_at;
        }
        chunks
    }
}

#[async_trait]
impl DocReader for PlainTextDocReader {
    async fn read_from_file(
        &self,
        _file_name: &str,
        data: &[u8],
        config: &ReadConfig,
    ) -> Result<Vec<DocChunk>> {
        config.chunking.validate()?;
        let text = String::from_utf8_lossy(data);
        Ok(Self::chunk_text(&text, &config.chunking))
    }

    async fn read_from_url(&self, url: &str, _config: &ReadConfig) -> Result<Vec<DocChunk>> {
        Err(RagError::InvalidRequest {
            reason: format!("plain text reader cannot fetch urls: {}", url),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(chunk_size: i32, overlap: i32) -> ReadConfig {
        ReadConfig {
            chunking: ChunkingConfig {
                chunk_size,
                chunk_overlap: overlap,
                separators: vec!["\n\n".into(), "\n".into(), ". ".into()],
                enable_multimodal: false,
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn chunk_order_and_offsets_are_dense() {
        let reader = PlainTextDocReader;
        let text = "First paragraph about stars.\n\nSecond paragraph about planets.\n\nThird paragraph about comets.";
        let chunks = reader
            .read_from_file("a.txt", text.as_bytes(), &config(40, 5))
            .await
            .unwrap();
        assert!(chunks.len() >= 2);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.seq, i as i32);
            assert!(chunk.end_at > chunk.start_at);
        }
    }

    #[tokio::test]
    async fn overlap_not_smaller_than_size_is_rejected() {
        let reader = PlainTextDocReader;
        let err = reader
            .read_from_file("a.txt", b"text", &config(10, 10))
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn empty_separators_are_rejected() {
        let reader = PlainTextDocReader;
        let mut cfg = config(10, 2);
        cfg.chunking.separators.clear();
        let err = reader
            .read_from_file("a.txt", b"text", &cfg)
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::InvalidRequest { .. }));
    }
}
