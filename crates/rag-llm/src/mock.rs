//! 测试用的确定性模型客户端，不依赖网络。

use async_trait::async_trait;
use rag_core::{ChatMessage, ChatOptions, ChatResponse, ChatUsage, StreamResponse};
use rag_error::Result;
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::chat::ChatModel;
use crate::embedding::Embedder;
use crate::rerank::{RankResult, Reranker};

/// 基于词袋哈希的确定性向量化器。
/// 共享词越多的文本余弦相似度越高，足以驱动检索测试。
pub struct MockEmbedder {
    dimension: usize,
    model_id: String,
}

impl MockEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            model_id: format!("builtin:mock:mock-embedder:{}", dimension),
        }
    }

    fn fnv(token: &str, basis: u64) -> u64 {
        let mut hash = basis;
        for b in token.bytes() {
            hash ^= b as u64;
            hash = hash.wrapping_mul(1099511628211);
        }
        hash
    }

    fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimension];
        let dim = self.dimension as u64;
        for raw in text.to_lowercase().split(|c: char| !c.is_alphanumeric()) {
            // 去掉简单复数，足够让测试里的词形对齐
            let token = raw.strip_suffix('s').unwrap_or(raw);
            if token.is_empty() {
                continue;
            }
            // 每个词占两个桶，降低哈希碰撞带来的假相似
            v[(Self::fnv(token, 1469598103934665603) % dim) as usize] += 1.0;
            v[(Self::fnv(token, 14695981039346656037) % dim) as usize] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_sync(t)).collect())
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimensions(&self) -> usize {
        self.dimension
    }
}

/// 按脚本回放的对话模型，流式按词切分投递
pub struct ScriptedChatModel {
    responses: Mutex<Vec<String>>,
    fallback: String,
}

impl ScriptedChatModel {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses: Mutex::new(responses),
            fallback: "scripted answer".to_string(),
        }
    }

    fn next_response(&self) -> String {
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            self.fallback.clone()
        } else {
            responses.remove(0)
        }
    }
}

#[async_trait]
impl ChatModel for ScriptedChatModel {
    async fn chat(&self, _messages: &[ChatMessage], _opts: &ChatOptions) -> Result<ChatResponse> {
        Ok(ChatResponse {
            content: self.next_response(),
            usage: ChatUsage::default(),
        })
    }

    async fn chat_stream(
        &self,
        _messages: &[ChatMessage],
        _opts: &ChatOptions,
    ) -> Result<mpsc::Receiver<StreamResponse>> {
        let response = self.next_response();
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for word in response.split_inclusive(' ') {
                if tx.send(StreamResponse::answer_delta(word)).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(StreamResponse::answer_done()).await;
        });
        Ok(rx)
    }

    fn model_name(&self) -> &str {
        "scripted"
    }

    fn model_id(&self) -> &str {
        "builtin:mock:scripted-chat:0"
    }
}

/// 词重叠计分的重排器
pub struct MockReranker;

#[async_trait]
impl Reranker for MockReranker {
    async fn rerank(&self, query: &str, passages: &[String]) -> Result<Vec<RankResult>> {
        let query_terms: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(|s| s.to_string())
            .collect();
        let mut results: Vec<RankResult> = passages
            .iter()
            .enumerate()
            .map(|(index, passage)| {
                let text = passage.to_lowercase();
                let matched = query_terms.iter().filter(|t| text.contains(*t)).count();
                let relevance_score = if query_terms.is_empty() {
                    0.0
                } else {
                    matched as f64 / query_terms.len() as f64
                };
                RankResult {
                    index,
                    relevance_score,
                }
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
        "builtin:mock:mock-reranker:0"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_embedder_is_deterministic_and_normalized() {
        let embedder = MockEmbedder::new(64);
        let a = embedder.embed("comets are icy bodies").await.unwrap();
        let b = embedder.embed("comets are icy bodies").await.unwrap();
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn scripted_stream_ends_with_done() {
        let chat = ScriptedChatModel::new(vec!["one two three".into()]);
        let mut rx = chat.chat_stream(&[], &ChatOptions::default()).await.unwrap();
        let mut content = String::new();
        let mut done = 0;
        while let Some(frame) = rx.recv().await {
            if frame.done {
                done += 1;
            } else {
                content.push_str(&frame.content);
            }
        }
        assert_eq!(content, "one two three");
        assert_eq!(done, 1);
    }
}
