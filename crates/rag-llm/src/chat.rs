use async_trait::async_trait;
use futures::StreamExt;
use rag_core::{ChatMessage, ChatOptions, ChatResponse, ChatUsage, StreamResponse};
use rag_error::{RagError, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

/// 对话模型客户端抽象
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// 非流式对话
    async fn chat(&self, messages: &[ChatMessage], opts: &ChatOptions) -> Result<ChatResponse>;

    /// 流式对话。增量按到达顺序投递，最后恰好一个 done=true 帧；
    /// 接收端关闭后生产任务随之退出。
    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        opts: &ChatOptions,
    ) -> Result<mpsc::Receiver<StreamResponse>>;

    fn model_name(&self) -> &str;

    fn model_id(&self) -> &str;
}

const DEFAULT_CHAT_TIMEOUT: Duration = Duration::from_secs(600);
const STREAM_CHANNEL_CAPACITY: usize = 64;

const DASHSCOPE_COMPAT_BASE_URL: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";

// ========== OpenAI-compatible remote chat ==========

pub struct RemoteApiChat {
    http: Client,
    model_name: String,
    model_id: String,
    base_url: String,
    api_key: String,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f64>,
    /// qwen 系列的私有字段，非流式调用必须显式关闭
    #[serde(skip_serializing_if = "Option::is_none")]
    enable_thinking: Option<bool>,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize, Default)]
struct ChatUsageBody {
    #[serde(default)]
    prompt_tokens: i32,
    #[serde(default)]
    completion_tokens: i32,
    #[serde(default)]
    total_tokens: i32,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsageBody>,
}

impl RemoteApiChat {
    pub fn new(model_name: String, model_id: String, base_url: String, api_key: String) -> Self {
        Self {
            http: Client::new(),
            model_name,
            model_id,
            base_url,
            api_key,
        }
    }

    /// 阿里云兼容端点上的 qwen3 模型需要特殊处理
    fn is_dashscope_qwen3(&self) -> bool {
        self.model_name.starts_with("qwen3-")
            && self.base_url.trim_end_matches('/') == DASHSCOPE_COMPAT_BASE_URL
    }

    fn build_request<'a>(
        &'a self,
        messages: &'a [ChatMessage],
        opts: &ChatOptions,
        is_stream: bool,
    ) -> ChatCompletionRequest<'a> {
        let positive_f = |v: f64| (v > 0.0).then_some(v);
        let positive_i = |v: i32| (v > 0).then_some(v);

        ChatCompletionRequest {
            model: &self.model_name,
            messages,
            stream: is_stream,
            temperature: positive_f(opts.temperature),
            top_p: positive_f(opts.top_p),
            max_tokens: positive_i(opts.max_tokens),
            max_completion_tokens: positive_i(opts.max_completion_tokens),
            frequency_penalty: positive_f(opts.frequency_penalty),
            presence_penalty: positive_f(opts.presence_penalty),
            enable_thinking: if !is_stream && self.is_dashscope_qwen3() {
                Some(false)
            } else {
                opts.thinking
            },
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    /// 解析一行 SSE 数据帧
    fn parse_sse_line(line: &str) -> Option<Value> {
        let data = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:"))?;
        let data = data.trim();
        if data == "[DONE]" {
            return None;
        }
        serde_json::from_str(data).ok()
    }
}

#[async_trait]
impl ChatModel for RemoteApiChat {
    #[instrument(skip(self, messages, opts), fields(model = %self.model_name))]
    async fn chat(&self, messages: &[ChatMessage], opts: &ChatOptions) -> Result<ChatResponse> {
        let body = self.build_request(messages, opts, false);

        let resp = self
            .http
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .timeout(DEFAULT_CHAT_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| RagError::LlmService {
                provider: "remote_api".into(),
                message: e.to_string(),
                retry_after: Some(Duration::from_secs(10)),
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(RagError::LlmService {
                provider: "remote_api".into(),
                message: format!("status={} body={}", status, text),
                retry_after: (status.as_u16() == 429 || status.is_server_error())
                    .then(|| Duration::from_secs(30)),
            });
        }

        let data: ChatCompletionResponse = resp.json().await.map_err(|e| RagError::Network {
            operation: "chat_response_read".into(),
            message: e.to_string(),
        })?;

        let content = data
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or(RagError::LlmService {
                provider: "remote_api".into(),
                message: "no choices in response".into(),
                retry_after: None,
            })?;
        let usage = data.usage.unwrap_or_default();

        Ok(ChatResponse {
            content,
            usage: ChatUsage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            },
        })
    }

    #[instrument(skip(self, messages, opts), fields(model = %self.model_name))]
    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        opts: &ChatOptions,
    ) -> Result<mpsc::Receiver<StreamResponse>> {
        let body = self.build_request(messages, opts, true);

        let resp = self
            .http
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .timeout(DEFAULT_CHAT_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| RagError::LlmService {
                provider: "remote_api".into(),
                message: e.to_string(),
                retry_after: Some(Duration::from_secs(10)),
            })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(RagError::LlmService {
                provider: "remote_api".into(),
                message: format!("status={} body={}", status, text),
                retry_after: None,
            });
        }

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            let mut buffer = String::new();

            'outer: while let Some(next) = stream.next().await {
                let bytes = match next {
                    Ok(b) => b,
                    Err(e) => {
                        warn!(error = %e, "chat stream interrupted");
                        break;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                // 逐行消费，残缺行留在缓冲区
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);
                    if line.is_empty() || line.starts_with(':') {
                        continue;
                    }
                    if line == "data: [DONE]" {
                        break 'outer;
                    }
                    if let Some(data) = Self::parse_sse_line(&line) {
                        let delta = data
                            .get("choices")
                            .and_then(|c| c.get(0))
                            .and_then(|c| c.get("delta"))
                            .and_then(|d| d.get("content"))
                            .and_then(|v| v.as_str())
                            .unwrap_or_default();
                        if !delta.is_empty()
                            && tx.send(StreamResponse::answer_delta(delta)).await.is_err()
                        {
                            // 接收端已取消
                            return;
                        }
                    }
                }
            }

            let _ = tx.send(StreamResponse::answer_done()).await;
        });

        Ok(rx)
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

// ========== Ollama local chat ==========

pub struct OllamaChat {
    http: Client,
    model_name: String,
    model_id: String,
    base_url: String,
    pulled: tokio::sync::OnceCell<()>,
}

#[derive(Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize, Default)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<i32>,
}

#[derive(Deserialize)]
struct OllamaChatChunk {
    #[serde(default)]
    message: Option<OllamaChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: i32,
    #[serde(default)]
    eval_count: i32,
}

#[derive(Deserialize)]
struct OllamaChunkMessage {
    #[serde(default)]
    content: String,
}

impl OllamaChat {
    pub fn new(model_name: String, model_id: String, base_url: String) -> Self {
        Self {
            http: Client::new(),
            model_name,
            model_id,
            base_url,
            pulled: tokio::sync::OnceCell::new(),
        }
    }

    fn build_options(opts: &ChatOptions) -> OllamaOptions {
        OllamaOptions {
            temperature: (opts.temperature > 0.0).then_some(opts.temperature),
            top_p: (opts.top_p > 0.0).then_some(opts.top_p),
            num_predict: (opts.max_tokens > 0).then_some(opts.max_tokens),
        }
    }

    async fn ensure_model_available(&self) -> Result<()> {
        self.pulled
            .get_or_try_init(|| async {
                let url = format!("{}/api/pull", self.base_url.trim_end_matches('/'));
                debug!(model = %self.model_name, "pulling ollama model");
                let resp = self
                    .http
                    .post(&url)
                    .json(&serde_json::json!({ "name": self.model_name, "stream": false }))
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
impl ChatModel for OllamaChat {
    #[instrument(skip(self, messages, opts), fields(model = %self.model_name))]
    async fn chat(&self, messages: &[ChatMessage], opts: &ChatOptions) -> Result<ChatResponse> {
        self.ensure_model_available().await?;

        let url = format!("{}/api/chat", self.base_url.trim_end_matches('/'));
        let body = OllamaChatRequest {
            model: &self.model_name,
            messages,
            stream: false,
            options: Self::build_options(opts),
        };

        let resp = self
            .http
            .post(&url)
            .timeout(DEFAULT_CHAT_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| RagError::LlmService {
                provider: "ollama".into(),
                message: e.to_string(),
                retry_after: Some(Duration::from_secs(10)),
            })?;

        if !resp.status().is_success() {
            return Err(RagError::LlmService {
                provider: "ollama".into(),
                message: format!("status={}", resp.status()),
                retry_after: None,
            });
        }

        let chunk: OllamaChatChunk = resp.json().await.map_err(|e| RagError::Network {
            operation: "ollama_chat_read".into(),
            message: e.to_string(),
        })?;

        Ok(ChatResponse {
            content: chunk.message.map(|m| m.content).unwrap_or_default(),
            usage: ChatUsage {
                prompt_tokens: chunk.prompt_eval_count,
                completion_tokens: chunk.eval_count,
                total_tokens: chunk.prompt_eval_count + chunk.eval_count,
            },
        })
    }

    #[instrument(skip(self, messages, opts), fields(model = %self.model_name))]
    async fn chat_stream(
        &self,
        messages: &[ChatMessage],
        opts: &ChatOptions,
    ) -> Result<mpsc::Receiver<StreamResponse>> {
        self.ensure_model_available().await?;

        let url = format!("{}/api/chat", self.base_url.trim_end_matches('/'));
        let body = OllamaChatRequest {
            model: &self.model_name,
            messages,
            stream: true,
            options: Self::build_options(opts),
        };

        let resp = self
            .http
            .post(&url)
            .timeout(DEFAULT_CHAT_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| RagError::LlmService {
                provider: "ollama".into(),
                message: e.to_string(),
                retry_after: Some(Duration::from_secs(10)),
            })?;

        if !resp.status().is_success() {
            return Err(RagError::LlmService {
                provider: "ollama".into(),
                message: format!("status={}", resp.status()),
                retry_after: None,
            });
        }

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);

        // ollama 流式返回 NDJSON，每行一个 chunk
        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            let mut buffer = String::new();

            'outer: while let Some(next) = stream.next().await {
                let bytes = match next {
                    Ok(b) => b,
                    Err(e) => {
                        warn!(error = %e, "ollama stream interrupted");
                        break;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);
                    if line.is_empty() {
                        continue;
                    }
                    let Ok(chunk) = serde_json::from_str::<OllamaChatChunk>(&line) else {
                        continue;
                    };
                    if let Some(message) = chunk.message {
                        if !message.content.is_empty()
                            && tx
                                .send(StreamResponse::answer_delta(message.content))
                                .await
                                .is_err()
                        {
                            return;
                        }
                    }
                    if chunk.done {
                        break 'outer;
                    }
                }
            }

            let _ = tx.send(StreamResponse::answer_done()).await;
        });

        Ok(rx)
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qwen3_detection_requires_dashscope_base_url() {
        let qwen = RemoteApiChat::new(
            "qwen3-max".into(),
            "m1".into(),
            "https://dashscope.aliyuncs.com/compatible-mode/v1".into(),
            "key".into(),
        );
        assert!(qwen.is_dashscope_qwen3());

        let other = RemoteApiChat::new(
            "qwen3-max".into(),
            "m2".into(),
            "https://api.openai.com/v1".into(),
            "key".into(),
        );
        assert!(!other.is_dashscope_qwen3());
    }

    #[test]
    fn non_stream_qwen3_request_disables_thinking() {
        let qwen = RemoteApiChat::new(
            "qwen3-max".into(),
            "m1".into(),
            "https://dashscope.aliyuncs.com/compatible-mode/v1".into(),
            "key".into(),
        );
        let messages = vec![ChatMessage::user("hi")];
        let opts = ChatOptions::default();

        let body = qwen.build_request(&messages, &opts, false);
        assert_eq!(body.enable_thinking, Some(false));

        // 流式调用走标准请求
        let body = qwen.build_request(&messages, &opts, true);
        assert_eq!(body.enable_thinking, None);
    }

    #[test]
    fn zero_options_are_omitted() {
        let chat = RemoteApiChat::new(
            "gpt-4o".into(),
            "m1".into(),
            "https://api.openai.com/v1".into(),
            "key".into(),
        );
        let messages = vec![ChatMessage::user("hi")];
        let body = chat.build_request(&messages, &ChatOptions::default(), false);
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("temperature").is_none());
        assert!(json.get("max_tokens").is_none());
    }

    #[test]
    fn sse_line_parsing() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hello"}}]}"#;
        let value = RemoteApiChat::parse_sse_line(line).unwrap();
        assert_eq!(
            value["choices"][0]["delta"]["content"].as_str(),
            Some("Hello")
        );
        assert!(RemoteApiChat::parse_sse_line("data: [DONE]").is_none());
        assert!(RemoteApiChat::parse_sse_line("event: ping").is_none());
    }
}
