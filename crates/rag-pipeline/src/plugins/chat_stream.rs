use async_trait::async_trait;
use rag_core::{ChatMessage, ChatOptions, FallbackStrategy, ResponseType, StreamResponse};
use rag_error::RagError;
use rag_stream::StreamManager;
use std::sync::Arc;
use tracing::{debug, info};

use crate::event::{EventType, Next, Plugin, PluginError, PluginResult};
use crate::resolver::ModelResolver;
use crate::turn::ChatTurn;

/// 流式生成：引用帧先行，增量边投递边写入流管理器。
/// 检索无结果时按会话兜底策略处理。
pub struct PluginChatStream {
    resolver: Arc<dyn ModelResolver>,
    stream_manager: Arc<dyn StreamManager>,
}

impl PluginChatStream {
    pub fn new(resolver: Arc<dyn ModelResolver>, stream_manager: Arc<dyn StreamManager>) -> Self {
        Self {
            resolver,
            stream_manager,
        }
    }

    fn chat_options(turn: &ChatTurn) -> ChatOptions {
        let p = &turn.session.summary_parameters;
        ChatOptions {
            temperature: p.temperature,
            top_p: p.top_p,
            max_tokens: p.max_tokens,
            max_completion_tokens: p.max_completion_tokens,
            frequency_penalty: p.frequency_penalty,
            presence_penalty: p.presence_penalty,
            thinking: None,
        }
    }

    fn build_messages(turn: &ChatTurn, user_content: &str) -> Vec<ChatMessage> {
        let prompt = &turn.session.summary_parameters.prompt;
        let mut messages = vec![ChatMessage::system(if prompt.is_empty() {
            rag_core::session::DEFAULT_SUMMARY_PROMPT
        } else {
            prompt.as_str()
        })];
        for message in &turn.history {
            messages.push(ChatMessage {
                role: message.role.as_str().to_string(),
                content: message.content.clone(),
            });
        }
        messages.push(ChatMessage::user(user_content));
        messages
    }

    /// 消费模型流直到终止帧。客户端断开后继续写入流管理器，
    /// 取消信号到达则立刻退出（记录保留到 TTL，可续流）。
    async fn stream_answer(
        &self,
        turn: &mut ChatTurn,
        messages: Vec<ChatMessage>,
    ) -> PluginResult {
        let chat = self
            .resolver
            .chat_model(&turn.session.summary_model_id)
            .await
            .map_err(PluginError::new)?;
        let mut rx = chat
            .chat_stream(&messages, &Self::chat_options(turn))
            .await
            .map_err(PluginError::new)?;

        let mut client_connected = true;
        let cancel = turn.cancel.clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(PluginError::new(RagError::Cancelled {
                        operation: "chat_stream".into(),
                    }));
                }
                frame = rx.recv() => {
                    match frame {
                        Some(frame) if !frame.done => {
                            if frame.content.is_empty() {
                                continue;
                            }
                            turn.answer.push_str(&frame.content);
                            self.stream_manager
                                .update_stream(
                                    &turn.session.id,
                                    &turn.request_id,
                                    &frame.content,
                                    None,
                                )
                                .await
                                .map_err(PluginError::new)?;
                            if client_connected {
                                client_connected = turn.emit(frame).await;
                                if !client_connected {
                                    debug!("client disconnected, continuing for resume");
                                }
                            }
                        }
                        _ => {
                            // 终止帧或通道关闭
                            if client_connected {
                                turn.emit(StreamResponse::answer_done()).await;
                            }
                            self.stream_manager
                                .complete_stream(&turn.session.id, &turn.request_id)
                                .await
                                .map_err(PluginError::new)?;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Plugin for PluginChatStream {
    fn name(&self) -> &'static str {
        "chat_stream"
    }

    fn activation_events(&self) -> Vec<EventType> {
        vec![EventType::ChatStream]
    }

    async fn on_event(
        &self,
        _event: EventType,
        turn: &mut ChatTurn,
        next: Next<'_>,
    ) -> PluginResult {
        // 引用帧在任何 answer 增量之前，恰好一次
        let references = turn.references.clone();
        turn.emit(StreamResponse::references(references.clone())).await;
        if !references.is_empty() {
            self.stream_manager
                .update_stream(&turn.session.id, &turn.request_id, "", Some(&references))
                .await
                .map_err(PluginError::new)?;
        }

        if turn.merge_results.is_empty() {
            turn.fallback_used = true;
            match turn.session.fallback_strategy {
                FallbackStrategy::Fixed => {
                    info!("retrieval empty, using fixed fallback response");
                    let content = if turn.session.fallback_response.is_empty() {
                        "Sorry, I cannot answer this question.".to_string()
                    } else {
                        turn.session.fallback_response.clone()
                    };
                    turn.answer = content.clone();
                    self.stream_manager
                        .update_stream(&turn.session.id, &turn.request_id, &content, None)
                        .await
                        .map_err(PluginError::new)?;
                    self.stream_manager
                        .complete_stream(&turn.session.id, &turn.request_id)
                        .await
                        .map_err(PluginError::new)?;
                    turn.emit(StreamResponse {
                        response_type: ResponseType::Answer,
                        content,
                        done: true,
                        references: None,
                        error: None,
                    })
                    .await;
                    return next.call(turn).await;
                }
                FallbackStrategy::Model => {
                    info!("retrieval empty, falling back to the model without context");
                    let prefix = turn.session.summary_parameters.no_match_prefix.clone();
                    if !prefix.is_empty() {
                        turn.answer.push_str(&prefix);
                        self.stream_manager
                            .update_stream(&turn.session.id, &turn.request_id, &prefix, None)
                            .await
                            .map_err(PluginError::new)?;
                        turn.emit(StreamResponse::answer_delta(prefix)).await;
                    }
                    let messages = Self::build_messages(turn, &turn.raw_query.clone());
                    self.stream_answer(turn, messages).await?;
                    return next.call(turn).await;
                }
            }
        }

        let messages = Self::build_messages(turn, &turn.user_content.clone());
        self.stream_answer(turn, messages).await?;
        next.call(turn).await
    }
}
