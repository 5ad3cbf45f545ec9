use rag_core::{Message, MessageRole, StreamResponse};
use rag_error::{RagError, Result};
use rag_retriever::HybridSearcher;
use rag_store::{ChunkStore, MessageStore};
use rag_stream::StreamManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::event::{EventManager, QA_EVENT_SEQUENCE};
use crate::plugins::{
    PluginChatStream, PluginEmbedQuery, PluginIntoChatMessage, PluginMergeResult, PluginPersist,
    PluginPreprocess, PluginRerank, PluginRetrieve, PluginRewriteQuery,
};
use crate::resolver::ModelResolver;
use crate::turn::ChatTurn;

const RESPONSE_CHANNEL_CAPACITY: usize = 64;
/// 续流时轮询流管理器的间隔
const RESUME_POLL_INTERVAL: Duration = Duration::from_millis(150);

/// 问答服务：装配插件链，驱动单个回合，支持断线续流
pub struct ChatService {
    events: Arc<EventManager>,
    stream_manager: Arc<dyn StreamManager>,
    message_store: Arc<dyn MessageStore>,
}

impl ChatService {
    pub fn new(
        events: EventManager,
        stream_manager: Arc<dyn StreamManager>,
        message_store: Arc<dyn MessageStore>,
    ) -> Self {
        Self {
            events: Arc::new(events),
            stream_manager,
            message_store,
        }
    }

    /// 标准插件链，注册顺序即事件内的执行顺序
    pub fn standard(
        resolver: Arc<dyn ModelResolver>,
        searcher: Arc<HybridSearcher>,
        chunk_store: Arc<dyn ChunkStore>,
        message_store: Arc<dyn MessageStore>,
        stream_manager: Arc<dyn StreamManager>,
    ) -> Self {
        let mut events = EventManager::new();
        events.register(Arc::new(PluginPreprocess));
        events.register(Arc::new(PluginRewriteQuery::new(resolver.clone())));
        events.register(Arc::new(PluginEmbedQuery::new(resolver.clone())));
        events.register(Arc::new(PluginRetrieve::new(searcher)));
        events.register(Arc::new(PluginRerank::new(resolver.clone())));
        events.register(Arc::new(PluginMergeResult::new(chunk_store)));
        events.register(Arc::new(PluginIntoChatMessage));
        events.register(Arc::new(PluginChatStream::new(
            resolver,
            stream_manager.clone(),
        )));
        events.register(Arc::new(PluginPersist::new(message_store.clone())));
        Self::new(events, stream_manager, message_store)
    }

    /// 执行一次知识问答。先写入用户消息并注册活跃流，
    /// 管线在后台任务中运行：客户端断开不影响其完成。
    #[instrument(skip(self, turn), fields(session = %turn.session.id))]
    pub async fn knowledge_qa(
        &self,
        mut turn: ChatTurn,
    ) -> Result<mpsc::Receiver<StreamResponse>> {
        if turn.query.trim().is_empty() {
            return Err(RagError::InvalidRequest {
                reason: "query must not be empty".into(),
            });
        }
        if turn.request_id.is_empty() {
            turn.request_id = Uuid::new_v4().to_string();
        }

        let history_limit = turn.session.max_rounds.max(0) as usize * 2;
        turn.history = if history_limit > 0 {
            self.message_store
                .list_recent(&turn.session.id, history_limit)
                .await?
        } else {
            Vec::new()
        };

        self.message_store
            .create(Message {
                session_id: turn.session.id.clone(),
                request_id: turn.request_id.clone(),
                role: MessageRole::User,
                content: turn.query.trim().to_string(),
                is_completed: true,
                ..Default::default()
            })
            .await?;

        self.stream_manager
            .register_stream(&turn.session.id, &turn.request_id, &turn.query)
            .await?;

        let (tx, rx) = mpsc::channel(RESPONSE_CHANNEL_CAPACITY);
        turn.response_tx = Some(tx);

        let events = self.events.clone();
        tokio::spawn(async move {
            for event in QA_EVENT_SEQUENCE {
                if let Err(err) = events.trigger(event, &mut turn).await {
                    let error: RagError = err.into();
                    error.log("chat_pipeline", Some(&turn.request_id));
                    // SSE 上的错误以终止帧形式送达
                    turn.emit(StreamResponse::answer_error(error.code())).await;
                    break;
                }
            }
            info!(request_id = %turn.request_id, fallback = turn.fallback_used, "qa turn finished");
        });

        Ok(rx)
    }

    /// 断线续流：立刻回放引用与已生成内容，再跟进实时增量
    /// 直到完成。活跃流已被清理时回放持久化的 assistant 消息。
    #[instrument(skip(self))]
    pub async fn continue_stream(
        &self,
        session_id: &str,
        request_id: &str,
    ) -> Result<mpsc::Receiver<StreamResponse>> {
        let (tx, rx) = mpsc::channel(RESPONSE_CHANNEL_CAPACITY);

        let Some(info) = self.stream_manager.get_stream(session_id, request_id).await? else {
            // 宽限期已过：退回持久化消息
            let message = self
                .message_store
                .get_by_request(session_id, request_id)
                .await?
                .ok_or_else(|| RagError::NotFound {
                    resource: format!("stream {}:{}", session_id, request_id),
                })?;
            tokio::spawn(async move {
                let _ = tx
                    .send(StreamResponse::references(message.knowledge_references))
                    .await;
                if !message.content.is_empty() {
                    let _ = tx
                        .send(StreamResponse::answer_delta(message.content))
                        .await;
                }
                let _ = tx.send(StreamResponse::answer_done()).await;
            });
            return Ok(rx);
        };

        let stream_manager = self.stream_manager.clone();
        let session_id = session_id.to_string();
        let request_id = request_id.to_string();
        tokio::spawn(async move {
            if tx
                .send(StreamResponse::references(
                    info.knowledge_references.clone(),
                ))
                .await
                .is_err()
            {
                return;
            }
            let mut seen = 0usize;
            if !info.content.is_empty() {
                seen = info.content.len();
                if tx
                    .send(StreamResponse::answer_delta(info.content.clone()))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            if info.is_completed {
                let _ = tx.send(StreamResponse::answer_done()).await;
                return;
            }

            // 前缀单调性保证 seen 之后的字节就是新增量
            loop {
                tokio::time::sleep(RESUME_POLL_INTERVAL).await;
                match stream_manager.get_stream(&session_id, &request_id).await {
                    Ok(Some(info)) => {
                        if info.content.len() > seen {
                            let delta = info.content[seen..].to_string();
                            seen = info.content.len();
                            if tx.send(StreamResponse::answer_delta(delta)).await.is_err() {
                                return;
                            }
                        }
                        if info.is_completed {
                            let _ = tx.send(StreamResponse::answer_done()).await;
                            return;
                        }
                    }
                    Ok(None) => {
                        let _ = tx.send(StreamResponse::answer_done()).await;
                        return;
                    }
                    Err(_) => {
                        let _ = tx
                            .send(StreamResponse::answer_error("upstream_unavailable"))
                            .await;
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }
}
