use async_trait::async_trait;
use rag_core::{ChatMessage, ChatOptions};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::event::{EventType, Next, Plugin, PluginResult};
use crate::resolver::ModelResolver;
use crate::turn::ChatTurn;

pub const REWRITE_PROMPT_SYSTEM: &str = "You rewrite the user's latest question into a fully \
self-contained query. Resolve pronouns and references against the conversation history. Output \
only the rewritten question, without explanations.";

/// 多轮改写：结合历史把当前问题改写成独立查询。
/// 任何失败都回退到原问题，不阻断回合。
pub struct PluginRewriteQuery {
    resolver: Arc<dyn ModelResolver>,
}

impl PluginRewriteQuery {
    pub fn new(resolver: Arc<dyn ModelResolver>) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl Plugin for PluginRewriteQuery {
    fn name(&self) -> &'static str {
        "rewrite_query"
    }

    fn activation_events(&self) -> Vec<EventType> {
        vec![EventType::RewriteQuery]
    }

    async fn on_event(
        &self,
        _event: EventType,
        turn: &mut ChatTurn,
        next: Next<'_>,
    ) -> PluginResult {
        if !turn.session.enable_rewrite || turn.history.is_empty() {
            return next.call(turn).await;
        }

        let mut messages = vec![ChatMessage::system(REWRITE_PROMPT_SYSTEM)];
        for message in &turn.history {
            messages.push(ChatMessage {
                role: message.role.as_str().to_string(),
                content: message.content.clone(),
            });
        }
        messages.push(ChatMessage::user(format!(
            "Rewrite this question as a standalone query: {}",
            turn.query
        )));

        let rewritten = async {
            let chat = self
                .resolver
                .chat_model(&turn.session.summary_model_id)
                .await?;
            chat.chat(&messages, &ChatOptions::default()).await
        }
        .await;

        match rewritten {
            Ok(response) => {
                let rewritten = response.content.trim().to_string();
                if !rewritten.is_empty() {
                    debug!(original = %turn.query, rewritten = %rewritten, "query rewritten");
                    turn.query = rewritten;
                }
            }
            Err(err) => {
                // 改写失败退回原问题
                warn!(error = %err, "query rewrite failed, using original query");
            }
        }
        next.call(turn).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventManager;
    use crate::testkit::StaticResolver;
    use rag_core::{Message, MessageRole, Session};
    use rag_llm::ScriptedChatModel;

    #[tokio::test]
    async fn rewrite_replaces_query_when_enabled() {
        let resolver = Arc::new(StaticResolver::with_chat(Arc::new(ScriptedChatModel::new(
            vec!["What is the orbital period of Halley's comet?".into()],
        ))));
        let mut manager = EventManager::new();
        manager.register(Arc::new(PluginRewriteQuery::new(resolver)));

        let mut turn = ChatTurn {
            query: "what about its period?".into(),
            session: Session {
                enable_rewrite: true,
                ..Default::default()
            },
            history: vec![Message {
                role: MessageRole::User,
                content: "Tell me about Halley's comet".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        manager
            .trigger(EventType::RewriteQuery, &mut turn)
            .await
            .unwrap();
        assert_eq!(turn.query, "What is the orbital period of Halley's comet?");
    }

    #[tokio::test]
    async fn disabled_rewrite_keeps_query() {
        let resolver = Arc::new(StaticResolver::default());
        let mut manager = EventManager::new();
        manager.register(Arc::new(PluginRewriteQuery::new(resolver)));

        let mut turn = ChatTurn {
            query: "original".into(),
            ..Default::default()
        };
        manager
            .trigger(EventType::RewriteQuery, &mut turn)
            .await
            .unwrap();
        assert_eq!(turn.query, "original");
    }

    #[tokio::test]
    async fn failed_rewrite_falls_back_to_original() {
        // 未配置模型 → resolver 报错 → 保留原问题
        let resolver = Arc::new(StaticResolver::default());
        let mut manager = EventManager::new();
        manager.register(Arc::new(PluginRewriteQuery::new(resolver)));

        let mut turn = ChatTurn {
            query: "original".into(),
            session: Session {
                enable_rewrite: true,
                ..Default::default()
            },
            history: vec![Message::default()],
            ..Default::default()
        };
        manager
            .trigger(EventType::RewriteQuery, &mut turn)
            .await
            .unwrap();
        assert_eq!(turn.query, "original");
    }
}
