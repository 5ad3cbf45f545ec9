use async_trait::async_trait;
use rag_core::{Message, MessageRole};
use rag_store::MessageStore;
use std::sync::Arc;
use tracing::debug;

use crate::event::{EventType, Next, Plugin, PluginError, PluginResult};
use crate::turn::ChatTurn;

/// 落库：把完整答案连同引用写成 assistant 消息
pub struct PluginPersist {
    message_store: Arc<dyn MessageStore>,
}

impl PluginPersist {
    pub fn new(message_store: Arc<dyn MessageStore>) -> Self {
        Self { message_store }
    }
}

#[async_trait]
impl Plugin for PluginPersist {
    fn name(&self) -> &'static str {
        "persist"
    }

    fn activation_events(&self) -> Vec<EventType> {
        vec![EventType::Persist]
    }

    async fn on_event(
        &self,
        _event: EventType,
        turn: &mut ChatTurn,
        next: Next<'_>,
    ) -> PluginResult {
        let message = Message {
            session_id: turn.session.id.clone(),
            request_id: turn.request_id.clone(),
            role: MessageRole::Assistant,
            content: turn.answer.clone(),
            knowledge_references: turn.references.clone(),
            is_completed: true,
            ..Default::default()
        };
        let message = self
            .message_store
            .create(message)
            .await
            .map_err(PluginError::new)?;
        debug!(message_id = %message.id, "assistant message persisted");
        next.call(turn).await
    }
}
