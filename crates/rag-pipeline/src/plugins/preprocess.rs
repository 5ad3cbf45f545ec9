use async_trait::async_trait;
use rag_error::RagError;
use tracing::debug;
use uuid::Uuid;

use crate::event::{EventType, Next, Plugin, PluginError, PluginResult};
use crate::turn::ChatTurn;

/// 查询预处理：裁剪空白、拒绝空问题、语言探测、补全 request_id
pub struct PluginPreprocess;

impl PluginPreprocess {
    fn detect_language(query: &str) -> &'static str {
        let has_cjk = query.chars().any(|c| {
            ('\u{4e00}'..='\u{9fff}').contains(&c) || ('\u{3400}'..='\u{4dbf}').contains(&c)
        });
        if has_cjk {
            "zh"
        } else {
            "en"
        }
    }
}

#[async_trait]
impl Plugin for PluginPreprocess {
    fn name(&self) -> &'static str {
        "preprocess_query"
    }

    fn activation_events(&self) -> Vec<EventType> {
        vec![EventType::PreprocessQuery]
    }

    async fn on_event(
        &self,
        _event: EventType,
        turn: &mut ChatTurn,
        next: Next<'_>,
    ) -> PluginResult {
        let trimmed = turn.query.trim().to_string();
        if trimmed.is_empty() {
            return Err(PluginError::new(RagError::InvalidRequest {
                reason: "query must not be empty".into(),
            }));
        }
        turn.query = trimmed.clone();
        turn.raw_query = trimmed;

        if turn.request_id.is_empty() {
            turn.request_id = Uuid::new_v4().to_string();
        }
        turn.language = Self::detect_language(&turn.query).to_string();

        debug!(
            request_id = %turn.request_id,
            language = %turn.language,
            "query preprocessed"
        );
        next.call(turn).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventManager;
    use std::sync::Arc;

    #[tokio::test]
    async fn trims_and_assigns_request_id() {
        let mut manager = EventManager::new();
        manager.register(Arc::new(PluginPreprocess));

        let mut turn = ChatTurn {
            query: "  what is a comet  ".into(),
            ..Default::default()
        };
        manager
            .trigger(EventType::PreprocessQuery, &mut turn)
            .await
            .unwrap();
        assert_eq!(turn.query, "what is a comet");
        assert!(!turn.request_id.is_empty());
        assert_eq!(turn.language, "en");
    }

    #[tokio::test]
    async fn empty_query_is_rejected() {
        let mut manager = EventManager::new();
        manager.register(Arc::new(PluginPreprocess));

        let mut turn = ChatTurn {
            query: "   ".into(),
            ..Default::default()
        };
        let result = manager.trigger(EventType::PreprocessQuery, &mut turn).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn detects_chinese() {
        assert_eq!(PluginPreprocess::detect_language("彗星是什么"), "zh");
        assert_eq!(PluginPreprocess::detect_language("what is it"), "en");
    }
}
