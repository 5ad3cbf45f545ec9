use async_trait::async_trait;
use chrono::Utc;
use rag_core::session::DEFAULT_CONTEXT_TEMPLATE;
use tracing::debug;

use crate::event::{EventType, Next, Plugin, PluginResult};
use crate::prompt;
use crate::turn::ChatTurn;

/// 把归并结果组装成最终的用户提示词：
/// 每个段落先做图片说明/OCR 注入，再套会话上下文模板。
pub struct PluginIntoChatMessage;

#[async_trait]
impl Plugin for PluginIntoChatMessage {
    fn name(&self) -> &'static str {
        "into_chat_message"
    }

    fn activation_events(&self) -> Vec<EventType> {
        vec![EventType::IntoChatMessage]
    }

    async fn on_event(
        &self,
        _event: EventType,
        turn: &mut ChatTurn,
        next: Next<'_>,
    ) -> PluginResult {
        let passages: Vec<String> = turn
            .merge_results
            .iter()
            .map(|result| match &result.image_info {
                Some(image_info) if !image_info.is_empty() => {
                    prompt::enrich_content_with_image_info(&result.content, image_info)
                }
                _ => result.content.clone(),
            })
            .collect();

        let template = if turn.session.summary_parameters.context_template.is_empty() {
            DEFAULT_CONTEXT_TEMPLATE
        } else {
            turn.session.summary_parameters.context_template.as_str()
        };

        turn.user_content =
            prompt::render_context_template(template, &turn.query, &passages, Utc::now())?;
        debug!(
            passages = passages.len(),
            prompt_len = turn.user_content.len(),
            "chat message built"
        );
        next.call(turn).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventManager;
    use rag_core::{MatchType, RetrieveResult, Session, SummaryConfig};
    use rag_error::RagError;
    use std::sync::Arc;

    fn turn_with_template(template: &str) -> ChatTurn {
        ChatTurn {
            query: "what is shown".into(),
            session: Session {
                summary_parameters: SummaryConfig {
                    context_template: template.into(),
                    ..Default::default()
                },
                ..Default::default()
            },
            merge_results: vec![RetrieveResult {
                chunk_id: "c1".into(),
                knowledge_id: "k1".into(),
                knowledge_base_id: "kb1".into(),
                content: "See ![fig](https://img.example.com/x.png)".into(),
                chunk_index: 0,
                score: 0.9,
                match_type: MatchType::Vector,
                image_info: Some(
                    serde_json::json!([{
                        "url": "https://img.example.com/x.png",
                        "original_url": "",
                        "start_pos": 0,
                        "end_pos": 0,
                        "caption": "a figure",
                        "ocr_text": "42"
                    }])
                    .to_string(),
                ),
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn prompt_contains_enriched_passages_and_query() {
        let mut manager = EventManager::new();
        manager.register(Arc::new(PluginIntoChatMessage));

        let mut turn = turn_with_template("{{#each Contexts}}{{this}}{{/each}}|{{Query}}");
        manager
            .trigger(EventType::IntoChatMessage, &mut turn)
            .await
            .unwrap();

        assert!(turn.user_content.contains("Image caption: a figure"));
        assert!(turn.user_content.contains("Image text: 42"));
        assert!(turn.user_content.ends_with("|what is shown"));
    }

    #[tokio::test]
    async fn broken_template_maps_to_template_error() {
        let mut manager = EventManager::new();
        manager.register(Arc::new(PluginIntoChatMessage));

        let mut turn = turn_with_template("{{#each Contexts}}");
        let err = manager
            .trigger(EventType::IntoChatMessage, &mut turn)
            .await
            .unwrap_err();
        assert!(matches!(err.error, RagError::TemplateParse { .. }));
    }
}
