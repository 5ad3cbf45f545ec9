use async_trait::async_trait;
use futures::future::BoxFuture;
use rag_error::RagError;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::turn::ChatTurn;

/// 问答管线的事件类型，封闭枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    PreprocessQuery,
    RewriteQuery,
    EmbedQuery,
    Retrieve,
    Rerank,
    MergeResult,
    IntoChatMessage,
    ChatStream,
    Persist,
}

/// 一次问答按此顺序触发事件
pub const QA_EVENT_SEQUENCE: [EventType; 9] = [
    EventType::PreprocessQuery,
    EventType::RewriteQuery,
    EventType::EmbedQuery,
    EventType::Retrieve,
    EventType::Rerank,
    EventType::MergeResult,
    EventType::IntoChatMessage,
    EventType::ChatStream,
    EventType::Persist,
];

/// 插件返回的错误，终止整条链并映射到统一错误分类
#[derive(Debug, Clone)]
pub struct PluginError {
    pub error: RagError,
}

impl PluginError {
    pub fn new(error: RagError) -> Self {
        Self { error }
    }

    pub fn template_parse(message: impl Into<String>) -> Self {
        Self::new(RagError::TemplateParse {
            message: message.into(),
        })
    }

    pub fn template_execute(message: impl Into<String>) -> Self {
        Self::new(RagError::TemplateExecute {
            message: message.into(),
        })
    }
}

impl From<RagError> for PluginError {
    fn from(error: RagError) -> Self {
        Self { error }
    }
}

impl From<PluginError> for RagError {
    fn from(err: PluginError) -> Self {
        err.error
    }
}

pub type PluginResult = std::result::Result<(), PluginError>;

/// 显式的 next 续延。插件处理完自己的部分后调用
/// `next.call(turn)` 继续同事件下的后续插件；
/// 直接返回 PluginError 则短路整条链。
pub struct Next<'a> {
    event: EventType,
    rest: &'a [Arc<dyn Plugin>],
}

impl<'a> Next<'a> {
    pub fn call<'b>(self, turn: &'b mut ChatTurn) -> BoxFuture<'b, PluginResult>
    where
        'a: 'b,
    {
        Box::pin(async move {
            match self.rest.split_first() {
                None => Ok(()),
                Some((head, rest)) => {
                    head.on_event(
                        self.event,
                        turn,
                        Next {
                            event: self.event,
                            rest,
                        },
                    )
                    .await
                }
            }
        })
    }
}

/// 管线插件。注册时声明激活事件，按注册顺序依次调用。
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    fn activation_events(&self) -> Vec<EventType>;

    async fn on_event(
        &self,
        event: EventType,
        turn: &mut ChatTurn,
        next: Next<'_>,
    ) -> PluginResult;
}

/// 事件管理器：事件类型到有序插件列表的映射。
/// 注册只发生在启动阶段，此后只读。
#[derive(Default)]
pub struct EventManager {
    plugins: HashMap<EventType, Vec<Arc<dyn Plugin>>>,
}

impl EventManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        for event in plugin.activation_events() {
            self.plugins.entry(event).or_default().push(plugin.clone());
        }
    }

    /// 顺序触发一个事件下的插件链
    pub async fn trigger(&self, event: EventType, turn: &mut ChatTurn) -> PluginResult {
        let Some(chain) = self.plugins.get(&event) else {
            return Ok(());
        };
        debug!(?event, plugins = chain.len(), "dispatching event");
        Next {
            event,
            rest: chain.as_slice(),
        }
        .call(turn)
        .await
    }
}
