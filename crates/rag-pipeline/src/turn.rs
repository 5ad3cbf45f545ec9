use rag_core::{
    KnowledgeBase, Message, References, RetrieveResult, Session, StreamResponse, Tenant,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// 一次问答回合的共享可变状态，插件链依次读写
#[derive(Default)]
pub struct ChatTurn {
    pub tenant: Tenant,
    pub session: Session,
    pub knowledge_base: KnowledgeBase,

    /// 本次请求的标识，续流时作为定位键
    pub request_id: String,
    /// 用户原始问题
    pub raw_query: String,
    /// 当前问题（可能被改写）
    pub query: String,
    /// 检测到的查询语言
    pub language: String,
    /// 最近 max_rounds * 2 条消息，升序
    pub history: Vec<Message>,

    pub query_embedding: Option<Vec<f32>>,
    pub retrieve_results: Vec<RetrieveResult>,
    pub rerank_results: Vec<RetrieveResult>,
    pub merge_results: Vec<RetrieveResult>,
    pub references: References,

    /// 渲染后的用户提示词
    pub user_content: String,
    /// 累计的答案全文
    pub answer: String,
    /// 是否走了兜底路径
    pub fallback_used: bool,

    /// 发往客户端的帧通道；客户端断开后发送失败，
    /// 管线继续写入流管理器以支持续流
    pub response_tx: Option<mpsc::Sender<StreamResponse>>,
    /// 贯穿所有出站调用的取消信号
    pub cancel: CancellationToken,
}

impl ChatTurn {
    pub fn new(
        tenant: Tenant,
        session: Session,
        knowledge_base: KnowledgeBase,
        query: impl Into<String>,
        request_id: impl Into<String>,
    ) -> Self {
        let query = query.into();
        Self {
            tenant,
            session,
            knowledge_base,
            request_id: request_id.into(),
            raw_query: query.clone(),
            query,
            ..Default::default()
        }
    }

    /// 兜底与重排最终留下的段落
    pub fn final_passages(&self) -> &[RetrieveResult] {
        &self.merge_results
    }

    /// 尽力投递一帧给客户端；断线时返回 false 但不报错
    pub async fn emit(&self, frame: StreamResponse) -> bool {
        match &self.response_tx {
            Some(tx) => tx.send(frame).await.is_ok(),
            None => false,
        }
    }
}
