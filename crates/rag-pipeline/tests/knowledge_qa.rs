//! 端到端问答回合测试：内存引擎 + 内存存储 + 脚本化模型。

use rag_core::{
    Chunk, IndexInfo, KnowledgeBase, ResponseType, RetrieverEngineParams, RetrieverEngineType,
    RetrieverType, Session, StreamResponse, Tenant,
};
use rag_llm::{Embedder, MockEmbedder, ScriptedChatModel};
use rag_pipeline::testkit::StaticResolver;
use rag_pipeline::{ChatService, ChatTurn};
use rag_retriever::{HybridSearcher, IndexService, MemoryRetrieveEngine, RetrieveEngineRegistry};
use rag_store::{ChunkStore, MemoryChunkStore, MemoryMessageStore, MessageStore};
use rag_stream::MemoryStreamManager;
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    service: ChatService,
    chunk_store: Arc<MemoryChunkStore>,
    message_store: Arc<MemoryMessageStore>,
    chunk_ids: Vec<String>,
}

async fn fixture(chat_responses: Vec<String>) -> Fixture {
    let embedder = Arc::new(MockEmbedder::new(256));
    let engine = Arc::new(MemoryRetrieveEngine::new());
    let mut registry = RetrieveEngineRegistry::new();
    registry.register(engine).unwrap();
    let registry = Arc::new(registry);

    // 三段文本，第二段包含唯一短语
    let contents = [
        "The solar system contains eight major planets.",
        "COMET is a short-period object.",
        "Asteroids are mostly found in the main belt.",
    ];
    let chunk_ids: Vec<String> = (0..3).map(|i| format!("chunk-{}", i)).collect();
    let infos: Vec<IndexInfo> = contents
        .iter()
        .enumerate()
        .map(|(i, content)| IndexInfo {
            chunk_id: chunk_ids[i].clone(),
            knowledge_id: "knowledge-1".into(),
            knowledge_base_id: "kb-1".into(),
            content: content.to_string(),
            chunk_index: i as i32,
            image_info: None,
        })
        .collect();

    let index_service = IndexService::new(registry.clone());
    index_service
        .batch_index(
            Some(embedder.clone()),
            &[RetrieverEngineParams {
                retriever_type: RetrieverType::Vector,
                retriever_engine_type: RetrieverEngineType::Memory,
            }],
            &infos,
        )
        .await
        .unwrap();

    let chunk_store = Arc::new(MemoryChunkStore::new());
    chunk_store
        .batch_create(
            infos
                .iter()
                .map(|info| Chunk {
                    id: info.chunk_id.clone(),
                    knowledge_id: info.knowledge_id.clone(),
                    knowledge_base_id: info.knowledge_base_id.clone(),
                    content: info.content.clone(),
                    chunk_index: info.chunk_index,
                    is_enabled: true,
                    ..Default::default()
                })
                .collect(),
        )
        .await
        .unwrap();

    let message_store = Arc::new(MemoryMessageStore::new());
    let stream_manager = Arc::new(
        MemoryStreamManager::new(Duration::from_secs(3600))
            .with_cleanup_delay(Duration::from_secs(5)),
    );
    let resolver = Arc::new(
        StaticResolver::with_embedder(embedder)
            .chat(Arc::new(ScriptedChatModel::new(chat_responses))),
    );
    let searcher = Arc::new(HybridSearcher::new(registry));

    let service = ChatService::standard(
        resolver,
        searcher,
        chunk_store.clone(),
        message_store.clone(),
        stream_manager,
    );
    Fixture {
        service,
        chunk_store,
        message_store,
        chunk_ids,
    }
}

fn tenant_with_vector_memory() -> Tenant {
    Tenant {
        id: 1,
        retriever_engines: vec![RetrieverEngineParams {
            retriever_type: RetrieverType::Vector,
            retriever_engine_type: RetrieverEngineType::Memory,
        }],
        ..Default::default()
    }
}

fn session(vector_threshold: f64, match_count: i32, session_id: &str) -> Session {
    Session {
        id: session_id.into(),
        tenant_id: 1,
        knowledge_base_id: "kb-1".into(),
        vector_threshold,
        keyword_threshold: vector_threshold,
        embedding_top_k: match_count,
        summary_model_id: "chat-1".into(),
        ..Default::default()
    }
}

fn kb() -> KnowledgeBase {
    KnowledgeBase {
        id: "kb-1".into(),
        tenant_id: 1,
        embedding_model_id: "embed-1".into(),
        summary_model_id: "chat-1".into(),
        ..Default::default()
    }
}

async fn collect(mut rx: tokio::sync::mpsc::Receiver<StreamResponse>) -> Vec<StreamResponse> {
    let mut frames = Vec::new();
    while let Some(frame) = rx.recv().await {
        let done = frame.done;
        frames.push(frame);
        if done {
            break;
        }
    }
    frames
}

#[tokio::test]
async fn single_engine_vector_qa_cites_the_matching_chunk() {
    let fixture = fixture(vec!["Comets are icy bodies that orbit the sun.".into()]).await;

    let turn = ChatTurn::new(
        tenant_with_vector_memory(),
        session(0.1, 1, "session-1"),
        kb(),
        "Tell me about comets.",
        "req-1",
    );
    let frames = collect(fixture.service.knowledge_qa(turn).await.unwrap()).await;

    // 引用帧先行，且恰好一次
    assert_eq!(frames[0].response_type, ResponseType::References);
    let references = frames[0].references.as_ref().unwrap();
    assert_eq!(references.len(), 1);
    assert_eq!(references[0].chunk_id, fixture.chunk_ids[1]);
    assert_eq!(references[0].knowledge_id, "knowledge-1");
    assert_eq!(
        serde_json::to_value(references[0].match_type).unwrap(),
        serde_json::json!("vector")
    );

    let answer: String = frames
        .iter()
        .skip(1)
        .map(|f| f.content.as_str())
        .collect();
    assert!(!answer.is_empty());
    assert!(frames.last().unwrap().done);
    assert!(frames.last().unwrap().error.is_none());

    // assistant 消息已持久化并携带引用
    tokio::time::sleep(Duration::from_millis(100)).await;
    let persisted = fixture
        .message_store
        .get_by_request("session-1", "req-1")
        .await
        .unwrap();
    // 用户消息与 assistant 消息共享 request_id，取 assistant 的那条
    let recent = fixture
        .message_store
        .list_recent("session-1", 10)
        .await
        .unwrap();
    assert!(persisted.is_some());
    let assistant = recent
        .iter()
        .find(|m| m.role == rag_core::MessageRole::Assistant)
        .expect("assistant message persisted");
    assert_eq!(assistant.knowledge_references.len(), 1);
    assert_eq!(assistant.content, answer);
}

#[tokio::test]
async fn fixed_fallback_emits_single_terminal_frame() {
    let fixture = fixture(vec!["should never be used".into()]).await;

    let mut session = session(0.99, 5, "session-2");
    session.fallback_response = "I cannot answer.".into();
    let turn = ChatTurn::new(
        tenant_with_vector_memory(),
        session,
        kb(),
        "anything",
        "req-2",
    );
    let frames = collect(fixture.service.knowledge_qa(turn).await.unwrap()).await;

    assert_eq!(frames[0].response_type, ResponseType::References);
    assert!(frames[0].references.as_ref().unwrap().is_empty());

    let answers: Vec<&StreamResponse> = frames
        .iter()
        .filter(|f| f.response_type == ResponseType::Answer)
        .collect();
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].content, "I cannot answer.");
    assert!(answers[0].done);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let recent = fixture
        .message_store
        .list_recent("session-2", 10)
        .await
        .unwrap();
    let assistant = recent
        .iter()
        .find(|m| m.role == rag_core::MessageRole::Assistant)
        .expect("assistant message persisted");
    assert_eq!(assistant.content, "I cannot answer.");
    assert!(assistant.knowledge_references.is_empty());
}

#[tokio::test]
async fn disconnected_client_can_resume_the_stream() {
    let long_answer = (0..20)
        .map(|i| format!("word{}", i))
        .collect::<Vec<_>>()
        .join(" ");
    let fixture = fixture(vec![long_answer.clone()]).await;

    let turn = ChatTurn::new(
        tenant_with_vector_memory(),
        session(0.1, 1, "session-3"),
        kb(),
        "Tell me about comets.",
        "req-3",
    );
    let mut rx = fixture.service.knowledge_qa(turn).await.unwrap();

    // 收到引用帧和一个增量后断开
    let first = rx.recv().await.unwrap();
    assert_eq!(first.response_type, ResponseType::References);
    let _ = rx.recv().await.unwrap();
    drop(rx);

    // 服务端继续生成；稍后用相同 (session, request) 续流
    tokio::time::sleep(Duration::from_millis(200)).await;
    let frames = collect(
        fixture
            .service
            .continue_stream("session-3", "req-3")
            .await
            .unwrap(),
    )
    .await;

    assert_eq!(frames[0].response_type, ResponseType::References);
    assert_eq!(frames[0].references.as_ref().unwrap().len(), 1);
    let resumed: String = frames
        .iter()
        .filter(|f| f.response_type == ResponseType::Answer)
        .map(|f| f.content.as_str())
        .collect();
    assert_eq!(resumed, long_answer);
    assert!(frames.last().unwrap().done);
}

#[tokio::test]
async fn soft_deleted_chunk_does_not_break_merge() {
    let fixture = fixture(vec!["answer".into()]).await;
    // 软删除被命中的 chunk：引用仍可解析，回合不报错
    fixture
        .chunk_store
        .delete("knowledge-1", &fixture.chunk_ids[1])
        .await
        .unwrap();

    let turn = ChatTurn::new(
        tenant_with_vector_memory(),
        session(0.1, 1, "session-4"),
        kb(),
        "Tell me about comets.",
        "req-4",
    );
    let frames = collect(fixture.service.knowledge_qa(turn).await.unwrap()).await;
    assert!(frames.last().unwrap().done);
    assert!(frames.last().unwrap().error.is_none());
}
