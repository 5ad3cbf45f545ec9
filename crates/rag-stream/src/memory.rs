use async_trait::async_trait;
use chrono::Utc;
use rag_core::References;
use rag_error::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{StreamInfo, StreamManager, COMPLETED_CLEANUP_DELAY};

type StreamMap = HashMap<String, HashMap<String, StreamInfo>>;

/// 进程内活跃流管理器
pub struct MemoryStreamManager {
    // session_id -> request_id -> info
    active_streams: Arc<RwLock<StreamMap>>,
    ttl: Duration,
    cleanup_delay: Duration,
}

impl MemoryStreamManager {
    pub fn new(ttl: Duration) -> Self {
        let manager = Self {
            active_streams: Arc::new(RwLock::new(HashMap::new())),
            ttl,
            cleanup_delay: COMPLETED_CLEANUP_DELAY,
        };
        manager.spawn_ttl_sweeper();
        manager
    }

    /// 测试用：缩短完成后的清理延迟
    pub fn with_cleanup_delay(mut self, delay: Duration) -> Self {
        self.cleanup_delay = delay;
        self
    }

    /// 定期清理超过 TTL 未更新的流
    fn spawn_ttl_sweeper(&self) {
        let streams = self.active_streams.clone();
        let ttl = self.ttl;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let now = Utc::now();
                let mut guard = streams.write().await;
                guard.retain(|_, requests| {
                    requests.retain(|_, info| {
                        (now - info.last_updated).to_std().unwrap_or_default() < ttl
                    });
                    !requests.is_empty()
                });
            }
        });
    }
}

#[async_trait]
impl StreamManager for MemoryStreamManager {
    async fn register_stream(
        &self,
        session_id: &str,
        request_id: &str,
        query: &str,
    ) -> Result<()> {
        let mut guard = self.active_streams.write().await;
        guard.entry(session_id.to_string()).or_default().insert(
            request_id.to_string(),
            StreamInfo {
                session_id: session_id.to_string(),
                request_id: request_id.to_string(),
                query: query.to_string(),
                content: String::new(),
                knowledge_references: References::new(),
                last_updated: Utc::now(),
                is_completed: false,
            },
        );
        Ok(())
    }

    async fn update_stream(
        &self,
        session_id: &str,
        request_id: &str,
        content: &str,
        references: Option<&References>,
    ) -> Result<()> {
        let mut guard = self.active_streams.write().await;
        if let Some(requests) = guard.get_mut(session_id) {
            if let Some(info) = requests.get_mut(request_id) {
                info.content.push_str(content);
                if let Some(refs) = references {
                    if !refs.is_empty() {
                        info.knowledge_references = refs.clone();
                    }
                }
                info.last_updated = Utc::now();
            }
        }
        Ok(())
    }

    async fn complete_stream(&self, session_id: &str, request_id: &str) -> Result<()> {
        let mut guard = self.active_streams.write().await;
        if let Some(requests) = guard.get_mut(session_id) {
            if let Some(info) = requests.get_mut(request_id) {
                info.is_completed = true;
                info.last_updated = Utc::now();

                let streams = self.active_streams.clone();
                let session_id = session_id.to_string();
                let request_id = request_id.to_string();
                let delay = self.cleanup_delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let mut guard = streams.write().await;
                    if let Some(requests) = guard.get_mut(&session_id) {
                        requests.remove(&request_id);
                        if requests.is_empty() {
                            guard.remove(&session_id);
                        }
                    }
                    debug!(%session_id, %request_id, "completed stream removed");
                });
            }
        }
        Ok(())
    }

    async fn get_stream(&self, session_id: &str, request_id: &str) -> Result<Option<StreamInfo>> {
        let guard = self.active_streams.read().await;
        Ok(guard
            .get(session_id)
            .and_then(|requests| requests.get(request_id))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rag_core::{MatchType, Reference};

    fn manager() -> MemoryStreamManager {
        MemoryStreamManager::new(Duration::from_secs(3600))
            .with_cleanup_delay(Duration::from_millis(50))
    }

    #[tokio::test]
    async fn content_grows_as_prefix() {
        let m = manager();
        m.register_stream("s1", "r1", "what is a comet").await.unwrap();

        let mut previous = String::new();
        for delta in ["A ", "comet ", "is ", "icy."] {
            m.update_stream("s1", "r1", delta, None).await.unwrap();
            let snapshot = m.get_stream("s1", "r1").await.unwrap().unwrap();
            assert!(snapshot.content.starts_with(&previous));
            previous = snapshot.content;
        }
        assert_eq!(previous, "A comet is icy.");
    }

    #[tokio::test]
    async fn references_replaced_only_when_non_empty() {
        let m = manager();
        m.register_stream("s1", "r1", "q").await.unwrap();

        let refs = vec![Reference {
            chunk_id: "c1".into(),
            knowledge_id: "k1".into(),
            score: 0.8,
            match_type: MatchType::Vector,
        }];
        m.update_stream("s1", "r1", "a", Some(&refs)).await.unwrap();
        m.update_stream("s1", "r1", "b", Some(&References::new()))
            .await
            .unwrap();

        let snapshot = m.get_stream("s1", "r1").await.unwrap().unwrap();
        assert_eq!(snapshot.content, "ab");
        assert_eq!(snapshot.knowledge_references.len(), 1);
    }

    #[tokio::test]
    async fn update_on_absent_key_is_noop() {
        let m = manager();
        m.update_stream("missing", "r", "x", None).await.unwrap();
        m.complete_stream("missing", "r").await.unwrap();
        assert!(m.get_stream("missing", "r").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn completed_stream_is_deleted_after_delay() {
        let m = manager();
        m.register_stream("s1", "r1", "q").await.unwrap();
        m.update_stream("s1", "r1", "done answer", None).await.unwrap();
        m.complete_stream("s1", "r1").await.unwrap();

        // 完成后的宽限期内仍可读，供断线客户端续流
        let snapshot = m.get_stream("s1", "r1").await.unwrap().unwrap();
        assert!(snapshot.is_completed);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(m.get_stream("s1", "r1").await.unwrap().is_none());
    }
}
