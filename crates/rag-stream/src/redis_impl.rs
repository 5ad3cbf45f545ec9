use async_trait::async_trait;
use chrono::Utc;
use rag_core::References;
use rag_error::Result;
use redis::AsyncCommands;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::{StreamInfo, StreamManager, COMPLETED_CLEANUP_DELAY, DEFAULT_STREAM_TTL};

/// Redis 活跃流管理器，键 <prefix>:<session>:<request>，
/// 每次变更都以 SET + TTL 整体覆盖 JSON 值。
#[derive(Clone)]
pub struct RedisStreamManager {
    client: redis::Client,
    ttl: Duration,
    prefix: String,
}

impl RedisStreamManager {
    pub async fn new(
        redis_addr: &str,
        redis_password: Option<&str>,
        redis_db: Option<i64>,
        prefix: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<Self> {
        // redis://[:password@]host:port/db
        let mut url = match redis_password {
            Some(pw) if !pw.is_empty() => format!("redis://:{}@{}", pw, redis_addr),
            _ => format!("redis://{}", redis_addr),
        };
        if let Some(db) = redis_db {
            url = format!("{}/{}", url.trim_end_matches('/'), db);
        }
        let client = redis::Client::open(url)?;

        // 启动时验证连通性
        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: () = redis::cmd("PING").query_async(&mut conn).await?;

        Ok(Self {
            client,
            ttl: ttl.unwrap_or(DEFAULT_STREAM_TTL),
            prefix: prefix.unwrap_or("stream").to_string(),
        })
    }

    fn build_key(&self, session_id: &str, request_id: &str) -> String {
        format!("{}:{}:{}", self.prefix, session_id, request_id)
    }

    async fn load(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        key: &str,
    ) -> Result<Option<StreamInfo>> {
        let data: Option<Vec<u8>> = conn.get(key).await?;
        match data {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    async fn store(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        key: &str,
        info: &StreamInfo,
    ) -> Result<()> {
        let data = serde_json::to_vec(info)?;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(data)
            .arg("EX")
            .arg(self.ttl.as_secs())
            .query_async(conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl StreamManager for RedisStreamManager {
    async fn register_stream(
        &self,
        session_id: &str,
        request_id: &str,
        query: &str,
    ) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let info = StreamInfo {
            session_id: session_id.to_string(),
            request_id: request_id.to_string(),
            query: query.to_string(),
            content: String::new(),
            knowledge_references: References::new(),
            last_updated: Utc::now(),
            is_completed: false,
        };
        let key = self.build_key(session_id, request_id);
        self.store(&mut conn, &key, &info).await
    }

    async fn update_stream(
        &self,
        session_id: &str,
        request_id: &str,
        content: &str,
        references: Option<&References>,
    ) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = self.build_key(session_id, request_id);
        // 键不存在说明流已过期，静默跳过
        let Some(mut info) = self.load(&mut conn, &key).await? else {
            return Ok(());
        };
        info.content.push_str(content);
        if let Some(refs) = references {
            if !refs.is_empty() {
                info.knowledge_references = refs.clone();
            }
        }
        info.last_updated = Utc::now();
        self.store(&mut conn, &key, &info).await
    }

    async fn complete_stream(&self, session_id: &str, request_id: &str) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = self.build_key(session_id, request_id);
        let Some(mut info) = self.load(&mut conn, &key).await? else {
            return Ok(());
        };
        info.is_completed = true;
        info.last_updated = Utc::now();
        self.store(&mut conn, &key, &info).await?;

        // 宽限期后删除，断线客户端还有机会续流
        let client = self.client.clone();
        tokio::spawn(async move {
            sleep(COMPLETED_CLEANUP_DELAY).await;
            match client.get_multiplexed_async_connection().await {
                Ok(mut conn) => {
                    let deleted: std::result::Result<(), redis::RedisError> =
                        redis::cmd("DEL").arg(&key).query_async(&mut conn).await;
                    match deleted {
                        Ok(()) => debug!(%key, "completed stream removed"),
                        Err(err) => warn!(%key, error = %err, "failed to delete completed stream"),
                    }
                }
                Err(err) => warn!(%key, error = %err, "failed to connect for stream cleanup"),
            }
        });
        Ok(())
    }

    async fn get_stream(&self, session_id: &str, request_id: &str) -> Result<Option<StreamInfo>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = self.build_key(session_id, request_id);
        self.load(&mut conn, &key).await
    }
}
