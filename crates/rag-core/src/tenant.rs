use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::retriever::RetrieverEngineParams;

/// 租户，多租户隔离的根实体
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Tenant {
    pub id: u32,
    pub name: String,
    pub description: String,
    /// API key，更新租户时轮换
    pub api_key: String,
    /// 租户配置的检索引擎组合，按优先级排序
    pub retriever_engines: Vec<RetrieverEngineParams>,
    /// 存储配额（字节），0 表示不限制
    pub storage_quota: i64,
    /// 已用存储（字节），并发修改必须按租户串行化
    pub storage_used: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    pub fn new_api_key() -> String {
        format!("sk-{}", uuid::Uuid::new_v4().simple())
    }
}
