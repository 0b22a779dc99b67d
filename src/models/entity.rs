use chrono::{DateTime, Utc};
use serde::Serialize;

use super::record::ExtractedRecord;

/// 持久化后的实体
#[derive(Debug, Clone, Serialize)]
pub struct PersistedEntity {
    pub id: i64,
    pub natural_key: String,
    pub fields: ExtractedRecord,
    pub query_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl PersistedEntity {
    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// upsert 执行的动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpsertAction {
    Created,
    Updated,
}

/// upsert 结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpsertOutcome {
    pub action: UpsertAction,
    pub entity_id: i64,
    pub query_count: i64,
}

/// 分页结果
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub total: i64,
    pub page: u32,
    pub per_page: u32,
    pub total_pages: i64,
    pub items: Vec<T>,
}

/// 单个分组的计数
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupCount {
    pub value: String,
    pub count: i64,
}

/// 按列分组的统计
#[derive(Debug, Clone, Serialize)]
pub struct GroupedCounts {
    pub column: String,
    pub groups: Vec<GroupCount>,
}

/// 最近更新的记录
#[derive(Debug, Clone, Serialize)]
pub struct RecentEntry {
    pub natural_key: String,
    pub updated_at: DateTime<Utc>,
}

/// 存储统计
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub total: i64,
    pub grouped: Vec<GroupedCounts>,
    pub recent: Vec<RecentEntry>,
}

impl StoreStats {
    /// 读取某一列的分组统计
    pub fn group(&self, column: &str) -> Option<&GroupedCounts> {
        self.grouped.iter().find(|g| g.column == column)
    }
}
