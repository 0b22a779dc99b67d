//! 持久化 - 业务能力层
//!
//! 基于 SQLite 的记录存储：按自然键 upsert、软删除和只读查询。
//!
//! 表结构在打开存储时统一创建，数据访问过程中不再检测"表不存在"。
//! 自然键的唯一约束只作用于未删除的行（部分唯一索引），
//! 因此软删除后重新查询同一个键会创建一条新记录。

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult, StoreError};
use crate::models::{
    ColumnKind, ExtractedRecord, GroupCount, GroupedCounts, Page, PersistedEntity, RecentEntry,
    Source, StoreStats, UpsertAction, UpsertOutcome,
};

/// 单页最大条数
pub const MAX_PER_PAGE: u32 = 100;
/// 统计中"最近更新"的条数
const RECENT_LIMIT: i64 = 10;

/// 记录存储
///
/// 连接由互斥锁保护，多个流水线可以共享同一个 `Arc<RecordStore>`
pub struct RecordStore {
    conn: Mutex<Connection>,
}

impl RecordStore {
    /// 打开（或创建）数据库文件，并确保表结构存在
    pub fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        info!("📦 打开数据库: {}", path.display());
        Self::with_connection(conn)
    }

    /// 内存数据库（测试用）
    pub fn in_memory() -> AppResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> AppResult<Self> {
        ensure_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned.into())
    }

    /// 按自然键创建或更新记录
    ///
    /// 存在未删除的记录时覆盖全部字段并累加查询次数，否则插入新记录。
    /// 并发插入导致唯一约束冲突时转为一次更新重试。
    pub fn upsert(&self, source: Source, key: &str, record: &ExtractedRecord) -> AppResult<UpsertOutcome> {
        let mut conn = self.lock()?;
        retry_on_conflict(|| upsert_once(&mut conn, source, key, record))
    }

    /// 软删除未删除的记录，返回受影响的行数（0 表示没有可删除的记录）
    pub fn mark_deleted(&self, source: Source, key: &str) -> AppResult<usize> {
        let conn = self.lock()?;
        let now = timestamp(Utc::now());
        let sql = format!(
            "UPDATE {table} SET deleted_at = ?1, updated_at = ?1 \
             WHERE {key_col} = ?2 AND deleted_at IS NULL",
            table = source.table(),
            key_col = source.key_column(),
        );
        let affected = conn.execute(&sql, rusqlite::params![now, key])?;
        debug!("软删除 {} {}: {} 行", source, key, affected);
        Ok(affected)
    }

    /// 读取未删除的记录
    pub fn get_live(&self, source: Source, key: &str) -> AppResult<Option<PersistedEntity>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {cols} FROM {table} WHERE {key_col} = ?1 AND deleted_at IS NULL",
            cols = select_columns(source),
            table = source.table(),
            key_col = source.key_column(),
        );
        let entity = conn
            .query_row(&sql, [key], |row| read_entity(source, row))
            .optional()?;
        Ok(entity)
    }

    /// 某个自然键的全部记录（含已删除），按创建顺序
    pub fn history(&self, source: Source, key: &str) -> AppResult<Vec<PersistedEntity>> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {cols} FROM {table} WHERE {key_col} = ?1 ORDER BY id",
            cols = select_columns(source),
            table = source.table(),
            key_col = source.key_column(),
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([key], |row| read_entity(source, row))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// 未删除记录的数量
    pub fn count_live(&self, source: Source) -> AppResult<i64> {
        let conn = self.lock()?;
        count_live(&conn, source)
    }

    /// 分页列出未删除的记录，按更新时间倒序
    pub fn list_live(&self, source: Source, page: u32, per_page: u32) -> AppResult<Page<PersistedEntity>> {
        let page = page.max(1);
        let per_page = per_page.clamp(1, MAX_PER_PAGE);
        let offset = i64::from(page - 1) * i64::from(per_page);

        let conn = self.lock()?;
        let total = count_live(&conn, source)?;

        let sql = format!(
            "SELECT {cols} FROM {table} WHERE deleted_at IS NULL \
             ORDER BY updated_at DESC, id DESC LIMIT ?1 OFFSET ?2",
            cols = select_columns(source),
            table = source.table(),
        );
        let mut stmt = conn.prepare(&sql)?;
        let items = stmt
            .query_map(rusqlite::params![i64::from(per_page), offset], |row| read_entity(source, row))?
            .collect::<Result<Vec<_>, _>>()?;

        let per_page_i = i64::from(per_page);
        Ok(Page {
            total,
            page,
            per_page,
            total_pages: (total + per_page_i - 1) / per_page_i,
            items,
        })
    }

    /// 统计：总数、分组计数、最近更新
    pub fn stats(&self, source: Source) -> AppResult<StoreStats> {
        let conn = self.lock()?;
        let total = count_live(&conn, source)?;

        let mut grouped = Vec::new();
        for group in source.stat_groups() {
            let sql = format!(
                "SELECT {col}, COUNT(*) AS n FROM {table} \
                 WHERE deleted_at IS NULL AND {col} IS NOT NULL AND {col} != '' \
                 GROUP BY {col} ORDER BY n DESC, {col} ASC LIMIT ?1",
                col = group.column,
                table = source.table(),
            );
            // LIMIT -1 表示不限制
            let limit = group.limit.map(|n| n as i64).unwrap_or(-1);
            let mut stmt = conn.prepare(&sql)?;
            let groups = stmt
                .query_map([limit], |row| {
                    Ok(GroupCount {
                        value: row.get(0)?,
                        count: row.get(1)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            grouped.push(GroupedCounts {
                column: group.column.to_string(),
                groups,
            });
        }

        let sql = format!(
            "SELECT {key_col}, updated_at FROM {table} WHERE deleted_at IS NULL \
             ORDER BY updated_at DESC, id DESC LIMIT ?1",
            key_col = source.key_column(),
            table = source.table(),
        );
        let mut stmt = conn.prepare(&sql)?;
        let recent = stmt
            .query_map([RECENT_LIMIT], |row| {
                Ok(RecentEntry {
                    natural_key: row.get(0)?,
                    updated_at: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(StoreStats {
            total,
            grouped,
            recent,
        })
    }

    /// 检查存储是否可用
    pub fn ping(&self) -> AppResult<()> {
        let conn = self.lock()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }
}

/// 创建全部数据表和索引（幂等）
fn ensure_schema(conn: &Connection) -> AppResult<()> {
    for source in Source::ALL {
        let table = source.table();
        let key_col = source.key_column();

        let mut columns = vec![
            "id INTEGER PRIMARY KEY AUTOINCREMENT".to_string(),
            format!("{} TEXT NOT NULL", key_col),
        ];
        for field in source.schema().fields {
            if let Some(column) = field.column {
                columns.push(match field.kind {
                    ColumnKind::Text => format!("{} TEXT NOT NULL DEFAULT ''", column),
                    ColumnKind::Integer => format!("{} INTEGER NOT NULL DEFAULT 0", column),
                });
            }
        }
        columns.push("query_count INTEGER NOT NULL DEFAULT 1".to_string());
        columns.push("created_at TEXT NOT NULL".to_string());
        columns.push("updated_at TEXT NOT NULL".to_string());
        columns.push("deleted_at TEXT".to_string());

        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {table} ({columns});
             CREATE UNIQUE INDEX IF NOT EXISTS ux_{table}_live ON {table}({key_col}) WHERE deleted_at IS NULL;
             CREATE INDEX IF NOT EXISTS ix_{table}_updated ON {table}(updated_at);",
            table = table,
            columns = columns.join(", "),
            key_col = key_col,
        );
        conn.execute_batch(&sql)?;
        debug!("数据表 {} 已就绪", table);
    }
    Ok(())
}

/// 唯一约束冲突时再执行一次，第二次会命中更新分支
fn retry_on_conflict<F>(mut attempt: F) -> AppResult<UpsertOutcome>
where
    F: FnMut() -> AppResult<UpsertOutcome>,
{
    match attempt() {
        Err(AppError::Store(StoreError::Conflict { key })) => {
            warn!("自然键 {} 插入冲突，转为更新", key);
            attempt()
        }
        other => other,
    }
}

fn upsert_once(
    conn: &mut Connection,
    source: Source,
    key: &str,
    record: &ExtractedRecord,
) -> AppResult<UpsertOutcome> {
    let now = timestamp(Utc::now());
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let outcome = match update_live(&tx, source, key, record, &now)? {
        Some(outcome) => outcome,
        None => insert_live(&tx, source, key, record, &now)?,
    };
    tx.commit()?;
    Ok(outcome)
}

/// 更新未删除的记录，没有时返回 None
fn update_live(
    conn: &Connection,
    source: Source,
    key: &str,
    record: &ExtractedRecord,
    now: &Value,
) -> AppResult<Option<UpsertOutcome>> {
    let (columns, mut params) = column_values(record);
    let mut set_clause: Vec<String> = columns.iter().map(|c| format!("{} = ?", c)).collect();
    set_clause.push("query_count = query_count + 1".to_string());
    set_clause.push("updated_at = ?".to_string());
    let update_sql = format!(
        "UPDATE {table} SET {set} WHERE {key_col} = ? AND deleted_at IS NULL RETURNING id, query_count",
        table = source.table(),
        set = set_clause.join(", "),
        key_col = source.key_column(),
    );
    params.push(now.clone());
    params.push(Value::Text(key.to_string()));

    let updated = conn
        .query_row(&update_sql, params_from_iter(params), |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })
        .optional()?;

    Ok(updated.map(|(entity_id, query_count)| {
        debug!("更新 {} {} (id={}, 第 {} 次查询)", source, key, entity_id, query_count);
        UpsertOutcome {
            action: UpsertAction::Updated,
            entity_id,
            query_count,
        }
    }))
}

/// 插入新记录，自然键已有未删除的行时返回 `StoreError::Conflict`
fn insert_live(
    conn: &Connection,
    source: Source,
    key: &str,
    record: &ExtractedRecord,
    now: &Value,
) -> AppResult<UpsertOutcome> {
    let (columns, values) = column_values(record);
    let mut insert_columns = vec![source.key_column()];
    insert_columns.extend(columns.iter().copied());
    insert_columns.extend(["query_count", "created_at", "updated_at"]);
    let placeholders = vec!["?"; insert_columns.len()].join(", ");
    let insert_sql = format!(
        "INSERT INTO {table} ({cols}) VALUES ({placeholders})",
        table = source.table(),
        cols = insert_columns.join(", "),
    );
    let mut params = vec![Value::Text(key.to_string())];
    params.extend(values);
    params.push(Value::Integer(1));
    params.push(now.clone());
    params.push(now.clone());

    match conn.execute(&insert_sql, params_from_iter(params)) {
        Ok(_) => {}
        Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
            return Err(StoreError::Conflict {
                key: key.to_string(),
            }
            .into());
        }
        Err(e) => return Err(e.into()),
    }

    let entity_id = conn.last_insert_rowid();
    debug!("新建 {} {} (id={})", source, key, entity_id);
    Ok(UpsertOutcome {
        action: UpsertAction::Created,
        entity_id,
        query_count: 1,
    })
}

/// 记录中映射到数据库列的字段，按 schema 顺序
fn column_values(record: &ExtractedRecord) -> (Vec<&'static str>, Vec<Value>) {
    record
        .iter()
        .filter_map(|(field, value)| {
            let column = field.column?;
            let value = match field.kind {
                ColumnKind::Text => Value::Text(value.to_string()),
                ColumnKind::Integer => Value::Integer(value.trim().parse().unwrap_or(0)),
            };
            Some((column, value))
        })
        .unzip()
}

fn count_live(conn: &Connection, source: Source) -> AppResult<i64> {
    let sql = format!("SELECT COUNT(*) FROM {} WHERE deleted_at IS NULL", source.table());
    Ok(conn.query_row(&sql, [], |row| row.get(0))?)
}

/// 与 rusqlite 对 `DateTime<Utc>` 的文本格式保持一致，便于按文本排序
fn timestamp(at: DateTime<Utc>) -> Value {
    Value::Text(at.format("%F %T%.f%:z").to_string())
}

fn select_columns(source: Source) -> String {
    let mut columns = vec!["id", source.key_column()];
    columns.extend(source.schema().fields.iter().filter_map(|f| f.column));
    columns.extend(["query_count", "created_at", "updated_at", "deleted_at"]);
    columns.join(", ")
}

/// 按 `select_columns` 的列顺序读取一行
fn read_entity(source: Source, row: &Row<'_>) -> rusqlite::Result<PersistedEntity> {
    let schema = source.schema();
    let id: i64 = row.get(0)?;
    let natural_key: String = row.get(1)?;

    let mut fields = ExtractedRecord::empty(schema);
    let mut idx = 2;
    for field in schema.fields {
        match field.column {
            Some(_) => {
                let value = match field.kind {
                    ColumnKind::Text => row.get::<_, String>(idx)?,
                    ColumnKind::Integer => row.get::<_, i64>(idx)?.to_string(),
                };
                fields.set(field.key, value);
                idx += 1;
            }
            // 没有单独列的字段就是自然键
            None => {
                fields.set(field.key, natural_key.clone());
            }
        }
    }

    Ok(PersistedEntity {
        id,
        natural_key,
        fields,
        query_count: row.get(idx)?,
        created_at: row.get(idx + 1)?,
        updated_at: row.get(idx + 2)?,
        deleted_at: row.get(idx + 3)?,
    })
}
