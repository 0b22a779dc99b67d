//! 单条查询与存储读写 - 编排层
//!
//! 对外暴露的每个来源一组操作：查询、软删除、列表、详情、统计。
//! 查询结果统一为 `PipelineOutcome`，调用方能区分"查到了但没有数据"和"没能查询"。
//! 只读写数据库的操作在 `Records` 上，不需要初始化整个应用。

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::models::{Page, PersistedEntity, SearchMode, Source, StoreStats};
use crate::orchestrator::App;
use crate::services::RecordStore;
use crate::workflow::{PipelineOutcome, QueryRequest};

/// 软删除结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteOutcome {
    pub source: Source,
    pub natural_key: String,
    /// 0 表示该键没有未删除的记录
    pub rows_affected: usize,
}

/// 单个来源的记录数
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceTotal {
    pub source: Source,
    pub table: &'static str,
    pub live: i64,
}

/// 服务状态
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub store_reachable: bool,
    pub totals: Vec<SourceTotal>,
}

impl App {
    /// 查询车辆（SUNARP）
    pub async fn run_vehicle_query(&self, plate: &str) -> PipelineOutcome {
        self.run_request(&QueryRequest::vehicle(plate)).await
    }

    /// 查询驾驶员（SCPPP）
    pub async fn run_driver_query(&self, value: &str, mode: SearchMode) -> PipelineOutcome {
        self.run_request(&QueryRequest::driver(value, mode)).await
    }

    /// 与流水线共享同一个存储的读写句柄
    pub fn records(&self) -> Records {
        Records::new(Arc::clone(&self.store))
    }
}

/// 存储读写：软删除、列表、详情、统计、服务状态
///
/// 只依赖数据库，不需要浏览器、识别器或日志文件
#[derive(Clone)]
pub struct Records {
    store: Arc<RecordStore>,
}

impl Records {
    pub fn new(store: Arc<RecordStore>) -> Self {
        Self { store }
    }

    /// 按配置打开数据库
    pub fn open(config: &Config) -> AppResult<Self> {
        Ok(Self::new(Arc::new(RecordStore::open(&config.database_path)?)))
    }

    /// 软删除车辆记录
    pub fn delete_vehicle(&self, plate: &str) -> AppResult<DeleteOutcome> {
        self.delete(Source::Vehiculo, plate)
    }

    /// 软删除驾驶员记录
    pub fn delete_driver(&self, value: &str) -> AppResult<DeleteOutcome> {
        self.delete(Source::Conductor, value)
    }

    fn delete(&self, source: Source, raw_key: &str) -> AppResult<DeleteOutcome> {
        let natural_key = source.normalize_key(raw_key);
        if natural_key.is_empty() {
            return Err(AppError::InvalidInput(format!("{} 的键不能为空", source)));
        }
        let rows_affected = self.store.mark_deleted(source, &natural_key)?;
        if rows_affected == 0 {
            info!("🗑️ {} {} 没有可删除的记录", source, natural_key);
        } else {
            info!("🗑️ 已删除 {} {}", source, natural_key);
        }
        Ok(DeleteOutcome {
            source,
            natural_key,
            rows_affected,
        })
    }

    /// 读取一条未删除的记录
    pub fn get(&self, source: Source, raw_key: &str) -> AppResult<Option<PersistedEntity>> {
        self.store.get_live(source, &source.normalize_key(raw_key))
    }

    /// 分页列出未删除的记录（按更新时间倒序）
    pub fn list(&self, source: Source, page: u32, per_page: u32) -> AppResult<Page<PersistedEntity>> {
        self.store.list_live(source, page, per_page)
    }

    /// 统计
    pub fn stats(&self, source: Source) -> AppResult<StoreStats> {
        self.store.stats(source)
    }

    /// 服务状态：存储是否可用 + 各来源记录数
    ///
    /// 存储不可用时不返回错误，而是在状态里标记出来
    pub fn status(&self) -> ServiceStatus {
        if let Err(e) = self.store.ping() {
            warn!("数据库不可用: {}", e);
            return ServiceStatus::unreachable();
        }

        let totals = Source::ALL
            .iter()
            .filter_map(|&source| {
                self.store.count_live(source).ok().map(|live| SourceTotal {
                    source,
                    table: source.table(),
                    live,
                })
            })
            .collect();

        ServiceStatus {
            store_reachable: true,
            totals,
        }
    }
}

impl ServiceStatus {
    /// 按配置检查服务状态，数据库打不开也返回状态
    pub fn check(config: &Config) -> Self {
        match Records::open(config) {
            Ok(records) => records.status(),
            Err(e) => {
                warn!("无法打开数据库 {}: {}", config.database_path, e);
                Self::unreachable()
            }
        }
    }

    fn unreachable() -> Self {
        Self {
            store_reachable: false,
            totals: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::error::ErrorKind;
    use crate::models::ExtractedRecord;
    use crate::services::{TesseractRecognizer, VisionService};
    use crate::workflow::PipelineStage;

    fn records() -> Records {
        Records::new(Arc::new(RecordStore::in_memory().unwrap()))
    }

    fn vehicle(placa: &str) -> ExtractedRecord {
        ExtractedRecord::from_pairs(
            Source::Vehiculo.schema(),
            [("PLACA", placa), ("MARCA", "TOYOTA"), ("ESTADO", "EN CIRCULACION")],
        )
    }

    fn upsert(records: &Records, placa: &str) {
        records.store.upsert(Source::Vehiculo, placa, &vehicle(placa)).unwrap();
    }

    #[test]
    fn test_delete_normalizes_plate_and_is_idempotent() {
        let records = records();
        upsert(&records, "ABC123");

        let first = records.delete_vehicle(" abc 123 ").unwrap();
        assert_eq!(first.natural_key, "ABC123");
        assert_eq!(first.rows_affected, 1);

        let second = records.delete_vehicle("ABC123").unwrap();
        assert_eq!(second.rows_affected, 0);
        assert!(records.get(Source::Vehiculo, "ABC123").unwrap().is_none());
    }

    #[test]
    fn test_delete_driver_without_record() {
        let records = records();
        let outcome = records.delete_driver("Q45678912").unwrap();
        assert_eq!(outcome.source, Source::Conductor);
        assert_eq!(outcome.rows_affected, 0);

        let err = records.delete_driver("  ").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_status_reports_totals() {
        let records = records();
        upsert(&records, "ABC123");
        upsert(&records, "XYZ789");

        let status = records.status();
        assert!(status.store_reachable);
        assert_eq!(status.totals.len(), 2);
        let vehicles = status.totals.iter().find(|t| t.source == Source::Vehiculo).unwrap();
        assert_eq!(vehicles.live, 2);
        let drivers = status.totals.iter().find(|t| t.source == Source::Conductor).unwrap();
        assert_eq!(drivers.live, 0);
    }

    #[test]
    fn test_status_with_unopenable_database() {
        let config = Config {
            database_path: "/nonexistent-dir/consultas/consultas.db".to_string(),
            ..Config::default()
        };

        let status = ServiceStatus::check(&config);
        assert!(!status.store_reachable);
        assert!(status.totals.is_empty());
    }

    #[test]
    fn test_list_and_stats() {
        let records = records();
        upsert(&records, "ABC123");

        let page = records.list(Source::Vehiculo, 1, 20).unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].natural_key, "ABC123");

        let stats = records.stats(Source::Vehiculo).unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.recent[0].natural_key, "ABC123");
    }

    #[tokio::test]
    async fn test_blank_queries_are_rejected() {
        let config = Config::default();
        let store = Arc::new(RecordStore::in_memory().unwrap());
        let vision = Arc::new(VisionService::new(&config));
        let app = App::from_parts(
            config,
            Arc::clone(&store),
            Arc::new(TesseractRecognizer::new("tesseract")),
            vision,
        );

        let failure = app.run_vehicle_query("   ").await.unwrap_err();
        assert_eq!(failure.stage, PipelineStage::Init);
        assert_eq!(failure.kind(), ErrorKind::InvalidInput);

        let failure = app.run_driver_query("", SearchMode::Documento).await.unwrap_err();
        assert_eq!(failure.kind(), ErrorKind::InvalidInput);

        assert_eq!(app.records().status().totals.iter().map(|t| t.live).sum::<i64>(), 0);
    }
}
