//! 应用入口与批量查询 - 编排层
//!
//! ## 职责
//!
//! 1. **应用初始化**：日志文件、数据库、识别器、流水线，只构建一次
//! 2. **批量查询**：使用 Semaphore 限制同时进行的查询数量
//! 3. **全局统计**：汇总所有查询的结果
//!
//! 单条查询和存储读写见 `query_processor`。

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{AppError, AppResult, ConfigError};
use crate::models::{load_batch_file, BatchQuery, Source};
use crate::services::{
    CaptchaAdapter, MarkupExtraction, Recognizer, RecordStore, TesseractRecognizer,
    VisionLabelExtraction, VisionRecognizer, VisionService,
};
use crate::utils::logging::{init_log_file, log_startup, print_final_stats};
use crate::workflow::{
    session_left_open, FailureReport, PipelineOutcome, PipelineSettings, QueryPipeline,
    QueryRequest, ScpppConnector, SunarpConnector,
};

/// 应用主结构
///
/// 所有字段都是共享句柄，克隆后可以交给并发任务
#[derive(Clone)]
pub struct App {
    pub(crate) config: Arc<Config>,
    pub(crate) store: Arc<RecordStore>,
    pub(crate) pipeline: Arc<QueryPipeline>,
    pub(crate) sunarp: Arc<SunarpConnector>,
    pub(crate) scppp: Arc<ScpppConnector>,
    pub(crate) vehicle_extraction: Arc<VisionLabelExtraction>,
    pub(crate) driver_extraction: Arc<MarkupExtraction>,
}

impl App {
    /// 初始化应用
    pub async fn initialize(config: Config) -> AppResult<Self> {
        init_log_file(&config.output_log_file)?;
        log_startup(&config);

        let store = Arc::new(RecordStore::open(&config.database_path)?);
        let vision = Arc::new(VisionService::new(&config));
        let recognizer = build_captcha_recognizer(&config, Arc::clone(&vision))?;
        info!("🔑 验证码识别器: {}", recognizer.name());

        Ok(Self::from_parts(config, store, recognizer, vision))
    }

    /// 用已经构建好的依赖组装应用
    pub fn from_parts(
        config: Config,
        store: Arc<RecordStore>,
        captcha_recognizer: Arc<dyn Recognizer>,
        vision: Arc<VisionService>,
    ) -> Self {
        let config = Arc::new(config);
        let pipeline = QueryPipeline::new(
            CaptchaAdapter::new(captcha_recognizer),
            Arc::clone(&store),
            PipelineSettings::from_config(&config),
        );
        let sheet_reader: Arc<dyn Recognizer> = Arc::new(VisionRecognizer::vehicle_sheet(vision));

        Self {
            sunarp: Arc::new(SunarpConnector::new(Arc::clone(&config))),
            scppp: Arc::new(ScpppConnector::new(Arc::clone(&config))),
            vehicle_extraction: Arc::new(VisionLabelExtraction::vehicle(sheet_reader)),
            driver_extraction: Arc::new(MarkupExtraction::driver()),
            pipeline: Arc::new(pipeline),
            store,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    /// 从 TOML 文件执行批量查询
    pub async fn run_batch_file(&self, path: &Path) -> AppResult<BatchSummary> {
        info!("\n📁 正在读取批量查询文件...");
        let queries = load_batch_file(path).await?;
        if queries.is_empty() {
            warn!("⚠️ 文件中没有可执行的查询，程序结束");
            return Ok(BatchSummary::default());
        }
        self.run_batch(queries).await
    }

    /// 并发执行一组查询
    pub async fn run_batch(&self, queries: Vec<BatchQuery>) -> AppResult<BatchSummary> {
        let max_concurrent = self.config.max_concurrent_queries.max(1);
        info!("✓ 共 {} 条查询，最多同时进行 {} 条", queries.len(), max_concurrent);

        let semaphore = Arc::new(Semaphore::new(max_concurrent));
        let mut handles = Vec::with_capacity(queries.len());

        for (idx, query) in queries.into_iter().enumerate() {
            let request = to_request(&query);
            let natural_key = request.natural_key.clone();
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| AppError::Other(format!("并发控制异常: {}", e)))?;
            let app = self.clone();

            let handle = tokio::spawn(async move {
                let _permit = permit;
                app.run_request(&request).await
            });
            handles.push((idx + 1, natural_key, handle));
        }

        let mut summary = BatchSummary::default();
        for (index, natural_key, handle) in handles {
            match handle.await {
                Ok(outcome) => summary.tally(index, natural_key, &outcome),
                Err(e) => {
                    error!("[查询 {} {}] 任务执行失败: {}", index, natural_key, e);
                    summary.failed += 1;
                }
            }
        }

        print_final_stats(
            summary.success,
            summary.incomplete,
            summary.failed,
            &self.config.output_log_file,
        );
        if summary.unclosed_sessions > 0 {
            warn!("⚠️ {} 个会话未能正常关闭，请检查残留的浏览器进程", summary.unclosed_sessions);
        }
        Ok(summary)
    }

    /// 按来源选择门户和解析策略执行一次查询
    pub async fn run_request(&self, request: &QueryRequest) -> PipelineOutcome {
        match request.source {
            Source::Vehiculo => {
                self.pipeline
                    .run(self.sunarp.as_ref(), self.vehicle_extraction.as_ref(), request)
                    .await
            }
            Source::Conductor => {
                self.pipeline
                    .run(self.scppp.as_ref(), self.driver_extraction.as_ref(), request)
                    .await
            }
        }
    }
}

/// 按配置构建验证码识别器
pub fn build_captcha_recognizer(
    config: &Config,
    vision: Arc<VisionService>,
) -> AppResult<Arc<dyn Recognizer>> {
    match config.captcha_recognizer.trim().to_lowercase().as_str() {
        "vision" => Ok(Arc::new(VisionRecognizer::captcha(vision))),
        "tesseract" => Ok(Arc::new(TesseractRecognizer::new(config.tesseract_path.clone()))),
        other => Err(ConfigError::InvalidValue {
            key: "captcha_recognizer".to_string(),
            value: other.to_string(),
        }
        .into()),
    }
}

fn to_request(query: &BatchQuery) -> QueryRequest {
    match query.fuente {
        Source::Vehiculo => QueryRequest::vehicle(&query.valor),
        Source::Conductor => QueryRequest::driver(&query.valor, query.modo.unwrap_or_default()),
    }
}

/// 批量查询中的单条失败
#[derive(Debug, Clone, Serialize)]
pub struct BatchFailure {
    pub index: usize,
    pub natural_key: String,
    pub report: FailureReport,
}

/// 批量查询统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    pub success: usize,
    /// 成功但门户未返回任何字段
    pub incomplete: usize,
    pub failed: usize,
    /// 关闭失败的会话数（可能残留浏览器进程）
    pub unclosed_sessions: usize,
    pub failures: Vec<BatchFailure>,
}

impl BatchSummary {
    /// 计入一条查询结果
    fn tally(&mut self, index: usize, natural_key: String, outcome: &PipelineOutcome) {
        if session_left_open(outcome) {
            self.unclosed_sessions += 1;
        }
        match outcome {
            Ok(success) => {
                self.success += 1;
                if success.incomplete {
                    self.incomplete += 1;
                }
            }
            Err(failure) => {
                self.failed += 1;
                self.failures.push(BatchFailure {
                    index,
                    natural_key,
                    report: failure.report(),
                });
            }
        }
    }
}
