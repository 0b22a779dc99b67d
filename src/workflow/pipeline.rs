//! 查询流水线 - 流程层
//!
//! 核心职责：定义"一次查询"的完整处理流程
//!
//! 流程顺序：
//! 1. 建立会话 → 加载落地页
//! 2. 切换查询方式
//! 3. 获取验证码 → 识别（失败时重新获取，次数可配置）
//! 4. 提交查询
//! 5. 解析结果
//! 6. 写入存储
//!
//! 任何一步失败都以 `PipelineFailure { stage, error }` 返回，会话在所有路径上都会关闭。
//! 关闭失败不改变结果，但会记录在 `close_error` 中。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{AppError, AppResult, CaptchaError, ExtractionError};
use crate::models::{ExtractedRecord, UpsertOutcome};
use crate::services::{CaptchaAdapter, Extraction, RecordStore};
use crate::workflow::portal::{Challenge, PortalConnector, PortalSession, QueryRequest};
use crate::workflow::stage::{PipelineFailure, PipelineOutcome, PipelineStage, QuerySuccess};

/// 流水线参数
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// 验证码识别失败后重新获取的次数
    pub captcha_retries: usize,
    /// 单个外部调用的超时
    pub stage_timeout: Duration,
    /// 提交查询的超时
    pub submit_timeout: Duration,
    /// 人工验证最长等待时间
    pub manual_challenge_timeout: Duration,
    /// 人工验证轮询间隔
    pub manual_poll_interval: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            captcha_retries: config.captcha_retries,
            stage_timeout: Duration::from_secs(config.stage_timeout_secs),
            submit_timeout: Duration::from_secs(config.submit_timeout_secs),
            manual_challenge_timeout: Duration::from_secs(config.manual_challenge_timeout_secs),
            manual_poll_interval: Duration::from_millis(config.manual_challenge_poll_ms),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// 查询流水线
///
/// - 编排完整的查询流程，决定何时重试、何时放弃
/// - 不持有门户会话（每次运行由 connector 新建并独占）
/// - 识别器和存储作为依赖注入，多次运行共享
pub struct QueryPipeline {
    captcha: CaptchaAdapter,
    store: Arc<RecordStore>,
    settings: PipelineSettings,
}

impl QueryPipeline {
    pub fn new(captcha: CaptchaAdapter, store: Arc<RecordStore>, settings: PipelineSettings) -> Self {
        Self {
            captcha,
            store,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// 执行一次查询
    pub async fn run<C: PortalConnector>(
        &self,
        connector: &C,
        extraction: &dyn Extraction,
        request: &QueryRequest,
    ) -> PipelineOutcome {
        info!("{} 🚀 开始查询 {}", request, request.source.portal());

        request
            .validate()
            .map_err(|e| PipelineFailure::new(PipelineStage::Init, e))?;

        let mut session = self
            .step(
                request,
                PipelineStage::LandingLoaded,
                self.settings.stage_timeout,
                connector.connect(),
            )
            .await?;

        let mut outcome = self.drive(&mut session, extraction, request).await;

        if outcome.is_err() {
            session.capture_diagnostics(request).await;
        }
        if let Err(e) = session.close().await {
            warn!("{} ⚠️ 关闭会话失败，浏览器可能仍在运行: {}", request, e);
            let reason = Some(e.to_string());
            match &mut outcome {
                Ok(success) => success.close_error = reason,
                Err(failure) => failure.close_error = reason,
            }
        }

        match &outcome {
            Ok(success) => info!(
                "{} ✅ 查询完成: {} 个字段, {:?} (第 {} 次查询)",
                request,
                success.field_count,
                success.persistence.action,
                success.persistence.query_count
            ),
            Err(failure) => error!("{} ❌ {}", request, failure),
        }
        outcome
    }

    async fn drive<S: PortalSession>(
        &self,
        session: &mut S,
        extraction: &dyn Extraction,
        request: &QueryRequest,
    ) -> PipelineOutcome {
        let stage_timeout = self.settings.stage_timeout;

        // 1. 落地页
        self.step(request, PipelineStage::LandingLoaded, stage_timeout, session.load_landing())
            .await?;

        // 2. 查询方式
        self.step(
            request,
            PipelineStage::ModeSelected,
            stage_timeout,
            session.select_mode(request),
        )
        .await?;

        // 3. 验证码
        let answer = self.solve_challenge(session, request).await?;

        // 4. 提交
        let raw = self
            .step(
                request,
                PipelineStage::Submitted,
                self.settings.submit_timeout,
                session.submit(request, answer.as_deref()),
            )
            .await?;
        debug!("{} 收到 {} 结果 ({} 字节)", request, raw.kind(), raw.len());

        // 5. 解析
        let output = self
            .step(request, PipelineStage::Parsed, stage_timeout, extraction.extract(&raw))
            .await?;
        let field_count = output.record.field_count();
        if field_count == 0 {
            warn!("{} 门户未返回任何字段", request);
        }

        // 6. 持久化：不加超时，等待时间由数据库的 busy_timeout 限定
        let persistence = self
            .persist(request, &output.record)
            .await
            .map_err(|e| PipelineFailure::new(PipelineStage::Persisted, e))?;
        debug!("{} → {}", request, PipelineStage::Persisted);

        Ok(QuerySuccess {
            source: request.source,
            natural_key: request.natural_key.clone(),
            field_count,
            incomplete: field_count == 0,
            record: output.record,
            raw_text: output.raw_text,
            papeletas: output.papeletas,
            persistence,
            close_error: None,
        })
    }

    /// 获取并识别验证码，识别失败时重新获取
    async fn solve_challenge<S: PortalSession>(
        &self,
        session: &mut S,
        request: &QueryRequest,
    ) -> Result<Option<String>, PipelineFailure> {
        let stage_timeout = self.settings.stage_timeout;
        let mut attempt = 0;

        loop {
            let challenge = self
                .step(request, PipelineStage::CaptchaFetched, stage_timeout, session.fetch_challenge())
                .await?;

            match challenge {
                Challenge::None => {
                    debug!("{} 无需验证", request);
                    return Ok(None);
                }
                Challenge::Interactive { selector } => {
                    self.await_manual_challenge(session, request, &selector).await?;
                    return Ok(None);
                }
                Challenge::Image(image) => {
                    match self
                        .step(
                            request,
                            PipelineStage::CaptchaSolved,
                            stage_timeout,
                            self.captcha.resolve(&image),
                        )
                        .await
                    {
                        Ok(text) => {
                            info!(
                                "{} 🔑 验证码: {} ({})",
                                request,
                                text,
                                self.captcha.recognizer_name()
                            );
                            return Ok(Some(text));
                        }
                        // 只有识别结果为空才重新获取，识别器本身出错直接失败
                        Err(failure)
                            if matches!(
                                failure.error,
                                AppError::Captcha(CaptchaError::Unresolved { .. })
                            ) && attempt < self.settings.captcha_retries =>
                        {
                            attempt += 1;
                            warn!(
                                "{} 验证码识别失败，重新获取 ({}/{}): {}",
                                request, attempt, self.settings.captcha_retries, failure.error
                            );
                        }
                        Err(failure) => return Err(failure),
                    }
                }
            }
        }
    }

    /// 等待人工完成交互式验证
    async fn await_manual_challenge<S: PortalSession>(
        &self,
        session: &mut S,
        request: &QueryRequest,
        selector: &str,
    ) -> Result<(), PipelineFailure> {
        let limit = self.settings.manual_challenge_timeout;
        info!(
            "{} 👤 检测到人工验证 ({})，请在浏览器中完成，最多等待 {} 秒",
            request,
            selector,
            limit.as_secs()
        );

        let started = Instant::now();
        loop {
            let completed = self
                .step(
                    request,
                    PipelineStage::CaptchaSolved,
                    self.settings.stage_timeout,
                    session.challenge_completed(),
                )
                .await?;
            if completed {
                info!("{} ✅ 人工验证已完成", request);
                return Ok(());
            }
            if started.elapsed() >= limit {
                return Err(PipelineFailure::new(
                    PipelineStage::CaptchaSolved,
                    CaptchaError::ManualTimeout {
                        seconds: limit.as_secs(),
                    },
                ));
            }
            sleep(self.settings.manual_poll_interval).await;
        }
    }

    /// 写入存储（在阻塞线程池中执行）
    async fn persist(
        &self,
        request: &QueryRequest,
        record: &ExtractedRecord,
    ) -> AppResult<UpsertOutcome> {
        let store = Arc::clone(&self.store);
        let source = request.source;
        let key = request.natural_key.clone();
        let record = record.clone();

        tokio::task::spawn_blocking(move || store.upsert(source, &key, &record))
            .await
            .map_err(|e| AppError::Other(format!("持久化任务异常退出: {}", e)))?
    }

    /// 执行一步：加超时，并把错误包装为该阶段的失败
    ///
    /// 超时会丢弃 `fut`，只能用于可以安全中途放弃的调用
    async fn step<T, F>(
        &self,
        request: &QueryRequest,
        stage: PipelineStage,
        limit: Duration,
        fut: F,
    ) -> Result<T, PipelineFailure>
    where
        F: Future<Output = AppResult<T>>,
    {
        match timeout(limit, fut).await {
            Ok(Ok(value)) => {
                debug!("{} → {}", request, stage);
                Ok(value)
            }
            Ok(Err(e)) => Err(PipelineFailure::new(stage, e)),
            Err(_) => Err(PipelineFailure::new(stage, stage_timeout_error(stage, limit))),
        }
    }
}

/// 按阶段生成超时错误，使故障类别与超时的环节一致
fn stage_timeout_error(stage: PipelineStage, limit: Duration) -> AppError {
    let seconds = limit.as_secs();
    match stage {
        PipelineStage::CaptchaSolved => CaptchaError::Timeout { seconds }.into(),
        PipelineStage::Parsed => ExtractionError::Timeout { seconds }.into(),
        _ => AppError::timeout(stage.as_str(), seconds),
    }
}
