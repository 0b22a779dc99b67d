//! 流水线阶段与结果

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::error::{AppError, ErrorKind};
use crate::models::{ExtractedRecord, PapeletasSummary, Source, UpsertOutcome};

/// 流水线状态
///
/// `Init → LandingLoaded → ModeSelected → CaptchaFetched → CaptchaSolved → Submitted → Parsed → Persisted`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStage {
    Init,
    LandingLoaded,
    ModeSelected,
    CaptchaFetched,
    CaptchaSolved,
    Submitted,
    Parsed,
    Persisted,
}

impl PipelineStage {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStage::Init => "INIT",
            PipelineStage::LandingLoaded => "LANDING_LOADED",
            PipelineStage::ModeSelected => "MODE_SELECTED",
            PipelineStage::CaptchaFetched => "CAPTCHA_FETCHED",
            PipelineStage::CaptchaSolved => "CAPTCHA_SOLVED",
            PipelineStage::Submitted => "SUBMITTED",
            PipelineStage::Parsed => "PARSED",
            PipelineStage::Persisted => "PERSISTED",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 流水线失败：失败时正在进入的阶段 + 原因
#[derive(Debug, Error)]
#[error("阶段 {stage} 失败: {error}")]
pub struct PipelineFailure {
    pub stage: PipelineStage,
    #[source]
    pub error: AppError,
    /// 会话关闭失败的原因（浏览器可能仍在运行）
    pub close_error: Option<String>,
}

impl PipelineFailure {
    pub fn new(stage: PipelineStage, error: impl Into<AppError>) -> Self {
        Self {
            stage,
            error: error.into(),
            close_error: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }

    /// 可序列化的失败报告
    pub fn report(&self) -> FailureReport {
        FailureReport {
            stage: self.stage,
            kind: self.kind(),
            message: self.error.to_string(),
            close_error: self.close_error.clone(),
        }
    }
}

/// 对外输出的失败报告
#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub stage: PipelineStage,
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_error: Option<String>,
}

/// 查询成功的结果
#[derive(Debug, Clone, Serialize)]
pub struct QuerySuccess {
    pub source: Source,
    pub natural_key: String,
    pub record: ExtractedRecord,
    /// 识别器原始输出
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub papeletas: Option<PapeletasSummary>,
    /// 有实际内容的字段数
    pub field_count: usize,
    /// 所有字段均为空（门户查无此记录）
    pub incomplete: bool,
    pub persistence: UpsertOutcome,
    /// 会话关闭失败的原因（浏览器可能仍在运行）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_error: Option<String>,
}

/// 单次查询的结果
pub type PipelineOutcome = Result<QuerySuccess, PipelineFailure>;

/// 会话是否没能正常关闭
pub fn session_left_open(outcome: &PipelineOutcome) -> bool {
    match outcome {
        Ok(success) => success.close_error.is_some(),
        Err(failure) => failure.close_error.is_some(),
    }
}
