//! 门户会话抽象
//!
//! 两个门户（SCPPP 的 HTTP 局部回发，SUNARP 的浏览器页面）实现同一组步骤，
//! 流水线只按步骤驱动，不关心具体传输方式。

use std::fmt;

use async_trait::async_trait;

use crate::error::{AppError, AppResult};
use crate::models::{RawResult, SearchMode, Source};
use crate::services::CaptchaChallenge;

/// 一次查询请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    pub source: Source,
    /// 规范化后的自然键
    pub natural_key: String,
    /// 提交给门户的查询值
    pub value: String,
    pub mode: Option<SearchMode>,
}

impl QueryRequest {
    /// 车辆查询（车牌去空格并转大写）
    pub fn vehicle(plate: &str) -> Self {
        let key = Source::Vehiculo.normalize_key(plate);
        Self {
            source: Source::Vehiculo,
            natural_key: key.clone(),
            value: key,
            mode: None,
        }
    }

    /// 驾驶员查询
    pub fn driver(value: &str, mode: SearchMode) -> Self {
        let key = Source::Conductor.normalize_key(value);
        Self {
            source: Source::Conductor,
            natural_key: key.clone(),
            value: key,
            mode: Some(mode),
        }
    }

    pub fn search_mode(&self) -> SearchMode {
        self.mode.unwrap_or_default()
    }

    /// 规范化后的自然键不能为空
    pub fn validate(&self) -> AppResult<()> {
        if self.natural_key.is_empty() {
            let field = match self.source {
                Source::Vehiculo => "placa",
                Source::Conductor => "licencia/documento",
            };
            return Err(AppError::InvalidInput(format!("{} 不能为空", field)));
        }
        Ok(())
    }
}

impl fmt::Display for QueryRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.source, self.mode) {
            (Source::Vehiculo, _) => write!(f, "[placa {}]", self.natural_key),
            (Source::Conductor, Some(SearchMode::Documento)) => {
                write!(f, "[documento {}]", self.natural_key)
            }
            (Source::Conductor, _) => write!(f, "[licencia {}]", self.natural_key),
        }
    }
}

/// 门户下发的验证
#[derive(Debug, Clone)]
pub enum Challenge {
    /// 图片验证码，由识别器自动识别
    Image(CaptchaChallenge),
    /// 交互式验证控件，需要人工完成
    Interactive { selector: String },
    /// 无需验证
    None,
}

/// 门户会话：由一次流水线独占，结束时必须关闭
#[async_trait]
pub trait PortalSession: Send {
    /// 加载落地页并初始化会话状态
    async fn load_landing(&mut self) -> AppResult<()>;

    /// 切换查询方式（或等待查询表单就绪）
    async fn select_mode(&mut self, request: &QueryRequest) -> AppResult<()>;

    /// 获取验证
    async fn fetch_challenge(&mut self) -> AppResult<Challenge>;

    /// 交互式验证是否已完成
    async fn challenge_completed(&mut self) -> AppResult<bool> {
        Ok(true)
    }

    /// 提交查询，返回原始结果
    async fn submit(&mut self, request: &QueryRequest, answer: Option<&str>) -> AppResult<RawResult>;

    /// 失败时保存诊断信息（尽力而为）
    async fn capture_diagnostics(&mut self, _request: &QueryRequest) {}

    /// 释放会话资源
    async fn close(&mut self) -> AppResult<()>;
}

/// 会话工厂
#[async_trait]
pub trait PortalConnector: Send + Sync {
    type Session: PortalSession;

    async fn connect(&self) -> AppResult<Self::Session>;
}
