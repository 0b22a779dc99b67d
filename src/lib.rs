//! # Consulta Placas
//!
//! 秘鲁车辆登记（SUNARP）和驾照罚单（MTC / SCPPP）查询程序
//!
//! ## 架构设计
//!
//! 本系统采用分层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 持有稀缺资源（HTTP 客户端、浏览器页面），只暴露能力
//! - `PortalHttp` - 带 Cookie 的 HTTP 客户端
//! - `BrowserSession` - 唯一的 page owner
//!
//! ### ② 数据模型（Models）
//! - `SessionFormState` - ASP.NET 表单令牌跟踪
//! - `ExtractedRecord` - 按 schema 排列、字段齐全的提取结果
//!
//! ### ③ 业务能力层（Services）
//! - `CaptchaAdapter` - 验证码识别（视觉模型或 tesseract）
//! - `MarkupExtraction` / `VisionLabelExtraction` - 两种结果解析策略
//! - `RecordStore` - SQLite upsert 与软删除
//!
//! ### ④ 流程层（Workflow）
//! - `QueryPipeline` - 一次查询的完整流程（落地页 → 验证码 → 提交 → 解析 → 写入）
//! - `ScpppSession` / `SunarpSession` - 两个门户的会话实现
//!
//! ### ⑤ 编排层（Orchestration）
//! - `App` - 共享资源、单条查询、批量查询、存储读写
//!
//! ## 模块结构

pub mod browser;
pub mod config;
pub mod error;
pub mod infrastructure;

pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use config::Config;
pub use error::{AppError, AppResult, ErrorKind};
pub use models::{ExtractedRecord, SearchMode, Source};
pub use orchestrator::App;
pub use workflow::{PipelineFailure, PipelineOutcome, PipelineStage, QueryPipeline, QueryRequest};
