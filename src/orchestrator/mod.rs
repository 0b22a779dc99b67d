//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责构建共享资源并调度查询，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `batch_processor` - 应用与批量查询
//! - 管理应用生命周期（日志文件、数据库、识别器、流水线）
//! - 按来源选择门户会话工厂和解析策略
//! - 控制批量查询的并发数量（Semaphore）
//! - 输出全局统计信息
//!
//! ### `query_processor` - 单条查询与存储读写
//! - `run_vehicle_query` / `run_driver_query`
//! - `Records`：软删除、列表、详情、统计、服务状态（只需要数据库）
//!
//! ## 层次关系
//!
//! ```text
//! App (批量 / 单条)
//!     ↓
//! workflow::QueryPipeline (处理单次查询)
//!     ↓
//! services (能力层：captcha / extractor / store / vision / ocr)
//!     ↓
//! infrastructure (基础设施：PortalHttp / BrowserSession)
//! ```

pub mod batch_processor;
pub mod query_processor;

pub use batch_processor::{build_captcha_recognizer, App, BatchFailure, BatchSummary};
pub use query_processor::{DeleteOutcome, Records, ServiceStatus, SourceTotal};
