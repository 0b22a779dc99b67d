//! 基础设施层（Infrastructure Layer）
//!
//! 持有稀缺资源（HTTP 会话、浏览器页面），只暴露能力，不认识业务概念。

pub mod browser_session;
pub mod portal_http;

pub use browser_session::BrowserSession;
pub use portal_http::{PortalHttp, PortalResponse};
