//! 浏览器获取：启动新浏览器，或连接到已有的调试端口

pub mod connection;
pub mod launch;

pub use connection::connect_to_browser;
pub use launch::{launch_browser, LaunchOptions};

use crate::config::Config;
use crate::error::AppResult;
use crate::infrastructure::BrowserSession;

/// 按配置打开一个浏览器会话
///
/// 设置了 `browser_debug_port` 时连接已有浏览器，否则启动新的浏览器
pub async fn open_session(config: &Config) -> AppResult<BrowserSession> {
    match config.browser_debug_port {
        Some(port) => {
            let (browser, page) = connect_to_browser(port).await?;
            Ok(BrowserSession::new(browser, page, false))
        }
        None => {
            let options = LaunchOptions {
                headless: config.browser_headless,
                executable: config.browser_executable.clone(),
            };
            let (browser, page) = launch_browser(&options).await?;
            Ok(BrowserSession::new(browser, page, true))
        }
    }
}
