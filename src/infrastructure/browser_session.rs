//! 浏览器会话 - 基础设施层
//!
//! 持有唯一的 page 资源，只暴露"打开 / 等待 / 输入 / 点击 / 截图"等能力

use std::path::Path;
use std::time::Duration;

use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::{Browser, Page};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::error::{AppError, AppResult, BrowserError};

/// 等待元素时的轮询间隔
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// 浏览器会话
///
/// 职责：
/// - 持有唯一的 Page 资源
/// - 通过 `close()` 释放资源（启动的浏览器整体关闭，连接的浏览器只关闭本页）
/// - 不认识车牌、验证码等业务概念
pub struct BrowserSession {
    /// 由本会话启动的浏览器；连接到已有浏览器时也保留连接句柄
    browser: Browser,
    page: Page,
    launched: bool,
}

impl BrowserSession {
    /// 创建新的浏览器会话
    pub fn new(browser: Browser, page: Page, launched: bool) -> Self {
        Self {
            browser,
            page,
            launched,
        }
    }

    /// 执行 JS 代码并返回 JSON 结果
    pub async fn eval(&self, js_code: impl Into<String>) -> AppResult<JsonValue> {
        let result = self
            .page
            .evaluate(js_code.into())
            .await
            .map_err(|e| AppError::browser("evaluate", e))?;
        Ok(result.into_value()?)
    }

    /// 执行 JS 代码并反序列化为指定类型
    pub async fn eval_as<T: DeserializeOwned>(&self, js_code: impl Into<String>) -> AppResult<T> {
        let json_value = self.eval(js_code).await?;
        Ok(serde_json::from_value(json_value)?)
    }

    /// 导航到指定 URL 并等待加载
    pub async fn open(&self, url: &str) -> AppResult<()> {
        debug!("打开页面: {}", url);
        self.page
            .goto(url)
            .await
            .map_err(|e| AppError::browser(format!("goto {}", url), e))?;
        Ok(())
    }

    pub async fn title(&self) -> AppResult<String> {
        let title = self
            .page
            .get_title()
            .await
            .map_err(|e| AppError::browser("title", e))?;
        Ok(title.unwrap_or_default())
    }

    /// 当前页面 HTML
    pub async fn page_source(&self) -> AppResult<String> {
        self.page
            .content()
            .await
            .map_err(|e| AppError::browser("content", e))
    }

    /// 元素是否存在
    pub async fn exists(&self, selector: &str) -> bool {
        self.page.find_element(selector).await.is_ok()
    }

    /// 元素是否存在且可见
    pub async fn is_visible(&self, selector: &str) -> AppResult<bool> {
        let js = format!(
            r#"(() => {{
                const el = document.querySelector({sel});
                if (!el) return false;
                const style = window.getComputedStyle(el);
                return style.display !== 'none' && style.visibility !== 'hidden' && el.getClientRects().length > 0;
            }})()"#,
            sel = js_string(selector)
        );
        self.eval_as(js).await
    }

    /// 等待元素出现
    pub async fn wait_for_element(&self, selector: &str, timeout: Duration) -> AppResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.exists(selector).await {
                debug!("元素已出现: {}", selector);
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(BrowserError::ElementTimeout {
                    selector: selector.to_string(),
                    seconds: timeout.as_secs(),
                }
                .into());
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// 清空输入框并输入文本
    pub async fn clear_and_type(&self, selector: &str, text: &str) -> AppResult<()> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|e| AppError::browser(format!("find {}", selector), e))?;
        element
            .click()
            .await
            .map_err(|e| AppError::browser(format!("focus {}", selector), e))?;

        self.eval(format!(
            "(() => {{ const el = document.querySelector({}); if (el) el.value = ''; return true; }})()",
            js_string(selector)
        ))
        .await?;

        element
            .type_str(text)
            .await
            .map_err(|e| AppError::browser(format!("type {}", selector), e))?;
        Ok(())
    }

    /// 点击元素
    pub async fn click(&self, selector: &str) -> AppResult<()> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|e| AppError::browser(format!("find {}", selector), e))?;
        element
            .click()
            .await
            .map_err(|e| AppError::browser(format!("click {}", selector), e))?;
        Ok(())
    }

    /// 元素的可见文本
    pub async fn text(&self, selector: &str) -> AppResult<Option<String>> {
        self.eval_as(format!(
            "(() => {{ const el = document.querySelector({}); return el ? el.innerText : null; }})()",
            js_string(selector)
        ))
        .await
    }

    /// 表单控件的当前值
    pub async fn input_value(&self, selector: &str) -> AppResult<Option<String>> {
        self.eval_as(format!(
            "(() => {{ const el = document.querySelector({}); return el ? el.value : null; }})()",
            js_string(selector)
        ))
        .await
    }

    /// 元素属性
    pub async fn attribute(&self, selector: &str, name: &str) -> AppResult<Option<String>> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|e| AppError::browser(format!("find {}", selector), e))?;
        element
            .attribute(name)
            .await
            .map_err(|e| AppError::browser(format!("attribute {}", name), e))
    }

    /// 整页截图（PNG 字节）
    pub async fn screenshot_png(&self) -> AppResult<Vec<u8>> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(true)
            .build();
        self.page
            .screenshot(params)
            .await
            .map_err(|e| AppError::browser("screenshot", e))
    }

    /// 截图并保存到文件
    pub async fn save_screenshot(&self, path: impl AsRef<Path>) -> AppResult<()> {
        let bytes = self.screenshot_png().await?;
        tokio::fs::write(path.as_ref(), bytes).await?;
        Ok(())
    }

    /// 释放会话
    pub async fn close(mut self) -> AppResult<()> {
        if self.launched {
            debug!("关闭浏览器");
            self.browser
                .close()
                .await
                .map_err(|e| AppError::browser("close browser", e))?;
            if let Err(e) = self.browser.wait().await {
                warn!("等待浏览器进程退出失败: {}", e);
            }
        } else {
            debug!("关闭页面（保留外部浏览器）");
            self.page
                .close()
                .await
                .map_err(|e| AppError::browser("close page", e))?;
        }
        Ok(())
    }
}

/// 将字符串编码为 JS 字符串字面量
fn js_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}
