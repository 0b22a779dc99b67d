//! SUNARP 车辆查询门户会话
//!
//! 浏览器驱动：打开页面 → （必要时）等待人工完成 Turnstile 验证 →
//! 输入车牌并查询 → 截图交给视觉模型

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::browser;
use crate::config::Config;
use crate::error::{AppError, AppResult, PortalError};
use crate::infrastructure::BrowserSession;
use crate::models::RawResult;
use crate::workflow::portal::{Challenge, PortalConnector, PortalSession, QueryRequest};

/// Turnstile 验证控件
const TURNSTILE_SELECTORS: [&str; 3] = [
    "div.cf-turnstile",
    "iframe[src*='cloudflare.com']",
    ".cf-turnstile",
];
/// 验证完成后写入的令牌输入框
const TURNSTILE_RESPONSE: &str = "input[name='cf-turnstile-response']";
const PLATE_INPUT: &str = "#nroPlaca";
const SEARCH_BUTTON: &str = "button.btn-sunarp-green";
const ALERT_POPUP: &str = ".swal2-popup";
const ALERT_TITLE: &str = ".swal2-title";
const ALERT_CONFIRM: &str = ".swal2-confirm";
/// 结果区域标题（大写后比较）
const RESULT_MARKER: &str = "DATOS DEL VEH";

/// 查询表单出现的最长等待时间
const FORM_WAIT: Duration = Duration::from_secs(20);
const RESULT_POLL: Duration = Duration::from_millis(500);

/// Turnstile 令牌是否已写入
pub fn turnstile_token_ready(token: Option<&str>) -> bool {
    token.is_some_and(|t| t.trim().len() > 20)
}

/// 提示框是否表示验证失败
pub fn is_challenge_alert(title: &str) -> bool {
    let lower = title.to_lowercase();
    lower.contains("captcha") || lower.contains("verificación") || lower.contains("verificacion")
}

/// 页面源码中是否提到 Turnstile
pub fn source_mentions_turnstile(source: &str) -> bool {
    let lower = source.to_lowercase();
    lower.contains("turnstile") || lower.contains("challenges.cloudflare.com")
}

/// 提示框检查本身失败时按没有提示处理，并记录原因
fn alert_shown(check: AppResult<bool>) -> bool {
    match check {
        Ok(visible) => visible,
        Err(e) => {
            debug!("检查提示框失败，按无提示处理: {}", e);
            false
        }
    }
}

/// SUNARP 会话
pub struct SunarpSession {
    browser: Option<BrowserSession>,
    url: String,
    result_wait: Duration,
}

impl SunarpSession {
    pub fn new(browser: BrowserSession, config: &Config) -> Self {
        Self {
            browser: Some(browser),
            url: config.sunarp_url.clone(),
            result_wait: Duration::from_secs(config.result_wait_secs),
        }
    }

    fn browser(&self) -> AppResult<&BrowserSession> {
        self.browser
            .as_ref()
            .ok_or_else(|| AppError::Other("浏览器会话已关闭".to_string()))
    }

    /// 检查是否弹出了验证失败提示
    async fn check_alert(&self) -> AppResult<()> {
        let browser = self.browser()?;
        if !alert_shown(browser.is_visible(ALERT_POPUP).await) {
            return Ok(());
        }
        let title = browser.text(ALERT_TITLE).await?.unwrap_or_default();
        debug!("提示框: {}", title);
        if is_challenge_alert(&title) {
            // 关掉提示框，便于诊断截图
            if let Err(e) = browser.click(ALERT_CONFIRM).await {
                warn!("关闭提示框失败: {}", e);
            }
            return Err(PortalError::ChallengeRejected { message: title }.into());
        }
        Ok(())
    }
}

#[async_trait]
impl PortalSession for SunarpSession {
    async fn load_landing(&mut self) -> AppResult<()> {
        let browser = self.browser()?;
        browser.open(&self.url).await?;
        browser
            .eval("Object.defineProperty(navigator, 'webdriver', {get: () => undefined}); true")
            .await?;
        browser.wait_for_element("body", FORM_WAIT).await?;
        info!("📄 页面标题: {}", browser.title().await?);
        Ok(())
    }

    async fn select_mode(&mut self, _request: &QueryRequest) -> AppResult<()> {
        // 车辆查询只有一种方式，等待表单就绪即可
        self.browser()?.wait_for_element(PLATE_INPUT, FORM_WAIT).await
    }

    async fn fetch_challenge(&mut self) -> AppResult<Challenge> {
        let browser = self.browser()?;
        for selector in TURNSTILE_SELECTORS {
            if browser.exists(selector).await {
                info!("🛡️ 检测到验证控件: {}", selector);
                if let Ok(Some(site_key)) = browser.attribute(selector, "data-sitekey").await {
                    debug!("Turnstile sitekey: {}", site_key);
                }
                return Ok(Challenge::Interactive {
                    selector: selector.to_string(),
                });
            }
        }

        if source_mentions_turnstile(&browser.page_source().await?) {
            info!("🛡️ 页面源码中检测到验证控件");
            return Ok(Challenge::Interactive {
                selector: TURNSTILE_SELECTORS[0].to_string(),
            });
        }
        Ok(Challenge::None)
    }

    async fn challenge_completed(&mut self) -> AppResult<bool> {
        let token = self.browser()?.input_value(TURNSTILE_RESPONSE).await?;
        Ok(turnstile_token_ready(token.as_deref()))
    }

    async fn submit(&mut self, request: &QueryRequest, _answer: Option<&str>) -> AppResult<RawResult> {
        let browser = self.browser()?;
        browser.wait_for_element(PLATE_INPUT, FORM_WAIT).await?;
        browser.clear_and_type(PLATE_INPUT, &request.value).await?;
        browser
            .wait_for_element(SEARCH_BUTTON, Duration::from_secs(5))
            .await?;
        browser.click(SEARCH_BUTTON).await?;
        info!("{} ✅ 查询已提交", request);

        let deadline = Instant::now() + self.result_wait;
        loop {
            self.check_alert().await?;

            let source = browser.page_source().await?;
            if source.to_uppercase().contains(RESULT_MARKER) {
                debug!("{} 结果区域已出现", request);
                break;
            }
            if Instant::now() >= deadline {
                warn!("{} {} 秒内未出现结果区域，按当前页面截图", request, self.result_wait.as_secs());
                break;
            }
            sleep(RESULT_POLL).await;
        }

        let screenshot = browser.screenshot_png().await?;
        debug!("{} 截图 {} 字节", request, screenshot.len());
        Ok(RawResult::Screenshot(screenshot))
    }

    async fn capture_diagnostics(&mut self, request: &QueryRequest) {
        let Ok(browser) = self.browser() else {
            return;
        };
        let path = format!(
            "error_sunarp_{}_{}.png",
            request.natural_key,
            chrono::Local::now().format("%Y%m%d_%H%M%S")
        );
        match browser.save_screenshot(&path).await {
            Ok(()) => info!("📸 错误截图已保存: {}", path),
            Err(e) => warn!("保存错误截图失败: {}", e),
        }
    }

    async fn close(&mut self) -> AppResult<()> {
        match self.browser.take() {
            Some(browser) => browser.close().await,
            None => Ok(()),
        }
    }
}

/// SUNARP 会话工厂：每次查询打开一个浏览器会话
pub struct SunarpConnector {
    config: Arc<Config>,
}

impl SunarpConnector {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PortalConnector for SunarpConnector {
    type Session = SunarpSession;

    async fn connect(&self) -> AppResult<SunarpSession> {
        let browser = browser::open_session(&self.config).await?;
        Ok(SunarpSession::new(browser, &self.config))
    }
}
