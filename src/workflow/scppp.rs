//! SCPPP（MTC 驾照系统）门户会话
//!
//! ASP.NET WebForms 页面，通过局部回发（partial postback）完成：
//! 落地页 → 切换查询方式 → Captcha.aspx → 提交查询

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{AppResult, PortalError, SessionError};
use crate::infrastructure::PortalHttp;
use crate::models::{RawResult, SearchMode, SessionFormState, EVENT_VALIDATION, SCPPP_FORM, VIEWSTATE};
use crate::services::CaptchaChallenge;
use crate::workflow::portal::{Challenge, PortalConnector, PortalSession, QueryRequest};

/// 查询方式单选框的回发目标
const MODE_EVENT_TARGET: &str = "rbtnlBuqueda$1";
/// 查询按钮的回发目标
const SEARCH_EVENT_TARGET: &str = "ibtnBusqNroDoc";
/// 页面未下发时使用的视图状态生成器
const DEFAULT_VIEWSTATE_GENERATOR: &str = "90059987";
/// 查询时原样回传的隐藏字段
const ECHOED_FIELDS: [&str; 9] = [
    "hdCodAdministrado",
    "hdNumTipoDoc",
    "hdNumDocumento",
    "txtNroResolucion",
    "txtFechaResolucion",
    "txtIniSancion",
    "txtFinSancion",
    "txtSancion",
    "txtTipSancion",
];

/// 构建查询表单
///
/// 门户拒绝缺少任何预期字段的提交，即使字段为空
pub fn build_search_form(
    state: &SessionFormState,
    mode: SearchMode,
    value: &str,
    captcha: &str,
) -> AppResult<Vec<(String, String)>> {
    let mut form: Vec<(String, String)> = Vec::with_capacity(24);
    let mut push = |name: &str, value: &str| form.push((name.to_string(), value.to_string()));

    push(VIEWSTATE, state.require(VIEWSTATE)?);
    push(
        "__VIEWSTATEGENERATOR",
        state.get("__VIEWSTATEGENERATOR").unwrap_or(DEFAULT_VIEWSTATE_GENERATOR),
    );
    push("__VIEWSTATEENCRYPTED", state.get("__VIEWSTATEENCRYPTED").unwrap_or(""));
    push(EVENT_VALIDATION, state.require(EVENT_VALIDATION)?);
    push("rbtnlBuqueda", mode.code());
    push(mode.input_field(), value);
    push("txtCaptcha", captcha);
    for name in ECHOED_FIELDS {
        push(name, state.get(name).unwrap_or(""));
    }
    push("__EVENTTARGET", SEARCH_EVENT_TARGET);
    push("__EVENTARGUMENT", "");
    push("__LASTFOCUS", "");
    push("__ASYNCPOST", "true");
    push("ScriptManager", &format!("UpdatePanel|{}", SEARCH_EVENT_TARGET));

    Ok(form)
}

/// 在查询响应中查找"验证码错误"提示
pub fn detect_rejection(body: &str) -> Option<String> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)(c[oó]digo\s+)?captcha[^|<>]{0,60}?(incorrect[oa]|inv[aá]lid[oa]|no\s+coincide|errad[oa])|(incorrect[oa]|inv[aá]lid[oa]|errad[oa])[^|<>]{0,40}?captcha",
        )
        .ok()
    });
    pattern
        .as_ref()?
        .find(body)
        .map(|m| m.as_str().trim().to_string())
}

/// SCPPP 会话
pub struct ScpppSession {
    http: PortalHttp,
    base_url: String,
    state: Option<SessionFormState>,
    submit_timeout: Duration,
}

impl ScpppSession {
    pub fn new(config: &Config) -> AppResult<Self> {
        Ok(Self {
            http: PortalHttp::new(config)?,
            base_url: config.scppp_base_url.clone(),
            state: None,
            submit_timeout: Duration::from_secs(config.submit_timeout_secs),
        })
    }

    fn state_mut(&mut self) -> AppResult<&mut SessionFormState> {
        self.state.as_mut().ok_or_else(|| {
            SessionError::MissingRequiredToken {
                token: VIEWSTATE.to_string(),
            }
            .into()
        })
    }

    fn ajax_headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("X-Requested-With", "XMLHttpRequest".to_string()),
            ("X-MicrosoftAjax", "Delta=true".to_string()),
            ("Referer", self.base_url.clone()),
            ("Origin", self.base_url.trim_end_matches('/').to_string()),
        ]
    }

    fn captcha_url(&self) -> String {
        format!("{}/Captcha.aspx", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl PortalSession for ScpppSession {
    async fn load_landing(&mut self) -> AppResult<()> {
        let response = self.http.get(&self.base_url).await?.ensure_ok()?;
        let state = SessionFormState::initialize(&response.text(), &SCPPP_FORM)?;
        info!(
            "✅ 落地页已加载，VIEWSTATE {} 字符",
            state.get(VIEWSTATE).map(str::len).unwrap_or(0)
        );
        self.state = Some(state);
        Ok(())
    }

    async fn select_mode(&mut self, request: &QueryRequest) -> AppResult<()> {
        let mode = request.search_mode();
        let state = self.state_mut()?;
        state.set("rbtnlBuqueda", mode.code());
        state.set("ddlTipoDocumento", mode.document_type());
        state.set("__EVENTTARGET", MODE_EVENT_TARGET);
        state.set("__EVENTARGUMENT", "");
        state.set("__LASTFOCUS", "");
        state.set("__ASYNCPOST", "true");
        state.set("ScriptManager", format!("UpdatePanel|{}", MODE_EVENT_TARGET));
        let form = state.to_form_pairs();

        let headers = self.ajax_headers();
        let response = self
            .http
            .post_form(&self.base_url, &form, &headers, None)
            .await?
            .ensure_ok()?;

        let updated = self.state_mut()?.apply_delta_update(&response.text());
        if updated == 0 {
            warn!("切换查询方式的响应中没有新的令牌，沿用原值");
        }
        debug!("查询方式已切换为 {:?}，更新 {} 个令牌", mode, updated);
        Ok(())
    }

    async fn fetch_challenge(&mut self) -> AppResult<Challenge> {
        let url = self.captcha_url();
        let response = self.http.get(&url).await?.ensure_ok()?;
        debug!("验证码图片 {} 字节", response.body.len());

        Ok(Challenge::Image(CaptchaChallenge {
            image: response.body,
            content_type: response.content_type,
            issued_by: url,
        }))
    }

    async fn submit(&mut self, request: &QueryRequest, answer: Option<&str>) -> AppResult<RawResult> {
        let state = self.state_mut()?;
        let form = build_search_form(state, request.search_mode(), &request.value, answer.unwrap_or(""))?;

        let headers = self.ajax_headers();
        let response = self
            .http
            .post_form(&self.base_url, &form, &headers, Some(self.submit_timeout))
            .await?
            .ensure_ok()?;
        let body = response.text();
        debug!("查询响应 {} 字节", body.len());

        if let Some(message) = detect_rejection(&body) {
            return Err(PortalError::ChallengeRejected { message }.into());
        }

        self.state_mut()?.apply_delta_update(&body);
        Ok(RawResult::Html(body))
    }

    async fn close(&mut self) -> AppResult<()> {
        // HTTP 会话只需丢弃令牌和 Cookie
        self.state = None;
        Ok(())
    }
}

/// SCPPP 会话工厂：每次查询一个新的 Cookie 会话
pub struct ScpppConnector {
    config: Arc<Config>,
}

impl ScpppConnector {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PortalConnector for ScpppConnector {
    type Session = ScpppSession;

    async fn connect(&self) -> AppResult<ScpppSession> {
        ScpppSession::new(&self.config)
    }
}
