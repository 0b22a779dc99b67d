//! 门户 HTTP 客户端 - 基础设施层
//!
//! 持有带 Cookie 的 reqwest 客户端，只暴露 GET / 表单 POST 能力

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder};
use tracing::debug;

use crate::config::Config;
use crate::error::{AppError, AppResult, PortalError};

/// 门户响应
#[derive(Debug, Clone)]
pub struct PortalResponse {
    pub url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl PortalResponse {
    /// 正文按 UTF-8 解码（非法字节替换）
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// 非 200 状态码视为门户不可用
    pub fn ensure_ok(self) -> AppResult<Self> {
        if self.status == 200 {
            Ok(self)
        } else {
            Err(AppError::portal_unavailable(self.url, self.status))
        }
    }
}

/// 门户 HTTP 客户端
///
/// 职责：
/// - 持有 Cookie 会话（同一个客户端的请求共享会话）
/// - 统一超时与 TLS 设置
/// - 不认识表单令牌和验证码
pub struct PortalHttp {
    client: Client,
    timeout: Duration,
}

impl PortalHttp {
    /// 创建新的客户端（新的 Cookie 会话）
    pub fn new(config: &Config) -> AppResult<Self> {
        let timeout = Duration::from_secs(config.http_timeout_secs);
        let client = Client::builder()
            .cookie_store(true)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .user_agent(config.user_agent.as_str())
            .timeout(timeout)
            .build()
            .map_err(PortalError::ClientBuild)?;

        Ok(Self { client, timeout })
    }

    /// GET 请求
    pub async fn get(&self, url: &str) -> AppResult<PortalResponse> {
        debug!("GET {}", url);
        self.send(url, self.client.get(url), self.timeout).await
    }

    /// 提交 `application/x-www-form-urlencoded` 表单
    ///
    /// `timeout` 为空时使用客户端默认超时
    pub async fn post_form(
        &self,
        url: &str,
        form: &[(String, String)],
        headers: &[(&'static str, String)],
        timeout: Option<Duration>,
    ) -> AppResult<PortalResponse> {
        let timeout = timeout.unwrap_or(self.timeout);
        debug!("POST {} ({} 个字段)", url, form.len());

        let mut header_map = HeaderMap::new();
        header_map.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded; charset=UTF-8"),
        );
        for (name, value) in headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                header_map.insert(name, value);
            }
        }

        let request = self
            .client
            .post(url)
            .headers(header_map)
            .form(form)
            .timeout(timeout);
        self.send(url, request, timeout).await
    }

    async fn send(&self, url: &str, request: RequestBuilder, timeout: Duration) -> AppResult<PortalResponse> {
        let response = request
            .send()
            .await
            .map_err(|e| request_error(url, e, timeout))?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .bytes()
            .await
            .map_err(|e| request_error(url, e, timeout))?
            .to_vec();

        debug!("{} -> HTTP {} ({} 字节)", url, status, body.len());

        Ok(PortalResponse {
            url: url.to_string(),
            status,
            content_type,
            body,
        })
    }
}

fn request_error(url: &str, err: reqwest::Error, timeout: Duration) -> AppError {
    if err.is_timeout() {
        AppError::timeout(url, timeout.as_secs())
    } else {
        PortalError::RequestFailed {
            endpoint: url.to_string(),
            source: err,
        }
        .into()
    }
}
