//! 验证码识别适配器 - 业务能力层
//!
//! 只负责"把验证码图片变成文本"，不关心重试和流程。
//! 识别器是可替换的能力（OCR / 视觉模型），通过 `Recognizer` 注入。

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{AppError, AppResult, CaptchaError};

/// 图片文字识别能力：给定图片字节，返回尽力识别的文本
#[async_trait]
pub trait Recognizer: Send + Sync {
    /// 识别器名称（仅用于日志）
    fn name(&self) -> &str;

    async fn recognize(&self, image: &[u8]) -> AppResult<String>;
}

/// 一次验证码挑战：图片字节及其所属会话
#[derive(Debug, Clone)]
pub struct CaptchaChallenge {
    pub image: Vec<u8>,
    pub content_type: Option<String>,
    /// 下发该验证码的地址
    pub issued_by: String,
}

/// 规范化识别结果：去空白、转大写、只保留字母数字
///
/// 门户验证码字母表只包含大写字母和数字
pub fn normalize_captcha(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// 验证码识别适配器
pub struct CaptchaAdapter {
    recognizer: Arc<dyn Recognizer>,
}

impl CaptchaAdapter {
    pub fn new(recognizer: Arc<dyn Recognizer>) -> Self {
        Self { recognizer }
    }

    pub fn recognizer_name(&self) -> &str {
        self.recognizer.name()
    }

    /// 单次识别，不在内部重试
    pub async fn resolve(&self, challenge: &CaptchaChallenge) -> AppResult<String> {
        debug!(
            "识别验证码: {} 字节, 识别器: {}",
            challenge.image.len(),
            self.recognizer.name()
        );

        let raw = self
            .recognizer
            .recognize(&challenge.image)
            .await
            .map_err(|e| match e {
                AppError::Captcha(inner) => AppError::Captcha(inner),
                other => CaptchaError::RecognizerFailed {
                    recognizer: self.recognizer.name().to_string(),
                    message: other.to_string(),
                }
                .into(),
            })?;

        let text = normalize_captcha(&raw);
        if text.is_empty() {
            warn!("验证码识别结果为空 (原始输出: {:?})", raw);
            return Err(CaptchaError::Unresolved { raw }.into());
        }

        debug!("验证码识别结果: {}", text);
        Ok(text)
    }
}
