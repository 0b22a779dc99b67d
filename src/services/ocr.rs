//! 本地 OCR 识别器
//!
//! 调用本机的 tesseract 命令行程序识别单行验证码。
//! 图片先写入临时文件，识别结束或调用方放弃等待时删除。

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{AppResult, CaptchaError};
use crate::services::captcha::Recognizer;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// 临时图片，离开作用域时删除
struct TempImage {
    path: PathBuf,
}

impl TempImage {
    async fn write(path: PathBuf, image: &[u8]) -> AppResult<Self> {
        tokio::fs::write(&path, image).await?;
        Ok(Self { path })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempImage {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("删除临时文件失败 {}: {}", self.path.display(), e);
        }
    }
}

/// tesseract 识别器
pub struct TesseractRecognizer {
    program: String,
    temp_dir: PathBuf,
}

impl TesseractRecognizer {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            temp_dir: std::env::temp_dir(),
        }
    }

    /// 指定临时图片目录
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = dir.into();
        self
    }

    fn temp_path(&self) -> PathBuf {
        let seq = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.temp_dir
            .join(format!("captcha_{}_{}.png", std::process::id(), seq))
    }

    fn failure(&self, message: impl Into<String>) -> CaptchaError {
        CaptchaError::RecognizerFailed {
            recognizer: self.name().to_string(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl Recognizer for TesseractRecognizer {
    fn name(&self) -> &str {
        "tesseract"
    }

    async fn recognize(&self, image: &[u8]) -> AppResult<String> {
        let temp = TempImage::write(self.temp_path(), image).await?;

        // --psm 7: 按单行文本识别
        // 调用方超时放弃时 future 被丢弃，子进程随之结束
        let output = Command::new(&self.program)
            .arg(temp.path())
            .arg("stdout")
            .args(["--psm", "7"])
            .kill_on_drop(true)
            .output()
            .await;
        drop(temp);

        let output = output.map_err(|e| self.failure(format!("无法执行 {}: {}", self.program, e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(self.failure(stderr.trim().to_string()).into());
        }

        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!("tesseract 输出: {:?}", text);
        Ok(text)
    }
}
