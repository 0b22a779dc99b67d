use std::path::Path;

use serde::Deserialize;

use crate::error::{AppResult, ConfigError};

/// 程序配置文件
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite 数据库文件路径
    pub database_path: String,
    /// SCPPP（MTC 驾照系统）入口地址
    pub scppp_base_url: String,
    /// SUNARP 车辆查询页面地址
    pub sunarp_url: String,
    /// 普通 HTTP 请求超时（秒）
    pub http_timeout_secs: u64,
    /// 最终查询请求超时（秒）
    pub submit_timeout_secs: u64,
    /// 流水线每个外部调用的总超时（秒）
    pub stage_timeout_secs: u64,
    /// 是否跳过 TLS 证书校验
    pub accept_invalid_certs: bool,
    /// 请求使用的 User-Agent
    pub user_agent: String,
    /// 验证码识别失败后重新获取的次数
    pub captcha_retries: usize,
    /// 验证码识别器: "vision" 或 "tesseract"
    pub captcha_recognizer: String,
    /// tesseract 可执行文件路径
    pub tesseract_path: String,
    /// 人工验证最长等待时间（秒）
    pub manual_challenge_timeout_secs: u64,
    /// 人工验证轮询间隔（毫秒）
    pub manual_challenge_poll_ms: u64,
    /// 提交后等待结果区域出现的秒数
    pub result_wait_secs: u64,
    /// 是否以无头模式启动浏览器
    pub browser_headless: bool,
    /// 浏览器可执行文件路径（为空时自动探测）
    pub browser_executable: Option<String>,
    /// 浏览器调试端口（设置后连接已有浏览器，而不是启动新浏览器）
    pub browser_debug_port: Option<u16>,
    // --- 视觉模型配置 ---
    pub vision_api_key: String,
    pub vision_api_base_url: String,
    pub vision_model_name: String,
    /// 批量模式下同时进行的查询数量
    pub max_concurrent_queries: usize,
    /// 是否显示详细日志
    pub verbose_logging: bool,
    /// 运行日志文件
    pub output_log_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "consultas.db".to_string(),
            scppp_base_url: "https://scppp.mtc.gob.pe/".to_string(),
            sunarp_url: "https://consultavehicular.sunarp.gob.pe/consulta-vehicular/".to_string(),
            http_timeout_secs: 15,
            submit_timeout_secs: 30,
            stage_timeout_secs: 60,
            accept_invalid_certs: true,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36".to_string(),
            captcha_retries: 1,
            captcha_recognizer: "vision".to_string(),
            tesseract_path: "tesseract".to_string(),
            manual_challenge_timeout_secs: 90,
            manual_challenge_poll_ms: 1000,
            result_wait_secs: 5,
            browser_headless: false,
            browser_executable: None,
            browser_debug_port: None,
            vision_api_key: String::new(),
            vision_api_base_url: "https://generativelanguage.googleapis.com/v1beta/openai".to_string(),
            vision_model_name: "gemini-2.5-flash".to_string(),
            max_concurrent_queries: 2,
            verbose_logging: false,
            output_log_file: "consultas.log".to_string(),
        }
    }
}

impl Config {
    /// 从环境变量加载配置
    ///
    /// 如果设置了 `CONFIG_FILE`，先读取该 TOML 文件作为基础值，环境变量再覆盖其上
    pub fn from_env() -> AppResult<Self> {
        let base = match std::env::var("CONFIG_FILE") {
            Ok(path) => Self::from_toml_file(&path)?,
            Err(_) => Self::default(),
        };
        Ok(base.with_env_overrides())
    }

    /// 从 TOML 文件加载配置，缺失的键使用默认值
    pub fn from_toml_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content).map_err(|source| {
            ConfigError::ParseFailed {
                path: path.display().to_string(),
                source,
            }
            .into()
        })
    }

    /// 从 TOML 字符串解析配置
    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    fn with_env_overrides(self) -> Self {
        let default = self;
        Self {
            database_path: std::env::var("DATABASE_PATH").unwrap_or(default.database_path),
            scppp_base_url: std::env::var("SCPPP_BASE_URL").unwrap_or(default.scppp_base_url),
            sunarp_url: std::env::var("SUNARP_URL").unwrap_or(default.sunarp_url),
            http_timeout_secs: env_parse("HTTP_TIMEOUT_SECS").unwrap_or(default.http_timeout_secs),
            submit_timeout_secs: env_parse("SUBMIT_TIMEOUT_SECS").unwrap_or(default.submit_timeout_secs),
            stage_timeout_secs: env_parse("STAGE_TIMEOUT_SECS").unwrap_or(default.stage_timeout_secs),
            accept_invalid_certs: env_parse("ACCEPT_INVALID_CERTS").unwrap_or(default.accept_invalid_certs),
            user_agent: std::env::var("USER_AGENT").unwrap_or(default.user_agent),
            captcha_retries: env_parse("CAPTCHA_RETRIES").unwrap_or(default.captcha_retries),
            captcha_recognizer: std::env::var("CAPTCHA_RECOGNIZER").unwrap_or(default.captcha_recognizer),
            tesseract_path: std::env::var("TESSERACT_PATH").unwrap_or(default.tesseract_path),
            manual_challenge_timeout_secs: env_parse("MANUAL_CHALLENGE_TIMEOUT_SECS")
                .unwrap_or(default.manual_challenge_timeout_secs),
            manual_challenge_poll_ms: env_parse("MANUAL_CHALLENGE_POLL_MS")
                .unwrap_or(default.manual_challenge_poll_ms),
            result_wait_secs: env_parse("RESULT_WAIT_SECS").unwrap_or(default.result_wait_secs),
            browser_headless: env_parse("BROWSER_HEADLESS").unwrap_or(default.browser_headless),
            browser_executable: std::env::var("BROWSER_EXECUTABLE").ok().or(default.browser_executable),
            browser_debug_port: env_parse("BROWSER_DEBUG_PORT").or(default.browser_debug_port),
            vision_api_key: std::env::var("VISION_API_KEY").unwrap_or(default.vision_api_key),
            vision_api_base_url: std::env::var("VISION_API_BASE_URL").unwrap_or(default.vision_api_base_url),
            vision_model_name: std::env::var("VISION_MODEL_NAME").unwrap_or(default.vision_model_name),
            max_concurrent_queries: env_parse("MAX_CONCURRENT_QUERIES")
                .unwrap_or(default.max_concurrent_queries),
            verbose_logging: env_parse("VERBOSE_LOGGING").unwrap_or(default.verbose_logging),
            output_log_file: std::env::var("OUTPUT_LOG_FILE").unwrap_or(default.output_log_file),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
