use thiserror::Error;

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 门户（SUNARP / SCPPP）访问错误
    #[error("门户错误: {0}")]
    Portal(#[from] PortalError),
    /// 表单会话状态错误
    #[error("会话状态错误: {0}")]
    Session(#[from] SessionError),
    /// 验证码识别错误
    #[error("验证码错误: {0}")]
    Captcha(#[from] CaptchaError),
    /// 视觉模型调用错误
    #[error("视觉模型错误: {0}")]
    Vision(#[from] VisionError),
    /// 结果解析错误
    #[error("解析错误: {0}")]
    Extraction(#[from] ExtractionError),
    /// 持久化错误
    #[error("存储错误: {0}")]
    Store(#[from] StoreError),
    /// 浏览器相关错误
    #[error("浏览器错误: {0}")]
    Browser(#[from] BrowserError),
    /// 配置错误
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),
    /// 查询参数不合法
    #[error("输入无效: {0}")]
    InvalidInput(String),
    /// 其他错误
    #[error("错误: {0}")]
    Other(String),
}

/// 门户访问错误
#[derive(Debug, Error)]
pub enum PortalError {
    /// 门户返回非 200 状态码
    #[error("门户不可用 ({endpoint}): HTTP {status}")]
    Unavailable { endpoint: String, status: u16 },
    /// 网络请求失败
    #[error("请求失败 ({endpoint}): {source}")]
    RequestFailed {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    /// 外部调用超时
    #[error("调用超时 ({operation}): 超过 {seconds} 秒")]
    Timeout { operation: String, seconds: u64 },
    /// 门户拒绝了提交的验证码
    #[error("门户拒绝验证码: {message}")]
    ChallengeRejected { message: String },
    /// HTTP 客户端构建失败
    #[error("HTTP 客户端初始化失败: {0}")]
    ClientBuild(#[source] reqwest::Error),
}

/// 表单会话状态错误
#[derive(Debug, Error)]
pub enum SessionError {
    /// 落地页缺少必需的隐藏字段，说明门户页面结构已变化
    #[error("落地页缺少必需的令牌: {token}")]
    MissingRequiredToken { token: String },
}

/// 验证码识别错误
#[derive(Debug, Error)]
pub enum CaptchaError {
    /// 识别结果规范化后为空
    #[error("验证码无法识别 (原始输出: {raw:?})")]
    Unresolved { raw: String },
    /// 识别器本身调用失败
    #[error("识别器 {recognizer} 调用失败: {message}")]
    RecognizerFailed { recognizer: String, message: String },
    /// 识别器在限定时间内没有返回
    #[error("验证码识别超时: 超过 {seconds} 秒")]
    Timeout { seconds: u64 },
    /// 人工验证等待超时
    #[error("人工验证在 {seconds} 秒内未完成")]
    ManualTimeout { seconds: u64 },
}

/// 视觉模型调用错误
#[derive(Debug, Error)]
pub enum VisionError {
    /// API 调用失败
    #[error("视觉模型 API 调用失败 (模型: {model}): {source}")]
    ApiCallFailed {
        model: String,
        #[source]
        source: async_openai::error::OpenAIError,
    },
    /// 返回内容为空
    #[error("视觉模型返回内容为空 (模型: {model})")]
    EmptyContent { model: String },
}

/// 结果解析错误
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// 解析策略收到了不支持的结果形态
    #[error("解析策略 {strategy} 不支持 {found} 类型的结果")]
    UnexpectedInput {
        strategy: &'static str,
        found: &'static str,
    },
    /// 解析（含视觉模型读取）超时
    #[error("结果解析超时: 超过 {seconds} 秒")]
    Timeout { seconds: u64 },
}

/// 持久化错误
#[derive(Debug, Error)]
pub enum StoreError {
    /// 并发插入时自然键冲突
    #[error("自然键冲突: {key}")]
    Conflict { key: String },
    /// 存储不可达或 SQL 执行失败
    #[error("存储不可用: {0}")]
    Unavailable(#[source] rusqlite::Error),
    /// 表尚未创建
    #[error("表 {table} 尚未初始化")]
    NotInitialized { table: String },
    /// 连接锁已中毒
    #[error("存储连接锁已损坏")]
    Poisoned,
}

/// 浏览器相关错误
#[derive(Debug, Error)]
pub enum BrowserError {
    /// 启动或连接浏览器失败
    #[error("无法启动浏览器: {message}")]
    LaunchFailed { message: String },
    /// CDP 调用失败
    #[error("浏览器操作失败 ({action}): {source}")]
    Cdp {
        action: String,
        #[source]
        source: chromiumoxide::error::CdpError,
    },
    /// 等待元素超时
    #[error("等待元素 {selector} 超时 ({seconds} 秒)")]
    ElementTimeout { selector: String, seconds: u64 },
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 配置文件读取失败
    #[error("读取配置文件失败 ({path}): {source}")]
    ReadFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// TOML 解析失败
    #[error("解析配置文件失败 ({path}): {source}")]
    ParseFailed {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    /// 取值不合法
    #[error("配置项 {key} 取值不合法: {value}")]
    InvalidValue { key: String, value: String },
}

/// 错误分类，对应流水线对外报告的故障类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    PortalUnavailable,
    MissingRequiredToken,
    CaptchaUnresolved,
    RecognizerFailed,
    ChallengeRejected,
    ExtractionFailed,
    PersistenceConflict,
    PersistenceUnavailable,
    Browser,
    Config,
    InvalidInput,
    Other,
}

impl AppError {
    /// 获取错误分类
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Portal(PortalError::ChallengeRejected { .. }) => ErrorKind::ChallengeRejected,
            AppError::Portal(_) => ErrorKind::PortalUnavailable,
            AppError::Session(SessionError::MissingRequiredToken { .. }) => {
                ErrorKind::MissingRequiredToken
            }
            AppError::Captcha(CaptchaError::RecognizerFailed { .. })
            | AppError::Captcha(CaptchaError::Timeout { .. }) => ErrorKind::RecognizerFailed,
            AppError::Captcha(_) => ErrorKind::CaptchaUnresolved,
            AppError::Vision(_) | AppError::Extraction(_) => ErrorKind::ExtractionFailed,
            AppError::Store(StoreError::Conflict { .. }) => ErrorKind::PersistenceConflict,
            AppError::Store(_) => ErrorKind::PersistenceUnavailable,
            AppError::Browser(_) => ErrorKind::Browser,
            AppError::Config(_) => ErrorKind::Config,
            AppError::InvalidInput(_) => ErrorKind::InvalidInput,
            AppError::Other(_) => ErrorKind::Other,
        }
    }

    /// 创建超时错误
    pub fn timeout(operation: impl Into<String>, seconds: u64) -> Self {
        AppError::Portal(PortalError::Timeout {
            operation: operation.into(),
            seconds,
        })
    }

    /// 创建门户状态码错误
    pub fn portal_unavailable(endpoint: impl Into<String>, status: u16) -> Self {
        AppError::Portal(PortalError::Unavailable {
            endpoint: endpoint.into(),
            status,
        })
    }

    /// 创建浏览器操作错误
    pub fn browser(action: impl Into<String>, source: chromiumoxide::error::CdpError) -> Self {
        AppError::Browser(BrowserError::Cdp {
            action: action.into(),
            source,
        })
    }
}

// ========== 从常见错误类型转换 ==========

impl From<chromiumoxide::error::CdpError> for AppError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        AppError::browser("cdp", err)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(_, Some(message)) = &err {
            if let Some(table) = message.strip_prefix("no such table: ") {
                return StoreError::NotInitialized {
                    table: table.to_string(),
                };
            }
        }
        StoreError::Unavailable(err)
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        AppError::Store(err.into())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Other(format!("IO 错误: {}", err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Other(format!("JSON 解析失败: {}", err))
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;
