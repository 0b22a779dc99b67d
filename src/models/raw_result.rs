/// 门户返回的原始结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawResult {
    /// HTML（或局部回发）响应正文
    Html(String),
    /// 结果页面截图（PNG）
    Screenshot(Vec<u8>),
}

impl RawResult {
    /// 结果形态名称（用于日志和错误信息）
    pub fn kind(&self) -> &'static str {
        match self {
            RawResult::Html(_) => "html",
            RawResult::Screenshot(_) => "screenshot",
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RawResult::Html(body) => body.len(),
            RawResult::Screenshot(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
