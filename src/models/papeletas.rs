use std::fmt;

use serde::Serialize;

/// 罚单（papeletas）状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PapeletasStatus {
    /// 结果表中出现了“无记录”标记
    SinPapeletas,
    /// 结果表中存在数据行
    ConPapeletas,
    /// 页面中没有结果表
    Desconocido,
}

impl PapeletasStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PapeletasStatus::SinPapeletas => "SIN_PAPELETAS",
            PapeletasStatus::ConPapeletas => "CON_PAPELETAS",
            PapeletasStatus::Desconocido => "",
        }
    }
}

impl fmt::Display for PapeletasStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 罚单汇总
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PapeletasSummary {
    pub status: PapeletasStatus,
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PapeletasSummary {
    pub fn unknown() -> Self {
        Self {
            status: PapeletasStatus::Desconocido,
            count: 0,
            message: None,
        }
    }
}
