//! 表单会话状态
//!
//! 跟踪 ASP.NET 门户在每次往返中下发的隐藏字段（__VIEWSTATE、__EVENTVALIDATION 等），
//! 下一次请求必须原样回传最近一次看到的值。

use std::collections::BTreeMap;

use regex::Regex;
use scraper::{Html, Selector};
use tracing::{debug, warn};

use crate::error::{AppResult, SessionError};

/// 主视图状态令牌
pub const VIEWSTATE: &str = "__VIEWSTATE";
/// 事件校验令牌
pub const EVENT_VALIDATION: &str = "__EVENTVALIDATION";

/// 表单布局：必需令牌 + 门户要求必须出现的可见字段默认值
#[derive(Debug, Clone, Copy)]
pub struct FormLayout {
    pub required_tokens: &'static [&'static str],
    pub visible_defaults: &'static [(&'static str, &'static str)],
}

/// SCPPP 查询表单
///
/// 门户会拒绝缺少任何预期字段的提交，即使字段为空
pub const SCPPP_FORM: FormLayout = FormLayout {
    required_tokens: &[VIEWSTATE],
    visible_defaults: &[
        ("rbtnlBuqueda", "0"),
        ("ddlTipoDocumento", ""),
        ("txtNroDocumento", ""),
        ("txtCaptcha", ""),
        ("hdCodAdministrado", ""),
        ("hdNumTipoDoc", ""),
        ("hdNumDocumento", ""),
        ("txtNroResolucion", ""),
        ("txtFechaResolucion", ""),
        ("txtIniSancion", ""),
        ("txtFinSancion", ""),
        ("txtSancion", ""),
        ("txtTipSancion", ""),
    ],
};

/// 表单会话状态：令牌名 → 令牌值
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionFormState {
    tokens: BTreeMap<String, String>,
}

impl SessionFormState {
    /// 扫描落地页中的隐藏字段并初始化状态
    ///
    /// 主视图状态令牌缺失时返回 `MissingRequiredToken`，说明门户页面结构已经变化
    pub fn initialize(landing_html: &str, layout: &FormLayout) -> AppResult<Self> {
        let document = Html::parse_document(landing_html);
        let mut tokens = BTreeMap::new();

        if let Ok(selector) = Selector::parse(r#"input[type="hidden"]"#) {
            for input in document.select(&selector) {
                let element = input.value();
                if let (Some(name), Some(value)) = (element.attr("name"), element.attr("value")) {
                    tokens.insert(name.to_string(), value.to_string());
                }
            }
        }

        for token in layout.required_tokens {
            if !tokens.contains_key(*token) {
                warn!("落地页缺少必需的令牌 {}，门户页面结构可能已变化", token);
                return Err(SessionError::MissingRequiredToken {
                    token: token.to_string(),
                }
                .into());
            }
        }

        debug!("从落地页提取到 {} 个隐藏字段", tokens.len());

        for (name, value) in layout.visible_defaults {
            tokens.insert(name.to_string(), value.to_string());
        }

        Ok(Self { tokens })
    }

    /// 应用局部回发（partial postback）响应中的令牌增量
    ///
    /// 只覆盖响应中出现的键，其余键保持原值。返回被更新的令牌数量。
    pub fn apply_delta_update(&mut self, delta_body: &str) -> usize {
        match parse_delta_segments(delta_body) {
            Some(segments) => {
                let mut updated = 0;
                for segment in segments.iter().filter(|s| s.kind == "hiddenField") {
                    self.tokens
                        .insert(segment.id.to_string(), segment.content.to_string());
                    updated += 1;
                }
                debug!("增量响应共 {} 段，更新 {} 个令牌", segments.len(), updated);
                updated
            }
            None => {
                warn!("增量响应格式不完整，回退为按令牌名匹配");
                self.apply_delta_by_pattern(delta_body)
            }
        }
    }

    /// 按 `|令牌名|值|` 模式逐个查找已知令牌
    fn apply_delta_by_pattern(&mut self, delta_body: &str) -> usize {
        let mut updated = 0;
        let names: Vec<String> = self
            .tokens
            .keys()
            .filter(|name| name.starts_with("__"))
            .cloned()
            .collect();

        for name in names {
            let pattern = format!(r"\|{}\|([^|]*)\|", regex::escape(&name));
            let Ok(re) = Regex::new(&pattern) else {
                continue;
            };
            if let Some(value) = re.captures(delta_body).and_then(|c| c.get(1)) {
                self.tokens.insert(name, value.as_str().to_string());
                updated += 1;
            }
        }
        updated
    }

    /// 读取令牌值
    pub fn get(&self, name: &str) -> Option<&str> {
        self.tokens.get(name).map(String::as_str)
    }

    /// 读取必需令牌，不存在时报错
    pub fn require(&self, name: &str) -> AppResult<&str> {
        self.get(name).ok_or_else(|| {
            SessionError::MissingRequiredToken {
                token: name.to_string(),
            }
            .into()
        })
    }

    /// 设置字段值
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.tokens.insert(name.into(), value.into());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tokens.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// 转换为表单提交用的键值对
    pub fn to_form_pairs(&self) -> Vec<(String, String)> {
        self.tokens
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// 局部回发响应中的一段：`长度|类型|标识|内容|`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaSegment<'a> {
    pub kind: &'a str,
    pub id: &'a str,
    pub content: &'a str,
}

/// 解析局部回发响应
///
/// 长度字段按 UTF-16 码元计数（与浏览器端 JS 字符串长度一致）。任一段格式不符时返回 `None`。
pub fn parse_delta_segments(body: &str) -> Option<Vec<DeltaSegment<'_>>> {
    let mut segments = Vec::new();
    let mut rest = body;

    while !rest.is_empty() {
        let (length, after_length) = rest.split_once('|')?;
        let length: usize = length.trim().parse().ok()?;
        let (kind, after_kind) = after_length.split_once('|')?;
        let (id, after_id) = after_kind.split_once('|')?;

        let content_end = utf16_offset(after_id, length)?;
        let content = &after_id[..content_end];
        rest = after_id[content_end..].strip_prefix('|')?;

        segments.push(DeltaSegment { kind, id, content });
    }

    if segments.is_empty() {
        None
    } else {
        Some(segments)
    }
}

/// 找到跨过 `units` 个 UTF-16 码元后的字节偏移
fn utf16_offset(text: &str, units: usize) -> Option<usize> {
    let mut consumed = 0;
    for (offset, ch) in text.char_indices() {
        if consumed == units {
            return Some(offset);
        }
        consumed += ch.len_utf16();
        if consumed > units {
            return None;
        }
    }
    (consumed == units).then_some(text.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;

    const LANDING: &str = r#"
        <html><body><form id="form1">
            <input type="hidden" name="__VIEWSTATE" id="__VIEWSTATE" value="vs-inicial" />
            <input type="hidden" name="__VIEWSTATEGENERATOR" value="90059987" />
            <input type="hidden" name="__EVENTVALIDATION" value="ev-inicial" />
            <input type="hidden" name="sinValor" />
            <input type="text" name="txtNroLicencia" value="visible" />
        </form></body></html>
    "#;

    #[test]
    fn test_initialize_seeds_hidden_fields_and_defaults() {
        let state = SessionFormState::initialize(LANDING, &SCPPP_FORM).unwrap();

        assert_eq!(state.get(VIEWSTATE), Some("vs-inicial"));
        assert_eq!(state.get("__VIEWSTATEGENERATOR"), Some("90059987"));
        assert_eq!(state.get(EVENT_VALIDATION), Some("ev-inicial"));
        // 没有 value 的隐藏字段不记录
        assert!(!state.contains("sinValor"));
        // 可见字段不会从页面读取
        assert!(!state.contains("txtNroLicencia"));
        // 门户要求的可见字段默认值
        assert_eq!(state.get("rbtnlBuqueda"), Some("0"));
        assert_eq!(state.get("txtTipSancion"), Some(""));
        assert_eq!(state.get("txtCaptcha"), Some(""));
    }

    #[test]
    fn test_initialize_without_viewstate_fails() {
        let html = r#"<form><input type="hidden" name="__EVENTVALIDATION" value="x" /></form>"#;
        let err = SessionFormState::initialize(html, &SCPPP_FORM).unwrap_err();
        match err {
            AppError::Session(SessionError::MissingRequiredToken { token }) => {
                assert_eq!(token, VIEWSTATE)
            }
            other => panic!("意外的错误: {other}"),
        }
    }

    #[test]
    fn test_delta_update_overwrites_only_present_keys() {
        let mut state = SessionFormState::initialize(LANDING, &SCPPP_FORM).unwrap();
        let panel = r#"<span id="lblMensaje">Seleccione</span><input type="text" id="txtNroLicencia" />"#;
        let delta = format!(
            "{}|updatePanel|UpdatePanel|{}|8|hiddenField|__VIEWSTATE|vs-nuevo|0|hiddenField|__EVENTTARGET||",
            panel.len(),
            panel
        );

        let updated = state.apply_delta_update(&delta);

        assert_eq!(updated, 2);
        assert_eq!(state.get(VIEWSTATE), Some("vs-nuevo"));
        assert_eq!(state.get("__EVENTTARGET"), Some(""));
        // 未出现在增量中的令牌保持原值
        assert_eq!(state.get(EVENT_VALIDATION), Some("ev-inicial"));
    }

    #[test]
    fn test_delta_update_falls_back_to_pattern() {
        let mut state = SessionFormState::initialize(LANDING, &SCPPP_FORM).unwrap();
        let broken = "basura|hiddenField|__VIEWSTATE|vs-b|99|hiddenField|__EVENTVALIDATION|ev-b|";

        let updated = state.apply_delta_update(broken);

        assert_eq!(updated, 2);
        assert_eq!(state.get(VIEWSTATE), Some("vs-b"));
        assert_eq!(state.get(EVENT_VALIDATION), Some("ev-b"));
        assert_eq!(state.get("__VIEWSTATEGENERATOR"), Some("90059987"));
    }

    #[test]
    fn test_parse_delta_counts_utf16_units() {
        // "Año" 为 3 个 UTF-16 码元，4 个字节
        let body = "3|updatePanel|p|Año|2|hiddenField|__VIEWSTATE|ok|";
        let segments = parse_delta_segments(body).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].content, "Año");
        assert_eq!(segments[1].id, "__VIEWSTATE");
        assert_eq!(segments[1].content, "ok");
    }

    #[test]
    fn test_parse_delta_rejects_truncated_body() {
        assert!(parse_delta_segments("10|hiddenField|__VIEWSTATE|corto|").is_none());
        assert!(parse_delta_segments("").is_none());
    }
}
