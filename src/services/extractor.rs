//! 结果解析 - 业务能力层
//!
//! 两种解析策略：
//! - 结构化标记：按元素 id 从 HTML 中取文本（SCPPP）
//! - 带标签的自由文本：整理视觉模型输出的 `标签: 值` 行（SUNARP 截图）
//!
//! 无论哪种策略，输出记录都包含 schema 中的全部字段。

use std::sync::Arc;

use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{AppResult, ExtractionError};
use crate::models::{
    normalize_field_key, ExtractedRecord, PapeletasStatus, PapeletasSummary, RawResult,
    RecordSchema, DRIVER_SCHEMA, NOT_FOUND, VEHICLE_SCHEMA,
};
use crate::services::captcha::Recognizer;
use crate::utils::logging::truncate_text;

/// SCPPP 罚单结果表 id
pub const PAPELETAS_TABLE_ID: &str = "gvPapeletas";

/// 解析输出
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionOutput {
    pub record: ExtractedRecord,
    /// 识别器的原始输出（仅自由文本策略）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub papeletas: Option<PapeletasSummary>,
}

/// 结果解析策略
#[async_trait]
pub trait Extraction: Send + Sync {
    /// 策略名称
    fn name(&self) -> &'static str;

    /// 输出记录的字段集合
    fn schema(&self) -> &'static RecordSchema;

    async fn extract(&self, raw: &RawResult) -> AppResult<ExtractionOutput>;
}

// ========== 结构化标记策略 ==========

fn id_selector(id: &str) -> Option<Selector> {
    Selector::parse(&format!(r#"[id="{}"]"#, id)).ok()
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

/// 按 id 读取元素的文本，元素不存在时返回占位值
pub fn extract_element_text(document: &Html, id: &str) -> String {
    id_selector(id)
        .and_then(|selector| document.select(&selector).next())
        .map(element_text)
        .unwrap_or_else(|| NOT_FOUND.to_string())
}

/// 汇总罚单结果表
///
/// 表中出现 id 含 `vacio` 的标记元素 → 无罚单；否则数据行数 = 行数 - 表头
pub fn summarize_papeletas(document: &Html, table_id: &str) -> PapeletasSummary {
    let Some(table) = id_selector(table_id).and_then(|s| document.select(&s).next()) else {
        debug!("结果中没有罚单表 {}", table_id);
        return PapeletasSummary::unknown();
    };

    if let Ok(marker) = Selector::parse(r#"[id*="vacio"]"#) {
        if let Some(empty) = table.select(&marker).next() {
            let message = element_text(empty);
            return PapeletasSummary {
                status: PapeletasStatus::SinPapeletas,
                count: 0,
                message: (!message.is_empty()).then_some(message),
            };
        }
    }

    let rows = Selector::parse("tr")
        .map(|tr| table.select(&tr).count())
        .unwrap_or(0);

    PapeletasSummary {
        status: PapeletasStatus::ConPapeletas,
        count: rows.saturating_sub(1),
        message: None,
    }
}

/// 结构化标记解析策略
pub struct MarkupExtraction {
    schema: &'static RecordSchema,
    papeletas_table: Option<&'static str>,
}

impl MarkupExtraction {
    pub fn new(schema: &'static RecordSchema, papeletas_table: Option<&'static str>) -> Self {
        Self {
            schema,
            papeletas_table,
        }
    }

    /// SCPPP 驾驶员结果
    pub fn driver() -> Self {
        Self::new(&DRIVER_SCHEMA, Some(PAPELETAS_TABLE_ID))
    }

    /// 从 HTML 中提取记录（同步部分，便于单独测试）
    pub fn extract_html(&self, html: &str) -> ExtractionOutput {
        let document = Html::parse_document(html);
        let mut record = ExtractedRecord::empty(self.schema);

        for field in self.schema.fields {
            if let Some(id) = field.element_id {
                record.set(field.key, extract_element_text(&document, id));
            }
        }

        let papeletas = self.papeletas_table.map(|table| {
            let summary = summarize_papeletas(&document, table);
            if summary.status != PapeletasStatus::Desconocido {
                record.set("PAPELETAS_ESTADO", summary.status.as_str());
                record.set("PAPELETAS_CANTIDAD", summary.count.to_string());
            }
            summary
        });

        ExtractionOutput {
            record,
            raw_text: None,
            papeletas,
        }
    }
}

#[async_trait]
impl Extraction for MarkupExtraction {
    fn name(&self) -> &'static str {
        "markup"
    }

    fn schema(&self) -> &'static RecordSchema {
        self.schema
    }

    async fn extract(&self, raw: &RawResult) -> AppResult<ExtractionOutput> {
        match raw {
            RawResult::Html(body) => Ok(self.extract_html(body)),
            other => Err(ExtractionError::UnexpectedInput {
                strategy: self.name(),
                found: other.kind(),
            }
            .into()),
        }
    }
}

// ========== 带标签的自由文本策略 ==========

/// 大小写不敏感地匹配行首标签，返回标签结束处的字节偏移
///
/// `°` 视同 `º`；标签中的空格可匹配一个或多个空白
fn match_label_prefix(line: &str, label: &str) -> Option<usize> {
    let mut chars = line.char_indices().peekable();
    let mut label_chars = label.chars().peekable();

    while let Some(expected) = label_chars.next() {
        if expected.is_whitespace() {
            let mut matched = false;
            while let Some((_, c)) = chars.peek() {
                if !c.is_whitespace() {
                    break;
                }
                chars.next();
                matched = true;
            }
            if !matched {
                return None;
            }
            continue;
        }

        let (_, actual) = chars.next()?;
        if !same_letter(actual, expected) {
            return None;
        }
    }

    let end = chars.peek().map(|(idx, _)| *idx).unwrap_or(line.len());
    // 标签后必须是单词边界
    if line[end..].chars().next().is_some_and(|c| c.is_alphanumeric()) {
        return None;
    }
    Some(end)
}

fn same_letter(a: char, b: char) -> bool {
    let fold = |c: char| if c == '°' { 'º' } else { c };
    fold(a).to_uppercase().eq(fold(b).to_uppercase())
}

/// 去掉列表符号、加粗标记等修饰
fn strip_decorations(line: &str) -> &str {
    line.trim()
        .trim_start_matches(|c: char| matches!(c, '-' | '•' | '*' | '·') || c.is_whitespace())
        .trim()
}

/// 从一行中解析出 (字段序号, 值)
fn match_line(schema: &RecordSchema, line: &str) -> Option<(usize, String)> {
    let line = strip_decorations(line);
    if line.is_empty() {
        return None;
    }

    // 长标签优先，避免短标签抢先匹配
    let mut order: Vec<usize> = (0..schema.fields.len()).collect();
    order.sort_by_key(|&idx| std::cmp::Reverse(schema.fields[idx].label.len()));

    order.into_iter().find_map(|idx| {
        let end = match_label_prefix(line, schema.fields[idx].label)?;
        let rest = line[end..].trim_start_matches('*').trim();
        let value = match rest.strip_prefix(':') {
            Some(value) => value,
            // 缺少冒号时，去掉标签后剩余部分即为值
            None => rest,
        };
        Some((idx, value.trim_matches('*').trim().to_string()))
    })
}

/// 整理带标签的自由文本
///
/// 输出恰好包含 schema 的全部标签，按规范顺序排列，每行 `标签: 值`。
/// 同一标签出现多次时取第一行；未出现的标签值为空。
pub fn clean_labeled_text(schema: &RecordSchema, text: &str) -> String {
    let mut values: Vec<Option<String>> = vec![None; schema.fields.len()];

    for line in text.lines() {
        if let Some((idx, value)) = match_line(schema, line) {
            if values[idx].is_none() {
                values[idx] = Some(value);
            }
        }
    }

    schema
        .fields
        .iter()
        .zip(values)
        .map(|(field, value)| format!("{}: {}", field.label, value.unwrap_or_default()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// 冒号后有值的行数
pub fn count_filled_lines(text: &str) -> usize {
    text.lines()
        .filter_map(|line| line.split_once(':'))
        .filter(|(_, value)| !value.trim().is_empty())
        .count()
}

/// 将 `标签: 值` 行转换为记录
pub fn parse_labeled_lines(schema: &'static RecordSchema, text: &str) -> ExtractedRecord {
    let pairs = text.lines().filter_map(|line| {
        let (label, value) = line.split_once(':')?;
        Some((normalize_field_key(label), value.trim().to_string()))
    });
    ExtractedRecord::from_pairs(schema, pairs)
}

/// 视觉模型读取截图 + 标签文本整理
pub struct VisionLabelExtraction {
    reader: Arc<dyn Recognizer>,
    schema: &'static RecordSchema,
}

impl VisionLabelExtraction {
    pub fn new(reader: Arc<dyn Recognizer>, schema: &'static RecordSchema) -> Self {
        Self { reader, schema }
    }

    /// SUNARP 车辆截图
    pub fn vehicle(reader: Arc<dyn Recognizer>) -> Self {
        Self::new(reader, &VEHICLE_SCHEMA)
    }
}

#[async_trait]
impl Extraction for VisionLabelExtraction {
    fn name(&self) -> &'static str {
        "vision-labels"
    }

    fn schema(&self) -> &'static RecordSchema {
        self.schema
    }

    async fn extract(&self, raw: &RawResult) -> AppResult<ExtractionOutput> {
        let RawResult::Screenshot(image) = raw else {
            return Err(ExtractionError::UnexpectedInput {
                strategy: self.name(),
                found: raw.kind(),
            }
            .into());
        };

        let text = self.reader.recognize(image).await?;
        let cleaned = clean_labeled_text(self.schema, &text);
        let filled = count_filled_lines(&cleaned);
        if filled == 0 {
            warn!(
                "{} 未从截图中读到任何字段，原始输出: {}",
                self.reader.name(),
                truncate_text(&text, 120)
            );
        } else {
            debug!("从截图中读到 {}/{} 个字段", filled, self.schema.fields.len());
        }

        Ok(ExtractionOutput {
            record: parse_labeled_lines(self.schema, &cleaned),
            raw_text: Some(text),
            papeletas: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;

    const DRIVER_HTML: &str = r#"
        <div id="UpdatePanel">
            <span id="lblAdministrado"> PEREZ QUISPE, JUAN </span>
            <span id="lblDni">45678912</span>
            <span id="lblLicencia">Q45678912</span>
            <span id="lblClaseCategoria">A-IIa</span>
            <span id="lblVigencia">12/05/2027</span>
            <table id="gvPapeletas">
                <tr><th>Papeleta</th><th>Fecha</th></tr>
                <tr><td>P-001</td><td>01/01/2024</td></tr>
                <tr><td>P-002</td><td>02/02/2024</td></tr>
            </table>
        </div>
    "#;

    #[test]
    fn test_missing_element_gets_sentinel() {
        let output = MarkupExtraction::driver().extract_html(DRIVER_HTML);
        let record = &output.record;

        assert_eq!(record.get("NOMBRE_COMPLETO"), "PEREZ QUISPE, JUAN");
        assert_eq!(record.get("LICENCIA"), "Q45678912");
        // lblEstadoLicencia 不在片段中
        assert_eq!(record.get("ESTADO_LICENCIA"), NOT_FOUND);
        assert_eq!(record.iter().count(), DRIVER_SCHEMA.fields.len());
    }

    #[test]
    fn test_papeletas_rows_exclude_header() {
        let output = MarkupExtraction::driver().extract_html(DRIVER_HTML);
        let summary = output.papeletas.unwrap();

        assert_eq!(summary.status, PapeletasStatus::ConPapeletas);
        assert_eq!(summary.count, 2);
        assert_eq!(output.record.get("PAPELETAS_ESTADO"), "CON_PAPELETAS");
        assert_eq!(output.record.get("PAPELETAS_CANTIDAD"), "2");
    }

    #[test]
    fn test_papeletas_empty_marker() {
        let html = r#"<table id="gvPapeletas"><tr><td>
            <span id="gvPapeletas_lblvacio">No registra papeletas</span>
        </td></tr></table>"#;
        let summary = summarize_papeletas(&Html::parse_document(html), PAPELETAS_TABLE_ID);

        assert_eq!(summary.status, PapeletasStatus::SinPapeletas);
        assert_eq!(summary.count, 0);
        assert_eq!(summary.message.as_deref(), Some("No registra papeletas"));
    }

    #[test]
    fn test_papeletas_without_table_is_unknown() {
        let output = MarkupExtraction::driver().extract_html("<p>Sin resultados</p>");
        assert_eq!(output.papeletas, Some(PapeletasSummary::unknown()));
        assert_eq!(output.record.get("PAPELETAS_ESTADO"), "");
        assert!(output.record.is_blank());
    }

    #[test]
    fn test_clean_empty_text_is_label_complete() {
        let cleaned = clean_labeled_text(&VEHICLE_SCHEMA, "");
        let lines: Vec<&str> = cleaned.lines().collect();

        assert_eq!(lines.len(), 11);
        for (line, field) in lines.iter().zip(VEHICLE_SCHEMA.fields) {
            assert_eq!(*line, format!("{}: ", field.label));
        }
        assert_eq!(count_filled_lines(&cleaned), 0);
    }

    #[test]
    fn test_clean_reorders_and_recovers_lines() {
        let text = "Aquí están los datos:\n\
                    **MARCA:** SUZUKI\n\
                    nº placa: A3V315\n\
                    - COLOR GRIS\n\
                    N° SERIE: JS3TA04V9A4601578\n\
                    PLACA VIGENTE: A3V315\n\
                    MARCA: TOYOTA\n\
                    ESTADO: EN CIRCULACION";
        let cleaned = clean_labeled_text(&VEHICLE_SCHEMA, text);
        let lines: Vec<&str> = cleaned.lines().collect();

        assert_eq!(lines[0], "Nº PLACA: A3V315");
        assert_eq!(lines[1], "Nº SERIE: JS3TA04V9A4601578");
        assert_eq!(lines[2], "Nº VIN: ");
        assert_eq!(lines[4], "COLOR: GRIS");
        // 同一标签取第一行
        assert_eq!(lines[5], "MARCA: SUZUKI");
        assert_eq!(lines[7], "PLACA VIGENTE: A3V315");
        assert_eq!(lines[8], "PLACA ANTERIOR: ");
        assert_eq!(lines[9], "ESTADO: EN CIRCULACION");
        assert_eq!(count_filled_lines(&cleaned), 6);
    }

    #[test]
    fn test_label_prefix_requires_word_boundary() {
        assert_eq!(match_label_prefix("COLOR: ROJO", "COLOR"), Some(5));
        assert_eq!(match_label_prefix("COLORES: ROJO", "COLOR"), None);
        assert_eq!(match_label_prefix("placa   vigente: X", "PLACA VIGENTE"), Some(15));
    }

    #[test]
    fn test_parse_labeled_lines_to_record() {
        let cleaned = clean_labeled_text(&VEHICLE_SCHEMA, "Nº MOTOR: J24B1068781\nANOTACIONES: NINGUNA");
        let record = parse_labeled_lines(&VEHICLE_SCHEMA, &cleaned);

        assert_eq!(record.get("MOTOR"), "J24B1068781");
        assert_eq!(record.get("ANOTACIONES"), "NINGUNA");
        assert_eq!(record.get("MODELO"), "");
        assert_eq!(record.field_count(), 2);
    }

    #[tokio::test]
    async fn test_markup_rejects_screenshot() {
        let err = MarkupExtraction::driver()
            .extract(&RawResult::Screenshot(vec![1, 2, 3]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::Extraction(ExtractionError::UnexpectedInput { found: "screenshot", .. })
        ));
    }
}
