//! 规范化记录
//!
//! 记录总是包含 schema 中的全部字段键，值可能为空，调用方只需判断是否为空。

use serde::ser::{Serialize, SerializeMap, Serializer};

/// 字段未找到时的占位值
pub const NOT_FOUND: &str = "No encontrado";

/// 数据库列类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Integer,
}

/// 单个字段的定义
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    /// 内部字段键（如 `PLACA_VIGENTE`）
    pub key: &'static str,
    /// 门户/模型输出中使用的标签（如 `PLACA VIGENTE`）
    pub label: &'static str,
    /// HTML 结果中承载该字段的元素 id
    pub element_id: Option<&'static str>,
    /// 对应的数据库列；`None` 表示该字段即自然键，不单独存列
    pub column: Option<&'static str>,
    pub kind: ColumnKind,
}

impl FieldSpec {
    pub const fn text(key: &'static str, label: &'static str, column: Option<&'static str>) -> Self {
        Self {
            key,
            label,
            element_id: None,
            column,
            kind: ColumnKind::Text,
        }
    }

    pub const fn element(key: &'static str, label: &'static str, element_id: &'static str, column: &'static str) -> Self {
        Self {
            key,
            label,
            element_id: Some(element_id),
            column: Some(column),
            kind: ColumnKind::Text,
        }
    }

    pub const fn integer(key: &'static str, label: &'static str, column: &'static str) -> Self {
        Self {
            key,
            label,
            element_id: None,
            column: Some(column),
            kind: ColumnKind::Integer,
        }
    }
}

/// 一类实体的字段集合，顺序即规范顺序
#[derive(Debug, PartialEq, Eq)]
pub struct RecordSchema {
    pub name: &'static str,
    pub fields: &'static [FieldSpec],
}

impl RecordSchema {
    pub fn field(&self, key: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.key == key)
    }

    pub fn labels(&self) -> Vec<&'static str> {
        self.fields.iter().map(|f| f.label).collect()
    }
}

/// 规范化后的提取结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedRecord {
    schema: &'static RecordSchema,
    values: Vec<String>,
}

impl ExtractedRecord {
    /// 所有字段为空的记录
    pub fn empty(schema: &'static RecordSchema) -> Self {
        Self {
            schema,
            values: vec![String::new(); schema.fields.len()],
        }
    }

    /// 从任意顺序的 (键, 值) 对构建记录
    ///
    /// 不在 schema 中的键被忽略；同一键出现多次时保留第一个
    pub fn from_pairs<K, V>(schema: &'static RecordSchema, pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut record = Self::empty(schema);
        let mut seen = vec![false; schema.fields.len()];
        for (key, value) in pairs {
            if let Some(idx) = record.index_of(key.as_ref()) {
                if !seen[idx] {
                    record.values[idx] = value.into();
                    seen[idx] = true;
                }
            }
        }
        record
    }

    fn index_of(&self, key: &str) -> Option<usize> {
        self.schema.fields.iter().position(|f| f.key == key)
    }

    pub fn schema(&self) -> &'static RecordSchema {
        self.schema
    }

    /// 读取字段值，未知键返回空字符串
    pub fn get(&self, key: &str) -> &str {
        self.index_of(key)
            .map(|idx| self.values[idx].as_str())
            .unwrap_or("")
    }

    /// 设置字段值；键不在 schema 中时返回 false
    pub fn set(&mut self, key: &str, value: impl Into<String>) -> bool {
        match self.index_of(key) {
            Some(idx) => {
                self.values[idx] = value.into();
                true
            }
            None => false,
        }
    }

    /// 按规范顺序遍历 (字段定义, 值)
    pub fn iter(&self) -> impl Iterator<Item = (&'static FieldSpec, &str)> + '_ {
        self.schema
            .fields
            .iter()
            .zip(self.values.iter().map(String::as_str))
    }

    /// 有实际内容的字段数量（占位值不计）
    pub fn field_count(&self) -> usize {
        self.values
            .iter()
            .filter(|v| is_filled(v))
            .count()
    }

    /// 所有字段均为空或占位值
    pub fn is_blank(&self) -> bool {
        self.field_count() == 0
    }
}

fn is_filled(value: &str) -> bool {
    let value = value.trim();
    !value.is_empty() && value != NOT_FOUND
}

impl Serialize for ExtractedRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (field, value) in self.iter() {
            map.serialize_entry(field.key, value)?;
        }
        map.end()
    }
}

/// 将标签转换为内部字段键
///
/// 转大写，去掉编号符号（`Nº`、`N°`、`º`），空格替换为下划线
pub fn normalize_field_key(label: &str) -> String {
    let upper = label.trim().to_uppercase();
    let stripped = upper
        .replace("Nº ", "")
        .replace("N° ", "")
        .replace("Nº", "")
        .replace("N°", "")
        .replace('º', "");
    stripped.split_whitespace().collect::<Vec<_>>().join("_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::source::{DRIVER_SCHEMA, VEHICLE_SCHEMA};

    #[test]
    fn test_normalize_field_key() {
        assert_eq!(normalize_field_key("Nº PLACA"), "PLACA");
        assert_eq!(normalize_field_key("N° SERIE"), "SERIE");
        assert_eq!(normalize_field_key("nº motor"), "MOTOR");
        assert_eq!(normalize_field_key("  placa   vigente "), "PLACA_VIGENTE");
        assert_eq!(normalize_field_key("ANOTACIONES"), "ANOTACIONES");
    }

    #[test]
    fn test_vehicle_labels_normalize_to_keys() {
        for field in VEHICLE_SCHEMA.fields {
            assert_eq!(normalize_field_key(field.label), field.key);
        }
    }

    #[test]
    fn test_from_pairs_is_label_complete() {
        let record = ExtractedRecord::from_pairs(
            &VEHICLE_SCHEMA,
            vec![("MARCA", "SUZUKI"), ("DESCONOCIDO", "x"), ("MARCA", "TOYOTA")],
        );

        assert_eq!(record.iter().count(), VEHICLE_SCHEMA.fields.len());
        assert_eq!(record.get("MARCA"), "SUZUKI");
        assert_eq!(record.get("COLOR"), "");
        assert_eq!(record.get("DESCONOCIDO"), "");
        assert_eq!(record.field_count(), 1);
    }

    #[test]
    fn test_sentinel_does_not_count_as_filled() {
        let mut record = ExtractedRecord::empty(&DRIVER_SCHEMA);
        for field in DRIVER_SCHEMA.fields {
            record.set(field.key, NOT_FOUND);
        }
        assert!(record.is_blank());

        assert!(record.set("DNI", "12345678"));
        assert!(!record.set("NO_EXISTE", "x"));
        assert_eq!(record.field_count(), 1);
    }

    #[test]
    fn test_serialize_keeps_canonical_order() {
        let record = ExtractedRecord::from_pairs(&VEHICLE_SCHEMA, vec![("ANOTACIONES", "NINGUNA")]);
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.starts_with(r#"{"PLACA":"""#));
        assert!(json.ends_with(r#""ANOTACIONES":"NINGUNA"}"#));
    }
}
