use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::record::{FieldSpec, RecordSchema};

/// SUNARP 车辆数据（视觉模型按标签输出）
pub static VEHICLE_SCHEMA: RecordSchema = RecordSchema {
    name: "vehiculo",
    fields: &[
        FieldSpec::text("PLACA", "Nº PLACA", None),
        FieldSpec::text("SERIE", "Nº SERIE", Some("numero_serie")),
        FieldSpec::text("VIN", "Nº VIN", Some("numero_vin")),
        FieldSpec::text("MOTOR", "Nº MOTOR", Some("numero_motor")),
        FieldSpec::text("COLOR", "COLOR", Some("color")),
        FieldSpec::text("MARCA", "MARCA", Some("marca")),
        FieldSpec::text("MODELO", "MODELO", Some("modelo")),
        FieldSpec::text("PLACA_VIGENTE", "PLACA VIGENTE", Some("placa_vigente")),
        FieldSpec::text("PLACA_ANTERIOR", "PLACA ANTERIOR", Some("placa_anterior")),
        FieldSpec::text("ESTADO", "ESTADO", Some("estado")),
        FieldSpec::text("ANOTACIONES", "ANOTACIONES", Some("anotaciones")),
    ],
};

/// SCPPP 驾驶员数据（HTML 元素 + 罚单汇总）
pub static DRIVER_SCHEMA: RecordSchema = RecordSchema {
    name: "conductor",
    fields: &[
        FieldSpec::element("NOMBRE_COMPLETO", "NOMBRE COMPLETO", "lblAdministrado", "nombre_completo"),
        FieldSpec::element("DNI", "DNI", "lblDni", "dni"),
        FieldSpec::element("LICENCIA", "LICENCIA", "lblLicencia", "licencia"),
        FieldSpec::element("CLASE_CATEGORIA", "CLASE CATEGORIA", "lblClaseCategoria", "clase_categoria"),
        FieldSpec::element("VIGENCIA", "VIGENCIA", "lblVigencia", "vigencia"),
        FieldSpec::element("ESTADO_LICENCIA", "ESTADO LICENCIA", "lblEstadoLicencia", "estado_licencia"),
        FieldSpec::text("PAPELETAS_ESTADO", "PAPELETAS ESTADO", Some("papeletas_estado")),
        FieldSpec::integer("PAPELETAS_CANTIDAD", "PAPELETAS CANTIDAD", "papeletas_cantidad"),
    ],
};

/// 数据来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// SUNARP 车辆登记
    #[serde(alias = "vehiculos", alias = "sunarp")]
    Vehiculo,
    /// MTC / SCPPP 驾照登记
    #[serde(alias = "conductores", alias = "scppp")]
    Conductor,
}

/// 统计分组定义：列名 + 可选的 Top N 限制
#[derive(Debug, Clone, Copy)]
pub struct StatGroup {
    pub column: &'static str,
    pub limit: Option<usize>,
}

impl Source {
    pub fn schema(self) -> &'static RecordSchema {
        match self {
            Source::Vehiculo => &VEHICLE_SCHEMA,
            Source::Conductor => &DRIVER_SCHEMA,
        }
    }

    /// 数据表名
    pub fn table(self) -> &'static str {
        match self {
            Source::Vehiculo => "sunarp_vehiculos",
            Source::Conductor => "scppp_conductores",
        }
    }

    /// 自然键列名
    pub fn key_column(self) -> &'static str {
        match self {
            Source::Vehiculo => "placa",
            Source::Conductor => "licencia_dni",
        }
    }

    /// 门户名称（仅用于日志显示）
    pub fn portal(self) -> &'static str {
        match self {
            Source::Vehiculo => "SUNARP",
            Source::Conductor => "SCPPP",
        }
    }

    /// 统计时的分组列
    pub fn stat_groups(self) -> &'static [StatGroup] {
        match self {
            Source::Vehiculo => &[
                StatGroup { column: "marca", limit: Some(10) },
                StatGroup { column: "estado", limit: None },
            ],
            Source::Conductor => &[
                StatGroup { column: "estado_licencia", limit: None },
                StatGroup { column: "papeletas_estado", limit: None },
            ],
        }
    }

    /// 规范化自然键
    ///
    /// 车牌统一去空格并转大写；证件号只去首尾空白
    pub fn normalize_key(self, raw: &str) -> String {
        match self {
            Source::Vehiculo => raw
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect::<String>()
                .to_uppercase(),
            Source::Conductor => raw.trim().to_string(),
        }
    }

    pub const ALL: [Source; 2] = [Source::Vehiculo, Source::Conductor];
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Vehiculo => write!(f, "vehiculo"),
            Source::Conductor => write!(f, "conductor"),
        }
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "vehiculo" | "vehiculos" | "sunarp" => Ok(Source::Vehiculo),
            "conductor" | "conductores" | "scppp" => Ok(Source::Conductor),
            other => Err(format!("未知的数据来源: {}", other)),
        }
    }
}

/// SCPPP 查询方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// 按证件号查询（rbtnlBuqueda = 0）
    Documento,
    /// 按驾照号查询（rbtnlBuqueda = 1）
    #[default]
    Licencia,
}

impl SearchMode {
    /// 表单中单选框的取值
    pub fn code(self) -> &'static str {
        match self {
            SearchMode::Documento => "0",
            SearchMode::Licencia => "1",
        }
    }

    /// 承载查询值的输入框
    pub fn input_field(self) -> &'static str {
        match self {
            SearchMode::Documento => "txtNroDocumento",
            SearchMode::Licencia => "txtNroLicencia",
        }
    }

    /// 证件类型下拉框取值
    pub fn document_type(self) -> &'static str {
        match self {
            SearchMode::Documento => "",
            SearchMode::Licencia => "2",
        }
    }
}

impl FromStr for SearchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "1" | "licencia" => Ok(SearchMode::Licencia),
            "0" | "documento" | "dni" => Ok(SearchMode::Documento),
            other => Err(format!("未知的查询方式: {}", other)),
        }
    }
}
