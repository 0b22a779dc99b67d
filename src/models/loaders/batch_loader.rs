use std::path::Path;

use serde::Deserialize;
use tokio::fs;

use crate::error::{AppResult, ConfigError};
use crate::models::source::{SearchMode, Source};

/// 批量文件中的单条查询
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BatchQuery {
    pub fuente: Source,
    pub valor: String,
    #[serde(default)]
    pub modo: Option<SearchMode>,
}

#[derive(Debug, Deserialize)]
struct BatchFile {
    #[serde(default)]
    consultas: Vec<BatchQuery>,
}

/// 解析批量查询 TOML 内容
pub fn parse_batch(content: &str) -> Result<Vec<BatchQuery>, toml::de::Error> {
    let file: BatchFile = toml::from_str(content)?;
    Ok(file
        .consultas
        .into_iter()
        .filter(|q| !q.valor.trim().is_empty())
        .collect())
}

/// 从 TOML 文件加载批量查询
pub async fn load_batch_file(path: &Path) -> AppResult<Vec<BatchQuery>> {
    let content = fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::ReadFailed {
            path: path.display().to_string(),
            source,
        })?;

    let queries = parse_batch(&content).map_err(|source| ConfigError::ParseFailed {
        path: path.display().to_string(),
        source,
    })?;

    tracing::info!("从 {} 加载了 {} 条查询", path.display(), queries.len());
    Ok(queries)
}
