//! Типизированные ошибки загрузки, обучения модели, конфигурации и выгрузок.

use std::path::PathBuf;

use thiserror::Error;

/// Ошибка загрузки ряда: фатальна для выбранного региона, конвейер не запускается.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed CSV {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("failed to parse date '{raw}' in {path}: {reason}")]
    Date {
        path: PathBuf,
        raw: String,
        reason: &'static str,
    },
    #[error("{path} contains no observations")]
    EmptySeries { path: PathBuf },
}

/// Ошибка обучения прогнозной модели; конвейер превращает её в «прогноза нет».
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("need at least {needed} observations, got {got}")]
    InsufficientData { needed: usize, got: usize },
    #[error("history spans a single date, trend cannot be fitted")]
    SingleTimestamp,
    #[error("non-finite value at position {index}")]
    NonFinite { index: usize },
    #[error("optimizer failed: {0}")]
    Optimizer(String),
    #[error("model fit stopped at the run deadline")]
    DeadlineExceeded,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config {0} does not exist")]
    Missing(PathBuf),
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

/// Ошибка записи/чтения выгрузок (CSV, JSON, gzip-архивы).
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write CSV {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("failed to write JSON {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("malformed row {row} in {path}: {reason}")]
    Malformed {
        path: PathBuf,
        row: usize,
        reason: String,
    },
    #[error("path {0} has no file name")]
    NoFileName(PathBuf),
}
