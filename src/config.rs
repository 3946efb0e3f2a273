//! TOML-конфигурация: реестр регионов, параметры прогона и оптимизатора.
//!
//! Все поля файла необязательны; отсутствующие берутся из встроенных значений.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;
use crate::model::OptimizerConfig;

pub const DEFAULT_CONFIG_PATH: &str = "config/bloomwatch.toml";
const DEFAULT_REGIONS: [&str; 8] = [
    "Bhopal", "Indore", "Jabalpur", "Gwalior", "Ujjain", "Sagar", "Rewa", "Satna",
];
const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_TIMEOUT_SECS: u64 = 120;
const DEFAULT_CONCURRENCY: usize = 4;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    regions: Option<BTreeMap<String, PathBuf>>,
    run: Option<RunFile>,
    optimizer: Option<OptimizerFile>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RunFile {
    timeout_secs: Option<u64>,
    concurrency: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct OptimizerFile {
    max_iters: Option<u64>,
    #[serde(alias = "memory")]
    history: Option<usize>,
    tol_grad: Option<f64>,
    tol_cost: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Region {
    pub name: String,
    pub csv: PathBuf,
}

/// Параметры прогона регионов.
///
/// `timeout_secs` становится дедлайном оптимизатора: модель, не уложившаяся в срок,
/// останавливается, и регион получает историю без прогноза. Таймаут задачи
/// в `tokio` остаётся страховкой сверху и сам блокирующий поток не прерывает.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunSettings {
    pub timeout_secs: u64,
    pub concurrency: usize,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AppConfig {
    pub regions: Vec<Region>,
    pub run: RunSettings,
    pub optimizer: OptimizerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            regions: default_regions(),
            run: RunSettings::default(),
            optimizer: OptimizerConfig::default(),
        }
    }
}

impl AppConfig {
    /// Поиск региона без учёта регистра.
    pub fn region(&self, name: &str) -> Option<&Region> {
        let name = name.trim();
        self.regions
            .iter()
            .find(|region| region.name.eq_ignore_ascii_case(name))
    }
}

fn default_regions() -> Vec<Region> {
    DEFAULT_REGIONS
        .iter()
        .map(|name| Region {
            name: (*name).to_string(),
            csv: Path::new(DEFAULT_DATA_DIR)
                .join(format!("sample_ndvi_{}.csv", name.to_lowercase())),
        })
        .collect()
}

fn resolve_run(overrides: Option<RunFile>) -> RunSettings {
    let mut run = RunSettings::default();
    if let Some(overrides) = overrides {
        if let Some(timeout_secs) = overrides.timeout_secs {
            run.timeout_secs = timeout_secs;
        }
        if let Some(concurrency) = overrides.concurrency {
            run.concurrency = concurrency;
        }
    }
    run
}

fn resolve_optimizer(overrides: Option<OptimizerFile>) -> OptimizerConfig {
    let mut cfg = OptimizerConfig::default();
    if let Some(overrides) = overrides {
        if let Some(max_iters) = overrides.max_iters {
            cfg.max_iters = max_iters;
        }
        if let Some(history) = overrides.history {
            cfg.history = history;
        }
        if let Some(tol_grad) = overrides.tol_grad {
            cfg.tol_grad = tol_grad;
        }
        if let Some(tol_cost) = overrides.tol_cost {
            cfg.tol_cost = tol_cost;
        }
    }
    cfg
}

fn resolve_regions(overrides: Option<BTreeMap<String, PathBuf>>) -> Vec<Region> {
    overrides.map_or_else(default_regions, |regions| {
        regions
            .into_iter()
            .map(|(name, csv)| Region { name, csv })
            .collect()
    })
}

fn validate(config: &AppConfig) -> Result<(), String> {
    if config.regions.is_empty() {
        return Err("regions must not be empty".to_string());
    }
    for region in &config.regions {
        if region.name.trim().is_empty() {
            return Err("region name must not be empty".to_string());
        }
        if region.csv.as_os_str().is_empty() {
            return Err(format!("regions.{} must point to a CSV file", region.name));
        }
    }
    for (idx, region) in config.regions.iter().enumerate() {
        if config.regions[..idx]
            .iter()
            .any(|other| other.name.eq_ignore_ascii_case(&region.name))
        {
            return Err(format!("region {} is listed twice", region.name));
        }
    }
    if config.run.timeout_secs == 0 {
        return Err("run.timeout_secs must be > 0".to_string());
    }
    if config.run.concurrency == 0 {
        return Err("run.concurrency must be > 0".to_string());
    }
    let optimizer = &config.optimizer;
    if optimizer.max_iters == 0 {
        return Err("optimizer.max_iters must be > 0".to_string());
    }
    if optimizer.history == 0 {
        return Err("optimizer.history must be > 0".to_string());
    }
    if !optimizer.tol_grad.is_finite() || optimizer.tol_grad <= 0.0 {
        return Err("optimizer.tol_grad must be > 0".to_string());
    }
    if !optimizer.tol_cost.is_finite() || optimizer.tol_cost <= 0.0 {
        return Err("optimizer.tol_cost must be > 0".to_string());
    }
    Ok(())
}

/// Разбирает текст конфигурации; `origin` нужен только для сообщений об ошибках.
pub fn parse_config(raw: &str, origin: &Path) -> Result<AppConfig, ConfigError> {
    let file: ConfigFile = toml::from_str(raw).map_err(|source| ConfigError::Parse {
        path: origin.to_path_buf(),
        source,
    })?;
    let config = AppConfig {
        regions: resolve_regions(file.regions),
        run: resolve_run(file.run),
        optimizer: resolve_optimizer(file.optimizer),
    };
    validate(&config).map_err(|reason| ConfigError::Invalid {
        path: origin.to_path_buf(),
        reason,
    })?;
    Ok(config)
}

/// Загружает конфигурацию. Если нет файла по пути по умолчанию, берутся встроенные значения.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    if !path.exists() {
        if path == Path::new(DEFAULT_CONFIG_PATH) {
            tracing::info!(
                "Config {} not found, using built-in defaults",
                path.display()
            );
            return Ok(AppConfig::default());
        }
        return Err(ConfigError::Missing(path.to_path_buf()));
    }

    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&raw, path)
}
