mod cache;
mod config;
mod constants;
mod error;
mod export;
mod model;
mod peaks;
mod pipeline;
mod report;
mod series;
mod smooth;

use clap::{ArgAction, CommandFactory, Parser, Subcommand};
use futures::{StreamExt, stream};
use std::fs::{self, File};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tqdm::pbar;

use crate::cache::SeriesCache;
use crate::config::{AppConfig, DEFAULT_CONFIG_PATH, Region, RunSettings};
use crate::constants::EXPORT_DATE_FORMAT;
use crate::model::OptimizerConfig;
use crate::pipeline::{BloomResult, Outlook};
use crate::report::{PageLayout, RegionReport};
use crate::series::Series;
use clap_complete::{Shell, generate};
use tracing_subscriber::EnvFilter;

const APP_ABOUT: &str = "BloomWatch - Detect and forecast vegetation bloom events from NDVI series";
const DEFAULT_OUTPUT_DIR: &str = "dist";
const DEFAULT_FORECAST_CSV: &str = "dist/forecast.csv";
/// Запас поверх дедлайна оптимизатора на сглаживание и поиск пиков.
const DEADLINE_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "bloomwatch", about = APP_ABOUT)]
struct Args {
    /// TOML-файл с регионами и параметрами прогона.
    #[arg(
        long = "config",
        value_name = "PATH",
        default_value = DEFAULT_CONFIG_PATH,
        global = true
    )]
    config: PathBuf,
    /// Архивировать CSV в .csv.gz и ссылаться на архивы в HTML.
    /// Исходные CSV удаляются после успешной архивации.
    #[arg(long = "archive-csv", global = true)]
    archive_csv: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Полный режим: история, прогноз, CSV и HTML-отчёт по регионам.
    Run {
        /// Регион из конфигурации (по умолчанию первый).
        #[arg(short = 'r', long = "region", value_name = "NAME", conflicts_with = "all")]
        region: Option<String>,
        /// Обработать все регионы конфигурации.
        #[arg(long = "all")]
        all: bool,
        /// Куда сохранить CSV и HTML.
        #[arg(
            short = 'o',
            long = "output-dir",
            value_name = "DIR",
            default_value = DEFAULT_OUTPUT_DIR
        )]
        output_dir: PathBuf,
        /// Раскладка страницы.
        #[arg(long = "layout", value_enum, default_value_t = PageLayout::Tabs)]
        layout: PageLayout,
        /// Не минифицировать HTML (по умолчанию минифицируется).
        #[arg(
            long = "no-minify-html",
            default_value_t = true,
            action = ArgAction::SetFalse
        )]
        minify_html: bool,
    },
    /// Только исторические пики по CSV.
    Detect {
        /// CSV с колонками date,ndvi.
        #[arg(short = 'c', long = "csv", value_name = "PATH")]
        csv: PathBuf,
        /// Сохранить размеченный CSV (date,ndvi,ndvi_smooth,is_peak).
        #[arg(long = "export", value_name = "PATH")]
        export: Option<PathBuf>,
    },
    /// Полный конвейер по одному CSV с сохранением прогноза.
    Forecast {
        /// CSV с колонками date,ndvi.
        #[arg(short = 'c', long = "csv", value_name = "PATH")]
        csv: PathBuf,
        /// Куда сохранить CSV с прогнозом.
        #[arg(
            long = "output-csv",
            value_name = "PATH",
            default_value = DEFAULT_FORECAST_CSV
        )]
        output_csv: PathBuf,
        /// Дополнительно сохранить весь результат в JSON.
        #[arg(long = "json", value_name = "PATH")]
        json: Option<PathBuf>,
    },
    /// Показать пики из ранее выгруженного размеченного CSV.
    Show {
        /// Файл bloom_data_<регион>.csv.
        #[arg(value_name = "PATH")]
        csv: PathBuf,
    },
    /// Список регионов из конфигурации.
    Regions,
    /// Сгенерировать файлы автодополнения для shell.
    Completions {
        /// Целевой shell.
        #[arg(value_enum)]
        shell: Shell,
        /// Куда сохранить файл (без флага пишет в stdout).
        #[arg(short = 'o', long = "output", value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

/// Результат конвейера для одного региона.
struct RegionRun {
    region: Region,
    series: Arc<Series>,
    result: BloomResult,
}

struct OutputOptions<'a> {
    output_dir: &'a Path,
    layout: PageLayout,
    minify_html: bool,
    archive_csv: bool,
}

fn generate_completions(shell: Shell, output: Option<&Path>) -> Result<(), String> {
    let mut cmd = Args::command();
    let bin_name = cmd.get_name().to_string();
    if let Some(path) = output {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .map_err(|err| format!("Failed to create {}: {err}", parent.display()))?;
        }
        let mut file = File::create(path)
            .map_err(|err| format!("Failed to create {}: {err}", path.display()))?;
        generate(shell, &mut cmd, bin_name, &mut file);
    } else {
        let mut stdout = std::io::stdout();
        generate(shell, &mut cmd, bin_name, &mut stdout);
    }
    Ok(())
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("bloomwatch=info"));
    let ansi = std::io::stdout().is_terminal();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(ansi)
        .compact()
        .init();
}

fn headline(message: &str) {
    tracing::info!(status = "start", "{message}");
}

fn info(message: &str) {
    tracing::info!(status = "info", "{message}");
}

fn success(message: &str) {
    tracing::info!(status = "ok", "{message}");
}

fn error(message: &str) {
    tracing::error!(status = "err", "{message}");
}

fn select_regions(
    config: &AppConfig,
    region: Option<&str>,
    all: bool,
) -> Result<Vec<Region>, String> {
    if all {
        return Ok(config.regions.clone());
    }
    match region {
        Some(name) => config
            .region(name)
            .cloned()
            .map(|region| vec![region])
            .ok_or_else(|| {
                let known = config
                    .regions
                    .iter()
                    .map(|region| region.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("Unknown region {name}; configured: {known}")
            }),
        None => config
            .regions
            .first()
            .cloned()
            .map(|region| vec![region])
            .ok_or_else(|| "No regions configured".to_string()),
    }
}

/// Загружает ряды через кэш; регион с ошибкой загрузки пропускается.
fn load_regions(cache: &mut SeriesCache, regions: Vec<Region>) -> Vec<(Region, Arc<Series>)> {
    let mut loaded = Vec::with_capacity(regions.len());
    for region in regions {
        match cache.load(&region.csv) {
            Ok(series) => {
                tracing::info!(
                    region = %region.name,
                    points = series.len(),
                    missing = series.missing_values(),
                    last = ?series.last_date(),
                    "Series loaded"
                );
                loaded.push((region, series));
            }
            Err(err) => error(&format!("Failed to load {}: {err}", region.name)),
        }
    }
    let (hits, misses) = cache.stats();
    tracing::debug!(hits, misses, entries = cache.len(), "Series cache stats");
    loaded
}

/// Прогоняет конвейер по регионам параллельно, каждый прогон ограничен таймаутом.
async fn analyze_regions(
    loaded: Vec<(Region, Arc<Series>)>,
    settings: RunSettings,
    optimizer: OptimizerConfig,
) -> Vec<RegionRun> {
    let limit = Duration::from_secs(settings.timeout_secs);
    let mut runs = Vec::with_capacity(loaded.len());
    let mut pbar = pbar(Some(loaded.len()));
    let stream = stream::iter(loaded).map(|(region, series)| async move {
        let worker = Arc::clone(&series);
        let task = tokio::task::spawn_blocking(move || {
            let optimizer = OptimizerConfig {
                deadline: Some(Instant::now() + limit),
                ..optimizer
            };
            pipeline::run(&worker, optimizer)
        });
        match tokio::time::timeout(limit + DEADLINE_GRACE, task).await {
            Ok(Ok(result)) => Ok(RegionRun {
                region,
                series,
                result,
            }),
            Ok(Err(err)) => Err(format!("Pipeline for {} failed: {err}", region.name)),
            Err(_) => Err(format!(
                "Pipeline for {} timed out after {}s",
                region.name,
                limit.as_secs()
            )),
        }
    });
    let mut buffered = stream.buffer_unordered(settings.concurrency);

    while let Some(outcome) = buffered.next().await {
        match outcome {
            Ok(run) => runs.push(run),
            Err(err) => error(&err),
        }
        if let Err(err) = pbar.update(1) {
            tracing::warn!(error = %err, "Failed to update progress bar");
        }
    }
    runs
}

fn log_result(region: &str, result: &BloomResult) {
    for peak in &result.peaks {
        tracing::info!(
            region,
            date = %peak.date.format(EXPORT_DATE_FORMAT),
            ndvi = peak.value,
            "Bloom detected"
        );
    }
    for peak in result.future_peaks() {
        tracing::info!(
            region,
            date = %peak.date.format(EXPORT_DATE_FORMAT),
            ndvi = peak.value,
            "Bloom predicted"
        );
    }
    if let Outlook::Unavailable { reason } = &result.outlook {
        tracing::warn!(
            region,
            last_observed = ?result.last_observed(),
            reason = %reason,
            "Forecast unavailable"
        );
    }
}

/// Пишет CSV (при необходимости архивирует) и HTML-отчёт региона.
fn write_region_outputs(
    run: &RegionRun,
    regions: &[String],
    options: &OutputOptions<'_>,
) -> Result<PathBuf, String> {
    let name = &run.region.name;
    let annotated_csv = options.output_dir.join(export::export_file_name(name));
    let download_name =
        export::download_name(&annotated_csv, options.archive_csv).map_err(|err| err.to_string())?;
    export::write_annotated_csv(&run.result.history, &annotated_csv)
        .map_err(|err| err.to_string())?;
    let saved = export::finalize_csv(&annotated_csv, options.archive_csv)
        .map_err(|err| err.to_string())?;
    info(&format!("Saved processed data to {}", saved.display()));

    if let Some(outlook) = run.result.forecast() {
        let forecast_csv = options.output_dir.join(export::forecast_file_name(name));
        export::write_forecast_csv(outlook, &forecast_csv).map_err(|err| err.to_string())?;
        let saved = export::finalize_csv(&forecast_csv, options.archive_csv)
            .map_err(|err| err.to_string())?;
        info(&format!("Saved forecast to {}", saved.display()));
    }

    let output_html = options.output_dir.join(report::report_file_name(name));
    let page = RegionReport {
        region: name,
        result: &run.result,
        coordinates: &run.series.coordinates,
        download_name: Some(download_name),
        regions,
    };
    report::write_report(&page, &output_html, options.layout, options.minify_html)
        .map_err(|err| format!("Failed to render report for {name}: {err}"))?;
    Ok(output_html)
}

async fn run_regions(
    config: &AppConfig,
    selected: Vec<Region>,
    options: &OutputOptions<'_>,
) -> Result<usize, String> {
    let mut cache = SeriesCache::new();
    let order = selected
        .iter()
        .map(|region| region.name.clone())
        .collect::<Vec<_>>();
    let loaded = load_regions(&mut cache, selected);
    if loaded.is_empty() {
        return Err("No region could be loaded".to_string());
    }

    let mut runs = analyze_regions(loaded, config.run, config.optimizer).await;
    runs.sort_by_key(|run| {
        order
            .iter()
            .position(|name| *name == run.region.name)
            .unwrap_or(usize::MAX)
    });
    let nav = runs
        .iter()
        .map(|run| run.region.name.clone())
        .collect::<Vec<_>>();

    let mut written = 0;
    for run in &runs {
        log_result(&run.region.name, &run.result);
        match write_region_outputs(run, &nav, options) {
            Ok(path) => {
                success(&format!(
                    "Saved {} report to {}",
                    run.region.name,
                    path.display()
                ));
                written += 1;
            }
            Err(err) => error(&err),
        }
    }
    Ok(written)
}

fn detect_from_csv(csv: &Path, export: Option<&Path>, archive_csv: bool) -> Result<(), String> {
    let series = series::load_series(csv).map_err(|err| err.to_string())?;
    let (annotated, peaks) = pipeline::detect_blooms(&series);
    if peaks.is_empty() {
        tracing::warn!("No bloom events detected in historical data");
    }
    for &idx in &peaks {
        tracing::info!(
            date = %annotated[idx].date.format(EXPORT_DATE_FORMAT),
            ndvi = annotated[idx].ndvi_smooth.unwrap_or(f64::NAN),
            "Bloom detected"
        );
    }
    success(&format!(
        "Found {} past bloom events in {} observations",
        peaks.len(),
        annotated.len()
    ));
    if let Some(path) = export {
        export::write_annotated_csv(&annotated, path).map_err(|err| err.to_string())?;
        let saved = export::finalize_csv(path, archive_csv).map_err(|err| err.to_string())?;
        success(&format!("Saved processed data to {}", saved.display()));
    }
    Ok(())
}

fn forecast_from_csv(
    csv: &Path,
    output_csv: &Path,
    json: Option<&Path>,
    optimizer: OptimizerConfig,
    archive_csv: bool,
) -> Result<(), String> {
    let series = series::load_series(csv).map_err(|err| err.to_string())?;
    let result = pipeline::run(&series, optimizer);
    log_result(&csv.display().to_string(), &result);

    if let Some(path) = json {
        export::write_json(&result, path).map_err(|err| err.to_string())?;
        success(&format!("Saved result JSON to {}", path.display()));
    }
    // Причину уже записал log_result, история при этом валидна.
    let Some(outlook) = result.forecast() else {
        info(&format!(
            "Forecast CSV not written, {} past bloom events kept",
            result.peaks.len()
        ));
        return Ok(());
    };
    export::write_forecast_csv(outlook, output_csv).map_err(|err| err.to_string())?;
    let saved = export::finalize_csv(output_csv, archive_csv).map_err(|err| err.to_string())?;
    success(&format!(
        "Saved forecast to {} ({} future steps, {} predicted blooms)",
        saved.display(),
        outlook.forecast.future().count(),
        outlook.future_peaks.len()
    ));
    Ok(())
}

fn show_export(csv: &Path) -> Result<(), String> {
    let points = export::load_annotated_csv(csv).map_err(|err| err.to_string())?;
    let mut count = 0;
    for point in points.iter().filter(|point| point.is_peak) {
        tracing::info!(
            date = %point.date.format(EXPORT_DATE_FORMAT),
            ndvi = point.ndvi_smooth.unwrap_or(f64::NAN),
            "Bloom"
        );
        count += 1;
    }
    success(&format!(
        "{count} bloom events in {} rows of {}",
        points.len(),
        csv.display()
    ));
    Ok(())
}

fn list_regions(config: &AppConfig) {
    for region in &config.regions {
        tracing::info!(
            region = %region.name,
            csv = %region.csv.display(),
            exists = region.csv.exists(),
            "Configured region"
        );
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let archive_csv = args.archive_csv;
    if let Command::Completions { shell, output } = &args.command {
        if let Err(err) = generate_completions(*shell, output.as_deref()) {
            eprintln!("{err}");
        }
        return;
    }

    init_logging();
    headline(APP_ABOUT);
    let config = match config::load_config(&args.config) {
        Ok(config) => config,
        Err(err) => {
            error(&err.to_string());
            return;
        }
    };

    match args.command {
        Command::Completions { .. } => {}
        Command::Run {
            region,
            all,
            output_dir,
            layout,
            minify_html,
        } => {
            let selected = match select_regions(&config, region.as_deref(), all) {
                Ok(selected) => selected,
                Err(err) => {
                    error(&err);
                    return;
                }
            };
            tracing::info!(
                mode = "run",
                regions = selected.len(),
                archive_csv,
                layout = ?layout,
                minify_html,
                timeout_secs = config.run.timeout_secs,
                concurrency = config.run.concurrency,
                output_dir = %output_dir.display(),
                "Starting bloom pipeline"
            );
            let options = OutputOptions {
                output_dir: &output_dir,
                layout,
                minify_html,
                archive_csv,
            };
            match run_regions(&config, selected, &options).await {
                Ok(written) => success(&format!(
                    "Finished: {written} report(s) in {}",
                    output_dir.display()
                )),
                Err(err) => error(&err),
            }
        }
        Command::Detect { csv, export } => {
            tracing::info!(
                mode = "detect",
                archive_csv,
                input_csv = %csv.display(),
                "Detecting historical blooms"
            );
            if let Err(err) = detect_from_csv(&csv, export.as_deref(), archive_csv) {
                error(&err);
            }
        }
        Command::Forecast {
            csv,
            output_csv,
            json,
        } => {
            tracing::info!(
                mode = "forecast",
                archive_csv,
                input_csv = %csv.display(),
                output_csv = %output_csv.display(),
                max_iters = config.optimizer.max_iters,
                "Forecasting future blooms"
            );
            if let Err(err) = forecast_from_csv(
                &csv,
                &output_csv,
                json.as_deref(),
                config.optimizer,
                archive_csv,
            ) {
                error(&err);
            }
        }
        Command::Show { csv } => {
            if let Err(err) = show_export(&csv) {
                error(&err);
            }
        }
        Command::Regions => list_regions(&config),
    }
}
