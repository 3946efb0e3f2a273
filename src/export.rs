//! Выгрузки результатов: размеченный CSV истории, CSV прогноза, JSON и gzip-архивы.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Deserialize;

use crate::constants::EXPORT_DATE_FORMAT;
use crate::error::ExportError;
use crate::pipeline::{AnnotatedPoint, BloomResult, ForecastOutlook};

const ANNOTATED_HEADER: [&str; 4] = ["date", "ndvi", "ndvi_smooth", "is_peak"];
const FORECAST_HEADER: [&str; 4] = ["date", "yhat", "yhat_smooth", "is_future_peak"];
const EXPORT_PREFIX: &str = "bloom_data_";
const FORECAST_PREFIX: &str = "bloom_forecast_";
const CSV_EXTENSION: &str = "csv";
const CSV_ARCHIVE_EXTENSION: &str = "gz";
const FLAG_TRUE: &str = "True";
const FLAG_FALSE: &str = "False";

/// Имя файла выгрузки по умолчанию: `bloom_data_<регион>.csv`.
pub fn export_file_name(region: &str) -> String {
    format!(
        "{EXPORT_PREFIX}{}.{CSV_EXTENSION}",
        region.trim().to_lowercase()
    )
}

pub fn forecast_file_name(region: &str) -> String {
    format!(
        "{FORECAST_PREFIX}{}.{CSV_EXTENSION}",
        region.trim().to_lowercase()
    )
}

/// Кратчайшее представление, которое читается обратно в то же число.
/// Целые значения получают `.0`, пропуски становятся пустой ячейкой.
fn format_float(value: f64) -> String {
    if !value.is_finite() {
        return String::new();
    }
    let text = value.to_string();
    if text.contains(['.', 'e', 'E']) {
        text
    } else {
        format!("{text}.0")
    }
}

fn format_optional(value: Option<f64>) -> String {
    value.map_or_else(String::new, format_float)
}

const fn format_flag(flag: bool) -> &'static str {
    if flag { FLAG_TRUE } else { FLAG_FALSE }
}

pub(crate) fn ensure_parent_dir(path: &Path) -> Result<(), ExportError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|source| ExportError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

fn create_writer(path: &Path) -> Result<csv::Writer<BufWriter<File>>, ExportError> {
    ensure_parent_dir(path)?;
    let file = File::create(path).map_err(|source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(csv::Writer::from_writer(BufWriter::new(file)))
}

/// Записывает историю с колонками `date,ndvi,ndvi_smooth,is_peak`.
pub fn write_annotated_csv(points: &[AnnotatedPoint], path: &Path) -> Result<(), ExportError> {
    let csv_err = |source| ExportError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut writer = create_writer(path)?;
    writer.write_record(ANNOTATED_HEADER).map_err(csv_err)?;
    for point in points {
        writer
            .write_record([
                point.date.format(EXPORT_DATE_FORMAT).to_string(),
                format_float(point.ndvi),
                format_optional(point.ndvi_smooth),
                format_flag(point.is_peak).to_string(),
            ])
            .map_err(csv_err)?;
    }
    writer.flush().map_err(|source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::debug!(path = %path.display(), rows = points.len(), "Annotated CSV written");
    Ok(())
}

#[derive(Debug, Deserialize)]
struct AnnotatedRow {
    date: String,
    ndvi: Option<f64>,
    ndvi_smooth: Option<f64>,
    is_peak: String,
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim() {
        FLAG_TRUE | "true" | "1" => Some(true),
        FLAG_FALSE | "false" | "0" => Some(false),
        _ => None,
    }
}

/// Читает размеченный CSV обратно (формат [`write_annotated_csv`]).
pub fn read_annotated_csv<R: Read>(
    input: R,
    origin: &Path,
) -> Result<Vec<AnnotatedPoint>, ExportError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(input);
    let malformed = |row: usize, reason: String| ExportError::Malformed {
        path: origin.to_path_buf(),
        row,
        reason,
    };

    let mut points = Vec::new();
    for (idx, record) in reader.deserialize::<AnnotatedRow>().enumerate() {
        let row = idx + 1;
        let record = record.map_err(|err| malformed(row, err.to_string()))?;
        let date = NaiveDate::parse_from_str(&record.date, EXPORT_DATE_FORMAT)
            .map_err(|err| malformed(row, format!("date '{}': {err}", record.date)))?;
        let is_peak = parse_flag(&record.is_peak)
            .ok_or_else(|| malformed(row, format!("flag '{}'", record.is_peak)))?;
        points.push(AnnotatedPoint {
            date,
            ndvi: record.ndvi.unwrap_or(f64::NAN),
            ndvi_smooth: record.ndvi_smooth,
            is_peak,
        });
    }
    Ok(points)
}

pub fn load_annotated_csv(path: &Path) -> Result<Vec<AnnotatedPoint>, ExportError> {
    let file = File::open(path).map_err(|source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    read_annotated_csv(file, path)
}

/// Записывает прогноз с колонками `date,yhat,yhat_smooth,is_future_peak`.
pub fn write_forecast_csv(outlook: &ForecastOutlook, path: &Path) -> Result<(), ExportError> {
    let csv_err = |source| ExportError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let peak_rows: HashSet<usize> = outlook.future_peaks.iter().map(|peak| peak.index).collect();
    let mut writer = create_writer(path)?;
    writer.write_record(FORECAST_HEADER).map_err(csv_err)?;
    for (idx, (point, smoothed)) in outlook
        .forecast
        .points
        .iter()
        .zip(&outlook.yhat_smooth)
        .enumerate()
    {
        writer
            .write_record([
                point.date.format(EXPORT_DATE_FORMAT).to_string(),
                format_float(point.yhat),
                format_optional(*smoothed),
                format_flag(peak_rows.contains(&idx)).to_string(),
            ])
            .map_err(csv_err)?;
    }
    writer.flush().map_err(|source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

/// Полный результат конвейера в JSON. NaN сериализуется как `null`.
pub fn write_json(result: &BloomResult, path: &Path) -> Result<(), ExportError> {
    ensure_parent_dir(path)?;
    let file = File::create(path).map_err(|source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, result).map_err(|source| ExportError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    writer.flush().map_err(|source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn file_name_for(path: &Path) -> Result<String, ExportError> {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| ExportError::NoFileName(path.to_path_buf()))
}

pub fn archive_path_for(csv_path: &Path) -> Result<PathBuf, ExportError> {
    let file_name = file_name_for(csv_path)?;
    let mut archive_path = csv_path.to_path_buf();
    archive_path.set_file_name(format!("{file_name}.{CSV_ARCHIVE_EXTENSION}"));
    Ok(archive_path)
}

/// Сжимает CSV в `.csv.gz` рядом с исходным файлом.
pub fn archive_csv_file(csv_path: &Path) -> Result<PathBuf, ExportError> {
    let archive_path = archive_path_for(csv_path)?;
    ensure_parent_dir(&archive_path)?;
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| ExportError::Io { path, source }
    };
    let mut input = File::open(csv_path).map_err(io_err(csv_path))?;
    let output = File::create(&archive_path).map_err(io_err(&archive_path))?;
    let mut encoder = GzEncoder::new(output, Compression::default());
    std::io::copy(&mut input, &mut encoder).map_err(io_err(&archive_path))?;
    encoder.finish().map_err(io_err(&archive_path))?;
    Ok(archive_path)
}

pub fn remove_csv_file(csv_path: &Path) -> Result<(), ExportError> {
    fs::remove_file(csv_path).map_err(|source| ExportError::Io {
        path: csv_path.to_path_buf(),
        source,
    })
}

/// Имя, под которым выгрузка доступна для скачивания со страницы отчёта.
pub fn download_name(csv_path: &Path, archive: bool) -> Result<String, ExportError> {
    if archive {
        file_name_for(&archive_path_for(csv_path)?)
    } else {
        file_name_for(csv_path)
    }
}

/// Архивирует CSV и удаляет исходник; без флага ничего не делает.
pub fn finalize_csv(csv_path: &Path, archive: bool) -> Result<PathBuf, ExportError> {
    if !archive {
        return Ok(csv_path.to_path_buf());
    }
    let archive_path = archive_csv_file(csv_path)?;
    remove_csv_file(csv_path)?;
    Ok(archive_path)
}
