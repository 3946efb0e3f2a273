//! Загрузка CSV с NDVI по региону и построение упорядоченного ряда наблюдений.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::error::LoadError;

const DATE_FORMAT_ISO: &str = "%Y-%m-%d";
const DATE_FORMAT_SLASHED: &str = "%Y/%m/%d";
const DATETIME_FORMAT_SPACE: &str = "%Y-%m-%d %H:%M:%S";
const DATETIME_FORMAT_T: &str = "%Y-%m-%dT%H:%M:%S";

const ERROR_EMPTY_DATE: &str = "empty date";
const ERROR_UNRECOGNIZED_DATE: &str = "unrecognized date format";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DateFormatHint {
    Iso,
    Slashed,
    DateTimeSpace,
    DateTimeT,
    Rfc3339,
}

impl DateFormatHint {
    const ALL: [Self; 5] = [
        Self::Iso,
        Self::DateTimeSpace,
        Self::DateTimeT,
        Self::Rfc3339,
        Self::Slashed,
    ];

    fn parse(self, raw: &str) -> Option<NaiveDate> {
        match self {
            Self::Iso => NaiveDate::parse_from_str(raw, DATE_FORMAT_ISO).ok(),
            Self::Slashed => NaiveDate::parse_from_str(raw, DATE_FORMAT_SLASHED).ok(),
            Self::DateTimeSpace => NaiveDateTime::parse_from_str(raw, DATETIME_FORMAT_SPACE)
                .ok()
                .map(|dt| dt.date()),
            Self::DateTimeT => NaiveDateTime::parse_from_str(raw, DATETIME_FORMAT_T)
                .ok()
                .map(|dt| dt.date()),
            Self::Rfc3339 => DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|dt| dt.date_naive()),
        }
    }
}

/// Строка CSV региона; `lat`/`lon` нужны только карте.
#[derive(Debug, Deserialize)]
struct CsvRow {
    date: String,
    ndvi: Option<f64>,
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    lon: Option<f64>,
}

/// Одно наблюдение индекса. Пустая ячейка `ndvi` хранится как NaN.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ObservedPoint {
    pub date: NaiveDate,
    pub value: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

/// Ряд региона, отсортированный по дате (дубликаты дат допускаются).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Series {
    pub points: Vec<ObservedPoint>,
    pub coordinates: Vec<Coordinate>,
}

impl Series {
    pub fn from_points(mut points: Vec<ObservedPoint>) -> Self {
        points.sort_by_key(|point| point.date);
        Self {
            points,
            coordinates: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.points.last().map(|point| point.date)
    }

    pub fn missing_values(&self) -> usize {
        self.points
            .iter()
            .filter(|point| !point.value.is_finite())
            .count()
    }
}

/// Центр облака координат для карты.
pub fn centroid(coordinates: &[Coordinate]) -> Option<Coordinate> {
    if coordinates.is_empty() {
        return None;
    }
    let count = coordinates.len() as f64;
    let (lat, lon) = coordinates
        .iter()
        .fold((0.0, 0.0), |(lat, lon), c| (lat + c.lat, lon + c.lon));
    Some(Coordinate {
        lat: lat / count,
        lon: lon / count,
    })
}

/// Читает CSV региона с диска. Файл закрывается до возврата.
pub fn load_series(csv_path: &Path) -> Result<Series, LoadError> {
    let file = File::open(csv_path).map_err(|source| LoadError::Io {
        path: csv_path.to_path_buf(),
        source,
    })?;
    parse_series(file, csv_path)
}

/// Разбирает CSV из произвольного источника; `origin` используется только в ошибках.
pub fn parse_series<R: Read>(input: R, origin: &Path) -> Result<Series, LoadError> {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(input);
    let mut hint = None;
    let mut points = Vec::new();
    let mut coordinates = Vec::new();

    for row in reader.deserialize::<CsvRow>() {
        let row = row.map_err(|source| LoadError::Csv {
            path: origin.to_path_buf(),
            source,
        })?;
        let date = parse_date_with_hint(&row.date, &mut hint).map_err(|reason| LoadError::Date {
            path: origin.to_path_buf(),
            raw: row.date.clone(),
            reason,
        })?;
        points.push(ObservedPoint {
            date,
            value: row.ndvi.unwrap_or(f64::NAN),
        });
        if let (Some(lat), Some(lon)) = (row.lat, row.lon) {
            coordinates.push(Coordinate { lat, lon });
        }
    }

    if points.is_empty() {
        return Err(LoadError::EmptySeries {
            path: origin.to_path_buf(),
        });
    }

    let mut series = Series::from_points(points);
    series.coordinates = coordinates;
    let missing = series.missing_values();
    if missing > 0 {
        tracing::warn!(
            path = %origin.display(),
            missing,
            "Series contains empty ndvi cells"
        );
    }
    Ok(series)
}

/// Парсит дату; удачный формат запоминается и пробуется первым для следующих строк.
fn parse_date_with_hint(
    raw: &str,
    hint: &mut Option<DateFormatHint>,
) -> Result<NaiveDate, &'static str> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ERROR_EMPTY_DATE);
    }

    if let Some(known) = *hint
        && let Some(parsed) = known.parse(trimmed)
    {
        return Ok(parsed);
    }

    for candidate in DateFormatHint::ALL {
        if let Some(parsed) = candidate.parse(trimmed) {
            *hint = Some(candidate);
            return Ok(parsed);
        }
    }

    Err(ERROR_UNRECOGNIZED_DATE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(text: &str) -> Result<Series, LoadError> {
        parse_series(text.as_bytes(), Path::new("inline.csv"))
    }

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn sorts_rows_by_date() {
        let series = parse("date,ndvi\n2023-02-02,0.5\n2023-01-01,0.4\n2023-01-17,0.45\n").unwrap();
        let dates: Vec<_> = series.points.iter().map(|p| p.date).collect();
        assert_eq!(dates, vec![ymd(2023, 1, 1), ymd(2023, 1, 17), ymd(2023, 2, 2)]);
        assert_eq!(series.last_date(), Some(ymd(2023, 2, 2)));
    }

    #[test]
    fn accepts_mixed_date_formats() {
        let series = parse(
            "date,ndvi\n2023-01-01,0.1\n2023-01-17 00:00:00,0.2\n2023-02-02T00:00:00,0.3\n2023/02/18,0.4\n",
        )
        .unwrap();
        assert_eq!(series.len(), 4);
        assert_eq!(series.points[3].date, ymd(2023, 2, 18));
    }

    #[test]
    fn empty_ndvi_cell_is_missing_value() {
        let series = parse("date,ndvi\n2023-01-01,0.1\n2023-01-17,\n").unwrap();
        assert!(series.points[1].value.is_nan());
        assert_eq!(series.missing_values(), 1);
    }

    #[test]
    fn collects_coordinates_when_present() {
        let series = parse(
            "date,ndvi,lat,lon\n2023-01-01,0.1,23.0,77.0\n2023-01-17,0.2,,77.5\n2023-02-02,0.3,24.0,78.0\n",
        )
        .unwrap();
        assert_eq!(series.coordinates.len(), 2);
        let centroid = centroid(&series.coordinates).unwrap();
        approx::assert_abs_diff_eq!(centroid.lat, 23.5);
        approx::assert_abs_diff_eq!(centroid.lon, 77.5);
    }

    #[test]
    fn no_coordinates_without_columns() {
        let series = parse("date,ndvi\n2023-01-01,0.1\n").unwrap();
        assert!(centroid(&series.coordinates).is_none());
    }

    #[test]
    fn rejects_unparseable_date() {
        let err = parse("date,ndvi\nyesterday,0.1\n").unwrap_err();
        assert!(matches!(err, LoadError::Date { reason, .. } if reason == ERROR_UNRECOGNIZED_DATE));
    }

    #[test]
    fn rejects_non_numeric_ndvi() {
        let err = parse("date,ndvi\n2023-01-01,green\n").unwrap_err();
        assert!(matches!(err, LoadError::Csv { .. }));
    }

    #[test]
    fn rejects_empty_file() {
        let err = parse("date,ndvi\n").unwrap_err();
        assert!(matches!(err, LoadError::EmptySeries { .. }));
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_series(&dir.path().join("absent.csv")).unwrap_err();
        assert!(matches!(err, LoadError::Io { .. }));
    }

    #[test]
    fn loads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "date,ndvi").unwrap();
        writeln!(file, "2024-03-01,0.61").unwrap();
        let series = load_series(file.path()).unwrap();
        assert_eq!(series.points, vec![ObservedPoint { date: ymd(2024, 3, 1), value: 0.61 }]);
    }
}
