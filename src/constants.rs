//! Общие константы: форматы дат и фиксированные параметры конвейера.

pub const DATE_FORMAT: &str = "%Y-%m-%d";
/// Формат даты в экспортируемых таблицах (день/месяц/год).
pub const EXPORT_DATE_FORMAT: &str = "%d/%m/%Y";

pub const SMOOTH_WINDOW: usize = 3;
pub const SMOOTH_MIN_PERIODS: usize = 1;
/// Минимальная высота пика NDVI, чтобы считать его цветением.
pub const PEAK_MIN_HEIGHT: f64 = 0.6;
/// Минимальное расстояние между пиками (в позициях ряда, не в днях).
pub const PEAK_MIN_DISTANCE: usize = 8;
pub const FORECAST_PERIODS: usize = 12;
pub const FORECAST_STEP_DAYS: i64 = 16;
/// Сколько ближайших прогнозных пиков показывать в отчёте.
pub const FUTURE_PEAKS_SHOWN: usize = 5;
