//! Конвейер цветения: сглаживание → пики по истории, затем прогноз → сглаживание → пики.

use chrono::NaiveDate;
use serde::Serialize;

use crate::constants::{FORECAST_PERIODS, FORECAST_STEP_DAYS};
use crate::error::FitError;
use crate::model::{self, Forecast, OptimizerConfig};
use crate::peaks::find_blooms;
use crate::series::Series;
use crate::smooth::smooth;

/// Наблюдение истории с результатом сглаживания и флагом пика.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct AnnotatedPoint {
    pub date: NaiveDate,
    pub ndvi: f64,
    pub ndvi_smooth: Option<f64>,
    pub is_peak: bool,
}

/// Пик: позиция в исходном ряду, дата и значение.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Peak {
    pub index: usize,
    pub date: NaiveDate,
    pub value: f64,
}

/// Прогноз со сглаженными значениями и найденными будущими пиками.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ForecastOutlook {
    pub forecast: Forecast,
    pub yhat_smooth: Vec<Option<f64>>,
    pub future_peaks: Vec<Peak>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outlook {
    Available(ForecastOutlook),
    Unavailable { reason: String },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BloomResult {
    pub history: Vec<AnnotatedPoint>,
    pub peaks: Vec<Peak>,
    pub outlook: Outlook,
}

impl BloomResult {
    pub fn last_observed(&self) -> Option<NaiveDate> {
        self.history.last().map(|point| point.date)
    }

    pub fn forecast(&self) -> Option<&ForecastOutlook> {
        match &self.outlook {
            Outlook::Available(outlook) => Some(outlook),
            Outlook::Unavailable { .. } => None,
        }
    }

    pub fn future_peaks(&self) -> &[Peak] {
        self.forecast()
            .map(|outlook| outlook.future_peaks.as_slice())
            .unwrap_or_default()
    }
}

/// Сглаживает ряд и помечает исторические пики цветения.
pub fn detect_blooms(series: &Series) -> (Vec<AnnotatedPoint>, Vec<usize>) {
    let raw: Vec<f64> = series.points.iter().map(|point| point.value).collect();
    let smoothed = smooth(&raw);
    let dense: Vec<f64> = smoothed
        .iter()
        .map(|value| value.unwrap_or(f64::NAN))
        .collect();
    let peaks = find_blooms(&dense);

    let mut annotated: Vec<AnnotatedPoint> = series
        .points
        .iter()
        .zip(smoothed)
        .map(|(point, ndvi_smooth)| AnnotatedPoint {
            date: point.date,
            ndvi: point.value,
            ndvi_smooth,
            is_peak: false,
        })
        .collect();
    for &idx in &peaks {
        annotated[idx].is_peak = true;
    }
    tracing::debug!(
        points = annotated.len(),
        peaks = peaks.len(),
        "History stage finished"
    );
    (annotated, peaks)
}

/// Прогнозирует продолжение сглаженного ряда и ищет в нём будущие пики.
///
/// Пики ищутся по всему кадру прогноза (ретро-прогноз + будущее) и затем
/// отфильтровываются по дате строго после последнего наблюдения.
pub fn predict_future_blooms(
    annotated: &[AnnotatedPoint],
    config: OptimizerConfig,
) -> Result<ForecastOutlook, FitError> {
    let (dates, values): (Vec<NaiveDate>, Vec<f64>) = annotated
        .iter()
        .filter_map(|point| point.ndvi_smooth.map(|value| (point.date, value)))
        .unzip();
    let fitted = model::train_from_series(&dates, &values, config)?;
    let mut forecast = fitted.forecast(FORECAST_PERIODS, FORECAST_STEP_DAYS);
    // Последнее наблюдение берём из всей истории, включая строки без сглаженного значения.
    if let Some(last) = annotated.iter().map(|point| point.date).max() {
        forecast.last_observed = last;
    }

    let yhat = forecast.yhat();
    let yhat_smooth = smooth(&yhat);
    let dense: Vec<f64> = yhat_smooth
        .iter()
        .map(|value| value.unwrap_or(f64::NAN))
        .collect();
    let future_peaks = find_blooms(&dense)
        .into_iter()
        .map(|idx| Peak {
            index: idx,
            date: forecast.points[idx].date,
            value: forecast.points[idx].yhat,
        })
        .filter(|peak| peak.date > forecast.last_observed)
        .collect::<Vec<_>>();
    tracing::debug!(
        forecast_points = forecast.len(),
        noise = fitted.noise_scale(),
        future_peaks = future_peaks.len(),
        "Forecast stage finished"
    );

    Ok(ForecastOutlook {
        forecast,
        yhat_smooth,
        future_peaks,
    })
}

/// Полный прогон для одного региона. Ошибка обучения модели не прерывает историю.
pub fn run(series: &Series, config: OptimizerConfig) -> BloomResult {
    let (history, peak_indices) = detect_blooms(series);
    let peaks = peak_indices
        .iter()
        .map(|&idx| Peak {
            index: idx,
            date: history[idx].date,
            value: history[idx].ndvi_smooth.unwrap_or(f64::NAN),
        })
        .collect();

    let outlook = match predict_future_blooms(&history, config) {
        Ok(outlook) => Outlook::Available(outlook),
        Err(err) => {
            tracing::warn!(error = %err, "No forecast available");
            Outlook::Unavailable {
                reason: err.to_string(),
            }
        }
    };

    BloomResult {
        history,
        peaks,
        outlook,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::ObservedPoint;
    use chrono::Duration;
    use std::f64::consts::PI;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn series_from(values: &[f64]) -> Series {
        let start = ymd(2020, 1, 1);
        Series::from_points(
            values
                .iter()
                .enumerate()
                .map(|(i, &value)| ObservedPoint {
                    date: start + Duration::days(16 * i as i64),
                    value,
                })
                .collect(),
        )
    }

    /// Четыре года наблюдений с пиком цветения в начале весны.
    fn seasonal_series() -> Series {
        let values: Vec<f64> = (0..92)
            .map(|i| {
                let phase = 2.0 * PI * (16.0 * f64::from(i)) / 365.25;
                let noise = 0.01 * (f64::from(i) * 7.31).sin();
                0.25f64.mul_add(phase.cos(), 0.5) + noise
            })
            .collect();
        series_from(&values)
    }

    #[test]
    fn all_values_below_threshold_flag_nothing() {
        let series = series_from(&[0.2, 0.3, 0.4, 0.5, 0.4, 0.3, 0.2, 0.3, 0.4, 0.5]);
        let (annotated, peaks) = detect_blooms(&series);
        assert!(peaks.is_empty());
        assert_eq!(annotated.len(), 10);
        assert!(annotated.iter().all(|point| !point.is_peak));
    }

    #[test]
    fn history_peaks_are_flagged_on_smoothed_values() {
        let mut values = vec![0.3; 24];
        values[5] = 0.7;
        values[6] = 0.9;
        values[7] = 0.7;
        values[18] = 0.8;
        values[19] = 0.95;
        values[20] = 0.8;
        let (annotated, peaks) = detect_blooms(&series_from(&values));
        assert_eq!(peaks, vec![6, 19]);
        let flagged: Vec<_> = annotated
            .iter()
            .enumerate()
            .filter_map(|(idx, point)| point.is_peak.then_some(idx))
            .collect();
        assert_eq!(flagged, peaks);
        approx::assert_abs_diff_eq!(annotated[6].ndvi_smooth.unwrap(), 2.3 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn input_series_is_not_mutated() {
        let series = seasonal_series();
        let snapshot = series.clone();
        let _ = run(&series, OptimizerConfig::default());
        assert_eq!(series, snapshot);
    }

    #[test]
    fn single_date_history_reports_no_forecast() {
        let day = ymd(2023, 4, 1);
        let series = Series::from_points(vec![
            ObservedPoint { date: day, value: 0.7 },
            ObservedPoint { date: day, value: 0.8 },
        ]);
        let result = run(&series, OptimizerConfig::default());
        assert_eq!(result.history.len(), 2);
        assert!(result.forecast().is_none());
        assert!(result.future_peaks().is_empty());
        assert!(matches!(result.outlook, Outlook::Unavailable { .. }));
        let (annotated, _) = detect_blooms(&series);
        assert_eq!(
            predict_future_blooms(&annotated, OptimizerConfig::default()).unwrap_err(),
            FitError::SingleTimestamp
        );
    }

    #[test]
    fn expired_deadline_keeps_history() {
        let series = seasonal_series();
        let config = OptimizerConfig {
            deadline: Some(std::time::Instant::now()),
            ..OptimizerConfig::default()
        };
        let result = run(&series, config);
        assert!(!result.peaks.is_empty());
        match &result.outlook {
            Outlook::Unavailable { reason } => {
                assert_eq!(reason, &FitError::DeadlineExceeded.to_string());
            }
            Outlook::Available(_) => panic!("forecast must not be produced past the deadline"),
        }
    }

    #[test]
    fn rows_without_smoothed_value_are_dropped_before_fit() {
        let series = series_from(&[f64::NAN, f64::NAN, f64::NAN, 0.5, 0.6]);
        let (annotated, _) = detect_blooms(&series);
        assert_eq!(annotated[0].ndvi_smooth, None);
        let outlook = predict_future_blooms(&annotated, OptimizerConfig::default()).unwrap();
        // 3 даты со сглаженным значением + 12 шагов вперёд.
        assert_eq!(outlook.forecast.len(), 3 + FORECAST_PERIODS);
        assert_eq!(outlook.forecast.last_observed, series.last_date().unwrap());
    }

    #[test]
    fn seasonal_history_yields_consistent_result() {
        let series = seasonal_series();
        let result = run(&series, OptimizerConfig::default());
        let last = result.last_observed().unwrap();

        assert!(!result.peaks.is_empty());
        for peak in &result.peaks {
            assert!(result.history[peak.index].is_peak);
            assert_eq!(result.history[peak.index].date, peak.date);
        }

        let outlook = result.forecast().expect("forecast should be available");
        assert_eq!(outlook.forecast.len(), series.len() + FORECAST_PERIODS);
        assert_eq!(outlook.yhat_smooth.len(), outlook.forecast.len());
        for peak in &outlook.future_peaks {
            assert!(peak.date > last);
            assert_eq!(outlook.forecast.points[peak.index].date, peak.date);
            approx::assert_relative_eq!(outlook.forecast.points[peak.index].yhat, peak.value);
        }
        for pair in outlook.future_peaks.windows(2) {
            assert!(pair[1].index - pair[0].index >= crate::constants::PEAK_MIN_DISTANCE);
        }
    }

    #[test]
    fn pipeline_is_repeatable() {
        let series = seasonal_series();
        let first = run(&series, OptimizerConfig::default());
        let second = run(&series, OptimizerConfig::default());
        assert_eq!(first, second);
    }
}
