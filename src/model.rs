//! Прогнозная модель: кусочно-линейный тренд плюс годовая сезонность (ряд Фурье).
//!
//! Параметры ищутся как MAP-оценка с априорными распределениями на скорость тренда,
//! её изломы, коэффициенты сезонности и шум наблюдений. Оптимизация: L-BFGS из `argmin`.

use std::f64::consts::PI;
use std::time::Instant;

use argmin::core::{CostFunction, Error as ArgminError, Executor, Gradient, State};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use chrono::{Duration, NaiveDate};
use serde::Serialize;

use crate::error::FitError;

const DEFAULT_MAX_ITERS: u64 = 1000;
const DEFAULT_HISTORY: usize = 10;
const DEFAULT_TOL_GRAD: f64 = 1e-8;
const DEFAULT_TOL_COST: f64 = 1e-12;

const YEAR_DAYS: f64 = 365.25;
const YEARLY_ORDER: usize = 10;
const N_CHANGEPOINTS: usize = 25;
const CHANGEPOINT_RANGE: f64 = 0.8;
const CHANGEPOINT_PRIOR_SCALE: f64 = 0.05;
const SEASONALITY_PRIOR_SCALE: f64 = 10.0;
const BASE_PRIOR_SCALE: f64 = 5.0;
const SIGMA_PRIOR_SCALE: f64 = 0.5;
const LAPLACE_EPS: f64 = 1e-3;
/// Нижняя граница шума (в масштабированных единицах), иначе MAP вырождается при точной подгонке.
const SIGMA_FLOOR: f64 = 1e-2;
const LOG_SIGMA_LIMIT: f64 = 30.0;
const LARGE_COST: f64 = 1e30;
const MIN_OBSERVATIONS: usize = 2;

// Раскладка вектора параметров: [k, m, ln σ, δ.., β..].
const IDX_K: usize = 0;
const IDX_M: usize = 1;
const IDX_LOG_SIGMA: usize = 2;
const IDX_DELTAS: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OptimizerConfig {
    pub max_iters: u64,
    pub history: usize,
    pub tol_grad: f64,
    pub tol_cost: f64,
    /// Момент, после которого оптимизатор прерывается. Из файла не читается,
    /// выставляется вызывающей стороной.
    pub deadline: Option<Instant>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_iters: DEFAULT_MAX_ITERS,
            history: DEFAULT_HISTORY,
            tol_grad: DEFAULT_TOL_GRAD,
            tol_cost: DEFAULT_TOL_COST,
            deadline: None,
        }
    }
}

/// Точка прогноза (значения в исходных единицах NDVI).
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ForecastPoint {
    pub date: NaiveDate,
    pub yhat: f64,
    pub trend: f64,
    pub seasonal: f64,
}

/// Прогноз: ретро-прогноз по датам истории плюс будущие шаги.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Forecast {
    pub points: Vec<ForecastPoint>,
    pub last_observed: NaiveDate,
}

impl Forecast {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn yhat(&self) -> Vec<f64> {
        self.points.iter().map(|point| point.yhat).collect()
    }

    /// Только точки после последнего наблюдения.
    pub fn future(&self) -> impl Iterator<Item = &ForecastPoint> {
        self.points
            .iter()
            .filter(move |point| point.date > self.last_observed)
    }
}

#[derive(Clone, Debug)]
pub struct SeasonalTrendModel {
    k: f64,
    m: f64,
    sigma_obs: f64,
    changepoints: Vec<f64>,
    deltas: Vec<f64>,
    beta: Vec<f64>,
    start: NaiveDate,
    span_days: f64,
    y_scale: f64,
    history_dates: Vec<NaiveDate>,
}

pub fn train_from_series(
    dates: &[NaiveDate],
    values: &[f64],
    config: OptimizerConfig,
) -> Result<SeasonalTrendModel, FitError> {
    if dates.len() != values.len() || values.len() < MIN_OBSERVATIONS {
        return Err(FitError::InsufficientData {
            needed: MIN_OBSERVATIONS,
            got: dates.len().min(values.len()),
        });
    }
    if let Some(index) = values.iter().position(|value| !value.is_finite()) {
        return Err(FitError::NonFinite { index });
    }

    let start = dates.iter().min().copied().ok_or(FitError::InsufficientData {
        needed: MIN_OBSERVATIONS,
        got: 0,
    })?;
    let end = dates.iter().max().copied().unwrap_or(start);
    if start == end {
        return Err(FitError::SingleTimestamp);
    }
    let span_days = (end - start).num_days() as f64;

    let max_abs = values.iter().fold(0.0_f64, |acc, value| acc.max(value.abs()));
    let y_scale = if max_abs > 0.0 { max_abs } else { 1.0 };
    let y: Vec<f64> = values.iter().map(|value| value / y_scale).collect();
    let t: Vec<f64> = dates
        .iter()
        .map(|date| scaled_time(*date, start, span_days))
        .collect();
    let features: Vec<Vec<f64>> = dates.iter().map(|date| fourier_features(*date)).collect();
    let changepoints = changepoint_positions(&t);

    let init = initial_params(&t, &y, changepoints.len());
    let problem = SeasonalTrendProblem {
        t,
        y,
        features,
        changepoints: changepoints.clone(),
        deadline: config.deadline,
    };
    let linesearch = MoreThuenteLineSearch::new()
        .with_c(1e-4, 0.9)
        .map_err(optimizer_error)?;
    let solver = LBFGS::new(linesearch, config.history)
        .with_tolerance_grad(config.tol_grad)
        .map_err(optimizer_error)?
        .with_tolerance_cost(config.tol_cost)
        .map_err(optimizer_error)?;

    let result = Executor::new(problem, solver)
        .configure(|state| state.param(init).max_iters(config.max_iters))
        .run()
        .map_err(|err| {
            if deadline_passed(config.deadline) {
                FitError::DeadlineExceeded
            } else {
                optimizer_error(err)
            }
        })?;

    let best = result
        .state
        .get_best_param()
        .or_else(|| result.state.get_param())
        .ok_or_else(|| FitError::Optimizer("no parameters returned from optimizer".into()))?
        .clone();
    if let Some(index) = best.iter().position(|value| !value.is_finite()) {
        return Err(FitError::Optimizer(format!(
            "optimizer diverged at parameter {index}"
        )));
    }
    tracing::debug!(
        iterations = result.state.get_iter(),
        cost = result.state.get_best_cost(),
        changepoints = changepoints.len(),
        "Seasonal trend model fitted"
    );

    let n_deltas = changepoints.len();
    let mut history_dates = dates.to_vec();
    history_dates.sort_unstable();
    history_dates.dedup();

    Ok(SeasonalTrendModel {
        k: best[IDX_K],
        m: best[IDX_M],
        sigma_obs: noise_variance(best[IDX_LOG_SIGMA]).sqrt(),
        changepoints,
        deltas: best[IDX_DELTAS..IDX_DELTAS + n_deltas].to_vec(),
        beta: best[IDX_DELTAS + n_deltas..].to_vec(),
        start,
        span_days,
        y_scale,
        history_dates,
    })
}

impl SeasonalTrendModel {
    /// Прогноз по всем (уникальным) датам истории и `periods` шагам по `step_days` дней вперёд.
    pub fn forecast(&self, periods: usize, step_days: i64) -> Forecast {
        let last_observed = self.history_dates.last().copied().unwrap_or(self.start);
        let future = (1..=periods).map(|step| last_observed + Duration::days(step_days * step as i64));
        let points = self
            .history_dates
            .iter()
            .copied()
            .chain(future)
            .map(|date| self.predict(date))
            .collect();

        Forecast {
            points,
            last_observed,
        }
    }

    pub fn predict(&self, date: NaiveDate) -> ForecastPoint {
        let t = scaled_time(date, self.start, self.span_days);
        let trend = trend_at(t, self.k, self.m, &self.changepoints, &self.deltas);
        let seasonal = dot(&fourier_features(date), &self.beta);
        ForecastPoint {
            date,
            yhat: (trend + seasonal) * self.y_scale,
            trend: trend * self.y_scale,
            seasonal: seasonal * self.y_scale,
        }
    }

    /// Оценка шума наблюдений в исходных единицах.
    pub fn noise_scale(&self) -> f64 {
        self.sigma_obs * self.y_scale
    }
}

struct SeasonalTrendProblem {
    t: Vec<f64>,
    y: Vec<f64>,
    features: Vec<Vec<f64>>,
    changepoints: Vec<f64>,
    deadline: Option<Instant>,
}

impl SeasonalTrendProblem {
    fn split<'a>(&self, param: &'a [f64]) -> (f64, f64, f64, &'a [f64], &'a [f64]) {
        let n_deltas = self.changepoints.len();
        let log_sigma = param[IDX_LOG_SIGMA].clamp(-LOG_SIGMA_LIMIT, LOG_SIGMA_LIMIT);
        (
            param[IDX_K],
            param[IDX_M],
            log_sigma,
            &param[IDX_DELTAS..IDX_DELTAS + n_deltas],
            &param[IDX_DELTAS + n_deltas..],
        )
    }

    fn n_params(&self) -> usize {
        IDX_DELTAS + self.changepoints.len() + 2 * YEARLY_ORDER
    }

    fn residuals(&self, k: f64, m: f64, deltas: &[f64], beta: &[f64]) -> Vec<f64> {
        self.t
            .iter()
            .zip(&self.y)
            .zip(&self.features)
            .map(|((&t, &y), row)| y - trend_at(t, k, m, &self.changepoints, deltas) - dot(row, beta))
            .collect()
    }
}

impl CostFunction for SeasonalTrendProblem {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, param: &Self::Param) -> Result<Self::Output, ArgminError> {
        // Каждый шаг линейного поиска проходит через cost, здесь и прерываемся.
        if deadline_passed(self.deadline) {
            return Err(ArgminError::msg("deadline exceeded"));
        }
        if param.len() != self.n_params() {
            return Ok(LARGE_COST);
        }
        let (k, m, log_sigma, deltas, beta) = self.split(param);
        let sigma2 = noise_variance(log_sigma);
        let sum_sq: f64 = self
            .residuals(k, m, deltas, beta)
            .iter()
            .map(|r| r * r)
            .sum();
        let n = self.y.len() as f64;

        let base_var = BASE_PRIOR_SCALE * BASE_PRIOR_SCALE;
        let season_var = SEASONALITY_PRIOR_SCALE * SEASONALITY_PRIOR_SCALE;
        let eps2 = LAPLACE_EPS * LAPLACE_EPS;
        let mut cost = (0.5 * n).mul_add(sigma2.ln(), sum_sq / (2.0 * sigma2));
        cost += (k * k + m * m) / (2.0 * base_var);
        cost += sigma2 / (2.0 * SIGMA_PRIOR_SCALE * SIGMA_PRIOR_SCALE);
        cost += deltas
            .iter()
            .map(|d| d.mul_add(*d, eps2).sqrt() / CHANGEPOINT_PRIOR_SCALE)
            .sum::<f64>();
        cost += beta.iter().map(|b| b * b).sum::<f64>() / (2.0 * season_var);

        Ok(if cost.is_finite() { cost } else { LARGE_COST })
    }
}

impl Gradient for SeasonalTrendProblem {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, param: &Self::Param) -> Result<Self::Gradient, ArgminError> {
        if param.len() != self.n_params() {
            return Ok(vec![0.0; param.len()]);
        }
        let (k, m, log_sigma, deltas, beta) = self.split(param);
        let sigma2 = noise_variance(log_sigma);
        let inv_sigma2 = 1.0 / sigma2;
        let residuals = self.residuals(k, m, deltas, beta);
        let n_deltas = deltas.len();
        let beta_offset = IDX_DELTAS + n_deltas;

        let mut grad = vec![0.0; param.len()];
        let mut sum_sq = 0.0;
        for ((&t, &r), row) in self.t.iter().zip(&residuals).zip(&self.features) {
            let w = -r * inv_sigma2;
            sum_sq += r * r;
            grad[IDX_K] += w * t;
            grad[IDX_M] += w;
            for (j, &s) in self.changepoints.iter().enumerate() {
                if t >= s {
                    grad[IDX_DELTAS + j] += w * (t - s);
                }
            }
            for (l, &x) in row.iter().enumerate() {
                grad[beta_offset + l] += w * x;
            }
        }

        let base_var = BASE_PRIOR_SCALE * BASE_PRIOR_SCALE;
        let season_var = SEASONALITY_PRIOR_SCALE * SEASONALITY_PRIOR_SCALE;
        let eps2 = LAPLACE_EPS * LAPLACE_EPS;
        grad[IDX_K] += k / base_var;
        grad[IDX_M] += m / base_var;
        if param[IDX_LOG_SIGMA].abs() <= LOG_SIGMA_LIMIT {
            let n = self.y.len() as f64;
            grad[IDX_LOG_SIGMA] = (2.0 * log_sigma).exp()
                * (sum_sq.mul_add(-inv_sigma2 * inv_sigma2, n * inv_sigma2)
                    + 1.0 / (SIGMA_PRIOR_SCALE * SIGMA_PRIOR_SCALE));
        }
        for (j, d) in deltas.iter().enumerate() {
            grad[IDX_DELTAS + j] += d / (d.mul_add(*d, eps2).sqrt() * CHANGEPOINT_PRIOR_SCALE);
        }
        for (l, b) in beta.iter().enumerate() {
            grad[beta_offset + l] += b / season_var;
        }
        Ok(grad)
    }
}

fn noise_variance(log_sigma: f64) -> f64 {
    let log_sigma = log_sigma.clamp(-LOG_SIGMA_LIMIT, LOG_SIGMA_LIMIT);
    SIGMA_FLOOR.mul_add(SIGMA_FLOOR, (2.0 * log_sigma).exp())
}

fn deadline_passed(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|deadline| Instant::now() >= deadline)
}

fn optimizer_error(err: ArgminError) -> FitError {
    FitError::Optimizer(err.to_string())
}

fn scaled_time(date: NaiveDate, start: NaiveDate, span_days: f64) -> f64 {
    (date - start).num_days() as f64 / span_days
}

/// Годовые гармоники [sin 1, cos 1, sin 2, cos 2, ...] по дням от 1970-01-01.
fn fourier_features(date: NaiveDate) -> Vec<f64> {
    let days = date.signed_duration_since(NaiveDate::default()).num_days() as f64;
    (1..=YEARLY_ORDER)
        .flat_map(|order| {
            let angle = 2.0 * PI * order as f64 * days / YEAR_DAYS;
            [angle.sin(), angle.cos()]
        })
        .collect()
}

/// Изломы тренда равномерно по первым 80% строк истории (без первой точки).
fn changepoint_positions(t: &[f64]) -> Vec<f64> {
    let hist_size = (t.len() as f64 * CHANGEPOINT_RANGE).floor() as usize;
    let count = N_CHANGEPOINTS.min(hist_size.saturating_sub(1));
    if count == 0 {
        return Vec::new();
    }
    let last = (hist_size - 1) as f64;
    (1..=count)
        .map(|i| {
            let idx = (i as f64 * last / count as f64).round_ties_even() as usize;
            t[idx]
        })
        .collect()
}

fn trend_at(t: f64, k: f64, m: f64, changepoints: &[f64], deltas: &[f64]) -> f64 {
    let (rate, offset) = changepoints
        .iter()
        .zip(deltas)
        .filter(|(s, _)| t >= **s)
        .fold((k, m), |(rate, offset), (s, d)| (rate + d, (-s).mul_add(*d, offset)));
    rate.mul_add(t, offset)
}

fn dot(left: &[f64], right: &[f64]) -> f64 {
    left.iter().zip(right).map(|(a, b)| a * b).sum()
}

/// Старт: прямая через первую и последнюю точку, нулевые изломы и сезонность, σ = 1.
fn initial_params(t: &[f64], y: &[f64], n_deltas: usize) -> Vec<f64> {
    let first = (0..t.len())
        .min_by(|&a, &b| t[a].total_cmp(&t[b]))
        .unwrap_or_default();
    let last = (0..t.len())
        .max_by(|&a, &b| t[a].total_cmp(&t[b]))
        .unwrap_or_default();
    let dt = t[last] - t[first];
    let k = if dt > 0.0 { (y[last] - y[first]) / dt } else { 0.0 };
    let m = (-k).mul_add(t[first], y[first]);

    let mut init = vec![0.0; IDX_DELTAS + n_deltas + 2 * YEARLY_ORDER];
    init[IDX_K] = k;
    init[IDX_M] = m;
    init
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn seasonal_history(count: usize) -> (Vec<NaiveDate>, Vec<f64>) {
        let start = ymd(2019, 1, 1);
        let dates: Vec<_> = (0..count)
            .map(|i| start + Duration::days(16 * i as i64))
            .collect();
        // Детерминированный «шум», чтобы подгонка не была точной.
        let values = dates
            .iter()
            .enumerate()
            .map(|(i, date)| 0.01f64.mul_add((i as f64 * 12.9898).sin(), truth(*date)))
            .collect();
        (dates, values)
    }

    fn truth(date: NaiveDate) -> f64 {
        let days = date.signed_duration_since(NaiveDate::default()).num_days() as f64;
        0.2f64.mul_add((2.0 * PI * days / YEAR_DAYS).sin(), 0.5)
    }

    #[test]
    fn forecast_extends_history_at_fixed_step() {
        let (dates, values) = seasonal_history(92);
        let model = train_from_series(&dates, &values, OptimizerConfig::default()).unwrap();
        let forecast = model.forecast(12, 16);

        assert_eq!(forecast.len(), dates.len() + 12);
        assert_eq!(forecast.last_observed, *dates.last().unwrap());
        let future: Vec<_> = forecast.future().collect();
        assert_eq!(future.len(), 12);
        assert_eq!(future[0].date, forecast.last_observed + Duration::days(16));
        assert_eq!(future[11].date, forecast.last_observed + Duration::days(16 * 12));
    }

    #[test]
    fn recovers_yearly_cycle() {
        let (dates, values) = seasonal_history(92);
        let model = train_from_series(&dates, &values, OptimizerConfig::default()).unwrap();
        let forecast = model.forecast(12, 16);
        let error = forecast
            .future()
            .map(|point| (point.yhat - truth(point.date)).abs())
            .sum::<f64>()
            / 12.0;
        assert!(error < 0.05, "mean abs error {error}");
        assert!(model.noise_scale() < 0.1);
    }

    #[test]
    fn components_add_up() {
        let (dates, values) = seasonal_history(40);
        let model = train_from_series(&dates, &values, OptimizerConfig::default()).unwrap();
        let point = model.predict(ymd(2021, 6, 1));
        assert_abs_diff_eq!(point.yhat, point.trend + point.seasonal, epsilon = 1e-12);
    }

    #[test]
    fn fitting_is_deterministic() {
        let (dates, values) = seasonal_history(30);
        let first = train_from_series(&dates, &values, OptimizerConfig::default())
            .unwrap()
            .forecast(12, 16);
        let second = train_from_series(&dates, &values, OptimizerConfig::default())
            .unwrap()
            .forecast(12, 16);
        assert_eq!(first, second);
    }

    #[test]
    fn duplicate_dates_appear_once_in_forecast() {
        let dates = vec![ymd(2022, 1, 1), ymd(2022, 1, 1), ymd(2022, 1, 17), ymd(2022, 2, 2)];
        let values = vec![0.4, 0.42, 0.5, 0.6];
        let forecast = train_from_series(&dates, &values, OptimizerConfig::default())
            .unwrap()
            .forecast(3, 16);
        assert_eq!(forecast.len(), 3 + 3);
    }

    #[test]
    fn expired_deadline_stops_the_fit() {
        let (dates, values) = seasonal_history(30);
        let config = OptimizerConfig {
            deadline: Some(Instant::now()),
            ..OptimizerConfig::default()
        };
        let err = train_from_series(&dates, &values, config).unwrap_err();
        assert_eq!(err, FitError::DeadlineExceeded);
    }

    #[test]
    fn single_date_is_rejected() {
        let day = ymd(2023, 5, 1);
        let err = train_from_series(&[day, day, day], &[0.5, 0.6, 0.7], OptimizerConfig::default())
            .unwrap_err();
        assert_eq!(err, FitError::SingleTimestamp);
    }

    #[test]
    fn too_few_rows_are_rejected() {
        let err =
            train_from_series(&[ymd(2023, 5, 1)], &[0.5], OptimizerConfig::default()).unwrap_err();
        assert_eq!(err, FitError::InsufficientData { needed: 2, got: 1 });
    }

    #[test]
    fn non_finite_values_are_rejected() {
        let err = train_from_series(
            &[ymd(2023, 5, 1), ymd(2023, 5, 17)],
            &[0.5, f64::NAN],
            OptimizerConfig::default(),
        )
        .unwrap_err();
        assert_eq!(err, FitError::NonFinite { index: 1 });
    }

    #[test]
    fn changepoints_cover_first_part_of_history() {
        let t: Vec<f64> = (0..10).map(|i| f64::from(i) / 9.0).collect();
        let cps = changepoint_positions(&t);
        assert_eq!(cps.len(), 7);
        assert_abs_diff_eq!(cps[0], t[1]);
        assert_abs_diff_eq!(cps[6], t[7]);
        assert!(changepoint_positions(&t[..2]).is_empty());
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let (dates, values) = seasonal_history(20);
        let t: Vec<f64> = dates
            .iter()
            .map(|date| scaled_time(*date, dates[0], (dates[19] - dates[0]).num_days() as f64))
            .collect();
        let problem = SeasonalTrendProblem {
            features: dates.iter().map(|date| fourier_features(*date)).collect(),
            changepoints: changepoint_positions(&t),
            y: values,
            t,
            deadline: None,
        };
        let param: Vec<f64> = (0..problem.n_params())
            .map(|i| 0.05 * ((i % 7) as f64 - 3.0))
            .collect();
        let grad = problem.gradient(&param).unwrap();
        for i in 0..param.len() {
            let step = 1e-6;
            let mut plus = param.clone();
            let mut minus = param.clone();
            plus[i] += step;
            minus[i] -= step;
            let numeric =
                (problem.cost(&plus).unwrap() - problem.cost(&minus).unwrap()) / (2.0 * step);
            assert_abs_diff_eq!(grad[i], numeric, epsilon = 1e-4 * (1.0 + numeric.abs()));
        }
    }
}
