//! Центрированное скользящее среднее.

use crate::constants::{SMOOTH_MIN_PERIODS, SMOOTH_WINDOW};

/// Скользящее среднее с центрированным окном, обрезанным у краёв ряда.
///
/// Нечисловые значения (NaN) в окне пропускаются; позиция получает `None`,
/// если в окне меньше `min_periods` валидных значений.
pub fn centered_moving_average(
    values: &[f64],
    window: usize,
    min_periods: usize,
) -> Vec<Option<f64>> {
    if window == 0 || values.is_empty() {
        return vec![None; values.len()];
    }
    let radius = window / 2;

    (0..values.len())
        .map(|idx| {
            let start = idx.saturating_sub(radius);
            let end = (idx + radius).min(values.len() - 1);
            let (sum, count) = values[start..=end]
                .iter()
                .filter(|value| value.is_finite())
                .fold((0.0, 0usize), |(sum, count), value| (sum + value, count + 1));
            (count >= min_periods.max(1)).then(|| sum / count as f64)
        })
        .collect()
}

/// Сглаживание с параметрами конвейера (окно 3, минимум 1 точка).
pub fn smooth(values: &[f64]) -> Vec<Option<f64>> {
    centered_moving_average(values, SMOOTH_WINDOW, SMOOTH_MIN_PERIODS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    #[test]
    fn edges_use_shrunken_window() {
        let out = smooth(&[1.0, 2.0, 6.0, 3.0]);
        assert_relative_eq!(out[0].unwrap(), 1.5);
        assert_relative_eq!(out[1].unwrap(), 3.0);
        assert_relative_eq!(out[2].unwrap(), 11.0 / 3.0);
        assert_relative_eq!(out[3].unwrap(), 4.5);
    }

    #[test]
    fn single_value_is_kept() {
        assert_eq!(smooth(&[0.42]), vec![Some(0.42)]);
    }

    #[test]
    fn empty_input_gives_empty_output() {
        assert!(smooth(&[]).is_empty());
    }

    #[test]
    fn missing_values_are_skipped() {
        let out = smooth(&[0.2, f64::NAN, 0.4]);
        assert_relative_eq!(out[0].unwrap(), 0.2);
        assert_relative_eq!(out[1].unwrap(), 0.3);
        assert_relative_eq!(out[2].unwrap(), 0.4);
    }

    #[test]
    fn window_without_valid_samples_is_undefined() {
        let out = smooth(&[f64::NAN, f64::NAN, f64::NAN, 0.5]);
        assert_eq!(out[0], None);
        assert_eq!(out[1], None);
        assert_relative_eq!(out[2].unwrap(), 0.5);
    }

    #[test]
    fn min_periods_can_reject_edges() {
        let out = centered_moving_average(&[1.0, 2.0, 3.0, 4.0, 5.0], 5, 3);
        assert_eq!(out[0], Some(2.0));
        assert_eq!(out[1], Some(2.5));
        assert_eq!(out[2], Some(3.0));
        let strict = centered_moving_average(&[1.0, 2.0, 3.0, 4.0, 5.0], 5, 4);
        assert_eq!(strict[0], None);
        assert_eq!(strict[1], Some(2.5));
    }

    proptest! {
        #[test]
        fn output_stays_within_window_bounds(values in prop::collection::vec(-1.0..1.0_f64, 1..120)) {
            let out = smooth(&values);
            prop_assert_eq!(out.len(), values.len());
            for (idx, smoothed) in out.iter().enumerate() {
                let start = idx.saturating_sub(1);
                let end = (idx + 1).min(values.len() - 1);
                let window = &values[start..=end];
                let lo = window.iter().copied().fold(f64::INFINITY, f64::min);
                let hi = window.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let smoothed = smoothed.expect("finite input is always defined");
                prop_assert!(smoothed >= lo - 1e-12 && smoothed <= hi + 1e-12);
            }
        }

        #[test]
        fn smoothing_is_deterministic(values in prop::collection::vec(0.0..1.0_f64, 1..60)) {
            let once: Vec<f64> = smooth(&values).into_iter().flatten().collect();
            let twice_a = smooth(&once);
            let twice_b = smooth(&once);
            prop_assert_eq!(twice_a, twice_b);
        }
    }
}
