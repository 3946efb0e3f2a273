//! Поиск локальных максимумов с порогом высоты и минимальным расстоянием.

use std::cmp::Ordering;

use crate::constants::{PEAK_MIN_DISTANCE, PEAK_MIN_HEIGHT};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PeakCriteria {
    pub min_height: f64,
    pub min_distance: usize,
}

impl Default for PeakCriteria {
    fn default() -> Self {
        Self {
            min_height: PEAK_MIN_HEIGHT,
            min_distance: PEAK_MIN_DISTANCE,
        }
    }
}

/// Возвращает отсортированные индексы пиков.
///
/// Пик строго больше обоих соседей (края и плато пиками не бывают) и не ниже порога.
/// Кандидаты просматриваются по убыванию высоты (при равенстве раньше идёт меньший
/// индекс); оставленный пик гасит всех живых кандидатов ближе `min_distance`.
pub fn find_peaks(values: &[f64], criteria: PeakCriteria) -> Vec<usize> {
    let mut candidates = local_maxima(values)
        .into_iter()
        .filter(|&idx| values[idx] >= criteria.min_height)
        .collect::<Vec<_>>();

    if criteria.min_distance > 1 && candidates.len() > 1 {
        candidates = suppress_close(values, &candidates, criteria.min_distance);
    }
    candidates
}

fn local_maxima(values: &[f64]) -> Vec<usize> {
    if values.len() < 3 {
        return Vec::new();
    }
    (1..values.len() - 1)
        .filter(|&idx| values[idx] > values[idx - 1] && values[idx] > values[idx + 1])
        .collect()
}

fn suppress_close(values: &[f64], candidates: &[usize], min_distance: usize) -> Vec<usize> {
    let mut order = (0..candidates.len()).collect::<Vec<_>>();
    // Стабильная сортировка: при равных высотах первым остаётся более ранний пик.
    order.sort_by(|&left, &right| {
        values[candidates[right]]
            .partial_cmp(&values[candidates[left]])
            .unwrap_or(Ordering::Equal)
    });

    let mut alive = vec![true; candidates.len()];
    for &pos in &order {
        if !alive[pos] {
            continue;
        }
        let peak = candidates[pos];
        // Кандидаты отсортированы по индексу, поэтому соседей ищем в обе стороны до первого дальнего.
        for left in (0..pos).rev() {
            if peak - candidates[left] >= min_distance {
                break;
            }
            alive[left] = false;
        }
        for right in pos + 1..candidates.len() {
            if candidates[right] - peak >= min_distance {
                break;
            }
            alive[right] = false;
        }
    }

    candidates
        .iter()
        .zip(alive)
        .filter_map(|(&idx, keep)| keep.then_some(idx))
        .collect()
}

/// Поиск пиков с фиксированными параметрами конвейера.
pub fn find_blooms(values: &[f64]) -> Vec<usize> {
    find_peaks(values, PeakCriteria::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn greater_peak_suppresses_close_neighbour() {
        let values = [0.2, 0.3, 0.9, 0.3, 0.2, 0.2, 0.3, 0.85, 0.3, 0.2];
        assert_eq!(find_blooms(&values), vec![2]);
    }

    #[test]
    fn later_peak_wins_when_higher() {
        let values = [0.2, 0.3, 0.85, 0.3, 0.2, 0.2, 0.3, 0.9, 0.3, 0.2];
        assert_eq!(find_blooms(&values), vec![7]);
    }

    #[test]
    fn distant_peaks_are_both_kept() {
        let mut values = vec![0.2; 20];
        values[3] = 0.7;
        values[11] = 0.65;
        assert_eq!(find_blooms(&values), vec![3, 11]);
    }

    #[test]
    fn tie_keeps_earlier_index() {
        let mut values = vec![0.1; 12];
        values[2] = 0.8;
        values[6] = 0.8;
        assert_eq!(find_blooms(&values), vec![2]);
    }

    #[test]
    fn suppression_cascades() {
        // 10 гасит 4 и 16; 22 остаётся, хотя его сосед 16 уже выбыл.
        let mut values = vec![0.1; 30];
        values[4] = 0.8;
        values[10] = 0.95;
        values[16] = 0.85;
        values[22] = 0.7;
        assert_eq!(find_blooms(&values), vec![10, 22]);
    }

    #[test]
    fn below_threshold_yields_nothing() {
        let values = [0.1, 0.5, 0.2, 0.55, 0.1, 0.59, 0.3];
        assert!(find_blooms(&values).is_empty());
    }

    #[test]
    fn height_threshold_is_inclusive() {
        let values = [0.1, 0.6, 0.1];
        assert_eq!(find_blooms(&values), vec![1]);
    }

    #[test]
    fn plateaus_and_edges_are_not_peaks() {
        assert!(find_blooms(&[0.9, 0.2, 0.1]).is_empty());
        assert!(find_blooms(&[0.1, 0.2, 0.9]).is_empty());
        assert!(find_blooms(&[0.1, 0.8, 0.8, 0.1]).is_empty());
    }

    #[test]
    fn short_and_empty_inputs() {
        assert!(find_blooms(&[]).is_empty());
        assert!(find_blooms(&[0.9]).is_empty());
        assert!(find_blooms(&[0.7, 0.9]).is_empty());
    }

    #[test]
    fn nan_neighbours_never_form_peaks() {
        assert!(find_blooms(&[0.1, f64::NAN, 0.1]).is_empty());
        assert!(find_blooms(&[f64::NAN, 0.9, 0.1]).is_empty());
    }

    #[test]
    fn distance_one_disables_suppression() {
        let values = [0.1, 0.7, 0.1, 0.8, 0.1];
        let criteria = PeakCriteria {
            min_height: 0.0,
            min_distance: 1,
        };
        assert_eq!(find_peaks(&values, criteria), vec![1, 3]);
    }

    proptest! {
        #[test]
        fn peaks_are_strict_maxima_above_threshold(values in prop::collection::vec(0.0..1.0_f64, 0..200)) {
            for idx in find_blooms(&values) {
                prop_assert!(idx > 0 && idx + 1 < values.len());
                prop_assert!(values[idx] > values[idx - 1]);
                prop_assert!(values[idx] > values[idx + 1]);
                prop_assert!(values[idx] >= PEAK_MIN_HEIGHT);
            }
        }

        #[test]
        fn peaks_respect_min_distance(values in prop::collection::vec(0.0..1.0_f64, 0..200)) {
            let peaks = find_blooms(&values);
            for pair in peaks.windows(2) {
                prop_assert!(pair[1] - pair[0] >= PEAK_MIN_DISTANCE);
            }
        }
    }
}
