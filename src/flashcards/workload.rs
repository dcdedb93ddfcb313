//! Forward simulation of the daily review workload.
//!
//! Items are copied into lightweight review states before simulating, so the
//! real items are never touched.

use chrono::{Days, NaiveDate};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::algorithm::next_state;
use super::models::{Rating, ReviewState};

/// Projected load for one simulated day
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaySummary {
    pub date: NaiveDate,
    /// Reviews resolved on this day
    pub review_count: usize,
    /// New items introduced on this day
    pub new_count: usize,
    pub total_load: usize,
}

/// Project the workload for the next `days` days using the thread RNG.
pub fn project_workload<'a, I>(
    states: I,
    days: u32,
    new_per_day: usize,
    retention_rate: f64,
    today: NaiveDate,
) -> Vec<DaySummary>
where
    I: IntoIterator<Item = &'a ReviewState>,
{
    project_workload_with_rng(
        states,
        days,
        new_per_day,
        retention_rate,
        today,
        &mut rand::thread_rng(),
    )
}

/// Project the workload with a caller-supplied RNG.
///
/// Each day every due review is answered Good with probability
/// `retention_rate` (Again otherwise) using the same transition as a real
/// review, then up to `new_per_day` new items graduate into the review queue.
pub fn project_workload_with_rng<'a, I, R>(
    states: I,
    days: u32,
    new_per_day: usize,
    retention_rate: f64,
    today: NaiveDate,
    rng: &mut R,
) -> Vec<DaySummary>
where
    I: IntoIterator<Item = &'a ReviewState>,
    R: Rng,
{
    let retention_rate = if retention_rate.is_nan() {
        0.0
    } else {
        retention_rate.clamp(0.0, 1.0)
    };

    let (mut new_queue, mut review_queue): (Vec<ReviewState>, Vec<ReviewState>) = states
        .into_iter()
        .filter(|s| !s.suspended)
        .cloned()
        .partition(|s| s.is_new());
    new_queue.reverse();

    let mut summaries = Vec::with_capacity(days as usize);

    for offset in 0..days {
        let Some(date) = today.checked_add_days(Days::new(offset as u64)) else {
            break;
        };

        let mut review_count = 0;
        for state in review_queue.iter_mut().filter(|s| s.due_date <= date) {
            let rating = if rng.gen_bool(retention_rate) {
                Rating::Good
            } else {
                Rating::Again
            };
            *state = next_state(state, rating, date);
            review_count += 1;
        }

        let mut new_count = 0;
        while new_count < new_per_day {
            let Some(state) = new_queue.pop() else {
                break;
            };
            review_queue.push(next_state(&state, Rating::Good, date));
            new_count += 1;
        }

        summaries.push(DaySummary {
            date,
            review_count,
            new_count,
            total_load: review_count + new_count,
        });
    }

    summaries
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, 1).unwrap()
    }

    fn reviewed(due_in: u64, interval: u32) -> ReviewState {
        let mut state = ReviewState::new(today().checked_add_days(Days::new(due_in)).unwrap());
        state.interval = interval;
        state
    }

    #[test]
    fn test_new_items_are_introduced_per_day() {
        let states: Vec<ReviewState> = (0..5).map(|_| ReviewState::new(today())).collect();
        let mut rng = StdRng::seed_from_u64(7);

        let days = project_workload_with_rng(&states, 4, 2, 1.0, today(), &mut rng);

        let new_counts: Vec<usize> = days.iter().map(|d| d.new_count).collect();
        assert_eq!(new_counts, vec![2, 2, 1, 0]);
        // Graduated on day 0 with a 1-day interval, due again on day 1
        assert_eq!(days[0].review_count, 0);
        assert_eq!(days[1].review_count, 2);
    }

    #[test]
    fn test_perfect_retention_spreads_reviews() {
        let states = vec![reviewed(0, 1)];
        let mut rng = StdRng::seed_from_u64(1);

        let days = project_workload_with_rng(&states, 12, 0, 1.0, today(), &mut rng);

        // Intervals 1 -> 3 -> 8: reviewed on days 0, 3 and 11
        let review_days: Vec<usize> = days
            .iter()
            .enumerate()
            .filter(|(_, d)| d.review_count > 0)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(review_days, vec![0, 3, 11]);
    }

    #[test]
    fn test_zero_retention_reviews_daily() {
        let states = vec![reviewed(0, 10)];
        let mut rng = StdRng::seed_from_u64(3);

        let days = project_workload_with_rng(&states, 5, 0, 0.0, today(), &mut rng);
        assert!(days.iter().all(|d| d.review_count == 1));
    }

    #[test]
    fn test_suspended_items_are_ignored_and_inputs_untouched() {
        let mut suspended = reviewed(0, 1);
        suspended.suspended = true;
        let states = vec![suspended.clone(), reviewed(0, 1)];
        let snapshot = states.clone();

        let days = project_workload(&states, 1, 10, 0.9, today());

        assert_eq!(days.len(), 1);
        assert_eq!(days[0].review_count, 1);
        assert_eq!(states, snapshot);
    }

    #[test]
    fn test_total_load_is_sum() {
        let mut states: Vec<ReviewState> = (0..3).map(|_| ReviewState::new(today())).collect();
        states.push(reviewed(0, 2));
        let mut rng = StdRng::seed_from_u64(11);

        for day in project_workload_with_rng(&states, 14, 1, 0.85, today(), &mut rng) {
            assert_eq!(day.total_load, day.review_count + day.new_count);
        }
    }
}
