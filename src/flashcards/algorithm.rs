//! Spaced repetition scheduling
//!
//! A simplified SM-2 variant with three ratings:
//! - Again: relearn tomorrow, ease factor drops by 0.2, lapse counted
//! - Good: new items graduate to a 1-day interval, reviewed items grow by the
//!   ease factor
//! - Easy: like Good with an extra interval multiplier
//!
//! Mastery is stored as a snapshot taken at review time. The effective value
//! used for display and cross-device comparison decays while the item sits
//! overdue.

use std::cmp::Ordering;

use chrono::{DateTime, Days, NaiveDate, Utc};

use super::models::{
    LeechAction, LeechPolicy, Rating, ReviewState, ReviewStats, Reviewable, LEECH_TAG,
};

/// Minimum ease factor allowed
pub const MIN_EASE_FACTOR: f64 = 1.3;

/// Ease factor penalty applied on every lapse
const LAPSE_EASE_PENALTY: f64 = 0.2;

/// Extra interval multiplier for Easy
const EASY_INTERVAL_BONUS: f64 = 1.3;

/// Fraction of the remaining distance to 1.0 gained on success
const MASTERY_GAIN: f64 = 0.25;
const EASY_MASTERY_GAIN: f64 = 0.35;

/// Fraction of current mastery lost on failure
const MASTERY_LOSS: f64 = 0.4;

/// Overdue decay half-life never drops below one day
const MIN_HALF_LIFE_DAYS: f64 = 1.0;

/// Absorbs float noise such as 10 * 1.3 = 13.000000000000002 before rounding up
const INTERVAL_EPSILON: f64 = 1e-9;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Compute the next review state for a rating, without leech handling.
///
/// This is the pure transition shared by `apply_rating` and the workload
/// simulation.
pub fn next_state(state: &ReviewState, rating: Rating, today: NaiveDate) -> ReviewState {
    let mut next = state.clone();

    match rating {
        Rating::Again => {
            next.interval = 1;
            next.ease_factor = (state.ease_factor - LAPSE_EASE_PENALTY).max(MIN_EASE_FACTOR);
            next.lapses = state.lapses.saturating_add(1);
        }
        Rating::Good | Rating::Easy => {
            let base = if state.is_new() {
                1.0
            } else {
                state.interval as f64 * state.ease_factor
            };
            let scaled = if rating == Rating::Easy {
                base * EASY_INTERVAL_BONUS
            } else {
                base
            };
            next.interval = ((scaled - INTERVAL_EPSILON).ceil() as u32).max(1);
            next.ease_factor = state.ease_factor.max(MIN_EASE_FACTOR);
        }
    }

    next.due_date = add_days(today, next.interval);
    next.mastery_level = update_mastery(state.mastery_level, rating);
    next
}

/// Apply a rating to an item, returning the updated copy.
///
/// Crossing the leech threshold on an Again rating applies the policy action
/// (suspend or tag). A threshold of 0 disables leech detection.
pub fn apply_rating<R: Reviewable + Clone>(
    item: &R,
    rating: Rating,
    leech_policy: &LeechPolicy,
    today: NaiveDate,
) -> R {
    let mut updated = item.clone();
    let next = next_state(item.review(), rating, today);
    *updated.review_mut() = next;

    let lapses = updated.review().lapses;
    if rating == Rating::Again && leech_policy.threshold > 0 && lapses >= leech_policy.threshold {
        log::debug!(
            "Item {} is a leech ({} lapses), applying {:?}",
            updated.id(),
            lapses,
            leech_policy.action
        );
        match leech_policy.action {
            LeechAction::Suspend => updated.review_mut().suspended = true,
            LeechAction::Tag => {
                let tags = updated.tags_mut();
                if !tags.iter().any(|t| t == LEECH_TAG) {
                    tags.push(LEECH_TAG.to_string());
                }
            }
        }
    }

    updated
}

/// Bounded incremental step toward 1.0 on success or 0.0 on failure
fn update_mastery(current: f64, rating: Rating) -> f64 {
    let current = current.clamp(0.0, 1.0);
    let next = match rating {
        Rating::Again => current - current * MASTERY_LOSS,
        Rating::Good => current + (1.0 - current) * MASTERY_GAIN,
        Rating::Easy => current + (1.0 - current) * EASY_MASTERY_GAIN,
    };
    next.clamp(0.0, 1.0)
}

/// Stored mastery decayed by the time the item has spent overdue.
///
/// An item is overdue once its due date has fully passed. Decay halves the
/// value every `max(interval, 1)` days overdue.
pub fn effective_mastery(state: &ReviewState, now: DateTime<Utc>) -> f64 {
    let stored = state.mastery_level;
    let overdue_from = add_days(state.due_date, 1)
        .and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc());

    let Some(overdue_from) = overdue_from else {
        return stored;
    };
    if now <= overdue_from {
        return stored;
    }

    let days_overdue = (now - overdue_from).num_seconds() as f64 / SECONDS_PER_DAY;
    let half_life = (state.interval as f64).max(MIN_HALF_LIFE_DAYS);
    let decay = 0.5_f64.powf(days_overdue / half_life);

    (stored * decay).max(0.0)
}

/// Intervals each rating would produce, for the answer buttons.
/// Order: Again, Good, Easy.
pub fn preview_intervals(state: &ReviewState, today: NaiveDate) -> [u32; 3] {
    [
        next_state(state, Rating::Again, today).interval,
        next_state(state, Rating::Good, today).interval,
        next_state(state, Rating::Easy, today).interval,
    ]
}

/// Select items for a review session on `today`.
///
/// Due reviews come first, oldest due date first, ties broken by lowest
/// effective mastery. Up to `new_limit` new items follow in their stored order.
/// Suspended items are never selected.
pub fn select_due_items<'a, T, I>(items: I, today: NaiveDate, now: DateTime<Utc>, new_limit: usize) -> Vec<&'a T>
where
    T: Reviewable + ?Sized + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let mut due = Vec::new();
    let mut fresh = Vec::new();

    for item in items {
        let state = item.review();
        if state.suspended {
            continue;
        }
        if state.is_new() {
            if fresh.len() < new_limit {
                fresh.push(item);
            }
        } else if state.due_date <= today {
            due.push(item);
        }
    }

    due.sort_by(|a, b| {
        a.review().due_date.cmp(&b.review().due_date).then_with(|| {
            effective_mastery(a.review(), now)
                .partial_cmp(&effective_mastery(b.review(), now))
                .unwrap_or(Ordering::Equal)
        })
    });

    due.extend(fresh);
    due
}

/// Summarize a set of review states
pub fn review_stats<'a, I>(states: I, today: NaiveDate, now: DateTime<Utc>) -> ReviewStats
where
    I: IntoIterator<Item = &'a ReviewState>,
{
    let mut stats = ReviewStats::default();
    let mut mastery_sum = 0.0;
    let mut active = 0usize;

    for state in states {
        stats.total_items += 1;
        if state.suspended {
            stats.suspended_items += 1;
            continue;
        }
        active += 1;
        mastery_sum += effective_mastery(state, now);
        if state.is_new() {
            stats.new_items += 1;
        } else if state.due_date <= today {
            stats.due_items += 1;
        }
    }

    if active > 0 {
        stats.average_mastery = mastery_sum / active as f64;
    }
    stats
}

/// Format an interval in days to a human-readable string
pub fn format_interval(days: u32) -> String {
    if days == 0 {
        "now".to_string()
    } else if days < 7 {
        format!("{}d", days)
    } else if days < 30 {
        format!("{}w", days / 7)
    } else if days < 365 {
        format!("{}mo", days / 30)
    } else {
        format!("{}y", days / 365)
    }
}

fn add_days(date: NaiveDate, days: u32) -> NaiveDate {
    date.checked_add_days(Days::new(days as u64)).unwrap_or(NaiveDate::MAX)
}
