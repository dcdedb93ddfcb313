//! Spaced repetition for cards and quiz questions
//!
//! - SM-2 style scheduling with leech handling
//! - Effective mastery decay for overdue items
//! - Workload forecasting
//! - Review use cases over the local store

pub mod algorithm;
pub mod models;
pub mod review;
pub mod workload;

pub use algorithm::{
    apply_rating, effective_mastery, format_interval, next_state, preview_intervals, review_stats,
    select_due_items,
};
pub use models::*;
pub use review::{review_item, ReviewError, ReviewOutcome};
pub use workload::{project_workload, project_workload_with_rng, DaySummary};
