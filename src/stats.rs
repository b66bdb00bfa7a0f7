//! Derived aggregates over the in-memory collections.
//!
//! Pure functions: they read snapshots and never touch the network or the
//! store.

use crate::model::{EntityId, Executor, Request, RequestStatus};
use chrono::{Days, NaiveDate};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutorStats {
    pub executor_id: EntityId,
    pub name: String,
    pub assigned: u32,
    pub in_progress: u32,
    pub completed: u32,
    /// Mean rating over completed, rated requests.
    pub average_rating: Option<f64>,
}

#[derive(Default)]
struct Tally {
    assigned: u32,
    in_progress: u32,
    completed: u32,
    rating_sum: u32,
    rated: u32,
}

/// Per-executor workload, in roster order.
pub fn executor_stats(executors: &[Executor], requests: &[Request]) -> Vec<ExecutorStats> {
    let mut tallies: HashMap<&EntityId, Tally> = HashMap::new();
    for request in requests {
        let Some(executor_id) = request.executor_id.as_ref() else {
            continue;
        };
        let tally = tallies.entry(executor_id).or_default();
        match request.status {
            RequestStatus::Assigned => tally.assigned += 1,
            RequestStatus::InProgress => tally.in_progress += 1,
            RequestStatus::Completed => {
                tally.completed += 1;
                if let Some(rating) = request.rating {
                    tally.rating_sum += u32::from(rating);
                    tally.rated += 1;
                }
            }
            RequestStatus::New | RequestStatus::Cancelled => {}
        }
    }

    executors
        .iter()
        .map(|executor| {
            let tally = tallies.remove(&executor.id).unwrap_or_default();
            ExecutorStats {
                executor_id: executor.id.clone(),
                name: executor.name.clone(),
                assigned: tally.assigned,
                in_progress: tally.in_progress,
                completed: tally.completed,
                average_rating: (tally.rated > 0)
                    .then(|| f64::from(tally.rating_sum) / f64::from(tally.rated)),
            }
        })
        .collect()
}

/// One day of the weekly chart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayBucket {
    pub date: NaiveDate,
    pub created: u32,
    pub completed: u32,
}

/// Seven buckets ending at `today`, oldest first.
pub fn weekly_buckets(requests: &[Request], today: NaiveDate) -> Vec<DayBucket> {
    let mut buckets: Vec<DayBucket> = (0..7u64)
        .rev()
        .filter_map(|back| today.checked_sub_days(Days::new(back)))
        .map(|date| DayBucket {
            date,
            created: 0,
            completed: 0,
        })
        .collect();

    let slot = |date: NaiveDate| buckets.iter().position(|b| b.date == date);
    let mut created = Vec::new();
    let mut completed = Vec::new();
    for request in requests {
        if let Some(i) = slot(request.created_at.date_naive()) {
            created.push(i);
        }
        if request.status == RequestStatus::Completed {
            if let Some(i) = request.completed_at.and_then(|at| slot(at.date_naive())) {
                completed.push(i);
            }
        }
    }
    for i in created {
        buckets[i].created += 1;
    }
    for i in completed {
        buckets[i].completed += 1;
    }
    buckets
}
