//! Distributed quickselect over values spread across the members of a sub-group.
//!
//! Every round the member holding the widest candidate window proposes its local median as
//! the pivot, all members count how many of their candidates fall below and on the pivot,
//! and the window narrows to one side. The proposer always holds at least one value equal
//! to the pivot, so every round removes at least one candidate.
use std::cmp::Ordering;

use tracing::trace;

use crate::{comm::Communicator, subgroup::SubGroup};

/// Outcome of a selection, identical on every member.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Selection {
    /// The value of the requested global rank.
    pub value: f64,
    /// Values strictly below `value`, over all members.
    pub below: u64,
    /// Values equal to `value`, over all members.
    pub equal: u64,
}

impl Selection {
    pub fn total_at_or_below(&self) -> u64 {
        self.below + self.equal
    }
}

fn local_median(window: &mut [f64]) -> f64 {
    if window.is_empty() {
        return f64::NAN;
    }
    let middle = window.len() / 2;
    let (_, median, _) = window.select_nth_unstable_by(middle, f64::total_cmp);
    *median
}

fn count_around(values: &[f64], pivot: f64) -> [u64; 2] {
    let mut counts = [0u64; 2];
    for value in values {
        match value.total_cmp(&pivot) {
            Ordering::Less => counts[0] += 1,
            Ordering::Equal => counts[1] += 1,
            Ordering::Greater => (),
        }
    }
    counts
}

/// Find the value of 0-based global rank `k` among all members' `values`.
///
/// `None` when `k` is not below the global number of values. NaN values are ignored and
/// negative zero counts as zero.
pub fn select_kth<C: Communicator>(group: &SubGroup<C>, values: &[f64], k: u64) -> Option<Selection> {
    let mut window: Vec<f64> = values
        .iter()
        .filter(|v| !v.is_nan())
        .map(|v| v + 0.)
        .collect();
    let local = window.clone();

    let total = group.all_reduce_sum(&[window.len() as u64])[0];
    if k >= total {
        return None;
    }

    let mut k = k;
    let mut rounds = 0usize;
    let value = loop {
        rounds += 1;
        let median = local_median(&mut window);
        let proposals = group.all_gather(&[window.len() as f64, median]);

        // Widest window wins, lowest member on ties.
        let Some(pivot) = proposals
            .iter()
            .filter(|p| p[0] > 0.)
            .max_by(|a, b| a[0].total_cmp(&b[0]).then(Ordering::Greater))
            .map(|p| p[1])
        else {
            return None;
        };

        let counts = group.all_reduce_sum(&count_around(&window, pivot));
        let (less, equal) = (counts[0], counts[1]);
        if k < less {
            window.retain(|&v| v < pivot);
        } else if k < less + equal {
            break pivot;
        } else {
            k -= less + equal;
            window.retain(|&v| v > pivot);
        }
    };

    let counts = group.all_reduce_sum(&count_around(&local, value));
    trace!(value, rounds, below = counts[0], equal = counts[1], "selection");
    Some(Selection {
        value,
        below: counts[0],
        equal: counts[1],
    })
}
