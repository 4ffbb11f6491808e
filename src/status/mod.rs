use crate::{ReviewState, ReviewStatus, Thread};
use std::collections::BTreeSet;

/// Derive the open-review status from reviewers, approvers and the
/// unresolved count.
///
/// Only approvers that are also reviewers count; stray approvals are ignored
/// rather than trusted.
pub fn calculate_status(
    reviewers: &BTreeSet<String>,
    approvers: &BTreeSet<String>,
    unresolved: i64,
) -> ReviewStatus {
    if reviewers.is_empty() {
        return ReviewStatus::NeedsReview;
    }

    let approved = approvers.iter().any(|a| reviewers.contains(a));
    if !approved {
        return ReviewStatus::NeedsApproval;
    }

    if unresolved > 0 {
        ReviewStatus::NeedsResolution
    } else {
        ReviewStatus::Approved
    }
}

/// Authoritative status of a review.
///
/// A closed review keeps the status recorded when it was closed.
pub fn review_status(state: &ReviewState) -> ReviewStatus {
    if state.closed {
        return state.status;
    }
    calculate_status(&state.reviewers, &state.approvers, state.unresolved)
}

/// Status to record when a review is closed.
pub fn closed_status(merged: bool) -> ReviewStatus {
    if merged {
        ReviewStatus::ClosedMerged
    } else {
        ReviewStatus::ClosedUnmerged
    }
}

/// Number of non-draft, unresolved threads.
pub fn unresolved_count(threads: &[Thread]) -> i64 {
    threads.iter().filter(|t| t.counts_as_unresolved()).count() as i64
}

/// Optimistic status from a local, possibly stale thread list.
///
/// Used for immediate feedback only; the authoritative recompute overwrites it.
pub fn estimate_status(state: &ReviewState, threads: &[Thread]) -> ReviewStatus {
    if state.closed {
        return state.status;
    }
    calculate_status(&state.reviewers, &state.approvers, unresolved_count(threads))
}
