//! Markdown body of the review summary posted to the platform.

use crate::{ReviewKey, ReviewMetadata, ReviewState, ReviewStatus, Thread};
use std::collections::BTreeMap;

pub fn status_text(status: ReviewStatus) -> &'static str {
    match status {
        ReviewStatus::Approved => "Approved",
        ReviewStatus::ClosedMerged => "Merged",
        ReviewStatus::ClosedUnmerged => "Closed",
        ReviewStatus::NeedsReview => "Needs Review",
        ReviewStatus::NeedsResolution => "Needs Resolution",
        ReviewStatus::NeedsApproval => "Needs Approval",
    }
}

pub fn status_emoji(status: ReviewStatus) -> &'static str {
    match status {
        ReviewStatus::Approved => "✔️",
        ReviewStatus::ClosedMerged => "🚀",
        ReviewStatus::ClosedUnmerged => "🗑️",
        ReviewStatus::NeedsApproval | ReviewStatus::NeedsReview => "⏳",
        ReviewStatus::NeedsResolution => "❌",
    }
}

fn describe_status(status: ReviewStatus) -> String {
    format!("{} {}", status_emoji(status), status_text(status))
}

/// Link to the review in the web app.
pub fn review_url(base_url: &str, key: &ReviewKey) -> String {
    format!(
        "{}/pr/{}/{}/{}",
        base_url.trim_end_matches('/'),
        key.owner,
        key.repo,
        key.number
    )
}

/// Approvers first, then reviewers still pending.
pub fn reviewers_table(state: &ReviewState) -> String {
    if state.reviewers.is_empty() && state.approvers.is_empty() {
        return "None".to_string();
    }

    let mut table = vec!["| User | Status |".to_string(), "|---|---|".to_string()];
    for user in &state.approvers {
        table.push(format!(
            "| @{} | {} Approved |",
            user,
            status_emoji(ReviewStatus::Approved)
        ));
    }
    for user in state.reviewers.difference(&state.approvers) {
        table.push(format!(
            "| @{} | {} Pending |",
            user,
            status_emoji(ReviewStatus::NeedsApproval)
        ));
    }
    table.join("\n")
}

/// Per-file counts of published threads.
pub fn threads_table(threads: &[Thread]) -> String {
    let mut files: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
    for thread in threads.iter().filter(|t| !t.draft) {
        let entry = files.entry(thread.current_args.file.as_str()).or_default();
        entry.0 += 1;
        if !thread.resolved {
            entry.1 += 1;
        }
    }

    if files.is_empty() {
        return "None".to_string();
    }

    let mut table = vec![
        "| File | # Comments | # Unresolved |".to_string(),
        "|---|---|---|".to_string(),
    ];
    for (file, (total, unresolved)) in files {
        table.push(format!("| `{}` | {} | {} |", file, total, unresolved));
    }
    table.join("\n")
}

/// Full summary body: status, reviewers, comments.
pub fn review_comment(
    base_url: &str,
    metadata: &ReviewMetadata,
    state: &ReviewState,
    threads: &[Thread],
) -> String {
    format!(
        "#### Status\n[{}]({})\n\n#### Reviewers\n{}\n\n#### Comments\n{}",
        describe_status(state.status),
        review_url(base_url, &metadata.key()),
        reviewers_table(state),
        threads_table(threads)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CommitRef, Side, ThreadArgs};

    fn metadata() -> ReviewMetadata {
        ReviewMetadata {
            owner: "octo".to_string(),
            repo: "widgets".to_string(),
            number: 7,
            author: "carol".to_string(),
            title: "Add widgets".to_string(),
            base: CommitRef { label: "octo:main".to_string(), sha: "b1".to_string() },
            head: CommitRef { label: "octo:feature".to_string(), sha: "h1".to_string() },
            updated_at: 0,
        }
    }

    fn thread(file: &str, draft: bool, resolved: bool) -> Thread {
        let mut t = Thread::new(
            format!("{}-{}-{}", file, draft, resolved),
            "alice",
            ThreadArgs {
                file: file.to_string(),
                sha: "h1".to_string(),
                line: 1,
                side: Side::Right,
                line_content: String::new(),
            },
            draft,
        );
        t.resolved = resolved;
        t
    }

    #[test]
    fn empty_review_renders_none_sections() {
        let body = review_comment("https://example.com/", &metadata(), &ReviewState::default(), &[]);
        assert_eq!(
            body,
            "#### Status\n[⏳ Needs Review](https://example.com/pr/octo/widgets/7)\n\n\
             #### Reviewers\nNone\n\n#### Comments\nNone"
        );
    }

    #[test]
    fn reviewers_table_lists_approvers_then_pending() {
        let mut state = ReviewState::default();
        state.add_reviewer("bob");
        state.add_approver("alice");
        assert_eq!(
            reviewers_table(&state),
            "| User | Status |\n|---|---|\n| @alice | ✔️ Approved |\n| @bob | ⏳ Pending |"
        );
    }

    #[test]
    fn threads_table_skips_drafts_and_counts_unresolved() {
        let threads = vec![
            thread("b.rs", false, false),
            thread("a.rs", false, true),
            thread("a.rs", false, false),
            thread("c.rs", true, false),
        ];
        assert_eq!(
            threads_table(&threads),
            "| File | # Comments | # Unresolved |\n|---|---|---|\n| `a.rs` | 2 | 1 |\n| `b.rs` | 1 | 1 |"
        );
    }

    #[test]
    fn only_drafts_renders_none() {
        assert_eq!(threads_table(&[thread("a.rs", true, false)]), "None");
    }
}
