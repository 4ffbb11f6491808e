pub mod cli;
pub mod config;
pub mod counter;
pub mod engine;
pub mod git;
pub mod github;
pub mod parser;
pub mod platform;
pub mod reconcile;
pub mod snapshot;
pub mod status;
pub mod store;
pub mod summary;
pub mod translate;
pub mod webhook;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Line value of a thread whose anchor can no longer be located.
pub const OUTDATED_LINE: i64 = -1;

/// Identifies one pull request: repository owner, repository name and number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReviewKey {
    pub owner: String,
    pub repo: String,
    pub number: u64,
}

impl ReviewKey {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>, number: u64) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
            number,
        }
    }
}

impl fmt::Display for ReviewKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.owner, self.repo, self.number)
    }
}

#[derive(Debug, Error)]
#[error("invalid review reference '{0}', expected OWNER/REPO#NUMBER")]
pub struct InvalidReviewKey(pub String);

impl FromStr for ReviewKey {
    type Err = InvalidReviewKey;

    /// Parse `owner/repo#number`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidReviewKey(s.to_string());
        let (repo_part, number) = s.rsplit_once('#').ok_or_else(invalid)?;
        let (owner, repo) = repo_part.split_once('/').ok_or_else(invalid)?;
        if owner.is_empty() || repo.is_empty() || repo.contains('/') {
            return Err(invalid());
        }
        let number = number.parse::<u64>().map_err(|_| invalid())?;
        Ok(Self::new(owner, repo, number))
    }
}

/// A branch tip as reported by the platform: `owner:branch` label plus commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRef {
    pub label: String,
    pub sha: String,
}

/// The current shape of one pull request.
///
/// Replaced wholesale whenever the platform reports new base/head commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewMetadata {
    pub owner: String,
    pub repo: String,
    pub number: u64,
    pub author: String,
    pub title: String,
    pub base: CommitRef,
    pub head: CommitRef,
    /// Milliseconds since the Unix epoch.
    pub updated_at: i64,
}

impl ReviewMetadata {
    pub fn key(&self) -> ReviewKey {
        ReviewKey::new(&self.owner, &self.repo, self.number)
    }

    /// The commit a thread on `side` is anchored against.
    pub fn relevant_sha(&self, side: Side) -> &str {
        match side {
            Side::Left => &self.base.sha,
            Side::Right => &self.head.sha,
        }
    }
}

/// Aggregate review status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    /// Approved and all comments resolved.
    Approved,
    /// Closed and merged into the target branch.
    ClosedMerged,
    /// Closed before merging.
    ClosedUnmerged,
    /// Approved by someone, but has unresolved comments.
    NeedsResolution,
    /// Has reviewers, but none has approved yet.
    NeedsApproval,
    /// Nobody has been added as a reviewer.
    NeedsReview,
}

impl ReviewStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReviewStatus::Approved => "approved",
            ReviewStatus::ClosedMerged => "closed_merged",
            ReviewStatus::ClosedUnmerged => "closed_unmerged",
            ReviewStatus::NeedsResolution => "needs_resolution",
            ReviewStatus::NeedsApproval => "needs_approval",
            ReviewStatus::NeedsReview => "needs_review",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "approved" => Some(ReviewStatus::Approved),
            "closed_merged" => Some(ReviewStatus::ClosedMerged),
            "closed_unmerged" => Some(ReviewStatus::ClosedUnmerged),
            "needs_resolution" => Some(ReviewStatus::NeedsResolution),
            "needs_approval" => Some(ReviewStatus::NeedsApproval),
            "needs_review" => Some(ReviewStatus::NeedsReview),
            _ => None,
        }
    }
}

impl fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable review state, the only contended shared record of a review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewState {
    pub status: ReviewStatus,
    pub closed: bool,
    pub reviewers: BTreeSet<String>,
    /// Expected to be a subset of `reviewers`; see [`ReviewState::stray_approvers`].
    pub approvers: BTreeSet<String>,
    /// Incrementally maintained count of non-draft, unresolved threads.
    ///
    /// Signed because duplicate deliveries can push it below zero.
    pub unresolved: i64,
    /// Milliseconds since the Unix epoch of the last published comment.
    pub last_comment: i64,
}

impl Default for ReviewState {
    fn default() -> Self {
        Self {
            status: ReviewStatus::NeedsReview,
            closed: false,
            reviewers: BTreeSet::new(),
            approvers: BTreeSet::new(),
            unresolved: 0,
            last_comment: 0,
        }
    }
}

impl ReviewState {
    pub fn add_reviewer(&mut self, login: &str) -> bool {
        self.reviewers.insert(login.to_string())
    }

    /// Removing a reviewer also withdraws their approval.
    pub fn remove_reviewer(&mut self, login: &str) -> bool {
        self.approvers.remove(login);
        self.reviewers.remove(login)
    }

    /// Approving implies reviewing.
    pub fn add_approver(&mut self, login: &str) -> bool {
        self.reviewers.insert(login.to_string());
        self.approvers.insert(login.to_string())
    }

    pub fn remove_approver(&mut self, login: &str) -> bool {
        self.approvers.remove(login)
    }

    /// Approvers that are not also reviewers.
    pub fn stray_approvers(&self) -> Vec<&str> {
        self.approvers
            .difference(&self.reviewers)
            .map(String::as_str)
            .collect()
    }
}

/// A review record: platform metadata plus review state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub metadata: ReviewMetadata,
    pub state: ReviewState,
    /// Platform id of the last posted summary review, if any.
    pub summary_review_id: Option<u64>,
}

impl Review {
    pub fn new(metadata: ReviewMetadata) -> Self {
        Self {
            metadata,
            state: ReviewState::default(),
            summary_review_id: None,
        }
    }
}

/// Which commit of the diff a thread's anchor is read against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Authored against the base commit.
    Left,
    /// Authored against the head commit.
    Right,
}

impl Side {
    pub fn as_str(self) -> &'static str {
        match self {
            Side::Left => "left",
            Side::Right => "right",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "left" => Ok(Side::Left),
            "right" => Ok(Side::Right),
            other => Err(format!("invalid side '{}', expected left or right", other)),
        }
    }
}

/// A thread's position: file, commit, 1-based line and side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadArgs {
    pub file: String,
    pub sha: String,
    /// 1-based line, or [`OUTDATED_LINE`].
    pub line: i64,
    pub side: Side,
    /// Snapshot of the anchored line's text, empty when outdated.
    pub line_content: String,
}

impl ThreadArgs {
    pub fn is_outdated(&self) -> bool {
        self.line == OUTDATED_LINE
    }

    /// The same thread position marked outdated at `sha`.
    pub fn outdated_at(&self, sha: &str) -> Self {
        Self {
            file: self.file.clone(),
            sha: sha.to_string(),
            line: OUTDATED_LINE,
            side: self.side,
            line_content: String::new(),
        }
    }
}

/// A comment conversation anchored to a position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub username: String,
    pub draft: bool,
    pub resolved: bool,
    /// Resolution staged with a draft, applied when drafts are sent.
    pub pending_resolved: Option<bool>,
    /// Position as currently tracked; the only field reconciliation rewrites.
    pub current_args: ThreadArgs,
    /// Position at creation time, never mutated.
    pub original_args: ThreadArgs,
}

impl Thread {
    pub fn new(id: impl Into<String>, username: impl Into<String>, args: ThreadArgs, draft: bool) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            draft,
            resolved: false,
            pending_resolved: None,
            current_args: args.clone(),
            original_args: args,
        }
    }

    /// Whether this thread contributes to the unresolved counter.
    pub fn counts_as_unresolved(&self) -> bool {
        !self.draft && !self.resolved
    }
}

/// A single comment in a thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub thread_id: String,
    pub username: String,
    pub draft: bool,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub text: String,
}

/// Current time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
