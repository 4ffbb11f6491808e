//! Capabilities the sync engine consumes from the hosting platform.
//!
//! The engine never talks to GitHub or git directly; it is handed a
//! [`DiffSource`] and a [`Platform`] and only sees these contracts.

use crate::{ReviewKey, ReviewMetadata, ReviewStatus};
use async_trait::async_trait;
use thiserror::Error;

/// Failures talking to the platform or to git.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("request to {endpoint} failed: {source}")]
    Http {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} returned {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },
    #[error("invalid response from {endpoint}: {message}")]
    InvalidResponse { endpoint: String, message: String },
    #[error("git command failed: {0}")]
    Command(String),
    #[error("invalid git ref: {0}")]
    InvalidRef(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0} is not supported by this source")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, PlatformError>;

/// Position of one commit relative to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AncestryStatus {
    /// The second commit descends from the first.
    Ahead,
    /// The second commit is an ancestor of the first.
    Behind,
    Identical,
    /// Neither descends from the other (force push, rebase).
    Diverged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ancestry {
    pub status: AncestryStatus,
    pub ahead_by: u32,
    pub behind_by: u32,
}

impl Ancestry {
    pub fn distance(&self) -> u32 {
        self.ahead_by.max(self.behind_by)
    }
}

/// Verdict attached to a posted review summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewEvent {
    Approve,
    RequestChanges,
    Comment,
}

impl ReviewEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            ReviewEvent::Approve => "APPROVE",
            ReviewEvent::RequestChanges => "REQUEST_CHANGES",
            ReviewEvent::Comment => "COMMENT",
        }
    }

    pub fn for_status(status: ReviewStatus) -> Self {
        if status == ReviewStatus::Approved {
            ReviewEvent::Approve
        } else {
            ReviewEvent::RequestChanges
        }
    }
}

/// Diffs and ancestry between commits of a repository.
#[async_trait]
pub trait DiffSource: Send + Sync {
    /// Raw unified diff from `base_sha` to `head_sha`.
    async fn fetch_diff(&self, key: &ReviewKey, base_sha: &str, head_sha: &str) -> Result<String>;

    /// Where `sha_b` stands relative to `sha_a`.
    async fn compare_ancestry(&self, key: &ReviewKey, sha_a: &str, sha_b: &str) -> Result<Ancestry>;
}

/// Pull-request metadata and review publication.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Latest base/head/title of a pull request.
    async fn fetch_current_metadata(&self, key: &ReviewKey) -> Result<ReviewMetadata>;

    /// Post a new review carrying `body`; returns its platform id.
    async fn post_review_summary(&self, key: &ReviewKey, event: ReviewEvent, body: &str) -> Result<u64>;

    /// Replace the body of a previously posted review.
    async fn update_review_summary(&self, key: &ReviewKey, review_id: u64, body: &str) -> Result<()>;

    /// Post a new review when there is a verdict to record or nothing to
    /// update, otherwise rewrite the existing one in place.
    async fn post_or_update_review_summary(
        &self,
        key: &ReviewKey,
        existing: Option<u64>,
        event: Option<ReviewEvent>,
        body: &str,
    ) -> Result<u64> {
        match (existing, event) {
            (Some(review_id), None) => {
                self.update_review_summary(key, review_id, body).await?;
                Ok(review_id)
            }
            (_, event) => {
                self.post_review_summary(key, event.unwrap_or(ReviewEvent::Comment), body)
                    .await
            }
        }
    }
}

/// Stand-in used when no platform credentials are configured.
///
/// Every call fails with [`PlatformError::Unsupported`]; callers that treat
/// publication as best-effort can skip on that variant.
#[derive(Debug, Clone, Copy, Default)]
pub struct Offline;

#[async_trait]
impl DiffSource for Offline {
    async fn fetch_diff(&self, _key: &ReviewKey, _base_sha: &str, _head_sha: &str) -> Result<String> {
        Err(PlatformError::Unsupported("fetching diffs"))
    }

    async fn compare_ancestry(&self, _key: &ReviewKey, _sha_a: &str, _sha_b: &str) -> Result<Ancestry> {
        Err(PlatformError::Unsupported("comparing commits"))
    }
}

#[async_trait]
impl Platform for Offline {
    async fn fetch_current_metadata(&self, _key: &ReviewKey) -> Result<ReviewMetadata> {
        Err(PlatformError::Unsupported("fetching pull request metadata"))
    }

    async fn post_review_summary(&self, _key: &ReviewKey, _event: ReviewEvent, _body: &str) -> Result<u64> {
        Err(PlatformError::Unsupported("posting reviews"))
    }

    async fn update_review_summary(&self, _key: &ReviewKey, _review_id: u64, _body: &str) -> Result<()> {
        Err(PlatformError::Unsupported("updating reviews"))
    }
}
