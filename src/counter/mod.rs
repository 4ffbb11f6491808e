//! Unresolved-counter maintenance and the authoritative status recompute.
//!
//! Every thread write is turned into a signed delta applied with an atomic
//! increment. The status is then recomputed in its own transaction, so the
//! two steps can drift apart if a delivery is repeated or lost between them;
//! `recount` is the manual remedy.

use crate::engine::{EngineEvent, Notifier};
use crate::platform::{Platform, PlatformError, ReviewEvent};
use crate::reconcile::Result;
use crate::store::{ReviewStore, ReviewerChange, StatusRecompute};
use crate::summary::review_comment;
use crate::{Comment, Review, ReviewKey, ReviewMetadata, ReviewStatus, Thread, now_millis};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Change in the unresolved count caused by one thread write.
///
/// `before` is `None` for a newly created thread.
pub fn unresolved_delta(before: Option<&Thread>, after: &Thread) -> i64 {
    let count = |t: &Thread| i64::from(t.counts_as_unresolved());
    count(after) - before.map(count).unwrap_or(0)
}

/// Verdict attached to a summary posted for `status`.
fn summary_event(status: ReviewStatus) -> ReviewEvent {
    match status {
        ReviewStatus::ClosedMerged | ReviewStatus::ClosedUnmerged => ReviewEvent::Comment,
        status => ReviewEvent::for_status(status),
    }
}

pub struct CounterReconciler {
    store: Arc<dyn ReviewStore>,
    platform: Arc<dyn Platform>,
    base_url: String,
    notifier: Notifier,
}

impl CounterReconciler {
    pub fn new(
        store: Arc<dyn ReviewStore>,
        platform: Arc<dyn Platform>,
        base_url: impl Into<String>,
        notifier: Notifier,
    ) -> Self {
        Self {
            store,
            platform,
            base_url: base_url.into(),
            notifier,
        }
    }

    /// Record a newly opened pull request. Returns `false` if it was known.
    pub async fn open_review(&self, metadata: ReviewMetadata) -> Result<bool> {
        let key = metadata.key();
        let created = self.store.create_review(&Review::new(metadata)).await?;
        if created {
            info!(review = %key, "review opened");
        } else {
            debug!(review = %key, "review already exists");
        }
        Ok(created)
    }

    pub async fn close_review(&self, key: &ReviewKey, merged: bool) -> Result<StatusRecompute> {
        let previous = self.store.load_review(key).await?.state.status;
        self.store.set_closed(key, merged).await?;
        let mut recompute = self.store.recompute_status(key).await?;
        recompute.previous = previous;
        info!(review = %key, merged, "review closed");
        self.after_recompute(key, &recompute, false).await?;
        Ok(recompute)
    }

    pub async fn reopen_review(&self, key: &ReviewKey) -> Result<StatusRecompute> {
        let recompute = self.store.reopen(key).await?;
        info!(review = %key, status = %recompute.current, "review reopened");
        self.after_recompute(key, &recompute, false).await?;
        Ok(recompute)
    }

    /// Apply the counter delta for one thread write, then recompute.
    ///
    /// Not idempotent: delivering the same write twice applies the delta twice.
    pub async fn on_thread_write(
        &self,
        key: &ReviewKey,
        before: Option<&Thread>,
        after: &Thread,
    ) -> Result<StatusRecompute> {
        self.apply_delta(key, before, after).await?;
        self.on_review_write(key, false).await
    }

    /// Authoritative recompute, followed by the summary side effect when the
    /// status changed or a published comment arrived.
    pub async fn on_review_write(&self, key: &ReviewKey, new_comment: bool) -> Result<StatusRecompute> {
        let recompute = self.store.recompute_status(key).await?;
        self.after_recompute(key, &recompute, new_comment).await?;
        Ok(recompute)
    }

    /// Create a thread together with its first comment.
    pub async fn add_thread(&self, key: &ReviewKey, thread: &Thread, comment: &Comment) -> Result<StatusRecompute> {
        self.store.insert_thread(key, thread).await?;
        self.store.insert_comment(key, comment).await?;
        self.apply_delta(key, None, thread).await?;
        if !comment.draft {
            self.comment_published(key, comment).await?;
        }
        self.on_review_write(key, !comment.draft).await
    }

    pub async fn add_comment(&self, key: &ReviewKey, comment: &Comment) -> Result<StatusRecompute> {
        self.store.insert_comment(key, comment).await?;
        if !comment.draft {
            self.comment_published(key, comment).await?;
        }
        self.on_review_write(key, !comment.draft).await
    }

    pub async fn resolve_thread(&self, key: &ReviewKey, thread_id: &str, resolved: bool) -> Result<StatusRecompute> {
        let update = self.store.set_thread_resolved(key, thread_id, resolved).await?;
        debug!(review = %key, thread_id, resolved, "thread resolution set");
        self.on_thread_write(key, Some(&update.before), &update.after).await
    }

    /// Stage a resolution to be applied when the author's drafts are sent.
    pub async fn stage_resolution(&self, key: &ReviewKey, thread_id: &str, resolved: bool) -> Result<()> {
        self.store.stage_resolution(key, thread_id, Some(resolved)).await?;
        Ok(())
    }

    /// Publish every draft of `author` and apply the resulting deltas.
    pub async fn send_drafts(&self, key: &ReviewKey, author: &str) -> Result<StatusRecompute> {
        let published = self.store.publish_drafts(key, author).await?;
        for update in &published.threads {
            self.apply_delta(key, Some(&update.before), &update.after).await?;
        }
        info!(
            review = %key,
            author,
            threads = published.threads.len(),
            comments = published.comments,
            "drafts sent"
        );

        let new_comment = published.comments > 0;
        if new_comment {
            self.store.touch_last_comment(key, now_millis()).await?;
        }
        self.on_review_write(key, new_comment).await
    }

    pub async fn change_reviewer(&self, key: &ReviewKey, change: &ReviewerChange) -> Result<StatusRecompute> {
        if self.store.apply_reviewer_change(key, change).await? {
            debug!(review = %key, ?change, "reviewers changed");
        }
        self.on_review_write(key, false).await
    }

    /// Reset the counter from the threads themselves.
    pub async fn recount(&self, key: &ReviewKey) -> Result<StatusRecompute> {
        let before = self.store.load_review(key).await?.state.unresolved;
        let after = self.store.recount_unresolved(key).await?;
        if before != after {
            warn!(review = %key, before, after, "unresolved counter drifted");
        }
        self.on_review_write(key, false).await
    }

    async fn apply_delta(&self, key: &ReviewKey, before: Option<&Thread>, after: &Thread) -> Result<()> {
        let delta = unresolved_delta(before, after);
        if delta != 0 {
            debug!(review = %key, thread_id = %after.id, delta, "unresolved counter");
            self.store.increment_unresolved(key, delta).await?;
        }
        Ok(())
    }

    async fn comment_published(&self, key: &ReviewKey, comment: &Comment) -> Result<()> {
        self.store.touch_last_comment(key, comment.timestamp).await?;
        self.notifier.send(EngineEvent::CommentPosted {
            key: key.clone(),
            thread_id: comment.thread_id.clone(),
            comment_id: comment.id.clone(),
            username: comment.username.clone(),
        });
        Ok(())
    }

    async fn after_recompute(&self, key: &ReviewKey, recompute: &StatusRecompute, new_comment: bool) -> Result<()> {
        let state = &recompute.review.state;
        for login in state.stray_approvers() {
            warn!(review = %key, login, "approver is not a reviewer");
        }
        if state.unresolved < 0 {
            warn!(review = %key, unresolved = state.unresolved, "unresolved counter is negative");
        }

        let event = if recompute.changed() {
            info!(
                review = %key,
                previous = %recompute.previous,
                current = %recompute.current,
                "review status changed"
            );
            self.notifier.send(EngineEvent::StatusChanged {
                key: key.clone(),
                previous: recompute.previous,
                current: recompute.current,
            });
            Some(summary_event(recompute.current))
        } else if new_comment {
            None
        } else {
            return Ok(());
        };

        self.publish_summary(key, &recompute.review, event).await
    }

    async fn publish_summary(&self, key: &ReviewKey, review: &Review, event: Option<ReviewEvent>) -> Result<()> {
        let threads = self.store.list_threads(key).await?;
        let body = review_comment(&self.base_url, &review.metadata, &review.state, &threads);

        let posted = self
            .platform
            .post_or_update_review_summary(key, review.summary_review_id, event, &body)
            .await;
        let review_id = match posted {
            Ok(id) => id,
            Err(PlatformError::Unsupported(what)) => {
                info!(review = %key, what, "platform unavailable, summary not published");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        if review.summary_review_id != Some(review_id) {
            self.store.set_summary_review_id(key, review_id).await?;
        }

        debug!(review = %key, review_id, ?event, "summary published");
        self.notifier.send(EngineEvent::SummaryPublished {
            key: key.clone(),
            review_id,
            event,
        });
        Ok(())
    }
}
