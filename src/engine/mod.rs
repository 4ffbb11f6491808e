//! Event dispatch and the messages the engine emits.

use crate::counter::CounterReconciler;
use crate::platform::{DiffSource, Platform, ReviewEvent};
use crate::reconcile::{PassReport, Reconciler, Result};
use crate::store::ReviewStore;
use crate::webhook::WebhookEvent;
use crate::{ReviewKey, ReviewStatus, ThreadArgs};
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::{error, info};

/// Notifications for consumers outside the engine (UI, notification dispatch).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    ThreadMoved {
        key: ReviewKey,
        thread_id: String,
        from: ThreadArgs,
        to: ThreadArgs,
    },
    ThreadOutdated {
        key: ReviewKey,
        thread_id: String,
        sha: String,
    },
    StatusChanged {
        key: ReviewKey,
        previous: ReviewStatus,
        current: ReviewStatus,
    },
    CommentPosted {
        key: ReviewKey,
        thread_id: String,
        comment_id: String,
        username: String,
    },
    SummaryPublished {
        key: ReviewKey,
        review_id: u64,
        event: Option<ReviewEvent>,
    },
}

/// Sending half of the event channel. A default notifier drops everything.
#[derive(Debug, Clone, Default)]
pub struct Notifier {
    tx: Option<UnboundedSender<EngineEvent>>,
}

impl Notifier {
    pub fn new(tx: UnboundedSender<EngineEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn send(&self, event: EngineEvent) {
        if let Some(tx) = &self.tx {
            // Nobody listening is fine
            let _ = tx.send(event);
        }
    }
}

pub fn channel() -> (Notifier, UnboundedReceiver<EngineEvent>) {
    let (tx, rx) = unbounded_channel();
    (Notifier::new(tx), rx)
}

/// What handling one webhook event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Opened { key: ReviewKey, created: bool },
    Reconciled { key: ReviewKey, report: PassReport },
    BranchUpdated { updated: Vec<ReviewKey>, failed: Vec<ReviewKey> },
    Closed { key: ReviewKey, status: ReviewStatus },
    Reopened { key: ReviewKey, status: ReviewStatus },
    Ignored(String),
}

pub struct Engine {
    store: Arc<dyn ReviewStore>,
    reconciler: Reconciler,
    counter: CounterReconciler,
}

impl Engine {
    pub fn new(
        store: Arc<dyn ReviewStore>,
        diffs: Arc<dyn DiffSource>,
        platform: Arc<dyn Platform>,
        base_url: &str,
        notifier: Notifier,
    ) -> Self {
        let reconciler = Reconciler::new(
            Arc::clone(&store),
            diffs,
            Arc::clone(&platform),
            notifier.clone(),
        );
        let counter = CounterReconciler::new(Arc::clone(&store), platform, base_url, notifier);
        Self {
            store,
            reconciler,
            counter,
        }
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn counter(&self) -> &CounterReconciler {
        &self.counter
    }

    pub async fn handle(&self, event: WebhookEvent) -> Result<Dispatch> {
        match event {
            WebhookEvent::PullRequestOpened(metadata) => {
                let key = metadata.key();
                let created = self.counter.open_review(metadata).await?;
                Ok(Dispatch::Opened { key, created })
            }
            WebhookEvent::PullRequestSynchronized(key) | WebhookEvent::PullRequestRetargeted(key) => {
                let report = self.reconciler.update_pull_request(&key, false).await?;
                Ok(Dispatch::Reconciled { key, report })
            }
            WebhookEvent::PullRequestClosed { key, merged } => {
                let recompute = self.counter.close_review(&key, merged).await?;
                Ok(Dispatch::Closed { key, status: recompute.current })
            }
            WebhookEvent::PullRequestReopened(key) => {
                let recompute = self.counter.reopen_review(&key).await?;
                Ok(Dispatch::Reopened { key, status: recompute.current })
            }
            WebhookEvent::BranchPushed { owner, repo, branch } => {
                self.branch_pushed(&owner, &repo, &branch).await
            }
            WebhookEvent::Ignored(reason) => {
                info!(reason = %reason, "webhook ignored");
                Ok(Dispatch::Ignored(reason))
            }
        }
    }

    /// Update every open review targeting the pushed branch.
    ///
    /// A failing review is logged and does not stop the others.
    async fn branch_pushed(&self, owner: &str, repo: &str, branch: &str) -> Result<Dispatch> {
        let label = format!("{}:{}", owner, branch);
        let keys = self.store.open_reviews_with_base(owner, repo, &label).await?;
        info!(base = %label, reviews = keys.len(), "base branch pushed");

        let mut updated = Vec::new();
        let mut failed = Vec::new();
        for key in keys {
            match self.reconciler.update_pull_request(&key, false).await {
                Ok(_) => updated.push(key),
                Err(e) => {
                    error!(review = %key, error = %e, "failed to update review after push");
                    failed.push(key);
                }
            }
        }
        Ok(Dispatch::BranchUpdated { updated, failed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closed_receiver_is_ignored() {
        let (notifier, rx) = channel();
        drop(rx);
        notifier.send(EngineEvent::ThreadOutdated {
            key: ReviewKey::new("o", "r", 1),
            thread_id: "t".to_string(),
            sha: "s".to_string(),
        });
        Notifier::default().send(EngineEvent::StatusChanged {
            key: ReviewKey::new("o", "r", 1),
            previous: ReviewStatus::NeedsReview,
            current: ReviewStatus::NeedsApproval,
        });
    }

    #[tokio::test]
    async fn events_arrive_in_order() {
        let (notifier, mut rx) = channel();
        let key = ReviewKey::new("o", "r", 1);
        notifier.send(EngineEvent::ThreadOutdated {
            key: key.clone(),
            thread_id: "t1".to_string(),
            sha: "s".to_string(),
        });
        notifier.send(EngineEvent::SummaryPublished { key, review_id: 9, event: None });

        assert!(matches!(rx.recv().await, Some(EngineEvent::ThreadOutdated { .. })));
        assert!(matches!(
            rx.recv().await,
            Some(EngineEvent::SummaryPublished { review_id: 9, .. })
        ));
    }
}
