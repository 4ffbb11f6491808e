#![allow(dead_code)]

use async_trait::async_trait;
use review_sync::platform::{
    Ancestry, AncestryStatus, DiffSource, Platform, PlatformError, Result, ReviewEvent,
};
use review_sync::store::{ReviewDb, ReviewStore};
use review_sync::{CommitRef, Review, ReviewKey, ReviewMetadata, Side, Thread, ThreadArgs};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, Semaphore};

pub fn key() -> ReviewKey {
    ReviewKey::new("octo", "widgets", 7)
}

pub fn metadata(base: &str, head: &str) -> ReviewMetadata {
    ReviewMetadata {
        owner: "octo".to_string(),
        repo: "widgets".to_string(),
        number: 7,
        author: "carol".to_string(),
        title: "Add widgets".to_string(),
        base: CommitRef {
            label: "octo:main".to_string(),
            sha: base.to_string(),
        },
        head: CommitRef {
            label: "carol:feature".to_string(),
            sha: head.to_string(),
        },
        updated_at: 0,
    }
}

pub fn args(file: &str, sha: &str, line: i64, side: Side) -> ThreadArgs {
    ThreadArgs {
        file: file.to_string(),
        sha: sha.to_string(),
        line,
        side,
        line_content: String::new(),
    }
}

pub async fn seeded_store(metadata: ReviewMetadata, threads: &[Thread]) -> Arc<ReviewDb> {
    let store = Arc::new(ReviewDb::open_in_memory().unwrap());
    let key = metadata.key();
    store.create_review(&Review::new(metadata)).await.unwrap();
    for thread in threads {
        store.insert_thread(&key, thread).await.unwrap();
    }
    store
}

/// Diffs keyed by `from..to`. Unknown pairs are empty diffs.
#[derive(Debug, Clone, Default)]
pub struct FakeDiffs {
    diffs: HashMap<String, String>,
    behind: HashSet<String>,
    failing: HashSet<String>,
}

impl FakeDiffs {
    pub fn with_diff(mut self, from: &str, to: &str, diff: &str) -> Self {
        self.diffs.insert(format!("{}..{}", from, to), diff.to_string());
        self
    }

    /// `to` is an ancestor of `from`.
    pub fn with_behind(mut self, from: &str, to: &str) -> Self {
        self.behind.insert(format!("{}..{}", from, to));
        self
    }

    pub fn with_failure(mut self, from: &str, to: &str) -> Self {
        self.failing.insert(format!("{}..{}", from, to));
        self
    }
}

#[async_trait]
impl DiffSource for FakeDiffs {
    async fn fetch_diff(&self, _key: &ReviewKey, base_sha: &str, head_sha: &str) -> Result<String> {
        let pair = format!("{}..{}", base_sha, head_sha);
        if self.failing.contains(&pair) {
            return Err(PlatformError::Command(format!("diff {} unavailable", pair)));
        }
        Ok(self.diffs.get(&pair).cloned().unwrap_or_default())
    }

    async fn compare_ancestry(&self, _key: &ReviewKey, sha_a: &str, sha_b: &str) -> Result<Ancestry> {
        let behind = self.behind.contains(&format!("{}..{}", sha_a, sha_b));
        Ok(Ancestry {
            status: if behind {
                AncestryStatus::Behind
            } else {
                AncestryStatus::Ahead
            },
            ahead_by: u32::from(!behind),
            behind_by: u32::from(behind),
        })
    }
}

/// Wraps a diff source and parks every diff fetch until the gate opens.
pub struct PausingDiffs {
    pub inner: FakeDiffs,
    pub arrived: Arc<Notify>,
    pub gate: Arc<Semaphore>,
}

#[async_trait]
impl DiffSource for PausingDiffs {
    async fn fetch_diff(&self, key: &ReviewKey, base_sha: &str, head_sha: &str) -> Result<String> {
        self.arrived.notify_one();
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| PlatformError::Command(e.to_string()))?;
        self.inner.fetch_diff(key, base_sha, head_sha).await
    }

    async fn compare_ancestry(&self, key: &ReviewKey, sha_a: &str, sha_b: &str) -> Result<Ancestry> {
        self.inner.compare_ancestry(key, sha_a, sha_b).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Posted {
    pub key: ReviewKey,
    pub event: ReviewEvent,
    pub body: String,
}

/// Serves metadata from a map and records published summaries.
#[derive(Default)]
pub struct FakePlatform {
    metadata: Mutex<HashMap<ReviewKey, ReviewMetadata>>,
    pub posted: Mutex<Vec<Posted>>,
    pub updated: Mutex<Vec<(u64, String)>>,
    next_id: AtomicU64,
}

impl FakePlatform {
    pub fn with_metadata(metadata: ReviewMetadata) -> Self {
        let platform = Self::default();
        platform.set_metadata(metadata);
        platform
    }

    pub fn set_metadata(&self, metadata: ReviewMetadata) {
        self.metadata.lock().unwrap().insert(metadata.key(), metadata);
    }

    pub fn posted(&self) -> Vec<Posted> {
        self.posted.lock().unwrap().clone()
    }

    pub fn updated(&self) -> Vec<(u64, String)> {
        self.updated.lock().unwrap().clone()
    }
}

#[async_trait]
impl Platform for FakePlatform {
    async fn fetch_current_metadata(&self, key: &ReviewKey) -> Result<ReviewMetadata> {
        self.metadata
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| PlatformError::Status {
                endpoint: format!("pulls/{}", key.number),
                status: 404,
                body: "Not Found".to_string(),
            })
    }

    async fn post_review_summary(&self, key: &ReviewKey, event: ReviewEvent, body: &str) -> Result<u64> {
        self.posted.lock().unwrap().push(Posted {
            key: key.clone(),
            event,
            body: body.to_string(),
        });
        Ok(100 + self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn update_review_summary(&self, _key: &ReviewKey, review_id: u64, body: &str) -> Result<()> {
        self.updated.lock().unwrap().push((review_id, body.to_string()));
        Ok(())
    }
}
