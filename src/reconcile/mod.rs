//! Thread reconciliation: keeps every thread anchored as a review's base and
//! head move.

use crate::engine::{EngineEvent, Notifier};
use crate::parser::{ChangeKind, FileDiff, ParseError, parse_diff};
use crate::platform::{Ancestry, AncestryStatus, DiffSource, Platform, PlatformError};
use crate::store::{ReviewStore, StoreError};
use crate::translate::{Direction, changes_at, find_file, has_change_at, translate_in};
use crate::{ReviewKey, ReviewMetadata, Side, ThreadArgs};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Platform(#[from] PlatformError),
    #[error("malformed diff: {0}")]
    Parse(#[from] ParseError),
}

pub type Result<T> = std::result::Result<T, ReconcileError>;

/// What one pass decided for one thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// No write needed.
    Unchanged,
    /// Still located; the new position.
    Moved(ThreadArgs),
    /// Lost its anchor in this pass.
    Outdated(ThreadArgs),
    /// Already outdated; only the commit advanced.
    Carried(ThreadArgs),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub moved: usize,
    pub outdated: usize,
    pub carried: usize,
    pub unchanged: usize,
    /// Writes skipped because another writer changed the thread first.
    pub conflicts: usize,
}

/// One async mutex per review.
///
/// Held across the metadata refresh and the thread loop so two passes over
/// the same review never interleave inside this process. Entries nobody holds
/// or waits on are dropped on the next acquire, so the map only tracks
/// reviews with a pass in flight.
#[derive(Debug, Clone, Default)]
pub struct ReviewLocks {
    locks: Arc<Mutex<HashMap<ReviewKey, Arc<tokio::sync::Mutex<()>>>>>,
}

impl ReviewLocks {
    pub async fn acquire(&self, key: &ReviewKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        lock.lock_owned().await
    }
}

/// Diffs fetched during one pass.
///
/// The whole-review diff is fetched at most once; intermediate diffs and
/// ancestry answers are cached by commit pair.
pub struct PassDiffs<'a> {
    source: &'a dyn DiffSource,
    key: &'a ReviewKey,
    whole: Option<Vec<FileDiff>>,
    between: HashMap<(String, String), Vec<FileDiff>>,
    ancestry: HashMap<(String, String), Ancestry>,
}

impl<'a> PassDiffs<'a> {
    pub fn new(source: &'a dyn DiffSource, key: &'a ReviewKey) -> Self {
        Self {
            source,
            key,
            whole: None,
            between: HashMap::new(),
            ancestry: HashMap::new(),
        }
    }

    async fn whole(&mut self, metadata: &ReviewMetadata) -> Result<&[FileDiff]> {
        if self.whole.is_none() {
            let raw = self
                .source
                .fetch_diff(self.key, &metadata.base.sha, &metadata.head.sha)
                .await?;
            self.whole = Some(parse_diff(&raw)?);
        }
        Ok(self.whole.as_deref().unwrap_or_default())
    }

    async fn between(&mut self, from: &str, to: &str) -> Result<&[FileDiff]> {
        let pair = (from.to_string(), to.to_string());
        if !self.between.contains_key(&pair) {
            let raw = self.source.fetch_diff(self.key, from, to).await?;
            self.between.insert(pair.clone(), parse_diff(&raw)?);
        }
        Ok(self.between.get(&pair).map(Vec::as_slice).unwrap_or_default())
    }

    async fn ancestry(&mut self, from: &str, to: &str) -> Result<Ancestry> {
        let pair = (from.to_string(), to.to_string());
        if let Some(ancestry) = self.ancestry.get(&pair) {
            return Ok(*ancestry);
        }
        let ancestry = self.source.compare_ancestry(self.key, from, to).await?;
        self.ancestry.insert(pair, ancestry);
        Ok(ancestry)
    }
}

/// Decide the transition of one thread from `old` to `new` metadata.
///
/// Rules run in order and the first that fires wins. A thread that has to
/// move is translated through the diff from its current commit first; the
/// whole-review presence check then runs on the translated line.
pub async fn reconcile_thread(
    diffs: &mut PassDiffs<'_>,
    current: &ThreadArgs,
    old: &ReviewMetadata,
    new: &ReviewMetadata,
    force: bool,
) -> Result<Transition> {
    let relevant_sha = new.relevant_sha(current.side);

    if current.is_outdated() {
        if current.sha == relevant_sha {
            return Ok(Transition::Unchanged);
        }
        return Ok(Transition::Carried(current.outdated_at(relevant_sha)));
    }

    let metadata_moved = old.base.sha != new.base.sha || old.head.sha != new.head.sha;
    if current.sha == relevant_sha && !metadata_moved && !force {
        return Ok(Transition::Unchanged);
    }

    let mut next = current.clone();
    if current.sha != relevant_sha {
        let ancestry = diffs.ancestry(&current.sha, relevant_sha).await?;
        let direction = match ancestry.status {
            AncestryStatus::Behind => Direction::Reversed,
            _ => Direction::Forward,
        };
        let intermediate = match direction {
            Direction::Forward => diffs.between(&current.sha, relevant_sha).await?,
            Direction::Reversed => diffs.between(relevant_sha, &current.sha).await?,
        };

        match find_file(intermediate, &current.file, direction) {
            Some(file_diff) => {
                let kind = direction.disqualifying();
                if has_change_at(file_diff, current.line, direction.anchored_side(), kind) {
                    debug!(file = %current.file, line = current.line, ?kind, "anchor line removed");
                    return Ok(Transition::Outdated(current.outdated_at(relevant_sha)));
                }
            }
            None => debug!(file = %current.file, "file untouched between commits"),
        }
        if let Some(moved) = translate_in(intermediate, &current.file, current.line, direction) {
            next.file = moved.file;
            next.line = moved.line;
        }
        next.sha = relevant_sha.to_string();
    }

    let whole = diffs.whole(new).await?;
    let file_diff = find_file(whole, &next.file, whole_diff_direction(next.side));
    if let Some(file_diff) = file_diff {
        let present = changes_at(file_diff, next.line, next.side)
            .into_iter()
            .find(|change| required_kind(next.side, change.kind()));
        match present {
            Some(change) => next.line_content = change.content().to_string(),
            None => {
                debug!(file = %next.file, line = next.line, side = %next.side, "line not in review diff");
                return Ok(Transition::Outdated(next.outdated_at(relevant_sha)));
            }
        }
    }

    if next == *current {
        Ok(Transition::Unchanged)
    } else {
        Ok(Transition::Moved(next))
    }
}

/// Right-side threads are looked up by their "to" path, left-side by "from".
fn whole_diff_direction(side: Side) -> Direction {
    match side {
        Side::Right => Direction::Reversed,
        Side::Left => Direction::Forward,
    }
}

fn required_kind(side: Side, kind: ChangeKind) -> bool {
    match side {
        Side::Right => matches!(kind, ChangeKind::Add | ChangeKind::Normal),
        Side::Left => kind == ChangeKind::Del,
    }
}

/// Drives reconciliation passes against the injected capabilities.
pub struct Reconciler {
    store: Arc<dyn ReviewStore>,
    diffs: Arc<dyn DiffSource>,
    platform: Arc<dyn Platform>,
    locks: ReviewLocks,
    notifier: Notifier,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ReviewStore>,
        diffs: Arc<dyn DiffSource>,
        platform: Arc<dyn Platform>,
        notifier: Notifier,
    ) -> Self {
        Self {
            store,
            diffs,
            platform,
            locks: ReviewLocks::default(),
            notifier,
        }
    }

    /// Refresh a review's metadata from the platform and reconcile every
    /// thread against it.
    pub async fn update_pull_request(&self, key: &ReviewKey, force: bool) -> Result<PassReport> {
        let _guard = self.locks.acquire(key).await;

        let old = self.store.load_review(key).await?.metadata;
        let new = self.platform.fetch_current_metadata(key).await?;
        if new != old {
            info!(
                review = %key,
                base = %new.base.sha,
                head = %new.head.sha,
                "pull request metadata changed"
            );
            self.store.update_metadata(key, &new).await?;
        }

        self.reconcile_threads(key, &old, &new, force).await
    }

    /// Reconcile every thread of a review between two known metadata values.
    pub async fn reconcile_review(
        &self,
        key: &ReviewKey,
        old: &ReviewMetadata,
        new: &ReviewMetadata,
        force: bool,
    ) -> Result<PassReport> {
        let _guard = self.locks.acquire(key).await;
        self.reconcile_threads(key, old, new, force).await
    }

    async fn reconcile_threads(
        &self,
        key: &ReviewKey,
        old: &ReviewMetadata,
        new: &ReviewMetadata,
        force: bool,
    ) -> Result<PassReport> {
        let threads = self.store.list_threads(key).await?;
        let mut diffs = PassDiffs::new(self.diffs.as_ref(), key);
        let mut report = PassReport::default();

        for thread in &threads {
            let current = &thread.current_args;
            let transition = reconcile_thread(&mut diffs, current, old, new, force).await?;

            let next = match &transition {
                Transition::Unchanged => {
                    report.unchanged += 1;
                    continue;
                }
                Transition::Moved(next) | Transition::Outdated(next) | Transition::Carried(next) => next,
            };

            let written = self
                .store
                .compare_and_set_position(key, &thread.id, current, next)
                .await?;
            if !written {
                warn!(review = %key, thread_id = %thread.id, "thread changed during reconciliation, skipping");
                report.conflicts += 1;
                continue;
            }

            match transition {
                Transition::Moved(to) => {
                    debug!(
                        review = %key,
                        thread_id = %thread.id,
                        file = %to.file,
                        line = to.line,
                        sha = %to.sha,
                        "thread moved"
                    );
                    report.moved += 1;
                    self.notifier.send(EngineEvent::ThreadMoved {
                        key: key.clone(),
                        thread_id: thread.id.clone(),
                        from: current.clone(),
                        to,
                    });
                }
                Transition::Outdated(to) => {
                    info!(review = %key, thread_id = %thread.id, sha = %to.sha, "thread outdated");
                    report.outdated += 1;
                    self.notifier.send(EngineEvent::ThreadOutdated {
                        key: key.clone(),
                        thread_id: thread.id.clone(),
                        sha: to.sha,
                    });
                }
                Transition::Carried(_) => report.carried += 1,
                Transition::Unchanged => {}
            }
        }

        info!(
            review = %key,
            moved = report.moved,
            outdated = report.outdated,
            carried = report.carried,
            unchanged = report.unchanged,
            conflicts = report.conflicts,
            "reconciliation pass complete"
        );
        Ok(report)
    }
}
