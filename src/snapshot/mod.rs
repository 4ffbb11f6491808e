//! Immutable read model of one review.
//!
//! A snapshot is loaded once and never mutated; every view below is a pure
//! function over it. A fresher view means loading a fresh snapshot.

use crate::status::estimate_status;
use crate::store::{ReviewStore, Result};
use crate::{Comment, Review, ReviewKey, ReviewStatus, Side, Thread};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewSnapshot {
    pub review: Review,
    pub threads: Vec<Thread>,
    pub comments: Vec<Comment>,
}

impl ReviewSnapshot {
    pub async fn load(store: &dyn ReviewStore, key: &ReviewKey) -> Result<Self> {
        let review = store.load_review(key).await?;
        let threads = store.list_threads(key).await?;
        let comments = store.list_comments(key).await?;
        Ok(Self {
            review,
            threads,
            comments,
        })
    }

    pub fn thread(&self, id: &str) -> Option<&Thread> {
        self.threads.iter().find(|t| t.id == id)
    }

    /// Threads anchored at an exact position.
    pub fn threads_at(&self, file: &str, line: i64, side: Side) -> Vec<&Thread> {
        self.threads
            .iter()
            .filter(|t| {
                let args = &t.current_args;
                args.file == file && args.line == line && args.side == side
            })
            .collect()
    }

    /// Threads grouped by their current file, in path order.
    pub fn threads_by_file(&self) -> BTreeMap<&str, Vec<&Thread>> {
        let mut files: BTreeMap<&str, Vec<&Thread>> = BTreeMap::new();
        for thread in &self.threads {
            files
                .entry(thread.current_args.file.as_str())
                .or_default()
                .push(thread);
        }
        files
    }

    /// Comments of one thread, oldest first.
    pub fn comments_for(&self, thread_id: &str) -> Vec<&Comment> {
        let mut comments: Vec<&Comment> = self
            .comments
            .iter()
            .filter(|c| c.thread_id == thread_id)
            .collect();
        comments.sort_by_key(|c| c.timestamp);
        comments
    }

    /// An author's unsent drafts: (threads, comments).
    pub fn drafts(&self, author: &str) -> (Vec<&Thread>, Vec<&Comment>) {
        let threads = self
            .threads
            .iter()
            .filter(|t| t.draft && t.username == author)
            .collect();
        let comments = self
            .comments
            .iter()
            .filter(|c| c.draft && c.username == author)
            .collect();
        (threads, comments)
    }

    /// Status computed from this snapshot's threads rather than the counter.
    pub fn estimated_status(&self) -> ReviewStatus {
        estimate_status(&self.review.state, &self.threads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CommitRef, ReviewMetadata, ThreadArgs};

    fn args(file: &str, line: i64) -> ThreadArgs {
        ThreadArgs {
            file: file.to_string(),
            sha: "h1".to_string(),
            line,
            side: Side::Right,
            line_content: String::new(),
        }
    }

    fn comment(id: &str, thread_id: &str, user: &str, draft: bool, timestamp: i64) -> Comment {
        Comment {
            id: id.to_string(),
            thread_id: thread_id.to_string(),
            username: user.to_string(),
            draft,
            timestamp,
            text: id.to_string(),
        }
    }

    fn snapshot() -> ReviewSnapshot {
        let mut review = Review::new(ReviewMetadata {
            owner: "octo".to_string(),
            repo: "widgets".to_string(),
            number: 1,
            author: "carol".to_string(),
            title: "t".to_string(),
            base: CommitRef { label: "octo:main".to_string(), sha: "b1".to_string() },
            head: CommitRef { label: "octo:f".to_string(), sha: "h1".to_string() },
            updated_at: 0,
        });
        review.state.add_approver("bob");

        ReviewSnapshot {
            review,
            threads: vec![
                Thread::new("t1", "alice", args("b.rs", 3), false),
                Thread::new("t2", "alice", args("a.rs", 3), true),
                Thread::new("t3", "bob", args("b.rs", 9), false),
            ],
            comments: vec![
                comment("c2", "t1", "bob", false, 20),
                comment("c1", "t1", "alice", false, 10),
                comment("c3", "t2", "alice", true, 30),
            ],
        }
    }

    #[test]
    fn groups_threads_by_file() {
        let snap = snapshot();
        let files = snap.threads_by_file();
        assert_eq!(files.keys().copied().collect::<Vec<_>>(), vec!["a.rs", "b.rs"]);
        assert_eq!(files["b.rs"].len(), 2);
    }

    #[test]
    fn comments_come_back_in_time_order() {
        let snap = snapshot();
        let ids: Vec<&str> = snap.comments_for("t1").iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c2"]);
    }

    #[test]
    fn drafts_are_per_author() {
        let snap = snapshot();
        let (threads, comments) = snap.drafts("alice");
        assert_eq!(threads.len(), 1);
        assert_eq!(comments.len(), 1);
        let (threads, comments) = snap.drafts("bob");
        assert!(threads.is_empty() && comments.is_empty());
    }

    #[test]
    fn finds_threads_by_position() {
        let snap = snapshot();
        assert_eq!(snap.threads_at("b.rs", 3, Side::Right)[0].id, "t1");
        assert!(snap.threads_at("b.rs", 3, Side::Left).is_empty());
        assert!(snap.thread("t3").is_some());
    }

    #[test]
    fn estimate_ignores_drafts() {
        let snap = snapshot();
        assert_eq!(snap.estimated_status(), ReviewStatus::NeedsResolution);
    }
}
