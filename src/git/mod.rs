//! [`DiffSource`] over a local clone, driven through the `git` CLI.

use crate::ReviewKey;
use crate::platform::{Ancestry, AncestryStatus, DiffSource, PlatformError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

/// Diffs and ancestry read from a local repository.
///
/// The clone must already contain the commits being compared; fetching is
/// left to whoever keeps the clone current.
#[derive(Debug, Clone)]
pub struct LocalGit {
    repo_root: PathBuf,
}

impl LocalGit {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }
}

#[async_trait]
impl DiffSource for LocalGit {
    async fn fetch_diff(&self, key: &ReviewKey, base_sha: &str, head_sha: &str) -> Result<String> {
        validate_git_ref(base_sha)?;
        validate_git_ref(head_sha)?;
        debug!(review = %key, base = base_sha, head = head_sha, "git diff");

        run_git(&self.repo_root, &diff_args(base_sha, head_sha)).await
    }

    async fn compare_ancestry(&self, key: &ReviewKey, sha_a: &str, sha_b: &str) -> Result<Ancestry> {
        validate_git_ref(sha_a)?;
        validate_git_ref(sha_b)?;
        debug!(review = %key, from = sha_a, to = sha_b, "git rev-list");

        let range = format!("{}...{}", sha_a, sha_b);
        let stdout = run_git(
            &self.repo_root,
            &["rev-list", "--count", "--left-right", &range],
        )
        .await?;

        parse_left_right(&stdout)
    }
}

/// `git diff` arguments with the `a/` and `b/` prefixes pinned, whatever the
/// user's `diff.noprefix` or `diff.mnemonicPrefix` settings say.
fn diff_args<'a>(base_sha: &'a str, head_sha: &'a str) -> [&'a str; 8] {
    [
        "diff",
        "--no-color",
        "--no-ext-diff",
        "--src-prefix=a/",
        "--dst-prefix=b/",
        "-M",
        base_sha,
        head_sha,
    ]
}

/// Parse `git rev-list --left-right --count A...B` output: commits only in A
/// (B is behind by), then commits only in B (B is ahead by).
fn parse_left_right(stdout: &str) -> Result<Ancestry> {
    let mut parts = stdout.split_whitespace();
    let counts = (
        parts.next().and_then(|p| p.parse::<u32>().ok()),
        parts.next().and_then(|p| p.parse::<u32>().ok()),
    );
    let (Some(behind_by), Some(ahead_by)) = counts else {
        return Err(PlatformError::Command(format!(
            "unexpected rev-list output: {}",
            stdout.trim()
        )));
    };

    let status = match (ahead_by, behind_by) {
        (0, 0) => AncestryStatus::Identical,
        (_, 0) => AncestryStatus::Ahead,
        (0, _) => AncestryStatus::Behind,
        _ => AncestryStatus::Diverged,
    };

    Ok(Ancestry {
        status,
        ahead_by,
        behind_by,
    })
}

async fn run_git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git").arg("-C").arg(dir).args(args).output().await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PlatformError::Command(format!(
            "git {} failed: {}",
            args.first().unwrap_or(&""),
            stderr.trim()
        )));
    }

    String::from_utf8(output.stdout)
        .map_err(|e| PlatformError::Command(format!("git output is not valid UTF-8: {}", e)))
}

/// Validate a git ref to prevent option injection.
///
/// Allows: alphanumeric, dash, underscore, slash, dot, tilde, caret, @
pub fn validate_git_ref(ref_str: &str) -> Result<()> {
    if ref_str.is_empty() {
        return Err(PlatformError::InvalidRef("Empty git ref".to_string()));
    }

    if ref_str.starts_with('-') {
        return Err(PlatformError::InvalidRef(format!(
            "git ref may not start with '-': {}",
            ref_str
        )));
    }

    for ch in ref_str.chars() {
        if !ch.is_alphanumeric() && !matches!(ch, '-' | '_' | '/' | '.' | '~' | '^' | '@') {
            return Err(PlatformError::InvalidRef(format!(
                "Invalid character in git ref: '{}'",
                ch
            )));
        }
    }

    Ok(())
}
