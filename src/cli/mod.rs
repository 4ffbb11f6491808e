use crate::config::DEFAULT_CONFIG_FILE;
use crate::{ReviewKey, Side};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "review-sync",
    about = "Keep pull request review threads anchored as branches move"
)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// Log level used when RUST_LOG is unset (overrides the config file).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Verify, parse and dispatch one webhook delivery.
    Webhook(WebhookArgs),
    /// Refresh a pull request from the platform and reconcile its threads.
    Sync {
        /// Review to update (OWNER/REPO#NUMBER).
        review: ReviewKey,
        /// Re-check every thread even if nothing moved.
        #[arg(long)]
        force: bool,
    },
    /// Print review state, threads and comments.
    Show {
        review: ReviewKey,
    },
    /// Start a new thread with its first comment.
    Thread(NewThreadArgs),
    /// Reply to a thread.
    Comment(CommentArgs),
    /// Resolve (or reopen) a thread.
    Resolve(ResolveArgs),
    /// Add, approve, unapprove or remove a reviewer.
    Reviewer(ReviewerArgs),
    /// Publish an author's draft threads and comments.
    SendDrafts {
        review: ReviewKey,
        #[arg(long)]
        author: String,
    },
    /// Recompute the unresolved counter from the threads.
    Recount {
        review: ReviewKey,
    },
    /// Print the markdown review summary.
    Summary {
        review: ReviewKey,
    },
}

#[derive(Args, Debug)]
pub struct WebhookArgs {
    /// Event name, as sent in X-GitHub-Event.
    #[arg(long)]
    pub event: String,
    /// File holding the raw request body.
    #[arg(long)]
    pub payload: PathBuf,
    /// X-Hub-Signature-256 header value.
    #[arg(long)]
    pub signature: Option<String>,
}

#[derive(Args, Debug)]
pub struct NewThreadArgs {
    pub review: ReviewKey,
    #[arg(long)]
    pub file: String,
    #[arg(long)]
    pub line: i64,
    #[arg(long)]
    pub side: Side,
    /// Commit the line number refers to.
    #[arg(long)]
    pub sha: String,
    #[arg(long)]
    pub author: String,
    #[arg(long)]
    pub text: String,
    /// Text of the anchored line, if known.
    #[arg(long, default_value = "")]
    pub content: String,
    #[arg(long)]
    pub draft: bool,
}

#[derive(Args, Debug)]
pub struct CommentArgs {
    pub review: ReviewKey,
    pub thread: String,
    #[arg(long)]
    pub author: String,
    #[arg(long)]
    pub text: String,
    #[arg(long)]
    pub draft: bool,
    /// Stage a resolution, applied when the drafts are sent.
    #[arg(long, requires = "draft")]
    pub resolve: bool,
}

#[derive(Args, Debug)]
pub struct ResolveArgs {
    pub review: ReviewKey,
    pub thread: String,
    /// Mark the thread unresolved again.
    #[arg(long)]
    pub reopen: bool,
}

#[derive(Args, Debug)]
pub struct ReviewerArgs {
    pub review: ReviewKey,
    pub user: String,
    #[arg(long, conflicts_with_all = ["remove", "unapprove"])]
    pub approve: bool,
    #[arg(long, conflicts_with = "unapprove")]
    pub remove: bool,
    #[arg(long)]
    pub unapprove: bool,
}

/// Parse CLI arguments.
pub fn parse_args() -> Cli {
    Cli::parse()
}
