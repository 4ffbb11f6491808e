use anyhow::{Context, Result, bail};
use std::sync::Arc;
use tracing::{debug, warn};

use review_sync::cli::{self, CommentArgs, Commands, NewThreadArgs, ReviewerArgs, WebhookArgs};
use review_sync::config::{Config, DiffSourceKind};
use review_sync::engine::{Engine, Notifier};
use review_sync::git::LocalGit;
use review_sync::github::{GitHubClient, StaticToken};
use review_sync::platform::{DiffSource, Offline, Platform};
use review_sync::snapshot::ReviewSnapshot;
use review_sync::store::{ReviewDb, ReviewStore, ReviewerChange, StatusRecompute};
use review_sync::summary::review_comment;
use review_sync::webhook::{parse_event, verify_signature};
use review_sync::{Comment, ReviewKey, Thread, ThreadArgs, now_millis};
use secrecy::ExposeSecret;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::parse_args();

    let config = Config::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    let log_level = args.log_level.as_deref().unwrap_or(&config.log_level);
    init_tracing(log_level);

    let app = App::connect(&config)?;

    match args.command {
        Commands::Webhook(webhook) => handle_webhook(&app, &config, &webhook).await?,
        Commands::Sync { review, force } => {
            let report = app
                .engine
                .reconciler()
                .update_pull_request(&review, force)
                .await
                .with_context(|| format!("failed to sync {}", review))?;
            println!(
                "{}: {} moved, {} outdated, {} carried, {} unchanged, {} conflicts",
                review, report.moved, report.outdated, report.carried, report.unchanged, report.conflicts
            );
        }
        Commands::Show { review } => handle_show(&app, &review).await?,
        Commands::Thread(thread) => handle_thread(&app, thread).await?,
        Commands::Comment(comment) => handle_comment(&app, comment).await?,
        Commands::Resolve(resolve) => {
            let recompute = app
                .engine
                .counter()
                .resolve_thread(&resolve.review, &resolve.thread, !resolve.reopen)
                .await?;
            print_status(&resolve.review, &recompute);
        }
        Commands::Reviewer(reviewer) => handle_reviewer(&app, reviewer).await?,
        Commands::SendDrafts { review, author } => {
            let recompute = app.engine.counter().send_drafts(&review, &author).await?;
            print_status(&review, &recompute);
        }
        Commands::Recount { review } => {
            let recompute = app.engine.counter().recount(&review).await?;
            println!("{}: {} unresolved", review, recompute.review.state.unresolved);
            print_status(&review, &recompute);
        }
        Commands::Summary { review } => {
            let snapshot = ReviewSnapshot::load(app.store.as_ref(), &review).await?;
            let review = &snapshot.review;
            println!(
                "{}",
                review_comment(&config.review.base_url, &review.metadata, &review.state, &snapshot.threads)
            );
        }
    }

    Ok(())
}

fn init_tracing(log_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("review_sync={log_level},warn")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

struct App {
    store: Arc<dyn ReviewStore>,
    engine: Engine,
}

impl App {
    fn connect(config: &Config) -> Result<Self> {
        let db_path = &config.storage.database;
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let store: Arc<dyn ReviewStore> = Arc::new(
            ReviewDb::open(db_path).with_context(|| format!("failed to open {}", db_path.display()))?,
        );

        let (platform, github_diffs): (Arc<dyn Platform>, Arc<dyn DiffSource>) = match config.github_token() {
            Ok(token) => {
                let credentials = Arc::new(StaticToken::new(token));
                let installation_id = config.github.installation_id.unwrap_or_default();
                let client = Arc::new(
                    GitHubClient::new(credentials, installation_id)?.with_base_url(&config.github.api_url),
                );
                let platform: Arc<dyn Platform> = client.clone();
                let diffs: Arc<dyn DiffSource> = client;
                (platform, diffs)
            }
            Err(e) => {
                debug!(error = %e, "no GitHub token, platform calls disabled");
                let platform: Arc<dyn Platform> = Arc::new(Offline);
                let diffs: Arc<dyn DiffSource> = Arc::new(Offline);
                (platform, diffs)
            }
        };

        let diffs: Arc<dyn DiffSource> = match (config.diff.source, &config.diff.local_repo) {
            (DiffSourceKind::Local, Some(repo)) => Arc::new(LocalGit::new(repo)),
            (DiffSourceKind::Local, None) => bail!("diff source 'local' requires [diff] local_repo"),
            (DiffSourceKind::Github, _) => github_diffs,
        };

        let engine = Engine::new(
            Arc::clone(&store),
            diffs,
            platform,
            &config.review.base_url,
            Notifier::default(),
        );
        Ok(Self { store, engine })
    }
}

async fn handle_webhook(app: &App, config: &Config, args: &WebhookArgs) -> Result<()> {
    let body = tokio::fs::read(&args.payload)
        .await
        .with_context(|| format!("failed to read {}", args.payload.display()))?;

    match config.webhook_secret() {
        Ok(secret) => verify_signature(secret.expose_secret().as_bytes(), &body, args.signature.as_deref())
            .context("webhook rejected")?,
        Err(_) if args.signature.is_some() => {
            bail!("cannot verify signature: {} is not set", config.webhook.secret_env)
        }
        Err(_) => warn!("webhook secret not configured, skipping signature verification"),
    }

    let event = parse_event(&args.event, &body)?;
    let dispatch = app.engine.handle(event).await?;
    println!("{:?}", dispatch);
    Ok(())
}

async fn handle_show(app: &App, key: &ReviewKey) -> Result<()> {
    let snapshot = ReviewSnapshot::load(app.store.as_ref(), key).await?;
    let metadata = &snapshot.review.metadata;
    let state = &snapshot.review.state;

    println!("{} {}", key, metadata.title);
    println!("─────────────────────────────────────");
    println!("  Status:     {}", state.status);
    println!("  Base:       {} ({})", metadata.base.label, metadata.base.sha);
    println!("  Head:       {} ({})", metadata.head.label, metadata.head.sha);
    println!("  Reviewers:  {}", join_or_none(&state.reviewers));
    println!("  Approvers:  {}", join_or_none(&state.approvers));
    println!("  Unresolved: {}", state.unresolved);

    for (file, threads) in snapshot.threads_by_file() {
        println!("\n{}", file);
        for thread in threads {
            let args = &thread.current_args;
            let position = if args.is_outdated() {
                "outdated".to_string()
            } else {
                format!("line {} ({})", args.line, args.side)
            };
            let mut flags = vec![if thread.resolved { "resolved" } else { "open" }];
            if thread.draft {
                flags.push("draft");
            }
            println!("  [{}] {} by {} [{}]", thread.id, position, thread.username, flags.join(", "));
            for comment in snapshot.comments_for(&thread.id) {
                let draft = if comment.draft { " (draft)" } else { "" };
                println!("      {}{}: {}", comment.username, draft, comment.text);
            }
        }
    }
    Ok(())
}

async fn handle_thread(app: &App, args: NewThreadArgs) -> Result<()> {
    let thread = Thread::new(
        uuid::Uuid::new_v4().to_string(),
        &args.author,
        ThreadArgs {
            file: args.file,
            sha: args.sha,
            line: args.line,
            side: args.side,
            line_content: args.content,
        },
        args.draft,
    );
    let comment = Comment {
        id: uuid::Uuid::new_v4().to_string(),
        thread_id: thread.id.clone(),
        username: args.author,
        draft: args.draft,
        timestamp: now_millis(),
        text: args.text,
    };

    let recompute = app.engine.counter().add_thread(&args.review, &thread, &comment).await?;
    println!("{}", thread.id);
    print_status(&args.review, &recompute);
    Ok(())
}

async fn handle_comment(app: &App, args: CommentArgs) -> Result<()> {
    let comment = Comment {
        id: uuid::Uuid::new_v4().to_string(),
        thread_id: args.thread.clone(),
        username: args.author,
        draft: args.draft,
        timestamp: now_millis(),
        text: args.text,
    };

    let counter = app.engine.counter();
    let recompute = counter.add_comment(&args.review, &comment).await?;
    if args.resolve {
        counter.stage_resolution(&args.review, &args.thread, true).await?;
    }
    println!("{}", comment.id);
    print_status(&args.review, &recompute);
    Ok(())
}

async fn handle_reviewer(app: &App, args: ReviewerArgs) -> Result<()> {
    let change = if args.approve {
        ReviewerChange::Approve(args.user)
    } else if args.unapprove {
        ReviewerChange::Unapprove(args.user)
    } else if args.remove {
        ReviewerChange::Remove(args.user)
    } else {
        ReviewerChange::Add(args.user)
    };
    let recompute = app.engine.counter().change_reviewer(&args.review, &change).await?;
    print_status(&args.review, &recompute);
    Ok(())
}

fn print_status(key: &ReviewKey, recompute: &StatusRecompute) {
    if recompute.changed() {
        println!("{}: {} -> {}", key, recompute.previous, recompute.current);
    } else {
        println!("{}: {}", key, recompute.current);
    }
}

fn join_or_none(users: &std::collections::BTreeSet<String>) -> String {
    if users.is_empty() {
        "none".to_string()
    } else {
        users.iter().cloned().collect::<Vec<_>>().join(", ")
    }
}
