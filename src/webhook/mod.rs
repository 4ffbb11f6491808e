//! Webhook deliveries: signature verification and payload parsing.

use crate::github::PullRequest;
use crate::{ReviewKey, ReviewMetadata};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_PREFIX: &str = "sha256=";

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("missing signature header")]
    MissingSignature,
    #[error("malformed signature: {0}")]
    MalformedSignature(String),
    #[error("signature does not match payload")]
    SignatureMismatch,
    #[error("invalid webhook secret")]
    InvalidSecret,
    #[error("invalid {event} payload: {source}")]
    Payload {
        event: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, WebhookError>;

/// Check an `X-Hub-Signature-256` header against the raw body.
///
/// The comparison runs in constant time.
pub fn verify_signature(secret: &[u8], body: &[u8], signature: Option<&str>) -> Result<()> {
    let signature = signature.ok_or(WebhookError::MissingSignature)?;
    let hex_digest = signature
        .strip_prefix(SIGNATURE_PREFIX)
        .ok_or_else(|| WebhookError::MalformedSignature("expected sha256= prefix".to_string()))?;
    let expected = hex::decode(hex_digest).map_err(|e| WebhookError::MalformedSignature(e.to_string()))?;

    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| WebhookError::InvalidSecret)?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| WebhookError::SignatureMismatch)
}

/// Signature header value for `body`.
pub fn sign(secret: &[u8], body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| WebhookError::InvalidSecret)?;
    mac.update(body);
    Ok(format!("{}{}", SIGNATURE_PREFIX, hex::encode(mac.finalize().into_bytes())))
}

/// A delivery reduced to what the engine acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEvent {
    PullRequestOpened(ReviewMetadata),
    /// New commits on the head branch.
    PullRequestSynchronized(ReviewKey),
    /// The base branch was changed.
    PullRequestRetargeted(ReviewKey),
    PullRequestClosed { key: ReviewKey, merged: bool },
    PullRequestReopened(ReviewKey),
    /// Commits pushed to a branch, possibly the base of open reviews.
    BranchPushed {
        owner: String,
        repo: String,
        branch: String,
    },
    Ignored(String),
}

#[derive(Debug, Deserialize)]
struct Owner {
    login: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Repository {
    name: String,
    owner: Owner,
}

impl Repository {
    fn owner_login(&self) -> &str {
        self.owner
            .login
            .as_deref()
            .or(self.owner.name.as_deref())
            .unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct Changes {
    base: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct PullRequestPayload {
    action: String,
    pull_request: PullRequest,
    repository: Repository,
    changes: Option<Changes>,
}

#[derive(Debug, Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    repository: Repository,
}

/// Parse a delivery by its `X-GitHub-Event` name.
pub fn parse_event(event: &str, body: &[u8]) -> Result<WebhookEvent> {
    let payload_error = |source| WebhookError::Payload {
        event: event.to_string(),
        source,
    };

    match event {
        "pull_request" => {
            let payload: PullRequestPayload = serde_json::from_slice(body).map_err(payload_error)?;
            Ok(pull_request_event(payload))
        }
        "push" => {
            let payload: PushPayload = serde_json::from_slice(body).map_err(payload_error)?;
            Ok(push_event(payload))
        }
        "installation" | "installation_repositories" => {
            Ok(WebhookEvent::Ignored(format!("{} events are not handled", event)))
        }
        other => Ok(WebhookEvent::Ignored(format!("unsupported event '{}'", other))),
    }
}

fn pull_request_event(payload: PullRequestPayload) -> WebhookEvent {
    let owner = payload.repository.owner_login().to_string();
    let repo = payload.repository.name.clone();
    let key = ReviewKey::new(&owner, &repo, payload.pull_request.number);
    debug!(review = %key, action = %payload.action, "pull_request event");

    match payload.action.as_str() {
        "opened" => WebhookEvent::PullRequestOpened(payload.pull_request.into_metadata(&owner, &repo)),
        "synchronize" => WebhookEvent::PullRequestSynchronized(key),
        "edited" => {
            let base_changed = payload.changes.is_some_and(|c| c.base.is_some());
            if base_changed {
                WebhookEvent::PullRequestRetargeted(key)
            } else {
                WebhookEvent::Ignored("pull request edited without a base change".to_string())
            }
        }
        "closed" => WebhookEvent::PullRequestClosed {
            key,
            merged: payload.pull_request.merged,
        },
        "reopened" => WebhookEvent::PullRequestReopened(key),
        other => WebhookEvent::Ignored(format!("pull_request action '{}'", other)),
    }
}

fn push_event(payload: PushPayload) -> WebhookEvent {
    let Some(branch) = payload.git_ref.strip_prefix("refs/heads/") else {
        return WebhookEvent::Ignored(format!("push to non-branch ref {}", payload.git_ref));
    };
    WebhookEvent::BranchPushed {
        owner: payload.repository.owner_login().to_string(),
        repo: payload.repository.name.clone(),
        branch: branch.to_string(),
    }
}
