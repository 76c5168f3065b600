//! Failure taxonomy and retry policy
//!
//! | Failure | First occurrence | After the retry |
//! |---|---|---|
//! | `Transport` | fall back to the slow dispatcher | surface 502 |
//! | `SessionInvalid` | force a refresh, retry once | surface 401 `session_unavailable` |
//! | `UpstreamHttp` | pass through unchanged | pass through unchanged |
//! | `AcquisitionFailure` | surface 503 | surface 503 |

use super::{DispatchError, UpstreamResponse};

/// Only the start of a body is searched for challenge markers
pub const SIGNATURE_SCAN_LIMIT: usize = 64 * 1024;

/// Closed failure taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Connect error or timeout
    Transport,
    /// Ordinary 4xx/5xx from the upstream
    UpstreamHttp,
    /// 401/403 or a bot-challenge page: the cookie set is dead
    SessionInvalid,
    /// The acquirer and the fallback cookie file are both exhausted
    AcquisitionFailure,
}

/// What the engine does next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    Fallback,
    RefreshAndRetry,
    PassThrough,
    Surface,
}

#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    signatures: Vec<String>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(&["challenge-platform".to_string(), "checking your browser".to_string()])
    }
}

impl ErrorClassifier {
    #[must_use]
    pub fn new(signatures: &[String]) -> Self {
        Self {
            signatures: signatures
                .iter()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    /// Classify an upstream response; `None` means it should be delivered as is
    #[must_use]
    pub fn classify_response(&self, response: &UpstreamResponse) -> Option<FailureKind> {
        if matches!(response.status, 401 | 403) {
            return Some(FailureKind::SessionInvalid);
        }
        if self.matches_challenge(response) {
            return Some(FailureKind::SessionInvalid);
        }
        if response.status >= 400 {
            return Some(FailureKind::UpstreamHttp);
        }
        None
    }

    /// Every dispatch error is a transport failure
    #[must_use]
    pub fn classify_dispatch(error: &DispatchError) -> FailureKind {
        log::debug!("Classified dispatch error as transport failure: {error}");
        FailureKind::Transport
    }

    /// Whether a textual body carries one of the challenge signatures
    #[must_use]
    pub fn matches_challenge(&self, response: &UpstreamResponse) -> bool {
        if self.signatures.is_empty() || response.body.is_empty() || !response.is_textual() {
            return false;
        }
        let end = response.body.len().min(SIGNATURE_SCAN_LIMIT);
        let text = String::from_utf8_lossy(&response.body[..end]).to_lowercase();
        self.signatures.iter().any(|signature| text.contains(signature))
    }

    /// Decide the next step for `kind`
    #[must_use]
    pub fn action(kind: FailureKind, already_retried: bool, has_fallback: bool) -> RetryAction {
        match (kind, already_retried) {
            (FailureKind::UpstreamHttp, _) => RetryAction::PassThrough,
            (FailureKind::Transport, false) if has_fallback => RetryAction::Fallback,
            (FailureKind::SessionInvalid, false) => RetryAction::RefreshAndRetry,
            _ => RetryAction::Surface,
        }
    }
}
