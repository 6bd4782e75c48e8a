//! Error taxonomy shared by the Gateway, Fetcher, and Indicator Engine.
//!
//! `spec.md` §7 distinguishes four classes: transient, permanent-per-unit,
//! terminal-per-tick, and fatal. Only `Transient` and `Permanent` need to be
//! distinguishable *within* a component (to drive retry-vs-skip decisions);
//! `Terminal` is simply "what the component returns when it gives up on this
//! tick/bucket" and carries no special handling beyond being logged and
//! turned into an event. `Fatal` only ever appears during startup in `main`.

use thiserror::Error;

/// Errors a `GatewayPort` or `MarketDataProvider` call can return.
///
/// Callers retry on `Transient` (per the backoff policies in `spec.md`
/// §4.3.2 / §4.4.4) and give up immediately on `Permanent`.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Network timeout, HTTP 5xx/429, or a transient database error
    /// (connection reset, statement timeout, serialization failure).
    #[error("transient failure: {0}")]
    Transient(#[source] anyhow::Error),

    /// A single unit (one page, one row, one asset) failed in a way that
    /// will never succeed on retry (malformed payload, constraint violation,
    /// decimal overflow). The caller skips the unit and continues.
    #[error("permanent failure for {unit}: {reason}")]
    Permanent { unit: String, reason: String },

    /// The component exhausted its retry budget or deadline for this
    /// tick/bucket. Carries the first error message observed, truncated per
    /// `spec.md` §7 ("sync log preserves the first terminal error message
    /// verbatim, truncated to a fixed length").
    #[error("terminal failure: {0}")]
    Terminal(String),
}

/// Maximum length of a terminal error message preserved in a sync log row.
pub const TERMINAL_MESSAGE_MAX_LEN: usize = 500;

/// Truncate `msg` to `TERMINAL_MESSAGE_MAX_LEN` bytes at a UTF-8 boundary.
pub fn truncate_terminal_message(msg: &str) -> String {
    if msg.len() <= TERMINAL_MESSAGE_MAX_LEN {
        return msg.to_string();
    }
    let mut end = TERMINAL_MESSAGE_MAX_LEN;
    while end > 0 && !msg.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &msg[..end])
}

impl IngestError {
    /// True if retrying the same unit of work might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, IngestError::Transient(_))
    }
}

/// Startup-only failures that exit the process per `spec.md` §6.5.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("configuration error: {0}")]
    Config(#[source] anyhow::Error),

    #[error("database unavailable at startup: {0}")]
    DatabaseUnavailable(#[source] anyhow::Error),
}

impl FatalError {
    /// Process exit code per `spec.md` §6.5.
    pub fn exit_code(&self) -> i32 {
        match self {
            FatalError::Config(_) => 1,
            FatalError::DatabaseUnavailable(_) => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_message_is_unchanged() {
        assert_eq!(truncate_terminal_message("short"), "short");
    }

    #[test]
    fn long_message_is_truncated_with_ellipsis() {
        let long = "x".repeat(TERMINAL_MESSAGE_MAX_LEN + 50);
        let truncated = truncate_terminal_message(&long);
        assert!(truncated.ends_with('…'));
        assert!(truncated.len() <= TERMINAL_MESSAGE_MAX_LEN + '…'.len_utf8());
    }

    #[test]
    fn exit_codes_match_spec() {
        assert_eq!(
            FatalError::Config(anyhow::anyhow!("x")).exit_code(),
            1
        );
        assert_eq!(
            FatalError::DatabaseUnavailable(anyhow::anyhow!("x")).exit_code(),
            2
        );
    }
}
