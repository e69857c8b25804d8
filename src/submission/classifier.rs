//! Error classification for transaction submission
//!
//! Maps a raw chain failure onto a retry decision. The structured ABCI code
//! (`error code: 'N'` embedded in the error text) is inspected first, then
//! well-known substrings. Classification is pure; logging happens in the
//! engine.

use super::{RetryConfig, SubmissionError};
use crate::chain::ChainError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;

// ABCI codes from the SDK error registry
pub const ERROR_CODE_INVALID_SEQUENCE: u32 = 3;
pub const ERROR_CODE_INSUFFICIENT_FEE: u32 = 13;
pub const ERROR_CODE_TX_IN_MEMPOOL_CACHE: u32 = 19;
pub const ERROR_CODE_MEMPOOL_IS_FULL: u32 = 20;
pub const ERROR_CODE_TX_TOO_LARGE: u32 = 21;
pub const ERROR_CODE_INVALID_CHAIN_ID: u32 = 28;
pub const ERROR_CODE_WRONG_SEQUENCE: u32 = 32;

pub const ACCOUNT_SEQUENCE_MISMATCH: &str = "account sequence mismatch";
pub const WAITING_FOR_NEXT_BLOCK: &str = "waiting for next block";
pub const ALREADY_SUBMITTED: &str = "already submitted";
pub const CANNOT_UPDATE_EMA: &str = "cannot update EMA";

static ABCI_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"error code: '(\d+)'").expect("static regex"));

static SEQUENCE_MISMATCH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"account sequence mismatch, expected (\d+), got (\d+)").expect("static regex")
});

/// Retry decision for one failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    /// Transient; retry after the delay
    Continue(Duration),
    /// The chain already has what we wanted, treat as success
    Ok,
    /// Permanent; stop retrying
    Fatal(SubmissionError),
}

impl Classification {
    pub fn label(&self) -> &'static str {
        match self {
            Classification::Continue(_) => "continue",
            Classification::Ok => "ok",
            Classification::Fatal(_) => "fatal",
        }
    }
}

/// First ABCI code embedded in `text`, if any
pub fn abci_code(text: &str) -> Option<u32> {
    ABCI_CODE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Parse `(expected, current)` out of a sequence-mismatch message
pub fn parse_sequence_mismatch(text: &str) -> Option<(u64, u64)> {
    let caps = SEQUENCE_MISMATCH.captures(text)?;
    let expected = caps.get(1)?.as_str().parse().ok()?;
    let current = caps.get(2)?.as_str().parse().ok()?;
    Some((expected, current))
}

/// True when the failure is about the account sequence
pub fn is_sequence_error(text: &str) -> bool {
    matches!(
        abci_code(text),
        Some(ERROR_CODE_INVALID_SEQUENCE) | Some(ERROR_CODE_WRONG_SEQUENCE)
    ) || text.contains(ACCOUNT_SEQUENCE_MISMATCH)
}

/// Exponential backoff: `base^attempt` seconds, saturating
pub fn backoff_delay(base_secs: u64, attempt: u32) -> Duration {
    Duration::from_secs(base_secs.saturating_pow(attempt))
}

fn fatal(reason: &'static str, text: String) -> Classification {
    Classification::Fatal(SubmissionError::Fatal {
        reason,
        message: text,
    })
}

/// Classify a failed attempt. `attempt` is the zero-based attempt index.
pub fn classify(error: &ChainError, attempt: u32, config: &RetryConfig) -> Classification {
    let regular = Duration::from_secs(config.retry_delay);
    if error.is_transport() {
        return Classification::Continue(regular);
    }

    let text = error.to_string();
    let code = abci_code(&text);

    match code {
        Some(ERROR_CODE_MEMPOOL_IS_FULL) => {
            return Classification::Continue(backoff_delay(config.retry_delay, attempt))
        }
        Some(ERROR_CODE_WRONG_SEQUENCE) | Some(ERROR_CODE_INVALID_SEQUENCE) => {
            return Classification::Continue(Duration::from_secs(config.account_sequence_retry_delay))
        }
        Some(ERROR_CODE_INSUFFICIENT_FEE) => return Classification::Continue(Duration::ZERO),
        Some(ERROR_CODE_TX_TOO_LARGE) => return fatal("tx too large", text),
        Some(ERROR_CODE_TX_IN_MEMPOOL_CACHE) => return fatal("tx already in mempool cache", text),
        Some(ERROR_CODE_INVALID_CHAIN_ID) => return fatal("invalid chain-id", text),
        _ => {}
    }

    if text.contains(ACCOUNT_SEQUENCE_MISMATCH) {
        Classification::Continue(Duration::from_secs(config.account_sequence_retry_delay))
    } else if text.contains(WAITING_FOR_NEXT_BLOCK) {
        Classification::Ok
    } else if text.contains(ALREADY_SUBMITTED) || text.contains(CANNOT_UPDATE_EMA) {
        Classification::Ok
    } else if code.is_some() {
        // Any other ABCI code is a regular chain-side failure
        Classification::Continue(regular)
    } else {
        fatal("failed to process error", text)
    }
}
