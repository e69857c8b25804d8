//! Transaction submission with retry, fee escalation and sequence tracking
//!
//! One [`SubmissionEngine`] is shared by every topic task. All tasks sign
//! with the same on-chain account, so the "read sequence, build, broadcast,
//! advance" section runs under a single async mutex. Backoff sleeps happen
//! outside that lock and race against shutdown.

pub mod classifier;

use crate::chain::{ChainError, ChainMessage, Coin, TxClient, TxHandle, TxOptions, TxResponse};
use crate::shutdown::Shutdown;
use classifier::{classify, is_sequence_error, parse_sequence_mismatch, Classification, WAITING_FOR_NEXT_BLOCK};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Gas added on top of the estimate, and the per-attempt fee increment in gas units
pub const EXCESS_CORRECTION_IN_GAS: u64 = 20_000;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SubmissionError {
    /// The chain rejected the transaction for a reason retrying cannot fix
    #[error("{reason}: {message}")]
    Fatal { reason: &'static str, message: String },

    #[error("tx not able to complete after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("submission interrupted by shutdown")]
    Cancelled,
}

impl SubmissionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SubmissionError::RetriesExhausted { .. })
    }
}

/// Retry and fee parameters, taken from the wallet configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Regular retry delay in seconds, also the exponential backoff base
    pub retry_delay: u64,
    /// Delay in seconds after an account sequence error
    pub account_sequence_retry_delay: u64,
    /// Fee per gas unit; 0 disables fees
    pub gas_prices: f64,
    pub max_fees: u64,
    pub fee_denom: String,
    /// Deadline for every individual chain call
    pub call_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay: 2,
            account_sequence_retry_delay: 5,
            gas_prices: 0.0,
            max_fees: 500_000,
            fee_denom: "uallo".to_string(),
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Fee for attempt `attempt` (zero-based):
    /// `min(max_fees, (gas + 20000) * gas_prices + attempt * (20000 * gas_prices))`
    pub fn compute_fee(&self, gas: u64, attempt: u32) -> u64 {
        let base = (gas.saturating_add(EXCESS_CORRECTION_IN_GAS) as f64 * self.gas_prices) as u64;
        let step = (EXCESS_CORRECTION_IN_GAS as f64 * self.gas_prices) as u64;
        base.saturating_add(step.saturating_mul(u64::from(attempt)))
            .min(self.max_fees)
    }
}

/// Result of a completed submission
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionReceipt {
    /// `None` when the chain reported the data as already present
    pub tx_hash: Option<String>,
    pub attempts: u32,
    pub correlation_id: Uuid,
}

pub struct SubmissionEngine {
    tx_client: Arc<dyn TxClient>,
    config: RetryConfig,
    /// Next account sequence to sign with; `None` lets the client query the chain
    sequence: Mutex<Option<u64>>,
    shutdown: Shutdown,
}

impl SubmissionEngine {
    pub fn new(tx_client: Arc<dyn TxClient>, config: RetryConfig, shutdown: Shutdown) -> Self {
        Self {
            tx_client,
            config,
            sequence: Mutex::new(None),
            shutdown,
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Account sequence the next transaction will be built with
    pub async fn tracked_sequence(&self) -> Option<u64> {
        *self.sequence.lock().await
    }

    /// Submit `message`, retrying per the classifier until success, a fatal
    /// error, or `max_retries + 1` attempts
    pub async fn submit_with_retry(
        &self,
        message: &ChainMessage,
        info_msg: &str,
    ) -> Result<SubmissionReceipt, SubmissionError> {
        let correlation_id = Uuid::new_v4();
        let total_attempts = self.config.max_retries.saturating_add(1);
        let started = Instant::now();
        let mut last_error = String::new();
        let mut shutdown = self.shutdown.clone();

        for attempt in 0..total_attempts {
            if shutdown.is_triggered() {
                return Err(SubmissionError::Cancelled);
            }
            debug!(
                %correlation_id,
                msg = info_msg,
                kind = message.kind(),
                attempt,
                max_retries = self.config.max_retries,
                "submission attempt started"
            );

            let err = match self.attempt(message, attempt, correlation_id).await {
                Ok(response) => {
                    info!(
                        %correlation_id,
                        msg = info_msg,
                        tx_hash = %response.tx_hash,
                        attempts = attempt + 1,
                        duration_ms = started.elapsed().as_millis() as u64,
                        "transaction submitted"
                    );
                    return Ok(SubmissionReceipt {
                        tx_hash: Some(response.tx_hash),
                        attempts: attempt + 1,
                        correlation_id,
                    });
                }
                Err(err) => err,
            };

            match classify(&err, attempt, &self.config) {
                Classification::Ok => {
                    warn!(%correlation_id, msg = info_msg, error = %err, "data already accepted by the chain");
                    return Ok(SubmissionReceipt {
                        tx_hash: None,
                        attempts: attempt + 1,
                        correlation_id,
                    });
                }
                Classification::Fatal(fatal) => {
                    error!(%correlation_id, msg = info_msg, error = %fatal, attempt, "permanent failure, not retrying");
                    return Err(fatal);
                }
                Classification::Continue(delay) => {
                    warn!(
                        %correlation_id,
                        msg = info_msg,
                        error = %err,
                        attempt,
                        max_retries = self.config.max_retries,
                        delay_secs = delay.as_secs(),
                        "submission failed, retrying"
                    );
                    last_error = err.to_string();
                    if attempt + 1 < total_attempts && !shutdown.sleep(delay).await {
                        return Err(SubmissionError::Cancelled);
                    }
                }
            }
        }

        Err(SubmissionError::RetriesExhausted {
            attempts: total_attempts,
            last_error,
        })
    }

    /// One build/fee/broadcast cycle under the account lock
    async fn attempt(
        &self,
        message: &ChainMessage,
        attempt: u32,
        correlation_id: Uuid,
    ) -> Result<TxResponse, ChainError> {
        let mut sequence = self.sequence.lock().await;

        let options = TxOptions {
            sequence: *sequence,
            fees: None,
        };
        let mut tx = match self.build(message, &options).await {
            Ok(tx) => tx,
            Err(err) => {
                let text = err.to_string();
                let Some((expected, current)) = parse_sequence_mismatch(&text) else {
                    if is_sequence_error(&text) {
                        *sequence = None;
                    }
                    return Err(err);
                };
                info!(%correlation_id, expected, current, "account sequence mismatch, resetting to expected");
                *sequence = Some(expected);
                let options = TxOptions {
                    sequence: Some(expected),
                    fees: None,
                };
                self.build(message, &options).await?
            }
        };

        if self.config.gas_prices > 0.0 {
            let fees = Coin {
                amount: self.config.compute_fee(tx.gas, attempt),
                denom: self.config.fee_denom.clone(),
            };
            if fees.amount == self.config.max_fees {
                warn!(%correlation_id, gas = tx.gas, limit = self.config.max_fees, "fee capped at max_fees");
            }
            info!(%correlation_id, fees = %fees, "attempting tx with calculated fees");
            let options = TxOptions {
                sequence: Some(tx.sequence),
                fees: Some(fees),
            };
            tx = self.build(message, &options).await?;
        }

        match self.call(self.tx_client.broadcast(&tx)).await {
            Ok(response) => {
                *sequence = Some(tx.sequence + 1);
                Ok(response)
            }
            Err(err) => {
                *sequence = sequence_after_failure(&err, &tx);
                Err(err)
            }
        }
    }

    async fn build(&self, message: &ChainMessage, options: &TxOptions) -> Result<TxHandle, ChainError> {
        self.call(self.tx_client.build_transaction(message, options)).await
    }

    async fn call<T>(&self, fut: impl Future<Output = Result<T, ChainError>>) -> Result<T, ChainError> {
        match tokio::time::timeout(self.config.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ChainError::Timeout(self.config.call_timeout)),
        }
    }
}

/// Sequence to use after a failed broadcast of `tx`
fn sequence_after_failure(err: &ChainError, tx: &TxHandle) -> Option<u64> {
    let text = err.to_string();
    if text.contains(WAITING_FOR_NEXT_BLOCK) {
        // Accepted into the mempool, the sequence is consumed
        return Some(tx.sequence + 1);
    }
    if let Some((expected, _)) = parse_sequence_mismatch(&text) {
        return Some(expected);
    }
    if is_sequence_error(&text) || err.is_transport() {
        // Unknown on-chain state, re-query
        return None;
    }
    Some(tx.sequence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fee_config(gas_prices: f64, max_fees: u64) -> RetryConfig {
        RetryConfig {
            gas_prices,
            max_fees,
            ..RetryConfig::default()
        }
    }

    #[test]
    fn test_fee_formula() {
        let config = fee_config(1.0, 1_000_000);
        assert_eq!(config.compute_fee(100_000, 0), 120_000);
        assert_eq!(config.compute_fee(100_000, 1), 140_000);
        assert_eq!(config.compute_fee(100_000, 3), 180_000);
    }

    #[test]
    fn test_fee_capped() {
        let config = fee_config(10.0, 500_000);
        assert_eq!(config.compute_fee(100_000, 0), 500_000);
    }

    #[test]
    fn test_sequence_after_failure() {
        let tx = TxHandle {
            gas: 1,
            sequence: 9,
            tx_bytes: vec![],
        };
        let waiting = ChainError::Rejected("tx waiting for next block".into());
        assert_eq!(sequence_after_failure(&waiting, &tx), Some(10));

        let mismatch = ChainError::Rejected("account sequence mismatch, expected 12, got 9".into());
        assert_eq!(sequence_after_failure(&mismatch, &tx), Some(12));

        let wrong = ChainError::Rejected("error code: '32': wrong sequence".into());
        assert_eq!(sequence_after_failure(&wrong, &tx), None);

        let full = ChainError::Rejected("error code: '20': mempool is full".into());
        assert_eq!(sequence_after_failure(&full, &tx), Some(9));
    }

    proptest! {
        #[test]
        fn prop_fee_monotone_and_capped(
            gas in 0u64..5_000_000,
            price in 0.0f64..5.0,
            max_fees in 1u64..10_000_000,
            attempt in 0u32..20,
        ) {
            let config = fee_config(price, max_fees);
            let fee = config.compute_fee(gas, attempt);
            prop_assert!(fee <= max_fees);
            prop_assert!(config.compute_fee(gas, attempt + 1) >= fee);

            let base = ((gas + EXCESS_CORRECTION_IN_GAS) as f64 * price) as u64;
            let step = (EXCESS_CORRECTION_IN_GAS as f64 * price) as u64;
            prop_assert_eq!(fee, (base + step * u64::from(attempt)).min(max_fees));
        }
    }
}
