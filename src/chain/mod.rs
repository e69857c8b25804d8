//! Chain collaborators
//!
//! The agent talks to the ledger through three narrow capabilities:
//! - [`ChainQuery`]: open nonces and the network's aggregated value bundles
//! - [`TxClient`]: transaction construction and broadcast
//! - [`Registrar`]: idempotent registration / stake checks
//!
//! [`rest::RestChainClient`] implements all three over HTTP.

use crate::bundle::{ReputerValueBundle, ValueBundle, WorkerDataBundle};
use crate::types::{BlockHeight, Role, TopicId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub mod rest;

pub use rest::RestChainClient;

/// Errors surfaced by chain collaborators
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ChainError {
    /// Connection-level failure, the request may not have reached the node
    #[error("transport error: {0}")]
    Transport(String),

    /// The gateway answered 5xx or 429; the request was never judged by the chain
    #[error("gateway unavailable: HTTP {status}: {body}")]
    Unavailable { status: u16, body: String },

    /// The call did not complete within its deadline
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The node answered with a failure. The text may embed an ABCI code as
    /// `error code: 'N'`.
    #[error("{0}")]
    Rejected(String),

    /// The node answered with something we could not decode
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl ChainError {
    /// Transport and timeout failures say nothing about the transaction itself
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ChainError::Transport(_) | ChainError::Timeout(_) | ChainError::Unavailable { .. }
        )
    }
}

/// Messages this agent submits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChainMessage {
    InsertWorkerPayload {
        sender: String,
        worker_data_bundle: WorkerDataBundle,
    },
    InsertReputerPayload {
        sender: String,
        reputer_value_bundle: ReputerValueBundle,
    },
}

impl ChainMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ChainMessage::InsertWorkerPayload { .. } => "insert_worker_payload",
            ChainMessage::InsertReputerPayload { .. } => "insert_reputer_payload",
        }
    }
}

/// Fee amount in a single denomination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub amount: u64,
    pub denom: String,
}

impl fmt::Display for Coin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.amount, self.denom)
    }
}

/// Options for building a transaction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxOptions {
    /// Account sequence to sign with; `None` lets the client query the chain
    pub sequence: Option<u64>,
    pub fees: Option<Coin>,
}

/// A built, signed transaction ready for broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxHandle {
    /// Gas estimated during construction
    pub gas: u64,
    /// Sequence the transaction was signed with
    pub sequence: u64,
    pub tx_bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxResponse {
    pub tx_hash: String,
}

#[async_trait]
pub trait ChainQuery: Send + Sync {
    /// Newest open worker nonce for the topic, if any
    async fn latest_open_worker_nonce(&self, topic_id: TopicId) -> Result<Option<BlockHeight>, ChainError>;

    /// Oldest open reputer nonce for the topic, if any
    async fn oldest_open_reputer_nonce(&self, topic_id: TopicId) -> Result<Option<BlockHeight>, ChainError>;

    /// The network's aggregated value bundle for an epoch
    async fn aggregated_value_bundle(
        &self,
        topic_id: TopicId,
        nonce: BlockHeight,
    ) -> Result<ValueBundle, ChainError>;
}

#[async_trait]
pub trait TxClient: Send + Sync {
    async fn build_transaction(
        &self,
        message: &ChainMessage,
        options: &TxOptions,
    ) -> Result<TxHandle, ChainError>;

    async fn broadcast(&self, tx: &TxHandle) -> Result<TxResponse, ChainError>;
}

#[async_trait]
pub trait Registrar: Send + Sync {
    /// True once the node is registered for `role` on the topic
    async fn ensure_registered(&self, role: Role, topic_id: TopicId) -> Result<bool, ChainError>;

    /// True once the node's stake on the topic is at least `min_stake`
    async fn ensure_staked(&self, topic_id: TopicId, min_stake: u128) -> Result<bool, ChainError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coin_display() {
        let coin = Coin {
            amount: 1200,
            denom: "uallo".to_string(),
        };
        assert_eq!(coin.to_string(), "1200uallo");
    }

    #[test]
    fn test_transport_classification() {
        assert!(ChainError::Transport("refused".into()).is_transport());
        assert!(ChainError::Timeout(Duration::from_secs(1)).is_transport());
        assert!(ChainError::Unavailable {
            status: 503,
            body: "upstream unavailable".into()
        }
        .is_transport());
        assert!(!ChainError::Rejected("error code: '20'".into()).is_transport());
    }
}
