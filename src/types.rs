//! Common types used throughout the application

use serde::{Deserialize, Serialize};
use std::fmt;

/// Topic identifier on chain
pub type TopicId = u64;

/// Ledger height marking one round of worker/reputer activity
pub type BlockHeight = i64;

/// Role a node plays on a topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Produces inferences and/or forecasts
    Worker,
    /// Scores the network's aggregated values against ground truth
    Reputer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Worker => "worker",
            Role::Reputer => "reputer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw value attributed to a peer, as returned by a compute adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeValue {
    pub worker: String,
    pub value: String,
}

impl NodeValue {
    pub fn new(worker: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            worker: worker.into(),
            value: value.into(),
        }
    }
}
