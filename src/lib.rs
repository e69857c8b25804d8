//! Off-chain node library
//!
//! Computes inferences, forecasts and loss scores for configured topics and
//! submits them to the chain as signed payloads.
//!
//! Pipeline per topic epoch:
//! [`orchestrator`] → [`orchestrator::NonceWatcher`] → [`payload::PayloadBuilder`]
//! → [`payload::BundleSigner`] → [`submission::SubmissionEngine`]
//! (→ [`submission::classifier`]).

pub mod adapters;
pub mod bundle;
pub mod chain;
pub mod config;
pub mod decimal;
pub mod endpoints;
pub mod metrics;
pub mod orchestrator;
pub mod payload;
pub mod shutdown;
pub mod submission;
pub mod types;
pub mod wallet;

#[cfg(any(test, feature = "test_utils"))]
pub mod test_utils;

pub use config::Config;
pub use orchestrator::{spawn, NodeContext, TopicOrchestrator, TopicSubscription};
pub use submission::{RetryConfig, SubmissionEngine, SubmissionError};

#[cfg(test)]
mod tests;
