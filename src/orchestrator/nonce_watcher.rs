//! Nonce polling
//!
//! Workers act on the newest open worker nonce, reputers on the oldest open
//! reputer nonce. Failures never leave this module: they are logged and read
//! as "nothing to do this tick".

use crate::chain::ChainQuery;
use crate::types::{BlockHeight, Role, TopicId};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct NonceWatcher {
    chain: Arc<dyn ChainQuery>,
    call_timeout: Duration,
}

impl NonceWatcher {
    pub fn new(chain: Arc<dyn ChainQuery>, call_timeout: Duration) -> Self {
        Self { chain, call_timeout }
    }

    /// Nonce `role` must act on next for `topic_id`, if any
    pub async fn relevant_nonce(&self, topic_id: TopicId, role: Role) -> Option<BlockHeight> {
        let query = async {
            match role {
                Role::Worker => self.chain.latest_open_worker_nonce(topic_id).await,
                Role::Reputer => self.chain.oldest_open_reputer_nonce(topic_id).await,
            }
        };

        match tokio::time::timeout(self.call_timeout, query).await {
            Ok(Ok(Some(nonce))) => Some(nonce),
            Ok(Ok(None)) => {
                debug!(topic_id, role = %role, "no open nonce");
                None
            }
            Ok(Err(e)) => {
                warn!(topic_id, role = %role, error = %e, "error getting open nonce, node availability issue?");
                None
            }
            Err(_) => {
                warn!(
                    topic_id,
                    role = %role,
                    timeout_secs = self.call_timeout.as_secs(),
                    "open nonce query timed out"
                );
                None
            }
        }
    }
}
