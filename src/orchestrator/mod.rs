//! Per-topic polling loops
//!
//! [`spawn`] starts one task per distinct (topic, role). Each task checks
//! registration once, then polls for the relevant nonce and runs the
//! build, sign, validate, submit pipeline whenever a newer nonce appears.
//! A topic's submissions are sequential; topics are independent of each
//! other and a failed epoch never stops a loop.

pub mod nonce_watcher;

pub use nonce_watcher::NonceWatcher;

use crate::adapters::{ReputerAdapters, WorkerAdapters};
use crate::chain::{ChainMessage, ChainQuery, Registrar};
use crate::metrics::Metrics;
use crate::payload::{BundleSigner, PayloadBuilder, PayloadError};
use crate::shutdown::Shutdown;
use crate::submission::{SubmissionEngine, SubmissionError, SubmissionReceipt};
use crate::types::{BlockHeight, Role, TopicId};
use crate::wallet::NodeIdentity;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Shared collaborators for every topic task
pub struct NodeContext {
    pub identity: NodeIdentity,
    pub chain: Arc<dyn ChainQuery>,
    pub registrar: Arc<dyn Registrar>,
    pub engine: Arc<SubmissionEngine>,
    pub signer: Arc<BundleSigner>,
    pub builder: Arc<PayloadBuilder>,
    pub metrics: Arc<Metrics>,
    /// When false, payloads are logged instead of submitted
    pub submit_tx: bool,
    pub call_timeout: Duration,
    pub shutdown: Shutdown,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Payload(#[from] PayloadError),

    #[error(transparent)]
    Submission(#[from] SubmissionError),
}

/// What a topic does each epoch
#[derive(Clone)]
pub enum TopicJob {
    Worker(WorkerAdapters),
    Reputer {
        adapters: ReputerAdapters,
        min_stake: u64,
    },
}

/// State of one (topic, role) loop, owned by its task
#[derive(Clone)]
pub struct TopicSubscription {
    pub topic_id: TopicId,
    pub poll_interval: Duration,
    /// Highest nonce a pipeline has run for; never decreases
    pub last_nonce: BlockHeight,
    /// Cached answer of the loss adapter's never-negative query
    pub loss_never_negative: Option<bool>,
    pub job: TopicJob,
}

impl TopicSubscription {
    pub fn worker(topic_id: TopicId, poll_interval: Duration, adapters: WorkerAdapters) -> Self {
        Self {
            topic_id,
            poll_interval,
            last_nonce: 0,
            loss_never_negative: None,
            job: TopicJob::Worker(adapters),
        }
    }

    pub fn reputer(topic_id: TopicId, poll_interval: Duration, adapters: ReputerAdapters, min_stake: u64) -> Self {
        Self {
            topic_id,
            poll_interval,
            last_nonce: 0,
            loss_never_negative: None,
            job: TopicJob::Reputer { adapters, min_stake },
        }
    }

    pub fn role(&self) -> Role {
        match self.job {
            TopicJob::Worker(_) => Role::Worker,
            TopicJob::Reputer { .. } => Role::Reputer,
        }
    }
}

/// Result of one poll
#[derive(Debug)]
pub enum TickOutcome {
    /// No open nonce, or the query failed
    Idle,
    /// The open nonce was already acted upon
    Stale { nonce: BlockHeight },
    Submitted { nonce: BlockHeight, receipt: SubmissionReceipt },
    /// Built and validated, not submitted (`submit_tx = false`)
    DryRun { nonce: BlockHeight },
    Failed { nonce: BlockHeight, error: PipelineError },
}

/// Keep the first subscription for each (topic, role), in order
pub fn dedupe(subscriptions: Vec<TopicSubscription>) -> Vec<TopicSubscription> {
    let mut started = HashSet::new();
    let mut unique = Vec::with_capacity(subscriptions.len());
    for sub in subscriptions {
        if !started.insert((sub.topic_id, sub.role())) {
            debug!(topic_id = sub.topic_id, role = %sub.role(), "already started for topic, skipping duplicate");
            continue;
        }
        unique.push(sub);
    }
    unique
}

/// Run every configured topic until shutdown
pub async fn spawn(node: Arc<NodeContext>, subscriptions: Vec<TopicSubscription>) {
    TopicOrchestrator::new(node).spawn(subscriptions).await
}

pub struct TopicOrchestrator {
    node: Arc<NodeContext>,
    watcher: NonceWatcher,
}

impl TopicOrchestrator {
    pub fn new(node: Arc<NodeContext>) -> Self {
        let watcher = NonceWatcher::new(Arc::clone(&node.chain), node.call_timeout);
        Self { node, watcher }
    }

    /// Start one task per distinct (topic, role) and wait for all of them
    pub async fn spawn(self, subscriptions: Vec<TopicSubscription>) {
        let this = Arc::new(self);
        let handles: Vec<JoinHandle<()>> = dedupe(subscriptions)
            .into_iter()
            .map(|sub| {
                let this = Arc::clone(&this);
                tokio::spawn(async move { this.run(sub).await })
            })
            .collect();

        info!(tasks = handles.len(), "topic loops started");
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "topic task panicked");
            }
        }
        info!("all topic loops finished");
    }

    async fn run(&self, mut sub: TopicSubscription) {
        let topic_id = sub.topic_id;
        let role = sub.role();
        info!(topic_id, role = %role, "running topic loop");

        if !self.register(&sub).await {
            error!(topic_id, role = %role, "failed to register or sufficiently stake for topic, loop not started");
            return;
        }

        let mut shutdown = self.node.shutdown.clone();
        while !shutdown.is_triggered() {
            self.tick(&mut sub).await;
            if !shutdown.sleep(sub.poll_interval).await {
                break;
            }
        }
        info!(topic_id, role = %role, last_nonce = sub.last_nonce, "topic loop stopped");
    }

    /// Registration (and, for reputers, stake) check, run once per task
    pub async fn register(&self, sub: &TopicSubscription) -> bool {
        let node = &self.node;
        let role = sub.role();
        let registrar = node.registrar.as_ref();

        let registered = match tokio::time::timeout(node.call_timeout, registrar.ensure_registered(role, sub.topic_id)).await {
            Ok(Ok(registered)) => registered,
            Ok(Err(e)) => {
                error!(topic_id = sub.topic_id, role = %role, error = %e, "registration check failed");
                false
            }
            Err(_) => {
                error!(topic_id = sub.topic_id, role = %role, "registration check timed out");
                false
            }
        };
        if !registered {
            return false;
        }

        if let TopicJob::Reputer { min_stake, .. } = &sub.job {
            let staked = tokio::time::timeout(
                node.call_timeout,
                registrar.ensure_staked(sub.topic_id, u128::from(*min_stake)),
            )
            .await;
            match staked {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => return false,
                Ok(Err(e)) => {
                    error!(topic_id = sub.topic_id, error = %e, "stake check failed");
                    return false;
                }
                Err(_) => {
                    error!(topic_id = sub.topic_id, "stake check timed out");
                    return false;
                }
            }
        }

        node.metrics
            .inc_lifecycle(&node.metrics.registrations, &node.identity.address, sub.topic_id, role);
        true
    }

    /// One poll: act on the relevant nonce if it is newer than the last one
    pub async fn tick(&self, sub: &mut TopicSubscription) -> TickOutcome {
        let role = sub.role();
        let Some(nonce) = self.watcher.relevant_nonce(sub.topic_id, role).await else {
            return TickOutcome::Idle;
        };

        if nonce <= sub.last_nonce {
            debug!(
                topic_id = sub.topic_id,
                role = %role,
                open_nonce = nonce,
                last_nonce = sub.last_nonce,
                "no new nonce found"
            );
            return TickOutcome::Stale { nonce };
        }

        debug!(topic_id = sub.topic_id, role = %role, block_height = nonce, "building and committing payload");
        let outcome = match self.process(sub, nonce).await {
            Ok(Some(receipt)) => TickOutcome::Submitted { nonce, receipt },
            Ok(None) => TickOutcome::DryRun { nonce },
            Err(error) => {
                error!(
                    topic_id = sub.topic_id,
                    role = %role,
                    block_height = nonce,
                    error = %error,
                    "error building and committing payload"
                );
                TickOutcome::Failed { nonce, error }
            }
        };
        sub.last_nonce = nonce;
        outcome
    }

    async fn process(
        &self,
        sub: &mut TopicSubscription,
        nonce: BlockHeight,
    ) -> Result<Option<SubmissionReceipt>, PipelineError> {
        let node = &self.node;
        let sender = node.identity.address.clone();

        let message = match &sub.job {
            TopicJob::Worker(adapters) => {
                let bundle = node.builder.build_worker_bundle(adapters, sub.topic_id, nonce).await?;
                let signed = node.signer.sign_worker_bundle(bundle, sub.topic_id, nonce)?;
                signed.validate().map_err(PayloadError::Validation)?;
                ChainMessage::InsertWorkerPayload {
                    sender,
                    worker_data_bundle: signed,
                }
            }
            TopicJob::Reputer { adapters, .. } => {
                let losses = node
                    .builder
                    .build_reputer_bundle(
                        node.chain.as_ref(),
                        adapters,
                        &mut sub.loss_never_negative,
                        sub.topic_id,
                        nonce,
                    )
                    .await?;
                let signed = node.signer.sign_value_bundle(losses)?;
                signed.validate().map_err(PayloadError::Validation)?;
                ChainMessage::InsertReputerPayload {
                    sender,
                    reputer_value_bundle: signed,
                }
            }
        };
        let role = sub.role();
        node.metrics
            .inc_lifecycle(&node.metrics.bundles_built, &node.identity.address, sub.topic_id, role);

        self.submit(sub.topic_id, role, &message).await
    }

    async fn submit(
        &self,
        topic_id: TopicId,
        role: Role,
        message: &ChainMessage,
    ) -> Result<Option<SubmissionReceipt>, PipelineError> {
        let node = &self.node;
        let address = node.identity.address.as_str();

        match serde_json::to_string(message) {
            Ok(json) => info!(topic_id, kind = message.kind(), payload = %json, "sending payload to chain"),
            Err(e) => warn!(topic_id, error = %e, "failed to render payload as JSON"),
        }

        if !node.submit_tx {
            info!(topic_id, role = %role, "submit_tx disabled, skipping chain submission");
            return Ok(None);
        }

        node.metrics
            .inc_lifecycle(&node.metrics.submissions_attempted, address, topic_id, role);
        let started = Instant::now();
        let info_msg = format!("send {} data to chain", role);
        let result = node.engine.submit_with_retry(message, &info_msg).await;
        node.metrics.submission_latency.observe(started.elapsed().as_secs_f64());

        match result {
            Ok(receipt) => {
                node.metrics
                    .inc_lifecycle(&node.metrics.submissions_succeeded, address, topic_id, role);
                Ok(Some(receipt))
            }
            Err(e) => {
                node.metrics
                    .inc_lifecycle(&node.metrics.submissions_failed, address, topic_id, role);
                Err(e.into())
            }
        }
    }
}
