//! Topic loop behaviour: nonce gating, dry runs, registration and shutdown

use crate::bundle::ValueBundle;
use crate::chain::{ChainError, ChainQuery};
use crate::orchestrator::{dedupe, spawn, NonceWatcher, TickOutcome, TopicOrchestrator, TopicSubscription};
use crate::shutdown::{self, Shutdown};
use crate::test_utils::{
    fast_retry_config, reputer_adapters, test_node, worker_adapters, MockChain, MockGroundTruth, MockInferer,
    MockLoss, MockTxClient,
};
use crate::types::{BlockHeight, Role, TopicId};
use async_trait::async_trait;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

const POLL: Duration = Duration::from_secs(5);

fn worker_sub(topic_id: TopicId, inferer: &Arc<MockInferer>) -> TopicSubscription {
    TopicSubscription::worker(topic_id, POLL, worker_adapters(Arc::clone(inferer)))
}

#[tokio::test(start_paused = true)]
async fn test_equal_nonce_is_stale_without_work() {
    let chain = Arc::new(MockChain::with_nonce(10));
    let tx = Arc::new(MockTxClient::new());
    let node = Arc::new(test_node(chain.clone(), tx.clone(), fast_retry_config(1), Shutdown::never()));
    let orch = TopicOrchestrator::new(node);
    let inferer = Arc::new(MockInferer::new("1.0"));
    let mut sub = worker_sub(1, &inferer);
    sub.last_nonce = 10;

    let outcome = orch.tick(&mut sub).await;
    assert!(matches!(outcome, TickOutcome::Stale { nonce: 10 }));
    assert_eq!(inferer.calls.load(Ordering::SeqCst), 0);
    assert_eq!(tx.broadcast_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_older_nonce_is_stale() {
    let chain = Arc::new(MockChain::with_nonce(8));
    let tx = Arc::new(MockTxClient::new());
    let node = Arc::new(test_node(chain, tx.clone(), fast_retry_config(1), Shutdown::never()));
    let orch = TopicOrchestrator::new(node);
    let inferer = Arc::new(MockInferer::new("1.0"));
    let mut sub = worker_sub(1, &inferer);
    sub.last_nonce = 10;

    assert!(matches!(orch.tick(&mut sub).await, TickOutcome::Stale { nonce: 8 }));
    assert_eq!(sub.last_nonce, 10);
    assert_eq!(tx.broadcast_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_new_nonce_submits_once() {
    let chain = Arc::new(MockChain::with_nonce(10));
    let tx = Arc::new(MockTxClient::new());
    let node = Arc::new(test_node(chain.clone(), tx.clone(), fast_retry_config(1), Shutdown::never()));
    let orch = TopicOrchestrator::new(Arc::clone(&node));
    let inferer = Arc::new(MockInferer::new("1.5"));
    let mut sub = worker_sub(3, &inferer);

    match orch.tick(&mut sub).await {
        TickOutcome::Submitted { nonce, receipt } => {
            assert_eq!(nonce, 10);
            assert!(receipt.tx_hash.is_some());
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(sub.last_nonce, 10);

    // Same nonce still open on the next poll
    assert!(matches!(orch.tick(&mut sub).await, TickOutcome::Stale { nonce: 10 }));
    assert_eq!(inferer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(tx.broadcast_count(), 1);

    let address = node.identity.address.as_str();
    let metrics = &node.metrics;
    assert_eq!(metrics.lifecycle_count(&metrics.bundles_built, address, 3, Role::Worker), 1);
    assert_eq!(metrics.lifecycle_count(&metrics.submissions_attempted, address, 3, Role::Worker), 1);
    assert_eq!(metrics.lifecycle_count(&metrics.submissions_succeeded, address, 3, Role::Worker), 1);
    assert_eq!(metrics.lifecycle_count(&metrics.submissions_failed, address, 3, Role::Worker), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_pipeline_still_advances_nonce() {
    let chain = Arc::new(MockChain::with_nonce(10));
    let tx = Arc::new(MockTxClient::failing_with(ChainError::Rejected(
        "broadcast failed with error code: '28': invalid chain-id".to_string(),
    )));
    let node = Arc::new(test_node(chain.clone(), tx.clone(), fast_retry_config(3), Shutdown::never()));
    let orch = TopicOrchestrator::new(Arc::clone(&node));
    let inferer = Arc::new(MockInferer::new("1.5"));
    let mut sub = worker_sub(1, &inferer);

    assert!(matches!(orch.tick(&mut sub).await, TickOutcome::Failed { nonce: 10, .. }));
    assert_eq!(sub.last_nonce, 10);
    assert!(matches!(orch.tick(&mut sub).await, TickOutcome::Stale { nonce: 10 }));
    assert_eq!(tx.broadcast_count(), 1);

    let metrics = &node.metrics;
    assert_eq!(
        metrics.lifecycle_count(&metrics.submissions_failed, &node.identity.address, 1, Role::Worker),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_invalid_adapter_output_fails_epoch() {
    let chain = Arc::new(MockChain::with_nonce(10));
    let tx = Arc::new(MockTxClient::new());
    let node = Arc::new(test_node(chain, tx.clone(), fast_retry_config(1), Shutdown::never()));
    let orch = TopicOrchestrator::new(node);
    let inferer = Arc::new(MockInferer::new("NaN"));
    let mut sub = worker_sub(1, &inferer);

    assert!(matches!(orch.tick(&mut sub).await, TickOutcome::Failed { nonce: 10, .. }));
    assert_eq!(sub.last_nonce, 10);
    assert_eq!(tx.broadcast_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_query_error_is_idle() {
    let chain = Arc::new(MockChain::with_nonce(10));
    chain.push_worker_nonce(Err(ChainError::Transport("connection reset".to_string())));
    let tx = Arc::new(MockTxClient::new());
    let node = Arc::new(test_node(chain, tx.clone(), fast_retry_config(1), Shutdown::never()));
    let orch = TopicOrchestrator::new(node);
    let inferer = Arc::new(MockInferer::new("1.0"));
    let mut sub = worker_sub(1, &inferer);
    sub.last_nonce = 4;

    assert!(matches!(orch.tick(&mut sub).await, TickOutcome::Idle));
    assert_eq!(sub.last_nonce, 4);

    // Next poll recovers
    assert!(matches!(orch.tick(&mut sub).await, TickOutcome::Submitted { nonce: 10, .. }));
}

#[tokio::test(start_paused = true)]
async fn test_no_open_nonce_is_idle() {
    let chain = Arc::new(MockChain::new());
    let tx = Arc::new(MockTxClient::new());
    let node = Arc::new(test_node(chain, tx.clone(), fast_retry_config(1), Shutdown::never()));
    let orch = TopicOrchestrator::new(node);
    let inferer = Arc::new(MockInferer::new("1.0"));
    let mut sub = worker_sub(1, &inferer);

    assert!(matches!(orch.tick(&mut sub).await, TickOutcome::Idle));
    assert_eq!(sub.last_nonce, 0);
}

#[tokio::test(start_paused = true)]
async fn test_dry_run_skips_broadcast() {
    let chain = Arc::new(MockChain::with_nonce(12));
    let tx = Arc::new(MockTxClient::new());
    let mut node = test_node(chain, tx.clone(), fast_retry_config(1), Shutdown::never());
    node.submit_tx = false;
    let node = Arc::new(node);
    let orch = TopicOrchestrator::new(Arc::clone(&node));
    let inferer = Arc::new(MockInferer::new("2"));
    let mut sub = worker_sub(1, &inferer);

    assert!(matches!(orch.tick(&mut sub).await, TickOutcome::DryRun { nonce: 12 }));
    assert_eq!(sub.last_nonce, 12);
    assert_eq!(tx.broadcast_count(), 0);
    assert!(tx.build_options().is_empty());

    let metrics = &node.metrics;
    let address = node.identity.address.as_str();
    assert_eq!(metrics.lifecycle_count(&metrics.bundles_built, address, 1, Role::Worker), 1);
    assert_eq!(metrics.lifecycle_count(&metrics.submissions_attempted, address, 1, Role::Worker), 0);
}

#[tokio::test(start_paused = true)]
async fn test_reputer_caches_loss_sign_across_nonces() {
    let chain = Arc::new(MockChain::new());
    chain.push_reputer_nonce(Ok(Some(20)));
    chain.push_reputer_nonce(Ok(Some(21)));
    let tx = Arc::new(MockTxClient::new());
    let node = Arc::new(test_node(chain.clone(), tx.clone(), fast_retry_config(1), Shutdown::never()));
    let orch = TopicOrchestrator::new(node);

    let truth = Arc::new(MockGroundTruth::new("5"));
    let loss = Arc::new(MockLoss::new(false));
    let mut sub = TopicSubscription::reputer(2, POLL, reputer_adapters(truth.clone(), loss.clone()), 0);

    assert!(matches!(orch.tick(&mut sub).await, TickOutcome::Submitted { nonce: 20, .. }));
    assert!(matches!(orch.tick(&mut sub).await, TickOutcome::Submitted { nonce: 21, .. }));

    assert_eq!(sub.loss_never_negative, Some(false));
    assert_eq!(loss.sign_queries.load(Ordering::SeqCst), 1);
    // value_bundle_with(3): combined, naive and one inferer value per epoch
    assert_eq!(loss.calls(), 6);
    assert_eq!(truth.calls.load(Ordering::SeqCst), 2);
    assert_eq!(chain.bundle_queries.load(Ordering::SeqCst), 2);
    assert_eq!(tx.broadcast_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_reputer_empty_aggregate_fails_epoch() {
    let chain = Arc::new(MockChain::new());
    *chain.value_bundle.lock() = ValueBundle::default();
    chain.push_reputer_nonce(Ok(Some(20)));
    let tx = Arc::new(MockTxClient::new());
    let node = Arc::new(test_node(chain, tx.clone(), fast_retry_config(1), Shutdown::never()));
    let orch = TopicOrchestrator::new(node);

    let loss = Arc::new(MockLoss::new(false));
    let mut sub = TopicSubscription::reputer(
        2,
        POLL,
        reputer_adapters(Arc::new(MockGroundTruth::new("5")), loss.clone()),
        0,
    );

    assert!(matches!(orch.tick(&mut sub).await, TickOutcome::Failed { nonce: 20, .. }));
    assert_eq!(loss.calls(), 0);
    assert_eq!(tx.broadcast_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unregistered_topic_never_polls() {
    let chain = Arc::new(MockChain::with_nonce(10));
    *chain.registered.lock() = false;
    let tx = Arc::new(MockTxClient::new());
    let node = Arc::new(test_node(chain.clone(), tx, fast_retry_config(1), Shutdown::never()));
    let inferer = Arc::new(MockInferer::new("1"));

    spawn(node, vec![worker_sub(1, &inferer)]).await;

    assert_eq!(chain.registration_checks.load(Ordering::SeqCst), 1);
    assert_eq!(chain.nonce_queries.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_understaked_reputer_exits() {
    let chain = Arc::new(MockChain::with_nonce(10));
    *chain.staked.lock() = false;
    let tx = Arc::new(MockTxClient::new());
    let node = Arc::new(test_node(chain.clone(), tx, fast_retry_config(1), Shutdown::never()));
    let sub = TopicSubscription::reputer(
        1,
        POLL,
        reputer_adapters(Arc::new(MockGroundTruth::new("1")), Arc::new(MockLoss::new(false))),
        1_000,
    );

    spawn(Arc::clone(&node), vec![sub]).await;

    assert_eq!(chain.stake_checks.load(Ordering::SeqCst), 1);
    assert_eq!(chain.nonce_queries.load(Ordering::SeqCst), 0);
    let metrics = &node.metrics;
    assert_eq!(
        metrics.lifecycle_count(&metrics.registrations, &node.identity.address, 1, Role::Reputer),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn test_register_worker_skips_stake_check() {
    let chain = Arc::new(MockChain::new());
    let node = Arc::new(test_node(
        chain.clone(),
        Arc::new(MockTxClient::new()),
        fast_retry_config(1),
        Shutdown::never(),
    ));
    let orch = TopicOrchestrator::new(Arc::clone(&node));
    let inferer = Arc::new(MockInferer::new("1"));

    assert!(orch.register(&worker_sub(6, &inferer)).await);
    assert_eq!(chain.stake_checks.load(Ordering::SeqCst), 0);
    let metrics = &node.metrics;
    assert_eq!(
        metrics.lifecycle_count(&metrics.registrations, &node.identity.address, 6, Role::Worker),
        1
    );
}

#[test]
fn test_dedupe_keeps_first_per_topic_and_role() {
    let first = Arc::new(MockInferer::new("1"));
    let second = Arc::new(MockInferer::new("2"));
    let reputer = TopicSubscription::reputer(
        1,
        POLL,
        reputer_adapters(Arc::new(MockGroundTruth::new("1")), Arc::new(MockLoss::new(false))),
        0,
    );
    let mut late = worker_sub(1, &second);
    late.poll_interval = Duration::from_secs(99);

    let unique = dedupe(vec![worker_sub(1, &first), worker_sub(2, &first), late, reputer]);

    let keys: Vec<(TopicId, Role)> = unique.iter().map(|s| (s.topic_id, s.role())).collect();
    assert_eq!(keys, vec![(1, Role::Worker), (2, Role::Worker), (1, Role::Reputer)]);
    assert_eq!(unique[0].poll_interval, POLL);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_topic_loops() {
    let chain = Arc::new(MockChain::with_nonce(10));
    let tx = Arc::new(MockTxClient::new());
    let (trigger, shutdown) = shutdown::channel();
    let node = Arc::new(test_node(chain.clone(), tx.clone(), fast_retry_config(1), shutdown));
    let inferer = Arc::new(MockInferer::new("1"));

    let run = tokio::spawn(spawn(node, vec![worker_sub(1, &inferer), worker_sub(2, &inferer)]));

    // Polls at 0s, 5s and 10s for each topic
    tokio::time::sleep(Duration::from_secs(12)).await;
    trigger.trigger();
    run.await.unwrap();

    assert_eq!(chain.nonce_queries.load(Ordering::SeqCst), 6);
    assert_eq!(inferer.calls.load(Ordering::SeqCst), 2);
    assert_eq!(tx.broadcast_count(), 2);
}

/// Chain whose nonce queries never answer in time
struct SlowChain;

#[async_trait]
impl ChainQuery for SlowChain {
    async fn latest_open_worker_nonce(&self, _topic_id: TopicId) -> Result<Option<BlockHeight>, ChainError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Some(1))
    }

    async fn oldest_open_reputer_nonce(&self, _topic_id: TopicId) -> Result<Option<BlockHeight>, ChainError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(Some(1))
    }

    async fn aggregated_value_bundle(&self, _topic_id: TopicId, _nonce: BlockHeight) -> Result<ValueBundle, ChainError> {
        Ok(ValueBundle::default())
    }
}

#[tokio::test(start_paused = true)]
async fn test_nonce_watcher_timeout_reads_as_none() {
    let watcher = NonceWatcher::new(Arc::new(SlowChain), Duration::from_secs(5));
    assert_eq!(watcher.relevant_nonce(1, Role::Worker).await, None);
}

#[tokio::test]
async fn test_nonce_watcher_picks_role_query() {
    let chain = Arc::new(MockChain::new());
    chain.push_worker_nonce(Ok(Some(30)));
    chain.push_reputer_nonce(Ok(Some(25)));
    chain.push_reputer_nonce(Err(ChainError::Decode("bad json".to_string())));
    let watcher = NonceWatcher::new(chain.clone(), Duration::from_secs(5));

    assert_eq!(watcher.relevant_nonce(1, Role::Worker).await, Some(30));
    assert_eq!(watcher.relevant_nonce(1, Role::Reputer).await, Some(25));
    assert_eq!(watcher.relevant_nonce(1, Role::Reputer).await, None);
    // Drained queue falls back to the default (none open)
    assert_eq!(watcher.relevant_nonce(1, Role::Worker).await, None);
    assert_eq!(chain.nonce_queries.load(Ordering::SeqCst), 4);
}
