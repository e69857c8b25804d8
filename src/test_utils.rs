//! Test Utilities Module
//!
//! Scripted in-memory collaborators for deterministic tests: a chain that
//! serves configured nonces and value bundles, a transaction client that
//! replays queued results, and compute adapters that count their calls.
//!
//! These utilities are only compiled when running tests or when the
//! `test_utils` feature is enabled.

#![cfg(any(test, feature = "test_utils"))]

use crate::adapters::{AdapterError, Forecaster, GroundTruthSource, Inferer, LossFunction, ReputerAdapters, WorkerAdapters};
use crate::bundle::{ValueBundle, WithheldWorkerAttributedValue, WorkerAttributedValue};
use crate::chain::{ChainError, ChainMessage, ChainQuery, Registrar, TxClient, TxHandle, TxOptions, TxResponse};
use crate::decimal::Dec;
use crate::metrics::Metrics;
use crate::orchestrator::NodeContext;
use crate::payload::{BundleSigner, PayloadBuilder};
use crate::shutdown::Shutdown;
use crate::submission::{RetryConfig, SubmissionEngine};
use crate::types::{BlockHeight, NodeValue, Role, TopicId};
use crate::wallet::{LocalKeystore, NodeIdentity};
use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const TEST_KEY_NAME: &str = "node";

/// Keystore holding one deterministic key under [`TEST_KEY_NAME`]
pub fn test_keystore() -> Arc<LocalKeystore> {
    let ks = LocalKeystore::new();
    ks.insert(TEST_KEY_NAME, SigningKey::from_bytes(&[42u8; 32]));
    Arc::new(ks)
}

pub fn test_identity(keystore: &LocalKeystore) -> NodeIdentity {
    NodeIdentity::load(keystore, TEST_KEY_NAME, "allo", "uallo").expect("test key present")
}

pub fn dec(s: &str) -> Dec {
    s.parse().expect("valid decimal literal")
}

/// Aggregate bundle with `k` values in total: combined, naive, and
/// `k - 2` inferer values attributed to `worker0`, `worker1`, ...
pub fn value_bundle_with(k: usize) -> ValueBundle {
    assert!(k >= 2, "a value bundle always carries combined and naive values");
    ValueBundle {
        topic_id: 1,
        combined_value: dec("10"),
        naive_value: dec("20"),
        inferer_values: (0..k - 2)
            .map(|i| WorkerAttributedValue {
                worker: format!("worker{}", i),
                value: dec(&(100 + i).to_string()),
            })
            .collect(),
        ..ValueBundle::default()
    }
}

/// Bundle touching every value list
pub fn full_value_bundle() -> ValueBundle {
    let attributed = |prefix: &str, n: usize, base: usize| -> Vec<WorkerAttributedValue> {
        (0..n)
            .map(|i| WorkerAttributedValue {
                worker: format!("{}{}", prefix, i),
                value: dec(&(base + i).to_string()),
            })
            .collect()
    };
    let withheld = |prefix: &str, n: usize, base: usize| -> Vec<WithheldWorkerAttributedValue> {
        (0..n)
            .map(|i| WithheldWorkerAttributedValue {
                worker: format!("{}{}", prefix, i),
                value: dec(&(base + i).to_string()),
            })
            .collect()
    };
    ValueBundle {
        topic_id: 1,
        extra_data: vec![7, 7],
        combined_value: dec("1"),
        naive_value: dec("2"),
        inferer_values: attributed("inferer", 2, 10),
        forecaster_values: attributed("forecaster", 2, 20),
        one_out_inferer_values: withheld("oo-inferer", 2, 30),
        one_out_forecaster_values: withheld("oo-forecaster", 1, 40),
        one_in_forecaster_values: attributed("oi-forecaster", 1, 50),
        ..ValueBundle::default()
    }
}

/// Chain serving scripted nonces and a fixed value bundle
pub struct MockChain {
    worker_nonces: Mutex<VecDeque<Result<Option<BlockHeight>, ChainError>>>,
    reputer_nonces: Mutex<VecDeque<Result<Option<BlockHeight>, ChainError>>>,
    /// Returned once the scripted queue is drained
    pub default_nonce: Mutex<Option<BlockHeight>>,
    pub value_bundle: Mutex<ValueBundle>,
    pub registered: Mutex<bool>,
    pub staked: Mutex<bool>,
    pub nonce_queries: AtomicUsize,
    pub bundle_queries: AtomicUsize,
    pub registration_checks: AtomicUsize,
    pub stake_checks: AtomicUsize,
}

impl MockChain {
    pub fn new() -> Self {
        Self {
            worker_nonces: Mutex::new(VecDeque::new()),
            reputer_nonces: Mutex::new(VecDeque::new()),
            default_nonce: Mutex::new(None),
            value_bundle: Mutex::new(value_bundle_with(3)),
            registered: Mutex::new(true),
            staked: Mutex::new(true),
            nonce_queries: AtomicUsize::new(0),
            bundle_queries: AtomicUsize::new(0),
            registration_checks: AtomicUsize::new(0),
            stake_checks: AtomicUsize::new(0),
        }
    }

    pub fn with_nonce(nonce: BlockHeight) -> Self {
        let chain = Self::new();
        *chain.default_nonce.lock() = Some(nonce);
        chain
    }

    pub fn push_worker_nonce(&self, result: Result<Option<BlockHeight>, ChainError>) {
        self.worker_nonces.lock().push_back(result);
    }

    pub fn push_reputer_nonce(&self, result: Result<Option<BlockHeight>, ChainError>) {
        self.reputer_nonces.lock().push_back(result);
    }

    pub fn set_nonce(&self, nonce: Option<BlockHeight>) {
        *self.default_nonce.lock() = nonce;
    }

    fn next(&self, queue: &Mutex<VecDeque<Result<Option<BlockHeight>, ChainError>>>) -> Result<Option<BlockHeight>, ChainError> {
        self.nonce_queries.fetch_add(1, Ordering::SeqCst);
        queue
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(*self.default_nonce.lock()))
    }
}

impl Default for MockChain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChainQuery for MockChain {
    async fn latest_open_worker_nonce(&self, _topic_id: TopicId) -> Result<Option<BlockHeight>, ChainError> {
        self.next(&self.worker_nonces)
    }

    async fn oldest_open_reputer_nonce(&self, _topic_id: TopicId) -> Result<Option<BlockHeight>, ChainError> {
        self.next(&self.reputer_nonces)
    }

    async fn aggregated_value_bundle(&self, topic_id: TopicId, _nonce: BlockHeight) -> Result<ValueBundle, ChainError> {
        self.bundle_queries.fetch_add(1, Ordering::SeqCst);
        let mut bundle = self.value_bundle.lock().clone();
        if !bundle.is_empty() {
            bundle.topic_id = topic_id;
        }
        Ok(bundle)
    }
}

#[async_trait]
impl Registrar for MockChain {
    async fn ensure_registered(&self, _role: Role, _topic_id: TopicId) -> Result<bool, ChainError> {
        self.registration_checks.fetch_add(1, Ordering::SeqCst);
        Ok(*self.registered.lock())
    }

    async fn ensure_staked(&self, _topic_id: TopicId, _min_stake: u128) -> Result<bool, ChainError> {
        self.stake_checks.fetch_add(1, Ordering::SeqCst);
        Ok(*self.staked.lock())
    }
}

/// Transaction client replaying queued results.
/// Builds succeed with `gas` and the requested (or chain) sequence unless a
/// build error is queued; broadcasts succeed unless an error is queued.
pub struct MockTxClient {
    pub gas: u64,
    pub chain_sequence: Mutex<u64>,
    build_errors: Mutex<VecDeque<ChainError>>,
    broadcast_results: Mutex<VecDeque<Result<TxResponse, ChainError>>>,
    /// Every broadcast fails with this error when set
    pub always_fail: Mutex<Option<ChainError>>,
    pub build_calls: Mutex<Vec<TxOptions>>,
    pub broadcasts: AtomicUsize,
}

impl MockTxClient {
    pub fn new() -> Self {
        Self {
            gas: 100_000,
            chain_sequence: Mutex::new(1),
            build_errors: Mutex::new(VecDeque::new()),
            broadcast_results: Mutex::new(VecDeque::new()),
            always_fail: Mutex::new(None),
            build_calls: Mutex::new(Vec::new()),
            broadcasts: AtomicUsize::new(0),
        }
    }

    pub fn failing_with(error: ChainError) -> Self {
        let client = Self::new();
        *client.always_fail.lock() = Some(error);
        client
    }

    pub fn push_build_error(&self, error: ChainError) {
        self.build_errors.lock().push_back(error);
    }

    pub fn push_broadcast(&self, result: Result<TxResponse, ChainError>) {
        self.broadcast_results.lock().push_back(result);
    }

    pub fn broadcast_count(&self) -> usize {
        self.broadcasts.load(Ordering::SeqCst)
    }

    pub fn build_options(&self) -> Vec<TxOptions> {
        self.build_calls.lock().clone()
    }
}

impl Default for MockTxClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TxClient for MockTxClient {
    async fn build_transaction(&self, _message: &ChainMessage, options: &TxOptions) -> Result<TxHandle, ChainError> {
        self.build_calls.lock().push(options.clone());
        if let Some(err) = self.build_errors.lock().pop_front() {
            return Err(err);
        }
        Ok(TxHandle {
            gas: self.gas,
            sequence: options.sequence.unwrap_or(*self.chain_sequence.lock()),
            tx_bytes: vec![1, 2, 3],
        })
    }

    async fn broadcast(&self, tx: &TxHandle) -> Result<TxResponse, ChainError> {
        let n = self.broadcasts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.always_fail.lock().clone() {
            return Err(err);
        }
        self.broadcast_results.lock().pop_front().unwrap_or_else(|| {
            Ok(TxResponse {
                tx_hash: format!("HASH{}-{}", tx.sequence, n),
            })
        })
    }
}

/// Inferer returning a fixed value
pub struct MockInferer {
    pub value: String,
    pub calls: AtomicUsize,
}

impl MockInferer {
    pub fn new(value: &str) -> Self {
        Self {
            value: value.to_string(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Inferer for MockInferer {
    async fn infer(&self, _topic_id: TopicId, _block_height: BlockHeight) -> Result<String, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.value.clone())
    }
}

pub struct MockForecaster {
    pub values: Vec<NodeValue>,
    pub calls: AtomicUsize,
}

impl MockForecaster {
    pub fn new(values: Vec<NodeValue>) -> Self {
        Self {
            values,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Forecaster for MockForecaster {
    async fn forecast(&self, _topic_id: TopicId, _block_height: BlockHeight) -> Result<Vec<NodeValue>, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.values.clone())
    }
}

pub struct MockGroundTruth {
    pub truth: String,
    pub calls: AtomicUsize,
}

impl MockGroundTruth {
    pub fn new(truth: &str) -> Self {
        Self {
            truth: truth.to_string(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl GroundTruthSource for MockGroundTruth {
    async fn ground_truth(&self, _topic_id: TopicId, _block_height: BlockHeight) -> Result<String, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.truth.clone())
    }
}

/// Loss function recording every `(truth, value)` pair it is asked about.
/// The loss returned is `value` itself unless overridden.
pub struct MockLoss {
    pub never_negative: bool,
    pub fixed_loss: Mutex<Option<String>>,
    pub seen: Mutex<Vec<(String, String)>>,
    pub sign_queries: AtomicUsize,
}

impl MockLoss {
    pub fn new(never_negative: bool) -> Self {
        Self {
            never_negative,
            fixed_loss: Mutex::new(None),
            seen: Mutex::new(Vec::new()),
            sign_queries: AtomicUsize::new(0),
        }
    }

    pub fn returning(never_negative: bool, loss: &str) -> Self {
        let mock = Self::new(never_negative);
        *mock.fixed_loss.lock() = Some(loss.to_string());
        mock
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().len()
    }
}

#[async_trait]
impl LossFunction for MockLoss {
    async fn compute_loss(
        &self,
        ground_truth: &str,
        value: &str,
        _options: &HashMap<String, String>,
    ) -> Result<String, AdapterError> {
        self.seen.lock().push((ground_truth.to_string(), value.to_string()));
        Ok(self.fixed_loss.lock().clone().unwrap_or_else(|| value.to_string()))
    }

    async fn is_loss_never_negative(&self, _options: &HashMap<String, String>) -> Result<bool, AdapterError> {
        self.sign_queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.never_negative)
    }
}

pub fn worker_adapters(inferer: Arc<MockInferer>) -> WorkerAdapters {
    WorkerAdapters {
        inferer: Some(inferer as Arc<dyn Inferer>),
        forecaster: None,
    }
}

pub fn reputer_adapters(truth: Arc<MockGroundTruth>, loss: Arc<MockLoss>) -> ReputerAdapters {
    ReputerAdapters {
        ground_truth: truth,
        loss,
        loss_options: HashMap::new(),
    }
}

/// Retry config with short delays for paused-clock tests
pub fn fast_retry_config(max_retries: u32) -> RetryConfig {
    RetryConfig {
        max_retries,
        retry_delay: 1,
        account_sequence_retry_delay: 1,
        gas_prices: 0.0,
        max_fees: 1_000_000,
        fee_denom: "uallo".to_string(),
        call_timeout: Duration::from_secs(5),
    }
}

/// Fully wired node over the given mocks; wrap in `Arc` after tweaking
pub fn test_node(
    chain: Arc<MockChain>,
    tx: Arc<MockTxClient>,
    retry: RetryConfig,
    shutdown: Shutdown,
) -> NodeContext {
    let keystore = test_keystore();
    let identity = test_identity(&keystore);
    let metrics = Arc::new(Metrics::new().expect("metrics registry"));
    NodeContext {
        identity: identity.clone(),
        chain: chain.clone(),
        registrar: chain,
        engine: Arc::new(SubmissionEngine::new(tx, retry, shutdown.clone())),
        signer: Arc::new(BundleSigner::new(keystore, identity.clone())),
        builder: Arc::new(PayloadBuilder::new(
            identity.address.clone(),
            Duration::from_secs(5),
            Arc::clone(&metrics),
        )),
        metrics,
        submit_tx: true,
        call_timeout: Duration::from_secs(5),
        shutdown,
    }
}
