//! Payload construction
//!
//! [`PayloadBuilder`] turns adapter output into unsigned bundles for one
//! topic epoch; [`BundleSigner`] signs them. Every adapter and chain call is
//! bounded by the configured call timeout.

pub mod signer;

pub use signer::BundleSigner;

use crate::adapters::{AdapterError, LossFunction, ReputerAdapters, WorkerAdapters};
use crate::bundle::{
    Forecast, ForecastElement, Inference, InferenceForecastBundle, ReputerRequestNonce, ValidationError,
    ValueBundle, WithheldWorkerAttributedValue, WorkerAttributedValue,
};
use crate::chain::{ChainError, ChainQuery};
use crate::decimal::{Dec, DecError};
use crate::metrics::Metrics;
use crate::types::{BlockHeight, TopicId};
use crate::wallet::KeystoreError;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PayloadError {
    #[error("worker has neither an inference nor a forecast adapter")]
    NoCapability,

    #[error("{what} adapter failed: {source}")]
    Adapter {
        what: &'static str,
        #[source]
        source: AdapterError,
    },

    #[error("{what} timed out after {timeout:?}")]
    Timeout { what: &'static str, timeout: Duration },

    #[error("invalid {what}: {source}")]
    InvalidValue {
        what: String,
        #[source]
        source: DecError,
    },

    #[error("chain query failed: {0}")]
    Chain(#[from] ChainError),

    #[error("empty value bundle")]
    EmptyValueBundle,

    #[error("signing failed: {0}")]
    Signing(KeystoreError),

    #[error("encoding failed: {0}")]
    Encoding(ValidationError),

    #[error("bundle failed validation: {0}")]
    Validation(ValidationError),
}

impl PayloadError {
    /// Whether the same epoch could succeed on a later attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            PayloadError::Adapter { source, .. } => source.is_retryable(),
            PayloadError::Timeout { .. } => true,
            PayloadError::Chain(e) => e.is_transport(),
            _ => false,
        }
    }
}

pub struct PayloadBuilder {
    address: String,
    call_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl PayloadBuilder {
    pub fn new(address: impl Into<String>, call_timeout: Duration, metrics: Arc<Metrics>) -> Self {
        Self {
            address: address.into(),
            call_timeout,
            metrics,
        }
    }

    async fn adapter_call<T>(
        &self,
        what: &'static str,
        fut: impl Future<Output = Result<T, AdapterError>>,
    ) -> Result<T, PayloadError> {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result.map_err(|source| PayloadError::Adapter { what, source }),
            Err(_) => Err(PayloadError::Timeout {
                what,
                timeout: self.call_timeout,
            }),
        }
    }

    /// Inference and/or forecast bundle for `topic_id` at `nonce`
    pub async fn build_worker_bundle(
        &self,
        adapters: &WorkerAdapters,
        topic_id: TopicId,
        nonce: BlockHeight,
    ) -> Result<InferenceForecastBundle, PayloadError> {
        if adapters.is_empty() {
            return Err(PayloadError::NoCapability);
        }

        let mut bundle = InferenceForecastBundle::default();

        if let Some(inferer) = &adapters.inferer {
            let raw = self.adapter_call("inference", inferer.infer(topic_id, nonce)).await?;
            let value = parse_dec(&raw, "inference value")?;
            self.metrics.inc_value_computed(&self.address, topic_id, "inference");
            bundle.inference = Some(Inference {
                topic_id,
                block_height: nonce,
                inferer: self.address.clone(),
                value,
            });
        }

        if let Some(forecaster) = &adapters.forecaster {
            let raw = self.adapter_call("forecast", forecaster.forecast(topic_id, nonce)).await?;
            let mut elements = Vec::with_capacity(raw.len());
            for (i, node_value) in raw.into_iter().enumerate() {
                elements.push(ForecastElement {
                    value: parse_dec(&node_value.value, &format!("forecast element {}", i))?,
                    inferer: node_value.worker,
                });
            }
            self.metrics.inc_value_computed(&self.address, topic_id, "forecast");
            if !elements.is_empty() {
                bundle.forecast = Some(Forecast {
                    topic_id,
                    block_height: nonce,
                    forecaster: self.address.clone(),
                    forecast_elements: elements,
                });
            }
        }

        Ok(bundle)
    }

    /// Loss bundle scoring the network's aggregate for `nonce`
    pub async fn build_reputer_bundle(
        &self,
        chain: &dyn ChainQuery,
        adapters: &ReputerAdapters,
        never_negative: &mut Option<bool>,
        topic_id: TopicId,
        nonce: BlockHeight,
    ) -> Result<ValueBundle, PayloadError> {
        let mut values = match tokio::time::timeout(self.call_timeout, chain.aggregated_value_bundle(topic_id, nonce)).await {
            Ok(result) => result?,
            Err(_) => return Err(PayloadError::Chain(ChainError::Timeout(self.call_timeout))),
        };
        if values.is_empty() {
            return Err(PayloadError::EmptyValueBundle);
        }
        values.topic_id = topic_id;
        values.reputer_request_nonce = Some(ReputerRequestNonce { reputer_nonce: nonce });
        values.reputer = self.address.clone();

        let truth = self
            .adapter_call("ground truth", adapters.ground_truth.ground_truth(topic_id, nonce))
            .await?;
        self.metrics.inc_value_computed(&self.address, topic_id, "ground_truth");

        let losses = self
            .compute_loss_bundle(&truth, &values, adapters.loss.as_ref(), &adapters.loss_options, never_negative)
            .await?;
        self.metrics.inc_value_computed(&self.address, topic_id, "loss");
        Ok(losses)
    }

    /// Parallel bundle holding the loss of every value against `truth`.
    /// Ordering, entry counts and worker attributions match `values`.
    pub async fn compute_loss_bundle(
        &self,
        truth: &str,
        values: &ValueBundle,
        loss: &dyn LossFunction,
        options: &HashMap<String, String>,
        never_negative: &mut Option<bool>,
    ) -> Result<ValueBundle, PayloadError> {
        if values.is_empty() {
            return Err(PayloadError::EmptyValueBundle);
        }

        let log_scale = match *never_negative {
            Some(flag) => flag,
            None => {
                let flag = self
                    .adapter_call("is loss never negative", loss.is_loss_never_negative(options))
                    .await?;
                debug!(never_negative = flag, "cached loss function sign");
                *never_negative = Some(flag);
                flag
            }
        };

        let scorer = LossScorer {
            builder: self,
            truth,
            loss,
            options,
            log_scale,
        };

        let mut losses = ValueBundle {
            topic_id: values.topic_id,
            reputer_request_nonce: values.reputer_request_nonce,
            reputer: values.reputer.clone(),
            extra_data: values.extra_data.clone(),
            combined_value: scorer.score(&values.combined_value, "combined value".to_string()).await?,
            naive_value: scorer.score(&values.naive_value, "naive value".to_string()).await?,
            ..ValueBundle::default()
        };

        for (i, v) in values.inferer_values.iter().enumerate() {
            losses.inferer_values.push(WorkerAttributedValue {
                worker: v.worker.clone(),
                value: scorer.score(&v.value, format!("inferer value {}", i)).await?,
            });
        }
        for (i, v) in values.forecaster_values.iter().enumerate() {
            losses.forecaster_values.push(WorkerAttributedValue {
                worker: v.worker.clone(),
                value: scorer.score(&v.value, format!("forecaster value {}", i)).await?,
            });
        }
        for (i, v) in values.one_out_inferer_values.iter().enumerate() {
            losses.one_out_inferer_values.push(WithheldWorkerAttributedValue {
                worker: v.worker.clone(),
                value: scorer.score(&v.value, format!("one-out inferer value {}", i)).await?,
            });
        }
        for (i, v) in values.one_out_forecaster_values.iter().enumerate() {
            losses.one_out_forecaster_values.push(WithheldWorkerAttributedValue {
                worker: v.worker.clone(),
                value: scorer.score(&v.value, format!("one-out forecaster value {}", i)).await?,
            });
        }
        for (i, v) in values.one_in_forecaster_values.iter().enumerate() {
            losses.one_in_forecaster_values.push(WorkerAttributedValue {
                worker: v.worker.clone(),
                value: scorer.score(&v.value, format!("one-in forecaster value {}", i)).await?,
            });
        }

        Ok(losses)
    }
}

struct LossScorer<'a> {
    builder: &'a PayloadBuilder,
    truth: &'a str,
    loss: &'a dyn LossFunction,
    options: &'a HashMap<String, String>,
    log_scale: bool,
}

impl LossScorer<'_> {
    async fn score(&self, value: &Dec, what: String) -> Result<Dec, PayloadError> {
        let raw = self
            .builder
            .adapter_call("loss", self.loss.compute_loss(self.truth, &value.to_string(), self.options))
            .await?;
        let loss = parse_dec(&raw, &format!("loss for {}", what))?;
        if !self.log_scale {
            return Ok(loss);
        }
        loss.log10().map_err(|source| PayloadError::InvalidValue {
            what: format!("log10 loss for {}", what),
            source,
        })
    }
}

fn parse_dec(raw: &str, what: &str) -> Result<Dec, PayloadError> {
    raw.parse().map_err(|source| PayloadError::InvalidValue {
        what: what.to_string(),
        source,
    })
}
