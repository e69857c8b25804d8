//! Compute adapters
//!
//! Each capability is an independent trait so a topic only wires what it
//! uses. Entrypoint names from the configuration are resolved once at
//! startup; an unknown name is a configuration error.

use crate::config::{ReputerConfig, WorkerConfig};
use crate::types::{BlockHeight, NodeValue, TopicId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod http;

pub use http::HttpAdapter;

/// Entrypoint name of the built-in HTTP adapter
pub const API_ENTRYPOINT: &str = "api";

#[derive(Debug, Clone, Error, PartialEq)]
pub enum AdapterError {
    #[error("unknown adapter entrypoint '{0}'")]
    UnknownEntrypoint(String),

    #[error("missing adapter parameter '{0}'")]
    MissingParameter(String),

    #[error("adapter request failed: {0}")]
    Request(String),

    #[error("adapter returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected adapter response: {0}")]
    Decode(String),

    #[error("adapter call timed out after {0:?}")]
    Timeout(Duration),
}

impl AdapterError {
    pub fn is_retryable(&self) -> bool {
        match self {
            AdapterError::Request(_) | AdapterError::Timeout(_) => true,
            AdapterError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[async_trait]
pub trait Inferer: Send + Sync {
    /// Decimal string inference for the epoch at `block_height`
    async fn infer(&self, topic_id: TopicId, block_height: BlockHeight) -> Result<String, AdapterError>;
}

#[async_trait]
pub trait Forecaster: Send + Sync {
    /// Forecasted losses per inferer
    async fn forecast(&self, topic_id: TopicId, block_height: BlockHeight) -> Result<Vec<NodeValue>, AdapterError>;
}

#[async_trait]
pub trait GroundTruthSource: Send + Sync {
    async fn ground_truth(&self, topic_id: TopicId, block_height: BlockHeight) -> Result<String, AdapterError>;
}

#[async_trait]
pub trait LossFunction: Send + Sync {
    /// Loss of `value` against `ground_truth`, as a decimal string
    async fn compute_loss(
        &self,
        ground_truth: &str,
        value: &str,
        options: &HashMap<String, String>,
    ) -> Result<String, AdapterError>;

    async fn is_loss_never_negative(&self, options: &HashMap<String, String>) -> Result<bool, AdapterError>;
}

/// Capabilities wired for one worker topic
#[derive(Clone, Default)]
pub struct WorkerAdapters {
    pub inferer: Option<Arc<dyn Inferer>>,
    pub forecaster: Option<Arc<dyn Forecaster>>,
}

impl WorkerAdapters {
    pub fn is_empty(&self) -> bool {
        self.inferer.is_none() && self.forecaster.is_none()
    }
}

/// Capabilities wired for one reputer topic
#[derive(Clone)]
pub struct ReputerAdapters {
    pub ground_truth: Arc<dyn GroundTruthSource>,
    pub loss: Arc<dyn LossFunction>,
    pub loss_options: HashMap<String, String>,
}

/// Resolves configured entrypoint names into adapters
pub struct AdapterRegistry {
    http: reqwest::Client,
}

impl AdapterRegistry {
    pub fn new(request_timeout: Duration) -> Result<Self, AdapterError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| AdapterError::Request(e.to_string()))?;
        Ok(Self { http })
    }

    fn api(&self, entrypoint: &str, parameters: &HashMap<String, String>, loss_service: Option<&str>) -> Result<Arc<HttpAdapter>, AdapterError> {
        if entrypoint != API_ENTRYPOINT {
            return Err(AdapterError::UnknownEntrypoint(entrypoint.to_string()));
        }
        Ok(Arc::new(HttpAdapter::new(
            self.http.clone(),
            parameters.clone(),
            loss_service.map(str::to_string),
        )))
    }

    pub fn worker(&self, config: &WorkerConfig) -> Result<WorkerAdapters, AdapterError> {
        let inferer = match config.inference_entrypoint.as_deref() {
            Some(name) => {
                let adapter = self.api(name, &config.parameters, None)?;
                adapter.require(http::INFERENCE_ENDPOINT)?;
                Some(adapter as Arc<dyn Inferer>)
            }
            None => None,
        };
        let forecaster = match config.forecast_entrypoint.as_deref() {
            Some(name) => {
                let adapter = self.api(name, &config.parameters, None)?;
                adapter.require(http::FORECAST_ENDPOINT)?;
                Some(adapter as Arc<dyn Forecaster>)
            }
            None => None,
        };
        Ok(WorkerAdapters { inferer, forecaster })
    }

    pub fn reputer(&self, config: &ReputerConfig) -> Result<ReputerAdapters, AdapterError> {
        let ground_truth = self.api(&config.ground_truth_entrypoint, &config.ground_truth_parameters, None)?;
        ground_truth.require(http::GROUND_TRUTH_ENDPOINT)?;

        let loss_params = &config.loss_function_parameters;
        if loss_params.loss_function_service.trim().is_empty() {
            return Err(AdapterError::MissingParameter("loss_function_service".to_string()));
        }
        let loss = self.api(
            &config.loss_function_entrypoint,
            &loss_params.loss_method_options,
            Some(&loss_params.loss_function_service),
        )?;

        Ok(ReputerAdapters {
            ground_truth,
            loss,
            loss_options: loss_params.loss_method_options.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LossFunctionParameters;

    fn registry() -> AdapterRegistry {
        AdapterRegistry::new(Duration::from_secs(5)).unwrap()
    }

    fn worker(inference: Option<&str>, params: &[(&str, &str)]) -> WorkerConfig {
        WorkerConfig {
            topic_id: 1,
            inference_entrypoint: inference.map(str::to_string),
            forecast_entrypoint: None,
            loop_seconds: 5,
            parameters: params.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    #[test]
    fn test_resolves_api_inferer() {
        let adapters = registry()
            .worker(&worker(Some("api"), &[("InferenceEndpoint", "http://x/{Token}")]))
            .unwrap();
        assert!(adapters.inferer.is_some());
        assert!(adapters.forecaster.is_none());
        assert!(!adapters.is_empty());
    }

    #[test]
    fn test_unknown_entrypoint_rejected() {
        let err = registry().worker(&worker(Some("python"), &[])).err().unwrap();
        assert_eq!(err, AdapterError::UnknownEntrypoint("python".to_string()));
    }

    #[test]
    fn test_missing_endpoint_parameter_rejected() {
        let err = registry().worker(&worker(Some("api"), &[])).err().unwrap();
        assert_eq!(err, AdapterError::MissingParameter("InferenceEndpoint".to_string()));
    }

    #[test]
    fn test_reputer_requires_loss_service() {
        let config = ReputerConfig {
            topic_id: 2,
            ground_truth_entrypoint: "api".to_string(),
            loss_function_entrypoint: "api".to_string(),
            min_stake: 0,
            loop_seconds: 5,
            ground_truth_parameters: [("GroundTruthEndpoint".to_string(), "http://gt".to_string())].into(),
            loss_function_parameters: LossFunctionParameters::default(),
        };
        assert!(matches!(
            registry().reputer(&config),
            Err(AdapterError::MissingParameter(_))
        ));
    }

    #[test]
    fn test_retryable_errors() {
        assert!(AdapterError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(AdapterError::Status { status: 503, body: String::new() }.is_retryable());
        assert!(!AdapterError::Status { status: 400, body: String::new() }.is_retryable());
        assert!(!AdapterError::Decode("x".into()).is_retryable());
    }
}
