//! Payload bundles submitted to the chain
//!
//! Unsigned bundles are produced by the payload builder, then signed over
//! their canonical binary encoding (see [`canonical_bytes`]). Signed bundles
//! must pass [`WorkerDataBundle::validate`] / [`ReputerValueBundle::validate`]
//! before they are handed to the submission engine.

use crate::decimal::Dec;
use crate::types::{BlockHeight, TopicId};
use crate::wallet::verify_signature;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// ed25519 signature length
pub const SIGNATURE_LEN: usize = 64;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("mismatched {field}: expected {expected}, got {actual}")]
    Mismatch {
        field: &'static str,
        expected: String,
        actual: String,
    },

    #[error("duplicate worker '{worker}' in {list}")]
    DuplicateWorker { list: &'static str, worker: String },

    #[error("invalid signature: {0}")]
    Signature(String),

    #[error("encoding failed: {0}")]
    Encoding(String),
}

/// Canonical binary encoding used for signing
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, ValidationError> {
    bincode::serialize(value).map_err(|e| ValidationError::Encoding(e.to_string()))
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        STANDARD.decode(raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inference {
    pub topic_id: TopicId,
    pub block_height: BlockHeight,
    pub inferer: String,
    pub value: Dec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForecastElement {
    pub inferer: String,
    pub value: Dec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Forecast {
    pub topic_id: TopicId,
    pub block_height: BlockHeight,
    pub forecaster: String,
    pub forecast_elements: Vec<ForecastElement>,
}

/// Unsigned worker payload
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InferenceForecastBundle {
    pub inference: Option<Inference>,
    pub forecast: Option<Forecast>,
}

/// Signed worker payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerDataBundle {
    pub worker: String,
    pub nonce: BlockHeight,
    pub topic_id: TopicId,
    pub inference_forecasts_bundle: InferenceForecastBundle,
    #[serde(with = "base64_bytes")]
    pub inferences_forecasts_bundle_signature: Vec<u8>,
    pub pubkey: String,
}

impl WorkerDataBundle {
    /// Structural validation, including signature verification
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.worker.is_empty() {
            return Err(ValidationError::MissingField("worker"));
        }
        if self.nonce <= 0 {
            return Err(ValidationError::MissingField("nonce"));
        }
        let bundle = &self.inference_forecasts_bundle;
        if bundle.inference.is_none() && bundle.forecast.is_none() {
            return Err(ValidationError::MissingField("inference or forecast"));
        }

        if let Some(inference) = &bundle.inference {
            expect_eq("inference.topic_id", self.topic_id, inference.topic_id)?;
            expect_eq("inference.block_height", self.nonce, inference.block_height)?;
            expect_eq("inference.inferer", &self.worker, &inference.inferer)?;
        }

        if let Some(forecast) = &bundle.forecast {
            expect_eq("forecast.topic_id", self.topic_id, forecast.topic_id)?;
            expect_eq("forecast.block_height", self.nonce, forecast.block_height)?;
            expect_eq("forecast.forecaster", &self.worker, &forecast.forecaster)?;
            if forecast.forecast_elements.is_empty() {
                return Err(ValidationError::MissingField("forecast.forecast_elements"));
            }
            unique_workers(
                "forecast_elements",
                forecast.forecast_elements.iter().map(|e| e.inferer.as_str()),
            )?;
        }

        check_signature(
            &self.pubkey,
            &canonical_bytes(bundle)?,
            &self.inferences_forecasts_bundle_signature,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerAttributedValue {
    pub worker: String,
    pub value: Dec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithheldWorkerAttributedValue {
    pub worker: String,
    pub value: Dec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReputerRequestNonce {
    pub reputer_nonce: BlockHeight,
}

/// Network aggregate for one epoch, or the reputer's parallel loss bundle
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValueBundle {
    #[serde(default)]
    pub topic_id: TopicId,
    #[serde(default)]
    pub reputer_request_nonce: Option<ReputerRequestNonce>,
    #[serde(default)]
    pub reputer: String,
    #[serde(default, with = "base64_bytes")]
    pub extra_data: Vec<u8>,
    #[serde(default)]
    pub combined_value: Dec,
    #[serde(default)]
    pub naive_value: Dec,
    #[serde(default)]
    pub inferer_values: Vec<WorkerAttributedValue>,
    #[serde(default)]
    pub forecaster_values: Vec<WorkerAttributedValue>,
    #[serde(default)]
    pub one_out_inferer_values: Vec<WithheldWorkerAttributedValue>,
    #[serde(default)]
    pub one_out_forecaster_values: Vec<WithheldWorkerAttributedValue>,
    #[serde(default)]
    pub one_in_forecaster_values: Vec<WorkerAttributedValue>,
}

impl ValueBundle {
    /// True when nothing at all was populated
    pub fn is_empty(&self) -> bool {
        self.topic_id == 0
            && self.reputer_request_nonce.is_none()
            && self.reputer.is_empty()
            && self.combined_value.is_zero()
            && self.naive_value.is_zero()
            && self.inferer_values.is_empty()
            && self.forecaster_values.is_empty()
            && self.one_out_inferer_values.is_empty()
            && self.one_out_forecaster_values.is_empty()
            && self.one_in_forecaster_values.is_empty()
            && self.extra_data.is_empty()
    }

    /// Total number of values carried (combined and naive included)
    pub fn value_count(&self) -> usize {
        2 + self.inferer_values.len()
            + self.forecaster_values.len()
            + self.one_out_inferer_values.len()
            + self.one_out_forecaster_values.len()
            + self.one_in_forecaster_values.len()
    }
}

/// Signed reputer payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReputerValueBundle {
    pub value_bundle: ValueBundle,
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
    pub pubkey: String,
}

impl ReputerValueBundle {
    /// Structural validation, including signature verification
    pub fn validate(&self) -> Result<(), ValidationError> {
        let vb = &self.value_bundle;
        if vb.is_empty() {
            return Err(ValidationError::MissingField("value_bundle"));
        }
        if vb.reputer.is_empty() {
            return Err(ValidationError::MissingField("reputer"));
        }
        match vb.reputer_request_nonce {
            Some(n) if n.reputer_nonce > 0 => {}
            _ => return Err(ValidationError::MissingField("reputer_request_nonce")),
        }

        unique_workers("inferer_values", vb.inferer_values.iter().map(|v| v.worker.as_str()))?;
        unique_workers(
            "forecaster_values",
            vb.forecaster_values.iter().map(|v| v.worker.as_str()),
        )?;
        unique_workers(
            "one_out_inferer_values",
            vb.one_out_inferer_values.iter().map(|v| v.worker.as_str()),
        )?;
        unique_workers(
            "one_out_forecaster_values",
            vb.one_out_forecaster_values.iter().map(|v| v.worker.as_str()),
        )?;
        unique_workers(
            "one_in_forecaster_values",
            vb.one_in_forecaster_values.iter().map(|v| v.worker.as_str()),
        )?;

        check_signature(&self.pubkey, &canonical_bytes(vb)?, &self.signature)
    }
}

fn expect_eq<T: PartialEq + std::fmt::Display>(
    field: &'static str,
    expected: T,
    actual: T,
) -> Result<(), ValidationError> {
    if expected != actual {
        return Err(ValidationError::Mismatch {
            field,
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

fn unique_workers<'a>(
    list: &'static str,
    workers: impl Iterator<Item = &'a str>,
) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();
    for worker in workers {
        if worker.is_empty() {
            return Err(ValidationError::MissingField("worker"));
        }
        if !seen.insert(worker) {
            return Err(ValidationError::DuplicateWorker {
                list,
                worker: worker.to_string(),
            });
        }
    }
    Ok(())
}

fn check_signature(pubkey: &str, message: &[u8], signature: &[u8]) -> Result<(), ValidationError> {
    if signature.len() != SIGNATURE_LEN {
        return Err(ValidationError::Signature(format!(
            "expected {} bytes, got {}",
            SIGNATURE_LEN,
            signature.len()
        )));
    }
    verify_signature(pubkey, message, signature)
        .map_err(|e| ValidationError::Signature(e.to_string()))
}
