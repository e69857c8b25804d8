//! Bundle signing with the node's keystore key

use super::PayloadError;
use crate::bundle::{canonical_bytes, InferenceForecastBundle, ReputerValueBundle, ValueBundle, WorkerDataBundle};
use crate::types::{BlockHeight, TopicId};
use crate::wallet::{Keystore, NodeIdentity};
use std::sync::Arc;

pub struct BundleSigner {
    keystore: Arc<dyn Keystore>,
    identity: NodeIdentity,
}

impl BundleSigner {
    pub fn new(keystore: Arc<dyn Keystore>, identity: NodeIdentity) -> Self {
        Self { keystore, identity }
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    fn sign_bytes(&self, bytes: &[u8]) -> Result<(Vec<u8>, String), PayloadError> {
        self.keystore
            .sign(&self.identity.key_name, bytes)
            .map_err(PayloadError::Signing)
    }

    /// Sign a worker bundle and wrap it for `topic_id` at `nonce`
    pub fn sign_worker_bundle(
        &self,
        bundle: InferenceForecastBundle,
        topic_id: TopicId,
        nonce: BlockHeight,
    ) -> Result<WorkerDataBundle, PayloadError> {
        let bytes = canonical_bytes(&bundle).map_err(PayloadError::Encoding)?;
        let (signature, pubkey) = self.sign_bytes(&bytes)?;
        Ok(WorkerDataBundle {
            worker: self.identity.address.clone(),
            nonce,
            topic_id,
            inference_forecasts_bundle: bundle,
            inferences_forecasts_bundle_signature: signature,
            pubkey,
        })
    }

    pub fn sign_value_bundle(&self, bundle: ValueBundle) -> Result<ReputerValueBundle, PayloadError> {
        let bytes = canonical_bytes(&bundle).map_err(PayloadError::Encoding)?;
        let (signature, pubkey) = self.sign_bytes(&bytes)?;
        Ok(ReputerValueBundle {
            value_bundle: bundle,
            signature,
            pubkey,
        })
    }
}
