//! HTTP compute adapter (`"api"` entrypoint)
//!
//! Endpoint templates come from the topic's parameters. `{Token}`,
//! `{BlockHeight}` and `{TopicId}` are substituted before each request, and
//! any other `{Key}` is filled from a parameter of the same name.

use super::{AdapterError, Forecaster, GroundTruthSource, Inferer, LossFunction};
use crate::types::{BlockHeight, NodeValue, TopicId};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::value::RawValue;
use std::collections::HashMap;
use tracing::debug;

pub const INFERENCE_ENDPOINT: &str = "InferenceEndpoint";
pub const FORECAST_ENDPOINT: &str = "ForecastEndpoint";
pub const GROUND_TRUTH_ENDPOINT: &str = "GroundTruthEndpoint";

pub struct HttpAdapter {
    http: reqwest::Client,
    parameters: HashMap<String, String>,
    loss_service: Option<String>,
}

#[derive(Serialize)]
struct LossRequest<'a> {
    y_true: &'a str,
    y_pred: &'a str,
    options: &'a HashMap<String, String>,
}

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{(\w+)\}").expect("static regex"));

/// Keep the service's number exactly as written; JSON strings are unquoted
fn de_number_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let raw = Box::<RawValue>::deserialize(deserializer)?;
    let text = raw.get().trim();
    if text.starts_with('"') {
        return serde_json::from_str(text).map_err(serde::de::Error::custom);
    }
    if text.starts_with(|c: char| c == '-' || c.is_ascii_digit()) {
        return Ok(text.to_string());
    }
    Err(serde::de::Error::custom(format!("expected a number or string, got {}", text)))
}

#[derive(Deserialize)]
struct LossResponse {
    #[serde(deserialize_with = "de_number_text")]
    loss: String,
}

#[derive(Deserialize)]
struct NeverNegativeResponse {
    is_never_negative: bool,
}

#[derive(Deserialize)]
struct ForecastEntry {
    worker: String,
    #[serde(deserialize_with = "de_number_text")]
    value: String,
}

impl HttpAdapter {
    pub fn new(http: reqwest::Client, parameters: HashMap<String, String>, loss_service: Option<String>) -> Self {
        Self {
            http,
            parameters,
            loss_service,
        }
    }

    pub(crate) fn require(&self, key: &str) -> Result<&str, AdapterError> {
        self.parameters
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| AdapterError::MissingParameter(key.to_string()))
    }

    fn endpoint(&self, key: &str, topic_id: TopicId, block_height: BlockHeight) -> Result<String, AdapterError> {
        let template = self.require(key)?;
        Ok(render_template(template, &self.parameters, topic_id, block_height))
    }

    fn loss_service(&self) -> Result<&str, AdapterError> {
        self.loss_service
            .as_deref()
            .map(|s| s.trim_end_matches('/'))
            .ok_or_else(|| AdapterError::MissingParameter("loss_function_service".to_string()))
    }

    async fn get_text(&self, url: &str) -> Result<String, AdapterError> {
        debug!(url, "adapter request");
        let response = self.http.get(url).send().await.map_err(map_err)?;
        let body = read_body(response).await?;
        Ok(strip_quotes(body.trim()).to_string())
    }

    async fn read_json<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T, AdapterError> {
        let response = request.send().await.map_err(map_err)?;
        let body = read_body(response).await?;
        serde_json::from_str(&body).map_err(|e| AdapterError::Decode(e.to_string()))
    }
}

fn map_err(err: reqwest::Error) -> AdapterError {
    if err.is_timeout() {
        AdapterError::Request(format!("timed out: {}", err))
    } else {
        AdapterError::Request(err.to_string())
    }
}

async fn read_body(response: reqwest::Response) -> Result<String, AdapterError> {
    let status = response.status();
    let body = response.text().await.map_err(map_err)?;
    if !status.is_success() {
        return Err(AdapterError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(body)
}

fn strip_quotes(s: &str) -> &str {
    s.strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(s)
}

/// Substitute placeholders in an endpoint template
///
/// Single pass over the template: substituted values are never rescanned,
/// and unknown placeholders are left as they are.
pub fn render_template(
    template: &str,
    parameters: &HashMap<String, String>,
    topic_id: TopicId,
    block_height: BlockHeight,
) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| match &caps[1] {
            "BlockHeight" => block_height.to_string(),
            "TopicId" => topic_id.to_string(),
            key => parameters
                .get(key)
                .cloned()
                .unwrap_or_else(|| caps[0].to_string()),
        })
        .into_owned()
}

#[async_trait]
impl Inferer for HttpAdapter {
    async fn infer(&self, topic_id: TopicId, block_height: BlockHeight) -> Result<String, AdapterError> {
        let url = self.endpoint(INFERENCE_ENDPOINT, topic_id, block_height)?;
        self.get_text(&url).await
    }
}

#[async_trait]
impl Forecaster for HttpAdapter {
    async fn forecast(&self, topic_id: TopicId, block_height: BlockHeight) -> Result<Vec<NodeValue>, AdapterError> {
        let url = self.endpoint(FORECAST_ENDPOINT, topic_id, block_height)?;
        let entries: Vec<ForecastEntry> = self.read_json(self.http.get(&url)).await?;
        Ok(entries
            .into_iter()
            .map(|e| NodeValue::new(e.worker, e.value))
            .collect())
    }
}

#[async_trait]
impl GroundTruthSource for HttpAdapter {
    async fn ground_truth(&self, topic_id: TopicId, block_height: BlockHeight) -> Result<String, AdapterError> {
        let url = self.endpoint(GROUND_TRUTH_ENDPOINT, topic_id, block_height)?;
        self.get_text(&url).await
    }
}

#[async_trait]
impl LossFunction for HttpAdapter {
    async fn compute_loss(
        &self,
        ground_truth: &str,
        value: &str,
        options: &HashMap<String, String>,
    ) -> Result<String, AdapterError> {
        let url = format!("{}/calculate", self.loss_service()?);
        let body = LossRequest {
            y_true: ground_truth,
            y_pred: value,
            options,
        };
        let response: LossResponse = self.read_json(self.http.post(&url).json(&body)).await?;
        Ok(response.loss)
    }

    async fn is_loss_never_negative(&self, options: &HashMap<String, String>) -> Result<bool, AdapterError> {
        let url = format!("{}/is_never_negative", self.loss_service()?);
        let response: NeverNegativeResponse = self.read_json(self.http.get(&url).query(options)).await?;
        Ok(response.is_never_negative)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_template() {
        let params: HashMap<String, String> = [("Token".to_string(), "ETH".to_string())].into();
        assert_eq!(
            render_template("http://h/inference/{Token}/{TopicId}?h={BlockHeight}", &params, 3, 120),
            "http://h/inference/ETH/3?h=120"
        );
    }

    #[test]
    fn test_render_template_does_not_rescan_values() {
        let params: HashMap<String, String> = [
            ("Token".to_string(), "ETH".to_string()),
            ("Path".to_string(), "{Token}".to_string()),
            ("Model".to_string(), "{BlockHeight}".to_string()),
        ]
        .into();
        for _ in 0..16 {
            assert_eq!(
                render_template("http://h/{Path}/{Token}/{Model}/{Missing}", &params, 1, 9),
                "http://h/{Token}/ETH/{BlockHeight}/{Missing}"
            );
        }
    }

    #[test]
    fn test_numbers_keep_their_digits() {
        let entries: Vec<ForecastEntry> = serde_json::from_str(
            r#"[{"worker":"a","value":0.12345678901234567890123},{"worker":"b","value":"7.5"},{"worker":"c","value":1e400}]"#,
        )
        .unwrap();
        assert_eq!(entries[0].value, "0.12345678901234567890123");
        assert_eq!(entries[1].value, "7.5");
        assert_eq!(entries[2].value, "1e400");

        let loss: LossResponse = serde_json::from_str(r#"{"loss": 0.30000000000000004441}"#).unwrap();
        assert_eq!(loss.loss, "0.30000000000000004441");
        assert!(serde_json::from_str::<LossResponse>(r#"{"loss":true}"#).is_err());
    }

    #[test]
    fn test_strip_quotes() {
        assert_eq!(strip_quotes("\"1.5\""), "1.5");
        assert_eq!(strip_quotes("1.5"), "1.5");
        assert_eq!(strip_quotes("\""), "\"");
    }
}
