//! HTTP compute adapter against mocked inference and loss services

use mockito::{Matcher, Server};
use offchain_node::adapters::{AdapterError, AdapterRegistry, Forecaster, GroundTruthSource, HttpAdapter, Inferer, LossFunction};
use offchain_node::config::{LossFunctionParameters, ReputerConfig, WorkerConfig};
use std::collections::HashMap;
use std::time::Duration;

fn params(pairs: &[(&str, String)]) -> HashMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

fn adapter(parameters: HashMap<String, String>, loss_service: Option<String>) -> HttpAdapter {
    HttpAdapter::new(reqwest::Client::new(), parameters, loss_service)
}

#[tokio::test]
async fn test_inference_substitutes_template() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/inference/ETH/7")
        .match_query(Matcher::UrlEncoded("height".into(), "1200".into()))
        .with_status(200)
        .with_body("\"2541.75\"\n")
        .create_async()
        .await;

    let adapter = adapter(
        params(&[
            ("InferenceEndpoint", format!("{}/inference/{{Token}}/{{TopicId}}?height={{BlockHeight}}", server.url())),
            ("Token", "ETH".to_string()),
        ]),
        None,
    );

    assert_eq!(adapter.infer(7, 1200).await.unwrap(), "2541.75");
    mock.assert_async().await;
}

#[tokio::test]
async fn test_inference_http_error_carries_status() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/inference")
        .with_status(503)
        .with_body("model loading")
        .create_async()
        .await;

    let adapter = adapter(params(&[("InferenceEndpoint", format!("{}/inference", server.url()))]), None);
    let err = adapter.infer(1, 1).await.unwrap_err();
    assert_eq!(
        err,
        AdapterError::Status {
            status: 503,
            body: "model loading".to_string()
        }
    );
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_forecast_accepts_numbers_and_strings() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/forecast/3")
        .with_status(200)
        .with_body(r#"[{"worker":"allo1a","value":"0.25"},{"worker":"allo1b","value":1.5}]"#)
        .create_async()
        .await;

    let adapter = adapter(
        params(&[("ForecastEndpoint", format!("{}/forecast/{{TopicId}}", server.url()))]),
        None,
    );
    let values = adapter.forecast(3, 10).await.unwrap();

    assert_eq!(values.len(), 2);
    assert_eq!(values[0].worker, "allo1a");
    assert_eq!(values[0].value, "0.25");
    assert_eq!(values[1].value, "1.5");
}

#[tokio::test]
async fn test_ground_truth_plain_text() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/truth/99")
        .with_status(200)
        .with_body("1.0625")
        .create_async()
        .await;

    let adapter = adapter(
        params(&[("GroundTruthEndpoint", format!("{}/truth/{{BlockHeight}}", server.url()))]),
        None,
    );
    assert_eq!(adapter.ground_truth(1, 99).await.unwrap(), "1.0625");
}

#[tokio::test]
async fn test_loss_service_calls() {
    let mut server = Server::new_async().await;
    let calculate = server
        .mock("POST", "/calculate")
        .match_body(Matcher::Json(serde_json::json!({
            "y_true": "1.0",
            "y_pred": "1.5",
            "options": { "loss_method": "sqe" }
        })))
        .with_status(200)
        .with_body(r#"{"loss":0.25}"#)
        .create_async()
        .await;
    let sign = server
        .mock("GET", "/is_never_negative")
        .match_query(Matcher::UrlEncoded("loss_method".into(), "sqe".into()))
        .with_status(200)
        .with_body(r#"{"is_never_negative":true}"#)
        .create_async()
        .await;

    let options = params(&[("loss_method", "sqe".to_string())]);
    let adapter = adapter(HashMap::new(), Some(format!("{}/", server.url())));

    assert_eq!(adapter.compute_loss("1.0", "1.5", &options).await.unwrap(), "0.25");
    assert!(adapter.is_loss_never_negative(&options).await.unwrap());
    calculate.assert_async().await;
    sign.assert_async().await;
}

#[tokio::test]
async fn test_missing_endpoint_parameter() {
    let adapter = adapter(HashMap::new(), None);
    assert_eq!(
        adapter.infer(1, 1).await.unwrap_err(),
        AdapterError::MissingParameter("InferenceEndpoint".to_string())
    );
    assert_eq!(
        adapter.compute_loss("1", "2", &HashMap::new()).await.unwrap_err(),
        AdapterError::MissingParameter("loss_function_service".to_string())
    );
}

#[test]
fn test_registry_rejects_unknown_entrypoint() {
    let registry = AdapterRegistry::new(Duration::from_secs(5)).unwrap();
    let worker = WorkerConfig {
        topic_id: 1,
        inference_entrypoint: Some("python-script".to_string()),
        forecast_entrypoint: None,
        loop_seconds: 5,
        parameters: HashMap::new(),
    };
    assert!(matches!(
        registry.worker(&worker),
        Err(AdapterError::UnknownEntrypoint(name)) if name == "python-script"
    ));

    let reputer = ReputerConfig {
        topic_id: 1,
        ground_truth_entrypoint: "api".to_string(),
        loss_function_entrypoint: "api".to_string(),
        min_stake: 0,
        loop_seconds: 5,
        ground_truth_parameters: params(&[("GroundTruthEndpoint", "http://localhost/truth".to_string())]),
        loss_function_parameters: LossFunctionParameters {
            loss_function_service: String::new(),
            loss_method_options: HashMap::new(),
        },
    };
    assert!(matches!(
        registry.reputer(&reputer),
        Err(AdapterError::MissingParameter(_))
    ));
}
