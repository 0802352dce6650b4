use std::{sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
};
use parking_lot::Mutex;
use prism_bridge::credentials::Session;
use prism_bridge::error::RemoteError;
use prism_bridge::graphql::{HttpGraphqlClient, RemoteQueryExecutor, operations};
use serde_json::{Value, json};
use tokio::net::TcpListener;

#[derive(Clone, Default)]
struct Captured {
    requests: Arc<Mutex<Vec<(Option<String>, Value)>>>,
}

async fn graphql(
    State(captured): State<Captured>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let auth = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    captured.requests.lock().push((auth, body.clone()));

    match body["operationName"].as_str() {
        Some("GetIntegration") if body["variables"]["id"] == "int-1" => (
            StatusCode::OK,
            Json(json!({
                "data": {
                    "integration": {
                        "id": "int-1",
                        "name": "Orders",
                        "systemInstance": { "id": "si-1", "configState": "FULLY_CONFIGURED" },
                        "flows": { "nodes": [{ "id": "flow-1", "name": "Sync" }] }
                    }
                }
            })),
        )
            .into_response(),
        Some("GetIntegration") => (
            StatusCode::OK,
            Json(json!({ "data": null, "errors": [{ "message": "Integration not found" }] })),
        )
            .into_response(),
        Some("testIntegrationFlow") => (
            StatusCode::OK,
            Json(json!({
                "data": {
                    "testIntegrationFlow": {
                        "testIntegrationFlowResult": { "execution": { "id": "exec-1" } },
                        "errors": []
                    }
                }
            })),
        )
            .into_response(),
        _ => (StatusCode::BAD_GATEWAY, "upstream unavailable").into_response(),
    }
}

async fn stub_api() -> (String, Captured) {
    let captured = Captured::default();
    let app = Router::new()
        .route("/api", post(graphql))
        .with_state(captured.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/"), captured)
}

fn session(service_url: &str) -> Session {
    Session {
        access_token: "tok-123".into(),
        service_url: service_url.into(),
    }
}

#[tokio::test]
async fn get_integration_sends_bearer_and_parses_summary() {
    let (url, captured) = stub_api().await;
    let client = HttpGraphqlClient::new(Duration::from_secs(5));

    let data = client
        .execute(&session(&url), operations::get_integration("int-1"))
        .await
        .unwrap();
    let summary = operations::parse_integration(&data).unwrap();
    assert_eq!(summary.config_state.as_deref(), Some(operations::FULLY_CONFIGURED));
    assert_eq!(summary.system_instance_id.as_deref(), Some("si-1"));
    assert_eq!(summary.initial_flow.unwrap().id, "flow-1");

    let requests = captured.requests.lock();
    assert_eq!(requests[0].0.as_deref(), Some("Bearer tok-123"));
    assert_eq!(requests[0].1["operationName"], "GetIntegration");
}

#[tokio::test]
async fn graphql_errors_surface_first_message() {
    let (url, _) = stub_api().await;
    let client = HttpGraphqlClient::new(Duration::from_secs(5));

    let err = client
        .execute(&session(&url), operations::get_integration("int-404"))
        .await
        .unwrap_err();
    match err {
        RemoteError::Graphql(message) => assert_eq!(message, "Integration not found"),
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn test_mutation_carries_encoded_headers() {
    let (url, captured) = stub_api().await;
    let client = HttpGraphqlClient::new(Duration::from_secs(5));
    let headers = json!({
        "X-Prismatic-Server-URL": "https://cb.example",
        "X-Prismatic-Token": "secret",
    });

    let data = client
        .execute(
            &session(&url),
            operations::test_integration_flow("flow-1", Some(&headers)),
        )
        .await
        .unwrap();
    assert_eq!(operations::parse_execution_id(&data).unwrap(), "exec-1");

    let requests = captured.requests.lock();
    let sent = requests[0].1["variables"]["headers"].as_str().unwrap();
    let decoded: Value = serde_json::from_str(sent).unwrap();
    assert_eq!(decoded, headers);
}

#[tokio::test]
async fn non_json_error_status_is_reported() {
    let (url, _) = stub_api().await;
    let client = HttpGraphqlClient::new(Duration::from_secs(5));

    let err = client
        .execute(&session(&url), operations::get_execution_status("exec-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteError::Status { status: 502, .. }), "{err:?}");
}

#[tokio::test]
async fn unreachable_service_is_a_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let client = HttpGraphqlClient::new(Duration::from_secs(2));

    let err = client
        .execute(
            &session(&format!("http://{addr}")),
            operations::get_integration("int-1"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteError::Transport { .. }), "{err:?}");
}
