use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::credentials::Session;
use crate::error::RemoteError;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphqlRequest {
    pub operation_name: String,
    pub query: String,
    pub variables: Value,
}

impl GraphqlRequest {
    pub fn new(operation_name: &str, query: &str, variables: Value) -> Self {
        Self {
            operation_name: operation_name.into(),
            query: query.into(),
            variables,
        }
    }
}

/// Executes a named GraphQL operation and yields its `data` member.
#[async_trait]
pub trait RemoteQueryExecutor: Send + Sync {
    async fn execute(&self, session: &Session, request: GraphqlRequest)
    -> Result<Value, RemoteError>;
}

/// Blocking `ureq` agent moved onto the blocking pool per call.
pub struct HttpGraphqlClient {
    agent: ureq::Agent,
}

impl HttpGraphqlClient {
    pub fn new(timeout: Duration) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build()
            .into();
        Self { agent }
    }

    fn endpoint(service_url: &str) -> String {
        format!("{}/api", service_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl RemoteQueryExecutor for HttpGraphqlClient {
    async fn execute(
        &self,
        session: &Session,
        request: GraphqlRequest,
    ) -> Result<Value, RemoteError> {
        let url = Self::endpoint(&session.service_url);
        let agent = self.agent.clone();
        let bearer = format!("Bearer {}", session.access_token);
        let operation = request.operation_name.clone();
        debug!(%url, %operation, "executing graphql operation");

        let join = tokio::task::spawn_blocking(move || {
            let resp = agent
                .post(&url)
                .header("Authorization", &bearer)
                .header("Content-Type", "application/json")
                .send_json(&request)
                .map_err(|err| RemoteError::Transport {
                    url: url.clone(),
                    reason: err.to_string(),
                })?;
            let status = resp.status().as_u16();
            let body: Option<Value> = resp.into_body().read_json().ok();
            match body {
                Some(body) => Ok(body),
                None if status >= 400 => Err(RemoteError::Status { url, status }),
                None => Err(RemoteError::Malformed(format!(
                    "{url} returned a non-JSON body"
                ))),
            }
        });
        let body = join.await.map_err(|err| RemoteError::Transport {
            url: Self::endpoint(&session.service_url),
            reason: format!("request task failed: {err}"),
        })??;

        extract_data(body).inspect_err(|err| warn!(%operation, %err, "graphql operation failed"))
    }
}

/// Returns `data`, or the first message of a non-empty `errors` array.
pub fn extract_data(body: Value) -> Result<Value, RemoteError> {
    if let Some(errors) = body.get("errors").and_then(Value::as_array)
        && let Some(first) = errors.first()
    {
        let message = first
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown GraphQL error");
        return Err(RemoteError::Graphql(message.to_string()));
    }
    match body.get("data") {
        Some(data) if !data.is_null() => Ok(data.clone()),
        _ => Err(RemoteError::Malformed("response carried no data".into())),
    }
}

pub mod operations {
    use super::*;

    const GET_INTEGRATION: &str = r#"
query GetIntegration($id: ID!) {
  integration(id: $id) {
    id
    name
    systemInstance {
      id
      configState
    }
    flows {
      nodes {
        id
        name
      }
    }
  }
}"#;

    const TEST_INTEGRATION_FLOW: &str = r#"
mutation testIntegrationFlow($flowId: ID!, $payload: String, $contentType: String, $headers: String) {
  testIntegrationFlow(
    input: { id: $flowId, payload: $payload, contentType: $contentType, headers: $headers }
  ) {
    testIntegrationFlowResult {
      execution {
        id
      }
    }
    errors {
      field
      messages
    }
  }
}"#;

    const GET_EXECUTION_STATUS: &str = r#"
query GetExecutionStatus($id: ID!) {
  executionResult(id: $id) {
    id
    startedAt
    endedAt
    error
  }
}"#;

    pub const FULLY_CONFIGURED: &str = "FULLY_CONFIGURED";

    #[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
    pub struct FlowRef {
        pub id: String,
        #[serde(default)]
        pub name: Option<String>,
    }

    /// The subset of an integration a test run depends on.
    #[derive(Debug, Clone, PartialEq)]
    pub struct IntegrationSummary {
        pub id: String,
        pub name: Option<String>,
        pub config_state: Option<String>,
        pub system_instance_id: Option<String>,
        pub initial_flow: Option<FlowRef>,
        pub raw: Value,
    }

    pub fn get_integration(integration_id: &str) -> GraphqlRequest {
        GraphqlRequest::new(
            "GetIntegration",
            GET_INTEGRATION,
            json!({ "id": integration_id }),
        )
    }

    pub fn parse_integration(data: &Value) -> Result<IntegrationSummary, RemoteError> {
        let integration = data
            .get("integration")
            .filter(|value| !value.is_null())
            .ok_or_else(|| RemoteError::Malformed("integration not found".into()))?;
        let id = integration
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| RemoteError::Malformed("integration has no id".into()))?
            .to_string();
        let instance = integration.get("systemInstance");
        let initial_flow = integration
            .pointer("/flows/nodes/0")
            .cloned()
            .and_then(|node| serde_json::from_value::<FlowRef>(node).ok());
        Ok(IntegrationSummary {
            id,
            name: integration
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_owned),
            config_state: instance
                .and_then(|i| i.get("configState"))
                .and_then(Value::as_str)
                .map(str::to_owned),
            system_instance_id: instance
                .and_then(|i| i.get("id"))
                .and_then(Value::as_str)
                .map(str::to_owned),
            initial_flow,
            raw: integration.clone(),
        })
    }

    pub fn test_integration_flow(flow_id: &str, headers: Option<&Value>) -> GraphqlRequest {
        let headers = headers.map(Value::to_string);
        GraphqlRequest::new(
            "testIntegrationFlow",
            TEST_INTEGRATION_FLOW,
            json!({
                "flowId": flow_id,
                "payload": Value::Null,
                "contentType": Value::Null,
                "headers": headers,
            }),
        )
    }

    /// Pulls the execution id out of a `testIntegrationFlow` response. Mutation-level
    /// `errors` are reported before the id is looked up.
    pub fn parse_execution_id(data: &Value) -> Result<String, RemoteError> {
        let result = data
            .get("testIntegrationFlow")
            .ok_or_else(|| RemoteError::Malformed("missing testIntegrationFlow".into()))?;
        if let Some(first) = result
            .get("errors")
            .and_then(Value::as_array)
            .and_then(|errors| errors.first())
        {
            let message = first
                .pointer("/messages/0")
                .and_then(Value::as_str)
                .unwrap_or("test mutation reported an error");
            return Err(RemoteError::Graphql(message.to_string()));
        }
        result
            .pointer("/testIntegrationFlowResult/execution/id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_owned)
            .ok_or_else(|| RemoteError::Malformed("response did not include an execution id".into()))
    }

    pub fn get_execution_status(execution_id: &str) -> GraphqlRequest {
        GraphqlRequest::new(
            "GetExecutionStatus",
            GET_EXECUTION_STATUS,
            json!({ "id": execution_id }),
        )
    }

    /// True once the execution reports an end time.
    pub fn execution_ended(data: &Value) -> bool {
        data.pointer("/executionResult/endedAt")
            .is_some_and(|ended| !ended.is_null())
    }
}

#[cfg(test)]
mod tests {
    use super::operations::*;
    use super::*;

    #[test]
    fn errors_array_wins_over_data() {
        let body = json!({
            "data": null,
            "errors": [{ "message": "Integration not found" }, { "message": "second" }]
        });
        match extract_data(body) {
            Err(RemoteError::Graphql(message)) => assert_eq!(message, "Integration not found"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn empty_errors_array_is_ignored() {
        let body = json!({ "data": { "ok": true }, "errors": [] });
        assert_eq!(extract_data(body).unwrap(), json!({ "ok": true }));
    }

    #[test]
    fn integration_summary_adopts_first_flow() {
        let data = json!({
            "integration": {
                "id": "int-1",
                "name": "Acme Sync",
                "systemInstance": { "id": "si-1", "configState": "FULLY_CONFIGURED" },
                "flows": { "nodes": [{ "id": "flow-1", "name": "Main" }, { "id": "flow-2" }] }
            }
        });
        let summary = parse_integration(&data).unwrap();
        assert_eq!(summary.config_state.as_deref(), Some(FULLY_CONFIGURED));
        assert_eq!(summary.system_instance_id.as_deref(), Some("si-1"));
        assert_eq!(summary.initial_flow.unwrap().id, "flow-1");
    }

    #[test]
    fn execution_id_is_required() {
        let missing = json!({ "testIntegrationFlow": { "testIntegrationFlowResult": null, "errors": [] } });
        assert!(matches!(
            parse_execution_id(&missing),
            Err(RemoteError::Malformed(_))
        ));

        let ok = json!({
            "testIntegrationFlow": {
                "testIntegrationFlowResult": { "execution": { "id": "exec-1" } },
                "errors": []
            }
        });
        assert_eq!(parse_execution_id(&ok).unwrap(), "exec-1");
    }

    #[test]
    fn headers_are_sent_as_json_string() {
        let headers = json!({ "X-Prismatic-Token": "t" });
        let request = test_integration_flow("flow-1", Some(&headers));
        let encoded = request.variables["headers"].as_str().unwrap();
        let decoded: Value = serde_json::from_str(encoded).unwrap();
        assert_eq!(decoded, headers);
    }

    #[test]
    fn ended_executions_are_detected() {
        assert!(!execution_ended(&json!({ "executionResult": { "endedAt": null } })));
        assert!(execution_ended(
            &json!({ "executionResult": { "endedAt": "2024-01-01T00:00:00Z" } })
        ));
    }
}
