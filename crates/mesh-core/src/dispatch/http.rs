//! HTTP invoker: posts a JSON-RPC style request to the agent endpoint.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};

use super::{AgentInvoker, InvocationError, InvocationRequest};

/// JSON-RPC codes that mean the request itself is wrong.
const PERMANENT_RPC_CODES: &[i64] = &[-32600, -32601, -32602, -32700];

#[derive(Clone, Default)]
pub struct HttpAgentInvoker {
    client: reqwest::Client,
}

impl HttpAgentInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AgentInvoker for HttpAgentInvoker {
    async fn invoke(&self, request: InvocationRequest) -> Result<Value, InvocationError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": request.handle.0,
            "method": request.capability,
            "params": request.parameters,
        });

        let response = self
            .client
            .post(&request.endpoint)
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let msg = format!("{} returned {}: {}", request.agent_id, status, text);
            return Err(if is_permanent_status(status) {
                InvocationError::Permanent(msg)
            } else {
                InvocationError::Transient(msg)
            });
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| InvocationError::Permanent(format!("invalid response body: {}", e)))?;
        unwrap_rpc(payload)
    }
}

fn classify_transport(e: reqwest::Error) -> InvocationError {
    if e.is_builder() {
        InvocationError::Permanent(format!("invalid request: {}", e))
    } else {
        InvocationError::Transient(e.to_string())
    }
}

fn is_permanent_status(status: StatusCode) -> bool {
    status.is_client_error()
        && status != StatusCode::REQUEST_TIMEOUT
        && status != StatusCode::TOO_MANY_REQUESTS
}

fn unwrap_rpc(payload: Value) -> Result<Value, InvocationError> {
    if let Some(error) = payload.get("error").filter(|e| !e.is_null()) {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        return Err(if PERMANENT_RPC_CODES.contains(&code) {
            InvocationError::Permanent(format!("{} ({})", message, code))
        } else {
            InvocationError::Transient(format!("{} ({})", message, code))
        });
    }
    match payload {
        Value::Object(mut map) if map.contains_key("result") => {
            Ok(map.remove("result").unwrap_or(Value::Null))
        }
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(is_permanent_status(StatusCode::BAD_REQUEST));
        assert!(is_permanent_status(StatusCode::NOT_FOUND));
        assert!(!is_permanent_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_permanent_status(StatusCode::REQUEST_TIMEOUT));
        assert!(!is_permanent_status(StatusCode::SERVICE_UNAVAILABLE));
    }

    #[test]
    fn test_unwrap_rpc() {
        assert_eq!(unwrap_rpc(json!({ "result": { "ok": true } })).unwrap(), json!({ "ok": true }));
        assert_eq!(unwrap_rpc(json!({ "draft": "x" })).unwrap(), json!({ "draft": "x" }));

        let err = unwrap_rpc(json!({ "error": { "code": -32601, "message": "Method not found" } })).unwrap_err();
        assert!(!err.is_transient());
        let err = unwrap_rpc(json!({ "error": { "code": -32000, "message": "busy" } })).unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let inv = HttpAgentInvoker::new();
        let err = inv
            .invoke(InvocationRequest {
                handle: super::super::InvocationHandle::new(),
                agent_id: "nobody".into(),
                endpoint: "http://127.0.0.1:9/rpc".into(),
                capability: "grammar_check".into(),
                parameters: json!({}),
                timeout: std::time::Duration::from_millis(500),
            })
            .await
            .unwrap_err();
        assert!(err.is_transient(), "{err}");
    }
}
