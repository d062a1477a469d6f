//! The tool endpoint AI agents call: `POST /mcp`, behind the API-key
//! middleware. Every business branch comes back as a JSON-RPC result the
//! agent can narrate; JSON-RPC errors are reserved for protocol misuse.

use std::sync::Arc;

use axum::extract::State;
use axum::{Extension, Json};
use serde_json::Value;

use crate::activation::ToolArgs;
use crate::keys::CredentialInfo;
use crate::mcp::types::{
    initialize_result, tool_definitions, CallToolParams, CallToolResult, JsonRpcRequest,
    JsonRpcResponse, ACTIVATE_TOOL, INVALID_PARAMS, METHOD_NOT_FOUND,
};
use crate::AppState;

pub async fn rpc_handler(
    State(state): State<Arc<AppState>>,
    Extension(credential): Extension<CredentialInfo>,
    Json(req): Json<JsonRpcRequest>,
) -> Json<JsonRpcResponse> {
    let response = match req.method.as_str() {
        "initialize" => JsonRpcResponse::result(req.id, initialize_result()),
        "notifications/initialized" => JsonRpcResponse::result(req.id, Value::Null),
        "tools/list" => JsonRpcResponse::result(req.id, tool_definitions()),
        "tools/call" => call_tool(&state, &credential, req.id, req.params).await,
        other => {
            JsonRpcResponse::error(req.id, METHOD_NOT_FOUND, format!("unknown method: {}", other))
        }
    };
    Json(response)
}

async fn call_tool(
    state: &Arc<AppState>,
    credential: &CredentialInfo,
    id: Option<Value>,
    params: Option<Value>,
) -> JsonRpcResponse {
    let params: CallToolParams = match params.map(serde_json::from_value).transpose() {
        Ok(Some(p)) => p,
        Ok(None) => return JsonRpcResponse::error(id, INVALID_PARAMS, "missing params"),
        Err(e) => {
            return JsonRpcResponse::error(id, INVALID_PARAMS, format!("invalid params: {}", e))
        }
    };

    if params.name != ACTIVATE_TOOL {
        return JsonRpcResponse::error(
            id,
            INVALID_PARAMS,
            format!("unknown tool: {}", params.name),
        );
    }

    let args: ToolArgs = match params.arguments.map(serde_json::from_value).transpose() {
        Ok(Some(a)) => a,
        Ok(None) => return JsonRpcResponse::error(id, INVALID_PARAMS, "missing tool arguments"),
        Err(e) => {
            return JsonRpcResponse::error(id, INVALID_PARAMS, format!("invalid arguments: {}", e))
        }
    };

    tracing::info!(
        key = %credential.id,
        external_auth_id = %args.external_auth_id,
        "activation requested"
    );

    let run = state.orchestrator.activate(&args).await;

    // Usage metering is accounting, not control flow: report off the
    // request path and only log the outcome.
    if let Some(identity) = run.identity.clone() {
        let state = state.clone();
        tokio::spawn(async move {
            let outcome = state.reporter.report(&identity, 1).await;
            tracing::debug!(identity = %identity.id, ?outcome, "usage report finished");
        });
    }

    let payload = run.outcome.to_json();
    JsonRpcResponse::result(id, serde_json::to_value(CallToolResult::text(&payload)).unwrap_or(payload))
}
