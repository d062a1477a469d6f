//! MCP (Model Context Protocol) type definitions for the server side of
//! the tool endpoint: JSON-RPC 2.0 envelope plus the initialize,
//! tools/list, and tools/call message shapes AI agents send us.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

// ── JSON-RPC 2.0 ──────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    #[allow(dead_code)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn result(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id: id.unwrap_or(Value::Null),
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<Value>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id: id.unwrap_or(Value::Null),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;

// ── MCP tools/call ─────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct CallToolParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallToolResult {
    pub content: Vec<McpContent>,
    #[serde(rename = "isError")]
    pub is_error: bool,
}

impl CallToolResult {
    /// Wrap a tagged outcome as a single text content block, the shape
    /// agents feed back into their model verbatim.
    pub fn text(payload: &Value) -> Self {
        Self {
            content: vec![McpContent::Text {
                text: payload.to_string(),
            }],
            is_error: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum McpContent {
    Text { text: String },
}

// ── Tool catalogue ─────────────────────────────────────────────

pub const ACTIVATE_TOOL: &str = "activate_esim";

/// The single tool this gateway exposes.
pub fn tool_definitions() -> Value {
    json!({
        "tools": [{
            "name": ACTIVATE_TOOL,
            "description": "Provision an eSIM for a user. Returns activation details, \
                            a payment link if the user has not paid yet, or a wait \
                            estimate if activations are currently rate limited.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "email": { "type": "string", "description": "The user's email address" },
                    "externalAuthId": { "type": "string", "description": "The user's identity-provider id" }
                },
                "required": ["email", "externalAuthId"]
            }
        }]
    })
}

pub fn initialize_result() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": { "tools": {} },
        "serverInfo": { "name": "esimgate", "version": env!("CARGO_PKG_VERSION") }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_deserializes_with_string_or_numeric_id() {
        let req: JsonRpcRequest = serde_json::from_value(json!({
            "jsonrpc": "2.0", "id": 7, "method": "tools/list"
        }))
        .unwrap();
        assert_eq!(req.method, "tools/list");
        assert_eq!(req.id, Some(json!(7)));

        let req: JsonRpcRequest = serde_json::from_value(json!({
            "jsonrpc": "2.0", "id": "abc", "method": "initialize", "params": {}
        }))
        .unwrap();
        assert_eq!(req.id, Some(json!("abc")));
    }

    #[test]
    fn response_envelope_omits_absent_halves() {
        let ok = serde_json::to_value(JsonRpcResponse::result(Some(json!(1)), json!({"x": 1})))
            .unwrap();
        assert_eq!(ok["jsonrpc"], "2.0");
        assert!(ok.get("error").is_none());

        let err =
            serde_json::to_value(JsonRpcResponse::error(None, METHOD_NOT_FOUND, "no such method"))
                .unwrap();
        assert!(err.get("result").is_none());
        assert_eq!(err["error"]["code"], METHOD_NOT_FOUND);
        assert_eq!(err["id"], Value::Null);
    }

    #[test]
    fn call_tool_result_wraps_outcome_as_text() {
        let result = CallToolResult::text(&json!({"success": true}));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["isError"], false);
        assert_eq!(json["content"][0]["type"], "text");
        assert!(json["content"][0]["text"]
            .as_str()
            .unwrap()
            .contains("\"success\":true"));
    }

    #[test]
    fn tool_catalogue_lists_activate_esim() {
        let defs = tool_definitions();
        assert_eq!(defs["tools"][0]["name"], ACTIVATE_TOOL);
        let required = defs["tools"][0]["inputSchema"]["required"].clone();
        assert_eq!(required, json!(["email", "externalAuthId"]));
    }
}
