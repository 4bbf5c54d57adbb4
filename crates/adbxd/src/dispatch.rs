//! JSON-RPC 2.0 dispatch for authenticated request frames.
//!
//! One request frame in, one reply frame out. Application errors become
//! JSON-RPC errors and never close the session.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use adbx_gateway::gateway::{MAX_TOKEN_PARAMS, MIN_TOKEN_PARAMS};
use adbx_gateway::{GatewayError, QueryGateway, SessionAuth};

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const GATEWAY_ERROR: i32 = -32000;

pub const TOOL_RUN_SQL_QUERY: &str = "run_sql_query";
pub const TOOL_RUN_SQL_QUERY_TOKENS: &str = "run_sql_query_tokens";

#[derive(Debug, Deserialize)]
struct Request {
    jsonrpc: String,
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Response {
    fn success(id: Value, result: Value) -> Self {
        Self { jsonrpc: "2.0".into(), id, result: Some(result), error: None }
    }

    fn failure(id: Value, code: i32, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: None,
            error: Some(RpcError { code, message: message.into(), data }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ToolCall {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryArgs {
    connection_name: String,
    query: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenQueryArgs {
    connection_name: String,
    query: String,
    parameters: Vec<String>,
}

/// Handle one request payload and return the reply payload.
pub async fn handle(gateway: &QueryGateway, payload: &[u8], auth: &SessionAuth) -> Vec<u8> {
    let response = match serde_json::from_slice::<Request>(payload) {
        Ok(request) => route(gateway, request, auth).await,
        Err(e) => Response::failure(Value::Null, PARSE_ERROR, format!("parse error: {e}"), None),
    };
    serde_json::to_vec(&response).unwrap_or_else(|_| {
        br#"{"jsonrpc":"2.0","id":null,"error":{"code":-32603,"message":"serialization failed"}}"#.to_vec()
    })
}

async fn route(gateway: &QueryGateway, request: Request, auth: &SessionAuth) -> Response {
    let id = request.id;
    if request.jsonrpc != "2.0" {
        return Response::failure(id, INVALID_REQUEST, "invalid JSON-RPC version", None);
    }
    match request.method.as_str() {
        "tools/list" => Response::success(id, tool_list()),
        "tools/call" => match serde_json::from_value::<ToolCall>(request.params) {
            Ok(call) => call_tool(gateway, id, call, auth).await,
            Err(e) => Response::failure(id, INVALID_PARAMS, format!("invalid tool call: {e}"), None),
        },
        other => Response::failure(id, METHOD_NOT_FOUND, format!("unknown method: {other}"), None),
    }
}

async fn call_tool(gateway: &QueryGateway, id: Value, call: ToolCall, auth: &SessionAuth) -> Response {
    let result = match call.name.as_str() {
        TOOL_RUN_SQL_QUERY => match serde_json::from_value::<QueryArgs>(call.arguments) {
            Ok(args) => gateway.execute(&args.connection_name, &args.query, auth).await,
            Err(e) => return Response::failure(id, INVALID_PARAMS, format!("invalid arguments: {e}"), None),
        },
        TOOL_RUN_SQL_QUERY_TOKENS => match serde_json::from_value::<TokenQueryArgs>(call.arguments) {
            Ok(args) => {
                gateway
                    .execute_with_tokens(&args.connection_name, &args.query, &args.parameters, auth)
                    .await
            }
            Err(e) => return Response::failure(id, INVALID_PARAMS, format!("invalid arguments: {e}"), None),
        },
        other => return Response::failure(id, METHOD_NOT_FOUND, format!("unknown tool: {other}"), None),
    };

    match result.and_then(|rs| serde_json::to_value(rs).map_err(|e| GatewayError::Internal(e.to_string()))) {
        Ok(value) => Response::success(id, value),
        Err(e) => {
            tracing::info!(kind = e.kind(), error = %e, "query refused");
            Response::failure(id, GATEWAY_ERROR, e.to_string(), Some(error_data(&e)))
        }
    }
}

fn error_data(err: &GatewayError) -> Value {
    let mut data = json!({ "kind": err.kind() });
    if let Some(connection) = err.connection() {
        data["connection"] = json!(connection);
    }
    match err {
        GatewayError::SensitiveColumn { column, .. } => data["column"] = json!(column),
        GatewayError::UnsafeFunction { function, .. } => data["function"] = json!(function),
        _ => {}
    }
    data
}

fn tool_list() -> Value {
    json!({
        "tools": [
            {
                "name": TOOL_RUN_SQL_QUERY,
                "description": "Run one SQL statement against a configured connection. Sensitive columns must be read through an approved function; their values come back as tokens.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "connectionName": { "type": "string" },
                        "query": { "type": "string" }
                    },
                    "required": ["connectionName", "query"]
                }
            },
            {
                "name": TOOL_RUN_SQL_QUERY_TOKENS,
                "description": "Run one SQL statement with tokens bound as ?1..?n.",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "connectionName": { "type": "string" },
                        "query": { "type": "string" },
                        "parameters": {
                            "type": "array",
                            "items": { "type": "string" },
                            "minItems": MIN_TOKEN_PARAMS,
                            "maxItems": MAX_TOKEN_PARAMS
                        }
                    },
                    "required": ["connectionName", "query", "parameters"]
                }
            }
        ]
    })
}
