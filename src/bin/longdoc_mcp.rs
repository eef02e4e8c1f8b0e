//! MCP server exposing the document task API.
//!
//! Communicates over stdio using line-delimited JSON-RPC 2.0. Logs go to
//! stderr; stdout carries only protocol messages.

use std::io::{BufRead, BufReader, Write};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

use longdoc::{Config, DocumentService, TaskId};

// =============================================================================
// JSON-RPC Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    jsonrpc: String,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

impl JsonRpcResponse {
    fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    fn error(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

// =============================================================================
// MCP Types
// =============================================================================

#[derive(Debug, Serialize)]
struct ToolDefinition {
    name: String,
    description: String,
    #[serde(rename = "inputSchema")]
    input_schema: Value,
}

#[derive(Debug, Serialize)]
struct ToolResult {
    content: Vec<ToolContent>,
    #[serde(rename = "isError")]
    is_error: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ToolContent {
    #[serde(rename = "text")]
    Text { text: String },
}

impl ToolResult {
    fn text(text: String, is_error: bool) -> Self {
        Self {
            content: vec![ToolContent::Text { text }],
            is_error,
        }
    }
}

// =============================================================================
// Tools
// =============================================================================

fn task_id_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "task_id": { "type": "string", "description": "Task id returned by create_task" }
        },
        "required": ["task_id"]
    })
}

fn tool_definitions() -> Vec<ToolDefinition> {
    let def = |name: &str, description: &str, input_schema: Value| ToolDefinition {
        name: name.to_string(),
        description: description.to_string(),
        input_schema,
    };
    vec![
        def(
            "create_task",
            "Start generating a long document. Returns the task id immediately; poll get_task_status.",
            json!({
                "type": "object",
                "properties": {
                    "request": { "type": "string", "description": "What document to write" },
                    "chat_history": { "type": "string", "description": "Prior conversation for context" }
                },
                "required": ["request"]
            }),
        ),
        def(
            "get_task_status",
            "Status, progress percentage and last error of a task.",
            task_id_schema(),
        ),
        def(
            "get_task_result",
            "The final markdown document of a completed task.",
            task_id_schema(),
        ),
        def(
            "get_task",
            "The full task record, including brief, outline and error log.",
            task_id_schema(),
        ),
        def(
            "list_tasks",
            "Summaries of all tasks, newest first.",
            json!({ "type": "object", "properties": {} }),
        ),
        def("cancel_task", "Cancel a running task.", task_id_schema()),
        def(
            "retry_task",
            "Retry a failed task from the stage that failed.",
            task_id_schema(),
        ),
    ]
}

fn task_id_arg(args: &Value) -> anyhow::Result<TaskId> {
    let raw = args
        .get("task_id")
        .and_then(|v| v.as_str())
        .context("missing required argument: task_id")?;
    Uuid::parse_str(raw.trim()).with_context(|| format!("invalid task_id: {}", raw))
}

fn pretty(value: impl Serialize) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(&value)?)
}

async fn call_tool(service: &DocumentService, name: &str, args: &Value) -> anyhow::Result<String> {
    match name {
        "create_task" => {
            let request = args
                .get("request")
                .and_then(|v| v.as_str())
                .context("missing required argument: request")?;
            let chat_history = args
                .get("chat_history")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            let id = service.create_task(chat_history, request).await?;
            pretty(json!({ "task_id": id }))
        }
        "get_task_status" => pretty(service.get_task_status(task_id_arg(args)?).await?),
        "get_task_result" => Ok(service.get_task_result(task_id_arg(args)?).await?),
        "get_task" => pretty(service.get_task(task_id_arg(args)?).await?),
        "list_tasks" => pretty(service.list_tasks().await?),
        "cancel_task" => pretty(service.cancel_task(task_id_arg(args)?).await?),
        "retry_task" => pretty(service.retry_task(task_id_arg(args)?).await?),
        _ => anyhow::bail!("Unknown tool: {}", name),
    }
}

fn execute_tool(
    runtime: &tokio::runtime::Runtime,
    service: &DocumentService,
    name: &str,
    args: &Value,
) -> ToolResult {
    match runtime.block_on(call_tool(service, name, args)) {
        Ok(text) => ToolResult::text(text, false),
        Err(e) => {
            tracing::warn!("Tool {} failed: {:#}", name, e);
            ToolResult::text(format!("Tool error: {:#}", e), true)
        }
    }
}

fn handle_request(
    request: &JsonRpcRequest,
    runtime: &tokio::runtime::Runtime,
    service: &DocumentService,
) -> Option<JsonRpcResponse> {
    match request.method.as_str() {
        "initialize" => Some(JsonRpcResponse::success(
            request.id.clone(),
            json!({
                "protocolVersion": "2024-11-05",
                "serverInfo": {
                    "name": "longdoc-mcp",
                    "version": env!("CARGO_PKG_VERSION"),
                },
                "capabilities": {
                    "tools": {
                        "listChanged": false
                    }
                }
            }),
        )),
        "notifications/initialized" | "initialized" => None,
        "tools/list" => Some(JsonRpcResponse::success(
            request.id.clone(),
            json!({ "tools": tool_definitions() }),
        )),
        "tools/call" => {
            let name = request
                .params
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            let args = request
                .params
                .get("arguments")
                .cloned()
                .unwrap_or(json!({}));
            tracing::debug!("tools/call {}", name);
            let result = execute_tool(runtime, service, name, &args);
            Some(JsonRpcResponse::success(request.id.clone(), json!(result)))
        }
        _ => Some(JsonRpcResponse::error(
            request.id.clone(),
            -32601,
            format!("Method not found: {}", request.method),
        )),
    }
}

fn write_response(stdout: &mut impl Write, response: &JsonRpcResponse) {
    match serde_json::to_string(response) {
        Ok(line) => {
            let _ = writeln!(stdout, "{}", line);
            let _ = stdout.flush();
        }
        Err(e) => tracing::error!("Failed to encode response: {}", e),
    }
}

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("longdoc=info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    let config = Config::from_env()?;
    let service = runtime.block_on(DocumentService::from_config(&config))?;
    let resumed = runtime.block_on(service.resume_incomplete())?;
    if !resumed.is_empty() {
        tracing::info!("Resumed {} unfinished task(s)", resumed.len());
    }
    tracing::info!("longdoc-mcp listening on stdio");

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    let reader = BufReader::new(stdin.lock());

    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };

        if line.trim().is_empty() {
            continue;
        }

        let request: JsonRpcRequest = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                write_response(&mut stdout, &JsonRpcResponse::error(Value::Null, -32700, e.to_string()));
                continue;
            }
        };

        if let Some(response) = handle_request(&request, &runtime, &service) {
            write_response(&mut stdout, &response);
        }
    }

    tracing::info!("stdin closed, shutting down");
    Ok(())
}
