//! MCP test server binary for integration tests
//!
//! This binary implements a minimal MCP server that communicates over
//! stdin/stdout using newline-delimited JSON (the stdio transport
//! protocol). It is used exclusively by integration tests to exercise the
//! stdio transport and the initialize handshake without requiring a real
//! external MCP server.
//!
//! # Handled Methods
//!
//! - `initialize` -- responds with the client's offered protocol version
//!   when it is one the server knows, and advertises `tools` plus
//!   subscribable `resources`. Setting the `MCP_TEST_SERVER_VERSION`
//!   environment variable forces the responded version verbatim, which
//!   lets tests drive downgrade and mismatch paths.
//! - `notifications/initialized`, `notifications/cancelled` -- swallowed.
//! - `tools/list` -- returns two tools: `echo` and `sleep`.
//! - `tools/call` with `name: "echo"` -- echoes back the `message`
//!   argument; with `name: "sleep"` -- sleeps `millis` before responding.
//! - `ping` -- returns an empty object.
//! - All other methods -- JSON-RPC `-32601 Method not found`.

use std::io::{self, BufRead, Write};

const KNOWN_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

fn main() {
    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let request: serde_json::Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(_) => {
                let response = make_error(&serde_json::Value::Null, -32700, "Parse error");
                let _ = writeln!(out, "{}", response);
                let _ = out.flush();
                continue;
            }
        };

        let method = request.get("method").and_then(|m| m.as_str()).unwrap_or("");

        // Notifications carry no id and expect no reply.
        if request.get("id").map(|id| id.is_null()).unwrap_or(true) {
            continue;
        }
        let id = request.get("id").cloned().unwrap_or(serde_json::Value::Null);

        let response = match method {
            "initialize" => handle_initialize(&id, &request),
            "tools/list" => handle_tools_list(&id),
            "tools/call" => handle_tools_call(&id, &request),
            "ping" => serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": {} }),
            _ => make_error(&id, -32601, &format!("Method not found: {}", method)),
        };

        if writeln!(out, "{}", response).is_err() {
            break;
        }
        if out.flush().is_err() {
            break;
        }
    }
}

/// Handle the `initialize` request.
///
/// The responded protocol version is, in order of precedence: the
/// `MCP_TEST_SERVER_VERSION` environment variable verbatim, the client's
/// offered version when the server knows it, or the newest known version.
fn handle_initialize(id: &serde_json::Value, request: &serde_json::Value) -> serde_json::Value {
    let offered = request
        .get("params")
        .and_then(|p| p.get("protocolVersion"))
        .and_then(|v| v.as_str())
        .unwrap_or("");

    let version = match std::env::var("MCP_TEST_SERVER_VERSION") {
        Ok(forced) => forced,
        Err(_) if KNOWN_VERSIONS.contains(&offered) => offered.to_string(),
        Err(_) => KNOWN_VERSIONS[0].to_string(),
    };

    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": {
            "protocolVersion": version,
            "capabilities": {
                "tools": {},
                "resources": { "subscribe": true }
            },
            "serverInfo": {
                "name": "mcp-test-server",
                "version": "0.2.0"
            }
        }
    })
}

/// Handle the `tools/list` request.
fn handle_tools_list(id: &serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": {
            "tools": [
                {
                    "name": "echo",
                    "description": "Echoes input",
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "message": { "type": "string" }
                        }
                    }
                },
                {
                    "name": "sleep",
                    "description": "Sleeps for `millis` before responding",
                    "inputSchema": {
                        "type": "object",
                        "properties": {
                            "millis": { "type": "integer" }
                        }
                    }
                }
            ]
        }
    })
}

/// Handle the `tools/call` request for the `echo` and `sleep` tools.
fn handle_tools_call(id: &serde_json::Value, request: &serde_json::Value) -> serde_json::Value {
    let params = request.get("params").unwrap_or(&serde_json::Value::Null);
    let tool_name = params.get("name").and_then(|n| n.as_str()).unwrap_or("");

    match tool_name {
        "echo" => {
            let message = params
                .get("arguments")
                .and_then(|a| a.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("");
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "content": [{ "type": "text", "text": message }],
                    "isError": false
                }
            })
        }
        "sleep" => {
            let millis = params
                .get("arguments")
                .and_then(|a| a.get("millis"))
                .and_then(|m| m.as_u64())
                .unwrap_or(0);
            std::thread::sleep(std::time::Duration::from_millis(millis));
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "content": [{ "type": "text", "text": format!("slept {millis}ms") }],
                    "isError": false
                }
            })
        }
        other => make_error(id, -32602, &format!("Unknown tool: {}", other)),
    }
}

/// Build a JSON-RPC error response echoing the request ID.
fn make_error(id: &serde_json::Value, code: i32, message: &str) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": code,
            "message": message
        }
    })
}
