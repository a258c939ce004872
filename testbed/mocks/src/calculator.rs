//! A small MCP tool server used as the sandboxed workload in tests.
//!
//! Tools: `calculate` (arithmetic), `echo` (returns its arguments), `sleep`
//! (waits `ms` milliseconds) and `crash` (stdio only: the server exits).
//! `tools/list` is paginated two tools per page.

use std::time::Duration;

use mcpbox_core::types::JsonRpcMessage;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

const PAGE_SIZE: usize = 2;

/// How a stdio server instance behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerBehavior {
    #[default]
    Calculator,
    /// Reads requests but never answers.
    Silent,
    /// Exits immediately.
    Exit,
    /// Prints a banner line to stdout before speaking JSON-RPC.
    Chatty,
}

pub fn tool_definitions() -> Vec<Value> {
    vec![
        json!({
            "name": "calculate",
            "description": "Evaluate an arithmetic expression",
            "inputSchema": {
                "type": "object",
                "properties": {"expression": {"type": "string"}},
                "required": ["expression"]
            }
        }),
        json!({
            "name": "echo",
            "description": "Return the arguments unchanged",
            "inputSchema": {"type": "object"}
        }),
        json!({
            "name": "sleep",
            "description": "Wait for the given number of milliseconds",
            "inputSchema": {"type": "object", "properties": {"ms": {"type": "integer"}}}
        }),
        json!({
            "name": "crash",
            "description": "Terminate the server",
            "inputSchema": {"type": "object"}
        }),
    ]
}

/// Outcome of handling one inbound message.
pub enum Reply {
    Message(JsonRpcMessage),
    Nothing,
    Exit,
}

/// Handle one JSON-RPC message the way an MCP server would.
pub async fn respond(request: &JsonRpcMessage) -> Reply {
    let Some(id) = request.id.clone() else {
        return Reply::Nothing;
    };
    let params = request.params.clone().unwrap_or(Value::Null);

    let message = match request.method.as_deref() {
        Some("initialize") => JsonRpcMessage::response(
            id,
            json!({
                "protocolVersion": params.get("protocolVersion").cloned().unwrap_or(json!("2025-03-26")),
                "capabilities": {"tools": {"listChanged": false}},
                "serverInfo": {"name": "mcp-server-calculator", "version": "0.1.0"}
            }),
        ),
        Some("ping") => JsonRpcMessage::response(id, json!({})),
        Some("tools/list") => {
            let tools = tool_definitions();
            let start = params
                .get("cursor")
                .and_then(Value::as_str)
                .and_then(|c| c.parse::<usize>().ok())
                .unwrap_or(0);
            let end = (start + PAGE_SIZE).min(tools.len());
            let mut result = json!({ "tools": tools[start.min(end)..end].to_vec() });
            if end < tools.len() {
                result["nextCursor"] = json!(end.to_string());
            }
            JsonRpcMessage::response(id, result)
        }
        Some("tools/call") => {
            let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
            match params.get("name").and_then(Value::as_str) {
                Some("calculate") => {
                    let expression = arguments.get("expression").and_then(Value::as_str).unwrap_or("");
                    match evaluate(expression) {
                        Ok(value) => JsonRpcMessage::response(id, tool_result(value)),
                        Err(e) => JsonRpcMessage::response(
                            id,
                            json!({"content": [{"type": "text", "text": e}], "isError": true}),
                        ),
                    }
                }
                Some("echo") => JsonRpcMessage::response(
                    id,
                    json!({
                        "content": [{"type": "text", "text": arguments.to_string()}],
                        "structuredContent": {"result": arguments},
                        "isError": false
                    }),
                ),
                Some("sleep") => {
                    let ms = arguments.get("ms").and_then(Value::as_u64).unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    JsonRpcMessage::response(id, tool_result(json!(ms)))
                }
                Some("crash") => return Reply::Exit,
                other => JsonRpcMessage::error_response(
                    id,
                    -32602,
                    format!("Unknown tool: {}", other.unwrap_or("<missing>")),
                ),
            }
        }
        other => JsonRpcMessage::error_response(
            id,
            -32601,
            format!("Method not found: {}", other.unwrap_or("<missing>")),
        ),
    };
    Reply::Message(message)
}

fn tool_result(value: impl Into<Value>) -> Value {
    let value = value.into();
    json!({
        "content": [{"type": "text", "text": value.to_string()}],
        "structuredContent": {"result": value},
        "isError": false
    })
}

/// Serve MCP over a pair of byte streams until EOF, an exit, or abort.
pub async fn serve_stdio<R, W>(stdin: R, mut stdout: W, behavior: ServerBehavior)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if behavior == ServerBehavior::Exit {
        return;
    }
    if behavior == ServerBehavior::Chatty && stdout.write_all(b"calculator server ready\n").await.is_err() {
        return;
    }

    let mut lines = BufReader::new(stdin).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if behavior == ServerBehavior::Silent {
            continue;
        }
        let Ok(request) = serde_json::from_str::<JsonRpcMessage>(&line) else {
            continue;
        };
        match respond(&request).await {
            Reply::Message(message) => {
                let Ok(encoded) = serde_json::to_string(&message) else { continue };
                if stdout.write_all(format!("{}\n", encoded).as_bytes()).await.is_err() {
                    return;
                }
                let _ = stdout.flush().await;
            }
            Reply::Nothing => {}
            Reply::Exit => return,
        }
    }
}

/// Evaluates `+ - * /` with parentheses and unary minus.
pub fn evaluate(expression: &str) -> Result<f64, String> {
    let tokens: Vec<char> = expression.chars().filter(|c| !c.is_whitespace()).collect();
    if tokens.is_empty() {
        return Err("empty expression".to_string());
    }
    let mut parser = Parser { tokens, pos: 0 };
    let value = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(format!("unexpected '{}'", parser.tokens[parser.pos]));
    }
    Ok(value)
}

struct Parser {
    tokens: Vec<char>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.tokens.get(self.pos).copied()
    }

    fn expr(&mut self) -> Result<f64, String> {
        let mut value = self.term()?;
        while let Some(op @ ('+' | '-')) = self.peek() {
            self.pos += 1;
            let rhs = self.term()?;
            value = if op == '+' { value + rhs } else { value - rhs };
        }
        Ok(value)
    }

    fn term(&mut self) -> Result<f64, String> {
        let mut value = self.factor()?;
        while let Some(op @ ('*' | '/')) = self.peek() {
            self.pos += 1;
            let rhs = self.factor()?;
            if op == '/' && rhs == 0.0 {
                return Err("division by zero".to_string());
            }
            value = if op == '*' { value * rhs } else { value / rhs };
        }
        Ok(value)
    }

    fn factor(&mut self) -> Result<f64, String> {
        match self.peek() {
            Some('-') => {
                self.pos += 1;
                Ok(-self.factor()?)
            }
            Some('(') => {
                self.pos += 1;
                let value = self.expr()?;
                if self.peek() != Some(')') {
                    return Err("missing ')'".to_string());
                }
                self.pos += 1;
                Ok(value)
            }
            Some(c) if c.is_ascii_digit() || c == '.' => {
                let start = self.pos;
                while matches!(self.peek(), Some(c) if c.is_ascii_digit() || c == '.') {
                    self.pos += 1;
                }
                let literal: String = self.tokens[start..self.pos].iter().collect();
                literal.parse::<f64>().map_err(|_| format!("bad number '{}'", literal))
            }
            Some(c) => Err(format!("unexpected '{}'", c)),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}
