//! Tool-endpoint message processor.
//!
//! Dispatches incoming JSON-RPC requests to the runtime's operations. One
//! request is handled at a time; the runtime mutex already serializes the
//! session, so a serial processor adds no extra contention.

use std::sync::Arc;

use capstan_core::backend::BackendSpawnSpec;
use capstan_core::runtime::Runtime;
use capstan_protocol::CallToolParams;
use capstan_protocol::JsonRpcMessage;
use capstan_protocol::JsonRpcRequest;
use capstan_protocol::RequestId;
use capstan_protocol::Tool;
use serde_json::Value;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::info;
use tracing::warn;

const PROTOCOL_VERSION: &str = "2025-03-26";

pub struct MessageProcessor {
    outgoing: mpsc::Sender<JsonRpcMessage>,
    runtime: Arc<Runtime>,
    initialized: bool,
}

impl MessageProcessor {
    pub fn new(outgoing: mpsc::Sender<JsonRpcMessage>, runtime: Arc<Runtime>) -> Self {
        Self {
            outgoing,
            runtime,
            initialized: false,
        }
    }

    pub async fn process(&mut self, message: JsonRpcMessage) {
        match message {
            JsonRpcMessage::Request(request) => self.process_request(request).await,
            JsonRpcMessage::Notification(notification) => {
                info!("<- notification: {}", notification.method);
            }
            JsonRpcMessage::Response(response) => {
                info!("<- stray response: {response:?}");
            }
            JsonRpcMessage::Error(error) => {
                warn!("<- error: {error:?}");
            }
        }
    }

    async fn send(&self, message: JsonRpcMessage) {
        if self.outgoing.send(message).await.is_err() {
            warn!("outgoing channel closed");
        }
    }

    async fn process_request(&mut self, request: JsonRpcRequest) {
        let JsonRpcRequest {
            id, method, params, ..
        } = request;
        match method.as_str() {
            "initialize" => self.handle_initialize(id).await,
            "ping" => self.send(JsonRpcMessage::response(id, json!({}))).await,
            "tools/list" => {
                self.send(JsonRpcMessage::response(
                    id,
                    json!({"tools": tool_table()}),
                ))
                .await;
            }
            "tools/call" => self.handle_call_tool(id, params).await,
            other => {
                self.send(JsonRpcMessage::error(
                    id,
                    -32601,
                    format!("method not found: {other}"),
                ))
                .await;
            }
        }
    }

    async fn handle_initialize(&mut self, id: RequestId) {
        if self.initialized {
            self.send(JsonRpcMessage::error(
                id,
                -32600,
                "initialize called more than once",
            ))
            .await;
            return;
        }
        self.initialized = true;
        let result = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {"tools": {"listChanged": false}},
            "serverInfo": {
                "name": "capstan",
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        self.send(JsonRpcMessage::response(id, result)).await;
    }

    async fn handle_call_tool(&mut self, id: RequestId, params: Option<Value>) {
        let params: CallToolParams = match params.map(serde_json::from_value).transpose() {
            Ok(Some(params)) => params,
            Ok(None) => {
                self.send(JsonRpcMessage::error(id, -32602, "missing tool-call params"))
                    .await;
                return;
            }
            Err(err) => {
                self.send(JsonRpcMessage::error(
                    id,
                    -32602,
                    format!("invalid tool-call params: {err}"),
                ))
                .await;
                return;
            }
        };

        info!(tool = %params.name, "tools/call");
        let arguments = params.arguments.unwrap_or_else(|| json!({}));
        let outcome = self.dispatch_tool(&params.name, &arguments).await;
        let result = match outcome {
            Ok(value) => json!({
                "content": [{"type": "text", "text": value.to_string()}],
                "isError": false,
            }),
            Err(message) => json!({
                "content": [{"type": "text", "text": message}],
                "isError": true,
            }),
        };
        self.send(JsonRpcMessage::response(id, result)).await;
    }

    async fn dispatch_tool(&self, tool: &str, args: &Value) -> Result<Value, String> {
        let str_arg = |key: &str| -> Option<String> {
            args.get(key).and_then(|v| v.as_str()).map(String::from)
        };
        let state_name = str_arg("name").unwrap_or_else(|| "default".to_string());

        match tool {
            "execute" => {
                let code = str_arg("code").ok_or("missing required argument 'code'")?;
                let result = self.runtime.execute(&code).await.map_err(stringify)?;
                Ok(serde_json::to_value(result).map_err(stringify)?)
            }
            "state" => {
                let state = self.runtime.state().await.map_err(stringify)?;
                Ok(serde_json::to_value(state).map_err(stringify)?)
            }
            "list_capabilities" => {
                let listing = self.runtime.list_capabilities().await.map_err(stringify)?;
                Ok(serde_json::to_value(listing).map_err(stringify)?)
            }
            "register_capability" => {
                let name = str_arg("name").ok_or("missing required argument 'name'")?;
                match self.runtime.register_capability(&name).await.map_err(stringify)? {
                    Some(capability_name) => {
                        Ok(json!({"success": true, "capability_name": capability_name}))
                    }
                    None => Ok(json!({
                        "success": false,
                        "error": format!("failed to register '{name}'"),
                    })),
                }
            }
            "describe_capability" => {
                let name = str_arg("name").ok_or("missing required argument 'name'")?;
                let description = self
                    .runtime
                    .describe_capability(&name)
                    .await
                    .map_err(stringify)?;
                Ok(json!({"success": true, "description": description}))
            }
            "install_capability" => {
                let name = str_arg("name").ok_or("missing required argument 'name'")?;
                let command = str_arg("command").ok_or("missing required argument 'command'")?;
                let spawn = BackendSpawnSpec::parse(&command).map_err(stringify)?;
                let tools = self
                    .runtime
                    .install_capability(&name, spawn)
                    .await
                    .map_err(stringify)?;
                Ok(json!({"success": true, "capability_name": name, "tools": tools}))
            }
            "uninstall_capability" => {
                let name = str_arg("name").ok_or("missing required argument 'name'")?;
                let removed = self.runtime.uninstall_capability(&name).await;
                Ok(json!({"success": removed}))
            }
            "save_state" => {
                let summary = self.runtime.save_state(&state_name).await.map_err(stringify)?;
                Ok(json!({"success": true, "summary": summary}))
            }
            "restore_state" => {
                let summary = self
                    .runtime
                    .restore_state(&state_name)
                    .await
                    .map_err(stringify)?;
                Ok(json!({"success": true, "summary": summary}))
            }
            "list_saved_states" => {
                let states = self.runtime.list_saved_states().map_err(stringify)?;
                Ok(json!({"states": states}))
            }
            "reset" => {
                self.runtime.reset().await.map_err(stringify)?;
                Ok(json!({"success": true, "message": "session reset to clean state"}))
            }
            other => Err(format!("unknown tool '{other}'")),
        }
    }
}

fn stringify(err: impl std::fmt::Display) -> String {
    err.to_string()
}

fn name_only_schema() -> Value {
    json!({
        "type": "object",
        "properties": {"name": {"type": "string"}},
        "required": ["name"],
    })
}

fn state_name_schema() -> Value {
    json!({
        "type": "object",
        "properties": {"name": {"type": "string", "default": "default"}},
    })
}

fn tool_table() -> Vec<Tool> {
    vec![
        Tool {
            name: "execute".to_string(),
            description: "Execute code in the persistent session. Variables, functions, \
                          and capabilities persist across calls; capability method calls \
                          are mediated by the host."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {"code": {"type": "string"}},
                "required": ["code"],
            }),
        },
        Tool {
            name: "state".to_string(),
            description: "Summarize the session: functions, variables, capabilities, and \
                          history length."
                .to_string(),
            input_schema: json!({"type": "object"}),
        },
        Tool {
            name: "list_capabilities".to_string(),
            description: "List registered capabilities.".to_string(),
            input_schema: json!({"type": "object"}),
        },
        Tool {
            name: "register_capability".to_string(),
            description: "Register an object from the session namespace as a capability; \
                          it must carry a name and a describe() method."
                .to_string(),
            input_schema: name_only_schema(),
        },
        Tool {
            name: "describe_capability".to_string(),
            description: "Get the full documentation of one capability.".to_string(),
            input_schema: name_only_schema(),
        },
        Tool {
            name: "install_capability".to_string(),
            description: "Spawn an external tool server and expose its tools as a relay \
                          capability in the session."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string"},
                    "command": {"type": "string"},
                },
                "required": ["name", "command"],
            }),
        },
        Tool {
            name: "uninstall_capability".to_string(),
            description: "Disconnect a relay capability's backend. The in-session object \
                          remains but its calls will fail."
                .to_string(),
            input_schema: name_only_schema(),
        },
        Tool {
            name: "save_state".to_string(),
            description: "Persist the session's functions, variables, capability \
                          configurations, and history under a name."
                .to_string(),
            input_schema: state_name_schema(),
        },
        Tool {
            name: "restore_state".to_string(),
            description: "Restore a saved session state and reconnect its relay \
                          capabilities."
                .to_string(),
            input_schema: state_name_schema(),
        },
        Tool {
            name: "list_saved_states".to_string(),
            description: "List saved session states.".to_string(),
            input_schema: json!({"type": "object"}),
        },
        Tool {
            name: "reset".to_string(),
            description: "Replace the session with a fresh worker and drop all backends. \
                          Unsaved state is lost."
                .to_string(),
            input_schema: json!({"type": "object"}),
        },
    ]
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn tool_table_names_are_unique_and_schemad() {
        let tools = tool_table();
        let mut names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        let total = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), total);
        for tool in &tools {
            assert_eq!(tool.input_schema["type"], "object", "{}", tool.name);
            assert!(!tool.description.is_empty(), "{}", tool.name);
        }
    }
}
