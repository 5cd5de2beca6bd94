//! The worker's command dispatcher and user namespace.
//!
//! One `Session` lives for the whole worker process. It owns the global
//! namespace, the execution history, the capability registries, and the
//! monotonic relay id counter. Commands arrive one per line; `execute` may
//! interleave relay traffic through the wire it is handed.

use std::collections::BTreeMap;
use std::rc::Rc;

use capstan_protocol::AckResponse;
use capstan_protocol::CapabilityKind;
use capstan_protocol::CapabilityListing;
use capstan_protocol::ExecuteResponse;
use capstan_protocol::FunctionInfo;
use capstan_protocol::ImportReport;
use capstan_protocol::ListCapabilitiesResponse;
use capstan_protocol::PingResponse;
use capstan_protocol::RegisterResponse;
use capstan_protocol::RestoreFailure;
use capstan_protocol::SavedCapability;
use capstan_protocol::SavedFunction;
use capstan_protocol::SavedVariable;
use capstan_protocol::SessionSnapshot;
use capstan_protocol::StateResponse;
use capstan_protocol::ToolSpec;
use capstan_protocol::VariableKind;
use capstan_protocol::WorkerCommand;
use serde_json::json;

use crate::interp::ast::Stmt;
use crate::interp::error::ScriptError;
use crate::interp::eval::Interp;
use crate::interp::parser::parse;
use crate::interp::value::RelayCapability;
use crate::interp::value::Value;
use crate::interp::value::repr;
use crate::interp::value::to_json_lossy;
use crate::interp::value::to_json_strict;
use crate::relay::NoRelay;
use crate::relay::Wire;
use crate::relay::WireRelay;

pub struct Session {
    globals: BTreeMap<String, Value>,
    history: Vec<String>,
    /// Registered native capabilities, keyed by capability name.
    native_caps: BTreeMap<String, Value>,
    /// Relay capabilities, keyed by capability name.
    relay_caps: BTreeMap<String, Rc<RelayCapability>>,
    relay_id: u64,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            globals: BTreeMap::new(),
            history: Vec::new(),
            native_caps: BTreeMap::new(),
            relay_caps: BTreeMap::new(),
            relay_id: 0,
        }
    }

    pub fn dispatch(&mut self, command: WorkerCommand, wire: &mut dyn Wire) -> serde_json::Value {
        let response = match command {
            WorkerCommand::Ping => to_value(PingResponse { pong: true }),
            WorkerCommand::Execute { code } => to_value(self.execute(&code, wire)),
            WorkerCommand::State => to_value(self.state()),
            WorkerCommand::Inject { name, code } => to_value(self.inject(&name, &code)),
            WorkerCommand::InjectRelayCapability { name, tools } => {
                to_value(self.inject_relay_capability(&name, tools))
            }
            WorkerCommand::RegisterCapability { name } => {
                to_value(self.register_capability(&name))
            }
            WorkerCommand::ListCapabilities => to_value(self.list_capabilities()),
            WorkerCommand::ExportState => to_value(self.export_state()),
            WorkerCommand::ImportState { state } => to_value(self.import_state(state)),
        };
        response.unwrap_or_else(|err| json!({"error": format!("internal error: {err}")}))
    }

    pub fn execute(&mut self, code: &str, wire: &mut dyn Wire) -> ExecuteResponse {
        let mut stdout = String::new();
        let mut stderr = String::new();

        let module = match parse(code) {
            Ok(module) => module,
            Err(err) => {
                stderr.push_str(&err.traceback());
                return failure(err, stdout, stderr);
            }
        };

        let mut relay = WireRelay {
            wire,
            next_id: &mut self.relay_id,
        };
        let mut interp = Interp::new(&mut self.globals, &mut stdout, &mut relay, &module.source);

        // A single expression reports its value; anything else runs for
        // effect.
        let outcome: Result<Option<Value>, ScriptError> =
            if let [Stmt::Expr(expr)] = module.stmts.as_slice() {
                interp.eval(expr).map(Some)
            } else {
                interp.exec_module(&module).map(|()| None)
            };

        match outcome {
            Ok(value) => {
                self.history.push(code.to_string());
                ExecuteResponse {
                    success: true,
                    stdout,
                    stderr,
                    return_value: value.map(|v| to_json_lossy(&v)),
                    error_type: None,
                    error_message: None,
                }
            }
            Err(err) => {
                stderr.push_str(&err.traceback());
                failure(err, stdout, stderr)
            }
        }
    }

    fn visible_bindings(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.globals.iter().filter(|(name, _)| !name.starts_with('_'))
    }

    pub fn state(&self) -> StateResponse {
        let mut functions = Vec::new();
        let mut variables = BTreeMap::new();
        for (name, value) in self.visible_bindings() {
            match value {
                Value::Function(func) => functions.push(FunctionInfo {
                    name: name.clone(),
                    signature: func.signature(),
                    docstring: func.docstring.clone(),
                }),
                value if !value.callable() => {
                    variables.insert(name.clone(), value.type_str());
                }
                _ => {}
            }
        }

        let mut capabilities: Vec<String> = self.native_caps.keys().cloned().collect();
        capabilities.extend(self.relay_caps.keys().cloned());

        StateResponse {
            functions,
            variables,
            capabilities,
            history_length: self.history.len(),
        }
    }

    pub fn inject(&mut self, name: &str, code: &str) -> AckResponse {
        let result = (|| -> Result<(), ScriptError> {
            let module = parse(code)?;
            let mut stdout = String::new();
            let mut relay = NoRelay;
            let mut interp =
                Interp::new(&mut self.globals, &mut stdout, &mut relay, &module.source);
            interp.exec_module(&module)
        })();
        match result {
            Ok(()) => {
                self.globals.entry(name.to_string()).or_insert(Value::None);
                AckResponse::ok()
            }
            Err(err) => AckResponse::err(err.to_string()),
        }
    }

    pub fn inject_relay_capability(
        &mut self,
        name: &str,
        tools: BTreeMap<String, ToolSpec>,
    ) -> AckResponse {
        let relay = Rc::new(RelayCapability {
            name: name.to_string(),
            tools,
        });
        self.globals
            .insert(name.to_string(), Value::Relay(Rc::clone(&relay)));
        self.relay_caps.insert(name.to_string(), relay);
        AckResponse::ok()
    }

    pub fn register_capability(&mut self, name: &str) -> RegisterResponse {
        let Some(value) = self.globals.get(name).cloned() else {
            return RegisterResponse {
                success: false,
                capability_name: None,
                error: Some(format!("'{name}' not found in namespace")),
            };
        };
        match &value {
            Value::Capability(cap) => {
                let cap_name = cap.name().to_string();
                self.native_caps.insert(cap_name.clone(), value);
                RegisterResponse {
                    success: true,
                    capability_name: Some(cap_name),
                    error: None,
                }
            }
            Value::Instance(instance) => {
                let borrowed = instance.borrow();
                let cap_name = borrowed
                    .fields
                    .get("name")
                    .or_else(|| borrowed.class.attrs.get("name"))
                    .and_then(|v| match v {
                        Value::Str(s) => Some(s.clone()),
                        _ => None,
                    });
                let has_describe = borrowed.class.methods.contains_key("describe");
                drop(borrowed);
                match (cap_name, has_describe) {
                    (Some(cap_name), true) => {
                        self.native_caps.insert(cap_name.clone(), value);
                        RegisterResponse {
                            success: true,
                            capability_name: Some(cap_name),
                            error: None,
                        }
                    }
                    _ => invalid_capability(name),
                }
            }
            Value::Relay(relay) => RegisterResponse {
                success: true,
                capability_name: Some(relay.name.clone()),
                error: None,
            },
            _ => invalid_capability(name),
        }
    }

    pub fn list_capabilities(&self) -> ListCapabilitiesResponse {
        let mut capabilities = Vec::new();
        for (name, value) in &self.native_caps {
            let description = match value {
                Value::Capability(cap) => cap.description().to_string(),
                Value::Instance(instance) => {
                    match instance.borrow().class.attrs.get("description") {
                        Some(Value::Str(s)) => s.clone(),
                        _ => String::new(),
                    }
                }
                _ => String::new(),
            };
            capabilities.push(CapabilityListing {
                name: name.clone(),
                kind: CapabilityKind::Native,
                description,
            });
        }
        for (name, relay) in &self.relay_caps {
            capabilities.push(CapabilityListing {
                name: name.clone(),
                kind: CapabilityKind::Relay,
                description: relay.description(),
            });
        }
        ListCapabilitiesResponse { capabilities }
    }

    /// Search the execution history, newest first, for the block that most
    /// recently defined `name`. Last-resort source recovery for bindings
    /// whose definition text was not captured.
    fn find_definition_in_history(&self, keyword: &str, name: &str) -> Option<String> {
        let needle = format!("{keyword} {name}");
        for code in self.history.iter().rev() {
            let defines = code.lines().any(|line| {
                let trimmed = line.trim_start();
                trimmed.starts_with(&needle)
                    && trimmed[needle.len()..]
                        .chars()
                        .next()
                        .is_none_or(|c| c == '(' || c == ':' || c.is_whitespace())
            });
            if defines {
                return Some(code.clone());
            }
        }
        None
    }

    pub fn export_state(&self) -> SessionSnapshot {
        let mut functions = Vec::new();
        let mut variables = Vec::new();

        for (name, value) in self.visible_bindings() {
            if self.native_caps.contains_key(name) || self.relay_caps.contains_key(name) {
                continue;
            }
            match value {
                Value::Function(func) => {
                    let source = if func.source.is_empty() {
                        self.find_definition_in_history("def", name)
                    } else {
                        Some(func.source.clone())
                    };
                    if let Some(source) = source {
                        functions.push(SavedFunction {
                            name: name.clone(),
                            source,
                            signature: func.signature(),
                            docstring: func.docstring.clone(),
                        });
                    }
                }
                Value::Class(class) => {
                    let source = if class.source.is_empty() {
                        self.find_definition_in_history("class", name)
                    } else {
                        Some(class.source.clone())
                    };
                    if let Some(source) = source {
                        functions.push(SavedFunction {
                            name: name.clone(),
                            source,
                            signature: String::new(),
                            docstring: class.docstring.clone(),
                        });
                    }
                }
                value if !value.callable() => match to_json_strict(value) {
                    Some(payload) => variables.push(SavedVariable {
                        name: name.clone(),
                        kind: VariableKind::Value,
                        payload,
                    }),
                    None => variables.push(SavedVariable {
                        name: name.clone(),
                        kind: VariableKind::Repr,
                        payload: serde_json::Value::String(repr(value)),
                    }),
                },
                _ => {}
            }
        }

        let mut capabilities = Vec::new();
        for (name, value) in &self.native_caps {
            let source = match value {
                Value::Instance(instance) => {
                    let source = instance.borrow().class.source.clone();
                    if source.is_empty() { None } else { Some(source) }
                }
                // Builtin-backed capabilities have no recoverable script
                // source.
                _ => None,
            };
            capabilities.push(SavedCapability {
                name: name.clone(),
                kind: CapabilityKind::Native,
                source,
                command: None,
            });
        }
        for name in self.relay_caps.keys() {
            capabilities.push(SavedCapability {
                name: name.clone(),
                kind: CapabilityKind::Relay,
                source: None,
                // The host records the spawn command; the worker only knows
                // the name.
                command: None,
            });
        }

        SessionSnapshot {
            functions,
            variables,
            capabilities,
            history: self.history.clone(),
            ..Default::default()
        }
    }

    pub fn import_state(&mut self, state: SessionSnapshot) -> ImportReport {
        let mut report = ImportReport::default();

        // Functions first; variables may refer to them.
        for function in &state.functions {
            match self.exec_for_import(&function.source) {
                Ok(()) => report.functions_restored += 1,
                Err(err) => report.functions_failed.push(RestoreFailure {
                    name: function.name.clone(),
                    error: err.to_string(),
                }),
            }
        }

        for variable in &state.variables {
            match variable.kind {
                VariableKind::Value => {
                    self.globals.insert(
                        variable.name.clone(),
                        crate::interp::value::from_json(&variable.payload),
                    );
                    report.variables_restored += 1;
                }
                VariableKind::Repr => report.variables_failed.push(RestoreFailure {
                    name: variable.name.clone(),
                    error: "repr-only value".to_string(),
                }),
            }
        }

        for capability in &state.capabilities {
            match capability.kind {
                CapabilityKind::Native => {
                    let Some(source) = &capability.source else {
                        continue;
                    };
                    match self.restore_native_capability(source) {
                        Ok(()) => report.capabilities_restored += 1,
                        Err(err) => report.capabilities_failed.push(RestoreFailure {
                            name: capability.name.clone(),
                            error: err.to_string(),
                        }),
                    }
                }
                CapabilityKind::Relay => {
                    report
                        .relay_capabilities_to_restore
                        .push(capability.name.clone());
                }
            }
        }

        self.history = state.history;
        report
    }

    fn exec_for_import(&mut self, source: &str) -> Result<(), ScriptError> {
        let module = parse(source)?;
        let mut stdout = String::new();
        let mut relay = NoRelay;
        let mut interp = Interp::new(&mut self.globals, &mut stdout, &mut relay, &module.source);
        interp.exec_module(&module)
    }

    /// Re-execute a capability class definition, then instantiate and
    /// register the class it defined.
    fn restore_native_capability(&mut self, source: &str) -> Result<(), ScriptError> {
        self.exec_for_import(source)?;

        let class_binding = self
            .globals
            .iter()
            .find_map(|(_, value)| match value {
                Value::Class(class)
                    if class.attrs.contains_key("name")
                        && class.methods.contains_key("describe") =>
                {
                    Some(value.clone())
                }
                _ => None,
            })
            .ok_or_else(|| {
                ScriptError::value("source did not define a capability class".to_string())
            })?;

        let mut stdout = String::new();
        let mut relay = NoRelay;
        let mut interp = Interp::new(&mut self.globals, &mut stdout, &mut relay, "");
        let instance = interp.call_value(class_binding, Vec::new(), Vec::new())?;

        let Value::Instance(handle) = &instance else {
            return Err(ScriptError::value("capability class did not instantiate"));
        };
        let cap_name = match handle.borrow().class.attrs.get("name") {
            Some(Value::Str(s)) => s.clone(),
            _ => return Err(ScriptError::value("capability class has no name")),
        };
        self.globals.insert(cap_name.clone(), instance.clone());
        self.native_caps.insert(cap_name, instance);
        Ok(())
    }
}

fn invalid_capability(name: &str) -> RegisterResponse {
    RegisterResponse {
        success: false,
        capability_name: None,
        error: Some(format!(
            "'{name}' is not a valid capability (needs name and describe)"
        )),
    }
}

fn failure(err: ScriptError, stdout: String, stderr: String) -> ExecuteResponse {
    ExecuteResponse {
        success: false,
        stdout,
        stderr,
        return_value: None,
        error_type: Some(err.kind),
        error_message: Some(err.message),
    }
}

fn to_value<T: serde::Serialize>(response: T) -> Result<serde_json::Value, serde_json::Error> {
    serde_json::to_value(response)
}
