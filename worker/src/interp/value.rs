//! Runtime values of the session scripting language.
//!
//! The `Value` enum doubles as the namespace's tagged binding record: a
//! binding is a function, a class, a capability handle, a relay handle, or
//! a plain value, and introspection is a straight match over the variants.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;

use capstan_core::Capability;
use capstan_protocol::ToolSpec;

use crate::interp::ast::Stmt;

#[derive(Clone)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Rc<RefCell<Vec<Value>>>),
    Dict(Rc<RefCell<BTreeMap<String, Value>>>),
    Function(Rc<FunctionDef>),
    Class(Rc<ClassDef>),
    Instance(Rc<RefCell<Instance>>),
    Builtin(Builtin),
    /// A native capability, enforced by Rust code inside this process.
    Capability(Arc<dyn Capability>),
    /// An in-session stand-in for an external tool server; every method
    /// call becomes a round-trip to the host.
    Relay(Rc<RelayCapability>),
    Method(Rc<BoundMethod>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Print,
    Len,
    Str,
    Int,
    Float,
    Abs,
    Min,
    Max,
    Sum,
    Sorted,
    Range,
    Repr,
    FileCapability,
    ShellCapability,
}

impl Builtin {
    pub fn name(self) -> &'static str {
        match self {
            Builtin::Print => "print",
            Builtin::Len => "len",
            Builtin::Str => "str",
            Builtin::Int => "int",
            Builtin::Float => "float",
            Builtin::Abs => "abs",
            Builtin::Min => "min",
            Builtin::Max => "max",
            Builtin::Sum => "sum",
            Builtin::Sorted => "sorted",
            Builtin::Range => "range",
            Builtin::Repr => "repr",
            Builtin::FileCapability => "FileCapability",
            Builtin::ShellCapability => "ShellCapability",
        }
    }

    pub fn lookup(name: &str) -> Option<Builtin> {
        let builtin = match name {
            "print" => Builtin::Print,
            "len" => Builtin::Len,
            "str" => Builtin::Str,
            "int" => Builtin::Int,
            "float" => Builtin::Float,
            "abs" => Builtin::Abs,
            "min" => Builtin::Min,
            "max" => Builtin::Max,
            "sum" => Builtin::Sum,
            "sorted" => Builtin::Sorted,
            "range" => Builtin::Range,
            "repr" => Builtin::Repr,
            "FileCapability" => Builtin::FileCapability,
            "ShellCapability" => Builtin::ShellCapability,
            _ => return None,
        };
        Some(builtin)
    }
}

pub struct FunctionDef {
    pub name: String,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
    /// Full text of the definition block, captured when the definition
    /// executes.
    pub source: String,
    pub docstring: String,
}

#[derive(Clone)]
pub struct Param {
    pub name: String,
    pub default: Option<Value>,
}

impl FunctionDef {
    pub fn signature(&self) -> String {
        let params: Vec<String> = self
            .params
            .iter()
            .map(|p| match &p.default {
                Some(default) => format!("{}={}", p.name, repr(default)),
                None => p.name.clone(),
            })
            .collect();
        format!("({})", params.join(", "))
    }
}

pub struct ClassDef {
    pub name: String,
    /// Class-level attributes, evaluated when the class statement ran.
    pub attrs: BTreeMap<String, Value>,
    pub methods: BTreeMap<String, Rc<FunctionDef>>,
    pub source: String,
    pub docstring: String,
}

pub struct Instance {
    pub class: Rc<ClassDef>,
    pub fields: BTreeMap<String, Value>,
}

pub struct RelayCapability {
    pub name: String,
    pub tools: BTreeMap<String, ToolSpec>,
}

impl RelayCapability {
    pub fn description(&self) -> String {
        format!("Relay capability with {} tools", self.tools.len())
    }

    pub fn describe(&self) -> String {
        let mut lines = vec![format!("{} capability (relay-backed):", self.name), String::new()];
        for (method, tool) in &self.tools {
            let doc = if tool.description.is_empty() {
                "No description"
            } else {
                &tool.description
            };
            lines.push(format!("  .{method}()"));
            lines.push(format!("      {doc}"));
            lines.push(String::new());
        }
        lines.join("\n")
    }
}

pub struct BoundMethod {
    pub receiver: Receiver,
    pub name: String,
}

pub enum Receiver {
    Instance(Rc<RefCell<Instance>>, Rc<FunctionDef>),
    Capability(Arc<dyn Capability>),
    Relay(Rc<RelayCapability>),
}

impl Value {
    pub fn truthy(&self) -> bool {
        match self {
            Value::None => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Float(f) => *f != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(items) => !items.borrow().is_empty(),
            Value::Dict(entries) => !entries.borrow().is_empty(),
            _ => true,
        }
    }

    /// Whether the value is callable: used to classify namespace entries.
    pub fn callable(&self) -> bool {
        matches!(
            self,
            Value::Function(_) | Value::Class(_) | Value::Builtin(_) | Value::Method(_)
        )
    }

    /// Short type description for `state` reports.
    pub fn type_str(&self) -> String {
        match self {
            Value::None => "NoneType".to_string(),
            Value::Bool(_) => "bool".to_string(),
            Value::Int(_) => "int".to_string(),
            Value::Float(_) => "float".to_string(),
            Value::Str(_) => "str".to_string(),
            Value::List(items) => {
                let items = items.borrow();
                match items.first() {
                    Some(first) if items.len() > 1 => {
                        format!("list[{}, ...]", first.type_str())
                    }
                    Some(first) => format!("list[{}]", first.type_str()),
                    None => "list".to_string(),
                }
            }
            Value::Dict(entries) => {
                let entries = entries.borrow();
                match entries.iter().next() {
                    Some((_, value)) => format!("dict[str, {}]", value.type_str()),
                    None => "dict".to_string(),
                }
            }
            Value::Function(_) => "function".to_string(),
            Value::Class(class) => format!("class '{}'", class.name),
            Value::Instance(instance) => instance.borrow().class.name.clone(),
            Value::Builtin(_) => "builtin".to_string(),
            Value::Capability(cap) => format!("capability '{}'", cap.name()),
            Value::Relay(relay) => format!("relay capability '{}'", relay.name),
            Value::Method(_) => "method".to_string(),
        }
    }

    /// Structural equality for `==`; reference-ish kinds compare by
    /// identity.
    pub fn eq_value(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::None, Value::None) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                *a as f64 == *b
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.eq_value(y))
            }
            (Value::Dict(a), Value::Dict(b)) => {
                let (a, b) = (a.borrow(), b.borrow());
                a.len() == b.len()
                    && a.iter().zip(b.iter()).all(|((ka, va), (kb, vb))| {
                        ka == kb && va.eq_value(vb)
                    })
            }
            (Value::Function(a), Value::Function(b)) => Rc::ptr_eq(a, b),
            (Value::Class(a), Value::Class(b)) => Rc::ptr_eq(a, b),
            (Value::Instance(a), Value::Instance(b)) => Rc::ptr_eq(a, b),
            (Value::Relay(a), Value::Relay(b)) => Rc::ptr_eq(a, b),
            (Value::Capability(a), Value::Capability(b)) => Arc::ptr_eq(a, b),
            (Value::Builtin(a), Value::Builtin(b)) => a == b,
            _ => false,
        }
    }
}

/// Python-flavored `repr`, used for display fallbacks and `repr`-kind
/// snapshot payloads.
pub fn repr(value: &Value) -> String {
    match value {
        Value::None => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Int(n) => n.to_string(),
        Value::Float(f) => format_float(*f),
        Value::Str(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'")),
        Value::List(items) => {
            let rendered: Vec<String> = items.borrow().iter().map(repr).collect();
            format!("[{}]", rendered.join(", "))
        }
        Value::Dict(entries) => {
            let rendered: Vec<String> = entries
                .borrow()
                .iter()
                .map(|(k, v)| format!("'{k}': {}", repr(v)))
                .collect();
            format!("{{{}}}", rendered.join(", "))
        }
        Value::Function(func) => format!("<function {}>", func.name),
        Value::Class(class) => format!("<class '{}'>", class.name),
        Value::Instance(instance) => format!("<{} instance>", instance.borrow().class.name),
        Value::Builtin(builtin) => format!("<builtin {}>", builtin.name()),
        Value::Capability(cap) => format!("<capability '{}'>", cap.name()),
        Value::Relay(relay) => format!(
            "<relay capability '{}' with {} methods>",
            relay.name,
            relay.tools.len()
        ),
        Value::Method(method) => format!("<bound method {}>", method.name),
    }
}

/// `str()`: identity on strings, `repr` otherwise.
pub fn display(value: &Value) -> String {
    match value {
        Value::Str(s) => s.clone(),
        other => repr(other),
    }
}

pub fn format_float(f: f64) -> String {
    if f.is_finite() && f == f.trunc() && f.abs() < 1e16 {
        format!("{f:.1}")
    } else {
        f.to_string()
    }
}

/// Best-effort conversion into the interchange format, with textual
/// fallback for values that cannot round-trip.
pub fn to_json_lossy(value: &Value) -> serde_json::Value {
    to_json_strict(value).unwrap_or_else(|| serde_json::Value::String(repr(value)))
}

/// Strict conversion: `None` when the value (or anything inside it) is not
/// representable in the interchange format.
pub fn to_json_strict(value: &Value) -> Option<serde_json::Value> {
    match value {
        Value::None => Some(serde_json::Value::Null),
        Value::Bool(b) => Some(serde_json::Value::Bool(*b)),
        Value::Int(n) => Some(serde_json::json!(n)),
        Value::Float(f) => serde_json::Number::from_f64(*f).map(serde_json::Value::Number),
        Value::Str(s) => Some(serde_json::Value::String(s.clone())),
        Value::List(items) => {
            let mut out = Vec::new();
            for item in items.borrow().iter() {
                out.push(to_json_strict(item)?);
            }
            Some(serde_json::Value::Array(out))
        }
        Value::Dict(entries) => {
            let mut map = serde_json::Map::new();
            for (key, entry) in entries.borrow().iter() {
                map.insert(key.clone(), to_json_strict(entry)?);
            }
            Some(serde_json::Value::Object(map))
        }
        _ => None,
    }
}

pub fn from_json(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::None,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Value::Str(s.clone()),
        serde_json::Value::Array(items) => Value::List(Rc::new(RefCell::new(
            items.iter().map(from_json).collect(),
        ))),
        serde_json::Value::Object(map) => Value::Dict(Rc::new(RefCell::new(
            map.iter().map(|(k, v)| (k.clone(), from_json(v))).collect(),
        ))),
    }
}
