//! The capability object model.
//!
//! A capability is a named, contract-bearing object that mediates one class
//! of side effect. Enforcement lives inside the object: every operation
//! checks its own guards and refuses with a typed [`CapabilityError`].
//! Derivation produces a strictly-weaker instance; the subset invariant
//! `derived.contract().is_subset_of(parent.contract())` is checked by tests
//! for every derivable capability.

use std::sync::Arc;

use serde_json::Value;

use crate::contract::Contract;
use crate::error::CapabilityError;

/// Keyword arguments of a capability invocation.
pub type Args = serde_json::Map<String, Value>;

/// Static description of one operation, used for positional-argument
/// mapping and for `describe()` rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationSpec {
    pub name: &'static str,
    /// Parameter names in declaration order; positional arguments are
    /// mapped onto these.
    pub params: &'static [&'static str],
    pub signature: &'static str,
    pub doc: &'static str,
}

pub trait Capability: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn contract(&self) -> Contract;

    fn operations(&self) -> Vec<OperationSpec>;

    /// Invoke one operation with keyword arguments. Policy refusals raise;
    /// results are interchange values.
    fn invoke(&self, method: &str, args: &Args) -> Result<Value, CapabilityError>;

    /// Produce a strictly-weaker instance, or refuse when the restrictions
    /// would broaden what the parent grants.
    fn derive(&self, _restrictions: &Args) -> Result<Arc<dyn Capability>, CapabilityError> {
        Err(CapabilityError::NotDerivable)
    }

    /// Self-documenting description: name, summary, and each operation with
    /// its signature and one-line doc.
    fn describe(&self) -> String {
        let mut lines = vec![format!("{}: {}", self.name(), self.description()), String::new()];
        lines.push("Methods:".to_string());
        for op in self.operations() {
            lines.push(format!("  - {}{}", op.name, op.signature));
            lines.push(format!("      {}", op.doc));
        }
        lines.push(String::new());
        lines.push(format!("Contract: {}", self.contract()));
        lines.join("\n")
    }

    fn unknown_method(&self, method: &str) -> CapabilityError {
        let available = self
            .operations()
            .iter()
            .map(|op| op.name)
            .collect::<Vec<_>>()
            .join(", ");
        CapabilityError::UnknownMethod {
            capability: self.name().to_string(),
            method: method.to_string(),
            available,
        }
    }
}

/// Required string argument.
pub fn require_str<'a>(args: &'a Args, name: &str) -> Result<&'a str, CapabilityError> {
    match args.get(name) {
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(CapabilityError::InvalidArguments(format!(
            "argument '{name}' must be a string, got {other}"
        ))),
        None => Err(CapabilityError::InvalidArguments(format!(
            "missing required argument '{name}'"
        ))),
    }
}

/// Optional string argument.
pub fn optional_str<'a>(args: &'a Args, name: &str) -> Result<Option<&'a str>, CapabilityError> {
    match args.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(CapabilityError::InvalidArguments(format!(
            "argument '{name}' must be a string, got {other}"
        ))),
    }
}

/// Optional boolean argument.
pub fn optional_bool(args: &Args, name: &str) -> Result<Option<bool>, CapabilityError> {
    match args.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(other) => Err(CapabilityError::InvalidArguments(format!(
            "argument '{name}' must be a boolean, got {other}"
        ))),
    }
}

/// Optional list-of-strings argument.
pub fn optional_str_list(args: &Args, name: &str) -> Result<Option<Vec<String>>, CapabilityError> {
    match args.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(s) => out.push(s.clone()),
                    other => {
                        return Err(CapabilityError::InvalidArguments(format!(
                            "argument '{name}' must be a list of strings, got element {other}"
                        )));
                    }
                }
            }
            Ok(Some(out))
        }
        Some(other) => Err(CapabilityError::InvalidArguments(format!(
            "argument '{name}' must be a list of strings, got {other}"
        ))),
    }
}

/// Optional non-negative number argument, in seconds.
pub fn optional_seconds(args: &Args, name: &str) -> Result<Option<f64>, CapabilityError> {
    match args.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => match n.as_f64() {
            Some(v) if v >= 0.0 => Ok(Some(v)),
            _ => Err(CapabilityError::InvalidArguments(format!(
                "argument '{name}' must be a non-negative number"
            ))),
        },
        Some(other) => Err(CapabilityError::InvalidArguments(format!(
            "argument '{name}' must be a number, got {other}"
        ))),
    }
}
