//! Script-level errors: a type name from the interpreter's exception
//! taxonomy plus a message. These surface through `execute` results as
//! `error_type`/`error_message`.

use std::fmt;

use capstan_core::CapabilityError;

#[derive(Debug, Clone, PartialEq)]
pub struct ScriptError {
    pub kind: String,
    pub message: String,
}

impl ScriptError {
    pub fn new(kind: &str, message: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            message: message.into(),
        }
    }

    pub fn syntax(message: impl Into<String>) -> Self {
        Self::new("SyntaxError", message)
    }

    pub fn name(name: &str) -> Self {
        Self::new("NameError", format!("name '{name}' is not defined"))
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    pub fn attribute(message: impl Into<String>) -> Self {
        Self::new("AttributeError", message)
    }

    pub fn value(message: impl Into<String>) -> Self {
        Self::new("ValueError", message)
    }

    pub fn zero_division() -> Self {
        Self::new("ZeroDivisionError", "division by zero")
    }

    pub fn relay(message: impl Into<String>) -> Self {
        Self::new("RelayError", message)
    }

    /// Minimal formatted trace for the captured stderr stream.
    pub fn traceback(&self) -> String {
        format!(
            "Traceback (most recent call last):\n  <session>\n{}: {}\n",
            self.kind, self.message
        )
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl From<CapabilityError> for ScriptError {
    fn from(err: CapabilityError) -> Self {
        ScriptError::new(err.type_name(), err.to_string())
    }
}
