//! Builtin functions available to session code.
//!
//! Builtins live outside the user namespace: they resolve after locals and
//! globals, and they never show up in `state` or snapshots. The capability
//! constructors return native, Rust-enforced capability objects.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use capstan_core::fs_capability::FileCapability;
use capstan_core::shell_capability::DEFAULT_TIMEOUT;
use capstan_core::shell_capability::ShellCapability;

use crate::interp::error::ScriptError;
use crate::interp::eval::Interp;
use crate::interp::eval::compare;
use crate::interp::value::Builtin;
use crate::interp::value::Value;
use crate::interp::value::display;
use crate::interp::value::repr;

pub fn call_builtin(
    interp: &mut Interp<'_>,
    builtin: Builtin,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> Result<Value, ScriptError> {
    match builtin {
        Builtin::Print => {
            reject_kwargs(builtin, &kwargs)?;
            let rendered: Vec<String> = args.iter().map(display).collect();
            interp.write_stdout(&rendered.join(" "));
            interp.write_stdout("\n");
            Ok(Value::None)
        }
        Builtin::Len => {
            let value = exactly_one(builtin, args, &kwargs)?;
            let len = match &value {
                Value::Str(s) => s.chars().count(),
                Value::List(items) => items.borrow().len(),
                Value::Dict(entries) => entries.borrow().len(),
                other => {
                    return Err(ScriptError::type_error(format!(
                        "object of type '{}' has no len()",
                        other.type_str()
                    )));
                }
            };
            Ok(Value::Int(len as i64))
        }
        Builtin::Str => {
            let value = exactly_one(builtin, args, &kwargs)?;
            Ok(Value::Str(display(&value)))
        }
        Builtin::Repr => {
            let value = exactly_one(builtin, args, &kwargs)?;
            Ok(Value::Str(repr(&value)))
        }
        Builtin::Int => {
            let value = exactly_one(builtin, args, &kwargs)?;
            match value {
                Value::Int(n) => Ok(Value::Int(n)),
                Value::Float(f) => Ok(Value::Int(f.trunc() as i64)),
                Value::Bool(b) => Ok(Value::Int(b as i64)),
                Value::Str(s) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| {
                    ScriptError::value(format!("invalid literal for int(): '{s}'"))
                }),
                other => Err(ScriptError::type_error(format!(
                    "int() argument must be a number or string, not '{}'",
                    other.type_str()
                ))),
            }
        }
        Builtin::Float => {
            let value = exactly_one(builtin, args, &kwargs)?;
            match value {
                Value::Int(n) => Ok(Value::Float(n as f64)),
                Value::Float(f) => Ok(Value::Float(f)),
                Value::Bool(b) => Ok(Value::Float(b as i64 as f64)),
                Value::Str(s) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| {
                    ScriptError::value(format!("could not convert string to float: '{s}'"))
                }),
                other => Err(ScriptError::type_error(format!(
                    "float() argument must be a number or string, not '{}'",
                    other.type_str()
                ))),
            }
        }
        Builtin::Abs => {
            let value = exactly_one(builtin, args, &kwargs)?;
            match value {
                Value::Int(n) => Ok(Value::Int(n.abs())),
                Value::Float(f) => Ok(Value::Float(f.abs())),
                other => Err(ScriptError::type_error(format!(
                    "bad operand type for abs(): '{}'",
                    other.type_str()
                ))),
            }
        }
        Builtin::Min | Builtin::Max => {
            reject_kwargs(builtin, &kwargs)?;
            let items = spread_args(builtin, args)?;
            let mut best: Option<Value> = None;
            for item in items {
                best = Some(match best {
                    None => item,
                    Some(current) => {
                        let ordering = compare(&item, &current)?;
                        let take = if builtin == Builtin::Min {
                            ordering.is_lt()
                        } else {
                            ordering.is_gt()
                        };
                        if take { item } else { current }
                    }
                });
            }
            best.ok_or_else(|| {
                ScriptError::value(format!("{}() arg is an empty sequence", builtin.name()))
            })
        }
        Builtin::Sum => {
            let value = exactly_one(builtin, args, &kwargs)?;
            let Value::List(items) = value else {
                return Err(ScriptError::type_error("sum() expects a list"));
            };
            let mut int_total: i64 = 0;
            let mut float_total: f64 = 0.0;
            let mut saw_float = false;
            for item in items.borrow().iter() {
                match item {
                    Value::Int(n) => {
                        int_total += n;
                        float_total += *n as f64;
                    }
                    Value::Float(f) => {
                        saw_float = true;
                        float_total += f;
                    }
                    other => {
                        return Err(ScriptError::type_error(format!(
                            "unsupported operand type for sum(): '{}'",
                            other.type_str()
                        )));
                    }
                }
            }
            if saw_float {
                Ok(Value::Float(float_total))
            } else {
                Ok(Value::Int(int_total))
            }
        }
        Builtin::Sorted => {
            let value = exactly_one(builtin, args, &kwargs)?;
            let Value::List(items) = value else {
                return Err(ScriptError::type_error("sorted() expects a list"));
            };
            let mut sorted = items.borrow().clone();
            let mut failure = None;
            sorted.sort_by(|a, b| match compare(a, b) {
                Ok(ordering) => ordering,
                Err(err) => {
                    failure.get_or_insert(err);
                    std::cmp::Ordering::Equal
                }
            });
            match failure {
                Some(err) => Err(err),
                None => Ok(Value::List(Rc::new(RefCell::new(sorted)))),
            }
        }
        Builtin::Range => {
            reject_kwargs(builtin, &kwargs)?;
            let bounds: Vec<i64> = args
                .iter()
                .map(|value| match value {
                    Value::Int(n) => Ok(*n),
                    other => Err(ScriptError::type_error(format!(
                        "range() arguments must be integers, not '{}'",
                        other.type_str()
                    ))),
                })
                .collect::<Result<_, _>>()?;
            let (start, stop, step) = match bounds.as_slice() {
                [stop] => (0, *stop, 1),
                [start, stop] => (*start, *stop, 1),
                [start, stop, step] => (*start, *stop, *step),
                _ => {
                    return Err(ScriptError::type_error(
                        "range() takes one to three integer arguments",
                    ));
                }
            };
            if step == 0 {
                return Err(ScriptError::value("range() step must not be zero"));
            }
            let mut items = Vec::new();
            let mut current = start;
            while (step > 0 && current < stop) || (step < 0 && current > stop) {
                items.push(Value::Int(current));
                current += step;
            }
            Ok(Value::List(Rc::new(RefCell::new(items))))
        }
        Builtin::FileCapability => {
            reject_positional(builtin, &args)?;
            let mut paths: Option<Vec<String>> = None;
            let mut read_only = false;
            for (name, value) in kwargs {
                match name.as_str() {
                    "paths" => paths = string_list(&value, "paths")?,
                    "read_only" => read_only = as_bool(&value, "read_only")?,
                    other => {
                        return Err(ScriptError::type_error(format!(
                            "FileCapability() got an unexpected keyword argument '{other}'"
                        )));
                    }
                }
            }
            let capability = match paths {
                Some(paths) => FileCapability::new(paths, read_only),
                None => FileCapability::unrestricted(read_only),
            };
            Ok(Value::Capability(Arc::new(capability)))
        }
        Builtin::ShellCapability => {
            reject_positional(builtin, &args)?;
            let mut commands: Option<Vec<String>> = None;
            let mut cwds: Vec<String> = Vec::new();
            let mut paths: Vec<String> = Vec::new();
            let mut timeout = DEFAULT_TIMEOUT;
            let mut deny_operators = false;
            for (name, value) in kwargs {
                match name.as_str() {
                    "commands" => commands = string_list(&value, "commands")?,
                    "cwds" => cwds = string_list(&value, "cwds")?.unwrap_or_default(),
                    "paths" => paths = string_list(&value, "paths")?.unwrap_or_default(),
                    "timeout" => {
                        let seconds = match value {
                            Value::Int(n) if n >= 0 => n as f64,
                            Value::Float(f) if f >= 0.0 => f,
                            other => {
                                return Err(ScriptError::type_error(format!(
                                    "timeout must be a non-negative number, not {}",
                                    repr(&other)
                                )));
                            }
                        };
                        timeout = Duration::from_secs_f64(seconds);
                    }
                    "deny_operators" => deny_operators = as_bool(&value, "deny_operators")?,
                    other => {
                        return Err(ScriptError::type_error(format!(
                            "ShellCapability() got an unexpected keyword argument '{other}'"
                        )));
                    }
                }
            }
            let capability = ShellCapability::new(
                commands,
                cwds.into_iter().map(Into::into).collect(),
                paths.into_iter().map(Into::into).collect(),
                timeout,
                deny_operators,
            );
            Ok(Value::Capability(Arc::new(capability)))
        }
    }
}

fn reject_kwargs(builtin: Builtin, kwargs: &[(String, Value)]) -> Result<(), ScriptError> {
    if kwargs.is_empty() {
        Ok(())
    } else {
        Err(ScriptError::type_error(format!(
            "{}() takes no keyword arguments",
            builtin.name()
        )))
    }
}

fn reject_positional(builtin: Builtin, args: &[Value]) -> Result<(), ScriptError> {
    if args.is_empty() {
        Ok(())
    } else {
        Err(ScriptError::type_error(format!(
            "{}() takes keyword arguments only",
            builtin.name()
        )))
    }
}

fn exactly_one(
    builtin: Builtin,
    args: Vec<Value>,
    kwargs: &[(String, Value)],
) -> Result<Value, ScriptError> {
    reject_kwargs(builtin, kwargs)?;
    let mut args = args;
    if args.len() == 1 {
        Ok(args.remove(0))
    } else {
        Err(ScriptError::type_error(format!(
            "{}() takes exactly one argument ({} given)",
            builtin.name(),
            args.len()
        )))
    }
}

/// `min`/`max` accept either one list or several scalars.
fn spread_args(builtin: Builtin, args: Vec<Value>) -> Result<Vec<Value>, ScriptError> {
    match args.as_slice() {
        [] => Err(ScriptError::type_error(format!(
            "{}() expected at least one argument",
            builtin.name()
        ))),
        [Value::List(items)] => Ok(items.borrow().clone()),
        _ => Ok(args),
    }
}

fn string_list(value: &Value, name: &str) -> Result<Option<Vec<String>>, ScriptError> {
    match value {
        Value::None => Ok(None),
        Value::List(items) => {
            let mut out = Vec::new();
            for item in items.borrow().iter() {
                match item {
                    Value::Str(s) => out.push(s.clone()),
                    other => {
                        return Err(ScriptError::type_error(format!(
                            "'{name}' must be a list of strings, got element {}",
                            repr(other)
                        )));
                    }
                }
            }
            Ok(Some(out))
        }
        other => Err(ScriptError::type_error(format!(
            "'{name}' must be a list of strings, not {}",
            repr(other)
        ))),
    }
}

fn as_bool(value: &Value, name: &str) -> Result<bool, ScriptError> {
    match value {
        Value::Bool(b) => Ok(*b),
        other => Err(ScriptError::type_error(format!(
            "'{name}' must be a boolean, not {}",
            repr(other)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::interp::ast::Stmt;
    use crate::interp::parser::parse;
    use crate::interp::value::to_json_lossy;
    use crate::relay::NoRelay;

    fn eval(globals: &mut BTreeMap<String, Value>, code: &str) -> (serde_json::Value, String) {
        let module = parse(code).expect("parse");
        let mut stdout = String::new();
        let mut relay = NoRelay;
        let mut interp = Interp::new(globals, &mut stdout, &mut relay, &module.source);
        let value = if let [Stmt::Expr(expr)] = module.stmts.as_slice() {
            interp.eval(expr).expect("eval")
        } else {
            interp.exec_module(&module).expect("exec");
            Value::None
        };
        (to_json_lossy(&value), stdout)
    }

    #[test]
    fn print_writes_to_captured_stdout() {
        let mut globals = BTreeMap::new();
        let (_, stdout) = eval(&mut globals, "print('Hello, World!')");
        assert_eq!(stdout, "Hello, World!\n");
        let (_, stdout) = eval(&mut globals, "print(1, 'two', [3])");
        assert_eq!(stdout, "1 two [3]\n");
    }

    #[test]
    fn numeric_builtins() {
        let mut globals = BTreeMap::new();
        assert_eq!(eval(&mut globals, "len('abc')").0, json!(3));
        assert_eq!(eval(&mut globals, "abs(-4)").0, json!(4));
        assert_eq!(eval(&mut globals, "sum([1, 2, 3])").0, json!(6));
        assert_eq!(eval(&mut globals, "min([4, 2, 9])").0, json!(2));
        assert_eq!(eval(&mut globals, "max(1, 7, 3)").0, json!(7));
        assert_eq!(eval(&mut globals, "sorted([3, 1, 2])").0, json!([1, 2, 3]));
        assert_eq!(eval(&mut globals, "range(3)").0, json!([0, 1, 2]));
        assert_eq!(eval(&mut globals, "range(1, 7, 2)").0, json!([1, 3, 5]));
        assert_eq!(eval(&mut globals, "int('12')").0, json!(12));
        assert_eq!(eval(&mut globals, "float(2)").0, json!(2.0));
        assert_eq!(eval(&mut globals, "str(42)").0, json!("42"));
    }

    #[test]
    fn file_capability_constructor_builds_native_object() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let mut globals = BTreeMap::new();
        let code = format!(
            "fs = FileCapability(paths=['{}'], read_only=True)",
            dir.path().display()
        );
        eval(&mut globals, &code);
        let Some(Value::Capability(cap)) = globals.get("fs") else {
            panic!("expected a capability binding");
        };
        assert_eq!(cap.name(), "fs");
        assert!(cap.contract().writes.is_empty());
    }

    #[test]
    fn shell_capability_constructor_applies_allowlist() {
        let mut globals = BTreeMap::new();
        eval(
            &mut globals,
            "cmd = ShellCapability(commands=['echo'], deny_operators=True)",
        );
        let Some(Value::Capability(cap)) = globals.get("cmd") else {
            panic!("expected a capability binding");
        };
        assert_eq!(cap.name(), "shell");
        assert!(cap.contract().executes.contains("shell:echo *"));
    }

    #[test]
    fn constructor_rejects_unknown_kwargs() {
        let module = parse("FileCapability(nope=1)").expect("parse");
        let mut globals = BTreeMap::new();
        let mut stdout = String::new();
        let mut relay = NoRelay;
        let mut interp = Interp::new(&mut globals, &mut stdout, &mut relay, &module.source);
        let [Stmt::Expr(expr)] = module.stmts.as_slice() else {
            panic!("expected expression");
        };
        let err = interp.eval(expr).err().expect("error");
        assert_eq!(err.kind, "TypeError");
    }
}
