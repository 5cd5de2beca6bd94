//! Tree-walking evaluator.
//!
//! The evaluator owns no state of its own: it runs against the session's
//! global namespace, a stdout capture buffer, and a relay port for calls
//! that must traverse the host. Function calls push local scopes; name
//! resolution is locals, then globals, then builtins.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::builtins;
use crate::interp::ast::AugOp;
use crate::interp::ast::BinOp;
use crate::interp::ast::Expr;
use crate::interp::ast::Module;
use crate::interp::ast::Stmt;
use crate::interp::ast::Target;
use crate::interp::ast::UnaryOp;
use crate::interp::error::ScriptError;
use crate::interp::value::BoundMethod;
use crate::interp::value::Builtin;
use crate::interp::value::ClassDef;
use crate::interp::value::FunctionDef;
use crate::interp::value::Instance;
use crate::interp::value::Param;
use crate::interp::value::Receiver;
use crate::interp::value::Value;
use crate::interp::value::from_json;
use crate::interp::value::repr;
use crate::interp::value::to_json_strict;
use crate::relay::RelayPort;

const MAX_CALL_DEPTH: usize = 200;

pub enum Flow {
    Normal,
    Return(Value),
}

pub struct Interp<'a> {
    pub globals: &'a mut BTreeMap<String, Value>,
    pub stdout: &'a mut String,
    pub relay: &'a mut dyn RelayPort,
    source: Rc<str>,
    locals: Vec<BTreeMap<String, Value>>,
    depth: usize,
}

impl<'a> Interp<'a> {
    pub fn new(
        globals: &'a mut BTreeMap<String, Value>,
        stdout: &'a mut String,
        relay: &'a mut dyn RelayPort,
        source: &str,
    ) -> Self {
        Self {
            globals,
            stdout,
            relay,
            source: Rc::from(source),
            locals: Vec::new(),
            depth: 0,
        }
    }

    /// Execute a parsed block for effect.
    pub fn exec_module(&mut self, module: &Module) -> Result<(), ScriptError> {
        self.exec_stmts(&module.stmts)?;
        Ok(())
    }

    pub fn exec_stmts(&mut self, stmts: &[Stmt]) -> Result<Flow, ScriptError> {
        for stmt in stmts {
            match self.exec_stmt(stmt)? {
                Flow::Normal => {}
                flow @ Flow::Return(_) => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn slice_source(&self, span: (usize, usize)) -> String {
        let module = Module {
            source: self.source.to_string(),
            stmts: Vec::new(),
        };
        module.slice(span)
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> Result<Flow, ScriptError> {
        match stmt {
            Stmt::Expr(expr) => {
                self.eval(expr)?;
                Ok(Flow::Normal)
            }
            Stmt::Assign { target, value } => {
                let value = self.eval(value)?;
                self.assign(target, value)?;
                Ok(Flow::Normal)
            }
            Stmt::AugAssign { target, op, value } => {
                let current = self.load_target(target)?;
                let rhs = self.eval(value)?;
                let binop = match op {
                    AugOp::Add => BinOp::Add,
                    AugOp::Sub => BinOp::Sub,
                    AugOp::Mul => BinOp::Mul,
                    AugOp::Div => BinOp::Div,
                };
                let combined = binary(binop, current, rhs)?;
                self.assign(target, combined)?;
                Ok(Flow::Normal)
            }
            Stmt::Return(expr) => {
                if self.locals.is_empty() {
                    return Err(ScriptError::syntax("'return' outside function"));
                }
                let value = match expr {
                    Some(expr) => self.eval(expr)?,
                    None => Value::None,
                };
                Ok(Flow::Return(value))
            }
            Stmt::Pass => Ok(Flow::Normal),
            Stmt::If { branches, orelse } => {
                for (condition, body) in branches {
                    if self.eval(condition)?.truthy() {
                        return self.exec_stmts(body);
                    }
                }
                self.exec_stmts(orelse)
            }
            Stmt::While { condition, body } => {
                while self.eval(condition)?.truthy() {
                    if let flow @ Flow::Return(_) = self.exec_stmts(body)? {
                        return Ok(flow);
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::For {
                var,
                iterable,
                body,
            } => {
                let items = self.iterate(iterable)?;
                for item in items {
                    self.bind(var.clone(), item);
                    if let flow @ Flow::Return(_) = self.exec_stmts(body)? {
                        return Ok(flow);
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::Def {
                name,
                params,
                body,
                docstring,
                span,
            } => {
                let mut bound_params = Vec::with_capacity(params.len());
                for param in params {
                    let default = match &param.default {
                        Some(expr) => Some(self.eval(expr)?),
                        None => None,
                    };
                    bound_params.push(Param {
                        name: param.name.clone(),
                        default,
                    });
                }
                let func = FunctionDef {
                    name: name.clone(),
                    params: bound_params,
                    body: body.clone(),
                    source: self.slice_source(*span),
                    docstring: docstring.clone(),
                };
                self.bind(name.clone(), Value::Function(Rc::new(func)));
                Ok(Flow::Normal)
            }
            Stmt::ClassDef {
                name,
                body,
                docstring,
                span,
            } => {
                let class = self.build_class(name, body, docstring, *span)?;
                self.bind(name.clone(), Value::Class(Rc::new(class)));
                Ok(Flow::Normal)
            }
        }
    }

    fn build_class(
        &mut self,
        name: &str,
        body: &[Stmt],
        docstring: &str,
        span: (usize, usize),
    ) -> Result<ClassDef, ScriptError> {
        let mut attrs = BTreeMap::new();
        let mut methods = BTreeMap::new();
        for stmt in body {
            match stmt {
                Stmt::Def {
                    name: method_name,
                    params,
                    body: method_body,
                    docstring: method_doc,
                    span: method_span,
                } => {
                    let mut bound_params = Vec::with_capacity(params.len());
                    for param in params {
                        let default = match &param.default {
                            Some(expr) => Some(self.eval(expr)?),
                            None => None,
                        };
                        bound_params.push(Param {
                            name: param.name.clone(),
                            default,
                        });
                    }
                    methods.insert(
                        method_name.clone(),
                        Rc::new(FunctionDef {
                            name: method_name.clone(),
                            params: bound_params,
                            body: method_body.clone(),
                            source: self.slice_source(*method_span),
                            docstring: method_doc.clone(),
                        }),
                    );
                }
                Stmt::Assign {
                    target: Target::Name(attr),
                    value,
                } => {
                    let value = self.eval(value)?;
                    attrs.insert(attr.clone(), value);
                }
                Stmt::Expr(Expr::Str(_)) | Stmt::Pass => {}
                other => {
                    return Err(ScriptError::syntax(format!(
                        "unsupported statement in class body: {other:?}"
                    )));
                }
            }
        }
        Ok(ClassDef {
            name: name.to_string(),
            attrs,
            methods,
            source: self.slice_source(span),
            docstring: docstring.to_string(),
        })
    }

    fn iterate(&mut self, iterable: &Expr) -> Result<Vec<Value>, ScriptError> {
        match self.eval(iterable)? {
            Value::List(items) => Ok(items.borrow().clone()),
            Value::Str(s) => Ok(s.chars().map(|c| Value::Str(c.to_string())).collect()),
            Value::Dict(entries) => Ok(entries
                .borrow()
                .keys()
                .map(|k| Value::Str(k.clone()))
                .collect()),
            other => Err(ScriptError::type_error(format!(
                "'{}' object is not iterable",
                other.type_str()
            ))),
        }
    }

    fn bind(&mut self, name: String, value: Value) {
        match self.locals.last_mut() {
            Some(scope) => {
                scope.insert(name, value);
            }
            None => {
                self.globals.insert(name, value);
            }
        }
    }

    fn lookup(&self, name: &str) -> Result<Value, ScriptError> {
        if let Some(scope) = self.locals.last() {
            if let Some(value) = scope.get(name) {
                return Ok(value.clone());
            }
        }
        if let Some(value) = self.globals.get(name) {
            return Ok(value.clone());
        }
        if let Some(builtin) = Builtin::lookup(name) {
            return Ok(Value::Builtin(builtin));
        }
        Err(ScriptError::name(name))
    }

    fn assign(&mut self, target: &Target, value: Value) -> Result<(), ScriptError> {
        match target {
            Target::Name(name) => {
                self.bind(name.clone(), value);
                Ok(())
            }
            Target::Attribute { object, name } => {
                let object = self.eval(object)?;
                match object {
                    Value::Instance(instance) => {
                        instance.borrow_mut().fields.insert(name.clone(), value);
                        Ok(())
                    }
                    other => Err(ScriptError::attribute(format!(
                        "cannot set attribute '{name}' on '{}' object",
                        other.type_str()
                    ))),
                }
            }
            Target::Index { object, index } => {
                let object = self.eval(object)?;
                let index = self.eval(index)?;
                match (object, index) {
                    (Value::List(items), Value::Int(i)) => {
                        let mut items = items.borrow_mut();
                        let idx = normalize_index(i, items.len())?;
                        items[idx] = value;
                        Ok(())
                    }
                    (Value::Dict(entries), Value::Str(key)) => {
                        entries.borrow_mut().insert(key, value);
                        Ok(())
                    }
                    (object, index) => Err(ScriptError::type_error(format!(
                        "cannot index '{}' with '{}'",
                        object.type_str(),
                        index.type_str()
                    ))),
                }
            }
        }
    }

    fn load_target(&mut self, target: &Target) -> Result<Value, ScriptError> {
        match target {
            Target::Name(name) => self.lookup(name),
            Target::Attribute { object, name } => {
                let object = self.eval(object)?;
                self.get_attribute(object, name)
            }
            Target::Index { object, index } => {
                let object = self.eval(object)?;
                let index = self.eval(index)?;
                index_value(&object, &index)
            }
        }
    }

    pub fn eval(&mut self, expr: &Expr) -> Result<Value, ScriptError> {
        match expr {
            Expr::None => Ok(Value::None),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Int(n) => Ok(Value::Int(*n)),
            Expr::Float(f) => Ok(Value::Float(*f)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Name(name) => self.lookup(name),
            Expr::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item)?);
                }
                Ok(Value::List(Rc::new(RefCell::new(values))))
            }
            Expr::Dict(entries) => {
                let mut map = BTreeMap::new();
                for (key, value) in entries {
                    let key = match self.eval(key)? {
                        Value::Str(s) => s,
                        other => {
                            return Err(ScriptError::type_error(format!(
                                "dict keys must be strings, got '{}'",
                                other.type_str()
                            )));
                        }
                    };
                    map.insert(key, self.eval(value)?);
                }
                Ok(Value::Dict(Rc::new(RefCell::new(map))))
            }
            Expr::Unary { op, operand } => {
                let value = self.eval(operand)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!value.truthy())),
                    UnaryOp::Neg => match value {
                        Value::Int(n) => Ok(Value::Int(-n)),
                        Value::Float(f) => Ok(Value::Float(-f)),
                        other => Err(ScriptError::type_error(format!(
                            "bad operand type for unary -: '{}'",
                            other.type_str()
                        ))),
                    },
                }
            }
            Expr::Binary { op, left, right } => match op {
                BinOp::And => {
                    let left = self.eval(left)?;
                    if left.truthy() {
                        self.eval(right)
                    } else {
                        Ok(left)
                    }
                }
                BinOp::Or => {
                    let left = self.eval(left)?;
                    if left.truthy() {
                        Ok(left)
                    } else {
                        self.eval(right)
                    }
                }
                _ => {
                    let left = self.eval(left)?;
                    let right = self.eval(right)?;
                    binary(*op, left, right)
                }
            },
            Expr::Attribute { object, name } => {
                let object = self.eval(object)?;
                self.get_attribute(object, name)
            }
            Expr::Index { object, index } => {
                let object = self.eval(object)?;
                let index = self.eval(index)?;
                index_value(&object, &index)
            }
            Expr::Call {
                callee,
                args,
                kwargs,
            } => {
                let callee = self.eval(callee)?;
                let mut arg_values = Vec::with_capacity(args.len());
                for arg in args {
                    arg_values.push(self.eval(arg)?);
                }
                let mut kwarg_values = Vec::with_capacity(kwargs.len());
                for (name, expr) in kwargs {
                    kwarg_values.push((name.clone(), self.eval(expr)?));
                }
                self.call_value(callee, arg_values, kwarg_values)
            }
        }
    }

    fn get_attribute(&mut self, object: Value, name: &str) -> Result<Value, ScriptError> {
        match object {
            Value::Instance(instance) => {
                {
                    let borrowed = instance.borrow();
                    if let Some(value) = borrowed.fields.get(name) {
                        return Ok(value.clone());
                    }
                    if let Some(method) = borrowed.class.methods.get(name) {
                        let method = Rc::clone(method);
                        drop(borrowed);
                        return Ok(Value::Method(Rc::new(BoundMethod {
                            receiver: Receiver::Instance(Rc::clone(&instance), method),
                            name: name.to_string(),
                        })));
                    }
                    if let Some(value) = borrowed.class.attrs.get(name) {
                        return Ok(value.clone());
                    }
                }
                Err(ScriptError::attribute(format!(
                    "'{}' object has no attribute '{name}'",
                    instance.borrow().class.name
                )))
            }
            Value::Class(class) => {
                if let Some(value) = class.attrs.get(name) {
                    return Ok(value.clone());
                }
                Err(ScriptError::attribute(format!(
                    "type object '{}' has no attribute '{name}'",
                    class.name
                )))
            }
            Value::Capability(cap) => {
                match name {
                    "name" => return Ok(Value::Str(cap.name().to_string())),
                    "description" => return Ok(Value::Str(cap.description().to_string())),
                    _ => {}
                }
                let known = cap.operations().iter().any(|op| op.name == name) || name == "derive";
                if known {
                    Ok(Value::Method(Rc::new(BoundMethod {
                        receiver: Receiver::Capability(cap),
                        name: name.to_string(),
                    })))
                } else {
                    Err(cap.unknown_method(name).into())
                }
            }
            Value::Relay(relay) => {
                match name {
                    "name" => return Ok(Value::Str(relay.name.clone())),
                    "description" => return Ok(Value::Str(relay.description())),
                    _ => {}
                }
                if name == "describe" || relay.tools.contains_key(name) {
                    Ok(Value::Method(Rc::new(BoundMethod {
                        receiver: Receiver::Relay(relay),
                        name: name.to_string(),
                    })))
                } else {
                    let available = relay.tools.keys().cloned().collect::<Vec<_>>().join(", ");
                    Err(ScriptError::attribute(format!(
                        "'{}' has no method '{name}'. Available: {available}",
                        relay.name
                    )))
                }
            }
            other => Err(ScriptError::attribute(format!(
                "'{}' object has no attribute '{name}'",
                other.type_str()
            ))),
        }
    }

    pub fn call_value(
        &mut self,
        callee: Value,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, ScriptError> {
        match callee {
            Value::Function(func) => self.call_function(&func, args, kwargs),
            Value::Builtin(builtin) => builtins::call_builtin(self, builtin, args, kwargs),
            Value::Class(class) => self.instantiate(&class, args, kwargs),
            Value::Method(method) => match &method.receiver {
                Receiver::Instance(instance, func) => {
                    let mut full_args = Vec::with_capacity(args.len() + 1);
                    full_args.push(Value::Instance(Rc::clone(instance)));
                    full_args.extend(args);
                    self.call_function(func, full_args, kwargs)
                }
                Receiver::Capability(cap) => {
                    self.call_capability(cap.as_ref(), &method.name, args, kwargs)
                }
                Receiver::Relay(relay) => {
                    self.call_relay(relay, &method.name, args, kwargs)
                }
            },
            other => Err(ScriptError::type_error(format!(
                "'{}' object is not callable",
                other.type_str()
            ))),
        }
    }

    fn call_function(
        &mut self,
        func: &Rc<FunctionDef>,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, ScriptError> {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(ScriptError::new(
                "RecursionError",
                "maximum call depth exceeded",
            ));
        }
        if args.len() > func.params.len() {
            return Err(ScriptError::type_error(format!(
                "{}() takes {} arguments but {} were given",
                func.name,
                func.params.len(),
                args.len()
            )));
        }

        let mut scope = BTreeMap::new();
        let mut args = args.into_iter();
        for param in &func.params {
            if let Some(value) = args.next() {
                scope.insert(param.name.clone(), value);
                continue;
            }
            if let Some((_, value)) = kwargs.iter().find(|(name, _)| name == &param.name) {
                scope.insert(param.name.clone(), value.clone());
                continue;
            }
            if let Some(default) = &param.default {
                scope.insert(param.name.clone(), default.clone());
                continue;
            }
            return Err(ScriptError::type_error(format!(
                "{}() missing required argument: '{}'",
                func.name, param.name
            )));
        }
        for (name, _) in &kwargs {
            if !func.params.iter().any(|p| &p.name == name) {
                return Err(ScriptError::type_error(format!(
                    "{}() got an unexpected keyword argument '{name}'",
                    func.name
                )));
            }
        }

        self.locals.push(scope);
        self.depth += 1;
        let result = self.exec_stmts(&func.body);
        self.depth -= 1;
        self.locals.pop();

        match result? {
            Flow::Return(value) => Ok(value),
            Flow::Normal => Ok(Value::None),
        }
    }

    fn instantiate(
        &mut self,
        class: &Rc<ClassDef>,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, ScriptError> {
        let instance = Rc::new(RefCell::new(Instance {
            class: Rc::clone(class),
            fields: BTreeMap::new(),
        }));
        if let Some(init) = class.methods.get("__init__") {
            let init = Rc::clone(init);
            let mut full_args = Vec::with_capacity(args.len() + 1);
            full_args.push(Value::Instance(Rc::clone(&instance)));
            full_args.extend(args);
            self.call_function(&init, full_args, kwargs)?;
        } else if !args.is_empty() || !kwargs.is_empty() {
            return Err(ScriptError::type_error(format!(
                "{}() takes no arguments",
                class.name
            )));
        }
        Ok(Value::Instance(instance))
    }

    fn call_capability(
        &mut self,
        cap: &dyn capstan_core::Capability,
        method: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, ScriptError> {
        let params: Vec<&'static str> = cap
            .operations()
            .iter()
            .find(|op| op.name == method)
            .map(|op| op.params.to_vec())
            .unwrap_or_else(|| vec!["read_only", "paths", "commands", "cwds", "timeout", "deny_operators"]);

        let mut arguments = serde_json::Map::new();
        for (position, value) in args.iter().enumerate() {
            let Some(param) = params.get(position) else {
                return Err(ScriptError::type_error(format!(
                    "{method}() takes at most {} positional arguments",
                    params.len()
                )));
            };
            arguments.insert((*param).to_string(), serialize_argument(value, param)?);
        }
        for (name, value) in &kwargs {
            arguments.insert(name.clone(), serialize_argument(value, name)?);
        }

        if method == "derive" {
            let derived = cap.derive(&arguments)?;
            return Ok(Value::Capability(derived));
        }
        let result = cap.invoke(method, &arguments)?;
        Ok(from_json(&result))
    }

    fn call_relay(
        &mut self,
        relay: &Rc<crate::interp::value::RelayCapability>,
        method: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, ScriptError> {
        if method == "describe" {
            return Ok(Value::Str(relay.describe()));
        }
        if !args.is_empty() {
            return Err(ScriptError::type_error(format!(
                "relay method {method}() takes keyword arguments only"
            )));
        }
        let mut arguments = serde_json::Map::new();
        for (name, value) in &kwargs {
            arguments.insert(name.clone(), serialize_argument(value, name)?);
        }
        let result = self.relay.call(&relay.name, method, arguments)?;
        Ok(from_json(&result))
    }

    /// `print` and friends need the capture buffer.
    pub fn write_stdout(&mut self, text: &str) {
        self.stdout.push_str(text);
    }
}

fn serialize_argument(value: &Value, name: &str) -> Result<serde_json::Value, ScriptError> {
    to_json_strict(value).ok_or_else(|| {
        ScriptError::type_error(format!(
            "argument '{name}' is not serializable: {}",
            repr(value)
        ))
    })
}

fn normalize_index(index: i64, len: usize) -> Result<usize, ScriptError> {
    let len = len as i64;
    let adjusted = if index < 0 { index + len } else { index };
    if adjusted < 0 || adjusted >= len {
        Err(ScriptError::new("IndexError", "list index out of range"))
    } else {
        Ok(adjusted as usize)
    }
}

pub fn index_value(object: &Value, index: &Value) -> Result<Value, ScriptError> {
    match (object, index) {
        (Value::List(items), Value::Int(i)) => {
            let items = items.borrow();
            let idx = normalize_index(*i, items.len())?;
            Ok(items[idx].clone())
        }
        (Value::Str(s), Value::Int(i)) => {
            let chars: Vec<char> = s.chars().collect();
            let idx = normalize_index(*i, chars.len())?;
            Ok(Value::Str(chars[idx].to_string()))
        }
        (Value::Dict(entries), Value::Str(key)) => entries
            .borrow()
            .get(key)
            .cloned()
            .ok_or_else(|| ScriptError::new("KeyError", format!("'{key}'"))),
        (object, index) => Err(ScriptError::type_error(format!(
            "cannot index '{}' with '{}'",
            object.type_str(),
            index.type_str()
        ))),
    }
}

fn binary(op: BinOp, left: Value, right: Value) -> Result<Value, ScriptError> {
    match op {
        BinOp::Add => match (&left, &right) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a + b)),
            (Value::Str(a), Value::Str(b)) => Ok(Value::Str(format!("{a}{b}"))),
            (Value::List(a), Value::List(b)) => {
                let mut items = a.borrow().clone();
                items.extend(b.borrow().iter().cloned());
                Ok(Value::List(Rc::new(RefCell::new(items))))
            }
            _ => numeric(op, &left, &right),
        },
        BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => match (&left, &right) {
            (Value::Int(a), Value::Int(b)) => match op {
                BinOp::Sub => Ok(Value::Int(a - b)),
                BinOp::Mul => Ok(Value::Int(a * b)),
                BinOp::Div => {
                    if *b == 0 {
                        Err(ScriptError::zero_division())
                    } else {
                        Ok(Value::Float(*a as f64 / *b as f64))
                    }
                }
                BinOp::Mod => {
                    if *b == 0 {
                        Err(ScriptError::new(
                            "ZeroDivisionError",
                            "integer modulo by zero",
                        ))
                    } else {
                        Ok(Value::Int(a.rem_euclid(*b)))
                    }
                }
                _ => unreachable!(),
            },
            _ => numeric(op, &left, &right),
        },
        BinOp::Eq => Ok(Value::Bool(left.eq_value(&right))),
        BinOp::NotEq => Ok(Value::Bool(!left.eq_value(&right))),
        BinOp::Lt | BinOp::LtEq | BinOp::Gt | BinOp::GtEq => {
            let ordering = compare(&left, &right)?;
            let result = match op {
                BinOp::Lt => ordering.is_lt(),
                BinOp::LtEq => ordering.is_le(),
                BinOp::Gt => ordering.is_gt(),
                BinOp::GtEq => ordering.is_ge(),
                _ => unreachable!(),
            };
            Ok(Value::Bool(result))
        }
        BinOp::In => contains(&left, &right),
        BinOp::And | BinOp::Or => unreachable!("short-circuited by the evaluator"),
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Int(n) => Some(*n as f64),
        Value::Float(f) => Some(*f),
        _ => None,
    }
}

fn numeric(op: BinOp, left: &Value, right: &Value) -> Result<Value, ScriptError> {
    let (Some(a), Some(b)) = (as_f64(left), as_f64(right)) else {
        let symbol = match op {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            _ => "?",
        };
        return Err(ScriptError::type_error(format!(
            "unsupported operand types for {symbol}: '{}' and '{}'",
            left.type_str(),
            right.type_str()
        )));
    };
    match op {
        BinOp::Add => Ok(Value::Float(a + b)),
        BinOp::Sub => Ok(Value::Float(a - b)),
        BinOp::Mul => Ok(Value::Float(a * b)),
        BinOp::Div => {
            if b == 0.0 {
                Err(ScriptError::zero_division())
            } else {
                Ok(Value::Float(a / b))
            }
        }
        BinOp::Mod => {
            if b == 0.0 {
                Err(ScriptError::zero_division())
            } else {
                Ok(Value::Float(a.rem_euclid(b)))
            }
        }
        _ => unreachable!(),
    }
}

pub fn compare(left: &Value, right: &Value) -> Result<std::cmp::Ordering, ScriptError> {
    match (left, right) {
        (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
        _ => match (as_f64(left), as_f64(right)) {
            (Some(a), Some(b)) => a.partial_cmp(&b).ok_or_else(|| {
                ScriptError::value("comparison is undefined for NaN".to_string())
            }),
            _ => Err(ScriptError::type_error(format!(
                "'<' not supported between instances of '{}' and '{}'",
                left.type_str(),
                right.type_str()
            ))),
        },
    }
}

fn contains(needle: &Value, haystack: &Value) -> Result<Value, ScriptError> {
    match haystack {
        Value::Str(s) => match needle {
            Value::Str(sub) => Ok(Value::Bool(s.contains(sub.as_str()))),
            other => Err(ScriptError::type_error(format!(
                "'in <str>' requires string as left operand, not '{}'",
                other.type_str()
            ))),
        },
        Value::List(items) => Ok(Value::Bool(
            items.borrow().iter().any(|item| item.eq_value(needle)),
        )),
        Value::Dict(entries) => match needle {
            Value::Str(key) => Ok(Value::Bool(entries.borrow().contains_key(key))),
            _ => Ok(Value::Bool(false)),
        },
        other => Err(ScriptError::type_error(format!(
            "argument of type '{}' is not iterable",
            other.type_str()
        ))),
    }
}
