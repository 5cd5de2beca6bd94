//! Abstract syntax of the session scripting language.

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Name(String),
    List(Vec<Expr>),
    /// Dict literals; keys are string literals or bare identifiers-as-keys
    /// are not allowed, matching the host interpreter's string-keyed dicts.
    Dict(Vec<(Expr, Expr)>),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
    },
    Attribute {
        object: Box<Expr>,
        name: String,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    In,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Name(String),
    Attribute { object: Expr, name: String },
    Index { object: Expr, index: Expr },
}

#[derive(Debug, Clone, PartialEq)]
pub enum AugOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub default: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Expr(Expr),
    Assign {
        target: Target,
        value: Expr,
    },
    AugAssign {
        target: Target,
        op: AugOp,
        value: Expr,
    },
    Return(Option<Expr>),
    Pass,
    If {
        branches: Vec<(Expr, Vec<Stmt>)>,
        orelse: Vec<Stmt>,
    },
    While {
        condition: Expr,
        body: Vec<Stmt>,
    },
    For {
        var: String,
        iterable: Expr,
        body: Vec<Stmt>,
    },
    Def {
        name: String,
        params: Vec<ParamSpec>,
        body: Vec<Stmt>,
        docstring: String,
        /// 1-based inclusive line span of the whole definition, for
        /// definition-time source capture.
        span: (usize, usize),
    },
    ClassDef {
        name: String,
        body: Vec<Stmt>,
        docstring: String,
        span: (usize, usize),
    },
}

/// A parsed block of code plus its original text, so definition spans can
/// be sliced back out.
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    pub source: String,
    pub stmts: Vec<Stmt>,
}

impl Module {
    /// Slice the source lines of an inclusive 1-based span.
    pub fn slice(&self, span: (usize, usize)) -> String {
        let lines: Vec<&str> = self.source.lines().collect();
        let start = span.0.saturating_sub(1);
        let end = span.1.min(lines.len());
        if start >= end {
            return String::new();
        }
        let mut text = lines[start..end].join("\n");
        text.push('\n');
        text
    }
}
