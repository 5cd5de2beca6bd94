//! Recursive-descent parser over the token stream.

use crate::interp::ast::AugOp;
use crate::interp::ast::BinOp;
use crate::interp::ast::Expr;
use crate::interp::ast::Module;
use crate::interp::ast::ParamSpec;
use crate::interp::ast::Stmt;
use crate::interp::ast::Target;
use crate::interp::ast::UnaryOp;
use crate::interp::error::ScriptError;
use crate::interp::lexer::tokenize;
use crate::interp::token::Tok;
use crate::interp::token::Token;

pub fn parse(source: &str) -> Result<Module, ScriptError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let mut stmts = Vec::new();
    while !parser.check(&Tok::Eof) {
        // Tolerate stray newlines between statements.
        if parser.eat(&Tok::Newline) {
            continue;
        }
        stmts.push(parser.statement()?);
    }
    Ok(Module {
        source: source.to_string(),
        stmts,
    })
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Tok {
        self.tokens
            .get(self.pos)
            .map(|t| &t.tok)
            .unwrap_or(&Tok::Eof)
    }

    fn peek_line(&self) -> usize {
        self.tokens.get(self.pos).map(|t| t.line).unwrap_or(0)
    }

    fn prev_line(&self) -> usize {
        self.tokens
            .get(self.pos.saturating_sub(1))
            .map(|t| t.line)
            .unwrap_or(0)
    }

    /// Line of the most recent non-structural token: the true last line of
    /// a just-parsed block, unlike `prev_line` which may sit on a Dedent
    /// emitted at the start of the following line.
    fn last_content_line(&self) -> usize {
        self.tokens[..self.pos]
            .iter()
            .rev()
            .find(|t| !matches!(t.tok, Tok::Newline | Tok::Indent | Tok::Dedent | Tok::Eof))
            .map(|t| t.line)
            .unwrap_or(0)
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        self.pos += 1;
        tok
    }

    fn check(&self, tok: &Tok) -> bool {
        self.peek() == tok
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.check(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: &Tok, context: &str) -> Result<(), ScriptError> {
        if self.eat(tok) {
            Ok(())
        } else {
            Err(ScriptError::syntax(format!(
                "expected {tok:?} {context} on line {}, found {:?}",
                self.peek_line(),
                self.peek()
            )))
        }
    }

    fn ident(&mut self, context: &str) -> Result<String, ScriptError> {
        match self.advance() {
            Tok::Ident(name) => Ok(name),
            other => Err(ScriptError::syntax(format!(
                "expected a name {context} on line {}, found {other:?}",
                self.prev_line()
            ))),
        }
    }

    fn statement(&mut self) -> Result<Stmt, ScriptError> {
        match self.peek() {
            Tok::Def => self.def_statement(),
            Tok::Class => self.class_statement(),
            Tok::If => self.if_statement(),
            Tok::While => self.while_statement(),
            Tok::For => self.for_statement(),
            _ => {
                let stmt = self.simple_statement()?;
                self.end_of_statement()?;
                Ok(stmt)
            }
        }
    }

    fn end_of_statement(&mut self) -> Result<(), ScriptError> {
        if self.eat(&Tok::Newline) || self.check(&Tok::Eof) || self.check(&Tok::Dedent) {
            Ok(())
        } else {
            Err(ScriptError::syntax(format!(
                "unexpected {:?} on line {}",
                self.peek(),
                self.peek_line()
            )))
        }
    }

    fn simple_statement(&mut self) -> Result<Stmt, ScriptError> {
        match self.peek() {
            Tok::Pass => {
                self.advance();
                Ok(Stmt::Pass)
            }
            Tok::Return => {
                self.advance();
                if self.check(&Tok::Newline) || self.check(&Tok::Eof) || self.check(&Tok::Dedent) {
                    Ok(Stmt::Return(None))
                } else {
                    Ok(Stmt::Return(Some(self.expression()?)))
                }
            }
            _ => {
                let expr = self.expression()?;
                if self.eat(&Tok::Assign) {
                    let target = self.as_target(expr)?;
                    let value = self.expression()?;
                    Ok(Stmt::Assign { target, value })
                } else if let Some(op) = self.aug_op() {
                    let target = self.as_target(expr)?;
                    let value = self.expression()?;
                    Ok(Stmt::AugAssign { target, op, value })
                } else {
                    Ok(Stmt::Expr(expr))
                }
            }
        }
    }

    fn aug_op(&mut self) -> Option<AugOp> {
        let op = match self.peek() {
            Tok::PlusAssign => AugOp::Add,
            Tok::MinusAssign => AugOp::Sub,
            Tok::StarAssign => AugOp::Mul,
            Tok::SlashAssign => AugOp::Div,
            _ => return None,
        };
        self.pos += 1;
        Some(op)
    }

    fn as_target(&self, expr: Expr) -> Result<Target, ScriptError> {
        match expr {
            Expr::Name(name) => Ok(Target::Name(name)),
            Expr::Attribute { object, name } => Ok(Target::Attribute {
                object: *object,
                name,
            }),
            Expr::Index { object, index } => Ok(Target::Index {
                object: *object,
                index: *index,
            }),
            other => Err(ScriptError::syntax(format!(
                "cannot assign to {other:?}"
            ))),
        }
    }

    /// Suite: either an indented block or a single inline statement.
    fn suite(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        self.expect(&Tok::Colon, "before a block")?;
        if self.eat(&Tok::Newline) {
            self.expect(&Tok::Indent, "to open a block")?;
            let mut stmts = Vec::new();
            while !self.eat(&Tok::Dedent) {
                if self.eat(&Tok::Newline) {
                    continue;
                }
                stmts.push(self.statement()?);
            }
            if stmts.is_empty() {
                return Err(ScriptError::syntax("empty block"));
            }
            Ok(stmts)
        } else {
            let stmt = self.simple_statement()?;
            self.end_of_statement()?;
            Ok(vec![stmt])
        }
    }

    fn def_statement(&mut self) -> Result<Stmt, ScriptError> {
        let start = self.peek_line();
        self.expect(&Tok::Def, "")?;
        let name = self.ident("after 'def'")?;
        self.expect(&Tok::LParen, "after the function name")?;
        let mut params = Vec::new();
        while !self.check(&Tok::RParen) {
            let param = self.ident("in the parameter list")?;
            let default = if self.eat(&Tok::Assign) {
                Some(self.expression()?)
            } else {
                None
            };
            params.push(ParamSpec {
                name: param,
                default,
            });
            if !self.eat(&Tok::Comma) {
                break;
            }
        }
        self.expect(&Tok::RParen, "after the parameter list")?;
        let body = self.suite()?;
        let end = self.last_content_line();
        let docstring = leading_docstring(&body);
        Ok(Stmt::Def {
            name,
            params,
            body,
            docstring,
            span: (start, end),
        })
    }

    fn class_statement(&mut self) -> Result<Stmt, ScriptError> {
        let start = self.peek_line();
        self.expect(&Tok::Class, "")?;
        let name = self.ident("after 'class'")?;
        let body = self.suite()?;
        let end = self.last_content_line();
        let docstring = leading_docstring(&body);
        Ok(Stmt::ClassDef {
            name,
            body,
            docstring,
            span: (start, end),
        })
    }

    fn if_statement(&mut self) -> Result<Stmt, ScriptError> {
        self.expect(&Tok::If, "")?;
        let mut branches = Vec::new();
        let condition = self.expression()?;
        branches.push((condition, self.suite()?));
        let mut orelse = Vec::new();
        loop {
            if self.eat(&Tok::Elif) {
                let condition = self.expression()?;
                branches.push((condition, self.suite()?));
            } else if self.eat(&Tok::Else) {
                orelse = self.suite()?;
                break;
            } else {
                break;
            }
        }
        Ok(Stmt::If { branches, orelse })
    }

    fn while_statement(&mut self) -> Result<Stmt, ScriptError> {
        self.expect(&Tok::While, "")?;
        let condition = self.expression()?;
        let body = self.suite()?;
        Ok(Stmt::While { condition, body })
    }

    fn for_statement(&mut self) -> Result<Stmt, ScriptError> {
        self.expect(&Tok::For, "")?;
        let var = self.ident("after 'for'")?;
        self.expect(&Tok::In, "after the loop variable")?;
        let iterable = self.expression()?;
        let body = self.suite()?;
        Ok(Stmt::For {
            var,
            iterable,
            body,
        })
    }

    fn expression(&mut self) -> Result<Expr, ScriptError> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.and_expr()?;
        while self.eat(&Tok::Or) {
            let right = self.and_expr()?;
            left = Expr::Binary {
                op: BinOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.not_expr()?;
        while self.eat(&Tok::And) {
            let right = self.not_expr()?;
            left = Expr::Binary {
                op: BinOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr, ScriptError> {
        if self.eat(&Tok::Not) {
            let operand = self.not_expr()?;
            Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            })
        } else {
            self.comparison()
        }
    }

    fn comparison(&mut self) -> Result<Expr, ScriptError> {
        let left = self.additive()?;
        let op = match self.peek() {
            Tok::Eq => BinOp::Eq,
            Tok::NotEq => BinOp::NotEq,
            Tok::Lt => BinOp::Lt,
            Tok::LtEq => BinOp::LtEq,
            Tok::Gt => BinOp::Gt,
            Tok::GtEq => BinOp::GtEq,
            Tok::In => BinOp::In,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.additive()?;
        Ok(Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn additive(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Tok::Plus => BinOp::Add,
                Tok::Minus => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.multiplicative()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn multiplicative(&mut self) -> Result<Expr, ScriptError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Tok::Star => BinOp::Mul,
                Tok::Slash => BinOp::Div,
                Tok::Percent => BinOp::Mod,
                _ => break,
            };
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ScriptError> {
        if self.eat(&Tok::Minus) {
            let operand = self.unary()?;
            Ok(Expr::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(operand),
            })
        } else {
            self.postfix()
        }
    }

    fn postfix(&mut self) -> Result<Expr, ScriptError> {
        let mut expr = self.atom()?;
        loop {
            if self.eat(&Tok::LParen) {
                let (args, kwargs) = self.call_arguments()?;
                expr = Expr::Call {
                    callee: Box::new(expr),
                    args,
                    kwargs,
                };
            } else if self.eat(&Tok::Dot) {
                let name = self.ident("after '.'")?;
                expr = Expr::Attribute {
                    object: Box::new(expr),
                    name,
                };
            } else if self.eat(&Tok::LBracket) {
                let index = self.expression()?;
                self.expect(&Tok::RBracket, "after an index")?;
                expr = Expr::Index {
                    object: Box::new(expr),
                    index: Box::new(index),
                };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn call_arguments(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>), ScriptError> {
        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();
        while !self.check(&Tok::RParen) {
            // A keyword argument is `name=value`; look ahead for the '='.
            if let Tok::Ident(name) = self.peek().clone() {
                if self.tokens.get(self.pos + 1).map(|t| &t.tok) == Some(&Tok::Assign) {
                    self.pos += 2;
                    let value = self.expression()?;
                    kwargs.push((name, value));
                    if !self.eat(&Tok::Comma) {
                        break;
                    }
                    continue;
                }
            }
            if !kwargs.is_empty() {
                return Err(ScriptError::syntax(
                    "positional argument follows keyword argument",
                ));
            }
            args.push(self.expression()?);
            if !self.eat(&Tok::Comma) {
                break;
            }
        }
        self.expect(&Tok::RParen, "after call arguments")?;
        Ok((args, kwargs))
    }

    fn atom(&mut self) -> Result<Expr, ScriptError> {
        match self.advance() {
            Tok::None => Ok(Expr::None),
            Tok::True => Ok(Expr::Bool(true)),
            Tok::False => Ok(Expr::Bool(false)),
            Tok::Int(n) => Ok(Expr::Int(n)),
            Tok::Float(f) => Ok(Expr::Float(f)),
            Tok::Str(s) => Ok(Expr::Str(s)),
            Tok::Ident(name) => Ok(Expr::Name(name)),
            Tok::LParen => {
                let expr = self.expression()?;
                self.expect(&Tok::RParen, "to close a parenthesized expression")?;
                Ok(expr)
            }
            Tok::LBracket => {
                let mut items = Vec::new();
                while !self.check(&Tok::RBracket) {
                    items.push(self.expression()?);
                    if !self.eat(&Tok::Comma) {
                        break;
                    }
                }
                self.expect(&Tok::RBracket, "to close a list")?;
                Ok(Expr::List(items))
            }
            Tok::LBrace => {
                let mut entries = Vec::new();
                while !self.check(&Tok::RBrace) {
                    let key = self.expression()?;
                    self.expect(&Tok::Colon, "after a dict key")?;
                    let value = self.expression()?;
                    entries.push((key, value));
                    if !self.eat(&Tok::Comma) {
                        break;
                    }
                }
                self.expect(&Tok::RBrace, "to close a dict")?;
                Ok(Expr::Dict(entries))
            }
            other => Err(ScriptError::syntax(format!(
                "unexpected {other:?} on line {}",
                self.prev_line()
            ))),
        }
    }
}

fn leading_docstring(body: &[Stmt]) -> String {
    match body.first() {
        Some(Stmt::Expr(Expr::Str(text))) => text
            .trim()
            .lines()
            .next()
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    }
}
