//! Compile-once expression VMs used by dynamic rules.
//!
//! The environment is a single string field `Model`. Two entry points exist:
//! [`BoolVm`] for rule `match` expressions and [`StringVm`] for `replace`
//! expressions. Compilation rejects anything whose result kind does not fit,
//! so evaluation itself cannot fail at request time.
//!
//! Grammar (loosest binding first):
//!
//! ```text
//! expr   := and ( ("or" | "||") and )*
//! and    := unary ( ("and" | "&&") unary )*
//! unary  := ("not" | "!") unary | cmp
//! cmp    := concat ( cmpop concat )?
//! cmpop  := "==" | "!=" | "startsWith" | "endsWith" | "contains" | "matches"
//! concat := prim ( "+" prim )*
//! prim   := STRING | "Model" | "true" | "false" | "(" expr ")"
//! ```

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExprError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("type error: {0}")]
    Type(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Str,
    Bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    StartsWith,
    EndsWith,
    Contains,
}

#[derive(Debug)]
enum Node {
    Str(String),
    Model,
    Bool(bool),
    Concat(Box<Node>, Box<Node>),
    Cmp(CmpOp, Box<Node>, Box<Node>),
    Matches(Box<Node>, Regex),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Not(Box<Node>),
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Str(String),
    Bool(bool),
}

impl Node {
    fn kind(&self) -> Kind {
        match self {
            Node::Str(_) | Node::Model | Node::Concat(..) => Kind::Str,
            Node::Bool(_)
            | Node::Cmp(..)
            | Node::Matches(..)
            | Node::And(..)
            | Node::Or(..)
            | Node::Not(_) => Kind::Bool,
        }
    }

    fn eval(&self, model: &str) -> Value {
        match self {
            Node::Str(s) => Value::Str(s.clone()),
            Node::Model => Value::Str(model.to_string()),
            Node::Bool(b) => Value::Bool(*b),
            Node::Concat(a, b) => {
                let mut s = a.eval(model).into_str();
                s.push_str(&b.eval(model).into_str());
                Value::Str(s)
            }
            Node::Cmp(op, a, b) => {
                let a = a.eval(model);
                let b = b.eval(model);
                let r = match (op, &a, &b) {
                    (CmpOp::Eq, _, _) => a == b,
                    (CmpOp::Ne, _, _) => a != b,
                    (CmpOp::StartsWith, Value::Str(x), Value::Str(y)) => x.starts_with(y.as_str()),
                    (CmpOp::EndsWith, Value::Str(x), Value::Str(y)) => x.ends_with(y.as_str()),
                    (CmpOp::Contains, Value::Str(x), Value::Str(y)) => x.contains(y.as_str()),
                    // ruled out by the compile-time kind check
                    _ => false,
                };
                Value::Bool(r)
            }
            Node::Matches(a, re) => Value::Bool(re.is_match(&a.eval(model).into_str())),
            Node::And(a, b) => Value::Bool(a.eval(model).into_bool() && b.eval(model).into_bool()),
            Node::Or(a, b) => Value::Bool(a.eval(model).into_bool() || b.eval(model).into_bool()),
            Node::Not(a) => Value::Bool(!a.eval(model).into_bool()),
        }
    }
}

impl Value {
    fn into_str(self) -> String {
        match self {
            Value::Str(s) => s,
            Value::Bool(b) => b.to_string(),
        }
    }

    fn into_bool(self) -> bool {
        match self {
            Value::Bool(b) => b,
            Value::Str(s) => !s.is_empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Str(String),
    Ident(String),
    Plus,
    EqEq,
    NotEq,
    AndAnd,
    OrOr,
    Bang,
    LParen,
    RParen,
}

fn tokenize(code: &str) -> Result<Vec<Token>, ExprError> {
    let mut out = Vec::new();
    let mut chars = code.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' | '\n' => {
                chars.next();
            }
            '(' => {
                chars.next();
                out.push(Token::LParen);
            }
            ')' => {
                chars.next();
                out.push(Token::RParen);
            }
            '+' => {
                chars.next();
                out.push(Token::Plus);
            }
            '=' => {
                chars.next();
                if chars.next_if_eq(&'=').is_none() {
                    return Err(ExprError::Parse("expected '==' after '='".to_string()));
                }
                out.push(Token::EqEq);
            }
            '!' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    out.push(Token::NotEq);
                } else {
                    out.push(Token::Bang);
                }
            }
            '&' => {
                chars.next();
                if chars.next_if_eq(&'&').is_none() {
                    return Err(ExprError::Parse("expected '&&' after '&'".to_string()));
                }
                out.push(Token::AndAnd);
            }
            '|' => {
                chars.next();
                if chars.next_if_eq(&'|').is_none() {
                    return Err(ExprError::Parse("expected '||' after '|'".to_string()));
                }
                out.push(Token::OrOr);
            }
            '"' | '\'' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        None => {
                            return Err(ExprError::Parse("unterminated string".to_string()));
                        }
                        Some('\\') => match chars.next() {
                            Some('n') => s.push('\n'),
                            Some('t') => s.push('\t'),
                            Some(other) => s.push(other),
                            None => {
                                return Err(ExprError::Parse("unterminated string".to_string()));
                            }
                        },
                        Some(ch) if ch == quote => break,
                        Some(ch) => s.push(ch),
                    }
                }
                out.push(Token::Str(s));
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' {
                        ident.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push(Token::Ident(ident));
            }
            _ => {
                return Err(ExprError::Parse(format!("unexpected character {c:?}")));
            }
        }
    }
    Ok(out)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn eat(&mut self, tok: &Token) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if matches!(self.peek(), Some(Token::Ident(id)) if id == kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expr(&mut self) -> Result<Node, ExprError> {
        let mut lhs = self.and_expr()?;
        while self.eat(&Token::OrOr) || self.eat_keyword("or") {
            let rhs = self.and_expr()?;
            require_kind(&lhs, Kind::Bool, "or")?;
            require_kind(&rhs, Kind::Bool, "or")?;
            lhs = Node::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Node, ExprError> {
        let mut lhs = self.unary()?;
        while self.eat(&Token::AndAnd) || self.eat_keyword("and") {
            let rhs = self.unary()?;
            require_kind(&lhs, Kind::Bool, "and")?;
            require_kind(&rhs, Kind::Bool, "and")?;
            lhs = Node::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Node, ExprError> {
        if self.eat(&Token::Bang) || self.eat_keyword("not") {
            let inner = self.unary()?;
            require_kind(&inner, Kind::Bool, "not")?;
            return Ok(Node::Not(Box::new(inner)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Node, ExprError> {
        let lhs = self.concat()?;

        let op = if self.eat(&Token::EqEq) {
            Some(CmpOp::Eq)
        } else if self.eat(&Token::NotEq) {
            Some(CmpOp::Ne)
        } else if self.eat_keyword("startsWith") {
            Some(CmpOp::StartsWith)
        } else if self.eat_keyword("endsWith") {
            Some(CmpOp::EndsWith)
        } else if self.eat_keyword("contains") {
            Some(CmpOp::Contains)
        } else if self.eat_keyword("matches") {
            let rhs = self.concat()?;
            let Node::Str(pattern) = rhs else {
                return Err(ExprError::Type(
                    "matches requires a literal string pattern".to_string(),
                ));
            };
            require_kind(&lhs, Kind::Str, "matches")?;
            let re = Regex::new(&pattern)
                .map_err(|e| ExprError::Parse(format!("invalid pattern {pattern:?}: {e}")))?;
            return Ok(Node::Matches(Box::new(lhs), re));
        } else {
            None
        };

        let Some(op) = op else {
            return Ok(lhs);
        };

        let rhs = self.concat()?;
        match op {
            CmpOp::Eq | CmpOp::Ne => {
                if lhs.kind() != rhs.kind() {
                    return Err(ExprError::Type(
                        "cannot compare string with bool".to_string(),
                    ));
                }
            }
            _ => {
                require_kind(&lhs, Kind::Str, "string comparison")?;
                require_kind(&rhs, Kind::Str, "string comparison")?;
            }
        }
        Ok(Node::Cmp(op, Box::new(lhs), Box::new(rhs)))
    }

    fn concat(&mut self) -> Result<Node, ExprError> {
        let mut lhs = self.primary()?;
        while self.eat(&Token::Plus) {
            let rhs = self.primary()?;
            require_kind(&lhs, Kind::Str, "+")?;
            require_kind(&rhs, Kind::Str, "+")?;
            lhs = Node::Concat(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn primary(&mut self) -> Result<Node, ExprError> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Node::Str(s)),
            Some(Token::Ident(id)) => match id.as_str() {
                "Model" => Ok(Node::Model),
                "true" => Ok(Node::Bool(true)),
                "false" => Ok(Node::Bool(false)),
                other => Err(ExprError::Parse(format!("unknown identifier {other:?}"))),
            },
            Some(Token::LParen) => {
                let inner = self.expr()?;
                if !self.eat(&Token::RParen) {
                    return Err(ExprError::Parse("expected ')'".to_string()));
                }
                Ok(inner)
            }
            other => Err(ExprError::Parse(format!("unexpected token {other:?}"))),
        }
    }
}

fn require_kind(node: &Node, want: Kind, ctx: &str) -> Result<(), ExprError> {
    if node.kind() != want {
        return Err(ExprError::Type(format!(
            "{ctx} expects a {} operand",
            match want {
                Kind::Str => "string",
                Kind::Bool => "bool",
            }
        )));
    }
    Ok(())
}

fn compile(code: &str, want: Kind) -> Result<Node, ExprError> {
    let tokens = tokenize(code)?;
    let mut parser = Parser { tokens, pos: 0 };
    let node = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(ExprError::Parse(format!(
            "trailing input after expression: {:?}",
            parser.tokens[parser.pos..].to_vec()
        )));
    }
    require_kind(&node, want, "expression result")?;
    Ok(node)
}

/// A `match` expression: `Model → bool`.
#[derive(Debug)]
pub struct BoolVm {
    node: Node,
}

impl BoolVm {
    pub fn compile(code: &str) -> Result<Self, ExprError> {
        Ok(Self {
            node: compile(code, Kind::Bool)?,
        })
    }

    pub fn run(&self, model: &str) -> bool {
        self.node.eval(model).into_bool()
    }
}

/// A `replace` expression: `Model → String`.
#[derive(Debug)]
pub struct StringVm {
    node: Node,
}

impl StringVm {
    pub fn compile(code: &str) -> Result<Self, ExprError> {
        Ok(Self {
            node: compile(code, Kind::Str)?,
        })
    }

    pub fn run(&self, model: &str) -> String {
        self.node.eval(model).into_str()
    }
}
