//! Recursive-descent parser and type checker
//!
//! ```text
//! O -> A {"||" A}
//! A -> C {"&&" C}
//! C -> P {( "==" | "!=" | ">" | ">=" | "<" | "<=" ) P}
//! P -> M {( "+" | "-" ) M}
//! M -> F {( "*" | "/" ) F}
//! F -> number | "(" O ")" | "!" F | "-" F | name "(" args ")"
//! ```
//!
//! Every node is type checked as it is built, so a tree that comes out of
//! [`parse`] is well typed.

use std::fmt;

use super::funcs::{self, Func, Literal};
use super::lexer::{tokenize, Token, TokenKind};
use super::value::Type;
use super::ParseError;
use crate::tsdb::Query;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    pub fn apply(self, a: f64, b: f64) -> f64 {
        let truth = |x: bool| if x { 1.0 } else { 0.0 };
        match self {
            BinaryOp::Or => truth(a != 0.0 || b != 0.0),
            BinaryOp::And => truth(a != 0.0 && b != 0.0),
            BinaryOp::Eq => truth(a == b),
            BinaryOp::Ne => truth(a != b),
            BinaryOp::Gt => truth(a > b),
            BinaryOp::Ge => truth(a >= b),
            BinaryOp::Lt => truth(a < b),
            BinaryOp::Le => truth(a <= b),
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
        }
    }

    fn precedence(self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Gt | BinaryOp::Ge | BinaryOp::Lt | BinaryOp::Le => 3,
            BinaryOp::Add | BinaryOp::Sub => 4,
            BinaryOp::Mul | BinaryOp::Div => 5,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Or => "||",
            BinaryOp::And => "&&",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

impl UnaryOp {
    pub fn apply(self, v: f64) -> f64 {
        match self {
            UnaryOp::Not => {
                if v == 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            UnaryOp::Neg => -v,
        }
    }
}

/// A typed expression tree
#[derive(Debug, Clone)]
pub enum Node {
    Number(f64),
    String(String),
    Query { text: String, query: Query },
    Unary { op: UnaryOp, arg: Box<Node> },
    Binary { op: BinaryOp, lhs: Box<Node>, rhs: Box<Node> },
    Func { func: &'static Func, args: Vec<Node> },
}

impl Node {
    /// Static type of the node
    pub fn return_type(&self) -> Type {
        match self {
            Node::Number(_) => Type::Number,
            Node::String(_) => Type::String,
            Node::Query { .. } => Type::Query,
            Node::Unary { arg, .. } => arg.return_type(),
            Node::Binary { lhs, rhs, .. } => {
                if lhs.return_type() == Type::Series || rhs.return_type() == Type::Series {
                    Type::Series
                } else {
                    Type::Number
                }
            }
            Node::Func { func, .. } => func.ret,
        }
    }

    /// Operators are left-associative, so only a right operand of equal
    /// precedence needs parentheses.
    fn fmt_child(&self, f: &mut fmt::Formatter<'_>, parent: BinaryOp, right: bool) -> fmt::Result {
        match self {
            Node::Binary { op, .. }
                if op.precedence() < parent.precedence()
                    || (right && op.precedence() == parent.precedence()) =>
            {
                write!(f, "({self})")
            }
            _ => write!(f, "{self}"),
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Number(n) => write!(f, "{n}"),
            Node::String(s) => write!(f, "{s:?}"),
            Node::Query { text, .. } => write!(f, "{text:?}"),
            Node::Unary { op, arg } => {
                f.write_str(match op {
                    UnaryOp::Not => "!",
                    UnaryOp::Neg => "-",
                })?;
                match **arg {
                    Node::Binary { .. } => write!(f, "({arg})"),
                    _ => write!(f, "{arg}"),
                }
            }
            Node::Binary { op, lhs, rhs } => {
                lhs.fmt_child(f, *op, false)?;
                write!(f, " {} ", op.symbol())?;
                rhs.fmt_child(f, *op, true)
            }
            Node::Func { func, args } => {
                write!(f, "{}(", func.name)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                f.write_str(")")
            }
        }
    }
}

/// Parse and type check `src`. The root must be a number.
pub fn parse(src: &str) -> Result<Node, ParseError> {
    let mut parser = Parser {
        tokens: tokenize(src)?,
        pos: 0,
    };
    let root = parser.o()?;
    let tok = parser.peek();
    if tok.kind != TokenKind::Eof {
        return Err(ParseError::new(tok.pos, format!("unexpected {:?}", tok.kind)));
    }
    if root.return_type() != Type::Number {
        return Err(ParseError::new(
            0,
            format!("expression must return a number, got {}", root.return_type()),
        ));
    }
    Ok(root)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        // tokenize always ends with Eof
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn next(&mut self) -> Token {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> Result<Token, ParseError> {
        let tok = self.next();
        if tok.kind == kind {
            Ok(tok)
        } else {
            Err(ParseError::new(tok.pos, format!("expected {what}, found {:?}", tok.kind)))
        }
    }

    /// Left-associative chain of `ops` over `operand`
    fn chain(
        &mut self,
        operand: fn(&mut Self) -> Result<Node, ParseError>,
        ops: fn(&TokenKind) -> Option<BinaryOp>,
    ) -> Result<Node, ParseError> {
        let mut lhs = operand(self)?;
        while let Some(op) = ops(&self.peek().kind) {
            let pos = self.next().pos;
            let rhs = operand(self)?;
            lhs = binary(op, lhs, rhs, pos)?;
        }
        Ok(lhs)
    }

    fn o(&mut self) -> Result<Node, ParseError> {
        self.chain(Self::a, |k| matches!(k, TokenKind::Or).then_some(BinaryOp::Or))
    }

    fn a(&mut self) -> Result<Node, ParseError> {
        self.chain(Self::c, |k| matches!(k, TokenKind::And).then_some(BinaryOp::And))
    }

    fn c(&mut self) -> Result<Node, ParseError> {
        self.chain(Self::p, |k| match k {
            TokenKind::Eq => Some(BinaryOp::Eq),
            TokenKind::Ne => Some(BinaryOp::Ne),
            TokenKind::Gt => Some(BinaryOp::Gt),
            TokenKind::Ge => Some(BinaryOp::Ge),
            TokenKind::Lt => Some(BinaryOp::Lt),
            TokenKind::Le => Some(BinaryOp::Le),
            _ => None,
        })
    }

    fn p(&mut self) -> Result<Node, ParseError> {
        self.chain(Self::m, |k| match k {
            TokenKind::Plus => Some(BinaryOp::Add),
            TokenKind::Minus => Some(BinaryOp::Sub),
            _ => None,
        })
    }

    fn m(&mut self) -> Result<Node, ParseError> {
        self.chain(Self::f, |k| match k {
            TokenKind::Star => Some(BinaryOp::Mul),
            TokenKind::Slash => Some(BinaryOp::Div),
            _ => None,
        })
    }

    fn f(&mut self) -> Result<Node, ParseError> {
        let tok = self.next();
        match tok.kind {
            TokenKind::Number(n) => Ok(Node::Number(n)),
            TokenKind::LParen => {
                let inner = self.o()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            kind @ (TokenKind::Not | TokenKind::Minus) => {
                let op = if kind == TokenKind::Not {
                    UnaryOp::Not
                } else {
                    UnaryOp::Neg
                };
                let arg = self.f()?;
                match arg.return_type() {
                    Type::Number | Type::Series => Ok(Node::Unary {
                        op,
                        arg: Box::new(arg),
                    }),
                    other => Err(ParseError::new(
                        tok.pos,
                        format!("unary operator needs a number or series, got {other}"),
                    )),
                }
            }
            TokenKind::Ident(name) => self.call(&name, tok.pos),
            TokenKind::String(_) | TokenKind::Query(_) => Err(ParseError::new(
                tok.pos,
                "string and query literals are only allowed as function arguments",
            )),
            other => Err(ParseError::new(tok.pos, format!("unexpected {other:?}"))),
        }
    }

    /// Function argument: a literal or any sub-expression
    fn arg(&mut self) -> Result<Node, ParseError> {
        match &self.peek().kind {
            TokenKind::String(s) => {
                let s = s.clone();
                self.next();
                Ok(Node::String(s))
            }
            TokenKind::Query(text) => {
                let text = text.clone();
                let pos = self.next().pos;
                let query = text
                    .parse::<Query>()
                    .map_err(|e| ParseError::new(pos, e.to_string()))?;
                Ok(Node::Query { text, query })
            }
            _ => self.o(),
        }
    }

    fn call(&mut self, name: &str, pos: usize) -> Result<Node, ParseError> {
        let func =
            funcs::lookup(name).ok_or_else(|| ParseError::new(pos, format!("unknown function {name:?}")))?;
        self.expect(TokenKind::LParen, "'(' after function name")?;

        let mut args = Vec::new();
        let mut arg_pos = Vec::new();
        if self.peek().kind != TokenKind::RParen {
            loop {
                arg_pos.push(self.peek().pos);
                args.push(self.arg()?);
                if self.peek().kind == TokenKind::Comma {
                    self.next();
                } else {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "')' after arguments")?;

        if args.len() < func.min_args() || args.len() > func.args.len() {
            return Err(ParseError::new(
                pos,
                format!(
                    "{name}: expected {} argument(s), got {}",
                    if func.defaults.is_empty() {
                        func.args.len().to_string()
                    } else {
                        format!("{}..{}", func.min_args(), func.args.len())
                    },
                    args.len()
                ),
            ));
        }
        let supplied = args.len();
        for default in &func.defaults[func.defaults.len() - (func.args.len() - supplied)..] {
            args.push(match default {
                Literal::Str(s) => Node::String((*s).to_string()),
                Literal::Num(n) => Node::Number(*n),
            });
            arg_pos.push(pos);
        }

        let mut checked = Vec::with_capacity(args.len());
        for (i, (arg, want)) in args.into_iter().zip(func.args).enumerate() {
            checked.push(check_arg(func, i, arg, *want, arg_pos[i])?);
        }
        Ok(Node::Func {
            func,
            args: checked,
        })
    }
}

fn binary(op: BinaryOp, lhs: Node, rhs: Node, pos: usize) -> Result<Node, ParseError> {
    let (lt, rt) = (lhs.return_type(), rhs.return_type());
    match (lt, rt) {
        (Type::Number, Type::Number) | (Type::Number, Type::Series) | (Type::Series, Type::Number) => {
            Ok(Node::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            })
        }
        _ => Err(ParseError::new(
            pos,
            format!("operator {} cannot combine {lt} and {rt}", op.symbol()),
        )),
    }
}

fn check_arg(func: &Func, index: usize, arg: Node, want: Type, pos: usize) -> Result<Node, ParseError> {
    let arg = match (arg, want) {
        // A quoted string where a query is expected is parsed as query text.
        (Node::String(text), Type::Query) => {
            let query = text
                .parse::<Query>()
                .map_err(|e| ParseError::new(pos, e.to_string()))?;
            Node::Query { text, query }
        }
        (arg, want) if arg.return_type() == want => arg,
        (arg, want) => {
            return Err(ParseError::new(
                pos,
                format!(
                    "{}: argument {} must be {want}, got {}",
                    func.name,
                    index + 1,
                    arg.return_type()
                ),
            ))
        }
    };

    if func.duration_args().contains(&index) {
        if let Node::String(s) = &arg {
            if !s.is_empty() && humantime::parse_duration(s).is_err() {
                return Err(ParseError::new(
                    pos,
                    format!("{}: invalid duration {s:?}", func.name),
                ));
            }
        }
    }
    Ok(arg)
}
