//! Sandboxed expression language for decode rules.
//!
//! A rule is a single expression evaluated against the received buffer
//! `buf`. There are no statements, assignments, loops or I/O, so every
//! evaluation terminates in time proportional to the expression size.
//!
//! ```text
//! expr     := compare
//! compare  := bitor (("==" | "!=" | "<" | "<=" | ">" | ">=") bitor)?
//! bitor    := bitxor ("|" bitxor)*
//! bitxor   := bitand ("^" bitand)*
//! bitand   := shift ("&" shift)*
//! shift    := sum (("<<" | ">>") sum)*
//! sum      := product (("+" | "-") product)*
//! product  := unary (("*" | "/" | "//" | "%") unary)*
//! unary    := ("-" | "~") unary | postfix
//! postfix  := primary ("[" expr "]" | "[" expr? ":" expr? "]")*
//! primary  := INT | FLOAT | STRING | NAME | NAME "(" args ")" | "(" expr ")"
//! ```
//!
//! Names: `buf`. Functions: `u16(i)`, `s16(i)` (big-endian at `buf[i]`),
//! `u8(i)`, `s8(i)`, `len([x])`, `hex(x)`, `str(x)`, `int(x)`, `float(x)`,
//! `abs(x)`, `min(a, b)`, `max(a, b)`, `round(x[, digits])`.

use crate::serial::error::ExprError;
use crate::serial::transport::bytes_to_hex;
use std::fmt;

/// Longest accepted expression source, in bytes.
pub const MAX_SOURCE_LEN: usize = 1024;
/// Deepest accepted expression tree.
pub const MAX_DEPTH: usize = 64;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Values
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::Bytes(_) => "bytes",
        }
    }

    fn as_int(&self) -> Result<i64, ExprError> {
        match self {
            Self::Int(v) => Ok(*v),
            other => Err(ExprError::Type(format!(
                "expected int, got {}",
                other.type_name()
            ))),
        }
    }

    fn as_f64(&self) -> Result<f64, ExprError> {
        match self {
            Self::Int(v) => Ok(*v as f64),
            Self::Float(v) => Ok(*v),
            other => Err(ExprError::Type(format!(
                "expected number, got {}",
                other.type_name()
            ))),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Str(s) => f.write_str(s),
            Self::Bytes(b) => f.write_str(&bytes_to_hex(b)),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Lexer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    kind: TokenKind,
    pos: usize,
}

/// Two-character operators first so they win over their prefixes.
const OPERATORS: [&str; 21] = [
    "==", "!=", "<=", ">=", "<<", ">>", "//", "<", ">", "+", "-", "*", "/", "%", "&", "|", "^",
    "~", "(", ")", ",",
];
const BRACKETS: [&str; 3] = ["[", "]", ":"];

struct Lexer<'a> {
    input: &'a str,
    bytes: &'a [u8],
    idx: usize,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            bytes: input.as_bytes(),
            idx: 0,
        }
    }

    fn tokenize(mut self) -> Result<Vec<Token>, ExprError> {
        let mut out = Vec::new();
        loop {
            let token = self.next_token()?;
            let is_eof = matches!(token.kind, TokenKind::Eof);
            out.push(token);
            if is_eof {
                break;
            }
        }
        Ok(out)
    }

    fn syntax(&self, pos: usize, msg: impl Into<String>) -> ExprError {
        ExprError::Syntax {
            pos,
            msg: msg.into(),
        }
    }

    fn next_token(&mut self) -> Result<Token, ExprError> {
        while self.idx < self.bytes.len() && self.bytes[self.idx].is_ascii_whitespace() {
            self.idx += 1;
        }
        let start = self.idx;
        let Some(&b) = self.bytes.get(self.idx) else {
            return Ok(Token {
                kind: TokenKind::Eof,
                pos: start,
            });
        };

        if b.is_ascii_digit() {
            return self.lex_number(start);
        }
        if b == b'"' || b == b'\'' {
            return self.lex_string(start, b);
        }
        if b.is_ascii_alphabetic() || b == b'_' {
            while self.idx < self.bytes.len()
                && (self.bytes[self.idx].is_ascii_alphanumeric() || self.bytes[self.idx] == b'_')
            {
                self.idx += 1;
            }
            return Ok(Token {
                kind: TokenKind::Ident(self.input[start..self.idx].to_string()),
                pos: start,
            });
        }

        let input = self.input;
        let rest = &input[start..];
        for op in OPERATORS.iter().chain(BRACKETS.iter()) {
            if rest.starts_with(op) {
                self.idx += op.len();
                return Ok(Token {
                    kind: TokenKind::Op(*op),
                    pos: start,
                });
            }
        }
        let ch = rest.chars().next().unwrap_or('?');
        Err(self.syntax(start, format!("unexpected character {:?}", ch)))
    }

    fn lex_number(&mut self, start: usize) -> Result<Token, ExprError> {
        let radix = match (self.bytes.get(start), self.bytes.get(start + 1)) {
            (Some(b'0'), Some(b'x' | b'X')) => 16,
            (Some(b'0'), Some(b'b' | b'B')) => 2,
            _ => 10,
        };
        if radix != 10 {
            self.idx += 2;
            let digits_start = self.idx;
            while self.idx < self.bytes.len()
                && (self.bytes[self.idx] as char).is_digit(radix)
            {
                self.idx += 1;
            }
            let digits = &self.input[digits_start..self.idx];
            let value = i64::from_str_radix(digits, radix)
                .map_err(|e| self.syntax(start, format!("bad integer literal: {}", e)))?;
            return Ok(Token {
                kind: TokenKind::Int(value),
                pos: start,
            });
        }

        while self.idx < self.bytes.len() && self.bytes[self.idx].is_ascii_digit() {
            self.idx += 1;
        }
        let is_float = self.bytes.get(self.idx) == Some(&b'.')
            && self
                .bytes
                .get(self.idx + 1)
                .is_some_and(|b| b.is_ascii_digit());
        if is_float {
            self.idx += 1;
            while self.idx < self.bytes.len() && self.bytes[self.idx].is_ascii_digit() {
                self.idx += 1;
            }
            let value: f64 = self.input[start..self.idx]
                .parse()
                .map_err(|_| self.syntax(start, "bad float literal"))?;
            return Ok(Token {
                kind: TokenKind::Float(value),
                pos: start,
            });
        }
        let value: i64 = self.input[start..self.idx]
            .parse()
            .map_err(|_| self.syntax(start, "integer literal out of range"))?;
        Ok(Token {
            kind: TokenKind::Int(value),
            pos: start,
        })
    }

    fn lex_string(&mut self, start: usize, quote: u8) -> Result<Token, ExprError> {
        self.idx += 1;
        let input = self.input;
        let mut out = String::new();
        let mut chars = input[self.idx..].char_indices();
        while let Some((offset, ch)) = chars.next() {
            match ch {
                c if c as u32 == quote as u32 => {
                    self.idx += offset + 1;
                    return Ok(Token {
                        kind: TokenKind::Str(out),
                        pos: start,
                    });
                }
                '\\' => match chars.next() {
                    Some((_, 'n')) => out.push('\n'),
                    Some((_, 't')) => out.push('\t'),
                    Some((_, 'r')) => out.push('\r'),
                    Some((_, other)) => out.push(other),
                    None => break,
                },
                c => out.push(c),
            }
        }
        Err(self.syntax(start, "unterminated string"))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  AST & parser
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Rem,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Lit(Value),
    Name(String),
    Unary(UnOp, Box<Node>),
    Binary(BinOp, Box<Node>, Box<Node>),
    Index(Box<Node>, Box<Node>),
    Slice(Box<Node>, Option<Box<Node>>, Option<Box<Node>>),
    Call(String, Vec<Node>),
}

impl Node {
    fn depth(&self) -> usize {
        1 + match self {
            Node::Lit(_) | Node::Name(_) => 0,
            Node::Unary(_, n) => n.depth(),
            Node::Binary(_, a, b) | Node::Index(a, b) => a.depth().max(b.depth()),
            Node::Slice(a, lo, hi) => a
                .depth()
                .max(lo.as_ref().map_or(0, |n| n.depth()))
                .max(hi.as_ref().map_or(0, |n| n.depth())),
            Node::Call(_, args) => args.iter().map(Node::depth).max().unwrap_or(0),
        }
    }
}

static EOF: TokenKind = TokenKind::Eof;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &TokenKind {
        self.tokens.get(self.pos).map_or(&EOF, |t| &t.kind)
    }

    fn here(&self) -> usize {
        self.tokens.get(self.pos).map_or(0, |t| t.pos)
    }

    fn advance(&mut self) -> TokenKind {
        let kind = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        kind
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if matches!(self.peek(), TokenKind::Op(o) if *o == op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> Result<(), ExprError> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(ExprError::Syntax {
                pos: self.here(),
                msg: format!("expected `{}`", op),
            })
        }
    }

    fn nest<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T, ExprError>) -> Result<T, ExprError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ExprError::TooDeep);
        }
        let out = f(self);
        self.depth -= 1;
        out
    }

    fn parse_expr(&mut self) -> Result<Node, ExprError> {
        self.nest(|p| p.parse_compare())
    }

    fn parse_compare(&mut self) -> Result<Node, ExprError> {
        let lhs = self.parse_bitor()?;
        let op = match self.peek() {
            TokenKind::Op("==") => BinOp::Eq,
            TokenKind::Op("!=") => BinOp::Ne,
            TokenKind::Op("<") => BinOp::Lt,
            TokenKind::Op("<=") => BinOp::Le,
            TokenKind::Op(">") => BinOp::Gt,
            TokenKind::Op(">=") => BinOp::Ge,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.parse_bitor()?;
        Ok(Node::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    /// One left-associative precedence level.
    fn parse_level(
        &mut self,
        ops: &[(&str, BinOp)],
        next: fn(&mut Self) -> Result<Node, ExprError>,
    ) -> Result<Node, ExprError> {
        let mut lhs = next(self)?;
        'outer: loop {
            for (text, op) in ops {
                if self.eat_op(text) {
                    let rhs = next(self)?;
                    lhs = Node::Binary(*op, Box::new(lhs), Box::new(rhs));
                    continue 'outer;
                }
            }
            return Ok(lhs);
        }
    }

    fn parse_bitor(&mut self) -> Result<Node, ExprError> {
        self.parse_level(&[("|", BinOp::BitOr)], Self::parse_bitxor)
    }

    fn parse_bitxor(&mut self) -> Result<Node, ExprError> {
        self.parse_level(&[("^", BinOp::BitXor)], Self::parse_bitand)
    }

    fn parse_bitand(&mut self) -> Result<Node, ExprError> {
        self.parse_level(&[("&", BinOp::BitAnd)], Self::parse_shift)
    }

    fn parse_shift(&mut self) -> Result<Node, ExprError> {
        self.parse_level(&[("<<", BinOp::Shl), (">>", BinOp::Shr)], Self::parse_sum)
    }

    fn parse_sum(&mut self) -> Result<Node, ExprError> {
        self.parse_level(&[("+", BinOp::Add), ("-", BinOp::Sub)], Self::parse_product)
    }

    fn parse_product(&mut self) -> Result<Node, ExprError> {
        self.parse_level(
            &[
                ("*", BinOp::Mul),
                ("//", BinOp::FloorDiv),
                ("/", BinOp::Div),
                ("%", BinOp::Rem),
            ],
            Self::parse_unary,
        )
    }

    fn parse_unary(&mut self) -> Result<Node, ExprError> {
        if self.eat_op("-") {
            return self.nest(|p| Ok(Node::Unary(UnOp::Neg, Box::new(p.parse_unary()?))));
        }
        if self.eat_op("~") {
            return self.nest(|p| Ok(Node::Unary(UnOp::Not, Box::new(p.parse_unary()?))));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Node, ExprError> {
        let mut node = self.parse_primary()?;
        while self.eat_op("[") {
            let lo = if matches!(self.peek(), TokenKind::Op(":")) {
                None
            } else {
                Some(self.parse_expr()?)
            };
            if self.eat_op(":") {
                let hi = if matches!(self.peek(), TokenKind::Op("]")) {
                    None
                } else {
                    Some(Box::new(self.parse_expr()?))
                };
                self.expect_op("]")?;
                node = Node::Slice(Box::new(node), lo.map(Box::new), hi);
            } else {
                self.expect_op("]")?;
                let index = lo.ok_or(ExprError::Syntax {
                    pos: self.here(),
                    msg: "empty index".into(),
                })?;
                node = Node::Index(Box::new(node), Box::new(index));
            }
        }
        Ok(node)
    }

    fn parse_primary(&mut self) -> Result<Node, ExprError> {
        let pos = self.here();
        match self.advance() {
            TokenKind::Int(v) => Ok(Node::Lit(Value::Int(v))),
            TokenKind::Float(v) => Ok(Node::Lit(Value::Float(v))),
            TokenKind::Str(s) => Ok(Node::Lit(Value::Str(s))),
            TokenKind::Ident(name) => {
                if !self.eat_op("(") {
                    return Ok(Node::Name(name));
                }
                let mut args = Vec::new();
                if !self.eat_op(")") {
                    loop {
                        args.push(self.parse_expr()?);
                        if self.eat_op(")") {
                            break;
                        }
                        self.expect_op(",")?;
                    }
                }
                Ok(Node::Call(name, args))
            }
            TokenKind::Op("(") => {
                let inner = self.parse_expr()?;
                self.expect_op(")")?;
                Ok(inner)
            }
            TokenKind::Eof => Err(ExprError::Syntax {
                pos,
                msg: "unexpected end of expression".into(),
            }),
            other => Err(ExprError::Syntax {
                pos,
                msg: format!("unexpected token {:?}", other),
            }),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Compiled expression
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A parsed, ready-to-evaluate decode expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    root: Node,
}

impl Expr {
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        if source.len() > MAX_SOURCE_LEN {
            return Err(ExprError::Syntax {
                pos: MAX_SOURCE_LEN,
                msg: format!("expression longer than {} bytes", MAX_SOURCE_LEN),
            });
        }
        let tokens = Lexer::new(source).tokenize()?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let root = parser.parse_expr()?;
        if !matches!(parser.peek(), TokenKind::Eof) {
            return Err(ExprError::Syntax {
                pos: parser.here(),
                msg: "trailing input".into(),
            });
        }
        if root.depth() > MAX_DEPTH {
            return Err(ExprError::TooDeep);
        }
        Ok(Self { root })
    }

    pub fn eval(&self, buf: &[u8]) -> Result<Value, ExprError> {
        Eval { buf }.node(&self.root)
    }
}

struct Eval<'a> {
    buf: &'a [u8],
}

/// Resolve a possibly negative index against a sequence of `len` items.
fn resolve_index(index: i64, len: usize) -> Result<usize, ExprError> {
    let resolved = if index < 0 { len as i64 + index } else { index };
    if resolved < 0 || resolved >= len as i64 {
        return Err(ExprError::Index { index, len });
    }
    Ok(resolved as usize)
}

fn clamp_bound(bound: i64, len: usize) -> usize {
    let len_i = len as i64;
    let b = if bound < 0 { len_i + bound } else { bound };
    b.clamp(0, len_i) as usize
}

fn overflow() -> ExprError {
    ExprError::Type("integer overflow".into())
}

impl<'a> Eval<'a> {
    fn node(&self, node: &Node) -> Result<Value, ExprError> {
        match node {
            Node::Lit(v) => Ok(v.clone()),
            Node::Name(name) => match name.as_str() {
                "buf" => Ok(Value::Bytes(self.buf.to_vec())),
                _ => Err(ExprError::UnknownName(name.clone())),
            },
            Node::Unary(op, inner) => {
                let v = self.node(inner)?;
                match (op, v) {
                    (UnOp::Neg, Value::Int(i)) => i.checked_neg().map(Value::Int).ok_or_else(overflow),
                    (UnOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
                    (UnOp::Not, Value::Int(i)) => Ok(Value::Int(!i)),
                    (_, other) => Err(ExprError::Type(format!(
                        "bad operand for unary operator: {}",
                        other.type_name()
                    ))),
                }
            }
            Node::Binary(op, lhs, rhs) => {
                let a = self.node(lhs)?;
                let b = self.node(rhs)?;
                binary(*op, a, b)
            }
            Node::Index(target, index) => {
                let target = self.node(target)?;
                let index = self.node(index)?.as_int()?;
                match target {
                    Value::Bytes(bytes) => {
                        Ok(Value::Int(bytes[resolve_index(index, bytes.len())?] as i64))
                    }
                    Value::Str(s) => {
                        let chars: Vec<char> = s.chars().collect();
                        Ok(Value::Str(chars[resolve_index(index, chars.len())?].to_string()))
                    }
                    other => Err(ExprError::Type(format!(
                        "{} is not indexable",
                        other.type_name()
                    ))),
                }
            }
            Node::Slice(target, lo, hi) => {
                let target = self.node(target)?;
                let lo = lo.as_ref().map(|n| self.node(n)?.as_int()).transpose()?;
                let hi = hi.as_ref().map(|n| self.node(n)?.as_int()).transpose()?;
                match target {
                    Value::Bytes(bytes) => {
                        let len = bytes.len();
                        let start = lo.map_or(0, |b| clamp_bound(b, len));
                        let end = hi.map_or(len, |b| clamp_bound(b, len));
                        Ok(Value::Bytes(if start < end {
                            bytes[start..end].to_vec()
                        } else {
                            Vec::new()
                        }))
                    }
                    other => Err(ExprError::Type(format!(
                        "{} cannot be sliced",
                        other.type_name()
                    ))),
                }
            }
            Node::Call(name, args) => {
                let values = args
                    .iter()
                    .map(|a| self.node(a))
                    .collect::<Result<Vec<_>, _>>()?;
                self.call(name, values)
            }
        }
    }

    fn byte_at(&self, index: i64) -> Result<u8, ExprError> {
        Ok(self.buf[resolve_index(index, self.buf.len())?])
    }

    fn word_at(&self, index: i64) -> Result<u16, ExprError> {
        let first = resolve_index(index, self.buf.len())?;
        if first + 1 >= self.buf.len() {
            return Err(ExprError::Index {
                index: index + 1,
                len: self.buf.len(),
            });
        }
        Ok(u16::from_be_bytes([self.buf[first], self.buf[first + 1]]))
    }

    fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, ExprError> {
        let arity = |expected: usize| -> Result<(), ExprError> {
            if args.len() == expected {
                Ok(())
            } else {
                Err(ExprError::Arity {
                    name: name.to_string(),
                    expected,
                    got: args.len(),
                })
            }
        };
        match name {
            "u16" => {
                arity(1)?;
                Ok(Value::Int(self.word_at(args[0].as_int()?)? as i64))
            }
            "s16" => {
                arity(1)?;
                Ok(Value::Int(self.word_at(args[0].as_int()?)? as i16 as i64))
            }
            "u8" => {
                arity(1)?;
                Ok(Value::Int(self.byte_at(args[0].as_int()?)? as i64))
            }
            "s8" => {
                arity(1)?;
                Ok(Value::Int(self.byte_at(args[0].as_int()?)? as i8 as i64))
            }
            "len" => match args.as_slice() {
                [] => Ok(Value::Int(self.buf.len() as i64)),
                [Value::Bytes(b)] => Ok(Value::Int(b.len() as i64)),
                [Value::Str(s)] => Ok(Value::Int(s.chars().count() as i64)),
                [other] => Err(ExprError::Type(format!(
                    "len() of {}",
                    other.type_name()
                ))),
                _ => Err(ExprError::Arity {
                    name: name.to_string(),
                    expected: 1,
                    got: args.len(),
                }),
            },
            "hex" => {
                arity(1)?;
                match &args[0] {
                    Value::Int(v) if *v < 0 => Ok(Value::Str(format!("-0x{:X}", v.unsigned_abs()))),
                    Value::Int(v) => Ok(Value::Str(format!("0x{:X}", v))),
                    Value::Bytes(b) => Ok(Value::Str(bytes_to_hex(b))),
                    other => Err(ExprError::Type(format!("hex() of {}", other.type_name()))),
                }
            }
            "str" => {
                arity(1)?;
                Ok(Value::Str(args[0].to_string()))
            }
            "int" => {
                arity(1)?;
                match &args[0] {
                    Value::Int(v) => Ok(Value::Int(*v)),
                    Value::Float(f) if f.is_finite() => Ok(Value::Int(f.trunc() as i64)),
                    Value::Str(s) => s
                        .trim()
                        .parse()
                        .map(Value::Int)
                        .map_err(|_| ExprError::Type(format!("int() of {:?}", s))),
                    other => Err(ExprError::Type(format!("int() of {}", other.type_name()))),
                }
            }
            "float" => {
                arity(1)?;
                match &args[0] {
                    Value::Str(s) => s
                        .trim()
                        .parse()
                        .map(Value::Float)
                        .map_err(|_| ExprError::Type(format!("float() of {:?}", s))),
                    other => Ok(Value::Float(other.as_f64()?)),
                }
            }
            "abs" => {
                arity(1)?;
                match &args[0] {
                    Value::Int(v) => v.checked_abs().map(Value::Int).ok_or_else(overflow),
                    other => Ok(Value::Float(other.as_f64()?.abs())),
                }
            }
            "min" | "max" => {
                arity(2)?;
                let pick_first = match (&args[0], &args[1]) {
                    (Value::Int(a), Value::Int(b)) => (a <= b) == (name == "min"),
                    (a, b) => (a.as_f64()? <= b.as_f64()?) == (name == "min"),
                };
                let mut args = args;
                Ok(if pick_first { args.swap_remove(0) } else { args.swap_remove(1) })
            }
            "round" => {
                if args.is_empty() || args.len() > 2 {
                    return Err(ExprError::Arity {
                        name: name.to_string(),
                        expected: 1,
                        got: args.len(),
                    });
                }
                let x = args[0].as_f64()?;
                let digits = match args.get(1) {
                    Some(d) => d.as_int()?.clamp(0, 12) as i32,
                    None => 0,
                };
                let scale = 10f64.powi(digits);
                let rounded = (x * scale).round() / scale;
                if args.len() == 1 {
                    Ok(Value::Int(rounded as i64))
                } else {
                    Ok(Value::Float(rounded))
                }
            }
            _ => Err(ExprError::UnknownFunction(name.to_string())),
        }
    }
}

fn compare(op: BinOp, ord: std::cmp::Ordering) -> Value {
    use std::cmp::Ordering::*;
    let result = match op {
        BinOp::Eq => ord == Equal,
        BinOp::Ne => ord != Equal,
        BinOp::Lt => ord == Less,
        BinOp::Le => ord != Greater,
        BinOp::Gt => ord == Greater,
        BinOp::Ge => ord != Less,
        _ => false,
    };
    Value::Int(result as i64)
}

fn binary(op: BinOp, a: Value, b: Value) -> Result<Value, ExprError> {
    use BinOp::*;
    match (op, &a, &b) {
        (Eq | Ne | Lt | Le | Gt | Ge, Value::Str(x), Value::Str(y)) => Ok(compare(op, x.cmp(y))),
        (Eq | Ne | Lt | Le | Gt | Ge, Value::Bytes(x), Value::Bytes(y)) => {
            Ok(compare(op, x.cmp(y)))
        }
        (Eq | Ne | Lt | Le | Gt | Ge, Value::Int(x), Value::Int(y)) => Ok(compare(op, x.cmp(y))),
        (Eq | Ne | Lt | Le | Gt | Ge, _, _) => {
            let (x, y) = (a.as_f64()?, b.as_f64()?);
            match x.partial_cmp(&y) {
                Some(ord) => Ok(compare(op, ord)),
                // NaN compares unequal to everything.
                None => Ok(Value::Int((op == Ne) as i64)),
            }
        }
        (Add, Value::Str(x), Value::Str(y)) => Ok(Value::Str(format!("{}{}", x, y))),
        (Add, Value::Bytes(x), Value::Bytes(y)) => {
            Ok(Value::Bytes(x.iter().chain(y.iter()).copied().collect()))
        }
        (Add | Sub | Mul | FloorDiv | Rem, Value::Int(x), Value::Int(y)) => {
            let (x, y) = (*x, *y);
            let out = match op {
                Add => x.checked_add(y),
                Sub => x.checked_sub(y),
                Mul => x.checked_mul(y),
                FloorDiv | Rem if y == 0 => return Err(ExprError::DivisionByZero),
                FloorDiv => x.checked_div_euclid(y).map(|q| {
                    // Floor rather than Euclid for negative divisors.
                    if y < 0 && x.rem_euclid(y) != 0 { q - 1 } else { q }
                }),
                Rem => x.checked_rem_euclid(y).map(|r| if y < 0 && r != 0 { r + y } else { r }),
                _ => None,
            };
            out.map(Value::Int).ok_or_else(overflow)
        }
        (Add | Sub | Mul | Div | FloorDiv | Rem, _, _) => {
            let (x, y) = (a.as_f64()?, b.as_f64()?);
            if y == 0.0 && matches!(op, Div | FloorDiv | Rem) {
                return Err(ExprError::DivisionByZero);
            }
            Ok(Value::Float(match op {
                Add => x + y,
                Sub => x - y,
                Mul => x * y,
                Div => x / y,
                FloorDiv => (x / y).floor(),
                _ => x - y * (x / y).floor(),
            }))
        }
        (Shl | Shr | BitAnd | BitOr | BitXor, _, _) => {
            let (x, y) = (a.as_int()?, b.as_int()?);
            Ok(Value::Int(match op {
                BitAnd => x & y,
                BitOr => x | y,
                BitXor => x ^ y,
                Shl | Shr => {
                    if !(0..64).contains(&y) {
                        return Err(ExprError::Type(format!("shift count {} out of range", y)));
                    }
                    if op == Shl {
                        x << y
                    } else {
                        x >> y
                    }
                }
                _ => 0,
            }))
        }
    }
}
