//! Typed band-math expressions.
//!
//! Text such as `(nir - red) / (nir + red)` is parsed once into an [`Expr`]
//! tree, then bound against a concrete tile into a flat postfix program that
//! the per-pixel loop runs without any string handling.

use crate::error::{MosaicError, Result};
use crate::raster::RasterTile;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    fn symbol(self) -> char {
        match self {
            BinaryOp::Add => '+',
            BinaryOp::Sub => '-',
            BinaryOp::Mul => '*',
            BinaryOp::Div => '/',
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Const(f64),
    Band(String),
    Neg(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Const(v) => write!(f, "{}", v),
            Expr::Band(name) => write!(f, "{}", name),
            Expr::Neg(inner) => write!(f, "-({})", inner),
            Expr::Binary { op, lhs, rhs } => write!(f, "({} {} {})", lhs, op.symbol(), rhs),
        }
    }
}

/// A parsed expression together with its source text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Expression {
    source: String,
    root: Expr,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            source,
            tokens: &tokens,
            pos: 0,
        };
        let root = parser.expr()?;
        if parser.pos != tokens.len() {
            return Err(invalid(source, format!("unexpected token {:?}", tokens[parser.pos])));
        }
        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn root(&self) -> &Expr {
        &self.root
    }

    /// Distinct band names in order of first reference.
    pub fn band_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        collect_names(&self.root, &mut names);
        names
    }

    /// Resolve band names against `tile` and flatten into a postfix program.
    pub fn bind(&self, tile: &RasterTile) -> Result<BoundExpression> {
        let mut inputs = Vec::new();
        let mut program = Vec::new();
        emit(&self.root, tile, &mut inputs, &mut program)?;

        let mut depth = 0usize;
        let mut max_depth = 0usize;
        for op in &program {
            match op {
                Op::Push(_) | Op::Load(_) => depth += 1,
                Op::Neg => {}
                Op::Binary(_) => depth -= 1,
            }
            max_depth = max_depth.max(depth);
        }

        Ok(BoundExpression {
            inputs,
            program,
            max_depth,
        })
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl TryFrom<String> for Expression {
    type Error = MosaicError;

    fn try_from(value: String) -> Result<Self> {
        Expression::parse(&value)
    }
}

impl From<Expression> for String {
    fn from(value: Expression) -> Self {
        value.source
    }
}

impl std::str::FromStr for Expression {
    type Err = MosaicError;

    fn from_str(s: &str) -> Result<Self> {
        Expression::parse(s)
    }
}

fn collect_names<'a>(expr: &'a Expr, names: &mut Vec<&'a str>) {
    match expr {
        Expr::Const(_) => {}
        Expr::Band(name) => {
            if !names.contains(&name.as_str()) {
                names.push(name);
            }
        }
        Expr::Neg(inner) => collect_names(inner, names),
        Expr::Binary { lhs, rhs, .. } => {
            collect_names(lhs, names);
            collect_names(rhs, names);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
    Push(f64),
    /// Index into [`BoundExpression::inputs`].
    Load(usize),
    Neg,
    Binary(BinaryOp),
}

fn emit(expr: &Expr, tile: &RasterTile, inputs: &mut Vec<usize>, program: &mut Vec<Op>) -> Result<()> {
    match expr {
        Expr::Const(v) => program.push(Op::Push(*v)),
        Expr::Band(name) => {
            let band_idx = tile
                .band_index(name)
                .ok_or_else(|| MosaicError::UnknownBand(name.clone()))?;
            let slot = match inputs.iter().position(|&b| b == band_idx) {
                Some(slot) => slot,
                None => {
                    inputs.push(band_idx);
                    inputs.len() - 1
                }
            };
            program.push(Op::Load(slot));
        }
        Expr::Neg(inner) => {
            emit(inner, tile, inputs, program)?;
            program.push(Op::Neg);
        }
        Expr::Binary { op, lhs, rhs } => {
            emit(lhs, tile, inputs, program)?;
            emit(rhs, tile, inputs, program)?;
            program.push(Op::Binary(*op));
        }
    }
    Ok(())
}

/// An expression resolved against one tile's band layout.
#[derive(Debug, Clone)]
pub struct BoundExpression {
    inputs: Vec<usize>,
    program: Vec<Op>,
    max_depth: usize,
}

impl BoundExpression {
    /// Tile band indices read by the program; `evaluate` expects one value
    /// per entry, in this order.
    pub fn inputs(&self) -> &[usize] {
        &self.inputs
    }

    pub fn stack_capacity(&self) -> usize {
        self.max_depth
    }

    /// Run the program over one pixel's input values. `None` means the
    /// pixel has no defined result: a zero denominator or a non-finite value.
    #[inline]
    pub fn evaluate(&self, values: &[f64], stack: &mut Vec<f64>) -> Option<f64> {
        stack.clear();
        for op in &self.program {
            match *op {
                Op::Push(v) => stack.push(v),
                Op::Load(slot) => stack.push(values[slot]),
                Op::Neg => {
                    let v = stack.pop()?;
                    stack.push(-v);
                }
                Op::Binary(op) => {
                    let rhs = stack.pop()?;
                    let lhs = stack.pop()?;
                    let v = match op {
                        BinaryOp::Add => lhs + rhs,
                        BinaryOp::Sub => lhs - rhs,
                        BinaryOp::Mul => lhs * rhs,
                        BinaryOp::Div => {
                            if rhs == 0.0 {
                                return None;
                            }
                            lhs / rhs
                        }
                    };
                    stack.push(v);
                }
            }
        }
        stack.pop().filter(|v| v.is_finite())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Op(char),
    LParen,
    RParen,
}

fn invalid(source: &str, reason: impl Into<String>) -> MosaicError {
    MosaicError::InvalidExpression {
        expression: source.to_string(),
        reason: reason.into(),
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '+' | '-' | '*' | '/' => {
                tokens.push(Token::Op(c));
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                // exponent: 1e-3, 2.5E4
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| invalid(source, format!("bad number '{}'", text)))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(invalid(source, format!("unexpected character '{}'", other))),
        }
    }

    if tokens.is_empty() {
        return Err(invalid(source, "empty expression"));
    }
    Ok(tokens)
}

struct Parser<'a> {
    source: &'a str,
    tokens: &'a [Token],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn expr(&mut self) -> Result<Expr> {
        let mut lhs = self.term()?;
        while let Some(Token::Op(c @ ('+' | '-'))) = self.peek() {
            let op = if *c == '+' { BinaryOp::Add } else { BinaryOp::Sub };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr> {
        let mut lhs = self.unary()?;
        while let Some(Token::Op(c @ ('*' | '/'))) = self.peek() {
            let op = if *c == '*' { BinaryOp::Mul } else { BinaryOp::Div };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr> {
        match self.peek() {
            Some(Token::Op('-')) => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.unary()?)))
            }
            Some(Token::Op('+')) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Expr> {
        let token = self
            .peek()
            .cloned()
            .ok_or_else(|| invalid(self.source, "unexpected end of expression"))?;
        self.pos += 1;
        match token {
            Token::Number(v) => Ok(Expr::Const(v)),
            Token::Ident(name) => Ok(Expr::Band(name)),
            Token::LParen => {
                let inner = self.expr()?;
                match self.peek() {
                    Some(Token::RParen) => {
                        self.pos += 1;
                        Ok(inner)
                    }
                    _ => Err(invalid(self.source, "missing ')'")),
                }
            }
            other => Err(invalid(self.source, format!("unexpected token {:?}", other))),
        }
    }
}
