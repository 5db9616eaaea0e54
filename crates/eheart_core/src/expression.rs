//! Read-only expressions over model attributes.
//!
//! Watching variables and `EVAL_MODEL_VAR` queries are plain strings such as
//! `"v - w"`, `"der(v)"` or `"i_ion * 1e3"`. They are parsed once into an AST,
//! compiled to stack bytecode with names resolved against the model's
//! declarations, and then evaluated on array values with broadcasting, so the
//! same bytecode serves a single point and a batch of points.

use thiserror::Error;

use crate::attributes::Attributes;
use crate::diffvar::{scalar, zip_with, Value};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("Syntax error in `{source_text}`: {message}")]
    Syntax {
        source_text: String,
        message: String,
    },

    #[error("Unknown function `{0}`")]
    UnknownFunction(String),

    #[error("`der` expects a differential variable, got `{0}`")]
    NotADiffVar(String),

    #[error("Unknown symbol `{0}`")]
    UnknownSymbol(String),

    #[error("Derivative of `{0}` is not available")]
    MissingDerivative(String),

    #[error("Operands cannot be broadcast together: {left:?} and {right:?}")]
    Broadcast { left: Vec<usize>, right: Vec<usize> },

    #[error("Malformed bytecode")]
    Malformed,
}

/// OpCodes for the stack machine. Every value on the stack is an n-d array.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Pushes a literal number.
    LoadNumber(f64),
    /// Pushes the evaluation time.
    LoadTime,
    /// Pushes the value of a differential variable (by declaration index).
    LoadVar(usize),
    /// Pushes the derivative of a differential variable.
    LoadDerivative(usize),
    /// Pushes the value of a constant (by declaration index).
    LoadConst(usize),
    /// Pushes an observable, looked up by name in `Bytecode::names`.
    LoadObservable(usize),
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Neg,
    Call(Function),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Sin,
    Cos,
    Exp,
    Log,
    Sqrt,
    Abs,
    Tanh,
}

impl Function {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "sin" => Function::Sin,
            "cos" => Function::Cos,
            "exp" => Function::Exp,
            "log" => Function::Log,
            "sqrt" => Function::Sqrt,
            "abs" => Function::Abs,
            "tanh" => Function::Tanh,
            _ => return None,
        })
    }

    fn apply(self, x: f64) -> f64 {
        match self {
            Function::Sin => x.sin(),
            Function::Cos => x.cos(),
            Function::Exp => x.exp(),
            Function::Log => x.ln(),
            Function::Sqrt => x.sqrt(),
            Function::Abs => x.abs(),
            Function::Tanh => x.tanh(),
        }
    }
}

/// A compiled expression, bound to the declarations it was compiled against.
#[derive(Debug, Clone, PartialEq)]
pub struct Bytecode {
    source: String,
    ops: Vec<OpCode>,
    names: Vec<String>,
}

impl Bytecode {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn ops(&self) -> &[OpCode] {
        &self.ops
    }

    /// Evaluate against the values currently loaded in `attrs`.
    ///
    /// `t` is 0-d for a single point or `[N]` for a batch; variables then
    /// carry a matching trailing axis and the result broadcasts accordingly.
    pub fn eval(&self, t: &Value, attrs: &Attributes) -> Result<Value, ExpressionError> {
        let mut stack: Vec<Value> = Vec::with_capacity(8);

        for op in &self.ops {
            match *op {
                OpCode::LoadNumber(x) => stack.push(scalar(x)),
                OpCode::LoadTime => stack.push(t.clone()),
                OpCode::LoadVar(idx) => {
                    let var = attrs.diffvars().get(idx).ok_or(ExpressionError::Malformed)?;
                    stack.push(var.value().clone());
                }
                OpCode::LoadDerivative(idx) => {
                    let var = attrs.diffvars().get(idx).ok_or(ExpressionError::Malformed)?;
                    let der = var
                        .try_derivative()
                        .ok_or_else(|| ExpressionError::MissingDerivative(var.name().to_string()))?;
                    stack.push(der.clone());
                }
                OpCode::LoadConst(idx) => stack.push(scalar(attrs.constant_at(idx))),
                OpCode::LoadObservable(idx) => {
                    let name = self.names.get(idx).ok_or(ExpressionError::Malformed)?;
                    let value = attrs
                        .observable(name)
                        .ok_or_else(|| ExpressionError::UnknownSymbol(name.clone()))?;
                    stack.push(value.clone());
                }
                OpCode::Add => binary(&mut stack, |a, b| a + b)?,
                OpCode::Sub => binary(&mut stack, |a, b| a - b)?,
                OpCode::Mul => binary(&mut stack, |a, b| a * b)?,
                OpCode::Div => binary(&mut stack, |a, b| a / b)?,
                OpCode::Pow => binary(&mut stack, f64::powf)?,
                OpCode::Neg => {
                    let a = stack.pop().ok_or(ExpressionError::Malformed)?;
                    stack.push(a.mapv(|x| -x));
                }
                OpCode::Call(func) => {
                    let a = stack.pop().ok_or(ExpressionError::Malformed)?;
                    stack.push(a.mapv(|x| func.apply(x)));
                }
            }
        }

        let result = stack.pop().ok_or(ExpressionError::Malformed)?;
        if stack.is_empty() {
            Ok(result)
        } else {
            Err(ExpressionError::Malformed)
        }
    }
}

fn binary(stack: &mut Vec<Value>, f: impl Fn(f64, f64) -> f64) -> Result<(), ExpressionError> {
    let b = stack.pop().ok_or(ExpressionError::Malformed)?;
    let a = stack.pop().ok_or(ExpressionError::Malformed)?;
    let result = zip_with(&a, &b, f).map_err(|_| ExpressionError::Broadcast {
        left: a.shape().to_vec(),
        right: b.shape().to_vec(),
    })?;
    stack.push(result);
    Ok(())
}

// --- AST & Parser ---

/// Abstract Syntax Tree nodes for expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Symbol(String),
    Binary(Box<Expr>, BinaryOp, Box<Expr>),
    Neg(Box<Expr>),
    Call(String, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

/// Compiles an AST into `Bytecode`, resolving names against the model's
/// declarations. Names that are neither `t`, a differential variable nor a
/// constant are taken to be observables and looked up when evaluated.
pub struct Compiler<'a> {
    attrs: &'a Attributes,
}

impl<'a> Compiler<'a> {
    pub fn new(attrs: &'a Attributes) -> Self {
        Self { attrs }
    }

    pub fn compile_str(&self, source: &str) -> Result<Bytecode, ExpressionError> {
        let expr = parse(source)?;
        self.compile(source, &expr)
    }

    pub fn compile(&self, source: &str, expr: &Expr) -> Result<Bytecode, ExpressionError> {
        let mut bytecode = Bytecode {
            source: source.to_string(),
            ops: Vec::new(),
            names: Vec::new(),
        };
        self.compile_recursive(expr, &mut bytecode)?;
        Ok(bytecode)
    }

    fn compile_recursive(&self, expr: &Expr, out: &mut Bytecode) -> Result<(), ExpressionError> {
        match expr {
            Expr::Number(n) => out.ops.push(OpCode::LoadNumber(*n)),
            Expr::Symbol(name) => {
                let op = if name == "t" {
                    OpCode::LoadTime
                } else if let Some(idx) = self.attrs.diffvar_index(name) {
                    OpCode::LoadVar(idx)
                } else if let Some(idx) = self.attrs.constant_index(name) {
                    OpCode::LoadConst(idx)
                } else {
                    let idx = match out.names.iter().position(|n| n == name) {
                        Some(idx) => idx,
                        None => {
                            out.names.push(name.clone());
                            out.names.len() - 1
                        }
                    };
                    OpCode::LoadObservable(idx)
                };
                out.ops.push(op);
            }
            Expr::Binary(left, op, right) => {
                self.compile_recursive(left, out)?;
                self.compile_recursive(right, out)?;
                out.ops.push(match op {
                    BinaryOp::Add => OpCode::Add,
                    BinaryOp::Sub => OpCode::Sub,
                    BinaryOp::Mul => OpCode::Mul,
                    BinaryOp::Div => OpCode::Div,
                    BinaryOp::Pow => OpCode::Pow,
                });
            }
            Expr::Neg(operand) => {
                self.compile_recursive(operand, out)?;
                out.ops.push(OpCode::Neg);
            }
            Expr::Call(func, arg) if func == "der" => match arg.as_ref() {
                Expr::Symbol(name) => {
                    let idx = self
                        .attrs
                        .diffvar_index(name)
                        .ok_or_else(|| ExpressionError::NotADiffVar(name.clone()))?;
                    out.ops.push(OpCode::LoadDerivative(idx));
                }
                other => return Err(ExpressionError::NotADiffVar(format!("{other:?}"))),
            },
            Expr::Call(func, arg) => {
                let function = Function::from_name(func)
                    .ok_or_else(|| ExpressionError::UnknownFunction(func.clone()))?;
                self.compile_recursive(arg, out)?;
                out.ops.push(OpCode::Call(function));
            }
        }
        Ok(())
    }
}

// --- Simple Parser ---

/// Deepest nesting of parentheses, calls and unary operators accepted.
const MAX_NESTING: usize = 256;

/// Longest token sequence accepted. Bounds the depth of left-leaning
/// operator chains, which the compiler walks recursively.
const MAX_TOKENS: usize = 4096;

/// Parses a string expression into an AST.
pub fn parse(input: &str) -> Result<Expr, ExpressionError> {
    let syntax = |message: String| ExpressionError::Syntax {
        source_text: input.to_string(),
        message,
    };
    let tokens = tokenize(input).map_err(syntax)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.parse_expression().map_err(syntax)?;
    match parser.peek() {
        None => Ok(expr),
        Some(token) => Err(syntax(format!("unexpected {token:?} after expression"))),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if tokens.len() >= MAX_TOKENS {
            return Err(format!("expression is longer than {MAX_TOKENS} tokens"));
        }
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut num_str = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit() || d == '.' {
                    num_str.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            if let Some(&e) = chars.peek() {
                if e == 'e' || e == 'E' {
                    num_str.push(e);
                    chars.next();
                    if let Some(&sign) = chars.peek() {
                        if sign == '+' || sign == '-' {
                            num_str.push(sign);
                            chars.next();
                        }
                    }
                    while let Some(&d) = chars.peek() {
                        if d.is_ascii_digit() {
                            num_str.push(d);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                }
            }
            let value = num_str
                .parse()
                .map_err(|_| format!("invalid number `{num_str}`"))?;
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() || c == '_' {
            let mut ident = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_alphanumeric() || d == '_' {
                    ident.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Identifier(ident));
        } else {
            let token = match c {
                '+' => Token::Plus,
                '-' => Token::Minus,
                '*' => Token::Star,
                '/' => Token::Slash,
                '^' => Token::Caret,
                '(' => Token::LParen,
                ')' => Token::RParen,
                other => return Err(format!("unexpected character `{other}`")),
            };
            tokens.push(token);
            chars.next();
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn consume(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect_rparen(&mut self) -> Result<(), String> {
        match self.consume() {
            Some(Token::RParen) => Ok(()),
            Some(other) => Err(format!("expected ')', found {other:?}")),
            None => Err("expected ')'".to_string()),
        }
    }

    // sum := product (('+' | '-') product)*
    fn parse_expression(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_product()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.consume();
            let right = self.parse_product()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    // product := unary (('*' | '/') unary)*
    fn parse_product(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => break,
            };
            self.consume();
            let right = self.parse_unary()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    // Every nested construct passes through here.
    fn parse_unary(&mut self) -> Result<Expr, String> {
        if self.depth >= MAX_NESTING {
            return Err(format!("expression is nested deeper than {MAX_NESTING} levels"));
        }
        self.depth += 1;
        let result = self.parse_unary_inner();
        self.depth -= 1;
        result
    }

    // unary := '-' unary | power
    fn parse_unary_inner(&mut self) -> Result<Expr, String> {
        if let Some(Token::Minus) = self.peek() {
            self.consume();
            let expr = self.parse_unary()?;
            return Ok(Expr::Neg(Box::new(expr)));
        }
        self.parse_power()
    }

    // power := primary ('^' unary)?   (right-associative)
    fn parse_power(&mut self) -> Result<Expr, String> {
        let base = self.parse_primary()?;
        if let Some(Token::Caret) = self.peek() {
            self.consume();
            let exponent = self.parse_unary()?;
            return Ok(Expr::Binary(Box::new(base), BinaryOp::Pow, Box::new(exponent)));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Identifier(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.consume();
                    let arg = self.parse_expression()?;
                    self.expect_rparen()?;
                    Ok(Expr::Call(name, Box::new(arg)))
                } else {
                    Ok(Expr::Symbol(name))
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_expression()?;
                self.expect_rparen()?;
                Ok(expr)
            }
            Some(other) => Err(format!("unexpected {other:?}")),
            None => Err("unexpected end of input".to_string()),
        }
    }
}
