//! Built-in interpreter standing in for the embedded statistical engine:
//! vector arithmetic with recycling over a global environment, surfaced
//! through the [`Engine`] gateway.
//!
//! One expression is parsed per request, mirroring the original engine's
//! parse-one-buffer entry point; trailing input after the first complete
//! expression is left untouched.

use std::collections::HashMap;
use std::f64::consts::PI;

use log::debug;

use crate::engine::{Engine, EvalError, ParseStatus};
use crate::sexp::{Kind, Logical, Sexp};

// runtime error codes surfaced (negated) as reply stats
const E_NOT_FOUND: i32 = 1;
const E_TYPE: i32 = 2;
const E_CALL: i32 = 3;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Int(i32),
    Str(String),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Colon,
    LParen,
    RParen,
    Comma,
    Assign,
}

/// A parsed expression, ready for evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Integer(i32),
    Text(String),
    True,
    False,
    Na,
    Null,
    Var(String),
    Neg(Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
    Range(Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
    Assign(String, Box<Expr>),
}

/// The stand-in interpreter: a global binding environment plus a scratch
/// parse buffer.
pub struct Interp {
    env: HashMap<String, Sexp>,
    iobuf: String,
}

impl Interp {
    /// Fresh interpreter with the base environment.
    pub fn new() -> Self {
        let mut env = HashMap::new();
        env.insert("pi".to_string(), Sexp::double(PI));
        env.insert("T".to_string(), Sexp::logicals(vec![Logical::True]));
        env.insert("F".to_string(), Sexp::logicals(vec![Logical::False]));
        Self {
            env,
            iobuf: String::new(),
        }
    }

    fn eval_expr(&mut self, expr: &Expr) -> Result<Sexp, EvalError> {
        match expr {
            Expr::Number(x) => Ok(Sexp::double(*x)),
            Expr::Integer(i) => Ok(Sexp::ints(vec![*i])),
            Expr::Text(s) => Ok(Sexp::string(s.clone())),
            Expr::True => Ok(Sexp::logicals(vec![Logical::True])),
            Expr::False => Ok(Sexp::logicals(vec![Logical::False])),
            Expr::Na => Ok(Sexp::logicals(vec![Logical::Na])),
            Expr::Null => Ok(Sexp::null()),
            Expr::Var(name) => match self.env.get(name) {
                Some(v) => Ok(v.clone()),
                None => Err(EvalError::new(
                    E_NOT_FOUND,
                    format!("object '{name}' not found"),
                )),
            },
            Expr::Neg(e) => negate(self.eval_expr(e)?),
            Expr::Add(a, b) => arith(Op::Add, self.eval_expr(a)?, self.eval_expr(b)?),
            Expr::Sub(a, b) => arith(Op::Sub, self.eval_expr(a)?, self.eval_expr(b)?),
            Expr::Mul(a, b) => arith(Op::Mul, self.eval_expr(a)?, self.eval_expr(b)?),
            Expr::Div(a, b) => arith(Op::Div, self.eval_expr(a)?, self.eval_expr(b)?),
            Expr::Range(a, b) => range(self.eval_expr(a)?, self.eval_expr(b)?),
            Expr::Call(name, args) => self.call(name, args),
            Expr::Assign(name, e) => {
                let v = self.eval_expr(e)?;
                self.env.insert(name.clone(), v.clone());
                Ok(v)
            }
        }
    }

    fn call(&mut self, name: &str, args: &[Expr]) -> Result<Sexp, EvalError> {
        // quote is a special form: its argument is not evaluated
        if name == "quote" {
            if args.len() != 1 {
                return Err(EvalError::new(E_CALL, "quote takes one argument"));
            }
            return Ok(match &args[0] {
                Expr::Var(n) => Sexp::symbol(n.clone()),
                lit @ (Expr::Number(_)
                | Expr::Integer(_)
                | Expr::Text(_)
                | Expr::True
                | Expr::False
                | Expr::Na
                | Expr::Null) => self.eval_expr(lit)?,
                _ => Sexp::lang(),
            });
        }

        let mut vals = Vec::with_capacity(args.len());
        for a in args {
            vals.push(self.eval_expr(a)?);
        }
        match name {
            "c" => combine(vals),
            "list" => Ok(Sexp::vector(vals)),
            "length" => {
                if vals.len() != 1 {
                    return Err(EvalError::new(E_CALL, "length takes one argument"));
                }
                Ok(Sexp::ints(vec![value_len(&vals[0]) as i32]))
            }
            "sum" => sum(vals),
            _ => Err(EvalError::new(
                E_NOT_FOUND,
                format!("could not find function '{name}'"),
            )),
        }
    }
}

impl Default for Interp {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for Interp {
    type Expr = Expr;

    /// Flags are accepted and ignored; every other argument is evaluated as
    /// source text, so startup scripts can preload bindings.
    fn init(&mut self, args: &[String]) -> Result<(), i32> {
        for arg in args {
            if arg.starts_with('-') {
                continue;
            }
            self.reset();
            let expr = match self.parse(arg, 1) {
                Ok(expr) => expr,
                Err(status) => {
                    debug!(target: "rsrv", "init argument failed to parse: {}", status.name());
                    return Err(status.stat().max(1));
                }
            };
            if let Err(err) = self.eval(&expr) {
                debug!(target: "rsrv", "init argument failed to evaluate: {err}");
                return Err(err.code);
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.iobuf.clear();
    }

    fn parse(&mut self, source: &str, _lines: usize) -> Result<Expr, ParseStatus> {
        self.iobuf.push_str(source);
        let toks = lex(&self.iobuf)?;
        if toks.is_empty() {
            return Err(ParseStatus::Null);
        }
        Parser { toks, pos: 0 }.expression()
    }

    fn eval(&mut self, expr: &Expr) -> Result<Sexp, EvalError> {
        self.eval_expr(expr)
    }
}

// ---------------------------------------------------------------------------
// lexing

fn lex(src: &str) -> Result<Vec<Token>, ParseStatus> {
    let mut toks = Vec::new();
    let b = src.as_bytes();
    let mut i = 0;
    while i < b.len() {
        match b[i] {
            b' ' | b'\t' | b'\r' | b'\n' => i += 1,
            b'#' => {
                while i < b.len() && b[i] != b'\n' {
                    i += 1;
                }
            }
            b'+' => {
                toks.push(Token::Plus);
                i += 1;
            }
            b'-' => {
                toks.push(Token::Minus);
                i += 1;
            }
            b'*' => {
                toks.push(Token::Star);
                i += 1;
            }
            b'/' => {
                toks.push(Token::Slash);
                i += 1;
            }
            b':' => {
                toks.push(Token::Colon);
                i += 1;
            }
            b'(' => {
                toks.push(Token::LParen);
                i += 1;
            }
            b')' => {
                toks.push(Token::RParen);
                i += 1;
            }
            b',' => {
                toks.push(Token::Comma);
                i += 1;
            }
            b'=' => {
                toks.push(Token::Assign);
                i += 1;
            }
            b'<' => {
                if b.get(i + 1) == Some(&b'-') {
                    toks.push(Token::Assign);
                    i += 2;
                } else {
                    return Err(ParseStatus::Error);
                }
            }
            b'"' => {
                let (tok, used) = lex_string(&src[i..])?;
                toks.push(tok);
                i += used;
            }
            c if c.is_ascii_digit() || (c == b'.' && next_is_digit(b, i)) => {
                let (tok, used) = lex_number(&src[i..])?;
                toks.push(tok);
                i += used;
            }
            c if c.is_ascii_alphabetic() || c == b'.' => {
                let start = i;
                while i < b.len()
                    && (b[i].is_ascii_alphanumeric() || b[i] == b'.' || b[i] == b'_')
                {
                    i += 1;
                }
                toks.push(Token::Ident(src[start..i].to_string()));
            }
            _ => return Err(ParseStatus::Error),
        }
    }
    Ok(toks)
}

fn next_is_digit(b: &[u8], i: usize) -> bool {
    b.get(i + 1).map_or(false, |c| c.is_ascii_digit())
}

// an unterminated string is incomplete input, not an error: the client may
// still send the closing quote
fn lex_string(src: &str) -> Result<(Token, usize), ParseStatus> {
    let b = src.as_bytes();
    let mut out = String::new();
    let mut i = 1;
    while i < b.len() {
        match b[i] {
            b'"' => return Ok((Token::Str(out), i + 1)),
            b'\\' => {
                match b.get(i + 1) {
                    Some(b'"') => out.push('"'),
                    Some(b'\\') => out.push('\\'),
                    Some(b'n') => out.push('\n'),
                    Some(b't') => out.push('\t'),
                    Some(_) => return Err(ParseStatus::Error),
                    None => return Err(ParseStatus::Incomplete),
                }
                i += 2;
            }
            _ => {
                // str indexing is safe here: we only split at ASCII bytes
                let ch = src[i..].chars().next().ok_or(ParseStatus::Error)?;
                out.push(ch);
                i += ch.len_utf8();
            }
        }
    }
    Err(ParseStatus::Incomplete)
}

fn lex_number(src: &str) -> Result<(Token, usize), ParseStatus> {
    let b = src.as_bytes();
    let mut i = 0;
    while i < b.len() && b[i].is_ascii_digit() {
        i += 1;
    }
    if i < b.len() && b[i] == b'.' {
        i += 1;
        while i < b.len() && b[i].is_ascii_digit() {
            i += 1;
        }
    }
    if i < b.len() && (b[i] == b'e' || b[i] == b'E') {
        let mut j = i + 1;
        if j < b.len() && (b[j] == b'+' || b[j] == b'-') {
            j += 1;
        }
        if j < b.len() && b[j].is_ascii_digit() {
            i = j;
            while i < b.len() && b[i].is_ascii_digit() {
                i += 1;
            }
        } else {
            return Err(ParseStatus::Error);
        }
    }
    if i < b.len() && b[i] == b'L' {
        let n: i32 = src[..i].parse().map_err(|_| ParseStatus::Error)?;
        return Ok((Token::Int(n), i + 1));
    }
    let x: f64 = src[..i].parse().map_err(|_| ParseStatus::Error)?;
    Ok((Token::Num(x), i))
}

// ---------------------------------------------------------------------------
// parsing
//
// precedence, loosest first: <- | + - | * / | : | unary - | primary

struct Parser {
    toks: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn expression(mut self) -> Result<Expr, ParseStatus> {
        self.assign()
        // anything after the first complete expression stays unparsed
    }

    fn peek(&self) -> Option<&Token> {
        self.toks.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.toks.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    // out of tokens means the client can still complete the expression
    fn unexpected(&self) -> ParseStatus {
        if self.pos >= self.toks.len() {
            ParseStatus::Incomplete
        } else {
            ParseStatus::Error
        }
    }

    fn assign(&mut self) -> Result<Expr, ParseStatus> {
        if let (Some(Token::Ident(name)), Some(Token::Assign)) =
            (self.toks.get(self.pos), self.toks.get(self.pos + 1))
        {
            let name = name.clone();
            self.pos += 2;
            let rhs = self.assign()?;
            return Ok(Expr::Assign(name, Box::new(rhs)));
        }
        self.additive()
    }

    fn additive(&mut self) -> Result<Expr, ParseStatus> {
        let mut lhs = self.multiplicative()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.pos += 1;
                    let rhs = self.multiplicative()?;
                    lhs = Expr::Add(Box::new(lhs), Box::new(rhs));
                }
                Some(Token::Minus) => {
                    self.pos += 1;
                    let rhs = self.multiplicative()?;
                    lhs = Expr::Sub(Box::new(lhs), Box::new(rhs));
                }
                _ => return Ok(lhs),
            }
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, ParseStatus> {
        let mut lhs = self.range()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.pos += 1;
                    let rhs = self.range()?;
                    lhs = Expr::Mul(Box::new(lhs), Box::new(rhs));
                }
                Some(Token::Slash) => {
                    self.pos += 1;
                    let rhs = self.range()?;
                    lhs = Expr::Div(Box::new(lhs), Box::new(rhs));
                }
                _ => return Ok(lhs),
            }
        }
    }

    fn range(&mut self) -> Result<Expr, ParseStatus> {
        let mut lhs = self.unary()?;
        while let Some(Token::Colon) = self.peek() {
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Range(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ParseStatus> {
        if let Some(Token::Minus) = self.peek() {
            self.pos += 1;
            let e = self.unary()?;
            return Ok(Expr::Neg(Box::new(e)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Expr, ParseStatus> {
        match self.next() {
            Some(Token::Num(x)) => Ok(Expr::Number(x)),
            Some(Token::Int(i)) => Ok(Expr::Integer(i)),
            Some(Token::Str(s)) => Ok(Expr::Text(s)),
            Some(Token::Ident(name)) => match name.as_str() {
                "TRUE" => Ok(Expr::True),
                "FALSE" => Ok(Expr::False),
                "NA" => Ok(Expr::Na),
                "NULL" => Ok(Expr::Null),
                _ => {
                    if let Some(Token::LParen) = self.peek() {
                        self.pos += 1;
                        let args = self.call_args()?;
                        Ok(Expr::Call(name, args))
                    } else {
                        Ok(Expr::Var(name))
                    }
                }
            },
            Some(Token::LParen) => {
                let e = self.assign()?;
                match self.next() {
                    Some(Token::RParen) => Ok(e),
                    Some(_) => Err(ParseStatus::Error),
                    None => Err(ParseStatus::Incomplete),
                }
            }
            Some(_) => Err(ParseStatus::Error),
            None => Err(ParseStatus::Incomplete),
        }
    }

    fn call_args(&mut self) -> Result<Vec<Expr>, ParseStatus> {
        let mut args = Vec::new();
        if let Some(Token::RParen) = self.peek() {
            self.pos += 1;
            return Ok(args);
        }
        loop {
            args.push(self.assign()?);
            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => return Ok(args),
                Some(_) => return Err(ParseStatus::Error),
                None => return Err(ParseStatus::Incomplete),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// evaluation helpers

#[derive(Copy, Clone)]
enum Op {
    Add,
    Sub,
    Mul,
    Div,
}

enum NumVec {
    Ints(Vec<i32>),
    Doubles(Vec<f64>),
}

fn as_numeric(v: &Sexp) -> Result<NumVec, EvalError> {
    match &v.kind {
        Kind::Ints(xs) => Ok(NumVec::Ints(xs.clone())),
        Kind::Doubles(xs) => Ok(NumVec::Doubles(xs.clone())),
        _ => Err(EvalError::new(
            E_TYPE,
            "non-numeric argument to numeric operation",
        )),
    }
}

fn negate(v: Sexp) -> Result<Sexp, EvalError> {
    match as_numeric(&v)? {
        NumVec::Ints(xs) => {
            let mut out = Vec::with_capacity(xs.len());
            for x in xs {
                out.push(
                    x.checked_neg()
                        .ok_or_else(|| EvalError::new(E_TYPE, "integer overflow"))?,
                );
            }
            Ok(Sexp::ints(out))
        }
        NumVec::Doubles(xs) => Ok(Sexp::doubles(xs.into_iter().map(|x| -x).collect())),
    }
}

// elementwise with recycling; integers stay integers except for division
fn arith(op: Op, a: Sexp, b: Sexp) -> Result<Sexp, EvalError> {
    let a = as_numeric(&a)?;
    let b = as_numeric(&b)?;
    if let (Op::Add | Op::Sub | Op::Mul, NumVec::Ints(xs), NumVec::Ints(ys)) = (op, &a, &b) {
        if xs.is_empty() || ys.is_empty() {
            return Ok(Sexp::ints(vec![]));
        }
        let n = xs.len().max(ys.len());
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            let (x, y) = (xs[i % xs.len()], ys[i % ys.len()]);
            let r = match op {
                Op::Add => x.checked_add(y),
                Op::Sub => x.checked_sub(y),
                Op::Mul => x.checked_mul(y),
                Op::Div => unreachable!(),
            };
            out.push(r.ok_or_else(|| EvalError::new(E_TYPE, "integer overflow"))?);
        }
        return Ok(Sexp::ints(out));
    }
    let xs = to_doubles(a);
    let ys = to_doubles(b);
    if xs.is_empty() || ys.is_empty() {
        return Ok(Sexp::doubles(vec![]));
    }
    let n = xs.len().max(ys.len());
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let (x, y) = (xs[i % xs.len()], ys[i % ys.len()]);
        out.push(match op {
            Op::Add => x + y,
            Op::Sub => x - y,
            Op::Mul => x * y,
            Op::Div => x / y,
        });
    }
    Ok(Sexp::doubles(out))
}

fn to_doubles(v: NumVec) -> Vec<f64> {
    match v {
        NumVec::Ints(xs) => xs.into_iter().map(|x| x as f64).collect(),
        NumVec::Doubles(xs) => xs,
    }
}

const MAX_RANGE: i64 = 10_000_000;

fn range(a: Sexp, b: Sexp) -> Result<Sexp, EvalError> {
    let from = first_numeric(&a)?;
    let to = first_numeric(&b)?;
    let (from, to) = (from.trunc() as i64, to.trunc() as i64);
    if (from - to).abs() >= MAX_RANGE {
        return Err(EvalError::new(E_TYPE, "range result would be too long"));
    }
    if i32::try_from(from).is_err() || i32::try_from(to).is_err() {
        return Err(EvalError::new(E_TYPE, "range endpoint out of integer range"));
    }
    let out: Vec<i32> = if from <= to {
        (from..=to).map(|x| x as i32).collect()
    } else {
        (to..=from).rev().map(|x| x as i32).collect()
    };
    Ok(Sexp::ints(out))
}

fn first_numeric(v: &Sexp) -> Result<f64, EvalError> {
    let err = || EvalError::new(E_CALL, "argument of length 0");
    match as_numeric(v)? {
        NumVec::Ints(xs) => xs.first().map(|&x| x as f64).ok_or_else(err),
        NumVec::Doubles(xs) => xs.first().copied().ok_or_else(err),
    }
}

// promotion hierarchy for c(): logical < integer < double < string
fn combine(vals: Vec<Sexp>) -> Result<Sexp, EvalError> {
    #[derive(PartialEq, PartialOrd, Copy, Clone)]
    enum Ty {
        Logical,
        Int,
        Double,
        Str,
    }
    let mut target = Ty::Logical;
    let mut total = 0;
    for v in &vals {
        let ty = match &v.kind {
            Kind::Null => continue,
            Kind::Logicals(_) => Ty::Logical,
            Kind::Ints(_) => Ty::Int,
            Kind::Doubles(_) => Ty::Double,
            Kind::Strings(_) | Kind::Char(_) => Ty::Str,
            _ => return Err(EvalError::new(E_TYPE, "arguments must be atomic")),
        };
        total += value_len(v);
        if ty > target {
            target = ty;
        }
    }
    if total == 0 {
        return Ok(Sexp::null());
    }

    let na = || EvalError::new(E_TYPE, "NA cannot be coerced");
    match target {
        Ty::Logical => {
            let mut out = Vec::with_capacity(total);
            for v in vals {
                if let Kind::Logicals(ls) = v.kind {
                    out.extend(ls);
                }
            }
            Ok(Sexp::logicals(out))
        }
        Ty::Int => {
            let mut out = Vec::with_capacity(total);
            for v in vals {
                match v.kind {
                    Kind::Null => {}
                    Kind::Logicals(ls) => {
                        for l in ls {
                            out.push(logical_to_int(l).ok_or_else(na)?);
                        }
                    }
                    Kind::Ints(xs) => out.extend(xs),
                    _ => unreachable!(),
                }
            }
            Ok(Sexp::ints(out))
        }
        Ty::Double => {
            let mut out = Vec::with_capacity(total);
            for v in vals {
                match v.kind {
                    Kind::Null => {}
                    Kind::Logicals(ls) => {
                        for l in ls {
                            out.push(logical_to_int(l).ok_or_else(na)? as f64);
                        }
                    }
                    Kind::Ints(xs) => out.extend(xs.into_iter().map(|x| x as f64)),
                    Kind::Doubles(xs) => out.extend(xs),
                    _ => unreachable!(),
                }
            }
            Ok(Sexp::doubles(out))
        }
        Ty::Str => {
            let mut out = Vec::with_capacity(total);
            for v in vals {
                match v.kind {
                    Kind::Null => {}
                    Kind::Logicals(ls) => {
                        for l in ls {
                            out.push(match l {
                                Logical::True => "TRUE".to_string(),
                                Logical::False => "FALSE".to_string(),
                                Logical::Na => return Err(na()),
                            });
                        }
                    }
                    Kind::Ints(xs) => out.extend(xs.into_iter().map(|x| x.to_string())),
                    Kind::Doubles(xs) => out.extend(xs.into_iter().map(fmt_double)),
                    Kind::Strings(ss) => out.extend(ss),
                    Kind::Char(s) => out.push(s),
                    _ => unreachable!(),
                }
            }
            Ok(Sexp::strings(out))
        }
    }
}

fn logical_to_int(l: Logical) -> Option<i32> {
    match l {
        Logical::False => Some(0),
        Logical::True => Some(1),
        Logical::Na => None,
    }
}

fn fmt_double(x: f64) -> String {
    if x.fract() == 0.0 && x.abs() < 1e15 {
        format!("{}", x as i64)
    } else {
        format!("{x}")
    }
}

fn sum(vals: Vec<Sexp>) -> Result<Sexp, EvalError> {
    let mut acc_i: i64 = 0;
    let mut acc_d = 0.0;
    let mut double = false;
    for v in &vals {
        match as_numeric(v)? {
            NumVec::Ints(xs) => acc_i += xs.iter().map(|&x| x as i64).sum::<i64>(),
            NumVec::Doubles(xs) => {
                double = true;
                acc_d += xs.iter().sum::<f64>();
            }
        }
    }
    if double {
        Ok(Sexp::double(acc_d + acc_i as f64))
    } else {
        let total = i32::try_from(acc_i)
            .map_err(|_| EvalError::new(E_TYPE, "integer overflow in sum"))?;
        Ok(Sexp::ints(vec![total]))
    }
}

fn value_len(v: &Sexp) -> usize {
    match &v.kind {
        Kind::Null => 0,
        Kind::Char(_) | Kind::Lang | Kind::Symbol(_) | Kind::Unknown(_) => 1,
        Kind::Doubles(xs) => xs.len(),
        Kind::Ints(xs) => xs.len(),
        Kind::Logicals(ls) => ls.len(),
        Kind::Strings(ss) => ss.len(),
        Kind::Vector(kids) => kids.len(),
        Kind::List(_, tail) => {
            let mut n = 1;
            let mut cur = tail.as_ref();
            while let Kind::List(_, next) = &cur.kind {
                n += 1;
                cur = next.as_ref();
            }
            n
        }
    }
}
