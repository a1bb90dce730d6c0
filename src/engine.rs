//! Evaluator gateway: the narrow contract the session consumes from the
//! embedded interpreter.
//!
//! The interpreter keeps process-wide mutable state and is not reentrant;
//! isolation between connections comes from the supervisor (fork by
//! default), never from the engine itself.

use std::fmt;
use std::sync::{Arc, Mutex};

use num_enum::IntoPrimitive;

use crate::sexp::Sexp;

/// Parse outcomes other than success. The numeric value is forwarded
/// verbatim to the client as the reply stat.
#[derive(IntoPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
#[repr(i32)]
pub enum ParseStatus {
    /// Nothing to parse.
    Null = 0,
    /// Input ended mid-expression.
    Incomplete = 2,
    /// Lexical or syntactic violation.
    Error = 3,
    /// End of input.
    Eof = 4,
}

impl ParseStatus {
    /// Human-readable name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ParseStatus::Null => "null",
            ParseStatus::Incomplete => "incomplete",
            ParseStatus::Error => "error",
            ParseStatus::Eof => "EOF",
        }
    }

    /// The stat value carried in the reply.
    pub fn stat(&self) -> i32 {
        i32::from(*self)
    }
}

/// Runtime failure reported by the engine. Codes are engine-defined and
/// positive; the session negates them so the surfaced stat never collides
/// with protocol-defined stats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalError {
    /// Engine-defined error code.
    pub code: i32,
    /// Description for the server log; never sent on the wire.
    pub message: String,
}

impl EvalError {
    /// Build an error with the given code.
    pub fn new<S: Into<String>>(code: i32, message: S) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// The stat value carried in the reply: negative, whatever the sign of
    /// the engine's code.
    pub fn stat(&self) -> i32 {
        if self.code < 0 {
            self.code
        } else {
            -self.code
        }
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "eval error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for EvalError {}

/// The façade over the embedded interpreter.
pub trait Engine {
    /// Parsed-expression type handed back to `eval`.
    type Expr;

    /// Forward startup arguments to the interpreter's initialization.
    /// A non-zero code aborts the server with exit status -1.
    fn init(&mut self, args: &[String]) -> Result<(), i32> {
        let _ = args;
        Ok(())
    }

    /// Clear any residual parser input.
    fn reset(&mut self);

    /// Parse one expression from `source`. `lines` is the newline count of
    /// the source text, which must end in a newline.
    fn parse(&mut self, source: &str, lines: usize) -> Result<Self::Expr, ParseStatus>;

    /// Evaluate a parsed expression against the global environment.
    fn eval(&mut self, expr: &Self::Expr) -> Result<Sexp, EvalError>;
}

// lets the supervisor lend its engine to inline and forked workers
impl<E: Engine> Engine for &mut E {
    type Expr = E::Expr;

    fn init(&mut self, args: &[String]) -> Result<(), i32> {
        (**self).init(args)
    }

    fn reset(&mut self) {
        (**self).reset()
    }

    fn parse(&mut self, source: &str, lines: usize) -> Result<Self::Expr, ParseStatus> {
        (**self).parse(source, lines)
    }

    fn eval(&mut self, expr: &Self::Expr) -> Result<Sexp, EvalError> {
        (**self).eval(expr)
    }
}

/// Mutex-guarded handle sharing one engine among worker threads (the thread
/// isolation build). Every gateway call serializes on the lock, so one
/// long-running evaluation stalls every other connection; the fork build
/// does not have this problem.
pub struct SharedEngine<E>(Arc<Mutex<E>>);

impl<E> SharedEngine<E> {
    /// Wrap an engine for sharing.
    pub fn new(engine: E) -> Self {
        Self(Arc::new(Mutex::new(engine)))
    }
}

impl<E> Clone for SharedEngine<E> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<E: Engine> Engine for SharedEngine<E> {
    type Expr = E::Expr;

    fn init(&mut self, args: &[String]) -> Result<(), i32> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).init(args)
    }

    fn reset(&mut self) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).reset()
    }

    fn parse(&mut self, source: &str, lines: usize) -> Result<Self::Expr, ParseStatus> {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .parse(source, lines)
    }

    fn eval(&mut self, expr: &Self::Expr) -> Result<Sexp, EvalError> {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .eval(expr)
    }
}
