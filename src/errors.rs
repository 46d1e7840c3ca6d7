//! Compiler Error Types
//!
//! Every error carries a code, an optional source location, a message and
//! optionally the affected variable. Errors accumulate during compilation up
//! to a configurable limit, at which point a sentinel marker terminates the
//! pipeline.

use crate::ast::Var;
use crate::location::Location;
use std::fmt;

/// Message of the sentinel appended when the error limit is reached.
pub const ERROR_LIMIT_MESSAGE: &str = "error limit reached";

/// Stable error codes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Reported by the parser, surfaced unchanged
    ParseErr,
    /// Structural or semantic error
    CompileErr,
    /// Arity, kind or type mismatch
    TypeErr,
    /// Safety analysis failure
    UnsafeVarErr,
    /// Cycle in the rule dependency graph
    RecursionErr,
}

impl ErrorCode {
    /// The wire representation of the code.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ParseErr => "rego_parse_error",
            ErrorCode::CompileErr => "rego_compile_error",
            ErrorCode::TypeErr => "rego_type_error",
            ErrorCode::UnsafeVarErr => "rego_unsafe_var_error",
            ErrorCode::RecursionErr => "rego_recursion_error",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single compiler error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    pub code: ErrorCode,
    pub location: Option<Location>,
    pub message: String,
    /// The affected variable, for unsafe-var errors
    pub var: Option<Var>,
}

impl Error {
    pub fn new(code: ErrorCode, location: Option<Location>, message: impl Into<String>) -> Self {
        Error {
            code,
            location,
            message: message.into(),
            var: None,
        }
    }

    /// A structural/semantic error.
    pub fn compile(location: Location, message: impl Into<String>) -> Self {
        Error::new(ErrorCode::CompileErr, Some(location), message)
    }

    /// A type error.
    pub fn type_err(location: Location, message: impl Into<String>) -> Self {
        Error::new(ErrorCode::TypeErr, Some(location), message)
    }

    /// An unsafe-variable error naming the variable.
    pub fn unsafe_var(location: Location, var: Var) -> Self {
        let mut e = Error::new(
            ErrorCode::UnsafeVarErr,
            Some(location),
            format!("var {var} is unsafe"),
        );
        e.var = Some(var);
        e
    }

    /// A recursion error naming the cycle path.
    pub fn recursion(location: Location, cycle: &[String]) -> Self {
        let name = cycle.first().cloned().unwrap_or_default();
        Error::new(
            ErrorCode::RecursionErr,
            Some(location),
            format!("rule {name} is recursive: {}", cycle.join(" -> ")),
        )
    }

    /// The sentinel appended when the error limit is reached.
    pub fn limit_reached() -> Self {
        Error::new(ErrorCode::CompileErr, None, ERROR_LIMIT_MESSAGE)
    }

    /// Check whether this is the error-limit sentinel.
    pub fn is_limit_marker(&self) -> bool {
        self.location.is_none() && self.message == ERROR_LIMIT_MESSAGE
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(loc) if loc.is_set() => write!(f, "{}: {}: {}", loc, self.code, self.message),
            _ => write!(f, "{}: {}", self.code, self.message),
        }
    }
}

impl std::error::Error for Error {}

/// An accumulated list of compiler errors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Errors(pub Vec<Error>);

impl Errors {
    pub fn new() -> Self {
        Errors(Vec::new())
    }

    pub fn push(&mut self, e: Error) {
        self.0.push(e);
    }

    pub fn extend(&mut self, other: Errors) {
        self.0.extend(other.0);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Error> {
        self.0.iter()
    }

    /// Check whether any accumulated error has the given code.
    pub fn has_code(&self, code: ErrorCode) -> bool {
        self.0.iter().any(|e| e.code == code)
    }
}

impl fmt::Display for Errors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.len() {
            0 => write!(f, "no error(s)"),
            1 => write!(f, "1 error occurred: {}", self.0[0]),
            n => {
                write!(f, "{n} errors occurred:")?;
                for e in &self.0 {
                    write!(f, "\n{e}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for Errors {}

impl IntoIterator for Errors {
    type Item = Error;
    type IntoIter = std::vec::IntoIter<Error>;
    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Result type for compilation-level operations.
pub type CompileResult<T> = Result<T, Errors>;
