use serde::Serialize;
use thiserror::Error;

use super::ast::Span;

/// A compilation error (or warning) with source location.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileError {
    pub message: String,
    pub span: Span,
    pub kind: ErrorKind,
    pub severity: Severity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Lexer,
    Parser,
    /// Declaration and name-resolution problems.
    Scope,
    /// Shape mismatches, arity, read-only stores, disabled constructs.
    Type,
    /// Host type registration problems surfaced while compiling.
    Host,
    /// Internal code generation failures.
    Compiler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

impl CompileError {
    fn new(kind: ErrorKind, message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
            kind,
            severity: Severity::Error,
        }
    }

    pub fn lexer(message: impl Into<String>, span: Span) -> Self {
        Self::new(ErrorKind::Lexer, message, span)
    }

    pub fn parser(message: impl Into<String>, span: Span) -> Self {
        Self::new(ErrorKind::Parser, message, span)
    }

    pub fn scope(message: impl Into<String>, span: Span) -> Self {
        Self::new(ErrorKind::Scope, message, span)
    }

    pub fn type_error(message: impl Into<String>, span: Span) -> Self {
        Self::new(ErrorKind::Type, message, span)
    }

    pub fn host(message: impl Into<String>, span: Span) -> Self {
        Self::new(ErrorKind::Host, message, span)
    }

    pub fn compiler(message: impl Into<String>, span: Span) -> Self {
        Self::new(ErrorKind::Compiler, message, span)
    }

    pub fn warning(message: impl Into<String>, span: Span) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::new(ErrorKind::Type, message, span)
        }
    }

    pub fn is_warning(&self) -> bool {
        self.severity == Severity::Warning
    }

    /// Format the error with source context.
    pub fn format_with_source(&self, source: &str) -> String {
        let (line, col) = offset_to_line_col(source, self.span.start);
        format!(
            "[{}] line {}:{}: {}",
            match (self.severity, self.kind) {
                (Severity::Warning, _) => "warning",
                (_, ErrorKind::Lexer) => "lexer",
                (_, ErrorKind::Parser) => "parser",
                (_, ErrorKind::Scope) => "scope",
                (_, ErrorKind::Type) => "type",
                (_, ErrorKind::Host) => "host",
                (_, ErrorKind::Compiler) => "compiler",
            },
            line,
            col,
            self.message,
        )
    }

    /// Resolve the span against `source` into a host-facing diagnostic.
    pub fn to_diagnostic(&self, source: &str) -> Diagnostic {
        let (line, column) = offset_to_line_col(source, self.span.start);
        Diagnostic {
            severity: self.severity,
            kind: self.kind,
            message: self.message.clone(),
            line,
            column,
        }
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CompileError {}

/// A compile error or warning with a resolved (line, column) position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub kind: ErrorKind,
    pub message: String,
    pub line: usize,
    pub column: usize,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.column, self.message)
    }
}

/// Drop repeated (span, message) pairs, keeping the first occurrence.
///
/// Lambda bodies are analyzed once per call signature, so the same
/// problem can be reported several times.
pub fn dedup_errors(errors: Vec<CompileError>) -> Vec<CompileError> {
    let mut seen = std::collections::HashSet::new();
    errors
        .into_iter()
        .filter(|e| seen.insert((e.span, e.message.clone())))
        .collect()
}

fn offset_to_line_col(source: &str, offset: usize) -> (usize, usize) {
    let mut line = 1;
    let mut col = 1;
    for (i, ch) in source.char_indices() {
        if i >= offset {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

/// Failure raised while executing a compiled script.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "code", content = "detail", rename_all = "snake_case")]
pub enum RuntimeError {
    #[error("Operator '{op}' cannot be applied to {left} and {right}")]
    IncompatibleOperands {
        op: String,
        left: String,
        right: String,
    },
    #[error("Operator '{op}' cannot be applied to {operand}")]
    IncompatibleOperand { op: String, operand: String },
    #[error("Expected {expected} for '{target}', got {actual}")]
    TypeMismatch {
        target: String,
        expected: String,
        actual: String,
    },
    #[error("{receiver} has no member '{member}'")]
    MemberNotFound { receiver: String, member: String },
    #[error("Member '{member}' is read-only")]
    ReadOnly { member: String },
    #[error("{callee} is not callable")]
    NotCallable { callee: String },
    #[error("'{callee}' expects {expected} argument(s), got {actual}")]
    Arity {
        callee: String,
        expected: usize,
        actual: usize,
    },
    #[error("Index {index} is out of range for length {len}")]
    IndexOutOfRange { index: f64, len: usize },
    #[error("Cannot index {receiver} with {key}")]
    InvalidIndex { receiver: String, key: String },
    #[error("Null reference while accessing '{target}'")]
    NullReference { target: String },
    #[error("Call to '{member}' failed: {message}")]
    HostFailure { member: String, message: String },
    #[error("Call depth exceeded {0}")]
    StackOverflow(usize),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn line_col_counts_from_one() {
        let src = "var a = 1;\nvar b = ;";
        let err = CompileError::parser("Unexpected token", Span::new(19, 20));
        let diag = err.to_diagnostic(src);
        assert_eq!((diag.line, diag.column), (2, 9));
        assert_eq!(err.format_with_source(src), "[parser] line 2:9: Unexpected token");
    }

    #[test]
    fn warnings_format_as_warning() {
        let w = CompileError::warning("Variable 'x' is never read", Span::new(0, 1));
        assert!(w.is_warning());
        assert!(w.format_with_source("x").starts_with("[warning]"));
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let a = CompileError::scope("dup", Span::new(1, 2));
        let b = CompileError::type_error("other", Span::new(3, 4));
        let out = dedup_errors(vec![a.clone(), b.clone(), a.clone()]);
        assert_eq!(out, vec![a, b]);
    }

    #[test]
    fn runtime_error_messages() {
        let err = RuntimeError::TypeMismatch {
            target: "Order.Count".into(),
            expected: "Number".into(),
            actual: "String".into(),
        };
        assert_eq!(err.to_string(), "Expected Number for 'Order.Count', got String");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "type_mismatch");
    }
}
