use serde::Serialize;
use thiserror::Error;

use crate::dsl::error::{Diagnostic, RuntimeError};
use crate::dsl::types::TypeError;

/// Any failure from the one-call [`ScriptEngine::eval`](crate::ScriptEngine::eval)
/// path. Serializes with a `code` tag so hosts can match on the stage.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "code", content = "detail", rename_all = "snake_case")]
pub enum ScriptError {
    #[error("{}", join_diagnostics(.0))]
    Compile(Vec<Diagnostic>),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Host(#[from] TypeError),
}

fn join_diagnostics(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::dsl::error::{ErrorKind, Severity};

    #[test]
    fn compile_errors_display_every_diagnostic() {
        let diag = |line, message: &str| Diagnostic {
            severity: Severity::Error,
            kind: ErrorKind::Scope,
            message: message.to_string(),
            line,
            column: 1,
        };
        let err = ScriptError::Compile(vec![diag(1, "first"), diag(3, "second")]);
        assert_eq!(err.to_string(), "1:1: first; 3:1: second");
    }

    #[test]
    fn serializes_with_stage_tag() {
        let err = ScriptError::from(RuntimeError::StackOverflow(8));
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "runtime");
        assert_eq!(json["detail"]["code"], "stack_overflow");
    }
}
