//! Shape-inferring scripting language for host applications.
//!
//! Pipeline: source → lex → parse → shape analysis → materialize →
//! compile → `CompiledScript`, executed by the VM with the dynamic
//! runtime covering whatever analysis could not type.

pub mod ast;
pub mod error;
pub mod lexer;
pub mod parser;
pub mod scope;
pub mod host;
pub mod value;
pub mod types;
pub mod shape;
pub mod builtins;
pub mod infer;
pub mod materialize;
pub mod compiler;
pub mod dynamic;
pub mod vm;
pub mod options;
pub mod engine;
#[cfg(test)]
pub mod fixture;

use engine::{Program, ScriptEngine};
use error::Diagnostic;

/// Compile a standalone script (no input type, default options).
///
/// Hosts that expose their own types go through [`ScriptEngine`] instead.
pub fn compile_source(source: &str) -> Result<Program, Vec<Diagnostic>> {
    ScriptEngine::default().compile(source, None)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use options::BufferSink;

    #[test]
    fn standalone_pipeline() {
        let program = compile_source("var a = [1, 2, 3]; var s = 0; for (var i = 0; i < a.length; i++) s = s + a[i]; print s; return s;").unwrap();
        let sink = BufferSink::new();
        assert_eq!(program.run_without_input(&sink).unwrap().as_number(), Some(6.0));
        assert_eq!(sink.lines(), vec!["6"]);
    }

    #[test]
    fn standalone_errors_are_diagnostics() {
        let diags = compile_source("return Count;").unwrap_err();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].column, 8);
    }
}
