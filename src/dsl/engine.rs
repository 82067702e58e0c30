//! Host-facing entry points: register types, compile scripts, run them.

use std::any::Any;
use std::sync::Arc;

use crate::error::ScriptError;

use super::ast::Span;
use super::compiler::{self, CompiledScript};
use super::dynamic::DynamicOps;
use super::error::{CompileError, Diagnostic, RuntimeError};
use super::host::{HostObject, HostTypeId, TypeDescriptor};
use super::infer;
use super::lexer;
use super::options::{CompileOptions, PrintSink, StdoutSink};
use super::parser;
use super::types::{TypeError, TypeManager};
use super::value::Value;
use super::vm::{self, VmContext};

/// Owns the registered host types and the options scripts compile under.
pub struct ScriptEngine {
    types: TypeManager,
    options: CompileOptions,
}

impl Default for ScriptEngine {
    fn default() -> Self {
        Self::new(CompileOptions::default())
    }
}

impl ScriptEngine {
    pub fn new(options: CompileOptions) -> Self {
        Self {
            types: TypeManager::new(options.member_naming),
            options,
        }
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    pub fn types(&self) -> &TypeManager {
        &self.types
    }

    /// Register a host type. The descriptor is validated immediately.
    pub fn register_type(&mut self, desc: TypeDescriptor) -> Result<HostTypeId, TypeError> {
        self.types.register(desc)
    }

    /// Register a holder of static functions whose first parameter names
    /// the type they extend.
    pub fn register_extension(&mut self, desc: TypeDescriptor) -> Result<(), TypeError> {
        self.types.register_extension(desc)
    }

    /// Wrap `value` as an input object of its registered type.
    pub fn host_object<T: Any + Send + Sync>(&self, value: T) -> Result<HostObject, TypeError> {
        let id = self
            .types
            .id_of::<T>()
            .ok_or_else(|| TypeError::NotRegistered(std::any::type_name::<T>().to_string()))?;
        Ok(HostObject::new(id, self.types.type_name(id), value))
    }

    /// Compile `source` against an optional input type.
    ///
    /// Errors come back as diagnostics resolved against `source`. Warnings
    /// are attached to the program only when `collect_warnings` is set.
    #[tracing::instrument(skip_all, fields(len = source.len()))]
    pub fn compile(&mut self, source: &str, input: Option<HostTypeId>) -> Result<Program, Vec<Diagnostic>> {
        let diagnostics = |errors: Vec<CompileError>| -> Vec<Diagnostic> {
            errors.iter().map(|e| e.to_diagnostic(source)).collect()
        };

        if let Some(id) = input {
            self.types.validate_type(id, false).map_err(|e| {
                diagnostics(vec![CompileError::host(
                    format!("Input type '{}' cannot be used: {e}", self.types.type_name(id)),
                    Span::default(),
                )])
            })?;
        }

        let tokens = lexer::lex(source).map_err(diagnostics)?;
        let script = parser::parse(tokens).map_err(diagnostics)?;
        let analysis = infer::analyze(&script, &self.types, input, &self.options).map_err(diagnostics)?;
        let code = compiler::compile(&script, &analysis, &self.types).map_err(|e| diagnostics(vec![e]))?;

        let warnings = if self.options.collect_warnings {
            diagnostics(analysis.warnings)
        } else {
            Vec::new()
        };
        tracing::debug!(
            functions = code.functions.len(),
            dynamic_ops = code.dynamic_ops,
            passes = analysis.passes,
            warnings = warnings.len(),
            "script compiled"
        );

        Ok(Program {
            code: Arc::new(code),
            dynamic: Arc::new(DynamicOps::new(self.types.snapshot())),
            input,
            warnings,
            max_call_depth: self.options.max_call_depth,
        })
    }

    /// Compile and run `source` once against `input`, printing to stdout.
    pub fn eval(&mut self, source: &str, input: &HostObject) -> Result<Value, ScriptError> {
        let program = self.compile(source, Some(input.type_id())).map_err(ScriptError::Compile)?;
        Ok(program.run(input)?)
    }
}

/// A compiled script. Cheap to clone and safe to run from several threads.
#[derive(Debug, Clone)]
pub struct Program {
    code: Arc<CompiledScript>,
    dynamic: Arc<DynamicOps>,
    input: Option<HostTypeId>,
    warnings: Vec<Diagnostic>,
    max_call_depth: usize,
}

impl Program {
    pub fn run(&self, input: &HostObject) -> Result<Value, RuntimeError> {
        self.run_with_sink(input, &StdoutSink)
    }

    /// Run against `input`, sending `print` output to `sink`.
    pub fn run_with_sink(&self, input: &HostObject, sink: &dyn PrintSink) -> Result<Value, RuntimeError> {
        if let Some(expected) = self.input {
            if input.type_id() != expected {
                return Err(RuntimeError::TypeMismatch {
                    target: "input".to_string(),
                    expected: self.dynamic.type_name(expected),
                    actual: input.type_name().to_string(),
                });
            }
        }
        self.execute(Some(input), sink)
    }

    /// Run a program compiled without an input type.
    pub fn run_without_input(&self, sink: &dyn PrintSink) -> Result<Value, RuntimeError> {
        if self.input.is_some() {
            return Err(RuntimeError::NullReference {
                target: "input".to_string(),
            });
        }
        self.execute(None, sink)
    }

    fn execute(&self, input: Option<&HostObject>, sink: &dyn PrintSink) -> Result<Value, RuntimeError> {
        let ctx = VmContext {
            input,
            sink,
            max_call_depth: self.max_call_depth,
        };
        vm::execute(&self.code, &self.dynamic, &ctx)
    }

    pub fn input_type(&self) -> Option<HostTypeId> {
        self.input
    }

    /// Whether any operation needs the dynamic runtime.
    pub fn uses_dynamic(&self) -> bool {
        self.code.uses_dynamic()
    }

    pub fn dynamic_op_count(&self) -> usize {
        self.code.dynamic_ops
    }

    pub fn warnings(&self) -> &[Diagnostic] {
        &self.warnings
    }

    pub fn code(&self) -> &CompiledScript {
        &self.code
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::dsl::error::{ErrorKind, Severity};
    use crate::dsl::fixture::{self, Order};
    use crate::dsl::host::TypeBuilder;
    use crate::dsl::options::BufferSink;

    fn engine(options: CompileOptions) -> (ScriptEngine, HostTypeId) {
        let mut engine = ScriptEngine::new(options);
        let id = engine.register_type(fixture::order_type()).unwrap();
        engine.register_extension(fixture::order_ext()).unwrap();
        (engine, id)
    }

    fn check_err(options: CompileOptions, src: &str) -> Vec<Diagnostic> {
        let (mut engine, id) = engine(options);
        engine.compile(src, Some(id)).unwrap_err()
    }

    #[test]
    fn eval_reads_input_members() {
        let (mut engine, _) = engine(CompileOptions::default());
        let order = engine.host_object(fixture::sample_order()).unwrap();
        let v = engine.eval("return Count * Price + Doubled();", &order).unwrap();
        assert_eq!(v.as_number(), Some(13.5));
    }

    #[test]
    fn program_runs_repeatedly_with_own_state() {
        let (mut engine, id) = engine(CompileOptions::default());
        let program = engine.compile("Count = Count + 1; return Count;", Some(id)).unwrap();
        let a = engine.host_object(fixture::sample_order()).unwrap();
        let b = engine.host_object(Order::default()).unwrap();
        assert_eq!(program.run(&a).unwrap().as_number(), Some(4.0));
        assert_eq!(program.run(&a).unwrap().as_number(), Some(5.0));
        assert_eq!(program.run(&b).unwrap().as_number(), Some(1.0));
    }

    #[test]
    fn program_is_shareable_across_threads() {
        let (mut engine, id) = engine(CompileOptions::default());
        let program = engine.compile("return Count * 2;", Some(id)).unwrap();
        let handles: Vec<_> = (0..4)
            .map(|n| {
                let program = program.clone();
                let input = fixture::order_object(id, Order { count: n, ..Order::default() });
                std::thread::spawn(move || program.run_with_sink(&input, &BufferSink::new()).unwrap())
            })
            .collect();
        let results: Vec<f64> = handles.into_iter().map(|h| h.join().unwrap().as_number().unwrap()).collect();
        assert_eq!(results, vec![0.0, 2.0, 4.0, 6.0]);
    }

    #[test]
    fn diagnostics_carry_line_and_column() {
        let diags = check_err(CompileOptions::default(), "var x = 1;\nvar x = 2;");
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].kind, ErrorKind::Scope);
        assert_eq!(diags[0].severity, Severity::Error);
        assert_eq!(diags[0].line, 2);
    }

    #[test]
    fn lexer_errors_surface_as_diagnostics() {
        let diags = check_err(CompileOptions::default(), "return 1 # 2;");
        assert!(!diags.is_empty());
        assert_eq!(diags[0].kind, ErrorKind::Lexer);
    }

    #[test]
    fn print_goes_to_the_given_sink() {
        let (mut engine, id) = engine(CompileOptions::default());
        let program = engine.compile("print Name; print \"n=\" + Count;", Some(id)).unwrap();
        let sink = BufferSink::new();
        program
            .run_with_sink(&fixture::order_object(id, fixture::sample_order()), &sink)
            .unwrap();
        assert_eq!(sink.lines(), vec!["widget", "n=3"]);
    }

    #[test]
    fn disabled_print_is_rejected() {
        let options = CompileOptions {
            allow_print: false,
            ..CompileOptions::default()
        };
        let diags = check_err(options, "print 1;");
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].kind, ErrorKind::Type);
    }

    #[test]
    fn disabled_literals_are_rejected() {
        let options = CompileOptions {
            allow_literals: false,
            ..CompileOptions::default()
        };
        assert!(!check_err(options.clone(), "var r = { a: 1 };").is_empty());
        assert!(!check_err(options, "var a = [1, 2];").is_empty());
    }

    #[test]
    fn warnings_only_when_collected() {
        let src = "var unused = 1; return Count;";
        let (mut quiet, id) = engine(CompileOptions::default());
        assert!(quiet.compile(src, Some(id)).unwrap().warnings().is_empty());

        let (mut loud, id) = engine(CompileOptions {
            collect_warnings: true,
            ..CompileOptions::default()
        });
        let program = loud.compile(src, Some(id)).unwrap();
        assert_eq!(program.warnings().len(), 1);
        assert_eq!(program.warnings()[0].severity, Severity::Warning);
        assert!(program.warnings()[0].message.contains("'unused'"));
    }

    #[test]
    fn dynamic_statistics_reported() {
        let (mut engine, id) = engine(CompileOptions::default());
        let typed = engine.compile("return Count + 1;", Some(id)).unwrap();
        assert!(!typed.uses_dynamic());
        assert_eq!(typed.dynamic_op_count(), 0);

        let mixed = engine
            .compile("var v; if (Count > 1) v = 1; else v = \"s\"; return v + 1;", Some(id))
            .unwrap();
        assert!(mixed.uses_dynamic());
        assert!(mixed.dynamic_op_count() > 0);
    }

    #[test]
    fn wrong_input_type_is_rejected() {
        struct Other;
        let (mut engine, id) = engine(CompileOptions::default());
        let other = engine.register_type(TypeBuilder::<Other>::new("Other").build()).unwrap();
        let program = engine.compile("return 1;", Some(id)).unwrap();
        let err = program.run(&HostObject::new(other, "Other", Other)).unwrap_err();
        assert!(matches!(err, RuntimeError::TypeMismatch { .. }));
    }

    #[test]
    fn unregistered_values_cannot_become_inputs() {
        let engine = ScriptEngine::default();
        assert!(matches!(
            engine.host_object(fixture::sample_order()),
            Err(TypeError::NotRegistered(_))
        ));
    }

    #[test]
    fn private_input_type_fails_to_compile() {
        struct Secret;
        let mut engine = ScriptEngine::default();
        let id = engine.types.declare("Secret");
        let _ = engine
            .types
            .define(id, TypeBuilder::<Secret>::new("Secret").private_type().build());
        let diags = engine.compile("return 1;", Some(id)).unwrap_err();
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].kind, ErrorKind::Host);
    }

    #[test]
    fn standalone_scripts_run_without_input() {
        let mut engine = ScriptEngine::default();
        let program = engine.compile("var f = (n) => n * 2; return f(21);", None).unwrap();
        assert_eq!(program.run_without_input(&BufferSink::new()).unwrap().as_number(), Some(42.0));
    }

    #[test]
    fn eval_failures_unify_into_script_error() {
        let (mut engine, _) = engine(CompileOptions::default());
        let order = engine.host_object(fixture::sample_order()).unwrap();
        assert!(matches!(engine.eval("return missing;", &order), Err(ScriptError::Compile(_))));
        assert!(matches!(engine.eval("Fail(); return 1;", &order), Err(ScriptError::Runtime(_))));
    }
}
