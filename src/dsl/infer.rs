//! Shape inference.
//!
//! One walk over the script assigns every expression a shape. Lambda
//! bodies are analyzed lazily from their call sites, once per distinct
//! tuple of argument shapes, each time in a fresh shape layer. After the
//! walk every lambda literal also gets a generic analysis (all parameters
//! unknown) inside a sandbox that cannot widen anything created before it.
//!
//! A storage location widened after it was read makes earlier reads
//! stale; the pass is then repeated with that location unknown from the
//! start.

#![allow(clippy::wildcard_imports)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};

use super::ast::*;
use super::builtins::{self, BuiltinKind, BuiltinReceiver};
use super::error::{dedup_errors, CompileError};
use super::host::{Container, HostTypeId, MemberKind, TypeRef};
use super::options::CompileOptions;
use super::scope::{ScopeKind, Symbol, SymbolTable};
use super::shape::{
    CallSignature, Concrete, LambdaShape, LayerId, MethodShape, Shape, ShapeArena, ShapeId,
    ShapeTable, Widening,
};
use super::types::{MemberInfo, Receiver, TypeManager};

/// What an identifier refers to.
#[derive(Debug, Clone)]
pub enum Resolution {
    Local(Symbol),
    /// A member of the input object.
    Input(Arc<MemberInfo>),
}

/// How `receiver.name` is accessed, given the receiver's shape.
#[derive(Debug, Clone)]
pub enum MemberTarget {
    RecordField(ShapeId),
    /// Record shape without the field.
    MissingField(ShapeId),
    ArrayLength,
    ArrayAdd,
    StringLength,
    Host(Arc<MemberInfo>),
    Extension(Arc<MemberInfo>),
    Dynamic,
    NoMember,
}

pub fn resolve_member(arena: &ShapeArena, types: &TypeManager, shape: ShapeId, name: &str) -> MemberTarget {
    let shape = arena.resolve(shape);
    let extension = |receiver| {
        types
            .extension(receiver, name)
            .map_or(MemberTarget::NoMember, |m| MemberTarget::Extension(Arc::clone(m)))
    };
    match arena.get(shape) {
        Shape::Unknown | Shape::Undetermined => MemberTarget::Dynamic,
        Shape::Record { fields, .. } => {
            if fields.contains_key(name) {
                MemberTarget::RecordField(shape)
            } else {
                match extension(Receiver::Record) {
                    MemberTarget::NoMember => MemberTarget::MissingField(shape),
                    ext => ext,
                }
            }
        }
        Shape::Array { .. } => match builtins::lookup(BuiltinReceiver::Array, name).map(|b| b.kind) {
            Some(BuiltinKind::Length) => MemberTarget::ArrayLength,
            Some(BuiltinKind::Add) => MemberTarget::ArrayAdd,
            None => extension(Receiver::Array),
        },
        Shape::Concrete(Concrete::String) => match builtins::lookup(BuiltinReceiver::String, name) {
            Some(_) => MemberTarget::StringLength,
            None => extension(Receiver::String),
        },
        Shape::Concrete(Concrete::Number) => extension(Receiver::Number),
        Shape::Concrete(Concrete::Bool) => extension(Receiver::Bool),
        Shape::Concrete(Concrete::Host(id)) => match types.type_info(*id).and_then(|t| t.get_member(name)) {
            Some(m) if m.is_extension() => MemberTarget::Extension(Arc::clone(m)),
            Some(m) => MemberTarget::Host(Arc::clone(m)),
            None => MemberTarget::NoMember,
        },
        Shape::Method(_) | Shape::MethodReturn { .. } | Shape::Forward(_) => MemberTarget::NoMember,
    }
}

/// Shape of a value produced by the host as `ty`.
pub fn shape_of_type(arena: &mut ShapeArena, ty: &TypeRef) -> ShapeId {
    match ty {
        TypeRef::Number(_) => ShapeArena::NUMBER,
        TypeRef::Bool => ShapeArena::BOOL,
        TypeRef::String => ShapeArena::STRING,
        TypeRef::Host(id) => arena.host(*id),
        _ => ShapeArena::UNKNOWN,
    }
}

/// Result of analyzing a script.
#[derive(Debug)]
pub struct Analysis {
    pub arena: ShapeArena,
    pub table: ShapeTable,
    pub resolutions: HashMap<NodeId, Resolution>,
    /// Symbols referenced from a lambda other than the one declaring them.
    pub captured: HashSet<Symbol>,
    /// Outer symbols each lambda body uses, directly or through nested lambdas.
    pub lambda_captures: HashMap<NodeId, IndexSet<Symbol>>,
    pub input: Option<HostTypeId>,
    pub warnings: Vec<CompileError>,
    pub passes: usize,
}

impl Analysis {
    pub fn shape(&self, stack: &[LayerId], node: NodeId) -> ShapeId {
        self.table.get_shape(stack, node).unwrap_or(ShapeArena::UNKNOWN)
    }
}

/// Infer shapes for `script` run against an input of type `input`.
#[tracing::instrument(skip_all)]
pub fn analyze(
    script: &Script,
    types: &TypeManager,
    input: Option<HostTypeId>,
    options: &CompileOptions,
) -> Result<Analysis, Vec<CompileError>> {
    let lambdas = collect_lambdas(script);
    let max_passes = options.max_passes.max(1);
    let mut widening = Widening::default();
    let mut pass = 1;
    loop {
        let mut analyzer = Analyzer::new(types, options, input, &lambdas, widening);
        analyzer.run(script);
        let unstable = analyzer.arena.is_unstable();
        if unstable && pass < max_passes {
            tracing::debug!(pass, "storage widened after being read, repeating analysis");
            widening = analyzer.arena.into_widening();
            pass += 1;
            continue;
        }
        if unstable {
            tracing::warn!(pass, "shape analysis did not settle, stale reads are guarded at runtime");
        }
        tracing::debug!(
            passes = pass,
            shapes = analyzer.arena.len(),
            layers = analyzer.table.layer_count(),
            "analysis finished"
        );
        return analyzer.finish(pass);
    }
}

/// An assignable location, analyzed before the value.
enum Place {
    Local(Symbol),
    Input(Arc<MemberInfo>),
    Member { object: ShapeId, name: String },
    Index { object: ShapeId, index: ShapeId },
    Invalid,
}

struct Analyzer<'a> {
    types: &'a TypeManager,
    options: &'a CompileOptions,
    input: Option<HostTypeId>,
    lambdas: &'a HashMap<NodeId, &'a Lambda>,
    arena: ShapeArena,
    table: ShapeTable,
    scopes: SymbolTable,
    stack: Vec<LayerId>,
    fn_chain: Vec<NodeId>,
    returns: Vec<Vec<ShapeId>>,
    guard: HashSet<NodeId>,
    pending_generic: VecDeque<ShapeId>,
    decl_reads: HashSet<(LayerId, NodeId)>,
    read_symbols: HashSet<Symbol>,
    declared: Vec<(Symbol, String, Span)>,
    resolutions: HashMap<NodeId, Resolution>,
    symbol_owner: HashMap<Symbol, Option<NodeId>>,
    captured: HashSet<Symbol>,
    lambda_captures: HashMap<NodeId, IndexSet<Symbol>>,
    errors: Vec<CompileError>,
    warnings: Vec<CompileError>,
}

impl<'a> Analyzer<'a> {
    fn new(
        types: &'a TypeManager,
        options: &'a CompileOptions,
        input: Option<HostTypeId>,
        lambdas: &'a HashMap<NodeId, &'a Lambda>,
        widening: Widening,
    ) -> Self {
        Self {
            types,
            options,
            input,
            lambdas,
            arena: ShapeArena::new(widening),
            table: ShapeTable::new(),
            scopes: SymbolTable::new(),
            stack: vec![ShapeTable::ROOT],
            fn_chain: Vec::new(),
            returns: Vec::new(),
            guard: HashSet::new(),
            pending_generic: VecDeque::new(),
            decl_reads: HashSet::new(),
            read_symbols: HashSet::new(),
            declared: Vec::new(),
            resolutions: HashMap::new(),
            symbol_owner: HashMap::new(),
            captured: HashSet::new(),
            lambda_captures: HashMap::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn run(&mut self, script: &Script) {
        self.returns.push(Vec::new());
        self.stmts(&script.body);
        self.returns.pop();

        while let Some(method) = self.pending_generic.pop_front() {
            let arena_saved = self.arena.freeze();
            let table_saved = self.table.freeze();
            let generic = self.analyze_signature(method, None);
            self.arena.thaw(arena_saved);
            self.table.thaw(table_saved);
            if let Some(lambda) = self.arena.lambda_mut(method) {
                lambda.generic = generic;
            }
        }

        for (symbol, name, span) in std::mem::take(&mut self.declared) {
            if !self.read_symbols.contains(&symbol) {
                self.warnings
                    .push(CompileError::warning(format!("Variable '{name}' is never read"), span));
            }
        }
    }

    fn finish(self, passes: usize) -> Result<Analysis, Vec<CompileError>> {
        let errors = dedup_errors(self.errors);
        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(Analysis {
            arena: self.arena,
            table: self.table,
            resolutions: self.resolutions,
            captured: self.captured,
            lambda_captures: self.lambda_captures,
            input: self.input,
            warnings: dedup_errors(self.warnings),
            passes,
        })
    }

    fn error(&mut self, message: impl Into<String>, span: Span) {
        self.errors.push(CompileError::type_error(message, span));
    }

    fn record(&mut self, node: NodeId, shape: ShapeId, span: Span) -> ShapeId {
        if let Err(e) = self.table.set_shape(&self.stack, node, shape, false) {
            debug_assert!(false, "{e}");
            self.errors.push(CompileError::compiler(e.to_string(), span));
        }
        shape
    }

    // ── Symbols ─────────────────────────────────────────────────

    fn declare(&mut self, name: &str, symbol: Symbol, shape: ShapeId, span: Span) {
        let node = symbol.node();
        let shape = if self.arena.is_decl_forced(node) {
            ShapeArena::UNKNOWN
        } else {
            shape
        };
        self.record(node, shape, span);
        if let Err(e) = self.scopes.register(name, symbol, span.start) {
            self.errors.push(CompileError::scope(e.to_string(), span));
        }
        self.symbol_owner.insert(symbol, self.fn_chain.last().copied());
        if matches!(symbol, Symbol::Variable(_)) {
            self.declared.push((symbol, name.to_string(), span));
        }
    }

    fn note_capture(&mut self, symbol: Symbol) {
        let owner = self.symbol_owner.get(&symbol).copied().flatten();
        if owner == self.fn_chain.last().copied() {
            return;
        }
        self.captured.insert(symbol);
        let start = match owner {
            Some(owner) => match self.fn_chain.iter().position(|l| *l == owner) {
                Some(i) => i + 1,
                None => return,
            },
            None => 0,
        };
        for lambda in self.fn_chain.get(start..).unwrap_or(&[]) {
            self.lambda_captures.entry(*lambda).or_default().insert(symbol);
        }
    }

    fn input_member(&self, name: &str) -> Option<Arc<MemberInfo>> {
        self.input
            .and_then(|id| self.types.type_info(id))
            .and_then(|info| info.get_member(name))
            .cloned()
    }

    fn read_symbol(&mut self, symbol: Symbol) -> ShapeId {
        self.note_capture(symbol);
        self.read_symbols.insert(symbol);
        let node = symbol.node();
        if let Some(layer) = self.table.find_layer(&self.stack, node) {
            self.decl_reads.insert((layer, node));
        }
        self.table
            .get_shape(&self.stack, node)
            .unwrap_or(ShapeArena::UNKNOWN)
    }

    fn ident(&mut self, expr: &Expr, name: &str) -> ShapeId {
        if let Some((symbol, _)) = self.scopes.find_going_up(name, expr.span.start) {
            self.resolutions.insert(expr.id, Resolution::Local(symbol));
            return self.read_symbol(symbol);
        }
        if let Some(member) = self.input_member(name) {
            self.resolutions.insert(expr.id, Resolution::Input(Arc::clone(&member)));
            return self.host_member_shape(&member, expr.span);
        }
        self.errors
            .push(CompileError::scope(format!("Undeclared identifier '{name}'"), expr.span));
        ShapeArena::UNKNOWN
    }

    // ── Statements ──────────────────────────────────────────────

    fn stmts(&mut self, stmts: &[Stmt]) {
        let mut returned = false;
        let mut warned = false;
        for stmt in stmts {
            if returned && !warned {
                self.warnings
                    .push(CompileError::warning("Unreachable code after return", stmt.span));
                warned = true;
            }
            self.stmt(stmt);
            returned |= always_returns(std::slice::from_ref(stmt));
        }
    }

    fn stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Block(body) => {
                self.scopes.declare_scope(ScopeKind::Block);
                self.stmts(body);
                self.scopes.end_scope();
            }
            StmtKind::Var {
                name,
                name_span,
                init,
            } => {
                let shape = match init {
                    Some(init) => self.expr(init),
                    None => ShapeArena::UNDETERMINED,
                };
                self.declare(name, Symbol::Variable(stmt.id), shape, *name_span);
            }
            StmtKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                self.condition(condition);
                self.stmt(then_branch);
                if let Some(else_branch) = else_branch {
                    self.stmt(else_branch);
                }
            }
            StmtKind::While { condition, body } => {
                self.condition(condition);
                self.stmt(body);
            }
            StmtKind::For {
                init,
                condition,
                step,
                body,
            } => {
                self.scopes.declare_scope(ScopeKind::Block);
                if let Some(init) = init {
                    self.stmt(init);
                }
                if let Some(condition) = condition {
                    self.condition(condition);
                }
                self.stmt(body);
                if let Some(step) = step {
                    self.stmt(step);
                }
                self.scopes.end_scope();
            }
            StmtKind::Return(value) => {
                let shape = match value {
                    Some(value) => self.expr(value),
                    None => ShapeArena::UNKNOWN,
                };
                if let Some(returns) = self.returns.last_mut() {
                    returns.push(shape);
                }
            }
            StmtKind::Print(value) => {
                if !self.options.allow_print {
                    self.error("print statements are not allowed", stmt.span);
                }
                self.expr(value);
            }
            StmtKind::Expr(expr) => {
                self.expr(expr);
            }
            StmtKind::Assign { target, value } => {
                let place = self.place(target);
                let shape = self.expr(value);
                self.store(&place, shape, stmt.span);
            }
            StmtKind::Increment { target, op } => {
                let place = self.place(target);
                let current = self.place_shape(&place, target);
                self.record(target.id, current, target.span);
                let symbol = match op {
                    IncOp::Increment => "++",
                    IncOp::Decrement => "--",
                };
                let result = if self.arena.is_dynamic(current) {
                    ShapeArena::UNKNOWN
                } else if self.arena.is(current, Concrete::Number) {
                    ShapeArena::NUMBER
                } else {
                    let found = self.arena.describe(current);
                    self.error(format!("Operator '{symbol}' cannot be applied to {found}"), stmt.span);
                    ShapeArena::UNKNOWN
                };
                self.store(&place, result, stmt.span);
            }
        }
    }

    fn condition(&mut self, expr: &Expr) -> ShapeId {
        let shape = self.expr(expr);
        if !self.arena.is_dynamic(shape) && !self.arena.is(shape, Concrete::Bool) {
            let found = self.arena.describe(shape);
            self.error(format!("Condition must be Bool, got {found}"), expr.span);
        }
        shape
    }

    // ── Stores ──────────────────────────────────────────────────

    fn place(&mut self, target: &Expr) -> Place {
        match &target.kind {
            ExprKind::Ident(name) => {
                if let Some((symbol, _)) = self.scopes.find_going_up(name, target.span.start) {
                    self.note_capture(symbol);
                    self.resolutions.insert(target.id, Resolution::Local(symbol));
                    return Place::Local(symbol);
                }
                if let Some(member) = self.input_member(name) {
                    self.resolutions.insert(target.id, Resolution::Input(Arc::clone(&member)));
                    return Place::Input(member);
                }
                self.errors
                    .push(CompileError::scope(format!("Undeclared identifier '{name}'"), target.span));
                Place::Invalid
            }
            ExprKind::Member { object, name, .. } => {
                let object = self.expr(object);
                Place::Member {
                    object,
                    name: name.clone(),
                }
            }
            ExprKind::Index { object, index } => {
                let object = self.expr(object);
                let index = self.expr(index);
                Place::Index { object, index }
            }
            _ => {
                self.errors
                    .push(CompileError::parser("Invalid assignment target", target.span));
                Place::Invalid
            }
        }
    }

    /// Current shape of a place, read for `++`/`--`.
    fn place_shape(&mut self, place: &Place, target: &Expr) -> ShapeId {
        match place {
            Place::Local(symbol) => self.read_symbol(*symbol),
            Place::Input(member) => self.host_member_shape(member, target.span),
            Place::Member { object, name } => {
                let target_kind = resolve_member(&self.arena, self.types, *object, name);
                self.member_shape(*object, name, target_kind, target.span)
            }
            Place::Index { object, index } => self.index_shape(*object, *index, target.span),
            Place::Invalid => ShapeArena::UNKNOWN,
        }
    }

    fn store(&mut self, place: &Place, value: ShapeId, span: Span) {
        match place {
            Place::Local(symbol) => self.store_local(*symbol, value),
            Place::Input(member) => self.check_host_store(member, value, span),
            Place::Member { object, name } => match resolve_member(&self.arena, self.types, *object, name) {
                MemberTarget::RecordField(record) | MemberTarget::MissingField(record) => {
                    self.arena.write_field(record, name, value);
                }
                MemberTarget::Host(member) => self.check_host_store(&member, value, span),
                MemberTarget::Dynamic => {}
                MemberTarget::ArrayLength | MemberTarget::StringLength => {
                    self.error(format!("Member '{name}' is read-only"), span);
                }
                MemberTarget::ArrayAdd | MemberTarget::Extension(_) => {
                    self.error(format!("Cannot assign to method '{name}'"), span);
                }
                MemberTarget::NoMember => {
                    let found = self.arena.describe(*object);
                    self.error(format!("{found} has no member '{name}'"), span);
                }
            },
            Place::Index { object, index } => {
                let object = *object;
                match self.arena.resolved(object) {
                    Shape::Array { .. } => {
                        self.check_array_index(*index, span);
                        self.arena.write_element(object, value);
                    }
                    Shape::Concrete(Concrete::Host(id)) => {
                        let indexer = self.types.type_info(*id).and_then(|t| t.indexer.clone());
                        match indexer {
                            Some(indexer) => {
                                if !indexer.is_writable() {
                                    self.error(format!("Indexer of '{}' is read-only", indexer.owner), span);
                                }
                                if let MemberKind::Indexer { key, ty, .. } = &indexer.kind {
                                    self.check_accepts(key, *index, "index", &indexer.owner, span);
                                    self.check_accepts(ty, value, "value", &indexer.owner, span);
                                }
                            }
                            None => self.not_indexable(object, span),
                        }
                    }
                    Shape::Unknown | Shape::Undetermined | Shape::Record { .. } => {}
                    _ => self.not_indexable(object, span),
                }
            }
            Place::Invalid => {}
        }
    }

    fn store_local(&mut self, symbol: Symbol, value: ShapeId) {
        let node = symbol.node();
        let Some(old) = self.table.get_shape(&self.stack, node) else {
            return;
        };
        let derived = self.arena.derive(old, value);
        if self.arena.resolve(derived) == self.arena.resolve(old) {
            return;
        }
        // Suppressed (None) inside the generic sandbox: the store is
        // compiled as a guarded coercion into the existing storage.
        if let Ok(Some(layer)) = self.table.set_shape(&self.stack, node, derived, true) {
            if self.decl_reads.contains(&(layer, node)) {
                self.arena.force_decl(node);
            }
        }
    }

    fn check_host_store(&mut self, member: &MemberInfo, value: ShapeId, span: Span) {
        if !member.is_writable() {
            self.error(format!("Member '{}' is read-only", member.qualified_name()), span);
            return;
        }
        if let Some(ty) = member.value_type() {
            let ty = ty.clone();
            self.check_accepts(&ty, value, "member", &member.qualified_name(), span);
        }
    }

    fn host_accepts(&self, ty: &TypeRef, value: ShapeId) -> bool {
        if self.arena.is_dynamic(value) {
            return true;
        }
        match ty {
            TypeRef::Any => true,
            TypeRef::Number(_) => self.arena.is(value, Concrete::Number),
            TypeRef::Bool => self.arena.is(value, Concrete::Bool),
            TypeRef::String => self.arena.is(value, Concrete::String),
            TypeRef::Host(id) => self.arena.is(value, Concrete::Host(*id)),
            TypeRef::Record => matches!(self.arena.resolved(value), Shape::Record { .. }),
            TypeRef::Array => matches!(self.arena.resolved(value), Shape::Array { .. }),
            TypeRef::Function => matches!(self.arena.resolved(value), Shape::Method(_)),
            TypeRef::Generic { container, args } => match (container, args.as_slice()) {
                (Container::Nullable, [inner]) => self.host_accepts(inner, value),
                (Container::List | Container::Iterable, _) => {
                    matches!(self.arena.resolved(value), Shape::Array { .. })
                }
                _ => false,
            },
            TypeRef::Null | TypeRef::Void | TypeRef::Pointer(_) => false,
        }
    }

    fn check_accepts(&mut self, ty: &TypeRef, value: ShapeId, what: &str, owner: &str, span: Span) {
        if !self.host_accepts(ty, value) {
            let found = self.arena.describe(value);
            self.error(format!("Cannot use {found} as {what} of '{owner}', expected {ty}"), span);
        }
    }

    // ── Expressions ─────────────────────────────────────────────

    fn expr(&mut self, expr: &Expr) -> ShapeId {
        let shape = self.expr_kind(expr);
        self.record(expr.id, shape, expr.span)
    }

    fn expr_kind(&mut self, expr: &Expr) -> ShapeId {
        match &expr.kind {
            ExprKind::Literal(lit) => match lit {
                Literal::Number(_) => ShapeArena::NUMBER,
                Literal::Str(_) => ShapeArena::STRING,
                Literal::Bool(_) => ShapeArena::BOOL,
                Literal::Null => ShapeArena::UNKNOWN,
            },
            ExprKind::Binary { op, left, right } => {
                let l = self.expr(left);
                let r = self.expr(right);
                self.binary(*op, l, r, expr.span)
            }
            ExprKind::Logical { left, right, .. } => {
                self.condition(left);
                self.condition(right);
                ShapeArena::BOOL
            }
            ExprKind::Unary { op, operand } => match op {
                UnaryOp::Not => {
                    self.condition(operand);
                    ShapeArena::BOOL
                }
                UnaryOp::Neg => {
                    let shape = self.expr(operand);
                    if self.arena.is(shape, Concrete::Number) {
                        ShapeArena::NUMBER
                    } else {
                        if !self.arena.is_dynamic(shape) {
                            let found = self.arena.describe(shape);
                            self.error(format!("Operator '-' cannot be applied to {found}"), expr.span);
                        }
                        ShapeArena::UNKNOWN
                    }
                }
            },
            ExprKind::Grouping(inner) => self.expr(inner),
            ExprKind::Ident(name) => self.ident(expr, name),
            ExprKind::Member { object, name, .. } => {
                let object = self.expr(object);
                let target = resolve_member(&self.arena, self.types, object, name);
                self.member_shape(object, name, target, expr.span)
            }
            ExprKind::Index { object, index } => {
                let object = self.expr(object);
                let index = self.expr(index);
                self.index_shape(object, index, expr.span)
            }
            ExprKind::Call { callee, args } => self.call(expr, callee, args),
            ExprKind::Lambda(lambda) => {
                let shape = self.arena.new_method(MethodShape::Lambda(LambdaShape {
                    node: expr.id,
                    param_count: lambda.params.len(),
                    def_scope: self.scopes.current(),
                    body_scope: None,
                    env: self.stack.clone(),
                    fn_chain: self.fn_chain.clone(),
                    signatures: Vec::new(),
                    generic: None,
                }));
                self.pending_generic.push_back(shape);
                shape
            }
            ExprKind::Object(props) => {
                if !self.options.allow_literals {
                    self.error("Object literals are not allowed", expr.span);
                }
                let mut fields = IndexMap::new();
                for prop in props {
                    let shape = self.expr(&prop.value);
                    if fields.insert(prop.name.clone(), shape).is_some() {
                        self.error(format!("Duplicate property '{}'", prop.name), prop.span);
                    }
                }
                self.arena.new_record(expr.id, fields)
            }
            ExprKind::Array(items) => {
                if !self.options.allow_literals {
                    self.error("Array literals are not allowed", expr.span);
                }
                let mut element = ShapeArena::UNDETERMINED;
                for item in items {
                    let shape = self.expr(item);
                    element = self.arena.derive(element, shape);
                }
                self.arena.new_array(expr.id, element)
            }
            ExprKind::Interpolated(parts) => {
                for part in parts {
                    if let InterpPart::Expr(e) = part {
                        self.expr(e);
                    }
                }
                ShapeArena::STRING
            }
        }
    }

    fn binary(&mut self, op: BinOp, l: ShapeId, r: ShapeId, span: Span) -> ShapeId {
        let dynamic = self.arena.is_dynamic(l) || self.arena.is_dynamic(r);
        let num = |a: &ShapeArena, s| a.is(s, Concrete::Number);
        let string = |a: &ShapeArena, s| a.is(s, Concrete::String);
        let ok = match op {
            BinOp::Eq | BinOp::Ne => return ShapeArena::BOOL,
            BinOp::Add => {
                if dynamic {
                    return ShapeArena::UNKNOWN;
                }
                if string(&self.arena, l) || string(&self.arena, r) {
                    return ShapeArena::STRING;
                }
                num(&self.arena, l) && num(&self.arena, r)
            }
            _ if op.is_ordering() => {
                dynamic
                    || (num(&self.arena, l) && num(&self.arena, r))
                    || (string(&self.arena, l) && string(&self.arena, r))
            }
            _ => {
                if dynamic {
                    return ShapeArena::UNKNOWN;
                }
                num(&self.arena, l) && num(&self.arena, r)
            }
        };
        if !ok {
            let (left, right) = (self.arena.describe(l), self.arena.describe(r));
            self.error(
                format!("Operator '{}' cannot be applied to {left} and {right}", op.symbol()),
                span,
            );
        }
        if op.is_ordering() {
            ShapeArena::BOOL
        } else if ok {
            ShapeArena::NUMBER
        } else {
            ShapeArena::UNKNOWN
        }
    }

    fn host_member_shape(&mut self, member: &Arc<MemberInfo>, span: Span) -> ShapeId {
        if member.is_callable() {
            return self.arena.new_method(MethodShape::Host {
                member: Arc::clone(member),
            });
        }
        if !member.is_readable() {
            self.error(format!("Member '{}' is write-only", member.qualified_name()), span);
            return ShapeArena::UNKNOWN;
        }
        match member.value_type() {
            Some(ty) => shape_of_type(&mut self.arena, ty),
            None => ShapeArena::UNKNOWN,
        }
    }

    fn member_shape(&mut self, object: ShapeId, name: &str, target: MemberTarget, span: Span) -> ShapeId {
        match target {
            MemberTarget::RecordField(record) => self
                .arena
                .read_field(record, name)
                .unwrap_or(ShapeArena::UNKNOWN),
            MemberTarget::MissingField(record) => {
                // Sandboxed code may not add fields to records that predate
                // it; such reads go through the dynamic path instead.
                if !self.arena.is_frozen(record) {
                    self.error(format!("Record has no field '{name}'"), span);
                }
                ShapeArena::UNKNOWN
            }
            MemberTarget::ArrayLength | MemberTarget::StringLength => ShapeArena::NUMBER,
            MemberTarget::ArrayAdd | MemberTarget::Dynamic => ShapeArena::UNKNOWN,
            MemberTarget::Host(member) | MemberTarget::Extension(member) => {
                self.host_member_shape(&member, span)
            }
            MemberTarget::NoMember => {
                let found = self.arena.describe(object);
                self.error(format!("{found} has no member '{name}'"), span);
                ShapeArena::UNKNOWN
            }
        }
    }

    fn check_array_index(&mut self, index: ShapeId, span: Span) {
        if !self.arena.is_dynamic(index) && !self.arena.is(index, Concrete::Number) {
            let found = self.arena.describe(index);
            self.error(format!("Array index must be a Number, got {found}"), span);
        }
    }

    fn not_indexable(&mut self, object: ShapeId, span: Span) {
        let found = self.arena.describe(object);
        self.error(format!("Cannot index {found}"), span);
    }

    fn index_shape(&mut self, object: ShapeId, index: ShapeId, span: Span) -> ShapeId {
        match self.arena.resolved(object) {
            Shape::Array { .. } => {
                self.check_array_index(index, span);
                self.arena.read_element(object).unwrap_or(ShapeArena::UNKNOWN)
            }
            Shape::Concrete(Concrete::Host(id)) => {
                let indexer = self.types.type_info(*id).and_then(|t| t.indexer.clone());
                match indexer {
                    Some(indexer) => match &indexer.kind {
                        MemberKind::Indexer { key, ty, .. } => {
                            self.check_accepts(key, index, "index", &indexer.owner, span);
                            shape_of_type(&mut self.arena, ty)
                        }
                        _ => ShapeArena::UNKNOWN,
                    },
                    None => {
                        self.not_indexable(object, span);
                        ShapeArena::UNKNOWN
                    }
                }
            }
            Shape::Concrete(Concrete::String) => {
                self.check_array_index(index, span);
                ShapeArena::STRING
            }
            Shape::Unknown | Shape::Undetermined | Shape::Record { .. } => ShapeArena::UNKNOWN,
            _ => {
                self.not_indexable(object, span);
                ShapeArena::UNKNOWN
            }
        }
    }

    // ── Calls ───────────────────────────────────────────────────

    fn call(&mut self, expr: &Expr, callee: &Expr, args: &[Expr]) -> ShapeId {
        if let ExprKind::Member { object, name, .. } = &callee.kind {
            let receiver = self.expr(object);
            let target = resolve_member(&self.arena, self.types, receiver, name);
            match target.clone() {
                MemberTarget::Host(member) | MemberTarget::Extension(member) if member.is_callable() => {
                    let method = self.arena.new_method(MethodShape::Host {
                        member: Arc::clone(&member),
                    });
                    self.record(callee.id, method, callee.span);
                    let arg_shapes = self.args(args);
                    return self.host_call(&member, &arg_shapes, expr.span);
                }
                MemberTarget::ArrayAdd => {
                    self.record(callee.id, ShapeArena::UNKNOWN, callee.span);
                    let arg_shapes = self.args(args);
                    if arg_shapes.len() == 1 {
                        self.arena.write_element(receiver, arg_shapes[0]);
                    } else {
                        self.error(
                            format!("'add' expects 1 argument(s), got {}", arg_shapes.len()),
                            expr.span,
                        );
                    }
                    return ShapeArena::UNKNOWN;
                }
                MemberTarget::Dynamic => {
                    self.record(callee.id, ShapeArena::UNKNOWN, callee.span);
                    self.args(args);
                    return ShapeArena::UNKNOWN;
                }
                _ => {
                    let shape = self.member_shape(receiver, name, target, callee.span);
                    let shape = self.record(callee.id, shape, callee.span);
                    return self.call_value(expr, shape, args);
                }
            }
        }
        let shape = self.expr(callee);
        self.call_value(expr, shape, args)
    }

    fn args(&mut self, args: &[Expr]) -> Vec<ShapeId> {
        args.iter().map(|a| self.expr(a)).collect()
    }

    fn call_value(&mut self, expr: &Expr, callee: ShapeId, args: &[Expr]) -> ShapeId {
        let arg_shapes = self.args(args);
        match self.arena.resolved(callee) {
            Shape::Method(MethodShape::Lambda(_)) => self.ensure_signature(callee, &arg_shapes, expr.span),
            Shape::Method(MethodShape::Host { member }) => {
                let member = Arc::clone(member);
                self.host_call(&member, &arg_shapes, expr.span)
            }
            Shape::Unknown | Shape::Undetermined => ShapeArena::UNKNOWN,
            _ => {
                let found = self.arena.describe(callee);
                self.error(format!("{found} is not callable"), expr.span);
                ShapeArena::UNKNOWN
            }
        }
    }

    fn host_call(&mut self, member: &Arc<MemberInfo>, args: &[ShapeId], span: Span) -> ShapeId {
        let params = member.call_params().to_vec();
        if params.len() != args.len() {
            self.error(
                format!(
                    "'{}' expects {} argument(s), got {}",
                    member.qualified_name(),
                    params.len(),
                    args.len()
                ),
                span,
            );
        } else {
            for (i, (param, arg)) in params.iter().zip(args).enumerate() {
                self.check_accepts(param, *arg, &format!("argument {}", i + 1), &member.qualified_name(), span);
            }
        }
        match member.ret() {
            Some(ty) => shape_of_type(&mut self.arena, ty),
            None => ShapeArena::UNKNOWN,
        }
    }

    /// Resolve a call to a lambda against its signatures, analyzing the
    /// body for a new argument tuple.
    fn ensure_signature(&mut self, method: ShapeId, args: &[ShapeId], span: Span) -> ShapeId {
        let Some(lambda) = self.arena.lambda(method) else {
            return ShapeArena::UNKNOWN;
        };
        if lambda.param_count != args.len() {
            let expected = lambda.param_count;
            self.error(
                format!(
                    "Cannot call lambda with {} argument(s), it takes {expected}",
                    args.len()
                ),
                span,
            );
            return ShapeArena::UNKNOWN;
        }
        let wanted: Vec<ShapeId> = args.iter().map(|a| self.arena.resolve(*a)).collect();
        let existing = lambda.signatures.iter().position(|sig| {
            sig.args
                .iter()
                .map(|a| self.arena.resolve(*a))
                .eq(wanted.iter().copied())
        });
        if let Some(index) = existing {
            return self.arena.new_call(method, index);
        }
        match self.analyze_signature(method, Some(args)) {
            Some(signature) => {
                let Some(lambda) = self.arena.lambda_mut(method) else {
                    return ShapeArena::UNKNOWN;
                };
                lambda.signatures.push(signature);
                let index = lambda.signatures.len() - 1;
                tracing::trace!(lambda = ?lambda.node, index, "call signature created");
                self.arena.new_call(method, index)
            }
            None => {
                self.warnings
                    .push(CompileError::warning("Recursive call resolved dynamically", span));
                ShapeArena::UNKNOWN
            }
        }
    }

    /// Analyze a lambda body for the given argument shapes (`None` for the
    /// generic entry). Returns `None` when the lambda is already being
    /// analyzed further up.
    fn analyze_signature(&mut self, method: ShapeId, args: Option<&[ShapeId]>) -> Option<CallSignature> {
        let shape = self.arena.lambda(method)?.clone();
        let lambda = *self.lambdas.get(&shape.node)?;
        if !self.guard.insert(shape.node) {
            return None;
        }

        let saved_scope = self.scopes.current();
        let saved_stack = std::mem::replace(&mut self.stack, shape.env.clone());
        let saved_chain = std::mem::replace(&mut self.fn_chain, shape.fn_chain.clone());

        self.scopes.set_current(shape.def_scope);
        let body_scope = match shape.body_scope {
            Some(scope) => {
                self.scopes.reopen(scope);
                scope
            }
            None => {
                let scope = self.scopes.declare_scope(ScopeKind::Lambda);
                if let Some(l) = self.arena.lambda_mut(method) {
                    l.body_scope = Some(scope);
                }
                scope
            }
        };
        let layer = self.table.new_layer();
        self.stack.push(layer);
        self.fn_chain.push(shape.node);

        let mut arg_shapes = Vec::with_capacity(lambda.params.len());
        for (index, param) in lambda.params.iter().enumerate() {
            let arg = args
                .and_then(|a| a.get(index).copied())
                .unwrap_or(ShapeArena::UNKNOWN);
            arg_shapes.push(arg);
            let symbol = Symbol::LambdaParameter {
                lambda: shape.node,
                index,
                param: param.id,
            };
            self.declare(&param.name, symbol, arg, param.span);
        }

        self.returns.push(Vec::new());
        let ret = match &lambda.body {
            LambdaBody::Expr(body) => {
                let shape = self.expr(body);
                self.returns.pop();
                shape
            }
            LambdaBody::Block(body) => {
                self.stmts(body);
                let mut returns = self.returns.pop().unwrap_or_default();
                if !always_returns(body) {
                    returns.push(ShapeArena::UNKNOWN);
                }
                returns
                    .into_iter()
                    .fold(ShapeArena::UNDETERMINED, |acc, r| self.arena.derive(acc, r))
            }
        };

        self.scopes.set_current(body_scope);
        self.scopes.end_scope();
        self.scopes.set_current(saved_scope);
        self.stack = saved_stack;
        self.fn_chain = saved_chain;
        self.guard.remove(&shape.node);

        Some(CallSignature {
            args: arg_shapes,
            ret,
            layer,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::dsl::{fixture, lexer, parser};

    fn parse(src: &str) -> Script {
        parser::parse(lexer::lex(src).unwrap()).unwrap()
    }

    fn check(src: &str) -> (Script, Analysis) {
        let script = parse(src);
        let (types, id) = fixture::types();
        let analysis = analyze(&script, &types, Some(id), &CompileOptions::default())
            .unwrap_or_else(|errs| panic!("analysis failed: {errs:?}"));
        (script, analysis)
    }

    fn check_err(src: &str) -> Vec<CompileError> {
        let script = parse(src);
        let (types, id) = fixture::types();
        analyze(&script, &types, Some(id), &CompileOptions::default()).unwrap_err()
    }

    fn root_shape(analysis: &Analysis, node: NodeId) -> ShapeId {
        analysis.shape(&[ShapeTable::ROOT], node)
    }

    #[test]
    fn literals_and_arithmetic() {
        let (script, a) = check("var x = 2 + 3 * 4; var s = \"a\" + 1; var b = x < 3;");
        assert!(a.arena.is(root_shape(&a, script.body[0].id), Concrete::Number));
        assert!(a.arena.is(root_shape(&a, script.body[1].id), Concrete::String));
        assert!(a.arena.is(root_shape(&a, script.body[2].id), Concrete::Bool));
    }

    #[test]
    fn duplicate_declaration_reports_once() {
        let errs = check_err("var x = 1; var x = 2;");
        assert_eq!(errs.len(), 1);
        assert!(errs[0].message.contains("already declared in this scope"), "{}", errs[0].message);
    }

    #[test]
    fn shadowing_is_an_error() {
        let errs = check_err("var x = 1; { var x = 2; }");
        assert!(errs[0].message.contains("enclosing scope"));
    }

    #[test]
    fn aliased_records_share_fields() {
        let (script, a) = check("var a = {x: 1}; var b = a; b.y = \"s\"; var n = a.x;");
        let sa = root_shape(&a, script.body[0].id);
        let sb = root_shape(&a, script.body[1].id);
        assert_eq!(a.arena.resolve(sa), a.arena.resolve(sb));
        assert_eq!(a.arena.field(sa, "y"), Some(ShapeArena::STRING));
        assert!(a.arena.is(root_shape(&a, script.body[3].id), Concrete::Number));
    }

    #[test]
    fn heterogeneous_branches_become_unknown() {
        let (script, a) = check("var v; if (false) v = 1; else v = \"s\"; return v + 1;");
        assert!(a.arena.is_dynamic(root_shape(&a, script.body[0].id)));
    }

    #[test]
    fn lambda_gets_one_signature_per_argument_tuple() {
        let (script, a) = check(
            "var f = (a, b) => a + b; var n = f(1, 2); var s = f(\"x\", \"y\"); var m = f(3, 4);",
        );
        let f = root_shape(&a, script.body[0].id);
        let lambda = a.arena.lambda(f).unwrap();
        assert_eq!(lambda.signatures.len(), 2);
        assert!(a.arena.is(lambda.signatures[0].ret, Concrete::Number));
        assert!(a.arena.is(lambda.signatures[1].ret, Concrete::String));
        assert!(lambda.generic.is_some());
        assert!(a.arena.is(root_shape(&a, script.body[1].id), Concrete::Number));
        assert!(a.arena.is(root_shape(&a, script.body[2].id), Concrete::String));
    }

    #[test]
    fn recursive_lambda_resolves_dynamically() {
        let (script, a) = check(
            "var f = (n) => { if (n <= 0) return 0; return n + f(n - 1); }; var r = f(3);",
        );
        assert!(a.arena.is_dynamic(root_shape(&a, script.body[1].id)));
        assert!(a.warnings.iter().any(|w| w.message.contains("Recursive call")));
        let f = Symbol::Variable(script.body[0].id);
        assert!(a.captured.contains(&f));
    }

    #[test]
    fn widening_after_read_repeats_the_pass() {
        let (script, a) = check("var x = 1; var y = x + 1; x = \"s\";");
        assert_eq!(a.passes, 2);
        assert!(a.arena.is_dynamic(root_shape(&a, script.body[0].id)));
        assert!(a.arena.is_dynamic(root_shape(&a, script.body[1].id)));
    }

    #[test]
    fn widening_before_read_needs_no_repeat() {
        let (_, a) = check("var x = 1; x = \"s\"; var y = x;");
        assert_eq!(a.passes, 1);
    }

    #[test]
    fn host_members_are_typed() {
        let (script, a) = check("var c = Count; var d = Describe(); var t = Total(1);");
        assert!(a.arena.is(root_shape(&a, script.body[0].id), Concrete::Number));
        assert!(a.arena.is(root_shape(&a, script.body[1].id), Concrete::String));
        assert!(a.arena.is(root_shape(&a, script.body[2].id), Concrete::Number));
    }

    #[test]
    fn semantic_errors() {
        let cases = [
            ("return missing;", "Undeclared identifier 'missing'"),
            ("Price = 3;", "read-only"),
            ("Count = \"x\";", "Cannot use String"),
            ("if (1) return 1;", "Condition must be Bool"),
            ("var a = true - 1;", "cannot be applied"),
            ("var o = {x: 1}; var y = o.z;", "no field 'z'"),
            ("var f = (a) => a; f(1, 2);", "Cannot call lambda"),
            ("var n = 1; n();", "not callable"),
            ("Total();", "expects 1 argument(s)"),
            ("var x = x + 1;", "Undeclared identifier 'x'"),
        ];
        for (src, needle) in cases {
            let errs = check_err(src);
            assert!(
                errs.iter().any(|e| e.message.contains(needle)),
                "{src}: expected '{needle}', got {errs:?}"
            );
        }
    }

    #[test]
    fn disabled_constructs_are_rejected() {
        let script = parse("print 1; var o = {a: 1}; var l = [1];");
        let (types, id) = fixture::types();
        let options = CompileOptions {
            allow_print: false,
            allow_literals: false,
            ..CompileOptions::default()
        };
        let errs = analyze(&script, &types, Some(id), &options).unwrap_err();
        assert_eq!(errs.len(), 3);
    }

    #[test]
    fn closures_record_captures() {
        let (script, a) = check("var k = 2; var f = (x) => x * k; var r = f(3);");
        let k = Symbol::Variable(script.body[0].id);
        assert!(a.captured.contains(&k));
        let lambda_node = match &script.body[1].kind {
            StmtKind::Var { init: Some(init), .. } => init.id,
            _ => unreachable!(),
        };
        assert!(a.lambda_captures[&lambda_node].contains(&k));
    }

    #[test]
    fn generic_entry_does_not_widen_outer_storage() {
        let (script, a) = check("var total = 0; var f = (x) => { total = x; }; f(1);");
        assert!(a.arena.is(root_shape(&a, script.body[0].id), Concrete::Number));
    }

    #[test]
    fn warnings_are_collected() {
        let (_, a) = check("var unused = 1; var f = () => { return 1; var dead = 2; }; f();");
        let messages: Vec<&str> = a.warnings.iter().map(|w| w.message.as_str()).collect();
        assert!(messages.iter().any(|m| m.contains("'unused' is never read")));
        assert!(messages.iter().any(|m| m.contains("Unreachable code")));
    }
}
