//! Bytecode generation.
//!
//! Every expression is compiled to the representation its shape allows:
//! numbers and booleans stay unboxed, records and arrays use their
//! materialized layouts, and anything unknown goes through the dynamic
//! operations. Code generation always tracks the representation it
//! actually pushed and inserts a wrap or a guarded unwrap wherever that
//! differs from what the consumer expects.
//!
//! Entry points are compiled from a worklist: the root, one function per
//! lambda call signature that some call site uses, and the generic entry
//! of every closure that escapes into the erased representation.

#![allow(clippy::wildcard_imports, clippy::cast_possible_truncation)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use indexmap::IndexSet;

use super::ast::*;
use super::error::CompileError;
use super::host::{HostTypeId, MemberKind, NumKind, TypeRef};
use super::infer::{resolve_member, Analysis, MemberTarget, Resolution};
use super::materialize::Materializer;
use super::scope::Symbol;
use super::shape::{Concrete, LayerId, Shape, ShapeArena, ShapeId, ShapeTable};
use super::types::{MemberInfo, TypeManager};
use super::value::{ArrayLayout, RecordLayout, Repr};

/// A compiled script ready for VM execution. Function 0 is the entry point.
#[derive(Debug)]
pub struct CompiledScript {
    pub functions: Vec<Function>,
    pub numbers: Vec<f64>,
    pub strings: Vec<Arc<str>>,
    /// Member names and diagnostic labels used by dynamic and guard ops.
    pub names: Vec<Arc<str>>,
    pub records: Vec<Arc<RecordLayout>>,
    pub arrays: Vec<Arc<ArrayLayout>>,
    pub members: Vec<HostMember>,
    pub closures: Vec<ClosureTemplate>,
    pub input_type: Option<HostTypeId>,
    /// Number of dynamic-path and guard instructions emitted.
    pub dynamic_ops: usize,
}

impl CompiledScript {
    pub fn uses_dynamic(&self) -> bool {
        self.dynamic_ops > 0
    }

    pub fn name(&self, index: u32) -> &str {
        self.names.get(index as usize).map_or("?", |n| n)
    }
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub arity: u16,
    /// Number of local variable slots needed.
    pub locals: u16,
    pub ops: Vec<Op>,
}

/// A host member referenced by typed code, with the representation its
/// results are converted to.
#[derive(Debug, Clone)]
pub struct HostMember {
    pub info: Arc<MemberInfo>,
    pub result: Repr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureSource {
    /// A cell held in a local slot of the creating function.
    Local(u16),
    /// A cell the creating function itself captured.
    Capture(u16),
}

#[derive(Debug, Clone)]
pub struct ClosureTemplate {
    pub name: String,
    /// Lambda shape id, matched by typed call sites.
    pub shape: u32,
    /// Entry point taking erased arguments.
    pub generic: u32,
    pub arity: u16,
    pub captures: Vec<CaptureSource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Gt,
    Le,
    Ge,
}

impl CmpOp {
    fn from_bin(op: BinOp) -> Option<Self> {
        match op {
            BinOp::Lt => Some(Self::Lt),
            BinOp::Gt => Some(Self::Gt),
            BinOp::Le => Some(Self::Le),
            BinOp::Ge => Some(Self::Ge),
            _ => None,
        }
    }

    pub fn test<T: PartialOrd + ?Sized>(self, a: &T, b: &T) -> bool {
        match self {
            Self::Lt => a < b,
            Self::Gt => a > b,
            Self::Le => a <= b,
            Self::Ge => a >= b,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Gt => ">",
            Self::Le => "<=",
            Self::Ge => ">=",
        }
    }
}

/// Bytecode operations for the stack-based VM.
///
/// Stores take the receiver (and index) below the value. Dynamic
/// operations accept operands in any representation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    PushNum(u32),
    PushStr(u32),
    PushBool(bool),
    PushNull,
    LoadLocal(u16),
    StoreLocal(u16),
    /// Pop the initial value into a fresh cell stored in a local slot.
    MakeCell(u16),
    LoadCell(u16),
    StoreCell(u16),
    LoadCapture(u16),
    StoreCapture(u16),
    LoadInput,
    Pop,
    Dup,
    /// Duplicate the top two values.
    Dup2,

    // Numbers
    AddNum,
    SubNum,
    MulNum,
    DivNum,
    ModNum,
    NegNum,
    CmpNum(CmpOp),
    EqNum,
    NeNum,

    // Booleans
    EqBool,
    NeBool,
    NotBool,

    // Strings
    /// Pop two values, push their concatenated display strings.
    ConcatStr,
    CmpStr(CmpOp),
    EqStr,
    NeStr,
    ToStr,
    StrLen,

    /// Identity/value equality of statically typed operands.
    EqRef,
    NeRef,

    // Representation changes
    /// Box an unboxed number or boolean.
    Wrap,
    CheckNum(u32),
    CheckBool(u32),
    CheckStr(u32),
    CheckRecord(u32, u32),
    CheckArray(u32, u32),
    CheckHost(HostTypeId, u32),
    CheckClosure(u32, u32),
    /// Convert the script number on top of the stack to a host numeric kind.
    Narrow(NumKind),

    // Dynamic path
    DynAdd,
    DynSub,
    DynMul,
    DynDiv,
    DynMod,
    DynNeg,
    DynCompare(CmpOp),
    DynEq,
    DynNe,
    DynGetMember(u32),
    DynSetMember(u32),
    DynGetIndex,
    DynSetIndex,
    /// Pop `argc` arguments and the callee.
    DynCall(u16),
    /// Pop `argc` arguments and the receiver.
    DynCallMember(u32, u16),

    // Records and arrays
    NewRecord(u32),
    GetField(u16),
    SetField(u16),
    /// Pop `n` elements into a new array of the given layout.
    NewArray(u32, u32),
    GetIndex,
    SetIndex,
    /// Pop the element and the array; push null.
    ArrayAdd,
    ArrayLen,

    // Host members
    GetHost(u32),
    SetHost(u32),
    CallHost(u32, u16),
    /// Static extension function; the receiver is the first argument.
    CallStatic(u32, u16),
    GetHostIndex(u32),
    SetHostIndex(u32),
    BindMethod(u32),
    BindArrayAdd,

    // Closures
    MakeClosure(u32),
    /// Call a signature entry point; the callee closure is below the arguments.
    CallSig(u32, u16),

    // Control flow
    Jump(u32),
    /// Pop a boolean and jump if it is false.
    JumpIfFalse(u32),
    JumpIfTrue(u32),
    Return,
    Print,
    Unreachable,
}

impl Op {
    /// True for instructions that decide types at runtime.
    pub fn is_dynamic(self) -> bool {
        matches!(
            self,
            Self::CheckNum(_)
                | Self::CheckBool(_)
                | Self::CheckStr(_)
                | Self::CheckRecord(..)
                | Self::CheckArray(..)
                | Self::CheckHost(..)
                | Self::CheckClosure(..)
                | Self::DynAdd
                | Self::DynSub
                | Self::DynMul
                | Self::DynDiv
                | Self::DynMod
                | Self::DynNeg
                | Self::DynCompare(_)
                | Self::DynEq
                | Self::DynNe
                | Self::DynGetMember(_)
                | Self::DynSetMember(_)
                | Self::DynGetIndex
                | Self::DynSetIndex
                | Self::DynCall(_)
                | Self::DynCallMember(..)
        )
    }
}

/// Representation of a host value of type `ty` once inside the script.
pub fn repr_of_type(ty: &TypeRef) -> Repr {
    match ty {
        TypeRef::Number(_) => Repr::Num,
        TypeRef::Bool => Repr::Bool,
        TypeRef::String => Repr::Str,
        TypeRef::Host(id) => Repr::Host(*id),
        _ => Repr::Dyn,
    }
}

/// Compile an analyzed script into bytecode.
#[tracing::instrument(skip_all)]
pub fn compile(script: &Script, analysis: &Analysis, types: &TypeManager) -> Result<CompiledScript, CompileError> {
    let mut compiler = Compiler::new(script, analysis, types);
    compiler.mat.prepare(&analysis.table);
    compiler.compile_root(script)?;
    while let Some(job) = compiler.queue.pop_front() {
        compiler.compile_job(job)?;
    }

    let layouts = compiler.mat.finish();
    tracing::debug!(
        functions = compiler.functions.len(),
        closures = compiler.closures.len(),
        dynamic_ops = compiler.dynamic_ops,
        "script compiled"
    );
    Ok(CompiledScript {
        functions: compiler.functions,
        numbers: compiler.numbers,
        strings: compiler.strings.into_iter().collect(),
        names: compiler.names.into_iter().collect(),
        records: layouts.records,
        arrays: layouts.arrays,
        members: compiler.members,
        closures: compiler.closures,
        input_type: analysis.input,
        dynamic_ops: compiler.dynamic_ops,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Entry {
    Typed(usize),
    Generic,
}

#[derive(Debug, Clone, Copy)]
struct Job {
    index: u32,
    method: ShapeId,
    entry: Entry,
}

#[derive(Debug, Clone, Copy)]
struct Local {
    slot: u16,
    repr: Repr,
    cell: bool,
}

/// Per-function compilation state.
struct FnState {
    ops: Vec<Op>,
    stack: Vec<LayerId>,
    locals: HashMap<Symbol, Local>,
    next_local: u16,
    captures: IndexSet<Symbol>,
    ret: Repr,
    root: bool,
}

impl FnState {
    fn new(stack: Vec<LayerId>, ret: Repr, root: bool, captures: IndexSet<Symbol>) -> Self {
        Self {
            ops: Vec::new(),
            stack,
            locals: HashMap::new(),
            next_local: 0,
            captures,
            ret,
            root,
        }
    }
}

/// An assignable location, resolved for code generation.
enum Place<'e> {
    Local(Symbol),
    Input(Arc<MemberInfo>),
    Field {
        object: &'e Expr,
        record: Repr,
        index: u16,
        repr: Repr,
    },
    Host {
        object: &'e Expr,
        receiver: Repr,
        member: Arc<MemberInfo>,
    },
    Element {
        object: &'e Expr,
        index: &'e Expr,
        array: Repr,
        repr: Repr,
    },
    HostIndex {
        object: &'e Expr,
        index: &'e Expr,
        receiver: Repr,
        member: Arc<MemberInfo>,
    },
    DynMember {
        object: &'e Expr,
        name: &'e str,
    },
    DynIndex {
        object: &'e Expr,
        index: &'e Expr,
    },
}

impl Place<'_> {
    /// Stack values the store consumes below the value.
    fn width(&self) -> usize {
        match self {
            Self::Local(_) => 0,
            Self::Input(_) | Self::Field { .. } | Self::Host { .. } | Self::DynMember { .. } => 1,
            Self::Element { .. } | Self::HostIndex { .. } | Self::DynIndex { .. } => 2,
        }
    }
}

struct Compiler<'a> {
    analysis: &'a Analysis,
    types: &'a TypeManager,
    lambdas: HashMap<NodeId, &'a Lambda>,
    mat: Materializer<'a>,
    functions: Vec<Function>,
    numbers: Vec<f64>,
    strings: IndexSet<Arc<str>>,
    names: IndexSet<Arc<str>>,
    members: Vec<HostMember>,
    member_index: HashMap<usize, u32>,
    closures: Vec<ClosureTemplate>,
    templates: HashMap<ShapeId, u32>,
    protos: HashMap<(ShapeId, Entry), u32>,
    queue: VecDeque<Job>,
    erased: HashSet<ShapeId>,
    erased_layouts: HashSet<Repr>,
    dynamic_ops: usize,
    f: FnState,
}

fn internal(message: impl Into<String>, span: Span) -> CompileError {
    let message = message.into();
    debug_assert!(false, "{message}");
    CompileError::compiler(message, span)
}

impl<'a> Compiler<'a> {
    fn new(script: &'a Script, analysis: &'a Analysis, types: &'a TypeManager) -> Self {
        Self {
            analysis,
            types,
            lambdas: collect_lambdas(script),
            mat: Materializer::new(&analysis.arena),
            functions: Vec::new(),
            numbers: Vec::new(),
            strings: IndexSet::new(),
            names: IndexSet::new(),
            members: Vec::new(),
            member_index: HashMap::new(),
            closures: Vec::new(),
            templates: HashMap::new(),
            protos: HashMap::new(),
            queue: VecDeque::new(),
            erased: HashSet::new(),
            erased_layouts: HashSet::new(),
            dynamic_ops: 0,
            f: FnState::new(vec![ShapeTable::ROOT], Repr::Dyn, true, IndexSet::new()),
        }
    }

    // ── Emission helpers ────────────────────────────────────────

    fn emit(&mut self, op: Op) {
        if op.is_dynamic() {
            self.dynamic_ops += 1;
        }
        self.f.ops.push(op);
    }

    fn current_offset(&self) -> usize {
        self.f.ops.len()
    }

    fn patch_jump(&mut self, idx: usize) -> Result<(), CompileError> {
        let target = u32::try_from(self.f.ops.len())
            .map_err(|_| CompileError::compiler("Bytecode too large", Span::default()))?;
        match &mut self.f.ops[idx] {
            Op::Jump(dest) | Op::JumpIfFalse(dest) | Op::JumpIfTrue(dest) => *dest = target,
            _ => {}
        }
        Ok(())
    }

    fn jump_to(&mut self, target: usize) {
        self.emit(Op::Jump(target as u32));
    }

    fn add_number(&mut self, value: f64) -> u32 {
        // Exact bit equality, so 0.0 and -0.0 stay distinct.
        if let Some(i) = self.numbers.iter().position(|c| c.to_bits() == value.to_bits()) {
            return i as u32;
        }
        self.numbers.push(value);
        (self.numbers.len() - 1) as u32
    }

    fn emit_num(&mut self, value: f64) {
        let idx = self.add_number(value);
        self.emit(Op::PushNum(idx));
    }

    fn emit_str(&mut self, value: &str) {
        let (idx, _) = self.strings.insert_full(Arc::from(value));
        self.emit(Op::PushStr(idx as u32));
    }

    fn name(&mut self, value: &str) -> u32 {
        self.names.insert_full(Arc::from(value)).0 as u32
    }

    fn member(&mut self, info: &Arc<MemberInfo>, result: Repr) -> u32 {
        let key = Arc::as_ptr(info) as usize;
        if let Some(&idx) = self.member_index.get(&key) {
            return idx;
        }
        let idx = self.members.len() as u32;
        self.members.push(HostMember {
            info: Arc::clone(info),
            result,
        });
        self.member_index.insert(key, idx);
        idx
    }

    fn push_zero(&mut self, repr: Repr) {
        match repr {
            Repr::Num => self.emit_num(0.0),
            Repr::Bool => self.emit(Op::PushBool(false)),
            Repr::Str => self.emit_str(""),
            _ => self.emit(Op::PushNull),
        }
    }

    // ── Shapes and representations ──────────────────────────────

    fn shape(&self, node: NodeId) -> ShapeId {
        self.analysis.shape(&self.f.stack, node)
    }

    fn repr(&mut self, shape: ShapeId) -> Repr {
        self.mat.repr(shape)
    }

    fn node_repr(&mut self, node: NodeId) -> Repr {
        let shape = self.shape(node);
        self.repr(shape)
    }

    fn symbol_repr(&mut self, symbol: Symbol) -> Repr {
        self.node_repr(symbol.node())
    }

    fn field_index(&self, record: Repr, name: &str) -> Option<(u16, Repr)> {
        let Repr::Record(layout) = record else {
            return None;
        };
        self.mat
            .record_fields(layout)
            .iter()
            .enumerate()
            .find(|(_, (n, _))| &**n == name)
            .map(|(i, (_, repr))| (i as u16, *repr))
    }

    fn element_repr(&self, array: Repr) -> Repr {
        match array {
            Repr::Array(layout) => self.mat.array_element(layout),
            _ => Repr::Dyn,
        }
    }

    /// Convert the value on top of the stack from `from` to `to`.
    fn coerce(&mut self, from: Repr, to: Repr, label: &str) {
        if from == to {
            return;
        }
        match (from, to) {
            (_, Repr::Dyn) => {
                if from.is_unboxed() {
                    self.emit(Op::Wrap);
                }
                self.erase(from);
            }
            (Repr::Dyn, _) => {
                let name = self.name(label);
                self.emit(match to {
                    Repr::Num => Op::CheckNum(name),
                    Repr::Bool => Op::CheckBool(name),
                    Repr::Str => Op::CheckStr(name),
                    Repr::Record(layout) => Op::CheckRecord(layout, name),
                    Repr::Array(layout) => Op::CheckArray(layout, name),
                    Repr::Host(id) => Op::CheckHost(id, name),
                    Repr::Closure(shape) => Op::CheckClosure(shape, name),
                    Repr::Dyn => return,
                });
            }
            _ => {
                self.coerce(from, Repr::Dyn, label);
                self.coerce(Repr::Dyn, to, label);
            }
        }
    }

    /// A value of representation `repr` escapes into erased storage:
    /// every closure reachable through it may now be called dynamically.
    fn erase(&mut self, repr: Repr) {
        match repr {
            Repr::Closure(shape) => self.require_generic(ShapeId(shape)),
            Repr::Record(layout) => {
                if self.erased_layouts.insert(repr) {
                    let fields: Vec<Repr> = self.mat.record_fields(layout).iter().map(|(_, r)| *r).collect();
                    for field in fields {
                        self.erase(field);
                    }
                }
            }
            Repr::Array(layout) => {
                if self.erased_layouts.insert(repr) {
                    let element = self.mat.array_element(layout);
                    self.erase(element);
                }
            }
            _ => {}
        }
    }

    fn require_generic(&mut self, method: ShapeId) {
        if !self.erased.insert(method) {
            return;
        }
        if let Some(&index) = self.protos.get(&(method, Entry::Generic)) {
            self.queue.push_back(Job {
                index,
                method,
                entry: Entry::Generic,
            });
        }
    }

    /// Convert the value on top of the stack for a host parameter or
    /// member of type `ty`, narrowing numbers to the host kind.
    fn host_value(&mut self, ty: &TypeRef, from: Repr, label: &str) {
        match ty {
            TypeRef::Number(kind) => {
                self.coerce(from, Repr::Num, label);
                if *kind != NumKind::F64 {
                    self.emit(Op::Narrow(*kind));
                }
            }
            TypeRef::Bool | TypeRef::String | TypeRef::Host(_) => self.coerce(from, repr_of_type(ty), label),
            _ => self.coerce(from, Repr::Dyn, label),
        }
    }

    // ── Entry points ────────────────────────────────────────────

    fn finish_fn(&mut self, name: String, arity: u16) -> Function {
        Function {
            name,
            arity,
            locals: self.f.next_local,
            ops: std::mem::take(&mut self.f.ops),
        }
    }

    fn placeholder(name: String, arity: u16) -> Function {
        Function {
            name,
            arity,
            locals: 0,
            ops: vec![Op::Unreachable],
        }
    }

    fn compile_root(&mut self, script: &Script) -> Result<(), CompileError> {
        self.functions.push(Self::placeholder("<root>".into(), 0));
        self.block(&script.body)?;
        self.emit(Op::PushNull);
        self.emit(Op::Return);
        let root = self.finish_fn("<root>".into(), 0);
        self.functions[0] = root;
        Ok(())
    }

    /// Function index for an entry of `method`, scheduling compilation of
    /// typed entries on first use.
    fn proto(&mut self, method: ShapeId, entry: Entry, arity: u16) -> u32 {
        let method = self.analysis.arena.resolve(method);
        if let Some(&index) = self.protos.get(&(method, entry)) {
            return index;
        }
        let index = self.functions.len() as u32;
        self.functions
            .push(Self::placeholder(format!("lambda#{}", method.0), arity));
        self.protos.insert((method, entry), index);
        if let Entry::Typed(_) = entry {
            self.queue.push_back(Job { index, method, entry });
        }
        index
    }

    /// Layer stack and parameter storage of an entry of `method`.
    fn entry_frame(&mut self, method: ShapeId, entry: Entry, span: Span) -> Result<(Vec<LayerId>, Vec<Repr>), CompileError> {
        let analysis = self.analysis;
        let lambda = analysis
            .arena
            .lambda(method)
            .ok_or_else(|| internal("call target is not a lambda", span))?;
        let signature = match entry {
            Entry::Typed(i) => lambda.signatures.get(i),
            Entry::Generic => lambda.generic.as_ref(),
        }
        .ok_or_else(|| internal("missing call signature", span))?;
        let ast = *self
            .lambdas
            .get(&lambda.node)
            .ok_or_else(|| internal("lambda node not found", span))?;
        let mut stack = lambda.env.clone();
        stack.push(signature.layer);
        let params = ast
            .params
            .iter()
            .map(|p| {
                let shape = analysis.shape(&stack, p.id);
                self.mat.repr(shape)
            })
            .collect();
        Ok((stack, params))
    }

    fn compile_job(&mut self, job: Job) -> Result<(), CompileError> {
        let analysis = self.analysis;
        let span = Span::default();
        let lambda = analysis
            .arena
            .lambda(job.method)
            .ok_or_else(|| internal("compiled entry is not a lambda", span))?;
        let node = lambda.node;
        let ast = *self
            .lambdas
            .get(&node)
            .ok_or_else(|| internal("lambda node not found", span))?;
        let (stack, params) = self.entry_frame(job.method, job.entry, span)?;
        let (ret, suffix) = match job.entry {
            Entry::Typed(i) => {
                let ret = lambda.signatures.get(i).map_or(ShapeArena::UNKNOWN, |s| s.ret);
                (self.mat.repr(ret), format!("sig{i}"))
            }
            Entry::Generic => (Repr::Dyn, "generic".to_string()),
        };
        let captures = analysis.lambda_captures.get(&node).cloned().unwrap_or_default();
        let saved = std::mem::replace(&mut self.f, FnState::new(stack, ret, false, captures));

        for (index, (param, repr)) in ast.params.iter().zip(params).enumerate() {
            let symbol = Symbol::LambdaParameter {
                lambda: node,
                index,
                param: param.id,
            };
            let cell = analysis.captured.contains(&symbol);
            let slot = index as u16;
            self.f.locals.insert(symbol, Local { slot, repr, cell });
            if cell {
                self.emit(Op::LoadLocal(slot));
                self.emit(Op::MakeCell(slot));
            }
        }
        self.f.next_local = ast.params.len() as u16;

        match &ast.body {
            LambdaBody::Expr(body) => {
                self.expr_as(body, ret, "return value")?;
                self.emit(Op::Return);
            }
            LambdaBody::Block(body) => {
                self.block(body)?;
                if always_returns(body) {
                    self.emit(Op::Unreachable);
                } else {
                    self.emit(Op::PushNull);
                    self.coerce(Repr::Dyn, ret, "return value");
                    self.emit(Op::Return);
                }
            }
        }

        let arity = ast.params.len() as u16;
        let function = self.finish_fn(format!("lambda#{}/{suffix}", node.0), arity);
        tracing::trace!(name = %function.name, ops = function.ops.len(), "entry compiled");
        self.functions[job.index as usize] = function;
        self.f = saved;
        Ok(())
    }

    /// Closure template for the lambda literal `e` with shape `method`.
    fn template(&mut self, method: ShapeId, e: &Expr) -> Result<u32, CompileError> {
        if let Some(&t) = self.templates.get(&method) {
            return Ok(t);
        }
        let analysis = self.analysis;
        let ast = *self
            .lambdas
            .get(&e.id)
            .ok_or_else(|| internal("lambda node not found", e.span))?;
        let mut captures = Vec::new();
        if let Some(symbols) = analysis.lambda_captures.get(&e.id) {
            for symbol in symbols {
                let source = if let Some(local) = self.f.locals.get(symbol) {
                    if !local.cell {
                        return Err(internal("captured local is not boxed", e.span));
                    }
                    CaptureSource::Local(local.slot)
                } else if let Some(i) = self.f.captures.get_index_of(symbol) {
                    CaptureSource::Capture(i as u16)
                } else {
                    return Err(internal("captured symbol is not in scope", e.span));
                };
                captures.push(source);
            }
        }

        let arity = ast.params.len() as u16;
        let generic = self.functions.len() as u32;
        self.functions
            .push(Self::placeholder(format!("lambda#{}/generic", e.id.0), arity));
        self.protos.insert((method, Entry::Generic), generic);
        if self.erased.contains(&method) {
            self.queue.push_back(Job {
                index: generic,
                method,
                entry: Entry::Generic,
            });
        }

        let t = self.closures.len() as u32;
        self.closures.push(ClosureTemplate {
            name: format!("lambda#{}", e.id.0),
            shape: method.0,
            generic,
            arity,
            captures,
        });
        self.templates.insert(method, t);
        Ok(t)
    }

    // ── Locals ──────────────────────────────────────────────────

    fn declare_local(&mut self, symbol: Symbol) -> Local {
        if let Some(local) = self.f.locals.get(&symbol) {
            return *local;
        }
        let repr = self.symbol_repr(symbol);
        let local = Local {
            slot: self.f.next_local,
            repr,
            cell: self.analysis.captured.contains(&symbol),
        };
        self.f.next_local += 1;
        self.f.locals.insert(symbol, local);
        local
    }

    fn load_symbol(&mut self, symbol: Symbol, span: Span) -> Result<Repr, CompileError> {
        if let Some(local) = self.f.locals.get(&symbol).copied() {
            self.emit(if local.cell {
                Op::LoadCell(local.slot)
            } else {
                Op::LoadLocal(local.slot)
            });
            return Ok(local.repr);
        }
        let index = self
            .f
            .captures
            .get_index_of(&symbol)
            .ok_or_else(|| internal("symbol has no storage", span))?;
        self.emit(Op::LoadCapture(index as u16));
        Ok(self.symbol_repr(symbol))
    }

    fn store_symbol(&mut self, symbol: Symbol, from: Repr, label: &str, span: Span) -> Result<(), CompileError> {
        if let Some(local) = self.f.locals.get(&symbol).copied() {
            self.coerce(from, local.repr, label);
            self.emit(if local.cell {
                Op::StoreCell(local.slot)
            } else {
                Op::StoreLocal(local.slot)
            });
            return Ok(());
        }
        let index = self
            .f
            .captures
            .get_index_of(&symbol)
            .ok_or_else(|| internal("symbol has no storage", span))?;
        let repr = self.symbol_repr(symbol);
        self.coerce(from, repr, label);
        self.emit(Op::StoreCapture(index as u16));
        Ok(())
    }

    // ── Statements ──────────────────────────────────────────────

    fn block(&mut self, stmts: &[Stmt]) -> Result<(), CompileError> {
        for stmt in stmts {
            self.stmt(stmt)?;
        }
        Ok(())
    }

    fn stmt(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        match &stmt.kind {
            StmtKind::Block(body) => self.block(body),
            StmtKind::Var { name, init, .. } => {
                let local = self.declare_local(Symbol::Variable(stmt.id));
                if local.cell {
                    // The cell exists before the initializer runs so a
                    // lambda stored here can refer to itself.
                    self.push_zero(local.repr);
                    self.emit(Op::MakeCell(local.slot));
                    if let Some(init) = init {
                        self.expr_as(init, local.repr, name)?;
                        self.emit(Op::StoreCell(local.slot));
                    }
                } else {
                    match init {
                        Some(init) => self.expr_as(init, local.repr, name)?,
                        None => self.push_zero(local.repr),
                    }
                    self.emit(Op::StoreLocal(local.slot));
                }
                Ok(())
            }
            StmtKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                self.expr_as(condition, Repr::Bool, "condition")?;
                let jump_else = self.current_offset();
                self.emit(Op::JumpIfFalse(0));
                self.stmt(then_branch)?;
                if let Some(else_branch) = else_branch {
                    let jump_end = self.current_offset();
                    self.emit(Op::Jump(0));
                    self.patch_jump(jump_else)?;
                    self.stmt(else_branch)?;
                    self.patch_jump(jump_end)?;
                } else {
                    self.patch_jump(jump_else)?;
                }
                Ok(())
            }
            StmtKind::While { condition, body } => {
                let start = self.current_offset();
                self.expr_as(condition, Repr::Bool, "condition")?;
                let jump_end = self.current_offset();
                self.emit(Op::JumpIfFalse(0));
                self.stmt(body)?;
                self.jump_to(start);
                self.patch_jump(jump_end)
            }
            StmtKind::For {
                init,
                condition,
                step,
                body,
            } => {
                if let Some(init) = init {
                    self.stmt(init)?;
                }
                let start = self.current_offset();
                let jump_end = match condition {
                    Some(condition) => {
                        self.expr_as(condition, Repr::Bool, "condition")?;
                        let at = self.current_offset();
                        self.emit(Op::JumpIfFalse(0));
                        Some(at)
                    }
                    None => None,
                };
                self.stmt(body)?;
                if let Some(step) = step {
                    self.stmt(step)?;
                }
                self.jump_to(start);
                if let Some(at) = jump_end {
                    self.patch_jump(at)?;
                }
                Ok(())
            }
            StmtKind::Return(value) => {
                let ret = if self.f.root { Repr::Dyn } else { self.f.ret };
                match value {
                    Some(value) => self.expr_as(value, ret, "return value")?,
                    None => {
                        self.emit(Op::PushNull);
                        self.coerce(Repr::Dyn, ret, "return value");
                    }
                }
                self.emit(Op::Return);
                Ok(())
            }
            StmtKind::Print(value) => {
                self.expr(value)?;
                self.emit(Op::Print);
                Ok(())
            }
            StmtKind::Expr(expr) => {
                self.expr(expr)?;
                self.emit(Op::Pop);
                Ok(())
            }
            StmtKind::Assign { target, value } => {
                let place = self.place(target)?;
                self.place_receiver(&place)?;
                let from = self.expr(value)?;
                self.place_store(&place, from, target.span)
            }
            StmtKind::Increment { target, op } => {
                let place = self.place(target)?;
                self.place_receiver(&place)?;
                match place.width() {
                    1 => self.emit(Op::Dup),
                    2 => self.emit(Op::Dup2),
                    _ => {}
                }
                let current = self.place_load(&place, target.span)?;
                self.emit_num(1.0);
                let result = match (current, op) {
                    (Repr::Num, IncOp::Increment) => {
                        self.emit(Op::AddNum);
                        Repr::Num
                    }
                    (Repr::Num, IncOp::Decrement) => {
                        self.emit(Op::SubNum);
                        Repr::Num
                    }
                    (_, IncOp::Increment) => {
                        self.emit(Op::DynAdd);
                        Repr::Dyn
                    }
                    (_, IncOp::Decrement) => {
                        self.emit(Op::DynSub);
                        Repr::Dyn
                    }
                };
                self.place_store(&place, result, target.span)
            }
        }
    }

    // ── Places ──────────────────────────────────────────────────

    fn place<'e>(&mut self, target: &'e Expr) -> Result<Place<'e>, CompileError> {
        let analysis = self.analysis;
        match &target.kind {
            ExprKind::Ident(_) => match analysis.resolutions.get(&target.id) {
                Some(Resolution::Local(symbol)) => Ok(Place::Local(*symbol)),
                Some(Resolution::Input(member)) => Ok(Place::Input(Arc::clone(member))),
                None => Err(internal("unresolved assignment target", target.span)),
            },
            ExprKind::Member { object, name, .. } => {
                let shape = self.shape(object.id);
                match resolve_member(&analysis.arena, self.types, shape, name) {
                    MemberTarget::RecordField(_) | MemberTarget::MissingField(_) => {
                        let record = self.repr(shape);
                        Ok(match self.field_index(record, name) {
                            Some((index, repr)) => Place::Field {
                                object,
                                record,
                                index,
                                repr,
                            },
                            // Fields the sandbox could not add resolve by name.
                            None => Place::DynMember { object, name },
                        })
                    }
                    MemberTarget::Host(member) => Ok(Place::Host {
                        object,
                        receiver: self.repr(shape),
                        member,
                    }),
                    MemberTarget::Dynamic => Ok(Place::DynMember { object, name }),
                    _ => Err(internal(format!("member '{name}' is not assignable"), target.span)),
                }
            }
            ExprKind::Index { object, index } => {
                let shape = self.shape(object.id);
                match analysis.arena.resolved(shape) {
                    Shape::Array { .. } => {
                        let array = self.repr(shape);
                        Ok(Place::Element {
                            object,
                            index,
                            array,
                            repr: self.element_repr(array),
                        })
                    }
                    Shape::Concrete(Concrete::Host(id)) => {
                        let member = self
                            .types
                            .type_info(*id)
                            .and_then(|t| t.indexer.clone())
                            .ok_or_else(|| internal("host type has no indexer", target.span))?;
                        Ok(Place::HostIndex {
                            object,
                            index,
                            receiver: Repr::Host(*id),
                            member,
                        })
                    }
                    _ => Ok(Place::DynIndex { object, index }),
                }
            }
            _ => Err(internal("invalid assignment target", target.span)),
        }
    }

    fn place_receiver(&mut self, place: &Place<'_>) -> Result<(), CompileError> {
        match place {
            Place::Local(_) => {}
            Place::Input(_) => self.emit(Op::LoadInput),
            Place::Field { object, record, .. } => self.expr_as(object, *record, "record")?,
            Place::Host { object, receiver, .. } => self.expr_as(object, *receiver, "receiver")?,
            Place::Element { object, index, array, .. } => {
                self.expr_as(object, *array, "array")?;
                self.expr_as(index, Repr::Num, "index")?;
            }
            Place::HostIndex {
                object,
                index,
                receiver,
                member,
            } => {
                self.expr_as(object, *receiver, "receiver")?;
                let from = self.expr(index)?;
                if let MemberKind::Indexer { key, .. } = &member.kind {
                    self.host_value(key, from, "index");
                }
            }
            Place::DynMember { object, .. } => self.expr_as(object, Repr::Dyn, "receiver")?,
            Place::DynIndex { object, index } => {
                self.expr_as(object, Repr::Dyn, "receiver")?;
                self.expr_as(index, Repr::Dyn, "index")?;
            }
        }
        Ok(())
    }

    /// Read the place; the receiver is already on the stack.
    fn place_load(&mut self, place: &Place<'_>, span: Span) -> Result<Repr, CompileError> {
        Ok(match place {
            Place::Local(symbol) => return self.load_symbol(*symbol, span),
            Place::Input(member) | Place::Host { member, .. } => {
                let result = member.value_type().map_or(Repr::Dyn, repr_of_type);
                let m = self.member(member, result);
                self.emit(Op::GetHost(m));
                result
            }
            Place::Field { index, repr, .. } => {
                self.emit(Op::GetField(*index));
                *repr
            }
            Place::Element { repr, .. } => {
                self.emit(Op::GetIndex);
                *repr
            }
            Place::HostIndex { member, .. } => {
                let result = match &member.kind {
                    MemberKind::Indexer { ty, .. } => repr_of_type(ty),
                    _ => Repr::Dyn,
                };
                let m = self.member(member, result);
                self.emit(Op::GetHostIndex(m));
                result
            }
            Place::DynMember { name, .. } => {
                let name = self.name(name);
                self.emit(Op::DynGetMember(name));
                Repr::Dyn
            }
            Place::DynIndex { .. } => {
                self.emit(Op::DynGetIndex);
                Repr::Dyn
            }
        })
    }

    fn place_store(&mut self, place: &Place<'_>, from: Repr, span: Span) -> Result<(), CompileError> {
        match place {
            Place::Local(symbol) => return self.store_symbol(*symbol, from, "variable", span),
            Place::Input(member) | Place::Host { member, .. } => {
                let label = member.qualified_name();
                if let Some(ty) = member.value_type() {
                    self.host_value(ty, from, &label);
                }
                let result = member.value_type().map_or(Repr::Dyn, repr_of_type);
                let m = self.member(member, result);
                self.emit(Op::SetHost(m));
            }
            Place::Field { index, repr, .. } => {
                self.coerce(from, *repr, "field");
                self.emit(Op::SetField(*index));
            }
            Place::Element { repr, .. } => {
                self.coerce(from, *repr, "element");
                self.emit(Op::SetIndex);
            }
            Place::HostIndex { member, .. } => {
                let result = match &member.kind {
                    MemberKind::Indexer { ty, .. } => {
                        self.host_value(ty, from, &format!("{}[]", member.owner));
                        repr_of_type(ty)
                    }
                    _ => Repr::Dyn,
                };
                let m = self.member(member, result);
                self.emit(Op::SetHostIndex(m));
            }
            Place::DynMember { name, .. } => {
                self.coerce(from, Repr::Dyn, name);
                let name = self.name(name);
                self.emit(Op::DynSetMember(name));
            }
            Place::DynIndex { .. } => {
                self.coerce(from, Repr::Dyn, "element");
                self.emit(Op::DynSetIndex);
            }
        }
        Ok(())
    }

    // ── Expressions ─────────────────────────────────────────────

    fn expr_as(&mut self, expr: &Expr, want: Repr, label: &str) -> Result<(), CompileError> {
        let from = self.expr(expr)?;
        self.coerce(from, want, label);
        Ok(())
    }

    /// Compile `expr` and return the representation it pushed.
    fn expr(&mut self, expr: &Expr) -> Result<Repr, CompileError> {
        let analysis = self.analysis;
        match &expr.kind {
            ExprKind::Literal(lit) => Ok(match lit {
                Literal::Number(n) => {
                    self.emit_num(*n);
                    Repr::Num
                }
                Literal::Str(s) => {
                    self.emit_str(s);
                    Repr::Str
                }
                Literal::Bool(b) => {
                    self.emit(Op::PushBool(*b));
                    Repr::Bool
                }
                Literal::Null => {
                    self.emit(Op::PushNull);
                    Repr::Dyn
                }
            }),
            ExprKind::Binary { op, left, right } => self.binary(*op, left, right),
            ExprKind::Logical { op, left, right } => {
                self.expr_as(left, Repr::Bool, "condition")?;
                self.emit(Op::Dup);
                let jump = self.current_offset();
                self.emit(match op {
                    LogicOp::And => Op::JumpIfFalse(0),
                    LogicOp::Or => Op::JumpIfTrue(0),
                });
                self.emit(Op::Pop);
                self.expr_as(right, Repr::Bool, "condition")?;
                self.patch_jump(jump)?;
                Ok(Repr::Bool)
            }
            ExprKind::Unary { op, operand } => match op {
                UnaryOp::Not => {
                    self.expr_as(operand, Repr::Bool, "condition")?;
                    self.emit(Op::NotBool);
                    Ok(Repr::Bool)
                }
                UnaryOp::Neg => {
                    if self.expr(operand)? == Repr::Num {
                        self.emit(Op::NegNum);
                        Ok(Repr::Num)
                    } else {
                        self.emit(Op::DynNeg);
                        Ok(Repr::Dyn)
                    }
                }
            },
            ExprKind::Grouping(inner) => self.expr(inner),
            ExprKind::Ident(_) => match analysis.resolutions.get(&expr.id) {
                Some(Resolution::Local(symbol)) => self.load_symbol(*symbol, expr.span),
                Some(Resolution::Input(member)) => {
                    let member = Arc::clone(member);
                    self.emit(Op::LoadInput);
                    Ok(self.host_member_value(&member))
                }
                None => Err(internal("unresolved identifier", expr.span)),
            },
            ExprKind::Member { object, name, .. } => self.member_access(object, name, expr.span),
            ExprKind::Index { object, index } => self.index(object, index),
            ExprKind::Call { callee, args } => self.call(expr, callee, args),
            ExprKind::Lambda(_) => {
                let method = analysis.arena.resolve(self.shape(expr.id));
                let t = self.template(method, expr)?;
                self.emit(Op::MakeClosure(t));
                Ok(Repr::Closure(method.0))
            }
            ExprKind::Object(props) => {
                let record = self.node_repr(expr.id);
                let Repr::Record(layout) = record else {
                    return Err(internal("object literal without record layout", expr.span));
                };
                self.emit(Op::NewRecord(layout));
                for prop in props {
                    let (index, repr) = self
                        .field_index(record, &prop.name)
                        .ok_or_else(|| internal("literal field missing from layout", prop.span))?;
                    self.emit(Op::Dup);
                    self.expr_as(&prop.value, repr, &prop.name)?;
                    self.emit(Op::SetField(index));
                }
                Ok(record)
            }
            ExprKind::Array(items) => {
                let array = self.node_repr(expr.id);
                let Repr::Array(layout) = array else {
                    return Err(internal("array literal without array layout", expr.span));
                };
                let element = self.element_repr(array);
                for item in items {
                    self.expr_as(item, element, "element")?;
                }
                self.emit(Op::NewArray(layout, items.len() as u32));
                Ok(array)
            }
            ExprKind::Interpolated(parts) => {
                if parts.is_empty() {
                    self.emit_str("");
                    return Ok(Repr::Str);
                }
                for part in parts {
                    match part {
                        InterpPart::Text(text) => self.emit_str(text),
                        InterpPart::Expr(e) => {
                            if self.expr(e)? != Repr::Str {
                                self.emit(Op::ToStr);
                            }
                        }
                    }
                }
                for _ in 1..parts.len() {
                    self.emit(Op::ConcatStr);
                }
                Ok(Repr::Str)
            }
        }
    }

    fn binary(&mut self, op: BinOp, left: &Expr, right: &Expr) -> Result<Repr, CompileError> {
        let l = self.expr(left)?;
        let r = self.expr(right)?;
        let dynamic = l == Repr::Dyn || r == Repr::Dyn;
        let numeric = l == Repr::Num && r == Repr::Num;

        if let Some(cmp) = CmpOp::from_bin(op) {
            self.emit(if numeric {
                Op::CmpNum(cmp)
            } else if l == Repr::Str && r == Repr::Str {
                Op::CmpStr(cmp)
            } else {
                Op::DynCompare(cmp)
            });
            return Ok(Repr::Bool);
        }

        if matches!(op, BinOp::Eq | BinOp::Ne) {
            let eq = op == BinOp::Eq;
            self.emit(match (l, r) {
                _ if dynamic => {
                    if eq { Op::DynEq } else { Op::DynNe }
                }
                (Repr::Num, Repr::Num) => {
                    if eq { Op::EqNum } else { Op::NeNum }
                }
                (Repr::Bool, Repr::Bool) => {
                    if eq { Op::EqBool } else { Op::NeBool }
                }
                (Repr::Str, Repr::Str) => {
                    if eq { Op::EqStr } else { Op::NeStr }
                }
                _ => {
                    if eq { Op::EqRef } else { Op::NeRef }
                }
            });
            return Ok(Repr::Bool);
        }

        if op == BinOp::Add && !dynamic && (l == Repr::Str || r == Repr::Str) {
            self.emit(Op::ConcatStr);
            return Ok(Repr::Str);
        }

        if numeric {
            self.emit(match op {
                BinOp::Add => Op::AddNum,
                BinOp::Sub => Op::SubNum,
                BinOp::Mul => Op::MulNum,
                BinOp::Div => Op::DivNum,
                _ => Op::ModNum,
            });
            return Ok(Repr::Num);
        }

        self.emit(match op {
            BinOp::Add => Op::DynAdd,
            BinOp::Sub => Op::DynSub,
            BinOp::Mul => Op::DynMul,
            BinOp::Div => Op::DynDiv,
            _ => Op::DynMod,
        });
        Ok(Repr::Dyn)
    }

    /// Read a host member of the receiver on top of the stack.
    fn host_member_value(&mut self, member: &Arc<MemberInfo>) -> Repr {
        if member.is_callable() {
            let m = self.member(member, Repr::Dyn);
            self.emit(Op::BindMethod(m));
            return Repr::Dyn;
        }
        let result = member.value_type().map_or(Repr::Dyn, repr_of_type);
        let m = self.member(member, result);
        self.emit(Op::GetHost(m));
        result
    }

    fn member_access(&mut self, object: &Expr, name: &str, span: Span) -> Result<Repr, CompileError> {
        let analysis = self.analysis;
        let shape = self.shape(object.id);
        match resolve_member(&analysis.arena, self.types, shape, name) {
            MemberTarget::RecordField(_) => {
                let record = self.repr(shape);
                match self.field_index(record, name) {
                    Some((index, repr)) => {
                        self.expr_as(object, record, "record")?;
                        self.emit(Op::GetField(index));
                        Ok(repr)
                    }
                    None => self.dyn_member(object, name),
                }
            }
            MemberTarget::MissingField(_) | MemberTarget::Dynamic => self.dyn_member(object, name),
            MemberTarget::ArrayLength => {
                let array = self.repr(shape);
                self.expr_as(object, array, "array")?;
                self.emit(Op::ArrayLen);
                Ok(Repr::Num)
            }
            MemberTarget::StringLength => {
                self.expr_as(object, Repr::Str, "string")?;
                self.emit(Op::StrLen);
                Ok(Repr::Num)
            }
            MemberTarget::Host(member) => {
                let receiver = self.repr(shape);
                self.expr_as(object, receiver, "receiver")?;
                Ok(self.host_member_value(&member))
            }
            MemberTarget::Extension(member) => {
                let from = self.expr(object)?;
                self.coerce(from, Repr::Dyn, "receiver");
                let m = self.member(&member, Repr::Dyn);
                self.emit(Op::BindMethod(m));
                Ok(Repr::Dyn)
            }
            MemberTarget::ArrayAdd => {
                let from = self.expr(object)?;
                self.coerce(from, Repr::Dyn, "receiver");
                self.emit(Op::BindArrayAdd);
                Ok(Repr::Dyn)
            }
            MemberTarget::NoMember => Err(internal(format!("no member '{name}'"), span)),
        }
    }

    fn dyn_member(&mut self, object: &Expr, name: &str) -> Result<Repr, CompileError> {
        self.expr_as(object, Repr::Dyn, "receiver")?;
        let name = self.name(name);
        self.emit(Op::DynGetMember(name));
        Ok(Repr::Dyn)
    }

    fn index(&mut self, object: &Expr, index: &Expr) -> Result<Repr, CompileError> {
        let analysis = self.analysis;
        let shape = self.shape(object.id);
        match analysis.arena.resolved(shape) {
            Shape::Array { .. } => {
                let array = self.repr(shape);
                self.expr_as(object, array, "array")?;
                self.expr_as(index, Repr::Num, "index")?;
                self.emit(Op::GetIndex);
                Ok(self.element_repr(array))
            }
            Shape::Concrete(Concrete::Host(id)) => {
                let id = *id;
                let indexer = self.types.type_info(id).and_then(|t| t.indexer.clone());
                let Some(member) = indexer else {
                    return Err(internal("host type has no indexer", index.span));
                };
                let MemberKind::Indexer { key, ty, .. } = &member.kind else {
                    return Err(internal("indexer has the wrong kind", index.span));
                };
                self.expr_as(object, Repr::Host(id), "receiver")?;
                let from = self.expr(index)?;
                self.host_value(key, from, "index");
                let result = repr_of_type(ty);
                let m = self.member(&member, result);
                self.emit(Op::GetHostIndex(m));
                Ok(result)
            }
            _ => {
                self.expr_as(object, Repr::Dyn, "receiver")?;
                self.expr_as(index, Repr::Dyn, "index")?;
                self.emit(Op::DynGetIndex);
                Ok(Repr::Dyn)
            }
        }
    }

    /// Push converted arguments for a host method or function.
    fn host_args(&mut self, member: &MemberInfo, args: &[Expr]) -> Result<(), CompileError> {
        let params = member.call_params();
        for (i, arg) in args.iter().enumerate() {
            let from = self.expr(arg)?;
            match params.get(i) {
                Some(ty) => self.host_value(ty, from, &format!("argument {} of '{}'", i + 1, member.qualified_name())),
                None => self.coerce(from, Repr::Dyn, "argument"),
            }
        }
        Ok(())
    }

    /// Call a host method or extension function. The receiver is on the stack.
    fn host_call(&mut self, member: &Arc<MemberInfo>, receiver: Repr, args: &[Expr]) -> Result<Repr, CompileError> {
        let result = member.ret().map_or(Repr::Dyn, repr_of_type);
        if member.is_extension() {
            if let MemberKind::Function { params, .. } = &member.kind {
                match params.first() {
                    Some(ty) => self.host_value(ty, receiver, "receiver"),
                    None => self.coerce(receiver, Repr::Dyn, "receiver"),
                }
            }
            self.host_args(member, args)?;
            let m = self.member(member, result);
            self.emit(Op::CallStatic(m, args.len() as u16 + 1));
        } else {
            self.host_args(member, args)?;
            let m = self.member(member, result);
            self.emit(Op::CallHost(m, args.len() as u16));
        }
        Ok(result)
    }

    fn call(&mut self, expr: &Expr, callee: &Expr, args: &[Expr]) -> Result<Repr, CompileError> {
        let analysis = self.analysis;
        match &callee.kind {
            ExprKind::Member { object, name, .. } => {
                let shape = self.shape(object.id);
                match resolve_member(&analysis.arena, self.types, shape, name) {
                    MemberTarget::Host(member) | MemberTarget::Extension(member) if member.is_callable() => {
                        let receiver = if member.is_extension() {
                            self.expr(object)?
                        } else {
                            let receiver = self.repr(shape);
                            self.expr_as(object, receiver, "receiver")?;
                            receiver
                        };
                        return self.host_call(&member, receiver, args);
                    }
                    MemberTarget::ArrayAdd => {
                        let array = self.repr(shape);
                        self.expr_as(object, array, "array")?;
                        let element = self.element_repr(array);
                        for arg in args {
                            self.expr_as(arg, element, "element")?;
                        }
                        self.emit(Op::ArrayAdd);
                        return Ok(Repr::Dyn);
                    }
                    MemberTarget::Dynamic => {
                        self.expr_as(object, Repr::Dyn, "receiver")?;
                        for arg in args {
                            self.expr_as(arg, Repr::Dyn, "argument")?;
                        }
                        let name = self.name(name);
                        self.emit(Op::DynCallMember(name, args.len() as u16));
                        return Ok(Repr::Dyn);
                    }
                    _ => {}
                }
            }
            ExprKind::Ident(_) => {
                if let Some(Resolution::Input(member)) = analysis.resolutions.get(&callee.id) {
                    if member.is_callable() {
                        let member = Arc::clone(member);
                        self.emit(Op::LoadInput);
                        let receiver = analysis.input.map_or(Repr::Dyn, Repr::Host);
                        return self.host_call(&member, receiver, args);
                    }
                }
            }
            _ => {}
        }

        let call_shape = self.shape(expr.id);
        if let Shape::MethodReturn { method, signature } = analysis.arena.get(call_shape) {
            let method = analysis.arena.resolve(*method);
            let signature = *signature;
            if analysis.arena.resolve(self.shape(callee.id)) == method {
                let entry = Entry::Typed(signature);
                let (_, params) = self.entry_frame(method, entry, expr.span)?;
                self.expr_as(callee, Repr::Closure(method.0), "callee")?;
                for (arg, repr) in args.iter().zip(params) {
                    self.expr_as(arg, repr, "argument")?;
                }
                let index = self.proto(method, entry, args.len() as u16);
                self.emit(Op::CallSig(index, args.len() as u16));
                let ret = analysis.arena.signature(method, signature).map(|s| s.ret);
                return Ok(ret.map_or(Repr::Dyn, |r| self.repr(r)));
            }
        }

        self.expr_as(callee, Repr::Dyn, "callee")?;
        for arg in args {
            self.expr_as(arg, Repr::Dyn, "argument")?;
        }
        self.emit(Op::DynCall(args.len() as u16));
        Ok(Repr::Dyn)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::dsl::fixture;
    use crate::dsl::infer::analyze;
    use crate::dsl::lexer::lex;
    use crate::dsl::options::CompileOptions;
    use crate::dsl::parser::parse;

    fn compile_src(src: &str) -> CompiledScript {
        let script = parse(lex(src).unwrap()).unwrap();
        let (types, id) = fixture::types();
        let analysis = analyze(&script, &types, Some(id), &CompileOptions::default()).unwrap();
        compile(&script, &analysis, &types).unwrap()
    }

    fn all_ops(compiled: &CompiledScript) -> Vec<Op> {
        compiled.functions.iter().flat_map(|f| f.ops.iter().copied()).collect()
    }

    #[test]
    fn numeric_fast_path() {
        let compiled = compile_src("return 2 + 3 * 4;");
        let root = &compiled.functions[0].ops;
        assert!(root.contains(&Op::AddNum));
        assert!(root.contains(&Op::MulNum));
        assert_eq!(compiled.dynamic_ops, 0);
        assert!(!compiled.uses_dynamic());
    }

    #[test]
    fn constant_dedup() {
        let compiled = compile_src("var a = 1; var b = 1; return a + b;");
        let ones = compiled.numbers.iter().filter(|&&c| c == 1.0).count();
        assert_eq!(ones, 1, "Duplicate constants should be deduplicated");
    }

    #[test]
    fn aliased_record_fields_stay_typed() {
        let compiled = compile_src("var a = {x: 1}; var b = a; b.y = \"s\"; return a.x;");
        assert_eq!(compiled.dynamic_ops, 0);
        assert_eq!(compiled.records.len(), 1);
        assert_eq!(compiled.records[0].fields.len(), 2);
        assert!(compiled.functions[0].ops.iter().any(|op| matches!(op, Op::GetField(0))));
    }

    #[test]
    fn heterogeneous_variable_uses_dynamic_add() {
        let compiled = compile_src("var v; if (false) v = 1; else v = \"s\"; return v + 1;");
        assert!(compiled.functions[0].ops.contains(&Op::DynAdd));
        assert!(compiled.uses_dynamic());
    }

    #[test]
    fn each_signature_gets_its_own_entry() {
        let compiled = compile_src(
            "var f = (a, b) => a + b; var n = f(1, 2); var s = f(\"x\", \"y\"); return s + n;",
        );
        let calls: Vec<u32> = compiled.functions[0]
            .ops
            .iter()
            .filter_map(|op| match op {
                Op::CallSig(f, 2) => Some(*f),
                _ => None,
            })
            .collect();
        assert_eq!(calls.len(), 2);
        assert_ne!(calls[0], calls[1]);
        assert!(compiled.functions[calls[0] as usize].ops.contains(&Op::AddNum));
        assert!(compiled.functions[calls[1] as usize].ops.contains(&Op::ConcatStr));
        assert_eq!(compiled.dynamic_ops, 0);
    }

    #[test]
    fn generic_entry_only_when_erased() {
        let compiled = compile_src("var f = (x) => x * 2; return f(2);");
        let generic = compiled.closures[0].generic as usize;
        assert_eq!(compiled.functions[generic].ops, vec![Op::Unreachable]);

        let compiled = compile_src("var f = (x) => x * 2; return f;");
        let generic = compiled.closures[0].generic as usize;
        assert!(compiled.functions[generic].ops.contains(&Op::DynMul));
    }

    #[test]
    fn guarded_host_store_narrows() {
        let compiled = compile_src("var v = null; Count = v;");
        let root = &compiled.functions[0].ops;
        let check = root.iter().position(|op| matches!(op, Op::CheckNum(_))).unwrap();
        let narrow = root.iter().position(|op| *op == Op::Narrow(NumKind::I32)).unwrap();
        let store = root.iter().position(|op| matches!(op, Op::SetHost(_))).unwrap();
        assert!(check < narrow && narrow < store);
    }

    #[test]
    fn typed_host_store_has_no_guard() {
        let compiled = compile_src("Count = Count + 1;");
        assert_eq!(compiled.dynamic_ops, 0);
        assert!(compiled.functions[0].ops.contains(&Op::Narrow(NumKind::I32)));
    }

    #[test]
    fn captured_variables_live_in_cells() {
        let compiled = compile_src("var k = 2; var f = (x) => x * k; return f(3);");
        assert!(compiled.functions[0].ops.iter().any(|op| matches!(op, Op::MakeCell(_))));
        assert!(all_ops(&compiled).contains(&Op::LoadCapture(0)));
        assert_eq!(compiled.closures[0].captures.len(), 1);
    }

    #[test]
    fn short_circuit_pattern() {
        let compiled = compile_src("var a = true; var b = false; return a && b;");
        let root = &compiled.functions[0].ops;
        let dup = root.iter().position(|op| *op == Op::Dup).unwrap();
        assert!(matches!(root[dup + 1], Op::JumpIfFalse(_)));
        assert_eq!(root[dup + 2], Op::Pop);
    }

    #[test]
    fn host_calls_are_direct() {
        let compiled = compile_src("var d = Describe(); var t = Total(1); return Doubled();");
        let root = &compiled.functions[0].ops;
        assert!(root.iter().any(|op| matches!(op, Op::CallHost(_, 0))));
        assert!(root.iter().any(|op| matches!(op, Op::CallHost(_, 1))));
        assert!(root.iter().any(|op| matches!(op, Op::CallStatic(_, 1))));
        assert_eq!(compiled.dynamic_ops, 0);
    }
}
