//! The stack VM.
//!
//! Each compiled function runs as a frame with its own locals and operand
//! stack. Script calls, typed or dynamic, push a frame onto a heap stack
//! rather than recursing, so call depth is bounded by `max_call_depth`
//! alone and never by the native stack.

#![allow(clippy::cast_precision_loss)]

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::ast::BinOp;
use super::compiler::{CaptureSource, CompiledScript, Function, HostMember, Op};
use super::dynamic::{self, coerce_host_value, DynamicOps, Invoke};
use super::error::RuntimeError;
use super::host::{HostObject, MemberKind};
use super::options::PrintSink;
use super::value::{ArrayObj, BoundMethod, BoundTarget, Cell, Closure, RecordObj, Repr, Slot, Value};

/// Call depth used when the caller does not configure one.
pub const DEFAULT_MAX_DEPTH: usize = 256;

/// Runtime context for one execution of a compiled script.
pub struct VmContext<'a> {
    /// The input object, `None` to run without one.
    pub input: Option<&'a HostObject>,
    pub sink: &'a dyn PrintSink,
    pub max_call_depth: usize,
}

/// Execute a compiled script, returning its result (`null` if it never returns).
#[tracing::instrument(skip_all)]
pub fn execute(script: &CompiledScript, dynamic: &DynamicOps, ctx: &VmContext<'_>) -> Result<Value, RuntimeError> {
    let mut vm = Vm {
        script,
        dynamic,
        input: ctx.input.map_or(Value::Null, |h| Value::Host(h.clone())),
        sink: ctx.sink,
        depth: 0,
        max_depth: ctx.max_call_depth,
    };
    let result = vm.frame(0, Vec::new(), None, true).and_then(|entry| vm.run(entry));
    if let Err(err) = &result {
        tracing::debug!(error = %err, "script failed");
    }
    result.map(Slot::into_value)
}

struct Vm<'p> {
    script: &'p CompiledScript,
    dynamic: &'p DynamicOps,
    input: Value,
    sink: &'p dyn PrintSink,
    /// Script frames live across all active `run` loops.
    depth: usize,
    max_depth: usize,
}

/// One activation of a compiled function. Script calls push frames on a
/// heap stack instead of recursing natively.
struct Frame<'p> {
    function: &'p Function,
    ip: usize,
    locals: Vec<Slot>,
    stack: Vec<Slot>,
    closure: Option<Arc<Closure>>,
    /// Hand the result back as an erased value (dynamic call sites).
    erase: bool,
}

enum Flow<'p> {
    Call(Frame<'p>),
    Return(Slot),
}

enum Call<'p> {
    Done(Value),
    Enter(Frame<'p>),
}

impl Invoke for Vm<'_> {
    /// Calls through the dynamic path use the closure's generic entry.
    fn invoke_closure(&mut self, closure: &Arc<Closure>, args: Vec<Value>) -> Result<Value, RuntimeError> {
        let entry = self.generic_frame(Arc::clone(closure), args)?;
        self.run(entry).map(Slot::into_value)
    }
}

fn underflow() -> RuntimeError {
    RuntimeError::internal("stack underflow")
}

fn pop(stack: &mut Vec<Slot>) -> Result<Slot, RuntimeError> {
    stack.pop().ok_or_else(underflow)
}

fn pop_value(stack: &mut Vec<Slot>) -> Result<Value, RuntimeError> {
    pop(stack).map(Slot::into_value)
}

fn pop_num(stack: &mut Vec<Slot>) -> Result<f64, RuntimeError> {
    match pop(stack)? {
        Slot::Num(n) | Slot::Ref(Value::Number(n)) => Ok(n),
        other => Err(RuntimeError::internal(format!("expected a number slot, got {other:?}"))),
    }
}

fn pop_bool(stack: &mut Vec<Slot>) -> Result<bool, RuntimeError> {
    match pop(stack)? {
        Slot::Bool(b) | Slot::Ref(Value::Bool(b)) => Ok(b),
        other => Err(RuntimeError::internal(format!("expected a bool slot, got {other:?}"))),
    }
}

/// Pop `n` values, returning them in push order.
fn pop_n(stack: &mut Vec<Slot>, n: usize) -> Result<Vec<Slot>, RuntimeError> {
    let at = stack.len().checked_sub(n).ok_or_else(underflow)?;
    Ok(stack.split_off(at))
}

fn pop_values(stack: &mut Vec<Slot>, n: usize) -> Result<Vec<Value>, RuntimeError> {
    Ok(pop_n(stack, n)?.into_iter().map(Slot::into_value).collect())
}

fn num_binop(stack: &mut Vec<Slot>, op: impl FnOnce(f64, f64) -> f64) -> Result<(), RuntimeError> {
    let b = pop_num(stack)?;
    let a = pop_num(stack)?;
    stack.push(Slot::Num(op(a, b)));
    Ok(())
}

fn dyn_binop(stack: &mut Vec<Slot>, op: BinOp) -> Result<(), RuntimeError> {
    let b = pop_value(stack)?;
    let a = pop_value(stack)?;
    stack.push(Slot::Ref(dynamic::arith(op, &a, &b)?));
    Ok(())
}

fn pop_str(stack: &mut Vec<Slot>) -> Result<Arc<str>, RuntimeError> {
    match pop_value(stack)? {
        Value::Str(s) => Ok(s),
        other => Err(RuntimeError::internal(format!("expected a string, got {}", other.type_name()))),
    }
}

fn check(value: Value, repr: Repr, expected: impl FnOnce() -> String, target: &str) -> Result<Slot, RuntimeError> {
    let actual = value.type_name();
    value.into_slot(repr).ok_or_else(|| RuntimeError::TypeMismatch {
        target: target.to_string(),
        expected: expected(),
        actual,
    })
}

fn host_receiver<'v>(value: &'v Value, member: &HostMember) -> Result<&'v HostObject, RuntimeError> {
    value.as_host().ok_or_else(|| RuntimeError::NullReference {
        target: member.info.qualified_name(),
    })
}

fn host_result(value: Value, member: &HostMember) -> Result<Slot, RuntimeError> {
    check(value, member.result, || member.result.name().to_string(), &member.info.qualified_name())
}

fn cell_of(slot: Option<&Slot>) -> Result<&Cell, RuntimeError> {
    match slot {
        Some(Slot::Cell(cell)) => Ok(cell),
        _ => Err(RuntimeError::internal("local slot does not hold a cell")),
    }
}

impl<'p> Vm<'p> {
    fn member(&self, index: u32) -> Result<&'p HostMember, RuntimeError> {
        self.script
            .members
            .get(index as usize)
            .ok_or_else(|| RuntimeError::internal("unknown host member"))
    }

    fn frame(
        &self,
        index: u32,
        args: Vec<Slot>,
        closure: Option<Arc<Closure>>,
        erase: bool,
    ) -> Result<Frame<'p>, RuntimeError> {
        let script = self.script;
        let function = script
            .functions
            .get(index as usize)
            .ok_or_else(|| RuntimeError::internal("unknown function"))?;
        let mut locals = args;
        locals.resize((function.locals as usize).max(locals.len()), Slot::Ref(Value::Null));
        Ok(Frame {
            function,
            ip: 0,
            locals,
            stack: Vec::with_capacity(16),
            closure,
            erase,
        })
    }

    fn generic_frame(&self, closure: Arc<Closure>, args: Vec<Value>) -> Result<Frame<'p>, RuntimeError> {
        let script = self.script;
        let template = script
            .closures
            .get(closure.template as usize)
            .ok_or_else(|| RuntimeError::internal("unknown closure template"))?;
        if args.len() != template.arity as usize {
            return Err(RuntimeError::Arity {
                callee: template.name.clone(),
                expected: template.arity as usize,
                actual: args.len(),
            });
        }
        let args = args.into_iter().map(Slot::Ref).collect();
        self.frame(template.generic, args, Some(closure), true)
    }

    /// Closures get a frame; everything else is called to completion.
    fn call_value(&mut self, callee: Value, args: Vec<Value>) -> Result<Call<'p>, RuntimeError> {
        match callee {
            Value::Closure(closure) => self.generic_frame(closure, args).map(Call::Enter),
            other => {
                let dynamic = self.dynamic;
                dynamic.call(self, &other, args).map(Call::Done)
            }
        }
    }

    /// Run `entry` and every script call it makes until `entry` returns.
    fn run(&mut self, entry: Frame<'p>) -> Result<Slot, RuntimeError> {
        let base = self.depth;
        if base >= self.max_depth {
            return Err(RuntimeError::StackOverflow(self.max_depth));
        }
        let mut frames = vec![entry];
        let result = loop {
            self.depth = base + frames.len();
            let Some(frame) = frames.last_mut() else {
                break Err(underflow());
            };
            match self.step(frame) {
                Ok(Flow::Call(callee)) => {
                    if self.depth >= self.max_depth {
                        break Err(RuntimeError::StackOverflow(self.max_depth));
                    }
                    frames.push(callee);
                }
                Ok(Flow::Return(slot)) => {
                    let erase = frames.pop().is_some_and(|done| done.erase);
                    let slot = if erase { Slot::Ref(slot.into_value()) } else { slot };
                    match frames.last_mut() {
                        Some(caller) => caller.stack.push(slot),
                        None => break Ok(slot),
                    }
                }
                Err(err) => break Err(err),
            }
        };
        self.depth = base;
        result
    }

    /// Execute `frame` until it returns or calls another script function.
    #[allow(clippy::too_many_lines)]
    fn step(&mut self, frame: &mut Frame<'p>) -> Result<Flow<'p>, RuntimeError> {
        let script = self.script;
        let function = frame.function;
        let Frame {
            ip,
            locals,
            stack,
            closure,
            ..
        } = frame;
        let captures: &[Cell] = match closure {
            Some(closure) => &closure.captures,
            None => &[],
        };

        while let Some(&op) = function.ops.get(*ip) {
            *ip += 1;
            match op {
                Op::PushNum(idx) => {
                    let n = script.numbers.get(idx as usize).copied().unwrap_or(0.0);
                    stack.push(Slot::Num(n));
                }
                Op::PushStr(idx) => {
                    let s = script.strings.get(idx as usize).cloned().unwrap_or_else(|| Arc::from(""));
                    stack.push(Slot::Ref(Value::Str(s)));
                }
                Op::PushBool(b) => stack.push(Slot::Bool(b)),
                Op::PushNull => stack.push(Slot::Ref(Value::Null)),
                Op::LoadLocal(idx) => {
                    let slot = locals.get(idx as usize).cloned().ok_or_else(underflow)?;
                    stack.push(slot);
                }
                Op::StoreLocal(idx) => {
                    let value = pop(stack)?;
                    if let Some(local) = locals.get_mut(idx as usize) {
                        *local = value;
                    }
                }
                Op::MakeCell(idx) => {
                    let value = pop(stack)?;
                    if let Some(local) = locals.get_mut(idx as usize) {
                        *local = Slot::Cell(Arc::new(Mutex::new(value)));
                    }
                }
                Op::LoadCell(idx) => {
                    let value = cell_of(locals.get(idx as usize))?.lock().clone();
                    stack.push(value);
                }
                Op::StoreCell(idx) => {
                    let value = pop(stack)?;
                    *cell_of(locals.get(idx as usize))?.lock() = value;
                }
                Op::LoadCapture(idx) => {
                    let cell = captures
                        .get(idx as usize)
                        .ok_or_else(|| RuntimeError::internal("unknown capture"))?;
                    let value = cell.lock().clone();
                    stack.push(value);
                }
                Op::StoreCapture(idx) => {
                    let value = pop(stack)?;
                    let cell = captures
                        .get(idx as usize)
                        .ok_or_else(|| RuntimeError::internal("unknown capture"))?;
                    *cell.lock() = value;
                }
                Op::LoadInput => stack.push(Slot::Ref(self.input.clone())),
                Op::Pop => {
                    pop(stack)?;
                }
                Op::Dup => {
                    let top = stack.last().cloned().ok_or_else(underflow)?;
                    stack.push(top);
                }
                Op::Dup2 => {
                    let at = stack.len().checked_sub(2).ok_or_else(underflow)?;
                    let top = stack.get(at..).map(<[Slot]>::to_vec).ok_or_else(underflow)?;
                    stack.extend(top);
                }

                // Numbers
                Op::AddNum => num_binop(stack, |a, b| a + b)?,
                Op::SubNum => num_binop(stack, |a, b| a - b)?,
                Op::MulNum => num_binop(stack, |a, b| a * b)?,
                Op::DivNum => num_binop(stack, |a, b| a / b)?,
                Op::ModNum => num_binop(stack, |a, b| a % b)?,
                Op::NegNum => {
                    let n = pop_num(stack)?;
                    stack.push(Slot::Num(-n));
                }
                Op::CmpNum(cmp) => {
                    let b = pop_num(stack)?;
                    let a = pop_num(stack)?;
                    stack.push(Slot::Bool(cmp.test(&a, &b)));
                }
                Op::EqNum | Op::NeNum => {
                    let b = pop_num(stack)?;
                    let a = pop_num(stack)?;
                    #[allow(clippy::float_cmp)]
                    let eq = a == b;
                    stack.push(Slot::Bool(eq == (op == Op::EqNum)));
                }

                // Booleans
                Op::EqBool | Op::NeBool => {
                    let b = pop_bool(stack)?;
                    let a = pop_bool(stack)?;
                    stack.push(Slot::Bool((a == b) == (op == Op::EqBool)));
                }
                Op::NotBool => {
                    let b = pop_bool(stack)?;
                    stack.push(Slot::Bool(!b));
                }

                // Strings
                Op::ConcatStr => {
                    let b = pop_value(stack)?;
                    let a = pop_value(stack)?;
                    stack.push(Slot::Ref(Value::from(format!("{a}{b}"))));
                }
                Op::CmpStr(cmp) => {
                    let b = pop_str(stack)?;
                    let a = pop_str(stack)?;
                    stack.push(Slot::Bool(cmp.test(&*a, &*b)));
                }
                Op::EqStr | Op::NeStr => {
                    let b = pop_value(stack)?;
                    let a = pop_value(stack)?;
                    stack.push(Slot::Bool(a.same(&b) == (op == Op::EqStr)));
                }
                Op::ToStr => {
                    let value = pop_value(stack)?;
                    stack.push(Slot::Ref(Value::from(value.to_string())));
                }
                Op::StrLen => {
                    let value = pop_value(stack)?;
                    let s = value.as_str().ok_or_else(|| RuntimeError::NullReference {
                        target: "length".into(),
                    })?;
                    stack.push(Slot::Num(s.chars().count() as f64));
                }
                Op::EqRef | Op::NeRef => {
                    let b = pop_value(stack)?;
                    let a = pop_value(stack)?;
                    stack.push(Slot::Bool(a.same(&b) == (op == Op::EqRef)));
                }

                // Representation changes
                Op::Wrap => {
                    let value = pop_value(stack)?;
                    stack.push(Slot::Ref(value));
                }
                Op::CheckNum(name) => {
                    let value = pop_value(stack)?;
                    stack.push(check(value, Repr::Num, || "Number".into(), script.name(name))?);
                }
                Op::CheckBool(name) => {
                    let value = pop_value(stack)?;
                    stack.push(check(value, Repr::Bool, || "Bool".into(), script.name(name))?);
                }
                Op::CheckStr(name) => {
                    let value = pop_value(stack)?;
                    stack.push(check(value, Repr::Str, || "String".into(), script.name(name))?);
                }
                Op::CheckRecord(layout, name) => {
                    let value = pop_value(stack)?;
                    stack.push(check(value, Repr::Record(layout), || "Record".into(), script.name(name))?);
                }
                Op::CheckArray(layout, name) => {
                    let value = pop_value(stack)?;
                    stack.push(check(value, Repr::Array(layout), || "Array".into(), script.name(name))?);
                }
                Op::CheckHost(id, name) => {
                    let value = pop_value(stack)?;
                    let dynamic = self.dynamic;
                    stack.push(check(value, Repr::Host(id), || dynamic.type_name(id), script.name(name))?);
                }
                Op::CheckClosure(shape, name) => {
                    let value = pop_value(stack)?;
                    stack.push(check(value, Repr::Closure(shape), || "Lambda".into(), script.name(name))?);
                }
                Op::Narrow(kind) => {
                    let n = pop_num(stack)?;
                    stack.push(Slot::Num(kind.narrow(n)));
                }

                // Dynamic path
                Op::DynAdd => dyn_binop(stack, BinOp::Add)?,
                Op::DynSub => dyn_binop(stack, BinOp::Sub)?,
                Op::DynMul => dyn_binop(stack, BinOp::Mul)?,
                Op::DynDiv => dyn_binop(stack, BinOp::Div)?,
                Op::DynMod => dyn_binop(stack, BinOp::Mod)?,
                Op::DynNeg => {
                    let value = pop_value(stack)?;
                    stack.push(Slot::Ref(dynamic::negate(&value)?));
                }
                Op::DynCompare(cmp) => {
                    let b = pop_value(stack)?;
                    let a = pop_value(stack)?;
                    stack.push(Slot::Bool(dynamic::compare(cmp, &a, &b)?));
                }
                Op::DynEq | Op::DynNe => {
                    let b = pop_value(stack)?;
                    let a = pop_value(stack)?;
                    stack.push(Slot::Bool(dynamic::equals(&a, &b) == (op == Op::DynEq)));
                }
                Op::DynGetMember(name) => {
                    let target = pop_value(stack)?;
                    stack.push(Slot::Ref(self.dynamic.get_member(&target, script.name(name))?));
                }
                Op::DynSetMember(name) => {
                    let value = pop_value(stack)?;
                    let target = pop_value(stack)?;
                    self.dynamic.set_member(&target, script.name(name), value)?;
                }
                Op::DynGetIndex => {
                    let index = pop_value(stack)?;
                    let target = pop_value(stack)?;
                    stack.push(Slot::Ref(self.dynamic.get_index(&target, &index)?));
                }
                Op::DynSetIndex => {
                    let value = pop_value(stack)?;
                    let index = pop_value(stack)?;
                    let target = pop_value(stack)?;
                    self.dynamic.set_index(&target, &index, value)?;
                }
                Op::DynCall(argc) => {
                    let args = pop_values(stack, argc as usize)?;
                    let callee = pop_value(stack)?;
                    match self.call_value(callee, args)? {
                        Call::Done(value) => stack.push(Slot::Ref(value)),
                        Call::Enter(callee) => return Ok(Flow::Call(callee)),
                    }
                }
                Op::DynCallMember(name, argc) => {
                    let args = pop_values(stack, argc as usize)?;
                    let target = pop_value(stack)?;
                    let callee = self.dynamic.member_callee(&target, script.name(name))?;
                    match self.call_value(callee, args)? {
                        Call::Done(value) => stack.push(Slot::Ref(value)),
                        Call::Enter(callee) => return Ok(Flow::Call(callee)),
                    }
                }

                // Records and arrays
                Op::NewRecord(layout) => {
                    let layout = script
                        .records
                        .get(layout as usize)
                        .cloned()
                        .ok_or_else(|| RuntimeError::internal("unknown record layout"))?;
                    let fields = layout.fields.iter().map(|(_, repr)| repr.zero()).collect();
                    stack.push(Slot::Ref(Value::Record(Arc::new(RwLock::new(RecordObj { layout, fields })))));
                }
                Op::GetField(idx) => {
                    let target = pop_value(stack)?;
                    let Value::Record(record) = &target else {
                        return Err(RuntimeError::NullReference { target: "field".into() });
                    };
                    let slot = record.read().fields.get(idx as usize).cloned().ok_or_else(underflow)?;
                    stack.push(slot);
                }
                Op::SetField(idx) => {
                    let value = pop(stack)?;
                    let target = pop_value(stack)?;
                    let Value::Record(record) = &target else {
                        return Err(RuntimeError::NullReference { target: "field".into() });
                    };
                    let mut record = record.write();
                    if let Some(field) = record.fields.get_mut(idx as usize) {
                        *field = value;
                    }
                }
                Op::NewArray(layout, count) => {
                    let layout = script
                        .arrays
                        .get(layout as usize)
                        .cloned()
                        .ok_or_else(|| RuntimeError::internal("unknown array layout"))?;
                    let items = pop_n(stack, count as usize)?;
                    stack.push(Slot::Ref(Value::Array(Arc::new(RwLock::new(ArrayObj { layout, items })))));
                }
                Op::GetIndex => {
                    let index = pop_num(stack)?;
                    let target = pop_value(stack)?;
                    let Value::Array(array) = &target else {
                        return Err(RuntimeError::NullReference { target: "[]".into() });
                    };
                    let array = array.read();
                    let slot = element(&array.items, index)?.clone();
                    stack.push(slot);
                }
                Op::SetIndex => {
                    let value = pop(stack)?;
                    let index = pop_num(stack)?;
                    let target = pop_value(stack)?;
                    let Value::Array(array) = &target else {
                        return Err(RuntimeError::NullReference { target: "[]".into() });
                    };
                    let mut array = array.write();
                    let len = array.items.len();
                    let i = position(index, len)?;
                    if let Some(item) = array.items.get_mut(i) {
                        *item = value;
                    }
                }
                Op::ArrayAdd => {
                    let value = pop(stack)?;
                    let target = pop_value(stack)?;
                    let Value::Array(array) = &target else {
                        return Err(RuntimeError::NullReference { target: "add".into() });
                    };
                    array.write().items.push(value);
                    stack.push(Slot::Ref(Value::Null));
                }
                Op::ArrayLen => {
                    let target = pop_value(stack)?;
                    let Value::Array(array) = &target else {
                        return Err(RuntimeError::NullReference { target: "length".into() });
                    };
                    stack.push(Slot::Num(array.read().items.len() as f64));
                }

                // Host members
                Op::GetHost(m) => {
                    let member = self.member(m)?;
                    let target = pop_value(stack)?;
                    let value = member.info.read(host_receiver(&target, member)?)?;
                    stack.push(host_result(value, member)?);
                }
                Op::SetHost(m) => {
                    let member = self.member(m)?;
                    let value = pop_value(stack)?;
                    let target = pop_value(stack)?;
                    let host = host_receiver(&target, member)?;
                    let value = match member.info.value_type() {
                        Some(ty) => coerce_host_value(ty, value, &member.info.qualified_name())?,
                        None => value,
                    };
                    member.info.write(host, value)?;
                }
                Op::CallHost(m, argc) => {
                    let member = self.member(m)?;
                    let args = pop_values(stack, argc as usize)?;
                    let target = pop_value(stack)?;
                    let value = member.info.call(Some(host_receiver(&target, member)?), &args)?;
                    stack.push(host_result(value, member)?);
                }
                Op::CallStatic(m, argc) => {
                    let member = self.member(m)?;
                    let args = pop_values(stack, argc as usize)?;
                    let value = member.info.call(None, &args)?;
                    stack.push(host_result(value, member)?);
                }
                Op::GetHostIndex(m) => {
                    let member = self.member(m)?;
                    let key = pop_value(stack)?;
                    let target = pop_value(stack)?;
                    let value = member.info.index_get(host_receiver(&target, member)?, &key)?;
                    stack.push(host_result(value, member)?);
                }
                Op::SetHostIndex(m) => {
                    let member = self.member(m)?;
                    let value = pop_value(stack)?;
                    let key = pop_value(stack)?;
                    let target = pop_value(stack)?;
                    let value = match &member.info.kind {
                        MemberKind::Indexer { ty, .. } => {
                            coerce_host_value(ty, value, &format!("{}[]", member.info.owner))?
                        }
                        _ => value,
                    };
                    member.info.index_set(host_receiver(&target, member)?, &key, value)?;
                }
                Op::BindMethod(m) => {
                    let member = self.member(m)?;
                    let receiver = pop_value(stack)?;
                    let target = if member.info.is_extension() {
                        BoundTarget::Extension(Arc::clone(&member.info))
                    } else {
                        BoundTarget::Member(Arc::clone(&member.info))
                    };
                    stack.push(Slot::Ref(Value::Method(Arc::new(BoundMethod { receiver, target }))));
                }
                Op::BindArrayAdd => {
                    let receiver = pop_value(stack)?;
                    let target = BoundTarget::ArrayAdd;
                    stack.push(Slot::Ref(Value::Method(Arc::new(BoundMethod { receiver, target }))));
                }

                // Closures
                Op::MakeClosure(t) => {
                    let template = script
                        .closures
                        .get(t as usize)
                        .ok_or_else(|| RuntimeError::internal("unknown closure template"))?;
                    let cells = template
                        .captures
                        .iter()
                        .map(|source| match source {
                            CaptureSource::Local(slot) => cell_of(locals.get(*slot as usize)).cloned(),
                            CaptureSource::Capture(i) => captures
                                .get(*i as usize)
                                .cloned()
                                .ok_or_else(|| RuntimeError::internal("unknown capture")),
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    stack.push(Slot::Ref(Value::Closure(Arc::new(Closure {
                        template: t,
                        shape: template.shape,
                        captures: cells,
                    }))));
                }
                Op::CallSig(f, argc) => {
                    let args = pop_n(stack, argc as usize)?;
                    let closure = match pop_value(stack)? {
                        Value::Closure(closure) => closure,
                        other => {
                            return Err(RuntimeError::NotCallable {
                                callee: other.type_name(),
                            })
                        }
                    };
                    return Ok(Flow::Call(self.frame(f, args, Some(closure), false)?));
                }

                // Control flow
                Op::Jump(target) => *ip = target as usize,
                Op::JumpIfFalse(target) => {
                    if !pop_bool(stack)? {
                        *ip = target as usize;
                    }
                }
                Op::JumpIfTrue(target) => {
                    if pop_bool(stack)? {
                        *ip = target as usize;
                    }
                }
                Op::Return => return Ok(Flow::Return(pop(stack)?)),
                Op::Print => {
                    let value = pop_value(stack)?;
                    self.sink.print(&value.to_string());
                }
                Op::Unreachable => {
                    return Err(RuntimeError::internal(format!("unreachable code in {}", function.name)));
                }
            }
        }
        Ok(Flow::Return(Slot::Ref(Value::Null)))
    }
}

#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
fn position(index: f64, len: usize) -> Result<usize, RuntimeError> {
    if index >= 0.0 && index.fract() == 0.0 && index < len as f64 {
        Ok(index as usize)
    } else {
        Err(RuntimeError::IndexOutOfRange { index, len })
    }
}

fn element(items: &[Slot], index: f64) -> Result<&Slot, RuntimeError> {
    let i = position(index, items.len())?;
    items.get(i).ok_or(RuntimeError::IndexOutOfRange { index, len: items.len() })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::dsl::compiler::compile;
    use crate::dsl::fixture::{self, Order};
    use crate::dsl::infer::analyze;
    use crate::dsl::lexer::lex;
    use crate::dsl::options::{BufferSink, CompileOptions};
    use crate::dsl::parser::parse;

    const TEST_DEPTH: usize = 64;

    fn run_with(src: &str, order: Order) -> (Result<Value, RuntimeError>, HostObject, Vec<String>) {
        run_limited(src, order, TEST_DEPTH)
    }

    fn run_limited(
        src: &str,
        order: Order,
        max_call_depth: usize,
    ) -> (Result<Value, RuntimeError>, HostObject, Vec<String>) {
        let script = parse(lex(src).unwrap()).unwrap();
        let (types, id) = fixture::types();
        let analysis = analyze(&script, &types, Some(id), &CompileOptions::default()).unwrap();
        let compiled = compile(&script, &analysis, &types).unwrap();
        let dynamic = DynamicOps::new(types.snapshot());
        let input = fixture::order_object(id, order);
        let sink = BufferSink::new();
        let ctx = VmContext {
            input: Some(&input),
            sink: &sink,
            max_call_depth,
        };
        let result = execute(&compiled, &dynamic, &ctx);
        (result, input, sink.lines())
    }

    fn run(src: &str) -> Value {
        run_with(src, fixture::sample_order()).0.unwrap()
    }

    fn run_err(src: &str) -> RuntimeError {
        run_with(src, fixture::sample_order()).0.unwrap_err()
    }

    #[test]
    fn arithmetic_precedence() {
        assert_eq!(run("return 2 + 3 * 4;").as_number(), Some(14.0));
        assert_eq!(run("return (2 + 3) * 4 - 10 % 4;").as_number(), Some(18.0));
        assert_eq!(run("return -2 * 3;").as_number(), Some(-6.0));
    }

    #[test]
    fn no_return_yields_null() {
        assert!(run("var x = 1;").is_null());
    }

    #[test]
    fn heterogeneous_branch_concatenates() {
        let v = run("var v; if (false) v = 1; else v = \"s\"; return v + 1;");
        assert_eq!(v.as_str(), Some("s1"));
    }

    #[test]
    fn dynamic_type_error_names_operands() {
        let err = run_err("var v; if (true) v = true; else v = 1; return v - 1;");
        assert_eq!(err.to_string(), "Operator '-' cannot be applied to Bool and Number");
    }

    #[test]
    fn loops_and_increments() {
        let v = run("var sum = 0; for (var i = 0; i < 5; i++) { sum = sum + i; } return sum;");
        assert_eq!(v.as_number(), Some(10.0));
        let v = run("var n = 10; while (n > 3) n--; return n;");
        assert_eq!(v.as_number(), Some(3.0));
    }

    #[test]
    fn short_circuit_skips_right_side() {
        let v = run("var hits = 0; var f = () => { hits++; return true; }; var r = false && f(); return hits;");
        assert_eq!(v.as_number(), Some(0.0));
        let v = run("var r = true || 1 / 0 > 0; return r;");
        assert_eq!(v.as_bool(), Some(true));
    }

    #[test]
    fn records_alias_by_reference() {
        let v = run("var a = {x: 1}; var b = a; b.y = \"s\"; b.x = 5; return a.x + a.y;");
        assert_eq!(v.as_str(), Some("5s"));
    }

    #[test]
    fn typed_field_stores() {
        let v = run("var p = {x: 1, y: 2}; p.x = p.x + 4; p.y = 0; return p.x + p.y;");
        assert_eq!(v.as_number(), Some(5.0));
    }

    #[test]
    fn dynamic_stores_may_alias_their_container() {
        let v = run("var a = []; a.add(a); var d = null; if (true) d = a; d[0] = d; return a.length;");
        assert_eq!(v.as_number(), Some(1.0));
        let v = run("var a = []; a.add(a); var d = null; if (true) d = a; d.add(d); return a.length;");
        assert_eq!(v.as_number(), Some(2.0));
        let v = run("var r = {n: 1, me: null}; var d = null; if (true) d = r; d.me = d; d.n = 5; return r.n;");
        assert_eq!(v.as_number(), Some(5.0));
    }

    #[test]
    fn arrays_index_and_grow() {
        let v = run("var a = [1, 2]; a.add(3); a[0] = 10; return a[0] + a.length;");
        assert_eq!(v.as_number(), Some(13.0));
        let err = run_err("var a = [1]; return a[4];");
        assert!(matches!(err, RuntimeError::IndexOutOfRange { len: 1, .. }));
    }

    #[test]
    fn lambda_signatures_run_independently() {
        let v = run("var f = (a, b) => a + b; var n = f(1, 2); var s = f(\"x\", \"y\"); return s + n;");
        assert_eq!(v.as_str(), Some("xy3"));
    }

    #[test]
    fn recursion_runs_through_generic_entry() {
        let v = run("var f = (n) => { if (n <= 1) return 1; return n * f(n - 1); }; return f(3);");
        assert_eq!(v.as_number(), Some(6.0));
    }

    #[test]
    fn closures_share_captured_variables() {
        let v = run("var count = 0; var inc = () => { count++; }; inc(); inc(); return count;");
        assert_eq!(v.as_number(), Some(2.0));
        let v = run("var make = (k) => (x) => x * k; var triple = make(3); return triple(4);");
        assert_eq!(v.as_number(), Some(12.0));
    }

    #[test]
    fn host_members_read_and_write() {
        let (result, input, _) = run_with("Count = Count + 2; return Total(0.5);", fixture::sample_order());
        assert_eq!(result.unwrap().as_number(), Some(12.0));
        assert_eq!(input.with(|o: &Order| o.count), Some(5));

        let v = run("return Name + \":\" + Describe() + \":\" + Doubled();");
        assert_eq!(v.as_str(), Some("widget:3 x widget:6"));
        assert_eq!(run("return Tags.length + Name.length;").as_number(), Some(8.0));
    }

    #[test]
    fn null_host_string_fails_typed_read() {
        let (result, _, _) = run_with("return Name;", Order::default());
        assert!(matches!(result, Err(RuntimeError::TypeMismatch { .. })));
        let (result, _, _) = run_with("var v = \"x\"; if (true) v = null; Name = v;", fixture::sample_order());
        assert!(matches!(result, Err(RuntimeError::TypeMismatch { .. })));
    }

    #[test]
    fn guarded_host_store_rejects_before_write() {
        let (result, input, _) = run_with("var v = null; if (true) v = \"many\"; Count = v;", fixture::sample_order());
        assert!(matches!(result, Err(RuntimeError::TypeMismatch { .. })));
        assert_eq!(input.with(|o: &Order| o.count), Some(3));
    }

    #[test]
    fn guarded_host_store_narrows_numbers() {
        let (result, input, _) = run_with("var v = null; if (true) v = 7.8; Count = v;", fixture::sample_order());
        assert!(result.is_ok());
        assert_eq!(input.with(|o: &Order| o.count), Some(7));
    }

    #[test]
    fn host_failure_names_member() {
        let err = run_err("Fail();");
        assert_eq!(err.to_string(), "Call to 'Order.Fail' failed: order is locked");
    }

    #[test]
    fn print_goes_to_sink() {
        let (_, _, lines) = run_with("print 1 + 1; print $\"n={Count}\"; print {a: 1};", fixture::sample_order());
        assert_eq!(lines, vec!["2", "n=3", "{a: 1}"]);
    }

    #[test]
    fn runaway_recursion_is_bounded() {
        let err = run_err("var f = (n) => f(n + 1); return f(0);");
        assert_eq!(err, RuntimeError::StackOverflow(TEST_DEPTH));
    }

    #[test]
    fn deep_recursion_stays_off_the_native_stack() {
        let src = "var f = (n) => { if (n <= 0) return 0; return 1 + f(n - 1); }; return f(250);";
        let (result, _, _) = run_limited(src, fixture::sample_order(), DEFAULT_MAX_DEPTH);
        assert_eq!(result.unwrap().as_number(), Some(250.0));

        let src = "var f = (n) => { if (n <= 0) return 0; return 1 + f(n - 1); }; return f(300);";
        let (result, _, _) = run_limited(src, fixture::sample_order(), DEFAULT_MAX_DEPTH);
        assert_eq!(result.unwrap_err(), RuntimeError::StackOverflow(DEFAULT_MAX_DEPTH));
    }

    #[test]
    fn dynamic_calls_check_arity() {
        let err = run_err("var f = (a) => a; var g = null; if (true) g = f; return g(1, 2);");
        assert!(matches!(err, RuntimeError::Arity { expected: 1, actual: 2, .. }));
    }

    #[test]
    fn string_interpolation_and_equality() {
        let v = run("var a = 2; var s = $\"{a} + {a} = {a + a}\"; return s == \"2 + 2 = 4\";");
        assert_eq!(v.as_bool(), Some(true));
        assert_eq!(run("return \"abc\" < \"abd\";").as_bool(), Some(true));
    }
}
