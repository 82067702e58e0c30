//! The dynamic operations library.
//!
//! Everything here works on erased [`Value`]s and decides behavior from
//! the runtime kinds of the operands. Compiled code only reaches it for
//! expressions whose shapes inference could not pin down, and for guarded
//! stores into host members.

#![allow(clippy::cast_precision_loss)]

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::ast::BinOp;
use super::builtins::{self, BuiltinKind, BuiltinReceiver};
use super::compiler::CmpOp;
use super::error::RuntimeError;
use super::host::{Container, HostTypeId, MemberKind, TypeRef};
use super::types::{MemberInfo, Receiver, TypeSnapshot};
use super::value::{BoundMethod, BoundTarget, Closure, Value};

/// Invokes script closures on behalf of the dynamic call path.
pub trait Invoke {
    fn invoke_closure(&mut self, closure: &Arc<Closure>, args: Vec<Value>) -> Result<Value, RuntimeError>;
}

fn incompatible(op: &str, left: &Value, right: &Value) -> RuntimeError {
    RuntimeError::IncompatibleOperands {
        op: op.to_string(),
        left: left.type_name(),
        right: right.type_name(),
    }
}

fn mismatch(target: &str, expected: impl ToString, actual: &Value) -> RuntimeError {
    RuntimeError::TypeMismatch {
        target: target.to_string(),
        expected: expected.to_string(),
        actual: actual.type_name(),
    }
}

/// Arithmetic with a runtime type switch. `+` concatenates as soon as
/// either side is a string.
pub fn arith(op: BinOp, left: &Value, right: &Value) -> Result<Value, RuntimeError> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => Ok(Value::Number(match op {
            BinOp::Add => a + b,
            BinOp::Sub => a - b,
            BinOp::Mul => a * b,
            BinOp::Div => a / b,
            BinOp::Mod => a % b,
            _ => return Err(incompatible(op.symbol(), left, right)),
        })),
        (Value::Str(_), _) | (_, Value::Str(_)) if op == BinOp::Add => Ok(Value::from(format!("{left}{right}"))),
        _ => Err(incompatible(op.symbol(), left, right)),
    }
}

pub fn negate(value: &Value) -> Result<Value, RuntimeError> {
    match value {
        Value::Number(n) => Ok(Value::Number(-n)),
        _ => Err(RuntimeError::IncompatibleOperand {
            op: "-".into(),
            operand: value.type_name(),
        }),
    }
}

/// Ordering of two numbers or two strings (ordinal).
pub fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool, RuntimeError> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => Ok(op.test(a, b)),
        (Value::Str(a), Value::Str(b)) => Ok(op.test(&**a, &**b)),
        _ => Err(incompatible(op.symbol(), left, right)),
    }
}

pub fn equals(left: &Value, right: &Value) -> bool {
    left.same(right)
}

/// Check and convert a value headed for a host member, argument or
/// indexer of type `ty`. Numbers are narrowed to the host kind.
pub fn coerce_host_value(ty: &TypeRef, value: Value, target: &str) -> Result<Value, RuntimeError> {
    match (ty, &value) {
        (TypeRef::Number(kind), Value::Number(n)) => Ok(Value::Number(kind.narrow(*n))),
        (TypeRef::Bool, Value::Bool(_)) | (TypeRef::String, Value::Str(_)) => Ok(value),
        (TypeRef::Host(id), Value::Host(h)) if h.type_id() == *id => Ok(value),
        (TypeRef::Host(_), Value::Null) => Ok(value),
        (
            TypeRef::Generic {
                container: Container::Nullable,
                args,
            },
            _,
        ) => match (args.first(), &value) {
            (_, Value::Null) => Ok(value),
            (Some(inner), _) => coerce_host_value(inner, value, target),
            (None, _) => Ok(value),
        },
        (TypeRef::Number(_) | TypeRef::Bool | TypeRef::String | TypeRef::Host(_), _) => Err(mismatch(target, ty, &value)),
        (TypeRef::Array | TypeRef::Generic { .. }, Value::Array(_) | Value::Null) => Ok(value),
        (TypeRef::Record, Value::Record(_) | Value::Null) => Ok(value),
        (TypeRef::Array | TypeRef::Generic { .. } | TypeRef::Record, _) => Err(mismatch(target, ty, &value)),
        _ => Ok(value),
    }
}

#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
fn checked_index(index: f64, len: usize) -> Result<usize, RuntimeError> {
    if index >= 0.0 && index.fract() == 0.0 && index < len as f64 {
        return Ok(index as usize);
    }
    Err(RuntimeError::IndexOutOfRange { index, len })
}

/// Member resolution against a snapshot of the validated host types.
///
/// Lookups by (receiver, name) are memoized, misses included, so
/// repeated dynamic access to the same member is a single map lookup.
#[derive(Debug, Default)]
pub struct DynamicOps {
    types: TypeSnapshot,
    cache: RwLock<HashMap<(Receiver, String), Option<Arc<MemberInfo>>>>,
}

impl DynamicOps {
    pub fn new(types: TypeSnapshot) -> Self {
        Self {
            types,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn type_name(&self, id: HostTypeId) -> String {
        self.types
            .type_info(id)
            .map_or_else(|| format!("host type #{}", id.0), |t| t.name.clone())
    }

    /// Number of memoized lookups, hits and misses.
    pub fn cached_lookups(&self) -> usize {
        self.cache.read().len()
    }

    fn resolve(&self, receiver: Receiver, name: &str) -> Option<Arc<MemberInfo>> {
        let key = (receiver, name.to_string());
        if let Some(hit) = self.cache.read().get(&key) {
            return hit.clone();
        }
        let found = self.types.member(receiver, name);
        tracing::trace!(?receiver, name, found = found.is_some(), "dynamic member lookup");
        self.cache.write().insert(key, found.clone());
        found
    }

    fn not_found(target: &Value, name: &str) -> RuntimeError {
        RuntimeError::MemberNotFound {
            receiver: target.type_name(),
            member: name.to_string(),
        }
    }

    fn bind(receiver: &Value, member: Arc<MemberInfo>) -> Value {
        let target = if member.is_extension() {
            BoundTarget::Extension(member)
        } else {
            BoundTarget::Member(member)
        };
        Value::Method(Arc::new(BoundMethod {
            receiver: receiver.clone(),
            target,
        }))
    }

    pub fn get_member(&self, target: &Value, name: &str) -> Result<Value, RuntimeError> {
        match target {
            Value::Null => {
                return Err(RuntimeError::NullReference {
                    target: name.to_string(),
                })
            }
            Value::Record(r) => {
                let r = r.read();
                if let Some(slot) = r.layout.index_of(name).and_then(|i| r.fields.get(i)) {
                    return Ok(slot.to_value());
                }
            }
            Value::Array(a) => match builtins::lookup(BuiltinReceiver::Array, name).map(|b| b.kind) {
                Some(BuiltinKind::Length) => return Ok(Value::from(a.read().items.len() as f64)),
                Some(BuiltinKind::Add) => {
                    return Ok(Value::Method(Arc::new(BoundMethod {
                        receiver: target.clone(),
                        target: BoundTarget::ArrayAdd,
                    })))
                }
                None => {}
            },
            Value::Str(s) => {
                if let Some(BuiltinKind::Length) = builtins::lookup(BuiltinReceiver::String, name).map(|b| b.kind) {
                    return Ok(Value::from(s.chars().count() as f64));
                }
            }
            _ => {}
        }

        let receiver = Receiver::of_value(target).ok_or_else(|| Self::not_found(target, name))?;
        match self.resolve(receiver, name) {
            Some(member) if member.is_callable() => Ok(Self::bind(target, member)),
            Some(member) => match target {
                Value::Host(h) => {
                    let value = member.read(h)?;
                    match member.value_type() {
                        Some(ty) => coerce_host_value(ty, value, &member.qualified_name()),
                        None => Ok(value),
                    }
                }
                _ => Err(Self::not_found(target, name)),
            },
            None => Err(Self::not_found(target, name)),
        }
    }

    pub fn set_member(&self, target: &Value, name: &str, value: Value) -> Result<(), RuntimeError> {
        match target {
            Value::Null => Err(RuntimeError::NullReference {
                target: name.to_string(),
            }),
            Value::Record(r) => {
                let index = r.read().layout.index_of(name);
                let Some(index) = index else {
                    return Err(Self::not_found(target, name));
                };
                let repr = r.read().layout.repr_of(index);
                let actual = value.type_name();
                let slot = value.into_slot(repr).ok_or_else(|| RuntimeError::TypeMismatch {
                    target: name.to_string(),
                    expected: repr.name().to_string(),
                    actual,
                })?;
                if let Some(field) = r.write().fields.get_mut(index) {
                    *field = slot;
                }
                Ok(())
            }
            Value::Host(h) => {
                let member = self
                    .resolve(Receiver::Host(h.type_id()), name)
                    .ok_or_else(|| Self::not_found(target, name))?;
                let qualified = member.qualified_name();
                if !member.is_writable() {
                    return Err(RuntimeError::ReadOnly { member: qualified });
                }
                let value = match member.value_type() {
                    Some(ty) => coerce_host_value(ty, value, &qualified)?,
                    None => value,
                };
                member.write(h, value)
            }
            Value::Array(_) | Value::Str(_) if name == "length" => Err(RuntimeError::ReadOnly {
                member: format!("{}.length", target.type_name()),
            }),
            _ => Err(Self::not_found(target, name)),
        }
    }

    fn indexer(&self, id: HostTypeId) -> Option<Arc<MemberInfo>> {
        self.types.type_info(id).and_then(|t| t.indexer.clone())
    }

    fn invalid_index(target: &Value, index: &Value) -> RuntimeError {
        RuntimeError::InvalidIndex {
            receiver: target.type_name(),
            key: index.type_name(),
        }
    }

    pub fn get_index(&self, target: &Value, index: &Value) -> Result<Value, RuntimeError> {
        match (target, index) {
            (Value::Null, _) => Err(RuntimeError::NullReference { target: "[]".into() }),
            (Value::Array(a), Value::Number(n)) => {
                let a = a.read();
                let i = checked_index(*n, a.items.len())?;
                Ok(a.items.get(i).map_or(Value::Null, |s| s.to_value()))
            }
            (Value::Str(s), Value::Number(n)) => {
                let len = s.chars().count();
                let i = checked_index(*n, len)?;
                Ok(s.chars().nth(i).map_or(Value::Null, |c| Value::from(c.to_string())))
            }
            (Value::Record(_), Value::Str(name)) => self.get_member(target, name),
            (Value::Host(h), _) => {
                let member = self.indexer(h.type_id()).ok_or_else(|| Self::invalid_index(target, index))?;
                let key = match &member.kind {
                    MemberKind::Indexer { key, .. } => {
                        coerce_host_value(key, index.clone(), &format!("{}[]", member.owner))?
                    }
                    _ => index.clone(),
                };
                member.index_get(h, &key)
            }
            _ => Err(Self::invalid_index(target, index)),
        }
    }

    pub fn set_index(&self, target: &Value, index: &Value, value: Value) -> Result<(), RuntimeError> {
        match (target, index) {
            (Value::Null, _) => Err(RuntimeError::NullReference { target: "[]".into() }),
            (Value::Array(a), Value::Number(n)) => {
                // Converting may inspect `a` itself, so it happens before the write lock.
                let repr = a.read().layout.element;
                let actual = value.type_name();
                let slot = value.into_slot(repr).ok_or_else(|| RuntimeError::TypeMismatch {
                    target: "element".into(),
                    expected: repr.name().to_string(),
                    actual,
                })?;
                let mut a = a.write();
                let i = checked_index(*n, a.items.len())?;
                if let Some(item) = a.items.get_mut(i) {
                    *item = slot;
                }
                Ok(())
            }
            (Value::Record(_), Value::Str(name)) => self.set_member(target, name, value),
            (Value::Host(h), _) => {
                let member = self.indexer(h.type_id()).ok_or_else(|| Self::invalid_index(target, index))?;
                let label = format!("{}[]", member.owner);
                let (key, value) = match &member.kind {
                    MemberKind::Indexer { key, ty, .. } => (
                        coerce_host_value(key, index.clone(), &label)?,
                        coerce_host_value(ty, value, &label)?,
                    ),
                    _ => (index.clone(), value),
                };
                member.index_set(h, &key, value)
            }
            _ => Err(Self::invalid_index(target, index)),
        }
    }

    /// Call a closure or a bound method.
    pub fn call(&self, vm: &mut dyn Invoke, callee: &Value, args: Vec<Value>) -> Result<Value, RuntimeError> {
        match callee {
            Value::Closure(closure) => vm.invoke_closure(closure, args),
            Value::Method(bound) => self.call_bound(bound, args),
            _ => Err(RuntimeError::NotCallable {
                callee: callee.type_name(),
            }),
        }
    }

    /// `target.name(args)` with the member resolved at runtime.
    pub fn call_member(
        &self,
        vm: &mut dyn Invoke,
        target: &Value,
        name: &str,
        args: Vec<Value>,
    ) -> Result<Value, RuntimeError> {
        let callee = self.member_callee(target, name)?;
        self.call(vm, &callee, args)
    }

    /// Resolve `target.name` to something callable.
    pub fn member_callee(&self, target: &Value, name: &str) -> Result<Value, RuntimeError> {
        match self.get_member(target, name)? {
            callee @ (Value::Closure(_) | Value::Method(_)) => Ok(callee),
            _ => Err(RuntimeError::NotCallable {
                callee: format!("{}.{name}", target.type_name()),
            }),
        }
    }

    fn call_bound(&self, bound: &BoundMethod, args: Vec<Value>) -> Result<Value, RuntimeError> {
        match &bound.target {
            BoundTarget::Member(member) => {
                let args = Self::host_args(member, member.call_params(), args)?;
                let receiver = bound.receiver.as_host().ok_or_else(|| RuntimeError::NullReference {
                    target: member.qualified_name(),
                })?;
                member.call(Some(receiver), &args)
            }
            BoundTarget::Extension(member) => {
                let mut full = Vec::with_capacity(args.len() + 1);
                full.push(bound.receiver.clone());
                full.extend(args);
                let params = match &member.kind {
                    MemberKind::Function { params, .. } => params.as_slice(),
                    _ => &[],
                };
                if full.len() != params.len() {
                    return Err(RuntimeError::Arity {
                        callee: member.qualified_name(),
                        expected: params.len().saturating_sub(1),
                        actual: full.len() - 1,
                    });
                }
                let full = Self::host_args(member, params, full)?;
                member.call(None, &full)
            }
            BoundTarget::ArrayAdd => {
                let [item] = <[Value; 1]>::try_from(args).map_err(|args| RuntimeError::Arity {
                    callee: "add".into(),
                    expected: 1,
                    actual: args.len(),
                })?;
                let Value::Array(array) = &bound.receiver else {
                    return Err(RuntimeError::NullReference { target: "add".into() });
                };
                let repr = array.read().layout.element;
                let actual = item.type_name();
                let slot = item.into_slot(repr).ok_or_else(|| RuntimeError::TypeMismatch {
                    target: "add".into(),
                    expected: repr.name().to_string(),
                    actual,
                })?;
                array.write().items.push(slot);
                Ok(Value::Null)
            }
        }
    }

    fn host_args(member: &MemberInfo, params: &[TypeRef], args: Vec<Value>) -> Result<Vec<Value>, RuntimeError> {
        if args.len() != params.len() {
            return Err(RuntimeError::Arity {
                callee: member.qualified_name(),
                expected: params.len(),
                actual: args.len(),
            });
        }
        let name = member.qualified_name();
        args.into_iter()
            .zip(params)
            .enumerate()
            .map(|(i, (arg, ty))| coerce_host_value(ty, arg, &format!("argument {} of '{name}'", i + 1)))
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::dsl::fixture::{self, Order};
    use crate::dsl::host::NumKind;
    use crate::dsl::value::{ArrayLayout, ArrayObj, Repr};

    struct NoClosures;

    impl Invoke for NoClosures {
        fn invoke_closure(&mut self, _: &Arc<Closure>, _: Vec<Value>) -> Result<Value, RuntimeError> {
            Err(RuntimeError::internal("closures are not supported here"))
        }
    }

    fn ops() -> (DynamicOps, Value) {
        let (types, id) = fixture::types();
        let order = Value::Host(fixture::order_object(id, fixture::sample_order()));
        (DynamicOps::new(types.snapshot()), order)
    }

    #[test]
    fn string_plus_anything_concatenates() {
        let v = arith(BinOp::Add, &Value::from("s"), &Value::from(1.0)).unwrap();
        assert_eq!(v.as_str(), Some("s1"));
        let v = arith(BinOp::Add, &Value::from(2.5), &Value::from("x")).unwrap();
        assert_eq!(v.as_str(), Some("2.5x"));
    }

    #[test]
    fn incompatible_operands_are_named() {
        let err = arith(BinOp::Sub, &Value::from("s"), &Value::from(1.0)).unwrap_err();
        assert_eq!(err.to_string(), "Operator '-' cannot be applied to String and Number");
        let err = compare(CmpOp::Lt, &Value::from(true), &Value::from(1.0)).unwrap_err();
        assert!(matches!(err, RuntimeError::IncompatibleOperands { .. }));
        assert!(negate(&Value::Null).is_err());
    }

    #[test]
    fn strings_compare_ordinally() {
        assert!(compare(CmpOp::Lt, &Value::from("a"), &Value::from("b")).unwrap());
        assert!(!compare(CmpOp::Ge, &Value::from("B"), &Value::from("a")).unwrap());
    }

    #[test]
    fn host_members_by_name() {
        let (ops, order) = ops();
        assert_eq!(ops.get_member(&order, "Count").unwrap().as_number(), Some(3.0));
        ops.set_member(&order, "Count", Value::from(7.9)).unwrap();
        assert_eq!(order.as_host().unwrap().with(|o: &Order| o.count), Some(7));

        let err = ops.set_member(&order, "Price", Value::from(1.0)).unwrap_err();
        assert_eq!(err, RuntimeError::ReadOnly { member: "Order.Price".into() });
        let err = ops.get_member(&order, "Missing").unwrap_err();
        assert!(matches!(err, RuntimeError::MemberNotFound { .. }));
    }

    #[test]
    fn failed_guard_leaves_host_untouched() {
        let (ops, order) = ops();
        let err = ops.set_member(&order, "Count", Value::from("many")).unwrap_err();
        assert_eq!(
            err,
            RuntimeError::TypeMismatch {
                target: "Order.Count".into(),
                expected: TypeRef::Number(NumKind::I32).to_string(),
                actual: "String".into(),
            }
        );
        assert_eq!(order.as_host().unwrap().with(|o: &Order| o.count), Some(3));
    }

    #[test]
    fn null_host_string_is_rejected() {
        let (ops, order) = ops();
        let id = order.as_host().unwrap().type_id();
        let unnamed = Value::Host(fixture::order_object(id, Order::default()));
        let err = ops.get_member(&unnamed, "Name").unwrap_err();
        assert!(matches!(err, RuntimeError::TypeMismatch { .. }));

        let err = ops.set_member(&order, "Name", Value::Null).unwrap_err();
        assert!(matches!(err, RuntimeError::TypeMismatch { .. }));
        assert_eq!(ops.get_member(&order, "Name").unwrap().as_str(), Some("widget"));
    }

    #[test]
    fn lookups_are_memoized() {
        let (ops, order) = ops();
        ops.get_member(&order, "Count").unwrap();
        ops.get_member(&order, "Count").unwrap();
        let _ = ops.get_member(&order, "Nope");
        let _ = ops.get_member(&order, "Nope");
        assert_eq!(ops.cached_lookups(), 2);
    }

    #[test]
    fn bound_methods_and_extensions() {
        let (ops, order) = ops();
        let total = ops.call_member(&mut NoClosures, &order, "Total", vec![Value::from(1.5)]).unwrap();
        assert_eq!(total.as_number(), Some(6.0));

        let doubled = ops.call_member(&mut NoClosures, &order, "Doubled", vec![]).unwrap();
        assert_eq!(doubled.as_number(), Some(6.0));

        let shout = ops
            .call_member(&mut NoClosures, &Value::from("hi"), "Shout", vec![])
            .unwrap();
        assert_eq!(shout.as_str(), Some("HI"));

        let err = ops.call_member(&mut NoClosures, &order, "Total", vec![]).unwrap_err();
        assert!(matches!(err, RuntimeError::Arity { expected: 1, actual: 0, .. }));

        let err = ops.call_member(&mut NoClosures, &order, "Fail", vec![]).unwrap_err();
        assert_eq!(err.to_string(), "Call to 'Order.Fail' failed: order is locked");
    }

    #[test]
    fn arrays_by_index_and_builtins() {
        let (ops, _) = ops();
        let arr = Value::array(vec![Value::from(1.0), Value::from("two")]);
        assert_eq!(ops.get_index(&arr, &Value::from(1.0)).unwrap().as_str(), Some("two"));
        assert!(matches!(
            ops.get_index(&arr, &Value::from(2.0)),
            Err(RuntimeError::IndexOutOfRange { len: 2, .. })
        ));
        ops.call_member(&mut NoClosures, &arr, "add", vec![Value::Null]).unwrap();
        assert_eq!(ops.get_member(&arr, "length").unwrap().as_number(), Some(3.0));
        assert!(ops.set_member(&arr, "length", Value::from(0.0)).is_err());
    }

    /// An empty array whose elements are typed as arrays of its own layout.
    fn nested_array() -> Value {
        let layout = Arc::new(ArrayLayout {
            id: 7,
            element: Repr::Array(7),
        });
        Value::Array(Arc::new(RwLock::new(ArrayObj { layout, items: Vec::new() })))
    }

    #[test]
    fn array_can_store_itself() {
        let (ops, _) = ops();
        let arr = nested_array();
        ops.call_member(&mut NoClosures, &arr, "add", vec![arr.clone()]).unwrap();
        ops.set_index(&arr, &Value::from(0.0), arr.clone()).unwrap();
        assert_eq!(ops.get_member(&arr, "length").unwrap().as_number(), Some(1.0));
        assert!(ops.get_index(&arr, &Value::from(0.0)).unwrap().same(&arr));

        let err = ops.set_index(&arr, &Value::from(0.0), Value::from(1.0)).unwrap_err();
        assert!(matches!(err, RuntimeError::TypeMismatch { .. }));
    }

    #[test]
    fn host_indexer() {
        let (ops, order) = ops();
        let tag = ops.get_index(&order, &Value::from(1.0)).unwrap();
        assert_eq!(tag.as_str(), Some("small"));
        assert!(ops.get_index(&order, &Value::from("x")).is_err());
        assert!(ops.set_index(&order, &Value::from(0.0), Value::from("x")).is_err());
    }

    #[test]
    fn calling_non_callables_fails() {
        let (ops, _) = ops();
        let err = ops.call(&mut NoClosures, &Value::from(1.0), vec![]).unwrap_err();
        assert_eq!(err.to_string(), "Number is not callable");
        assert!(matches!(
            ops.get_member(&Value::Null, "x"),
            Err(RuntimeError::NullReference { .. })
        ));
    }

    #[test]
    fn host_value_coercion() {
        let n = coerce_host_value(&TypeRef::Number(NumKind::U8), Value::from(300.0), "x").unwrap();
        assert_eq!(n.as_number(), Some(255.0));
        let nullable = TypeRef::nullable(TypeRef::Number(NumKind::I32));
        assert!(coerce_host_value(&nullable, Value::Null, "x").unwrap().is_null());
        assert!(coerce_host_value(&TypeRef::Bool, Value::from(1.0), "x").is_err());
        assert!(coerce_host_value(&TypeRef::Any, Value::from(1.0), "x").is_ok());
    }
}
