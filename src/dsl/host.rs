//! Host type descriptors.
//!
//! The embedding application describes every type a script may touch with
//! a [`TypeDescriptor`]: the members it opts in, their script-facing types,
//! and the closures that read, write or invoke them. The type manager
//! validates these tables; nothing is discovered by introspection.

use std::any::{Any, TypeId};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};

use super::value::Value;

/// Erased host data stored behind a [`HostObject`].
pub type AnyData = dyn Any + Send + Sync;

pub type GetFn = Arc<dyn Fn(&AnyData) -> Result<Value, String> + Send + Sync>;
pub type SetFn = Arc<dyn Fn(&mut AnyData, Value) -> Result<(), String> + Send + Sync>;
pub type InvokeFn = Arc<dyn Fn(&mut AnyData, &[Value]) -> Result<Value, String> + Send + Sync>;
pub type StaticFn = Arc<dyn Fn(&[Value]) -> Result<Value, String> + Send + Sync>;
pub type IndexGetFn = Arc<dyn Fn(&AnyData, &Value) -> Result<Value, String> + Send + Sync>;
pub type IndexSetFn = Arc<dyn Fn(&mut AnyData, &Value, Value) -> Result<(), String> + Send + Sync>;

/// Handle to a registered host type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct HostTypeId(pub u32);

/// Host numeric storage kinds. Scripts have a single numeric kind (`f64`);
/// stores into host members narrow to the member's kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NumKind {
    I32,
    I64,
    U8,
    F32,
    F64,
}

impl NumKind {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn narrow(self, value: f64) -> f64 {
        match self {
            Self::I32 => f64::from(value as i32),
            Self::I64 => (value as i64) as f64,
            Self::U8 => f64::from(value as u8),
            Self::F32 => f64::from(value as f32),
            Self::F64 => value,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::U8 => "u8",
            Self::F32 => "f32",
            Self::F64 => "f64",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Container {
    List,
    Iterable,
    Nullable,
    Other(String),
}

/// Script-facing type of a host member, parameter or return value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeRef {
    /// Accepts or produces any script value.
    Any,
    /// The null-type marker.
    Null,
    Void,
    Bool,
    Number(NumKind),
    String,
    Host(HostTypeId),
    /// A script object literal.
    Record,
    /// A script array.
    Array,
    /// A script lambda.
    Function,
    Generic {
        container: Container,
        args: Vec<TypeRef>,
    },
    Pointer(Box<TypeRef>),
}

impl TypeRef {
    pub fn list(of: TypeRef) -> Self {
        Self::Generic {
            container: Container::List,
            args: vec![of],
        }
    }

    pub fn nullable(of: TypeRef) -> Self {
        Self::Generic {
            container: Container::Nullable,
            args: vec![of],
        }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "Any"),
            Self::Null => write!(f, "Null"),
            Self::Void => write!(f, "Void"),
            Self::Bool => write!(f, "Bool"),
            Self::Number(kind) => write!(f, "Number({})", kind.name()),
            Self::String => write!(f, "String"),
            Self::Host(id) => write!(f, "Host#{}", id.0),
            Self::Record => write!(f, "Record"),
            Self::Array => write!(f, "Array"),
            Self::Function => write!(f, "Function"),
            Self::Generic { container, args } => {
                let name = match container {
                    Container::List => "List",
                    Container::Iterable => "Iterable",
                    Container::Nullable => "Nullable",
                    Container::Other(name) => name.as_str(),
                };
                let args: Vec<String> = args.iter().map(ToString::to_string).collect();
                write!(f, "{name}<{}>", args.join(", "))
            }
            Self::Pointer(inner) => write!(f, "*{inner}"),
        }
    }
}

#[derive(Clone)]
pub enum MemberKind {
    Field {
        ty: TypeRef,
        get: GetFn,
        set: Option<SetFn>,
    },
    Property {
        ty: TypeRef,
        get: Option<GetFn>,
        set: Option<SetFn>,
    },
    /// Instance method.
    Method {
        params: Vec<TypeRef>,
        ret: TypeRef,
        invoke: InvokeFn,
    },
    /// Static function. On extension types the first parameter is the receiver.
    Function {
        params: Vec<TypeRef>,
        ret: TypeRef,
        invoke: StaticFn,
    },
    Indexer {
        key: TypeRef,
        ty: TypeRef,
        get: IndexGetFn,
        set: Option<IndexSetFn>,
    },
}

impl fmt::Debug for MemberKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field { ty, set, .. } => f
                .debug_struct("Field")
                .field("ty", ty)
                .field("writable", &set.is_some())
                .finish(),
            Self::Property { ty, get, set } => f
                .debug_struct("Property")
                .field("ty", ty)
                .field("readable", &get.is_some())
                .field("writable", &set.is_some())
                .finish(),
            Self::Method { params, ret, .. } => f
                .debug_struct("Method")
                .field("params", params)
                .field("ret", ret)
                .finish(),
            Self::Function { params, ret, .. } => f
                .debug_struct("Function")
                .field("params", params)
                .field("ret", ret)
                .finish(),
            Self::Indexer { key, ty, set, .. } => f
                .debug_struct("Indexer")
                .field("key", key)
                .field("ty", ty)
                .field("writable", &set.is_some())
                .finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemberDescriptor {
    pub name: String,
    /// Overrides the naming convention when set.
    pub script_name: Option<String>,
    /// Explicit opt-in marker. Members without it are invisible to scripts.
    pub visible: bool,
    pub public: bool,
    pub is_static: bool,
    pub kind: MemberKind,
}

#[derive(Debug, Clone)]
pub struct TypeDescriptor {
    pub name: String,
    pub public: bool,
    pub rust_type: TypeId,
    pub members: Vec<MemberDescriptor>,
}

/// Builds a [`TypeDescriptor`] for host type `T`, wrapping typed closures
/// into erased ones that downcast the receiver.
pub struct TypeBuilder<T> {
    desc: TypeDescriptor,
    _marker: PhantomData<fn() -> T>,
}

fn wrong_receiver<T>() -> String {
    format!("receiver is not a {}", std::any::type_name::<T>())
}

impl<T: Any + Send + Sync> TypeBuilder<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            desc: TypeDescriptor {
                name: name.into(),
                public: true,
                rust_type: TypeId::of::<T>(),
                members: Vec::new(),
            },
            _marker: PhantomData,
        }
    }

    fn push(mut self, name: impl Into<String>, is_static: bool, kind: MemberKind) -> Self {
        self.desc.members.push(MemberDescriptor {
            name: name.into(),
            script_name: None,
            visible: true,
            public: true,
            is_static,
            kind,
        });
        self
    }

    fn getter(get: impl Fn(&T) -> Value + Send + Sync + 'static) -> GetFn {
        Arc::new(move |any: &AnyData| {
            any.downcast_ref::<T>()
                .map(&get)
                .ok_or_else(wrong_receiver::<T>)
        })
    }

    fn setter(set: impl Fn(&mut T, Value) -> Result<(), String> + Send + Sync + 'static) -> SetFn {
        Arc::new(move |any: &mut AnyData, value| {
            let target = any.downcast_mut::<T>().ok_or_else(wrong_receiver::<T>)?;
            set(target, value)
        })
    }

    /// Read-only field.
    pub fn field(
        self,
        name: impl Into<String>,
        ty: TypeRef,
        get: impl Fn(&T) -> Value + Send + Sync + 'static,
    ) -> Self {
        let get = Self::getter(get);
        self.push(name, false, MemberKind::Field { ty, get, set: None })
    }

    pub fn field_mut(
        self,
        name: impl Into<String>,
        ty: TypeRef,
        get: impl Fn(&T) -> Value + Send + Sync + 'static,
        set: impl Fn(&mut T, Value) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        let get = Self::getter(get);
        let set = Some(Self::setter(set));
        self.push(name, false, MemberKind::Field { ty, get, set })
    }

    pub fn property(
        self,
        name: impl Into<String>,
        ty: TypeRef,
        get: impl Fn(&T) -> Value + Send + Sync + 'static,
        set: impl Fn(&mut T, Value) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        let get = Some(Self::getter(get));
        let set = Some(Self::setter(set));
        self.push(name, false, MemberKind::Property { ty, get, set })
    }

    pub fn write_only(
        self,
        name: impl Into<String>,
        ty: TypeRef,
        set: impl Fn(&mut T, Value) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        let set = Some(Self::setter(set));
        self.push(name, false, MemberKind::Property { ty, get: None, set })
    }

    pub fn method(
        self,
        name: impl Into<String>,
        params: Vec<TypeRef>,
        ret: TypeRef,
        f: impl Fn(&mut T, &[Value]) -> Result<Value, String> + Send + Sync + 'static,
    ) -> Self {
        let invoke: InvokeFn = Arc::new(move |any: &mut AnyData, args: &[Value]| {
            let target = any.downcast_mut::<T>().ok_or_else(wrong_receiver::<T>)?;
            f(target, args)
        });
        self.push(name, false, MemberKind::Method { params, ret, invoke })
    }

    /// Static function. Only valid on extension types, where the first
    /// parameter is the receiver.
    pub fn function(
        self,
        name: impl Into<String>,
        params: Vec<TypeRef>,
        ret: TypeRef,
        f: impl Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
    ) -> Self {
        let invoke: StaticFn = Arc::new(f);
        self.push(name, true, MemberKind::Function { params, ret, invoke })
    }

    pub fn indexer(
        self,
        key: TypeRef,
        ty: TypeRef,
        get: impl Fn(&T, &Value) -> Result<Value, String> + Send + Sync + 'static,
    ) -> Self {
        let get = Self::index_getter(get);
        self.push("[]", false, MemberKind::Indexer { key, ty, get, set: None })
    }

    pub fn indexer_mut(
        self,
        key: TypeRef,
        ty: TypeRef,
        get: impl Fn(&T, &Value) -> Result<Value, String> + Send + Sync + 'static,
        set: impl Fn(&mut T, &Value, Value) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        let get = Self::index_getter(get);
        let set: IndexSetFn = Arc::new(move |any: &mut AnyData, key: &Value, value| {
            let target = any.downcast_mut::<T>().ok_or_else(wrong_receiver::<T>)?;
            set(target, key, value)
        });
        self.push("[]", false, MemberKind::Indexer { key, ty, get, set: Some(set) })
    }

    fn index_getter(
        get: impl Fn(&T, &Value) -> Result<Value, String> + Send + Sync + 'static,
    ) -> IndexGetFn {
        Arc::new(move |any: &AnyData, key: &Value| {
            let target = any.downcast_ref::<T>().ok_or_else(wrong_receiver::<T>)?;
            get(target, key)
        })
    }

    /// Append a hand-built member.
    pub fn member(mut self, member: MemberDescriptor) -> Self {
        self.desc.members.push(member);
        self
    }

    fn last(&mut self) -> Option<&mut MemberDescriptor> {
        self.desc.members.last_mut()
    }

    /// Script name for the last added member.
    pub fn rename(mut self, script_name: impl Into<String>) -> Self {
        if let Some(m) = self.last() {
            m.script_name = Some(script_name.into());
        }
        self
    }

    /// Drop the opt-in marker from the last added member.
    pub fn hidden(mut self) -> Self {
        if let Some(m) = self.last() {
            m.visible = false;
        }
        self
    }

    /// Mark the last added member as non-public.
    pub fn private(mut self) -> Self {
        if let Some(m) = self.last() {
            m.public = false;
        }
        self
    }

    /// Mark the type itself as non-public.
    pub fn private_type(mut self) -> Self {
        self.desc.public = false;
        self
    }

    pub fn build(self) -> TypeDescriptor {
        self.desc
    }
}

/// Shared handle to a live host value.
#[derive(Clone)]
pub struct HostObject {
    type_id: HostTypeId,
    type_name: Arc<str>,
    data: Arc<RwLock<Box<AnyData>>>,
}

impl HostObject {
    pub fn new<T: Any + Send + Sync>(type_id: HostTypeId, type_name: &str, value: T) -> Self {
        Self {
            type_id,
            type_name: Arc::from(type_name),
            data: Arc::new(RwLock::new(Box::new(value))),
        }
    }

    pub fn type_id(&self) -> HostTypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Run `f` against the host value if it is a `T`.
    pub fn with<T: Any, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let guard = self.data.read();
        guard.downcast_ref::<T>().map(f)
    }

    pub fn with_mut<T: Any, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut guard = self.data.write();
        guard.downcast_mut::<T>().map(f)
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Box<AnyData>> {
        self.data.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Box<AnyData>> {
        self.data.write()
    }

    pub fn ptr_eq(&self, other: &HostObject) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl fmt::Debug for HostObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostObject({})", self.type_name)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    struct Counter {
        count: i32,
    }

    #[test]
    fn builder_wraps_typed_closures() {
        let desc = TypeBuilder::<Counter>::new("Counter")
            .field_mut(
                "Count",
                TypeRef::Number(NumKind::I32),
                |c| Value::from(c.count),
                |c, v| {
                    c.count = v.as_number().ok_or("expected a number")? as i32;
                    Ok(())
                },
            )
            .rename("count")
            .build();

        assert_eq!(desc.members.len(), 1);
        assert_eq!(desc.members[0].script_name.as_deref(), Some("count"));

        let obj = HostObject::new(HostTypeId(0), "Counter", Counter { count: 3 });
        let MemberKind::Field { get, set: Some(set), .. } = &desc.members[0].kind else {
            panic!("expected writable field");
        };
        set(&mut **obj.write(), Value::Number(7.0)).unwrap();
        let v = get(&**obj.read()).unwrap();
        assert_eq!(v.as_number(), Some(7.0));
        assert_eq!(obj.with(|c: &Counter| c.count), Some(7));
    }

    #[test]
    fn wrong_receiver_is_reported() {
        let desc = TypeBuilder::<Counter>::new("Counter")
            .field("Count", TypeRef::Number(NumKind::I32), |c| Value::from(c.count))
            .build();
        let MemberKind::Field { get, .. } = &desc.members[0].kind else {
            panic!("expected field");
        };
        let other = HostObject::new(HostTypeId(1), "Other", 5_u8);
        assert!(get(&**other.read()).is_err());
    }

    #[test]
    fn narrowing_truncates_to_host_kind() {
        assert_eq!(NumKind::I32.narrow(3.9), 3.0);
        assert_eq!(NumKind::U8.narrow(300.0), 255.0);
        assert_eq!(NumKind::F64.narrow(0.1), 0.1);
    }
}
