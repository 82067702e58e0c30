//! Validation and lookup of host types.
//!
//! The manager owns every registered [`TypeDescriptor`], validates them on
//! first use (memoized), and answers which members a type exposes under
//! the names scripts see.

#![allow(clippy::cast_possible_truncation)]

use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::error::RuntimeError;
use super::host::{Container, HostObject, HostTypeId, MemberKind, TypeDescriptor, TypeRef};
use super::value::Value;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "code", content = "detail", rename_all = "snake_case")]
pub enum TypeError {
    #[error("Type '{ty}' is not supported: {reason}")]
    UnsupportedType { ty: String, reason: String },
    #[error("Unknown host type '{0}'")]
    UnknownType(String),
    #[error("Host type '{0}' is not registered")]
    NotRegistered(String),
}

fn unsupported(ty: &str, reason: impl Into<String>) -> TypeError {
    TypeError::UnsupportedType {
        ty: ty.to_string(),
        reason: reason.into(),
    }
}

/// How host member names map to script names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberNaming {
    #[default]
    Exact,
    /// `TotalPrice` is exposed as `totalPrice`.
    CamelCase,
}

impl MemberNaming {
    pub fn apply(self, name: &str) -> String {
        match self {
            Self::Exact => name.to_string(),
            Self::CamelCase => {
                let mut chars = name.chars();
                match chars.next() {
                    Some(first) => first.to_lowercase().chain(chars).collect(),
                    None => String::new(),
                }
            }
        }
    }
}

/// Receiver category an extension function attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Receiver {
    Host(HostTypeId),
    String,
    Number,
    Bool,
    Record,
    Array,
}

impl Receiver {
    pub fn of_type(ty: &TypeRef) -> Option<Self> {
        match ty {
            TypeRef::Host(id) => Some(Self::Host(*id)),
            TypeRef::String => Some(Self::String),
            TypeRef::Number(_) => Some(Self::Number),
            TypeRef::Bool => Some(Self::Bool),
            TypeRef::Record => Some(Self::Record),
            TypeRef::Array
            | TypeRef::Generic {
                container: Container::List | Container::Iterable,
                ..
            } => Some(Self::Array),
            _ => None,
        }
    }

    pub fn of_value(value: &Value) -> Option<Self> {
        match value {
            Value::Host(h) => Some(Self::Host(h.type_id())),
            Value::Str(_) => Some(Self::String),
            Value::Number(_) => Some(Self::Number),
            Value::Bool(_) => Some(Self::Bool),
            Value::Record(_) => Some(Self::Record),
            Value::Array(_) => Some(Self::Array),
            _ => None,
        }
    }
}

/// A validated, script-visible member.
#[derive(Debug)]
pub struct MemberInfo {
    /// Name scripts use.
    pub name: String,
    pub host_name: String,
    /// Name of the declaring type.
    pub owner: String,
    pub kind: MemberKind,
}

impl MemberInfo {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.owner, self.host_name)
    }

    /// Type of a field or property.
    pub fn value_type(&self) -> Option<&TypeRef> {
        match &self.kind {
            MemberKind::Field { ty, .. } | MemberKind::Property { ty, .. } => Some(ty),
            _ => None,
        }
    }

    pub fn is_readable(&self) -> bool {
        match &self.kind {
            MemberKind::Field { .. } | MemberKind::Indexer { .. } => true,
            MemberKind::Property { get, .. } => get.is_some(),
            MemberKind::Method { .. } | MemberKind::Function { .. } => false,
        }
    }

    pub fn is_writable(&self) -> bool {
        match &self.kind {
            MemberKind::Field { set, .. } | MemberKind::Property { set, .. } => set.is_some(),
            MemberKind::Indexer { set, .. } => set.is_some(),
            MemberKind::Method { .. } | MemberKind::Function { .. } => false,
        }
    }

    pub fn is_callable(&self) -> bool {
        matches!(self.kind, MemberKind::Method { .. } | MemberKind::Function { .. })
    }

    pub fn is_extension(&self) -> bool {
        matches!(self.kind, MemberKind::Function { .. })
    }

    /// Parameters as seen from the call site (an extension's receiver is
    /// not part of the argument list).
    pub fn call_params(&self) -> &[TypeRef] {
        match &self.kind {
            MemberKind::Method { params, .. } => params,
            MemberKind::Function { params, .. } => params.get(1..).unwrap_or(&[]),
            _ => &[],
        }
    }

    pub fn ret(&self) -> Option<&TypeRef> {
        match &self.kind {
            MemberKind::Method { ret, .. } | MemberKind::Function { ret, .. } => Some(ret),
            _ => None,
        }
    }

    fn failure(&self, message: String) -> RuntimeError {
        RuntimeError::HostFailure {
            member: self.qualified_name(),
            message,
        }
    }

    pub fn read(&self, receiver: &HostObject) -> Result<Value, RuntimeError> {
        let get = match &self.kind {
            MemberKind::Field { get, .. } => get,
            MemberKind::Property { get: Some(get), .. } => get,
            _ => {
                return Err(RuntimeError::MemberNotFound {
                    receiver: receiver.type_name().to_string(),
                    member: self.name.clone(),
                })
            }
        };
        let guard = receiver.read();
        get(&**guard).map_err(|e| self.failure(e))
    }

    pub fn write(&self, receiver: &HostObject, value: Value) -> Result<(), RuntimeError> {
        let set = match &self.kind {
            MemberKind::Field { set: Some(set), .. } | MemberKind::Property { set: Some(set), .. } => set,
            _ => {
                return Err(RuntimeError::ReadOnly {
                    member: self.qualified_name(),
                })
            }
        };
        let mut guard = receiver.write();
        set(&mut **guard, value).map_err(|e| self.failure(e))
    }

    /// Invoke a method on `receiver`, or a static function with `args`.
    pub fn call(&self, receiver: Option<&HostObject>, args: &[Value]) -> Result<Value, RuntimeError> {
        match &self.kind {
            MemberKind::Method { invoke, .. } => {
                let receiver = receiver.ok_or_else(|| RuntimeError::NullReference {
                    target: self.qualified_name(),
                })?;
                let mut guard = receiver.write();
                invoke(&mut **guard, args).map_err(|e| self.failure(e))
            }
            MemberKind::Function { invoke, .. } => invoke(args).map_err(|e| self.failure(e)),
            _ => Err(RuntimeError::NotCallable {
                callee: self.qualified_name(),
            }),
        }
    }

    pub fn index_get(&self, receiver: &HostObject, key: &Value) -> Result<Value, RuntimeError> {
        match &self.kind {
            MemberKind::Indexer { get, .. } => {
                let guard = receiver.read();
                get(&**guard, key).map_err(|e| self.failure(e))
            }
            _ => Err(RuntimeError::InvalidIndex {
                receiver: receiver.type_name().to_string(),
                key: key.type_name(),
            }),
        }
    }

    pub fn index_set(&self, receiver: &HostObject, key: &Value, value: Value) -> Result<(), RuntimeError> {
        match &self.kind {
            MemberKind::Indexer { set: Some(set), .. } => {
                let mut guard = receiver.write();
                set(&mut **guard, key, value).map_err(|e| self.failure(e))
            }
            _ => Err(RuntimeError::ReadOnly {
                member: format!("{}[]", self.owner),
            }),
        }
    }
}

/// Validated view of a host type.
#[derive(Debug, Clone)]
pub struct TypeInfo {
    pub id: HostTypeId,
    pub name: String,
    pub members: IndexMap<String, Arc<MemberInfo>>,
    pub indexer: Option<Arc<MemberInfo>>,
}

impl TypeInfo {
    pub fn get_member(&self, name: &str) -> Option<&Arc<MemberInfo>> {
        self.members.get(name)
    }
}

#[derive(Debug)]
pub struct TypeManager {
    naming: MemberNaming,
    names: Vec<String>,
    descriptors: Vec<Option<TypeDescriptor>>,
    by_rust_type: HashMap<TypeId, HostTypeId>,
    validated: HashMap<HostTypeId, Result<TypeInfo, TypeError>>,
    in_progress: HashSet<HostTypeId>,
    extensions: HashMap<Receiver, IndexMap<String, Arc<MemberInfo>>>,
}

impl Default for TypeManager {
    fn default() -> Self {
        Self::new(MemberNaming::Exact)
    }
}

impl TypeManager {
    pub fn new(naming: MemberNaming) -> Self {
        Self {
            naming,
            names: Vec::new(),
            descriptors: Vec::new(),
            by_rust_type: HashMap::new(),
            validated: HashMap::new(),
            in_progress: HashSet::new(),
            extensions: HashMap::new(),
        }
    }

    /// Reserve an id for a type so self-referencing descriptors can name it.
    pub fn declare(&mut self, name: impl Into<String>) -> HostTypeId {
        let id = HostTypeId(self.names.len() as u32);
        self.names.push(name.into());
        self.descriptors.push(None);
        id
    }

    pub fn define(&mut self, id: HostTypeId, desc: TypeDescriptor) -> Result<(), TypeError> {
        let slot = self
            .descriptors
            .get_mut(id.0 as usize)
            .ok_or_else(|| TypeError::UnknownType(desc.name.clone()))?;
        self.by_rust_type.insert(desc.rust_type, id);
        if let Some(name) = self.names.get_mut(id.0 as usize) {
            name.clone_from(&desc.name);
        }
        *slot = Some(desc);
        self.validated.remove(&id);
        Ok(())
    }

    /// Declare, define and validate in one step.
    pub fn register(&mut self, desc: TypeDescriptor) -> Result<HostTypeId, TypeError> {
        let id = self.declare(desc.name.clone());
        self.define(id, desc)?;
        self.validate_type(id, false)?;
        Ok(id)
    }

    /// Register a provider of extension functions. Each function becomes
    /// callable as a member of its first parameter's type.
    pub fn register_extension(&mut self, desc: TypeDescriptor) -> Result<(), TypeError> {
        let id = self.declare(desc.name.clone());
        self.define(id, desc)?;
        self.validate_type(id, true)?;
        let functions: Vec<Arc<MemberInfo>> = self
            .validated
            .get(&id)
            .and_then(|r| r.as_ref().ok())
            .map(|info| info.members.values().cloned().collect())
            .unwrap_or_default();

        for function in functions {
            let MemberKind::Function { params, .. } = &function.kind else {
                continue;
            };
            let Some(receiver) = params.first().and_then(Receiver::of_type) else {
                return Err(unsupported(
                    &function.owner,
                    format!("extension '{}' has an unsupported receiver type", function.host_name),
                ));
            };
            self.extensions
                .entry(receiver)
                .or_default()
                .insert(function.name.clone(), Arc::clone(&function));
            // Overlay onto an already validated receiver type.
            if let Receiver::Host(target) = receiver {
                if let Some(Ok(info)) = self.validated.get_mut(&target) {
                    info.members
                        .entry(function.name.clone())
                        .or_insert_with(|| Arc::clone(&function));
                }
            }
        }
        tracing::debug!(count = self.extensions.values().map(IndexMap::len).sum::<usize>(), "extensions registered");
        Ok(())
    }

    pub fn type_name(&self, id: HostTypeId) -> &str {
        self.names.get(id.0 as usize).map_or("<unknown>", String::as_str)
    }

    pub fn id_of<T: 'static>(&self) -> Option<HostTypeId> {
        self.by_rust_type.get(&TypeId::of::<T>()).copied()
    }

    /// Validate a host type and everything its members reach. Idempotent.
    pub fn validate_type(&mut self, id: HostTypeId, as_extension: bool) -> Result<(), TypeError> {
        if let Some(result) = self.validated.get(&id) {
            return result.as_ref().map(|_| ()).map_err(Clone::clone);
        }
        if self.in_progress.contains(&id) {
            return Ok(());
        }
        self.in_progress.insert(id);
        let result = self.build_info(id, as_extension);
        self.in_progress.remove(&id);
        let outcome = result.as_ref().map(|_| ()).map_err(Clone::clone);
        if let Err(e) = &outcome {
            tracing::debug!(ty = self.type_name(id), error = %e, "host type rejected");
        }
        self.validated.insert(id, result);
        outcome
    }

    fn build_info(&mut self, id: HostTypeId, as_extension: bool) -> Result<TypeInfo, TypeError> {
        let name = self.type_name(id).to_string();
        let desc = self
            .descriptors
            .get(id.0 as usize)
            .and_then(Option::as_ref)
            .cloned()
            .ok_or_else(|| TypeError::NotRegistered(name.clone()))?;
        if !desc.public {
            return Err(unsupported(&name, "type is not public"));
        }

        let mut members: IndexMap<String, Arc<MemberInfo>> = IndexMap::new();
        let mut indexer = None;
        for member in desc.members.into_iter().filter(|m| m.visible) {
            if !member.public {
                return Err(unsupported(
                    &name,
                    format!("member '{}' is script-visible but not public", member.name),
                ));
            }
            if as_extension {
                let has_receiver = matches!(&member.kind, MemberKind::Function { params, .. } if !params.is_empty());
                if !member.is_static || !has_receiver {
                    return Err(unsupported(
                        &name,
                        format!(
                            "extension member '{}' must be a static function taking a receiver",
                            member.name
                        ),
                    ));
                }
            } else if member.is_static {
                return Err(unsupported(
                    &name,
                    format!("static member '{}' is only allowed on extension types", member.name),
                ));
            }
            self.check_member_types(&name, &member.kind)?;

            let script_name = member
                .script_name
                .clone()
                .unwrap_or_else(|| self.naming.apply(&member.name));
            let is_indexer = matches!(member.kind, MemberKind::Indexer { .. });
            let info = Arc::new(MemberInfo {
                name: script_name.clone(),
                host_name: member.name,
                owner: name.clone(),
                kind: member.kind,
            });
            if is_indexer {
                if indexer.is_some() {
                    return Err(unsupported(&name, "more than one indexer"));
                }
                indexer = Some(info);
            } else if members.insert(script_name.clone(), info).is_some() {
                return Err(unsupported(
                    &name,
                    format!("more than one member is exposed as '{script_name}'"),
                ));
            }
        }

        if let Some(ext) = self.extensions.get(&Receiver::Host(id)) {
            for (ext_name, function) in ext {
                members
                    .entry(ext_name.clone())
                    .or_insert_with(|| Arc::clone(function));
            }
        }

        tracing::trace!(ty = %name, members = members.len(), "host type validated");
        Ok(TypeInfo {
            id,
            name,
            members,
            indexer,
        })
    }

    fn check_member_types(&mut self, owner: &str, kind: &MemberKind) -> Result<(), TypeError> {
        match kind {
            MemberKind::Field { ty, .. } | MemberKind::Property { ty, .. } => self.check_type_ref(owner, ty),
            MemberKind::Method { params, ret, .. } | MemberKind::Function { params, ret, .. } => {
                for p in params {
                    self.check_type_ref(owner, p)?;
                }
                self.check_type_ref(owner, ret)
            }
            MemberKind::Indexer { key, ty, .. } => {
                self.check_type_ref(owner, key)?;
                self.check_type_ref(owner, ty)
            }
        }
    }

    fn check_type_ref(&mut self, owner: &str, ty: &TypeRef) -> Result<(), TypeError> {
        match ty {
            TypeRef::Pointer(_) => Err(unsupported(owner, format!("pointer type {ty} is not supported"))),
            TypeRef::Generic { container, args } => match (container, args.as_slice()) {
                (Container::List | Container::Iterable, [inner]) => self.check_type_ref(owner, inner),
                (Container::Nullable, [TypeRef::Bool | TypeRef::Number(_)]) => Ok(()),
                _ => Err(unsupported(owner, format!("generic type {ty} is not supported"))),
            },
            TypeRef::Host(id) => {
                if self.descriptors.get(id.0 as usize).is_none() {
                    return Err(TypeError::UnknownType(format!("Host#{}", id.0)));
                }
                self.validate_type(*id, false)
            }
            _ => Ok(()),
        }
    }

    /// Validated info for a host type; `None` for the any-type, the null
    /// marker and script-native types.
    pub fn get_type_info(&mut self, ty: &TypeRef) -> Result<Option<&TypeInfo>, TypeError> {
        match ty {
            TypeRef::Host(id) => {
                self.validate_type(*id, false)?;
                Ok(self.type_info(*id))
            }
            _ => Ok(None),
        }
    }

    /// Already validated info, for read-only phases.
    pub fn type_info(&self, id: HostTypeId) -> Option<&TypeInfo> {
        self.validated.get(&id).and_then(|r| r.as_ref().ok())
    }

    pub fn extension(&self, receiver: Receiver, name: &str) -> Option<&Arc<MemberInfo>> {
        self.extensions.get(&receiver).and_then(|m| m.get(name))
    }

    /// Immutable copy of everything validated so far, for the dynamic runtime.
    pub fn snapshot(&self) -> TypeSnapshot {
        TypeSnapshot {
            types: self
                .validated
                .iter()
                .filter_map(|(id, r)| r.as_ref().ok().map(|info| (*id, Arc::new(info.clone()))))
                .collect(),
            extensions: self.extensions.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct TypeSnapshot {
    types: HashMap<HostTypeId, Arc<TypeInfo>>,
    extensions: HashMap<Receiver, IndexMap<String, Arc<MemberInfo>>>,
}

impl TypeSnapshot {
    pub fn type_info(&self, id: HostTypeId) -> Option<&Arc<TypeInfo>> {
        self.types.get(&id)
    }

    /// Member or extension function `name` on `receiver`.
    pub fn member(&self, receiver: Receiver, name: &str) -> Option<Arc<MemberInfo>> {
        if let Receiver::Host(id) = receiver {
            if let Some(m) = self.types.get(&id).and_then(|t| t.get_member(name)) {
                return Some(Arc::clone(m));
            }
        }
        self.extensions
            .get(&receiver)
            .and_then(|m| m.get(name))
            .cloned()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::dsl::host::{NumKind, TypeBuilder};

    struct Order {
        count: i32,
    }

    fn order_type() -> TypeDescriptor {
        TypeBuilder::<Order>::new("Order")
            .field_mut(
                "Count",
                TypeRef::Number(NumKind::I32),
                |o| Value::from(o.count),
                |o, v| {
                    o.count = v.as_number().unwrap_or_default() as i32;
                    Ok(())
                },
            )
            .field("Secret", TypeRef::String, |_| Value::from("x"))
            .hidden()
            .method("Describe", vec![], TypeRef::String, |o, _| Ok(Value::from(format!("{} items", o.count))))
            .build()
    }

    #[test]
    fn validates_and_maps_members() {
        let mut types = TypeManager::new(MemberNaming::Exact);
        let id = types.register(order_type()).unwrap();
        let info = types.get_type_info(&TypeRef::Host(id)).unwrap().unwrap();
        assert!(info.get_member("Count").is_some());
        assert!(info.get_member("Secret").is_none());
        assert!(info.get_member("Describe").unwrap().is_callable());
    }

    #[test]
    fn camel_case_naming_with_override() {
        let mut types = TypeManager::new(MemberNaming::CamelCase);
        let desc = TypeBuilder::<Order>::new("Order")
            .field("TotalPrice", TypeRef::Number(NumKind::F64), |_| Value::from(1.0))
            .field("Count", TypeRef::Number(NumKind::I32), |o| Value::from(o.count))
            .rename("n")
            .build();
        let id = types.register(desc).unwrap();
        let info = types.type_info(id).unwrap();
        assert!(info.get_member("totalPrice").is_some());
        assert!(info.get_member("n").is_some());
        assert!(info.get_member("count").is_none());
    }

    #[test]
    fn any_and_null_have_no_type_info() {
        let mut types = TypeManager::default();
        assert!(types.get_type_info(&TypeRef::Any).unwrap().is_none());
        assert!(types.get_type_info(&TypeRef::Null).unwrap().is_none());
    }

    #[test]
    fn rejects_unsupported_shapes() {
        let mut types = TypeManager::default();
        let pointer = TypeBuilder::<Order>::new("P")
            .field("Raw", TypeRef::Pointer(Box::new(TypeRef::Bool)), |_| Value::Null)
            .build();
        assert!(matches!(types.register(pointer), Err(TypeError::UnsupportedType { .. })));

        let generic = TypeBuilder::<Order>::new("G")
            .field(
                "Map",
                TypeRef::Generic {
                    container: Container::Other("Map".into()),
                    args: vec![TypeRef::String, TypeRef::Bool],
                },
                |_| Value::Null,
            )
            .build();
        assert!(types.register(generic).is_err());

        let nullable_string = TypeBuilder::<Order>::new("N")
            .field("Name", TypeRef::nullable(TypeRef::String), |_| Value::Null)
            .build();
        assert!(types.register(nullable_string).is_err());

        let list = TypeBuilder::<Order>::new("L")
            .field("Tags", TypeRef::list(TypeRef::String), |_| Value::array(vec![]))
            .build();
        assert!(types.register(list).is_ok());

        let private = TypeBuilder::<Order>::new("Hidden").private_type().build();
        assert!(types.register(private).is_err());

        let private_member = TypeBuilder::<Order>::new("M")
            .field("X", TypeRef::Bool, |_| Value::Null)
            .private()
            .build();
        assert!(types.register(private_member).is_err());

        let static_member = TypeBuilder::<Order>::new("S")
            .function("Make", vec![TypeRef::Bool], TypeRef::Bool, |_| Ok(Value::Null))
            .build();
        assert!(types.register(static_member).is_err());
    }

    #[test]
    fn validation_is_memoized() {
        let mut types = TypeManager::default();
        let id = types.register(order_type()).unwrap();
        types.validate_type(id, false).unwrap();
        types.validate_type(id, false).unwrap();
        assert_eq!(types.type_info(id).unwrap().members.len(), 2);
    }

    #[test]
    fn extensions_overlay_retroactively() {
        let mut types = TypeManager::default();
        let id = types.register(order_type()).unwrap();
        let ext = TypeBuilder::<()>::new("OrderExt")
            .function("Double", vec![TypeRef::Host(id)], TypeRef::Number(NumKind::F64), |args| {
                let count = args[0].as_host().and_then(|h| h.with(|o: &Order| o.count)).unwrap_or(0);
                Ok(Value::from(f64::from(count * 2)))
            })
            .function("Shout", vec![TypeRef::String], TypeRef::String, |args| {
                Ok(Value::from(args[0].as_str().unwrap_or("").to_uppercase()))
            })
            .build();
        types.register_extension(ext).unwrap();

        let info = types.type_info(id).unwrap();
        assert!(info.get_member("Double").unwrap().is_extension());
        assert!(types.extension(Receiver::String, "Shout").is_some());
        let snapshot = types.snapshot();
        assert!(snapshot.member(Receiver::Host(id), "Double").is_some());
    }

    #[test]
    fn extension_members_must_be_static_with_receiver() {
        let mut types = TypeManager::default();
        let bad = TypeBuilder::<()>::new("BadExt")
            .function("Nothing", vec![], TypeRef::Void, |_| Ok(Value::Null))
            .build();
        assert!(types.register_extension(bad).is_err());

        let instance = TypeBuilder::<()>::new("InstanceExt")
            .method("M", vec![TypeRef::String], TypeRef::Void, |_, _| Ok(Value::Null))
            .build();
        assert!(types.register_extension(instance).is_err());
    }
}
