//! Sample host types shared by the unit tests.

#![allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]

use super::host::{HostObject, HostTypeId, NumKind, TypeBuilder, TypeDescriptor, TypeRef};
use super::types::{MemberNaming, TypeManager};
use super::value::Value;

#[derive(Debug, Clone, Default)]
pub struct Order {
    pub count: i32,
    pub price: f64,
    pub name: String,
    pub tags: Vec<String>,
}

pub fn sample_order() -> Order {
    Order {
        count: 3,
        price: 2.5,
        name: "widget".into(),
        tags: vec!["red".into(), "small".into()],
    }
}

pub fn order_type() -> TypeDescriptor {
    TypeBuilder::<Order>::new("Order")
        .field_mut(
            "Count",
            TypeRef::Number(NumKind::I32),
            |o| Value::from(o.count),
            |o, v| {
                o.count = v.as_number().ok_or("Count expects a number")? as i32;
                Ok(())
            },
        )
        .field("Price", TypeRef::Number(NumKind::F64), |o| Value::from(o.price))
        .property(
            "Name",
            TypeRef::String,
            |o| if o.name.is_empty() { Value::Null } else { Value::from(o.name.as_str()) },
            |o, v| {
                o.name = v.as_str().ok_or("Name expects a string")?.to_string();
                Ok(())
            },
        )
        .field("Tags", TypeRef::list(TypeRef::String), |o| {
            Value::array(o.tags.iter().map(|t| Value::from(t.as_str())).collect())
        })
        .field("Internal", TypeRef::Number(NumKind::I64), |_| Value::from(0.0))
        .hidden()
        .method("Describe", vec![], TypeRef::String, |o, _| {
            Ok(Value::from(format!("{} x {}", o.count, o.name)))
        })
        .method("Total", vec![TypeRef::Number(NumKind::F64)], TypeRef::Number(NumKind::F64), |o, args| {
            let discount = args.first().and_then(Value::as_number).unwrap_or(0.0);
            Ok(Value::from(f64::from(o.count) * o.price - discount))
        })
        .method("Fail", vec![], TypeRef::Void, |_, _| Err("order is locked".to_string()))
        .indexer(TypeRef::Number(NumKind::I32), TypeRef::String, |o, key| {
            let i = key.as_number().ok_or("index must be a number")? as usize;
            o.tags
                .get(i)
                .map(|t| Value::from(t.as_str()))
                .ok_or_else(|| format!("no tag at {i}"))
        })
        .build()
}

pub fn order_ext() -> TypeDescriptor {
    TypeBuilder::<()>::new("OrderExt")
        .function("Doubled", vec![TypeRef::Host(HostTypeId(0))], TypeRef::Number(NumKind::F64), |args| {
            let count = args
                .first()
                .and_then(Value::as_host)
                .and_then(|h| h.with(|o: &Order| o.count))
                .ok_or("expected an order")?;
            Ok(Value::from(f64::from(count * 2)))
        })
        .function("Shout", vec![TypeRef::String], TypeRef::String, |args| {
            Ok(Value::from(args.first().and_then(Value::as_str).unwrap_or("").to_uppercase()))
        })
        .build()
}

/// A type manager with `Order` registered as type 0 and its extensions.
pub fn types() -> (TypeManager, HostTypeId) {
    let mut types = TypeManager::new(MemberNaming::Exact);
    let id = types.register(order_type()).unwrap_or(HostTypeId(0));
    let _ = types.register_extension(order_ext());
    (types, id)
}

pub fn order_object(id: HostTypeId, order: Order) -> HostObject {
    HostObject::new(id, "Order", order)
}
