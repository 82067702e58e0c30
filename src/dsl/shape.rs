//! Shapes: the structural types inferred for script expressions.
//!
//! Shapes live in an arena and are addressed by [`ShapeId`]. Record and
//! array shapes are mutable and shared: two expressions that may alias the
//! same literal hold the same id, and merging two such shapes points one
//! slot at the other (`Forward`) so every holder observes the union.

#![allow(clippy::cast_possible_truncation)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use indexmap::IndexMap;
use thiserror::Error;

use super::ast::NodeId;
use super::host::HostTypeId;
use super::scope::ScopeId;
use super::types::MemberInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShapeId(pub u32);

/// One collection of node shapes. The root analysis and every lambda
/// call signature get their own layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Concrete {
    Number,
    Bool,
    String,
    Host(HostTypeId),
}

/// One resolution of a lambda for a tuple of argument shapes.
#[derive(Debug, Clone)]
pub struct CallSignature {
    pub args: Vec<ShapeId>,
    pub ret: ShapeId,
    /// Layer holding the shapes of the body analyzed for this signature.
    pub layer: LayerId,
}

#[derive(Debug, Clone)]
pub struct LambdaShape {
    /// The lambda expression node.
    pub node: NodeId,
    pub param_count: usize,
    /// Scope the lambda literal appeared in.
    pub def_scope: ScopeId,
    /// Body scope, created on first analysis and reopened afterwards.
    pub body_scope: Option<ScopeId>,
    /// Layer stack of the analysis that created the literal.
    pub env: Vec<LayerId>,
    /// Enclosing lambdas, outermost first.
    pub fn_chain: Vec<NodeId>,
    pub signatures: Vec<CallSignature>,
    /// Analysis with every parameter unknown, used when the closure is
    /// called through the dynamic path.
    pub generic: Option<CallSignature>,
}

#[derive(Debug, Clone)]
pub enum MethodShape {
    Host { member: Arc<MemberInfo> },
    Lambda(LambdaShape),
}

#[derive(Debug, Clone)]
pub enum Shape {
    /// No static guarantee.
    Unknown,
    /// No evidence yet; merges into whatever it meets first.
    Undetermined,
    Concrete(Concrete),
    Record {
        fields: IndexMap<String, ShapeId>,
        /// Literal nodes whose values carry this shape.
        origins: Vec<NodeId>,
    },
    Array {
        element: ShapeId,
        origins: Vec<NodeId>,
    },
    Method(MethodShape),
    /// Result of one call, resolved against a signature of `method`.
    MethodReturn { method: ShapeId, signature: usize },
    /// Merged into another shape.
    Forward(ShapeId),
}

/// Storage locations that were widened after being read. The next
/// analysis pass treats them as unknown from the start.
#[derive(Debug, Clone, Default)]
pub struct Widening {
    pub forced_decls: HashSet<NodeId>,
    pub forced_fields: HashSet<(NodeId, String)>,
    pub forced_elements: HashSet<NodeId>,
}

impl Widening {
    pub fn is_empty(&self) -> bool {
        self.forced_decls.is_empty() && self.forced_fields.is_empty() && self.forced_elements.is_empty()
    }
}

/// Outcome of a field or element write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Write {
    Unchanged,
    Added,
    Widened,
    /// The location predates the current sandbox and may not change.
    Frozen,
}

#[derive(Debug)]
pub struct ShapeArena {
    shapes: Vec<Shape>,
    hosts: HashMap<HostTypeId, ShapeId>,
    frozen_below: u32,
    widening: Widening,
    field_reads: HashSet<(NodeId, String)>,
    element_reads: HashSet<NodeId>,
    unstable: bool,
}

impl Default for ShapeArena {
    fn default() -> Self {
        Self::new(Widening::default())
    }
}

impl ShapeArena {
    pub const UNKNOWN: ShapeId = ShapeId(0);
    pub const UNDETERMINED: ShapeId = ShapeId(1);
    pub const NUMBER: ShapeId = ShapeId(2);
    pub const BOOL: ShapeId = ShapeId(3);
    pub const STRING: ShapeId = ShapeId(4);

    pub fn new(widening: Widening) -> Self {
        Self {
            shapes: vec![
                Shape::Unknown,
                Shape::Undetermined,
                Shape::Concrete(Concrete::Number),
                Shape::Concrete(Concrete::Bool),
                Shape::Concrete(Concrete::String),
            ],
            hosts: HashMap::new(),
            frozen_below: 0,
            widening,
            field_reads: HashSet::new(),
            element_reads: HashSet::new(),
            unstable: false,
        }
    }

    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }

    fn push(&mut self, shape: Shape) -> ShapeId {
        let id = ShapeId(self.shapes.len() as u32);
        self.shapes.push(shape);
        id
    }

    pub fn host(&mut self, id: HostTypeId) -> ShapeId {
        if let Some(&shape) = self.hosts.get(&id) {
            return shape;
        }
        let shape = self.push(Shape::Concrete(Concrete::Host(id)));
        self.hosts.insert(id, shape);
        shape
    }

    pub fn get(&self, id: ShapeId) -> &Shape {
        self.shapes.get(id.0 as usize).unwrap_or(&Shape::Unknown)
    }

    fn get_mut(&mut self, id: ShapeId) -> Option<&mut Shape> {
        self.shapes.get_mut(id.0 as usize)
    }

    /// Follow forwards and call results to the shape that holds the data.
    pub fn resolve(&self, mut id: ShapeId) -> ShapeId {
        // Forward chains are acyclic, but a malformed arena must not hang.
        for _ in 0..=self.shapes.len() {
            match self.get(id) {
                Shape::Forward(next) => id = *next,
                Shape::MethodReturn { method, signature } => {
                    match self.signature(*method, *signature) {
                        Some(sig) => id = sig.ret,
                        None => return Self::UNKNOWN,
                    }
                }
                _ => return id,
            }
        }
        Self::UNKNOWN
    }

    pub fn resolved(&self, id: ShapeId) -> &Shape {
        self.get(self.resolve(id))
    }

    pub fn concrete(&self, id: ShapeId) -> Option<Concrete> {
        match self.resolved(id) {
            Shape::Concrete(c) => Some(*c),
            _ => None,
        }
    }

    /// True for unknown and undetermined shapes: values the dynamic path handles.
    pub fn is_dynamic(&self, id: ShapeId) -> bool {
        matches!(self.resolved(id), Shape::Unknown | Shape::Undetermined)
    }

    pub fn is(&self, id: ShapeId, c: Concrete) -> bool {
        self.concrete(id) == Some(c)
    }

    pub fn lambda(&self, id: ShapeId) -> Option<&LambdaShape> {
        match self.resolved(id) {
            Shape::Method(MethodShape::Lambda(l)) => Some(l),
            _ => None,
        }
    }

    pub fn lambda_mut(&mut self, id: ShapeId) -> Option<&mut LambdaShape> {
        let id = self.resolve(id);
        match self.get_mut(id) {
            Some(Shape::Method(MethodShape::Lambda(l))) => Some(l),
            _ => None,
        }
    }

    pub fn signature(&self, method: ShapeId, index: usize) -> Option<&CallSignature> {
        let method = self.resolve(method);
        match self.get(method) {
            Shape::Method(MethodShape::Lambda(l)) => l.signatures.get(index),
            _ => None,
        }
    }

    /// Human-readable shape name for diagnostics.
    pub fn describe(&self, id: ShapeId) -> String {
        match self.resolved(id) {
            Shape::Unknown => "unknown".into(),
            Shape::Undetermined => "undetermined".into(),
            Shape::Concrete(Concrete::Number) => "Number".into(),
            Shape::Concrete(Concrete::Bool) => "Bool".into(),
            Shape::Concrete(Concrete::String) => "String".into(),
            Shape::Concrete(Concrete::Host(h)) => format!("host type #{}", h.0),
            Shape::Record { fields, .. } => {
                let names: Vec<&str> = fields.keys().map(String::as_str).collect();
                format!("{{{}}}", names.join(", "))
            }
            Shape::Array { .. } => "Array".into(),
            Shape::Method(_) => "Lambda".into(),
            Shape::MethodReturn { .. } | Shape::Forward(_) => "unknown".into(),
        }
    }

    pub fn new_record(&mut self, origin: NodeId, fields: IndexMap<String, ShapeId>) -> ShapeId {
        let fields = fields
            .into_iter()
            .map(|(name, shape)| {
                let forced = self.widening.forced_fields.contains(&(origin, name.clone()));
                (name, if forced { Self::UNKNOWN } else { shape })
            })
            .collect();
        self.push(Shape::Record {
            fields,
            origins: vec![origin],
        })
    }

    pub fn new_array(&mut self, origin: NodeId, element: ShapeId) -> ShapeId {
        let element = if self.widening.forced_elements.contains(&origin) {
            Self::UNKNOWN
        } else {
            element
        };
        self.push(Shape::Array {
            element,
            origins: vec![origin],
        })
    }

    pub fn new_method(&mut self, method: MethodShape) -> ShapeId {
        self.push(Shape::Method(method))
    }

    pub fn new_call(&mut self, method: ShapeId, signature: usize) -> ShapeId {
        self.push(Shape::MethodReturn { method, signature })
    }

    pub fn is_decl_forced(&self, node: NodeId) -> bool {
        self.widening.forced_decls.contains(&node)
    }

    /// Record that a variable or parameter was widened after being read.
    pub fn force_decl(&mut self, node: NodeId) {
        self.unstable = true;
        self.widening.forced_decls.insert(node);
    }

    pub fn is_unstable(&self) -> bool {
        self.unstable
    }

    pub fn into_widening(self) -> Widening {
        self.widening
    }

    pub fn widening(&self) -> &Widening {
        &self.widening
    }

    /// Shapes created before this call may no longer widen.
    pub fn freeze(&mut self) -> u32 {
        std::mem::replace(&mut self.frozen_below, self.shapes.len() as u32)
    }

    pub fn thaw(&mut self, previous: u32) {
        self.frozen_below = previous;
    }

    pub fn is_frozen(&self, id: ShapeId) -> bool {
        self.resolve(id).0 < self.frozen_below
    }

    fn origins(&self, id: ShapeId) -> &[NodeId] {
        match self.get(id) {
            Shape::Record { origins, .. } | Shape::Array { origins, .. } => origins,
            _ => &[],
        }
    }

    fn field_was_read(&self, origins: &[NodeId], name: &str) -> bool {
        origins
            .iter()
            .any(|o| self.field_reads.contains(&(*o, name.to_string())))
    }

    fn force_field(&mut self, origins: &[NodeId], name: &str) {
        self.unstable = true;
        for o in origins {
            self.widening.forced_fields.insert((*o, name.to_string()));
        }
    }

    fn field_forced(&self, origins: &[NodeId], name: &str) -> bool {
        origins
            .iter()
            .any(|o| self.widening.forced_fields.contains(&(*o, name.to_string())))
    }

    /// Merge two shapes into one that describes both.
    pub fn derive(&mut self, a: ShapeId, b: ShapeId) -> ShapeId {
        let a = self.resolve(a);
        let b = self.resolve(b);
        if a == b {
            return a;
        }
        match (self.get(a), self.get(b)) {
            (Shape::Undetermined, _) => b,
            (_, Shape::Undetermined) => a,
            (Shape::Unknown, _) | (_, Shape::Unknown) => Self::UNKNOWN,
            (Shape::Concrete(x), Shape::Concrete(y)) if x == y => a,
            (Shape::Record { .. }, Shape::Record { .. }) => self.merge_records(a, b),
            (Shape::Array { .. }, Shape::Array { .. }) => self.merge_arrays(a, b),
            _ => Self::UNKNOWN,
        }
    }

    fn merge_records(&mut self, a: ShapeId, b: ShapeId) -> ShapeId {
        if self.is_frozen(a) || self.is_frozen(b) {
            return Self::UNKNOWN;
        }
        // Forward first so self-referencing fields resolve to the union.
        let Some(Shape::Record {
            fields: b_fields,
            origins: b_origins,
        }) = self.get_mut(b).map(|slot| std::mem::replace(slot, Shape::Forward(a)))
        else {
            return Self::UNKNOWN;
        };
        if let Some(Shape::Record { origins, .. }) = self.get_mut(a) {
            origins.extend(b_origins);
        }
        let origins = self.origins(a).to_vec();

        for (name, b_field) in b_fields {
            let existing = match self.get(a) {
                Shape::Record { fields, .. } => fields.get(&name).copied(),
                _ => None,
            };
            let merged = match existing {
                Some(a_field) => {
                    let merged = self.derive(a_field, b_field);
                    if self.resolve(merged) == self.resolve(a_field) {
                        continue;
                    }
                    if self.field_was_read(&origins, &name) {
                        self.force_field(&origins, &name);
                    }
                    merged
                }
                None if self.field_forced(&origins, &name) => Self::UNKNOWN,
                None => b_field,
            };
            if let Some(Shape::Record { fields, .. }) = self.get_mut(a) {
                fields.insert(name, merged);
            }
        }
        a
    }

    fn merge_arrays(&mut self, a: ShapeId, b: ShapeId) -> ShapeId {
        if self.is_frozen(a) || self.is_frozen(b) {
            return Self::UNKNOWN;
        }
        let Some(Shape::Array {
            element: b_element,
            origins: b_origins,
        }) = self.get_mut(b).map(|slot| std::mem::replace(slot, Shape::Forward(a)))
        else {
            return Self::UNKNOWN;
        };
        let a_element = match self.get_mut(a) {
            Some(Shape::Array { element, origins }) => {
                origins.extend(b_origins);
                *element
            }
            _ => return Self::UNKNOWN,
        };
        let merged = self.derive(a_element, b_element);
        if self.resolve(merged) != self.resolve(a_element) {
            self.set_element(a, merged);
        }
        a
    }

    fn set_element(&mut self, array: ShapeId, element: ShapeId) {
        let origins = self.origins(array).to_vec();
        if origins.iter().any(|o| self.element_reads.contains(o)) {
            self.unstable = true;
            self.widening.forced_elements.extend(origins.iter().copied());
        }
        if let Some(Shape::Array { element: slot, .. }) = self.get_mut(array) {
            *slot = element;
        }
    }

    /// Field shape of a record, noting the read.
    pub fn read_field(&mut self, record: ShapeId, name: &str) -> Option<ShapeId> {
        let record = self.resolve(record);
        let (field, origins) = match self.get(record) {
            Shape::Record { fields, origins } => (fields.get(name).copied(), origins.clone()),
            _ => return None,
        };
        for o in origins {
            self.field_reads.insert((o, name.to_string()));
        }
        field
    }

    /// Field shape without noting a read.
    pub fn field(&self, record: ShapeId, name: &str) -> Option<ShapeId> {
        match self.resolved(record) {
            Shape::Record { fields, .. } => fields.get(name).copied(),
            _ => None,
        }
    }

    pub fn write_field(&mut self, record: ShapeId, name: &str, value: ShapeId) -> Write {
        let record = self.resolve(record);
        let Some(existing) = self.field(record, name) else {
            if self.is_frozen(record) {
                return Write::Frozen;
            }
            let origins = self.origins(record).to_vec();
            let value = if self.field_forced(&origins, name) {
                Self::UNKNOWN
            } else {
                value
            };
            if let Some(Shape::Record { fields, .. }) = self.get_mut(record) {
                fields.insert(name.to_string(), value);
            }
            return Write::Added;
        };
        if self.is_frozen(record) {
            let merged = self.derive(existing, value);
            return if self.resolve(merged) == self.resolve(existing) {
                Write::Unchanged
            } else {
                Write::Frozen
            };
        }
        let merged = self.derive(existing, value);
        if self.resolve(merged) == self.resolve(existing) {
            return Write::Unchanged;
        }
        let record = self.resolve(record);
        let origins = self.origins(record).to_vec();
        if self.field_was_read(&origins, name) {
            self.force_field(&origins, name);
        }
        if let Some(Shape::Record { fields, .. }) = self.get_mut(record) {
            fields.insert(name.to_string(), merged);
        }
        Write::Widened
    }

    pub fn read_element(&mut self, array: ShapeId) -> Option<ShapeId> {
        let array = self.resolve(array);
        let (element, origins) = match self.get(array) {
            Shape::Array { element, origins } => (*element, origins.clone()),
            _ => return None,
        };
        self.element_reads.extend(origins);
        Some(element)
    }

    pub fn element(&self, array: ShapeId) -> Option<ShapeId> {
        match self.resolved(array) {
            Shape::Array { element, .. } => Some(*element),
            _ => None,
        }
    }

    pub fn write_element(&mut self, array: ShapeId, value: ShapeId) -> Write {
        let array = self.resolve(array);
        let Some(existing) = self.element(array) else {
            return Write::Unchanged;
        };
        let frozen = self.is_frozen(array);
        let merged = self.derive(existing, value);
        if self.resolve(merged) == self.resolve(existing) {
            return Write::Unchanged;
        }
        if frozen {
            return Write::Frozen;
        }
        let array = self.resolve(array);
        self.set_element(array, merged);
        Write::Widened
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeError {
    #[error("Shape already set for node {0:?}")]
    AlreadySet(NodeId),
}

/// Node shapes, one layer per analysis context. Lookups search a layer
/// stack innermost first.
#[derive(Debug)]
pub struct ShapeTable {
    layers: Vec<HashMap<NodeId, ShapeId>>,
    frozen_below: u32,
}

impl Default for ShapeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ShapeTable {
    pub const ROOT: LayerId = LayerId(0);

    pub fn new() -> Self {
        Self {
            layers: vec![HashMap::new()],
            frozen_below: 0,
        }
    }

    pub fn new_layer(&mut self) -> LayerId {
        let id = LayerId(self.layers.len() as u32);
        self.layers.push(HashMap::new());
        id
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn layer(&self, id: LayerId) -> Option<&HashMap<NodeId, ShapeId>> {
        self.layers.get(id.0 as usize)
    }

    /// Layers created before this call become read-only for overrides.
    pub fn freeze(&mut self) -> u32 {
        std::mem::replace(&mut self.frozen_below, self.layers.len() as u32)
    }

    pub fn thaw(&mut self, previous: u32) {
        self.frozen_below = previous;
    }

    /// Layer in `stack` holding `node`, innermost first.
    pub fn find_layer(&self, stack: &[LayerId], node: NodeId) -> Option<LayerId> {
        stack
            .iter()
            .rev()
            .copied()
            .find(|l| self.layer(*l).is_some_and(|m| m.contains_key(&node)))
    }

    pub fn get_shape(&self, stack: &[LayerId], node: NodeId) -> Option<ShapeId> {
        self.find_layer(stack, node)
            .and_then(|l| self.layer(l))
            .and_then(|m| m.get(&node).copied())
    }

    /// Set the shape of `node`. Without `override_existing`, the node must
    /// not have a shape in the innermost layer yet. With it, the shape is
    /// replaced in whichever layer holds it, unless that layer is frozen.
    /// Returns the layer written, or `None` when the write was suppressed.
    pub fn set_shape(
        &mut self,
        stack: &[LayerId],
        node: NodeId,
        shape: ShapeId,
        override_existing: bool,
    ) -> Result<Option<LayerId>, ShapeError> {
        let Some(&top) = stack.last() else {
            return Ok(None);
        };
        let target = if override_existing {
            self.find_layer(stack, node).unwrap_or(top)
        } else {
            if self.layer(top).is_some_and(|m| m.contains_key(&node)) {
                return Err(ShapeError::AlreadySet(node));
            }
            top
        };
        if override_existing && target.0 < self.frozen_below {
            return Ok(None);
        }
        match self.layers.get_mut(target.0 as usize) {
            Some(layer) => {
                layer.insert(node, shape);
                Ok(Some(target))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn record(arena: &mut ShapeArena, origin: u32, fields: &[(&str, ShapeId)]) -> ShapeId {
        let fields = fields.iter().map(|(n, s)| ((*n).to_string(), *s)).collect();
        arena.new_record(NodeId(origin), fields)
    }

    #[test]
    fn derive_is_idempotent() {
        let mut arena = ShapeArena::default();
        let host = arena.host(HostTypeId(3));
        let rec = record(&mut arena, 1, &[("x", ShapeArena::NUMBER)]);
        let elem = arena.new_array(NodeId(2), ShapeArena::STRING);
        for shape in [ShapeArena::NUMBER, ShapeArena::BOOL, ShapeArena::STRING, host, rec, elem] {
            assert_eq!(arena.derive(shape, shape), shape);
        }
    }

    #[test]
    fn undetermined_takes_the_other_side() {
        let mut arena = ShapeArena::default();
        let rec = record(&mut arena, 1, &[]);
        assert_eq!(arena.derive(ShapeArena::UNDETERMINED, ShapeArena::NUMBER), ShapeArena::NUMBER);
        assert_eq!(arena.derive(rec, ShapeArena::UNDETERMINED), rec);
    }

    #[test]
    fn mismatches_derive_to_unknown() {
        let mut arena = ShapeArena::default();
        let rec = record(&mut arena, 1, &[]);
        let arr = arena.new_array(NodeId(2), ShapeArena::NUMBER);
        assert_eq!(arena.derive(ShapeArena::NUMBER, ShapeArena::STRING), ShapeArena::UNKNOWN);
        assert_eq!(arena.derive(rec, arr), ShapeArena::UNKNOWN);
        assert_eq!(arena.derive(ShapeArena::UNKNOWN, ShapeArena::NUMBER), ShapeArena::UNKNOWN);
    }

    #[test]
    fn merged_records_share_one_slot() {
        let mut arena = ShapeArena::default();
        let a = record(&mut arena, 1, &[("x", ShapeArena::NUMBER)]);
        let b = record(&mut arena, 2, &[("y", ShapeArena::STRING)]);
        let merged = arena.derive(a, b);
        assert_eq!(merged, a);
        assert_eq!(arena.resolve(b), a);
        assert_eq!(arena.write_field(b, "z", ShapeArena::BOOL), Write::Added);
        assert_eq!(arena.field(a, "z"), Some(ShapeArena::BOOL));
        assert_eq!(arena.field(a, "y"), Some(ShapeArena::STRING));
    }

    #[test]
    fn self_referencing_records_merge() {
        let mut arena = ShapeArena::default();
        let a = record(&mut arena, 1, &[]);
        let b = record(&mut arena, 2, &[]);
        arena.write_field(a, "next", a);
        arena.write_field(b, "next", b);
        let merged = arena.derive(a, b);
        assert_eq!(arena.resolve(arena.field(merged, "next").unwrap()), a);
    }

    #[test]
    fn widening_after_read_is_recorded() {
        let mut arena = ShapeArena::default();
        let a = record(&mut arena, 7, &[("x", ShapeArena::NUMBER)]);
        assert_eq!(arena.read_field(a, "x"), Some(ShapeArena::NUMBER));
        assert_eq!(arena.write_field(a, "x", ShapeArena::STRING), Write::Widened);
        assert!(arena.is_unstable());
        let widening = arena.into_widening();
        assert!(widening.forced_fields.contains(&(NodeId(7), "x".to_string())));

        let mut next = ShapeArena::new(widening);
        let fields = [("x".to_string(), ShapeArena::NUMBER)].into_iter().collect();
        let a = next.new_record(NodeId(7), fields);
        assert_eq!(next.field(a, "x"), Some(ShapeArena::UNKNOWN));
    }

    #[test]
    fn array_elements_merge() {
        let mut arena = ShapeArena::default();
        let a = arena.new_array(NodeId(1), ShapeArena::UNDETERMINED);
        assert_eq!(arena.write_element(a, ShapeArena::NUMBER), Write::Widened);
        assert_eq!(arena.write_element(a, ShapeArena::NUMBER), Write::Unchanged);
        assert!(!arena.is_unstable());
        arena.read_element(a);
        arena.write_element(a, ShapeArena::STRING);
        assert!(arena.is_unstable());
        assert_eq!(arena.element(a), Some(ShapeArena::UNKNOWN));
    }

    #[test]
    fn frozen_shapes_do_not_widen() {
        let mut arena = ShapeArena::default();
        let a = record(&mut arena, 1, &[("x", ShapeArena::NUMBER)]);
        let saved = arena.freeze();
        assert_eq!(arena.write_field(a, "x", ShapeArena::STRING), Write::Frozen);
        assert_eq!(arena.write_field(a, "y", ShapeArena::STRING), Write::Frozen);
        let b = record(&mut arena, 2, &[]);
        assert_eq!(arena.derive(a, b), ShapeArena::UNKNOWN);
        arena.thaw(saved);
        assert_eq!(arena.field(a, "x"), Some(ShapeArena::NUMBER));
    }

    #[test]
    fn table_layers_search_innermost_first() {
        let mut table = ShapeTable::new();
        let inner = table.new_layer();
        let root = [ShapeTable::ROOT];
        let stack = [ShapeTable::ROOT, inner];
        table.set_shape(&root, NodeId(1), ShapeArena::NUMBER, false).unwrap();
        table.set_shape(&stack, NodeId(1), ShapeArena::STRING, false).unwrap();
        assert_eq!(table.get_shape(&stack, NodeId(1)), Some(ShapeArena::STRING));
        assert_eq!(table.get_shape(&root, NodeId(1)), Some(ShapeArena::NUMBER));
        assert_eq!(
            table.set_shape(&stack, NodeId(1), ShapeArena::BOOL, false),
            Err(ShapeError::AlreadySet(NodeId(1)))
        );
    }

    #[test]
    fn overrides_into_frozen_layers_are_suppressed() {
        let mut table = ShapeTable::new();
        let root = [ShapeTable::ROOT];
        table.set_shape(&root, NodeId(1), ShapeArena::NUMBER, false).unwrap();
        let saved = table.freeze();
        let inner = table.new_layer();
        let stack = [ShapeTable::ROOT, inner];
        assert_eq!(table.set_shape(&stack, NodeId(1), ShapeArena::STRING, true), Ok(None));
        assert_eq!(table.get_shape(&stack, NodeId(1)), Some(ShapeArena::NUMBER));
        table.thaw(saved);
        assert_eq!(table.set_shape(&stack, NodeId(1), ShapeArena::STRING, true), Ok(Some(ShapeTable::ROOT)));
    }
}
