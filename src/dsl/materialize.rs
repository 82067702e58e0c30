//! Turns inferred shapes into runtime representations.
//!
//! Every resolved record and array shape that code generation touches
//! gets one layout. Layout ids are handed out before their contents are
//! computed so self-referencing shapes terminate.

#![allow(clippy::cast_possible_truncation)]

use std::collections::HashMap;
use std::sync::Arc;

use super::shape::{Concrete, LayerId, MethodShape, Shape, ShapeArena, ShapeId, ShapeTable};
use super::value::{ArrayLayout, RecordLayout, Repr};

pub struct Materializer<'a> {
    arena: &'a ShapeArena,
    memo: HashMap<ShapeId, Repr>,
    records: Vec<Vec<(Arc<str>, Repr)>>,
    arrays: Vec<Repr>,
}

/// Layouts produced for one program.
#[derive(Debug, Default)]
pub struct Layouts {
    pub records: Vec<Arc<RecordLayout>>,
    pub arrays: Vec<Arc<ArrayLayout>>,
}

impl<'a> Materializer<'a> {
    pub fn new(arena: &'a ShapeArena) -> Self {
        Self {
            arena,
            memo: HashMap::new(),
            records: Vec::new(),
            arrays: Vec::new(),
        }
    }

    /// Materialize every shape recorded in `table`.
    #[tracing::instrument(skip_all)]
    pub fn prepare(&mut self, table: &ShapeTable) {
        for index in 0..table.layer_count() {
            let layer = LayerId(index as u32);
            if let Some(nodes) = table.layer(layer) {
                for shape in nodes.values() {
                    self.repr(*shape);
                }
            }
        }
        tracing::debug!(
            records = self.records.len(),
            arrays = self.arrays.len(),
            "layouts materialized"
        );
    }

    pub fn repr(&mut self, id: ShapeId) -> Repr {
        let arena = self.arena;
        let id = arena.resolve(id);
        if let Some(repr) = self.memo.get(&id) {
            return *repr;
        }
        match arena.get(id) {
            Shape::Unknown | Shape::Undetermined => Repr::Dyn,
            Shape::Concrete(c) => match c {
                Concrete::Number => Repr::Num,
                Concrete::Bool => Repr::Bool,
                Concrete::String => Repr::Str,
                Concrete::Host(h) => Repr::Host(*h),
            },
            Shape::Record { fields, .. } => {
                let layout = self.records.len() as u32;
                let repr = Repr::Record(layout);
                self.memo.insert(id, repr);
                self.records.push(Vec::new());
                let fields = fields
                    .iter()
                    .map(|(name, shape)| (Arc::from(name.as_str()), self.repr(*shape)))
                    .collect();
                if let Some(slot) = self.records.get_mut(layout as usize) {
                    *slot = fields;
                }
                repr
            }
            Shape::Array { element, .. } => {
                let element = *element;
                let layout = self.arrays.len() as u32;
                let repr = Repr::Array(layout);
                self.memo.insert(id, repr);
                self.arrays.push(Repr::Dyn);
                let element = self.repr(element);
                if let Some(slot) = self.arrays.get_mut(layout as usize) {
                    *slot = element;
                }
                repr
            }
            Shape::Method(MethodShape::Lambda(_)) => {
                let repr = Repr::Closure(id.0);
                self.memo.insert(id, repr);
                repr
            }
            // Bound host methods travel as erased values.
            Shape::Method(MethodShape::Host { .. }) | Shape::MethodReturn { .. } | Shape::Forward(_) => {
                Repr::Dyn
            }
        }
    }

    /// Field layout of a record repr.
    pub fn record_fields(&self, layout: u32) -> &[(Arc<str>, Repr)] {
        self.records.get(layout as usize).map_or(&[], Vec::as_slice)
    }

    pub fn array_element(&self, layout: u32) -> Repr {
        self.arrays.get(layout as usize).copied().unwrap_or(Repr::Dyn)
    }

    pub fn finish(self) -> Layouts {
        Layouts {
            records: self
                .records
                .into_iter()
                .enumerate()
                .map(|(id, fields)| Arc::new(RecordLayout::new(id as u32, fields)))
                .collect(),
            arrays: self
                .arrays
                .into_iter()
                .enumerate()
                .map(|(id, element)| Arc::new(ArrayLayout { id: id as u32, element }))
                .collect(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::dsl::ast::NodeId;
    use crate::dsl::host::HostTypeId;

    #[test]
    fn scalars_map_directly() {
        let mut arena = ShapeArena::default();
        let host = arena.host(HostTypeId(2));
        let mut m = Materializer::new(&arena);
        assert_eq!(m.repr(ShapeArena::NUMBER), Repr::Num);
        assert_eq!(m.repr(ShapeArena::STRING), Repr::Str);
        assert_eq!(m.repr(ShapeArena::UNDETERMINED), Repr::Dyn);
        assert_eq!(m.repr(host), Repr::Host(HostTypeId(2)));
    }

    #[test]
    fn aliased_records_share_a_layout() {
        let mut arena = ShapeArena::default();
        let a = arena.new_record(NodeId(1), [("x".to_string(), ShapeArena::NUMBER)].into_iter().collect());
        let b = arena.new_record(NodeId(2), [("y".to_string(), ShapeArena::STRING)].into_iter().collect());
        arena.derive(a, b);
        let mut m = Materializer::new(&arena);
        assert_eq!(m.repr(a), m.repr(b));
        let Repr::Record(layout) = m.repr(a) else {
            panic!("expected record");
        };
        assert_eq!(m.record_fields(layout).len(), 2);
        let layouts = m.finish();
        assert_eq!(layouts.records[0].index_of("y"), Some(1));
        assert_eq!(layouts.records[0].repr_of(1), Repr::Str);
    }

    #[test]
    fn self_referencing_record_terminates() {
        let mut arena = ShapeArena::default();
        let node = arena.new_record(NodeId(1), Default::default());
        arena.write_field(node, "next", node);
        let arr = arena.new_array(NodeId(2), node);
        let mut m = Materializer::new(&arena);
        let Repr::Array(layout) = m.repr(arr) else {
            panic!("expected array");
        };
        assert_eq!(m.array_element(layout), Repr::Record(0));
        assert_eq!(m.record_fields(0)[0].1, Repr::Record(0));
    }
}
