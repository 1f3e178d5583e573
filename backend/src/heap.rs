//! Server-side table of exported values.
//!
//! The controller only ever sees `(object_id, repr)` pairs. Ids for
//! reference values come from their allocation address so repeated exports
//! of the same object agree; exported values are kept alive in the table so
//! a later `get_object_info` query resolves against the same object the repr
//! was taken from, not a recycled id.

use std::collections::{BTreeMap, HashMap};

use transport::types::{ObjectId, ValueInfo};

use crate::eval::Value;
use crate::is_hidden_name;

/// Repr limit for a value exported on its own.
pub const MAX_REPR_LENGTH: usize = 5000;
/// Repr limit inside variable listings.
pub const MAX_VARIABLE_REPR_LENGTH: usize = 100;

#[derive(Default)]
pub struct Heap {
    objects: HashMap<ObjectId, Value>,
    next_scalar_id: u64,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            objects: HashMap::new(),
            // odd ids for scalars; pointer-derived ids are aligned and even
            next_scalar_id: 1,
        }
    }

    /// Dropped at every new toplevel command: ids from the previous run must
    /// not resolve against stale objects.
    pub fn clear(&mut self) {
        self.objects.clear();
    }

    pub fn get(&self, id: ObjectId) -> Option<&Value> {
        self.objects.get(&id)
    }

    pub fn export_value(&mut self, value: &Value, max_repr_length: usize) -> ValueInfo {
        let id = self.id_for(value);
        self.objects.insert(id, value.clone());

        let mut repr = value.repr();
        if repr.chars().count() > max_repr_length {
            repr = repr.chars().take(max_repr_length).collect::<String>() + "…";
        }
        ValueInfo { id, repr }
    }

    pub fn export_variables(
        &mut self,
        variables: &BTreeMap<String, Value>,
    ) -> BTreeMap<String, ValueInfo> {
        variables
            .iter()
            .filter(|(name, _)| !is_hidden_name(name))
            .map(|(name, value)| {
                (
                    name.clone(),
                    self.export_value(value, MAX_VARIABLE_REPR_LENGTH),
                )
            })
            .collect()
    }

    fn id_for(&mut self, value: &Value) -> ObjectId {
        match value {
            Value::Str(rc) => std::rc::Rc::as_ptr(rc) as ObjectId,
            Value::List(rc) => std::rc::Rc::as_ptr(rc) as ObjectId,
            Value::Tuple(rc) => std::rc::Rc::as_ptr(rc) as ObjectId,
            Value::Dict(rc) => std::rc::Rc::as_ptr(rc) as ObjectId,
            Value::Func(rc) => std::rc::Rc::as_ptr(rc) as ObjectId,
            _ => {
                let id = self.next_scalar_id;
                self.next_scalar_id += 2;
                id
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_list_exports_under_the_same_id() {
        let mut heap = Heap::new();
        let list = Value::list(vec![Value::Int(1)]);
        let a = heap.export_value(&list, MAX_REPR_LENGTH);
        let b = heap.export_value(&list, MAX_REPR_LENGTH);
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn exported_value_resolves_later() {
        let mut heap = Heap::new();
        let list = Value::list(vec![Value::Int(1), Value::Int(2)]);
        let info = heap.export_value(&list, MAX_REPR_LENGTH);

        let resolved = heap.get(info.id).expect("still alive");
        assert!(resolved.py_eq(&list));
    }

    #[test]
    fn long_reprs_are_truncated() {
        let mut heap = Heap::new();
        let long = Value::str("x".repeat(500));
        let info = heap.export_value(&long, MAX_VARIABLE_REPR_LENGTH);
        assert_eq!(info.repr.chars().count(), MAX_VARIABLE_REPR_LENGTH + 1);
        assert!(info.repr.ends_with('…'));
    }

    #[test]
    fn hidden_names_are_not_exported() {
        let mut heap = Heap::new();
        let mut vars = BTreeMap::new();
        vars.insert("x".to_owned(), Value::Int(1));
        vars.insert("__secret".to_owned(), Value::Int(2));
        let exported = heap.export_variables(&vars);
        assert!(exported.contains_key("x"));
        assert!(!exported.contains_key("__secret"));
    }

    #[test]
    fn clear_forgets_objects() {
        let mut heap = Heap::new();
        let info = heap.export_value(&Value::list(vec![]), MAX_REPR_LENGTH);
        heap.clear();
        assert!(heap.get(info.id).is_none());
    }
}
