use std::collections::HashMap;

use crate::{
    Class, Function, HeapObject, HeapRef, Intrinsic, Native, Selector, SelectorNames, Space,
    Value,
};

/// One dispatch-table slot. Valid only for call sites addressing it with `offset`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DispatchEntry {
    pub offset: u32,
    pub target: Value,
    pub intrinsic: Option<Intrinsic>,
}

/// Well-known objects every process relies on.
#[derive(Debug, Clone)]
pub struct SpecialObjects {
    pub null: Value,
    pub true_object: Value,
    pub false_object: Value,

    pub object_class: Value,
    pub null_class: Value,
    pub bool_class: Value,
    pub smi_class: Value,
    pub large_integer_class: Value,
    pub double_class: Value,
    pub array_class: Value,
    pub boxed_class: Value,
    pub coroutine_class: Value,
    pub function_class: Value,
    pub class_class: Value,
    pub initializer_class: Value,
    pub string_class: Value,
    pub error_class: Value,

    pub stack_overflow_error: Value,
    pub no_such_method_error: Value,
    pub wrong_argument_type_error: Value,
    pub index_out_of_bounds_error: Value,
    pub illegal_state_error: Value,
    pub division_by_zero_error: Value,

    /// target of dispatch-table entry 0
    pub no_such_method_function: Value,
    pub no_such_method_selector: Selector,
}

impl SpecialObjects {
    pub fn boolean(&self, value: bool) -> Value {
        if value {
            self.true_object
        } else {
            self.false_object
        }
    }
}

/// Read-only program space shared by every process.
#[derive(Debug)]
pub struct Program {
    pub(crate) objects: Vec<HeapObject>,
    pub(crate) dispatch_table: Vec<DispatchEntry>,
    pub(crate) classes: Vec<Value>,
    pub(crate) natives: Vec<Native>,
    pub(crate) statics: Vec<Value>,
    pub(crate) table_offsets: HashMap<Selector, u32>,
    pub(crate) offset_selectors: HashMap<u32, Selector>,
    pub(crate) names: SelectorNames,
    pub specials: SpecialObjects,
}

impl Program {
    pub fn get(&self, value: Value) -> Option<&HeapObject> {
        match value.as_heap_ref()? {
            HeapRef {
                space: Space::Program,
                index,
            } => self.objects.get(index as usize),
            _ => None,
        }
    }

    pub fn class(&self, value: Value) -> Option<&Class> {
        self.get(value)?.as_class()
    }

    pub fn function(&self, value: Value) -> Option<&Function> {
        self.get(value)?.as_function()
    }

    pub fn class_by_id(&self, id: u32) -> Option<Value> {
        self.classes.get(id as usize).copied()
    }

    pub fn class_count(&self) -> usize {
        self.classes.len()
    }

    /// Entry at `index`, entry 0 when the index lies past the table.
    pub fn dispatch_entry(&self, index: usize) -> DispatchEntry {
        self.dispatch_table
            .get(index)
            .or_else(|| self.dispatch_table.first())
            .copied()
            .unwrap_or(DispatchEntry {
                offset: 0,
                target: self.specials.no_such_method_function,
                intrinsic: None,
            })
    }

    pub fn dispatch_table_len(&self) -> usize {
        self.dispatch_table.len()
    }

    pub fn native(&self, index: u8) -> Option<&Native> {
        self.natives.get(index as usize)
    }

    pub fn natives(&self) -> &[Native] {
        &self.natives
    }

    pub fn native_index(&self, name: &str) -> Option<u8> {
        self.natives
            .iter()
            .position(|native| native.name == name)
            .and_then(|index| u8::try_from(index).ok())
    }

    pub fn statics(&self) -> &[Value] {
        &self.statics
    }

    pub fn names(&self) -> &SelectorNames {
        &self.names
    }

    /// Table form of a selector: its id replaced by the dispatch row offset.
    pub fn table_selector(&self, selector: Selector) -> Option<Selector> {
        self.table_offsets
            .get(&selector)
            .map(|&offset| selector.with_id(offset))
    }

    /// Named form of a selector taken from a table call site.
    pub fn selector_for_offset(&self, table_selector: Selector) -> Option<Selector> {
        self.offset_selectors.get(&table_selector.id()).copied()
    }

    pub fn selector_name(&self, selector: Selector) -> String {
        match self.names.name(selector.id()) {
            Some(name) => format!("{name}/{}", selector.arity()),
            None => format!("{selector:?}"),
        }
    }

    /// Walks the superclass chain starting at `class`.
    pub fn lookup_method(&self, class: Value, selector: Selector) -> Option<Value> {
        let mut current = Some(class);
        while let Some(class_value) = current {
            let class = self.class(class_value)?;
            if let Some(function) = class.method(selector) {
                return Some(function);
            }
            current = class.superclass;
        }
        None
    }

    pub fn intrinsic(&self, function: Value) -> Option<Intrinsic> {
        self.function(function)?.intrinsic
    }
}

#[cfg(test)]
mod tests {
    use crate::{Opcode, ProgramBuilder, ProgramCreateInfo};

    #[test]
    fn lookup_walks_superclasses() {
        let mut builder = ProgramBuilder::new(ProgramCreateInfo::default()).unwrap();
        let object = builder.specials().object_class;
        let base = builder.class("Base", Some(object), 0).unwrap();
        let derived = builder.class("Derived", Some(base), 1).unwrap();
        let selector = builder.selector("describe", 0);
        let function = builder
            .function_from_ops("describe", 1, &[Opcode::LoadLiteral1, Opcode::Return])
            .unwrap();
        builder.define_method(base, selector, function).unwrap();
        let program = builder.finish().unwrap();

        assert_eq!(program.lookup_method(derived, selector), Some(function));
        let missing = program.names().lookup("describe").map(|id| crate::Selector::method(id, 3));
        assert_eq!(program.lookup_method(derived, missing.unwrap()), None);
    }

    #[test]
    fn dispatch_rows_validate_their_offset() {
        let mut builder = ProgramBuilder::new(ProgramCreateInfo::default()).unwrap();
        let object = builder.specials().object_class;
        let point = builder.class("Point", Some(object), 2).unwrap();
        let other = builder.class("Other", Some(object), 0).unwrap();
        let selector = builder.getter("x");
        let table = builder.table_selector(selector);
        let getter = builder
            .function_from_ops("x", 1, &[Opcode::LoadLiteral0, Opcode::Return])
            .unwrap();
        builder.define_method(point, selector, getter).unwrap();
        let program = builder.finish().unwrap();

        let point_id = program.class(point).unwrap().id as usize;
        let other_id = program.class(other).unwrap().id as usize;
        let offset = table.id();

        let hit = program.dispatch_entry(point_id + offset as usize);
        assert_eq!(hit.offset, offset);
        assert_eq!(hit.target, getter);

        let miss = program.dispatch_entry(other_id + offset as usize);
        assert_ne!(miss.offset, offset, "missing methods must fail validation");
        assert_eq!(program.dispatch_entry(0).target, program.specials.no_such_method_function);
        assert_eq!(program.selector_for_offset(table), Some(selector));
        assert_eq!(program.table_selector(selector), Some(table));
    }
}
