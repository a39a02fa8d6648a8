use std::sync::Arc;

use bitflags::bitflags;

use crate::{Selector, Stack, Value};

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ObjectType {
    Instance = 0,
    Class = 1,
    Function = 2,
    Array = 3,
    Boxed = 4,
    LargeInteger = 5,
    Double = 6,
    Coroutine = 7,
    Initializer = 8,
    String = 9,
}

impl ObjectType {
    const ALL: [ObjectType; 10] = [
        ObjectType::Instance,
        ObjectType::Class,
        ObjectType::Function,
        ObjectType::Array,
        ObjectType::Boxed,
        ObjectType::LargeInteger,
        ObjectType::Double,
        ObjectType::Coroutine,
        ObjectType::Initializer,
        ObjectType::String,
    ];
}

/// Whether instances of a class may be treated as immutable.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Mutability {
    Never = 0,
    Always = 1,
    /// decided per instance through [`ObjectFlags::IMMUTABLE`]
    InstanceTracked = 2,
}

/// Instance layout word shared with the compiler and the collector.
///
/// ```text
/// | fixed field count (26 bits) | mutability (2 bits) | object type (4 bits) |
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct InstanceFormat(u32);

impl InstanceFormat {
    const TYPE_MASK: u32 = 0b1111;
    const MUTABILITY_SHIFT: u32 = 4;
    const MUTABILITY_MASK: u32 = 0b11;
    const FIELDS_SHIFT: u32 = 6;

    pub const fn new(object_type: ObjectType, mutability: Mutability, fields: u32) -> Self {
        Self(
            (fields << Self::FIELDS_SHIFT)
                | ((mutability as u32) << Self::MUTABILITY_SHIFT)
                | object_type as u32,
        )
    }

    pub const fn instance(fields: u32) -> Self {
        Self::new(ObjectType::Instance, Mutability::InstanceTracked, fields)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub fn object_type(self) -> ObjectType {
        ObjectType::ALL
            .get((self.0 & Self::TYPE_MASK) as usize)
            .copied()
            .unwrap_or(ObjectType::Instance)
    }

    pub const fn mutability(self) -> Mutability {
        match (self.0 >> Self::MUTABILITY_SHIFT) & Self::MUTABILITY_MASK {
            1 => Mutability::Always,
            2 => Mutability::InstanceTracked,
            _ => Mutability::Never,
        }
    }

    pub const fn fixed_fields(self) -> usize {
        (self.0 >> Self::FIELDS_SHIFT) as usize
    }
}

impl std::fmt::Debug for InstanceFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceFormat")
            .field("type", &self.object_type())
            .field("mutability", &self.mutability())
            .field("fields", &self.fixed_fields())
            .finish()
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct ObjectFlags: u8 {
        /// instance-tracked immutability
        const IMMUTABLE = 1 << 0;
        /// set by the collector while tracing
        const MARKED = 1 << 1;
    }
}

/// Fast entry points a function may carry.
/// Call sites try the intrinsic first and fall back to the bytecode on failure.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Intrinsic {
    ObjectEquals,
    GetField(u8),
    SetField(u8),
    ListIndexGet,
    ListIndexSet,
    ListLength,
}

/// Bytecode range `[start, end)` guarded by a handler at `handler`.
/// `stack_height` counts the frame's operand slots at the handler, the exception included.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CatchRange {
    pub start: usize,
    pub end: usize,
    pub handler: usize,
    pub stack_height: usize,
}

#[derive(Debug, Clone)]
pub struct Method {
    pub selector: Selector,
    pub function: Value,
}

#[derive(Debug, Clone)]
pub struct Class {
    pub name: Arc<str>,
    /// dispatch-table identity
    pub id: u32,
    pub superclass: Option<Value>,
    pub format: InstanceFormat,
    pub methods: Vec<Method>,
}

impl Class {
    pub fn method(&self, selector: Selector) -> Option<Value> {
        self.methods
            .iter()
            .find(|method| method.selector == selector)
            .map(|method| method.function)
    }
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: Arc<str>,
    /// parameter count, the receiver included for methods
    pub arity: usize,
    pub bytecode: Arc<[u8]>,
    pub literals: Vec<Value>,
    pub catch_ranges: Vec<CatchRange>,
    pub intrinsic: Option<Intrinsic>,
}

impl Function {
    pub fn catch_range_at(&self, bcp: usize) -> Option<&CatchRange> {
        self.catch_ranges
            .iter()
            .find(|range| range.start <= bcp && bcp < range.end)
    }
}

#[derive(Debug)]
pub struct Coroutine {
    /// `None` while the coroutine is the active one, its stack then lives in the process
    pub stack: Option<Stack>,
    /// coroutine that last switched into this one
    pub caller: Value,
}

#[derive(Debug)]
pub enum ObjectBody {
    Instance(Box<[Value]>),
    Class(Class),
    Function(Function),
    Array(Box<[Value]>),
    Boxed(Value),
    LargeInteger(i128),
    Double(f64),
    Coroutine(Coroutine),
    Initializer(Value),
    String(Arc<str>),
}

impl ObjectBody {
    pub fn object_type(&self) -> ObjectType {
        match self {
            ObjectBody::Instance(_) => ObjectType::Instance,
            ObjectBody::Class(_) => ObjectType::Class,
            ObjectBody::Function(_) => ObjectType::Function,
            ObjectBody::Array(_) => ObjectType::Array,
            ObjectBody::Boxed(_) => ObjectType::Boxed,
            ObjectBody::LargeInteger(_) => ObjectType::LargeInteger,
            ObjectBody::Double(_) => ObjectType::Double,
            ObjectBody::Coroutine(_) => ObjectType::Coroutine,
            ObjectBody::Initializer(_) => ObjectType::Initializer,
            ObjectBody::String(_) => ObjectType::String,
        }
    }
}

#[derive(Debug)]
pub struct HeapObject {
    pub class: Value,
    pub flags: ObjectFlags,
    pub body: ObjectBody,
}

impl HeapObject {
    pub fn new(class: Value, body: ObjectBody) -> Self {
        Self {
            class,
            flags: ObjectFlags::empty(),
            body,
        }
    }

    pub fn is_immutable(&self) -> bool {
        self.flags.contains(ObjectFlags::IMMUTABLE)
    }

    pub fn as_class(&self) -> Option<&Class> {
        match &self.body {
            ObjectBody::Class(class) => Some(class),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Function> {
        match &self.body {
            ObjectBody::Function(function) => Some(function),
            _ => None,
        }
    }

    pub fn fields(&self) -> Option<&[Value]> {
        match &self.body {
            ObjectBody::Instance(fields) | ObjectBody::Array(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn fields_mut(&mut self) -> Option<&mut [Value]> {
        match &mut self.body {
            ObjectBody::Instance(fields) | ObjectBody::Array(fields) => Some(fields),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_format_packs_all_fields() {
        let format = InstanceFormat::new(ObjectType::Double, Mutability::Always, 3);
        assert_eq!(format.object_type(), ObjectType::Double);
        assert_eq!(format.mutability(), Mutability::Always);
        assert_eq!(format.fixed_fields(), 3);

        let instance = InstanceFormat::instance(1000);
        assert_eq!(instance.object_type(), ObjectType::Instance);
        assert_eq!(instance.mutability(), Mutability::InstanceTracked);
        assert_eq!(instance.fixed_fields(), 1000);
    }

    #[test]
    fn catch_range_is_half_open() {
        let function = Function {
            name: Arc::from("f"),
            arity: 0,
            bytecode: Arc::from(vec![0u8; 10]),
            literals: vec![],
            catch_ranges: vec![CatchRange {
                start: 2,
                end: 6,
                handler: 8,
                stack_height: 1,
            }],
            intrinsic: None,
        };
        assert!(function.catch_range_at(1).is_none());
        assert_eq!(function.catch_range_at(2).map(|r| r.handler), Some(8));
        assert!(function.catch_range_at(5).is_some());
        assert!(function.catch_range_at(6).is_none());
    }
}
