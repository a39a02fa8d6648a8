use std::{collections::HashMap, fmt, sync::Arc};

use parking_lot::RwLock;

use crate::Value;

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SelectorKind {
    Method = 0,
    Getter = 1,
    Setter = 2,
}

/// Packed call-site key: `id:22 | kind:2 | arity:8`.
///
/// For table call sites the id field holds the dispatch-table row offset instead of
/// the name identity, see [`crate::Program::table_selector`].
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Selector(u32);

impl Selector {
    pub const ARITY_BITS: u32 = 8;
    pub const KIND_SHIFT: u32 = 8;
    pub const KIND_BITS: u32 = 2;
    pub const ID_SHIFT: u32 = 10;
    pub const ID_BITS: u32 = 22;

    const ARITY_MASK: u32 = (1 << Self::ARITY_BITS) - 1;
    const KIND_MASK: u32 = (1 << Self::KIND_BITS) - 1;
    pub const MAX_ID: u32 = (1 << Self::ID_BITS) - 1;

    pub const fn new(id: u32, kind: SelectorKind, arity: u8) -> Self {
        debug_assert!(id <= Self::MAX_ID);
        Self((id << Self::ID_SHIFT) | ((kind as u32) << Self::KIND_SHIFT) | arity as u32)
    }

    pub const fn method(id: u32, arity: u8) -> Self {
        Self::new(id, SelectorKind::Method, arity)
    }

    pub const fn getter(id: u32) -> Self {
        Self::new(id, SelectorKind::Getter, 0)
    }

    pub const fn setter(id: u32) -> Self {
        Self::new(id, SelectorKind::Setter, 1)
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn arity(self) -> usize {
        (self.0 & Self::ARITY_MASK) as usize
    }

    pub const fn id(self) -> u32 {
        self.0 >> Self::ID_SHIFT
    }

    pub const fn kind(self) -> SelectorKind {
        match (self.0 >> Self::KIND_SHIFT) & Self::KIND_MASK {
            1 => SelectorKind::Getter,
            2 => SelectorKind::Setter,
            _ => SelectorKind::Method,
        }
    }

    pub const fn with_id(self, id: u32) -> Self {
        Self::new(id, self.kind(), self.arity() as u8)
    }

    /// Selectors travel through stack slots as smis.
    pub const fn to_smi(self) -> Value {
        Value::smi(self.0 as i64)
    }

    pub fn from_smi(value: Value) -> Option<Self> {
        value
            .as_smi()
            .and_then(|raw| u32::try_from(raw).ok())
            .map(Self)
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Selector({}, {:?}/{})", self.id(), self.kind(), self.arity())
    }
}

struct SelectorNamesImpl {
    names: Vec<Arc<str>>,
    ids: HashMap<Arc<str>, u32>,
}

/// Shared name table for selector ids.
/// The builder interns while loading, log output and reflection read it afterwards.
#[derive(Clone)]
pub struct SelectorNames(Arc<RwLock<SelectorNamesImpl>>);

impl SelectorNames {
    pub fn new() -> Self {
        Self(Arc::new(RwLock::new(SelectorNamesImpl {
            names: Vec::new(),
            ids: HashMap::new(),
        })))
    }

    pub fn intern(&self, name: &str) -> u32 {
        if let Some(&id) = self.0.read().ids.get(name) {
            return id;
        }
        let mut inner = self.0.write();
        // another writer may have raced us between the two locks
        if let Some(&id) = inner.ids.get(name) {
            return id;
        }
        let id = inner.names.len() as u32;
        let name: Arc<str> = Arc::from(name);
        inner.names.push(name.clone());
        inner.ids.insert(name, id);
        id
    }

    pub fn lookup(&self, name: &str) -> Option<u32> {
        self.0.read().ids.get(name).copied()
    }

    pub fn name(&self, id: u32) -> Option<Arc<str>> {
        self.0.read().names.get(id as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.0.read().names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SelectorNames {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SelectorNames {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectorNames")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_fields_round_trip() {
        let selector = Selector::new(1234, SelectorKind::Setter, 1);
        assert_eq!(selector.id(), 1234);
        assert_eq!(selector.kind(), SelectorKind::Setter);
        assert_eq!(selector.arity(), 1);

        let moved = selector.with_id(7);
        assert_eq!(moved.id(), 7);
        assert_eq!(moved.kind(), SelectorKind::Setter);
        assert_eq!(moved.arity(), 1);
    }

    #[test]
    fn selector_survives_smi_encoding() {
        let selector = Selector::new(Selector::MAX_ID, SelectorKind::Getter, 0);
        assert_eq!(Selector::from_smi(selector.to_smi()), Some(selector));
        assert_eq!(Selector::from_smi(Value::smi(-1)), None);
    }

    #[test]
    fn interning_is_stable_across_clones() {
        let names = SelectorNames::new();
        let shared = names.clone();
        let a = names.intern("foo");
        let b = shared.intern("bar");
        assert_eq!(names.intern("foo"), a);
        assert_ne!(a, b);
        assert_eq!(shared.lookup("bar"), Some(b));
        assert_eq!(names.name(a).as_deref(), Some("foo"));
        assert_eq!(names.len(), 2);
    }
}
