use crate::{Intrinsic, Program, Selector, Value};

/// Number of entries in the primary lookup cache, a power of two.
pub const PRIMARY_CACHE_SIZE: usize = 512;

/// Result of one `(class, selector)` method lookup.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub class: Value,
    pub selector: Selector,
    pub target: Value,
    pub intrinsic: Option<Intrinsic>,
}

impl CacheEntry {
    /// Never matches a real class, classes are references.
    pub const EMPTY: CacheEntry = CacheEntry {
        class: Value::zero(),
        selector: Selector::from_raw(0),
        target: Value::zero(),
        intrinsic: None,
    };

    #[inline]
    pub fn matches(&self, class: Value, selector: Selector) -> bool {
        self.class == class && self.selector == selector
    }
}

/// Per-process direct-mapped cache for unfold call sites.
///
/// Entries only memoize lookups against the read-only program, so a stale or
/// cleared cache changes speed, never results.
#[derive(Debug, Clone)]
pub struct LookupCache {
    entries: Box<[CacheEntry]>,
    hits: u64,
    misses: u64,
}

impl Default for LookupCache {
    fn default() -> Self {
        Self::new()
    }
}

impl LookupCache {
    pub fn new() -> Self {
        Self {
            entries: vec![CacheEntry::EMPTY; PRIMARY_CACHE_SIZE].into_boxed_slice(),
            hits: 0,
            misses: 0,
        }
    }

    #[inline]
    pub fn primary_index(class: Value, selector: Selector) -> usize {
        ((class.raw() ^ u64::from(selector.raw())) as usize) & (PRIMARY_CACHE_SIZE - 1)
    }

    #[inline]
    pub fn entry(&self, index: usize) -> CacheEntry {
        self.entries[index & (PRIMARY_CACHE_SIZE - 1)]
    }

    pub fn set(&mut self, index: usize, entry: CacheEntry) {
        self.entries[index & (PRIMARY_CACHE_SIZE - 1)] = entry;
    }

    pub fn record_hit(&mut self) {
        self.hits += 1;
    }

    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    /// `(hits, misses)` since the cache was created.
    pub fn counters(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }

    pub fn clear(&mut self) {
        self.entries.fill(CacheEntry::EMPTY);
    }

    /// Slow-path lookup. Classes without the method resolve to the
    /// noSuchMethod trampoline.
    pub fn resolve(program: &Program, class: Value, selector: Selector) -> CacheEntry {
        match program.lookup_method(class, selector) {
            Some(target) => CacheEntry {
                class,
                selector,
                target,
                intrinsic: program.intrinsic(target),
            },
            None => CacheEntry {
                class,
                selector,
                target: program.specials.no_such_method_function,
                intrinsic: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Opcode, ProgramBuilder, ProgramCreateInfo};

    #[test]
    fn resolve_falls_back_to_no_such_method() {
        let mut builder = ProgramBuilder::new(ProgramCreateInfo::default()).unwrap();
        let object = builder.specials().object_class;
        let point = builder.class("Point", Some(object), 1).unwrap();
        let selector = builder.getter("x");
        let missing = builder.getter("y");
        let getter = builder
            .function_from_ops("x", 1, &[Opcode::LoadLiteral0, Opcode::Return])
            .unwrap();
        builder.define_method(point, selector, getter).unwrap();
        let program = builder.finish().unwrap();

        let hit = LookupCache::resolve(&program, point, selector);
        assert_eq!(hit.target, getter);
        assert!(hit.matches(point, selector));

        let miss = LookupCache::resolve(&program, point, missing);
        assert_eq!(miss.target, program.specials.no_such_method_function);
    }

    #[test]
    fn clearing_empties_every_slot() {
        let mut cache = LookupCache::new();
        let class = Value::from_ref(crate::HeapRef::program(3));
        let selector = Selector::method(9, 1);
        let index = LookupCache::primary_index(class, selector);
        cache.set(
            index,
            CacheEntry {
                class,
                selector,
                target: Value::zero(),
                intrinsic: None,
            },
        );
        assert!(cache.entry(index).matches(class, selector));
        cache.clear();
        assert!(!cache.entry(index).matches(class, selector));
        assert!(index < PRIMARY_CACHE_SIZE);
    }
}
