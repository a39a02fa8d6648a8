use log::debug;

use crate::{
    Failure, HeapObject, HeapRef, ObjectBody, ObjectFlags, Space, Value, Visitable, Visitor,
};

/// log2 of the address range one remembered-set card covers (16 objects)
pub const CARD_SIZE_LOG2: u32 = 7;

#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Number of live objects the heap admits before allocation asks for a collection.
    pub capacity: usize,
    /// Survivor ratio (0.0 - 1.0) after a collection above which the capacity grows.
    pub growth_threshold: f64,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            capacity: 4096,
            growth_threshold: 0.75,
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct GarbageCollectionStats {
    pub collections: usize,
    pub freed: usize,
    pub survivors: usize,
    /// dirty cards found at the start of the last collection
    pub dirty_cards: usize,
}

/// Card-marking remembered set filled by the write barrier.
/// Records are idempotent, the set is consulted and never counted.
///
/// [`Heap::collect`] is a full collection and traces from the roots alone, so
/// it only reports the dirty cards and then clears them. The cards are the
/// old-to-young edges a generational collector would scan as extra roots.
#[derive(Debug, Clone, Default)]
pub struct RememberedSet {
    cards: Vec<u8>,
}

impl RememberedSet {
    pub const DIRTY: u8 = 1;

    pub fn card_index(object: Value) -> usize {
        (object.address() >> CARD_SIZE_LOG2) as usize
    }

    pub fn record(&mut self, object: Value) {
        let card = Self::card_index(object);
        if card >= self.cards.len() {
            self.cards.resize(card + 1, 0);
        }
        self.cards[card] = Self::DIRTY;
    }

    pub fn is_recorded(&self, object: Value) -> bool {
        self.cards
            .get(Self::card_index(object))
            .is_some_and(|&card| card != 0)
    }

    pub fn dirty_cards(&self) -> usize {
        self.cards.iter().filter(|&&card| card != 0).count()
    }

    pub fn clear(&mut self) {
        self.cards.iter_mut().for_each(|card| *card = 0);
    }
}

/// Process-private object arena, addressed through [`Space::Process`] references.
#[derive(Debug)]
pub struct Heap {
    objects: Vec<Option<HeapObject>>,
    free: Vec<u32>,
    live: usize,
    settings: HeapSettings,
    remembered_set: RememberedSet,
    stats: GarbageCollectionStats,
}

impl Heap {
    pub fn new(settings: HeapSettings) -> Self {
        Self {
            objects: Vec::with_capacity(settings.capacity),
            free: Vec::new(),
            live: 0,
            settings,
            remembered_set: RememberedSet::default(),
            stats: GarbageCollectionStats::default(),
        }
    }

    /// Places `body` in the arena or asks for a collection first.
    pub fn allocate(&mut self, class: Value, body: ObjectBody) -> Result<Value, Failure> {
        if self.live >= self.settings.capacity {
            return Err(Failure::RetryAfterGc);
        }
        let object = HeapObject::new(class, body);
        let index = match self.free.pop() {
            Some(index) => {
                self.objects[index as usize] = Some(object);
                index
            }
            None => {
                self.objects.push(Some(object));
                (self.objects.len() - 1) as u32
            }
        };
        self.live += 1;
        Ok(Value::from_ref(HeapRef::process(index)))
    }

    fn slot(value: Value) -> Option<usize> {
        match value.as_heap_ref()? {
            HeapRef {
                space: Space::Process,
                index,
            } => Some(index as usize),
            _ => None,
        }
    }

    pub fn get(&self, value: Value) -> Option<&HeapObject> {
        self.objects.get(Self::slot(value)?)?.as_ref()
    }

    pub fn get_mut(&mut self, value: Value) -> Option<&mut HeapObject> {
        self.objects.get_mut(Self::slot(value)?)?.as_mut()
    }

    pub fn live(&self) -> usize {
        self.live
    }

    pub fn capacity(&self) -> usize {
        self.settings.capacity
    }

    pub fn stats(&self) -> GarbageCollectionStats {
        self.stats
    }

    pub fn remembered_set(&self) -> &RememberedSet {
        &self.remembered_set
    }

    /// Records `object` as written to unless the stored value is a smi.
    #[inline]
    pub fn write_barrier(&mut self, object: Value, stored: Value) {
        if !stored.is_smi() {
            self.remembered_set.record(object);
        }
    }

    /// Full non-moving mark and sweep. Only process-space references are traced,
    /// program objects are immortal and never point into a process heap.
    pub fn collect(&mut self, roots: &[Value]) -> GarbageCollectionStats {
        let dirty_cards = self.remembered_set.dirty_cards();
        let mut marker = Marker {
            worklist: Vec::new(),
        };
        roots.iter().for_each(|&root| marker.visit(root));

        while let Some(index) = marker.worklist.pop() {
            let Some(Some(object)) = self.objects.get_mut(index) else {
                continue;
            };
            if object.flags.contains(ObjectFlags::MARKED) {
                continue;
            }
            object.flags.insert(ObjectFlags::MARKED);
            object.visit_edges(&mut marker);
        }

        let mut freed = 0;
        for (index, slot) in self.objects.iter_mut().enumerate() {
            match slot {
                Some(object) if object.flags.contains(ObjectFlags::MARKED) => {
                    object.flags.remove(ObjectFlags::MARKED);
                }
                Some(_) => {
                    *slot = None;
                    self.free.push(index as u32);
                    freed += 1;
                }
                None => (),
            }
        }
        self.live -= freed;
        self.remembered_set.clear();

        let threshold = self.settings.capacity as f64 * self.settings.growth_threshold;
        if self.live as f64 >= threshold {
            let grown = (self.settings.capacity * 2).max(self.live + 1);
            debug!("heap: growing capacity {} -> {}", self.settings.capacity, grown);
            self.settings.capacity = grown;
        }

        self.stats.collections += 1;
        self.stats.freed = freed;
        self.stats.survivors = self.live;
        self.stats.dirty_cards = dirty_cards;
        debug!(
            "heap: collection #{} freed {} kept {} ({} dirty cards)",
            self.stats.collections, freed, self.live, dirty_cards
        );
        self.stats
    }
}

struct Marker {
    worklist: Vec<usize>,
}

impl Visitor for Marker {
    fn visit(&mut self, value: Value) {
        if let Some(index) = Heap::slot(value) {
            self.worklist.push(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap(capacity: usize) -> Heap {
        Heap::new(HeapSettings {
            capacity,
            ..Default::default()
        })
    }

    #[test]
    fn allocation_fails_with_retry_when_full() {
        let mut heap = heap(2);
        heap.allocate(Value::zero(), ObjectBody::Boxed(Value::smi(1)))
            .unwrap();
        heap.allocate(Value::zero(), ObjectBody::Boxed(Value::smi(2)))
            .unwrap();
        assert_eq!(
            heap.allocate(Value::zero(), ObjectBody::Boxed(Value::smi(3))),
            Err(Failure::RetryAfterGc)
        );
    }

    #[test]
    fn collection_keeps_reachable_and_reuses_slots() {
        let mut heap = heap(8);
        let inner = heap
            .allocate(Value::zero(), ObjectBody::Boxed(Value::smi(5)))
            .unwrap();
        let outer = heap
            .allocate(Value::zero(), ObjectBody::Array(vec![inner].into()))
            .unwrap();
        let garbage = heap
            .allocate(Value::zero(), ObjectBody::LargeInteger(1 << 70))
            .unwrap();

        let stats = heap.collect(&[outer, Value::smi(3)]);
        assert_eq!(stats.freed, 1);
        assert_eq!(heap.live(), 2);
        assert!(heap.get(inner).is_some());
        assert!(heap.get(garbage).is_none());

        let reused = heap
            .allocate(Value::zero(), ObjectBody::Double(1.5))
            .unwrap();
        assert_eq!(reused, garbage, "freed slot should be reused");
    }

    #[test]
    fn write_barrier_ignores_smis() {
        let mut heap = heap(4);
        let object = heap
            .allocate(Value::zero(), ObjectBody::Boxed(Value::smi(0)))
            .unwrap();
        let other = heap
            .allocate(Value::zero(), ObjectBody::Boxed(Value::smi(0)))
            .unwrap();

        heap.write_barrier(object, Value::smi(9));
        assert!(!heap.remembered_set().is_recorded(object));

        heap.write_barrier(object, other);
        heap.write_barrier(object, other);
        assert!(heap.remembered_set().is_recorded(object));
        assert_eq!(heap.remembered_set().dirty_cards(), 1);

        heap.collect(&[object, other]);
        assert_eq!(heap.remembered_set().dirty_cards(), 0);
    }

    #[test]
    fn dirty_cards_are_reported_not_traced() {
        let mut heap = heap(4);
        let object = heap
            .allocate(Value::zero(), ObjectBody::Boxed(Value::smi(0)))
            .unwrap();
        let other = heap
            .allocate(Value::zero(), ObjectBody::Boxed(Value::smi(0)))
            .unwrap();
        heap.write_barrier(object, other);

        let stats = heap.collect(&[]);
        assert_eq!(stats.dirty_cards, 1);
        assert_eq!(stats.freed, 2, "a dirty card keeps nothing alive");
    }

    #[test]
    fn survivors_above_threshold_grow_capacity() {
        let mut heap = heap(4);
        let roots: Vec<Value> = (0..4)
            .map(|n| {
                heap.allocate(Value::zero(), ObjectBody::Boxed(Value::smi(n)))
                    .unwrap()
            })
            .collect();
        heap.collect(&roots);
        assert!(heap.capacity() > 4);
        assert!(heap.allocate(Value::zero(), ObjectBody::Double(0.0)).is_ok());
    }
}
