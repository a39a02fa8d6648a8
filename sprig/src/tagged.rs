//! Value: any machine word the interpreter touches, small integer/reference/failure
//!
//! Small integers ("smis") keep the low bit clear and store the integer shifted by one.
//! References and failures share the low bit set and differ in bit 1. Failures are
//! only ever produced by allocation and native calls, they never reach a stack slot.
use std::fmt;

#[allow(unused)]
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ValueTag {
    Smi = 0b0,
    Reference = 0b01,
    Failure = 0b11,
}

pub const SMI_TAG_MASK: u64 = 0b1;
pub const SMI_TAG_SIZE: u32 = 1;
pub const TAG_MASK: u64 = 0b11;

const SPACE_BIT: u64 = 0b100;
const INDEX_SHIFT: u32 = 3;
const FAILURE_SHIFT: u32 = 2;

/// Which arena a reference points into.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Space {
    /// mutable objects owned by one process
    Process,
    /// read-only objects shared by every process of a program
    Program,
}

/// Untagged form of a reference.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct HeapRef {
    pub space: Space,
    pub index: u32,
}

impl HeapRef {
    pub const fn process(index: u32) -> Self {
        Self {
            space: Space::Process,
            index,
        }
    }

    pub const fn program(index: u32) -> Self {
        Self {
            space: Space::Program,
            index,
        }
    }
}

/// Failure kinds returned by allocation and natives.
/// `RetryAfterGc` is kind zero, every other kind is converted into an exception object.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Failure {
    RetryAfterGc = 0,
    WrongArgumentType = 1,
    IndexOutOfBounds = 2,
    IllegalState = 3,
    DivisionByZero = 4,
}

impl Failure {
    const ALL: [Failure; 5] = [
        Failure::RetryAfterGc,
        Failure::WrongArgumentType,
        Failure::IndexOutOfBounds,
        Failure::IllegalState,
        Failure::DivisionByZero,
    ];
}

/// A generic Value
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Value(u64);

impl Value {
    /// largest integer representable as a smi
    pub const SMI_MAX: i64 = i64::MAX >> SMI_TAG_SIZE;
    /// smallest integer representable as a smi
    pub const SMI_MIN: i64 = i64::MIN >> SMI_TAG_SIZE;

    /// Tags `value` as a small integer.
    /// Values outside `SMI_MIN..=SMI_MAX` lose their top bit, use [`Value::try_smi`] when unsure.
    pub const fn smi(value: i64) -> Self {
        debug_assert!(value >= Self::SMI_MIN && value <= Self::SMI_MAX);
        Self(value.cast_unsigned() << SMI_TAG_SIZE)
    }

    pub const fn try_smi(value: i64) -> Option<Self> {
        if value >= Self::SMI_MIN && value <= Self::SMI_MAX {
            Some(Self::smi(value))
        } else {
            None
        }
    }

    pub fn try_smi_i128(value: i128) -> Option<Self> {
        i64::try_from(value).ok().and_then(Self::try_smi)
    }

    pub const fn zero() -> Self {
        Self(0)
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn from_ref(reference: HeapRef) -> Self {
        let space = match reference.space {
            Space::Process => 0,
            Space::Program => SPACE_BIT,
        };
        Self(((reference.index as u64) << INDEX_SHIFT) | space | ValueTag::Reference as u64)
    }

    pub const fn failure(failure: Failure) -> Self {
        Self(((failure as u64) << FAILURE_SHIFT) | ValueTag::Failure as u64)
    }

    pub const fn is_smi(self) -> bool {
        self.0 & SMI_TAG_MASK == ValueTag::Smi as u64
    }

    pub const fn is_reference(self) -> bool {
        self.0 & TAG_MASK == ValueTag::Reference as u64
    }

    pub const fn is_failure(self) -> bool {
        self.0 & TAG_MASK == ValueTag::Failure as u64
    }

    pub const fn as_smi(self) -> Option<i64> {
        if self.is_smi() {
            Some(self.smi_unchecked())
        } else {
            None
        }
    }

    /// Arithmetic shift, only meaningful when [`Value::is_smi`] holds.
    pub const fn smi_unchecked(self) -> i64 {
        self.0.cast_signed() >> SMI_TAG_SIZE
    }

    pub const fn as_heap_ref(self) -> Option<HeapRef> {
        if !self.is_reference() {
            return None;
        }
        let index = (self.0 >> INDEX_SHIFT) as u32;
        if self.0 & SPACE_BIT == 0 {
            Some(HeapRef::process(index))
        } else {
            Some(HeapRef::program(index))
        }
    }

    pub fn as_failure(self) -> Option<Failure> {
        if !self.is_failure() {
            return None;
        }
        Failure::ALL.get((self.0 >> FAILURE_SHIFT) as usize).copied()
    }

    /// Payload of a reference with the tag cleared, always word aligned.
    pub const fn address(self) -> u64 {
        self.0 & !TAG_MASK
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(n) = self.as_smi() {
            return write!(f, "Smi({n})");
        }
        if let Some(reference) = self.as_heap_ref() {
            return match reference.space {
                Space::Process => write!(f, "Ref(process#{})", reference.index),
                Space::Program => write!(f, "Ref(program#{})", reference.index),
            };
        }
        match self.as_failure() {
            Some(failure) => write!(f, "Failure({failure:?})"),
            None => write!(f, "Value({:#x})", self.0),
        }
    }
}

#[cfg(test)]
mod value_tests {
    use super::*;

    #[test]
    fn smi_round_trip_covers_range_edges() {
        let samples = [
            0,
            1,
            -1,
            42,
            -42,
            Value::SMI_MAX,
            Value::SMI_MIN,
            Value::SMI_MAX - 1,
            Value::SMI_MIN + 1,
            i32::MAX as i64,
            i32::MIN as i64,
        ];
        for n in samples {
            let value = Value::smi(n);
            assert!(value.is_smi(), "{n} should be tagged as smi");
            assert_eq!(value.as_smi(), Some(n), "round trip failed for {n}");
        }
    }

    #[test]
    fn smi_round_trip_strided_sweep() {
        let step = Value::SMI_MAX / 997;
        let mut n = Value::SMI_MIN;
        while n < Value::SMI_MAX - step {
            assert_eq!(Value::smi(n).smi_unchecked(), n);
            n += step;
        }
    }

    #[test]
    fn try_smi_rejects_out_of_range() {
        assert!(Value::try_smi(Value::SMI_MAX + 1).is_none());
        assert!(Value::try_smi(Value::SMI_MIN - 1).is_none());
        assert!(Value::try_smi_i128(i128::from(i64::MAX) + 1).is_none());
        assert_eq!(Value::try_smi_i128(-7), Some(Value::smi(-7)));
    }

    #[test]
    fn references_are_context_free() {
        let process = Value::from_ref(HeapRef::process(17));
        let program = Value::from_ref(HeapRef::program(17));

        assert!(process.is_reference() && !process.is_smi() && !process.is_failure());
        assert_eq!(process.as_heap_ref(), Some(HeapRef::process(17)));
        assert_eq!(program.as_heap_ref(), Some(HeapRef::program(17)));
        assert_ne!(process, program);
        assert_eq!(process.address() % 4, 0, "address must be aligned");
    }

    #[test]
    fn failures_are_distinct_from_references() {
        for failure in Failure::ALL {
            let value = Value::failure(failure);
            assert!(value.is_failure());
            assert!(!value.is_reference());
            assert!(value.as_heap_ref().is_none());
            assert_eq!(value.as_failure(), Some(failure));
        }
        assert_eq!(Value::failure(Failure::RetryAfterGc).raw() >> FAILURE_SHIFT, 0);
    }
}
