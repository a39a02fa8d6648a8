use crate::Value;

// Frame layout, relative to the frame pointer (fp indexes the caller-fp cell):
//
//   fp - 1   return kind (smi)
//   fp       caller frame pointer (smi, -1 when there is no caller)
//   fp + 1   function being executed
//   fp + 2   saved bytecode offset (smi), valid whenever state is saved
//   fp + 3.. locals and operands
//
// Arguments sit right below the return kind: the last one at fp - 2, the receiver
// (for methods) at fp - 2 - selector arity.
pub const RETURN_KIND_OFFSET: usize = 1;
pub const FUNCTION_OFFSET: usize = 1;
pub const BCP_OFFSET: usize = 2;
pub const FIRST_LOCAL_OFFSET: usize = 3;
pub const FRAME_HEADER_SLOTS: usize = 4;
/// resume continuation + frame pointer
pub const SAVED_STATE_SLOTS: usize = 2;

const NO_FRAME: i64 = -1;

/// What the return protocol does once a frame is popped.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReturnKind {
    /// complete the invoke instruction at the caller's saved bytecode offset
    Interpreted = 0,
    /// leave the interpreter with the result
    Entry = 1,
}

impl ReturnKind {
    pub fn from_value(value: Value) -> Option<Self> {
        match value.as_smi()? {
            0 => Some(ReturnKind::Interpreted),
            1 => Some(ReturnKind::Entry),
            _ => None,
        }
    }

    pub const fn to_value(self) -> Value {
        Value::smi(self as i64)
    }
}

/// Continuation recorded by a saved state.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Resume {
    /// re-dispatch the bytecode at the saved offset
    Dispatch = 0,
    /// finish a `CoroutineChange` on the stack being switched to
    CoroutineEntry = 1,
    StackCheck = 2,
    Throw = 3,
    Native = 4,
    Selector = 5,
    NoSuchMethod = 6,
    Coroutine = 7,
}

impl Resume {
    const ALL: [Resume; 8] = [
        Resume::Dispatch,
        Resume::CoroutineEntry,
        Resume::StackCheck,
        Resume::Throw,
        Resume::Native,
        Resume::Selector,
        Resume::NoSuchMethod,
        Resume::Coroutine,
    ];

    pub fn from_value(value: Value) -> Option<Self> {
        let index = usize::try_from(value.as_smi()?).ok()?;
        Self::ALL.get(index).copied()
    }

    pub const fn to_value(self) -> Value {
        Value::smi(self as i64)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SavedState {
    pub resume: Resume,
    pub frame_pointer: usize,
}

/// Decoded view of one frame header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_pointer: usize,
    pub return_kind: ReturnKind,
    pub caller: Option<usize>,
    pub function: Value,
    pub bcp: usize,
}

/// Operand and frame stack of one coroutine.
///
/// Every slot holds a smi or a reference, so the collector can scan `slots()`
/// without any side information.
#[derive(Debug, Clone, Default)]
pub struct Stack {
    slots: Vec<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct StackCreateInfo {
    pub size: usize,
}

impl Stack {
    #[must_use]
    pub fn new(info: &StackCreateInfo) -> Self {
        Self {
            slots: Vec::with_capacity(info.size),
        }
    }

    /// Number of live slots, the stack pointer.
    #[inline]
    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    /// Makes room for at least `additional` more slots without reallocating.
    pub fn reserve(&mut self, additional: usize) {
        self.slots.reserve(additional);
    }

    #[inline]
    pub fn slots(&self) -> &[Value] {
        &self.slots
    }

    #[inline]
    pub fn push(&mut self, value: Value) {
        debug_assert!(!value.is_failure(), "failures never reach a stack slot");
        self.slots.push(value);
    }

    #[inline]
    pub fn pop(&mut self) -> Option<Value> {
        self.slots.pop()
    }

    /// Absolute slot access.
    #[inline]
    pub fn get(&self, index: usize) -> Option<Value> {
        self.slots.get(index).copied()
    }

    #[inline]
    pub fn set(&mut self, index: usize, value: Value) -> Option<()> {
        *self.slots.get_mut(index)? = value;
        Some(())
    }

    /// Slot `index` counted from the top, 0 is the most recent push.
    #[inline]
    pub fn local(&self, index: usize) -> Option<Value> {
        let position = self.depth().checked_sub(index + 1)?;
        self.get(position)
    }

    #[inline]
    pub fn set_local(&mut self, index: usize, value: Value) -> Option<()> {
        let position = self.depth().checked_sub(index + 1)?;
        self.set(position, value)
    }

    pub fn drop_n(&mut self, count: usize) -> Option<()> {
        let depth = self.depth().checked_sub(count)?;
        self.slots.truncate(depth);
        Some(())
    }

    pub fn truncate(&mut self, depth: usize) {
        self.slots.truncate(depth);
    }

    /// Pushes a frame header and returns the new frame pointer.
    pub fn push_frame(
        &mut self,
        kind: ReturnKind,
        caller: Option<usize>,
        function: Value,
    ) -> usize {
        self.push(kind.to_value());
        self.push(encode_frame_pointer(caller));
        let fp = self.depth() - 1;
        self.push(function);
        self.push(Value::smi(0));
        fp
    }

    pub fn frame(&self, fp: usize) -> Option<Frame> {
        let return_kind = ReturnKind::from_value(self.get(fp.checked_sub(RETURN_KIND_OFFSET)?)?)?;
        let caller = decode_frame_pointer(self.get(fp)?)?;
        let function = self.get(fp + FUNCTION_OFFSET)?;
        let bcp = usize::try_from(self.get(fp + BCP_OFFSET)?.as_smi()?).ok()?;
        Some(Frame {
            frame_pointer: fp,
            return_kind,
            caller,
            function,
            bcp,
        })
    }

    pub fn set_frame_bcp(&mut self, fp: usize, bcp: usize) -> Option<()> {
        self.set(fp + BCP_OFFSET, Value::smi(bcp as i64))
    }

    /// Walks frames from `fp` outwards, stopping after the first entry frame.
    pub fn frames(&self, fp: usize) -> Frames<'_> {
        Frames {
            stack: self,
            next: Some(fp),
        }
    }

    pub fn save_state(&mut self, resume: Resume, fp: usize) {
        self.push(resume.to_value());
        self.push(encode_frame_pointer(Some(fp)));
    }

    pub fn saved_state(&self) -> Option<SavedState> {
        let frame_pointer = decode_frame_pointer(self.local(0)?)??;
        let resume = Resume::from_value(self.local(1)?)?;
        Some(SavedState {
            resume,
            frame_pointer,
        })
    }

    pub fn restore_state(&mut self) -> Option<SavedState> {
        let state = self.saved_state()?;
        self.drop_n(SAVED_STATE_SLOTS)?;
        Some(state)
    }
}

pub struct Frames<'a> {
    stack: &'a Stack,
    next: Option<usize>,
}

impl Iterator for Frames<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        let frame = self.stack.frame(self.next?)?;
        self.next = match frame.return_kind {
            ReturnKind::Entry => None,
            ReturnKind::Interpreted => frame.caller,
        };
        Some(frame)
    }
}

fn encode_frame_pointer(fp: Option<usize>) -> Value {
    Value::smi(fp.map_or(NO_FRAME, |fp| fp as i64))
}

fn decode_frame_pointer(value: Value) -> Option<Option<usize>> {
    match value.as_smi()? {
        NO_FRAME => Some(None),
        fp => usize::try_from(fp).ok().map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HeapRef;

    fn stack() -> Stack {
        Stack::new(&StackCreateInfo { size: 16 })
    }

    #[test]
    fn locals_are_addressed_from_the_top() {
        let mut stack = stack();
        stack.push(Value::smi(1));
        stack.push(Value::smi(2));
        stack.push(Value::smi(3));

        assert_eq!(stack.local(0), Some(Value::smi(3)));
        assert_eq!(stack.local(2), Some(Value::smi(1)));
        assert_eq!(stack.local(3), None);

        stack.set_local(1, Value::smi(20)).unwrap();
        assert_eq!(stack.get(1), Some(Value::smi(20)));

        stack.drop_n(2).unwrap();
        assert_eq!(stack.depth(), 1);
        assert!(stack.drop_n(2).is_none(), "dropping past the bottom must fail");
    }

    #[test]
    fn frame_header_round_trips() {
        let function = Value::from_ref(HeapRef::program(4));
        let mut stack = stack();
        stack.push(Value::smi(10));
        let outer = stack.push_frame(ReturnKind::Entry, None, function);
        stack.push(Value::smi(11));
        let inner = stack.push_frame(ReturnKind::Interpreted, Some(outer), function);
        stack.set_frame_bcp(inner, 7).unwrap();

        let frame = stack.frame(inner).unwrap();
        assert_eq!(frame.caller, Some(outer));
        assert_eq!(frame.return_kind, ReturnKind::Interpreted);
        assert_eq!(frame.function, function);
        assert_eq!(frame.bcp, 7);

        let walked: Vec<usize> = stack.frames(inner).map(|f| f.frame_pointer).collect();
        assert_eq!(walked, vec![inner, outer]);
    }

    #[test]
    fn saved_state_sits_on_top() {
        let mut stack = stack();
        let fp = stack.push_frame(ReturnKind::Entry, None, Value::zero());
        let depth = stack.depth();
        stack.save_state(Resume::Throw, fp);

        assert_eq!(stack.depth(), depth + SAVED_STATE_SLOTS);
        assert!(stack.slots().iter().all(|slot| slot.is_smi() || slot.is_reference()));

        let state = stack.restore_state().unwrap();
        assert_eq!(state.resume, Resume::Throw);
        assert_eq!(state.frame_pointer, fp);
        assert_eq!(stack.depth(), depth);
    }
}
