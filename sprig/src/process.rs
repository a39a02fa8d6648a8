use std::{
    mem,
    sync::{
        Arc,
        atomic::{AtomicU8, AtomicUsize, Ordering},
    },
};

use bitflags::bitflags;
use log::debug;

use crate::{
    Coroutine, Failure, Heap, HeapObject, HeapSettings, LookupCache, ObjectBody, ObjectFlags,
    Program, Resume, ReturnKind, Space, Stack, StackCreateInfo, Value, VmError,
};

bitflags! {
    /// Requests delivered to a running process through its stack limit.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
    pub struct Interrupts: u8 {
        const PREEMPT = 1 << 0;
        const DEBUG = 1 << 1;
    }
}

/// Cross-thread handle used to stop a running process at its next stack check.
///
/// Setting an interrupt drops the effective limit to zero so the next check
/// takes the slow path, where the runtime restores the real limit and reports
/// the interrupt.
#[derive(Debug, Default)]
pub struct ProcessSignals {
    limit: AtomicUsize,
    interrupts: AtomicU8,
}

impl ProcessSignals {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: AtomicUsize::new(limit),
            interrupts: AtomicU8::new(0),
        }
    }

    #[inline]
    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    pub fn set_limit(&self, limit: usize) {
        self.limit.store(limit, Ordering::Release);
    }

    pub fn interrupt(&self, interrupts: Interrupts) {
        self.interrupts.fetch_or(interrupts.bits(), Ordering::AcqRel);
        self.limit.store(0, Ordering::Release);
    }

    pub fn preempt(&self) {
        self.interrupt(Interrupts::PREEMPT);
    }

    pub fn debug_interrupt(&self) {
        self.interrupt(Interrupts::DEBUG);
    }

    /// Clears and returns the pending interrupts.
    pub fn take_interrupts(&self) -> Interrupts {
        Interrupts::from_bits_truncate(self.interrupts.swap(0, Ordering::AcqRel))
    }
}

#[derive(Debug, Clone)]
pub struct ProcessCreateInfo {
    /// Initial stack size in slots, also the size of every new coroutine stack.
    pub stack_size: usize,
    /// The stack never grows past this many slots.
    pub max_stack_size: usize,
    pub heap: HeapSettings,
}

impl Default for ProcessCreateInfo {
    fn default() -> Self {
        Self {
            stack_size: 1024,
            max_stack_size: 64 * 1024,
            heap: HeapSettings::default(),
        }
    }
}

/// One isolated execution context: a heap, the active stack and a lookup cache,
/// all referring to a shared [`Program`].
#[derive(Debug)]
pub struct Process {
    program: Arc<Program>,
    pub heap: Heap,
    /// stack of the current coroutine
    pub stack: Stack,
    /// currently running coroutine
    pub coroutine: Value,
    root_coroutine: Value,
    pub statics: Vec<Value>,
    pub lookup_cache: LookupCache,
    stack_limit: usize,
    initial_stack_size: usize,
    max_stack_size: usize,
    signals: Arc<ProcessSignals>,
}

impl Process {
    pub fn new(program: Arc<Program>, info: &ProcessCreateInfo) -> Result<Self, Failure> {
        let mut heap = Heap::new(info.heap.clone());
        let null = program.specials.null;
        let root_coroutine = heap.allocate(
            program.specials.coroutine_class,
            ObjectBody::Coroutine(Coroutine {
                stack: None,
                caller: null,
            }),
        )?;
        let statics = program.statics().to_vec();
        let stack_size = info.stack_size.max(1);
        Ok(Self {
            program,
            heap,
            stack: Stack::new(&StackCreateInfo { size: stack_size }),
            coroutine: root_coroutine,
            root_coroutine,
            statics,
            lookup_cache: LookupCache::new(),
            stack_limit: stack_size,
            initial_stack_size: stack_size,
            max_stack_size: info.max_stack_size.max(stack_size),
            signals: Arc::new(ProcessSignals::new(stack_size)),
        })
    }

    #[inline]
    pub fn program(&self) -> &Arc<Program> {
        &self.program
    }

    pub fn signals(&self) -> Arc<ProcessSignals> {
        self.signals.clone()
    }

    /// Slot count the stack may reach before a check takes the slow path.
    pub fn stack_limit(&self) -> usize {
        self.stack_limit
    }

    pub fn object(&self, value: Value) -> Option<&HeapObject> {
        match value.as_heap_ref()?.space {
            Space::Program => self.program.get(value),
            Space::Process => self.heap.get(value),
        }
    }

    /// Mutable access, only process-space objects can be written.
    pub fn object_mut(&mut self, value: Value) -> Result<&mut HeapObject, VmError> {
        match value.as_heap_ref().map(|reference| reference.space) {
            Some(Space::Process) => self.heap.get_mut(value).ok_or(VmError::NotAnObject(value)),
            Some(Space::Program) => Err(VmError::ReadOnlyObject(value)),
            None => Err(VmError::NotAnObject(value)),
        }
    }

    /// Class of any value, smis included.
    pub fn class_of(&self, value: Value) -> Option<Value> {
        if value.is_smi() {
            return Some(self.program.specials.smi_class);
        }
        self.object(value).map(|object| object.class)
    }

    pub fn is_root_coroutine(&self) -> bool {
        self.coroutine == self.root_coroutine
    }

    pub fn get_static(&self, index: u32) -> Result<Value, VmError> {
        self.statics
            .get(index as usize)
            .copied()
            .ok_or(VmError::InvalidStatic(index))
    }

    pub fn set_static(&mut self, index: u32, value: Value) -> Result<(), VmError> {
        let slot = self
            .statics
            .get_mut(index as usize)
            .ok_or(VmError::InvalidStatic(index))?;
        *slot = value;
        Ok(())
    }

    /// Prepares the current stack so the next `interpret` calls `function`
    /// with `arguments`, receiver first for methods.
    pub fn setup_entry(&mut self, function: Value, arguments: &[Value]) -> Result<(), VmError> {
        let arity = self
            .program
            .function(function)
            .ok_or(VmError::NotAFunction(function))?
            .arity;
        if arity != arguments.len() {
            return Err(VmError::ArityMismatch {
                expected: arity,
                actual: arguments.len(),
            });
        }
        arguments.iter().for_each(|&argument| self.stack.push(argument));
        let fp = self.stack.push_frame(ReturnKind::Entry, None, function);
        self.stack.save_state(Resume::Dispatch, fp);
        Ok(())
    }

    /// New coroutine that runs the one-argument `function` with the first value
    /// switched into it.
    pub fn spawn_coroutine(&mut self, function: Value) -> Result<Value, Failure> {
        let mut stack = Stack::new(&StackCreateInfo {
            size: self.initial_stack_size,
        });
        stack.push(self.program.specials.null);
        let fp = stack.push_frame(ReturnKind::Entry, None, function);
        stack.save_state(Resume::CoroutineEntry, fp);
        self.heap.allocate(
            self.program.specials.coroutine_class,
            ObjectBody::Coroutine(Coroutine {
                stack: Some(stack),
                caller: self.program.specials.null,
            }),
        )
    }

    /// Parks the active stack in the current coroutine and activates `target`.
    ///
    /// Fails without changing anything when `target` is not a suspended coroutine.
    pub fn switch_coroutine(&mut self, target: Value) -> bool {
        if target == self.coroutine {
            return false;
        }
        let resumable = |object: &HeapObject| match &object.body {
            ObjectBody::Coroutine(coroutine) => coroutine
                .stack
                .as_ref()
                .is_some_and(|stack| stack.depth() > 0),
            _ => false,
        };
        if !self.heap.get(target).is_some_and(resumable)
            || !self
                .heap
                .get(self.coroutine)
                .is_some_and(|object| matches!(object.body, ObjectBody::Coroutine(_)))
        {
            return false;
        }

        let previous = self.coroutine;
        let Some(ObjectBody::Coroutine(next)) = self.heap.get_mut(target).map(|o| &mut o.body)
        else {
            return false;
        };
        let Some(stack) = next.stack.take() else {
            return false;
        };
        next.caller = previous;
        let parked = mem::replace(&mut self.stack, stack);
        if let Some(ObjectBody::Coroutine(current)) =
            self.heap.get_mut(previous).map(|o| &mut o.body)
        {
            current.stack = Some(parked);
        }
        self.heap.write_barrier(target, previous);
        self.heap.write_barrier(previous, target);
        self.coroutine = target;
        debug!("coroutine: switched {previous:?} -> {target:?}");
        true
    }

    /// Coroutine that last switched into the current one.
    pub fn coroutine_caller(&self) -> Option<Value> {
        match &self.heap.get(self.coroutine)?.body {
            ObjectBody::Coroutine(coroutine) => Some(coroutine.caller),
            _ => None,
        }
    }

    /// Raises the stack limit so `requested` more slots fit, within the maximum.
    pub fn grow_stack(&mut self, requested: usize) -> bool {
        let needed = self.stack.depth() + requested;
        if needed > self.max_stack_size {
            return false;
        }
        let grown = (self.stack_limit * 2).max(needed).min(self.max_stack_size);
        debug!("stack: growing limit {} -> {grown}", self.stack_limit);
        self.stack.reserve(grown.saturating_sub(self.stack.depth()));
        self.stack_limit = grown;
        self.signals.set_limit(grown);
        true
    }

    pub fn allocate_instance(&mut self, class: Value, immutable: bool) -> Value {
        let Some(fields) = self
            .program
            .class(class)
            .map(|class| class.format.fixed_fields())
        else {
            return Value::failure(Failure::WrongArgumentType);
        };
        let null = self.program.specials.null;
        let body = ObjectBody::Instance(vec![null; fields].into());
        match self.heap.allocate(class, body) {
            Ok(instance) => {
                if immutable && let Some(object) = self.heap.get_mut(instance) {
                    object.flags.insert(ObjectFlags::IMMUTABLE);
                }
                instance
            }
            Err(failure) => Value::failure(failure),
        }
    }

    pub fn allocate_boxed(&mut self, value: Value) -> Value {
        let class = self.program.specials.boxed_class;
        self.heap
            .allocate(class, ObjectBody::Boxed(value))
            .unwrap_or_else(Value::failure)
    }

    /// Full collection. The lookup cache is flushed afterwards.
    pub fn collect_garbage(&mut self) {
        let mut roots = Vec::with_capacity(self.stack.depth() + self.statics.len() + 2);
        roots.extend_from_slice(self.stack.slots());
        roots.extend_from_slice(&self.statics);
        roots.push(self.coroutine);
        roots.push(self.root_coroutine);
        self.heap.collect(&roots);
        self.lookup_cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Opcode, ProgramBuilder, ProgramCreateInfo};

    fn setup() -> (Process, Value) {
        let mut builder = ProgramBuilder::new(ProgramCreateInfo::default()).unwrap();
        let body = builder
            .function_from_ops("body", 1, &[Opcode::LoadLocal0, Opcode::Return])
            .unwrap();
        let program = builder.finish().unwrap();
        let process = Process::new(Arc::new(program), &ProcessCreateInfo::default()).unwrap();
        (process, body)
    }

    #[test]
    fn preempt_drops_the_limit_until_taken() {
        let signals = ProcessSignals::new(100);
        signals.preempt();
        assert_eq!(signals.limit(), 0);
        assert_eq!(signals.take_interrupts(), Interrupts::PREEMPT);
        assert_eq!(signals.take_interrupts(), Interrupts::empty());
    }

    #[test]
    fn setup_entry_checks_arity() {
        let (mut process, body) = setup();
        assert_eq!(
            process.setup_entry(body, &[]),
            Err(VmError::ArityMismatch {
                expected: 1,
                actual: 0
            })
        );
        process.setup_entry(body, &[Value::smi(3)]).unwrap();
        let state = process.stack.saved_state().unwrap();
        assert_eq!(state.resume, Resume::Dispatch);
        assert_eq!(process.stack.frame(state.frame_pointer).unwrap().function, body);
    }

    #[test]
    fn switching_parks_the_previous_stack() {
        let (mut process, body) = setup();
        let root = process.coroutine;
        let child = process.spawn_coroutine(body).unwrap();
        process.stack.push(Value::smi(9));

        assert!(process.switch_coroutine(child));
        assert_eq!(process.coroutine, child);
        assert_eq!(
            process.stack.saved_state().unwrap().resume,
            Resume::CoroutineEntry
        );
        assert_eq!(process.coroutine_caller(), Some(root));
        assert!(!process.switch_coroutine(child), "already running");

        assert!(process.switch_coroutine(root));
        assert_eq!(process.stack.local(0), Some(Value::smi(9)));
    }

    #[test]
    fn collection_keeps_parked_coroutines() {
        let (mut process, body) = setup();
        let child = process.spawn_coroutine(body).unwrap();
        let garbage = process.allocate_boxed(Value::smi(1));
        process.stack.push(child);
        process.collect_garbage();

        assert!(process.object(child).is_some());
        assert!(process.object(garbage).is_none());
    }

    #[test]
    fn stack_grows_up_to_the_maximum() {
        let (process, _) = setup();
        let program = process.program().clone();
        let mut process = Process::new(
            program,
            &ProcessCreateInfo {
                stack_size: 16,
                max_stack_size: 40,
                ..Default::default()
            },
        )
        .unwrap();
        assert!(process.grow_stack(20));
        assert_eq!(process.stack_limit(), 32);
        assert!(process.grow_stack(40));
        assert_eq!(process.stack_limit(), 40);
        assert!(!process.grow_stack(41));
    }
}
