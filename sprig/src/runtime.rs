//! Collaborators the interpreter calls out to at safepoints.
//!
//! Every call happens with the interpreter state saved on the stack, so an
//! implementation may inspect frames, collect garbage or swap stacks. Results
//! travel back as return values, the interpreter applies them after restoring.
use log::{debug, warn};

use crate::{
    CacheEntry, FIRST_LOCAL_OFFSET, Failure, Interrupts, LookupCache, ObjectBody, Process,
    SAVED_STATE_SLOTS, Selector, Value,
};

/// Outcome of the stack-overflow slow path.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StackCheck {
    /// room was made, re-run the instruction
    Continue,
    Interrupt,
    DebugInterrupt,
    /// throw the stack overflow error
    Overflow,
}

/// Where an exception is caught.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CatchFrame {
    pub frame_pointer: usize,
    /// handler offset in the frame's function
    pub bcp: usize,
    /// Stack depth change relative to the depth at the throw, the saved state excluded.
    pub stack_delta: isize,
}

/// A call that ended in the noSuchMethod trampoline.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NoSuchMethodCall {
    /// named form of the selector that failed to dispatch
    pub selector: Selector,
    pub receiver: Value,
    pub arity: usize,
    /// slot of the first argument after the receiver
    pub arguments_base: usize,
}

pub trait Runtime {
    fn handle_gc(&mut self, process: &mut Process);

    fn handle_stack_overflow(&mut self, process: &mut Process, requested: usize) -> StackCheck;

    /// A new instance of `class`, or a failure asking for a collection first.
    fn handle_allocate(&mut self, process: &mut Process, class: Value, immutable: bool) -> Value;

    fn handle_allocate_boxed(&mut self, process: &mut Process, value: Value) -> Value;

    /// Resolves a primary cache miss and refreshes slot `index`.
    fn handle_lookup_entry(
        &mut self,
        process: &mut Process,
        index: usize,
        class: Value,
        selector: Selector,
    ) -> CacheEntry;

    fn handle_throw(&mut self, process: &mut Process, exception: Value) -> Option<CatchFrame>;

    /// Target of a reflective call.
    fn handle_invoke_selector(
        &mut self,
        process: &mut Process,
        receiver: Value,
        selector: Selector,
    ) -> Value;

    /// Makes `target` the running coroutine. `false` leaves the process untouched.
    fn handle_coroutine_change(&mut self, process: &mut Process, target: Value) -> bool;

    /// Builds the invocation object handed to `noSuchMethod`.
    fn handle_enter_no_such_method(
        &mut self,
        process: &mut Process,
        call: &NoSuchMethodCall,
    ) -> Value;

    /// Identity of two boxed numbers of the same kind, as a boolean object.
    fn handle_identical(&mut self, process: &mut Process, a: Value, b: Value) -> Value;

    fn handle_object_from_failure(&mut self, process: &mut Process, failure: Failure) -> Value;

    /// Called before every bytecode. `true` stops the interpreter with a breakpoint.
    #[cfg(feature = "debugger")]
    fn handle_at_bytecode(
        &mut self,
        _process: &mut Process,
        _function: Value,
        _bcp: usize,
        _depth: usize,
    ) -> bool {
        false
    }
}

/// Collaborators backed by the process heap, the class hierarchy and catch ranges.
#[derive(Debug, Default)]
pub struct DefaultRuntime;

impl Runtime for DefaultRuntime {
    fn handle_gc(&mut self, process: &mut Process) {
        debug!("runtime: collecting, {} live objects", process.heap.live());
        process.collect_garbage();
    }

    fn handle_stack_overflow(&mut self, process: &mut Process, requested: usize) -> StackCheck {
        let signals = process.signals();
        signals.set_limit(process.stack_limit());
        let interrupts = signals.take_interrupts();
        if interrupts.contains(Interrupts::DEBUG) {
            return StackCheck::DebugInterrupt;
        }
        if interrupts.contains(Interrupts::PREEMPT) {
            return StackCheck::Interrupt;
        }

        let depth = process.stack.depth().saturating_sub(SAVED_STATE_SLOTS);
        if depth + requested <= process.stack_limit() || process.grow_stack(requested) {
            return StackCheck::Continue;
        }
        warn!(
            "runtime: stack overflow at depth {depth} (limit {})",
            process.stack_limit()
        );
        StackCheck::Overflow
    }

    fn handle_allocate(&mut self, process: &mut Process, class: Value, immutable: bool) -> Value {
        process.allocate_instance(class, immutable)
    }

    fn handle_allocate_boxed(&mut self, process: &mut Process, value: Value) -> Value {
        process.allocate_boxed(value)
    }

    fn handle_lookup_entry(
        &mut self,
        process: &mut Process,
        index: usize,
        class: Value,
        selector: Selector,
    ) -> CacheEntry {
        let entry = LookupCache::resolve(process.program(), class, selector);
        process.lookup_cache.set(index, entry);
        process.lookup_cache.record_miss();
        entry
    }

    fn handle_throw(&mut self, process: &mut Process, exception: Value) -> Option<CatchFrame> {
        let state = process.stack.saved_state()?;
        let throw_depth = process.stack.depth() - SAVED_STATE_SLOTS;
        let program = process.program();
        // `frames` stops at the entry frame, handlers never catch across it
        for frame in process.stack.frames(state.frame_pointer) {
            let function = program.function(frame.function)?;
            if let Some(range) = function.catch_range_at(frame.bcp) {
                let depth = frame.frame_pointer + FIRST_LOCAL_OFFSET + range.stack_height;
                debug!(
                    "runtime: {exception:?} caught in {} at {}",
                    function.name, range.handler
                );
                return Some(CatchFrame {
                    frame_pointer: frame.frame_pointer,
                    bcp: range.handler,
                    stack_delta: depth as isize - throw_depth as isize,
                });
            }
        }
        None
    }

    fn handle_invoke_selector(
        &mut self,
        process: &mut Process,
        receiver: Value,
        selector: Selector,
    ) -> Value {
        let program = process.program();
        process
            .class_of(receiver)
            .and_then(|class| program.lookup_method(class, selector))
            .unwrap_or(program.specials.no_such_method_function)
    }

    fn handle_coroutine_change(&mut self, process: &mut Process, target: Value) -> bool {
        process.switch_coroutine(target)
    }

    fn handle_enter_no_such_method(
        &mut self,
        process: &mut Process,
        call: &NoSuchMethodCall,
    ) -> Value {
        debug!(
            "runtime: {:?} does not understand {}",
            call.receiver,
            process.program().selector_name(call.selector)
        );
        call.selector.to_smi()
    }

    fn handle_identical(&mut self, process: &mut Process, a: Value, b: Value) -> Value {
        let same = match (process.object(a), process.object(b)) {
            (Some(x), Some(y)) => match (&x.body, &y.body) {
                (ObjectBody::Double(x), ObjectBody::Double(y)) => x.to_bits() == y.to_bits(),
                (ObjectBody::LargeInteger(x), ObjectBody::LargeInteger(y)) => x == y,
                _ => a == b,
            },
            _ => a == b,
        };
        process.program().specials.boolean(same)
    }

    fn handle_object_from_failure(&mut self, process: &mut Process, failure: Failure) -> Value {
        let specials = &process.program().specials;
        match failure {
            Failure::WrongArgumentType => specials.wrong_argument_type_error,
            Failure::IndexOutOfBounds => specials.index_out_of_bounds_error,
            Failure::DivisionByZero => specials.division_by_zero_error,
            Failure::IllegalState | Failure::RetryAfterGc => specials.illegal_state_error,
        }
    }
}
