//! Stack checks, interrupts and allocation with collect-and-retry.
use crate::{
    ExecutionResult, Failure, Mutability, Opcode, Resume, StackCheck, Value, VmError,
};

use super::{Flow, Interpreter};

impl Interpreter<'_> {
    /// Makes sure `extra` more slots fit under the limit.
    ///
    /// `None` on the fast path. Otherwise the returned flow replaces the
    /// instruction: a re-dispatch, an exit or a thrown stack overflow error.
    /// Preemption lowers the limit to zero, so interrupts arrive here too.
    pub(super) fn check_stack_overflow(&mut self, extra: usize) -> Result<Option<Flow>, VmError> {
        if self.process.stack.depth() + extra <= self.signals.limit() {
            return Ok(None);
        }
        self.save_state(Resume::StackCheck)?;
        let check = self.runtime.handle_stack_overflow(self.process, extra);
        self.restore_state()?;
        let flow = match check {
            StackCheck::Continue => Flow::Continue,
            StackCheck::Interrupt => self.exit(ExecutionResult::Interrupt)?,
            StackCheck::DebugInterrupt => self.exit(ExecutionResult::Breakpoint)?,
            StackCheck::Overflow => {
                let error = self.program.specials.stack_overflow_error;
                self.throw_value(error)?
            }
        };
        Ok(Some(flow))
    }

    /// Collects and re-runs the current instruction.
    pub(super) fn collect_garbage(&mut self) -> Result<Flow, VmError> {
        self.save_state(Resume::Dispatch)?;
        self.runtime.handle_gc(self.process);
        self.restore_state()?;
        Ok(Flow::Continue)
    }

    fn is_immutable(&self, value: Value) -> bool {
        if value.is_smi() {
            return true;
        }
        let Some(object) = self.process.object(value) else {
            return false;
        };
        match self.program.class(object.class).map(|class| class.format.mutability()) {
            Some(Mutability::Always) => true,
            Some(Mutability::InstanceTracked) => object.is_immutable(),
            Some(Mutability::Never) | None => false,
        }
    }
}

pub(super) fn stack_overflow_check(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    let slots = i.operand_u32(1)? as usize;
    if let Some(flow) = i.check_stack_overflow(slots)? {
        return Ok(flow);
    }
    i.next(Opcode::StackOverflowCheck)
}

fn allocate_with(i: &mut Interpreter<'_>, opcode: Opcode) -> Result<Flow, VmError> {
    if let Some(flow) = i.check_stack_overflow(1)? {
        return Ok(flow);
    }
    let class = i.literal(i.operand_u32(1)?)?;
    let fields = i
        .program
        .class(class)
        .ok_or(VmError::NotAClass(class))?
        .format
        .fixed_fields();

    // immutable only when every field value is
    let mut immutable = opcode == Opcode::AllocateImmutable;
    for index in 0..fields {
        if !immutable {
            break;
        }
        immutable = i.is_immutable(i.local(index)?);
    }

    i.save_state(Resume::Dispatch)?;
    let instance = i.runtime.handle_allocate(i.process, class, immutable);
    i.restore_state()?;
    match instance.as_failure() {
        Some(Failure::RetryAfterGc) => return i.collect_garbage(),
        Some(failure) => return Err(VmError::UnexpectedFailure(failure)),
        None => {}
    }

    for index in (0..fields).rev() {
        let value = i.pop()?;
        i.set_field(instance, index, value)?;
    }
    i.push(instance);
    i.next(opcode)
}

pub(super) fn allocate(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    allocate_with(i, Opcode::Allocate)
}

pub(super) fn allocate_immutable(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    allocate_with(i, Opcode::AllocateImmutable)
}

/// Replaces the value on top with a box holding it.
pub(super) fn allocate_boxed(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    let value = i.local(0)?;
    i.save_state(Resume::Dispatch)?;
    let boxed = i.runtime.handle_allocate_boxed(i.process, value);
    i.restore_state()?;
    match boxed.as_failure() {
        Some(Failure::RetryAfterGc) => return i.collect_garbage(),
        Some(failure) => return Err(VmError::UnexpectedFailure(failure)),
        None => {}
    }
    i.set_local(0, boxed)?;
    i.next(Opcode::AllocateBoxed)
}
