//! Coroutine switches and process yields.
//!
//! A suspended coroutine's stack ends in a saved state. `Coroutine` marks a
//! stack parked inside its own `CoroutineChange`, `CoroutineEntry` a stack
//! that has not run yet and takes the value as its entry argument.
use log::debug;

use crate::{ExecutionResult, Opcode, Resume, Value, VmError};

use super::{Flow, Interpreter};

/// `coroutine value -- value`. Transfers `value` to the target coroutine.
pub(super) fn coroutine_change(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    let value = i.local(0)?;
    let target = i.local(1)?;
    // the parked stack must not keep either alive
    let null = i.null();
    i.set_local(0, null)?;
    i.set_local(1, null)?;

    i.save_state(Resume::Coroutine)?;
    if !i.runtime.handle_coroutine_change(i.process, target) {
        i.restore_state()?;
        i.set_local(0, value)?;
        i.set_local(1, target)?;
        let error = i.program.specials.illegal_state_error;
        return i.throw_value(error);
    }
    let state = i.restore_state()?;
    i.resume_coroutine(state.resume, value)
}

/// Stops the process with the value on top, resuming after this instruction.
pub(super) fn process_yield(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    let value = i.local(0)?;
    i.bcp += Opcode::ProcessYield.length();
    let null = i.null();
    i.set_local(0, null)?;
    i.exit(ExecutionResult::Yield(value))
}

impl Interpreter<'_> {
    /// Delivers `value` to a stack that was just switched in.
    pub(super) fn resume_coroutine(&mut self, resume: Resume, value: Value) -> Result<Flow, VmError> {
        match resume {
            Resume::Coroutine => {
                self.drop_n(1)?;
                self.set_local(0, value)?;
                self.next(Opcode::CoroutineChange)
            }
            Resume::CoroutineEntry => {
                let slot = self.argument_slot(0)?;
                self.process
                    .stack
                    .set(slot, value)
                    .ok_or(VmError::StackUnderflow)?;
                self.bcp = 0;
                Ok(Flow::Continue)
            }
            other => Err(VmError::UnexpectedResume(other)),
        }
    }

    /// The entry frame of the running coroutine returned `result`.
    ///
    /// The root coroutine ends the process. Any other coroutine hands the
    /// result back to its caller, which stays parked in `CoroutineChange`.
    pub(super) fn finish_coroutine(&mut self, result: Value) -> Result<Flow, VmError> {
        if self.process.is_root_coroutine() {
            return Ok(Flow::Exit(ExecutionResult::Normal(result)));
        }
        let caller = self.process.coroutine_caller().unwrap_or(self.null());
        debug!("interpreter: coroutine finished, returning to {caller:?}");
        if !self.runtime.handle_coroutine_change(self.process, caller) {
            return Ok(Flow::Exit(ExecutionResult::Normal(result)));
        }
        let state = self.restore_state()?;
        self.resume_coroutine(state.resume, result)
    }
}
