use log::{debug, warn};

use crate::{ExecutionResult, FIRST_LOCAL_OFFSET, Resume, Value, VmError};

use super::{Flow, Interpreter};

/// Throws the value on top. It stays on the stack while the handler is searched.
pub(super) fn throw(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    let exception = i.local(0)?;
    i.throw_value(exception)
}

impl Interpreter<'_> {
    /// Unwinds to the innermost handler covering a frame's current bytecode,
    /// or stops the process when none does.
    pub(super) fn throw_value(&mut self, exception: Value) -> Result<Flow, VmError> {
        self.save_state(Resume::Throw)?;
        let catch = self.runtime.handle_throw(self.process, exception);
        self.restore_state()?;
        let Some(catch) = catch else {
            warn!("interpreter: uncaught {exception:?}");
            return self.exit(ExecutionResult::UncaughtException);
        };

        let depth = self.process.stack.depth().checked_add_signed(catch.stack_delta);
        let depth = depth
            .filter(|&depth| depth > catch.frame_pointer + FIRST_LOCAL_OFFSET)
            .ok_or(VmError::CorruptFrame {
                fp: catch.frame_pointer,
            })?;
        let null = self.null();
        while self.process.stack.depth() < depth {
            self.push(null);
        }
        self.process.stack.truncate(depth);
        self.load_frame(catch.frame_pointer)?;
        self.bcp = catch.bcp;
        self.set_local(0, exception)?;
        debug!(
            "interpreter: unwound to frame {} handler {}",
            catch.frame_pointer, catch.bcp
        );
        Ok(Flow::Continue)
    }
}
