//! Calls into natives.
//!
//! A native body is `InvokeNative arity index` followed by the code that runs
//! when the native fails, usually a `Throw` of the pushed error object.
use log::trace;

use crate::{
    ExecutionResult, Failure, MAX_NATIVE_ARITY, NativeContext, Opcode, Resume, Value, VmError,
};

use super::{Flow, Interpreter};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum NativeKind {
    /// neither allocates nor switches stacks
    Leaf,
    Safepoint,
    /// a non-null result suspends the process with that value
    Yield,
}

pub(super) fn invoke_leaf_native(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    invoke(i, NativeKind::Leaf, Opcode::InvokeLeafNative)
}

pub(super) fn invoke_native(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    invoke(i, NativeKind::Safepoint, Opcode::InvokeNative)
}

pub(super) fn invoke_native_yield(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    invoke(i, NativeKind::Yield, Opcode::InvokeNativeYield)
}

fn invoke(i: &mut Interpreter<'_>, kind: NativeKind, opcode: Opcode) -> Result<Flow, VmError> {
    let arity = i.operand_u8(1)? as usize;
    let index = i.operand_u8(2)?;
    let native = *i.program.native(index).ok_or(VmError::InvalidNative(index))?;
    if arity > MAX_NATIVE_ARITY {
        return Err(VmError::InvalidNative(index));
    }

    // arguments are the current function's parameters, receiver first
    let end = i.arguments_end();
    let start = end.checked_sub(arity).ok_or(VmError::StackUnderflow)?;
    let mut arguments = [Value::zero(); MAX_NATIVE_ARITY];
    arguments[..arity].copy_from_slice(
        i.process
            .stack
            .slots()
            .get(start..end)
            .ok_or(VmError::StackUnderflow)?,
    );
    trace!("interpreter: native {} ({kind:?})", native.name);

    let saved = kind != NativeKind::Leaf;
    if saved {
        i.save_state(Resume::Native)?;
    }
    let result = (native.function)(&mut NativeContext {
        process: &mut *i.process,
        arguments: &arguments[..arity],
    });
    if saved {
        i.restore_state()?;
    }

    if let Some(failure) = result.as_failure() {
        if failure == Failure::RetryAfterGc {
            return i.collect_garbage();
        }
        i.save_state(Resume::Native)?;
        let error = i.runtime.handle_object_from_failure(i.process, failure);
        i.restore_state()?;
        i.push(error);
        return i.next(opcode);
    }

    if kind == NativeKind::Yield && result != i.null() {
        let null = i.null();
        return match i.return_value(null)? {
            Flow::Continue => i.exit(ExecutionResult::TargetYield(result)),
            // the entry function itself yielded, nothing is left to resume
            Flow::Exit(_) => Ok(Flow::Exit(ExecutionResult::TargetYield(result))),
        };
    }
    i.return_value(result)
}
