//! Bytecode interpreter.
//!
//! Every opcode has a handler in one flat table. Handlers run between two
//! instruction boundaries and leave every stack slot scannable. Calls into a
//! [`Runtime`] collaborator are bracketed by a saved state, so after the call
//! the interpreter rebuilds its registers (frame pointer, function, bytecode
//! offset) from the stack alone.
use std::sync::Arc;

use log::trace;

use crate::{
    FIRST_LOCAL_OFFSET, ObjectBody, Opcode, Process, ProcessSignals, Program, RETURN_KIND_OFFSET,
    Resume, ReturnKind, Runtime, SavedState, Selector, Value, VmError, bytecode,
};

mod arithmetic;
mod coroutine;
mod invoke;
mod native;
mod safepoint;
mod unwind;


/// Why `interpret` returned.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    /// the entry function returned
    Normal(Value),
    /// `ProcessYield` stopped the process, resumable after the instruction
    Yield(Value),
    /// preempted at a stack check, resumable
    Interrupt,
    Breakpoint,
    UncaughtException,
    /// a yielding native asked to deliver this value, resumable
    TargetYield(Value),
}

pub(crate) enum Flow {
    Continue,
    Exit(ExecutionResult),
}

type Handler = fn(&mut Interpreter<'_>) -> Result<Flow, VmError>;

/// Runs `process` from its saved state until it returns, yields or is interrupted.
///
/// The stack must carry a saved state, as left by [`Process::setup_entry`] or by
/// a previous resumable exit.
pub fn interpret<'a>(
    process: &'a mut Process,
    runtime: &'a mut dyn Runtime,
) -> Result<ExecutionResult, VmError> {
    let mut interpreter = Interpreter::enter(process, runtime)?;
    interpreter.run()
}

struct Interpreter<'a> {
    process: &'a mut Process,
    runtime: &'a mut dyn Runtime,
    program: Arc<Program>,
    signals: Arc<ProcessSignals>,
    /// code of `function`
    bytecode: Arc<[u8]>,
    fp: usize,
    function: Value,
    bcp: usize,
}

impl<'a> Interpreter<'a> {
    fn enter(process: &'a mut Process, runtime: &'a mut dyn Runtime) -> Result<Self, VmError> {
        let program = process.program().clone();
        let signals = process.signals();
        let mut interpreter = Self {
            process,
            runtime,
            program,
            signals,
            bytecode: Arc::from(Vec::new()),
            fp: 0,
            function: Value::zero(),
            bcp: 0,
        };
        match interpreter.restore_state()?.resume {
            // a fresh coroutine starts at the top of its entry function
            Resume::Dispatch | Resume::CoroutineEntry => Ok(interpreter),
            other => Err(VmError::UnexpectedResume(other)),
        }
    }

    fn run(&mut self) -> Result<ExecutionResult, VmError> {
        loop {
            let opcode = self.opcode()?;
            trace!(
                "{:>5} {:>4} {}",
                self.process.stack.depth(),
                self.bcp,
                opcode.name()
            );
            #[cfg(feature = "debugger")]
            {
                let depth = self.process.stack.depth();
                if self
                    .runtime
                    .handle_at_bytecode(self.process, self.function, self.bcp, depth)
                {
                    self.save_state(Resume::Dispatch)?;
                    return Ok(ExecutionResult::Breakpoint);
                }
            }
            if let Flow::Exit(result) = HANDLERS[opcode as usize](self)? {
                return Ok(result);
            }
        }
    }

    // ── decoding ───────────────────────────────────────────────────

    fn opcode(&self) -> Result<Opcode, VmError> {
        let byte = *self
            .bytecode
            .get(self.bcp)
            .ok_or(VmError::MethodEnd { bcp: self.bcp })?;
        Opcode::try_from(byte).map_err(|byte| VmError::InvalidOpcode { byte, bcp: self.bcp })
    }

    fn truncated(&self) -> VmError {
        VmError::TruncatedInstruction {
            opcode: self.opcode().unwrap_or(Opcode::MethodEnd),
            bcp: self.bcp,
        }
    }

    fn operand_u8(&self, offset: usize) -> Result<u8, VmError> {
        bytecode::read_u8(&self.bytecode, self.bcp + offset).ok_or_else(|| self.truncated())
    }

    fn operand_u32(&self, offset: usize) -> Result<u32, VmError> {
        bytecode::read_u32(&self.bytecode, self.bcp + offset).ok_or_else(|| self.truncated())
    }

    fn selector_operand(&self) -> Result<Selector, VmError> {
        self.operand_u32(1).map(Selector::from_raw)
    }

    fn literal(&self, index: u32) -> Result<Value, VmError> {
        self.program
            .function(self.function)
            .and_then(|function| function.literals.get(index as usize).copied())
            .ok_or(VmError::InvalidLiteral(index))
    }

    /// One past the last argument of the current frame.
    fn arguments_end(&self) -> usize {
        self.fp.saturating_sub(RETURN_KIND_OFFSET)
    }

    /// Slot of the argument `depth` below the last one. With `depth` equal to
    /// the selector arity this is the receiver.
    fn argument_slot(&self, depth: usize) -> Result<usize, VmError> {
        self.arguments_end()
            .checked_sub(depth + 1)
            .ok_or(VmError::StackUnderflow)
    }

    /// Selector smi held in local `index` of the frame at `fp`.
    fn frame_selector(&self, fp: usize, index: u32) -> Result<Selector, VmError> {
        self.process
            .stack
            .get(fp + FIRST_LOCAL_OFFSET + index as usize)
            .and_then(Selector::from_smi)
            .ok_or(VmError::CorruptFrame { fp })
    }

    #[inline]
    fn next(&mut self, opcode: Opcode) -> Result<Flow, VmError> {
        self.bcp += opcode.length();
        Ok(Flow::Continue)
    }

    // ── stack ──────────────────────────────────────────────────────

    #[inline]
    fn push(&mut self, value: Value) {
        self.process.stack.push(value);
    }

    #[inline]
    fn pop(&mut self) -> Result<Value, VmError> {
        self.process.stack.pop().ok_or(VmError::StackUnderflow)
    }

    #[inline]
    fn local(&self, index: usize) -> Result<Value, VmError> {
        self.process.stack.local(index).ok_or(VmError::StackUnderflow)
    }

    #[inline]
    fn set_local(&mut self, index: usize, value: Value) -> Result<(), VmError> {
        self.process
            .stack
            .set_local(index, value)
            .ok_or(VmError::StackUnderflow)
    }

    #[inline]
    fn drop_n(&mut self, count: usize) -> Result<(), VmError> {
        self.process.stack.drop_n(count).ok_or(VmError::StackUnderflow)
    }

    fn null(&self) -> Value {
        self.program.specials.null
    }

    fn boolean(&self, value: bool) -> Value {
        self.program.specials.boolean(value)
    }

    fn class_of(&self, value: Value) -> Result<Value, VmError> {
        self.process
            .class_of(value)
            .ok_or(VmError::NotAnObject(value))
    }

    fn field(&self, object: Value, index: usize) -> Result<Value, VmError> {
        self.process
            .object(object)
            .and_then(|object| object.fields())
            .and_then(|fields| fields.get(index).copied())
            .ok_or(VmError::InvalidField {
                object,
                field: index,
            })
    }

    /// Store with write barrier. Program-space objects are read-only.
    fn set_field(&mut self, object: Value, index: usize, value: Value) -> Result<(), VmError> {
        let slot = self
            .process
            .object_mut(object)?
            .fields_mut()
            .and_then(|fields| fields.get_mut(index))
            .ok_or(VmError::InvalidField {
                object,
                field: index,
            })?;
        *slot = value;
        self.process.heap.write_barrier(object, value);
        Ok(())
    }

    // ── frames and saved state ─────────────────────────────────────

    fn set_function(&mut self, function: Value) -> Result<(), VmError> {
        let code = self
            .program
            .function(function)
            .ok_or(VmError::NotAFunction(function))?;
        self.bytecode = code.bytecode.clone();
        self.function = function;
        Ok(())
    }

    fn load_frame(&mut self, fp: usize) -> Result<(), VmError> {
        let frame = self
            .process
            .stack
            .frame(fp)
            .ok_or(VmError::CorruptFrame { fp })?;
        self.set_function(frame.function)?;
        self.fp = fp;
        self.bcp = frame.bcp;
        Ok(())
    }

    fn save_state(&mut self, resume: Resume) -> Result<(), VmError> {
        self.process
            .stack
            .set_frame_bcp(self.fp, self.bcp)
            .ok_or(VmError::CorruptFrame { fp: self.fp })?;
        self.process.stack.save_state(resume, self.fp);
        Ok(())
    }

    fn restore_state(&mut self) -> Result<SavedState, VmError> {
        let state = self
            .process
            .stack
            .restore_state()
            .ok_or(VmError::MissingSavedState)?;
        self.load_frame(state.frame_pointer)?;
        Ok(state)
    }

    /// Leaves the interpreter resumable at the current instruction.
    fn exit(&mut self, result: ExecutionResult) -> Result<Flow, VmError> {
        self.save_state(Resume::Dispatch)?;
        Ok(Flow::Exit(result))
    }

    // ── calls ──────────────────────────────────────────────────────

    /// Enters `target` with its arguments already on the stack. The caller's
    /// bytecode offset stays on the invoke so the return can complete it.
    fn call(&mut self, target: Value) -> Result<Flow, VmError> {
        self.process
            .stack
            .set_frame_bcp(self.fp, self.bcp)
            .ok_or(VmError::CorruptFrame { fp: self.fp })?;
        let caller = self.fp;
        self.set_function(target)?;
        self.fp = self
            .process
            .stack
            .push_frame(ReturnKind::Interpreted, Some(caller), target);
        self.bcp = 0;
        Ok(self.check_stack_overflow(0)?.unwrap_or(Flow::Continue))
    }

    fn return_value(&mut self, result: Value) -> Result<Flow, VmError> {
        let returning = self.function;
        let frame = self
            .process
            .stack
            .frame(self.fp)
            .ok_or(VmError::CorruptFrame { fp: self.fp })?;
        self.process.stack.truncate(self.fp - RETURN_KIND_OFFSET);

        match frame.return_kind {
            ReturnKind::Interpreted => {
                let caller = frame.caller.ok_or(VmError::CorruptFrame { fp: self.fp })?;
                self.load_frame(caller)?;
                self.complete_call(result)
            }
            ReturnKind::Entry => {
                let arity = self
                    .program
                    .function(returning)
                    .map_or(0, |function| function.arity);
                self.drop_n(arity)?;
                self.finish_coroutine(result)
            }
        }
    }

    /// Finishes the invoke instruction at `bcp` once its callee returned `result`.
    fn complete_call(&mut self, result: Value) -> Result<Flow, VmError> {
        let opcode = self.opcode()?;
        if opcode.is_method_invoke() {
            let selector = self.selector_operand()?;
            self.drop_n(selector.arity())?;
            self.set_local(0, result)?;
            return self.next(opcode);
        }
        match opcode {
            Opcode::InvokeStatic | Opcode::InvokeFactory => {
                let target = self.literal(self.operand_u32(1)?)?;
                let arity = self
                    .program
                    .function(target)
                    .ok_or(VmError::NotAFunction(target))?
                    .arity;
                self.drop_n(arity)?;
                self.push(result);
            }
            Opcode::InvokeSelector => {
                let selector = self.frame_selector(self.fp, self.operand_u32(1)?)?;
                self.drop_n(selector.arity())?;
                self.set_local(0, result)?;
            }
            Opcode::LoadStaticInit => self.push(result),
            _ => return Err(VmError::InvalidReturnSite { opcode }),
        }
        self.next(opcode)
    }
}

// ── handler table ──────────────────────────────────────────────────

static HANDLERS: [Handler; Opcode::COUNT] = handlers();

const fn handlers() -> [Handler; Opcode::COUNT] {
    use Opcode::*;

    let mut table: [Handler; Opcode::COUNT] = [method_end as Handler; Opcode::COUNT];
    table[LoadLocal0 as usize] = load_local_0;
    table[LoadLocal1 as usize] = load_local_1;
    table[LoadLocal2 as usize] = load_local_2;
    table[LoadLocal3 as usize] = load_local_3;
    table[LoadLocal4 as usize] = load_local_4;
    table[LoadLocal5 as usize] = load_local_5;
    table[LoadLocal as usize] = load_local;
    table[LoadLocalWide as usize] = load_local_wide;
    table[LoadBoxed as usize] = load_boxed;
    table[LoadStatic as usize] = load_static;
    table[LoadStaticInit as usize] = load_static_init;
    table[LoadField as usize] = load_field;
    table[LoadFieldWide as usize] = load_field_wide;
    table[LoadConst as usize] = load_const;
    table[StoreLocal as usize] = store_local;
    table[StoreBoxed as usize] = store_boxed;
    table[StoreStatic as usize] = store_static;
    table[StoreField as usize] = store_field;
    table[StoreFieldWide as usize] = store_field_wide;
    table[LoadLiteralNull as usize] = load_literal_null;
    table[LoadLiteralTrue as usize] = load_literal_true;
    table[LoadLiteralFalse as usize] = load_literal_false;
    table[LoadLiteral0 as usize] = load_literal_0;
    table[LoadLiteral1 as usize] = load_literal_1;
    table[LoadLiteral as usize] = load_literal;
    table[LoadLiteralWide as usize] = load_literal_wide;

    table[InvokeMethodUnfold as usize] = invoke::invoke_method_unfold;
    table[InvokeMethod as usize] = invoke::invoke_method;
    table[InvokeNoSuchMethod as usize] = invoke::invoke_no_such_method;
    table[InvokeTestNoSuchMethod as usize] = invoke::invoke_test_no_such_method;
    table[InvokeStatic as usize] = invoke::invoke_static;
    table[InvokeFactory as usize] = invoke::invoke_static;
    table[InvokeLeafNative as usize] = native::invoke_leaf_native;
    table[InvokeNative as usize] = native::invoke_native;
    table[InvokeNativeYield as usize] = native::invoke_native_yield;
    table[InvokeTestUnfold as usize] = invoke::invoke_test_unfold;
    table[InvokeTest as usize] = invoke::invoke_test;
    table[InvokeSelector as usize] = invoke::invoke_selector;

    table[InvokeEqUnfold as usize] = arithmetic::invoke_eq;
    table[InvokeEq as usize] = arithmetic::invoke_eq;
    table[InvokeLtUnfold as usize] = arithmetic::invoke_lt;
    table[InvokeLt as usize] = arithmetic::invoke_lt;
    table[InvokeLeUnfold as usize] = arithmetic::invoke_le;
    table[InvokeLe as usize] = arithmetic::invoke_le;
    table[InvokeGtUnfold as usize] = arithmetic::invoke_gt;
    table[InvokeGt as usize] = arithmetic::invoke_gt;
    table[InvokeGeUnfold as usize] = arithmetic::invoke_ge;
    table[InvokeGe as usize] = arithmetic::invoke_ge;
    table[InvokeAddUnfold as usize] = arithmetic::invoke_add;
    table[InvokeAdd as usize] = arithmetic::invoke_add;
    table[InvokeSubUnfold as usize] = arithmetic::invoke_sub;
    table[InvokeSub as usize] = arithmetic::invoke_sub;
    table[InvokeModUnfold as usize] = arithmetic::invoke_slow;
    table[InvokeMod as usize] = arithmetic::invoke_slow;
    table[InvokeMulUnfold as usize] = arithmetic::invoke_mul;
    table[InvokeMul as usize] = arithmetic::invoke_mul;
    table[InvokeTruncDivUnfold as usize] = arithmetic::invoke_slow;
    table[InvokeTruncDiv as usize] = arithmetic::invoke_slow;
    table[InvokeBitNotUnfold as usize] = arithmetic::invoke_bit_not;
    table[InvokeBitNot as usize] = arithmetic::invoke_bit_not;
    table[InvokeBitAndUnfold as usize] = arithmetic::invoke_bit_and;
    table[InvokeBitAnd as usize] = arithmetic::invoke_bit_and;
    table[InvokeBitOrUnfold as usize] = arithmetic::invoke_bit_or;
    table[InvokeBitOr as usize] = arithmetic::invoke_bit_or;
    table[InvokeBitXorUnfold as usize] = arithmetic::invoke_bit_xor;
    table[InvokeBitXor as usize] = arithmetic::invoke_bit_xor;
    table[InvokeBitShrUnfold as usize] = arithmetic::invoke_bit_shr;
    table[InvokeBitShr as usize] = arithmetic::invoke_bit_shr;
    table[InvokeBitShlUnfold as usize] = arithmetic::invoke_bit_shl;
    table[InvokeBitShl as usize] = arithmetic::invoke_bit_shl;

    table[Pop as usize] = pop;
    table[Drop as usize] = drop_slots;
    table[Return as usize] = return_top;
    table[ReturnNull as usize] = return_null;

    table[BranchWide as usize] = branch_wide;
    table[BranchIfTrueWide as usize] = branch_if_true_wide;
    table[BranchIfFalseWide as usize] = branch_if_false_wide;
    table[BranchBack as usize] = branch_back;
    table[BranchBackIfTrue as usize] = branch_back_if_true;
    table[BranchBackIfFalse as usize] = branch_back_if_false;
    table[BranchBackWide as usize] = branch_back_wide;
    table[BranchBackIfTrueWide as usize] = branch_back_if_true_wide;
    table[BranchBackIfFalseWide as usize] = branch_back_if_false_wide;
    table[PopAndBranchWide as usize] = pop_and_branch_wide;
    table[PopAndBranchBackWide as usize] = pop_and_branch_back_wide;

    table[Allocate as usize] = safepoint::allocate;
    table[AllocateImmutable as usize] = safepoint::allocate_immutable;
    table[AllocateBoxed as usize] = safepoint::allocate_boxed;
    table[Negate as usize] = arithmetic::negate;
    table[StackOverflowCheck as usize] = safepoint::stack_overflow_check;
    table[Throw as usize] = unwind::throw;
    table[SubroutineCall as usize] = subroutine_call;
    table[SubroutineReturn as usize] = subroutine_return;
    table[ProcessYield as usize] = coroutine::process_yield;
    table[CoroutineChange as usize] = coroutine::coroutine_change;
    table[Identical as usize] = arithmetic::identical;
    table[IdenticalNonNumeric as usize] = arithmetic::identical_non_numeric;
    table[EnterNoSuchMethod as usize] = invoke::enter_no_such_method;
    table[ExitNoSuchMethod as usize] = invoke::exit_no_such_method;
    table[MethodEnd as usize] = method_end;
    table
}

// ── loads and stores ───────────────────────────────────────────────

fn push_local(i: &mut Interpreter<'_>, index: usize, opcode: Opcode) -> Result<Flow, VmError> {
    let value = i.local(index)?;
    i.push(value);
    i.next(opcode)
}

fn load_local_0(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    push_local(i, 0, Opcode::LoadLocal0)
}

fn load_local_1(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    push_local(i, 1, Opcode::LoadLocal1)
}

fn load_local_2(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    push_local(i, 2, Opcode::LoadLocal2)
}

fn load_local_3(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    push_local(i, 3, Opcode::LoadLocal3)
}

fn load_local_4(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    push_local(i, 4, Opcode::LoadLocal4)
}

fn load_local_5(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    push_local(i, 5, Opcode::LoadLocal5)
}

fn load_local(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    let index = i.operand_u8(1)? as usize;
    push_local(i, index, Opcode::LoadLocal)
}

fn load_local_wide(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    let index = i.operand_u32(1)? as usize;
    push_local(i, index, Opcode::LoadLocalWide)
}

fn boxed_value(i: &Interpreter<'_>, boxed: Value) -> Result<Value, VmError> {
    match i.process.object(boxed).map(|object| &object.body) {
        Some(ObjectBody::Boxed(value)) => Ok(*value),
        _ => Err(VmError::NotAnObject(boxed)),
    }
}

fn load_boxed(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    let boxed = i.local(i.operand_u8(1)? as usize)?;
    let value = boxed_value(i, boxed)?;
    i.push(value);
    i.next(Opcode::LoadBoxed)
}

fn load_static(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    let value = i.process.get_static(i.operand_u32(1)?)?;
    i.push(value);
    i.next(Opcode::LoadStatic)
}

/// A static still holding its initializer calls the initializer function, the
/// return completes this instruction by pushing the result.
fn load_static_init(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    let value = i.process.get_static(i.operand_u32(1)?)?;
    if let Some(ObjectBody::Initializer(function)) = i.process.object(value).map(|o| &o.body) {
        let function = *function;
        return i.call(function);
    }
    i.push(value);
    i.next(Opcode::LoadStaticInit)
}

fn replace_with_field(i: &mut Interpreter<'_>, index: usize, opcode: Opcode) -> Result<Flow, VmError> {
    let value = i.field(i.local(0)?, index)?;
    i.set_local(0, value)?;
    i.next(opcode)
}

fn load_field(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    let index = i.operand_u8(1)? as usize;
    replace_with_field(i, index, Opcode::LoadField)
}

fn load_field_wide(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    let index = i.operand_u32(1)? as usize;
    replace_with_field(i, index, Opcode::LoadFieldWide)
}

fn load_const(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    let value = i.literal(i.operand_u32(1)?)?;
    i.push(value);
    i.next(Opcode::LoadConst)
}

fn store_local(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    let value = i.local(0)?;
    i.set_local(i.operand_u8(1)? as usize, value)?;
    i.next(Opcode::StoreLocal)
}

fn store_boxed(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    let value = i.local(0)?;
    let boxed = i.local(i.operand_u8(1)? as usize)?;
    match &mut i.process.object_mut(boxed)?.body {
        ObjectBody::Boxed(slot) => *slot = value,
        _ => return Err(VmError::NotAnObject(boxed)),
    }
    i.process.heap.write_barrier(boxed, value);
    i.next(Opcode::StoreBoxed)
}

fn store_static(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    let value = i.local(0)?;
    i.process.set_static(i.operand_u32(1)?, value)?;
    i.next(Opcode::StoreStatic)
}

fn store_into_field(i: &mut Interpreter<'_>, index: usize, opcode: Opcode) -> Result<Flow, VmError> {
    let value = i.local(0)?;
    let object = i.local(1)?;
    i.set_field(object, index, value)?;
    i.drop_n(1)?;
    i.set_local(0, value)?;
    i.next(opcode)
}

fn store_field(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    let index = i.operand_u8(1)? as usize;
    store_into_field(i, index, Opcode::StoreField)
}

fn store_field_wide(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    let index = i.operand_u32(1)? as usize;
    store_into_field(i, index, Opcode::StoreFieldWide)
}

fn push_value(i: &mut Interpreter<'_>, value: Value, opcode: Opcode) -> Result<Flow, VmError> {
    i.push(value);
    i.next(opcode)
}

fn load_literal_null(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    push_value(i, i.null(), Opcode::LoadLiteralNull)
}

fn load_literal_true(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    push_value(i, i.boolean(true), Opcode::LoadLiteralTrue)
}

fn load_literal_false(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    push_value(i, i.boolean(false), Opcode::LoadLiteralFalse)
}

fn load_literal_0(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    push_value(i, Value::smi(0), Opcode::LoadLiteral0)
}

fn load_literal_1(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    push_value(i, Value::smi(1), Opcode::LoadLiteral1)
}

fn load_literal(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    let value = Value::smi(i64::from(i.operand_u8(1)?));
    push_value(i, value, Opcode::LoadLiteral)
}

fn load_literal_wide(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    // the immediate is a signed 32-bit integer
    let value = Value::smi(i64::from(i.operand_u32(1)? as i32));
    push_value(i, value, Opcode::LoadLiteralWide)
}

// ── stack and control ──────────────────────────────────────────────

fn pop(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    i.drop_n(1)?;
    i.next(Opcode::Pop)
}

fn drop_slots(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    i.drop_n(i.operand_u8(1)? as usize)?;
    i.next(Opcode::Drop)
}

fn return_top(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    let result = i.local(0)?;
    i.return_value(result)
}

fn return_null(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    i.return_value(i.null())
}

fn jump_to(i: &mut Interpreter<'_>, target: Option<usize>, offset: u32) -> Result<Flow, VmError> {
    match target {
        Some(target) if target < i.bytecode.len() => {
            i.bcp = target;
            Ok(Flow::Continue)
        }
        _ => Err(VmError::InvalidBranch { bcp: i.bcp, offset }),
    }
}

fn jump_forward(i: &mut Interpreter<'_>, offset: u32) -> Result<Flow, VmError> {
    jump_to(i, i.bcp.checked_add(offset as usize), offset)
}

fn jump_back(i: &mut Interpreter<'_>, offset: u32) -> Result<Flow, VmError> {
    jump_to(i, i.bcp.checked_sub(offset as usize), offset)
}

fn branch_wide(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    let offset = i.operand_u32(1)?;
    jump_forward(i, offset)
}

fn branch_if_true_wide(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    let offset = i.operand_u32(1)?;
    if i.pop()? == i.boolean(true) {
        return jump_forward(i, offset);
    }
    i.next(Opcode::BranchIfTrueWide)
}

/// Anything but `true` counts as false.
fn branch_if_false_wide(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    let offset = i.operand_u32(1)?;
    if i.pop()? != i.boolean(true) {
        return jump_forward(i, offset);
    }
    i.next(Opcode::BranchIfFalseWide)
}

fn branch_back_with(
    i: &mut Interpreter<'_>,
    offset: u32,
    condition: Option<bool>,
    opcode: Opcode,
) -> Result<Flow, VmError> {
    if let Some(flow) = i.check_stack_overflow(0)? {
        return Ok(flow);
    }
    let taken = match condition {
        None => true,
        Some(expected) => (i.pop()? == i.boolean(true)) == expected,
    };
    if taken {
        jump_back(i, offset)
    } else {
        i.next(opcode)
    }
}

fn branch_back(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    let offset = u32::from(i.operand_u8(1)?);
    branch_back_with(i, offset, None, Opcode::BranchBack)
}

fn branch_back_if_true(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    let offset = u32::from(i.operand_u8(1)?);
    branch_back_with(i, offset, Some(true), Opcode::BranchBackIfTrue)
}

fn branch_back_if_false(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    let offset = u32::from(i.operand_u8(1)?);
    branch_back_with(i, offset, Some(false), Opcode::BranchBackIfFalse)
}

fn branch_back_wide(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    let offset = i.operand_u32(1)?;
    branch_back_with(i, offset, None, Opcode::BranchBackWide)
}

fn branch_back_if_true_wide(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    let offset = i.operand_u32(1)?;
    branch_back_with(i, offset, Some(true), Opcode::BranchBackIfTrueWide)
}

fn branch_back_if_false_wide(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    let offset = i.operand_u32(1)?;
    branch_back_with(i, offset, Some(false), Opcode::BranchBackIfFalseWide)
}

fn pop_and_branch_wide(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    let offset = i.operand_u32(2)?;
    i.drop_n(i.operand_u8(1)? as usize)?;
    jump_forward(i, offset)
}

fn pop_and_branch_back_wide(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    if let Some(flow) = i.check_stack_overflow(0)? {
        return Ok(flow);
    }
    let offset = i.operand_u32(2)?;
    i.drop_n(i.operand_u8(1)? as usize)?;
    jump_back(i, offset)
}

/// Pushes the return delta as a smi and jumps `delta` forward.
fn subroutine_call(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    let delta = i.operand_u32(1)?;
    let return_delta = i.operand_u32(5)?;
    i.push(Value::smi(i64::from(return_delta)));
    jump_forward(i, delta)
}

fn subroutine_return(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    let delta = i.pop()?;
    let delta = delta
        .as_smi()
        .and_then(|delta| u32::try_from(delta).ok())
        .ok_or(VmError::NotAnObject(delta))?;
    jump_back(i, delta)
}

fn method_end(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    Err(VmError::MethodEnd { bcp: i.bcp })
}
