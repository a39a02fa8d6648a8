//! Method dispatch: dispatch-table and cached call sites, intrinsics and the
//! noSuchMethod bridge.
use log::debug;

use crate::{
    CacheEntry, DispatchEntry, Intrinsic, LookupCache, NoSuchMethodCall, ObjectBody, Opcode,
    Resume, Selector, SelectorKind, Space, Value, VmError, bytecode,
};

use super::{Flow, Interpreter};

/// Row lookup for table call sites. A row whose offset does not match belongs
/// to another selector, the send falls back to entry 0.
fn table_lookup(
    i: &Interpreter<'_>,
    class: Value,
    selector: Selector,
) -> Result<DispatchEntry, VmError> {
    let id = i.program.class(class).ok_or(VmError::NotAClass(class))?.id;
    let entry = i
        .program
        .dispatch_entry(id as usize + selector.id() as usize);
    if entry.offset == selector.id() {
        Ok(entry)
    } else {
        Ok(i.program.dispatch_entry(0))
    }
}

fn cached_lookup(
    i: &mut Interpreter<'_>,
    class: Value,
    selector: Selector,
) -> Result<CacheEntry, VmError> {
    let index = LookupCache::primary_index(class, selector);
    let entry = i.process.lookup_cache.entry(index);
    if entry.matches(class, selector) {
        i.process.lookup_cache.record_hit();
        return Ok(entry);
    }
    i.save_state(Resume::Dispatch)?;
    let entry = i
        .runtime
        .handle_lookup_entry(i.process, index, class, selector);
    i.restore_state()?;
    Ok(entry)
}

/// Resolves the method call site at `bcp` and enters the target.
pub(super) fn invoke_method_site(i: &mut Interpreter<'_>, opcode: Opcode) -> Result<Flow, VmError> {
    let selector = i.selector_operand()?;
    let receiver = i.local(selector.arity())?;
    let class = i.class_of(receiver)?;
    let (target, intrinsic) = if opcode.is_table_invoke() {
        let entry = table_lookup(i, class, selector)?;
        (entry.target, entry.intrinsic)
    } else {
        let entry = cached_lookup(i, class, selector)?;
        (entry.target, entry.intrinsic)
    };
    if let Some(intrinsic) = intrinsic
        && let Some(flow) = run_intrinsic(i, intrinsic, selector, opcode)?
    {
        return Ok(flow);
    }
    i.call(target)
}

pub(super) fn invoke_method_unfold(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    invoke_method_site(i, Opcode::InvokeMethodUnfold)
}

pub(super) fn invoke_method(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    invoke_method_site(i, Opcode::InvokeMethod)
}

/// Statically known to miss, goes straight to the trampoline.
pub(super) fn invoke_no_such_method(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    let target = i.program.specials.no_such_method_function;
    i.call(target)
}

pub(super) fn invoke_static(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    let target = i.literal(i.operand_u32(1)?)?;
    i.call(target)
}

pub(super) fn invoke_selector(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    let selector = i.frame_selector(i.fp, i.operand_u32(1)?)?;
    let receiver = i.local(selector.arity())?;
    i.save_state(Resume::Selector)?;
    let target = i
        .runtime
        .handle_invoke_selector(i.process, receiver, selector);
    i.restore_state()?;
    i.call(target)
}

// ── test call sites ────────────────────────────────────────────────

fn answer_test(i: &mut Interpreter<'_>, understood: bool, opcode: Opcode) -> Result<Flow, VmError> {
    let answer = i.boolean(understood);
    i.set_local(0, answer)?;
    i.next(opcode)
}

pub(super) fn invoke_test(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    let selector = i.selector_operand()?;
    let class = i.class_of(i.local(0)?)?;
    let understood = table_lookup(i, class, selector)?.offset == selector.id();
    answer_test(i, understood, Opcode::InvokeTest)
}

pub(super) fn invoke_test_unfold(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    let selector = i.selector_operand()?;
    let class = i.class_of(i.local(0)?)?;
    let entry = cached_lookup(i, class, selector)?;
    let understood = entry.target != i.program.specials.no_such_method_function;
    answer_test(i, understood, Opcode::InvokeTestUnfold)
}

pub(super) fn invoke_test_no_such_method(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    answer_test(i, false, Opcode::InvokeTestNoSuchMethod)
}

// ── intrinsics ─────────────────────────────────────────────────────

fn intrinsic_arity(intrinsic: Intrinsic) -> usize {
    match intrinsic {
        Intrinsic::GetField(_) | Intrinsic::ListLength => 0,
        Intrinsic::ObjectEquals | Intrinsic::SetField(_) | Intrinsic::ListIndexGet => 1,
        Intrinsic::ListIndexSet => 2,
    }
}

fn instance_fields<'i>(i: &'i Interpreter<'_>, object: Value) -> Option<&'i [Value]> {
    match &i.process.object(object)?.body {
        ObjectBody::Instance(fields) => Some(fields),
        _ => None,
    }
}

/// Backing array of a list: an instance whose field 0 holds an array.
fn backing_array(i: &Interpreter<'_>, list: Value) -> Option<Value> {
    let array = *instance_fields(i, list)?.first()?;
    matches!(i.process.object(array)?.body, ObjectBody::Array(_)).then_some(array)
}

fn array_elements<'i>(i: &'i Interpreter<'_>, array: Value) -> Option<&'i [Value]> {
    match &i.process.object(array)?.body {
        ObjectBody::Array(elements) => Some(elements),
        _ => None,
    }
}

fn is_process_object(value: Value) -> bool {
    value
        .as_heap_ref()
        .is_some_and(|reference| reference.space == Space::Process)
}

/// Runs `intrinsic` in place of the call. `None` when its preconditions do not
/// hold, the caller then enters the bytecode.
fn run_intrinsic(
    i: &mut Interpreter<'_>,
    intrinsic: Intrinsic,
    selector: Selector,
    opcode: Opcode,
) -> Result<Option<Flow>, VmError> {
    let arity = selector.arity();
    if arity != intrinsic_arity(intrinsic) {
        return Ok(None);
    }
    let receiver = i.local(arity)?;
    let result = match intrinsic {
        Intrinsic::ObjectEquals => i.boolean(receiver == i.local(0)?),
        Intrinsic::GetField(index) => {
            match instance_fields(i, receiver).and_then(|fields| fields.get(index as usize)) {
                Some(&value) => value,
                None => return Ok(None),
            }
        }
        Intrinsic::SetField(index) => {
            let fits = instance_fields(i, receiver)
                .is_some_and(|fields| (index as usize) < fields.len());
            if !fits || !is_process_object(receiver) {
                return Ok(None);
            }
            let value = i.local(0)?;
            i.set_field(receiver, index as usize, value)?;
            value
        }
        Intrinsic::ListLength => {
            match backing_array(i, receiver).and_then(|array| array_elements(i, array)) {
                Some(elements) => Value::smi(elements.len() as i64),
                None => return Ok(None),
            }
        }
        Intrinsic::ListIndexGet => {
            let index = i.local(0)?.as_smi().and_then(|n| usize::try_from(n).ok());
            let element = backing_array(i, receiver)
                .and_then(|array| array_elements(i, array))
                .zip(index)
                .and_then(|(elements, index)| elements.get(index).copied());
            match element {
                Some(element) => element,
                None => return Ok(None),
            }
        }
        Intrinsic::ListIndexSet => {
            let value = i.local(0)?;
            let index = i.local(1)?.as_smi().and_then(|n| usize::try_from(n).ok());
            let Some((array, index)) = backing_array(i, receiver).zip(index) else {
                return Ok(None);
            };
            let in_bounds =
                array_elements(i, array).is_some_and(|elements| index < elements.len());
            if !in_bounds || !is_process_object(array) {
                return Ok(None);
            }
            if let ObjectBody::Array(elements) = &mut i.process.object_mut(array)?.body {
                elements[index] = value;
            }
            i.process.heap.write_barrier(array, value);
            value
        }
    };
    i.drop_n(arity)?;
    i.set_local(0, result)?;
    i.next(opcode).map(Some)
}

// ── noSuchMethod bridge ────────────────────────────────────────────

/// Named selector of the call site that ended in the trampoline.
fn missed_selector(i: &Interpreter<'_>, caller_fp: usize) -> Result<Selector, VmError> {
    let frame = i
        .process
        .stack
        .frame(caller_fp)
        .ok_or(VmError::CorruptFrame { fp: caller_fp })?;
    let function = i
        .program
        .function(frame.function)
        .ok_or(VmError::NotAFunction(frame.function))?;
    let byte = *function
        .bytecode
        .get(frame.bcp)
        .ok_or(VmError::MethodEnd { bcp: frame.bcp })?;
    let opcode = Opcode::try_from(byte).map_err(|byte| VmError::InvalidOpcode {
        byte,
        bcp: frame.bcp,
    })?;
    let operand = bytecode::read_u32(&function.bytecode, frame.bcp + 1).ok_or(
        VmError::TruncatedInstruction {
            opcode,
            bcp: frame.bcp,
        },
    )?;
    if opcode == Opcode::InvokeSelector {
        return i.frame_selector(caller_fp, operand);
    }
    if !opcode.is_method_invoke() {
        return Err(VmError::InvalidReturnSite { opcode });
    }
    let selector = Selector::from_raw(operand);
    if opcode.is_table_invoke() {
        return Ok(i.program.selector_for_offset(selector).unwrap_or(selector));
    }
    Ok(selector)
}

/// First instruction of the trampoline. Builds the invocation and leaves
/// `selector receiver invocation` on the stack for the `noSuchMethod` send.
pub(super) fn enter_no_such_method(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    let caller = i
        .process
        .stack
        .frame(i.fp)
        .and_then(|frame| frame.caller)
        .ok_or(VmError::CorruptFrame { fp: i.fp })?;
    let selector = missed_selector(i, caller)?;
    let arity = selector.arity();
    let receiver_slot = i.argument_slot(arity)?;
    let receiver = i
        .process
        .stack
        .get(receiver_slot)
        .ok_or(VmError::StackUnderflow)?;
    let call = NoSuchMethodCall {
        selector,
        receiver,
        arity,
        arguments_base: receiver_slot + 1,
    };
    debug!(
        "interpreter: no such method {} on {receiver:?}",
        i.program.selector_name(selector)
    );

    i.bcp += Opcode::EnterNoSuchMethod.length();
    i.save_state(Resume::NoSuchMethod)?;
    let invocation = i.runtime.handle_enter_no_such_method(i.process, &call);
    i.restore_state()?;

    i.push(selector.to_smi());
    i.push(receiver);
    i.push(invocation);
    Ok(Flow::Continue)
}

/// Returns the `noSuchMethod` result to the original call site. A missed
/// setter evaluates to its argument instead.
pub(super) fn exit_no_such_method(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    let mut result = i.pop()?;
    let selector = i.pop()?;
    let selector = Selector::from_smi(selector).ok_or(VmError::NotAnObject(selector))?;
    if selector.kind() == SelectorKind::Setter {
        result = i
            .process
            .stack
            .get(i.argument_slot(0)?)
            .ok_or(VmError::StackUnderflow)?;
    }
    i.return_value(result)
}
