//! Smi fast paths for the operator call sites.
//!
//! Both operands sitting on the stack as smis run inline. Anything else, an
//! overflowing result included, falls back to a full dynamic send, so the
//! number classes decide how to promote.
use crate::{ObjectBody, Opcode, Resume, Value, VmError};

use super::{Flow, Interpreter, invoke};

/// Left operand at local 1, right operand at local 0.
fn smi_operands(i: &Interpreter<'_>) -> Result<Option<(i64, i64)>, VmError> {
    let (left, right) = (i.local(1)?, i.local(0)?);
    Ok(left.as_smi().zip(right.as_smi()))
}

/// Replaces both operands with `result` and moves past the call site.
fn complete(i: &mut Interpreter<'_>, opcode: Opcode, result: Value) -> Result<Flow, VmError> {
    i.drop_n(1)?;
    i.set_local(0, result)?;
    i.next(opcode)
}

fn binary(i: &mut Interpreter<'_>, op: fn(i64, i64) -> Option<i64>) -> Result<Flow, VmError> {
    let opcode = i.opcode()?;
    if let Some((left, right)) = smi_operands(i)?
        && let Some(result) = op(left, right).and_then(Value::try_smi)
    {
        return complete(i, opcode, result);
    }
    invoke::invoke_method_site(i, opcode)
}

fn compare(i: &mut Interpreter<'_>, op: fn(&i64, &i64) -> bool) -> Result<Flow, VmError> {
    let opcode = i.opcode()?;
    if let Some((left, right)) = smi_operands(i)? {
        let result = i.boolean(op(&left, &right));
        return complete(i, opcode, result);
    }
    invoke::invoke_method_site(i, opcode)
}

pub(super) fn invoke_add(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    binary(i, i64::checked_add)
}

pub(super) fn invoke_sub(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    binary(i, i64::checked_sub)
}

pub(super) fn invoke_mul(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    binary(i, i64::checked_mul)
}

pub(super) fn invoke_bit_and(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    binary(i, |a, b| Some(a & b))
}

pub(super) fn invoke_bit_or(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    binary(i, |a, b| Some(a | b))
}

pub(super) fn invoke_bit_xor(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    binary(i, |a, b| Some(a ^ b))
}

/// Shift counts outside `0..32` take the slow path.
pub(super) fn invoke_bit_shr(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    binary(i, |a, count| (0..32).contains(&count).then(|| a >> count))
}

pub(super) fn invoke_bit_shl(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    binary(i, |a, count| {
        if !(0..32).contains(&count) {
            return None;
        }
        let shifted = a << count;
        // bits shifted out of the word make the round trip disagree
        (shifted >> count == a).then_some(shifted)
    })
}

pub(super) fn invoke_eq(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    compare(i, i64::eq)
}

pub(super) fn invoke_lt(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    compare(i, i64::lt)
}

pub(super) fn invoke_le(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    compare(i, i64::le)
}

pub(super) fn invoke_gt(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    compare(i, i64::gt)
}

pub(super) fn invoke_ge(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    compare(i, i64::ge)
}

/// Unary, the receiver is the only operand.
pub(super) fn invoke_bit_not(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    let opcode = i.opcode()?;
    if let Some(value) = i.local(0)?.as_smi() {
        i.set_local(0, Value::smi(!value))?;
        return i.next(opcode);
    }
    invoke::invoke_method_site(i, opcode)
}

/// `%` and `~/` always dispatch, division by zero is the receiver's business.
pub(super) fn invoke_slow(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    let opcode = i.opcode()?;
    invoke::invoke_method_site(i, opcode)
}

pub(super) fn negate(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    let value = i.local(0)?;
    let negated = i.boolean(value != i.boolean(true));
    i.set_local(0, negated)?;
    i.next(Opcode::Negate)
}

#[derive(PartialEq)]
enum NumberKind {
    Double,
    LargeInteger,
}

fn number_kind(i: &Interpreter<'_>, value: Value) -> Option<NumberKind> {
    match i.process.object(value)?.body {
        ObjectBody::Double(_) => Some(NumberKind::Double),
        ObjectBody::LargeInteger(_) => Some(NumberKind::LargeInteger),
        _ => None,
    }
}

/// Boxed numbers of the same kind compare by value, everything else by reference.
pub(super) fn identical(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    let (a, b) = (i.local(1)?, i.local(0)?);
    let result = match (number_kind(i, a), number_kind(i, b)) {
        (Some(x), Some(y)) if x == y && a != b => {
            i.save_state(Resume::Dispatch)?;
            let result = i.runtime.handle_identical(i.process, a, b);
            i.restore_state()?;
            result
        }
        _ => i.boolean(a == b),
    };
    complete(i, Opcode::Identical, result)
}

pub(super) fn identical_non_numeric(i: &mut Interpreter<'_>) -> Result<Flow, VmError> {
    let (a, b) = (i.local(1)?, i.local(0)?);
    let result = i.boolean(a == b);
    complete(i, Opcode::IdenticalNonNumeric, result)
}
