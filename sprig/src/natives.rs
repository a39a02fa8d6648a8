//! Built-in natives: numbers, arrays, coroutines and the port-style yield.
//!
//! A native receives its arguments (receiver first for methods) and returns either a
//! value or a failure. `Failure::RetryAfterGc` makes the interpreter collect and run
//! the same native again, so natives must not have side effects before they allocate.
use crate::{Failure, HeapObject, ObjectBody, Process, Program, Value};

pub type NativeFunction = fn(&mut NativeContext<'_>) -> Value;

/// Natives never see more arguments than this.
pub const MAX_NATIVE_ARITY: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct Native {
    pub name: &'static str,
    pub arity: u8,
    pub function: NativeFunction,
}

impl Native {
    pub const fn new(name: &'static str, arity: u8, function: NativeFunction) -> Self {
        Self {
            name,
            arity,
            function,
        }
    }
}

pub struct NativeContext<'a> {
    pub process: &'a mut Process,
    pub arguments: &'a [Value],
}

impl NativeContext<'_> {
    pub fn argument(&self, index: usize) -> Value {
        self.arguments
            .get(index)
            .copied()
            .unwrap_or_else(|| self.program().specials.null)
    }

    pub fn program(&self) -> &Program {
        self.process.program()
    }

    pub fn boolean(&self, value: bool) -> Value {
        self.program().specials.boolean(value)
    }

    pub fn object(&self, value: Value) -> Option<&HeapObject> {
        self.process.object(value)
    }

    /// Exact integer behind a smi or a large integer.
    pub fn integer(&self, value: Value) -> Option<i128> {
        if let Some(n) = value.as_smi() {
            return Some(i128::from(n));
        }
        match self.object(value)?.body {
            ObjectBody::LargeInteger(n) => Some(n),
            _ => None,
        }
    }

    pub fn double(&self, value: Value) -> Option<f64> {
        match self.object(value)?.body {
            ObjectBody::Double(d) => Some(d),
            _ => None,
        }
    }

    /// Smi when it fits, a fresh large integer otherwise.
    pub fn integer_result(&mut self, n: i128) -> Value {
        if let Some(smi) = Value::try_smi_i128(n) {
            return smi;
        }
        let class = self.program().specials.large_integer_class;
        self.allocate(class, ObjectBody::LargeInteger(n))
    }

    pub fn double_result(&mut self, d: f64) -> Value {
        let class = self.program().specials.double_class;
        self.allocate(class, ObjectBody::Double(d))
    }

    pub fn allocate(&mut self, class: Value, body: ObjectBody) -> Value {
        self.process
            .heap
            .allocate(class, body)
            .unwrap_or_else(Value::failure)
    }
}

enum Operands {
    Integers(i128, i128),
    Doubles(f64, f64),
}

fn operands(ctx: &NativeContext<'_>) -> Option<Operands> {
    let (a, b) = (ctx.argument(0), ctx.argument(1));
    if let (Some(x), Some(y)) = (ctx.integer(a), ctx.integer(b)) {
        return Some(Operands::Integers(x, y));
    }
    let x = ctx.double(a).or_else(|| ctx.integer(a).map(|n| n as f64))?;
    let y = ctx.double(b).or_else(|| ctx.integer(b).map(|n| n as f64))?;
    Some(Operands::Doubles(x, y))
}

fn arithmetic(
    ctx: &mut NativeContext<'_>,
    integer: fn(i128, i128) -> Option<i128>,
    double: fn(f64, f64) -> f64,
) -> Value {
    match operands(ctx) {
        Some(Operands::Integers(a, b)) => match integer(a, b) {
            Some(n) => ctx.integer_result(n),
            None => Value::failure(Failure::IllegalState),
        },
        Some(Operands::Doubles(a, b)) => ctx.double_result(double(a, b)),
        None => Value::failure(Failure::WrongArgumentType),
    }
}

fn comparison(
    ctx: &mut NativeContext<'_>,
    integer: fn(&i128, &i128) -> bool,
    double: fn(&f64, &f64) -> bool,
) -> Value {
    match operands(ctx) {
        Some(Operands::Integers(a, b)) => ctx.boolean(integer(&a, &b)),
        Some(Operands::Doubles(a, b)) => ctx.boolean(double(&a, &b)),
        None => Value::failure(Failure::WrongArgumentType),
    }
}

fn integer_binop(ctx: &mut NativeContext<'_>, op: fn(i128, i128) -> Result<i128, Failure>) -> Value {
    let (Some(a), Some(b)) = (ctx.integer(ctx.argument(0)), ctx.integer(ctx.argument(1))) else {
        return Value::failure(Failure::WrongArgumentType);
    };
    match op(a, b) {
        Ok(n) => ctx.integer_result(n),
        Err(failure) => Value::failure(failure),
    }
}

fn number_add(ctx: &mut NativeContext<'_>) -> Value {
    arithmetic(ctx, i128::checked_add, |a, b| a + b)
}

fn number_sub(ctx: &mut NativeContext<'_>) -> Value {
    arithmetic(ctx, i128::checked_sub, |a, b| a - b)
}

fn number_mul(ctx: &mut NativeContext<'_>) -> Value {
    arithmetic(ctx, i128::checked_mul, |a, b| a * b)
}

/// A number is never equal to a non-number.
fn number_eq(ctx: &mut NativeContext<'_>) -> Value {
    if operands(ctx).is_none() {
        return ctx.boolean(false);
    }
    comparison(ctx, i128::eq, f64::eq)
}

fn number_lt(ctx: &mut NativeContext<'_>) -> Value {
    comparison(ctx, i128::lt, f64::lt)
}

fn number_le(ctx: &mut NativeContext<'_>) -> Value {
    comparison(ctx, i128::le, f64::le)
}

fn number_gt(ctx: &mut NativeContext<'_>) -> Value {
    comparison(ctx, i128::gt, f64::gt)
}

fn number_ge(ctx: &mut NativeContext<'_>) -> Value {
    comparison(ctx, i128::ge, f64::ge)
}

fn integer_trunc_div(ctx: &mut NativeContext<'_>) -> Value {
    integer_binop(ctx, |a, b| {
        if b == 0 {
            return Err(Failure::DivisionByZero);
        }
        a.checked_div(b).ok_or(Failure::IllegalState)
    })
}

/// Euclidean modulo, the result is never negative.
fn integer_mod(ctx: &mut NativeContext<'_>) -> Value {
    integer_binop(ctx, |a, b| {
        if b == 0 {
            return Err(Failure::DivisionByZero);
        }
        a.checked_rem_euclid(b).ok_or(Failure::IllegalState)
    })
}

fn integer_bit_and(ctx: &mut NativeContext<'_>) -> Value {
    integer_binop(ctx, |a, b| Ok(a & b))
}

fn integer_bit_or(ctx: &mut NativeContext<'_>) -> Value {
    integer_binop(ctx, |a, b| Ok(a | b))
}

fn integer_bit_xor(ctx: &mut NativeContext<'_>) -> Value {
    integer_binop(ctx, |a, b| Ok(a ^ b))
}

fn integer_bit_not(ctx: &mut NativeContext<'_>) -> Value {
    match ctx.integer(ctx.argument(0)) {
        Some(n) => ctx.integer_result(!n),
        None => Value::failure(Failure::WrongArgumentType),
    }
}

fn integer_shl(ctx: &mut NativeContext<'_>) -> Value {
    integer_binop(ctx, |a, count| {
        let count = u32::try_from(count).map_err(|_| Failure::IndexOutOfBounds)?;
        let shifted = a.checked_shl(count).ok_or(Failure::IllegalState)?;
        if shifted >> count != a {
            return Err(Failure::IllegalState);
        }
        Ok(shifted)
    })
}

fn integer_shr(ctx: &mut NativeContext<'_>) -> Value {
    integer_binop(ctx, |a, count| {
        let count = u32::try_from(count).map_err(|_| Failure::IndexOutOfBounds)?;
        Ok(a >> count.min(127))
    })
}

fn double_div(ctx: &mut NativeContext<'_>) -> Value {
    match operands(ctx) {
        Some(Operands::Integers(a, b)) => ctx.double_result(a as f64 / b as f64),
        Some(Operands::Doubles(a, b)) => ctx.double_result(a / b),
        None => Value::failure(Failure::WrongArgumentType),
    }
}

fn array_new(ctx: &mut NativeContext<'_>) -> Value {
    let Some(length) = ctx.argument(0).as_smi() else {
        return Value::failure(Failure::WrongArgumentType);
    };
    let Ok(length) = usize::try_from(length) else {
        return Value::failure(Failure::IndexOutOfBounds);
    };
    let null = ctx.program().specials.null;
    let class = ctx.program().specials.array_class;
    ctx.allocate(class, ObjectBody::Array(vec![null; length].into()))
}

fn array_length(ctx: &mut NativeContext<'_>) -> Value {
    match ctx.object(ctx.argument(0)).map(|object| &object.body) {
        Some(ObjectBody::Array(elements)) => Value::smi(elements.len() as i64),
        _ => Value::failure(Failure::WrongArgumentType),
    }
}

fn coroutine_new(ctx: &mut NativeContext<'_>) -> Value {
    let function = ctx.argument(0);
    if ctx.program().function(function).is_none() {
        return Value::failure(Failure::WrongArgumentType);
    }
    ctx.process
        .spawn_coroutine(function)
        .unwrap_or_else(Value::failure)
}

fn coroutine_current(ctx: &mut NativeContext<'_>) -> Value {
    ctx.process.coroutine
}

fn coroutine_caller(ctx: &mut NativeContext<'_>) -> Value {
    let coroutine = ctx.process.coroutine;
    match ctx.object(coroutine).map(|object| &object.body) {
        Some(ObjectBody::Coroutine(coroutine)) => coroutine.caller,
        _ => ctx.program().specials.null,
    }
}

/// Yields the process with the message unless it is null.
fn port_send(ctx: &mut NativeContext<'_>) -> Value {
    ctx.argument(0)
}

pub const NATIVES: &[Native] = &[
    Native::new("number_add", 2, number_add),
    Native::new("number_sub", 2, number_sub),
    Native::new("number_mul", 2, number_mul),
    Native::new("number_eq", 2, number_eq),
    Native::new("number_lt", 2, number_lt),
    Native::new("number_le", 2, number_le),
    Native::new("number_gt", 2, number_gt),
    Native::new("number_ge", 2, number_ge),
    Native::new("integer_trunc_div", 2, integer_trunc_div),
    Native::new("integer_mod", 2, integer_mod),
    Native::new("integer_bit_and", 2, integer_bit_and),
    Native::new("integer_bit_or", 2, integer_bit_or),
    Native::new("integer_bit_xor", 2, integer_bit_xor),
    Native::new("integer_bit_not", 1, integer_bit_not),
    Native::new("integer_shl", 2, integer_shl),
    Native::new("integer_shr", 2, integer_shr),
    Native::new("double_div", 2, double_div),
    Native::new("array_new", 1, array_new),
    Native::new("array_length", 1, array_length),
    Native::new("coroutine_new", 1, coroutine_new),
    Native::new("coroutine_current", 0, coroutine_current),
    Native::new("coroutine_caller", 0, coroutine_caller),
    Native::new("port_send", 1, port_send),
];

/// Index of a built-in native, stable across programs.
pub fn native_index(name: &str) -> Option<u8> {
    NATIVES
        .iter()
        .position(|native| native.name == name)
        .and_then(|index| u8::try_from(index).ok())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{ProcessCreateInfo, ProgramBuilder, ProgramCreateInfo};

    fn process() -> Process {
        let program = ProgramBuilder::new(ProgramCreateInfo::default())
            .unwrap()
            .finish()
            .unwrap();
        Process::new(Arc::new(program), &ProcessCreateInfo::default()).unwrap()
    }

    fn call(process: &mut Process, name: &str, arguments: &[Value]) -> Value {
        let native = NATIVES[native_index(name).unwrap() as usize];
        let mut ctx = NativeContext {
            process,
            arguments,
        };
        (native.function)(&mut ctx)
    }

    #[test]
    fn add_promotes_past_smi_range() {
        let mut process = process();
        let result = call(
            &mut process,
            "number_add",
            &[Value::smi(Value::SMI_MAX), Value::smi(1)],
        );
        match process.object(result).map(|object| &object.body) {
            Some(ObjectBody::LargeInteger(n)) => assert_eq!(*n, i128::from(Value::SMI_MAX) + 1),
            other => panic!("expected a large integer, got {other:?}"),
        }

        let back = call(&mut process, "number_sub", &[result, Value::smi(1)]);
        assert_eq!(back, Value::smi(Value::SMI_MAX), "results fold back into smis");
    }

    #[test]
    fn division_by_zero_is_a_failure() {
        let mut process = process();
        let result = call(&mut process, "integer_trunc_div", &[Value::smi(1), Value::smi(0)]);
        assert_eq!(result.as_failure(), Some(Failure::DivisionByZero));
        let result = call(&mut process, "integer_mod", &[Value::smi(-7), Value::smi(3)]);
        assert_eq!(result, Value::smi(2));
    }

    #[test]
    fn wrong_argument_types_fail() {
        let mut process = process();
        let null = process.program().specials.null;
        let result = call(&mut process, "number_add", &[Value::smi(1), null]);
        assert_eq!(result.as_failure(), Some(Failure::WrongArgumentType));
    }

    #[test]
    fn numbers_are_unequal_to_other_objects() {
        let mut process = process();
        let specials = process.program().specials.clone();
        let result = call(&mut process, "number_eq", &[Value::smi(3), specials.null]);
        assert_eq!(result, specials.false_object);
        let result = call(&mut process, "number_eq", &[Value::smi(3), Value::smi(3)]);
        assert_eq!(result, specials.true_object);
    }

    #[test]
    fn shifts_detect_lost_bits() {
        let mut process = process();
        let result = call(&mut process, "integer_shl", &[Value::smi(1), Value::smi(70)]);
        assert!(process.object(result).is_some(), "1 << 70 is a large integer");
        let result = call(&mut process, "integer_shl", &[Value::smi(-1), Value::smi(-1)]);
        assert_eq!(result.as_failure(), Some(Failure::IndexOutOfBounds));
        let result = call(&mut process, "integer_shr", &[Value::smi(-8), Value::smi(200)]);
        assert_eq!(result, Value::smi(-1));
    }
}
