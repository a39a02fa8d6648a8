use std::fmt::Write as _;

use crate::{BuildError, CatchRange, Selector, Value};

/// Immediate layout following an opcode byte. Immediates are little endian.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Format {
    None,
    U8,
    U32,
    U8U8,
    U8U32,
    U32U32,
}

impl Format {
    /// Encoded instruction length, the opcode byte included.
    pub const fn length(self) -> usize {
        match self {
            Format::None => 1,
            Format::U8 => 2,
            Format::U32 => 5,
            Format::U8U8 => 3,
            Format::U8U32 => 6,
            Format::U32U32 => 9,
        }
    }
}

macro_rules! opcodes {
    ($($(#[doc = $doc:literal])* $name:ident: $format:ident),* $(,)?) => {
        /// Bytecode opcodes.
        #[repr(u8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Opcode {
            $($(#[doc = $doc])* $name),*
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[$(Opcode::$name),*];
            pub const COUNT: usize = Self::ALL.len();

            pub const fn format(self) -> Format {
                match self {
                    $(Opcode::$name => Format::$format),*
                }
            }

            pub const fn name(self) -> &'static str {
                match self {
                    $(Opcode::$name => stringify!($name)),*
                }
            }
        }
    };
}

opcodes! {
    LoadLocal0: None,
    LoadLocal1: None,
    LoadLocal2: None,
    LoadLocal3: None,
    LoadLocal4: None,
    LoadLocal5: None,
    /// Operands: `index:u8`
    LoadLocal: U8,
    /// Operands: `index:u32`
    LoadLocalWide: U32,
    /// Push the value held by the box in local `index`.
    /// Operands: `index:u8`
    LoadBoxed: U8,
    /// Operands: `static:u32`
    LoadStatic: U32,
    /// Like `LoadStatic`, but a static still holding an initializer runs it first.
    /// Operands: `static:u32`
    LoadStaticInit: U32,
    /// Replace the receiver on top with one of its fields.
    /// Operands: `field:u8`
    LoadField: U8,
    /// Operands: `field:u32`
    LoadFieldWide: U32,
    /// Push a literal of the current function.
    /// Operands: `literal:u32`
    LoadConst: U32,
    /// Operands: `index:u8`
    StoreLocal: U8,
    /// Store the top value into the box in local `index`.
    /// Operands: `index:u8`
    StoreBoxed: U8,
    /// Operands: `static:u32`
    StoreStatic: U32,
    /// `object value -- value`
    /// Operands: `field:u8`
    StoreField: U8,
    /// Operands: `field:u32`
    StoreFieldWide: U32,
    LoadLiteralNull: None,
    LoadLiteralTrue: None,
    LoadLiteralFalse: None,
    LoadLiteral0: None,
    LoadLiteral1: None,
    /// Operands: `value:u8`
    LoadLiteral: U8,
    /// Operands: `value:i32`
    LoadLiteralWide: U32,

    /// Cached virtual call.
    /// Operands: `selector:u32`
    InvokeMethodUnfold: U32,
    /// Dispatch-table virtual call, the selector id holds the row offset.
    /// Operands: `selector:u32`
    InvokeMethod: U32,
    /// Operands: `selector:u32`
    InvokeNoSuchMethod: U32,
    /// Operands: `selector:u32`
    InvokeTestNoSuchMethod: U32,
    /// Operands: `function literal:u32`
    InvokeStatic: U32,
    /// Operands: `function literal:u32`
    InvokeFactory: U32,
    /// Native that neither allocates nor blocks.
    /// Operands: `arity:u8`, `native:u8`
    InvokeLeafNative: U8U8,
    /// Operands: `arity:u8`, `native:u8`
    InvokeNative: U8U8,
    /// Operands: `arity:u8`, `native:u8`
    InvokeNativeYield: U8U8,
    /// Does the receiver on top understand the selector?
    /// Operands: `selector:u32`
    InvokeTestUnfold: U32,
    /// Operands: `selector:u32`
    InvokeTest: U32,
    /// Reflective call, the selector smi lives in a local of the current frame.
    /// Operands: `local:u32`
    InvokeSelector: U32,

    InvokeEqUnfold: U32,
    InvokeEq: U32,
    InvokeLtUnfold: U32,
    InvokeLt: U32,
    InvokeLeUnfold: U32,
    InvokeLe: U32,
    InvokeGtUnfold: U32,
    InvokeGt: U32,
    InvokeGeUnfold: U32,
    InvokeGe: U32,
    InvokeAddUnfold: U32,
    InvokeAdd: U32,
    InvokeSubUnfold: U32,
    InvokeSub: U32,
    InvokeModUnfold: U32,
    InvokeMod: U32,
    InvokeMulUnfold: U32,
    InvokeMul: U32,
    InvokeTruncDivUnfold: U32,
    InvokeTruncDiv: U32,
    InvokeBitNotUnfold: U32,
    InvokeBitNot: U32,
    InvokeBitAndUnfold: U32,
    InvokeBitAnd: U32,
    InvokeBitOrUnfold: U32,
    InvokeBitOr: U32,
    InvokeBitXorUnfold: U32,
    InvokeBitXor: U32,
    InvokeBitShrUnfold: U32,
    InvokeBitShr: U32,
    InvokeBitShlUnfold: U32,
    InvokeBitShl: U32,

    Pop: None,
    /// Operands: `count:u8`
    Drop: U8,
    Return: None,
    ReturnNull: None,

    /// Operands: `offset:u32`
    BranchWide: U32,
    BranchIfTrueWide: U32,
    BranchIfFalseWide: U32,
    /// Operands: `offset:u8`
    BranchBack: U8,
    BranchBackIfTrue: U8,
    BranchBackIfFalse: U8,
    BranchBackWide: U32,
    BranchBackIfTrueWide: U32,
    BranchBackIfFalseWide: U32,
    /// Operands: `pop:u8`, `offset:u32`
    PopAndBranchWide: U8U32,
    PopAndBranchBackWide: U8U32,

    /// `fields.. -- instance`
    /// Operands: `class literal:u32`
    Allocate: U32,
    AllocateImmutable: U32,
    AllocateBoxed: None,
    Negate: None,
    /// Operands: `slots:u32`
    StackOverflowCheck: U32,
    Throw: None,
    /// Operands: `delta:u32`, `return delta:u32`
    SubroutineCall: U32U32,
    SubroutineReturn: None,
    ProcessYield: None,
    /// `coroutine value -- value`
    CoroutineChange: None,
    Identical: None,
    IdenticalNonNumeric: None,
    EnterNoSuchMethod: None,
    ExitNoSuchMethod: None,
    /// Never executed, traps when reached.
    MethodEnd: None,
}

impl Opcode {
    pub const fn length(self) -> usize {
        self.format().length()
    }

    /// Instructions whose completion after a callee returns stores the result over the receiver.
    pub const fn is_method_invoke(self) -> bool {
        matches!(
            self,
            Opcode::InvokeMethodUnfold
                | Opcode::InvokeMethod
                | Opcode::InvokeNoSuchMethod
                | Opcode::InvokeEqUnfold
                | Opcode::InvokeEq
                | Opcode::InvokeLtUnfold
                | Opcode::InvokeLt
                | Opcode::InvokeLeUnfold
                | Opcode::InvokeLe
                | Opcode::InvokeGtUnfold
                | Opcode::InvokeGt
                | Opcode::InvokeGeUnfold
                | Opcode::InvokeGe
                | Opcode::InvokeAddUnfold
                | Opcode::InvokeAdd
                | Opcode::InvokeSubUnfold
                | Opcode::InvokeSub
                | Opcode::InvokeModUnfold
                | Opcode::InvokeMod
                | Opcode::InvokeMulUnfold
                | Opcode::InvokeMul
                | Opcode::InvokeTruncDivUnfold
                | Opcode::InvokeTruncDiv
                | Opcode::InvokeBitNotUnfold
                | Opcode::InvokeBitNot
                | Opcode::InvokeBitAndUnfold
                | Opcode::InvokeBitAnd
                | Opcode::InvokeBitOrUnfold
                | Opcode::InvokeBitOr
                | Opcode::InvokeBitXorUnfold
                | Opcode::InvokeBitXor
                | Opcode::InvokeBitShrUnfold
                | Opcode::InvokeBitShr
                | Opcode::InvokeBitShlUnfold
                | Opcode::InvokeBitShl
        )
    }

    /// Table call sites carry a row offset in the selector id.
    pub const fn is_table_invoke(self) -> bool {
        self.is_method_invoke()
            && !matches!(
                self,
                Opcode::InvokeMethodUnfold
                    | Opcode::InvokeNoSuchMethod
                    | Opcode::InvokeEqUnfold
                    | Opcode::InvokeLtUnfold
                    | Opcode::InvokeLeUnfold
                    | Opcode::InvokeGtUnfold
                    | Opcode::InvokeGeUnfold
                    | Opcode::InvokeAddUnfold
                    | Opcode::InvokeSubUnfold
                    | Opcode::InvokeModUnfold
                    | Opcode::InvokeMulUnfold
                    | Opcode::InvokeTruncDivUnfold
                    | Opcode::InvokeBitNotUnfold
                    | Opcode::InvokeBitAndUnfold
                    | Opcode::InvokeBitOrUnfold
                    | Opcode::InvokeBitXorUnfold
                    | Opcode::InvokeBitShrUnfold
                    | Opcode::InvokeBitShlUnfold
            )
    }
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        Self::ALL.get(byte as usize).copied().ok_or(byte)
    }
}

pub fn read_u8(bytecode: &[u8], offset: usize) -> Option<u8> {
    bytecode.get(offset).copied()
}

pub fn read_u32(bytecode: &[u8], offset: usize) -> Option<u32> {
    let bytes = bytecode.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Renders one instruction per line as `offset: Name operands`.
pub fn disassemble(bytecode: &[u8]) -> String {
    let mut out = String::new();
    let mut offset = 0;
    while offset < bytecode.len() {
        let Ok(opcode) = Opcode::try_from(bytecode[offset]) else {
            let _ = writeln!(out, "{offset:5}: <invalid {:#04x}>", bytecode[offset]);
            offset += 1;
            continue;
        };
        let _ = write!(out, "{offset:5}: {}", opcode.name());
        let byte = |at: usize| read_u8(bytecode, offset + at).unwrap_or(0);
        let word = |at: usize| read_u32(bytecode, offset + at).unwrap_or(0);
        let _ = match opcode.format() {
            Format::None => Ok(()),
            Format::U8 => write!(out, " {}", byte(1)),
            Format::U32 => write!(out, " {}", word(1)),
            Format::U8U8 => write!(out, " {} {}", byte(1), byte(2)),
            Format::U8U32 => write!(out, " {} {}", byte(1), word(2)),
            Format::U32U32 => write!(out, " {} {}", word(1), word(5)),
        };
        out.push('\n');
        offset += opcode.length();
    }
    out
}

/// A forward branch whose offset has not yet been resolved.
///
/// Created by [`BytecodeWriter::branch`] and friends, resolve it with
/// [`BytecodeWriter::bind`].
#[derive(Debug)]
#[must_use]
pub struct Label {
    /// Position of the u32 offset bytes in the buffer.
    offset_pos: usize,
    /// Start of the branch instruction, offsets are relative to it.
    base: usize,
}

/// Output of a [`BytecodeWriter`], ready to become a function.
#[derive(Debug, Clone, Default)]
pub struct Code {
    pub bytecode: Vec<u8>,
    pub literals: Vec<Value>,
    pub catch_ranges: Vec<CatchRange>,
}

/// Builds a bytecode byte sequence together with its literal pool.
#[derive(Debug, Default)]
pub struct BytecodeWriter {
    buf: Vec<u8>,
    literals: Vec<Value>,
    catch_ranges: Vec<CatchRange>,
    unbound: usize,
}

impl BytecodeWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current byte offset in the bytecode stream.
    pub fn position(&self) -> usize {
        self.buf.len()
    }

    pub fn finish(self) -> Result<Code, BuildError> {
        if self.unbound != 0 {
            return Err(BuildError::UnboundLabel);
        }
        Ok(Code {
            bytecode: self.buf,
            literals: self.literals,
            catch_ranges: self.catch_ranges,
        })
    }

    /// Index of `value` in the literal pool, adding it on first use.
    pub fn literal(&mut self, value: Value) -> u32 {
        if let Some(index) = self.literals.iter().position(|&v| v == value) {
            return index as u32;
        }
        self.literals.push(value);
        (self.literals.len() - 1) as u32
    }

    /// Registers a handler for exceptions thrown while executing `[start, end)`.
    pub fn catch_range(&mut self, start: usize, end: usize, handler: usize, stack_height: usize) {
        self.catch_ranges.push(CatchRange {
            start,
            end,
            handler,
            stack_height,
        });
    }

    // ── emit helpers ───────────────────────────────────────────────

    fn emit_op(&mut self, op: Opcode) {
        self.buf.push(op as u8);
    }

    fn emit_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn emit_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn op(&mut self, op: Opcode) {
        debug_assert_eq!(op.format(), Format::None);
        self.emit_op(op);
    }

    pub fn op_u8(&mut self, op: Opcode, operand: u8) {
        debug_assert_eq!(op.format(), Format::U8);
        self.emit_op(op);
        self.emit_u8(operand);
    }

    pub fn op_u32(&mut self, op: Opcode, operand: u32) {
        debug_assert_eq!(op.format(), Format::U32);
        self.emit_op(op);
        self.emit_u32(operand);
    }

    // ── loads and stores ───────────────────────────────────────────

    pub fn load_local(&mut self, index: usize) {
        match index {
            0 => self.emit_op(Opcode::LoadLocal0),
            1 => self.emit_op(Opcode::LoadLocal1),
            2 => self.emit_op(Opcode::LoadLocal2),
            3 => self.emit_op(Opcode::LoadLocal3),
            4 => self.emit_op(Opcode::LoadLocal4),
            5 => self.emit_op(Opcode::LoadLocal5),
            _ => match u8::try_from(index) {
                Ok(index) => self.op_u8(Opcode::LoadLocal, index),
                Err(_) => self.op_u32(Opcode::LoadLocalWide, index as u32),
            },
        }
    }

    pub fn store_local(&mut self, index: u8) {
        self.op_u8(Opcode::StoreLocal, index);
    }

    pub fn load_field(&mut self, field: usize) {
        match u8::try_from(field) {
            Ok(field) => self.op_u8(Opcode::LoadField, field),
            Err(_) => self.op_u32(Opcode::LoadFieldWide, field as u32),
        }
    }

    pub fn store_field(&mut self, field: usize) {
        match u8::try_from(field) {
            Ok(field) => self.op_u8(Opcode::StoreField, field),
            Err(_) => self.op_u32(Opcode::StoreFieldWide, field as u32),
        }
    }

    pub fn load_const(&mut self, value: Value) {
        let index = self.literal(value);
        self.op_u32(Opcode::LoadConst, index);
    }

    /// Picks the shortest encoding, falling back to a literal for wide smis.
    pub fn load_literal(&mut self, value: i64) {
        match value {
            0 => self.emit_op(Opcode::LoadLiteral0),
            1 => self.emit_op(Opcode::LoadLiteral1),
            _ => {
                if let Ok(byte) = u8::try_from(value) {
                    self.op_u8(Opcode::LoadLiteral, byte);
                } else if let Ok(word) = i32::try_from(value) {
                    self.op_u32(Opcode::LoadLiteralWide, word as u32);
                } else {
                    self.load_const(Value::smi(value));
                }
            }
        }
    }

    // ── calls ──────────────────────────────────────────────────────

    pub fn invoke(&mut self, op: Opcode, selector: Selector) {
        debug_assert!(op.is_method_invoke() || matches!(op, Opcode::InvokeTest | Opcode::InvokeTestUnfold | Opcode::InvokeTestNoSuchMethod));
        self.op_u32(op, selector.raw());
    }

    pub fn invoke_static(&mut self, function: Value) {
        let index = self.literal(function);
        self.op_u32(Opcode::InvokeStatic, index);
    }

    pub fn invoke_factory(&mut self, function: Value) {
        let index = self.literal(function);
        self.op_u32(Opcode::InvokeFactory, index);
    }

    pub fn invoke_native(&mut self, op: Opcode, arity: u8, native: u8) {
        debug_assert_eq!(op.format(), Format::U8U8);
        self.emit_op(op);
        self.emit_u8(arity);
        self.emit_u8(native);
    }

    pub fn allocate(&mut self, class: Value, immutable: bool) {
        let index = self.literal(class);
        let op = if immutable {
            Opcode::AllocateImmutable
        } else {
            Opcode::Allocate
        };
        self.op_u32(op, index);
    }

    pub fn subroutine_call(&mut self, delta: u32, return_delta: u32) {
        self.emit_op(Opcode::SubroutineCall);
        self.emit_u32(delta);
        self.emit_u32(return_delta);
    }

    // ── branches ───────────────────────────────────────────────────

    fn emit_branch_placeholder(&mut self, op: Opcode) -> Label {
        let base = self.buf.len();
        self.emit_op(op);
        let offset_pos = self.buf.len();
        self.emit_u32(0); // placeholder
        self.unbound += 1;
        Label { offset_pos, base }
    }

    pub fn branch(&mut self) -> Label {
        self.emit_branch_placeholder(Opcode::BranchWide)
    }

    pub fn branch_if_true(&mut self) -> Label {
        self.emit_branch_placeholder(Opcode::BranchIfTrueWide)
    }

    pub fn branch_if_false(&mut self) -> Label {
        self.emit_branch_placeholder(Opcode::BranchIfFalseWide)
    }

    pub fn pop_and_branch(&mut self, pop: u8) -> Label {
        let base = self.buf.len();
        self.emit_op(Opcode::PopAndBranchWide);
        self.emit_u8(pop);
        let offset_pos = self.buf.len();
        self.emit_u32(0);
        self.unbound += 1;
        Label { offset_pos, base }
    }

    /// Bind a forward branch label to the current position.
    pub fn bind(&mut self, label: Label) {
        let offset = (self.buf.len() - label.base) as u32;
        self.buf[label.offset_pos..label.offset_pos + 4].copy_from_slice(&offset.to_le_bytes());
        self.unbound -= 1;
    }

    fn emit_branch_back(&mut self, short: Opcode, wide: Opcode, target: usize) {
        let offset = self.buf.len() - target;
        match u8::try_from(offset) {
            Ok(offset) => self.op_u8(short, offset),
            Err(_) => self.op_u32(wide, offset as u32),
        }
    }

    /// Backward branch to `target`, a position obtained from [`position`](Self::position).
    pub fn branch_back(&mut self, target: usize) {
        self.emit_branch_back(Opcode::BranchBack, Opcode::BranchBackWide, target);
    }

    pub fn branch_back_if_true(&mut self, target: usize) {
        self.emit_branch_back(Opcode::BranchBackIfTrue, Opcode::BranchBackIfTrueWide, target);
    }

    pub fn branch_back_if_false(&mut self, target: usize) {
        self.emit_branch_back(Opcode::BranchBackIfFalse, Opcode::BranchBackIfFalseWide, target);
    }

    pub fn pop_and_branch_back(&mut self, pop: u8, target: usize) {
        let offset = self.buf.len() - target;
        self.emit_op(Opcode::PopAndBranchBackWide);
        self.emit_u8(pop);
        self.emit_u32(offset as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcodes_round_trip_through_bytes() {
        assert!(Opcode::COUNT <= u8::MAX as usize);
        for (byte, &opcode) in Opcode::ALL.iter().enumerate() {
            assert_eq!(opcode as usize, byte);
            assert_eq!(Opcode::try_from(byte as u8), Ok(opcode));
        }
        assert_eq!(Opcode::try_from(Opcode::COUNT as u8), Err(Opcode::COUNT as u8));
    }

    #[test]
    fn table_and_unfold_forms_are_classified() {
        assert!(Opcode::InvokeAdd.is_table_invoke());
        assert!(!Opcode::InvokeAddUnfold.is_table_invoke());
        assert!(Opcode::InvokeAddUnfold.is_method_invoke());
        assert!(!Opcode::InvokeStatic.is_method_invoke());
        assert_eq!(Opcode::InvokeAdd.length(), 5);
        assert_eq!(Opcode::SubroutineCall.length(), 9);
    }

    #[test]
    fn forward_labels_are_relative_to_the_branch() {
        let mut writer = BytecodeWriter::new();
        writer.load_literal(1);
        let label = writer.branch_if_false();
        writer.load_literal(2);
        writer.bind(label);
        writer.op(Opcode::Return);
        let code = writer.finish().unwrap();

        assert_eq!(code.bytecode[1], Opcode::BranchIfFalseWide as u8);
        assert_eq!(read_u32(&code.bytecode, 2), Some(7));
        assert_eq!(code.bytecode[1 + 7], Opcode::Return as u8);
    }

    #[test]
    fn unbound_labels_are_rejected() {
        let mut writer = BytecodeWriter::new();
        let _label = writer.branch();
        assert!(matches!(writer.finish(), Err(BuildError::UnboundLabel)));
    }

    #[test]
    fn literals_are_deduplicated_and_widened() {
        let mut writer = BytecodeWriter::new();
        writer.load_literal(300);
        writer.load_literal(-5);
        writer.load_literal(Value::SMI_MAX);
        writer.load_literal(Value::SMI_MAX);
        let code = writer.finish().unwrap();
        assert_eq!(code.literals, vec![Value::smi(Value::SMI_MAX)]);

        let listing = disassemble(&code.bytecode);
        assert!(listing.contains("LoadLiteralWide 300"));
        assert!(listing.contains("LoadConst 0"));
    }
}
