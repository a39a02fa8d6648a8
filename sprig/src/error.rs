use std::fmt;

use crate::{Failure, Opcode, Resume, Value};

/// Broken invariants. Guest-level errors travel as thrown objects instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmError {
    InvalidOpcode { byte: u8, bcp: usize },
    TruncatedInstruction { opcode: Opcode, bcp: usize },
    /// `MethodEnd` is never reached by well-formed code
    MethodEnd { bcp: usize },
    /// branch target outside the function's bytecode
    InvalidBranch { bcp: usize, offset: u32 },
    StackUnderflow,
    MissingSavedState,
    UnexpectedResume(Resume),
    CorruptFrame { fp: usize },
    InvalidReturnSite { opcode: Opcode },
    NotAFunction(Value),
    ArityMismatch { expected: usize, actual: usize },
    NotAClass(Value),
    NotAnObject(Value),
    InvalidField { object: Value, field: usize },
    InvalidLiteral(u32),
    InvalidStatic(u32),
    InvalidNative(u8),
    ReadOnlyObject(Value),
    UnexpectedFailure(Failure),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::InvalidOpcode { byte, bcp } => {
                write!(f, "invalid opcode {byte:#04x} at {bcp}")
            }
            VmError::TruncatedInstruction { opcode, bcp } => {
                write!(f, "truncated {} at {bcp}", opcode.name())
            }
            VmError::MethodEnd { bcp } => write!(f, "reached MethodEnd at {bcp}"),
            VmError::InvalidBranch { bcp, offset } => {
                write!(f, "branch at {bcp} by {offset} leaves the function")
            }
            VmError::StackUnderflow => write!(f, "stack underflow"),
            VmError::MissingSavedState => write!(f, "no saved state on the stack"),
            VmError::UnexpectedResume(resume) => write!(f, "unexpected resume point {resume:?}"),
            VmError::CorruptFrame { fp } => write!(f, "corrupt frame at {fp}"),
            VmError::InvalidReturnSite { opcode } => {
                write!(f, "cannot return into {}", opcode.name())
            }
            VmError::NotAFunction(value) => write!(f, "{value:?} is not a function"),
            VmError::ArityMismatch { expected, actual } => {
                write!(f, "expected {expected} arguments, got {actual}")
            }
            VmError::NotAClass(value) => write!(f, "{value:?} is not a class"),
            VmError::NotAnObject(value) => write!(f, "{value:?} is not a heap object"),
            VmError::InvalidField { object, field } => {
                write!(f, "{object:?} has no field {field}")
            }
            VmError::InvalidLiteral(index) => write!(f, "no literal {index}"),
            VmError::InvalidStatic(index) => write!(f, "no static {index}"),
            VmError::InvalidNative(index) => write!(f, "no native {index}"),
            VmError::ReadOnlyObject(value) => write!(f, "{value:?} lives in program space"),
            VmError::UnexpectedFailure(failure) => write!(f, "unexpected failure {failure:?}"),
        }
    }
}

impl std::error::Error for VmError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    UnboundLabel,
    TooManyClasses(u32),
    TooManyNatives,
    TooManySelectors,
    NotAClass(Value),
    NotAFunction(Value),
    UnknownNative(&'static str),
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildError::UnboundLabel => write!(f, "bytecode has an unbound label"),
            BuildError::TooManyClasses(max) => write!(f, "more than {max} classes"),
            BuildError::TooManyNatives => write!(f, "native table is full"),
            BuildError::TooManySelectors => write!(f, "selector ids exhausted"),
            BuildError::NotAClass(value) => write!(f, "{value:?} is not a class"),
            BuildError::NotAFunction(value) => write!(f, "{value:?} is not a function"),
            BuildError::UnknownNative(name) => write!(f, "unknown native {name}"),
        }
    }
}

impl std::error::Error for BuildError {}
