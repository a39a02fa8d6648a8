mod builder;
mod bytecode;
mod error;
mod heap;
mod interpreter;
mod lookup;
mod natives;
mod object;
mod process;
mod program;
mod runtime;
mod selector;
mod stack;
mod tagged;
mod visitor;

pub use builder::*;
pub use bytecode::*;
pub use error::*;
pub use heap::*;
pub use interpreter::{ExecutionResult, interpret};
pub use lookup::*;
pub use natives::*;
pub use object::*;
pub use process::*;
pub use program::*;
pub use runtime::*;
pub use selector::*;
pub use stack::*;
pub use tagged::*;
pub use visitor::{Visitable, Visitor};
