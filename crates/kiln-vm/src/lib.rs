//! Kiln VM bytecode: the instruction set and the compiled program format.

pub mod instruction;
pub mod program;

pub use instruction::{Instruction, Reg};
pub use program::{VMFunction, VMProgram};
