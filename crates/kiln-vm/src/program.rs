//! Compiled program format.

use std::collections::HashMap;
use std::fmt;

use kiln_ir::Tensor;
use kiln_native::PackedFunc;

use crate::instruction::Instruction;

/// One compiled function: a linear instruction stream over dense virtual
/// registers. `params` counts every parameter; for a lifted closure that is
/// the inner argument count plus the capture count.
#[derive(Clone, Debug)]
pub struct VMFunction {
    pub name: String,
    pub params: usize,
    pub instructions: Vec<Instruction>,
    pub registers_num: usize,
}

impl fmt::Display for VMFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "fn {} params={} registers={}", self.name, self.params, self.registers_num)?;
        for (pc, instr) in self.instructions.iter().enumerate() {
            writeln!(f, "  {:3}: {}", pc, instr)?;
        }
        Ok(())
    }
}

/// A complete VM program, ready for the runtime interpreter.
pub struct VMProgram {
    /// Functions indexed by global index.
    pub functions: Vec<VMFunction>,
    /// The constant pool: literal tensors followed by derived shape
    /// tensors, in assignment order.
    pub constants: Vec<Tensor>,
    /// Packed kernel entry points, indexed by packed index. Holding these
    /// keeps the backing native artifact alive.
    pub packed_funcs: Vec<PackedFunc>,
    /// Function name to global index.
    pub global_map: HashMap<String, usize>,
}

impl VMProgram {
    pub fn function(&self, name: &str) -> Option<&VMFunction> {
        self.global_map.get(name).map(|&idx| &self.functions[idx])
    }

    /// Log every compiled function at debug level.
    pub fn dump(&self) {
        for func in &self.functions {
            log::debug!("Function: {}\n{}-------------", func.name, func);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::Instruction;

    #[test]
    fn function_display_numbers_instructions() {
        let func = VMFunction {
            name: "id".to_string(),
            params: 1,
            instructions: vec![Instruction::Ret { src: 0 }],
            registers_num: 1,
        };
        let text = func.to_string();
        assert!(text.starts_with("fn id params=1 registers=1"));
        assert!(text.contains("0: ret $0"));
    }
}
