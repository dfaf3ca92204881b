//! Per-function bytecode emission.
//!
//! A fresh compiler instance per top-level function: a recursive dispatch
//! over the expression tree that emits instructions and tracks the
//! register holding each subexpression's value in `last_register`.

use std::collections::HashMap;

use kiln_ir::{Expr, ExprId, Function, TensorType, Type, VarId};
use kiln_native::Target;
use kiln_vm::{Instruction, Reg, VMFunction};

use crate::context::CompilerContext;
use crate::engine::CompileEngine;
use crate::error::{CompileError, Result};

pub struct FuncCompiler<'a> {
    ctx: &'a mut CompilerContext,
    engine: &'a mut dyn CompileEngine,
    target: &'a Target,
    instructions: Vec<Instruction>,
    var_register_map: HashMap<VarId, Reg>,
    last_register: Reg,
    registers_num: u32,
}

impl<'a> FuncCompiler<'a> {
    pub fn new(
        ctx: &'a mut CompilerContext,
        engine: &'a mut dyn CompileEngine,
        target: &'a Target,
    ) -> Self {
        Self {
            ctx,
            engine,
            target,
            instructions: Vec::new(),
            var_register_map: HashMap::new(),
            last_register: 0,
            registers_num: 0,
        }
    }

    /// Compile one top-level function. Lifted closures bind the inner
    /// parameters first, then the captured outer parameters; that order
    /// matches the VM pushing arguments before the closure's captures.
    pub fn compile(mut self, name: &str, func: &Function) -> Result<VMFunction> {
        let params = if self.ctx.module.is_closure(func) {
            let Expr::Function(inner) = self.ctx.module.expr(func.body).clone() else {
                return Err(CompileError::internal("closure body is not a function"));
            };
            for &param in &inner.params {
                let reg = self.new_register();
                self.var_register_map.insert(param, reg);
            }
            for &param in &func.params {
                let reg = self.new_register();
                self.var_register_map.insert(param, reg);
            }
            self.visit(inner.body)?;
            func.params.len() + inner.params.len()
        } else {
            for &param in &func.params {
                let reg = self.new_register();
                self.var_register_map.insert(param, reg);
            }
            self.visit(func.body)?;
            func.params.len()
        };

        // the function returns its last evaluated expression
        let src = self.last_register;
        self.emit(Instruction::Ret { src });

        Ok(VMFunction {
            name: name.to_string(),
            params,
            instructions: self.instructions,
            registers_num: self.registers_num as usize,
        })
    }

    fn new_register(&mut self) -> Reg {
        let reg = self.registers_num;
        self.registers_num += 1;
        reg
    }

    fn emit(&mut self, instr: Instruction) {
        log::trace!("emit: {}", instr);
        if let Some(dst) = instr.dst() {
            self.last_register = dst;
        }
        self.instructions.push(instr);
    }

    fn visit(&mut self, id: ExprId) -> Result<()> {
        match self.ctx.module.expr(id).clone() {
            Expr::Constant(_) => {
                let index = *self
                    .ctx
                    .const_map
                    .get(&id)
                    .ok_or_else(|| CompileError::missing_at("constant not in pool", id))?;
                let dst = self.new_register();
                self.emit(Instruction::LoadConst { index, dst });
                Ok(())
            }
            Expr::Var(var) => {
                let reg = *self.var_register_map.get(&var).ok_or_else(|| {
                    let name = &self.ctx.module.var(var).name;
                    CompileError::missing_at(&format!("variable {} has no register", name), id)
                })?;
                self.last_register = reg;
                Ok(())
            }
            Expr::Global(_) => {
                Err(CompileError::unsupported("loading a global into a register", id))
            }
            Expr::Tuple(fields) => {
                let mut field_regs = Vec::with_capacity(fields.len());
                for field in fields {
                    self.visit(field)?;
                    field_regs.push(self.last_register);
                }
                let dst = self.new_register();
                self.emit(Instruction::AllocDatatype { tag: 0, fields: field_regs, dst });
                Ok(())
            }
            Expr::TupleGetItem { tuple, index } => {
                self.visit(tuple)?;
                let object = self.last_register;
                let dst = self.new_register();
                self.emit(Instruction::GetField { object, index, dst });
                Ok(())
            }
            Expr::Let { var, value, body } => {
                // a pure name binding: the variable shares the value's
                // register, no move
                self.visit(value)?;
                self.var_register_map.insert(var, self.last_register);
                self.visit(body)
            }
            Expr::If { cond, then_branch, else_branch } => {
                self.visit_if(cond, then_branch, else_branch)
            }
            Expr::Call { callee, args } => self.visit_call(id, callee, args),
            Expr::Function(func) => {
                if func.primitive {
                    Ok(())
                } else {
                    Err(CompileError::unsupported(
                        "local function not removed by lambda lifting",
                        id,
                    ))
                }
            }
            Expr::Constructor { .. } => {
                Err(CompileError::unsupported("constructor outside a call head", id))
            }
            Expr::Op(_) => Err(CompileError::unsupported("operator outside a primitive", id)),
            Expr::Match { .. } => Err(CompileError::unsupported("match", id)),
        }
    }

    fn visit_if(&mut self, cond: ExprId, then_branch: ExprId, else_branch: ExprId) -> Result<()> {
        self.visit(cond)?;
        let cond_register = self.last_register;

        let after_cond = self.instructions.len();
        self.emit(Instruction::If { cond: cond_register, true_offset: 0, false_offset: 0 });

        self.visit(then_branch)?;
        let true_register = self.last_register;
        self.emit(Instruction::Goto { offset: 0 });
        let after_true = self.instructions.len();

        self.visit(else_branch)?;
        let false_register = self.last_register;
        let after_false = self.instructions.len();

        // patch the placeholders now that both branch lengths are known
        match &mut self.instructions[after_cond] {
            Instruction::If { true_offset, false_offset, .. } => {
                *true_offset = 1;
                *false_offset = (after_true - after_cond) as i32;
            }
            _ => return Err(CompileError::internal("if placeholder moved")),
        }
        match &mut self.instructions[after_true - 1] {
            Instruction::Goto { offset } => *offset = (after_false - after_true) as i32 + 1,
            _ => return Err(CompileError::internal("goto placeholder moved")),
        }

        // both branches wrote different registers; converge them
        let dst = self.new_register();
        self.emit(Instruction::Select {
            cond: cond_register,
            if_true: true_register,
            if_false: false_register,
            dst,
        });
        Ok(())
    }

    fn visit_call(&mut self, id: ExprId, callee: ExprId, args: Vec<ExprId>) -> Result<()> {
        let mut args_registers = Vec::with_capacity(args.len());
        for arg in args {
            self.visit(arg)?;
            args_registers.push(self.last_register);
        }

        match self.ctx.module.expr(callee).clone() {
            Expr::Function(func) => {
                if !func.primitive {
                    return Err(CompileError::unsupported(
                        "call to a non-primitive function literal",
                        id,
                    ));
                }
                let ret = self
                    .ctx
                    .module
                    .checked_type(id)
                    .cloned()
                    .ok_or_else(|| CompileError::missing_at("call without checked type", id))?;
                self.emit_invoke_primitive(callee, &func, &args_registers, &ret)
            }
            Expr::Global(global) => {
                let func_index = *self.ctx.global_map.get(&global).ok_or_else(|| {
                    let name = &self.ctx.module.global(global).name;
                    CompileError::missing(&format!("global {} not in global map", name))
                })?;
                let func = self
                    .ctx
                    .module
                    .func(global)
                    .ok_or_else(|| {
                        let name = &self.ctx.module.global(global).name;
                        CompileError::missing(&format!("global {} has no definition", name))
                    })?
                    .clone();
                log::trace!(
                    "generating invoke for {} with func_index={}",
                    self.ctx.module.global(global).name,
                    func_index
                );
                let dst = self.new_register();
                if self.ctx.module.is_closure(&func) {
                    // the global is a lifted closure constructor; the call
                    // arguments are its captures
                    self.emit(Instruction::AllocClosure {
                        func_index,
                        captures: args_registers,
                        dst,
                    });
                } else {
                    self.emit(Instruction::Invoke { func_index, args: args_registers, dst });
                }
                Ok(())
            }
            Expr::Constructor { tag } => {
                let dst = self.new_register();
                self.emit(Instruction::AllocDatatype { tag, fields: args_registers, dst });
                Ok(())
            }
            Expr::Var(_) => {
                // the variable names a closure value
                self.visit(callee)?;
                let closure = self.last_register;
                let dst = self.new_register();
                self.emit(Instruction::InvokeClosure { closure, args: args_registers, dst });
                Ok(())
            }
            other => Err(CompileError::callee(other.kind_name(), id)),
        }
    }

    /// Lower a call to a primitive kernel: flatten tuple arguments,
    /// allocate output tensors, invoke the compile engine, and emit the
    /// packed call with inputs first and outputs last.
    fn emit_invoke_primitive(
        &mut self,
        callee: ExprId,
        func: &Function,
        args_registers: &[Reg],
        ret_type: &Type,
    ) -> Result<()> {
        if func.params.len() != args_registers.len() {
            return Err(CompileError::internal("primitive call arity mismatch"));
        }

        let mut packed_regs = Vec::new();
        let mut arity = 0usize;
        for (i, &param) in func.params.iter().enumerate() {
            let ty = self
                .ctx
                .module
                .var(param)
                .ty
                .clone()
                .ok_or_else(|| CompileError::missing("primitive parameter without a type"))?;
            match ty {
                Type::Tensor(_) => {
                    packed_regs.push(args_registers[i]);
                    arity += 1;
                }
                Type::Tuple(fields) => {
                    for (f, field) in fields.iter().enumerate() {
                        if field.as_tensor().is_none() {
                            return Err(CompileError::unsupported(
                                "nested tuple as kernel parameter",
                                callee,
                            ));
                        }
                        let dst = self.new_register();
                        self.emit(Instruction::GetField {
                            object: args_registers[i],
                            index: f,
                            dst,
                        });
                        packed_regs.push(dst);
                    }
                    arity += fields.len();
                }
                Type::Func(_) => {
                    return Err(CompileError::unsupported(
                        "function-typed kernel parameter",
                        callee,
                    ))
                }
            }
        }

        let mut output_regs = Vec::new();
        match ret_type {
            Type::Tensor(tt) => {
                output_regs.push(self.alloc_tensor(tt)?);
            }
            Type::Tuple(fields) => {
                for field in fields {
                    let tt = field.as_tensor().ok_or_else(|| {
                        CompileError::unsupported("non-tensor field in primitive return", callee)
                    })?;
                    output_regs.push(self.alloc_tensor(tt)?);
                }
            }
            Type::Func(_) => {
                return Err(CompileError::unsupported("unsupported return value type", callee))
            }
        }
        let return_count = output_regs.len();
        arity += return_count;
        packed_regs.extend_from_slice(&output_regs);

        let lowered = self.engine.lower(&self.ctx.module, callee, self.target)?;
        let [kernel] = &lowered.kernels[..] else {
            return Err(CompileError::kernel(&format!(
                "expected exactly one kernel per target, got {}",
                lowered.kernels.len()
            )));
        };
        let packed_index = self.ctx.add_lowered(kernel.clone());

        self.emit(Instruction::InvokePacked {
            packed_index,
            arity,
            return_count,
            args: packed_regs,
        });

        if return_count > 1 {
            // a tuple return: bundle the outputs into one register
            let dst = self.new_register();
            self.emit(Instruction::AllocDatatype { tag: 0, fields: output_regs, dst });
        }
        Ok(())
    }

    /// Emit the shape load and tensor allocation for one output; returns
    /// the destination register.
    fn alloc_tensor(&mut self, tt: &TensorType) -> Result<Reg> {
        let index = self
            .ctx
            .shape_map
            .get(tt)
            .map(|&(index, _)| index)
            .ok_or_else(|| CompileError::missing(&format!("no shape tensor for {}", tt)))?;
        let shape = self.new_register();
        self.emit(Instruction::LoadConst { index, dst: shape });
        let dst = self.new_register();
        self.emit(Instruction::AllocTensor { shape, dtype: tt.dtype, dst });
        Ok(dst)
    }
}
