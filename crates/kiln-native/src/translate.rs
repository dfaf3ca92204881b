//! Kernel to Cranelift IR translation.

use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::types::{F32, F64, I32, I64, I8};
use cranelift_codegen::ir::{
    AbiParam, Function, InstBuilder, MemFlags, Signature, Type, UserFuncName, Value,
};
use cranelift_codegen::isa::CallConv;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext, Variable};

use kiln_ir::DType;

use crate::kernel::{BinOp, Kernel, KernelBody, UnOp};

/// The packed-call ABI shared by every kernel entry point:
/// `fn(args: *const *mut u8, num_args: i64) -> i64` with data pointers
/// ordered inputs first, then outputs. Returns 0 on success.
pub fn packed_signature(call_conv: CallConv) -> Signature {
    let mut sig = Signature::new(call_conv);
    sig.params.push(AbiParam::new(I64));
    sig.params.push(AbiParam::new(I64));
    sig.returns.push(AbiParam::new(I64));
    sig
}

fn clif_type(dtype: DType) -> Type {
    match dtype {
        DType::Bool => I8,
        DType::Int32 => I32,
        DType::Int64 => I64,
        DType::Float32 => F32,
        DType::Float64 => F64,
    }
}

/// Translate one kernel into a Cranelift function. Shapes are static, so
/// every loop bound is an immediate.
pub fn translate_kernel(kernel: &Kernel, index: u32, call_conv: CallConv) -> Function {
    let sig = packed_signature(call_conv);
    let mut func = Function::with_name_signature(UserFuncName::user(0, index), sig);
    let mut fb_ctx = FunctionBuilderContext::new();
    let mut builder = FunctionBuilder::new(&mut func, &mut fb_ctx);

    let counter = Variable::from_u32(0);
    builder.declare_var(counter, I64);

    let entry = builder.create_block();
    builder.append_block_params_for_function_params(entry);
    builder.switch_to_block(entry);
    builder.seal_block(entry);
    let args_ptr = builder.block_params(entry)[0];

    let flags = MemFlags::trusted();
    let ptrs: Vec<Value> = (0..kernel.arity())
        .map(|i| builder.ins().load(I64, flags, args_ptr, (i * 8) as i32))
        .collect();

    match kernel.body.clone() {
        KernelBody::Binary { op, len, dtype } => {
            let ty = clif_type(dtype);
            let esz = dtype.byte_size() as i64;
            let (a, b, out) = (ptrs[0], ptrs[1], ptrs[2]);
            emit_loop(&mut builder, counter, len, |builder, i| {
                let off = builder.ins().imul_imm(i, esz);
                let pa = builder.ins().iadd(a, off);
                let pb = builder.ins().iadd(b, off);
                let po = builder.ins().iadd(out, off);
                let va = builder.ins().load(ty, flags, pa, 0);
                let vb = builder.ins().load(ty, flags, pb, 0);
                let r = emit_binop(builder, op, dtype, va, vb);
                builder.ins().store(flags, r, po, 0);
            });
        }
        KernelBody::Unary { op, len, dtype } => {
            let ty = clif_type(dtype);
            let esz = dtype.byte_size() as i64;
            let (a, out) = (ptrs[0], ptrs[1]);
            emit_loop(&mut builder, counter, len, |builder, i| {
                let off = builder.ins().imul_imm(i, esz);
                let pa = builder.ins().iadd(a, off);
                let po = builder.ins().iadd(out, off);
                let va = builder.ins().load(ty, flags, pa, 0);
                let r = emit_unop(builder, op, dtype, va);
                builder.ins().store(flags, r, po, 0);
            });
        }
        KernelBody::Split { parts, part_len, dtype } => {
            let ty = clif_type(dtype);
            let esz = dtype.byte_size() as i64;
            let input = ptrs[0];
            let outs = ptrs[1..1 + parts].to_vec();
            emit_loop(&mut builder, counter, part_len, |builder, i| {
                let off = builder.ins().imul_imm(i, esz);
                for (p, &out) in outs.iter().enumerate() {
                    let base = p as i64 * part_len * esz;
                    let src_off = builder.ins().iadd_imm(off, base);
                    let ps = builder.ins().iadd(input, src_off);
                    let v = builder.ins().load(ty, flags, ps, 0);
                    let po = builder.ins().iadd(out, off);
                    builder.ins().store(flags, v, po, 0);
                }
            });
        }
    }

    let zero = builder.ins().iconst(I64, 0);
    builder.ins().return_(&[zero]);
    builder.finalize();
    func
}

/// Emit a counted loop; leaves the builder positioned in the exit block.
fn emit_loop<F>(builder: &mut FunctionBuilder, counter: Variable, trip: i64, mut body: F)
where
    F: FnMut(&mut FunctionBuilder, Value),
{
    let header = builder.create_block();
    let body_block = builder.create_block();
    let exit = builder.create_block();

    let zero = builder.ins().iconst(I64, 0);
    builder.def_var(counter, zero);
    builder.ins().jump(header, &[]);

    builder.switch_to_block(header);
    let i = builder.use_var(counter);
    let limit = builder.ins().iconst(I64, trip);
    let cont = builder.ins().icmp(IntCC::SignedLessThan, i, limit);
    builder.ins().brif(cont, body_block, &[], exit, &[]);

    builder.switch_to_block(body_block);
    builder.seal_block(body_block);
    let i = builder.use_var(counter);
    body(builder, i);
    let next = builder.ins().iadd_imm(i, 1);
    builder.def_var(counter, next);
    builder.ins().jump(header, &[]);
    builder.seal_block(header);

    builder.switch_to_block(exit);
    builder.seal_block(exit);
}

fn emit_binop(
    builder: &mut FunctionBuilder,
    op: BinOp,
    dtype: DType,
    a: Value,
    b: Value,
) -> Value {
    if dtype.is_float() {
        match op {
            BinOp::Add => builder.ins().fadd(a, b),
            BinOp::Sub => builder.ins().fsub(a, b),
            BinOp::Mul => builder.ins().fmul(a, b),
            BinOp::Div => builder.ins().fdiv(a, b),
            BinOp::Max => builder.ins().fmax(a, b),
        }
    } else {
        match op {
            BinOp::Add => builder.ins().iadd(a, b),
            BinOp::Sub => builder.ins().isub(a, b),
            BinOp::Mul => builder.ins().imul(a, b),
            BinOp::Div => builder.ins().sdiv(a, b),
            BinOp::Max => builder.ins().smax(a, b),
        }
    }
}

fn emit_unop(builder: &mut FunctionBuilder, op: UnOp, dtype: DType, a: Value) -> Value {
    match op {
        UnOp::Neg => {
            if dtype.is_float() {
                builder.ins().fneg(a)
            } else {
                builder.ins().ineg(a)
            }
        }
        UnOp::Relu => {
            if dtype.is_float() {
                let zero = match dtype {
                    DType::Float32 => builder.ins().f32const(0.0f32),
                    _ => builder.ins().f64const(0.0f64),
                };
                builder.ins().fmax(a, zero)
            } else {
                let zero = builder.ins().iconst(clif_type(dtype), 0);
                builder.ins().smax(a, zero)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_kernel_translates_to_valid_ir() {
        let kernel = Kernel {
            name: "fused_add_0".to_string(),
            inputs: 2,
            outputs: 1,
            body: KernelBody::Binary { op: BinOp::Add, len: 4, dtype: DType::Float32 },
        };
        let func = translate_kernel(&kernel, 0, CallConv::SystemV);
        let text = func.display().to_string();
        assert!(text.contains("fadd"), "{}", text);
        // loop structure: a conditional branch and a back edge
        assert!(text.contains("brif"), "{}", text);
    }

    #[test]
    fn split_kernel_writes_every_part() {
        let kernel = Kernel {
            name: "fused_split_0".to_string(),
            inputs: 1,
            outputs: 2,
            body: KernelBody::Split { parts: 2, part_len: 2, dtype: DType::Float32 },
        };
        let func = translate_kernel(&kernel, 0, CallConv::SystemV);
        let text = func.display().to_string();
        // one load per part per iteration plus the three pointer loads
        assert_eq!(text.matches("load").count(), 5, "{}", text);
    }
}
