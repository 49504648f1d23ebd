//! Register machine for compiled specializations.
//!
//! Frames live on a heap stack and every frame's registers are a window of
//! one contiguous register vector, so recursion depth is bounded by memory
//! rather than by the native stack.

use std::sync::Arc;

use smallvec::SmallVec;

use super::compiled::CompiledFunction;
use super::instruction::{Args, FieldAccess, Op, Reg, Shape};
use crate::bridge;
use crate::engine::Engine;
use crate::error::Error;
use crate::error::runtime::RuntimeError;
use crate::repr::CompiledValue;
use crate::types::PackedField;
use crate::value::Uint;

/// Caller state saved across a call.
struct Frame {
    function: Arc<CompiledFunction>,
    /// Where to resume once the callee returns.
    pc: usize,
    base: usize,
    dst: Reg,
}

enum Step {
    Next,
    Jump(usize),
    Enter {
        callee: Arc<CompiledFunction>,
        dst: Reg,
        args: SmallVec<[CompiledValue; 4]>,
    },
    Leave(CompiledValue),
}

pub(crate) fn execute(
    engine: &Engine,
    function: Arc<CompiledFunction>,
    args: Vec<CompiledValue>,
) -> Result<CompiledValue, Error> {
    if args.len() != function.signature.args.len() {
        return Err(RuntimeError::ArityMismatch(
            function.signature.function.as_str(),
            function.signature.args.len(),
            args.len(),
        )
        .into());
    }

    let mut regs: Vec<CompiledValue> =
        Vec::with_capacity(engine.options().initial_register_capacity);
    regs.extend(args);
    regs.resize(function.registers.max(regs.len()), CompiledValue::Incomplete);

    let mut frames: Vec<Frame> = Vec::new();
    let mut current = function;
    let mut pc = 0usize;
    let mut base = 0usize;

    loop {
        let step = {
            let Some(op) = current.code.get(pc) else {
                return Err(RuntimeError::TypeMismatch(
                    current.signature.function.as_str(),
                    "missing return".to_string(),
                )
                .into());
            };
            let r = |reg: Reg| base + reg.index();

            match op {
                Op::Const { dst, value } => {
                    regs[r(*dst)] = CompiledValue::Scalar(*value);
                    Step::Next
                }
                Op::Move { dst, src } => {
                    regs[r(*dst)] = regs[r(*src)].clone();
                    Step::Next
                }
                Op::Incomplete { dst } => {
                    regs[r(*dst)] = CompiledValue::Incomplete;
                    Step::Next
                }
                Op::Binary { dst, op, bits, lhs, rhs } => {
                    let value = match (&regs[r(*lhs)], &regs[r(*rhs)]) {
                        (CompiledValue::Scalar(a), CompiledValue::Scalar(b)) => {
                            op.apply(*a, *b, *bits)?
                        }
                        (a, b) => {
                            return Err(RuntimeError::TypeMismatch(
                                op.symbol().to_string(),
                                format!("{}, {}", a.kind(), b.kind()),
                            )
                            .into());
                        }
                    };
                    regs[r(*dst)] = CompiledValue::Scalar(value);
                    Step::Next
                }
                Op::Construct { dst, tag, shape, args } => {
                    let value = construct(&regs, base, *tag, shape, args)?;
                    regs[r(*dst)] = value;
                    Step::Next
                }
                Op::SwitchTag { subject, table, default } => {
                    let target = regs[r(*subject)]
                        .tag()
                        .and_then(|tag| table.get(usize::from(tag)))
                        .unwrap_or(default);
                    Step::Jump(*target as usize)
                }
                Op::SwitchScalar { subject, cases, default } => {
                    let target = regs[r(*subject)]
                        .scalar()
                        .and_then(|n| cases.iter().find(|(case, _)| *case == n))
                        .map_or(*default, |(_, target)| *target);
                    Step::Jump(target as usize)
                }
                Op::Unpack { subject, fields } => {
                    for (dst, access) in fields {
                        let value = read_field(&regs[r(*subject)], *access)?;
                        regs[r(*dst)] = value;
                    }
                    Step::Next
                }
                Op::Field { dst, subject, access } => {
                    let value = read_field(&regs[r(*subject)], *access)?;
                    regs[r(*dst)] = value;
                    Step::Next
                }
                Op::Call { dst, site, args } => {
                    let callee = current.call_sites[*site as usize].bind(engine)?;
                    Step::Enter {
                        callee,
                        dst: *dst,
                        args: args.iter().map(|a| regs[r(*a)].clone()).collect(),
                    }
                }
                Op::CallSelf { dst, args } => Step::Enter {
                    callee: Arc::clone(&current),
                    dst: *dst,
                    args: args.iter().map(|a| regs[r(*a)].clone()).collect(),
                },
                Op::CallHost { dst, site, args } => {
                    let values: SmallVec<[CompiledValue; 4]> =
                        args.iter().map(|a| regs[r(*a)].clone()).collect();
                    let site = &current.host_sites[*site as usize];
                    let value = bridge::call_host(engine, site, &values)?;
                    regs[r(*dst)] = value;
                    Step::Next
                }
                Op::Jump { target } => Step::Jump(*target as usize),
                Op::Return { src } => Step::Leave(std::mem::take(&mut regs[r(*src)])),
            }
        };

        match step {
            Step::Next => pc += 1,
            Step::Jump(target) => pc = target,
            Step::Enter { callee, dst, args } => {
                let callee_base = regs.len();
                regs.extend(args);
                let frame_size = callee.registers.max(callee.signature.args.len());
                regs.resize(callee_base + frame_size, CompiledValue::Incomplete);
                frames.push(Frame {
                    function: std::mem::replace(&mut current, callee),
                    pc: pc + 1,
                    base,
                    dst,
                });
                pc = 0;
                base = callee_base;
            }
            Step::Leave(value) => {
                regs.truncate(base);
                match frames.pop() {
                    Some(frame) => {
                        regs[frame.base + frame.dst.index()] = value;
                        current = frame.function;
                        pc = frame.pc;
                        base = frame.base;
                    }
                    None => return Ok(value),
                }
            }
        }
    }
}

fn construct(
    regs: &[CompiledValue],
    base: usize,
    tag: u8,
    shape: &Shape,
    args: &Args,
) -> Result<CompiledValue, RuntimeError> {
    let stored = |value: &CompiledValue| -> Result<(), RuntimeError> {
        if value.is_incomplete() {
            Err(RuntimeError::TypeMismatch("construct".to_string(), value.kind().to_string()))
        } else {
            Ok(())
        }
    };

    match shape {
        Shape::Packed(slots) => {
            let mut word = u64::from(tag);
            for (arg, slot) in args.iter().zip(slots) {
                let value = &regs[base + arg.index()];
                stored(value)?;
                let n = value.scalar().ok_or_else(|| {
                    RuntimeError::TypeMismatch("construct".to_string(), value.kind().to_string())
                })?;
                word |= (n & Uint::mask(slot.bits)) << slot.shift;
            }
            Ok(CompiledValue::Packed(word))
        }
        Shape::Boxed(masks) => {
            let mut fields = Vec::with_capacity(args.len());
            for (arg, mask) in args.iter().zip(masks) {
                let value = &regs[base + arg.index()];
                stored(value)?;
                fields.push(match (mask, value) {
                    (Some(bits), CompiledValue::Scalar(n)) => {
                        CompiledValue::Scalar(n & Uint::mask(*bits))
                    }
                    _ => value.clone(),
                });
            }
            Ok(CompiledValue::boxed(tag, fields))
        }
    }
}

fn read_field(subject: &CompiledValue, access: FieldAccess) -> Result<CompiledValue, RuntimeError> {
    match (subject, access) {
        (CompiledValue::Packed(word), FieldAccess::Packed(PackedField { shift, bits })) => {
            Ok(CompiledValue::Scalar((word >> shift) & Uint::mask(bits)))
        }
        (CompiledValue::Boxed(boxed), FieldAccess::Boxed(index)) => boxed
            .fields
            .get(usize::from(index))
            .cloned()
            .ok_or_else(|| {
                RuntimeError::TypeMismatch("field".to_string(), "boxed record".to_string())
            }),
        (value, _) => Err(RuntimeError::TypeMismatch(
            "field".to_string(),
            value.kind().to_string(),
        )),
    }
}
