//! Specializing compiler for decorated functions.
//!
//! Compiling one [`Signature`] runs in three stages:
//!
//! 1. **Inference** (`infer`): return types of every specialization reachable
//!    from the signature are computed to a fixpoint, since recursive calls
//!    have no known result on the first pass.
//! 2. **Match planning** (`pattern`): each `match` becomes a tag or literal
//!    dispatch table, with unreachable arms dropped.
//! 3. **Code generation** (`compile`): the body is lowered to register
//!    instructions. Calls to other decorated functions become call sites that
//!    are bound through the cache the first time they run.
//!
//! The resulting [`CompiledFunction`] is executed by `machine`, which keeps
//! its frames on the heap so deep recursion never touches the native stack.

mod compile;
pub(crate) mod compiled;
mod infer;
pub(crate) mod instruction;
pub(crate) mod machine;
mod pattern;

use crate::engine::Engine;
use crate::error::compile::CompileError;
use crate::specializer::Signature;
use crate::types::TypeTable;
use compiled::CompiledFunction;

pub(crate) fn compile(
    engine: &Engine,
    types: &TypeTable,
    signature: &Signature,
) -> Result<CompiledFunction, CompileError> {
    let ctx = infer::Context::new(engine, types)?;
    let def = ctx.decorated(signature)?;
    let returns = infer::infer(&ctx, signature)?;
    compile::Compiler::new(&ctx, &returns, signature, &def).compile()
}
