//! Compiled specializations.

use std::fmt;
use std::sync::{Arc, OnceLock};

use super::instruction::Op;
use crate::Ident;
use crate::bridge::HostCallee;
use crate::engine::Engine;
use crate::error::compile::CompileError;
use crate::specializer::Signature;
use crate::types::TypeId;

/// One immutable specialization of a decorated function for one signature.
///
/// Owned by the compilation cache and shared by every caller.
#[derive(Debug)]
pub struct CompiledFunction {
    pub signature: Signature,
    pub code: Vec<Op>,
    /// Registers the frame needs, parameters included.
    pub registers: usize,
    pub call_sites: Vec<CallSite>,
    pub host_sites: Vec<HostSite>,
    /// `None` when every path yields the sentinel.
    pub returns: Option<TypeId>,
}

impl CompiledFunction {
    pub fn instructions(&self) -> usize {
        self.code.len()
    }
}

impl fmt::Display for CompiledFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}:", self.signature.function)?;
        for (pc, op) in self.code.iter().enumerate() {
            writeln!(f, "{:>4}  {}", pc, op)?;
        }
        Ok(())
    }
}

/// A call to another decorated specialization.
///
/// The target is bound on first execution, so compiling one function never
/// compiles its callees.
#[derive(Debug)]
pub struct CallSite {
    pub signature: Signature,
    entry: OnceLock<Arc<CompiledFunction>>,
}

impl CallSite {
    pub(crate) fn new(signature: Signature) -> Self {
        Self {
            signature,
            entry: OnceLock::new(),
        }
    }

    pub(crate) fn bind(&self, engine: &Engine) -> Result<Arc<CompiledFunction>, CompileError> {
        if let Some(entry) = self.entry.get() {
            return Ok(Arc::clone(entry));
        }
        let compiled = engine.specializer().get_or_compile(engine, &self.signature)?;
        tracing::trace!(callee = %self.signature.function, "bound call site");
        Ok(Arc::clone(self.entry.get_or_init(|| compiled)))
    }

    pub fn is_bound(&self) -> bool {
        self.entry.get().is_some()
    }
}

/// A call from compiled code back into a host function.
#[derive(Debug)]
pub struct HostSite {
    pub name: Ident,
    pub(crate) function: HostCallee,
    /// Static argument types; `None` for arguments that are always the
    /// sentinel.
    pub params: Vec<Option<TypeId>>,
    pub returns: Option<TypeId>,
}
