//! Signature-keyed compilation cache.
//!
//! Each `(function, argument types)` pair is compiled at most once. The first
//! caller for a key compiles inside the key's [`OnceLock`]; concurrent callers
//! for the same key wait on that lock only. Failures are stored like
//! successes, so a signature that does not compile keeps failing the same way
//! without being recompiled.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use itertools::Itertools;
use rustc_hash::FxBuildHasher;
use smallvec::SmallVec;

use crate::Ident;
use crate::compiler;
use crate::compiler::compiled::CompiledFunction;
use crate::engine::Engine;
use crate::error::compile::CompileError;
use crate::types::{TypeId, TypeTable};

/// Function name plus the ordered argument types it is specialized on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    pub function: Ident,
    pub args: SmallVec<[TypeId; 4]>,
}

impl Signature {
    pub fn new(function: Ident, args: impl IntoIterator<Item = TypeId>) -> Self {
        Self {
            function,
            args: args.into_iter().collect(),
        }
    }

    pub fn describe(&self, types: &TypeTable) -> String {
        format!(
            "{}({})",
            self.function,
            self.args.iter().map(|ty| types.name(*ty)).join(", ")
        )
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.function, self.args.iter().join(", "))
    }
}

type Slot = Arc<OnceLock<Result<Arc<CompiledFunction>, CompileError>>>;

#[derive(Debug, Default)]
pub struct Specializer {
    cache: DashMap<Signature, Slot, FxBuildHasher>,
    compilations: AtomicU64,
    cache_hits: AtomicU64,
}

impl Specializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_compile(
        &self,
        engine: &Engine,
        signature: &Signature,
    ) -> Result<Arc<CompiledFunction>, CompileError> {
        let slot = match self.cache.get(signature) {
            Some(slot) => Arc::clone(slot.value()),
            // The shard lock is released before compiling.
            None => Arc::clone(self.cache.entry(signature.clone()).or_default().value()),
        };

        if let Some(result) = slot.get() {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(signature = %signature, "cache hit");
            return result.clone();
        }

        slot.get_or_init(|| {
            self.compilations.fetch_add(1, Ordering::Relaxed);
            let types = engine.types();
            let result = compiler::compile(engine, types.as_ref(), signature).map(Arc::new);
            match &result {
                Ok(function) => tracing::debug!(
                    signature = %signature.describe(&types),
                    instructions = function.instructions(),
                    registers = function.registers,
                    "compiled"
                ),
                Err(e) => tracing::debug!(
                    signature = %signature.describe(&types),
                    error = %e,
                    "compilation failed"
                ),
            }
            result
        })
        .clone()
    }

    pub fn compilations(&self) -> u64 {
        self.compilations.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeDecl;

    #[test]
    fn test_describe_uses_type_names() {
        let engine = Engine::default();
        engine
            .declare_types(&[TypeDecl::record("Pair", &[("first", "u24"), ("second", "u24")])])
            .unwrap();
        let types = engine.types();
        let signature = Signature::new(
            Ident::new("swap"),
            [types.lookup(Ident::new("Pair")).unwrap(), types.scalar(24).unwrap()],
        );
        assert_eq!(signature.describe(&types), "swap(Pair, u24)");
    }

    #[test]
    fn test_failed_compilation_is_cached() {
        let engine = Engine::default();
        let signature = Signature::new(Ident::new("missing"), []);
        let specializer = Specializer::new();

        let first = specializer.get_or_compile(&engine, &signature);
        assert_eq!(first.clone().err(), Some(CompileError::UndefinedFunction("missing".into())));
        assert_eq!(specializer.get_or_compile(&engine, &signature).err(), first.err());
        assert_eq!(specializer.compilations(), 1);
        assert_eq!(specializer.cache_hits(), 1);
    }
}
