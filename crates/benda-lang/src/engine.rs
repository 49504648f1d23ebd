use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use rustc_hash::FxBuildHasher;
use serde::Deserialize;

use crate::ast::FunctionDef;
use crate::bridge::{self, FunctionKind, NativeFunction, ResolvedNative};
use crate::compiler::compiled::CompiledFunction;
use crate::error::Error;
use crate::error::compile::CompileError;
use crate::error::runtime::RuntimeError;
use crate::eval::{Evaluator, Mode};
use crate::repr::{self, CompiledValue};
use crate::specializer::{Signature, Specializer};
use crate::types::{TypeDecl, TypeId, TypeRegistry, TypeTable};
use crate::value::Value;
use crate::{BendaResult, Ident, Uint};

pub const DEFAULT_MAX_HOST_DEPTH: u32 = 256;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Width of integer literals and of untyped host integers.
    pub default_scalar_bits: u8,
    pub initial_register_capacity: usize,
    /// Nesting limit of the host interpreter, which recurses natively.
    pub max_host_depth: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            default_scalar_bits: Uint::DEFAULT_BITS,
            initial_register_capacity: 1024,
            max_host_depth: DEFAULT_MAX_HOST_DEPTH,
        }
    }
}

impl Options {
    pub fn from_toml_str(s: &str) -> Result<Self, Error> {
        toml::from_str(s).map_err(|e| Error::InvalidOptions(e.to_string()))
    }

    fn validate(&self) -> Result<(), Error> {
        if !(1..=64).contains(&self.default_scalar_bits) {
            return Err(Error::InvalidOptions(format!(
                "default_scalar_bits must be within 1..=64, got {}",
                self.default_scalar_bits
            )));
        }
        if self.max_host_depth == 0 {
            return Err(Error::InvalidOptions("max_host_depth must be positive".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
    /// Specializations compiled, failures included.
    pub compilations: u64,
    pub cache_hits: u64,
    /// Host calls into compiled code.
    pub executions: u64,
}

#[derive(Debug)]
struct EngineInner {
    options: Options,
    types: TypeRegistry,
    functions: DashMap<Ident, Arc<FunctionKind>, FxBuildHasher>,
    specializer: Specializer,
    executions: AtomicU64,
}

/// Owns the type registry, the function table and the compilation cache.
///
/// Cloning is cheap and every clone shares the same state, so one engine can
/// serve many threads.
#[derive(Debug, Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Default for Engine {
    fn default() -> Self {
        let options = Options::default();
        let types = TypeRegistry::new();
        // The default width is always within range, so this cannot fail.
        let _ = types.scalar(options.default_scalar_bits);
        Self::with_registry(options, types)
    }
}

impl Engine {
    pub fn new(options: Options) -> Result<Self, Error> {
        options.validate()?;
        let types = TypeRegistry::new();
        types.scalar(options.default_scalar_bits)?;
        Ok(Self::with_registry(options, types))
    }

    fn with_registry(options: Options, types: TypeRegistry) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                options,
                types,
                functions: DashMap::default(),
                specializer: Specializer::new(),
                executions: AtomicU64::new(0),
            }),
        }
    }

    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    pub fn declare_types(&self, decls: &[TypeDecl]) -> Result<Vec<TypeId>, Error> {
        Ok(self.inner.types.declare(decls)?)
    }

    pub fn type_id(&self, name: &str) -> Option<TypeId> {
        self.inner.types.lookup(name)
    }

    /// Snapshot of the registered types.
    pub fn types(&self) -> Arc<TypeTable> {
        self.inner.types.view()
    }

    /// Marks `def` as decorated: calls to it are specialized and compiled.
    pub fn jit(&self, def: FunctionDef) -> Result<JitFunction, Error> {
        let name = def.name;
        self.insert(name, FunctionKind::Jit(Arc::new(def)))?;
        Ok(JitFunction {
            engine: self.clone(),
            name,
        })
    }

    /// Registers an undecorated host function; it is always interpreted.
    pub fn define(&self, def: FunctionDef) -> Result<(), Error> {
        let name = def.name;
        self.insert(name, FunctionKind::Host(Arc::new(def)))
    }

    pub fn define_native(&self, function: NativeFunction) -> Result<(), Error> {
        let resolve = |name: Ident| -> Result<TypeId, Error> {
            match self.inner.types.lookup(&name.as_str()) {
                Some(id) => Ok(id),
                None => match crate::types::scalar_width(&name.as_str()) {
                    Some(bits) => Ok(self.inner.types.scalar(bits)?),
                    None => Err(CompileError::type_error(format!(
                        "native \"{}\" names unknown type \"{}\"",
                        function.name, name
                    ))
                    .into()),
                },
            }
        };
        let params = function
            .params
            .iter()
            .map(|p| resolve(*p))
            .collect::<Result<Vec<_>, _>>()?;
        let returns = resolve(function.returns)?;
        let name = function.name;
        self.insert(
            name,
            FunctionKind::Native(ResolvedNative {
                function,
                params,
                returns,
            }),
        )
    }

    fn insert(&self, name: Ident, kind: FunctionKind) -> Result<(), Error> {
        if self.type_id(&name.as_str()).is_some() {
            return Err(CompileError::type_error(format!(
                "\"{}\" is already a type; functions and record constructors share one namespace",
                name
            ))
            .into());
        }
        // Existing specializations keep the definition they were compiled from.
        self.inner.functions.insert(name, Arc::new(kind));
        Ok(())
    }

    pub(crate) fn function(&self, name: Ident) -> Option<Arc<FunctionKind>> {
        self.inner.functions.get(&name).map(|f| Arc::clone(f.value()))
    }

    pub(crate) fn specializer(&self) -> &Specializer {
        &self.inner.specializer
    }

    /// Calls a function by name the way host code would.
    pub fn call(&self, name: &str, args: &[Value]) -> BendaResult {
        let name = Ident::new(name);
        let function = self
            .function(name)
            .ok_or_else(|| RuntimeError::NotDefined(name.as_str()))?;
        match &*function {
            FunctionKind::Jit(_) => self.call_jit(name, args),
            FunctionKind::Host(def) => {
                Evaluator::new(self, Mode::Host).call_function(def, args.to_vec())
            }
            FunctionKind::Native(native) => bridge::call_native(self, native, args),
        }
    }

    /// Specialize-and-run protocol for a decorated function: signature from
    /// the argument shapes, cache lookup (compiling on a miss), execution.
    pub(crate) fn call_jit(&self, name: Ident, args: &[Value]) -> BendaResult {
        let function = self.specialization(name, args)?;
        self.inner.executions.fetch_add(1, Ordering::Relaxed);
        bridge::run_compiled(self, function, args)
    }

    /// The specialization of a decorated function for these arguments,
    /// compiled if the cache does not hold it yet. Nothing is executed.
    pub fn specialize(&self, name: &str, args: &[Value]) -> Result<Arc<CompiledFunction>, Error> {
        self.specialization(Ident::new(name), args)
    }

    fn specialization(&self, name: Ident, args: &[Value]) -> Result<Arc<CompiledFunction>, Error> {
        let signature = self.signature_of(name, args)?;
        Ok(self.inner.specializer.get_or_compile(self, &signature)?)
    }

    /// Runs the compiled and the interpreted path and fails when they differ.
    pub fn verify(&self, name: &str, args: &[Value]) -> BendaResult {
        let ident = Ident::new(name);
        let Some(function) = self.function(ident) else {
            return Err(RuntimeError::NotDefined(name.to_string()).into());
        };
        let FunctionKind::Jit(def) = &*function else {
            return self.call(name, args);
        };

        let compiled = self.call_jit(ident, args)?;

        // The reference run sees arguments exactly as compiled code does.
        let signature = self.signature_of(ident, args)?;
        let types = self.types();
        let normalized = args
            .iter()
            .zip(&signature.args)
            .map(|(arg, ty)| {
                repr::encode(&types, arg, *ty).and_then(|v| repr::decode(&types, &v, *ty))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let reference = Evaluator::new(self, Mode::Reference).call_function(def, normalized)?;

        if compiled == reference {
            Ok(compiled)
        } else {
            tracing::warn!(
                function = name,
                compiled = %compiled,
                reference = %reference,
                "compiled and interpreted results differ"
            );
            Err(Error::Mismatch {
                function: name.to_string(),
                compiled,
                reference,
            })
        }
    }

    pub fn encode(&self, value: &Value, ty: TypeId) -> Result<CompiledValue, Error> {
        Ok(repr::encode(&self.types(), value, ty)?)
    }

    pub fn decode(&self, value: &CompiledValue, ty: TypeId) -> BendaResult {
        Ok(repr::decode(&self.types(), value, ty)?)
    }

    pub fn stats(&self) -> Stats {
        Stats {
            compilations: self.inner.specializer.compilations(),
            cache_hits: self.inner.specializer.cache_hits(),
            executions: self.inner.executions.load(Ordering::Relaxed),
        }
    }

    /// Signature of a call: records by their own type, integers by width.
    fn signature_of(&self, name: Ident, args: &[Value]) -> Result<Signature, Error> {
        let types = self.types();
        let mut ids = smallvec::SmallVec::with_capacity(args.len());
        for arg in args {
            let id = match arg {
                Value::Int(_) => self.inner.types.scalar(self.inner.options.default_scalar_bits)?,
                Value::Uint(u) => self.inner.types.scalar(u.bits())?,
                Value::Record(r) => types.lookup(r.ty).ok_or_else(|| {
                    CompileError::type_error(format!("\"{}\" is not a declared type", r.ty))
                })?,
                Value::Incomplete => {
                    return Err(CompileError::type_error(format!(
                        "cannot specialize \"{}\" on the incomplete-match sentinel",
                        name
                    ))
                    .into());
                }
            };
            ids.push(id);
        }
        Ok(Signature { function: name, args: ids })
    }
}

/// Handle returned by [`Engine::jit`]; calling it runs the decorated function.
#[derive(Debug, Clone)]
pub struct JitFunction {
    engine: Engine,
    name: Ident,
}

impl JitFunction {
    pub fn name(&self) -> Ident {
        self.name
    }

    pub fn call(&self, args: &[Value]) -> BendaResult {
        self.engine.call_jit(self.name, args)
    }

    pub fn verify(&self, args: &[Value]) -> BendaResult {
        self.engine.verify(&self.name.as_str(), args)
    }
}
