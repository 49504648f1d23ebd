//! Crossings between host code and compiled code.
//!
//! Values are lowered with [`repr::encode`] on the way into compiled code and
//! raised with [`repr::decode`] on the way out, in both directions.

use std::fmt;
use std::sync::Arc;

use crate::ast::FunctionDef;
use crate::compiler::compiled::{CompiledFunction, HostSite};
use crate::compiler::machine;
use crate::engine::Engine;
use crate::error::Error;
use crate::error::runtime::RuntimeError;
use crate::eval::{Evaluator, Mode};
use crate::repr::{self, CompiledValue};
use crate::types::TypeId;
use crate::{Ident, Value};

pub type NativeFn = Arc<dyn Fn(&[Value]) -> Result<Value, String> + Send + Sync>;

/// A host callback with declared parameter and return types.
///
/// Type names are resolved when the function is defined, so the types must
/// already be declared.
#[derive(Clone)]
pub struct NativeFunction {
    pub name: Ident,
    pub params: Vec<Ident>,
    pub returns: Ident,
    pub func: NativeFn,
}

impl NativeFunction {
    pub fn new<F>(name: &str, params: &[&str], returns: &str, func: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        Self {
            name: Ident::new(name),
            params: params.iter().map(|p| Ident::new(p)).collect(),
            returns: Ident::new(returns),
            func: Arc::new(func),
        }
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunction")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("returns", &self.returns)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ResolvedNative {
    pub(crate) function: NativeFunction,
    pub(crate) params: Vec<TypeId>,
    pub(crate) returns: TypeId,
}

/// Everything a call by name can resolve to, apart from record constructors.
#[derive(Debug, Clone)]
pub(crate) enum FunctionKind {
    /// Decorated: calls go through the specializer.
    Jit(Arc<FunctionDef>),
    /// Undecorated: always interpreted.
    Host(Arc<FunctionDef>),
    Native(ResolvedNative),
}

impl FunctionKind {
    pub(crate) fn arity(&self) -> usize {
        match self {
            FunctionKind::Jit(def) | FunctionKind::Host(def) => def.arity(),
            FunctionKind::Native(native) => native.params.len(),
        }
    }
}

/// An undecorated function called from compiled code.
#[derive(Debug, Clone)]
pub(crate) enum HostCallee {
    Interpreted(Arc<FunctionDef>),
    Native(ResolvedNative),
}

/// Runs a native callback and normalizes its result to the declared type.
pub(crate) fn call_native(
    engine: &Engine,
    native: &ResolvedNative,
    args: &[Value],
) -> Result<Value, Error> {
    let name = native.function.name.as_str();
    if args.len() != native.params.len() {
        return Err(RuntimeError::ArityMismatch(name, native.params.len(), args.len()).into());
    }

    let result = (native.function.func)(args)
        .map_err(|message| RuntimeError::HostFunction(name.clone(), message))?;

    let types = engine.types();
    repr::encode(&types, &result, native.returns)
        .and_then(|encoded| repr::decode(&types, &encoded, native.returns))
        .map_err(|e| RuntimeError::HostFunction(name, e.to_string()).into())
}

/// Host to compiled: lowers `args` with the signature types, runs, raises
/// the result with the inferred return type.
pub(crate) fn run_compiled(
    engine: &Engine,
    function: Arc<CompiledFunction>,
    args: &[Value],
) -> Result<Value, Error> {
    let types = engine.types();
    let encoded = args
        .iter()
        .zip(&function.signature.args)
        .map(|(arg, ty)| repr::encode(&types, arg, *ty))
        .collect::<Result<Vec<_>, _>>()?;

    let returns = function.returns;
    let result = machine::execute(engine, function, encoded)?;

    match returns {
        Some(ty) => Ok(repr::decode(&types, &result, ty)?),
        None if result.is_incomplete() => Ok(Value::Incomplete),
        None => Err(RuntimeError::TypeMismatch(
            "return".to_string(),
            result.kind().to_string(),
        )
        .into()),
    }
}

/// Compiled to host: raises `args`, runs the host function, lowers the result
/// with the call site's static return type.
pub(crate) fn call_host(
    engine: &Engine,
    site: &HostSite,
    args: &[CompiledValue],
) -> Result<CompiledValue, Error> {
    let types = engine.types();
    let values = args
        .iter()
        .zip(&site.params)
        .map(|(arg, ty)| match ty {
            Some(ty) => repr::decode(&types, arg, *ty),
            None => Ok(Value::Incomplete),
        })
        .collect::<Result<Vec<_>, _>>()?;

    let result = match &site.function {
        HostCallee::Native(native) => call_native(engine, native, &values)?,
        HostCallee::Interpreted(def) => {
            Evaluator::new(engine, Mode::Host).call_function(def, values)?
        }
    };

    match site.returns {
        Some(ty) => repr::encode(&types, &result, ty).map_err(|e| {
            RuntimeError::HostFunction(site.name.as_str(), e.to_string()).into()
        }),
        None if result.is_incomplete() => Ok(CompiledValue::Incomplete),
        None => Err(RuntimeError::TypeMismatch(site.name.as_str(), result.type_name()).into()),
    }
}
