//! Tree-walking interpreter for host function definitions.
//!
//! This is the host-interpreted path: it runs undecorated functions, serves
//! as the reference result for [`Engine::verify`], and is what compiled code
//! falls back to when it calls into a host function.

use std::cell::Cell;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::Ident;
use crate::ast::{Arm, Block, Expr, FunctionDef, Pattern, Stmt};
use crate::bridge::{self, FunctionKind};
use crate::engine::Engine;
use crate::error::Error;
use crate::error::runtime::RuntimeError;
use crate::types::{TypeDescriptor, TypeId, TypeTable};
use crate::value::{Record, Uint, Value};

type Env = FxHashMap<Ident, Value>;

thread_local! {
    // Shared by every evaluator on the thread, so host -> compiled -> host
    // re-entry is counted as one stack.
    static DEPTH: Cell<u32> = const { Cell::new(0) };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// Decorated callees are interpreted as well.
    Reference,
    /// Decorated callees go through the specializer.
    Host,
}

enum Flow {
    Continue,
    Return(Value),
}

struct DepthGuard;

impl DepthGuard {
    fn enter(limit: u32) -> Result<Self, RuntimeError> {
        DEPTH.with(|depth| {
            if depth.get() >= limit {
                Err(RuntimeError::RecursionError(limit))
            } else {
                depth.set(depth.get() + 1);
                Ok(DepthGuard)
            }
        })
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

pub(crate) struct Evaluator<'e> {
    engine: &'e Engine,
    types: Arc<TypeTable>,
    mode: Mode,
    default_bits: u8,
}

impl<'e> Evaluator<'e> {
    pub(crate) fn new(engine: &'e Engine, mode: Mode) -> Self {
        Self {
            engine,
            types: engine.types(),
            mode,
            default_bits: engine.options().default_scalar_bits,
        }
    }

    pub(crate) fn call_function(
        &mut self,
        def: &FunctionDef,
        args: Vec<Value>,
    ) -> Result<Value, Error> {
        if args.len() != def.arity() {
            return Err(
                RuntimeError::ArityMismatch(def.name.as_str(), def.arity(), args.len()).into(),
            );
        }
        let _guard = DepthGuard::enter(self.engine.options().max_host_depth)?;

        let mut env: Env = def.params.iter().copied().zip(args).collect();
        match self.eval_block(&def.body, &mut env)? {
            Flow::Return(value) => Ok(value),
            Flow::Continue => Ok(Value::Incomplete),
        }
    }

    fn eval_block(&mut self, block: &Block, env: &mut Env) -> Result<Flow, Error> {
        for stmt in block {
            match stmt {
                Stmt::Let(name, expr) => {
                    let value = self.eval_expr(expr, env)?;
                    env.insert(*name, value);
                }
                Stmt::Return(expr) => return Ok(Flow::Return(self.eval_expr(expr, env)?)),
                Stmt::Expr(expr) => {
                    self.eval_expr(expr, env)?;
                }
                Stmt::Match(subject, arms) => {
                    let subject = self.eval_expr(subject, env)?;
                    if let Some((arm, bindings)) = self.select_arm(arms, &subject)? {
                        let mut scope = env.clone();
                        scope.extend(bindings);
                        if let Flow::Return(value) = self.eval_block(&arm.body, &mut scope)? {
                            return Ok(Flow::Return(value));
                        }
                    }
                }
                Stmt::While(cond, body) => loop {
                    let value = self.eval_expr(cond, env)?;
                    let flag = value
                        .as_uint(self.default_bits)
                        .ok_or_else(|| {
                            RuntimeError::TypeMismatch("while".into(), value.type_name())
                        })?;
                    if flag.value() == 0 {
                        break;
                    }
                    if let Flow::Return(value) = self.eval_block(body, env)? {
                        return Ok(Flow::Return(value));
                    }
                },
            }
        }

        Ok(Flow::Continue)
    }

    fn eval_expr(&mut self, expr: &Expr, env: &Env) -> Result<Value, Error> {
        match expr {
            Expr::Literal(n) => Ok(Value::Uint(Uint::new(self.default_bits, *n))),
            Expr::Var(name) => env
                .get(name)
                .cloned()
                .ok_or_else(|| RuntimeError::UndefinedVariable(name.as_str()).into()),
            Expr::Binary(op, lhs, rhs) => {
                let lhs = self.eval_expr(lhs, env)?;
                let rhs = self.eval_expr(rhs, env)?;
                match (lhs.as_uint(self.default_bits), rhs.as_uint(self.default_bits)) {
                    (Some(l), Some(r)) => {
                        let bits = l.bits().max(r.bits());
                        let n = op.apply(l.value(), r.value(), bits)?;
                        Ok(Value::Uint(Uint::new(bits, n)))
                    }
                    _ => Err(RuntimeError::TypeMismatch(
                        op.symbol().to_string(),
                        format!("{}, {}", lhs.type_name(), rhs.type_name()),
                    )
                    .into()),
                }
            }
            Expr::Call(name, args) => {
                let args = args
                    .iter()
                    .map(|arg| self.eval_expr(arg, env))
                    .collect::<Result<Vec<_>, _>>()?;
                self.call(*name, args)
            }
            Expr::Field(subject, field) => {
                let subject = self.eval_expr(subject, env)?;
                let record = subject.as_record().ok_or_else(|| {
                    RuntimeError::TypeMismatch(format!(".{}", field), subject.type_name())
                })?;
                self.types
                    .lookup(record.ty)
                    .and_then(|id| self.types.record(id))
                    .and_then(|ty| ty.field_index(*field))
                    .and_then(|i| record.fields.get(i).cloned())
                    .ok_or_else(|| {
                        RuntimeError::TypeMismatch(format!(".{}", field), record.ty.as_str()).into()
                    })
            }
            Expr::Match(subject, arms) => {
                let subject = self.eval_expr(subject, env)?;
                match self.select_arm(arms, &subject)? {
                    Some((arm, bindings)) => {
                        let mut scope = env.clone();
                        scope.extend(bindings);
                        self.eval_expr(&arm.body, &scope)
                    }
                    None => Ok(Value::Incomplete),
                }
            }
            Expr::Incomplete => Ok(Value::Incomplete),
        }
    }

    fn call(&mut self, name: Ident, args: Vec<Value>) -> Result<Value, Error> {
        if let Some(id) = self.types.lookup(name)
            && self.types.record(id).is_some()
        {
            return self.construct(id, args);
        }

        let function = self
            .engine
            .function(name)
            .ok_or_else(|| RuntimeError::NotDefined(name.as_str()))?;

        match &*function {
            FunctionKind::Jit(_) if self.mode == Mode::Host => self.engine.call_jit(name, &args),
            FunctionKind::Jit(def) | FunctionKind::Host(def) => self.call_function(def, args),
            FunctionKind::Native(native) => bridge::call_native(self.engine, native, &args),
        }
    }

    fn construct(&self, id: TypeId, args: Vec<Value>) -> Result<Value, Error> {
        let Some(record_ty) = self.types.record(id) else {
            return Err(RuntimeError::NotDefined(self.types.name(id)).into());
        };
        if args.len() != record_ty.fields.len() {
            return Err(RuntimeError::ArityMismatch(
                record_ty.name.as_str(),
                record_ty.fields.len(),
                args.len(),
            )
            .into());
        }

        let fields = args
            .into_iter()
            .zip(&record_ty.fields)
            .map(|(arg, field)| self.coerce(arg, field.ty, record_ty.name, field.name))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Value::Record(Arc::new(Record::new(record_ty.name, fields))))
    }

    /// Fits a constructor argument to the declared field type.
    fn coerce(
        &self,
        value: Value,
        ty: TypeId,
        record: Ident,
        field: Ident,
    ) -> Result<Value, Error> {
        let fits = match (self.types.get(ty), &value) {
            (TypeDescriptor::Scalar(scalar), _) => {
                if let Some(u) = value.as_uint(self.default_bits) {
                    return Ok(Value::Uint(Uint::new(scalar.bits, u.value())));
                }
                false
            }
            (_, Value::Record(r)) => self
                .types
                .lookup(r.ty)
                .is_some_and(|id| id == ty || self.types.widen(id) == ty),
            _ => false,
        };

        if fits {
            Ok(value)
        } else {
            Err(
                RuntimeError::TypeMismatch(format!("{}.{}", record, field), value.type_name())
                    .into(),
            )
        }
    }

    /// First arm whose pattern matches, with its bindings.
    fn select_arm<'a, B>(
        &self,
        arms: &'a [Arm<B>],
        subject: &Value,
    ) -> Result<Option<(&'a Arm<B>, Vec<(Ident, Value)>)>, Error> {
        for arm in arms {
            if let Some(bindings) = self.match_pattern(&arm.pattern, subject)? {
                return Ok(Some((arm, bindings)));
            }
        }
        Ok(None)
    }

    fn match_pattern(
        &self,
        pattern: &Pattern,
        subject: &Value,
    ) -> Result<Option<Vec<(Ident, Value)>>, Error> {
        match pattern {
            Pattern::Wildcard => Ok(Some(Vec::new())),
            Pattern::Bind(name) => Ok(Some(vec![(*name, subject.clone())])),
            Pattern::Literal(n) => Ok(subject
                .as_uint(self.default_bits)
                .filter(|u| *n & Uint::mask(u.bits()) == u.value())
                .map(|_| Vec::new())),
            Pattern::Constructor(name, binders) => {
                let Some(record) = subject.as_record() else {
                    return Ok(None);
                };
                if record.ty != *name {
                    return Ok(None);
                }
                if binders.is_empty() {
                    return Ok(Some(Vec::new()));
                }
                if binders.len() != record.fields.len() {
                    return Err(RuntimeError::ArityMismatch(
                        name.as_str(),
                        record.fields.len(),
                        binders.len(),
                    )
                    .into());
                }
                Ok(Some(
                    binders
                        .iter()
                        .zip(&record.fields)
                        .filter(|(binder, _)| !binder.is_placeholder())
                        .map(|(binder, value)| (*binder, value.clone()))
                        .collect(),
                ))
            }
        }
    }
}
