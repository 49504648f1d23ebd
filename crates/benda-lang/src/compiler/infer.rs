//! Static typing and return-type inference.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use super::pattern;
use crate::Ident;
use crate::ast::{BinOp, Block, Expr, FunctionDef, Stmt};
use crate::bridge::{FunctionKind, HostCallee};
use crate::engine::Engine;
use crate::error::compile::CompileError;
use crate::specializer::Signature;
use crate::types::{TypeDescriptor, TypeId, TypeTable};

/// Inference passes allowed per reachable instance.
///
/// Every pass that does not settle either discovers an instance or raises one
/// return type in the lattice `Unknown < Incomplete < record < sum`, so four
/// passes per instance bound any well-formed call graph.
const PASSES_PER_INSTANCE: usize = 4;

/// Inferred return types of every specialization reachable from one root.
///
/// `None` means every path yields the sentinel.
pub(crate) type Returns = FxHashMap<Signature, Option<TypeId>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StaticType {
    /// Not determined yet; only seen while inference is still iterating.
    Unknown,
    /// Always the incomplete-match sentinel.
    Incomplete,
    Known(TypeId),
}

impl StaticType {
    pub(crate) fn known(self) -> Option<TypeId> {
        match self {
            StaticType::Known(id) => Some(id),
            _ => None,
        }
    }
}

impl From<Option<TypeId>> for StaticType {
    fn from(ty: Option<TypeId>) -> Self {
        ty.map_or(StaticType::Incomplete, StaticType::Known)
    }
}

pub(crate) enum Callee {
    Constructor(TypeId),
    Decorated,
    Host(HostCallee),
}

pub(crate) struct Context<'a> {
    engine: &'a Engine,
    pub(crate) types: &'a TypeTable,
    pub(crate) default_scalar: TypeId,
    pub(crate) default_bits: u8,
}

impl<'a> Context<'a> {
    pub(crate) fn new(engine: &'a Engine, types: &'a TypeTable) -> Result<Self, CompileError> {
        let default_bits = engine.options().default_scalar_bits;
        let default_scalar = types.scalar(default_bits).ok_or_else(|| {
            CompileError::type_error(format!("scalar type u{} is not registered", default_bits))
        })?;
        Ok(Self {
            engine,
            types,
            default_scalar,
            default_bits,
        })
    }

    pub(crate) fn decorated(
        &self,
        signature: &Signature,
    ) -> Result<Arc<FunctionDef>, CompileError> {
        match self.engine.function(signature.function).as_deref() {
            Some(FunctionKind::Jit(def)) => Ok(Arc::clone(def)),
            _ => Err(CompileError::UndefinedFunction(signature.function.as_str())),
        }
    }

    /// Resolves a call by name. Record constructors shadow functions.
    pub(crate) fn resolve(&self, name: Ident, argc: usize) -> Result<Callee, CompileError> {
        let record = self
            .types
            .lookup(name)
            .and_then(|id| self.types.record(id).map(|r| (id, r)));
        let (callee, arity) = match record {
            Some((id, record)) => (Callee::Constructor(id), record.fields.len()),
            None => {
                let function = self
                    .engine
                    .function(name)
                    .ok_or_else(|| CompileError::UndefinedFunction(name.as_str()))?;
                let arity = function.arity();
                let callee = match &*function {
                    FunctionKind::Jit(_) => Callee::Decorated,
                    FunctionKind::Host(def) => {
                        Callee::Host(HostCallee::Interpreted(Arc::clone(def)))
                    }
                    FunctionKind::Native(native) => {
                        Callee::Host(HostCallee::Native(native.clone()))
                    }
                };
                (callee, arity)
            }
        };

        if arity != argc {
            return Err(CompileError::ArityMismatch(name.as_str(), arity, argc));
        }
        Ok(callee)
    }

    pub(crate) fn join(&self, a: StaticType, b: StaticType) -> Result<StaticType, CompileError> {
        match (a, b) {
            (StaticType::Unknown, t) | (t, StaticType::Unknown) => Ok(t),
            (StaticType::Incomplete, t) | (t, StaticType::Incomplete) => Ok(t),
            (StaticType::Known(a), StaticType::Known(b)) if a == b => Ok(StaticType::Known(a)),
            (StaticType::Known(a), StaticType::Known(b)) => {
                let (wa, wb) = (self.types.widen(a), self.types.widen(b));
                if wa == wb && self.types.scalar_bits(wa).is_none() {
                    Ok(StaticType::Known(wa))
                } else {
                    Err(CompileError::type_error(format!(
                        "cannot unify \"{}\" and \"{}\"",
                        self.types.name(a),
                        self.types.name(b)
                    )))
                }
            }
        }
    }

    /// Result type of a binary operator: the wider operand width.
    pub(crate) fn binary(
        &self,
        op: BinOp,
        lhs: StaticType,
        rhs: StaticType,
    ) -> Result<StaticType, CompileError> {
        for ty in [lhs, rhs].into_iter().filter_map(StaticType::known) {
            if self.types.scalar_bits(ty).is_none() {
                return Err(CompileError::type_error(format!(
                    "operator {} needs scalar operands, got \"{}\"",
                    op.symbol(),
                    self.types.name(ty)
                )));
            }
        }

        Ok(match (lhs, rhs) {
            (StaticType::Unknown, _) | (_, StaticType::Unknown) => StaticType::Unknown,
            (StaticType::Known(a), StaticType::Known(b)) => {
                let bits = self.scalar_bits(a).max(self.scalar_bits(b));
                StaticType::Known(self.types.scalar(bits).unwrap_or(a))
            }
            (StaticType::Known(t), StaticType::Incomplete)
            | (StaticType::Incomplete, StaticType::Known(t)) => StaticType::Known(t),
            (StaticType::Incomplete, StaticType::Incomplete) => {
                StaticType::Known(self.default_scalar)
            }
        })
    }

    pub(crate) fn scalar_bits(&self, ty: TypeId) -> u8 {
        self.types.scalar_bits(ty).unwrap_or(self.default_bits)
    }

    /// Checks that a value of type `actual` may be passed where `expected`
    /// is declared. Scalars of any width fit a scalar slot.
    pub(crate) fn check_arg(
        &self,
        expected: TypeId,
        actual: StaticType,
        context: impl FnOnce() -> String,
    ) -> Result<(), CompileError> {
        let Some(actual) = actual.known() else {
            return Ok(());
        };
        let fits = match (self.types.get(expected), self.types.get(actual)) {
            (TypeDescriptor::Scalar(_), TypeDescriptor::Scalar(_)) => true,
            (TypeDescriptor::Scalar(_), _) | (_, TypeDescriptor::Scalar(_)) => false,
            _ => actual == expected || self.types.widen(actual) == expected,
        };

        if fits {
            Ok(())
        } else {
            Err(CompileError::type_error(format!(
                "{} expects \"{}\", got \"{}\"",
                context(),
                self.types.name(expected),
                self.types.name(actual)
            )))
        }
    }

    pub(crate) fn check_construct(
        &self,
        record: TypeId,
        args: &[StaticType],
    ) -> Result<(), CompileError> {
        let Some(record_ty) = self.types.record(record) else {
            return Err(CompileError::type_error(format!(
                "\"{}\" is not a record type",
                self.types.name(record)
            )));
        };
        for (field, arg) in record_ty.fields.iter().zip(args) {
            self.check_arg(field.ty, *arg, || {
                format!("field \"{}.{}\"", record_ty.name, field.name)
            })?;
        }
        Ok(())
    }

    pub(crate) fn check_native(
        &self,
        name: Ident,
        params: &[TypeId],
        args: &[StaticType],
    ) -> Result<(), CompileError> {
        for (i, (param, arg)) in params.iter().zip(args).enumerate() {
            self.check_arg(*param, *arg, || format!("argument {} of \"{}\"", i, name))?;
        }
        Ok(())
    }

    /// Type of `subject.field`, with the record and field index when the
    /// subject is a known record.
    pub(crate) fn field(
        &self,
        subject: StaticType,
        field: Ident,
    ) -> Result<(StaticType, Option<(TypeId, usize)>), CompileError> {
        let Some(id) = subject.known() else {
            return Ok((subject, None));
        };
        match self.types.get(id) {
            TypeDescriptor::Record(record) => {
                let index = record
                    .field_index(field)
                    .ok_or_else(|| {
                        CompileError::unknown_field(record.name.as_str(), &field.as_str())
                    })?;
                Ok((StaticType::Known(record.fields[index].ty), Some((id, index))))
            }
            _ => Err(CompileError::type_error(format!(
                "field \"{}\" accessed on \"{}\", which is not a record; match on it first",
                field,
                self.types.name(id)
            ))),
        }
    }

    /// Callee signature for the given argument types.
    ///
    /// Records keep their own type; they only become their sum where a join
    /// widens them. `None` while some argument type is still unknown.
    pub(crate) fn signature(
        &self,
        callee: Ident,
        args: &[StaticType],
    ) -> Result<Option<Signature>, CompileError> {
        let mut tys = smallvec::SmallVec::with_capacity(args.len());
        for (i, arg) in args.iter().enumerate() {
            match arg {
                StaticType::Unknown => return Ok(None),
                StaticType::Incomplete => {
                    return Err(CompileError::type_error(format!(
                        "argument {} of \"{}\" is always the incomplete-match sentinel",
                        i, callee
                    )));
                }
                StaticType::Known(ty) => tys.push(*ty),
            }
        }
        Ok(Some(Signature {
            function: callee,
            args: tys,
        }))
    }
}

pub(crate) fn infer(ctx: &Context<'_>, root: &Signature) -> Result<Returns, CompileError> {
    let mut table: FxHashMap<Signature, StaticType> = FxHashMap::default();
    table.insert(root.clone(), StaticType::Unknown);

    let mut passes = 0;
    while passes <= PASSES_PER_INSTANCE * table.len() {
        passes += 1;
        let mut changed = false;
        let mut discovered = Vec::new();
        let instances: Vec<Signature> = table.keys().cloned().collect();

        for signature in instances {
            let (def, strict) = instance(ctx, &signature)?;
            let mut walker = Walker {
                ctx,
                table: &table,
                function: signature.function,
                strict,
                returns: StaticType::Unknown,
                discovered: &mut discovered,
            };
            let found = walker.function(&def, &signature)?;

            let previous = table.get(&signature).copied().unwrap_or(StaticType::Unknown);
            let joined = ctx.join(previous, found)?;
            if joined != previous {
                table.insert(signature, joined);
                changed = true;
            }
        }

        for signature in discovered {
            if !table.contains_key(&signature) {
                table.insert(signature, StaticType::Unknown);
                changed = true;
            }
        }

        if !changed {
            return Ok(table
                .into_iter()
                .map(|(signature, ty)| (signature, ty.known()))
                .collect());
        }
    }

    Err(CompileError::type_error(format!(
        "return types reachable from \"{}\" did not settle after {} passes",
        root.function, passes
    )))
}

/// The definition behind an instance, and whether it must stay within the
/// compiled subset.
fn instance(
    ctx: &Context<'_>,
    signature: &Signature,
) -> Result<(Arc<FunctionDef>, bool), CompileError> {
    match ctx.engine.function(signature.function).as_deref() {
        Some(FunctionKind::Jit(def)) => Ok((Arc::clone(def), true)),
        Some(FunctionKind::Host(def)) => Ok((Arc::clone(def), false)),
        _ => Err(CompileError::UndefinedFunction(signature.function.as_str())),
    }
}

type TypeEnv = FxHashMap<Ident, StaticType>;

struct Walker<'w, 'a> {
    ctx: &'w Context<'a>,
    table: &'w FxHashMap<Signature, StaticType>,
    function: Ident,
    strict: bool,
    returns: StaticType,
    discovered: &'w mut Vec<Signature>,
}

impl Walker<'_, '_> {
    fn function(
        &mut self,
        def: &FunctionDef,
        signature: &Signature,
    ) -> Result<StaticType, CompileError> {
        if def.arity() != signature.args.len() {
            return Err(CompileError::ArityMismatch(
                def.name.as_str(),
                def.arity(),
                signature.args.len(),
            ));
        }
        let mut env: TypeEnv = def
            .params
            .iter()
            .zip(&signature.args)
            .map(|(param, ty)| (*param, StaticType::Known(*ty)))
            .collect();
        self.block(&def.body, &mut env)?;
        // Falling off the end yields the sentinel.
        self.ctx.join(self.returns, StaticType::Incomplete)
    }

    fn block(&mut self, block: &Block, env: &mut TypeEnv) -> Result<(), CompileError> {
        for stmt in block {
            match stmt {
                Stmt::Let(name, expr) => {
                    let ty = self.expr(expr, env)?;
                    env.insert(*name, ty);
                }
                Stmt::Return(expr) => {
                    let ty = self.expr(expr, env)?;
                    self.returns = self.ctx.join(self.returns, ty)?;
                    return Ok(());
                }
                Stmt::Expr(expr) => {
                    self.expr(expr, env)?;
                }
                Stmt::Match(subject, arms) => {
                    let subject = self.expr(subject, env)?;
                    let patterns = arms.iter().map(|a| &a.pattern);
                    let plan = pattern::plan(self.ctx, self.function, subject, patterns)?;
                    for &index in &plan.reachable {
                        let arm = &arms[index];
                        let mut scope = env.clone();
                        for binder in pattern::binders(self.ctx, &arm.pattern, subject) {
                            scope.insert(binder.name, binder.ty);
                        }
                        self.block(&arm.body, &mut scope)?;
                    }
                }
                Stmt::While(cond, body) => {
                    if self.strict {
                        return Err(CompileError::UnsupportedConstruct(
                            self.function.as_str(),
                            "while loop".to_string(),
                        ));
                    }
                    self.expr(cond, env)?;
                    self.loop_body(body, env)?;
                }
            }
        }
        Ok(())
    }

    /// Walks a loop body until the variables it assigns stop changing.
    ///
    /// The body may run zero or more times, so each variable after the loop
    /// has the join of its type before the loop and after every iteration.
    fn loop_body(&mut self, body: &Block, env: &mut TypeEnv) -> Result<(), CompileError> {
        loop {
            let mut after = env.clone();
            self.block(body, &mut after)?;

            let mut changed = false;
            for (name, ty) in after {
                let joined = match env.get(&name) {
                    Some(before) => self.ctx.join(*before, ty)?,
                    None => ty,
                };
                if env.get(&name) != Some(&joined) {
                    env.insert(name, joined);
                    changed = true;
                }
            }
            if !changed {
                return Ok(());
            }
        }
    }

    fn expr(&mut self, expr: &Expr, env: &TypeEnv) -> Result<StaticType, CompileError> {
        match expr {
            Expr::Literal(_) => Ok(StaticType::Known(self.ctx.default_scalar)),
            Expr::Var(name) => env
                .get(name)
                .copied()
                .ok_or_else(|| {
                    CompileError::UndefinedVariable(self.function.as_str(), name.as_str())
                }),
            Expr::Binary(op, lhs, rhs) => {
                let lhs = self.expr(lhs, env)?;
                let rhs = self.expr(rhs, env)?;
                self.ctx.binary(*op, lhs, rhs)
            }
            Expr::Call(name, args) => {
                let args = args
                    .iter()
                    .map(|arg| self.expr(arg, env))
                    .collect::<Result<Vec<_>, _>>()?;
                match self.ctx.resolve(*name, args.len())? {
                    Callee::Constructor(id) => {
                        self.ctx.check_construct(id, &args)?;
                        Ok(StaticType::Known(id))
                    }
                    Callee::Host(HostCallee::Native(native)) => {
                        self.ctx.check_native(*name, &native.params, &args)?;
                        Ok(StaticType::Known(native.returns))
                    }
                    Callee::Host(HostCallee::Interpreted(_)) | Callee::Decorated => {
                        self.instance(*name, &args)
                    }
                }
            }
            Expr::Field(subject, field) => {
                let subject = self.expr(subject, env)?;
                Ok(self.ctx.field(subject, *field)?.0)
            }
            Expr::Match(subject, arms) => {
                let subject = self.expr(subject, env)?;
                let patterns = arms.iter().map(|a| &a.pattern);
                let plan = pattern::plan(self.ctx, self.function, subject, patterns)?;
                let mut ty = StaticType::Unknown;
                for &index in &plan.reachable {
                    let arm = &arms[index];
                    let mut scope = env.clone();
                    for binder in pattern::binders(self.ctx, &arm.pattern, subject) {
                        scope.insert(binder.name, binder.ty);
                    }
                    let arm_ty = self.expr(&arm.body, &scope)?;
                    ty = self.ctx.join(ty, arm_ty)?;
                }
                if !plan.is_exhaustive() {
                    ty = self.ctx.join(ty, StaticType::Incomplete)?;
                }
                Ok(ty)
            }
            Expr::Incomplete => Ok(StaticType::Incomplete),
        }
    }

    fn instance(&mut self, name: Ident, args: &[StaticType]) -> Result<StaticType, CompileError> {
        let Some(signature) = self.ctx.signature(name, args)? else {
            return Ok(StaticType::Unknown);
        };
        match self.table.get(&signature) {
            Some(ty) => Ok(*ty),
            None => {
                self.discovered.push(signature);
                Ok(StaticType::Unknown)
            }
        }
    }
}
