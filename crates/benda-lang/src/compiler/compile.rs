//! Lowering of one specialization to register instructions.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use super::compiled::{CallSite, CompiledFunction, HostSite};
use super::infer::{Callee, Context, Returns, StaticType};
use super::instruction::{Args, FieldAccess, Op, Pc, Reg, Shape};
use super::pattern::{self, Dispatch, MatchPlan};
use crate::Ident;
use crate::ast::{Arm, Block, Expr, FunctionDef, Pattern, Stmt};
use crate::bridge::HostCallee;
use crate::error::compile::CompileError;
use crate::specializer::Signature;
use crate::types::{Layout, TypeId};
use crate::value::Uint;

type Scope = FxHashMap<Ident, (Reg, StaticType)>;

pub(crate) struct Compiler<'c, 'a> {
    ctx: &'c Context<'a>,
    returns: &'c Returns,
    signature: &'c Signature,
    def: &'c FunctionDef,
    code: Vec<Op>,
    registers: u32,
    call_sites: Vec<CallSite>,
    site_index: FxHashMap<Signature, u32>,
    host_sites: Vec<HostSite>,
}

impl<'c, 'a> Compiler<'c, 'a> {
    pub(crate) fn new(
        ctx: &'c Context<'a>,
        returns: &'c Returns,
        signature: &'c Signature,
        def: &'c FunctionDef,
    ) -> Self {
        Self {
            ctx,
            returns,
            signature,
            def,
            code: Vec::new(),
            registers: 0,
            call_sites: Vec::new(),
            site_index: FxHashMap::default(),
            host_sites: Vec::new(),
        }
    }

    pub(crate) fn compile(mut self) -> Result<CompiledFunction, CompileError> {
        if self.def.arity() != self.signature.args.len() {
            return Err(CompileError::ArityMismatch(
                self.def.name.as_str(),
                self.def.arity(),
                self.signature.args.len(),
            ));
        }

        let mut scope: Scope = Scope::default();
        for (param, ty) in self.def.params.iter().zip(&self.signature.args) {
            let reg = self.fresh();
            scope.insert(*param, (reg, StaticType::Known(*ty)));
        }

        let def = self.def;
        if !self.block(&def.body, &mut scope)? {
            let dst = self.fresh();
            self.emit(Op::Incomplete { dst });
            self.emit(Op::Return { src: dst });
        }

        let returns = self.returned(self.signature)?.known();
        Ok(CompiledFunction {
            signature: self.signature.clone(),
            code: self.code,
            registers: self.registers as usize,
            call_sites: self.call_sites,
            host_sites: self.host_sites,
            returns,
        })
    }

    /// Emits `block`; `true` when it always ends in a return.
    fn block(&mut self, block: &Block, scope: &mut Scope) -> Result<bool, CompileError> {
        for stmt in block {
            match stmt {
                Stmt::Let(name, expr) => {
                    let value = self.expr(expr, scope)?;
                    scope.insert(*name, value);
                }
                Stmt::Return(expr) => {
                    let (src, _) = self.expr(expr, scope)?;
                    self.emit(Op::Return { src });
                    return Ok(true);
                }
                Stmt::Expr(expr) => {
                    self.expr(expr, scope)?;
                }
                Stmt::Match(subject, arms) => self.match_stmt(subject, arms, scope)?,
                Stmt::While(..) => {
                    return Err(CompileError::UnsupportedConstruct(
                        self.def.name.as_str(),
                        "while loop".to_string(),
                    ));
                }
            }
        }
        Ok(false)
    }

    fn match_stmt(
        &mut self,
        subject: &Expr,
        arms: &[Arm<Block>],
        scope: &Scope,
    ) -> Result<(), CompileError> {
        let (subject_reg, subject_ty) = self.expr(subject, scope)?;
        let plan = self.plan(subject_ty, arms.iter().map(|a| &a.pattern))?;
        let switch = self.emit_placeholder();

        let mut labels = FxHashMap::default();
        let mut exits = Vec::new();
        for &index in &plan.reachable {
            let arm = &arms[index];
            labels.insert(index, self.pc());
            let mut arm_scope = scope.clone();
            self.bind(&arm.pattern, subject_reg, subject_ty, &mut arm_scope);
            if !self.block(&arm.body, &mut arm_scope)? {
                exits.push(self.emit_placeholder());
            }
        }

        let end = self.pc();
        self.patch_switch(switch, subject_reg, &plan, &labels, end);
        for exit in exits {
            self.code[exit] = Op::Jump { target: end };
        }
        Ok(())
    }

    fn match_expr(
        &mut self,
        subject: &Expr,
        arms: &[Arm<Expr>],
        scope: &Scope,
    ) -> Result<(Reg, StaticType), CompileError> {
        let (subject_reg, subject_ty) = self.expr(subject, scope)?;
        let plan = self.plan(subject_ty, arms.iter().map(|a| &a.pattern))?;
        let dst = self.fresh();
        let switch = self.emit_placeholder();

        let mut ty = StaticType::Unknown;
        let mut labels = FxHashMap::default();
        let mut exits = Vec::new();
        for &index in &plan.reachable {
            let arm = &arms[index];
            labels.insert(index, self.pc());
            let mut arm_scope = scope.clone();
            self.bind(&arm.pattern, subject_reg, subject_ty, &mut arm_scope);
            let (src, arm_ty) = self.expr(&arm.body, &arm_scope)?;
            ty = self.ctx.join(ty, arm_ty)?;
            self.emit(Op::Move { dst, src });
            exits.push(self.emit_placeholder());
        }

        let miss = self.pc();
        if !plan.is_exhaustive() {
            ty = self.ctx.join(ty, StaticType::Incomplete)?;
        }
        self.emit(Op::Incomplete { dst });

        let end = self.pc();
        self.patch_switch(switch, subject_reg, &plan, &labels, miss);
        for exit in exits {
            self.code[exit] = Op::Jump { target: end };
        }
        Ok((dst, ty))
    }

    fn expr(&mut self, expr: &Expr, scope: &Scope) -> Result<(Reg, StaticType), CompileError> {
        match expr {
            Expr::Literal(n) => {
                let dst = self.fresh();
                self.emit(Op::Const {
                    dst,
                    value: n & Uint::mask(self.ctx.default_bits),
                });
                Ok((dst, StaticType::Known(self.ctx.default_scalar)))
            }
            Expr::Var(name) => scope.get(name).copied().ok_or_else(|| {
                CompileError::UndefinedVariable(self.def.name.as_str(), name.as_str())
            }),
            Expr::Binary(op, lhs, rhs) => {
                let (lhs, lhs_ty) = self.expr(lhs, scope)?;
                let (rhs, rhs_ty) = self.expr(rhs, scope)?;
                let ty = self.ctx.binary(*op, lhs_ty, rhs_ty)?;
                let bits = ty
                    .known()
                    .map_or(self.ctx.default_bits, |t| self.ctx.scalar_bits(t));
                let dst = self.fresh();
                self.emit(Op::Binary {
                    dst,
                    op: *op,
                    bits,
                    lhs,
                    rhs,
                });
                Ok((dst, ty))
            }
            Expr::Call(name, args) => {
                let mut regs = Args::new();
                let mut tys: SmallVec<[StaticType; 4]> = SmallVec::new();
                for arg in args {
                    let (reg, ty) = self.expr(arg, scope)?;
                    regs.push(reg);
                    tys.push(ty);
                }
                self.call(*name, regs, &tys)
            }
            Expr::Field(subject, field) => {
                let (subject, subject_ty) = self.expr(subject, scope)?;
                let (ty, location) = self.ctx.field(subject_ty, *field)?;
                // A sentinel-typed subject fails at run time whatever the access.
                let access = location
                    .and_then(|(record, index)| {
                        self.ctx.types.record(record).map(|r| FieldAccess::of(r, index))
                    })
                    .unwrap_or(FieldAccess::Boxed(0));
                let dst = self.fresh();
                self.emit(Op::Field { dst, subject, access });
                Ok((dst, ty))
            }
            Expr::Match(subject, arms) => self.match_expr(subject, arms, scope),
            Expr::Incomplete => {
                let dst = self.fresh();
                self.emit(Op::Incomplete { dst });
                Ok((dst, StaticType::Incomplete))
            }
        }
    }

    fn call(
        &mut self,
        name: Ident,
        args: Args,
        tys: &[StaticType],
    ) -> Result<(Reg, StaticType), CompileError> {
        let dst = self.fresh();
        match self.ctx.resolve(name, args.len())? {
            Callee::Constructor(id) => {
                self.ctx.check_construct(id, tys)?;
                let (tag, shape) = self.shape(id)?;
                self.emit(Op::Construct { dst, tag, shape, args });
                Ok((dst, StaticType::Known(id)))
            }
            Callee::Decorated => {
                let signature = self.callee_signature(name, tys)?;
                let ty = self.returned(&signature)?;
                if signature == *self.signature {
                    self.emit(Op::CallSelf { dst, args });
                } else {
                    let site = self.call_site(signature);
                    self.emit(Op::Call { dst, site, args });
                }
                Ok((dst, ty))
            }
            Callee::Host(function) => {
                let returns = match &function {
                    HostCallee::Native(native) => {
                        self.ctx.check_native(name, &native.params, tys)?;
                        Some(native.returns)
                    }
                    _ => {
                        let signature = self.callee_signature(name, tys)?;
                        self.returned(&signature)?.known()
                    }
                };
                let site = self.host_sites.len() as u32;
                self.host_sites.push(HostSite {
                    name,
                    function,
                    params: tys.iter().map(|ty| ty.known()).collect(),
                    returns,
                });
                self.emit(Op::CallHost { dst, site, args });
                Ok((dst, StaticType::from(returns)))
            }
        }
    }

    fn callee_signature(&self, name: Ident, tys: &[StaticType]) -> Result<Signature, CompileError> {
        self.ctx.signature(name, tys)?.ok_or_else(|| {
            CompileError::type_error(format!(
                "argument types of the call to \"{}\" are unresolved",
                name
            ))
        })
    }

    fn returned(&self, signature: &Signature) -> Result<StaticType, CompileError> {
        self.returns
            .get(signature)
            .map(|ty| StaticType::from(*ty))
            .ok_or_else(|| {
                CompileError::type_error(format!(
                    "no return type inferred for \"{}\"",
                    signature.function
                ))
            })
    }

    fn call_site(&mut self, signature: Signature) -> u32 {
        if let Some(site) = self.site_index.get(&signature) {
            return *site;
        }
        let site = self.call_sites.len() as u32;
        self.site_index.insert(signature.clone(), site);
        self.call_sites.push(CallSite::new(signature));
        site
    }

    fn shape(&self, record: TypeId) -> Result<(u8, Shape), CompileError> {
        let record_ty = self.ctx.types.record(record).ok_or_else(|| {
            CompileError::type_error(format!(
                "\"{}\" is not a record type",
                self.ctx.types.name(record)
            ))
        })?;
        let shape = match &record_ty.layout {
            Layout::Packed(slots) => Shape::Packed(slots.clone()),
            Layout::Boxed => Shape::Boxed(
                record_ty
                    .fields
                    .iter()
                    .map(|f| self.ctx.types.scalar_bits(f.ty))
                    .collect(),
            ),
        };
        Ok((record_ty.tag, shape))
    }

    fn plan<'p>(
        &self,
        subject: StaticType,
        patterns: impl IntoIterator<Item = &'p Pattern>,
    ) -> Result<MatchPlan, CompileError> {
        pattern::plan(self.ctx, self.def.name, subject, patterns)
    }

    fn bind(&mut self, pattern: &Pattern, subject: Reg, subject_ty: StaticType, scope: &mut Scope) {
        let mut fields = SmallVec::new();
        for binder in pattern::binders(self.ctx, pattern, subject_ty) {
            match binder.access {
                Some(access) => {
                    let reg = self.fresh();
                    fields.push((reg, access));
                    scope.insert(binder.name, (reg, binder.ty));
                }
                None => {
                    scope.insert(binder.name, (subject, binder.ty));
                }
            }
        }
        if !fields.is_empty() {
            self.emit(Op::Unpack { subject, fields });
        }
    }

    fn patch_switch(
        &mut self,
        at: usize,
        subject: Reg,
        plan: &MatchPlan,
        labels: &FxHashMap<usize, Pc>,
        miss: Pc,
    ) {
        let default = plan.default.and_then(|i| labels.get(&i).copied()).unwrap_or(miss);
        let target = |arm: usize| labels.get(&arm).copied().unwrap_or(default);

        self.code[at] = match &plan.dispatch {
            Dispatch::Tags { table, .. } => Op::SwitchTag {
                subject,
                table: table.iter().map(|arm| arm.map_or(default, target)).collect(),
                default,
            },
            Dispatch::Scalars { cases } => Op::SwitchScalar {
                subject,
                cases: cases.iter().map(|(value, arm)| (*value, target(*arm))).collect(),
                default,
            },
            Dispatch::Direct => Op::Jump { target: default },
        };
    }

    #[inline]
    fn fresh(&mut self) -> Reg {
        let reg = Reg::new(self.registers);
        self.registers += 1;
        reg
    }

    #[inline]
    fn pc(&self) -> Pc {
        self.code.len() as Pc
    }

    fn emit(&mut self, op: Op) -> usize {
        self.code.push(op);
        self.code.len() - 1
    }

    fn emit_placeholder(&mut self) -> usize {
        self.emit(Op::Jump { target: 0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::BinOp;
    use crate::compiler::infer;
    use crate::engine::Engine;
    use crate::types::TypeDecl;
    use rstest::{fixture, rstest};

    #[fixture]
    fn engine() -> Engine {
        let engine = Engine::default();
        engine
            .declare_types(&[
                TypeDecl::record("Leaf", &[("value", "u24")]),
                TypeDecl::record("Node", &[("left", "Tree"), ("right", "Tree")]),
                TypeDecl::sum("Tree", &["Node", "Leaf"]),
            ])
            .unwrap();
        engine
    }

    fn compile(
        engine: &Engine,
        def: FunctionDef,
        args: &[&str],
    ) -> Result<CompiledFunction, CompileError> {
        let name = def.name;
        engine.jit(def).unwrap();
        let types = engine.types();
        let ctx = Context::new(engine, &types)?;
        let signature = Signature::new(
            name,
            args.iter().map(|a| types.lookup(Ident::new(a)).unwrap()),
        );
        let def = ctx.decorated(&signature)?;
        let returns = infer::infer(&ctx, &signature)?;
        Compiler::new(&ctx, &returns, &signature, &def).compile()
    }

    fn sum_tree() -> FunctionDef {
        FunctionDef::new(
            "sum_tree",
            &["tree"],
            vec![Stmt::matches(
                Expr::var("tree"),
                vec![
                    Arm::new(
                        Pattern::ctor("Node", &["l", "r"]),
                        vec![Stmt::ret(Expr::binary(
                            BinOp::Add,
                            Expr::call("sum_tree", vec![Expr::var("l")]),
                            Expr::call("sum_tree", vec![Expr::var("r")]),
                        ))],
                    ),
                    Arm::new(Pattern::ctor("Leaf", &["v"]), vec![Stmt::ret(Expr::var("v"))]),
                ],
            )],
        )
    }

    #[rstest]
    fn test_self_recursion_uses_call_self(engine: Engine) {
        let compiled = compile(&engine, sum_tree(), &["Tree"]).unwrap();
        let self_calls = compiled
            .code
            .iter()
            .filter(|op| matches!(op, Op::CallSelf { .. }))
            .count();
        assert_eq!(self_calls, 2);
        assert!(compiled.call_sites.is_empty());
        assert!(matches!(compiled.code[0], Op::SwitchTag { .. }));
    }

    #[rstest]
    fn test_switch_targets_arm_entries(engine: Engine) {
        let compiled = compile(&engine, sum_tree(), &["Tree"]).unwrap();
        let Op::SwitchTag { table, default, .. } = &compiled.code[0] else {
            panic!("expected a tag switch, got {}", compiled.code[0]);
        };
        for target in table.iter() {
            assert!(matches!(compiled.code[*target as usize], Op::Unpack { .. }));
        }
        // No catch-all: a miss falls through to the trailing sentinel return.
        assert!(matches!(compiled.code[*default as usize], Op::Incomplete { .. }));
    }

    #[rstest]
    fn test_leaf_construction_is_packed(engine: Engine) {
        let def = FunctionDef::new(
            "make",
            &["n"],
            vec![Stmt::ret(Expr::call("Leaf", vec![Expr::var("n")]))],
        );
        let compiled = compile(&engine, def, &["u24"]).unwrap();
        assert!(compiled.code.iter().any(|op| matches!(
            op,
            Op::Construct { tag: 1, shape: Shape::Packed(_), .. }
        )));
        let leaf = engine.types().lookup(Ident::new("Leaf"));
        assert_eq!(compiled.returns, leaf);
    }

    #[rstest]
    fn test_undefined_variable(engine: Engine) {
        let def = FunctionDef::new("f", &[], vec![Stmt::ret(Expr::var("missing"))]);
        assert!(matches!(
            compile(&engine, def, &[]),
            Err(CompileError::UndefinedVariable(_, _))
        ));
    }

    #[rstest]
    fn test_undefined_function(engine: Engine) {
        let def = FunctionDef::new("f", &[], vec![Stmt::ret(Expr::call("nowhere", vec![]))]);
        assert_eq!(
            compile(&engine, def, &[]).err(),
            Some(CompileError::UndefinedFunction("nowhere".into()))
        );
    }

    #[rstest]
    fn test_constructor_arity(engine: Engine) {
        let def = FunctionDef::new("f", &[], vec![Stmt::ret(Expr::call("Leaf", vec![]))]);
        assert_eq!(
            compile(&engine, def, &[]).err(),
            Some(CompileError::ArityMismatch("Leaf".into(), 1, 0))
        );
    }
}
