//! Match planning.
//!
//! Arms are taken in source order and the first structural match wins, so an
//! arm whose tag (or literal) is already claimed, or that follows a
//! catch-all, can never run and is left out of the plan.

use smallvec::SmallVec;

use super::infer::{Context, StaticType};
use super::instruction::FieldAccess;
use crate::Ident;
use crate::ast::Pattern;
use crate::error::compile::CompileError;
use crate::types::{TypeDescriptor, TypeId};
use crate::value::Uint;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Dispatch {
    /// Arm index per variant tag of `ty`.
    Tags { ty: TypeId, table: Vec<Option<usize>> },
    Scalars { cases: Vec<(u64, usize)> },
    /// Only catch-all arms, or none at all.
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MatchPlan {
    pub(crate) dispatch: Dispatch,
    /// Arms that can run, in source order.
    pub(crate) reachable: Vec<usize>,
    pub(crate) default: Option<usize>,
}

impl MatchPlan {
    pub(crate) fn is_exhaustive(&self) -> bool {
        self.default.is_some()
            || matches!(
                &self.dispatch,
                Dispatch::Tags { table, .. } if table.iter().all(Option::is_some)
            )
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Binder {
    pub(crate) name: Ident,
    pub(crate) ty: StaticType,
    /// `None` binds the subject itself.
    pub(crate) access: Option<FieldAccess>,
}

pub(crate) fn plan<'p>(
    ctx: &Context<'_>,
    function: Ident,
    subject: StaticType,
    patterns: impl IntoIterator<Item = &'p Pattern>,
) -> Result<MatchPlan, CompileError> {
    let patterns: Vec<&Pattern> = patterns.into_iter().collect();
    let error = |reason: String| CompileError::MatchCompilationError {
        function: function.as_str(),
        reason,
    };

    let has_constructor = patterns.iter().any(|p| matches!(p, Pattern::Constructor(..)));
    let has_literal = patterns.iter().any(|p| matches!(p, Pattern::Literal(_)));
    if has_constructor && has_literal {
        return Err(error("constructor and literal patterns cannot be mixed".to_string()));
    }

    let mut reachable = Vec::with_capacity(patterns.len());
    let mut default = None;

    let dispatch = if has_constructor {
        let ty = match subject.known() {
            Some(id) => id,
            // Host call results and sentinel-typed subjects: the arms name the sum.
            None => patterns
                .iter()
                .find_map(|p| match p {
                    Pattern::Constructor(name, _) => Some(*name),
                    _ => None,
                })
                .and_then(|name| ctx.types.lookup(name))
                .filter(|id| ctx.types.record(*id).is_some())
                .ok_or_else(|| {
                    error("the first constructor pattern names no record type".to_string())
                })?,
        };
        let (ty, variants) = match ctx.types.get(ty) {
            TypeDescriptor::Sum(sum) => (ty, sum.variants.clone()),
            TypeDescriptor::Record(record) => match record.home {
                Some(home) => (
                    home,
                    ctx.types
                        .sum(home)
                        .map(|s| s.variants.clone())
                        .unwrap_or_default(),
                ),
                None => (ty, vec![ty]),
            },
            TypeDescriptor::Scalar(_) => {
                return Err(error(format!(
                    "constructor patterns cannot match a value of type \"{}\"",
                    ctx.types.name(ty)
                )));
            }
        };

        let mut table = vec![None; variants.len()];
        for (index, pattern) in patterns.iter().enumerate() {
            if default.is_some() {
                tracing::trace!(arm = index, "unreachable arm after catch-all");
                continue;
            }
            match pattern {
                Pattern::Constructor(name, binders) => {
                    let tag = ctx
                        .types
                        .lookup(*name)
                        .and_then(|id| variants.iter().position(|v| *v == id))
                        .ok_or_else(|| {
                            error(format!(
                                "\"{}\" is not a variant of \"{}\"",
                                name,
                                ctx.types.name(ty)
                            ))
                        })?;
                    let arity = ctx.types.record(variants[tag]).map_or(0, |r| r.fields.len());
                    if !binders.is_empty() && binders.len() != arity {
                        return Err(error(format!(
                            "pattern {} binds {} fields, \"{}\" has {}",
                            pattern,
                            binders.len(),
                            name,
                            arity
                        )));
                    }
                    if table[tag].is_none() {
                        table[tag] = Some(index);
                        reachable.push(index);
                    } else {
                        tracing::trace!(arm = index, "unreachable arm for claimed variant");
                    }
                }
                _ => {
                    default = Some(index);
                    reachable.push(index);
                }
            }
        }
        Dispatch::Tags { ty, table }
    } else if has_literal {
        let bits = match subject.known() {
            Some(id) => ctx.types.scalar_bits(id).ok_or_else(|| {
                error(format!(
                    "literal patterns cannot match a value of type \"{}\"",
                    ctx.types.name(id)
                ))
            })?,
            None => ctx.default_bits,
        };

        let mut cases: Vec<(u64, usize)> = Vec::new();
        for (index, pattern) in patterns.iter().enumerate() {
            if default.is_some() {
                continue;
            }
            match pattern {
                Pattern::Literal(n) => {
                    let n = n & Uint::mask(bits);
                    if !cases.iter().any(|(case, _)| *case == n) {
                        cases.push((n, index));
                        reachable.push(index);
                    }
                }
                _ => {
                    default = Some(index);
                    reachable.push(index);
                }
            }
        }
        Dispatch::Scalars { cases }
    } else {
        if let Some(index) = patterns.iter().position(|p| p.is_catch_all()) {
            default = Some(index);
            reachable.push(index);
        }
        Dispatch::Direct
    };

    Ok(MatchPlan {
        dispatch,
        reachable,
        default,
    })
}

/// Names an arm binds, with their types and where to read them from.
///
/// Only meaningful for patterns accepted by [`plan`].
pub(crate) fn binders(
    ctx: &Context<'_>,
    pattern: &Pattern,
    subject: StaticType,
) -> SmallVec<[Binder; 4]> {
    match pattern {
        Pattern::Bind(name) if !name.is_placeholder() => smallvec::smallvec![Binder {
            name: *name,
            ty: subject,
            access: None,
        }],
        Pattern::Constructor(name, names) => {
            let Some(record) = ctx.types.lookup(*name).and_then(|id| ctx.types.record(id)) else {
                return SmallVec::new();
            };
            names
                .iter()
                .enumerate()
                .filter(|(_, name)| !name.is_placeholder())
                .map(|(i, name)| Binder {
                    name: *name,
                    ty: StaticType::Known(record.fields[i].ty),
                    access: Some(FieldAccess::of(record, i)),
                })
                .collect()
        }
        _ => SmallVec::new(),
    }
}
