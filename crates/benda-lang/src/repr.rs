//! Compiled value representation and the host boundary codec.
//!
//! Scalars and packed records live in a single machine word. Everything else
//! is a reference-counted [`Boxed`] record. [`encode`] and [`decode`] walk
//! values with an explicit work stack, so the depth of a value is bounded by
//! the heap rather than the native stack.

use std::sync::Arc;

use crate::Ident;
use crate::error::compile::CompileError;
use crate::types::{Layout, RecordType, TAG_BITS, TypeDescriptor, TypeId, TypeTable};
use crate::value::{Record, Uint, Value};

const TAG_MASK: u64 = (1 << TAG_BITS) - 1;

#[derive(Debug, Clone, PartialEq, Default)]
pub enum CompiledValue {
    Scalar(u64),
    /// Tag in the low byte, scalar fields above it.
    Packed(u64),
    Boxed(Arc<Boxed>),
    #[default]
    Incomplete,
}

#[derive(Debug, Clone)]
pub struct Boxed {
    pub tag: u8,
    pub fields: Vec<CompiledValue>,
}

impl PartialEq for Boxed {
    fn eq(&self, other: &Self) -> bool {
        let mut pending = vec![(self, other)];
        while let Some((a, b)) = pending.pop() {
            if a.tag != b.tag || a.fields.len() != b.fields.len() {
                return false;
            }
            for pair in a.fields.iter().zip(&b.fields) {
                match pair {
                    (CompiledValue::Boxed(x), CompiledValue::Boxed(y)) => {
                        if !Arc::ptr_eq(x, y) {
                            pending.push((x, y));
                        }
                    }
                    (x, y) if x != y => return false,
                    _ => {}
                }
            }
        }
        true
    }
}

impl Drop for Boxed {
    fn drop(&mut self) {
        let mut stack = std::mem::take(&mut self.fields);
        while let Some(value) = stack.pop() {
            if let CompiledValue::Boxed(boxed) = value
                && let Some(mut boxed) = Arc::into_inner(boxed)
            {
                stack.append(&mut boxed.fields);
            }
        }
    }
}

impl CompiledValue {
    pub fn boxed(tag: u8, fields: Vec<CompiledValue>) -> Self {
        CompiledValue::Boxed(Arc::new(Boxed { tag, fields }))
    }

    /// Variant tag of a record value.
    #[inline]
    pub fn tag(&self) -> Option<u8> {
        match self {
            CompiledValue::Packed(word) => Some((word & TAG_MASK) as u8),
            CompiledValue::Boxed(boxed) => Some(boxed.tag),
            _ => None,
        }
    }

    #[inline]
    pub fn scalar(&self) -> Option<u64> {
        match self {
            CompiledValue::Scalar(n) => Some(*n),
            _ => None,
        }
    }

    #[inline]
    pub fn is_incomplete(&self) -> bool {
        matches!(self, CompiledValue::Incomplete)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CompiledValue::Scalar(_) => "scalar",
            CompiledValue::Packed(_) => "packed record",
            CompiledValue::Boxed(_) => "boxed record",
            CompiledValue::Incomplete => "incomplete",
        }
    }
}

/// Resolves the concrete record type a value of static type `ty` carries
/// under `tag`.
pub fn variant_of(types: &TypeTable, ty: TypeId, tag: u8) -> Option<(TypeId, &RecordType)> {
    match types.get(ty) {
        TypeDescriptor::Sum(sum) => {
            let id = *sum.variants.get(usize::from(tag))?;
            types.record(id).map(|r| (id, r))
        }
        TypeDescriptor::Record(record) if record.tag == tag => Some((ty, record)),
        _ => None,
    }
}

enum EncodeTask<'a> {
    Encode(&'a Value, TypeId),
    Build { tag: u8, arity: usize },
}

/// Lowers a host value to its compiled representation under type `ty`.
///
/// Untyped host integers are accepted for any scalar width and wrap to it.
pub fn encode(types: &TypeTable, value: &Value, ty: TypeId) -> Result<CompiledValue, CompileError> {
    let mut tasks = vec![EncodeTask::Encode(value, ty)];
    let mut out: Vec<CompiledValue> = Vec::new();

    while let Some(task) = tasks.pop() {
        match task {
            EncodeTask::Encode(Value::Incomplete, _) => out.push(CompiledValue::Incomplete),
            EncodeTask::Encode(value, ty) => match types.get(ty) {
                TypeDescriptor::Scalar(scalar) => {
                    let n = integer(value, scalar.bits).ok_or_else(|| mismatch(types, value, ty))?;
                    out.push(CompiledValue::Scalar(n));
                }
                TypeDescriptor::Record(_) | TypeDescriptor::Sum(_) => {
                    let record = value.as_record().ok_or_else(|| mismatch(types, value, ty))?;
                    let (_, record_ty) = resolve_record(types, record, ty)?;

                    for field in &record.fields {
                        if field.is_incomplete() {
                            return Err(CompileError::type_error(format!(
                                "record \"{}\" cannot hold the incomplete-match sentinel",
                                record.ty
                            )));
                        }
                    }

                    match &record_ty.layout {
                        Layout::Packed(slots) => {
                            let mut word = u64::from(record_ty.tag);
                            for ((field, slot), decl) in
                                record.fields.iter().zip(slots).zip(&record_ty.fields)
                            {
                                let n = integer(field, slot.bits)
                                    .ok_or_else(|| mismatch(types, field, decl.ty))?;
                                word |= n << slot.shift;
                            }
                            out.push(CompiledValue::Packed(word));
                        }
                        Layout::Boxed => {
                            tasks.push(EncodeTask::Build {
                                tag: record_ty.tag,
                                arity: record.fields.len(),
                            });
                            for (field, decl) in record.fields.iter().zip(&record_ty.fields).rev() {
                                tasks.push(EncodeTask::Encode(field, decl.ty));
                            }
                        }
                    }
                }
            },
            EncodeTask::Build { tag, arity } => {
                let fields = out.split_off(out.len() - arity);
                out.push(CompiledValue::boxed(tag, fields));
            }
        }
    }

    out.pop()
        .ok_or_else(|| CompileError::type_error("encoding produced no value"))
}

enum DecodeTask<'a> {
    Decode(&'a CompiledValue, TypeId),
    Build { name: Ident, arity: usize },
}

/// Raises a compiled value of type `ty` back to a host value.
pub fn decode(types: &TypeTable, value: &CompiledValue, ty: TypeId) -> Result<Value, CompileError> {
    let mut tasks = vec![DecodeTask::Decode(value, ty)];
    let mut out: Vec<Value> = Vec::new();

    while let Some(task) = tasks.pop() {
        match task {
            DecodeTask::Decode(CompiledValue::Incomplete, _) => out.push(Value::Incomplete),
            DecodeTask::Decode(value, ty) => match (types.get(ty), value) {
                (TypeDescriptor::Scalar(scalar), CompiledValue::Scalar(n)) => {
                    out.push(Value::Uint(Uint::new(scalar.bits, *n)));
                }
                (TypeDescriptor::Record(_) | TypeDescriptor::Sum(_), _) => {
                    let (_, record_ty) = value
                        .tag()
                        .and_then(|tag| variant_of(types, ty, tag))
                        .ok_or_else(|| undecodable(types, value, ty))?;

                    match (&record_ty.layout, value) {
                        (Layout::Packed(slots), CompiledValue::Packed(word)) => {
                            let fields = slots
                                .iter()
                                .map(|slot| Value::Uint(Uint::new(slot.bits, word >> slot.shift)))
                                .collect();
                            out.push(Value::Record(Arc::new(Record::new(record_ty.name, fields))));
                        }
                        (Layout::Boxed, CompiledValue::Boxed(boxed))
                            if boxed.fields.len() == record_ty.fields.len() =>
                        {
                            tasks.push(DecodeTask::Build {
                                name: record_ty.name,
                                arity: boxed.fields.len(),
                            });
                            for (field, decl) in boxed.fields.iter().zip(&record_ty.fields).rev() {
                                tasks.push(DecodeTask::Decode(field, decl.ty));
                            }
                        }
                        _ => return Err(undecodable(types, value, ty)),
                    }
                }
                _ => return Err(undecodable(types, value, ty)),
            },
            DecodeTask::Build { name, arity } => {
                let fields = out.split_off(out.len() - arity);
                out.push(Value::Record(Arc::new(Record::new(name, fields))));
            }
        }
    }

    out.pop()
        .ok_or_else(|| CompileError::type_error("decoding produced no value"))
}

fn integer(value: &Value, bits: u8) -> Option<u64> {
    value.as_uint(bits).map(|u| Uint::new(bits, u.value()).value())
}

fn resolve_record<'t>(
    types: &'t TypeTable,
    record: &Record,
    ty: TypeId,
) -> Result<(TypeId, &'t RecordType), CompileError> {
    let id = types
        .lookup(record.ty)
        .filter(|id| *id == ty || types.widen(*id) == ty)
        .ok_or_else(|| {
            CompileError::type_error(format!(
                "\"{}\" is not a value of type \"{}\"",
                record.ty,
                types.name(ty)
            ))
        })?;
    let record_ty = types
        .record(id)
        .ok_or_else(|| {
            CompileError::type_error(format!("\"{}\" is not a record type", record.ty))
        })?;
    if record_ty.fields.len() != record.fields.len() {
        return Err(CompileError::type_error(format!(
            "record \"{}\" has {} fields, got {}",
            record.ty,
            record_ty.fields.len(),
            record.fields.len()
        )));
    }
    Ok((id, record_ty))
}

fn mismatch(types: &TypeTable, value: &Value, ty: TypeId) -> CompileError {
    CompileError::type_error(format!(
        "expected a value of type \"{}\", got {}",
        types.name(ty),
        value.type_name()
    ))
}

fn undecodable(types: &TypeTable, value: &CompiledValue, ty: TypeId) -> CompileError {
    CompileError::type_error(format!(
        "cannot decode {} as \"{}\"",
        value.kind(),
        types.name(ty)
    ))
}
