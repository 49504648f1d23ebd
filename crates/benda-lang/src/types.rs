//! Type lowering.
//!
//! Declared records and sums are lowered into [`TypeDescriptor`]s owned by a
//! process-wide [`TypeRegistry`]. Fields refer to other types by [`TypeId`], so
//! a sum that is recursive through its own fields becomes a back-reference
//! rather than an infinite expansion.
//!
//! Each record has at most one *home* sum. Its variant tag is its position in
//! that sum, or `0` when it has none, so widening a record value to its sum
//! never changes the representation.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::Ident;
use crate::error::compile::CompileError;

/// Bits reserved for the variant tag at the bottom of a packed word.
pub const TAG_BITS: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(u32);

impl TypeId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeDescriptor {
    Scalar(ScalarType),
    Record(RecordType),
    Sum(SumType),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalarType {
    pub bits: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordType {
    pub name: Ident,
    pub fields: Vec<Field>,
    pub home: Option<TypeId>,
    pub tag: u8,
    pub layout: Layout,
}

impl RecordType {
    pub fn field_index(&self, name: Ident) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn is_packed(&self) -> bool {
        matches!(self.layout, Layout::Packed(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub name: Ident,
    pub ty: TypeId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SumType {
    pub name: Ident,
    pub variants: Vec<TypeId>,
}

/// Fixed representation chosen for a record at declaration time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layout {
    /// Tag and every field share one 64-bit word.
    Packed(SmallVec<[PackedField; 4]>),
    /// Heap-allocated tag plus field vector.
    Boxed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedField {
    pub shift: u8,
    pub bits: u8,
}

/// A record or sum declaration as handed over by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeDecl {
    /// Fields are `(name, type name)` pairs; type names are `uN` scalars or
    /// records and sums.
    Record { name: Ident, fields: Vec<(Ident, Ident)> },
    Sum { name: Ident, variants: Vec<Ident> },
}

impl TypeDecl {
    pub fn record(name: &str, fields: &[(&str, &str)]) -> Self {
        TypeDecl::Record {
            name: Ident::new(name),
            fields: fields
                .iter()
                .map(|(f, t)| (Ident::new(f), Ident::new(t)))
                .collect(),
        }
    }

    pub fn sum(name: &str, variants: &[&str]) -> Self {
        TypeDecl::Sum {
            name: Ident::new(name),
            variants: variants.iter().map(|v| Ident::new(v)).collect(),
        }
    }

    pub fn name(&self) -> Ident {
        match self {
            TypeDecl::Record { name, .. } | TypeDecl::Sum { name, .. } => *name,
        }
    }
}

/// Parses `u1`..`u64`.
pub fn scalar_width(name: &str) -> Option<u8> {
    let bits: u8 = name.strip_prefix('u')?.parse().ok()?;
    (1..=64).contains(&bits).then_some(bits)
}

/// Immutable snapshot of every registered type.
#[derive(Debug, Default, Clone)]
pub struct TypeTable {
    types: Vec<TypeDescriptor>,
    names: FxHashMap<Ident, TypeId>,
    decls: FxHashMap<Ident, TypeDecl>,
}

impl TypeTable {
    /// # Panics
    ///
    /// Panics if `id` was issued by a different registry.
    #[inline]
    pub fn get(&self, id: TypeId) -> &TypeDescriptor {
        &self.types[id.index()]
    }

    pub fn lookup(&self, name: Ident) -> Option<TypeId> {
        self.names.get(&name).copied()
    }

    pub fn scalar(&self, bits: u8) -> Option<TypeId> {
        self.lookup(Ident::new(&format!("u{}", bits)))
    }

    pub fn scalar_bits(&self, id: TypeId) -> Option<u8> {
        match self.get(id) {
            TypeDescriptor::Scalar(s) => Some(s.bits),
            _ => None,
        }
    }

    pub fn record(&self, id: TypeId) -> Option<&RecordType> {
        match self.get(id) {
            TypeDescriptor::Record(r) => Some(r),
            _ => None,
        }
    }

    pub fn sum(&self, id: TypeId) -> Option<&SumType> {
        match self.get(id) {
            TypeDescriptor::Sum(s) => Some(s),
            _ => None,
        }
    }

    /// The home sum of a record, or `id` itself for every other type.
    pub fn widen(&self, id: TypeId) -> TypeId {
        self.record(id).and_then(|r| r.home).unwrap_or(id)
    }

    pub fn name(&self, id: TypeId) -> String {
        match self.get(id) {
            TypeDescriptor::Scalar(s) => format!("u{}", s.bits),
            TypeDescriptor::Record(r) => r.name.as_str(),
            TypeDescriptor::Sum(s) => s.name.as_str(),
        }
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    fn push(&mut self, name: Ident, descriptor: TypeDescriptor) -> TypeId {
        let id = TypeId(self.types.len() as u32);
        self.types.push(descriptor);
        self.names.insert(name, id);
        id
    }

    fn ensure_scalar(&mut self, bits: u8) -> TypeId {
        let name = Ident::new(&format!("u{}", bits));
        match self.lookup(name) {
            Some(id) => id,
            None => self.push(name, TypeDescriptor::Scalar(ScalarType { bits })),
        }
    }

    fn declare(&mut self, decls: &[TypeDecl]) -> Result<Vec<TypeId>, CompileError> {
        let mut fresh: FxHashMap<Ident, usize> = FxHashMap::default();
        for decl in decls {
            let name = decl.name();
            if scalar_width(&name.as_str()).is_some() {
                return Err(CompileError::type_error(format!(
                    "\"{}\" is a builtin scalar type",
                    name
                )));
            }
            match self.decls.get(&name) {
                Some(existing) if existing == decl => {}
                Some(_) => {
                    return Err(CompileError::type_error(format!(
                        "\"{}\" is already declared with a different shape",
                        name
                    )));
                }
                None => {
                    if fresh.insert(name, fresh.len()).is_some() {
                        return Err(CompileError::type_error(format!(
                            "\"{}\" is declared twice",
                            name
                        )));
                    }
                }
            }
        }

        // Builtin scalars go in first so fresh ids stay contiguous.
        for decl in decls {
            if let TypeDecl::Record { fields, .. } = decl {
                for (_, ty) in fields {
                    if !fresh.contains_key(ty)
                        && self.lookup(*ty).is_none()
                        && let Some(bits) = scalar_width(&ty.as_str())
                    {
                        self.ensure_scalar(bits);
                    }
                }
            }
        }

        let base = self.types.len() as u32;
        let fresh_id = |name: &Ident| fresh.get(name).map(|i| TypeId(base + *i as u32));

        // Homes and tags of fresh records, assigned by fresh sums.
        let mut homes: FxHashMap<Ident, (TypeId, u8)> = FxHashMap::default();
        for decl in decls {
            let TypeDecl::Sum { name, variants } = decl else {
                continue;
            };
            let Some(sum_id) = fresh_id(name) else {
                continue;
            };
            if variants.len() < 2 {
                return Err(CompileError::type_error(format!(
                    "sum \"{}\" needs at least two variants",
                    name
                )));
            }
            if variants.len() > usize::from(u8::MAX) + 1 {
                return Err(CompileError::type_error(format!(
                    "sum \"{}\" has more than 256 variants",
                    name
                )));
            }
            for (tag, variant) in variants.iter().enumerate() {
                let is_fresh_record = decls.iter().any(|d| {
                    matches!(d, TypeDecl::Record { name, .. } if name == variant)
                        && fresh.contains_key(variant)
                });
                if !is_fresh_record {
                    return Err(CompileError::type_error(format!(
                        "variant \"{}\" of sum \"{}\" must be a record declared together with it",
                        variant, name
                    )));
                }
                if homes.insert(*variant, (sum_id, tag as u8)).is_some() {
                    return Err(CompileError::type_error(format!(
                        "record \"{}\" belongs to more than one sum",
                        variant
                    )));
                }
            }
        }

        let mut staged: Vec<(Ident, TypeDescriptor)> = Vec::with_capacity(fresh.len());
        for decl in decls.iter().filter(|d| fresh.contains_key(&d.name())) {
            let descriptor = match decl {
                TypeDecl::Record { name, fields } => {
                    let mut resolved = Vec::with_capacity(fields.len());
                    for (field, ty) in fields {
                        if resolved.iter().any(|f: &Field| f.name == *field) {
                            return Err(CompileError::type_error(format!(
                                "record \"{}\" declares field \"{}\" twice",
                                name, field
                            )));
                        }
                        let Some(ty) = fresh_id(ty).or_else(|| self.lookup(*ty)) else {
                            return Err(CompileError::type_error(format!(
                                "cannot resolve type \"{}\" of field \"{}.{}\"",
                                ty, name, field
                            )));
                        };
                        resolved.push(Field { name: *field, ty });
                    }
                    let (home, tag) = match homes.get(name) {
                        Some((sum, tag)) => (Some(*sum), *tag),
                        None => (None, 0),
                    };
                    let layout = self.layout_of(&resolved);
                    TypeDescriptor::Record(RecordType {
                        name: *name,
                        fields: resolved,
                        home,
                        tag,
                        layout,
                    })
                }
                TypeDecl::Sum { name, variants } => TypeDescriptor::Sum(SumType {
                    name: *name,
                    variants: variants.iter().filter_map(&fresh_id).collect(),
                }),
            };
            staged.push((decl.name(), descriptor));
        }

        for (name, descriptor) in staged {
            self.push(name, descriptor);
        }
        for decl in decls {
            self.decls.entry(decl.name()).or_insert_with(|| decl.clone());
        }

        decls
            .iter()
            .map(|d| {
                self.lookup(d.name()).ok_or_else(|| {
                    CompileError::type_error(format!("\"{}\" was not registered", d.name()))
                })
            })
            .collect()
    }

    fn layout_of(&self, fields: &[Field]) -> Layout {
        let mut packed = SmallVec::new();
        let mut shift = TAG_BITS;
        for field in fields {
            // Fresh (not yet pushed) ids are records or sums, never scalars.
            let bits = match self.types.get(field.ty.index()) {
                Some(TypeDescriptor::Scalar(s)) => s.bits,
                _ => return Layout::Boxed,
            };
            if u32::from(shift) + u32::from(bits) > 64 {
                return Layout::Boxed;
            }
            packed.push(PackedField { shift, bits });
            shift += bits;
        }
        Layout::Packed(packed)
    }
}

/// Process-wide owner of every [`TypeDescriptor`].
///
/// Readers take a cheap snapshot with [`TypeRegistry::view`]; declarations
/// copy the table, extend it and publish the new snapshot, so a snapshot
/// never changes underneath a compilation.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    table: RwLock<Arc<TypeTable>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn view(&self) -> Arc<TypeTable> {
        Arc::clone(&self.table.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Registers a group of mutually-referencing declarations atomically.
    ///
    /// Declaring an identical group again returns the existing ids.
    pub fn declare(&self, decls: &[TypeDecl]) -> Result<Vec<TypeId>, CompileError> {
        let mut guard = self.table.write().unwrap_or_else(PoisonError::into_inner);
        let mut table = TypeTable::clone(&guard);
        let ids = table.declare(decls)?;
        *guard = Arc::new(table);
        Ok(ids)
    }

    pub fn scalar(&self, bits: u8) -> Result<TypeId, CompileError> {
        if !(1..=64).contains(&bits) {
            return Err(CompileError::type_error(format!(
                "scalar width {} is outside 1..=64",
                bits
            )));
        }
        if let Some(id) = self.view().scalar(bits) {
            return Ok(id);
        }
        let mut guard = self.table.write().unwrap_or_else(PoisonError::into_inner);
        let mut table = TypeTable::clone(&guard);
        let id = table.ensure_scalar(bits);
        *guard = Arc::new(table);
        Ok(id)
    }

    pub fn lookup(&self, name: &str) -> Option<TypeId> {
        self.view().lookup(Ident::new(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn tree_decls() -> Vec<TypeDecl> {
        vec![
            TypeDecl::record("Leaf", &[("value", "u24")]),
            TypeDecl::record("Node", &[("left", "Tree"), ("right", "Tree")]),
            TypeDecl::sum("Tree", &["Node", "Leaf"]),
        ]
    }

    #[test]
    fn test_declare_recursive_sum() {
        let registry = TypeRegistry::new();
        let ids = registry.declare(&tree_decls()).unwrap();
        let view = registry.view();
        let (leaf, node, tree) = (ids[0], ids[1], ids[2]);

        let node_ty = view.record(node).unwrap();
        assert_eq!(node_ty.fields[0].ty, tree);
        assert_eq!(node_ty.home, Some(tree));
        assert_eq!(node_ty.tag, 0);
        assert_eq!(view.record(leaf).unwrap().tag, 1);
        assert_eq!(view.sum(tree).unwrap().variants, vec![node, leaf]);
        assert_eq!(view.widen(leaf), tree);
    }

    #[test]
    fn test_layouts() {
        let registry = TypeRegistry::new();
        let ids = registry.declare(&tree_decls()).unwrap();
        let view = registry.view();
        assert_eq!(
            view.record(ids[0]).unwrap().layout,
            Layout::Packed(smallvec::smallvec![PackedField { shift: 8, bits: 24 }])
        );
        assert_eq!(view.record(ids[1]).unwrap().layout, Layout::Boxed);
    }

    #[rstest]
    #[case(&[("a", "u32"), ("b", "u24")], true)]
    #[case(&[("a", "u32"), ("b", "u32")], false)]
    #[case(&[], true)]
    fn test_packing_rule(#[case] fields: &[(&str, &str)], #[case] packed: bool) {
        let registry = TypeRegistry::new();
        let ids = registry.declare(&[TypeDecl::record("R", fields)]).unwrap();
        assert_eq!(registry.view().record(ids[0]).unwrap().is_packed(), packed);
    }

    #[test]
    fn test_redeclare_identical_is_idempotent() {
        let registry = TypeRegistry::new();
        let first = registry.declare(&tree_decls()).unwrap();
        let second = registry.declare(&tree_decls()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_concurrent_declarations_converge() {
        let registry = Arc::new(TypeRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.declare(&tree_decls()).unwrap())
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(results.windows(2).all(|w| w[0] == w[1]));
    }

    #[rstest]
    #[case::unresolved(vec![TypeDecl::record("Leaf", &[("value", "Missing")])])]
    #[case::single_variant(vec![TypeDecl::record("A", &[]), TypeDecl::sum("S", &["A"])])]
    #[case::variant_not_record(vec![
        TypeDecl::record("A", &[]),
        TypeDecl::sum("S", &["A", "u8"]),
    ])]
    #[case::claimed_twice(vec![
        TypeDecl::record("A", &[]),
        TypeDecl::record("B", &[]),
        TypeDecl::sum("S", &["A", "B"]),
        TypeDecl::sum("T", &["A", "B"]),
    ])]
    #[case::duplicate_field(vec![TypeDecl::record("A", &[("x", "u8"), ("x", "u8")])])]
    #[case::scalar_name(vec![TypeDecl::record("u8", &[])])]
    fn test_declare_errors(#[case] decls: Vec<TypeDecl>) {
        let registry = TypeRegistry::new();
        assert!(matches!(registry.declare(&decls), Err(CompileError::TypeError(_))));
    }

    #[test]
    fn test_conflicting_redeclaration() {
        let registry = TypeRegistry::new();
        registry.declare(&[TypeDecl::record("P", &[("x", "u8")])]).unwrap();
        let result = registry.declare(&[TypeDecl::record("P", &[("x", "u16")])]);
        assert!(matches!(result, Err(CompileError::TypeError(_))));
    }

    #[test]
    fn test_failed_group_leaves_registry_unchanged() {
        let registry = TypeRegistry::new();
        let _ = registry.declare(&[
            TypeDecl::record("Good", &[("x", "u8")]),
            TypeDecl::record("Bad", &[("y", "Nope")]),
        ]);
        assert_eq!(registry.lookup("Good"), None);
        assert!(registry.view().is_empty());
    }

    #[rstest]
    #[case("u24", Some(24))]
    #[case("u1", Some(1))]
    #[case("u64", Some(64))]
    #[case("u65", None)]
    #[case("u0", None)]
    #[case("Tree", None)]
    fn test_scalar_width(#[case] name: &str, #[case] expected: Option<u8>) {
        assert_eq!(scalar_width(name), expected);
    }
}
