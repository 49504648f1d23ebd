//! `benda-lang` is a selective compiler for functions over recursive algebraic
//! data types.
//!
//! Functions marked with [`Engine::jit`] are specialized on the shapes of
//! their arguments and compiled to a register machine that dispatches on
//! variant tags. Sum types are lowered to a compact tagged representation, and
//! recursion (direct or mutual) runs on heap frames, so walking a tree with a
//! million nodes needs no native stack.
//!
//! ## Examples
//!
//! ```rust
//! use benda_lang::{Arm, BinOp, Engine, Expr, FunctionDef, Pattern, Stmt, TypeDecl, Value};
//!
//! let engine = Engine::default();
//! engine
//!     .declare_types(&[
//!         TypeDecl::record("Leaf", &[("value", "u24")]),
//!         TypeDecl::record("Node", &[("left", "Tree"), ("right", "Tree")]),
//!         TypeDecl::sum("Tree", &["Node", "Leaf"]),
//!     ])
//!     .unwrap();
//!
//! let sum_tree = engine
//!     .jit(FunctionDef::new(
//!         "sum_tree",
//!         &["tree"],
//!         vec![Stmt::matches(
//!             Expr::var("tree"),
//!             vec![
//!                 Arm::new(
//!                     Pattern::ctor("Node", &["left", "right"]),
//!                     vec![Stmt::ret(Expr::binary(
//!                         BinOp::Add,
//!                         Expr::call("sum_tree", vec![Expr::var("left")]),
//!                         Expr::call("sum_tree", vec![Expr::var("right")]),
//!                     ))],
//!                 ),
//!                 Arm::new(
//!                     Pattern::ctor("Leaf", &["value"]),
//!                     vec![Stmt::ret(Expr::var("value"))],
//!                 ),
//!             ],
//!         )],
//!     ))
//!     .unwrap();
//!
//! let leaf = |n| Value::record("Leaf", vec![Value::u24(n)]);
//! let tree = Value::record("Node", vec![leaf(1), leaf(2)]);
//!
//! assert_eq!(sum_tree.call(&[tree]).unwrap(), Value::u24(3));
//! // One specialization for the `Node` root, one for the `Tree` fields below it.
//! assert_eq!(engine.stats().compilations, 2);
//! ```
mod ast;
mod bridge;
mod compiler;
mod engine;
mod error;
mod eval;
mod ident;
mod repr;
mod specializer;
mod types;
mod value;

pub use ast::{Arm, BinOp, Block, Expr, FunctionDef, Params, Pattern, Stmt};
pub use bridge::{NativeFn, NativeFunction};
pub use compiler::compiled::{CallSite, CompiledFunction, HostSite};
pub use engine::{DEFAULT_MAX_HOST_DEPTH, Engine, JitFunction, Options, Stats};
pub use error::Error;
pub use error::compile::CompileError;
pub use error::runtime::RuntimeError;
pub use ident::Ident;
pub use repr::{Boxed, CompiledValue};
pub use specializer::Signature;
pub use types::{
    Field, Layout, PackedField, RecordType, ScalarType, SumType, TypeDecl, TypeDescriptor, TypeId,
    TypeTable,
};
pub use value::{Record, Uint, Value};

pub type BendaResult = Result<Value, Error>;
