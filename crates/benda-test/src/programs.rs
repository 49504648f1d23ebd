//! Canonical programs over trees, lists and integers.
//!
//! Each function returns a plain [`FunctionDef`] so callers choose whether it
//! is decorated ([`Engine::jit`]) or interpreted ([`Engine::define`]).

use benda_lang::{Arm, BinOp, Engine, Expr, FunctionDef, Pattern, Stmt, TypeDecl, Value};

pub fn tree_types() -> Vec<TypeDecl> {
    vec![
        TypeDecl::record("Leaf", &[("value", "u24")]),
        TypeDecl::record("Node", &[("left", "Tree"), ("right", "Tree")]),
        TypeDecl::sum("Tree", &["Node", "Leaf"]),
    ]
}

pub fn list_types() -> Vec<TypeDecl> {
    vec![
        TypeDecl::record("Nil", &[]),
        TypeDecl::record("Cons", &[("head", "u24"), ("tail", "List")]),
        TypeDecl::sum("List", &["Nil", "Cons"]),
    ]
}

/// A standalone record: no home sum, so it keeps tag `0`.
pub fn pair_types() -> Vec<TypeDecl> {
    vec![TypeDecl::record("Pair", &[("first", "u24"), ("second", "u24")])]
}

pub fn pair(first: u64, second: u64) -> Value {
    Value::record("Pair", vec![Value::u24(first), Value::u24(second)])
}

pub fn leaf(value: u64) -> Value {
    Value::record("Leaf", vec![Value::u24(value)])
}

pub fn node(left: Value, right: Value) -> Value {
    Value::record("Node", vec![left, right])
}

/// Builds a cons list holding `items` in order.
pub fn list(items: &[u64]) -> Value {
    items.iter().rev().fold(Value::record("Nil", vec![]), |tail, head| {
        Value::record("Cons", vec![Value::u24(*head), tail])
    })
}

/// Engine with the tree, list and pair types declared and every decorated program
/// in this module registered.
pub fn tree_engine() -> Engine {
    let engine = Engine::default();
    let mut decls = tree_types();
    decls.extend(list_types());
    decls.extend(pair_types());
    engine
        .declare_types(&decls)
        .expect("test types are well formed");
    for def in [
        sum_tree(),
        gen_tree(),
        mirror(),
        count_leaves(),
        swap(),
        gen_list(),
        sum_list(),
        length(),
        is_even(),
        is_odd(),
        sum_nums(),
    ] {
        engine.jit(def).expect("test programs do not shadow types");
    }
    engine
}

fn sub(lhs: Expr, n: u64) -> Expr {
    Expr::binary(BinOp::Sub, lhs, Expr::lit(n))
}

fn add(lhs: Expr, rhs: Expr) -> Expr {
    Expr::binary(BinOp::Add, lhs, rhs)
}

/// `sum_tree(Node(l, r)) = sum_tree(l) + sum_tree(r)`, `sum_tree(Leaf(v)) = v`.
pub fn sum_tree() -> FunctionDef {
    FunctionDef::new(
        "sum_tree",
        &["tree"],
        vec![Stmt::matches(
            Expr::var("tree"),
            vec![
                Arm::new(
                    Pattern::ctor("Node", &["left", "right"]),
                    vec![Stmt::ret(add(
                        Expr::call("sum_tree", vec![Expr::var("left")]),
                        Expr::call("sum_tree", vec![Expr::var("right")]),
                    ))],
                ),
                Arm::new(Pattern::ctor("Leaf", &["value"]), vec![Stmt::ret(Expr::var("value"))]),
            ],
        )],
    )
}

/// Perfect tree of the given depth whose leaves sum to `2^depth * n`.
///
/// `gen_tree(0, n) = Leaf(n)`, otherwise
/// `Node(gen_tree(depth - 1, n - 1), gen_tree(depth - 1, n + 1))`.
pub fn gen_tree() -> FunctionDef {
    FunctionDef::new(
        "gen_tree",
        &["depth", "n"],
        vec![Stmt::matches(
            Expr::var("depth"),
            vec![
                Arm::new(
                    Pattern::Literal(0),
                    vec![Stmt::ret(Expr::call("Leaf", vec![Expr::var("n")]))],
                ),
                Arm::new(
                    Pattern::Wildcard,
                    vec![
                        Stmt::bind("next", sub(Expr::var("depth"), 1)),
                        Stmt::ret(Expr::call(
                            "Node",
                            vec![
                                Expr::call(
                                    "gen_tree",
                                    vec![Expr::var("next"), sub(Expr::var("n"), 1)],
                                ),
                                Expr::call(
                                    "gen_tree",
                                    vec![Expr::var("next"), add(Expr::var("n"), Expr::lit(1))],
                                ),
                            ],
                        )),
                    ],
                ),
            ],
        )],
    )
}

pub fn mirror() -> FunctionDef {
    FunctionDef::new(
        "mirror",
        &["tree"],
        vec![Stmt::ret(Expr::matches(
            Expr::var("tree"),
            vec![
                Arm::new(
                    Pattern::ctor("Node", &["left", "right"]),
                    Expr::call(
                        "Node",
                        vec![
                            Expr::call("mirror", vec![Expr::var("right")]),
                            Expr::call("mirror", vec![Expr::var("left")]),
                        ],
                    ),
                ),
                Arm::new(Pattern::bind("leaf"), Expr::var("leaf")),
            ],
        ))],
    )
}

pub fn count_leaves() -> FunctionDef {
    FunctionDef::new(
        "count_leaves",
        &["tree"],
        vec![Stmt::matches(
            Expr::var("tree"),
            vec![
                Arm::new(
                    Pattern::ctor("Node", &["left", "right"]),
                    vec![Stmt::ret(add(
                        Expr::call("count_leaves", vec![Expr::var("left")]),
                        Expr::call("count_leaves", vec![Expr::var("right")]),
                    ))],
                ),
                Arm::new(Pattern::Wildcard, vec![Stmt::ret(Expr::lit(1))]),
            ],
        )],
    )
}

/// `swap(p) = Pair(p.second, p.first)`, read through field access.
pub fn swap() -> FunctionDef {
    FunctionDef::new(
        "swap",
        &["pair"],
        vec![Stmt::ret(Expr::call(
            "Pair",
            vec![
                Expr::field(Expr::var("pair"), "second"),
                Expr::field(Expr::var("pair"), "first"),
            ],
        ))],
    )
}

/// `gen_list(n) = [n, n - 1, ..., 1]`.
pub fn gen_list() -> FunctionDef {
    FunctionDef::new(
        "gen_list",
        &["n"],
        vec![Stmt::matches(
            Expr::var("n"),
            vec![
                Arm::new(Pattern::Literal(0), vec![Stmt::ret(Expr::call("Nil", vec![]))]),
                Arm::new(
                    Pattern::Wildcard,
                    vec![Stmt::ret(Expr::call(
                        "Cons",
                        vec![Expr::var("n"), Expr::call("gen_list", vec![sub(Expr::var("n"), 1)])],
                    ))],
                ),
            ],
        )],
    )
}

pub fn sum_list() -> FunctionDef {
    FunctionDef::new(
        "sum_list",
        &["list"],
        vec![Stmt::matches(
            Expr::var("list"),
            vec![
                Arm::new(Pattern::ctor("Nil", &[]), vec![Stmt::ret(Expr::lit(0))]),
                Arm::new(
                    Pattern::ctor("Cons", &["head", "tail"]),
                    vec![Stmt::ret(add(
                        Expr::var("head"),
                        Expr::call("sum_list", vec![Expr::var("tail")]),
                    ))],
                ),
            ],
        )],
    )
}

pub fn length() -> FunctionDef {
    FunctionDef::new(
        "length",
        &["list"],
        vec![
            Stmt::matches(
                Expr::var("list"),
                vec![Arm::new(
                    Pattern::ctor("Cons", &["_", "tail"]),
                    vec![Stmt::ret(add(
                        Expr::lit(1),
                        Expr::call("length", vec![Expr::var("tail")]),
                    ))],
                )],
            ),
            Stmt::ret(Expr::lit(0)),
        ],
    )
}

/// `1` when `n` is even; mutually recursive with [`is_odd`].
pub fn is_even() -> FunctionDef {
    parity("is_even", "is_odd", 1)
}

pub fn is_odd() -> FunctionDef {
    parity("is_odd", "is_even", 0)
}

fn parity(name: &str, other: &str, at_zero: u64) -> FunctionDef {
    FunctionDef::new(
        name,
        &["n"],
        vec![Stmt::matches(
            Expr::var("n"),
            vec![
                Arm::new(Pattern::Literal(0), vec![Stmt::ret(Expr::lit(at_zero))]),
                Arm::new(
                    Pattern::Wildcard,
                    vec![Stmt::ret(Expr::call(other, vec![sub(Expr::var("n"), 1)]))],
                ),
            ],
        )],
    )
}

/// Returns the incomplete-match sentinel unless `a == b` produced `0` or `1`.
///
/// Equal arguments give `a * mul`, different ones `a + b`.
pub fn sum_nums() -> FunctionDef {
    FunctionDef::new(
        "sum_nums",
        &["a", "b", "mul"],
        vec![
            Stmt::bind("d", Expr::Incomplete),
            Stmt::matches(
                Expr::binary(BinOp::Eq, Expr::var("a"), Expr::var("b")),
                vec![
                    Arm::new(
                        Pattern::Literal(0),
                        vec![Stmt::ret(add(Expr::var("a"), Expr::var("b")))],
                    ),
                    Arm::new(
                        Pattern::Literal(1),
                        vec![Stmt::ret(Expr::binary(BinOp::Mul, Expr::var("a"), Expr::var("mul")))],
                    ),
                ],
            ),
            Stmt::ret(Expr::var("d")),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(&[], "Nil")]
    #[case(&[1, 2], "Cons")]
    fn test_list_builder(#[case] items: &[u64], #[case] head: &str) {
        let value = list(items);
        assert_eq!(value.as_record().map(|r| r.ty.as_str()), Some(head.to_string()));
    }

    #[test]
    fn test_tree_engine_declares_everything() {
        let engine = tree_engine();
        assert!(engine.type_id("Tree").is_some());
        assert!(engine.type_id("List").is_some());
        assert_eq!(engine.call("sum_tree", &[node(leaf(1), leaf(2))]).unwrap(), Value::u24(3));
    }
}
