use benda_lang::{
    Arm, BendaResult, BinOp, CompileError, CompiledValue, Engine, Error, Expr, FunctionDef,
    NativeFunction, Options, Pattern, RuntimeError, Stmt, TypeDecl, Value,
};
use benda_test::programs::{self, leaf, list, node, pair, tree_engine};
use rstest::{fixture, rstest};
use tracing_subscriber::EnvFilter;

#[fixture]
fn engine() -> Engine {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    tree_engine()
}

fn ints(values: &[u64]) -> Vec<Value> {
    values.iter().map(|n| Value::Int(*n)).collect()
}

fn add(lhs: Expr, rhs: Expr) -> Expr {
    Expr::binary(BinOp::Add, lhs, rhs)
}

/// `sum_tree(gen_tree(depth, n))` without leaving compiled code.
fn sum_gen() -> FunctionDef {
    FunctionDef::new(
        "sum_gen",
        &["depth", "n"],
        vec![Stmt::ret(Expr::call(
            "sum_tree",
            vec![Expr::call("gen_tree", vec![Expr::var("depth"), Expr::var("n")])],
        ))],
    )
}

#[rstest]
#[case::leaf("sum_tree", vec![leaf(5)], Ok(Value::u24(5)))]
#[case::node("sum_tree", vec![node(leaf(1), node(leaf(2), leaf(3)))], Ok(Value::u24(6)))]
#[case::wraps("sum_tree", vec![node(leaf((1 << 24) - 1), leaf(3))], Ok(Value::u24(2)))]
#[case::gen_tree_leaf("gen_tree", ints(&[0, 9]), Ok(leaf(9)))]
#[case::gen_tree_node("gen_tree", ints(&[1, 9]), Ok(node(leaf(8), leaf(10))))]
#[case::gen_tree_wraps_seed("gen_tree", ints(&[0, (1 << 24) + 7]), Ok(leaf(7)))]
#[case::mirror(
    "mirror",
    vec![node(leaf(1), node(leaf(2), leaf(3)))],
    Ok(node(node(leaf(3), leaf(2)), leaf(1)))
)]
#[case::count_leaves(
    "count_leaves",
    vec![node(leaf(1), node(leaf(2), leaf(3)))],
    Ok(Value::u24(3))
)]
#[case::swap_packed_record("swap", vec![pair(1, 2)], Ok(pair(2, 1)))]
#[case::gen_list("gen_list", vec![Value::Int(3)], Ok(list(&[3, 2, 1])))]
#[case::sum_list("sum_list", vec![list(&[4, 5, 6])], Ok(Value::u24(15)))]
#[case::length_falls_through("length", vec![list(&[])], Ok(Value::u24(0)))]
#[case::length("length", vec![list(&[7, 7, 7, 7])], Ok(Value::u24(4)))]
#[case::is_even("is_even", vec![Value::Int(10)], Ok(Value::u24(1)))]
#[case::is_odd("is_odd", vec![Value::Int(10)], Ok(Value::u24(0)))]
#[case::sum_nums_different("sum_nums", ints(&[2, 3, 4]), Ok(Value::u24(5)))]
#[case::sum_nums_equal("sum_nums", ints(&[3, 3, 4]), Ok(Value::u24(12)))]
#[case::not_defined("nowhere", vec![], Err(RuntimeError::NotDefined("nowhere".into()).into()))]
#[case::sentinel_argument(
    "sum_tree",
    vec![Value::Incomplete],
    Err(CompileError::TypeError(
        "cannot specialize \"sum_tree\" on the incomplete-match sentinel".into()
    )
    .into())
)]
fn test_call(
    engine: Engine,
    #[case] name: &str,
    #[case] args: Vec<Value>,
    #[case] expected: BendaResult,
) {
    assert_eq!(engine.call(name, &args), expected);
}

#[rstest]
#[case::single_leaf(0, 5)]
#[case::shallow(3, 5)]
#[case::wrapping_seed(4, 0)]
#[case::large_product(12, 4097)]
fn test_gen_tree_closed_form(engine: Engine, #[case] depth: u64, #[case] n: u64) {
    engine.jit(sum_gen()).unwrap();
    let expected = (n << depth) & ((1 << 24) - 1);
    assert_eq!(
        engine.call("sum_gen", &[Value::Int(depth), Value::Int(n)]),
        Ok(Value::u24(expected))
    );
}

#[rstest]
fn test_million_node_tree(engine: Engine) {
    let tree = engine.call("gen_tree", &[Value::Int(19), Value::Int(3)]).unwrap();
    assert_eq!(
        engine.call("sum_tree", &[tree.clone()]),
        Ok(Value::u24((3 << 19) & ((1 << 24) - 1)))
    );
    assert_eq!(engine.call("count_leaves", &[tree]), Ok(Value::u24(1 << 19)));
}

#[rstest]
fn test_deep_list_runs_on_heap_frames(engine: Engine) {
    let n: u64 = 100_000;
    let list = engine.call("gen_list", &[Value::Int(n)]).unwrap();
    assert_eq!(engine.call("length", &[list.clone()]), Ok(Value::u24(n)));
    assert_eq!(
        engine.call("sum_list", &[list]),
        Ok(Value::u24((n * (n + 1) / 2) & ((1 << 24) - 1)))
    );
}

#[rstest]
fn test_deep_mutual_recursion(engine: Engine) {
    assert_eq!(engine.call("is_even", &[Value::Int(100_001)]), Ok(Value::u24(0)));
    assert_eq!(engine.call("is_odd", &[Value::Int(100_001)]), Ok(Value::u24(1)));
}

#[rstest]
fn test_cache_hit_on_second_call(engine: Engine) {
    let tree = node(leaf(1), leaf(2));
    engine.call("sum_tree", &[tree.clone()]).unwrap();
    engine.call("sum_tree", &[tree]).unwrap();

    // sum_tree(Node) for the root, sum_tree(Tree) for its fields.
    let stats = engine.stats();
    assert_eq!(stats.compilations, 2);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.executions, 2);
}

#[rstest]
fn test_untyped_and_u24_arguments_share_a_specialization(engine: Engine) {
    engine.call("gen_list", &[Value::Int(2)]).unwrap();
    engine.call("gen_list", &[Value::u24(2)]).unwrap();
    assert_eq!(engine.stats().compilations, 1);
}

#[rstest]
fn test_each_variant_has_its_own_specialization(engine: Engine) {
    engine.call("sum_tree", &[leaf(1)]).unwrap();
    assert_eq!(engine.stats().compilations, 1);
    engine.call("sum_tree", &[node(leaf(1), leaf(1))]).unwrap();
    assert_eq!(engine.stats().compilations, 3);
    engine.call("sum_tree", &[leaf(7)]).unwrap();
    assert_eq!(engine.stats().compilations, 3);
}

#[rstest]
fn test_field_access_on_a_variant_argument(engine: Engine) {
    let get = engine
        .jit(FunctionDef::new(
            "get",
            &["leaf"],
            vec![Stmt::ret(Expr::field(Expr::var("leaf"), "value"))],
        ))
        .unwrap();
    assert_eq!(get.call(&[leaf(5)]), Ok(Value::u24(5)));
    assert_eq!(get.verify(&[leaf(5)]), Ok(Value::u24(5)));
}

#[rstest]
fn test_variant_argument_fills_a_variant_field(engine: Engine) {
    engine
        .declare_types(&[TypeDecl::record("Wrap", &[("inner", "Leaf")])])
        .unwrap();
    let wrap = engine
        .jit(FunctionDef::new(
            "wrap",
            &["x"],
            vec![Stmt::ret(Expr::call("Wrap", vec![Expr::var("x")]))],
        ))
        .unwrap();
    let expected = Value::record("Wrap", vec![leaf(5)]);
    assert_eq!(wrap.call(&[leaf(5)]), Ok(expected.clone()));
    assert_eq!(wrap.verify(&[leaf(5)]), Ok(expected));
}

#[rstest]
fn test_call_sites_bind_on_first_execution(engine: Engine) {
    engine
        .jit(FunctionDef::new(
            "maybe_gen",
            &["n"],
            vec![Stmt::matches(
                Expr::var("n"),
                vec![
                    Arm::new(Pattern::Literal(0), vec![Stmt::ret(Expr::call("Nil", vec![]))]),
                    Arm::new(
                        Pattern::Wildcard,
                        vec![Stmt::ret(Expr::call("gen_list", vec![Expr::var("n")]))],
                    ),
                ],
            )],
        ))
        .unwrap();

    let compiled = engine.specialize("maybe_gen", &[Value::Int(0)]).unwrap();
    assert_eq!(compiled.call_sites.len(), 1);
    assert!(!compiled.call_sites[0].is_bound());

    assert_eq!(engine.call("maybe_gen", &[Value::Int(0)]), Ok(list(&[])));
    assert_eq!(engine.stats().compilations, 1);
    assert!(!compiled.call_sites[0].is_bound());

    assert_eq!(engine.call("maybe_gen", &[Value::Int(2)]), Ok(list(&[2, 1])));
    assert_eq!(engine.stats().compilations, 2);
    assert!(compiled.call_sites[0].is_bound());
}

#[rstest]
fn test_long_call_chain_settles(engine: Engine) {
    const LENGTH: usize = 150;
    for i in 0..LENGTH {
        let body = if i + 1 == LENGTH {
            Stmt::ret(Expr::var("n"))
        } else {
            Stmt::ret(Expr::call(&format!("chain_{}", i + 1), vec![Expr::var("n")]))
        };
        engine
            .jit(FunctionDef::new(&format!("chain_{}", i), &["n"], vec![body]))
            .unwrap();
    }

    assert_eq!(engine.call("chain_0", &[Value::Int(5)]), Ok(Value::u24(5)));
    assert_eq!(engine.stats().compilations, LENGTH as u64);
}

#[rstest]
fn test_mutual_recursion_compiles_each_function_once(engine: Engine) {
    engine.call("is_even", &[Value::Int(50)]).unwrap();
    engine.call("is_even", &[Value::Int(51)]).unwrap();
    assert_eq!(engine.stats().compilations, 2);
}

#[rstest]
fn test_concurrent_first_calls_compile_once(engine: Engine) {
    let tree = node(leaf(1), node(leaf(2), leaf(3)));
    std::thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| assert_eq!(engine.call("sum_tree", &[tree.clone()]), Ok(Value::u24(6))));
        }
    });

    let stats = engine.stats();
    assert_eq!(stats.compilations, 2);
    assert_eq!(stats.executions, 8);
}

#[rstest]
fn test_incomplete_match_returns_sentinel(engine: Engine) {
    engine
        .jit(FunctionDef::new(
            "only_zero",
            &["n"],
            vec![Stmt::matches(
                Expr::var("n"),
                vec![Arm::new(Pattern::Literal(0), vec![Stmt::ret(Expr::lit(7))])],
            )],
        ))
        .unwrap();

    assert_eq!(engine.call("only_zero", &[Value::Int(0)]), Ok(Value::u24(7)));
    assert_eq!(engine.call("only_zero", &[Value::Int(1)]), Ok(Value::Incomplete));
    assert_eq!(engine.verify("only_zero", &[Value::Int(1)]), Ok(Value::Incomplete));
}

#[rstest]
fn test_sentinel_only_function(engine: Engine) {
    engine
        .jit(FunctionDef::new("nothing", &[], vec![Stmt::ret(Expr::Incomplete)]))
        .unwrap();
    assert_eq!(engine.call("nothing", &[]), Ok(Value::Incomplete));
}

#[rstest]
fn test_sentinel_field_is_a_type_mismatch(engine: Engine) {
    engine
        .jit(FunctionDef::new(
            "broken_leaf",
            &[],
            vec![Stmt::ret(Expr::call("Leaf", vec![Expr::Incomplete]))],
        ))
        .unwrap();
    assert!(matches!(
        engine.call("broken_leaf", &[]),
        Err(Error::Runtime(RuntimeError::TypeMismatch(_, _)))
    ));
}

#[rstest]
#[case::small_tree("sum_tree", vec![node(node(leaf(1), leaf(2)), leaf(3))])]
#[case::mirror("mirror", vec![node(leaf(4), node(leaf(5), leaf(6)))])]
#[case::gen_tree("gen_tree", vec![Value::Int(4), Value::Int(100)])]
#[case::list("sum_list", vec![list(&[1, 2, 3, 4, 5])])]
#[case::wide_host_int("gen_list", vec![Value::Int((1 << 24) + 2)])]
#[case::parity("is_even", vec![Value::Int(21)])]
#[case::comparison_switch("sum_nums", vec![Value::Int(1), Value::Int(1), Value::Int(9)])]
fn test_verify_agrees_with_interpreter(
    engine: Engine,
    #[case] name: &str,
    #[case] args: Vec<Value>,
) {
    assert_eq!(engine.verify(name, &args), engine.call(name, &args));
}

#[rstest]
fn test_host_and_native_call_sites(engine: Engine) {
    engine
        .define_native(NativeFunction::new("double", &["u24"], "u24", |args| match args {
            [Value::Uint(n)] => Ok(Value::Int(n.value() * 2)),
            _ => Err("expected one u24".to_string()),
        }))
        .unwrap();
    engine
        .define(FunctionDef::new(
            "bump",
            &["n"],
            vec![Stmt::ret(add(Expr::var("n"), Expr::lit(1)))],
        ))
        .unwrap();
    let bump_double = engine
        .jit(FunctionDef::new(
            "bump_double",
            &["n"],
            vec![Stmt::ret(Expr::call(
                "bump",
                vec![Expr::call("double", vec![Expr::var("n")])],
            ))],
        ))
        .unwrap();

    assert_eq!(bump_double.call(&[Value::Int(20)]), Ok(Value::u24(41)));
    assert_eq!(bump_double.call(&[Value::Int(1 << 23)]), Ok(Value::u24(1)));
    assert_eq!(bump_double.verify(&[Value::Int(20)]), Ok(Value::u24(41)));
}

/// `build(n)` returns `Nil()` when the loop never runs and a `Cons` otherwise.
fn build() -> FunctionDef {
    FunctionDef::new(
        "build",
        &["n"],
        vec![
            Stmt::bind("acc", Expr::call("Nil", vec![])),
            Stmt::While(
                Expr::var("n"),
                vec![
                    Stmt::bind("acc", Expr::call("Cons", vec![Expr::var("n"), Expr::var("acc")])),
                    Stmt::bind("n", Expr::binary(BinOp::Sub, Expr::var("n"), Expr::lit(1))),
                ],
            ),
            Stmt::ret(Expr::var("acc")),
        ],
    )
}

#[rstest]
#[case::loop_never_runs(0, 0)]
#[case::loop_runs(3, 6)]
fn test_host_loop_result_keeps_its_pre_loop_type(
    engine: Engine,
    #[case] n: u64,
    #[case] expected: u64,
) {
    engine.define(build()).unwrap();
    let total = engine
        .jit(FunctionDef::new(
            "total",
            &["n"],
            vec![Stmt::ret(Expr::call(
                "sum_list",
                vec![Expr::call("build", vec![Expr::var("n")])],
            ))],
        ))
        .unwrap();

    assert_eq!(total.call(&[Value::Int(n)]), Ok(Value::u24(expected)));
    assert_eq!(total.verify(&[Value::Int(n)]), Ok(Value::u24(expected)));
}

#[rstest]
fn test_native_failure_is_host_function_error(engine: Engine) {
    engine
        .define_native(NativeFunction::new("fail", &["u24"], "u24", |_| Err("boom".to_string())))
        .unwrap();
    engine
        .jit(FunctionDef::new(
            "calls_fail",
            &["n"],
            vec![Stmt::ret(Expr::call("fail", vec![Expr::var("n")]))],
        ))
        .unwrap();

    assert_eq!(
        engine.call("calls_fail", &[Value::Int(1)]),
        Err(RuntimeError::HostFunction("fail".into(), "boom".into()).into())
    );
}

#[rstest]
fn test_host_code_calls_back_into_compiled_code(engine: Engine) {
    engine
        .define(FunctionDef::new(
            "host_sum",
            &["tree"],
            vec![Stmt::ret(add(
                Expr::call("sum_tree", vec![Expr::var("tree")]),
                Expr::lit(1),
            ))],
        ))
        .unwrap();

    assert_eq!(engine.call("host_sum", &[node(leaf(1), leaf(2))]), Ok(Value::u24(4)));
    assert_eq!(engine.stats().executions, 1);
}

#[rstest]
fn test_compile_errors_are_cached(engine: Engine) {
    engine
        .jit(FunctionDef::new(
            "bad",
            &["n"],
            vec![Stmt::ret(add(Expr::var("n"), Expr::call("Leaf", vec![Expr::lit(1)])))],
        ))
        .unwrap();

    let first = engine.call("bad", &[Value::Int(1)]);
    assert!(matches!(first, Err(Error::Compile(CompileError::TypeError(_)))));
    assert_eq!(engine.call("bad", &[Value::Int(1)]), first);

    let stats = engine.stats();
    assert_eq!(stats.compilations, 1);
    assert_eq!(stats.executions, 0);
}

#[rstest]
fn test_while_loop_is_unsupported_when_decorated(engine: Engine) {
    let body = vec![
        Stmt::bind("acc", Expr::lit(0)),
        Stmt::While(
            Expr::var("n"),
            vec![
                Stmt::bind("acc", add(Expr::var("acc"), Expr::var("n"))),
                Stmt::bind("n", Expr::binary(BinOp::Sub, Expr::var("n"), Expr::lit(1))),
            ],
        ),
        Stmt::ret(Expr::var("acc")),
    ];
    engine.jit(FunctionDef::new("triangle", &["n"], body.clone())).unwrap();
    engine.define(FunctionDef::new("host_triangle", &["n"], body)).unwrap();

    assert!(matches!(
        engine.call("triangle", &[Value::Int(4)]),
        Err(Error::Compile(CompileError::UnsupportedConstruct(_, _)))
    ));
    assert_eq!(engine.call("host_triangle", &[Value::Int(4)]), Ok(Value::u24(10)));
}

#[rstest]
#[case::foreign_variant(vec![Arm::new(Pattern::ctor("Nil", &[]), vec![Stmt::ret(Expr::lit(0))])])]
#[case::mixed_patterns(vec![
    Arm::new(Pattern::ctor("Leaf", &["v"]), vec![Stmt::ret(Expr::var("v"))]),
    Arm::new(Pattern::Literal(0), vec![Stmt::ret(Expr::lit(0))]),
])]
#[case::partial_binders(vec![
    Arm::new(Pattern::ctor("Node", &["l"]), vec![Stmt::ret(Expr::lit(0))]),
])]
fn test_match_compilation_error(engine: Engine, #[case] arms: Vec<Arm<Vec<Stmt>>>) {
    engine
        .jit(FunctionDef::new("bad_match", &["tree"], vec![Stmt::matches(Expr::var("tree"), arms)]))
        .unwrap();
    assert!(matches!(
        engine.call("bad_match", &[leaf(1)]),
        Err(Error::Compile(CompileError::MatchCompilationError { .. }))
    ));
}

#[rstest]
fn test_division_by_zero_on_both_paths(engine: Engine) {
    let body = vec![Stmt::ret(Expr::binary(BinOp::Div, Expr::var("a"), Expr::var("b")))];
    engine.jit(FunctionDef::new("divide", &["a", "b"], body.clone())).unwrap();
    engine.define(FunctionDef::new("host_divide", &["a", "b"], body)).unwrap();

    let expected: BendaResult = Err(RuntimeError::DivisionByZero.into());
    assert_eq!(engine.call("divide", &[Value::Int(1), Value::Int(0)]), expected);
    assert_eq!(engine.call("host_divide", &[Value::Int(1), Value::Int(0)]), expected);
    assert_eq!(engine.call("divide", &[Value::Int(9), Value::Int(2)]), Ok(Value::u24(4)));
}

#[rstest]
fn test_encode_and_decode_through_engine(engine: Engine) {
    let tree_ty = engine.type_id("Tree").unwrap();
    let leaf_ty = engine.type_id("Leaf").unwrap();

    let packed = engine.encode(&leaf(5), leaf_ty).unwrap();
    assert_eq!(packed, CompiledValue::Packed(1 | (5 << 8)));

    let tree = node(leaf(1), leaf(2));
    let encoded = engine.encode(&tree, tree_ty).unwrap();
    assert_eq!(encoded.tag(), Some(0));
    assert_eq!(engine.decode(&encoded, tree_ty), Ok(tree));
    assert_eq!(engine.decode(&CompiledValue::Incomplete, tree_ty), Ok(Value::Incomplete));
}

#[rstest]
fn test_decorated_names_cannot_shadow_types(engine: Engine) {
    assert!(matches!(
        engine.jit(FunctionDef::new("Leaf", &["value"], vec![Stmt::ret(Expr::var("value"))])),
        Err(Error::Compile(CompileError::TypeError(_)))
    ));
}

#[test]
fn test_engine_from_toml_options() {
    let options = Options::from_toml_str(
        r#"
        default_scalar_bits = 32
        max_host_depth = 64
        "#,
    )
    .unwrap();
    let engine = Engine::new(options).unwrap();
    engine.declare_types(&programs::list_types()).unwrap();
    engine.jit(programs::gen_list()).unwrap();
    engine.jit(programs::sum_list()).unwrap();

    let list = engine.call("gen_list", &[Value::Int(3)]).unwrap();
    // List heads are declared u24, and literals now default to 32 bits.
    assert_eq!(engine.call("sum_list", &[list]), Ok(Value::Uint(benda_lang::Uint::new(32, 6))));
}

#[test]
fn test_host_recursion_limit() {
    let engine = Engine::new(Options {
        max_host_depth: 16,
        ..Options::default()
    })
    .unwrap();
    engine.declare_types(&programs::list_types()).unwrap();
    engine.define(programs::gen_list()).unwrap();

    assert_eq!(
        engine.call("gen_list", &[Value::Int(64)]),
        Err(RuntimeError::RecursionError(16).into())
    );
    assert_eq!(engine.call("gen_list", &[Value::Int(4)]), Ok(list(&[4, 3, 2, 1])));
}
