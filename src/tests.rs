use std::collections::HashSet;

use hashbag::HashBag;

use crate::ast::{col, count, filter, join, lit, minus, on, project, scan, union};
use crate::ast::{Cmp, Dataflow, Operand, Pred};
use crate::codec::{export_schema, Codec, MockCodec, SqliteCodec};
use crate::collection::{Catalog, Lifetime};
use crate::engine::{Engine, Merge, RuleDecl, INGRESS_RULE};
use crate::error::Error;
use crate::eval::{compile, Derivation};
use crate::lineage::FactOp;
use crate::store::LineageStore;
use crate::value::{Schema, Tuple, Value, ValueKind};

fn int(n: i64) -> Value {
    Value::I64(n)
}

fn string(s: &str) -> Value {
    Value::Str(s.to_owned())
}

fn tuple(values: Vec<Value>) -> Tuple {
    Tuple::new(values)
}

fn add_collection(
    catalog: &mut Catalog,
    name: &str,
    columns: &[(&str, ValueKind)],
    rows: Vec<Vec<Value>>,
) {
    catalog
        .declare(name, Schema::of(columns).unwrap(), Lifetime::Table)
        .unwrap();
    let collection = catalog.get_mut(name).unwrap();
    for row in rows {
        collection.insert(Tuple::new(row));
    }
}

fn setup_catalog() -> Catalog {
    let mut catalog = Catalog::default();
    add_collection(
        &mut catalog,
        "foo",
        &[("a", ValueKind::I64), ("b", ValueKind::I64), ("c", ValueKind::Str)],
        vec![
            vec![int(1), int(2), string("first")],
            vec![int(1), int(3), string("second")],
            vec![int(2), int(4), string("third")],
            vec![int(2), int(5), string("fourth")],
        ],
    );
    add_collection(
        &mut catalog,
        "bar",
        &[("a", ValueKind::I64), ("y", ValueKind::I64), ("z", ValueKind::Str)],
        vec![
            vec![int(1), int(3), string("hello")],
            vec![int(1), int(5), string("world")],
            vec![int(3), int(-10), string("hi")],
            vec![int(2), int(5), string("bye")],
        ],
    );
    catalog
}

fn eval_derivations(flow: &Dataflow, catalog: &Catalog) -> Vec<Derivation> {
    let plan = compile(flow, catalog).unwrap();
    plan.stream(catalog)
        .collect::<crate::error::Result<Vec<_>>>()
        .unwrap()
}

fn eval_tuples(flow: &Dataflow, catalog: &Catalog) -> Vec<Tuple> {
    eval_derivations(flow, catalog)
        .into_iter()
        .map(|d| d.tuple)
        .collect()
}

fn assert_same_rows(actual: Vec<Tuple>, expected: Vec<Tuple>) {
    let actual: HashBag<Tuple> = actual.into_iter().collect();
    let expected: HashBag<Tuple> = expected.into_iter().collect();
    assert_eq!(actual, expected);
}

fn distinct(rows: Vec<Tuple>) -> HashSet<Tuple> {
    rows.into_iter().collect()
}

// ---------------------------------------------------------------------------
// Operator evaluation
// ---------------------------------------------------------------------------

#[test]
fn test_scan_all_rows() {
    let catalog = setup_catalog();
    let rows = eval_tuples(&scan("foo"), &catalog);
    assert_eq!(rows.len(), 4);
    assert!(rows.contains(&tuple(vec![int(1), int(2), string("first")])));
}

#[test]
fn test_filter_by_literal() {
    let catalog = setup_catalog();
    let flow = scan("foo") | filter(Pred::eq("b", Operand::lit(int(2))));
    assert_same_rows(
        eval_tuples(&flow, &catalog),
        vec![tuple(vec![int(1), int(2), string("first")])],
    );
}

#[test]
fn test_project_rename_and_literal() {
    let catalog = setup_catalog();
    let flow = scan("foo")
        | filter(Pred::eq("a", Operand::lit(int(1))))
        | project(vec![col("c"), col("a").named("x"), lit(int(7)).named("seven")]);
    let plan = compile(&flow, &catalog).unwrap();
    let names: Vec<&str> = plan
        .schema()
        .columns()
        .iter()
        .map(|c| c.name.as_str())
        .collect();
    assert_eq!(names, vec!["c", "x", "seven"]);
    assert_same_rows(
        eval_tuples(&flow, &catalog),
        vec![
            tuple(vec![string("first"), int(1), int(7)]),
            tuple(vec![string("second"), int(1), int(7)]),
        ],
    );
}

#[test]
fn test_join_two_collections() {
    let catalog = setup_catalog();
    let flow = scan("foo") | join(scan("bar"), on(&[("a", "a")]));
    let plan = compile(&flow, &catalog).unwrap();
    // Left columns then right columns; the colliding right-side key name is
    // suffixed.
    let names: Vec<&str> = plan
        .schema()
        .columns()
        .iter()
        .map(|c| c.name.as_str())
        .collect();
    assert_eq!(names, vec!["a", "b", "c", "a_2", "y", "z"]);
    assert_same_rows(
        eval_tuples(&flow, &catalog),
        vec![
            tuple(vec![int(1), int(2), string("first"), int(1), int(3), string("hello")]),
            tuple(vec![int(1), int(2), string("first"), int(1), int(5), string("world")]),
            tuple(vec![int(1), int(3), string("second"), int(1), int(3), string("hello")]),
            tuple(vec![int(1), int(3), string("second"), int(1), int(5), string("world")]),
            tuple(vec![int(2), int(4), string("third"), int(2), int(5), string("bye")]),
            tuple(vec![int(2), int(5), string("fourth"), int(2), int(5), string("bye")]),
        ],
    );
}

#[test]
fn test_join_then_filter_on_column_pair() {
    let catalog = setup_catalog();
    let flow = scan("foo")
        | join(scan("bar"), on(&[("a", "a")]))
        | filter(Pred::eq("b", Operand::col("y")));
    assert_same_rows(
        eval_tuples(&flow, &catalog),
        vec![
            tuple(vec![int(1), int(3), string("second"), int(1), int(3), string("hello")]),
            tuple(vec![int(2), int(5), string("fourth"), int(2), int(5), string("bye")]),
        ],
    );
}

#[test]
fn test_join_contributors_are_both_sides() {
    let catalog = setup_catalog();
    let flow = scan("foo") | join(scan("bar"), on(&[("a", "a")]));
    let derivations = eval_derivations(&flow, &catalog);
    let wanted = tuple(vec![int(2), int(4), string("third"), int(2), int(5), string("bye")]);
    let d = derivations.iter().find(|d| d.tuple == wanted).unwrap();
    let left = tuple(vec![int(2), int(4), string("third")]);
    let right = tuple(vec![int(2), int(5), string("bye")]);
    assert_eq!(d.inputs, vec![left.id(), right.id()]);
}

#[test]
fn test_union_distinct_values_with_per_branch_lineage() {
    let catalog = setup_catalog();
    let flow = (scan("foo") | project(vec![col("a")]))
        | union(scan("bar") | project(vec![col("a")]));
    let derivations = eval_derivations(&flow, &catalog);
    assert_eq!(
        distinct(derivations.iter().map(|d| d.tuple.clone()).collect()),
        distinct(vec![
            tuple(vec![int(1)]),
            tuple(vec![int(2)]),
            tuple(vec![int(3)]),
        ]),
    );
    // (1) is produced twice by each branch, from four different source
    // tuples; all four derivations survive with distinct inputs.
    let ones: Vec<&Derivation> = derivations
        .iter()
        .filter(|d| d.tuple == tuple(vec![int(1)]))
        .collect();
    assert_eq!(ones.len(), 4);
    let inputs: HashSet<_> = ones.iter().map(|d| d.inputs.clone()).collect();
    assert_eq!(inputs.len(), 4);
}

#[test]
fn test_difference() {
    let catalog = setup_catalog();
    let flow = (scan("foo") | project(vec![col("b")]))
        | minus(scan("bar") | project(vec![col("y")]));
    assert_same_rows(
        eval_tuples(&flow, &catalog),
        vec![tuple(vec![int(2)]), tuple(vec![int(4)])],
    );
}

#[test]
fn test_count_empty() {
    let mut catalog = Catalog::default();
    add_collection(&mut catalog, "xs", &[("x", ValueKind::I64)], vec![]);
    let flow = scan("xs") | count();
    assert_eq!(
        eval_tuples(&flow, &catalog),
        vec![tuple(vec![Value::U64(0)])],
    );
}

#[test]
fn test_count_three() {
    let mut catalog = Catalog::default();
    add_collection(
        &mut catalog,
        "xs",
        &[("x", ValueKind::I64)],
        vec![vec![int(1)], vec![int(2)], vec![int(3)]],
    );
    let explicit = Dataflow::Count {
        input: Box::new(Dataflow::Scan("xs".to_owned())),
    };
    let piped = scan("xs") | count();
    let expected = vec![tuple(vec![Value::U64(3)])];
    assert_eq!(eval_tuples(&explicit, &catalog), expected);
    assert_eq!(eval_tuples(&piped, &catalog), expected);
}

#[test]
fn test_count_contributors() {
    let mut catalog = Catalog::default();
    add_collection(
        &mut catalog,
        "xs",
        &[("x", ValueKind::I64)],
        vec![vec![int(1)], vec![int(2)], vec![int(3)]],
    );
    let derivations = eval_derivations(&(scan("xs") | count()), &catalog);
    assert_eq!(derivations.len(), 1);
    assert_eq!(
        derivations[0].inputs,
        vec![
            tuple(vec![int(1)]).id(),
            tuple(vec![int(2)]).id(),
            tuple(vec![int(3)]).id(),
        ],
    );
}

#[test]
fn test_pipe_equals_explicit_construction() {
    let catalog = setup_catalog();
    let piped = scan("foo")
        | filter(Pred::eq("a", Operand::lit(int(1))))
        | project(vec![col("b")]);
    let explicit = Dataflow::Project {
        input: Box::new(Dataflow::Filter {
            input: Box::new(Dataflow::Scan("foo".to_owned())),
            pred: Pred::eq("a", Operand::lit(int(1))),
        }),
        cols: vec![col("b")],
    };
    assert_same_rows(eval_tuples(&piped, &catalog), eval_tuples(&explicit, &catalog));
}

// ---------------------------------------------------------------------------
// Construction-time checks
// ---------------------------------------------------------------------------

#[test]
fn test_unknown_collection_fails_at_compile() {
    let catalog = setup_catalog();
    let err = compile(&scan("nope"), &catalog).unwrap_err();
    assert!(matches!(err, Error::Construction(_)));
}

#[test]
fn test_join_key_kind_mismatch_fails_at_compile() {
    let catalog = setup_catalog();
    let flow = scan("foo") | join(scan("bar"), on(&[("a", "z")]));
    let err = compile(&flow, &catalog).unwrap_err();
    assert!(matches!(err, Error::Construction(_)));
}

#[test]
fn test_ordered_comparison_on_bool_fails_at_compile() {
    let mut catalog = Catalog::default();
    add_collection(&mut catalog, "flags", &[("f", ValueKind::Bool)], vec![]);
    let flow = scan("flags")
        | filter(Pred::new("f", Cmp::Lt, Operand::lit(Value::Bool(true))));
    let err = compile(&flow, &catalog).unwrap_err();
    assert!(matches!(err, Error::Construction(_)));
}

#[test]
fn test_union_shape_mismatch_fails_at_compile() {
    let catalog = setup_catalog();
    let flow = (scan("foo") | project(vec![col("a")]))
        | union(scan("bar") | project(vec![col("z")]));
    let err = compile(&flow, &catalog).unwrap_err();
    assert!(matches!(err, Error::Construction(_)));
}

#[test]
fn test_schema_rejects_duplicates_and_nested_arrays() {
    assert!(Schema::of(&[("a", ValueKind::I64), ("a", ValueKind::I64)]).is_err());
    let nested = ValueKind::Array(
        Box::new(ValueKind::Array(Box::new(ValueKind::I64), 2)),
        2,
    );
    assert!(Schema::of(&[("a", nested)]).is_err());
}

#[test]
fn test_heterogeneous_array_rejected() {
    let err = Value::array(ValueKind::I64, vec![int(1), string("x")]).unwrap_err();
    assert!(matches!(err, Error::Construction(_)));
}

// ---------------------------------------------------------------------------
// Tuple identity
// ---------------------------------------------------------------------------

#[test]
fn test_tuple_identity_is_content_derived() {
    let a = tuple(vec![int(1), string("x")]);
    let b = tuple(vec![int(1), string("x")]);
    assert_eq!(a.id(), b.id());
    assert_ne!(a.id(), tuple(vec![int(2), string("x")]).id());
    // Array element order matters.
    let fwd = tuple(vec![Value::array(ValueKind::I64, vec![int(1), int(2)]).unwrap()]);
    let rev = tuple(vec![Value::array(ValueKind::I64, vec![int(2), int(1)]).unwrap()]);
    assert_ne!(fwd.id(), rev.id());
}

// ---------------------------------------------------------------------------
// Codecs
// ---------------------------------------------------------------------------

fn round_trip_values() -> Vec<Value> {
    vec![
        Value::Bool(true),
        Value::Bool(false),
        Value::Char('x'),
        Value::Str("plain".to_owned()),
        Value::Str("with, comma and \"quote\"".to_owned()),
        Value::I16(-12),
        Value::I32(123_456),
        Value::I64(-9_876_543_210),
        Value::U32(4_000_000_000),
        Value::U64(u64::MAX),
        Value::F32(1.5),
        Value::F64(-2.25),
        Value::array(ValueKind::I32, vec![Value::I32(3), Value::I32(1), Value::I32(2)])
            .unwrap(),
        Value::array(
            ValueKind::Str,
            vec![
                Value::Str("a, b".to_owned()),
                Value::Str("c\\\"d".to_owned()),
            ],
        )
        .unwrap(),
        Value::array(ValueKind::F64, vec![]).unwrap(),
    ]
}

#[test]
fn test_sqlite_codec_round_trip() {
    for value in round_trip_values() {
        let stored = SqliteCodec::encode(&value);
        let back = SqliteCodec::decode(&value.kind(), &stored).unwrap();
        assert_eq!(back, value, "via {:?}", stored);
    }
}

#[test]
fn test_mock_codec_round_trip() {
    for value in round_trip_values() {
        let stored = MockCodec::encode(&value);
        let back = MockCodec::decode(&value.kind(), &stored).unwrap();
        assert_eq!(back, value, "via {:?}", stored);
    }
}

#[test]
fn test_array_serialization_preserves_order() {
    let value =
        Value::array(ValueKind::I32, vec![Value::I32(3), Value::I32(1), Value::I32(2)])
            .unwrap();
    assert_eq!(
        MockCodec::encode(&value),
        crate::codec::StorageValue::Text("[3, 1, 2]".to_owned()),
    );
}

#[test]
fn test_mock_schema_export() {
    let schema = Schema::of(&[
        ("a", ValueKind::I64),
        ("name", ValueKind::Str),
        ("tags", ValueKind::Array(Box::new(ValueKind::Str), 2)),
    ])
    .unwrap();
    let columns: Vec<(String, String)> = export_schema::<MockCodec>(&schema)
        .into_iter()
        .map(|(name, ty)| (name, ty.0))
        .collect();
    assert_eq!(
        columns,
        vec![
            ("a".to_owned(), "i64".to_owned()),
            ("name".to_owned(), "string".to_owned()),
            ("tags".to_owned(), "array<string, 2>".to_owned()),
        ],
    );
    assert_eq!(
        LineageStore::<MockCodec>::table_sql("t", &schema),
        "CREATE TABLE \"t\" (hash TEXT NOT NULL, time_inserted INTEGER NOT NULL, \
         time_deleted INTEGER, \"a\" i64, \"name\" string, \"tags\" array<string, 2>)",
    );
}

#[test]
fn test_sqlite_schema_export() {
    let schema = Schema::of(&[
        ("n", ValueKind::U64),
        ("ratio", ValueKind::F64),
        ("label", ValueKind::Str),
    ])
    .unwrap();
    let types: Vec<String> = export_schema::<SqliteCodec>(&schema)
        .into_iter()
        .map(|(_, ty)| ty.0)
        .collect();
    assert_eq!(types, vec!["INTEGER", "REAL", "TEXT"]);
}

// ---------------------------------------------------------------------------
// Engine: ticks, lifetimes, lineage
// ---------------------------------------------------------------------------

fn engine() -> Engine<SqliteCodec> {
    Engine::new(LineageStore::open_in_memory().unwrap())
}

/// Channel `seed` feeding table `t` through rule `load`.
fn seeded_engine() -> Engine<SqliteCodec> {
    let mut e = engine();
    e.declare("seed", Schema::of(&[("x", ValueKind::I64)]).unwrap(), Lifetime::Channel)
        .unwrap();
    e.declare("t", Schema::of(&[("x", ValueKind::I64)]).unwrap(), Lifetime::Table)
        .unwrap();
    e.register(|_| {
        vec![RuleDecl {
            id: "load".to_owned(),
            target: "t".to_owned(),
            merge: Merge::Insert,
            flow: scan("seed"),
        }]
    })
    .unwrap();
    e
}

#[test]
fn test_table_accumulates_channel_clears() {
    let mut e = seeded_engine();
    e.push("seed", tuple(vec![int(1)])).unwrap();
    // The inbox handle feeds the same mailbox.
    e.inbox().send("seed", tuple(vec![int(2)])).unwrap();
    let report = e.advance_tick().unwrap();
    assert!(report.ok());
    assert_eq!(report.deltas["t"].inserted.len(), 2);
    assert_eq!(e.catalog().get("t").unwrap().len(), 2);
    assert!(e.catalog().get("seed").unwrap().is_empty());

    e.push("seed", tuple(vec![int(3)])).unwrap();
    let report = e.advance_tick().unwrap();
    assert_eq!(report.deltas["t"].inserted, vec![tuple(vec![int(3)])]);
    let t = e.catalog().get("t").unwrap();
    assert_eq!(t.len(), 3);
    assert!(t.contains(&tuple(vec![int(1)])));

    // Replay from history: the channel's tick-1 rows lived exactly one
    // tick, the table accumulates.
    let schema = Schema::of(&[("x", ValueKind::I64)]).unwrap();
    let store = e.store();
    assert_eq!(store.contents_at("seed", &schema, 1).unwrap(), Vec::<Tuple>::new());
    assert_same_rows(
        store.contents_at("t", &schema, 1).unwrap(),
        vec![tuple(vec![int(1)]), tuple(vec![int(2)])],
    );
    assert_eq!(store.contents_at("t", &schema, 2).unwrap().len(), 3);
}

#[test]
fn test_set_semantics_in_collections() {
    let mut e = seeded_engine();
    e.push("seed", tuple(vec![int(1)])).unwrap();
    e.push("seed", tuple(vec![int(1)])).unwrap();
    let report = e.advance_tick().unwrap();
    assert_eq!(report.deltas["seed"].inserted.len(), 1);
    assert_eq!(e.catalog().get("t").unwrap().len(), 1);

    // Re-deriving the same tuple next tick changes nothing.
    e.push("seed", tuple(vec![int(1)])).unwrap();
    let report = e.advance_tick().unwrap();
    assert!(report.deltas.get("t").map_or(true, |d| d.inserted.is_empty()));
    assert_eq!(e.catalog().get("t").unwrap().len(), 1);
}

#[test]
fn test_delete_then_reinsert_wins() {
    let mut e = seeded_engine();
    e.register(|_| {
        vec![
            RuleDecl {
                id: "drop".to_owned(),
                target: "t".to_owned(),
                merge: Merge::Delete,
                flow: scan("t") | filter(Pred::eq("x", Operand::lit(int(1)))),
            },
            RuleDecl {
                id: "keep".to_owned(),
                target: "t".to_owned(),
                merge: Merge::Insert,
                flow: scan("t") | filter(Pred::eq("x", Operand::lit(int(1)))),
            },
        ]
    })
    .unwrap();

    e.push("seed", tuple(vec![int(1)])).unwrap();
    e.advance_tick().unwrap();
    assert!(e.catalog().get("t").unwrap().contains(&tuple(vec![int(1)])));

    // Tick 2: "drop" deletes (1), "keep" re-derives it. Deletes apply
    // before inserts, so the tuple survives the tick.
    let report = e.advance_tick().unwrap();
    assert!(report.ok());
    assert_eq!(report.deltas["t"].deleted, vec![tuple(vec![int(1)])]);
    assert_eq!(report.deltas["t"].inserted, vec![tuple(vec![int(1)])]);
    assert!(e.catalog().get("t").unwrap().contains(&tuple(vec![int(1)])));

    // History keeps both the closed and the live row version.
    let schema = Schema::of(&[("x", ValueKind::I64)]).unwrap();
    assert_eq!(e.store().contents_at("t", &schema, 2).unwrap(), vec![tuple(vec![int(1)])]);

    let id = tuple(vec![int(1)]).id();
    let tick2: Vec<FactOp> = e
        .store()
        .facts_for(id)
        .unwrap()
        .into_iter()
        .filter(|f| f.tick == 2)
        .map(|f| f.op)
        .collect();
    assert_eq!(tick2, vec![FactOp::Delete, FactOp::Insert]);
}

#[test]
fn test_union_branches_record_separate_facts() {
    let mut e = engine();
    e.declare(
        "ch1",
        Schema::of(&[("x", ValueKind::I64), ("b", ValueKind::I64)]).unwrap(),
        Lifetime::Channel,
    )
    .unwrap();
    e.declare(
        "ch2",
        Schema::of(&[("x", ValueKind::I64), ("c", ValueKind::I64)]).unwrap(),
        Lifetime::Channel,
    )
    .unwrap();
    e.declare("merged", Schema::of(&[("x", ValueKind::I64)]).unwrap(), Lifetime::Table)
        .unwrap();
    e.register(|_| {
        vec![RuleDecl {
            id: "merge".to_owned(),
            target: "merged".to_owned(),
            merge: Merge::Insert,
            flow: (scan("ch1") | project(vec![col("x")]))
                | union(scan("ch2") | project(vec![col("x")])),
        }]
    })
    .unwrap();

    e.push("ch1", tuple(vec![int(1), int(10)])).unwrap();
    e.push("ch2", tuple(vec![int(1), int(20)])).unwrap();
    e.advance_tick().unwrap();

    // One tuple in the collection, but both contributing branches left a
    // fact, sharing the derived id and differing in inputs.
    assert_eq!(e.catalog().get("merged").unwrap().len(), 1);
    let derived = tuple(vec![int(1)]).id();
    let facts: Vec<_> = e
        .store()
        .facts_for(derived)
        .unwrap()
        .into_iter()
        .filter(|f| f.rule_id == "merge")
        .collect();
    assert_eq!(facts.len(), 2);
    assert_eq!(
        distinct_inputs(&facts),
        HashSet::from([
            vec![tuple(vec![int(1), int(10)]).id()],
            vec![tuple(vec![int(1), int(20)]).id()],
        ]),
    );
}

fn distinct_inputs(facts: &[crate::lineage::LineageFact]) -> HashSet<Vec<crate::value::TupleId>> {
    facts.iter().map(|f| f.inputs.clone()).collect()
}

#[test]
fn test_provenance_walks_back_to_ingress() {
    let mut e = engine();
    e.declare("seed", Schema::of(&[("x", ValueKind::I64)]).unwrap(), Lifetime::Channel)
        .unwrap();
    e.declare(
        "events",
        Schema::of(&[("x", ValueKind::I64), ("tag", ValueKind::Str)]).unwrap(),
        Lifetime::Table,
    )
    .unwrap();
    e.declare("total", Schema::of(&[("n", ValueKind::U64)]).unwrap(), Lifetime::Table)
        .unwrap();
    e.register(|_| {
        vec![
            RuleDecl {
                id: "load".to_owned(),
                target: "events".to_owned(),
                merge: Merge::Insert,
                flow: scan("seed")
                    | project(vec![col("x"), lit(string("evt")).named("tag")]),
            },
            RuleDecl {
                id: "totals".to_owned(),
                target: "total".to_owned(),
                merge: Merge::Insert,
                flow: scan("events") | count(),
            },
        ]
    })
    .unwrap();

    for n in [1, 2, 3] {
        e.push("seed", tuple(vec![int(n)])).unwrap();
    }
    // Tick 1: events is empty while "totals" runs, so the count of nothing
    // lands as 0. Tick 2 counts the three loaded events.
    e.advance_tick().unwrap();
    e.advance_tick().unwrap();
    let total = e.catalog().get("total").unwrap();
    assert!(total.contains(&tuple(vec![Value::U64(0)])));
    assert!(total.contains(&tuple(vec![Value::U64(3)])));

    let three = tuple(vec![Value::U64(3)]).id();
    let prov = e.store().provenance(three, 4).unwrap();
    assert_eq!(prov.derivations.len(), 1);
    let step = &prov.derivations[0];
    assert_eq!(step.fact.rule_id, "totals");
    assert_eq!(step.inputs.len(), 3);
    for event in &step.inputs {
        assert_eq!(event.derivations.len(), 1);
        let load = &event.derivations[0];
        assert_eq!(load.fact.rule_id, "load");
        assert_eq!(load.inputs.len(), 1);
        let base = &load.inputs[0];
        assert_eq!(base.derivations.len(), 1);
        assert_eq!(base.derivations[0].fact.rule_id, INGRESS_RULE);
        assert!(base.derivations[0].fact.inputs.is_empty());
    }

    // The depth bound cuts the walk.
    let shallow = e.store().provenance(three, 1).unwrap();
    assert!(shallow.derivations[0].inputs.iter().all(|p| p.derivations.is_empty()));
}

#[test]
fn test_evaluation_error_aborts_tick() {
    let mut e = engine();
    e.declare("m", Schema::of(&[("x", ValueKind::F64)]).unwrap(), Lifetime::Channel)
        .unwrap();
    e.declare("out", Schema::of(&[("x", ValueKind::F64)]).unwrap(), Lifetime::Table)
        .unwrap();
    e.register(|_| {
        vec![RuleDecl {
            id: "bad".to_owned(),
            target: "out".to_owned(),
            merge: Merge::Insert,
            flow: scan("m") | filter(Pred::lt("x", Operand::lit(Value::F64(f64::NAN)))),
        }]
    })
    .unwrap();

    e.push("m", tuple(vec![Value::F64(1.0)])).unwrap();
    let report = e.advance_tick().unwrap();
    assert_eq!(report.errors.len(), 1);
    assert!(matches!(report.errors[0], Error::Evaluation(_)));
    // Nothing from the aborted tick was applied or persisted.
    assert!(e.catalog().get("out").unwrap().is_empty());
    assert!(e.catalog().get("m").unwrap().is_empty());
    assert!(e.store().facts_between(1, 1).unwrap().is_empty());

    // The next tick runs normally.
    let report = e.advance_tick().unwrap();
    assert!(report.ok());
}

#[test]
fn test_registration_errors() {
    let mut e = seeded_engine();
    // Unknown target collection.
    let err = e
        .register(|_| {
            vec![RuleDecl {
                id: "r1".to_owned(),
                target: "nope".to_owned(),
                merge: Merge::Insert,
                flow: scan("seed"),
            }]
        })
        .unwrap_err();
    assert!(matches!(err, Error::Construction(_)));

    // Rule output shape must match the target schema.
    let err = e
        .register(|_| {
            vec![RuleDecl {
                id: "r2".to_owned(),
                target: "t".to_owned(),
                merge: Merge::Insert,
                flow: scan("seed") | count(),
            }]
        })
        .unwrap_err();
    assert!(matches!(err, Error::Construction(_)));

    // Duplicate rule id.
    let err = e
        .register(|_| {
            vec![RuleDecl {
                id: "load".to_owned(),
                target: "t".to_owned(),
                merge: Merge::Insert,
                flow: scan("seed"),
            }]
        })
        .unwrap_err();
    assert!(matches!(err, Error::Construction(_)));

    // The ingress rule id is reserved for mailbox arrivals.
    let err = e
        .register(|_| {
            vec![RuleDecl {
                id: INGRESS_RULE.to_owned(),
                target: "t".to_owned(),
                merge: Merge::Insert,
                flow: scan("seed"),
            }]
        })
        .unwrap_err();
    assert!(matches!(err, Error::Construction(_)));

    // A failed registration leaves no partial rules behind.
    e.push("seed", tuple(vec![int(1)])).unwrap();
    let report = e.advance_tick().unwrap();
    assert!(report.ok());
    assert_eq!(e.catalog().get("t").unwrap().len(), 1);
}

#[test]
fn test_bad_inbox_envelope_aborts_tick() {
    let mut e = seeded_engine();
    // Inbox sends are validated at drain time; a mismatched arrival aborts
    // the tick that would have consumed it.
    e.inbox().send("seed", tuple(vec![string("wrong")])).unwrap();
    let report = e.advance_tick().unwrap();
    assert_eq!(report.errors.len(), 1);
    assert!(matches!(report.errors[0], Error::Evaluation(_)));
    assert!(e.store().facts_between(1, 1).unwrap().is_empty());
}

#[test]
fn test_push_rejects_bad_input() {
    let e = seeded_engine();
    // Tables are not mailbox targets.
    assert!(matches!(
        e.push("t", tuple(vec![int(1)])).unwrap_err(),
        Error::Evaluation(_)
    ));
    // Schema mismatch.
    assert!(matches!(
        e.push("seed", tuple(vec![string("no")])).unwrap_err(),
        Error::Evaluation(_)
    ));
    assert!(matches!(
        e.push("ghost", tuple(vec![int(1)])).unwrap_err(),
        Error::Evaluation(_)
    ));
}

#[test]
fn test_scratch_is_never_persisted() {
    let mut e = seeded_engine();
    e.declare("tmp", Schema::of(&[("x", ValueKind::I64)]).unwrap(), Lifetime::Scratch)
        .unwrap();
    e.register(|_| {
        vec![RuleDecl {
            id: "stash".to_owned(),
            target: "tmp".to_owned(),
            merge: Merge::Insert,
            flow: scan("seed"),
        }]
    })
    .unwrap();
    e.push("seed", tuple(vec![int(1)])).unwrap();
    e.advance_tick().unwrap();
    // Cleared at tick end, and no history table exists for it.
    assert!(e.catalog().get("tmp").unwrap().is_empty());
    let schema = Schema::of(&[("x", ValueKind::I64)]).unwrap();
    assert!(e.store().contents_at("tmp", &schema, 1).is_err());
}

#[test]
fn test_ingress_facts_are_base_facts() {
    let mut e = seeded_engine();
    e.push("seed", tuple(vec![int(7)])).unwrap();
    e.advance_tick().unwrap();
    let facts = e.store().facts_for(tuple(vec![int(7)]).id()).unwrap();
    let ingress: Vec<_> = facts.iter().filter(|f| f.rule_id == INGRESS_RULE).collect();
    assert_eq!(ingress.len(), 1);
    assert_eq!(ingress[0].collection, "seed");
    assert_eq!(ingress[0].op, FactOp::Insert);
    assert!(ingress[0].inputs.is_empty());
}

#[test]
fn test_facts_between_selects_tick_range() {
    let mut e = seeded_engine();
    e.push("seed", tuple(vec![int(1)])).unwrap();
    e.advance_tick().unwrap();
    e.push("seed", tuple(vec![int(2)])).unwrap();
    e.advance_tick().unwrap();
    let first = e.store().facts_between(1, 1).unwrap();
    assert!(!first.is_empty());
    assert!(first.iter().all(|f| f.tick == 1));
    let all = e.store().facts_between(1, 2).unwrap();
    assert!(all.len() > first.len());
}

#[test]
fn test_identical_runs_produce_identical_lineage() {
    let run = || {
        let mut e = seeded_engine();
        e.register(|_| {
            vec![RuleDecl {
                id: "evens".to_owned(),
                target: "t".to_owned(),
                merge: Merge::Delete,
                flow: scan("t") | filter(Pred::eq("x", Operand::lit(int(2)))),
            }]
        })
        .unwrap();
        for n in [3, 1, 2] {
            e.push("seed", tuple(vec![int(n)])).unwrap();
        }
        e.advance_tick().unwrap();
        e.push("seed", tuple(vec![int(2)])).unwrap();
        e.advance_tick().unwrap();
        e.store().facts_between(1, 2).unwrap()
    };
    assert_eq!(run(), run());
}
