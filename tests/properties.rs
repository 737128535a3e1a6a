#[macro_use]
extern crate proptest;

use baton::ast::Composition;
use baton::compose;
use baton::flatten::{Program, flatten};
use baton::label::label;
use baton::lower::{TargetSet, lower};
use baton::names::parse_action_name;
use proptest::prelude::{Just, Strategy, prop};
use serde_json::{Value, json};

const PRIMITIVES: [&str; 11] = [
    "sequence",
    "if_nosave",
    "while_nosave",
    "dowhile_nosave",
    "try",
    "finally",
    "let",
    "mask",
    "action",
    "function",
    "composition",
];

// Generators shared by the compiler-pipeline properties

/// Short, always-valid action names across the qualification forms.
fn action_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z]{1,6}(/[a-z]{1,6})?|/[a-z]{1,6}/[a-z]{1,6}(/[a-z]{1,6})?")
        .unwrap()
}

fn leaf_strategy() -> impl Strategy<Value = Composition> {
    prop_oneof![
        Just(compose::empty()),
        action_name_strategy().prop_map(|name| compose::action(&name).unwrap()),
        prop::num::i64::ANY.prop_map(|value| compose::literal(value)),
        (0u64..50).prop_map(compose::sleep),
    ]
}

/// Random combinator trees: every constructor the lowerer has a rule for,
/// nested a few levels deep.
fn ast_strategy() -> impl Strategy<Value = Composition> {
    leaf_strategy().prop_recursive(4, 48, 3, |inner| {
        let components = prop::collection::vec(inner.clone(), 0..3);
        let one_or_two = prop::collection::vec(inner.clone(), 1..3);
        prop_oneof![
            components
                .clone()
                .prop_map(|c| compose::sequence(c).unwrap()),
            components.clone().prop_map(|c| compose::seq(c).unwrap()),
            (inner.clone(), inner.clone(), inner.clone())
                .prop_map(|(t, k, a)| compose::when(t, k, a).unwrap()),
            (inner.clone(), inner.clone(), 0usize..4).prop_map(|(a, b, pick)| {
                match pick {
                    0 => compose::loop_while(a, b).unwrap(),
                    1 => compose::do_loop(a, b).unwrap(),
                    2 => compose::attempt(a, b).unwrap(),
                    _ => compose::ensure(a, b).unwrap(),
                }
            }),
            components
                .clone()
                .prop_map(|c| compose::let_in(json!({ "x": 1 }), c).unwrap()),
            components.prop_map(|c| compose::mask(c).unwrap()),
            (one_or_two.clone(), 0usize..3).prop_map(|(c, pick)| match pick {
                0 => compose::retain(c).unwrap(),
                1 => compose::retain_catch(c).unwrap(),
                _ => compose::merge(c).unwrap(),
            }),
            (0u32..3, one_or_two.clone()).prop_map(|(n, c)| compose::repeat(n, c).unwrap()),
            (0u32..3, one_or_two).prop_map(|(n, c)| compose::retry(n, c).unwrap()),
        ]
    })
}

fn node_types(composition: &Composition) -> Vec<String> {
    fn collect(value: &Value, types: &mut Vec<String>) {
        match value {
            Value::Object(object) => {
                if let Some(Value::String(kind)) = object.get("type") {
                    types.push(kind.clone());
                }
                for (key, child) in object {
                    if key != "declarations" && key != "let" {
                        collect(child, types);
                    }
                }
            }
            Value::Array(items) => {
                for item in items {
                    collect(item, types);
                }
            }
            _ => {}
        }
    }
    let mut types = Vec::new();
    collect(&serde_json::to_value(composition).unwrap(), &mut types);
    types
}

fn wire(composition: &Composition) -> Value {
    serde_json::to_value(composition).unwrap()
}

proptest! {
    #[test]
    fn prop_lowering_reaches_the_primitive_set(ast in ast_strategy()) {
        let lowered = lower(ast, &TargetSet::primitives());
        for kind in node_types(&lowered) {
            prop_assert!(PRIMITIVES.contains(&kind.as_str()), "`{kind}` survived lowering");
        }
    }

    #[test]
    fn prop_lowering_is_idempotent(ast in ast_strategy()) {
        let once = lower(ast, &TargetSet::primitives());
        let twice = lower(once.clone(), &TargetSet::primitives());
        prop_assert_eq!(wire(&once), wire(&twice));
    }

    #[test]
    fn prop_labeling_is_idempotent(ast in ast_strategy()) {
        let once = label(ast);
        let twice = label(once.clone());
        prop_assert_eq!(wire(&once), wire(&twice));
    }

    #[test]
    fn prop_labels_are_distinct(ast in ast_strategy()) {
        fn collect_paths(value: &Value, paths: &mut Vec<String>) {
            if let Value::Object(object) = value {
                if object.contains_key("type") {
                    if let Some(Value::String(path)) = object.get("path") {
                        paths.push(path.clone());
                    }
                }
            }
            match value {
                Value::Object(object) => {
                    for (key, child) in object {
                        if key != "declarations" && key != "let" {
                            collect_paths(child, paths);
                        }
                    }
                }
                Value::Array(items) => {
                    for item in items {
                        collect_paths(item, paths);
                    }
                }
                _ => {}
            }
        }
        let labeled = label(ast);
        let mut paths = Vec::new();
        collect_paths(&wire(&labeled), &mut paths);
        let total = paths.len();
        paths.sort();
        paths.dedup();
        prop_assert_eq!(paths.len(), total, "duplicate paths in a single tree");
    }

    #[test]
    fn prop_flattened_offsets_are_in_range(ast in ast_strategy()) {
        // `flatten` validates every offset before returning.
        let lowered = lower(label(ast), &TargetSet::primitives());
        let program = flatten(&lowered).expect("lowered trees always flatten");
        prop_assert!(!program.is_empty());
        prop_assert!(program.validate().is_ok());
    }

    #[test]
    fn prop_programs_round_trip_through_serde(ast in ast_strategy()) {
        let lowered = lower(label(ast), &TargetSet::primitives());
        let program = flatten(&lowered).expect("lowered trees always flatten");
        let first = serde_json::to_value(&program).unwrap();
        let reparsed: Program = serde_json::from_value(first.clone()).unwrap();
        prop_assert_eq!(serde_json::to_value(&reparsed).unwrap(), first);
    }

    #[test]
    fn prop_name_parsing_is_idempotent(name in action_name_strategy()) {
        let once = parse_action_name(&name).expect("generated names are valid");
        let twice = parse_action_name(&once).expect("qualified names stay valid");
        prop_assert_eq!(once, twice);
    }
}
