mod common;

use common::*;

use baton::client::{self, ActionClient, LocalActionClient, RunConfig};
use baton::compose::{self, Task};
use baton::conductor::{Conductor, ConductorError, Turn};
use baton::encode;
use baton::flatten::Program;
use baton::functions::FunctionRegistry;
use baton::lower::TargetSet;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Run a composition that never suspends.
fn run_inline(flow: &baton::ast::Composition, params: Value) -> Turn {
    Conductor::compile(flow)
        .expect("composition should compile")
        .invoke(params)
        .expect("activation should not fail")
}

// ============================================================================
// End-to-end scenarios
// ============================================================================

#[tokio::test]
async fn test_sequence_of_actions() {
    let client = arithmetic_client();
    let flow = compose::sequence(["TripleAndIncrement", "DivideByTwo", "DivideByTwo"]).unwrap();
    let result = run_flow(&client, &flow, json!({ "n": 5 })).await;
    assert_eq!(result, json!({ "n": 4 }));
}

#[tokio::test]
async fn test_branching_restores_pretest_params() {
    let client = arithmetic_client();
    let flow = compose::when("isEven", "DivideByTwo", "TripleAndIncrement").unwrap();
    // 3 is odd, so the alternate runs on the params from before the test.
    let result = run_flow(&client, &flow, json!({ "n": 3 })).await;
    assert_eq!(result, json!({ "n": 10 }));

    let result = run_flow(&client, &flow, json!({ "n": 4 })).await;
    assert_eq!(result, json!({ "n": 2 }));
}

#[tokio::test]
async fn test_loop_until_one() {
    let client = arithmetic_client();
    let flow = compose::loop_while(
        "isNotOne",
        Task::func(|_env, args| {
            let n = args["n"].as_i64().unwrap_or(0);
            Ok(Some(json!({ "n": n - 1 })))
        }),
    )
    .unwrap();
    let result = run_flow(&client, &flow, json!({ "n": 4 })).await;
    assert_eq!(result, json!({ "n": 1 }));
}

#[test]
fn test_mask_hides_the_nearest_let() {
    let read_x = Task::func(|env, _args| Ok(Some(env["x"].clone())));
    let flow = compose::let_in(
        json!({ "x": 42 }),
        [compose::let_in(json!({ "x": 69 }), [compose::mask([read_x]).unwrap()]).unwrap()],
    )
    .unwrap();
    match run_inline(&flow, json!({})) {
        Turn::Complete { params } => assert_eq!(params, json!({ "value": 42 })),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn test_mask_cancels_exactly_one_frame() {
    let read_x = Task::func(|env, _args| Ok(Some(env["x"].clone())));
    let flow = compose::let_in(
        json!({ "x": 1 }),
        [compose::let_in(
            json!({ "x": 2 }),
            [compose::let_in(json!({ "x": 3 }), [compose::mask([read_x]).unwrap()]).unwrap()],
        )
        .unwrap()],
    )
    .unwrap();
    match run_inline(&flow, json!({})) {
        Turn::Complete { params } => assert_eq!(params, json!({ "value": 2 })),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn test_try_routes_errors_to_the_handler() {
    let flow = compose::attempt(
        Task::func(|_env, _args| Ok(Some(json!({ "error": "foo" })))),
        Task::func(|_env, args| Ok(Some(json!({ "message": args["error"] })))),
    )
    .unwrap();
    match run_inline(&flow, json!({})) {
        Turn::Complete { params } => assert_eq!(params, json!({ "message": "foo" })),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn test_retain_pairs_input_with_output() {
    let client = arithmetic_client();
    let flow = compose::retain(["TripleAndIncrement"]).unwrap();
    let result = run_flow(&client, &flow, json!({ "n": 3 })).await;
    assert_eq!(result, json!({ "params": { "n": 3 }, "result": { "n": 10 } }));
}

// ============================================================================
// Derived combinators at runtime
// ============================================================================

#[tokio::test]
async fn test_repeat_zero_skips_the_body() {
    let client = LocalActionClient::new();
    let calls = register_counting(&client, "Echo");
    let flow = compose::repeat(0, ["Echo"]).unwrap();
    let result = run_flow(&client, &flow, json!({ "n": 7 })).await;
    assert_eq!(result, json!({ "n": 7 }));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_repeat_runs_the_body_count_times() {
    let client = LocalActionClient::new();
    let calls = register_counting(&client, "Echo");
    let flow = compose::repeat(3, ["Echo"]).unwrap();
    let result = run_flow(&client, &flow, json!({ "n": 7 })).await;
    assert_eq!(result, json!({ "n": 7 }));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retry_exhaustion_yields_the_last_error() {
    let client = LocalActionClient::new();
    let calls = register_failing(&client, "Flaky", "boom");
    let flow = compose::retry(2, ["Flaky"]).unwrap();
    let result = run_flow(&client, &flow, json!({ "n": 1 })).await;
    assert_eq!(result, json!({ "error": "boom" }));
    // count + 1 attempts in total
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_retry_recovers_and_reruns_on_the_original_params() {
    let client = LocalActionClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    client
        .register("Eventually", move |params| {
            let attempt = seen.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt < 3 {
                json!({ "error": "not yet" })
            } else {
                // Every attempt must see the original input.
                json!({ "n": params["n"].as_i64().unwrap_or(0) * 10 })
            }
        })
        .unwrap();
    let flow = compose::retry(5, ["Eventually"]).unwrap();
    let result = run_flow(&client, &flow, json!({ "n": 4 })).await;
    assert_eq!(result, json!({ "n": 40 }));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_sleep_preserves_params() {
    let client = LocalActionClient::new();
    let flow = compose::sequence([Task::from(compose::sleep(5))]).unwrap();
    let result = run_flow(&client, &flow, json!({ "n": 9 })).await;
    assert_eq!(result, json!({ "n": 9 }));
}

#[tokio::test]
async fn test_merge_overlays_the_result_onto_the_params() {
    let client = LocalActionClient::new();
    client
        .register("Enrich", |_params| json!({ "b": 2, "a": 0 }))
        .unwrap();
    let flow = compose::merge(["Enrich"]).unwrap();
    let result = run_flow(&client, &flow, json!({ "a": 1, "keep": true })).await;
    assert_eq!(result, json!({ "a": 0, "b": 2, "keep": true }));
}

#[test]
fn test_literal_replaces_params() {
    match run_inline(&compose::literal(true), json!({ "n": 1 })) {
        Turn::Complete { params } => assert_eq!(params, json!({ "value": true })),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn test_empty_sequence_passes_params_through() {
    let flow = compose::sequence(Vec::<Task>::new()).unwrap();
    match run_inline(&flow, json!({ "n": 1 })) {
        Turn::Complete { params } => assert_eq!(params, json!({ "n": 1 })),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

// ============================================================================
// Error propagation
// ============================================================================

#[test]
fn test_uncaught_errors_terminate_with_only_the_error_field() {
    let flow = compose::sequence([Task::func(|_env, _args| {
        Ok(Some(json!({ "error": "foo", "extra": "dropped" })))
    })])
    .unwrap();
    match run_inline(&flow, json!({})) {
        Turn::Failed { params } => assert_eq!(params, json!({ "error": "foo" })),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn test_finalizer_runs_on_error_and_the_error_reraises() {
    let ran = Arc::new(AtomicUsize::new(0));
    let seen = ran.clone();
    let flow = compose::attempt(
        compose::ensure(
            Task::func(|_env, _args| Ok(Some(json!({ "error": "inner" })))),
            Task::func(move |_env, args| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(Some(args.clone()))
            }),
        )
        .unwrap(),
        Task::func(|_env, args| Ok(Some(json!({ "caught": args["error"] })))),
    )
    .unwrap();
    match run_inline(&flow, json!({})) {
        Turn::Complete { params } => assert_eq!(params, json!({ "caught": "inner" })),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn test_inline_function_failures_become_state_errors() {
    let flow = compose::sequence([Task::func(|_env, _args| {
        Err(baton::functions::InlineError::msg("deliberate failure"))
    })])
    .unwrap();
    match run_inline(&flow, json!({})) {
        Turn::Failed { params } => {
            let message = params["error"].as_str().unwrap();
            assert!(
                message.starts_with("An exception was caught at state"),
                "unexpected message: {message}"
            );
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

// ============================================================================
// Scoping
// ============================================================================

#[test]
fn test_env_mutations_write_back_to_the_declaring_frame() {
    let flow = compose::let_in(
        json!({ "x": 1 }),
        [
            Task::func(|env, _args| {
                env.insert("x".to_owned(), json!(5));
                Ok(None)
            }),
            Task::func(|env, _args| Ok(Some(env["x"].clone()))),
        ],
    )
    .unwrap();
    match run_inline(&flow, json!({})) {
        Turn::Complete { params } => assert_eq!(params, json!({ "value": 5 })),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn test_inner_frames_shadow_outer_frames() {
    let flow = compose::let_in(
        json!({ "x": "outer", "y": "outer" }),
        [compose::let_in(
            json!({ "x": "inner" }),
            [Task::func(|env, _args| {
                Ok(Some(json!({ "x": env["x"], "y": env["y"] })))
            })],
        )
        .unwrap()],
    )
    .unwrap();
    match run_inline(&flow, json!({})) {
        Turn::Complete { params } => {
            assert_eq!(params, json!({ "x": "inner", "y": "outer" }));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

// ============================================================================
// Choice truthiness
// ============================================================================

#[test]
fn test_choice_truthiness_table() {
    let falsy = [json!(null), json!(false), json!(0), json!(""), json!([]), json!({})];
    let truthy = [json!(true), json!(1), json!(-1), json!("x"), json!([0]), json!({ "k": 0 })];

    let branch_on = |value: Value| {
        let flow = compose::when_nosave(
            Task::func(move |_env, _args| Ok(Some(json!({ "value": value.clone() })))),
            Task::func(|_env, _args| Ok(Some(json!({ "branch": "then" })))),
            Task::func(|_env, _args| Ok(Some(json!({ "branch": "else" })))),
        )
        .unwrap();
        match run_inline(&flow, json!({})) {
            Turn::Complete { params } => params["branch"].as_str().unwrap().to_owned(),
            other => panic!("unexpected outcome: {other:?}"),
        }
    };

    for value in falsy {
        assert_eq!(branch_on(value.clone()), "else", "value {value}");
    }
    for value in truthy {
        assert_eq!(branch_on(value.clone()), "then", "value {value}");
    }
}

// ============================================================================
// Suspension & resume protocol
// ============================================================================

#[test]
fn test_suspension_carries_a_resume_envelope() {
    let flow = compose::sequence(["TripleAndIncrement"]).unwrap();
    let conductor = Conductor::compile(&flow).unwrap();
    let turn = conductor.invoke(json!({ "n": 1 })).unwrap();
    let Turn::Suspend {
        action,
        params,
        resume,
    } = turn
    else {
        panic!("expected suspension");
    };
    assert_eq!(action, "/_/TripleAndIncrement");
    assert_eq!(params, json!({ "n": 1 }));
    // The action was the program's last instruction, so the continuation
    // resumes straight into the terminal transition.
    assert_eq!(serde_json::to_value(&resume).unwrap(), json!({ "state": null, "stack": [] }));

    // Feeding the action result back completes the run.
    match conductor.invoke(resume.attach(json!({ "n": 4 }))).unwrap() {
        Turn::Complete { params } => assert_eq!(params, json!({ "n": 4 })),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn test_action_errors_route_through_handlers_on_resume() {
    let flow = compose::attempt(
        compose::sequence(["Broken", "NeverRuns"]).unwrap(),
        Task::func(|_env, args| Ok(Some(json!({ "handled": args["error"] })))),
    )
    .unwrap();
    let conductor = Conductor::compile(&flow).unwrap();
    let Turn::Suspend { action, resume, .. } = conductor.invoke(json!({})).unwrap() else {
        panic!("expected suspension");
    };
    assert_eq!(action, "/_/Broken");
    match conductor
        .invoke(resume.attach(json!({ "error": "exploded" })))
        .unwrap()
    {
        Turn::Complete { params } => assert_eq!(params, json!({ "handled": "exploded" })),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn test_malformed_resume_envelopes_are_bad_requests() {
    let conductor = Conductor::compile(&compose::literal(1)).unwrap();

    for payload in [
        json!({ "$resume": 5 }),
        json!({ "$resume": { "state": "x", "stack": [] } }),
        json!({ "$resume": { "state": 0, "stack": 5 } }),
        json!({ "$resume": { "state": 0 } }),
    ] {
        match conductor.invoke(payload.clone()) {
            Err(ConductorError::BadRequest(_)) => {}
            other => panic!("expected bad request for {payload}, got {other:?}"),
        }
    }

    let wire = conductor.activate(json!({ "$resume": 5 }));
    assert_eq!(wire["code"], 400);
}

#[test]
fn test_internal_errors_encode_as_500() {
    let program: Program = serde_json::from_value(json!([{ "type": "exit" }])).unwrap();
    let conductor = Conductor::from_program(program);
    match conductor.invoke(json!({})) {
        Err(ConductorError::Internal(message)) => {
            assert!(message.contains("empty stack"), "message: {message}");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    let wire = conductor.activate(json!({}));
    assert_eq!(wire["code"], 500);
}

#[test]
fn test_activate_wire_shapes() {
    let conductor = Conductor::compile(&compose::literal(7)).unwrap();
    assert_eq!(conductor.activate(json!({})), json!({ "params": { "value": 7 } }));

    let failing = Conductor::compile(
        &compose::sequence([Task::func(|_env, _args| Ok(Some(json!({ "error": "x" }))))]).unwrap(),
    )
    .unwrap();
    assert_eq!(failing.activate(json!({})), json!({ "error": "x" }));

    let suspending = Conductor::compile(&compose::sequence(["a"]).unwrap()).unwrap();
    let wire = suspending.activate(json!({ "n": 0 }));
    assert_eq!(wire["action"], "/_/a");
    assert!(wire["state"]["$resume"].is_object());
}

// ============================================================================
// Encode & deploy
// ============================================================================

#[tokio::test]
async fn test_deployed_nested_compositions_round_trip() {
    let client = arithmetic_client();

    let inner = compose::composition(
        "inner",
        compose::sequence(["TripleAndIncrement"]).unwrap(),
    )
    .unwrap();
    let outer = compose::composition(
        "outer",
        compose::sequence([Task::from(inner), Task::from("DivideByTwo")]).unwrap(),
    )
    .unwrap();

    let encoded = encode::encode(outer, &TargetSet::primitives()).unwrap();
    // Children are packaged before their parents; the main conductor is last.
    assert_eq!(encoded.actions.len(), 2);
    assert_eq!(encoded.actions[0].name, "/_/inner");
    assert_eq!(encoded.actions[1].name, "/_/outer");
    for action in &encoded.actions {
        assert_eq!(action.action.exec.kind, encode::CONDUCTOR_KIND);
        let keys: Vec<&str> = action
            .action
            .annotations
            .iter()
            .map(|annotation| annotation.key.as_str())
            .collect();
        assert_eq!(keys, ["conductor", "composer"]);
    }
    // The residual composition is a bare reference to the main conductor.
    let residue = serde_json::to_value(&encoded.composition).unwrap();
    assert_eq!(residue["type"], "action");
    assert_eq!(residue["name"], "/_/outer");

    client::deploy(&client, &encoded, true).await.unwrap();
    let result = client.invoke("/_/outer", json!({ "n": 3 })).await.unwrap();
    assert_eq!(result, json!({ "n": 5 }));
}

#[tokio::test]
async fn test_deploy_without_overwrite_conflicts() {
    let client = arithmetic_client();
    let flow = compose::composition("dup", compose::sequence(["isEven"]).unwrap()).unwrap();
    let encoded = encode::encode(flow, &TargetSet::primitives()).unwrap();
    client::deploy(&client, &encoded, false).await.unwrap();
    assert!(client::deploy(&client, &encoded, false).await.is_err());
    client::deploy(&client, &encoded, true).await.unwrap();
}

#[tokio::test]
async fn test_deployed_conductors_resolve_registered_functions() {
    let mut functions = FunctionRegistry::with_builtins();
    functions.register(
        "double",
        |_env: &mut baton::functions::Env,
         args: &Value|
         -> Result<Option<Value>, baton::functions::InlineError> {
            Ok(Some(json!({ "n": args["n"].as_i64().unwrap_or(0) * 2 })))
        },
    );
    let client = LocalActionClient::new().with_functions(functions);

    let flow = compose::composition(
        "doubler",
        compose::sequence([compose::function_named("double", |_env, args| {
            Ok(Some(json!({ "n": args["n"].as_i64().unwrap_or(0) * 2 })))
        })])
        .unwrap(),
    )
    .unwrap();
    let encoded = encode::encode(flow, &TargetSet::primitives()).unwrap();
    client::deploy(&client, &encoded, true).await.unwrap();

    let result = client.invoke("/_/doubler", json!({ "n": 21 })).await.unwrap();
    assert_eq!(result, json!({ "n": 42 }));
}

#[tokio::test]
async fn test_deployed_anonymous_closures_cannot_resume() {
    // An unregistered closure serializes to an unresolvable symbol; the
    // deployed conductor reports it as a caught exception at its state.
    let client = LocalActionClient::new();
    let flow = compose::composition(
        "orphan",
        compose::sequence([Task::func(|_env, args| Ok(Some(args.clone())))]).unwrap(),
    )
    .unwrap();
    let encoded = encode::encode(flow, &TargetSet::primitives()).unwrap();
    client::deploy(&client, &encoded, true).await.unwrap();

    let result = client.invoke("/_/orphan", json!({})).await.unwrap();
    let message = result["error"].as_str().unwrap();
    assert!(message.starts_with("An exception was caught at state"));
}

#[tokio::test]
async fn test_hop_limit_bounds_runaway_compositions() {
    let client = LocalActionClient::new();
    let _ = register_counting(&client, "Echo");
    // The test always passes, so the loop never terminates on its own.
    client
        .register("Always", |_params| json!({ "value": true }))
        .unwrap();
    let flow = compose::loop_while("Always", "Echo").unwrap();
    let conductor = Conductor::compile(&flow).unwrap();
    let outcome = client::run(&client, &conductor, json!({}), RunConfig { max_hops: 10 }).await;
    assert!(matches!(
        outcome,
        Err(baton::client::ClientError::HopLimit { hops: 10 })
    ));
}
