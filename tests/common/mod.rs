#![allow(dead_code)]

use baton::ast::Composition;
use baton::client::{self, LocalActionClient, RunConfig};
use baton::conductor::Conductor;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A client stocked with the arithmetic actions used across the suite.
pub fn arithmetic_client() -> LocalActionClient {
    let client = LocalActionClient::new();
    client
        .register("DivideByTwo", |params| {
            json!({ "n": params["n"].as_i64().unwrap_or(0) / 2 })
        })
        .unwrap();
    client
        .register("TripleAndIncrement", |params| {
            json!({ "n": 3 * params["n"].as_i64().unwrap_or(0) + 1 })
        })
        .unwrap();
    client
        .register("isNotOne", |params| {
            json!({ "value": params["n"].as_i64() != Some(1) })
        })
        .unwrap();
    client
        .register("isEven", |params| {
            json!({ "value": params["n"].as_i64().unwrap_or(1) % 2 == 0 })
        })
        .unwrap();
    client
}

/// Register an action that counts its invocations and fails every one with
/// the given error message. Returns the counter.
pub fn register_failing(
    client: &LocalActionClient,
    name: &str,
    message: &'static str,
) -> Arc<AtomicUsize> {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    client
        .register(name, move |_params| {
            seen.fetch_add(1, Ordering::SeqCst);
            json!({ "error": message })
        })
        .unwrap();
    calls
}

/// Register an action that counts its invocations and echoes its params.
pub fn register_counting(client: &LocalActionClient, name: &str) -> Arc<AtomicUsize> {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    client
        .register(name, move |params| {
            seen.fetch_add(1, Ordering::SeqCst);
            params
        })
        .unwrap();
    calls
}

/// Compile a composition and drive it against the client to a terminal
/// result.
pub async fn run_flow(client: &LocalActionClient, flow: &Composition, params: Value) -> Value {
    let conductor = Conductor::compile(flow).expect("composition should compile");
    client::run(client, &conductor, params, RunConfig::default())
        .await
        .expect("conductor run should not fail at the client layer")
}
