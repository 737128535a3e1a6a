//! Demo: A Collatz Loop Across Suspensions
//!
//! Drives the classic Collatz iteration as a composition: loop while `n` is
//! not one, branching each round on parity. Every action call suspends the
//! conductor and serializes its state into the continuation payload, so the
//! whole loop runs as a chain of independent activations.
//!
//! Running This Demo:
//! ```bash
//! RUST_LOG=baton=debug cargo run --example demo_collatz
//! ```

use baton::client::{self, LocalActionClient, RunConfig};
use baton::compose;
use baton::conductor::Conductor;
use serde_json::json;
use tracing::info;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    baton::telemetry::init();

    let client = LocalActionClient::new();
    client.register("isNotOne", |params| {
        json!({ "value": params["n"].as_i64() != Some(1) })
    })?;
    client.register("isEven", |params| {
        json!({ "value": params["n"].as_i64().unwrap_or(1) % 2 == 0 })
    })?;
    client.register("DivideByTwo", |params| {
        json!({ "n": params["n"].as_i64().unwrap_or(0) / 2 })
    })?;
    client.register("TripleAndIncrement", |params| {
        json!({ "n": 3 * params["n"].as_i64().unwrap_or(0) + 1 })
    })?;

    let step = compose::when("isEven", "DivideByTwo", "TripleAndIncrement")?;
    let flow = compose::loop_while("isNotOne", step)?;
    let conductor = Conductor::compile(&flow)?;
    info!(states = conductor.program().len(), "compiled");

    let result = client::run(&client, &conductor, json!({ "n": 27 }), RunConfig::default()).await?;
    println!("n = 27 reaches {result}");

    Ok(())
}
