//! Demo: Branching on an Authentication Check
//!
//! A three-action composition: an `authenticate` action tests the supplied
//! password, and the conductor routes to `success` or `failure`, restoring
//! the original params for whichever branch runs.
//!
//! Running This Demo:
//! ```bash
//! cargo run --example demo_authenticate
//! ```

use baton::client::{self, LocalActionClient, RunConfig};
use baton::compose;
use baton::conductor::Conductor;
use serde_json::json;
use tracing::info;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    baton::telemetry::init();

    let flow = compose::when(
        "authenticate",
        "success",
        "failure",
    )?;

    let client = LocalActionClient::new();
    client.register("authenticate", |params| {
        json!({ "value": params["password"] == "abc123" })
    })?;
    client.register("success", |_params| json!({ "message": "success" }))?;
    client.register("failure", |_params| json!({ "message": "failure" }))?;

    let conductor = Conductor::compile(&flow)?;

    for password in ["abc123", "wrong"] {
        let result = client::run(
            &client,
            &conductor,
            json!({ "password": password }),
            RunConfig::default(),
        )
        .await?;
        info!(password, %result, "composition finished");
        println!("{password}: {result}");
    }

    Ok(())
}
