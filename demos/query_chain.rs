//! Serves a handful of simulated requests, each answered by a query chain.
//!
//! Runs on a single-threaded runtime to mirror an event-loop server:
//!
//! ```text
//! RUST_LOG=chainpool=debug cargo run --example query_chain
//! ```

use std::sync::{Arc, Mutex};

use chainpool::{MemoryDriver, Pool, PoolConfig, QueryChain, params};
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

const CONFIG: &str = r#"{
    "min_size": 1,
    "max_size": 20,
    "max_queue": 10,
    "connection": {
        "host": "localhost",
        "database": "infunadb",
        "user": "infuna",
        "password": "password"
    }
}"#;

/// Answers one request. The last callback completes the response.
async fn handle(pool: Pool, request: usize) -> Result<String, chainpool::ChainError> {
    let body = Arc::new(Mutex::new(String::new()));
    let (finish, response) = oneshot::channel();

    let first = Arc::clone(&body);
    let last = Arc::clone(&body);

    QueryChain::new(pool)
        .query_with("SELECT 42, 12, %s, 11;", params![23])
        .callback(move |cursor| {
            let mut body = first.lock().map_err(|e| e.to_string())?;
            body.push_str(&format!(
                "Results of the first query in the chain: {:?}<br>",
                cursor.fetch_all()
            ));
            Ok(())
        })
        .query("SELECT 1, 2, 3, 4, 5;")
        .query_with("SELECT 123, 132, %s;", params![request as i64])
        .callback(move |cursor| {
            let mut body = last.lock().map_err(|e| e.to_string())?;
            body.push_str(&format!(
                "Results of the last query in the chain: {:?}",
                cursor.fetch_all()
            ));
            finish
                .send(std::mem::take(&mut *body))
                .map_err(|_| "client disconnected")?;
            Ok(())
        })
        .run()
        .await?;

    Ok(response.await.unwrap_or_default())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .compact()
        .init();

    let config = PoolConfig::from_json(CONFIG)?;
    let pool = Pool::connect(MemoryDriver::new(), config).await?;

    let mut requests = tokio::task::JoinSet::new();
    for request in 0..4 {
        requests.spawn(handle(pool.clone(), request));
    }
    while let Some(answer) = requests.join_next().await {
        println!("{}", answer??);
    }

    println!("{:?}", pool.status());
    pool.close().await;
    Ok(())
}
