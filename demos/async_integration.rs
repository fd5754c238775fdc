// demos/async_integration.rs
//! Running scripts from async code: blocking-pool execution, cancellation
//! through a shared token, deadlines and hot reload from bytecode

use hostlua::{CancellationToken, Context, Module, Script, Value};
use std::sync::Arc;
use std::time::Duration;

// Simulated async data source
struct Database;

impl Database {
    async fn load_scores(&self, user_id: &str) -> Vec<f64> {
        tokio::time::sleep(Duration::from_micros(100)).await;
        user_id
            .bytes()
            .map(|b| (b % 10) as f64 * 10.0)
            .collect()
    }
}

struct ScoringService {
    script: Script,
    database: Database,
}

impl ScoringService {
    fn new(script: Script) -> Self {
        Self {
            script,
            database: Database,
        }
    }

    async fn score(&self, user_id: String, ctx: Context) {
        println!("\n=== Scoring user {} ===", user_id);

        // Step 1: fetch inputs (async)
        let scores = self.database.load_scores(&user_id).await;

        // Step 2: run the script on the blocking pool
        let start = std::time::Instant::now();
        let args = vec![Value::from(user_id.as_str()), Value::from(scores)];
        match self.script.run_async(ctx, args).await {
            Ok(out) => println!("    ✓ {} scored {} in {:?}", user_id, out, start.elapsed()),
            Err(err) if err.is_cancelled() => println!("    ✗ {} stopped: {}", user_id, err),
            Err(err) => println!("    ✗ {} failed: {}", user_id, err),
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hostlua=debug".into()),
        )
        .init();

    println!("=== hostlua - Async Integration ===\n");

    let mut stats = Module::new("stats");
    stats
        .register("mean", |values: Vec<f64>| {
            if values.is_empty() {
                Err("mean of an empty list")
            } else {
                Ok(values.iter().sum::<f64>() / values.len() as f64)
            }
        })
        .expect("valid function");

    let source = r#"
        local stats = require("stats")

        function main(user, scores)
            if user == "spinner" then
                while true do end
            end
            return math.floor(stats.mean(scores))
        end
    "#;

    let script = Script::from_string("score.lua", source, &[stats]).expect("script compiles");
    let service = Arc::new(ScoringService::new(script));

    println!("Simulating concurrent scoring...");

    // One token cancels every run still in flight on shutdown
    let shutdown = CancellationToken::new();
    let mut handles = vec![];

    for user in ["user_001", "user_002", "spinner", "user_003"] {
        let service = Arc::clone(&service);
        let ctx = Context::with_cancel(shutdown.child_token())
            .and_deadline(std::time::Instant::now() + Duration::from_millis(200));
        handles.push(tokio::spawn(async move {
            service.score(user.to_string(), ctx).await;
        }));
    }

    for handle in handles {
        if let Err(err) = handle.await {
            println!("task failed: {}", err);
        }
    }

    println!("\n{}", "-".repeat(50));
    println!("=== Cancellation via shared token ===");

    let ctx = Context::with_cancel(shutdown.child_token());
    let pending = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.score("spinner".to_string(), ctx).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown.cancel();
    if let Err(err) = pending.await {
        println!("task failed: {}", err);
    }

    // Hot reload
    println!("\n=== Demonstrating Hot Reload ===");

    let bytecode = service.script.to_bytecode().expect("serializable");
    let mut stats = Module::new("stats");
    stats
        .register("mean", |values: Vec<f64>| {
            values.iter().copied().fold(f64::MIN, f64::max)
        })
        .expect("valid function");
    let reloaded = Script::from_bytecode("score.lua", &bytecode, &[stats]).expect("bytecode loads");
    let new_service = ScoringService::new(reloaded);
    new_service
        .score("user_004".to_string(), Context::background())
        .await;

    service.script.close().expect("close succeeds");
    println!("\n=== Hot reload successful ===");
}
