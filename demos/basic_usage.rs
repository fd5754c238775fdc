// demos/basic_usage.rs
//! Basic usage: compile a script, register a host module, pass records by
//! reference and read results back

use hostlua::{args, from_value, record, Context, Module, Script, Value};
use serde::Deserialize;

struct Account {
    owner: String,
    balance: f64,
    flags: Vec<String>,
}

record!(Account { "Owner" => owner, "Balance" => balance, "Flags" => flags });

#[derive(Debug, Deserialize)]
struct Summary {
    owner: String,
    fee: f64,
    risky: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hostlua=info".into()),
        )
        .init();

    println!("=== hostlua - Basic Usage ===\n");

    let mut fees = Module::new("fees");
    fees.register("percent", |amount: f64, rate: f64| amount * rate / 100.0)
        .expect("valid function");
    fees.register("limit", |country: String| match country.as_str() {
        "US" | "CA" => Ok(10_000.0),
        "UK" => Ok(8_000.0),
        other => Err(format!("no limit configured for {}", other)),
    })
    .expect("valid function");

    let source = r#"
        local fees = require("fees")

        -- Charge a fee, flag large withdrawals and return a summary
        function main(account, amount, country)
            local fee = fees.percent(amount, 1.5)
            account.Balance = account.Balance - amount - fee

            if amount > fees.limit(country) then
                local flags = account.Flags
                table.insert(flags, "large_withdrawal")
                account.Flags = flags
            end

            print("charged " .. account.Owner .. " a fee of " .. fee)
            return { owner = account.Owner, fee = fee, risky = #account.Flags > 0 }
        end
    "#;

    println!("Compiling script...");
    let script = Script::from_string("withdraw.lua", source, &[fees]).expect("script compiles");
    println!("✓ Script '{}' compiled\n", script.name());

    // Example 1: an ordinary withdrawal
    println!("Example 1: Normal Withdrawal");
    let mut account = Account {
        owner: "Roman".into(),
        balance: 2_000.0,
        flags: Vec::new(),
    };
    let out = script
        .run(&Context::background(), args![&mut account, 500, "US"])
        .expect("run succeeds");
    let summary: Summary = from_value(out).expect("summary table");
    println!("Summary: {:?}", summary);
    println!("Balance after: {}\n", account.balance);

    // Example 2: a large withdrawal gets flagged
    println!("Example 2: Large Withdrawal");
    let mut account = Account {
        owner: "Ada".into(),
        balance: 50_000.0,
        flags: Vec::new(),
    };
    let out = script
        .run(&Context::background(), args![&mut account, 12_000, "UK"])
        .expect("run succeeds");
    println!("Result: {}", serde_json::to_string(&out).unwrap_or_default());
    println!("Flags: {:?}\n", account.flags);

    // Example 3: a host function failure surfaces as a run error
    println!("Example 3: Unknown Country");
    let mut account = Account {
        owner: "Grace".into(),
        balance: 100.0,
        flags: Vec::new(),
    };
    match script.run(&Context::background(), args![&mut account, 10, "FR"]) {
        Ok(value) => println!("Unexpected success: {}", value),
        Err(err) => println!("Error: {}", err),
    }
    // Writes made before the failure are kept
    println!("Balance after: {}\n", account.balance);

    // Example 4: argument errors are reported with their position
    println!("Example 4: Bad Argument");
    let mut account = Account {
        owner: "Linus".into(),
        balance: 100.0,
        flags: Vec::new(),
    };
    if let Err(err) = script.run(
        &Context::background(),
        args![&mut account, Value::from("ten"), "US"],
    ) {
        println!("Error: {}", err);
    }

    script.close().expect("close succeeds");
    println!("\n✓ Script closed");
}
