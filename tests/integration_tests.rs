// tests/integration_tests.rs
//! Integration tests for compiling and running scripts

use hostlua::{
    args, from_value, record, Arg, CancelReason, CancellationToken, CompileError, Context, Error,
    Module, Script, ScriptConfig, Type, Value,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::time::{Duration, Instant};

struct Person {
    name: String,
    age: u32,
}

record!(Person { "Name" => name, "Age" => age });

fn test_module() -> Module {
    let mut module = Module::new("test");
    module.register("echo", |s: String| s).unwrap();
    module
        .register("hash", |s: String| {
            s.bytes()
                .fold(2_166_136_261u32, |h, b| (h ^ b as u32).wrapping_mul(16_777_619))
        })
        .unwrap();
    module
}

fn fixture(name: &str) -> Script {
    let path = format!("{}/tests/fixtures/{}", env!("CARGO_MANIFEST_DIR"), name);
    let file = File::open(&path).expect("fixture exists");
    Script::from_reader("test.lua", file, &[test_module()]).expect("fixture compiles")
}

#[test]
fn test_update_record() {
    let script = fixture("update.lua");
    assert_eq!(script.name(), "test.lua");

    let mut person = Person {
        name: "Roman".into(),
        age: 0,
    };
    let out = script
        .run(&Context::background(), args![&mut person])
        .unwrap();

    assert_eq!(out.kind(), Type::String);
    assert_eq!(person.name, "Updated");
    assert_eq!(out.to_string(), "Updated");
}

#[test]
fn test_fibonacci() {
    let script = fixture("fib.lua");

    let out = script.run(&Context::background(), args![10]).unwrap();
    assert_eq!(out.kind(), Type::Number);
    assert_eq!(out, Value::Number(89.0));
    assert_eq!(out.to_string(), "89");

    assert!(script.close().is_ok());
}

#[test]
fn test_empty_main_returns_nil() {
    let script = fixture("empty.lua");
    let out = script.run(&Context::background(), args![]).unwrap();
    assert_eq!(out.kind(), Type::Nil);
}

#[test]
fn test_print() {
    let script = fixture("print.lua");
    let mut person = Person {
        name: "Roman".into(),
        age: 0,
    };
    let out = script
        .run(&Context::background(), args![&mut person])
        .unwrap();
    assert_eq!(out, Value::from("Hello, Roman!"));
}

#[test]
fn test_module_functions() {
    let echo = fixture("echo.lua");
    assert_eq!(
        echo.run(&Context::background(), args!["abc"]).unwrap(),
        Value::from("abc")
    );

    let hash = fixture("hash.lua");
    let out = hash.run(&Context::background(), args!["abc"]).unwrap();
    assert_eq!(out, Value::Number(440_920_331.0));
}

#[test]
fn test_invalid_script() {
    let err = Script::from_string(
        "",
        r#"
        xxx main()
            local x = 1
        end"#,
        &[],
    )
    .unwrap_err();
    assert!(matches!(err, CompileError::Syntax { .. }), "{}", err);
}

#[test]
fn test_no_main() {
    let script = Script::default();
    assert!(script.run(&Context::background(), args![]).is_err());

    assert!(matches!(
        Script::from_string("", "main = 1", &[]),
        Err(CompileError::MainNotFunction { .. })
    ));

    for source in [
        "function notmain()\n local x = 1\nend",
        "function xxx()\n local x = 1\nend",
        "local function main() end",
    ] {
        assert!(matches!(
            Script::from_string("", source, &[]),
            Err(CompileError::MissingMain(_))
        ));
    }
}

#[test]
fn test_errors() {
    let err = Script::from_string(
        "",
        r#"
        error()
        function main()
            local x = 1
        end"#,
        &[],
    )
    .unwrap_err();
    assert!(matches!(err, CompileError::Load { .. }));

    let script = Script::from_string(
        "err.lua",
        r#"
        function main()
            error("something failed")
        end"#,
        &[],
    )
    .unwrap();
    let err = script.run(&Context::background(), args![]).unwrap_err();
    assert_eq!(err, Error::Runtime("err.lua:3: something failed".into()));
}

#[test]
fn test_json() {
    #[derive(Serialize)]
    struct Profile {
        #[serde(rename = "Name")]
        name: String,
        #[serde(rename = "Age")]
        age: u32,
    }

    let mut input: HashMap<&str, Value> = HashMap::new();
    input.insert("a", Value::from(123));
    input.insert("b", Value::from("hello"));
    input.insert("c", Value::from(10.15));
    input.insert("d", Value::from(true));
    input.insert(
        "e",
        hostlua::to_value(&Profile {
            name: "Roman".into(),
            age: 15,
        })
        .unwrap(),
    );

    let script = fixture("json.lua");
    let out = script
        .run(&Context::background(), [Arg::serialize(&input).unwrap()])
        .unwrap();
    assert_eq!(out.kind(), Type::String);
    assert_eq!(
        out.to_string(),
        r#"{"a":123,"b":"hello","c":10.15,"d":true,"e":{"Name":"Roman","Age":15}}"#
    );
}

#[test]
fn test_table_results() {
    #[derive(Debug, Deserialize, PartialEq)]
    struct Count {
        word: String,
        count: u32,
    }

    let script = fixture("counters.lua");
    let out = script
        .run(
            &Context::background(),
            args![vec!["b", "a", "B", "c", "a", "b"]],
        )
        .unwrap();
    let counts: Vec<Count> = from_value(out).unwrap();
    let summary: Vec<(&str, u32)> = counts.iter().map(|c| (c.word.as_str(), c.count)).collect();
    assert_eq!(summary, vec![("b", 3), ("a", 2), ("c", 1)]);
}

#[test]
fn test_concurrent_runs() {
    let script = fixture("fib.lua");
    let expected = [1.0, 1.0, 2.0, 3.0, 5.0, 8.0, 13.0, 21.0, 34.0, 55.0];

    std::thread::scope(|s| {
        let handles: Vec<_> = (0..10)
            .map(|n| {
                let script = script.clone();
                s.spawn(move || {
                    (0..50)
                        .map(|_| script.run(&Context::background(), args![n]).unwrap())
                        .last()
                })
            })
            .collect();

        for (n, handle) in handles.into_iter().enumerate() {
            let out = handle.join().unwrap();
            assert_eq!(out, Some(Value::Number(expected[n])));
        }
    });

    assert!(script.pool_size() >= 1);
}

#[test]
fn test_cancellation_stops_infinite_loop() {
    let script = fixture("loop.lua");
    let token = CancellationToken::new();
    let ctx = Context::with_cancel(token.clone());

    let canceller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        token.cancel();
    });

    let err = script.run(&ctx, args![]).unwrap_err();
    canceller.join().unwrap();
    assert_eq!(err, Error::Cancelled(CancelReason::Cancelled));
    assert!(err.is_cancelled());

    // The instance survives a cancelled run
    assert_eq!(script.pool_size(), 1);
}

#[test]
fn test_deadline_stops_infinite_loop() {
    let script = fixture("loop.lua");
    let started = Instant::now();
    let err = script
        .run(&Context::with_timeout(Duration::from_millis(30)), args![])
        .unwrap_err();
    assert_eq!(err, Error::Cancelled(CancelReason::DeadlineExceeded));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_pcall_does_not_catch_cancellation() {
    let script = Script::from_string(
        "pcall.lua",
        r#"
        function main()
            local ok = pcall(function()
                while true do end
            end)
            return "caught"
        end"#,
        &[],
    )
    .unwrap();

    let err = script
        .run(&Context::with_timeout(Duration::from_millis(20)), args![])
        .unwrap_err();
    assert!(err.is_cancelled());
}

#[test]
fn test_stack_overflow() {
    let config = ScriptConfig::default().with_max_call_depth(50);
    let script = Script::compile(
        "deep.lua",
        "function main(n) return 1 + main(n + 1) end",
        &[],
        config,
    )
    .unwrap();

    let err = script.run(&Context::background(), args![0]).unwrap_err();
    assert!(err.to_string().contains("stack overflow"), "{}", err);
}

#[test]
fn test_record_does_not_outlive_its_run() {
    let script = Script::from_string(
        "keep.lua",
        r#"
        local saved
        function main(p)
            if p then
                saved = p
                return "saved"
            end
            return saved.Name
        end"#,
        &[],
    )
    .unwrap();

    let mut person = Person {
        name: "Roman".into(),
        age: 15,
    };
    let ctx = Context::background();
    assert_eq!(
        script.run(&ctx, args![&mut person]).unwrap(),
        Value::from("saved")
    );

    let err = script.run(&ctx, args![]).unwrap_err();
    assert!(
        err.to_string()
            .contains("record is no longer bound to a running script"),
        "{}",
        err
    );
}

#[test]
fn test_record_field_types_are_enforced() {
    let script = Script::from_string(
        "age.lua",
        "function main(p) p.Age = p.Age + 1 p.Age = 'old' end",
        &[],
    )
    .unwrap();

    let mut person = Person {
        name: "Roman".into(),
        age: 15,
    };
    let err = script
        .run(&Context::background(), args![&mut person])
        .unwrap_err();
    assert!(err.to_string().contains("cannot assign field 'Age'"), "{}", err);
    // The write before the failing one is kept
    assert_eq!(person.age, 16);
}

#[test]
fn test_record_iteration_and_type() {
    let script = Script::from_string(
        "fields.lua",
        r#"
        function main(p)
            local names = {}
            for k, v in pairs(p) do
                table.insert(names, k .. "=" .. tostring(v))
            end
            return type(p) .. ":" .. table.concat(names, ",")
        end"#,
        &[],
    )
    .unwrap();

    let mut person = Person {
        name: "Ada".into(),
        age: 36,
    };
    let out = script
        .run(&Context::background(), args![&mut person])
        .unwrap();
    assert_eq!(out, Value::from("table:Name=Ada,Age=36"));
}

#[test]
fn test_too_many_arguments() {
    let script = fixture("empty.lua");
    let err = script.run(&Context::background(), args![1]).unwrap_err();
    assert!(matches!(err, Error::Argument(_)));
    assert_eq!(
        err.to_string(),
        "bad argument to 'main' (0 argument(s) expected, got 1)"
    );
}

#[test]
fn test_close() {
    let script = fixture("fib.lua");
    let clone = script.clone();
    script.close().unwrap();
    assert!(clone.is_closed());
    assert!(matches!(
        clone.run(&Context::background(), args![1]),
        Err(Error::Runtime(_))
    ));
    assert!(script.close().is_ok());
}

#[test]
fn test_bytecode_reload() {
    let script = fixture("echo.lua");
    let bytes = script.to_bytecode().unwrap();

    let reloaded = Script::from_bytecode("echo.lua", &bytes, &[test_module()]).unwrap();
    assert_eq!(
        reloaded.run(&Context::background(), args!["hot"]).unwrap(),
        Value::from("hot")
    );

    assert!(matches!(
        Script::from_bytecode("junk.lua", b"not bytecode", &[]),
        Err(CompileError::Bytecode(_))
    ));
}

#[test]
fn test_pairs_after_out_of_order_fill() {
    let source = r#"
        function main()
            local t = {}
            t[2] = "b"
            t[1] = "a"
            t[3] = "c"
            local n = 0
            for _ in pairs(t) do n = n + 1 end
            return n
        end
    "#;
    let script = Script::from_string("pairs.lua", source, &[]).unwrap();
    let out = script.run(&Context::background(), args![]).unwrap();
    assert_eq!(out, Value::Number(3.0));

    let source = r#"
        function main()
            local t = { name = "x" }
            for i = 10, 1, -1 do t[i] = i end
            return t
        end
    "#;
    let script = Script::from_string("pairs.lua", source, &[]).unwrap();
    let out = script.run(&Context::background(), args![]).unwrap();
    let table = out.as_table().unwrap();
    assert_eq!(table.len(), 11);
    assert_eq!(table.get("name"), Some(&Value::from("x")));
    assert_eq!(table.get_index(7), Some(&Value::Number(7.0)));
}

#[test]
fn test_large_map_argument() {
    let script = Script::from_string(
        "count.lua",
        "function main(t) local n = 0 for k, v in pairs(t) do n = n + v end return n end",
        &[],
    )
    .unwrap();
    let map: HashMap<String, u32> = (0..20_000).map(|i| (format!("key{}", i), 1)).collect();
    let out = script
        .run(&Context::background(), args![Arg::serialize(&map).unwrap()])
        .unwrap();
    assert_eq!(out, Value::Number(20_000.0));
}
