// tests/marshal_properties.rs
//! Property tests for host/script value conversion

use hostlua::{args, from_value, to_value, Context, Script, Value};
use proptest::prelude::*;
use std::collections::HashMap;

proptest! {
    #[test]
    fn prop_integers_survive_marshaling(n in any::<i32>()) {
        let value = to_value(&n).unwrap();
        prop_assert_eq!(from_value::<i32>(value).unwrap(), n);
    }

    #[test]
    fn prop_floats_survive_marshaling(x in any::<f64>().prop_filter("finite", |x| x.is_finite())) {
        let value = to_value(&x).unwrap();
        prop_assert_eq!(from_value::<f64>(value).unwrap(), x);
    }

    #[test]
    fn prop_strings_survive_marshaling(s in ".*") {
        let value = to_value(&s).unwrap();
        prop_assert_eq!(from_value::<String>(value).unwrap(), s);
    }

    #[test]
    fn prop_options_survive_marshaling(v in proptest::option::of(any::<bool>())) {
        let value = to_value(&v).unwrap();
        prop_assert_eq!(from_value::<Option<bool>>(value).unwrap(), v);
    }

    #[test]
    fn prop_string_keys_are_sorted(map in proptest::collection::hash_map("[a-z]{1,8}", any::<u16>(), 0..16)) {
        let value = to_value(&map).unwrap();
        let keys: Vec<String> = match &value {
            Value::Table(table) => table.keys().map(|k| k.to_string()).collect(),
            other => return Err(TestCaseError::fail(format!("not a table: {:?}", other))),
        };
        let mut sorted = keys.clone();
        sorted.sort();
        prop_assert_eq!(&keys, &sorted);

        let back: HashMap<String, u16> = from_value(value).unwrap();
        prop_assert_eq!(back, map);
    }

    #[test]
    fn prop_fractions_are_not_integers(x in -1.0e6f64..1.0e6) {
        prop_assume!(x.fract() != 0.0);
        prop_assert!(from_value::<i64>(Value::Number(x)).is_err());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_scripts_see_host_values(n in -1_000_000i64..1_000_000, s in "[a-zA-Z0-9 ]{0,16}") {
        let script = Script::from_string(
            "echo.lua",
            "function main(n, s) return { n = n, s = s, sum = n + 1 } end",
            &[],
        )
        .unwrap();

        let out = script.run(&Context::background(), args![n, s.as_str()]).unwrap();
        let table = out.as_table().unwrap();
        prop_assert_eq!(table.get("n"), Some(&Value::Number(n as f64)));
        prop_assert_eq!(table.get("s"), Some(&Value::from(s.as_str())));
        prop_assert_eq!(table.get("sum"), Some(&Value::Number((n + 1) as f64)));
    }
}
